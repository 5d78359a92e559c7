//! In-process virtual switch with a single address.
//!
//! Every socket opened through a [`LoopbackDevice`] lives on the same virtual
//! host.  An outbound open to a port with a local listener creates the flow on
//! both sides and asks both sockets to spawn their tunnels; bytes written on
//! one side of a flow are delivered to the reversed flow.  There is no routing
//! to other devices.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::device::{DumpHandle, SocketHandle, VirtualDevice};
use crate::error::{Error, Result};
use crate::flow::FlowKey;
use crate::packet::WirePacket;
use crate::tunnel::TunnelHandle;

const EPHEMERAL_START: u16 = 49152;

pub const DEFAULT_ADDRESS: &str = "20174.0.0.1";
pub const DEFAULT_MAX_PROMISCUOUS_LEVEL: u8 = 3;

#[derive(Default)]
struct Fabric {
    listeners: HashMap<u16, SocketHandle>,
    outbound: HashMap<u16, SocketHandle>,
    next_ephemeral: u16,
    /// Forwarding table: traffic for a flow goes into its tunnel.
    tunnels: HashMap<FlowKey, TunnelHandle>,
    owners: HashMap<FlowKey, SocketHandle>,
    /// Bytes for flows whose tunnel is not up yet.
    undelivered: HashMap<FlowKey, Vec<Vec<u8>>>,
    taps: Vec<DumpHandle>,
    level: u8,
}

impl Fabric {
    fn port_in_use(&self, port: u16) -> bool {
        self.listeners.contains_key(&port) || self.outbound.contains_key(&port)
    }

    fn allocate_ephemeral(&mut self) -> Option<u16> {
        let span = u16::MAX - EPHEMERAL_START + 1;
        for _ in 0..span {
            let port = self.next_ephemeral.max(EPHEMERAL_START);
            self.next_ephemeral = port.checked_add(1).unwrap_or(EPHEMERAL_START);
            if !self.port_in_use(port) {
                return Some(port);
            }
        }
        None
    }
}

pub struct LoopbackDevice {
    address: String,
    max_level: u8,
    fabric: Mutex<Fabric>,
}

impl LoopbackDevice {
    pub fn new(address: impl Into<String>, max_level: u8) -> Self {
        Self {
            address: address.into(),
            max_level,
            fabric: Mutex::new(Fabric::default()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Flows with a tunnel in the forwarding table.
    pub fn connection_count(&self) -> usize {
        self.fabric().tunnels.len()
    }

    pub fn is_port_open(&self, port: u16) -> bool {
        self.fabric().port_in_use(port)
    }

    fn fabric(&self) -> MutexGuard<'_, Fabric> {
        self.fabric.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS, DEFAULT_MAX_PROMISCUOUS_LEVEL)
    }
}

impl VirtualDevice for LoopbackDevice {
    fn create_outbound_socket(
        &self,
        socket: SocketHandle,
        destination: &str,
        destination_port: u16,
    ) -> Option<u16> {
        if destination != self.address {
            info!("[loopback] no route to {destination}");
            return None;
        }

        let mut fabric = self.fabric();
        let Some(listener) = fabric.listeners.get(&destination_port).cloned() else {
            info!("[loopback] nothing listening on {destination_port}");
            return None;
        };
        let port = fabric.allocate_ephemeral()?;
        fabric.outbound.insert(port, socket.clone());

        let outbound_flow = FlowKey::new(self.address.clone(), port, destination, destination_port);
        let inbound_flow = outbound_flow.reversed();
        fabric.owners.insert(outbound_flow.clone(), socket.clone());
        fabric.owners.insert(inbound_flow.clone(), listener.clone());
        drop(fabric);

        info!("[loopback] {outbound_flow} created");
        socket.request_spawn(outbound_flow);
        listener.request_spawn(inbound_flow);
        Some(port)
    }

    fn create_inbound_socket(&self, socket: SocketHandle, source_port: u16) -> Option<u16> {
        let mut fabric = self.fabric();
        let granted = if source_port != 0 && !fabric.port_in_use(source_port) {
            source_port
        } else {
            fabric.allocate_ephemeral()?
        };
        fabric.listeners.insert(granted, socket);
        debug!("[loopback] listener requested {source_port}, granted {granted}");
        Some(granted)
    }

    fn spawn_connection(&self, flow: FlowKey, tunnel: TunnelHandle) {
        let mut fabric = self.fabric();
        if !fabric.owners.contains_key(&flow) {
            debug!("[loopback] {flow} is gone; shutting tunnel down");
            tunnel.shutdown();
            return;
        }
        for chunk in fabric.undelivered.remove(&flow).unwrap_or_default() {
            tunnel.write(&chunk);
        }
        fabric.tunnels.insert(flow, tunnel);
    }

    fn close_connection(&self, flow: &FlowKey) {
        let mut fabric = self.fabric();
        if let Some(tunnel) = fabric.tunnels.remove(flow) {
            tunnel.shutdown();
        }
        fabric.undelivered.remove(flow);
        if fabric.owners.remove(flow).is_none() {
            return;
        }
        let peer_flow = flow.reversed();
        let peer = fabric.owners.get(&peer_flow).cloned();
        drop(fabric);

        debug!("[loopback] {flow} closed");
        if let Some(peer) = peer {
            peer.close_flow(peer_flow);
        }
    }

    fn close_port(&self, port: u16) {
        let mut fabric = self.fabric();
        if fabric.listeners.remove(&port).is_none() && fabric.outbound.remove(&port).is_none() {
            debug!("[loopback] close of unknown port {port}");
        }
    }

    fn write(&self, flow: &FlowKey, data: &[u8]) {
        let mut guard = self.fabric();
        let fabric = &mut *guard;
        fabric.taps.retain(|tap| {
            tap.mirror(WirePacket {
                flow: flow.clone(),
                data: data.to_vec(),
            })
        });

        let target = flow.reversed();
        if let Some(tunnel) = fabric.tunnels.get(&target) {
            if !tunnel.write(data) {
                warn!("[loopback] tunnel for {target} is gone");
            }
        } else if fabric.owners.contains_key(&target) {
            fabric
                .undelivered
                .entry(target)
                .or_default()
                .push(data.to_vec());
        } else {
            debug!("[loopback] dropping {} bytes for {target}", data.len());
        }
    }

    fn start_dump(&self, tap: DumpHandle) {
        let mut fabric = self.fabric();
        if !fabric.taps.contains(&tap) {
            fabric.taps.push(tap);
        }
    }

    fn stop_dump(&self, tap: &DumpHandle) {
        self.fabric().taps.retain(|t| t != tap);
    }

    fn set_promiscuous_level(&self, level: u8) -> Result<()> {
        if level > self.max_level {
            return Err(Error::Device(format!(
                "promiscuous level {level} exceeds maximum {}",
                self.max_level
            )));
        }
        self.fabric().level = level;
        Ok(())
    }

    fn promiscuous_level(&self) -> u8 {
        self.fabric().level
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::control::ControlEvent;
    use crate::tunnel::TunnelCommand;

    fn socket(channel: u64) -> (SocketHandle, UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SocketHandle::new(channel, tx), rx)
    }

    fn spawn_requested(rx: &mut UnboundedReceiver<ControlEvent>) -> FlowKey {
        match rx.try_recv() {
            Ok(ControlEvent::SpawnRequested(flow)) => flow,
            other => panic!("expected spawn request, got {other:?}"),
        }
    }

    #[test]
    fn outbound_to_listener_spawns_both_ends() {
        let device = LoopbackDevice::default();
        let (listener, mut listener_rx) = socket(1);
        let (client, mut client_rx) = socket(2);

        assert_eq!(device.create_inbound_socket(listener, 8080), Some(8080));
        let port = device
            .create_outbound_socket(client, DEFAULT_ADDRESS, 8080)
            .unwrap();
        assert!(port >= EPHEMERAL_START);

        let outbound = spawn_requested(&mut client_rx);
        let inbound = spawn_requested(&mut listener_rx);
        assert_eq!(outbound, FlowKey::new(DEFAULT_ADDRESS, port, DEFAULT_ADDRESS, 8080));
        assert_eq!(inbound, outbound.reversed());
    }

    #[test]
    fn outbound_without_listener_is_refused() {
        let device = LoopbackDevice::default();
        let (client, _rx) = socket(1);
        assert_eq!(device.create_outbound_socket(client.clone(), DEFAULT_ADDRESS, 80), None);
        assert_eq!(device.create_outbound_socket(client, "10.0.0.1", 80), None);
    }

    #[test]
    fn taken_listening_port_grants_another() {
        let device = LoopbackDevice::default();
        let (first, _a) = socket(1);
        let (second, _b) = socket(2);

        assert_eq!(device.create_inbound_socket(first, 8080), Some(8080));
        let granted = device.create_inbound_socket(second, 8080).unwrap();
        assert_ne!(granted, 8080);

        device.close_port(granted);
        assert!(!device.is_port_open(granted));
        assert!(device.is_port_open(8080));
    }

    #[test]
    fn writes_reach_the_reversed_flow_and_buffer_until_spawned() {
        let device = LoopbackDevice::default();
        let (listener, mut listener_rx) = socket(1);
        let (client, mut client_rx) = socket(2);
        device.create_inbound_socket(listener, 8080);
        device.create_outbound_socket(client, DEFAULT_ADDRESS, 8080);
        let outbound = spawn_requested(&mut client_rx);
        let inbound = spawn_requested(&mut listener_rx);

        device.write(&outbound, b"early");
        let (tunnel, mut commands) = TunnelHandle::detached(inbound.clone());
        device.spawn_connection(inbound, tunnel);
        device.write(&outbound, b"late");

        let mut seen = Vec::new();
        while let Ok(TunnelCommand::Write(data)) = commands.try_recv() {
            seen.push(data);
        }
        assert_eq!(seen, vec![b"early".to_vec(), b"late".to_vec()]);
    }

    #[test]
    fn closing_one_side_notifies_the_other() {
        let device = LoopbackDevice::default();
        let (listener, mut listener_rx) = socket(1);
        let (client, mut client_rx) = socket(2);
        device.create_inbound_socket(listener, 8080);
        device.create_outbound_socket(client, DEFAULT_ADDRESS, 8080);
        let outbound = spawn_requested(&mut client_rx);
        let inbound = spawn_requested(&mut listener_rx);
        let (tunnel, mut commands) = TunnelHandle::detached(outbound.clone());
        device.spawn_connection(outbound.clone(), tunnel);

        device.close_connection(&outbound);
        device.close_connection(&outbound);

        assert!(matches!(commands.try_recv(), Ok(TunnelCommand::Shutdown)));
        match listener_rx.try_recv() {
            Ok(ControlEvent::CloseFlow(flow)) => assert_eq!(flow, inbound),
            other => panic!("expected close, got {other:?}"),
        }
        assert!(listener_rx.try_recv().is_err());
    }

    #[test]
    fn dump_taps_see_every_write() {
        let device = LoopbackDevice::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tap = DumpHandle::new(7, tx);
        device.start_dump(tap.clone());

        let flow = FlowKey::new("A", 1, "B", 2);
        device.write(&flow, b"payload");
        device.stop_dump(&tap);
        device.write(&flow, b"unseen");

        match rx.try_recv() {
            Ok(ControlEvent::Mirror(wire)) => {
                assert_eq!(wire.flow, flow);
                assert_eq!(wire.data, b"payload");
            }
            other => panic!("expected mirror, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn promiscuous_level_is_bounded() {
        let device = LoopbackDevice::new(DEFAULT_ADDRESS, 5);
        device.set_promiscuous_level(5).unwrap();
        assert_eq!(device.promiscuous_level(), 5);
        assert!(device.set_promiscuous_level(6).is_err());
        assert_eq!(device.promiscuous_level(), 5);
    }
}

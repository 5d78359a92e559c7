//! Per-socket lifecycle manager.
//!
//! A [`SocketControl`] owns one opened virtual socket: its kind, the virtual
//! port the device assigned, the client's callback address, and the flows
//! spawned for it.  Its responsibilities are:
//! - Starting reverse-tunnel spawns and recording the ones that complete.
//! - Enforcing cardinality: an outbound socket carries at most one flow.
//! - Closing single flows, or the whole socket, idempotently.
//!
//! Close paths are reentrant in practice (closing a flow makes its tunnel
//! report closure, which lands back here), so every path removes the flow from
//! tracking before any cascading effect and checks the `closed` flag first.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{Config, SpawnFailurePolicy};
use crate::control::ControlEvent;
use crate::device::VirtualDevice;
use crate::error::{Error, Result};
use crate::flow::FlowKey;
use crate::packet::ControlPacket;
use crate::tunnel::{self, SpawnRequest, TunnelHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Outbound connection socket: exactly one flow.
    Outbound,
    /// Inbound listening socket: any number of concurrent flows.
    Listening,
}

impl std::fmt::Display for SocketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketKind::Outbound => write!(f, "outbound"),
            SocketKind::Listening => write!(f, "listening"),
        }
    }
}

pub struct SocketControl {
    kind: SocketKind,
    port: Option<u16>,
    callback_address: String,
    callback_port: u16,
    /// Flows whose tunnel is up and registered with the device.
    flows: HashSet<FlowKey>,
    /// Flows whose reverse connection is still being established.
    pending: HashSet<FlowKey>,
    closed: bool,
    device: Arc<dyn VirtualDevice>,
    events: UnboundedSender<ControlEvent>,
    config: Config,
}

impl SocketControl {
    /// Build the manager for a fresh socket.  Port reservation is the
    /// device's job; see [`assign_port`](Self::assign_port).
    pub(crate) fn open(
        kind: SocketKind,
        callback_address: String,
        callback_port: u16,
        device: Arc<dyn VirtualDevice>,
        events: UnboundedSender<ControlEvent>,
        config: Config,
    ) -> Self {
        Self {
            kind,
            port: None,
            callback_address,
            callback_port,
            flows: HashSet::new(),
            pending: HashSet::new(),
            closed: false,
            device,
            events,
            config,
        }
    }

    pub fn assign_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_flow(&self, flow: &FlowKey) -> bool {
        self.flows.contains(flow)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Flows whose reverse connection is still being established.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Start the reverse connection for `flow`.
    ///
    /// On an outbound socket that already has a flow (spawned or pending) this
    /// is a protocol violation: nothing is started and existing state is left
    /// alone.  The caller decides how to tear the socket down.
    pub fn spawn(&mut self, flow: FlowKey) -> Result<()> {
        if self.closed {
            return Err(Error::SocketClosed);
        }
        if self.kind == SocketKind::Outbound && !(self.flows.is_empty() && self.pending.is_empty())
        {
            return Err(Error::ProtocolViolation(
                "duplicate connection on outbound socket",
            ));
        }
        if self.flows.contains(&flow) {
            debug!("[socket] {flow} already has a tunnel; ignoring spawn");
            return Ok(());
        }
        if !self.pending.insert(flow.clone()) {
            debug!("[socket] spawn for {flow} already in progress");
            return Ok(());
        }

        debug!(
            "[socket] spawning {flow}, callback={}:{}",
            self.callback_address, self.callback_port
        );
        tunnel::spawn_reverse(
            SpawnRequest {
                flow,
                callback_address: self.callback_address.clone(),
                callback_port: self.callback_port,
                connect_timeout: self.config.connect_timeout,
                read_chunk: self.config.read_chunk,
            },
            Arc::clone(&self.device),
            self.events.clone(),
        );
        Ok(())
    }

    /// Continuation of [`spawn`](Self::spawn).
    ///
    /// Returns the spawn-completed event to send to the client, if any.
    pub(crate) fn spawn_finished(
        &mut self,
        flow: FlowKey,
        outcome: io::Result<(u16, TunnelHandle)>,
    ) -> Option<ControlPacket> {
        self.pending.remove(&flow);
        if self.closed {
            // Dropping the handle ends the tunnel.
            debug!("[socket] spawn for {flow} finished after close; discarding");
            return None;
        }

        match outcome {
            Ok((spawn_port, tunnel)) => {
                info!("[socket] {flow} spawned on port {spawn_port}");
                self.flows.insert(flow.clone());
                self.device.spawn_connection(flow.clone(), tunnel);
                Some(ControlPacket::ConnectionSpawned { spawn_port, flow })
            }
            Err(e) => {
                warn!("[socket] reverse connection for {flow} failed: {e}");
                match (self.kind, self.config.spawn_failure) {
                    (SocketKind::Listening, SpawnFailurePolicy::DropFlow) => {
                        self.device.close_connection(&flow);
                    }
                    _ => self.close(),
                }
                None
            }
        }
    }

    /// Close one flow.  On an outbound socket that means the whole socket.
    pub fn close_flow(&mut self, flow: &FlowKey) {
        match self.kind {
            SocketKind::Outbound => self.close(),
            SocketKind::Listening => {
                if self.flows.remove(flow) {
                    debug!("[socket] closing flow {flow}");
                    self.device.close_connection(flow);
                }
            }
        }
    }

    /// The reverse tunnel for `flow` reported closure.
    ///
    /// May arrive after the flow was already removed by a direct close.
    pub fn flow_closed_by_peer(&mut self, flow: &FlowKey) {
        if self.flows.remove(flow) {
            debug!("[socket] tunnel for {flow} closed by peer");
            self.device.close_connection(flow);
        }
        if !self.closed && self.kind == SocketKind::Outbound {
            self.close();
        }
    }

    /// Release the port, close every flow, and mark the socket closed.
    ///
    /// The owning control channel drops its transport once it sees the
    /// socket closed.  Repeated calls are no-ops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(
            "[socket] closing {} socket on port {:?} ({} flows)",
            self.kind,
            self.port,
            self.flows.len()
        );

        let flows = std::mem::take(&mut self.flows);
        self.pending.clear();
        for flow in &flows {
            self.device.close_connection(flow);
        }
        if let Some(port) = self.port {
            self.device.close_port(port);
        }
    }
}

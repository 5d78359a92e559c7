//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vnic_sockets::{
    Config, ControlServer, DumpHandle, Error, FlowKey, SocketHandle, TunnelHandle, VirtualDevice,
};

pub const DEVICE_ADDRESS: &str = "20174.0.0.1";
pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateOutbound(String, u16),
    CreateInbound(u16),
    Spawn(FlowKey),
    CloseConnection(FlowKey),
    ClosePort(u16),
    Write(FlowKey, Vec<u8>),
    StartDump,
    StopDump,
    SetLevel(u8),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    sockets: Vec<SocketHandle>,
    tunnels: Vec<TunnelHandle>,
    taps: Vec<DumpHandle>,
    level: u8,
}

/// A device that grants fixed ports and records every call.
///
/// An outbound open immediately asks for the flow's tunnel, the way a real
/// device does once the virtual SYN goes out.
#[derive(Default)]
pub struct ScriptedDevice {
    pub outbound_port: Option<u16>,
    pub inbound_grant: Option<u16>,
    state: Mutex<State>,
}

impl ScriptedDevice {
    pub fn new(outbound_port: Option<u16>, inbound_grant: Option<u16>) -> Arc<Self> {
        Arc::new(Self {
            outbound_port,
            inbound_grant,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn has_call(&self, call: &Call) -> bool {
        self.calls().contains(call)
    }

    /// All bytes the device was asked to write on `flow`, concatenated.
    pub fn written(&self, flow: &FlowKey) -> Vec<u8> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Write(f, data) if &f == flow => Some(data),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn socket(&self, index: usize) -> Option<SocketHandle> {
        self.state.lock().unwrap().sockets.get(index).cloned()
    }

    pub fn tunnel(&self, index: usize) -> Option<TunnelHandle> {
        self.state.lock().unwrap().tunnels.get(index).cloned()
    }

    pub fn tap(&self, index: usize) -> Option<DumpHandle> {
        self.state.lock().unwrap().taps.get(index).cloned()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl VirtualDevice for ScriptedDevice {
    fn create_outbound_socket(
        &self,
        socket: SocketHandle,
        destination: &str,
        destination_port: u16,
    ) -> Option<u16> {
        self.record(Call::CreateOutbound(destination.to_string(), destination_port));
        let port = self.outbound_port?;
        socket.request_spawn(FlowKey::new(
            DEVICE_ADDRESS,
            port,
            destination,
            destination_port,
        ));
        self.state.lock().unwrap().sockets.push(socket);
        Some(port)
    }

    fn create_inbound_socket(&self, socket: SocketHandle, source_port: u16) -> Option<u16> {
        self.record(Call::CreateInbound(source_port));
        self.state.lock().unwrap().sockets.push(socket);
        self.inbound_grant
    }

    fn spawn_connection(&self, flow: FlowKey, tunnel: TunnelHandle) {
        self.record(Call::Spawn(flow));
        self.state.lock().unwrap().tunnels.push(tunnel);
    }

    fn close_connection(&self, flow: &FlowKey) {
        self.record(Call::CloseConnection(flow.clone()));
    }

    fn close_port(&self, port: u16) {
        self.record(Call::ClosePort(port));
    }

    fn write(&self, flow: &FlowKey, data: &[u8]) {
        self.record(Call::Write(flow.clone(), data.to_vec()));
    }

    fn start_dump(&self, tap: DumpHandle) {
        self.record(Call::StartDump);
        self.state.lock().unwrap().taps.push(tap);
    }

    fn stop_dump(&self, tap: &DumpHandle) {
        self.record(Call::StopDump);
        self.state.lock().unwrap().taps.retain(|t| t != tap);
    }

    fn set_promiscuous_level(&self, level: u8) -> vnic_sockets::Result<()> {
        self.record(Call::SetLevel(level));
        if level > 10 {
            return Err(Error::Device(format!("level {level} out of range")));
        }
        self.state.lock().unwrap().level = level;
        Ok(())
    }

    fn promiscuous_level(&self) -> u8 {
        self.state.lock().unwrap().level
    }
}

/// Start a control server for `device` on an OS-chosen loopback port.
pub async fn start_server(device: Arc<dyn VirtualDevice>, config: Config) -> SocketAddr {
    let server = ControlServer::bind("127.0.0.1:0", device, config)
        .await
        .expect("bind control server");
    let addr = server.local_addr().expect("control server address");
    tokio::spawn(server.run());
    addr
}

/// Poll `check` until it holds or [`TIMEOUT`] expires.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let wait = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(TIMEOUT, wait).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

/// Await `fut`, failing the test if it takes longer than [`TIMEOUT`].
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// A loopback port with nothing listening on it.
pub async fn dead_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    listener.local_addr().expect("probe address").port()
}

//! Device-side control channel.
//!
//! One [`ControlProtocol`] exists per accepted control connection.  It parses
//! requests, drives the connection's [`SocketControl`], and queues responses
//! and events for the client.
//!
//! ```text
//!   OPENING ──open ok──▶ OPEN
//!      │                  │
//!      └──start dump──▶ DUMP ◀──start dump──┘
//! ```
//!
//! A failed open leaves the channel in `OPENING` so the client can retry.
//! `DUMP` is never left.
//!
//! [`serve_connection`] is the async driver: it owns the TCP stream and an
//! event receiver, and feeds both into the protocol one item at a time.
//! Nothing else touches the protocol, so every handler runs to completion
//! before the next input is looked at.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::config::Config;
use crate::device::{DumpHandle, SocketHandle, VirtualDevice};
use crate::error::Result;
use crate::flow::FlowKey;
use crate::packet::{ControlPacket, ErrorCode, FrameDecoder, OpenIntent, PacketError, WirePacket};
use crate::socket_control::{SocketControl, SocketKind};
use crate::tunnel::TunnelHandle;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Inputs to a control task that do not come from its own TCP stream.
#[derive(Debug)]
pub(crate) enum ControlEvent {
    /// The device wants a reverse tunnel for this flow.
    SpawnRequested(FlowKey),
    /// The device reports the virtual side of this flow closed.
    CloseFlow(FlowKey),
    Spawned {
        flow: FlowKey,
        spawn_port: u16,
        tunnel: TunnelHandle,
    },
    SpawnFailed {
        flow: FlowKey,
        error: io::Error,
    },
    TunnelClosed(FlowKey),
    /// Mirrored traffic for a dump-mode channel.
    Mirror(WirePacket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Dump,
}

pub struct ControlProtocol {
    id: u64,
    device: Arc<dyn VirtualDevice>,
    config: Config,
    state: ChannelState,
    socket: Option<SocketControl>,
    dump: Option<DumpHandle>,
    events: UnboundedSender<ControlEvent>,
    outbox: Vec<ControlPacket>,
}

impl ControlProtocol {
    pub(crate) fn new(
        device: Arc<dyn VirtualDevice>,
        config: Config,
    ) -> (Self, UnboundedReceiver<ControlEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let protocol = Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            device,
            config,
            state: ChannelState::Opening,
            socket: None,
            dump: None,
            events,
            outbox: Vec::new(),
        };
        (protocol, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn socket(&self) -> Option<&SocketControl> {
        self.socket.as_ref()
    }

    /// Packets queued for the client since the last call.
    pub fn take_outgoing(&mut self) -> Vec<ControlPacket> {
        std::mem::take(&mut self.outbox)
    }

    /// The transport should be dropped: the socket shut itself down.
    pub fn should_close(&self) -> bool {
        self.socket.as_ref().is_some_and(SocketControl::is_closed)
    }

    pub fn handle_packet(&mut self, packet: ControlPacket) {
        match packet {
            ControlPacket::SocketOpen {
                callback_address,
                callback_port,
                intent,
            } => {
                info!("[control#{}] socket open request: {intent:?}", self.id);
                self.socket_open_received(callback_address, callback_port, intent);
            }
            ControlPacket::StartDump => {
                info!("[control#{}] start dump request", self.id);
                self.start_dump();
            }
            ControlPacket::Wire(wire) if self.state == ChannelState::Dump => {
                debug!(
                    "[control#{}] injecting {} bytes on {}",
                    self.id,
                    wire.data.len(),
                    wire.flow
                );
                self.device.write(&wire.flow, &wire.data);
            }
            ControlPacket::PromiscuousLevel { set, .. } => {
                info!("[control#{}] promiscuous request, set={set:?}", self.id);
                self.promiscuous_received(set);
            }
            other => {
                info!(
                    "[control#{}] ignoring unexpected packet of kind {:#04x} in state {:?}",
                    self.id,
                    other.kind(),
                    self.state
                );
            }
        }
    }

    pub(crate) fn handle_event(&mut self, event: ControlEvent) {
        if let ControlEvent::Mirror(wire) = event {
            if self.state == ChannelState::Dump {
                self.outbox.push(ControlPacket::Wire(wire));
            }
            return;
        }

        let Some(socket) = self.socket.as_mut() else {
            debug!("[control#{}] no socket for event {event:?}", self.id);
            return;
        };
        match event {
            ControlEvent::SpawnRequested(flow) => {
                if let Err(e) = socket.spawn(flow) {
                    warn!("[control#{}] spawn rejected: {e}; closing socket", self.id);
                    socket.close();
                }
            }
            ControlEvent::CloseFlow(flow) => socket.close_flow(&flow),
            ControlEvent::Spawned {
                flow,
                spawn_port,
                tunnel,
            } => {
                if let Some(announce) = socket.spawn_finished(flow, Ok((spawn_port, tunnel))) {
                    self.outbox.push(announce);
                }
            }
            ControlEvent::SpawnFailed { flow, error } => {
                socket.spawn_finished(flow, Err(error));
            }
            ControlEvent::TunnelClosed(flow) => socket.flow_closed_by_peer(&flow),
            ControlEvent::Mirror(_) => {}
        }
    }

    /// The control connection went away.
    pub fn connection_lost(&mut self) {
        if self.state == ChannelState::Dump {
            if let Some(tap) = self.dump.take() {
                self.device.stop_dump(&tap);
            }
        } else if let Some(socket) = self.socket.as_mut() {
            socket.close();
        }
    }

    fn socket_open_received(
        &mut self,
        callback_address: String,
        callback_port: u16,
        intent: OpenIntent,
    ) {
        if self.socket.is_some() {
            self.outbox.push(ControlPacket::open_failure(
                ErrorCode::General,
                "Socket Already Open",
            ));
            return;
        }

        let handle = SocketHandle::new(self.id, self.events.clone());
        let (kind, granted) = match &intent {
            OpenIntent::Connect {
                destination,
                destination_port,
            } => {
                let port = self
                    .device
                    .create_outbound_socket(handle, destination, *destination_port);
                if port.is_none() {
                    self.reject(ErrorCode::Unknown);
                }
                (SocketKind::Outbound, port)
            }
            OpenIntent::Listen { source_port } => {
                match self.device.create_inbound_socket(handle, *source_port) {
                    Some(port) if port == *source_port => (SocketKind::Listening, Some(port)),
                    other => {
                        if let Some(port) = other {
                            debug!(
                                "[control#{}] device offered {port} instead of {source_port}",
                                self.id
                            );
                            self.device.close_port(port);
                        }
                        self.reject(ErrorCode::Busy);
                        (SocketKind::Listening, None)
                    }
                }
            }
        };

        let Some(port) = granted else {
            return;
        };
        let mut socket = SocketControl::open(
            kind,
            callback_address,
            callback_port,
            Arc::clone(&self.device),
            self.events.clone(),
            self.config.clone(),
        );
        socket.assign_port(port);
        self.socket = Some(socket);
        if self.state == ChannelState::Opening {
            self.state = ChannelState::Open;
        }
        info!("[control#{}] {kind} socket open on port {port}", self.id);
        self.outbox.push(ControlPacket::open_success(port));
    }

    fn reject(&mut self, code: ErrorCode) {
        info!("[control#{}] socket open failed: {code:?}", self.id);
        self.outbox
            .push(ControlPacket::open_failure(code, code.description()));
    }

    fn start_dump(&mut self) {
        self.state = ChannelState::Dump;
        if self.dump.is_some() {
            debug!("[control#{}] already dumping", self.id);
            return;
        }
        let tap = DumpHandle::new(self.id, self.events.clone());
        self.device.start_dump(tap.clone());
        self.dump = Some(tap);
    }

    fn promiscuous_received(&mut self, set: Option<u8>) {
        if let Some(level) = set {
            if let Err(e) = self.device.set_promiscuous_level(level) {
                error!(
                    "[control#{}] setting promiscuous level {level} failed: {e}",
                    self.id
                );
            }
        }
        let level = self.device.promiscuous_level();
        debug!("[control#{}] returning promiscuous level {level}", self.id);
        self.outbox.push(ControlPacket::PromiscuousLevel {
            set: None,
            get: Some(level),
        });
    }
}

/// Run one control connection until either side closes it.
pub async fn serve_connection(
    stream: TcpStream,
    device: Arc<dyn VirtualDevice>,
    config: Config,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let mut decoder = FrameDecoder::new(config.max_frame_len);
    let mut buf = vec![0u8; config.read_chunk];
    let (mut protocol, mut events) = ControlProtocol::new(device, config);
    let (mut reader, mut writer) = stream.into_split();
    info!("[control#{}] connection from {peer}", protocol.id());

    let result = loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    decoder.update(&buf[..n]);
                    if let Err(e) = dispatch_packets(&mut decoder, &mut protocol) {
                        break Err(e.into());
                    }
                }
                Err(e) => break Err(e.into()),
            },
            Some(event) = events.recv() => protocol.handle_event(event),
        }

        if let Err(e) = flush(&mut writer, protocol.take_outgoing()).await {
            break Err(e.into());
        }
        if protocol.should_close() {
            debug!("[control#{}] socket closed; dropping channel", protocol.id());
            break Ok(());
        }
    };

    protocol.connection_lost();
    info!("[control#{}] connection from {peer} lost", protocol.id());
    result
}

fn dispatch_packets(
    decoder: &mut FrameDecoder,
    protocol: &mut ControlProtocol,
) -> std::result::Result<(), PacketError> {
    loop {
        match decoder.next_packet() {
            Ok(Some(packet)) => protocol.handle_packet(packet),
            Ok(None) => return Ok(()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("[control#{}] skipping malformed packet: {e}", protocol.id()),
        }
    }
}

async fn flush(writer: &mut OwnedWriteHalf, packets: Vec<ControlPacket>) -> io::Result<()> {
    for packet in packets {
        writer.write_all(&packet.encode()).await?;
    }
    Ok(())
}

/// Accepts control connections and serves each one in its own task.
pub struct ControlServer {
    listener: TcpListener,
    device: Arc<dyn VirtualDevice>,
    config: Config,
}

impl ControlServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        device: Arc<dyn VirtualDevice>,
        config: Config,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            device,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!("[control] listening on {}", self.listener.local_addr()?);
        loop {
            let (stream, _) = self.listener.accept().await?;
            let device = Arc::clone(&self.device);
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, device, config).await {
                    warn!("[control] connection ended with error: {e}");
                }
            });
        }
    }
}

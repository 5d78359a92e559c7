//! Client side of the control channel.
//!
//! [`RequestProtocol`] is the synchronous state machine behind a connect or
//! listen request.  [`open_socket`] runs it over TCP: it sends the open
//! request as soon as the connection is up, waits for the single response, and
//! then keeps the channel alive in a background task that forwards
//! spawn-completed events to the [`CallbackService`].
//!
//! The diagnostic exchanges live here too: [`query_promiscuous_level`] is a
//! one-shot request/response, and [`DumpSession`] puts a channel in dump mode.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;

use crate::callback::{CallbackService, ProtocolFactory};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::packet::{ControlPacket, ErrorCode, FrameDecoder, OpenIntent, WirePacket};

/// What the caller should do after a packet was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAction {
    Continue,
    /// The device accepted the request and assigned `port`.
    Opened(u16),
    /// The device refused; the channel should be closed.
    Rejected { code: ErrorCode, message: String },
}

pub struct RequestProtocol {
    intent: OpenIntent,
    service: Arc<dyn CallbackService>,
    factory: ProtocolFactory,
    port: Option<u16>,
}

impl RequestProtocol {
    pub fn new(
        intent: OpenIntent,
        service: Arc<dyn CallbackService>,
        factory: ProtocolFactory,
    ) -> Self {
        Self {
            intent,
            service,
            factory,
            port: None,
        }
    }

    pub fn intent(&self) -> &OpenIntent {
        &self.intent
    }

    /// The virtual port assigned by the device, once opened.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The open request to send as soon as the channel is connected.
    pub fn connection_made(&self) -> ControlPacket {
        let (callback_address, callback_port) = self.service.location();
        ControlPacket::SocketOpen {
            callback_address,
            callback_port,
            intent: self.intent.clone(),
        }
    }

    pub fn handle_packet(&mut self, packet: ControlPacket) -> RequestAction {
        match packet {
            ControlPacket::SocketOpenResponse {
                port,
                error_code,
                error_message,
            } => {
                if self.port.is_some() {
                    warn!("[client] duplicate open response ignored");
                    return RequestAction::Continue;
                }
                if error_code.is_failure() {
                    info!("[client] open refused: {error_code:?} {error_message}");
                    return RequestAction::Rejected {
                        code: error_code,
                        message: error_message,
                    };
                }
                self.port = Some(port);
                info!("[client] socket open on virtual port {port}");
                RequestAction::Opened(port)
            }
            ControlPacket::ConnectionSpawned { spawn_port, flow } => {
                debug!("[client] {flow} spawned on port {spawn_port}");
                self.service
                    .complete_callback(&self.intent, (self.factory)(), spawn_port, flow);
                RequestAction::Continue
            }
            other => {
                info!(
                    "[client] ignoring unexpected packet of kind {:#04x}",
                    other.kind()
                );
                RequestAction::Continue
            }
        }
    }
}

/// Frames control packets off any byte stream.
struct PacketReader<R> {
    reader: R,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    fn new(reader: R, config: &Config) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(config.max_frame_len),
            buf: vec![0u8; config.read_chunk],
        }
    }

    /// Next well-formed packet, or `None` at end of stream.
    async fn next(&mut self) -> Result<Option<ControlPacket>> {
        loop {
            match self.decoder.next_packet() {
                Ok(Some(packet)) => return Ok(Some(packet)),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!("[client] skipping malformed packet: {e}");
                    continue;
                }
            }
            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.update(&self.buf[..n]);
        }
    }
}

/// An open virtual socket and the control channel keeping it alive.
pub struct OpenSocket {
    port: u16,
    writer: OwnedWriteHalf,
    task: JoinHandle<Result<()>>,
}

impl OpenSocket {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait until the device closes the control channel.
    pub async fn closed(self) -> Result<()> {
        let OpenSocket { writer, task, .. } = self;
        let result = task.await.unwrap_or(Err(Error::ChannelClosed));
        drop(writer);
        result
    }

    /// Drop the control channel, which closes the socket on the device.
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        self.task.abort();
        Ok(())
    }
}

/// Open a connect or listen socket through the device at `control`.
///
/// Returns once the device has answered.  Spawned flows are handed to
/// `service` for as long as the returned [`OpenSocket`] is kept.
pub async fn open_socket(
    control: impl ToSocketAddrs,
    intent: OpenIntent,
    service: Arc<dyn CallbackService>,
    factory: ProtocolFactory,
    config: &Config,
) -> Result<OpenSocket> {
    let stream = TcpStream::connect(control).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = PacketReader::new(reader, config);
    let mut protocol = RequestProtocol::new(intent, service, factory);

    writer
        .write_all(&protocol.connection_made().encode())
        .await?;

    let port = loop {
        let Some(packet) = reader.next().await? else {
            return Err(Error::ChannelClosed);
        };
        match protocol.handle_packet(packet) {
            RequestAction::Continue => {}
            RequestAction::Opened(port) => break port,
            RequestAction::Rejected { code, message } => {
                let _ = writer.shutdown().await;
                return Err(Error::OpenRejected { code, message });
            }
        }
    };

    let task = tokio::spawn(request_loop(reader, protocol));
    Ok(OpenSocket { port, writer, task })
}

async fn request_loop(
    mut reader: PacketReader<OwnedReadHalf>,
    mut protocol: RequestProtocol,
) -> Result<()> {
    while let Some(packet) = reader.next().await? {
        protocol.handle_packet(packet);
    }
    debug!("[client] control channel for {:?} closed", protocol.intent());
    Ok(())
}

/// Ask the device for its promiscuous level, optionally setting it first.
pub async fn query_promiscuous_level(
    control: impl ToSocketAddrs,
    set: Option<u8>,
    config: &Config,
) -> Result<u8> {
    let stream = TcpStream::connect(control).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = PacketReader::new(reader, config);

    writer
        .write_all(&ControlPacket::PromiscuousLevel { set, get: None }.encode())
        .await?;

    let level = loop {
        match reader.next().await? {
            Some(ControlPacket::PromiscuousLevel { get: Some(level), .. }) => break level,
            Some(ControlPacket::PromiscuousLevel { get: None, .. }) => {
                return Err(Error::ProtocolViolation(
                    "promiscuous response without a level",
                ))
            }
            Some(other) => debug!("[client] ignoring packet of kind {:#04x}", other.kind()),
            None => return Err(Error::ChannelClosed),
        }
    };
    let _ = writer.shutdown().await;
    Ok(level)
}

/// A control channel in dump mode.
pub struct DumpSession {
    reader: PacketReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DumpSession {
    pub async fn connect(control: impl ToSocketAddrs, config: &Config) -> Result<Self> {
        let stream = TcpStream::connect(control).await?;
        let (reader, mut writer) = stream.into_split();
        writer.write_all(&ControlPacket::StartDump.encode()).await?;
        Ok(Self {
            reader: PacketReader::new(reader, config),
            writer,
        })
    }

    /// Inject `packet` onto the virtual network.
    pub async fn inject(&mut self, packet: WirePacket) -> Result<()> {
        self.writer
            .write_all(&ControlPacket::Wire(packet).encode())
            .await?;
        Ok(())
    }

    /// Next mirrored packet, or `None` once the device hangs up.
    pub async fn next_packet(&mut self) -> Result<Option<WirePacket>> {
        loop {
            match self.reader.next().await? {
                Some(ControlPacket::Wire(wire)) => return Ok(Some(wire)),
                Some(other) => debug!("[client] dump ignoring kind {:#04x}", other.kind()),
                None => return Ok(None),
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::callback::{AcceptorHandle, ApplicationProtocol, FlowTransport};
    use crate::flow::FlowKey;

    struct Null;

    impl ApplicationProtocol for Null {
        fn connection_made(&mut self, _transport: FlowTransport) {}
        fn data_received(&mut self, _data: &[u8]) {}
        fn connection_lost(&mut self) {}
    }

    #[derive(Default)]
    struct Matcher {
        completed: Mutex<Vec<(OpenIntent, u16, FlowKey)>>,
    }

    impl CallbackService for Matcher {
        fn location(&self) -> (String, u16) {
            ("127.0.0.1".into(), 9000)
        }

        fn new_data_connection(&self, _spawn_port: u16, _acceptor: AcceptorHandle) {}

        fn complete_callback(
            &self,
            intent: &OpenIntent,
            _protocol: Box<dyn ApplicationProtocol>,
            spawn_port: u16,
            flow: FlowKey,
        ) {
            self.completed
                .lock()
                .unwrap()
                .push((intent.clone(), spawn_port, flow));
        }

        fn data_connection_closed(&self, _acceptor: &AcceptorHandle, _spawn_port: u16) {}
    }

    fn request(intent: OpenIntent) -> (RequestProtocol, Arc<Matcher>) {
        let matcher = Arc::new(Matcher::default());
        let factory: ProtocolFactory = Arc::new(|| Box::new(Null) as Box<dyn ApplicationProtocol>);
        (
            RequestProtocol::new(intent, matcher.clone(), factory),
            matcher,
        )
    }

    fn connect_intent() -> OpenIntent {
        OpenIntent::Connect {
            destination: "20174.0.0.2".into(),
            destination_port: 443,
        }
    }

    #[test]
    fn open_request_carries_callback_location() {
        let (protocol, _) = request(connect_intent());
        assert_eq!(
            protocol.connection_made(),
            ControlPacket::SocketOpen {
                callback_address: "127.0.0.1".into(),
                callback_port: 9000,
                intent: connect_intent(),
            }
        );
    }

    #[test]
    fn success_response_records_port() {
        let (mut protocol, _) = request(connect_intent());
        assert_eq!(
            protocol.handle_packet(ControlPacket::open_success(5000)),
            RequestAction::Opened(5000)
        );
        assert_eq!(protocol.port(), Some(5000));
    }

    #[test]
    fn failure_response_rejects() {
        let (mut protocol, _) = request(OpenIntent::Listen { source_port: 8080 });
        let action = protocol.handle_packet(ControlPacket::open_failure(
            ErrorCode::Busy,
            ErrorCode::Busy.description(),
        ));
        assert_eq!(
            action,
            RequestAction::Rejected {
                code: ErrorCode::Busy,
                message: "Port is not available".into()
            }
        );
        assert_eq!(protocol.port(), None);
    }

    #[test]
    fn spawn_event_is_handed_to_service() {
        let (mut protocol, matcher) = request(connect_intent());
        protocol.handle_packet(ControlPacket::open_success(5000));

        let flow = FlowKey::new("20174.0.0.1", 5000, "20174.0.0.2", 443);
        let action = protocol.handle_packet(ControlPacket::ConnectionSpawned {
            spawn_port: 51000,
            flow: flow.clone(),
        });

        assert_eq!(action, RequestAction::Continue);
        assert_eq!(
            *matcher.completed.lock().unwrap(),
            vec![(connect_intent(), 51000, flow)]
        );
    }

    #[test]
    fn stray_packets_are_ignored() {
        let (mut protocol, matcher) = request(connect_intent());
        assert_eq!(
            protocol.handle_packet(ControlPacket::StartDump),
            RequestAction::Continue
        );
        assert!(matcher.completed.lock().unwrap().is_empty());
    }
}

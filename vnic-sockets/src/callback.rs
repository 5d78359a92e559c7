//! Client-side end of reverse tunnels.
//!
//! The device connects back to the client's callback listener once per flow.
//! Each accepted connection becomes a [`CallbackAcceptor`] registered under
//! its spawn port (the device-side ephemeral port, i.e. the connection's peer
//! port).  The control channel separately reports the same spawn port in a
//! `ConnectionSpawned` event.  [`CallbackRegistry`] pairs the two, in either
//! arrival order, and attaches a fresh application protocol to the acceptor.
//!
//! ```text
//!   reverse TCP ──▶ CallbackAcceptor ──(attach)──▶ ApplicationProtocol
//!                        │   ▲
//!     new_data_connection│   │complete_callback
//!                        ▼   │
//!                   CallbackRegistry ◀── RequestProtocol (control channel)
//! ```
//!
//! Bytes that arrive before attachment are kept in order and replayed to the
//! application ahead of anything received later.  A connection that closes
//! first stays reachable for [`Config::attach_timeout`], so a late spawn event
//! still sees its bytes followed by the loss.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time;

use crate::config::Config;
use crate::error::Result;
use crate::flow::FlowKey;
use crate::packet::OpenIntent;

static NEXT_ACCEPTOR_ID: AtomicU64 = AtomicU64::new(1);

/// An application layer stacked on top of one flow.
pub trait ApplicationProtocol: Send {
    fn connection_made(&mut self, transport: FlowTransport);
    fn data_received(&mut self, data: &[u8]);
    fn connection_lost(&mut self);
}

/// Builds one application protocol per spawned flow.
pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn ApplicationProtocol> + Send + Sync>;

/// Correlates accepted reverse connections with spawn-completed events.
pub trait CallbackService: Send + Sync {
    /// Where the device should connect back to.
    fn location(&self) -> (String, u16);

    fn new_data_connection(&self, spawn_port: u16, acceptor: AcceptorHandle);

    fn complete_callback(
        &self,
        intent: &OpenIntent,
        protocol: Box<dyn ApplicationProtocol>,
        spawn_port: u16,
        flow: FlowKey,
    );

    fn data_connection_closed(&self, acceptor: &AcceptorHandle, spawn_port: u16);
}

#[derive(Debug)]
pub(crate) enum TransportCommand {
    Write(Vec<u8>),
    Close,
}

/// The transport an application protocol sees.
///
/// Addressing is the flow's, not the reverse connection's: the local end is
/// the flow source and the peer end is the flow destination.
#[derive(Debug, Clone)]
pub struct FlowTransport {
    flow: FlowKey,
    spawn_port: u16,
    commands: UnboundedSender<TransportCommand>,
}

impl FlowTransport {
    pub fn flow(&self) -> &FlowKey {
        &self.flow
    }

    pub fn local_endpoint(&self) -> (&str, u16) {
        (&self.flow.source, self.flow.source_port)
    }

    pub fn peer_endpoint(&self) -> (&str, u16) {
        (&self.flow.destination, self.flow.destination_port)
    }

    pub fn spawn_port(&self) -> u16 {
        self.spawn_port
    }

    /// Queue bytes for the flow.  `false` once the tunnel is gone.
    pub fn write(&self, data: &[u8]) -> bool {
        self.commands
            .send(TransportCommand::Write(data.to_vec()))
            .is_ok()
    }

    pub fn close(&self) {
        let _ = self.commands.send(TransportCommand::Close);
    }
}

pub(crate) struct Attachment {
    protocol: Box<dyn ApplicationProtocol>,
    flow: FlowKey,
}

/// Registry-side reference to a live acceptor.
#[derive(Debug, Clone)]
pub struct AcceptorHandle {
    id: u64,
    attach: UnboundedSender<Attachment>,
}

impl AcceptorHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stack `protocol` on the acceptor as the endpoint of `flow`.
    ///
    /// Returns the protocol back if the acceptor is already gone.
    pub fn attach(
        &self,
        protocol: Box<dyn ApplicationProtocol>,
        flow: FlowKey,
    ) -> std::result::Result<(), Box<dyn ApplicationProtocol>> {
        self.attach
            .send(Attachment { protocol, flow })
            .map_err(|e| e.0.protocol)
    }
}

impl PartialEq for AcceptorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AcceptorHandle {}

/// Per-connection buffering and hand-off to the application protocol.
pub struct CallbackAcceptor {
    spawn_port: u16,
    backlog: VecDeque<Vec<u8>>,
    protocol: Option<Box<dyn ApplicationProtocol>>,
    transport: UnboundedSender<TransportCommand>,
    attached: bool,
    lost: bool,
}

impl CallbackAcceptor {
    pub(crate) fn new(spawn_port: u16, transport: UnboundedSender<TransportCommand>) -> Self {
        Self {
            spawn_port,
            backlog: VecDeque::new(),
            protocol: None,
            transport,
            attached: false,
            lost: false,
        }
    }

    pub fn spawn_port(&self) -> u16 {
        self.spawn_port
    }

    pub fn is_attached(&self) -> bool {
        self.protocol.is_some()
    }

    /// No protocol has ever been attached.
    pub fn awaiting_attach(&self) -> bool {
        !self.attached
    }

    /// Bytes held for a protocol that has not been attached yet.
    pub fn buffered(&self) -> usize {
        self.backlog.iter().map(Vec::len).sum()
    }

    pub fn data_received(&mut self, data: &[u8]) {
        match self.protocol.as_mut() {
            Some(protocol) => protocol.data_received(data),
            None => self.backlog.push_back(data.to_vec()),
        }
    }

    pub fn attach(&mut self, mut protocol: Box<dyn ApplicationProtocol>, flow: FlowKey) {
        if self.attached {
            warn!(
                "[callback] spawn port {} already attached; ignoring {flow}",
                self.spawn_port
            );
            return;
        }
        debug!("[callback] attaching {flow} on spawn port {}", self.spawn_port);
        self.attached = true;

        protocol.connection_made(FlowTransport {
            flow,
            spawn_port: self.spawn_port,
            commands: self.transport.clone(),
        });
        while let Some(chunk) = self.backlog.pop_front() {
            protocol.data_received(&chunk);
        }
        if self.lost {
            protocol.connection_lost();
            return;
        }
        self.protocol = Some(protocol);
    }

    pub fn connection_lost(&mut self) {
        if self.lost {
            return;
        }
        self.lost = true;
        if let Some(mut protocol) = self.protocol.take() {
            protocol.connection_lost();
        }
    }
}

#[derive(Default)]
struct Rendezvous {
    acceptors: HashMap<u16, AcceptorHandle>,
    spawned: HashMap<u16, (Box<dyn ApplicationProtocol>, FlowKey)>,
    /// Spawn ports whose connection closed before any spawn event named them.
    closed: HashSet<u16>,
}

/// In-memory [`CallbackService`] backing a [`CallbackListener`].
pub struct CallbackRegistry {
    address: String,
    port: u16,
    inner: Mutex<Rendezvous>,
}

impl CallbackRegistry {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            inner: Mutex::new(Rendezvous::default()),
        }
    }

    /// Acceptors still waiting for their spawn event.
    pub fn waiting_acceptors(&self) -> usize {
        self.lock().acceptors.len()
    }

    /// Spawn events still waiting for their reverse connection.
    pub fn waiting_spawns(&self) -> usize {
        self.lock().spawned.len()
    }

    fn lock(&self) -> MutexGuard<'_, Rendezvous> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CallbackService for CallbackRegistry {
    fn location(&self) -> (String, u16) {
        (self.address.clone(), self.port)
    }

    fn new_data_connection(&self, spawn_port: u16, acceptor: AcceptorHandle) {
        let mut inner = self.lock();
        inner.closed.remove(&spawn_port);
        let Some((protocol, flow)) = inner.spawned.remove(&spawn_port) else {
            debug!("[callback] acceptor {spawn_port} waiting for spawn event");
            inner.acceptors.insert(spawn_port, acceptor);
            return;
        };
        // Sent under the lock so a closing acceptor sees it before deregistering.
        if acceptor.attach(protocol, flow).is_err() {
            warn!("[callback] acceptor {spawn_port} closed before attach");
        }
    }

    fn complete_callback(
        &self,
        intent: &OpenIntent,
        protocol: Box<dyn ApplicationProtocol>,
        spawn_port: u16,
        flow: FlowKey,
    ) {
        let mut inner = self.lock();
        if inner.closed.remove(&spawn_port) {
            warn!(
                "[callback] spawn event for {flow} arrived after spawn port {spawn_port} closed"
            );
            return;
        }
        let Some(acceptor) = inner.acceptors.remove(&spawn_port) else {
            debug!("[callback] spawn event {spawn_port} waiting for acceptor");
            inner.spawned.insert(spawn_port, (protocol, flow));
            return;
        };
        info!("[callback] {intent:?} matched {flow} on spawn port {spawn_port}");
        if acceptor.attach(protocol, flow).is_err() {
            warn!("[callback] acceptor {spawn_port} closed before attach");
        }
    }

    fn data_connection_closed(&self, acceptor: &AcceptorHandle, spawn_port: u16) {
        let mut inner = self.lock();
        if inner.acceptors.get(&spawn_port) == Some(acceptor) {
            inner.acceptors.remove(&spawn_port);
            inner.closed.insert(spawn_port);
        }
        debug!("[callback] data connection on spawn port {spawn_port} closed");
    }
}

/// Accepts reverse connections and runs one acceptor task per connection.
pub struct CallbackListener {
    listener: TcpListener,
    registry: Arc<CallbackRegistry>,
    config: Config,
}

impl CallbackListener {
    /// Bind and advertise the bound address as the callback location.
    pub async fn bind(addr: impl ToSocketAddrs, config: &Config) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        Ok(Self {
            listener,
            registry: Arc::new(CallbackRegistry::new(local.ip().to_string(), local.port())),
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<CallbackRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn run(self) -> Result<()> {
        info!("[callback] listening on {}", self.listener.local_addr()?);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let service: Arc<dyn CallbackService> = self.registry.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_acceptor(stream, service, &config).await {
                    warn!("[callback] reverse connection from {peer} failed: {e}");
                }
            });
        }
    }
}

/// Drive one accepted reverse connection until it closes.
///
/// If it closes before its spawn event, waits up to
/// [`Config::attach_timeout`] for one before deregistering.
pub async fn serve_acceptor(
    stream: TcpStream,
    service: Arc<dyn CallbackService>,
    config: &Config,
) -> Result<()> {
    let spawn_port = stream.peer_addr()?.port();
    let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
    let (attach_tx, mut attach_rx) = mpsc::unbounded_channel();
    let handle = AcceptorHandle {
        id: NEXT_ACCEPTOR_ID.fetch_add(1, Ordering::Relaxed),
        attach: attach_tx,
    };
    let mut acceptor = CallbackAcceptor::new(spawn_port, transport_tx);
    service.new_data_connection(spawn_port, handle.clone());

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; config.read_chunk];
    let result = loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => acceptor.data_received(&buf[..n]),
                Err(e) => break Err(e.into()),
            },
            Some(Attachment { protocol, flow }) = attach_rx.recv() => {
                acceptor.attach(protocol, flow);
            }
            Some(command) = transport_rx.recv() => match command {
                TransportCommand::Write(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        break Err(e.into());
                    }
                }
                TransportCommand::Close => {
                    let _ = writer.shutdown().await;
                    break Ok(());
                }
            },
        }
    };

    acceptor.connection_lost();
    if acceptor.awaiting_attach() {
        if let Ok(Some(Attachment { protocol, flow })) =
            time::timeout(config.attach_timeout, attach_rx.recv()).await
        {
            acceptor.attach(protocol, flow);
        }
    }
    service.data_connection_closed(&handle, spawn_port);
    // A spawn event that raced the timeout was sent before deregistration.
    while let Ok(Attachment { protocol, flow }) = attach_rx.try_recv() {
        acceptor.attach(protocol, flow);
    }
    if acceptor.awaiting_attach() && acceptor.buffered() > 0 {
        debug!(
            "[callback] spawn port {spawn_port} closed unmatched; dropping {} buffered bytes",
            acceptor.buffered()
        );
    }
    result
}

/// Application protocol that hands each attached flow to async code.
pub struct FlowChannel {
    connections: UnboundedSender<FlowConnection>,
    data: Option<UnboundedSender<Vec<u8>>>,
}

impl FlowChannel {
    /// A factory plus the receiver its flows are delivered on.
    pub fn factory() -> (ProtocolFactory, UnboundedReceiver<FlowConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory: ProtocolFactory = Arc::new(move || {
            Box::new(FlowChannel {
                connections: tx.clone(),
                data: None,
            }) as Box<dyn ApplicationProtocol>
        });
        (factory, rx)
    }
}

impl ApplicationProtocol for FlowChannel {
    fn connection_made(&mut self, transport: FlowTransport) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.data = Some(tx);
        let _ = self.connections.send(FlowConnection { transport, data: rx });
    }

    fn data_received(&mut self, data: &[u8]) {
        if let Some(tx) = &self.data {
            let _ = tx.send(data.to_vec());
        }
    }

    fn connection_lost(&mut self) {
        self.data = None;
    }
}

/// One attached flow, as produced by [`FlowChannel`].
pub struct FlowConnection {
    transport: FlowTransport,
    data: UnboundedReceiver<Vec<u8>>,
}

impl FlowConnection {
    pub fn transport(&self) -> &FlowTransport {
        &self.transport
    }

    pub fn flow(&self) -> &FlowKey {
        self.transport.flow()
    }

    pub fn write(&self, data: &[u8]) -> bool {
        self.transport.write(data)
    }

    pub fn close(&self) {
        self.transport.close()
    }

    /// Next chunk from the flow, or `None` once it is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.data.recv().await
    }
}

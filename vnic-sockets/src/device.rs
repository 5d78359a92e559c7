//! The contract a virtual network device must satisfy.
//!
//! The device owns its per-port allocation table and per-flow forwarding
//! table.  Control channels and lifecycle managers never touch those tables;
//! they request changes through [`VirtualDevice`].  In the other direction the
//! device holds handles that post events back into the owning control task:
//!
//! ```text
//!   ControlProtocol ──VirtualDevice──▶ device
//!         ▲                              │
//!         └──── SocketHandle / DumpHandle┘   (ControlEvent over mpsc)
//!   reverse tunnel ◀──── TunnelHandle ───┘   (TunnelCommand over mpsc)
//! ```

use tokio::sync::mpsc::UnboundedSender;

use crate::control::ControlEvent;
use crate::error::Result;
use crate::flow::FlowKey;
use crate::packet::WirePacket;
use crate::tunnel::TunnelHandle;

/// Operations a control channel needs from the virtual device.
///
/// Methods take `&self`; implementations use interior mutability.  None of
/// them may block.
pub trait VirtualDevice: Send + Sync {
    /// Allocate an outbound virtual port for a connection to
    /// `destination:destination_port`.  `None` when the device refuses.
    ///
    /// The device later asks for the flow's tunnel with
    /// [`SocketHandle::request_spawn`].
    fn create_outbound_socket(
        &self,
        socket: SocketHandle,
        destination: &str,
        destination_port: u16,
    ) -> Option<u16>;

    /// Bind a listening socket.  Returns the port actually granted, which the
    /// caller compares against `source_port`.
    fn create_inbound_socket(&self, socket: SocketHandle, source_port: u16) -> Option<u16>;

    /// Route future traffic for `flow` into `tunnel`.
    fn spawn_connection(&self, flow: FlowKey, tunnel: TunnelHandle);

    /// Forget `flow` and shut its tunnel down.  Must tolerate unknown flows.
    fn close_connection(&self, flow: &FlowKey);

    fn close_port(&self, port: u16);

    /// Inject bytes onto the virtual network as traffic of `flow`.
    fn write(&self, flow: &FlowKey, data: &[u8]);

    /// Begin mirroring virtual traffic into `tap`.
    fn start_dump(&self, tap: DumpHandle);

    fn stop_dump(&self, tap: &DumpHandle);

    fn set_promiscuous_level(&self, level: u8) -> Result<()>;

    fn promiscuous_level(&self) -> u8;
}

/// Lets the device drive the socket it was given at creation.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    channel: u64,
    events: UnboundedSender<ControlEvent>,
}

impl SocketHandle {
    pub(crate) fn new(channel: u64, events: UnboundedSender<ControlEvent>) -> Self {
        Self { channel, events }
    }

    /// Id of the control channel that owns the socket.
    pub fn channel_id(&self) -> u64 {
        self.channel
    }

    /// Ask the socket to open a reverse tunnel for `flow`.
    ///
    /// Returns `false` when the control channel is already gone.
    pub fn request_spawn(&self, flow: FlowKey) -> bool {
        self.events.send(ControlEvent::SpawnRequested(flow)).is_ok()
    }

    /// Tell the socket the virtual side of `flow` went away.
    pub fn close_flow(&self, flow: FlowKey) -> bool {
        self.events.send(ControlEvent::CloseFlow(flow)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// A dump-mode control channel the device mirrors traffic into.
///
/// Two handles are equal when they belong to the same control channel.
#[derive(Debug, Clone)]
pub struct DumpHandle {
    channel: u64,
    events: UnboundedSender<ControlEvent>,
}

impl DumpHandle {
    pub(crate) fn new(channel: u64, events: UnboundedSender<ControlEvent>) -> Self {
        Self { channel, events }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel
    }

    /// Queue a mirrored packet for the client.  `false` once the channel is gone.
    pub fn mirror(&self, packet: WirePacket) -> bool {
        self.events.send(ControlEvent::Mirror(packet)).is_ok()
    }
}

impl PartialEq for DumpHandle {
    fn eq(&self, other: &Self) -> bool {
        self.channel == other.channel
    }
}

impl Eq for DumpHandle {}

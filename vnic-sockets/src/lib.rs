//! `vnic-sockets` — connect/listen sockets over a virtual network interface,
//! with each flow's bytes carried by a reverse TCP tunnel.
//!
//! # Architecture
//!
//! ```text
//!   client                                   device
//!  ┌────────────────┐  control channel   ┌──────────────────┐
//!  │ RequestProtocol│───────────────────▶│ ControlProtocol  │
//!  └───────┬────────┘  open / spawned    │  └ SocketControl │
//!          │                             └────────┬─────────┘
//!          │ complete_callback                    │ spawn
//!  ┌───────▼────────┐   reverse TCP       ┌───────▼─────────┐
//!  │CallbackRegistry│◀────────────────────│  tunnel relay   │
//!  │ └ Acceptor     │    (one per flow)   └───────┬─────────┘
//!  └───────┬────────┘                             │ write(flow)
//!          │ attach                       ┌───────▼─────────┐
//!  ┌───────▼────────┐                     │  VirtualDevice  │
//!  │  application   │                     └─────────────────┘
//!  └────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`flow`]           — the 4-tuple naming one virtual connection
//! - [`packet`]         — control-channel messages and their wire format
//! - [`device`]         — the virtual device contract and the handles it holds
//! - [`socket_control`] — per-socket lifecycle: flows, spawning, closing
//! - [`tunnel`]         — reverse connection spawning and byte relay
//! - [`control`]        — device-side control channel state machine and server
//! - [`client`]         — client-side open requests and diagnostic exchanges
//! - [`callback`]       — client-side reverse-connection acceptor and matching
//! - [`loopback`]       — single-address in-process device
//! - [`config`]         — runtime tunables
//! - [`error`]          — crate error type

pub mod callback;
pub mod client;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod flow;
pub mod loopback;
pub mod packet;
pub mod socket_control;
pub mod tunnel;

pub use callback::{
    ApplicationProtocol, CallbackListener, CallbackRegistry, CallbackService, FlowChannel,
    FlowConnection, FlowTransport, ProtocolFactory,
};
pub use client::{open_socket, query_promiscuous_level, DumpSession, OpenSocket};
pub use config::{Config, SpawnFailurePolicy};
pub use control::ControlServer;
pub use device::{DumpHandle, SocketHandle, VirtualDevice};
pub use error::{Error, Result};
pub use flow::FlowKey;
pub use loopback::LoopbackDevice;
pub use packet::{ControlPacket, ErrorCode, OpenIntent, WirePacket};
pub use tunnel::TunnelHandle;

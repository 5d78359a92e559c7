//! Runtime tunables.
//!
//! Every field has a sensible default; the binary overrides them from CLI
//! flags.

use std::str::FromStr;
use std::time::Duration;

/// What to tear down when a reverse connection cannot be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpawnFailurePolicy {
    /// Close the whole owning socket, including unrelated flows of a listener.
    #[default]
    CloseSocket,
    /// Drop only the failed flow.  Outbound sockets still close, since the
    /// failed flow is their only one.
    DropFlow,
}

impl FromStr for SpawnFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "close-socket" => Ok(Self::CloseSocket),
            "drop-flow" => Ok(Self::DropFlow),
            other => Err(format!(
                "unknown spawn failure policy '{other}' (expected close-socket or drop-flow)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Bound on establishing a reverse connection.  Expiry is a spawn failure.
    pub connect_timeout: Duration,
    /// Read buffer size for every relay loop.
    pub read_chunk: usize,
    /// How long a closed reverse connection keeps its early bytes while
    /// waiting for its spawn event.
    pub attach_timeout: Duration,
    /// Largest control frame body accepted before the connection is dropped.
    pub max_frame_len: usize,
    pub spawn_failure: SpawnFailurePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_chunk: 16 * 1024,
            attach_timeout: Duration::from_secs(10),
            max_frame_len: 1024 * 1024,
            spawn_failure: SpawnFailurePolicy::CloseSocket,
        }
    }
}

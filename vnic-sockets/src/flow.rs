//! Flow identity.
//!
//! A [`FlowKey`] names one virtual connection on the device.  It is the join
//! key between the device's forwarding table, the flows tracked by a
//! [`crate::socket_control::SocketControl`], and spawn-completed events.

use std::fmt;

/// Ordered 4-tuple identifying one virtual connection.
///
/// Addresses are virtual-network addresses (for example `20174.0.0.1`), not
/// host addresses, so they are kept as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub source: String,
    pub source_port: u16,
    pub destination: String,
    pub destination_port: u16,
}

impl FlowKey {
    pub fn new(
        source: impl Into<String>,
        source_port: u16,
        destination: impl Into<String>,
        destination_port: u16,
    ) -> Self {
        Self {
            source: source.into(),
            source_port,
            destination: destination.into(),
            destination_port,
        }
    }

    /// The same connection seen from the other end.
    pub fn reversed(&self) -> Self {
        Self {
            source: self.destination.clone(),
            source_port: self.destination_port,
            destination: self.source.clone(),
            destination_port: self.source_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.source, self.source_port, self.destination, self.destination_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_swaps_endpoints() {
        let key = FlowKey::new("1.1.1.1", 5000, "2.2.2.2", 443);
        let rev = key.reversed();
        assert_eq!(rev, FlowKey::new("2.2.2.2", 443, "1.1.1.1", 5000));
        assert_eq!(rev.reversed(), key);
    }

    #[test]
    fn display_is_arrow_separated() {
        let key = FlowKey::new("A", 1, "B", 2);
        assert_eq!(key.to_string(), "A:1 -> B:2");
    }
}

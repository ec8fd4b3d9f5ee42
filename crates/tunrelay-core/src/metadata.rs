use std::net::SocketAddr;

use serde::Serialize;

use crate::adapter::{EndpointId, Network};

/// Per-connection metadata handed to the dialer and the statistics tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub network: Network,
    /// The originating application on the host.
    pub src: SocketAddr,
    /// Where the application intended to connect.
    pub dst: SocketAddr,
    /// Local endpoint of the upstream socket, known once the dial succeeded.
    pub mid: Option<SocketAddr>,
}

impl Metadata {
    /// Builds the pre-dial metadata from a captured connection's identity.
    pub fn from_endpoint(id: &EndpointId) -> Self {
        Self {
            network: id.network,
            src: id.remote,
            dst: id.local,
            mid: None,
        }
    }

    /// Records the upstream socket's local endpoint. Called once, right after
    /// a successful dial.
    pub fn set_mid(&mut self, addr: SocketAddr) {
        debug_assert!(self.mid.is_none(), "mid address already set");
        self.mid = Some(addr);
    }

    pub fn source_address(&self) -> String {
        self.src.to_string()
    }

    pub fn destination_address(&self) -> String {
        self.dst.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_endpoint_swaps_local_and_remote() {
        let app: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        let target: SocketAddr = "93.184.216.34:80".parse().unwrap();
        let metadata = Metadata::from_endpoint(&EndpointId::tcp(target, app));

        assert_eq!(metadata.network, Network::Tcp);
        assert_eq!(metadata.src, app);
        assert_eq!(metadata.dst, target);
        assert_eq!(metadata.mid, None);
        assert_eq!(metadata.destination_address(), "93.184.216.34:80");
        assert_eq!(metadata.source_address(), "10.0.0.1:40000");
    }

    #[test]
    fn test_set_mid() {
        let app: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        let target: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        let mut metadata = Metadata::from_endpoint(&EndpointId::udp(target, app));

        metadata.set_mid("10.0.0.2:51000".parse().unwrap());
        assert_eq!(metadata.mid, Some("10.0.0.2:51000".parse().unwrap()));
        assert_eq!(metadata.destination_address(), "[2001:db8::1]:53");
    }
}

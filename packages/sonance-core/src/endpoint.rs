//! Endpoint URIs and the protocol registry.
//!
//! Endpoints use the form `<proto>://<host>:<port>`. A receiver binds
//! endpoints and a sender connects to them, one trio of source, repair and
//! control endpoints per slot.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fec::FecScheme;
use crate::net::UdpConfig;

/// Endpoint protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Bare RTP source endpoint.
    Rtp,
    /// RTP source endpoint protected by Reed-Solomon (m=8) FEC.
    RtpRs8m,
    /// Reed-Solomon (m=8) repair endpoint.
    Rs8m,
    /// RTP source endpoint protected by LDPC-Staircase FEC.
    RtpLdpc,
    /// LDPC-Staircase repair endpoint.
    Ldpc,
    /// RTCP control endpoint.
    Rtcp,
}

/// Which stream of a slot an endpoint carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
    AudioSource,
    AudioRepair,
    AudioControl,
}

/// One row of the protocol registry.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolEntry {
    pub protocol: Protocol,
    pub name: &'static str,
    pub interface: InterfaceKind,
    pub fec_scheme: Option<FecScheme>,
}

/// Compile-time protocol registry, passed into contexts at construction.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolMap {
    entries: &'static [ProtocolEntry],
}

const BUILTIN_PROTOCOLS: &[ProtocolEntry] = &[
    ProtocolEntry {
        protocol: Protocol::Rtp,
        name: "rtp",
        interface: InterfaceKind::AudioSource,
        fec_scheme: None,
    },
    ProtocolEntry {
        protocol: Protocol::RtpRs8m,
        name: "rtp+rs8m",
        interface: InterfaceKind::AudioSource,
        fec_scheme: Some(FecScheme::Rs8m),
    },
    ProtocolEntry {
        protocol: Protocol::Rs8m,
        name: "rs8m",
        interface: InterfaceKind::AudioRepair,
        fec_scheme: Some(FecScheme::Rs8m),
    },
    ProtocolEntry {
        protocol: Protocol::RtpLdpc,
        name: "rtp+ldpc",
        interface: InterfaceKind::AudioSource,
        fec_scheme: Some(FecScheme::Ldpc),
    },
    ProtocolEntry {
        protocol: Protocol::Ldpc,
        name: "ldpc",
        interface: InterfaceKind::AudioRepair,
        fec_scheme: Some(FecScheme::Ldpc),
    },
    ProtocolEntry {
        protocol: Protocol::Rtcp,
        name: "rtcp",
        interface: InterfaceKind::AudioControl,
        fec_scheme: None,
    },
];

impl ProtocolMap {
    /// The built-in registry.
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_PROTOCOLS,
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<&'static ProtocolEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn find_by_protocol(&self, protocol: Protocol) -> Option<&'static ProtocolEntry> {
        self.entries.iter().find(|entry| entry.protocol == protocol)
    }
}

/// Parsed endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parses `<proto>://<host>:<port>` against the given registry.
    pub fn parse(map: &ProtocolMap, uri: &str) -> Result<Self> {
        let (proto, rest) = uri.split_once("://").ok_or(Error::BadArgument)?;
        let entry = map.find_by_name(proto).ok_or(Error::BadArgument)?;

        let (host, port) = rest.rsplit_once(':').ok_or(Error::BadArgument)?;
        if host.is_empty() {
            return Err(Error::BadArgument);
        }
        let port: u16 = port.parse().map_err(|_| Error::BadArgument)?;

        Ok(Self {
            protocol: entry.protocol,
            host: host.to_string(),
            port,
        })
    }

    /// Stream kind implied by the protocol.
    pub fn interface(&self) -> InterfaceKind {
        ProtocolMap::builtin()
            .find_by_protocol(self.protocol)
            .map(|entry| entry.interface)
            .unwrap_or(InterfaceKind::AudioSource)
    }

    /// FEC scheme implied by the protocol, if any.
    pub fn fec_scheme(&self) -> Option<FecScheme> {
        ProtocolMap::builtin()
            .find_by_protocol(self.protocol)
            .and_then(|entry| entry.fec_scheme)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = ProtocolMap::builtin()
            .find_by_protocol(self.protocol)
            .map(|entry| entry.name)
            .unwrap_or("rtp");
        write!(f, "{}://{}:{}", name, self.host, self.port)
    }
}

/// Per-interface network options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// IPv4 interface for joining the multicast group of a multicast bind.
    pub multicast_interface: Option<Ipv4Addr>,
    /// Allow multiple sockets on the same address.
    pub reuse_address: bool,
    /// Enable the lock-free non-blocking send fast path.
    pub non_blocking_send: bool,
}

impl InterfaceConfig {
    /// Builds the UDP port configuration for a bind address.
    pub fn to_udp_config(&self, bind_address: std::net::SocketAddr) -> UdpConfig {
        UdpConfig {
            bind_address,
            multicast_interface: self.multicast_interface,
            enable_reuseaddr: self.reuse_address,
            enable_non_blocking: self.non_blocking_send,
        }
    }
}

/// A logical group of endpoints for one remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub source: Endpoint,
    pub repair: Option<Endpoint>,
    pub control: Option<Endpoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_builtin_protocols() {
        let map = ProtocolMap::builtin();
        for (uri, protocol) in [
            ("rtp://127.0.0.1:4000", Protocol::Rtp),
            ("rtp+rs8m://127.0.0.1:4000", Protocol::RtpRs8m),
            ("rs8m://127.0.0.1:4001", Protocol::Rs8m),
            ("rtp+ldpc://127.0.0.1:4000", Protocol::RtpLdpc),
            ("ldpc://127.0.0.1:4001", Protocol::Ldpc),
            ("rtcp://127.0.0.1:4002", Protocol::Rtcp),
        ] {
            let endpoint = Endpoint::parse(&map, uri).unwrap();
            assert_eq!(endpoint.protocol, protocol);
            assert_eq!(endpoint.host, "127.0.0.1");
        }
    }

    #[test]
    fn round_trips_through_display() {
        let map = ProtocolMap::builtin();
        let uri = "rtp+rs8m://stream.example.com:10001";
        let endpoint = Endpoint::parse(&map, uri).unwrap();
        assert_eq!(endpoint.to_string(), uri);
    }

    #[test]
    fn rejects_malformed_uris() {
        let map = ProtocolMap::builtin();
        for uri in [
            "rtp://nohost",
            "bogus://127.0.0.1:4000",
            "rtp//127.0.0.1:4000",
            "rtp://:4000",
            "rtp://127.0.0.1:notaport",
        ] {
            assert!(Endpoint::parse(&map, uri).is_err(), "{uri} should fail");
        }
    }

    #[test]
    fn interface_kinds_follow_protocol() {
        let map = ProtocolMap::builtin();
        let repair = Endpoint::parse(&map, "rs8m://127.0.0.1:4001").unwrap();
        assert_eq!(repair.interface(), InterfaceKind::AudioRepair);
        assert_eq!(repair.fec_scheme(), Some(FecScheme::Rs8m));

        let control = Endpoint::parse(&map, "rtcp://127.0.0.1:4002").unwrap();
        assert_eq!(control.interface(), InterfaceKind::AudioControl);
        assert_eq!(control.fec_scheme(), None);
    }
}

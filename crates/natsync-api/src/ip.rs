// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::result;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// An IPv4 address.
///
/// The all-zeros address doubles as the "unset" sentinel used by the
/// connection tracker, see [`Ipv4Addr::is_unset()`].
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct Ipv4Addr {
    inner: [u8; 4],
}

impl Ipv4Addr {
    pub const ANY_ADDR: Self = Self { inner: [0; 4] };

    /// Return the bytes of the address.
    #[inline]
    pub fn bytes(&self) -> [u8; 4] {
        self.inner
    }

    pub const fn from_const(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }

    #[inline]
    pub fn is_unset(&self) -> bool {
        self.inner == [0; 4]
    }
}

impl From<core::net::Ipv4Addr> for Ipv4Addr {
    fn from(ip4: core::net::Ipv4Addr) -> Self {
        Self { inner: ip4.octets() }
    }
}

impl From<Ipv4Addr> for core::net::Ipv4Addr {
    fn from(ip4: Ipv4Addr) -> Self {
        Self::from(ip4.inner)
    }
}

impl From<Ipv4Addr> for u32 {
    fn from(ip: Ipv4Addr) -> u32 {
        u32::from_be_bytes(ip.inner)
    }
}

impl From<u32> for Ipv4Addr {
    fn from(val: u32) -> Self {
        Self { inner: val.to_be_bytes() }
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }
}

impl FromStr for Ipv4Addr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        let octets: Vec<u8> = val
            .split('.')
            .map(|s| s.parse().map_err(|e| format!("{e}")))
            .collect::<result::Result<Vec<u8>, _>>()?;

        if octets.len() != 4 {
            return Err(format!("malformed ip: {val}"));
        }

        Ok(Self { inner: [octets[0], octets[1], octets[2], octets[3]] })
    }
}

impl TryFrom<String> for Ipv4Addr {
    type Error = String;

    fn try_from(val: String) -> result::Result<Self, Self::Error> {
        val.parse()
    }
}

impl From<Ipv4Addr> for String {
    fn from(ip: Ipv4Addr) -> String {
        ip.to_string()
    }
}

impl Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.inner[0], self.inner[1], self.inner[2], self.inner[3],
        )
    }
}

// There's no reason to view an Ipv4Addr as its raw array, so just
// present it in a human-friendly manner.
impl Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ipv4Addr {{ inner: {self} }}")
    }
}

/// The transport protocols the connection tracker reports to us.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(into = "String", try_from = "ProtoRepr")]
pub enum Protocol {
    TCP,
    UDP,
    Unknown(u8),
}

pub const PROTO_TCP: u8 = 0x6;
pub const PROTO_UDP: u8 = 0x11;

impl Protocol {
    /// The zero protocol number is the connection tracker's "unset"
    /// value.
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unknown(0))
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Unknown(0)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::Unknown(v) => write!(f, "{v}"),
        }
    }
}

impl From<u8> for Protocol {
    fn from(proto: u8) -> Self {
        match proto {
            PROTO_TCP => Self::TCP,
            PROTO_UDP => Self::UDP,
            _ => Self::Unknown(proto),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> u8 {
        match proto {
            Protocol::TCP => PROTO_TCP,
            Protocol::UDP => PROTO_UDP,
            Protocol::Unknown(v) => v,
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::TCP),
            "udp" => Ok(Self::UDP),
            num => num
                .parse::<u8>()
                .map(Self::from)
                .map_err(|_| format!("invalid protocol: {s}")),
        }
    }
}

// Configs may name a protocol or give its number.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProtoRepr {
    Num(u8),
    Name(String),
}

impl TryFrom<ProtoRepr> for Protocol {
    type Error = String;

    fn try_from(val: ProtoRepr) -> result::Result<Self, Self::Error> {
        match val {
            ProtoRepr::Num(num) => Ok(Self::from(num)),
            ProtoRepr::Name(name) => name.parse(),
        }
    }
}

impl From<Protocol> for String {
    fn from(proto: Protocol) -> String {
        proto.to_string()
    }
}

/// The 5-tuple identifying one tracked connection.
///
/// This is the dedup key of the NAT cache: at most one cache entry
/// may exist for a given key.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct ConnKey {
    pub private_ip: Ipv4Addr,
    pub private_port: u16,
    pub target_ip: Ipv4Addr,
    pub target_port: u16,
    pub proto: Protocol,
}

impl ConnKey {
    /// Is any of the key fields the tracker's zero sentinel?
    pub fn is_malformed(&self) -> bool {
        self.private_ip.is_unset()
            || self.target_ip.is_unset()
            || self.private_port == 0
            || self.target_port == 0
            || self.proto.is_unset()
    }
}

impl Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.proto,
            self.private_ip,
            self.private_port,
            self.target_ip,
            self.target_port,
        )
    }
}

/// A connection as reported by the tracker, along with the
/// translation the kernel chose for it.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct NatConn {
    pub private_ip: Ipv4Addr,
    pub private_port: u16,
    pub target_ip: Ipv4Addr,
    pub target_port: u16,
    pub public_ip: Ipv4Addr,
    pub public_port: u16,
    pub proto: Protocol,
    /// The translation rewrites the destination rather than the
    /// source.
    #[serde(default)]
    pub dst_nat: bool,
}

impl NatConn {
    pub fn key(&self) -> ConnKey {
        ConnKey {
            private_ip: self.private_ip,
            private_port: self.private_port,
            target_ip: self.target_ip,
            target_port: self.target_port,
            proto: self.proto,
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.key().is_malformed()
    }

    /// Does this translation actually change the private address?
    ///
    /// Flows installed with the private endpoint overwritten by the
    /// public one pass through the table untranslated.
    pub fn translates(&self) -> bool {
        self.private_ip != self.public_ip
    }

    /// Does this connection involve `ip` as either endpoint?
    pub fn involves(&self, ip: Ipv4Addr) -> bool {
        self.private_ip == ip || self.target_ip == ip
    }
}

impl Display for NatConn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} via {}:{}{}",
            self.key(),
            self.public_ip,
            self.public_port,
            if self.dst_nat { " (dnat)" } else { "" },
        )
    }
}

/// The tuple the connection tracker knows a flow by, used when
/// pushing timeout updates.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CtTuple {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub proto: Protocol,
}

impl Display for CtTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.proto, self.src_ip, self.src_port, self.dst_ip, self.dst_port,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ip_roundtrip_str() {
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        assert_eq!(ip.bytes(), [10, 0, 0, 5]);
        assert_eq!(ip.to_string(), "10.0.0.5");
        assert_eq!(u32::from(ip), 0x0a00_0005);
        assert!("10.0.0".parse::<Ipv4Addr>().is_err());
        assert!("10.0.0.256".parse::<Ipv4Addr>().is_err());
    }

    #[test]
    fn protocol_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::TCP);
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::UDP);
        assert_eq!("6".parse::<Protocol>().unwrap(), Protocol::TCP);
        assert_eq!("47".parse::<Protocol>().unwrap(), Protocol::Unknown(47));
        assert!("sctp".parse::<Protocol>().is_err());
        assert!(Protocol::default().is_unset());
    }

    #[test]
    fn malformed_key() {
        let mut conn = NatConn {
            private_ip: "10.0.0.5".parse().unwrap(),
            private_port: 4000,
            target_ip: "93.1.1.1".parse().unwrap(),
            target_port: 80,
            public_ip: "52.10.128.69".parse().unwrap(),
            public_port: 31000,
            proto: Protocol::TCP,
            dst_nat: false,
        };
        assert!(!conn.is_malformed());
        assert!(conn.translates());

        conn.target_port = 0;
        assert!(conn.is_malformed());
        conn.target_port = 80;
        conn.proto = Protocol::Unknown(0);
        assert!(conn.is_malformed());
    }
}

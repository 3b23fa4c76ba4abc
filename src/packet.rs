//! The DHTPv0.1 wire codec.
//!
//! Packets are UDP datagrams of ASCII text: a fixed magic line followed by
//! one `field:value` line per present field. Parsing fills a [`Packet`] of
//! optional fields; [`Packet::check`] enforces the per-type required fields
//! and yields the diagnostic used in `failure` replies.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

use crate::core::identifier::{HashRange, NodeInfo};

/// First line of every packet; datagrams without it are rejected.
pub const MAGIC: &str = "CSE473 DHTPv0.1";

/// Forwarding hop budget given to packets that arrive without a ttl line.
pub const DEFAULT_TTL: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Get,
    Put,
    Success,
    NoMatch,
    Failure,
    Join,
    Leave,
    Update,
    Transfer,
}

impl PacketKind {
    pub fn as_wire(&self) -> &'static str {
        match self {
            PacketKind::Get => "get",
            PacketKind::Put => "put",
            PacketKind::Success => "success",
            PacketKind::NoMatch => "no match",
            PacketKind::Failure => "failure",
            PacketKind::Join => "join",
            PacketKind::Leave => "leave",
            PacketKind::Update => "update",
            PacketKind::Transfer => "transfer",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        Some(match s {
            "get" => PacketKind::Get,
            "put" => PacketKind::Put,
            "success" => PacketKind::Success,
            "no match" => PacketKind::NoMatch,
            "failure" => PacketKind::Failure,
            "join" => PacketKind::Join,
            "leave" => PacketKind::Leave,
            "update" => PacketKind::Update,
            "transfer" => PacketKind::Transfer,
            _ => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet is not ASCII text")]
    NotText,
    #[error("missing or bad magic header")]
    BadMagic,
    #[error("malformed line {0:?}")]
    MalformedLine(String),
    #[error("bad {field} value {value:?}")]
    InvalidField {
        field: &'static str,
        value: String,
    },
}

/// One DHTPv0.1 packet. Requests are parsed into this and never mutated;
/// replies are built fresh, so stale optional fields cannot leak between
/// handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// None when the type line is absent or names an unknown type; `check`
    /// turns that into a failure reason so the tag can still be echoed.
    pub kind: Option<PacketKind>,
    pub key: Option<String>,
    pub val: Option<String>,
    pub tag: Option<u32>,
    pub ttl: i32,
    pub reason: Option<String>,
    pub client_adr: Option<SocketAddr>,
    pub relay_adr: Option<SocketAddr>,
    pub hash_range: Option<HashRange>,
    pub succ_info: Option<NodeInfo>,
    pub pred_info: Option<NodeInfo>,
    pub sender_info: Option<NodeInfo>,
}

impl Default for Packet {
    fn default() -> Self {
        Packet {
            kind: None,
            key: None,
            val: None,
            tag: None,
            ttl: DEFAULT_TTL,
            reason: None,
            client_adr: None,
            relay_adr: None,
            hash_range: None,
            succ_info: None,
            pred_info: None,
            sender_info: None,
        }
    }
}

impl Packet {
    pub fn of_kind(kind: PacketKind) -> Self {
        Packet {
            kind: Some(kind),
            ..Packet::default()
        }
    }

    /// Parse a received datagram. Unrecognized field names are ignored;
    /// malformed values of recognized fields are errors.
    pub fn parse(buf: &[u8]) -> Result<Packet, CodecError> {
        let text = std::str::from_utf8(buf).map_err(|_| CodecError::NotText)?;
        let mut lines = text.lines();
        if lines.next().map(str::trim_end) != Some(MAGIC) {
            return Err(CodecError::BadMagic);
        }

        let mut p = Packet::default();
        for line in lines {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (field, value) = line
                .split_once(':')
                .ok_or_else(|| CodecError::MalformedLine(line.to_string()))?;
            match field {
                "type" => p.kind = PacketKind::from_wire(value),
                "key" => p.key = Some(value.to_string()),
                "val" => p.val = Some(value.to_string()),
                "reason" => p.reason = Some(value.to_string()),
                "tag" => p.tag = Some(parse_num(value, "tag")?),
                "ttl" => p.ttl = parse_num(value, "ttl")?,
                "clientAdr" => p.client_adr = Some(parse_addr(value, "clientAdr")?),
                "relayAdr" => p.relay_adr = Some(parse_addr(value, "relayAdr")?),
                "hashRange" => p.hash_range = Some(parse_range(value)?),
                "succInfo" => p.succ_info = Some(parse_info(value, "succInfo")?),
                "predInfo" => p.pred_info = Some(parse_info(value, "predInfo")?),
                "senderInfo" => p.sender_info = Some(parse_info(value, "senderInfo")?),
                _ => {} // tolerate fields from newer peers
            }
        }
        Ok(p)
    }

    /// Render the packet in wire form.
    pub fn wire(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Validate the per-type required fields, yielding the packet kind. The
    /// error is the diagnostic reason carried by the resulting `failure`
    /// reply.
    pub fn check(&self) -> Result<PacketKind, &'static str> {
        let kind = match self.kind {
            Some(kind) => kind,
            None => return Err("missing or unrecognized packet type"),
        };
        match kind {
            PacketKind::Get => {
                self.require_key("get packet requires a key")?;
                self.require_tag("get packet requires a tag")?;
            }
            PacketKind::Put => {
                self.require_key("put packet requires a key")?;
                self.require_tag("put packet requires a tag")?;
            }
            PacketKind::Success => {
                self.require_tag("success packet requires a tag")?;
                self.require_range("success packet requires a hash range")?;
            }
            PacketKind::NoMatch => {
                self.require_tag("no match packet requires a tag")?;
                self.require_key("no match packet requires a key")?;
                self.require_range("no match packet requires a hash range")?;
            }
            PacketKind::Failure => {
                self.require_tag("failure packet requires a tag")?;
                if self.reason.is_none() {
                    return Err("failure packet requires a reason");
                }
            }
            PacketKind::Join => {
                self.require_sender("join packet requires sender info")?;
                if self.pred_info.is_none() {
                    return Err("join packet requires predecessor info");
                }
            }
            PacketKind::Leave => {
                self.require_sender("leave packet requires sender info")?;
            }
            PacketKind::Update => {
                if self.pred_info.is_none()
                    && self.succ_info.is_none()
                    && self.hash_range.is_none()
                {
                    return Err("update packet carries nothing to update");
                }
            }
            PacketKind::Transfer => {
                self.require_key("transfer packet requires a key")?;
                self.require_sender("transfer packet requires sender info")?;
                if self.val.is_none() {
                    return Err("transfer packet requires a value");
                }
            }
        }
        Ok(kind)
    }

    fn require_key(&self, reason: &'static str) -> Result<(), &'static str> {
        self.key.as_ref().map(|_| ()).ok_or(reason)
    }

    fn require_tag(&self, reason: &'static str) -> Result<(), &'static str> {
        self.tag.map(|_| ()).ok_or(reason)
    }

    fn require_range(&self, reason: &'static str) -> Result<(), &'static str> {
        self.hash_range.map(|_| ()).ok_or(reason)
    }

    fn require_sender(&self, reason: &'static str) -> Result<(), &'static str> {
        self.sender_info.map(|_| ()).ok_or(reason)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{MAGIC}")?;
        if let Some(kind) = self.kind {
            writeln!(f, "type:{}", kind.as_wire())?;
        }
        if let Some(key) = &self.key {
            writeln!(f, "key:{key}")?;
        }
        if let Some(val) = &self.val {
            writeln!(f, "val:{val}")?;
        }
        if let Some(tag) = self.tag {
            writeln!(f, "tag:{tag}")?;
        }
        writeln!(f, "ttl:{}", self.ttl)?;
        if let Some(reason) = &self.reason {
            writeln!(f, "reason:{reason}")?;
        }
        if let Some(adr) = self.client_adr {
            writeln!(f, "clientAdr:{adr}")?;
        }
        if let Some(adr) = self.relay_adr {
            writeln!(f, "relayAdr:{adr}")?;
        }
        if let Some(range) = self.hash_range {
            writeln!(f, "hashRange:{range}")?;
        }
        if let Some(info) = self.succ_info {
            writeln!(f, "succInfo:{info}")?;
        }
        if let Some(info) = self.pred_info {
            writeln!(f, "predInfo:{info}")?;
        }
        if let Some(info) = self.sender_info {
            writeln!(f, "senderInfo:{info}")?;
        }
        Ok(())
    }
}

fn parse_num<T: FromStr>(value: &str, field: &'static str) -> Result<T, CodecError> {
    value.parse().map_err(|_| CodecError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn parse_addr(value: &str, field: &'static str) -> Result<SocketAddr, CodecError> {
    value.parse().map_err(|_| CodecError::InvalidField {
        field,
        value: value.to_string(),
    })
}

// ip:port:firstHash — the hash is everything after the last colon, so the
// address part parses uniformly for v4 and bracketed v6
fn parse_info(value: &str, field: &'static str) -> Result<NodeInfo, CodecError> {
    let bad = || CodecError::InvalidField {
        field,
        value: value.to_string(),
    };
    let (addr, hash) = value.rsplit_once(':').ok_or_else(bad)?;
    Ok(NodeInfo::new(
        addr.parse().map_err(|_| bad())?,
        hash.parse().map_err(|_| bad())?,
    ))
}

fn parse_range(value: &str) -> Result<HashRange, CodecError> {
    let bad = || CodecError::InvalidField {
        field: "hashRange",
        value: value.to_string(),
    };
    let (low, high) = value.split_once(':').ok_or_else(bad)?;
    Ok(HashRange::new(
        low.parse().map_err(|_| bad())?,
        high.parse().map_err(|_| bad())?,
    ))
}

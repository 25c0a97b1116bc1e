//! BLIP message model
//!
//! The structured representation of one protocol message as seen by the
//! tamper pipeline: kind, flags, sequence number, ordered properties and
//! raw body. The checksum trailer is carried through untouched.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The type of a BLIP message.
///
/// The discriminants mirror the low three bits of the frame flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// A request to the other side for an action
    Request = 0,
    /// A successful response to a request
    Response = 1,
    /// An error response to a request
    Error = 2,
    /// Acknowledgement that a long-running request was received
    AckRequest = 4,
    /// Acknowledgement that a long-running response was received
    AckResponse = 5,
}

impl MessageKind {
    /// Recover the kind from the type bits of a flags byte.
    pub fn from_type_bits(bits: u8) -> Option<Self> {
        match bits & FrameFlags::TYPE_MASK.bits() {
            0 => Some(MessageKind::Request),
            1 => Some(MessageKind::Response),
            2 => Some(MessageKind::Error),
            4 => Some(MessageKind::AckRequest),
            5 => Some(MessageKind::AckResponse),
            _ => None,
        }
    }

    pub fn type_bits(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Request => "Request",
            MessageKind::Response => "Response",
            MessageKind::Error => "Error",
            MessageKind::AckRequest => "AckRequest",
            MessageKind::AckResponse => "AckResponse",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Flags set on a BLIP frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Isolates the message type inside the flags byte
        const TYPE_MASK = 0x07;
        /// The message payload is compressed
        const COMPRESSED = 0x08;
        /// The message wants higher priority
        const URGENT = 0x10;
        /// No response should be sent for this request
        const NO_REPLY = 0x20;
        /// The message continues in a following frame
        const MORE_COMING = 0x40;
    }
}

impl FrameFlags {
    /// Parse a flag name as it appears in rule configuration files.
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "compressed" => Some(FrameFlags::COMPRESSED),
            "urgent" => Some(FrameFlags::URGENT),
            "noreply" => Some(FrameFlags::NO_REPLY),
            "morecoming" => Some(FrameFlags::MORE_COMING),
            _ => None,
        }
    }
}

/// Insertion-ordered string properties of a BLIP message.
///
/// The wire form is a flat colon-delimited token stream alternating key and
/// value (`"k1:v1:k2:v2"`). There is no escaping, so keys and values must
/// not contain `:` themselves; insertion of such a value is allowed but
/// logged, since the blob will not round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the colon-delimited wire blob. An odd trailing key (a blob
    /// produced by a corrupt encoder) is dropped with a warning.
    pub fn parse(blob: &str) -> Self {
        let mut entries = Vec::new();
        if blob.is_empty() {
            return Self { entries };
        }
        let mut tokens = blob.split(':');
        while let Some(key) = tokens.next() {
            match tokens.next() {
                Some(value) => entries.push((key.to_string(), value.to_string())),
                None => {
                    warn!(key, "odd property token stream, dropping trailing key");
                }
            }
        }
        Self { entries }
    }

    /// Serialize back to the wire blob, preserving insertion order.
    pub fn to_blob(&self) -> String {
        let mut out = String::new();
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push_str(k);
            out.push(':');
            out.push_str(v);
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or overwrite a key, keeping its original position when it
    /// already exists.
    pub fn insert(&mut self, key: &str, value: &str) {
        if key.contains(':') || value.contains(':') {
            warn!(key, value, "property contains ':', blob will not round-trip");
        }
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.to_string();
        } else {
            self.entries.push((key.to_string(), value.to_string()));
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Substring-style containment used by rule criteria: true when the
    /// `key:value` pair appears somewhere in the blob.
    pub fn contains_pair(&self, key: &str, value: &str) -> bool {
        self.to_blob().contains(&format!("{key}:{value}"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One structured BLIP message, the unit of protocol-level tampering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Protocol-assigned sequence number, correlates requests and replies
    pub number: u64,
    pub kind: MessageKind,
    pub flags: FrameFlags,
    pub properties: Properties,
    pub body: Vec<u8>,
    /// CRC32 trailer, carried through without recomputation
    pub checksum: u32,
}

impl Message {
    pub fn new(number: u64, kind: MessageKind) -> Self {
        Self {
            number,
            kind,
            flags: FrameFlags::from_bits_retain(kind.type_bits()),
            properties: Properties::new(),
            body: Vec::new(),
            checksum: 0,
        }
    }

    /// Change the kind, keeping the type bits of the flags in sync.
    pub fn set_kind(&mut self, kind: MessageKind) {
        self.kind = kind;
        self.flags = (self.flags - FrameFlags::TYPE_MASK)
            | FrameFlags::from_bits_retain(kind.type_bits());
    }

    /// The `Profile` property, the conventional request discriminator.
    pub fn profile(&self) -> Option<&str> {
        self.properties.get("Profile")
    }
}

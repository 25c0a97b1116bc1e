//! Rule-based transform engine
//!
//! Rules come from the interceptor plugin's JSON configuration: each pairs
//! match criteria with an ordered list of output transforms, a direction
//! filter and a firing frequency. The engine owns the active rule list and
//! the pending-reply table that carries deferred transforms across the
//! request/reply turnaround.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bitflags::bitflags;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::message::{FrameFlags, Message, MessageKind};

bitflags! {
    /// Which flow direction(s) a rule applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Direction: u8 {
        const TO_SERVER = 1;
        const TO_CLIENT = 1 << 1;
    }
}

impl Direction {
    pub fn both() -> Self {
        Direction::TO_SERVER | Direction::TO_CLIENT
    }

    /// The direction the correlated reply will flow.
    pub fn opposite(self) -> Self {
        let mut out = Direction::empty();
        if self.contains(Direction::TO_SERVER) {
            out |= Direction::TO_CLIENT;
        }
        if self.contains(Direction::TO_CLIENT) {
            out |= Direction::TO_SERVER;
        }
        out
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (
            self.contains(Direction::TO_SERVER),
            self.contains(Direction::TO_CLIENT),
        ) {
            (true, true) => f.write_str("to server and client"),
            (true, false) => f.write_str("to server"),
            (false, true) => f.write_str("to client"),
            (false, false) => f.write_str("nowhere"),
        }
    }
}

// Wire form is the flags-enum string "ToServer, ToClient".
impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let mut out = Direction::empty();
        for part in raw.split(',') {
            match part.trim().to_ascii_lowercase().as_str() {
                "toserver" => out |= Direction::TO_SERVER,
                "toclient" => out |= Direction::TO_CLIENT,
                other => {
                    return Err(de::Error::custom(format!("unknown direction {other:?}")));
                }
            }
        }
        Ok(out)
    }
}

fn parse_flags<E: de::Error>(raw: &str) -> Result<FrameFlags, E> {
    let mut flags = FrameFlags::empty();
    for part in raw.split(',') {
        let name = part.trim();
        match FrameFlags::from_config_name(name) {
            Some(flag) => flags |= flag,
            None => return Err(E::custom(format!("unknown frame flag {name:?}"))),
        }
    }
    Ok(flags)
}

fn de_flags<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FrameFlags, D::Error> {
    parse_flags(&String::deserialize(deserializer)?)
}

fn de_opt_flags<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<FrameFlags>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|raw| parse_flags(&raw))
        .transpose()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Frequency {
    #[default]
    #[serde(alias = "always")]
    Always,
    #[serde(alias = "onlyOnce")]
    OnlyOnce,
}

/// Predicate side of a rule. Every present field must match; an empty
/// criteria matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criteria {
    #[serde(default, alias = "ApplicationFrequency")]
    pub application_frequency: Frequency,
    #[serde(default, alias = "ApplyToReply")]
    pub apply_to_reply: bool,
    #[serde(default, alias = "Type", rename = "type")]
    pub kind: Option<MessageKind>,
    #[serde(default, alias = "Number")]
    pub number: Option<u64>,
    #[serde(default, alias = "Profile")]
    pub profile: Option<String>,
    #[serde(default, alias = "Flags", deserialize_with = "de_opt_flags")]
    pub flags: Option<FrameFlags>,
    #[serde(default, alias = "Properties")]
    pub properties: Option<BTreeMap<String, String>>,
}

impl Criteria {
    pub fn matches(&self, message: &Message) -> bool {
        if self.kind.is_some_and(|kind| kind != message.kind) {
            return false;
        }
        if self.number.is_some_and(|number| number != message.number) {
            return false;
        }
        if let Some(profile) = &self.profile {
            if message.profile() != Some(profile.as_str()) {
                return false;
            }
        }
        if self.flags.is_some_and(|flags| flags != message.flags) {
            return false;
        }
        if let Some(properties) = &self.properties {
            for (key, value) in properties {
                if !message.properties.contains_pair(key, value) {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum NumberOp {
    #[default]
    Replace,
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum SetOp {
    #[default]
    Replace,
    Add,
    Remove,
}

/// One mutation of the working message, tagged by the portion it touches.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "portion")]
pub enum Transform {
    #[serde(alias = "messageNo", rename_all = "camelCase")]
    MessageNo {
        number: u64,
        #[serde(default)]
        op: NumberOp,
    },
    #[serde(alias = "flags", rename_all = "camelCase")]
    Flags {
        #[serde(deserialize_with = "de_flags")]
        flags: FrameFlags,
        #[serde(default)]
        op: SetOp,
    },
    #[serde(alias = "profile", rename_all = "camelCase")]
    Profile { profile: String },
    #[serde(alias = "type", rename_all = "camelCase")]
    Type {
        #[serde(rename = "type")]
        kind: MessageKind,
    },
    #[serde(alias = "properties", rename_all = "camelCase")]
    Properties {
        properties: BTreeMap<String, String>,
        #[serde(default)]
        op: SetOp,
    },
    #[serde(alias = "body", rename_all = "camelCase")]
    Body { content: String },
}

impl Transform {
    pub fn apply(&self, message: &mut Message) {
        match self {
            Transform::MessageNo { number, op } => {
                message.number = match op {
                    NumberOp::Replace => *number,
                    NumberOp::Add => message.number.wrapping_add(*number),
                    NumberOp::Subtract => message.number.wrapping_sub(*number),
                    NumberOp::Multiply => message.number.wrapping_mul(*number),
                    NumberOp::Divide => {
                        if *number == 0 {
                            warn!("ignoring divide-by-zero message number transform");
                            message.number
                        } else {
                            message.number / number
                        }
                    }
                };
            }
            Transform::Flags { flags, op } => {
                message.flags = match op {
                    SetOp::Replace => *flags,
                    SetOp::Add => message.flags | *flags,
                    SetOp::Remove => message.flags - *flags,
                };
                // Keep the kind consistent with whatever the type bits now say
                if let Some(kind) = MessageKind::from_type_bits(message.flags.bits()) {
                    message.kind = kind;
                }
            }
            Transform::Profile { profile } => {
                message.properties.insert("Profile", profile);
            }
            Transform::Type { kind } => {
                message.set_kind(*kind);
            }
            Transform::Properties { properties, op } => {
                if *op == SetOp::Replace {
                    message.properties.clear();
                }
                for (key, value) in properties {
                    match op {
                        SetOp::Remove => message.properties.remove(key),
                        _ => message.properties.insert(key, value),
                    }
                }
            }
            Transform::Body { content } => {
                message.body = content.as_bytes().to_vec();
            }
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::MessageNo { number, op } => match op {
                NumberOp::Replace => write!(f, "change message number to {number}"),
                NumberOp::Add => write!(f, "add {number} to message number"),
                NumberOp::Subtract => write!(f, "subtract {number} from message number"),
                NumberOp::Multiply => write!(f, "multiply message number by {number}"),
                NumberOp::Divide => write!(f, "divide message number by {number}"),
            },
            Transform::Flags { flags, op } => match op {
                SetOp::Replace => write!(f, "replace flags with {flags:?}"),
                SetOp::Add => write!(f, "add {flags:?} to flags"),
                SetOp::Remove => write!(f, "remove {flags:?} from flags"),
            },
            Transform::Profile { profile } => write!(f, "change profile to {profile}"),
            Transform::Type { kind } => write!(f, "change type to {kind}"),
            Transform::Properties { properties, op } => match op {
                SetOp::Replace => write!(f, "replace properties with {properties:?}"),
                SetOp::Add => write!(f, "add {properties:?} to properties"),
                SetOp::Remove => write!(f, "remove {properties:?} from properties"),
            },
            Transform::Body { content } => write!(f, "change body to {content:?}"),
        }
    }
}

fn default_direction() -> Direction {
    Direction::both()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(alias = "Criteria")]
    pub criteria: Criteria,
    #[serde(alias = "OutputTransforms")]
    pub output_transforms: Vec<Transform>,
    #[serde(
        default = "default_direction",
        alias = "RuleDirection",
        rename = "ruleDirection"
    )]
    pub direction: Direction,
}

/// The active rule set plus the pending-reply table. Shared by the two
/// direction tasks behind the pipeline's lock.
pub struct RuleEngine {
    rules: Vec<(u64, Rule)>,
    pending: HashMap<(Direction, u64), (u64, Vec<Transform>)>,
    next_id: u64,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut engine = Self {
            rules: Vec::with_capacity(rules.len()),
            pending: HashMap::new(),
            next_id: 0,
        };
        for rule in rules {
            let id = engine.next_id;
            engine.next_id += 1;
            engine.rules.push((id, rule));
        }
        engine
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|(_, rule)| rule)
    }

    /// Run one message through the rule set. Pending deferred transforms
    /// for this reply are consumed first, then active rules are matched in
    /// declaration order; OnlyOnce rules are retired after the pass.
    pub fn apply(&mut self, message: &mut Message, direction: Direction) {
        let mut fired: Vec<u64> = Vec::new();

        if matches!(message.kind, MessageKind::Response | MessageKind::Error) {
            if let Some((id, transforms)) = self.pending.remove(&(direction, message.number)) {
                for transform in &transforms {
                    debug!(%direction, number = message.number, "applying deferred transform: {transform}");
                    transform.apply(message);
                }
                fired.push(id);
            }
        }

        for (id, rule) in &self.rules {
            if !rule.direction.intersects(direction) || !rule.criteria.matches(message) {
                continue;
            }
            if rule.criteria.apply_to_reply {
                // Armed, not fired: retirement happens when the reply lands
                let key = (direction.opposite(), message.number);
                debug!(
                    number = message.number,
                    "deferring {} transform(s) to the reply",
                    rule.output_transforms.len()
                );
                self.pending
                    .insert(key, (*id, rule.output_transforms.clone()));
                continue;
            }
            for transform in &rule.output_transforms {
                debug!(%direction, number = message.number, "applying transform: {transform}");
                transform.apply(message);
            }
            fired.push(*id);
        }

        self.rules.retain(|(id, rule)| {
            rule.criteria.application_frequency == Frequency::Always || !fired.contains(id)
        });
    }
}

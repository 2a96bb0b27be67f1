// SPDX-License-Identifier: MIT OR Apache-2.0
//! Slot definitions for node inputs/outputs and the type-compatibility rule.
//!
//! A slot type is a plain string (`"number"`), a comma-separated list of
//! alternatives (`"number,string"`), or one of three sentinels:
//!
//! - [`SlotType::Default`] - untyped wildcard, written `"*"`
//! - [`SlotType::Event`] - output side of a trigger connection
//! - [`SlotType::Action`] - input side of a trigger connection
//!
//! [`is_valid_connection`] decides whether two slot types may be linked. It is
//! pure, so editors can call it for drag-preview feedback as well.

use crate::link::LinkId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Slot direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotDirection {
    /// Input slot
    Input,
    /// Output slot
    Output,
}

impl fmt::Display for SlotDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Data type carried by a slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum SlotType {
    /// Wildcard, compatible with anything
    #[default]
    Default,
    /// Emits trigger events (output side)
    Event,
    /// Receives trigger events (input side)
    Action,
    /// Named type, possibly a comma-separated list of alternatives
    Named(String),
}

impl SlotType {
    /// Parse a type string, recognising the sentinel spellings.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "*" || trimmed == "0" {
            Self::Default
        } else if trimmed.eq_ignore_ascii_case("event") {
            Self::Event
        } else if trimmed.eq_ignore_ascii_case("action") {
            Self::Action
        } else {
            Self::Named(trimmed.to_string())
        }
    }

    /// Wire spelling of this type
    pub fn as_str(&self) -> &str {
        match self {
            Self::Default => "*",
            Self::Event => "EVENT",
            Self::Action => "ACTION",
            Self::Named(name) => name,
        }
    }

    /// True for the wildcard (including a blank named type)
    pub fn is_wildcard(&self) -> bool {
        match self {
            Self::Default => true,
            Self::Named(name) => name.trim().is_empty() || name.trim() == "*",
            Self::Event | Self::Action => false,
        }
    }

    /// True for the EVENT/ACTION sentinels
    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::Event | Self::Action)
    }

    /// Check if this type can be linked to another
    pub fn can_connect_to(&self, other: &SlotType) -> bool {
        is_valid_connection(self, other)
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SlotType {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for SlotType {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl Serialize for SlotType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SlotType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Decide whether an output of type `a` may be linked to an input of type `b`.
///
/// Rules, first match wins:
/// 1. either side is the wildcard
/// 2. identical types
/// 3. one side is EVENT and the other ACTION
/// 4. case-insensitive equality of single named types
/// 5. if either side lists comma-separated alternatives, any pair of
///    alternatives satisfying rules 1 to 4
pub fn is_valid_connection(a: &SlotType, b: &SlotType) -> bool {
    if a.is_wildcard() || b.is_wildcard() || a == b {
        return true;
    }
    match (a, b) {
        (SlotType::Event, SlotType::Action) | (SlotType::Action, SlotType::Event) => return true,
        (SlotType::Named(x), SlotType::Named(y)) if !is_list(a) && !is_list(b) => {
            return x.trim().eq_ignore_ascii_case(y.trim());
        }
        _ => {}
    }
    if !is_list(a) && !is_list(b) {
        return false;
    }
    let right = alternatives(b);
    alternatives(a)
        .iter()
        .any(|left| right.iter().any(|right| is_valid_connection(left, right)))
}

fn is_list(slot_type: &SlotType) -> bool {
    matches!(slot_type, SlotType::Named(name) if name.contains(','))
}

/// Single-type alternatives of a comma list; other types stand alone
fn alternatives(slot_type: &SlotType) -> Vec<SlotType> {
    match slot_type {
        SlotType::Named(name) if name.contains(',') => name
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(SlotType::parse)
            .collect(),
        other => vec![other.clone()],
    }
}

/// An input slot. Holds at most one incoming link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSlot {
    /// Slot name; also the action name for ACTION inputs
    pub name: String,
    /// Accepted type
    #[serde(rename = "type")]
    pub slot_type: SlotType,
    /// Incoming link, if connected
    #[serde(default)]
    pub link: Option<LinkId>,
    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Name of the widget bound to this input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<String>,
    /// Value read when the input is not connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl InputSlot {
    /// Create a new unconnected input
    pub fn new(name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        Self {
            name: name.into(),
            slot_type: slot_type.into(),
            link: None,
            label: None,
            widget: None,
            default_value: None,
        }
    }

    /// Set the default value
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Bind a widget
    pub fn with_widget(mut self, widget: impl Into<String>) -> Self {
        self.widget = Some(widget.into());
        self
    }

    /// Set the display label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether a link is attached
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

/// An output slot. Fans out to any number of links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSlot {
    /// Slot name; also the event name for EVENT outputs
    pub name: String,
    /// Produced type
    #[serde(rename = "type")]
    pub slot_type: SlotType,
    /// Outgoing links, in connection order
    #[serde(default)]
    pub links: Vec<LinkId>,
    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Most recently produced value (transient)
    #[serde(skip)]
    pub value: Option<Value>,
}

impl OutputSlot {
    /// Create a new unconnected output
    pub fn new(name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        Self {
            name: name.into(),
            slot_type: slot_type.into(),
            links: Vec::new(),
            label: None,
            value: None,
        }
    }

    /// Set the display label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether any link is attached
    pub fn is_connected(&self) -> bool {
        !self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sentinels() {
        assert_eq!(SlotType::parse(""), SlotType::Default);
        assert_eq!(SlotType::parse("*"), SlotType::Default);
        assert_eq!(SlotType::parse("event"), SlotType::Event);
        assert_eq!(SlotType::parse("ACTION"), SlotType::Action);
        assert_eq!(SlotType::parse(" number "), SlotType::Named("number".into()));
    }

    #[test]
    fn test_wildcard_matches_everything() {
        for other in ["number", "EVENT", "ACTION", "a,b", "*"] {
            assert!(is_valid_connection(&SlotType::Default, &SlotType::parse(other)));
            assert!(is_valid_connection(&SlotType::parse(other), &SlotType::Default));
        }
    }

    #[test]
    fn test_event_action_pairing() {
        assert!(is_valid_connection(&SlotType::Event, &SlotType::Action));
        assert!(is_valid_connection(&SlotType::Action, &SlotType::Event));
        assert!(!is_valid_connection(&SlotType::Event, &"number".into()));
        assert!(!is_valid_connection(&"number".into(), &SlotType::Action));
    }

    #[test]
    fn test_named_types_case_insensitive() {
        assert!(is_valid_connection(&"Number".into(), &"number".into()));
        assert!(!is_valid_connection(&"number".into(), &"string".into()));
    }

    #[test]
    fn test_multi_type_lists() {
        let multi: SlotType = "number,string".into();
        assert!(is_valid_connection(&multi, &"string".into()));
        assert!(is_valid_connection(&"NUMBER".into(), &multi));
        assert!(is_valid_connection(&multi, &"boolean,string".into()));
        assert!(!is_valid_connection(&multi, &"boolean".into()));
        assert!(!is_valid_connection(&multi, &SlotType::Action));
        assert!(is_valid_connection(&multi, &"boolean,*".into()));
    }

    #[test]
    fn test_lists_with_sentinels() {
        assert!(is_valid_connection(&"number,*".into(), &SlotType::Event));
        assert!(is_valid_connection(&SlotType::Action, &"number,*".into()));
        assert!(is_valid_connection(&"number,event".into(), &SlotType::Action));
        assert!(is_valid_connection(&SlotType::Event, &"string,ACTION".into()));
        assert!(!is_valid_connection(&"number,event".into(), &"string".into()));
        assert!(!is_valid_connection(&SlotType::Event, &"number,string".into()));
    }

    #[test]
    fn test_slot_type_serializes_as_string() {
        let json = serde_json::to_string(&InputSlot::new("in", SlotType::Action)).unwrap();
        assert_eq!(json, r#"{"name":"in","type":"ACTION","link":null}"#);

        let output: OutputSlot =
            serde_json::from_str(r#"{"name":"out","type":"","links":[3]}"#).unwrap();
        assert_eq!(output.slot_type, SlotType::Default);
        assert_eq!(output.links, vec![LinkId(3)]);
        assert!(output.value.is_none());
    }
}

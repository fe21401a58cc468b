// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::io::Write;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    EmptyTopic,
    TooManyData,
    InvalidChar,
    ContainsWildChar,
}

impl std::fmt::Display for TopicError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            Self::EmptyTopic => "Topic is empty",
            Self::TooManyData => "Topic is too long",
            Self::InvalidChar => "Wildcard char breaks topic grammar",
            Self::ContainsWildChar => "Level mixes wildcard with other chars",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for TopicError {}

impl From<TopicError> for DecodeError {
    fn from(_e: TopicError) -> Self {
        Self::InvalidTopic
    }
}

impl From<TopicError> for EncodeError {
    fn from(_e: TopicError) -> Self {
        Self::InvalidTopic
    }
}

/// One level of a topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPart {
    /// Normal level, compared literally.
    Normal(String),

    /// `$`-prefixed level, like `$SYS`. Compared literally, but never
    /// matched by a leading wildcard level.
    Internal(String),

    /// Zero length level, as produced by a leading, trailing or doubled `/`.
    Empty,

    /// `#`, matches every remaining level including the parent.
    MultiWildcard,

    /// `+`, matches exactly one level.
    SingleWildcard,
}

impl TopicPart {
    fn has_wildcard(s: &str) -> bool {
        s.contains(['#', '+'])
    }

    fn is_internal(s: &str) -> bool {
        s.starts_with('$')
    }

    fn parse(s: &str) -> Result<Self, TopicError> {
        match s {
            "" => Ok(Self::Empty),
            "+" => Ok(Self::SingleWildcard),
            "#" => Ok(Self::MultiWildcard),
            _ => {
                // `sport+`, `sport#` and friends: wildcards must occupy
                // an entire level [MQTT-4.7.1-2], [MQTT-4.7.1-3].
                if Self::has_wildcard(s) {
                    Err(TopicError::ContainsWildChar)
                } else if Self::is_internal(s) {
                    Ok(Self::Internal(s.to_string()))
                } else {
                    Ok(Self::Normal(s.to_string()))
                }
            }
        }
    }

    const fn is_wildcard(&self) -> bool {
        matches!(self, Self::MultiWildcard | Self::SingleWildcard)
    }
}

/// Relation between two topic filters, used to decide whether a new
/// subscription replaces an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRelation {
    /// Same filter string level by level.
    Equal,

    /// The left filter matches everything the right one does.
    Subsumes,

    /// The right filter matches everything the left one does.
    Subsumed,

    /// Neither filter covers the other.
    Disjoint,
}

impl FilterRelation {
    /// True unless the two filters are unrelated.
    #[must_use]
    pub const fn overlaps(&self) -> bool {
        !matches!(self, Self::Disjoint)
    }
}

/// A parsed topic filter.
///
/// Keeps the source string for exact comparison plus the per-level token
/// sequence used for matching.
#[derive(Debug, Default, Clone, Eq)]
pub struct Topic {
    topic: String,
    parts: Vec<TopicPart>,
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.topic.eq(&other.topic)
    }
}

impl Topic {
    /// Parse a topic filter into per-level tokens.
    ///
    /// # Errors
    ///
    /// Returns error if `s` is empty, if `#` appears anywhere but the final
    /// level, or if a wildcard shares a level with other characters.
    pub fn parse(s: &str) -> Result<Self, TopicError> {
        validate_sub_topic(s)?;
        let parts = s
            .split('/')
            .map(TopicPart::parse)
            .collect::<Result<Vec<_>, TopicError>>()?;
        Ok(Self {
            topic: s.to_string(),
            parts,
        })
    }

    /// Get the source filter string.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Check whether a topic name matches this filter.
    ///
    /// `+` consumes exactly one level. `#` consumes the remainder including
    /// zero levels, so `sport/#` also matches `sport`. A topic whose first
    /// level starts with `$` only matches a filter whose first level spells
    /// it out literally [MQTT-4.7.2-1].
    #[must_use]
    pub fn is_match(&self, topic_name: &str) -> bool {
        let levels: Vec<&str> = topic_name.split('/').collect();

        if let Some(first) = levels.first() {
            if first.starts_with('$') && self.parts[0].is_wildcard() {
                return false;
            }
        }

        for (index, part) in self.parts.iter().enumerate() {
            match part {
                TopicPart::MultiWildcard => return true,
                TopicPart::SingleWildcard => {
                    if index >= levels.len() {
                        return false;
                    }
                }
                TopicPart::Normal(s) | TopicPart::Internal(s) => {
                    if levels.get(index) != Some(&s.as_str()) {
                        return false;
                    }
                }
                TopicPart::Empty => {
                    if levels.get(index) != Some(&"") {
                        return false;
                    }
                }
            }
        }

        self.parts.len() == levels.len()
    }

    /// Compare two filters for subscription replacement.
    ///
    /// Subsumption is tested by matching level sequences in both directions.
    #[must_use]
    pub fn compare(&self, other: &Self) -> FilterRelation {
        if self.parts == other.parts {
            return FilterRelation::Equal;
        }
        if Self::covers(&self.parts, &other.parts) {
            return FilterRelation::Subsumes;
        }
        if Self::covers(&other.parts, &self.parts) {
            return FilterRelation::Subsumed;
        }
        FilterRelation::Disjoint
    }

    /// Whether `filter` matches every level sequence `other` can match.
    fn covers(filter: &[TopicPart], other: &[TopicPart]) -> bool {
        for (index, part) in filter.iter().enumerate() {
            match part {
                TopicPart::MultiWildcard => return true,
                TopicPart::SingleWildcard => {
                    match other.get(index) {
                        // `+` covers any single level except `#`.
                        Some(TopicPart::MultiWildcard) | None => return false,
                        Some(_) => {}
                    }
                }
                literal => {
                    if other.get(index) != Some(literal) {
                        return false;
                    }
                }
            }
        }
        filter.len() == other.len()
    }
}

/// Validate a topic filter.
///
/// Rules are defined in MQTT chapter 4.7, Topic Names and Topic Filters:
/// `#` must be the last character and preceded by `/` (or alone); `+` must
/// occupy a whole level.
///
/// # Errors
///
/// Returns error if the filter violates the grammar.
pub fn validate_sub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooManyData);
    }
    if topic == "#" {
        return Ok(());
    }

    let bytes = topic.as_bytes();
    for (index, b) in bytes.iter().enumerate() {
        match b {
            b'#' => {
                if index != bytes.len() - 1 {
                    return Err(TopicError::InvalidChar);
                }
                if index > 0 && bytes[index - 1] != b'/' {
                    return Err(TopicError::InvalidChar);
                }
            }
            b'+' => {
                if index > 0 && bytes[index - 1] != b'/' {
                    return Err(TopicError::InvalidChar);
                }
                if index + 1 < bytes.len() && bytes[index + 1] != b'/' {
                    return Err(TopicError::InvalidChar);
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Validate a topic name: non-empty, below the length prefix limit, and free
/// of wildcard characters [MQTT-3.3.2-2].
///
/// # Errors
///
/// Returns error if `topic` cannot be published to.
pub fn validate_pub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooManyData);
    }
    if topic.contains(['#', '+']) {
        return Err(TopicError::InvalidChar);
    }
    Ok(())
}

/// Topic name in a PUBLISH packet. Wildcard free.
#[derive(
    Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct PubTopic(String);

impl PubTopic {
    /// Create a new topic name.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is empty or contains wildcards.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_pub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<PubTopic> for String {
    fn from(topic: PubTopic) -> Self {
        topic.0
    }
}

impl TryFrom<String> for PubTopic {
    type Error = TopicError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        validate_pub_topic(&s)?;
        Ok(Self(s))
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        validate_pub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

/// Topic filter in a SUBSCRIBE/UNSUBSCRIBE packet. May contain wildcards.
#[derive(
    Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct SubTopic(String);

impl SubTopic {
    /// Create a new topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` violates the filter grammar.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_sub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<SubTopic> for String {
    fn from(topic: SubTopic) -> Self {
        topic.0
    }
}

impl TryFrom<String> for SubTopic {
    type Error = TopicError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        validate_sub_topic(&s)?;
        Ok(Self(s))
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        validate_sub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(filter: &str, topic: &str) -> bool {
        Topic::parse(filter).unwrap().is_match(topic)
    }

    #[test]
    fn test_filter_validity() {
        assert!(Topic::parse("#").is_ok());
        assert!(Topic::parse("+").is_ok());
        assert!(Topic::parse("+/tennis/#").is_ok());
        assert!(Topic::parse("sport/+/player1").is_ok());
        assert!(Topic::parse("sport/tennis/#").is_ok());

        assert!(Topic::parse("").is_err());
        assert!(Topic::parse("sport#").is_err());
        assert!(Topic::parse("sport+").is_err());
        assert!(Topic::parse("sport/tennis#").is_err());
        assert!(Topic::parse("sport/tennis/#/ranking").is_err());
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("sport/tennis/player1/#", "sport/tennis/player1"));
        assert!(matches(
            "sport/tennis/player1/#",
            "sport/tennis/player1/ranking"
        ));
        assert!(matches(
            "sport/tennis/player1/#",
            "sport/tennis/player1/score/wimbledon"
        ));

        // `#` includes the parent level.
        assert!(matches("sport/#", "sport"));
        assert!(matches("#", "sport/tennis"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("sport/tennis/+", "sport/tennis/player1"));
        assert!(!matches("sport/tennis/+", "sport/tennis/player1/ranking"));
        assert!(matches("+/tennis/#", "sport/tennis/player1/score/wimbledon"));

        // `+` matches exactly one level, which may be empty.
        assert!(!matches("sport/+", "sport"));
        assert!(matches("sport/+", "sport/"));
        assert!(matches("+/+", "/finance"));
        assert!(matches("/+", "/finance"));
        assert!(!matches("+", "/finance"));
    }

    #[test]
    fn test_internal_topics() {
        assert!(!matches("#", "$SYS/monitor/Clients"));
        assert!(!matches("+/monitor/Clients", "$SYS/monitor/Clients"));
        assert!(matches("$SYS/#", "$SYS/"));
        assert!(matches("$SYS/monitor/+", "$SYS/monitor/Clients"));
    }

    #[test]
    fn test_pub_topic_rejects_wildcards() {
        assert!(PubTopic::new("sport/tennis/player1").is_ok());
        assert!(PubTopic::new("sport/tennis/#").is_err());
        assert!(PubTopic::new("sport/+").is_err());
        assert!(PubTopic::new("").is_err());
    }

    #[test]
    fn test_compare() {
        let a = Topic::parse("sport/#").unwrap();
        let b = Topic::parse("sport/tennis/+").unwrap();
        assert_eq!(a.compare(&b), FilterRelation::Subsumes);
        assert_eq!(b.compare(&a), FilterRelation::Subsumed);

        let c = Topic::parse("sport/tennis/+").unwrap();
        assert_eq!(b.compare(&c), FilterRelation::Equal);

        let d = Topic::parse("finance/+").unwrap();
        assert_eq!(a.compare(&d), FilterRelation::Disjoint);
        assert!(!a.compare(&d).overlaps());

        let e = Topic::parse("sport/+").unwrap();
        let f = Topic::parse("sport/tennis").unwrap();
        assert_eq!(e.compare(&f), FilterRelation::Subsumes);
    }
}

//! Hierarchical routing keys: `{domain}/{aggregate_type}/{aggregate_id}`.
//!
//! Subscribers select topics with slash-delimited patterns where `*` matches
//! exactly one segment and `**` matches zero or more segments:
//!
//! | pattern                  | matches                                   |
//! |--------------------------|-------------------------------------------|
//! | `**`                     | every topic                               |
//! | `banking/**`             | every banking aggregate                   |
//! | `*/task/*`               | every task, whatever its domain           |
//! | `metrics/counter/c-1`    | that single counter                       |

use std::sync::Arc;

use eventide_core::AggregateRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Event;

/// Concrete topic an event is published on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(domain: &str, aggregate_ref: &AggregateRef) -> Self {
        Self(format!(
            "{domain}/{}/{}",
            aggregate_ref.aggregate_type(),
            aggregate_ref.aggregate_id()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps an aggregate to the topic its events are published on.
///
/// The relay (publishing) and the stream manager (filtering replayed history)
/// must agree on this mapping, so both are handed the same resolver.
pub trait TopicResolver: Send + Sync {
    fn topic_for(&self, aggregate_ref: &AggregateRef) -> Topic;

    fn topic_of(&self, event: &Event) -> Topic {
        self.topic_for(&event.aggregate_ref)
    }
}

impl<R: TopicResolver + ?Sized> TopicResolver for Arc<R> {
    fn topic_for(&self, aggregate_ref: &AggregateRef) -> Topic {
        (**self).topic_for(aggregate_ref)
    }
}

/// Resolver that places every aggregate under one domain segment.
#[derive(Debug, Clone)]
pub struct FixedDomain(pub String);

impl FixedDomain {
    pub fn new(domain: impl Into<String>) -> Self {
        Self(domain.into())
    }
}

impl TopicResolver for FixedDomain {
    fn topic_for(&self, aggregate_ref: &AggregateRef) -> Topic {
        Topic::new(&self.0, aggregate_ref)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("subscription pattern must not be empty")]
    Empty,

    #[error("subscription pattern {pattern:?} has an empty segment")]
    EmptySegment { pattern: String },

    #[error("subscription pattern {pattern:?}: wildcard must be a whole segment, got {segment:?}")]
    PartialWildcard { pattern: String, segment: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    /// `*`
    One,
    /// `**`
    Many,
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl SubscriptionPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let mut segments = Vec::new();
        for segment in pattern.split('/') {
            let parsed = match segment {
                "" => {
                    return Err(PatternError::EmptySegment {
                        pattern: pattern.to_string(),
                    });
                }
                "*" => Segment::One,
                "**" => Segment::Many,
                s if s.contains('*') => {
                    return Err(PatternError::PartialWildcard {
                        pattern: pattern.to_string(),
                        segment: s.to_string(),
                    });
                }
                s => Segment::Literal(s.to_string()),
            };
            // Consecutive `**` are equivalent to one.
            if parsed == Segment::Many && segments.last() == Some(&Segment::Many) {
                continue;
            }
            segments.push(parsed);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// `**`: every topic.
    pub fn all() -> Self {
        Self {
            raw: "**".to_string(),
            segments: vec![Segment::Many],
        }
    }

    /// Exactly one aggregate's topic.
    pub fn exact(topic: &Topic) -> Self {
        Self {
            raw: topic.as_str().to_string(),
            segments: topic
                .segments()
                .map(|s| Segment::Literal(s.to_string()))
                .collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        let topic: Vec<&str> = topic.segments().collect();
        match_segments(&self.segments, &topic)
    }
}

fn match_segments(pattern: &[Segment], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((Segment::Many, rest)) => {
            (0..=topic.len()).any(|skip| match_segments(rest, &topic[skip..]))
        }
        Some((Segment::One, rest)) => !topic.is_empty() && match_segments(rest, &topic[1..]),
        Some((Segment::Literal(lit), rest)) => {
            topic.first() == Some(&lit.as_str()) && match_segments(rest, &topic[1..])
        }
    }
}

impl core::fmt::Display for SubscriptionPattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl core::str::FromStr for SubscriptionPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn topic(domain: &str, ty: &str, id: &str) -> Topic {
        Topic::new(domain, &AggregateRef::new(ty, id).unwrap())
    }

    #[test]
    fn pattern_table() {
        let t = topic("banking", "account", "a-1");
        let cases = [
            ("**", true),
            ("banking/**", true),
            ("banking/account/**", true),
            ("banking/account/a-1/**", true),
            ("banking/account/a-1", true),
            ("banking/*/a-1", true),
            ("*/*/*", true),
            ("**/a-1", true),
            ("**/account/**", true),
            ("banking/*", false),
            ("*/*", false),
            ("*/*/*/*", false),
            ("metrics/**", false),
            ("banking/account/a-2", false),
            ("**/task/**", false),
        ];
        for (pattern, expected) in cases {
            let p = SubscriptionPattern::parse(pattern).unwrap();
            assert_eq!(p.matches(&t), expected, "pattern {pattern}");
        }
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert_eq!(SubscriptionPattern::parse(""), Err(PatternError::Empty));
        assert!(matches!(
            SubscriptionPattern::parse("banking//a"),
            Err(PatternError::EmptySegment { .. })
        ));
        assert!(matches!(
            SubscriptionPattern::parse("bank*/account"),
            Err(PatternError::PartialWildcard { .. })
        ));
        assert!(matches!(
            SubscriptionPattern::parse("banking/***"),
            Err(PatternError::PartialWildcard { .. })
        ));
    }

    #[test]
    fn exact_pattern_matches_only_its_topic() {
        let t = topic("work", "task", "t-9");
        let p = SubscriptionPattern::exact(&t);
        assert!(p.matches(&t));
        assert!(!p.matches(&topic("work", "task", "t-10")));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 500, ..ProptestConfig::default() })]

        #[test]
        fn double_star_matches_any_topic(
            domain in "[a-z]{1,8}",
            ty in "[a-z]{1,8}",
            id in "[a-z0-9-]{1,12}",
        ) {
            let t = topic(&domain, &ty, &id);
            prop_assert!(SubscriptionPattern::all().matches(&t));
            let domain_pattern = SubscriptionPattern::parse(&format!("{domain}/**")).unwrap();
            prop_assert!(domain_pattern.matches(&t));
            prop_assert!(SubscriptionPattern::parse("*/*/*").unwrap().matches(&t));
        }
    }
}

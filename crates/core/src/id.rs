//! Aggregate identity.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifies one aggregate instance: `{aggregate_type}/{aggregate_id}`.
///
/// Both parts become topic segments on the distribution bus, so they must be
/// non-empty and must not contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawAggregateRef", into = "RawAggregateRef")]
pub struct AggregateRef {
    aggregate_type: String,
    aggregate_id: String,
}

#[derive(Serialize, Deserialize)]
struct RawAggregateRef {
    aggregate_type: String,
    aggregate_id: String,
}

impl AggregateRef {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let aggregate_type = aggregate_type.into();
        let aggregate_id = aggregate_id.into();
        validate_segment("aggregate_type", &aggregate_type)?;
        validate_segment("aggregate_id", &aggregate_id)?;
        Ok(Self {
            aggregate_type,
            aggregate_id,
        })
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }
}

fn validate_segment(name: &str, value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::invalid_id(format!("{name} must not be empty")));
    }
    if value.contains('/') {
        return Err(DomainError::invalid_id(format!(
            "{name} must not contain '/': {value}"
        )));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(DomainError::invalid_id(format!(
            "{name} must not contain whitespace: {value:?}"
        )));
    }
    Ok(())
}

impl core::fmt::Display for AggregateRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.aggregate_id)
    }
}

impl FromStr for AggregateRef {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (aggregate_type, aggregate_id) = s
            .split_once('/')
            .ok_or_else(|| DomainError::invalid_id(format!("expected type/id, got {s:?}")))?;
        Self::new(aggregate_type, aggregate_id)
    }
}

impl TryFrom<RawAggregateRef> for AggregateRef {
    type Error = DomainError;

    fn try_from(raw: RawAggregateRef) -> Result<Self, Self::Error> {
        Self::new(raw.aggregate_type, raw.aggregate_id)
    }
}

impl From<AggregateRef> for RawAggregateRef {
    fn from(value: AggregateRef) -> Self {
        Self {
            aggregate_type: value.aggregate_type,
            aggregate_id: value.aggregate_id,
        }
    }
}

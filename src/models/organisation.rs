//! Reference data the aggregates are keyed by.

use serde::{Deserialize, Serialize};

/// An organisation that owns collections of tracked URLs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Organisation {
    pub id: i64,
    pub name: String,
}

/// A named group of URL patterns.
///
/// Collections without an organisation are ignored by every aggregation job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub organisation_id: Option<i64>,
}

/// A group of organisations reported on together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Program {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

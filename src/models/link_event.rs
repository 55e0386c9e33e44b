//! Raw link-change event data structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Whether a link was added to or removed from a page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Removed,
    Added,
}

impl ChangeKind {
    /// Integer stored in the `change` column.
    pub fn as_db(self) -> i64 {
        match self {
            ChangeKind::Removed => 0,
            ChangeKind::Added => 1,
        }
    }

    /// Parse the integer stored in the `change` column.
    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(ChangeKind::Removed),
            1 => Some(ChangeKind::Added),
            _ => None,
        }
    }
}

/// A stored link-change event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkEvent {
    /// Surrogate primary key
    pub id: i64,

    /// The external link that changed
    pub link: String,

    /// When the edit happened (UTC)
    pub timestamp: DateTime<Utc>,

    /// Project domain, e.g. `en.wikipedia.org`
    pub domain: String,

    /// Username of the editor (anonymous edits have none)
    pub username: Option<String>,

    /// Upstream user id (IP edits have none)
    pub user_id: Option<u32>,

    /// Revision id (page moves have none)
    pub rev_id: Option<u32>,

    pub page_title: String,
    pub page_namespace: i32,

    /// Upstream stream event id
    pub event_id: String,

    pub user_is_bot: bool,

    /// `sha256(link + event_id)` as lowercase hex
    pub hash_link_event_id: String,

    pub change: ChangeKind,

    /// Editor is on the user list of the organisation tracking the link
    pub on_user_list: bool,

    /// Ids of the URL patterns this event was tagged with
    pub url_patterns: Vec<i64>,
}

/// An event as handed over by the ingestion collaborator, before storage.
#[derive(Debug, Clone)]
pub struct NewLinkEvent {
    pub link: String,
    pub timestamp: DateTime<Utc>,
    pub domain: String,
    pub username: Option<String>,
    pub user_id: Option<u32>,
    pub rev_id: Option<u32>,
    pub page_title: String,
    pub page_namespace: i32,
    pub event_id: String,
    pub user_is_bot: bool,
    pub change: ChangeKind,
    pub on_user_list: bool,
}

impl NewLinkEvent {
    /// Content hash used for de-duplication and auditing.
    pub fn hash(&self) -> String {
        hash_link_event_id(&self.link, &self.event_id)
    }
}

/// Compute `hex(sha256(link + event_id))`.
pub fn hash_link_event_id(link: &str, event_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(link.as_bytes());
    hasher.update(event_id.as_bytes());
    hex::encode(hasher.finalize())
}

//! Core protocol types: events, tags, and relay filters
//!
//! Events are immutable once received. Nothing in this crate hands out a
//! mutable reference to a fetched event; transformations build new values.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// EVENT KINDS
// =============================================================================

/// Event kinds the client understands.
pub mod kinds {
    /// User metadata
    pub const METADATA: u32 = 0;
    /// Text note (community posts are text notes with an `a` tag)
    pub const TEXT_NOTE: u32 = 1;
    /// Channel creation
    pub const CHANNEL_CREATION: u32 = 40;
    /// Channel metadata update
    pub const CHANNEL_METADATA: u32 = 41;
    /// Channel message
    pub const CHANNEL_MESSAGE: u32 = 42;
    /// Group key bundle (parameterized replaceable, `d` = `<uri>:keys`)
    pub const GROUP_KEYS: u32 = 30078;
    /// Community definition
    pub const COMMUNITY_DEFINITION: u32 = 34550;
}

// =============================================================================
// TAGS
// =============================================================================

/// A tag: an ordered list of strings whose first element names the tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from its parts
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Tag name (`"d"`, `"p"`, `"scp"`, ...)
    pub fn name(&self) -> Option<&str> {
        self.get(0)
    }

    /// First value after the name
    pub fn value(&self) -> Option<&str> {
        self.get(1)
    }

    /// Element at position `index`
    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// A signed protocol event as published by relays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolEvent {
    /// Event identifier (hex)
    pub id: String,
    /// Author public key (hex)
    pub pubkey: String,
    /// Unix timestamp (seconds)
    pub created_at: u64,
    /// Semantic type, see [`kinds`]
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
    /// Signature over the event hash (opaque to this crate)
    pub sig: String,
}

impl ProtocolEvent {
    /// Value of the first tag named `name`
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// All tags named `name`
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags.iter().filter(move |t| t.name() == Some(name))
    }

    /// The `d` tag identifier of a parameterized replaceable event
    pub fn identifier(&self) -> Option<&str> {
        self.tag_value("d")
    }
}

/// Event body before signing. The external signer turns it into a
/// [`ProtocolEvent`] by computing `id` and `sig`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// New event stamped with the current time
    pub fn new(pubkey: impl Into<String>, kind: u32, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at: unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// =============================================================================
// FILTERS
// =============================================================================

/// Relay subscription filter.
///
/// Tag filters are keyed with their `#` prefix (`"#d"`, `"#a"`) and flattened
/// into the filter object on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Add a tag filter, e.g. `tag('d', ["slug"])` becomes `"#d": ["slug"]`
    pub fn tag<I, S>(mut self, name: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .insert(format!("#{name}"), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One element of a fetch: either a plain filter or a relay-side cached
/// query (`{"cache": [event_type, params]}`).
#[derive(Debug, Clone, PartialEq)]
pub enum FetchRequest {
    Filter(Filter),
    Cached {
        event_type: String,
        params: serde_json::Value,
    },
}

impl From<Filter> for FetchRequest {
    fn from(filter: Filter) -> Self {
        Self::Filter(filter)
    }
}

impl Serialize for FetchRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Filter(filter) => filter.serialize(serializer),
            Self::Cached { event_type, params } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("cache", &(event_type, params))?;
                map.end()
            }
        }
    }
}

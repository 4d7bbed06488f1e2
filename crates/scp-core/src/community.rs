//! Community and channel descriptors, and the `scp` tag carrying their key data
//!
//! An `scp` tag has the form `["scp", "<standard id>", "<json payload>"]`.

use crate::error::{Error, Result};
use crate::types::{kinds, ProtocolEvent, Tag};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Standard ids used in `scp` tags
pub mod standard {
    pub const COMMUNITY: &str = "1";
    pub const COMMUNITY_POST: &str = "2";
    pub const CHANNEL: &str = "3";
    pub const CHANNEL_MESSAGE: &str = "4";
}

/// Decode the payload of the first `scp` tag with the given standard id.
///
/// Returns `None` when the tag is absent or its payload does not parse.
pub fn extract_scp_data<T: DeserializeOwned>(event: &ProtocolEvent, standard_id: &str) -> Option<T> {
    event
        .tags_named("scp")
        .find(|t| t.get(1) == Some(standard_id))
        .and_then(|t| t.get(2))
        .and_then(|payload| serde_json::from_str(payload).ok())
}

/// Build an `scp` tag for `data`.
pub fn scp_tag<T: Serialize>(standard_id: &str, data: &T) -> Result<Tag> {
    Ok(Tag(vec![
        "scp".to_string(),
        standard_id.to_string(),
        serde_json::to_string(data)?,
    ]))
}

// =============================================================================
// URIS
// =============================================================================

/// `34550:<creator pubkey>:<community id>`
pub fn community_uri(creator_id: &str, community_id: &str) -> String {
    format!("{}:{}:{}", kinds::COMMUNITY_DEFINITION, creator_id, community_id)
}

/// `40:<channel event id>`
pub fn channel_uri(channel_id: &str) -> String {
    format!("{}:{}", kinds::CHANNEL_CREATION, channel_id)
}

/// Creator and id parsed back out of a community URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunityRef {
    pub creator_id: String,
    pub community_id: String,
}

/// Parse a community URI. The community id may itself contain `:`.
pub fn parse_community_uri(uri: &str) -> Result<CommunityRef> {
    let mut parts = uri.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(creator), Some(id))
            if kind == kinds::COMMUNITY_DEFINITION.to_string() && !creator.is_empty() && !id.is_empty() =>
        {
            Ok(CommunityRef {
                creator_id: creator.to_string(),
                community_id: id.to_string(),
            })
        }
        _ => Err(Error::InvalidUri(uri.to_string())),
    }
}

// =============================================================================
// POSTS AND MESSAGES
// =============================================================================

/// `scp` payload attached to a protected community post or channel message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentScpData {
    /// Single-use content secret wrapped to the group public key
    pub encrypted_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// Decrypted body of protected content. The embedded group identifier is
/// checked against the descriptor the key was recovered for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub message: String,
}

/// Community a post belongs to: the `scp` payload wins, otherwise the first
/// `a` tag pointing at a community definition.
pub fn retrieve_community_uri(event: &ProtocolEvent, scp: Option<&ContentScpData>) -> Option<String> {
    if let Some(uri) = scp.and_then(|s| s.community_uri.clone()) {
        return Some(uri);
    }
    let prefix = format!("{}:", kinds::COMMUNITY_DEFINITION);
    event
        .tags_named("a")
        .filter_map(Tag::value)
        .find(|v| v.starts_with(&prefix))
        .map(str::to_string)
}

// =============================================================================
// COMMUNITIES
// =============================================================================

/// Who may read a community's posts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipType {
    #[default]
    Open,
    Protected,
    #[serde(rename = "NFTExclusive")]
    NftExclusive,
    InviteOnly,
}

/// `scp` payload of a community definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityScpData {
    /// Group public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gatekeeper_public_key: Option<String>,
    /// Group secret wrapped between creator and gatekeeper
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
    #[serde(default)]
    pub membership_type: MembershipType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gatekeeper_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_relay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_event_id: Option<String>,
}

/// A community as seen by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunityInfo {
    pub creator_id: String,
    pub community_id: String,
    pub community_uri: String,
    pub description: Option<String>,
    pub scp_data: CommunityScpData,
    /// Wrapped group secrets from the key bundle event, when fetched
    pub member_key_map: Option<BTreeMap<String, String>>,
}

impl CommunityInfo {
    pub fn new(creator_id: impl Into<String>, community_id: impl Into<String>, scp_data: CommunityScpData) -> Self {
        let creator_id = creator_id.into();
        let community_id = community_id.into();
        Self {
            community_uri: community_uri(&creator_id, &community_id),
            creator_id,
            community_id,
            description: None,
            scp_data,
            member_key_map: None,
        }
    }

    /// Parse a community definition event
    pub fn from_event(event: &ProtocolEvent) -> Result<Self> {
        if event.kind != kinds::COMMUNITY_DEFINITION {
            return Err(Error::UnexpectedKind {
                expected: kinds::COMMUNITY_DEFINITION,
                actual: event.kind,
            });
        }
        let community_id = event
            .identifier()
            .ok_or_else(|| Error::MissingField("d".into()))?;
        let scp_data = extract_scp_data(event, standard::COMMUNITY).unwrap_or_default();

        let mut info = Self::new(event.pubkey.clone(), community_id, scp_data);
        info.description = event.tag_value("description").map(str::to_string);
        Ok(info)
    }

    /// Tags for publishing this community definition
    pub fn to_tags(&self) -> Result<Vec<Tag>> {
        let mut tags = vec![Tag::new(["d", self.community_id.as_str()])];
        if let Some(description) = &self.description {
            tags.push(Tag::new(["description", description.as_str()]));
        }
        tags.push(scp_tag(standard::COMMUNITY, &self.scp_data)?);
        Ok(tags)
    }

    pub fn membership_type(&self) -> MembershipType {
        self.scp_data.membership_type
    }

    pub fn is_open(&self) -> bool {
        self.membership_type() == MembershipType::Open
    }

    /// Wrapped group secret for the gatekeeper: the inline `encryptedKey`, or
    /// the gatekeeper's entry in the member key map.
    pub fn gatekeeper_encrypted_key(&self) -> Option<&str> {
        if let Some(key) = self.scp_data.encrypted_key.as_deref() {
            return Some(key);
        }
        let gatekeeper = self.scp_data.gatekeeper_public_key.as_deref()?;
        self.member_key_map
            .as_ref()
            .and_then(|m| m.get(gatekeeper))
            .map(String::as_str)
    }

    /// Endpoint that serves post keys for this community
    pub fn key_endpoint<'a>(&'a self, default: Option<&'a str>) -> Option<&'a str> {
        self.scp_data
            .private_relay
            .as_deref()
            .or(self.scp_data.gatekeeper_url.as_deref())
            .or(default)
    }

    pub fn with_member_keys(mut self, member_keys: BTreeMap<String, String>) -> Self {
        self.member_key_map = Some(member_keys);
        self
    }
}

// =============================================================================
// CHANNELS
// =============================================================================

/// `scp` payload of a channel definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelScpData {
    /// Group public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Set when the channel is backed by a community's group key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_uri: Option<String>,
}

/// Channel metadata carried in the creation event content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
}

/// A channel as seen by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel creation event id
    pub id: String,
    pub creator_id: String,
    pub metadata: ChannelMetadata,
    pub scp_data: ChannelScpData,
    pub member_key_map: Option<BTreeMap<String, String>>,
}

impl ChannelInfo {
    pub fn channel_uri(&self) -> String {
        channel_uri(&self.id)
    }

    /// Parse a channel creation event
    pub fn from_event(event: &ProtocolEvent) -> Result<Self> {
        if event.kind != kinds::CHANNEL_CREATION {
            return Err(Error::UnexpectedKind {
                expected: kinds::CHANNEL_CREATION,
                actual: event.kind,
            });
        }
        let metadata = if event.content.trim().is_empty() {
            ChannelMetadata::default()
        } else {
            serde_json::from_str(&event.content)?
        };
        Ok(Self {
            id: event.id.clone(),
            creator_id: event.pubkey.clone(),
            metadata,
            scp_data: extract_scp_data(event, standard::CHANNEL).unwrap_or_default(),
            member_key_map: None,
        })
    }

    pub fn with_member_keys(mut self, member_keys: BTreeMap<String, String>) -> Self {
        self.member_key_map = Some(member_keys);
        self
    }
}

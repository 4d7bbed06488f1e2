//! Content key recovery for protected posts and channel messages
//!
//! Paths are tried in a fixed order and the first success wins:
//!
//! 1. Self-authored: the author unwraps their own content key against the
//!    group public key. No network.
//! 2. Local group key: the group secret is recoverable by the gatekeeper,
//!    the creator or a channel member. The content key is unwrapped with it,
//!    the content decrypted and its embedded group identifier checked.
//! 3. Gatekeeper: unresolved events are grouped by key endpoint and each
//!    endpoint is asked once, all endpoints concurrently.
//!
//! Crypto failures on paths 1 and 2 are reported as [`KeyRecovery`] values,
//! never as errors.

use crate::error::Result;
use crate::gatekeeper::{ChannelKeysQuery, GatekeeperClient, KeyMap, NoteKeysQuery, PostKeysQuery};
use crate::session::Session;
use futures::future::join_all;
use scp_core::community::{
    extract_scp_data, retrieve_community_uri, standard, ChannelInfo, CommunityInfo, ContentScpData, ProtectedBody,
};
use scp_core::vault::{open_with_content_key, unwrap_secret};
use scp_core::{kinds, ProtocolEvent, PublicKey, SecretKey};
use scp_net::FetchFacade;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one recovery path
#[derive(Debug, Clone)]
pub enum KeyRecovery {
    Recovered(SecretKey),
    /// The path applied but its key material did not open the content
    PathFailed,
    /// Nothing this caller holds applies
    Denied,
}

impl KeyRecovery {
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered(_))
    }

    pub fn key(self) -> Option<SecretKey> {
        match self {
            Self::Recovered(key) => Some(key),
            _ => None,
        }
    }
}

/// The group protected content was written for
#[derive(Debug, Clone, Copy)]
pub enum GroupDescriptor<'a> {
    Community(&'a CommunityInfo),
    /// A channel, optionally sealed with its community's key
    Channel {
        channel: &'a ChannelInfo,
        community: Option<&'a CommunityInfo>,
    },
}

impl<'a> GroupDescriptor<'a> {
    fn group_public_key(&self) -> Option<PublicKey> {
        let hex_key = match self {
            Self::Community(community) => community.scp_data.public_key.as_deref(),
            Self::Channel { channel, community } => channel
                .scp_data
                .public_key
                .as_deref()
                .or_else(|| community.and_then(|c| c.scp_data.public_key.as_deref())),
        }?;
        PublicKey::from_hex(hex_key).ok()
    }

    fn identifier_matches(&self, body: &ProtectedBody) -> bool {
        match self {
            Self::Community(community) => body.community_uri.as_deref() == Some(community.community_uri.as_str()),
            Self::Channel { channel, .. } => body.channel_id.as_deref() == Some(channel.id.as_str()),
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Community(community) => community.community_uri.clone(),
            Self::Channel { channel, .. } => channel.channel_uri(),
        }
    }
}

/// `scp` payload of a protected post or channel message
pub fn content_scp_data(event: &ProtocolEvent) -> Option<ContentScpData> {
    let standard_id = if event.kind == kinds::CHANNEL_MESSAGE {
        standard::CHANNEL_MESSAGE
    } else {
        standard::COMMUNITY_POST
    };
    extract_scp_data(event, standard_id)
}

fn author_key(event: &ProtocolEvent) -> Option<PublicKey> {
    PublicKey::from_hex(&event.pubkey).ok()
}

/// Path 1
pub fn recover_self_authored(session: &Session, event: &ProtocolEvent, group: GroupDescriptor<'_>) -> KeyRecovery {
    if !session.is(&event.pubkey) {
        return KeyRecovery::Denied;
    }
    let (Some(group_public), Some(scp)) = (group.group_public_key(), content_scp_data(event)) else {
        return KeyRecovery::Denied;
    };
    match unwrap_secret(session.secret(), &group_public, &scp.encrypted_key) {
        Ok(key) => KeyRecovery::Recovered(key),
        Err(err) => {
            debug!(event_id = %event.id, error = %err, "self-authored key did not unwrap");
            KeyRecovery::PathFailed
        }
    }
}

fn unwrap_with(session: &Session, counterpart: Option<&str>, wrapped: Option<&str>) -> KeyRecovery {
    let (Some(counterpart), Some(wrapped)) = (counterpart.and_then(|k| PublicKey::from_hex(k).ok()), wrapped) else {
        return KeyRecovery::Denied;
    };
    match unwrap_secret(session.secret(), &counterpart, wrapped) {
        Ok(secret) => KeyRecovery::Recovered(secret),
        Err(err) => {
            debug!(error = %err, "group secret did not unwrap");
            KeyRecovery::PathFailed
        }
    }
}

/// The group secret, when this caller holds it: as the community's
/// gatekeeper, as its creator, or as a member of a standalone channel
pub fn recover_group_secret(session: &Session, group: GroupDescriptor<'_>) -> KeyRecovery {
    match group {
        GroupDescriptor::Community(community) => {
            let gatekeeper = community.scp_data.gatekeeper_public_key.as_deref();
            let wrapped = community.gatekeeper_encrypted_key();
            if gatekeeper.is_some_and(|g| session.is(g)) {
                unwrap_with(session, Some(community.creator_id.as_str()), wrapped)
            } else if session.is(&community.creator_id) {
                unwrap_with(session, gatekeeper, wrapped)
            } else {
                KeyRecovery::Denied
            }
        }
        GroupDescriptor::Channel {
            community: Some(community),
            ..
        } => recover_group_secret(session, GroupDescriptor::Community(community)),
        GroupDescriptor::Channel { channel, community: None } => {
            let wrapped = channel
                .member_key_map
                .as_ref()
                .and_then(|keys| keys.get(&session.pubkey_hex()))
                .map(String::as_str);
            unwrap_with(session, Some(channel.creator_id.as_str()), wrapped)
        }
    }
}

/// Path 2 given the group secret
pub fn recover_with_group_key(group_secret: &SecretKey, event: &ProtocolEvent, group: GroupDescriptor<'_>) -> KeyRecovery {
    let (Some(author), Some(scp)) = (author_key(event), content_scp_data(event)) else {
        return KeyRecovery::Denied;
    };
    let opened = unwrap_secret(group_secret, &author, &scp.encrypted_key).and_then(|content_key| {
        let plaintext = open_with_content_key(&content_key, &author, &event.content)?;
        Ok((content_key, plaintext))
    });
    let (content_key, plaintext) = match opened {
        Ok(opened) => opened,
        Err(err) => {
            debug!(event_id = %event.id, error = %err, "group key did not open content");
            return KeyRecovery::PathFailed;
        }
    };
    match serde_json::from_str::<ProtectedBody>(&plaintext) {
        Ok(body) if group.identifier_matches(&body) => KeyRecovery::Recovered(content_key),
        Ok(_) => {
            warn!(event_id = %event.id, group = %group.label(), "content names a different group");
            KeyRecovery::PathFailed
        }
        Err(err) => {
            debug!(event_id = %event.id, error = %err, "decrypted content is not a protected body");
            KeyRecovery::PathFailed
        }
    }
}

/// Decrypt protected content with a recovered content key
pub fn open_content(event: &ProtocolEvent, content_key: &SecretKey) -> Result<ProtectedBody> {
    let author = PublicKey::from_hex(&event.pubkey)?;
    let plaintext = open_with_content_key(content_key, &author, &event.content)?;
    Ok(serde_json::from_str(&plaintext)?)
}

/// Time window for community post keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostKeysWindow {
    pub since: Option<u64>,
    pub until: Option<u64>,
}

pub struct AccessResolver {
    gatekeeper: GatekeeperClient,
    default_gatekeeper: Option<String>,
}

impl AccessResolver {
    pub fn new(facade: Arc<FetchFacade>, default_gatekeeper: Option<String>) -> Self {
        Self {
            gatekeeper: GatekeeperClient::new(facade),
            default_gatekeeper,
        }
    }

    pub fn gatekeeper(&self) -> &GatekeeperClient {
        &self.gatekeeper
    }

    /// Paths 1 and 2
    pub fn resolve_locally(&self, session: &Session, event: &ProtocolEvent, group: GroupDescriptor<'_>) -> KeyRecovery {
        let own = recover_self_authored(session, event, group);
        if own.is_recovered() {
            return own;
        }
        let local = match recover_group_secret(session, group) {
            KeyRecovery::Recovered(group_secret) => recover_with_group_key(&group_secret, event, group),
            other => other,
        };
        match (own, local) {
            (_, KeyRecovery::Recovered(key)) => KeyRecovery::Recovered(key),
            (KeyRecovery::PathFailed, _) | (_, KeyRecovery::PathFailed) => KeyRecovery::PathFailed,
            _ => KeyRecovery::Denied,
        }
    }

    fn channel_gatekeeper<'a>(&'a self, community: Option<&'a CommunityInfo>) -> Option<&'a str> {
        community
            .and_then(|c| c.scp_data.gatekeeper_url.as_deref())
            .or(self.default_gatekeeper.as_deref())
    }

    /// All three paths for one event
    pub async fn resolve(
        &self,
        session: &Session,
        event: &ProtocolEvent,
        group: GroupDescriptor<'_>,
        message: &str,
    ) -> KeyRecovery {
        if let GroupDescriptor::Community(community) = group {
            if community.is_open() {
                return KeyRecovery::Denied;
            }
        }
        let local = self.resolve_locally(session, event, group);
        if local.is_recovered() {
            return local;
        }

        let remote = match group {
            GroupDescriptor::Community(community) => {
                let Some(endpoint) = community.key_endpoint(self.default_gatekeeper.as_deref()) else {
                    return local;
                };
                self.gatekeeper
                    .note_keys(session, endpoint, &NoteKeysQuery::new(&[&event.id], message))
                    .await
            }
            GroupDescriptor::Channel { channel, community } => {
                let Some(gatekeeper_url) = self.channel_gatekeeper(community) else {
                    return local;
                };
                self.gatekeeper
                    .channel_message_keys(session, gatekeeper_url, &channel_keys_query(channel, message))
                    .await
            }
        };
        match remote {
            Ok(keys) => match keys.get(&event.id).map(|k| SecretKey::from_hex(k)) {
                Some(Ok(key)) => KeyRecovery::Recovered(key),
                Some(Err(err)) => {
                    warn!(event_id = %event.id, error = %err, "gatekeeper returned an unusable key");
                    KeyRecovery::PathFailed
                }
                None => KeyRecovery::Denied,
            },
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "gatekeeper unavailable");
                local
            }
        }
    }

    /// Content keys for a batch of community posts, keyed by event id.
    ///
    /// Posts whose community is unknown or open are skipped. The rest are
    /// resolved locally where possible; the remainder go to their key
    /// endpoints, one request per endpoint. A failing endpoint contributes
    /// nothing and never hides the others.
    pub async fn retrieve_post_keys_by_events(
        &self,
        session: &Session,
        notes: &[ProtocolEvent],
        communities: &[CommunityInfo],
        message: &str,
    ) -> KeyMap {
        let mut keys = KeyMap::new();
        let mut by_endpoint: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for note in notes {
            let scp = content_scp_data(note);
            let Some(uri) = retrieve_community_uri(note, scp.as_ref()) else {
                continue;
            };
            let Some(community) = communities.iter().find(|c| c.community_uri == uri) else {
                debug!(event_id = %note.id, community = %uri, "community not loaded");
                continue;
            };
            if community.is_open() || scp.is_none() {
                continue;
            }
            match self.resolve_locally(session, note, GroupDescriptor::Community(community)) {
                KeyRecovery::Recovered(key) => {
                    keys.insert(note.id.clone(), key.to_hex());
                }
                _ => match community.key_endpoint(self.default_gatekeeper.as_deref()) {
                    Some(endpoint) => by_endpoint.entry(endpoint).or_default().push(note.id.as_str()),
                    None => debug!(event_id = %note.id, "no key endpoint"),
                },
            }
        }

        let local = keys.len();
        let requests = by_endpoint.iter().map(|(endpoint, ids)| async move {
            let query = NoteKeysQuery::new(ids.as_slice(), message);
            match self.gatekeeper.note_keys(session, endpoint, &query).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(endpoint, notes = ids.len(), error = %err, "gatekeeper unavailable");
                    KeyMap::new()
                }
            }
        });
        for found in join_all(requests).await {
            keys.extend(found);
        }
        info!(
            notes = notes.len(),
            local,
            endpoints = by_endpoint.len(),
            resolved = keys.len(),
            "post keys retrieved"
        );
        keys
    }

    /// Keys for every post of a community in a time window
    pub async fn retrieve_community_post_keys(
        &self,
        session: &Session,
        community: &CommunityInfo,
        window: PostKeysWindow,
        message: &str,
    ) -> KeyMap {
        let query = PostKeysQuery {
            creator_id: community.creator_id.clone(),
            community_id: community.community_id.clone(),
            message: message.to_string(),
            since: window.since,
            until: window.until,
            focused_note_id: None,
        };
        self.post_keys(session, community, &query).await
    }

    /// Keys for the posts of one thread
    pub async fn retrieve_community_thread_post_keys(
        &self,
        session: &Session,
        community: &CommunityInfo,
        focused_note_id: &str,
        window: PostKeysWindow,
        message: &str,
    ) -> KeyMap {
        let query = PostKeysQuery {
            creator_id: community.creator_id.clone(),
            community_id: community.community_id.clone(),
            message: message.to_string(),
            since: window.since,
            until: window.until,
            focused_note_id: Some(focused_note_id.to_string()),
        };
        self.post_keys(session, community, &query).await
    }

    async fn post_keys(&self, session: &Session, community: &CommunityInfo, query: &PostKeysQuery) -> KeyMap {
        if community.is_open() {
            return KeyMap::new();
        }
        let Some(endpoint) = community.key_endpoint(self.default_gatekeeper.as_deref()) else {
            debug!(community = %community.community_uri, "no key endpoint");
            return KeyMap::new();
        };
        match self.gatekeeper.post_keys(session, endpoint, query).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(endpoint, community = %community.community_uri, error = %err, "gatekeeper unavailable");
                KeyMap::new()
            }
        }
    }

    /// Content keys for channel messages. Messages this caller can open
    /// locally are resolved first; a gatekeeper is asked for the rest.
    pub async fn retrieve_channel_message_keys(
        &self,
        session: &Session,
        channel: &ChannelInfo,
        community: Option<&CommunityInfo>,
        messages: &[ProtocolEvent],
        message: &str,
    ) -> KeyMap {
        let group = GroupDescriptor::Channel { channel, community };
        let group_secret = recover_group_secret(session, group).key();

        let mut keys = KeyMap::new();
        let mut unresolved = 0usize;
        for event in messages {
            let scp = content_scp_data(event);
            if scp.as_ref().and_then(|s| s.channel_id.as_deref()) != Some(channel.id.as_str()) {
                continue;
            }
            let mut recovery = recover_self_authored(session, event, group);
            if !recovery.is_recovered() {
                if let Some(group_secret) = &group_secret {
                    recovery = recover_with_group_key(group_secret, event, group);
                }
            }
            match recovery {
                KeyRecovery::Recovered(key) => {
                    keys.insert(event.id.clone(), key.to_hex());
                }
                _ => unresolved += 1,
            }
        }

        if unresolved > 0 {
            if let Some(gatekeeper_url) = self.channel_gatekeeper(community) {
                let query = channel_keys_query(channel, message);
                match self.gatekeeper.channel_message_keys(session, gatekeeper_url, &query).await {
                    Ok(found) => {
                        for (id, key) in found {
                            keys.entry(id).or_insert(key);
                        }
                    }
                    Err(err) => warn!(gatekeeper_url, channel = %channel.id, error = %err, "gatekeeper unavailable"),
                }
            }
        }
        keys
    }
}

fn channel_keys_query(channel: &ChannelInfo, message: &str) -> ChannelKeysQuery {
    ChannelKeysQuery {
        creator_id: channel.creator_id.clone(),
        channel_id: channel.id.clone(),
        message: message.to_string(),
    }
}

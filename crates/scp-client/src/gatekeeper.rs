//! Gatekeeper service client
//!
//! A gatekeeper holds a community's group secret and hands out per-post keys
//! to members. Every request carries a caller-chosen `message`, its
//! signature and a bearer auth header.

use crate::error::{AccessError, Result};
use crate::session::Session;
use scp_net::FetchFacade;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Event id -> hex content key
pub type KeyMap = BTreeMap<String, String>;

/// `<url>/communities`, unless the URL already ends with it
pub fn communities_base(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.ends_with("/communities") {
        url.to_string()
    } else {
        format!("{url}/communities")
    }
}

/// Post keys for one community, optionally bounded in time or narrowed to
/// one thread
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostKeysQuery {
    pub creator_id: String,
    pub community_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focused_note_id: Option<String>,
}

/// Keys for specific notes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteKeysQuery {
    /// Comma-joined event ids
    pub note_ids: String,
    pub message: String,
}

impl NoteKeysQuery {
    pub fn new<S: AsRef<str>>(note_ids: &[S], message: impl Into<String>) -> Self {
        Self {
            note_ids: note_ids.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(","),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelKeysQuery {
    pub creator_id: String,
    pub channel_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessCheckQuery {
    pub creator_id: String,
    pub community_id: String,
    pub pubkey: String,
    pub wallet_addresses: Vec<String>,
}

/// Membership verdict from the gatekeeper
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccess {
    #[serde(default)]
    pub has_access: bool,
    #[serde(default)]
    pub subscriptions: Vec<Value>,
    #[serde(default)]
    pub is_white_listed: bool,
}

#[derive(Serialize)]
struct Signed<'a, T> {
    #[serde(flatten)]
    query: &'a T,
    signature: String,
}

/// Keys from a `{success: true, data: {eventId: key}}` reply. Anything else
/// yields an empty map.
pub fn key_map_from_reply(reply: &Value) -> KeyMap {
    if reply.get("success").and_then(Value::as_bool) != Some(true) {
        debug!(reply = %reply, "gatekeeper declined");
        return KeyMap::new();
    }
    reply
        .get("data")
        .and_then(Value::as_object)
        .map(|data| {
            data.iter()
                .filter_map(|(id, key)| Some((id.clone(), key.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

pub struct GatekeeperClient {
    facade: Arc<FetchFacade>,
}

impl GatekeeperClient {
    pub fn new(facade: Arc<FetchFacade>) -> Self {
        Self { facade }
    }

    pub async fn post_keys(&self, session: &Session, endpoint: &str, query: &PostKeysQuery) -> Result<KeyMap> {
        let url = format!("{}/post-keys", communities_base(endpoint));
        let reply = self.send(session, &url, query, &query.message).await?;
        Ok(key_map_from_reply(&reply))
    }

    pub async fn note_keys(&self, session: &Session, endpoint: &str, query: &NoteKeysQuery) -> Result<KeyMap> {
        let url = format!("{}/post-keys", communities_base(endpoint));
        let reply = self.send(session, &url, query, &query.message).await?;
        Ok(key_map_from_reply(&reply))
    }

    pub async fn channel_message_keys(
        &self,
        session: &Session,
        gatekeeper_url: &str,
        query: &ChannelKeysQuery,
    ) -> Result<KeyMap> {
        let url = format!("{}/channels/message-keys", gatekeeper_url.trim_end_matches('/'));
        let reply = self.send(session, &url, query, &query.message).await?;
        Ok(key_map_from_reply(&reply))
    }

    pub async fn check_user_access(
        &self,
        session: &Session,
        endpoint: &str,
        query: &AccessCheckQuery,
    ) -> Result<UserAccess> {
        let url = format!("{}/check-user-access", communities_base(endpoint));
        let auth = session.auth_header()?;
        let reply = self.facade.post(&url, &serde_json::to_value(query)?, Some(&auth)).await?;
        if reply.get("success").and_then(Value::as_bool) == Some(false) {
            return Ok(UserAccess::default());
        }
        let data = reply
            .get("data")
            .cloned()
            .ok_or_else(|| AccessError::NotFound(format!("access verdict in reply from {url}")))?;
        Ok(serde_json::from_value(data)?)
    }

    async fn send<T: Serialize>(&self, session: &Session, url: &str, query: &T, message: &str) -> Result<Value> {
        let body = serde_json::to_value(Signed {
            query,
            signature: session.sign_message(message)?,
        })?;
        let auth = session.auth_header()?;
        debug!(url, "gatekeeper request");
        Ok(self.facade.post(url, &body, Some(&auth)).await?)
    }
}

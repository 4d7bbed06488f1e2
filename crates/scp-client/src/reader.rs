//! Versioned event readers
//!
//! `V1` reads with plain relay filters. `V1_5` and `V2` call the read
//! relay's query API; `V2` drops optional capabilities it does not serve
//! and reports them as empty.

use crate::error::Result;
use crate::session::Session;
use async_trait::async_trait;
use clap::ValueEnum;
use scp_core::community::{channel_uri, ChannelInfo, CommunityInfo};
use scp_core::vault::{key_bundle_identifier, GroupKeyBundle};
use scp_core::{kinds, FetchRequest, Filter, ProtocolEvent};
use scp_net::FetchFacade;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ReaderVersion {
    #[default]
    #[value(name = "1")]
    V1,
    #[value(name = "1.5")]
    V1_5,
    #[value(name = "2")]
    V2,
}

/// Posts of one community
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityFeedQuery {
    pub community_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    /// Defaults to 50
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Messages of one channel
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessagesQuery {
    pub channel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    /// Defaults to 50
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

pub const DEFAULT_LIMIT: usize = 50;

#[async_trait]
pub trait EventReader: Send + Sync {
    fn version(&self) -> ReaderVersion;

    /// Community definition events for `creator_id`/`community_id`
    async fn fetch_community_events(&self, creator_id: &str, community_id: &str) -> Result<Vec<ProtocolEvent>>;

    /// Key bundle events by `d` identifier, published by `author`
    async fn fetch_group_keys(&self, author: &str, identifiers: &[String]) -> Result<Vec<ProtocolEvent>>;

    async fn fetch_community_feed(&self, query: &CommunityFeedQuery) -> Result<Vec<ProtocolEvent>>;

    /// Channel creation events by id
    async fn fetch_channel_events(&self, channel_ids: &[String]) -> Result<Vec<ProtocolEvent>>;

    async fn fetch_channel_messages(&self, query: &ChannelMessagesQuery) -> Result<Vec<ProtocolEvent>>;

    async fn fetch_events_by_ids(&self, ids: &[String]) -> Result<Vec<ProtocolEvent>>;

    /// Profile metadata events matching `query`. Optional capability.
    async fn search_users(&self, query: &str) -> Result<Vec<ProtocolEvent>>;

    /// Latest definition of a community, with its member key map when a key
    /// bundle is published
    async fn fetch_community_info(&self, creator_id: &str, community_id: &str) -> Result<Option<CommunityInfo>> {
        let events = self.fetch_community_events(creator_id, community_id).await?;
        let Some(latest) = events.iter().max_by_key(|e| e.created_at) else {
            return Ok(None);
        };
        let info = CommunityInfo::from_event(latest)?;
        let identifier = key_bundle_identifier(&info.community_uri);
        Ok(Some(match self.member_keys(&identifier, &info.creator_id).await? {
            Some(keys) => info.with_member_keys(keys),
            None => info,
        }))
    }

    /// Channel with its member key map when a key bundle is published
    async fn fetch_channel_info(&self, channel_id: &str) -> Result<Option<ChannelInfo>> {
        let events = self.fetch_channel_events(&[channel_id.to_string()]).await?;
        let Some(creation) = events.iter().find(|e| e.kind == kinds::CHANNEL_CREATION) else {
            return Ok(None);
        };
        let info = ChannelInfo::from_event(creation)?;
        let identifier = key_bundle_identifier(&channel_uri(&info.id));
        Ok(Some(match self.member_keys(&identifier, &info.creator_id).await? {
            Some(keys) => info.with_member_keys(keys),
            None => info,
        }))
    }

    /// Member key map from the newest bundle `creator_id` published under
    /// `identifier`. Bundles from any other author are ignored.
    async fn member_keys(
        &self,
        identifier: &str,
        creator_id: &str,
    ) -> Result<Option<std::collections::BTreeMap<String, String>>> {
        let bundles = self.fetch_group_keys(creator_id, &[identifier.to_string()]).await?;
        let Some(latest) = bundles
            .iter()
            .filter(|e| e.pubkey == creator_id && e.identifier() == Some(identifier))
            .max_by_key(|e| e.created_at)
        else {
            return Ok(None);
        };
        match GroupKeyBundle::member_keys_from_event(latest) {
            Ok(keys) => Ok(Some(keys)),
            Err(err) => {
                warn!(identifier, event_id = %latest.id, error = %err, "unreadable key bundle");
                Ok(None)
            }
        }
    }
}

/// Reads with relay filters
pub struct FilterReader {
    facade: Arc<FetchFacade>,
}

impl FilterReader {
    pub fn new(facade: Arc<FetchFacade>) -> Self {
        Self { facade }
    }

    async fn fetch(&self, filter: Filter) -> Result<Vec<ProtocolEvent>> {
        Ok(self.facade.fetch_events(vec![FetchRequest::from(filter)]).await?)
    }
}

fn windowed(mut filter: Filter, since: Option<u64>, until: Option<u64>, limit: Option<usize>) -> Filter {
    if let Some(since) = since {
        filter = filter.since(since);
    }
    if let Some(until) = until {
        filter = filter.until(until);
    }
    filter.limit(limit.unwrap_or(DEFAULT_LIMIT))
}

#[async_trait]
impl EventReader for FilterReader {
    fn version(&self) -> ReaderVersion {
        ReaderVersion::V1
    }

    async fn fetch_community_events(&self, creator_id: &str, community_id: &str) -> Result<Vec<ProtocolEvent>> {
        self.fetch(
            Filter::new()
                .kinds([kinds::COMMUNITY_DEFINITION])
                .authors([creator_id])
                .tag('d', [community_id]),
        )
        .await
    }

    async fn fetch_group_keys(&self, author: &str, identifiers: &[String]) -> Result<Vec<ProtocolEvent>> {
        self.fetch(
            Filter::new()
                .kinds([kinds::GROUP_KEYS])
                .authors([author])
                .tag('d', identifiers.iter().cloned()),
        )
        .await
    }

    async fn fetch_community_feed(&self, query: &CommunityFeedQuery) -> Result<Vec<ProtocolEvent>> {
        let filter = Filter::new()
            .kinds([kinds::TEXT_NOTE])
            .tag('a', [query.community_uri.as_str()]);
        self.fetch(windowed(filter, query.since, query.until, query.limit)).await
    }

    async fn fetch_channel_events(&self, channel_ids: &[String]) -> Result<Vec<ProtocolEvent>> {
        self.fetch(
            Filter::new()
                .ids(channel_ids.iter().cloned())
                .kinds([kinds::CHANNEL_CREATION]),
        )
        .await
    }

    async fn fetch_channel_messages(&self, query: &ChannelMessagesQuery) -> Result<Vec<ProtocolEvent>> {
        let filter = Filter::new()
            .kinds([kinds::CHANNEL_MESSAGE])
            .tag('e', [query.channel_id.as_str()]);
        self.fetch(windowed(filter, query.since, query.until, query.limit)).await
    }

    async fn fetch_events_by_ids(&self, ids: &[String]) -> Result<Vec<ProtocolEvent>> {
        self.fetch(Filter::new().ids(ids.iter().cloned())).await
    }

    async fn search_users(&self, query: &str) -> Result<Vec<ProtocolEvent>> {
        Ok(self.facade.fetch_cached("user_search", json!({ "query": query })).await?)
    }
}

/// Reads through the read relay's query API
pub struct ApiReader {
    facade: Arc<FetchFacade>,
    version: ReaderVersion,
    session: Option<Session>,
}

impl ApiReader {
    /// Requests carry an auth header when a session is given
    pub fn new(facade: Arc<FetchFacade>, version: ReaderVersion, session: Option<Session>) -> Self {
        Self {
            facade,
            version,
            session,
        }
    }

    async fn query(&self, endpoint: &str, params: Value) -> Result<Vec<ProtocolEvent>> {
        let auth = self.session.as_ref().map(Session::auth_header).transpose()?;
        debug!(endpoint, version = ?self.version, "api read");
        Ok(self.facade.fetch_events_from_api(endpoint, params, auth).await?)
    }
}

#[async_trait]
impl EventReader for ApiReader {
    fn version(&self) -> ReaderVersion {
        self.version
    }

    async fn fetch_community_events(&self, creator_id: &str, community_id: &str) -> Result<Vec<ProtocolEvent>> {
        self.query(
            "fetch-communities",
            json!({ "creatorId": creator_id, "communityId": community_id }),
        )
        .await
    }

    async fn fetch_group_keys(&self, author: &str, identifiers: &[String]) -> Result<Vec<ProtocolEvent>> {
        self.query("fetch-group-keys", json!({ "author": author, "identifiers": identifiers }))
            .await
    }

    async fn fetch_community_feed(&self, query: &CommunityFeedQuery) -> Result<Vec<ProtocolEvent>> {
        let query = CommunityFeedQuery {
            limit: Some(query.limit.unwrap_or(DEFAULT_LIMIT)),
            ..query.clone()
        };
        self.query("fetch-community-feed", serde_json::to_value(&query)?).await
    }

    async fn fetch_channel_events(&self, channel_ids: &[String]) -> Result<Vec<ProtocolEvent>> {
        self.query("fetch-channel-info", json!({ "channelIds": channel_ids })).await
    }

    async fn fetch_channel_messages(&self, query: &ChannelMessagesQuery) -> Result<Vec<ProtocolEvent>> {
        let query = ChannelMessagesQuery {
            limit: Some(query.limit.unwrap_or(DEFAULT_LIMIT)),
            ..query.clone()
        };
        self.query("fetch-channel-messages", serde_json::to_value(&query)?).await
    }

    async fn fetch_events_by_ids(&self, ids: &[String]) -> Result<Vec<ProtocolEvent>> {
        self.query("fetch-events-by-ids", json!({ "ids": ids })).await
    }

    async fn search_users(&self, query: &str) -> Result<Vec<ProtocolEvent>> {
        if self.version == ReaderVersion::V2 {
            return Ok(Vec::new());
        }
        self.query("search-users", json!({ "query": query })).await
    }
}

pub fn reader_for(version: ReaderVersion, facade: Arc<FetchFacade>, session: Option<Session>) -> Box<dyn EventReader> {
    match version {
        ReaderVersion::V1 => Box::new(FilterReader::new(facade)),
        ReaderVersion::V1_5 | ReaderVersion::V2 => Box::new(ApiReader::new(facade, version, session)),
    }
}

//! Protected content construction and publishing
//!
//! Posts and channel messages are sealed under a fresh single-use key
//! wrapped to the group public key. The decrypted body names the group it
//! was written for, which readers check after recovering the key.

use crate::error::{AccessError, Result};
use crate::session::{EventSigner, Session};
use scp_core::community::{
    channel_uri, scp_tag, standard, ChannelInfo, ChannelMetadata, ChannelScpData, CommunityInfo, CommunityScpData,
    ContentScpData, MembershipType, ProtectedBody,
};
use scp_core::vault::{generate_group_keys, seal_with_generated_key, wrap, GeneratedGroupKeys};
use scp_core::{kinds, KeyPair, ProtocolEvent, PublicKey, SecretKey, Tag, UnsignedEvent};
use scp_net::{FetchFacade, SubmitResponse};
use std::sync::Arc;
use tracing::info;

/// Group public key a community post is sealed to
pub fn community_group_key(community: &CommunityInfo) -> Result<PublicKey> {
    let hex_key = community.scp_data.public_key.as_deref().ok_or_else(|| {
        AccessError::Unsupported(format!("community {} has no group public key", community.community_uri))
    })?;
    Ok(PublicKey::from_hex(hex_key)?)
}

/// Group public key a channel message is sealed to: the channel's own, or
/// the backing community's.
pub fn channel_group_key(channel: &ChannelInfo, community: Option<&CommunityInfo>) -> Result<PublicKey> {
    match (channel.scp_data.public_key.as_deref(), community) {
        (Some(hex_key), _) => Ok(PublicKey::from_hex(hex_key)?),
        (None, Some(community)) => community_group_key(community),
        (None, None) => Err(AccessError::Unsupported(format!(
            "channel {} has no group public key",
            channel.id
        ))),
    }
}

pub fn seal_community_post(session: &Session, community: &CommunityInfo, message: &str) -> Result<UnsignedEvent> {
    let group_public = community_group_key(community)?;
    let body = ProtectedBody {
        community_uri: Some(community.community_uri.clone()),
        channel_id: None,
        message: message.to_string(),
    };
    let sealed = seal_with_generated_key(session.secret(), &group_public, &serde_json::to_string(&body)?)?;

    let tags = vec![
        Tag::new(["a", community.community_uri.as_str()]),
        scp_tag(
            standard::COMMUNITY_POST,
            &ContentScpData {
                encrypted_key: sealed.encrypted_key,
                community_uri: Some(community.community_uri.clone()),
                channel_id: None,
            },
        )?,
    ];
    Ok(UnsignedEvent::new(
        session.pubkey_hex(),
        kinds::TEXT_NOTE,
        tags,
        sealed.encrypted_content,
    ))
}

pub fn seal_channel_message(
    session: &Session,
    channel: &ChannelInfo,
    community: Option<&CommunityInfo>,
    message: &str,
) -> Result<UnsignedEvent> {
    let group_public = channel_group_key(channel, community)?;
    let body = ProtectedBody {
        community_uri: None,
        channel_id: Some(channel.id.clone()),
        message: message.to_string(),
    };
    let sealed = seal_with_generated_key(session.secret(), &group_public, &serde_json::to_string(&body)?)?;

    let tags = vec![
        Tag::new(["e", channel.id.as_str(), "", "root"]),
        scp_tag(
            standard::CHANNEL_MESSAGE,
            &ContentScpData {
                encrypted_key: sealed.encrypted_key,
                community_uri: None,
                channel_id: Some(channel.id.clone()),
            },
        )?,
    ];
    Ok(UnsignedEvent::new(
        session.pubkey_hex(),
        kinds::CHANNEL_MESSAGE,
        tags,
        sealed.encrypted_content,
    ))
}

/// Optional community settings
#[derive(Debug, Clone, Default)]
pub struct CommunityOptions {
    pub description: Option<String>,
    pub membership_type: MembershipType,
    pub gatekeeper_url: Option<String>,
    pub private_relay: Option<String>,
}

/// A new community and its group secret. The secret stays with the creator;
/// the definition only carries it wrapped for the gatekeeper.
#[derive(Debug, Clone)]
pub struct ProvisionedCommunity {
    pub info: CommunityInfo,
    pub group_secret: SecretKey,
}

impl ProvisionedCommunity {
    /// Community definition event
    pub fn definition_event(&self) -> Result<UnsignedEvent> {
        Ok(UnsignedEvent::new(
            self.info.creator_id.clone(),
            kinds::COMMUNITY_DEFINITION,
            self.info.to_tags()?,
            "",
        ))
    }
}

/// Generate a community group key and wrap its secret for the gatekeeper
pub fn provision_community(
    session: &Session,
    community_id: &str,
    gatekeeper: &PublicKey,
    options: CommunityOptions,
) -> Result<ProvisionedCommunity> {
    let group = KeyPair::generate();
    let encrypted_key = wrap(session.secret(), gatekeeper, &group.secret.to_hex())?;

    let scp_data = CommunityScpData {
        public_key: Some(group.public.to_hex()),
        gatekeeper_public_key: Some(gatekeeper.to_hex()),
        encrypted_key: Some(encrypted_key),
        membership_type: options.membership_type,
        gatekeeper_url: options.gatekeeper_url,
        private_relay: options.private_relay,
        ..Default::default()
    };
    let mut info = CommunityInfo::new(session.pubkey_hex(), community_id, scp_data);
    info.description = options.description;
    Ok(ProvisionedCommunity {
        info,
        group_secret: group.secret,
    })
}

/// A standalone channel before publishing. The key bundle names the channel
/// by its creation event id, so it is built once that id is known.
#[derive(Debug, Clone)]
pub struct ChannelDraft {
    pub creation: UnsignedEvent,
    pub keys: GeneratedGroupKeys,
}

impl ChannelDraft {
    pub fn key_bundle_event(&self, channel_id: &str) -> Result<UnsignedEvent> {
        let uri = channel_uri(channel_id);
        Ok(UnsignedEvent::new(
            self.creation.pubkey.clone(),
            kinds::GROUP_KEYS,
            self.keys.bundle.event_tags(&uri),
            self.keys.bundle.to_event_content()?,
        ))
    }
}

/// Channel with its own group key, wrapped for every member (the creator
/// included)
pub fn create_channel(session: &Session, metadata: &ChannelMetadata, members: &[PublicKey]) -> Result<ChannelDraft> {
    let mut recipients = vec![*session.public_key()];
    for member in members {
        if !recipients.contains(member) {
            recipients.push(*member);
        }
    }
    let keys = generate_group_keys(session.secret(), &recipients)?;

    let scp_data = ChannelScpData {
        public_key: Some(keys.bundle.group_public_key.clone()),
        community_uri: None,
    };
    let creation = UnsignedEvent::new(
        session.pubkey_hex(),
        kinds::CHANNEL_CREATION,
        vec![scp_tag(standard::CHANNEL, &scp_data)?],
        serde_json::to_string(metadata)?,
    );
    Ok(ChannelDraft { creation, keys })
}

/// Channel sealed with its community's group key
pub fn create_community_channel(
    session: &Session,
    metadata: &ChannelMetadata,
    community: &CommunityInfo,
) -> Result<UnsignedEvent> {
    let scp_data = ChannelScpData {
        public_key: None,
        community_uri: Some(community.community_uri.clone()),
    };
    Ok(UnsignedEvent::new(
        session.pubkey_hex(),
        kinds::CHANNEL_CREATION,
        vec![
            Tag::new(["a", community.community_uri.as_str()]),
            scp_tag(standard::CHANNEL, &scp_data)?,
        ],
        serde_json::to_string(metadata)?,
    ))
}

/// Event accepted by at least one write relay
#[derive(Debug, Clone)]
pub struct Published {
    pub event: ProtocolEvent,
    pub responses: Vec<SubmitResponse>,
}

impl Published {
    pub fn accepted(&self) -> usize {
        self.responses.iter().filter(|r| r.success).count()
    }
}

/// Signs and fans events out to the write relays
pub struct Publisher {
    facade: Arc<FetchFacade>,
    signer: Arc<dyn EventSigner>,
}

impl Publisher {
    pub fn new(facade: Arc<FetchFacade>, signer: Arc<dyn EventSigner>) -> Self {
        Self { facade, signer }
    }

    pub async fn publish(&self, unsigned: UnsignedEvent) -> Result<Published> {
        let event = self.signer.sign_event(unsigned)?;
        let responses = self.facade.submit_to_write_relays(&event).await;
        let published = Published { event, responses };
        if published.accepted() == 0 {
            let reasons: Vec<String> = published
                .responses
                .iter()
                .map(|r| format!("{}: {}", r.relay, r.message.as_deref().unwrap_or("rejected")))
                .collect();
            return Err(AccessError::Transport(scp_net::TransportError::Relay(reasons.join("; "))));
        }
        info!(
            event_id = %published.event.id,
            kind = published.event.kind,
            accepted = published.accepted(),
            "event published"
        );
        Ok(published)
    }

    /// Publish the creation event, then the key bundle naming it. Returns
    /// the channel as readers will see it.
    pub async fn publish_channel(&self, draft: &ChannelDraft) -> Result<ChannelInfo> {
        let creation = self.publish(draft.creation.clone()).await?;
        self.publish(draft.key_bundle_event(&creation.event.id)?).await?;
        Ok(ChannelInfo::from_event(&creation.event)?.with_member_keys(draft.keys.bundle.member_keys.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{facade_over, sign, MemoryRelay, RecordingApi};
    use scp_core::community::extract_scp_data;
    use scp_core::vault::{open_sealed, unwrap_secret, SealedContent};

    #[test]
    fn test_community_post_opens_with_group_secret() {
        let creator = Session::generate();
        let gatekeeper = Session::generate();
        let community = provision_community(&creator, "dev", gatekeeper.public_key(), CommunityOptions::default()).unwrap();

        let post = sign(&creator, seal_community_post(&creator, &community.info, "hello members").unwrap());
        assert_eq!(post.kind, kinds::TEXT_NOTE);
        assert_eq!(post.tag_value("a"), Some(community.info.community_uri.as_str()));

        let scp: ContentScpData = extract_scp_data(&post, standard::COMMUNITY_POST).unwrap();
        assert_eq!(scp.community_uri.as_deref(), Some(community.info.community_uri.as_str()));
        let sealed = SealedContent {
            encrypted_content: post.content.clone(),
            encrypted_key: scp.encrypted_key,
        };
        let (_, plaintext) = open_sealed(&community.group_secret, creator.public_key(), &sealed).unwrap();
        let body: ProtectedBody = serde_json::from_str(&plaintext).unwrap();
        assert_eq!(body.message, "hello members");
        assert_eq!(body.community_uri, Some(community.info.community_uri.clone()));
    }

    #[test]
    fn test_provisioned_key_is_recoverable_by_gatekeeper() {
        let creator = Session::generate();
        let gatekeeper = Session::generate();
        let community = provision_community(
            &creator,
            "dev",
            gatekeeper.public_key(),
            CommunityOptions {
                membership_type: MembershipType::Protected,
                gatekeeper_url: Some("https://gk.example".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let wrapped = community.info.gatekeeper_encrypted_key().unwrap();
        let recovered = unwrap_secret(gatekeeper.secret(), creator.public_key(), wrapped).unwrap();
        assert_eq!(recovered.to_hex(), community.group_secret.to_hex());

        let definition = sign(&creator, community.definition_event().unwrap());
        let parsed = CommunityInfo::from_event(&definition).unwrap();
        assert_eq!(parsed.community_uri, community.info.community_uri);
        assert_eq!(parsed.membership_type(), MembershipType::Protected);
    }

    #[test]
    fn test_post_needs_group_key() {
        let creator = Session::generate();
        let open = CommunityInfo::new(creator.pubkey_hex(), "open", CommunityScpData::default());
        assert!(matches!(
            seal_community_post(&creator, &open, "hi"),
            Err(AccessError::Unsupported(_))
        ));
    }

    #[test]
    fn test_channel_draft_wraps_for_creator_and_members() {
        let creator = Session::generate();
        let member = Session::generate();
        let draft = create_channel(
            &creator,
            &ChannelMetadata {
                name: "general".into(),
                about: None,
            },
            &[*member.public_key(), *creator.public_key()],
        )
        .unwrap();
        assert_eq!(draft.keys.bundle.member_keys.len(), 2);

        let bundle = draft.key_bundle_event("chan1").unwrap();
        assert_eq!(bundle.kind, kinds::GROUP_KEYS);
        assert_eq!(bundle.tags[0], Tag::new(["d", "40:chan1:keys"]));

        let wrapped = &draft.keys.bundle.member_keys[&member.pubkey_hex()];
        let secret = unwrap_secret(member.secret(), creator.public_key(), wrapped).unwrap();
        assert_eq!(secret.to_hex(), draft.keys.group_secret.to_hex());
    }

    #[tokio::test]
    async fn test_publish_channel_sends_creation_then_bundle() {
        let relay = MemoryRelay::new("wss://relay.test", Vec::new());
        let facade = facade_over(&relay, &RecordingApi::new());
        let creator = Session::generate();
        let signer = Arc::new(crate::session::LocalEventSigner::new(
            crate::session::Ed25519Signer::from_secret(creator.secret()),
        ));
        let publisher = Publisher::new(facade, signer);

        let draft = create_channel(&creator, &ChannelMetadata::default(), &[]).unwrap();
        let channel = publisher.publish_channel(&draft).await.unwrap();

        let submitted = relay.submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].kind, kinds::CHANNEL_CREATION);
        assert_eq!(submitted[0].id, channel.id);
        assert_eq!(submitted[1].kind, kinds::GROUP_KEYS);
        assert_eq!(submitted[1].identifier(), Some(format!("40:{}:keys", channel.id).as_str()));
        assert!(channel.member_key_map.unwrap().contains_key(&creator.pubkey_hex()));
    }
}

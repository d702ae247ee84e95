use crate::{
    pubsub::{build_filter, SubscriptionFilter},
    Error, Result, INVITE_D_TAG_PREFIX, INVITE_EVENT_KIND, INVITE_LIST_LABEL,
};
use nostr::{EventBuilder, Kind, PublicKey, Tag, Timestamp, UnsignedEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const RESERVED_TAGS: [&str; 2] = ["d", "l"];

/// A device's published offer to establish ratchet sessions.
///
/// The key material is produced and interpreted by the `RatchetEngine`; this
/// type only owns the wire and storage encodings. `public_material` entries
/// are published as event tags, `private_material` never leaves local storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    #[serde(with = "crate::types::serde_pubkey")]
    pub inviter: PublicKey,
    pub device_id: String,
    pub created_at: u64,
    #[serde(default)]
    pub public_material: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_material: Option<BTreeMap<String, String>>,
}

impl Invite {
    pub fn new(
        inviter: PublicKey,
        device_id: impl Into<String>,
        public_material: BTreeMap<String, String>,
        private_material: Option<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            inviter,
            device_id: device_id.into(),
            created_at: crate::utils::now_seconds(),
            public_material,
            private_material,
        }
    }

    pub fn storage_key(device_id: &str) -> String {
        format!("invite/{}", device_id)
    }

    /// Copy without private key material, as seen by remote devices.
    pub fn public_view(&self) -> Self {
        Self {
            private_material: None,
            ..self.clone()
        }
    }

    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn deserialize(json: &str) -> Result<Self> {
        let invite: Invite =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        if invite.device_id.is_empty() {
            return Err(Error::Invite("Missing deviceId".to_string()));
        }
        Ok(invite)
    }

    pub fn get_event(&self) -> Result<UnsignedEvent> {
        let mut tags = Vec::with_capacity(self.public_material.len() + 2);
        for (name, value) in &self.public_material {
            if RESERVED_TAGS.contains(&name.as_str()) {
                return Err(Error::Invite(format!("Reserved material name: {}", name)));
            }
            tags.push(
                Tag::parse(&[name.clone(), value.clone()])
                    .map_err(|e| Error::InvalidEvent(e.to_string()))?,
            );
        }
        tags.push(
            Tag::parse(&[
                "d".to_string(),
                format!("{}{}", INVITE_D_TAG_PREFIX, self.device_id),
            ])
            .map_err(|e| Error::InvalidEvent(e.to_string()))?,
        );
        tags.push(
            Tag::parse(&["l".to_string(), INVITE_LIST_LABEL.to_string()])
                .map_err(|e| Error::InvalidEvent(e.to_string()))?,
        );

        let event = EventBuilder::new(Kind::from(INVITE_EVENT_KIND as u16), "")
            .tags(tags)
            .custom_created_at(Timestamp::from(self.created_at))
            .build(self.inviter);

        Ok(event)
    }

    /// Parses a published invite. Events without the invite list label or
    /// without key material are rejected.
    pub fn from_event(event: &nostr::Event) -> Result<Self> {
        if event.kind.as_u16() != INVITE_EVENT_KIND as u16 {
            return Err(Error::Invite("Not an invite event".to_string()));
        }
        if !has_list_label(event) {
            return Err(Error::Invite("Missing invite list label".to_string()));
        }

        let mut device_id = None;
        let mut public_material = BTreeMap::new();

        for tag in event.tags.iter() {
            let parts = tag.as_slice();
            let (Some(name), Some(value)) = (parts.first(), parts.get(1)) else {
                continue;
            };
            match name.as_str() {
                "d" => {
                    device_id = value
                        .strip_prefix(INVITE_D_TAG_PREFIX)
                        .filter(|id| !id.is_empty())
                        .map(String::from);
                }
                "l" => {}
                _ => {
                    public_material.insert(name.clone(), value.clone());
                }
            }
        }

        let device_id = device_id.ok_or(Error::Invite("Missing device d tag".to_string()))?;
        if public_material.is_empty() {
            return Err(Error::Invite("Missing key material".to_string()));
        }

        Ok(Self {
            inviter: event.pubkey,
            device_id,
            created_at: event.created_at.as_secs(),
            public_material,
            private_material: None,
        })
    }

    /// Filter matching every device invite and device tombstone published
    /// by `user_pubkey`.
    pub fn user_filter(user_pubkey: PublicKey) -> SubscriptionFilter {
        build_filter()
            .kinds(vec![INVITE_EVENT_KIND])
            .authors(vec![user_pubkey])
            .build()
    }

    /// Replaces the invite of `device_id` with an unlabelled, materialless
    /// event announcing the device is revoked.
    pub fn tombstone_event(inviter: PublicKey, device_id: &str) -> Result<UnsignedEvent> {
        let d_tag = Tag::parse(&["d".to_string(), format!("{}{}", INVITE_D_TAG_PREFIX, device_id)])
            .map_err(|e| Error::InvalidEvent(e.to_string()))?;
        Ok(EventBuilder::new(Kind::from(INVITE_EVENT_KIND as u16), "")
            .tags(vec![d_tag])
            .custom_created_at(Timestamp::now())
            .build(inviter))
    }

    /// Device id revoked by `event`, if it is a device tombstone.
    pub fn tombstone_device_id(event: &nostr::Event) -> Option<String> {
        if event.kind.as_u16() != INVITE_EVENT_KIND as u16 || has_list_label(event) {
            return None;
        }
        event.tags.iter().find_map(|tag| {
            let parts = tag.as_slice();
            if parts.first().map(String::as_str) != Some("d") {
                return None;
            }
            parts
                .get(1)?
                .strip_prefix(INVITE_D_TAG_PREFIX)
                .filter(|id| !id.is_empty() && !id.contains('/'))
                .map(String::from)
        })
    }
}

fn has_list_label(event: &nostr::Event) -> bool {
    event.tags.iter().any(|tag| {
        let parts = tag.as_slice();
        parts.first().map(String::as_str) == Some("l")
            && parts.get(1).map(String::as_str) == Some(INVITE_LIST_LABEL)
    })
}

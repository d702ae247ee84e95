//! Boundary to the ratchet cryptography.
//!
//! The directory never looks inside a session: it only asks whether a
//! session can send, hands it rumors to encrypt and envelopes to decrypt, and
//! persists whatever opaque state string the session serializes to.

use crate::{Invite, Result, SubscriptionFilter};
use async_trait::async_trait;
use nostr::{Keys, PublicKey, UnsignedEvent};

/// Output of encrypting one rumor.
pub struct SentEnvelope {
    /// Signed outer event to publish.
    pub envelope: nostr::Event,
    /// The inner rumor as the session encoded it.
    pub echo: UnsignedEvent,
}

/// One forward-secret session with a single remote device.
pub trait RatchetSession: Send {
    /// True once the session holds both a send-capable local key and a
    /// known remote key.
    fn ready(&self) -> bool;

    fn send(&mut self, event: &UnsignedEvent) -> Result<SentEnvelope>;

    /// Decrypts an envelope. `Ok(None)` means the envelope is not for this
    /// session (or was already consumed).
    fn receive(&mut self, envelope: &nostr::Event) -> Result<Option<UnsignedEvent>>;

    /// Transport predicate selecting envelopes this session can decrypt.
    /// May change after a ratchet step.
    fn envelope_filter(&self) -> SubscriptionFilter;

    fn serialize(&self) -> Result<String>;

    fn close(&mut self);
}

/// Session produced by accepting a remote invite.
pub struct Handshake {
    pub session: Box<dyn RatchetSession>,
    /// Signed acceptance envelope to publish for the inviter.
    pub acceptance: nostr::Event,
}

/// Session produced by a remote device accepting our invite.
pub struct InviteAcceptance {
    pub session: Box<dyn RatchetSession>,
    pub invitee: PublicKey,
    pub device_id: String,
}

#[async_trait]
pub trait RatchetEngine: Send + Sync {
    /// Generates fresh key material for an invite published by
    /// `(inviter, device_id)`.
    fn create_invite(&self, inviter: PublicKey, device_id: &str) -> Result<Invite>;

    /// Runs the one-shot handshake against a remote invite.
    async fn accept_invite(
        &self,
        invite: &Invite,
        identity: &Keys,
        device_id: &str,
    ) -> Result<Handshake>;

    /// Filter matching acceptances of `invite`.
    fn acceptance_filter(&self, invite: &Invite) -> SubscriptionFilter;

    /// Opens an acceptance of our own invite. `Ok(None)` means the event is
    /// not an acceptance of this invite.
    fn open_acceptance(
        &self,
        invite: &Invite,
        identity: &Keys,
        event: &nostr::Event,
    ) -> Result<Option<InviteAcceptance>>;

    fn restore_session(&self, state: &str) -> Result<Box<dyn RatchetSession>>;
}

//! Encryption adapter: maps peer nicks to persistent conversation handles
//! and wraps the engine's send/receive calls.
//!
//! The engine itself is a collaborator consumed through the [`Engine`] and
//! [`Conversation`] traits; see [`crate::e2e`] for the bundled
//! implementation. Conversations are keyed by nick — a volatile identifier,
//! so a renaming peer gets a fresh conversation and loses continuity. Known
//! limitation, kept deliberately.

use std::collections::HashMap;

use thiserror::Error;

/// Failures surfaced by the encryption engine. These are recovered locally:
/// the offending message is dropped and an info line names the peer, but
/// conversation state is left untouched.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed wire payload: {0}")]
    Malformed(String),
    #[error("decryption failed (wrong key or tampered)")]
    DecryptFailed,
    #[error("encrypted payload before key exchange")]
    NoSession,
}

/// Per-peer encrypted-session state, owned by the engine.
pub trait Conversation: Send {
    /// Prepare one outbound plaintext. Returns the wire fragments to
    /// transmit, in order; the engine may split payloads exceeding its
    /// maximum block size into multiple fragments.
    fn send(&mut self, plaintext: &str) -> Result<Vec<String>, EngineError>;

    /// Process one inbound wire payload. Returns the displayable plaintext
    /// (empty for protocol control traffic, which must not be displayed)
    /// and any replies the engine requires, to be transmitted immediately
    /// and in order.
    fn receive(&mut self, wire: &str) -> Result<(String, Vec<String>), EngineError>;

    /// Whether the conversation is currently end-to-end encrypted.
    fn is_encrypted(&self) -> bool;
}

/// Factory for per-peer conversations. One engine is constructed at startup
/// and holds the process-lifetime key material shared by all conversations.
pub trait Engine: Send {
    fn new_conversation(&self) -> Box<dyn Conversation>;
}

/// Result of sending a plaintext to a peer.
#[derive(Debug)]
pub struct Sent {
    /// Wire fragments, one outbound protocol line each, in order.
    pub fragments: Vec<String>,
    /// Encryption status of the conversation after the call.
    pub encrypted: bool,
}

/// Result of receiving a wire payload from a peer.
#[derive(Debug)]
pub struct Received {
    /// Displayable plaintext; empty means control traffic, don't display.
    pub plaintext: String,
    /// Engine-required responses, to be sent back to the peer before any
    /// display action.
    pub replies: Vec<String>,
    /// Encryption status of the conversation after the call.
    pub encrypted: bool,
}

/// The adapter proper: lazily creates one conversation per distinct peer
/// nick and delegates to it.
pub struct Crypto {
    engine: Box<dyn Engine>,
    conversations: HashMap<String, Box<dyn Conversation>>,
}

impl Crypto {
    pub fn new(engine: Box<dyn Engine>) -> Self {
        Self {
            engine,
            conversations: HashMap::new(),
        }
    }

    /// Existing conversation for `peer`, or a freshly created one. Pure
    /// lookup/insert; no network effect.
    fn conversation_for(&mut self, peer: &str) -> &mut Box<dyn Conversation> {
        self.conversations
            .entry(peer.to_string())
            .or_insert_with(|| self.engine.new_conversation())
    }

    pub fn send_to_peer(&mut self, peer: &str, plaintext: &str) -> Result<Sent, EngineError> {
        let conv = self.conversation_for(peer);
        let fragments = conv.send(plaintext)?;
        Ok(Sent {
            fragments,
            encrypted: conv.is_encrypted(),
        })
    }

    pub fn receive_from_peer(&mut self, peer: &str, wire: &str) -> Result<Received, EngineError> {
        let conv = self.conversation_for(peer);
        let (plaintext, replies) = conv.receive(wire)?;
        Ok(Received {
            plaintext,
            replies,
            encrypted: conv.is_encrypted(),
        })
    }

    /// Encryption status for `peer` without creating a conversation.
    pub fn peer_encrypted(&self, peer: &str) -> bool {
        self.conversations
            .get(peer)
            .map(|c| c.is_encrypted())
            .unwrap_or(false)
    }
}

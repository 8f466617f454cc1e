//! Opportunistic end-to-end encryption engine for direct messages.
//!
//! Plays the role of the external OTR-style library behind the
//! [`crate::crypto::Engine`] / [`crate::crypto::Conversation`] traits:
//!
//! - X25519 ECDH against a process-lifetime identity key, shared by all
//!   conversations.
//! - HKDF-SHA256 key derivation, AES-256-GCM message encryption.
//! - Fragmentation of wire payloads at a 400-byte threshold, with
//!   receive-side reassembly.
//!
//! # Wire format
//!
//! ```text
//! ?TIRC:KEX:<pub-b64url>            key offer (sent with the first plaintext)
//! ?TIRC:KEXR:<pub-b64url>           key answer; both sides encrypted after this
//! ?TIRC:MSG:<nonce-b64url>:<ct-b64url>
//! ?TIRC:FRAG:<i>/<n>:<piece>        fragment i of n of a longer wire payload
//! ```
//!
//! Until the exchange completes, sends pass through in clear (with a key
//! offer piggybacked on the first one) — opportunistic, not mandatory.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use base64::Engine as _;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{Conversation, Engine, EngineError};

/// Maximum wire line size before fragmentation kicks in. Matches common
/// OTR fragment sizing and stays well under the IRC 512-byte line limit.
pub const FRAGMENT_SIZE: usize = 400;

const KEX_PREFIX: &str = "?TIRC:KEX:";
const KEXR_PREFIX: &str = "?TIRC:KEXR:";
const MSG_PREFIX: &str = "?TIRC:MSG:";
const FRAG_PREFIX: &str = "?TIRC:FRAG:";

/// Derive the conversation key from a raw ECDH output.
fn derive_key(dh_out: &[u8]) -> [u8; 32] {
    let hk = hkdf::Hkdf::<Sha256>::new(None, dh_out);
    let mut key = [0u8; 32];
    hk.expand(b"tirc-e2e-v1", &mut key)
        .expect("32 bytes valid for HKDF");
    key
}

/// Process-lifetime engine. Constructed once at startup; the identity key
/// lives as long as the process and is shared by every conversation.
pub struct E2eEngine {
    identity: StaticSecret,
}

impl E2eEngine {
    pub fn new() -> Self {
        Self {
            identity: StaticSecret::random_from_rng(OsRng),
        }
    }
}

impl Default for E2eEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for E2eEngine {
    fn new_conversation(&self) -> Box<dyn Conversation> {
        Box::new(E2eConversation {
            identity: self.identity.clone(),
            cipher: None,
            offered: false,
            reassembly: None,
        })
    }
}

/// Buffer for a wire payload arriving in fragments.
struct Reassembly {
    total: usize,
    pieces: Vec<Option<String>>,
}

struct E2eConversation {
    identity: StaticSecret,
    /// Established AEAD cipher; `Some` once the key exchange completed.
    cipher: Option<Aes256Gcm>,
    /// Whether we already piggybacked a key offer on an outbound message.
    offered: bool,
    reassembly: Option<Reassembly>,
}

impl E2eConversation {
    fn our_offer(&self, prefix: &str) -> String {
        let public = PublicKey::from(&self.identity);
        format!("{prefix}{}", B64.encode(public.to_bytes()))
    }

    fn establish(&mut self, peer_pub_b64: &str) -> Result<(), EngineError> {
        let bytes = B64
            .decode(peer_pub_b64)
            .map_err(|_| EngineError::Malformed("bad key encoding".into()))?;
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EngineError::Malformed("bad key length".into()))?;
        let shared = self.identity.diffie_hellman(&PublicKey::from(raw));
        let key = derive_key(shared.as_bytes());
        self.cipher = Some(Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&key)));
        Ok(())
    }

    fn encrypt(&self, cipher: &Aes256Gcm, plaintext: &str) -> Result<String, EngineError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| EngineError::Malformed("encryption failed".into()))?;
        Ok(format!(
            "{MSG_PREFIX}{}:{}",
            B64.encode(nonce),
            B64.encode(ct)
        ))
    }

    fn decrypt(&self, wire: &str) -> Result<String, EngineError> {
        let cipher = self.cipher.as_ref().ok_or(EngineError::NoSession)?;
        let (nonce_b64, ct_b64) = wire
            .split_once(':')
            .ok_or_else(|| EngineError::Malformed("missing ciphertext".into()))?;
        let nonce_bytes = B64
            .decode(nonce_b64)
            .map_err(|_| EngineError::Malformed("bad nonce encoding".into()))?;
        if nonce_bytes.len() != 12 {
            return Err(EngineError::Malformed("bad nonce length".into()));
        }
        let ct = B64
            .decode(ct_b64)
            .map_err(|_| EngineError::Malformed("bad ciphertext encoding".into()))?;
        let pt = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ct.as_ref())
            .map_err(|_| EngineError::DecryptFailed)?;
        String::from_utf8(pt).map_err(|_| EngineError::Malformed("invalid UTF-8".into()))
    }

    /// Ingest one fragment. Returns the reassembled payload once complete.
    fn ingest_fragment(&mut self, body: &str) -> Result<Option<String>, EngineError> {
        let malformed = || EngineError::Malformed("bad fragment header".into());
        let (header, piece) = body.split_once(':').ok_or_else(malformed)?;
        let (i, n) = header.split_once('/').ok_or_else(malformed)?;
        let i: usize = i.parse().map_err(|_| malformed())?;
        let n: usize = n.parse().map_err(|_| malformed())?;
        if i == 0 || n == 0 || i > n {
            return Err(malformed());
        }

        let buf = self.reassembly.get_or_insert_with(|| Reassembly {
            total: n,
            pieces: vec![None; n],
        });
        if buf.total != n {
            // Count changed mid-stream; start over with the new series.
            *buf = Reassembly {
                total: n,
                pieces: vec![None; n],
            };
        }
        buf.pieces[i - 1] = Some(piece.to_string());

        if buf.pieces.iter().all(|p| p.is_some()) {
            let whole = buf.pieces.iter().flatten().cloned().collect::<String>();
            self.reassembly = None;
            Ok(Some(whole))
        } else {
            Ok(None)
        }
    }
}

/// Split a wire payload into transmittable fragments.
fn fragment(wire: String) -> Vec<String> {
    if wire.len() <= FRAGMENT_SIZE {
        return vec![wire];
    }
    // Wire payloads are ASCII (prefix + base64), so byte chunking is safe.
    let total = wire.len().div_ceil(FRAGMENT_SIZE);
    wire.as_bytes()
        .chunks(FRAGMENT_SIZE)
        .enumerate()
        .map(|(i, chunk)| {
            format!(
                "{FRAG_PREFIX}{}/{}:{}",
                i + 1,
                total,
                String::from_utf8_lossy(chunk)
            )
        })
        .collect()
}

impl Conversation for E2eConversation {
    fn send(&mut self, plaintext: &str) -> Result<Vec<String>, EngineError> {
        if let Some(cipher) = self.cipher.clone() {
            return Ok(fragment(self.encrypt(&cipher, plaintext)?));
        }
        // Not yet encrypted: pass through in clear, offering our key once.
        if self.offered {
            Ok(vec![plaintext.to_string()])
        } else {
            self.offered = true;
            Ok(vec![self.our_offer(KEX_PREFIX), plaintext.to_string()])
        }
    }

    fn receive(&mut self, wire: &str) -> Result<(String, Vec<String>), EngineError> {
        if let Some(body) = wire.strip_prefix(FRAG_PREFIX) {
            return match self.ingest_fragment(body)? {
                Some(whole) => self.receive(&whole),
                None => Ok((String::new(), Vec::new())),
            };
        }
        if let Some(peer_pub) = wire.strip_prefix(KEX_PREFIX) {
            self.establish(peer_pub)?;
            return Ok((String::new(), vec![self.our_offer(KEXR_PREFIX)]));
        }
        if let Some(peer_pub) = wire.strip_prefix(KEXR_PREFIX) {
            self.establish(peer_pub)?;
            return Ok((String::new(), Vec::new()));
        }
        if let Some(body) = wire.strip_prefix(MSG_PREFIX) {
            return Ok((self.decrypt(body)?, Vec::new()));
        }
        // Plain chat from a peer without an established session.
        Ok((wire.to_string(), Vec::new()))
    }

    fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive two conversations until both are encrypted, the way the
    /// router would: transmit every fragment and reply to the other side.
    fn establish_pair() -> (Box<dyn Conversation>, Box<dyn Conversation>) {
        let alice_engine = E2eEngine::new();
        let bob_engine = E2eEngine::new();
        let mut alice = alice_engine.new_conversation();
        let mut bob = bob_engine.new_conversation();

        let out = alice.send("hello bob").unwrap();
        assert_eq!(out.len(), 2, "first send carries a key offer");
        assert!(!alice.is_encrypted());

        let mut replies_to_alice = Vec::new();
        for line in &out {
            let (pt, replies) = bob.receive(line).unwrap();
            if line.starts_with(KEX_PREFIX) {
                assert!(pt.is_empty(), "control traffic is not displayed");
            } else {
                assert_eq!(pt, "hello bob");
            }
            replies_to_alice.extend(replies);
        }
        assert!(bob.is_encrypted());

        for line in &replies_to_alice {
            let (pt, replies) = alice.receive(line).unwrap();
            assert!(pt.is_empty());
            assert!(replies.is_empty());
        }
        assert!(alice.is_encrypted());

        (alice, bob)
    }

    #[test]
    fn handshake_then_encrypted_roundtrip() {
        let (mut alice, mut bob) = establish_pair();

        let out = alice.send("secret").unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with(MSG_PREFIX));
        let (pt, replies) = bob.receive(&out[0]).unwrap();
        assert_eq!(pt, "secret");
        assert!(replies.is_empty());

        // And back the other way.
        let out = bob.send("reply").unwrap();
        let (pt, _) = alice.receive(&out[0]).unwrap();
        assert_eq!(pt, "reply");
    }

    #[test]
    fn long_plaintext_fragments_and_reassembles() {
        let (mut alice, mut bob) = establish_pair();

        let long: String = "x".repeat(FRAGMENT_SIZE * 3);
        let out = alice.send(&long).unwrap();
        assert!(out.len() > 1, "oversized payload must fragment");
        for frag in &out {
            assert!(frag.len() <= FRAG_PREFIX.len() + 16 + FRAGMENT_SIZE);
            assert!(frag.starts_with(FRAG_PREFIX));
        }

        let mut recovered = None;
        for frag in &out {
            let (pt, replies) = bob.receive(frag).unwrap();
            assert!(replies.is_empty());
            if !pt.is_empty() {
                assert!(recovered.is_none(), "only the last fragment completes");
                recovered = Some(pt);
            }
        }
        assert_eq!(recovered.as_deref(), Some(long.as_str()));
    }

    #[test]
    fn fragments_tolerate_reordering() {
        let (mut alice, mut bob) = establish_pair();

        let long: String = "y".repeat(FRAGMENT_SIZE * 2);
        let mut out = alice.send(&long).unwrap();
        out.reverse();

        let mut recovered = None;
        for frag in &out {
            let (pt, _) = bob.receive(frag).unwrap();
            if !pt.is_empty() {
                recovered = Some(pt);
            }
        }
        assert_eq!(recovered.as_deref(), Some(long.as_str()));
    }

    #[test]
    fn clear_send_offers_key_only_once() {
        let engine = E2eEngine::new();
        let mut conv = engine.new_conversation();

        let first = conv.send("one").unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].starts_with(KEX_PREFIX));
        assert_eq!(first[1], "one");

        let second = conv.send("two").unwrap();
        assert_eq!(second, vec!["two".to_string()]);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let (mut alice, mut bob) = establish_pair();

        let out = alice.send("secret").unwrap();
        let mut tampered = out[0].clone();
        let flipped = if tampered.ends_with('A') { 'B' } else { 'A' };
        tampered.pop();
        tampered.push(flipped);
        assert!(bob.receive(&tampered).is_err());

        // The session itself survives the failure.
        assert!(bob.is_encrypted());
        let ok = alice.send("again").unwrap();
        assert_eq!(bob.receive(&ok[0]).unwrap().0, "again");
    }

    #[test]
    fn encrypted_message_without_session_errors() {
        let engine = E2eEngine::new();
        let mut conv = engine.new_conversation();
        let err = conv.receive("?TIRC:MSG:AAAA:BBBB").unwrap_err();
        assert!(matches!(err, EngineError::NoSession));
    }

    #[test]
    fn plain_text_passes_through() {
        let engine = E2eEngine::new();
        let mut conv = engine.new_conversation();
        let (pt, replies) = conv.receive("just plain chat").unwrap();
        assert_eq!(pt, "just plain chat");
        assert!(replies.is_empty());
        assert!(!conv.is_encrypted());
    }
}

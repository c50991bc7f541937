//! Session crypto: X25519 key agreement, the role-ordered BLAKE2b KDF,
//! XChaCha20-Poly1305 AEAD framing and the 32-entry sliding replay window.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::ProtocolError as Error;
use crate::error::Result;
use crate::wire::NONCE_LEN;

type Blake2b256 = Blake2b<U32>;

/// Which side of the handshake we are: fixes the public-key ordering fed
/// into the KDF so both sides derive the same session secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The handshake responder (the sink).
    Server,
    /// The handshake initiator (the source).
    Client,
}

/// A long-lived X25519 identity. The sink generates one at startup and reuses
/// it across every admitted stream; the source generates one and reuses it
/// across handshake retries.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Raw X25519 scalar multiplication against a peer's public key.
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer = PublicKey::from(*peer_public);
        self.secret.diffie_hellman(&peer).to_bytes()
    }
}

/// BLAKE2b KDF over the raw scalar-mult product, optionally a preshared
/// constant, then the two public keys in role-dependent order.
pub fn derive_session_secret(
    role: Role,
    raw_shared: &[u8; 32],
    local_public: &[u8; 32],
    peer_public: &[u8; 32],
    psk: Option<&[u8]>,
) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(raw_shared);
    if let Some(psk) = psk {
        hasher.update(psk);
    }
    match role {
        Role::Server => {
            hasher.update(local_public);
            hasher.update(peer_public);
        }
        Role::Client => {
            hasher.update(peer_public);
            hasher.update(local_public);
        }
    }
    let digest = hasher.finalize();
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&digest);
    secret
}

/// Build a fresh 24-byte nonce: big-endian sequence number in the leading 8
/// bytes, random fill in the remaining 16.
pub fn build_nonce(seq: u64, rng: &mut impl RngCore) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&seq.to_be_bytes());
    rng.fill_bytes(&mut nonce[8..]);
    nonce
}

/// Recover the sequence number carried in the leading 8 bytes of a nonce.
pub fn nonce_sequence(nonce: &[u8; NONCE_LEN]) -> u64 {
    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&nonce[..8]);
    u64::from_be_bytes(seq_bytes)
}

/// No associated data: the stream id isn't bound into the ciphertext, only
/// carried alongside it in the outer frame. Binding it would harden the
/// design marginally; this keeps the framing interoperable with the
/// original wire format instead.
pub fn aead_encrypt(secret: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(secret));
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| Error::Fatal("AEAD encryption failed".into()))
}

pub fn aead_decrypt(secret: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(secret));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::AuthFailed)
}

/// Sliding 32-entry anti-replay window keyed by the nonce's leading sequence
/// number. `highest_seen` only ever advances forward.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    highest_seen: u64,
    window: u32,
    initialized: bool,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn highest_seen(&self) -> u64 {
        self.highest_seen
    }

    /// Non-mutating check: would `seq` be accepted right now? Call `accept`
    /// only after the packet has authenticated.
    pub fn would_accept(&self, seq: u64) -> bool {
        if !self.initialized {
            return true;
        }
        if seq > self.highest_seen {
            return true;
        }
        let back = self.highest_seen - seq;
        if back >= 32 {
            return false;
        }
        self.window & (1u32 << back) == 0
    }

    /// Marks `seq` as seen and advances `highest_seen` if it is the new
    /// high point. Must only be called for a `seq` that just passed
    /// `would_accept` and then authenticated; calling it unconditionally
    /// would let a forged, unauthenticated nonce desync the window.
    pub fn accept(&mut self, seq: u64) {
        if !self.initialized {
            self.initialized = true;
            self.highest_seen = seq;
            self.window = 1;
            return;
        }
        if seq > self.highest_seen {
            let shift = seq - self.highest_seen;
            self.window = if shift >= 32 { 1 } else { (self.window << shift) | 1 };
            self.highest_seen = seq;
            return;
        }
        let back = self.highest_seen - seq;
        self.window |= 1u32 << back;
    }

    /// Convenience for callers (and tests) that don't need to interleave an
    /// AEAD check between the window check and the update: checks `seq`
    /// and, if accepted, immediately marks it seen.
    pub fn check_and_update(&mut self, seq: u64) -> bool {
        if !self.would_accept(seq) {
            return false;
        }
        self.accept(seq);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn both_sides_derive_identical_secret() {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let client_pub = client.public_bytes();
        let server_pub = server.public_bytes();

        let client_raw = client.diffie_hellman(&server_pub);
        let server_raw = server.diffie_hellman(&client_pub);
        assert_eq!(client_raw, server_raw);

        let client_secret =
            derive_session_secret(Role::Client, &client_raw, &client_pub, &server_pub, None);
        let server_secret =
            derive_session_secret(Role::Server, &server_raw, &server_pub, &client_pub, None);
        assert_eq!(client_secret, server_secret);
    }

    #[test]
    fn mismatched_role_yields_different_secret() {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let client_pub = client.public_bytes();
        let server_pub = server.public_bytes();
        let raw = client.diffie_hellman(&server_pub);

        let as_client = derive_session_secret(Role::Client, &raw, &client_pub, &server_pub, None);
        let as_server = derive_session_secret(Role::Server, &raw, &client_pub, &server_pub, None);
        assert_ne!(as_client, as_server);
    }

    #[test]
    fn psk_changes_derived_secret() {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let client_pub = client.public_bytes();
        let server_pub = server.public_bytes();
        let raw = client.diffie_hellman(&server_pub);

        let without = derive_session_secret(Role::Client, &raw, &client_pub, &server_pub, None);
        let with = derive_session_secret(
            Role::Client,
            &raw,
            &client_pub,
            &server_pub,
            Some(b"shared-secret"),
        );
        assert_ne!(without, with);
    }

    #[test]
    fn encrypt_decrypt_round_trips_and_nonce_advances() {
        let secret = [5u8; 32];
        let mut rng = rand::thread_rng();
        let mut write_nonce = 0u64;

        write_nonce += 1;
        let nonce = build_nonce(write_nonce, &mut rng);
        let plaintext = b"stream payload";
        let ciphertext = aead_encrypt(&secret, &nonce, plaintext).unwrap();
        let decrypted = aead_decrypt(&secret, &nonce, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
        assert_eq!(write_nonce, 1);
        assert_eq!(nonce_sequence(&nonce), 1);
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let secret = [9u8; 32];
        let mut rng = rand::thread_rng();
        let nonce = build_nonce(1, &mut rng);
        let mut ciphertext = aead_encrypt(&secret, &nonce, b"hello").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(matches!(
            aead_decrypt(&secret, &nonce, &ciphertext),
            Err(Error::AuthFailed)
        ));
    }

    #[test]
    fn two_outbound_nonces_never_collide() {
        let mut rng = rand::thread_rng();
        let a = build_nonce(1, &mut rng);
        let b = build_nonce(2, &mut rng);
        assert_ne!(a, b);
    }

    #[test]
    fn replay_window_boundary_behaviors() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(100));
        assert_eq!(window.highest_seen(), 100);

        // Equal to highest_seen: replay.
        assert!(!window.check_and_update(100));
        // highest_seen + 1: accepted, advances.
        assert!(window.check_and_update(101));
        assert_eq!(window.highest_seen(), 101);
        // Replaying 101 now rejected.
        assert!(!window.check_and_update(101));
        // highest_seen + 1000: accepted, clears window, advances.
        assert!(window.check_and_update(1101));
        assert_eq!(window.highest_seen(), 1101);
        // The window was cleared, so 101 (now far behind) is rejected as too old.
        assert!(!window.check_and_update(101));
    }

    #[test]
    fn replay_window_rejects_anything_at_or_below_floor() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(1000));
        // seq + 32 <= highest_seen => reject
        assert!(!window.check_and_update(968));
        // one past the floor is still within the window and accepted once.
        assert!(window.check_and_update(969));
        assert!(!window.check_and_update(969));
    }
}

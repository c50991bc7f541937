//! Per-stream lifecycle: the state machine, session secret, outbound nonce
//! counter and inbound replay window that both the sink's slot table and the
//! source's single session sit on top of.

use std::time::{Duration, Instant};

use crate::crypto::{self, ReplayWindow, Role};
use crate::error::ProtocolError as Error;
use crate::error::Result;
use crate::wire::{AudioConfig, NONCE_LEN};

/// How often a live stream emits a heartbeat when it has no audio to send.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// How long a stream may go without any received traffic before it is
/// considered dead and torn down.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Source-side name for the same bound: how long the source waits for a
/// handshake response (or lets its send path go quiet) before resetting
/// and resending `HANDSHAKE_INIT`. Numerically identical to
/// `LIVENESS_TIMEOUT`; kept as its own constant because the spec names it
/// separately for the source's retry cadence.
pub const HEARTBEAT_TIMEOUT: Duration = LIVENESS_TIMEOUT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Slot is unused (sink) or no handshake attempted yet (source).
    Empty,
    /// Handshake init/response exchanged, session secret not yet confirmed
    /// by a decrypted packet.
    Handshaking,
    /// At least one packet has been successfully decrypted on this session.
    Active,
    /// Torn down; the slot/session may be reused (sink) or the source must
    /// start a fresh handshake.
    Closed,
}

/// One end of an established (or establishing) stream.
pub struct Session {
    stream_id: u8,
    state: State,
    role: Role,
    secret: Option<[u8; 32]>,
    audio: Option<AudioConfig>,
    write_nonce: u64,
    replay: ReplayWindow,
    last_activity: Instant,
    last_heartbeat_sent: Instant,
}

impl Session {
    pub fn new(stream_id: u8, role: Role) -> Self {
        let now = Instant::now();
        Self {
            stream_id,
            state: State::Empty,
            role,
            secret: None,
            audio: None,
            write_nonce: 0,
            replay: ReplayWindow::new(),
            last_activity: now,
            last_heartbeat_sent: now,
        }
    }

    pub fn stream_id(&self) -> u8 {
        self.stream_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn audio_config(&self) -> Option<AudioConfig> {
        self.audio
    }

    /// Moves the session into `Handshaking` once a session secret has been
    /// derived from the key exchange. Used by the source side: it has sent
    /// `HANDSHAKE_INIT` and is waiting on `HANDSHAKE_RESPONSE`.
    pub fn begin_handshake(&mut self, secret: [u8; 32], audio: AudioConfig) {
        self.secret = Some(secret);
        self.audio = Some(audio);
        self.state = State::Handshaking;
        self.write_nonce = 0;
        self.replay = ReplayWindow::new();
        self.touch();
        self.mark_heartbeat_sent();
    }

    /// Installs a freshly derived session secret and moves straight to
    /// `Active`, per the sink's `EMPTY --HANDSHAKE_INIT received--> ACTIVE`
    /// transition. A sink slot is therefore never observed in `Handshaking`.
    pub fn complete_handshake(&mut self, secret: [u8; 32], audio: AudioConfig) {
        self.secret = Some(secret);
        self.audio = Some(audio);
        self.state = State::Active;
        self.write_nonce = 0;
        self.replay = ReplayWindow::new();
        self.touch();
        self.mark_heartbeat_sent();
    }

    pub fn close(&mut self) {
        self.state = State::Closed;
        self.secret = None;
    }

    /// Resets the slot back to `Empty` so it can be admitted again.
    pub fn reset(&mut self) {
        self.state = State::Empty;
        self.secret = None;
        self.audio = None;
        self.write_nonce = 0;
        self.replay = ReplayWindow::new();
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// True once `LIVENESS_TIMEOUT` has elapsed since the last accepted
    /// packet. `Empty`/`Closed` sessions are never considered stale.
    pub fn is_stale(&self) -> bool {
        matches!(self.state, State::Handshaking | State::Active)
            && self.last_activity.elapsed() >= LIVENESS_TIMEOUT
    }

    /// True if a heartbeat is due because nothing has gone out in
    /// `HEARTBEAT_INTERVAL`.
    pub fn heartbeat_due(&self) -> bool {
        matches!(self.state, State::Active)
            && self.last_heartbeat_sent.elapsed() >= HEARTBEAT_INTERVAL
    }

    /// True once `LIVENESS_TIMEOUT` has elapsed since we last managed to
    /// send anything at all on this session. A source has no inbound
    /// traffic to judge liveness by once handshaken, so it falls back to
    /// this self-check as a stall detector for its own send path.
    pub fn send_stalled(&self) -> bool {
        matches!(self.state, State::Handshaking | State::Active)
            && self.last_heartbeat_sent.elapsed() >= LIVENESS_TIMEOUT
    }

    pub fn mark_heartbeat_sent(&mut self) {
        self.last_heartbeat_sent = Instant::now();
    }

    /// Allocates the next outbound nonce, advancing the write counter.
    pub fn next_nonce(&mut self, rng: &mut impl rand::RngCore) -> [u8; NONCE_LEN] {
        self.write_nonce += 1;
        crypto::build_nonce(self.write_nonce, rng)
    }

    /// Encrypts `plaintext` under this session's secret with a freshly
    /// allocated nonce.
    pub fn encrypt(&mut self, plaintext: &[u8], rng: &mut impl rand::RngCore) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
        let secret = self.secret.ok_or(Error::Fatal("encrypt before handshake".into()))?;
        let nonce = self.next_nonce(rng);
        let ciphertext = crypto::aead_encrypt(&secret, &nonce, plaintext)?;
        Ok((ciphertext, nonce))
    }

    /// Verifies the replay window, decrypts, and on success moves the
    /// session to `Active` and records the activity timestamp. Replay and
    /// auth failures leave both the session state and the replay window
    /// untouched: the window is only peeked (`would_accept`) before AEAD
    /// runs, and only mutated (`accept`) after AEAD succeeds, so a forged
    /// packet with a fresh-looking nonce but garbage ciphertext can never
    /// desync the window for the packets that follow it.
    pub fn decrypt(&mut self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let secret = self.secret.ok_or(Error::Fatal("decrypt before handshake".into()))?;
        let seq = crypto::nonce_sequence(nonce);
        if !self.replay.would_accept(seq) {
            return Err(Error::ReplayRejected);
        }
        let plaintext = crypto::aead_decrypt(&secret, nonce, ciphertext)?;
        self.replay.accept(seq);
        self.state = State::Active;
        self.touch();
        Ok(plaintext)
    }
}

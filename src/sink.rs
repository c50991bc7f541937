//! The sink: listens for UDP datagrams from any number of sources,
//! multiplexes them across a fixed slot table, decodes and mixes each
//! stream's audio independently, and tears a slot down once its session
//! goes stale.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::audio;
use crate::codec::{Codec, FrameDecoder};
use crate::crypto::{self, Keypair, Role};
use crate::error::ProtocolError as Error;
use crate::error::Result;
use crate::ring::RingBuffer;
use crate::session::{Session, State};
use crate::wire::{self, AudioConfig, Message};

/// Slots never look past the first `LIVENESS_TIMEOUT` window before the
/// socket poll cadence below catches them; this is simply how often we
/// check, not a protocol timing.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Ring buffer sized for roughly 1 second of 48kHz stereo f32 audio,
/// comfortably larger than any single decoded frame.
const RING_CAPACITY_BYTES: usize = 48_000 * 2 * 4;

struct Slot {
    session: Session,
    addr: Option<SocketAddr>,
    decoder: Option<Codec>,
    ring: Option<Arc<RingBuffer>>,
    stream: Option<cpal::Stream>,
}

impl Slot {
    fn new(stream_id: u8) -> Self {
        Self {
            session: Session::new(stream_id, Role::Server),
            addr: None,
            decoder: None,
            ring: None,
            stream: None,
        }
    }

    fn teardown(&mut self) {
        self.session.close();
        self.session.reset();
        self.addr = None;
        self.decoder = None;
        self.ring = None;
        self.stream = None;
    }
}

pub struct SinkOptions {
    pub port: u16,
    pub slots: usize,
    pub psk: Option<Vec<u8>>,
    pub device: Option<String>,
}

/// Runs the sink until `running` is cleared. Blocking; call from a
/// dedicated thread or directly from `main`.
pub fn run(options: SinkOptions, running: Arc<AtomicBool>) -> Result<()> {
    let keypair = Keypair::generate();
    let socket = UdpSocket::bind(("0.0.0.0", options.port))
        .map_err(|e| Error::Fatal(format!("binding UDP socket on port {}: {e}", options.port)))?;
    socket
        .set_read_timeout(Some(POLL_TIMEOUT))
        .map_err(|e| Error::Fatal(format!("setting socket read timeout: {e}")))?;
    info!(port = options.port, slots = options.slots, "sink listening");

    let mut slots: Vec<Slot> = (0..options.slots).map(|i| Slot::new(i as u8)).collect();
    let mut buf = vec![0u8; wire::MAX_DATAGRAM];
    let mut out = vec![0u8; wire::MAX_DATAGRAM];

    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => {
                match handle_datagram(
                    &keypair,
                    options.psk.as_deref(),
                    options.device.as_deref(),
                    &socket,
                    addr,
                    &buf[..n],
                    &mut out,
                    &mut slots,
                ) {
                    Ok(()) => {}
                    Err(Error::Fatal(msg)) => return Err(Error::Fatal(msg)),
                    Err(err) => warn!(%err, %addr, "dropping datagram"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => warn!(error = %e, "recv_from failed"),
        }
        run_liveness_tick(&socket, &mut out, &mut slots)?;
    }
    shutdown_active_slots(&socket, &mut out, &mut slots);
    Ok(())
}

/// Best-effort `STREAM_TERMINATE` to every still-active slot on the way out,
/// mirroring the source's own shutdown behavior. Send failures are logged
/// and otherwise ignored; the process is exiting regardless.
fn shutdown_active_slots(socket: &UdpSocket, out: &mut [u8], slots: &mut [Slot]) {
    let mut rng = rand::thread_rng();
    for slot in slots.iter_mut() {
        if slot.session.state() == State::Active {
            if let Err(err) = send_terminate(socket, slot, out, &mut rng) {
                warn!(%err, stream_id = slot.session.stream_id(), "failed to send terminate on shutdown");
            }
            slot.teardown();
        }
    }
}

/// Once per poll: evict sessions that have gone quiet past `LIVENESS_TIMEOUT`,
/// and send a heartbeat to any still-active slot that hasn't heard a
/// heartbeat deadline of its own elapse (`HEARTBEAT_INTERVAL`). A `Fatal`
/// send error (the socket itself failing) propagates out of `run()`, same as
/// a `Fatal` error from the receive path.
fn run_liveness_tick(socket: &UdpSocket, out: &mut [u8], slots: &mut [Slot]) -> Result<()> {
    let mut rng = rand::thread_rng();
    for slot in slots.iter_mut() {
        if slot.session.is_stale() {
            info!(stream_id = slot.session.stream_id(), "stream timed out, closing");
            match send_terminate(socket, slot, out, &mut rng) {
                Ok(()) => {}
                Err(Error::Fatal(msg)) => return Err(Error::Fatal(msg)),
                Err(err) => warn!(%err, stream_id = slot.session.stream_id(), "failed to send terminate"),
            }
            slot.teardown();
            continue;
        }
        if slot.session.heartbeat_due() {
            match send_heartbeat(socket, slot, out, &mut rng) {
                Ok(()) => slot.session.mark_heartbeat_sent(),
                Err(Error::Fatal(msg)) => return Err(Error::Fatal(msg)),
                Err(err) => warn!(%err, stream_id = slot.session.stream_id(), "failed to send heartbeat"),
            }
        }
    }
    Ok(())
}

fn send_heartbeat(socket: &UdpSocket, slot: &mut Slot, out: &mut [u8], rng: &mut impl rand::RngCore) -> Result<()> {
    let addr = slot.addr.ok_or(Error::UnknownStream(slot.session.stream_id()))?;
    let mut inner = [0u8; 1];
    let inner_len = wire::write_inner_heartbeat(&mut inner)?;
    send_to_slot(socket, slot, addr, &inner[..inner_len], out, rng)
}

fn send_terminate(socket: &UdpSocket, slot: &mut Slot, out: &mut [u8], rng: &mut impl rand::RngCore) -> Result<()> {
    let addr = slot.addr.ok_or(Error::UnknownStream(slot.session.stream_id()))?;
    let mut inner = [0u8; 1];
    let inner_len = wire::write_inner_terminate(&mut inner)?;
    send_to_slot(socket, slot, addr, &inner[..inner_len], out, rng)
}

fn send_to_slot(
    socket: &UdpSocket,
    slot: &mut Slot,
    addr: SocketAddr,
    inner: &[u8],
    out: &mut [u8],
    rng: &mut impl rand::RngCore,
) -> Result<()> {
    let (ciphertext, nonce) = slot.session.encrypt(inner, rng)?;
    let n = wire::write_crypto(out, slot.session.stream_id(), &nonce, &ciphertext)?;
    socket
        .send_to(&out[..n], addr)
        .map_err(|e| Error::Fatal(format!("sending sink packet: {e}")))?;
    Ok(())
}

fn handle_datagram(
    keypair: &Keypair,
    psk: Option<&[u8]>,
    device: Option<&str>,
    socket: &UdpSocket,
    addr: SocketAddr,
    datagram: &[u8],
    out: &mut [u8],
    slots: &mut [Slot],
) -> Result<()> {
    match wire::parse(datagram)? {
        Message::HandshakeInit { public_key, audio } => {
            handle_handshake_init(keypair, psk, device, socket, addr, &public_key, audio, out, slots)
        }
        Message::Crypto {
            stream_id,
            nonce,
            ciphertext,
        } => handle_crypto(stream_id, &nonce, ciphertext, slots),
        Message::HandshakeResponse { .. } => {
            Err(Error::MalformedFrame("sink does not expect handshake responses"))
        }
    }
}

fn handle_handshake_init(
    keypair: &Keypair,
    psk: Option<&[u8]>,
    device: Option<&str>,
    socket: &UdpSocket,
    addr: SocketAddr,
    peer_public: &[u8; 32],
    audio: AudioConfig,
    out: &mut [u8],
    slots: &mut [Slot],
) -> Result<()> {
    let slot = select_empty_slot(slots).ok_or(Error::AdmitFull)?;

    let local_public = keypair.public_bytes();
    let raw_shared = keypair.diffie_hellman(peer_public);
    let secret = crypto::derive_session_secret(Role::Server, &raw_shared, &local_public, peer_public, psk);

    let decoder = Codec::new(&audio)?;
    let ring = Arc::new(RingBuffer::new(RING_CAPACITY_BYTES));
    let stream = open_playback(device, &audio, ring.clone())?;

    slot.session.complete_handshake(secret, audio);
    slot.addr = Some(addr);
    slot.decoder = Some(decoder);
    slot.ring = Some(ring);
    slot.stream = Some(stream);

    let stream_id = slot.session.stream_id();
    let n = wire::write_handshake_response(out, stream_id, &local_public)?;
    socket
        .send_to(&out[..n], addr)
        .map_err(|e| Error::Fatal(format!("sending handshake response: {e}")))?;
    info!(%addr, stream_id, "admitted new stream");
    Ok(())
}

/// Ascending-id scan for the first `Empty` slot; first-wins, no eviction of
/// an `Active` slot ever happens here. Split out from `handle_handshake_init`
/// so the admission-control tie-break (spec §4.4, property 9) is testable
/// without opening a real playback device.
fn select_empty_slot(slots: &mut [Slot]) -> Option<&mut Slot> {
    slots.iter_mut().find(|s| s.session.state() == State::Empty)
}

fn open_playback(device: Option<&str>, audio: &AudioConfig, ring: Arc<RingBuffer>) -> Result<cpal::Stream> {
    use cpal::traits::HostTrait;
    let host = cpal::default_host();
    let dev = match device {
        Some(name) => {
            let (_, outputs) = audio::list_devices()?;
            audio::find_by_name_prefix(&outputs, name)
                .cloned()
                .ok_or_else(|| Error::AudioOpenFailed(format!("no output device matching '{name}'")))?
        }
        None => host
            .default_output_device()
            .ok_or_else(|| Error::AudioOpenFailed("no default output device".into()))?,
    };
    audio::build_playback_stream(&dev, audio, ring, Arc::new(AtomicBool::new(true)))
}

fn handle_crypto(stream_id: u8, nonce: &[u8; wire::NONCE_LEN], ciphertext: &[u8], slots: &mut [Slot]) -> Result<()> {
    let slot = slots
        .get_mut(stream_id as usize)
        .filter(|s| s.session.state() == State::Active)
        .ok_or(Error::UnknownStream(stream_id))?;

    let plaintext = slot.session.decrypt(nonce, ciphertext)?;
    match wire::parse_inner(&plaintext)? {
        wire::InnerMessage::StreamData { frame_size, opus } => {
            let audio = slot.session.audio_config().ok_or(Error::DecodeFailed)?;
            let channels = audio.channel_count.max(1) as usize;
            let sample_size = audio.sample_format.sample_size();
            let decoder = slot.decoder.as_mut().ok_or(Error::DecodeFailed)?;
            let mut pcm = vec![0u8; frame_size as usize * channels * sample_size];
            decoder.decode(opus, &mut pcm)?;
            if let Some(ring) = &slot.ring {
                if let Err(overflow) = ring.write(&pcm) {
                    let err = Error::RingOverflow;
                    warn!(%err, stream_id, requested = overflow.requested, free = overflow.free);
                }
            }
            Ok(())
        }
        wire::InnerMessage::StreamHeartbeat => Ok(()),
        wire::InnerMessage::StreamTerminate => {
            info!(stream_id, "stream terminated by peer");
            slot.teardown();
            Ok(())
        }
    }
}

/// Protocol/session-level integration tests for the scenarios named in the
/// spec. These never touch a real socket or audio device: `handle_crypto`
/// and `select_empty_slot` are exercised directly against hand-built
/// `Slot`s standing in for the socket/device boundary, per this crate's own
/// documented seam for testing the sink without hardware.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameEncoder;
    use pretty_assertions::assert_eq;

    fn sample_audio() -> AudioConfig {
        AudioConfig {
            channel_count: 2,
            sample_format: crate::wire::SampleFormat::F32,
            frame_size: 960,
            sample_rate: 48_000,
        }
    }

    /// An `Active` slot with a real decoder and ring but no playback stream,
    /// standing in for a device-free `handle_handshake_init`.
    fn active_slot(stream_id: u8, secret: [u8; 32], audio: AudioConfig) -> Slot {
        let mut session = Session::new(stream_id, Role::Server);
        session.complete_handshake(secret, audio);
        Slot {
            session,
            addr: Some("127.0.0.1:0".parse().unwrap()),
            decoder: Some(Codec::new(&audio).unwrap()),
            ring: Some(Arc::new(RingBuffer::new(RING_CAPACITY_BYTES))),
            stream: None,
        }
    }

    #[test]
    fn s1_clean_handshake_and_one_frame_round_trip() {
        let audio = sample_audio();
        let secret = [9u8; 32];
        let slot = active_slot(0, secret, audio);

        let mut source = Session::new(0, Role::Client);
        source.begin_handshake(secret, audio);
        let mut rng = rand::thread_rng();

        let mut encoder = Codec::new(&audio).unwrap();
        let pcm_silence = vec![0u8; audio.frame_size as usize * audio.channel_count as usize * 4];
        let mut opus_buf = vec![0u8; wire::MAX_DATAGRAM];
        let written = encoder.encode(&pcm_silence, &mut opus_buf).unwrap();

        let mut inner_buf = vec![0u8; wire::MAX_DATAGRAM];
        let inner_len = wire::write_inner_stream_data(&mut inner_buf, audio.frame_size, &opus_buf[..written]).unwrap();
        let (ciphertext, nonce) = source.encrypt(&inner_buf[..inner_len], &mut rng).unwrap();

        let mut slots = [slot];
        handle_crypto(0, &nonce, &ciphertext, &mut slots).unwrap();

        // 2 channels * 4 bytes (f32) * 960 samples = 7680 bytes of decoded
        // silence now sitting in the sink's ring, per spec scenario S1.
        assert_eq!(slots[0].ring.as_ref().unwrap().fill(), 7_680);
    }

    #[test]
    fn s2_replayed_packet_is_rejected_and_ring_does_not_advance() {
        let audio = sample_audio();
        let secret = [3u8; 32];
        let slot = active_slot(0, secret, audio);

        let mut source = Session::new(0, Role::Client);
        source.begin_handshake(secret, audio);
        let mut rng = rand::thread_rng();

        let mut encoder = Codec::new(&audio).unwrap();
        let pcm_silence = vec![0u8; audio.frame_size as usize * audio.channel_count as usize * 4];
        let mut opus_buf = vec![0u8; wire::MAX_DATAGRAM];
        let written = encoder.encode(&pcm_silence, &mut opus_buf).unwrap();
        let mut inner_buf = vec![0u8; wire::MAX_DATAGRAM];
        let inner_len = wire::write_inner_stream_data(&mut inner_buf, audio.frame_size, &opus_buf[..written]).unwrap();
        let (ciphertext, nonce) = source.encrypt(&inner_buf[..inner_len], &mut rng).unwrap();

        let mut slots = [slot];
        handle_crypto(0, &nonce, &ciphertext, &mut slots).unwrap();
        let fill_after_first = slots[0].ring.as_ref().unwrap().fill();

        let replay = handle_crypto(0, &nonce, &ciphertext, &mut slots);
        assert!(matches!(replay, Err(Error::ReplayRejected)));
        assert_eq!(slots[0].ring.as_ref().unwrap().fill(), fill_after_first);
    }

    #[test]
    fn s5_multi_session_isolation() {
        let audio = sample_audio();
        let secret_a = [1u8; 32];
        let secret_b = [2u8; 32];
        let mut slots = [active_slot(0, secret_a, audio), active_slot(1, secret_b, audio)];

        let mut source_a = Session::new(0, Role::Client);
        source_a.begin_handshake(secret_a, audio);
        let mut source_b = Session::new(1, Role::Client);
        source_b.begin_handshake(secret_b, audio);

        let mut rng = rand::thread_rng();
        let mut encoder = Codec::new(&audio).unwrap();
        let pcm_silence = vec![0u8; audio.frame_size as usize * audio.channel_count as usize * 4];
        let mut opus_buf = vec![0u8; wire::MAX_DATAGRAM];
        let written = encoder.encode(&pcm_silence, &mut opus_buf).unwrap();
        let mut inner_buf = vec![0u8; wire::MAX_DATAGRAM];
        let inner_len = wire::write_inner_stream_data(&mut inner_buf, audio.frame_size, &opus_buf[..written]).unwrap();

        // A sends 3 good frames, one corrupted frame; B sends 2 good frames.
        for _ in 0..3 {
            let (ciphertext, nonce) = source_a.encrypt(&inner_buf[..inner_len], &mut rng).unwrap();
            handle_crypto(0, &nonce, &ciphertext, &mut slots).unwrap();
        }
        let (mut corrupted, nonce) = source_a.encrypt(&inner_buf[..inner_len], &mut rng).unwrap();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        let corrupted_result = handle_crypto(0, &nonce, &corrupted, &mut slots);
        assert!(matches!(corrupted_result, Err(Error::AuthFailed)));

        for _ in 0..2 {
            let (ciphertext, nonce) = source_b.encrypt(&inner_buf[..inner_len], &mut rng).unwrap();
            handle_crypto(1, &nonce, &ciphertext, &mut slots).unwrap();
        }

        let frame_bytes = audio.frame_size as usize * audio.channel_count as usize * 4;
        assert_eq!(slots[0].ring.as_ref().unwrap().fill(), 3 * frame_bytes);
        assert_eq!(slots[1].ring.as_ref().unwrap().fill(), 2 * frame_bytes);
    }

    #[test]
    fn property9_admission_full_yields_no_slot_and_no_state_change() {
        let audio = sample_audio();
        let mut slots: Vec<Slot> = (0u8..2).map(Slot::new).collect();
        for slot in slots.iter_mut() {
            slot.session.complete_handshake([5u8; 32], audio);
        }
        assert!(select_empty_slot(&mut slots).is_none());
    }

    #[test]
    fn slot_assignment_walks_ascending_id_for_first_empty() {
        let audio = sample_audio();
        let mut slots: Vec<Slot> = (0u8..3).map(Slot::new).collect();
        slots[0].session.complete_handshake([5u8; 32], audio);
        let chosen = select_empty_slot(&mut slots).unwrap();
        assert_eq!(chosen.session.stream_id(), 1);
    }
}

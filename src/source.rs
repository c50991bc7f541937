//! The source: captures from a local input device, encodes and encrypts
//! each frame, and streams it to a single sink over UDP. One source holds
//! exactly one session; if the handshake goes unanswered it retries.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use rand::rngs::ThreadRng;
use tracing::{info, warn};

use crate::audio;
use crate::codec::{Codec, FrameEncoder};
use crate::crypto::{self, Keypair, Role};
use crate::error::ProtocolError as Error;
use crate::error::Result;
use crate::session::{Session, State, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT};
use crate::wire::{self, AudioConfig, Message};

const CAPTURE_CHANNEL_DEPTH: usize = 32;

pub struct SourceOptions {
    pub host: String,
    pub port: u16,
    pub psk: Option<Vec<u8>>,
    pub device: Option<String>,
}

/// Runs the source until `running` is cleared. Blocking.
pub fn run(options: SourceOptions, running: Arc<AtomicBool>) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| Error::Fatal(format!("binding UDP socket: {e}")))?;
    socket
        .connect((options.host.as_str(), options.port))
        .map_err(|e| Error::Fatal(format!("connecting to {}:{}: {e}", options.host, options.port)))?;
    socket
        .set_read_timeout(Some(Duration::from_secs(1)))
        .map_err(|e| Error::Fatal(format!("setting socket read timeout: {e}")))?;

    let dev = open_capture_device(options.device.as_deref())?;
    let audio_config = audio::default_capture_config(&dev)?;
    let keypair = Keypair::generate();

    while running.load(Ordering::Relaxed) {
        match handshake(&socket, &keypair, options.psk.as_deref(), &audio_config, &running) {
            Ok(session) => {
                match run_stream(&socket, &dev, &audio_config, session, &running) {
                    Ok(()) => {}
                    Err(Error::Fatal(msg)) => return Err(Error::Fatal(msg)),
                    Err(err) => warn!(%err, "stream aborted, will re-handshake"),
                }
            }
            Err(Error::HandshakeTimeout) => {
                warn!("heartbeat timeout, re-attempting handshake");
            }
            Err(Error::Fatal(msg)) => return Err(Error::Fatal(msg)),
            Err(err) => warn!(%err, "handshake attempt failed, retrying"),
        }
    }
    Ok(())
}

fn open_capture_device(device: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::HostTrait;
    let host = cpal::default_host();
    match device {
        Some(name) => {
            let (inputs, _) = audio::list_devices()?;
            audio::find_by_name_prefix(&inputs, name)
                .cloned()
                .ok_or_else(|| Error::AudioOpenFailed(format!("no input device matching '{name}'")))
        }
        None => host
            .default_input_device()
            .ok_or_else(|| Error::AudioOpenFailed("no default input device".into())),
    }
}

/// Sends `HANDSHAKE_INIT` and waits up to `HEARTBEAT_TIMEOUT` for a reply.
/// Returns `Err(HandshakeTimeout)` (not fatal) if nothing answers, so the
/// caller loops back and retries at roughly `HEARTBEAT_TIMEOUT` intervals.
fn handshake(
    socket: &UdpSocket,
    keypair: &Keypair,
    psk: Option<&[u8]>,
    audio_config: &AudioConfig,
    running: &Arc<AtomicBool>,
) -> Result<Session> {
    let local_public = keypair.public_bytes();
    let mut out = vec![0u8; wire::MAX_DATAGRAM];
    let mut buf = vec![0u8; wire::MAX_DATAGRAM];

    let n = wire::write_handshake_init(&mut out, &local_public, audio_config)?;
    socket
        .send(&out[..n])
        .map_err(|e| Error::Fatal(format!("sending handshake init: {e}")))?;

    let deadline = Instant::now() + HEARTBEAT_TIMEOUT;
    while Instant::now() < deadline && running.load(Ordering::Relaxed) {
        match socket.recv(&mut buf) {
            Ok(n) => {
                if let Message::HandshakeResponse { stream_id, public_key } = wire::parse(&buf[..n])? {
                    let raw_shared = keypair.diffie_hellman(&public_key);
                    let secret = crypto::derive_session_secret(
                        Role::Client,
                        &raw_shared,
                        &local_public,
                        &public_key,
                        psk,
                    );
                    let mut session = Session::new(stream_id, Role::Client);
                    session.begin_handshake(secret, *audio_config);
                    info!(stream_id, "handshake established");
                    return Ok(session);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(Error::Fatal(format!("recv failed during handshake: {e}"))),
        }
    }
    Err(Error::HandshakeTimeout)
}

fn run_stream(
    socket: &UdpSocket,
    dev: &cpal::Device,
    audio_config: &AudioConfig,
    mut session: Session,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    let (tx, rx) = bounded::<Vec<u8>>(CAPTURE_CHANNEL_DEPTH);
    let capture_running = Arc::new(AtomicBool::new(true));
    let stream = audio::build_capture_stream(dev, audio_config, capture_running.clone(), move |frame| {
        let _ = tx.try_send(frame.to_vec());
    })?;

    let mut codec = Codec::new(audio_config)?;
    let mut rng: ThreadRng = rand::thread_rng();
    let mut out = vec![0u8; wire::MAX_DATAGRAM];
    let mut opus_scratch = vec![0u8; wire::MAX_DATAGRAM];
    let mut inner_scratch = vec![0u8; wire::MAX_DATAGRAM];

    // Once established there is nothing coming back from the sink to judge
    // liveness by (the protocol has no acks), so unlike the sink's slots
    // this session never goes stale on its own; it runs until the process
    // is asked to stop.
    let result = (|| -> Result<()> {
        while running.load(Ordering::Relaxed) {
            if session.send_stalled() {
                warn!("send path stalled past the liveness window, re-handshaking");
                break;
            }
            match rx.recv_timeout(HEARTBEAT_INTERVAL) {
                Ok(frame) => {
                    let written = codec.encode(&frame, &mut opus_scratch)?;
                    let inner_len =
                        wire::write_inner_stream_data(&mut inner_scratch, audio_config.frame_size, &opus_scratch[..written])?;
                    send_encrypted(socket, &mut session, &inner_scratch[..inner_len], &mut out, &mut rng)?;
                    session.mark_heartbeat_sent();
                }
                Err(RecvTimeoutError::Timeout) => {
                    let inner_len = wire::write_inner_heartbeat(&mut inner_scratch)?;
                    send_encrypted(socket, &mut session, &inner_scratch[..inner_len], &mut out, &mut rng)?;
                    session.mark_heartbeat_sent();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if matches!(session.state(), State::Active | State::Handshaking) {
            let inner_len = wire::write_inner_terminate(&mut inner_scratch)?;
            let _ = send_encrypted(socket, &mut session, &inner_scratch[..inner_len], &mut out, &mut rng);
        }
        Ok(())
    })();

    capture_running.store(false, Ordering::Relaxed);
    drop(stream);
    result
}

fn send_encrypted(
    socket: &UdpSocket,
    session: &mut Session,
    inner: &[u8],
    out: &mut [u8],
    rng: &mut impl rand::RngCore,
) -> Result<()> {
    let (ciphertext, nonce) = session.encrypt(inner, rng)?;
    let n = wire::write_crypto(out, session.stream_id(), &nonce, &ciphertext)?;
    socket
        .send(&out[..n])
        .map_err(|e| Error::Fatal(format!("sending stream packet: {e}")))?;
    Ok(())
}

//! Packet framing: the five message types, their byte-exact layouts, and a
//! zero-allocation parser. Every datagram carries exactly one logical
//! message; the first byte is the outer message type.
//!
//! Layouts (all multi-byte integers big-endian):
//!
//! ```text
//! HANDSHAKE_INIT      u8 keylen(=32) [keylen]pubkey u8 channels u8 fmt u16 frame_size u32 rate
//! HANDSHAKE_RESPONSE   u8 stream_id u8 keylen(=32) [keylen]pubkey
//! CRYPTO               u8 stream_id [24]nonce u16 ciphertext_len [ciphertext_len]ciphertext
//! ```
//!
//! The CRYPTO ciphertext decrypts to an inner message, tagged the same way:
//!
//! ```text
//! STREAM_DATA          u16 frame_size [..]opus_bytes
//! STREAM_HEARTBEAT      (empty)
//! STREAM_TERMINATE      (empty)
//! ```

use crate::error::ProtocolError as Error;
use crate::error::Result;

pub const MSG_HANDSHAKE_INIT: u8 = 1;
pub const MSG_HANDSHAKE_RESPONSE: u8 = 2;
pub const MSG_CRYPTO: u8 = 3;

pub const INNER_STREAM_DATA: u8 = 1;
pub const INNER_STREAM_HEARTBEAT: u8 = 2;
pub const INNER_STREAM_TERMINATE: u8 = 3;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const AEAD_TAG_LEN: usize = 16;

/// Default UDP listen/connect port for the sink.
pub const DEFAULT_PORT: u16 = 21500;

/// Conservative single-datagram budget; sends that would exceed this are
/// rejected rather than fragmented.
pub const MAX_DATAGRAM: usize = 1200;

const FMT_F32: u8 = 0;
const FMT_I16: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I16,
}

impl SampleFormat {
    fn to_wire(self) -> u8 {
        match self {
            SampleFormat::F32 => FMT_F32,
            SampleFormat::I16 => FMT_I16,
        }
    }

    fn from_wire(v: u8) -> Result<Self> {
        match v {
            FMT_F32 => Ok(SampleFormat::F32),
            FMT_I16 => Ok(SampleFormat::I16),
            _ => Err(Error::MalformedFrame("unknown sample format code")),
        }
    }

    /// Bytes occupied by one sample in this format.
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::I16 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    pub channel_count: u8,
    pub sample_format: SampleFormat,
    pub frame_size: u16,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<'a> {
    HandshakeInit {
        public_key: [u8; PUBLIC_KEY_LEN],
        audio: AudioConfig,
    },
    HandshakeResponse {
        stream_id: u8,
        public_key: [u8; PUBLIC_KEY_LEN],
    },
    Crypto {
        stream_id: u8,
        nonce: [u8; NONCE_LEN],
        ciphertext: &'a [u8],
    },
}

/// Parse a single datagram. Never allocates; borrows ciphertext bytes from
/// `buf`.
pub fn parse(buf: &[u8]) -> Result<Message<'_>> {
    let (&msg_type, rest) = buf
        .split_first()
        .ok_or(Error::MalformedFrame("empty datagram"))?;
    match msg_type {
        MSG_HANDSHAKE_INIT => parse_handshake_init(rest),
        MSG_HANDSHAKE_RESPONSE => parse_handshake_response(rest),
        MSG_CRYPTO => parse_crypto(rest),
        _ => Err(Error::MalformedFrame("unknown outer message type")),
    }
}

fn parse_handshake_init(buf: &[u8]) -> Result<Message<'_>> {
    const NEED: usize = 1 + PUBLIC_KEY_LEN + 1 + 1 + 2 + 4;
    if buf.len() < NEED {
        return Err(Error::MalformedFrame("handshake init too short"));
    }
    let keylen = buf[0] as usize;
    if keylen != PUBLIC_KEY_LEN {
        return Err(Error::MalformedFrame("handshake init keylen != 32"));
    }
    let mut public_key = [0u8; PUBLIC_KEY_LEN];
    public_key.copy_from_slice(&buf[1..1 + PUBLIC_KEY_LEN]);
    let channel_count = buf[1 + PUBLIC_KEY_LEN];
    let sample_format = SampleFormat::from_wire(buf[2 + PUBLIC_KEY_LEN])?;
    let frame_size = u16::from_be_bytes([buf[3 + PUBLIC_KEY_LEN], buf[4 + PUBLIC_KEY_LEN]]);
    let sample_rate = u32::from_be_bytes([
        buf[5 + PUBLIC_KEY_LEN],
        buf[6 + PUBLIC_KEY_LEN],
        buf[7 + PUBLIC_KEY_LEN],
        buf[8 + PUBLIC_KEY_LEN],
    ]);
    Ok(Message::HandshakeInit {
        public_key,
        audio: AudioConfig {
            channel_count,
            sample_format,
            frame_size,
            sample_rate,
        },
    })
}

fn parse_handshake_response(buf: &[u8]) -> Result<Message<'_>> {
    const NEED: usize = 1 + 1 + PUBLIC_KEY_LEN;
    if buf.len() < NEED {
        return Err(Error::MalformedFrame("handshake response too short"));
    }
    let stream_id = buf[0];
    let keylen = buf[1] as usize;
    if keylen != PUBLIC_KEY_LEN {
        return Err(Error::MalformedFrame("handshake response keylen != 32"));
    }
    let mut public_key = [0u8; PUBLIC_KEY_LEN];
    public_key.copy_from_slice(&buf[2..2 + PUBLIC_KEY_LEN]);
    Ok(Message::HandshakeResponse {
        stream_id,
        public_key,
    })
}

fn parse_crypto(buf: &[u8]) -> Result<Message<'_>> {
    const HEADER: usize = 1 + NONCE_LEN + 2;
    if buf.len() < HEADER {
        return Err(Error::MalformedFrame("crypto header too short"));
    }
    let stream_id = buf[0];
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&buf[1..1 + NONCE_LEN]);
    let ct_len = u16::from_be_bytes([buf[1 + NONCE_LEN], buf[2 + NONCE_LEN]]) as usize;
    let ct_start = HEADER;
    if buf.len() < ct_start + ct_len {
        return Err(Error::MalformedFrame(
            "declared ciphertext length exceeds datagram",
        ));
    }
    Ok(Message::Crypto {
        stream_id,
        nonce,
        ciphertext: &buf[ct_start..ct_start + ct_len],
    })
}

pub fn write_handshake_init(
    out: &mut [u8],
    public_key: &[u8; PUBLIC_KEY_LEN],
    audio: &AudioConfig,
) -> Result<usize> {
    const LEN: usize = 1 + 1 + PUBLIC_KEY_LEN + 1 + 1 + 2 + 4;
    if out.len() < LEN {
        return Err(Error::MalformedFrame("output buffer too small"));
    }
    out[0] = MSG_HANDSHAKE_INIT;
    out[1] = PUBLIC_KEY_LEN as u8;
    out[2..2 + PUBLIC_KEY_LEN].copy_from_slice(public_key);
    let mut w = 2 + PUBLIC_KEY_LEN;
    out[w] = audio.channel_count;
    out[w + 1] = audio.sample_format.to_wire();
    out[w + 2..w + 4].copy_from_slice(&audio.frame_size.to_be_bytes());
    out[w + 4..w + 8].copy_from_slice(&audio.sample_rate.to_be_bytes());
    w += 8;
    Ok(w)
}

pub fn write_handshake_response(
    out: &mut [u8],
    stream_id: u8,
    public_key: &[u8; PUBLIC_KEY_LEN],
) -> Result<usize> {
    const LEN: usize = 1 + 1 + 1 + PUBLIC_KEY_LEN;
    if out.len() < LEN {
        return Err(Error::MalformedFrame("output buffer too small"));
    }
    out[0] = MSG_HANDSHAKE_RESPONSE;
    out[1] = stream_id;
    out[2] = PUBLIC_KEY_LEN as u8;
    out[3..3 + PUBLIC_KEY_LEN].copy_from_slice(public_key);
    Ok(LEN)
}

pub fn write_crypto(
    out: &mut [u8],
    stream_id: u8,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<usize> {
    let len = 1 + NONCE_LEN + 2 + ciphertext.len();
    if out.len() < len {
        return Err(Error::MalformedFrame("output buffer too small"));
    }
    if len > MAX_DATAGRAM {
        return Err(Error::MalformedFrame("frame exceeds single-datagram budget"));
    }
    out[0] = MSG_CRYPTO;
    out[1] = stream_id;
    out[2..2 + NONCE_LEN].copy_from_slice(nonce);
    let ct_len = ciphertext.len() as u16;
    out[2 + NONCE_LEN..4 + NONCE_LEN].copy_from_slice(&ct_len.to_be_bytes());
    out[4 + NONCE_LEN..len].copy_from_slice(ciphertext);
    Ok(len)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InnerMessage<'a> {
    StreamData { frame_size: u16, opus: &'a [u8] },
    StreamHeartbeat,
    StreamTerminate,
}

pub fn parse_inner(buf: &[u8]) -> Result<InnerMessage<'_>> {
    let (&tag, rest) = buf
        .split_first()
        .ok_or(Error::MalformedFrame("empty inner message"))?;
    match tag {
        INNER_STREAM_DATA => {
            if rest.len() < 2 {
                return Err(Error::MalformedFrame("stream data missing frame_size"));
            }
            let frame_size = u16::from_be_bytes([rest[0], rest[1]]);
            Ok(InnerMessage::StreamData {
                frame_size,
                opus: &rest[2..],
            })
        }
        INNER_STREAM_HEARTBEAT => Ok(InnerMessage::StreamHeartbeat),
        INNER_STREAM_TERMINATE => Ok(InnerMessage::StreamTerminate),
        _ => Err(Error::MalformedFrame("unknown inner message type")),
    }
}

pub fn write_inner_stream_data(out: &mut [u8], frame_size: u16, opus: &[u8]) -> Result<usize> {
    let len = 1 + 2 + opus.len();
    if out.len() < len {
        return Err(Error::MalformedFrame("output buffer too small"));
    }
    out[0] = INNER_STREAM_DATA;
    out[1..3].copy_from_slice(&frame_size.to_be_bytes());
    out[3..len].copy_from_slice(opus);
    Ok(len)
}

pub fn write_inner_heartbeat(out: &mut [u8]) -> Result<usize> {
    if out.is_empty() {
        return Err(Error::MalformedFrame("output buffer too small"));
    }
    out[0] = INNER_STREAM_HEARTBEAT;
    Ok(1)
}

pub fn write_inner_terminate(out: &mut [u8]) -> Result<usize> {
    if out.is_empty() {
        return Err(Error::MalformedFrame("output buffer too small"));
    }
    out[0] = INNER_STREAM_TERMINATE;
    Ok(1)
}

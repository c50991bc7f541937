//! Error taxonomy shared by the wire codec, crypto session and sink/source
//! pipelines. None of these are fatal to a running stream by themselves;
//! callers drop the offending packet/frame and keep going. Only `Fatal`
//! propagates out of `main()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("unknown or inactive stream id {0}")]
    UnknownStream(u8),

    #[error("AEAD authentication failed")]
    AuthFailed,

    #[error("replayed or stale nonce")]
    ReplayRejected,

    #[error("codec failed to decode a verified frame")]
    DecodeFailed,

    #[error("no free slot to admit a new stream")]
    AdmitFull,

    #[error("ring buffer has no room for the decoded frame")]
    RingOverflow,

    #[error("failed to open audio device/stream: {0}")]
    AudioOpenFailed(String),

    #[error("handshake unanswered, will retry")]
    HandshakeTimeout,

    #[error("fatal startup failure: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

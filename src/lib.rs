//! Library crate behind the `sink` and `source` binaries: wire codec,
//! session crypto, stream lifecycle, the lock-free ring buffer, the codec
//! binding, device I/O, config/CLI loading and the two binaries' runtime
//! loops.

pub mod audio;
pub mod cli;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod ring;
pub mod session;
pub mod sink;
pub mod source;
pub mod wire;

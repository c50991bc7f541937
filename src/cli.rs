//! Command-line argument shapes for the `sink` and `source` binaries.
//! Parsing itself is `clap`'s job; these structs just carry what falls out
//! of it into `config::load_sink`/`config::load_source`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "sink", about = "Receive, decrypt and play remote audio streams")]
pub struct SinkArgs {
    /// Output device name prefix (case-insensitive). Defaults to the host's
    /// default output device.
    #[arg(long)]
    pub device: Option<String>,

    /// UDP port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Path to an INI config file with a `[sink]` section.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Maximum number of concurrent streams to admit.
    #[arg(long)]
    pub slots: Option<usize>,

    /// Pre-shared key mixed into the session secret derivation.
    #[arg(long)]
    pub psk: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "source", about = "Capture, encode, encrypt and send audio to a sink")]
pub struct SourceArgs {
    /// Sink host to connect to (hostname or IP).
    pub sink_host: String,

    /// Input device name prefix (case-insensitive). Defaults to the host's
    /// default input device.
    #[arg(long)]
    pub device: Option<String>,

    /// UDP port the sink is listening on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Path to an INI config file with a `[source]` section.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Pre-shared key mixed into the session secret derivation.
    #[arg(long)]
    pub psk: Option<String>,
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use remote_audio::cli::SourceArgs;
use remote_audio::config::{self, SourceConfig};
use remote_audio::{logging, source};

fn main() -> anyhow::Result<()> {
    logging::init();
    let args = SourceArgs::parse();

    let mut overrides = SourceConfig::default();
    overrides.device = args.device;
    overrides.host = Some(args.sink_host);
    if let Some(port) = args.port {
        overrides.port = port;
    }
    overrides.psk = args.psk;
    let cfg = config::load_source(args.config.as_deref(), overrides)?;
    let host = cfg
        .host
        .ok_or_else(|| anyhow::anyhow!("no sink host given on the command line or in the config file"))?;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_signal = running.clone();
    ctrlc::set_handler(move || {
        running_for_signal.store(false, Ordering::Relaxed);
    })?;

    source::run(
        source::SourceOptions {
            host,
            port: cfg.port,
            psk: cfg.psk.map(|s| s.into_bytes()),
            device: cfg.device,
        },
        running,
    )?;
    Ok(())
}

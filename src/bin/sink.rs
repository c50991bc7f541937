use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use remote_audio::cli::SinkArgs;
use remote_audio::config::{self, SinkConfig};
use remote_audio::{logging, sink};

fn main() -> anyhow::Result<()> {
    logging::init();
    let args = SinkArgs::parse();

    let mut overrides = SinkConfig::default();
    overrides.device = args.device;
    if let Some(port) = args.port {
        overrides.port = port;
    }
    if let Some(slots) = args.slots {
        overrides.slots = slots;
    }
    overrides.psk = args.psk;
    let cfg = config::load_sink(args.config.as_deref(), overrides)?;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_signal = running.clone();
    ctrlc::set_handler(move || {
        running_for_signal.store(false, Ordering::Relaxed);
    })?;

    sink::run(
        sink::SinkOptions {
            port: cfg.port,
            slots: cfg.slots,
            psk: cfg.psk.map(|s| s.into_bytes()),
            device: cfg.device,
        },
        running,
    )?;
    Ok(())
}

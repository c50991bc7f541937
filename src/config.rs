//! INI config file loading, layered under CLI overrides: defaults < config
//! file < CLI flags. Mirrors the `[sink]`/`[source]` section layout of the
//! original C config format.

use std::path::Path;

use ini::Ini;

use crate::error::ProtocolError as Error;
use crate::error::Result;
use crate::wire::DEFAULT_PORT;

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub device: Option<String>,
    pub port: u16,
    pub slots: usize,
    pub psk: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            device: None,
            port: DEFAULT_PORT,
            slots: 16,
            psk: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub device: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub psk: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            device: None,
            host: None,
            port: DEFAULT_PORT,
            psk: None,
        }
    }
}

fn load_ini(path: &Path) -> Result<Ini> {
    Ini::load_from_file(path)
        .map_err(|e| Error::Fatal(format!("reading config file {}: {e}", path.display())))
}

fn parse_port(raw: &str) -> Result<u16> {
    raw.parse()
        .map_err(|_| Error::Fatal(format!("invalid port value in config: {raw}")))
}

fn parse_slots(raw: &str) -> Result<usize> {
    raw.parse()
        .map_err(|_| Error::Fatal(format!("invalid slots value in config: {raw}")))
}

/// Loads the `[sink]` section from `path`, if given, then lets the already
/// CLI-populated fields in `overrides` win over anything the file sets.
pub fn load_sink(path: Option<&Path>, mut overrides: SinkConfig) -> Result<SinkConfig> {
    let Some(path) = path else { return Ok(overrides) };
    let ini = load_ini(path)?;
    let section = ini.section(Some("sink"));
    if let Some(section) = section {
        if overrides.device.is_none() {
            overrides.device = section.get("device").map(String::from);
        }
        if overrides.port == DEFAULT_PORT {
            if let Some(raw) = section.get("port") {
                overrides.port = parse_port(raw)?;
            }
        }
        if overrides.slots == SinkConfig::default().slots {
            if let Some(raw) = section.get("slots") {
                overrides.slots = parse_slots(raw)?;
            }
        }
        if overrides.psk.is_none() {
            overrides.psk = section.get("psk").map(String::from);
        }
    }
    Ok(overrides)
}

/// Loads the `[source]` section from `path`, if given, then lets the
/// already CLI-populated fields in `overrides` win over anything the file
/// sets.
pub fn load_source(path: Option<&Path>, mut overrides: SourceConfig) -> Result<SourceConfig> {
    let Some(path) = path else { return Ok(overrides) };
    let ini = load_ini(path)?;
    let section = ini.section(Some("source"));
    if let Some(section) = section {
        if overrides.device.is_none() {
            overrides.device = section.get("device").map(String::from);
        }
        if overrides.host.is_none() {
            overrides.host = section.get("host").map(String::from);
        }
        if overrides.port == DEFAULT_PORT {
            if let Some(raw) = section.get("port") {
                overrides.port = parse_port(raw)?;
            }
        }
        if overrides.psk.is_none() {
            overrides.psk = section.get("psk").map(String::from);
        }
    }
    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_temp_ini(contents: &str) -> tempfile_path::TempIniFile {
        tempfile_path::TempIniFile::new(contents)
    }

    // Minimal self-contained temp-file helper so this module's tests don't
    // need an extra dev-dependency just for a scratch file.
    mod tempfile_path {
        use std::fs::File;
        use std::io::Write;
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU64, Ordering};

        // `cargo test` runs test functions concurrently within one process
        // by default, so a name keyed only on the pid collides across
        // every test that calls `TempIniFile::new` and races on the same
        // file. Mix in a thread id and a per-process counter so each call
        // gets its own path.
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);

        pub struct TempIniFile {
            path: PathBuf,
        }

        impl TempIniFile {
            pub fn new(contents: &str) -> Self {
                let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
                let mut path = std::env::temp_dir();
                path.push(format!(
                    "remote_audio_test_{}_{:?}_{id}.ini",
                    std::process::id(),
                    std::thread::current().id()
                ));
                let mut file = File::create(&path).unwrap();
                file.write_all(contents.as_bytes()).unwrap();
                Self { path }
            }

            pub fn path(&self) -> &std::path::Path {
                &self.path
            }
        }

        impl Drop for TempIniFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn sink_config_defaults_with_no_file() {
        let cfg = load_sink(None, SinkConfig::default()).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.slots, 16);
    }

    #[test]
    fn sink_config_reads_file_values() {
        let file = write_temp_ini("[sink]\ndevice = USB Mic\nport = 9000\nslots = 4\npsk = abc\n");
        let cfg = load_sink(Some(file.path()), SinkConfig::default()).unwrap();
        assert_eq!(cfg.device.as_deref(), Some("USB Mic"));
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.slots, 4);
        assert_eq!(cfg.psk.as_deref(), Some("abc"));
    }

    #[test]
    fn cli_override_wins_over_file() {
        let file = write_temp_ini("[sink]\nport = 9000\n");
        let mut overrides = SinkConfig::default();
        overrides.port = 12345;
        let cfg = load_sink(Some(file.path()), overrides).unwrap();
        assert_eq!(cfg.port, 12345);
    }

    #[test]
    fn source_config_reads_host_and_psk() {
        let file = write_temp_ini("[source]\nhost = 10.0.0.5\npsk = shared\n");
        let cfg = load_source(Some(file.path()), SourceConfig::default()).unwrap();
        assert_eq!(cfg.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(cfg.psk.as_deref(), Some("shared"));
    }
}

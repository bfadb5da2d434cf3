pub mod config;
pub mod gateway;
pub mod mcp_client;

use std::path::Path;
use std::sync::Arc;

use crate::config::{LogConfig, LogFormat};

/// Number of rotated log files kept next to the active one.
const LOG_FILES_KEPT: u32 = 3;

/// Install the global tracing subscriber.
///
/// Stdout carries the protocol, so logs go to stderr unless `log.file` is
/// set. The filter comes from `RUST_LOG`, then `LOG_LEVEL`, then
/// `log.level`. With a log file:
/// 1. Rotates existing logs (gateway.log → gateway.log.1 → .2 → .3).
/// 2. Opens a fresh file with a line-flushing writer.
pub fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        let level = std::env::var("LOG_LEVEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| log.level.clone());
        EnvFilter::try_new(level.trim())
    })?;

    let writer = match &log.file {
        Some(path) => {
            let path = Path::new(path);
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, LOG_FILES_KEPT);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(FlushingWriter::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match log.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log.file,
        pid = std::process::id(),
        "=== MCP Gateway starting ==="
    );
    Ok(())
}

/// Rotate log files: `gateway.log` → `gateway.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that flushes the log file after every write, so entries
/// survive the process being killed by its host.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<parking_lot::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(parking_lot::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self.file.lock();
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::Write::flush(&mut *self.file.lock())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_log_file_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("gateway.log");
        for (suffix, body) in [("", "current"), (".1", "one"), (".2", "two"), (".3", "three")] {
            std::fs::write(format!("{}{suffix}", base.display()), body).unwrap();
        }

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |suffix: &str| std::fs::read_to_string(format!("{}{suffix}", base.display())).unwrap();
        assert_eq!(read(".1"), "current");
        assert_eq!(read(".2"), "one");
        assert_eq!(read(".3"), "two");
    }

    #[test]
    fn test_rotate_log_file_with_no_existing_logs() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("gateway.log");
        rotate_log_file(&base, 3);
        assert!(!base.exists());
        assert!(!dir.path().join("gateway.log.1").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"backend ready\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "backend ready\n");
    }
}

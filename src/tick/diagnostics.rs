//! Fatal-failure diagnostic snapshots
//!
//! When the world tick or a trusted connection fails, the scheduler captures
//! the state a postmortem needs and writes it as a JSON artifact before
//! shutting down. Failure to write the artifact is logged, never propagated:
//! the server is already dying and the log line is the fallback.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{error, warn};

/// Snapshot of scheduler state at the moment of a fatal failure.
#[derive(Debug, Serialize)]
pub struct DiagnosticSnapshot {
    /// Unix epoch milliseconds at capture
    pub captured_at_ms: u64,
    /// Tick the server was executing
    pub tick: u64,
    /// Seconds since the scheduler started
    pub uptime_secs: u64,
    /// Display chain of the fatal error, outermost first
    pub error_chain: Vec<String>,
    /// Average tick duration per reporting window, milliseconds
    pub tick_time_avg_ms: Vec<f64>,
    /// Live connections at capture time
    pub live_connections: usize,
    /// Deferred tasks still queued at capture time
    pub queued_tasks: usize,
}

impl DiagnosticSnapshot {
    pub fn capture(
        error: &anyhow::Error,
        tick: u64,
        uptime_secs: u64,
        tick_time_avg_ms: Vec<f64>,
        live_connections: usize,
        queued_tasks: usize,
    ) -> Self {
        let captured_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            captured_at_ms,
            tick,
            uptime_secs,
            error_chain: error.chain().map(|e| e.to_string()).collect(),
            tick_time_avg_ms,
            live_connections,
            queued_tasks,
        }
    }

    /// Write the artifact under `dir`, creating it if needed. Returns the
    /// path on success.
    pub fn write_to(&self, dir: &Path) -> Option<PathBuf> {
        let path = dir.join(format!("crash-{}.json", self.captured_at_ms));
        let result = std::fs::create_dir_all(dir).and_then(|_| {
            let json = serde_json::to_vec_pretty(self)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(&path, json)
        });
        match result {
            Ok(()) => {
                error!("Diagnostic snapshot written to {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Failed to write diagnostic snapshot: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_records_error_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = anyhow::Error::new(inner).context("world tick failed");
        let snap = DiagnosticSnapshot::capture(&err, 42, 7, vec![12.5], 3, 1);

        assert_eq!(snap.tick, 42);
        assert_eq!(snap.error_chain.len(), 2);
        assert_eq!(snap.error_chain[0], "world tick failed");
        assert_eq!(snap.error_chain[1], "disk on fire");
    }

    #[test]
    fn test_write_produces_json_artifact() {
        let err = anyhow::anyhow!("boom");
        let snap = DiagnosticSnapshot::capture(&err, 1, 0, vec![], 0, 0);

        let dir = std::env::temp_dir().join(format!("tickhost-diag-{}", std::process::id()));
        let path = snap.write_to(&dir).expect("artifact written");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"boom\""));

        std::fs::remove_dir_all(&dir).ok();
    }
}

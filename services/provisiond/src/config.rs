//! Daemon configuration.
//!
//! Defaults come from the environment (`GRID_*`); the few flags the binary
//! takes override them.

use std::path::PathBuf;

use anyhow::Result;

/// Marker file proving the node has booted this daemon before.
const BOOT_MARKER: &str = "provisiond.booted";

#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string to the message broker the host daemons listen on.
    pub broker: String,

    /// Optional reservation URL to poll in addition to the local pipe.
    pub source_url: Option<String>,

    /// Root of the on-disk reservation cache.
    pub data_dir: PathBuf,

    /// Runtime directory holding the first-boot marker.
    pub run_dir: PathBuf,

    /// Local reservation pipe.
    pub fifo_path: PathBuf,

    /// Node secret the result signer commits with.
    pub node_secret: String,

    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let broker = std::env::var("GRID_BROKER")
            .unwrap_or_else(|_| "unix:///var/run/redis.sock".to_string());

        let source_url = std::env::var("GRID_RESERVATION_URL").ok().filter(|s| !s.is_empty());

        let data_dir = std::env::var("GRID_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/cache/provisiond"));

        let run_dir = std::env::var("GRID_RUN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/run/provisiond"));

        let fifo_path = std::env::var("GRID_RESERVATION_PIPE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/run/reservation.pipe"));

        let node_secret = std::env::var("GRID_NODE_SECRET").unwrap_or_default();

        let log_level = std::env::var("GRID_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            broker,
            source_url,
            data_dir,
            run_dir,
            fifo_path,
            node_secret,
            log_level,
        })
    }

    /// Path of the first-boot marker file.
    pub fn boot_marker(&self) -> PathBuf {
        self.run_dir.join(BOOT_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_marker_under_run_dir() {
        let config = Config {
            broker: String::new(),
            source_url: None,
            data_dir: PathBuf::from("/var/cache/provisiond"),
            run_dir: PathBuf::from("/run/x"),
            fifo_path: PathBuf::from("/var/run/reservation.pipe"),
            node_secret: String::new(),
            log_level: "info".to_string(),
        };
        assert_eq!(config.boot_marker(), PathBuf::from("/run/x/provisiond.booted"));
    }
}

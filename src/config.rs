//! Acquisition settings, loadable from a JSON file.
//!
//! Every field has a default, so a file only needs the keys it changes.
//! Durations are written as integer milliseconds:
//!
//! ```json
//! {
//!   "manufacturer_filter": "Arduino",
//!   "link": { "settle_delay": 1500 },
//!   "session": { "max_consecutive_failures": 20 },
//!   "store_path": "recorded_data.json"
//! }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::buffer::HorizonPolicy;
use crate::link::{LinkConfig, DEFAULT_MANUFACTURER};
use crate::session::SessionConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Explicit port; discovery is skipped when set.
    pub port: Option<String>,
    pub manufacturer_filter: String,
    pub link: LinkConfig,
    pub session: SessionConfig,
    pub horizon: HorizonPolicy,
    pub store_path: PathBuf,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            port: None,
            manufacturer_filter: DEFAULT_MANUFACTURER.to_string(),
            link: LinkConfig::default(),
            session: SessionConfig::default(),
            horizon: HorizonPolicy::default(),
            store_path: PathBuf::from("recorded_data.json"),
        }
    }
}

impl AcquisitionConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid acquisition config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }
}

/// `serde(with = ...)` adapter storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::CommandCode;

    #[test]
    fn empty_object_gives_defaults() {
        let cfg = AcquisitionConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, AcquisitionConfig::default());
        assert_eq!(cfg.manufacturer_filter, "Arduino");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = AcquisitionConfig::from_json_str(
            r#"{
                "port": "/dev/ttyACM3",
                "link": { "settle_delay": 1500, "handshake_code": "Handshake" },
                "session": { "max_consecutive_failures": 7 },
                "horizon": { "time_increment_ms": 5000 }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.port.as_deref(), Some("/dev/ttyACM3"));
        assert_eq!(cfg.link.settle_delay, Duration::from_millis(1500));
        assert_eq!(cfg.link.handshake_timeout, Duration::from_secs(2));
        assert_eq!(cfg.link.handshake_code, CommandCode::Handshake);
        assert_eq!(cfg.session.max_consecutive_failures, 7);
        assert_eq!(cfg.horizon.time_increment_ms, 5000);
        assert_eq!(cfg.horizon.value_headroom, 1.0);
    }

    #[test]
    fn load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = AcquisitionConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.json"));

        let missing = AcquisitionConfig::load(&dir.path().join("missing.json")).unwrap_err();
        assert!(format!("{missing:#}").contains("missing.json"));
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = AcquisitionConfig::default();
        let text = serde_json::to_string(&cfg).unwrap();
        assert_eq!(AcquisitionConfig::from_json_str(&text).unwrap(), cfg);
    }
}

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root of the SDMX REST API
    pub base_url: String,
    /// Agency owning the dataflows
    pub agency: String,
    pub dataflow_version: String,
    /// Root of the published reference-data JSON files
    pub metadata_url: String,
    /// Retries per candidate dataset after the first attempt
    pub max_retries: u32,
    pub retry_pause_ms: u64,
    pub timeout_secs: u64,
    /// Geography codes sent per request; longer lists are paged
    pub max_geo_codes_per_request: usize,
    /// Age after which cached reference data is considered stale
    pub staleness_days: i64,
    /// Overrides the platform cache directory for reference data
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: "https://sdmx.data.unicef.org/ws/public/sdmxapi/rest".into(),
            agency: "UNICEF".into(),
            dataflow_version: "1.0".into(),
            metadata_url: "https://sdmx.data.unicef.org/reference/current".into(),
            max_retries: 3,
            retry_pause_ms: 1000,
            timeout_secs: 120,
            max_geo_codes_per_request: 60,
            staleness_days: 30,
            cache_dir: None,
        }
    }
}

impl Config {
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::days(self.staleness_days)
    }

    /// Directory for persisted reference data, if one can be determined
    #[cfg(feature = "cache")]
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("sdmxget")))
    }
}

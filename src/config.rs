//! Configuration at ~/.harvest-locate/config.toml.
//!
//! Every field has a default, so a missing file or a partial one works.

use crate::location::gps::AcquisitionPolicy;
use crate::location::types::Coordinates;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gps: GpsConfig,
    pub geocoding: GeocodingConfig,
    pub ip: IpConfig,
    pub search: SearchConfig,
    pub pincode: PincodeConfig,
    pub cache: CacheConfig,
    pub manual: ManualConfig,
    pub display: DisplayConfig,
    pub server: ServerConfig,
}

/// GPS refinement thresholds and the optional native receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub accuracy_threshold_m: f64,
    pub max_fixes: usize,
    pub overall_budget_secs: u64,
    pub per_fix_timeout_secs: u64,
    pub resubscribe_pause_secs: u64,
    pub high_accuracy: bool,
    /// gpsd `host:port`. Unset means no native receiver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpsd: Option<String>,
}

impl Default for GpsConfig {
    fn default() -> Self {
        let policy = AcquisitionPolicy::default();
        Self {
            accuracy_threshold_m: policy.accuracy_threshold_m,
            max_fixes: policy.max_fixes,
            overall_budget_secs: policy.overall_budget.as_secs(),
            per_fix_timeout_secs: policy.per_fix_timeout.as_secs(),
            resubscribe_pause_secs: policy.resubscribe_pause.as_secs(),
            high_accuracy: policy.high_accuracy,
            gpsd: None,
        }
    }
}

impl GpsConfig {
    pub fn policy(&self) -> AcquisitionPolicy {
        AcquisitionPolicy {
            accuracy_threshold_m: self.accuracy_threshold_m,
            max_fixes: self.max_fixes,
            overall_budget: Duration::from_secs(self.overall_budget_secs),
            per_fix_timeout: Duration::from_secs(self.per_fix_timeout_secs),
            resubscribe_pause: Duration::from_secs(self.resubscribe_pause_secs),
            high_accuracy: self.high_accuracy,
        }
    }
}

/// One reverse-geocoding endpoint. Declaration order is priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub zoom: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_codes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodingConfig {
    pub base_url: String,
    pub user_agent: String,
    pub per_call_timeout_secs: u64,
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        let endpoint = |name: &str, zoom| EndpointConfig {
            name: name.to_string(),
            zoom,
            country_codes: Some("in".to_string()),
        };
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: format!("HarvestLocate/{}", env!("CARGO_PKG_VERSION")),
            per_call_timeout_secs: 8,
            endpoints: vec![
                endpoint("street", 18),
                endpoint("neighbourhood", 16),
                endpoint("city", 12),
            ],
        }
    }
}

impl GeocodingConfig {
    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_secs(self.per_call_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for IpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://ipapi.co".to_string(),
            timeout_secs: 5,
        }
    }
}

impl IpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub enabled: bool,
    pub limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_codes: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 5,
            country_codes: Some("in".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PincodeConfig {
    pub enabled: bool,
    pub base_url: String,
}

impl Default for PincodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.postalpincode.in".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Defaults to ~/.harvest-locate/geocode-cache.json.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub ttl_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            ttl_days: crate::location::cache::DEFAULT_TTL_DAYS,
        }
    }
}

/// Coordinates stamped on typed addresses. They mark a region, not the
/// user's position; leave unset to record no coordinates at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder_latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder_longitude: Option<f64>,
}

impl ManualConfig {
    pub fn placeholder(&self) -> Option<Coordinates> {
        Some(Coordinates {
            latitude: self.placeholder_latitude?,
            longitude: self.placeholder_longitude?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// IANA zone for rendering capture times.
    pub timezone: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Kolkata".to_string(),
        }
    }
}

impl DisplayConfig {
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown time zone '{}'", self.timezone)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Config {
    pub fn path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".harvest-locate")
            .join("config.toml")
    }

    /// Load from the default path, falling back to defaults when absent.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load an explicit file. A missing file is an error here.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let gps = &self.gps;
        if gps.overall_budget_secs == 0 || gps.per_fix_timeout_secs == 0 {
            return Err(ConfigError::Invalid("GPS budgets must be non-zero".into()));
        }
        if gps.max_fixes == 0 {
            return Err(ConfigError::Invalid("gps.max_fixes must be at least 1".into()));
        }
        if !(gps.accuracy_threshold_m.is_finite() && gps.accuracy_threshold_m > 0.0) {
            return Err(ConfigError::Invalid("gps.accuracy_threshold_m must be positive".into()));
        }
        if self.geocoding.endpoints.is_empty() {
            return Err(ConfigError::Invalid("at least one geocoding endpoint is required".into()));
        }
        if self.geocoding.per_call_timeout_secs == 0 || self.ip.timeout_secs == 0 {
            return Err(ConfigError::Invalid("provider timeouts must be non-zero".into()));
        }
        if self.manual.placeholder_latitude.is_some() != self.manual.placeholder_longitude.is_some() {
            return Err(ConfigError::Invalid(
                "manual placeholder needs both latitude and longitude".into(),
            ));
        }
        self.display.tz()?;
        Ok(())
    }
}

//! File-based reverse-geocoding cache at ~/.harvest-locate/geocode-cache.json.
//!
//! Keyed by coordinates rounded to 4 decimals (about 11 m). Only complete
//! addresses (city and state present) are stored. Entries written by an older
//! version without a `locality` field still load.

use super::address::EnhancedAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_TTL_DAYS: u32 = 30;

const DAY_MS: i64 = 24 * 3600 * 1000;

#[derive(Serialize, Deserialize, Clone)]
struct CacheEntry {
    address: EnhancedAddress,
    timestamp: i64,
}

pub struct GeocodeCache {
    path: PathBuf,
    ttl_ms: i64,
    entries: HashMap<String, CacheEntry>,
}

impl GeocodeCache {
    /// Load from a specific path. A missing or unreadable file starts empty.
    pub fn load_from(path: PathBuf, ttl_days: u32) -> Self {
        let entries = Self::read_file(&path).unwrap_or_default();
        Self {
            path,
            ttl_ms: i64::from(ttl_days) * DAY_MS,
            entries,
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".harvest-locate")
            .join("geocode-cache.json")
    }

    fn read_file(path: &Path) -> Option<HashMap<String, CacheEntry>> {
        let data = fs::read_to_string(path).ok()?;
        serde_json::from_str(&data).ok()
    }

    pub fn key(lat: f64, lon: f64) -> String {
        format!("{:.4},{:.4}", lat, lon)
    }

    /// Cached address for these coordinates, unless missing or expired.
    pub fn get(&self, lat: f64, lon: f64) -> Option<EnhancedAddress> {
        let entry = self.entries.get(&Self::key(lat, lon))?;
        let now = chrono::Utc::now().timestamp_millis();
        if now - entry.timestamp > self.ttl_ms {
            return None;
        }
        Some(entry.address.clone())
    }

    /// Store an address in memory. Incomplete addresses are ignored and
    /// return false.
    pub fn insert(&mut self, lat: f64, lon: f64, address: &EnhancedAddress) -> bool {
        if !address.has_city_and_state() {
            return false;
        }
        self.entries.insert(
            Self::key(lat, lon),
            CacheEntry {
                address: address.clone(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        );
        true
    }

    /// Serialized contents, ready to be written off the async runtime.
    pub fn snapshot(&self) -> Result<CacheSnapshot, serde_json::Error> {
        Ok(CacheSnapshot {
            path: self.path.clone(),
            json: serde_json::to_string_pretty(&self.entries)?,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache contents detached from the lock that guards the cache.
pub struct CacheSnapshot {
    path: PathBuf,
    json: String,
}

impl CacheSnapshot {
    /// Blocking write, creating the cache directory first.
    pub fn write(self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, self.json)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

//! Core types for the location pipeline.

use super::address::{self, EnhancedAddress};
use super::manual::ManualEntry;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Which tier of the fallback chain produced a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    NativeGps,
    BrowserGps,
    Ip,
    Manual,
}

impl LocationSource {
    pub fn is_gps(self) -> bool {
        matches!(self, Self::NativeGps | Self::BrowserGps)
    }
}

impl fmt::Display for LocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NativeGps => write!(f, "Native GPS"),
            Self::BrowserGps => write!(f, "Browser GPS"),
            Self::Ip => write!(f, "IP"),
            Self::Manual => write!(f, "Manual"),
        }
    }
}

/// A latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// One position sample reported by a geolocation capability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters (lower is better).
    pub accuracy: f64,
    #[serde(default)]
    pub timestamp_ms: i64,
}

/// Terminal error codes of a position watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum GeoErrorCode {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("position request timed out")]
    Timeout,
}

/// What a watch delivers: a fix or a terminal error.
pub type PositionEvent = Result<Fix, GeoErrorCode>;

/// Answer of the platform permission query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Granted,
    Denied,
    Unknown,
}

/// Raw reverse-geocoding payload: a display string plus a structured field bag
/// (`house_number`, `road`, `suburb`, `city`, `state`, `postcode`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAddress {
    pub display_name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl RawAddress {
    /// A trimmed, non-empty field value.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.display_name.trim().is_empty() && self.fields.values().all(|v| v.trim().is_empty())
    }
}

/// A forward-geocoding result offered to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCandidate {
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl SearchCandidate {
    pub fn raw(&self) -> RawAddress {
        RawAddress {
            display_name: self.display_name.clone(),
            fields: self.fields.clone(),
        }
    }
}

/// Best-effort answer from an IP geolocation provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpLocation {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub postal: Option<String>,
}

/// Post-office data for a pincode, used to pre-fill manual entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PincodeDetails {
    pub pincode: String,
    pub district: String,
    pub state: String,
    pub localities: Vec<String>,
}

/// A resolved address record. Built once by the tier that produced it and
/// never mutated afterwards; there are no setters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
    address: String,
    city: String,
    state: String,
    pincode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    locality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    accuracy: Option<f64>,
    source: LocationSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    timestamp: DateTime<Utc>,
}

impl ResolvedLocation {
    fn geocoded(coords: Option<Coordinates>, addr: EnhancedAddress, source: LocationSource) -> Self {
        let display_name = Some(addr.display_name).filter(|d| !d.trim().is_empty());
        Self {
            latitude: coords.map(|c| c.latitude),
            longitude: coords.map(|c| c.longitude),
            address: addr.address,
            city: addr.city,
            state: addr.state,
            pincode: address::sanitize_pincode(&addr.pincode),
            locality: addr.locality,
            accuracy: None,
            source,
            confidence: Some(addr.confidence.clamp(0.0, 1.0)),
            display_name,
            timestamp: Utc::now(),
        }
    }

    /// Record for an accepted GPS fix that was geocoded successfully.
    pub(crate) fn from_fix(fix: &Fix, addr: EnhancedAddress, source: LocationSource) -> Self {
        let coords = Coordinates { latitude: fix.latitude, longitude: fix.longitude };
        Self {
            accuracy: Some(fix.accuracy).filter(|a| a.is_finite()),
            ..Self::geocoded(Some(coords), addr, source)
        }
    }

    pub(crate) fn from_ip(coords: Coordinates, addr: EnhancedAddress) -> Self {
        Self::geocoded(Some(coords), addr, LocationSource::Ip)
    }

    /// Record for a search candidate the user picked.
    pub(crate) fn from_candidate(candidate: &SearchCandidate, addr: EnhancedAddress) -> Self {
        let coords = Coordinates { latitude: candidate.latitude, longitude: candidate.longitude };
        Self::geocoded(Some(coords), addr, LocationSource::Manual)
    }

    /// Record for a validated manual form. `placeholder` is a configured
    /// center point, not a measurement.
    pub(crate) fn from_manual(entry: &ManualEntry, placeholder: Option<Coordinates>) -> Self {
        Self {
            latitude: placeholder.map(|c| c.latitude),
            longitude: placeholder.map(|c| c.longitude),
            address: entry.address.trim().to_string(),
            city: entry.city.trim().to_string(),
            state: entry.state.as_deref().map(str::trim).unwrap_or_default().to_string(),
            pincode: address::sanitize_pincode(&entry.pincode),
            locality: entry.locality.as_deref().map(str::trim).filter(|l| !l.is_empty()).map(String::from),
            accuracy: None,
            source: LocationSource::Manual,
            confidence: None,
            display_name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn latitude(&self) -> Option<f64> {
        self.latitude
    }

    pub fn longitude(&self) -> Option<f64> {
        self.longitude
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates { latitude, longitude }),
            _ => None,
        }
    }

    /// Whether the coordinates came from a sensor or network locator rather
    /// than user selection or a placeholder.
    pub fn coordinates_are_measured(&self) -> bool {
        self.source != LocationSource::Manual && self.coordinates().is_some()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn pincode(&self) -> &str {
        &self.pincode
    }

    pub fn locality(&self) -> Option<&str> {
        self.locality.as_deref()
    }

    pub fn accuracy(&self) -> Option<f64> {
        self.accuracy
    }

    pub fn source(&self) -> LocationSource {
        self.source
    }

    pub fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Multi-line banner for terminal output.
    pub fn display_line(&self, tz: Tz) -> String {
        let place = [self.city.as_str(), self.state.as_str(), self.pincode.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(", ");
        let coords = match self.coordinates() {
            Some(c) if self.coordinates_are_measured() => format_coords(c.latitude, c.longitude),
            Some(c) => format!("{} (not measured)", format_coords(c.latitude, c.longitude)),
            None => "no coordinates".to_string(),
        };
        let accuracy = self
            .accuracy
            .map(|a| format!(" \u{00B1}{:.0} m", a))
            .unwrap_or_default();
        let quality = self
            .confidence
            .map(|c| format!(", confidence {:.2}", c))
            .unwrap_or_default();
        format!(
            "\u{1F4CD} {}\n  \u{1F3E0} {}\n  \u{1F4D0} {}{}\n  \u{1F6F0} {}{} at {}",
            place,
            self.address,
            coords,
            accuracy,
            self.source,
            quality,
            self.timestamp.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S %Z"),
        )
    }
}

/// Format coordinates as `28.6139°N, 77.2090°E`.
pub fn format_coords(lat: f64, lon: f64) -> String {
    let ns = if lat >= 0.0 { 'N' } else { 'S' };
    let ew = if lon >= 0.0 { 'E' } else { 'W' };
    format!("{:.4}\u{00B0}{}, {:.4}\u{00B0}{}", lat.abs(), ns, lon.abs(), ew)
}

/// Manual-entry validation failures, surfaced at the form boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("address is required")]
    MissingAddress,
    #[error("city is required")]
    MissingCity,
    #[error("pincode is required")]
    MissingPincode,
    #[error("pincode '{0}' must be exactly 6 digits")]
    MalformedPincode(String),
    #[error("search query is empty")]
    EmptyQuery,
}

/// Location pipeline errors.
#[derive(Debug, Error)]
pub enum LocationError {
    #[error("geolocation is not available on this device")]
    CapabilityUnavailable,

    #[error("location permission denied; retry after granting access or enter the address manually")]
    PermissionDenied,

    #[error("{provider} unreachable: {reason}")]
    ProviderUnreachable { provider: String, reason: String },

    #[error("{provider} timed out")]
    ProviderTimeout { provider: String },

    #[error("{provider} returned no result")]
    NoResultFound { provider: String },

    #[error("invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("geocoded address has no usable city and state")]
    GeocodingIncomplete,

    #[error("geolocation failed: {0}")]
    Geolocation(#[from] GeoErrorCode),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("automatic detection failed ({reason}); please enter your address manually")]
    ManualEntryRequired { reason: String },

    #[error("cannot apply {event} while {state}")]
    InvalidTransition { state: String, event: String },

    #[error("location resolution was cancelled")]
    Cancelled,
}

impl LocationError {
    /// Provider-level failure that only removes one candidate or tier.
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnreachable { .. }
                | Self::ProviderTimeout { .. }
                | Self::NoResultFound { .. }
                | Self::InvalidResponse { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enhanced(pincode: &str) -> EnhancedAddress {
        EnhancedAddress {
            address: "Janpath".into(),
            city: "New Delhi".into(),
            state: "Delhi".into(),
            pincode: pincode.into(),
            locality: None,
            confidence: 0.65,
            display_name: "Janpath, New Delhi, Delhi, India".into(),
        }
    }

    fn fix() -> Fix {
        Fix { latitude: 28.6139, longitude: 77.2090, accuracy: 12.0, timestamp_ms: 0 }
    }

    #[test]
    fn test_fix_record_keeps_accuracy_and_source() {
        let loc = ResolvedLocation::from_fix(&fix(), enhanced("110001"), LocationSource::BrowserGps);
        assert_eq!(loc.source(), LocationSource::BrowserGps);
        assert_eq!(loc.accuracy(), Some(12.0));
        assert_eq!(loc.pincode(), "110001");
        assert!(loc.coordinates_are_measured());
    }

    #[test]
    fn test_unknown_accuracy_is_omitted() {
        let unknown = Fix { accuracy: f64::INFINITY, ..fix() };
        let loc = ResolvedLocation::from_fix(&unknown, enhanced("110001"), LocationSource::BrowserGps);
        assert!(loc.accuracy().is_none());
        assert!(loc.coordinates_are_measured());
        assert!(!loc.display_line(chrono_tz::Asia::Kolkata).contains("inf"));

        let json = serde_json::to_value(&loc).unwrap();
        assert!(json.get("accuracy").is_none());
    }

    #[test]
    fn test_constructor_discards_bad_pincode() {
        let loc = ResolvedLocation::from_fix(&fix(), enhanced("1100 1"), LocationSource::BrowserGps);
        assert_eq!(loc.pincode(), "");
        let loc = ResolvedLocation::from_fix(&fix(), enhanced("abcdef"), LocationSource::BrowserGps);
        assert_eq!(loc.pincode(), "");
    }

    #[test]
    fn test_ip_record_has_no_accuracy() {
        let coords = Coordinates { latitude: 19.076, longitude: 72.877 };
        let loc = ResolvedLocation::from_ip(coords, enhanced("400001"));
        assert_eq!(loc.source(), LocationSource::Ip);
        assert!(loc.accuracy().is_none());
    }

    #[test]
    fn test_candidate_record_is_manual_and_unmeasured() {
        let candidate = SearchCandidate {
            display_name: "Connaught Place, New Delhi".into(),
            latitude: 28.63,
            longitude: 77.21,
            fields: BTreeMap::new(),
        };
        let loc = ResolvedLocation::from_candidate(&candidate, enhanced("110001"));
        assert_eq!(loc.source(), LocationSource::Manual);
        assert!(loc.coordinates().is_some());
        assert!(!loc.coordinates_are_measured());
    }

    #[test]
    fn test_raw_address_empty() {
        assert!(RawAddress::default().is_empty());
        let mut raw = RawAddress::default();
        raw.fields.insert("road".into(), "  ".into());
        assert!(raw.is_empty());
        raw.fields.insert("city".into(), "Pune".into());
        assert!(!raw.is_empty());
        assert_eq!(raw.field("road"), None);
        assert_eq!(raw.field("city"), Some("Pune"));
    }

    #[test]
    fn test_source_serializes_snake_case() {
        let json = serde_json::to_string(&LocationSource::BrowserGps).unwrap();
        assert_eq!(json, "\"browser_gps\"");
        let code: GeoErrorCode = serde_json::from_str("\"position_unavailable\"").unwrap();
        assert_eq!(code, GeoErrorCode::PositionUnavailable);
    }

    #[test]
    fn test_format_coords() {
        assert_eq!(format_coords(28.6139, 77.209), "28.6139\u{00B0}N, 77.2090\u{00B0}E");
        assert_eq!(format_coords(-33.8688, -70.5), "33.8688\u{00B0}S, 70.5000\u{00B0}W");
    }

    #[test]
    fn test_provider_errors_are_classified() {
        let e = LocationError::ProviderTimeout { provider: "nominatim".into() };
        assert!(e.is_provider_error());
        assert!(!LocationError::PermissionDenied.is_provider_error());
    }
}

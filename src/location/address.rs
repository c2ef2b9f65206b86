//! Address enhancement: turns a raw provider payload into city, state and
//! pincode plus a completeness score.
//!
//! Parsing the free-text display string is heuristic. The field priority
//! lists and noise tokens below are the tuning points; the control flow in
//! [`enhance`] does not change when they do.

use super::types::RawAddress;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Sub-fields tried in order when resolving the city.
pub const CITY_FIELD_CHAIN: &[&str] = &[
    "city",
    "town",
    "village",
    "district",
    "county",
    "municipality",
    "suburb",
    "neighbourhood",
];

/// Sub-fields naming the locality, in order.
pub const LOCALITY_FIELD_CHAIN: &[&str] = &["neighbourhood", "suburb"];

/// Display-string segments that name the country rather than a place.
pub const COUNTRY_NOISE: &[&str] = &["india", "bharat", "\u{092D}\u{093E}\u{0930}\u{0924}"];

/// Segments shorter than this are never taken as a city.
const MIN_CITY_SEGMENT_CHARS: usize = 3;

/// Values some providers return in place of a real name.
pub const PLACEHOLDER_VALUES: &[&str] = &["unknown", "n/a", "na", "-", "null", "undefined", "none"];

/// Indian states and union territories, used to reject state segments as
/// cities and to recognise a state in display text.
pub const INDIAN_STATES_AND_UTS: &[&str] = &[
    "Andhra Pradesh",
    "Arunachal Pradesh",
    "Assam",
    "Bihar",
    "Chhattisgarh",
    "Goa",
    "Gujarat",
    "Haryana",
    "Himachal Pradesh",
    "Jharkhand",
    "Karnataka",
    "Kerala",
    "Madhya Pradesh",
    "Maharashtra",
    "Manipur",
    "Meghalaya",
    "Mizoram",
    "Nagaland",
    "Odisha",
    "Punjab",
    "Rajasthan",
    "Sikkim",
    "Tamil Nadu",
    "Telangana",
    "Tripura",
    "Uttar Pradesh",
    "Uttarakhand",
    "West Bengal",
    "Andaman and Nicobar Islands",
    "Chandigarh",
    "Dadra and Nagar Haveli and Daman and Diu",
    "Delhi",
    "Jammu and Kashmir",
    "Ladakh",
    "Lakshadweep",
    "Puducherry",
];

// ─── Confidence weights ─────────────────────────────────────────

pub const W_HOUSE_NUMBER: f64 = 0.20;
pub const W_ROAD: f64 = 0.20;
pub const W_LOCALITY: f64 = 0.15;
pub const W_CITY: f64 = 0.20;
pub const W_STATE: f64 = 0.15;
pub const W_PINCODE: f64 = 0.10;

static PINCODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9]{6}\b").expect("valid pincode regex"));

/// Result of enhancing a raw payload. Cached on disk, so it stays plain data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnhancedAddress {
    pub address: String,
    pub city: String,
    pub state: String,
    pub pincode: String,
    #[serde(default)]
    pub locality: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub display_name: String,
}

impl EnhancedAddress {
    /// Both city and state carry a real name.
    pub fn has_city_and_state(&self) -> bool {
        !is_placeholder(&self.city) && !is_placeholder(&self.state)
    }

    /// Fill empty city/state/pincode from a weaker source (e.g. the IP
    /// provider's own city and region). Present values are never replaced.
    pub fn fill_missing(mut self, city: Option<&str>, state: Option<&str>, pincode: Option<&str>) -> Self {
        if is_placeholder(&self.city) {
            if let Some(c) = city.map(str::trim).filter(|c| !is_placeholder(c)) {
                self.city = c.to_string();
                self.confidence += W_CITY;
            }
        }
        if is_placeholder(&self.state) {
            if let Some(s) = state.map(str::trim).filter(|s| !is_placeholder(s)) {
                self.state = s.to_string();
                self.confidence += W_STATE;
            }
        }
        if self.pincode.is_empty() {
            if let Some(p) = pincode.map(str::trim).filter(|p| is_valid_pincode(p)) {
                self.pincode = p.to_string();
                self.confidence += W_PINCODE;
            }
        }
        if self.address.trim().is_empty() {
            self.address = [self.city.as_str(), self.state.as_str()]
                .iter()
                .filter(|s| !s.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join(", ");
        }
        self.confidence = self.confidence.min(1.0);
        self
    }
}

/// Exactly six ASCII digits.
pub fn is_valid_pincode(s: &str) -> bool {
    s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit())
}

/// The trimmed pincode if valid, otherwise empty.
pub fn sanitize_pincode(s: &str) -> String {
    let s = s.trim();
    if is_valid_pincode(s) {
        s.to_string()
    } else {
        String::new()
    }
}

/// Empty or a known stand-in value.
pub fn is_placeholder(s: &str) -> bool {
    let s = s.trim();
    s.is_empty() || PLACEHOLDER_VALUES.iter().any(|p| s.eq_ignore_ascii_case(p))
}

fn known_state(segment: &str) -> Option<&'static str> {
    INDIAN_STATES_AND_UTS
        .iter()
        .copied()
        .find(|s| s.eq_ignore_ascii_case(segment.trim()))
}

fn has_state_marker(segment: &str) -> bool {
    segment.contains("Union Territory")
        || segment.split_whitespace().any(|w| w == "State" || w == "UT")
}

fn is_noise_segment(segment: &str) -> bool {
    let lower = segment.to_lowercase();
    COUNTRY_NOISE.contains(&lower.as_str())
        || lower.contains("district")
        || is_valid_pincode(segment)
        || known_state(segment).is_some()
        || has_state_marker(segment)
        || is_placeholder(segment)
}

fn display_segments(display: &str) -> impl Iterator<Item = &str> {
    display.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// First display segment that can plausibly be a city.
pub fn city_from_display(display: &str) -> Option<String> {
    display_segments(display)
        .find(|s| s.chars().count() >= MIN_CITY_SEGMENT_CHARS && !is_noise_segment(s))
        .map(String::from)
}

pub fn resolve_city(raw: &RawAddress) -> String {
    CITY_FIELD_CHAIN
        .iter()
        .filter_map(|key| raw.field(key))
        .find(|v| !is_placeholder(v))
        .map(String::from)
        .or_else(|| city_from_display(&raw.display_name))
        .unwrap_or_default()
}

pub fn resolve_state(raw: &RawAddress) -> String {
    if let Some(state) = raw.field("state").filter(|s| !is_placeholder(s)) {
        return state.to_string();
    }
    if let Some(marked) = display_segments(&raw.display_name).find(|s| has_state_marker(s)) {
        return marked.to_string();
    }
    display_segments(&raw.display_name)
        .find_map(known_state)
        .map(String::from)
        .unwrap_or_default()
}

/// Direct `postcode` field when valid, else a standalone 6-digit run in the
/// display text, else empty.
pub fn resolve_pincode(raw: &RawAddress) -> String {
    raw.field("postcode")
        .filter(|p| is_valid_pincode(p))
        .or_else(|| PINCODE_RE.find(&raw.display_name).map(|m| m.as_str()))
        .map(sanitize_pincode)
        .unwrap_or_default()
}

pub fn resolve_locality(raw: &RawAddress) -> Option<String> {
    LOCALITY_FIELD_CHAIN
        .iter()
        .find_map(|key| raw.field(key))
        .map(String::from)
}

fn address_line(raw: &RawAddress, locality: Option<&str>) -> String {
    let parts: Vec<&str> = [raw.field("house_number"), raw.field("road"), locality]
        .into_iter()
        .flatten()
        .collect();
    if parts.is_empty() {
        raw.display_name.trim().to_string()
    } else {
        parts.join(", ")
    }
}

/// Weighted completeness score in `[0, 1]`. A heuristic, not a probability.
pub fn confidence(raw: &RawAddress, city: &str, state: &str, pincode: &str) -> f64 {
    let mut score = 0.0;
    if raw.field("house_number").is_some() {
        score += W_HOUSE_NUMBER;
    }
    if raw.field("road").is_some() {
        score += W_ROAD;
    }
    if LOCALITY_FIELD_CHAIN.iter().any(|key| raw.field(key).is_some()) {
        score += W_LOCALITY;
    }
    if !is_placeholder(city) {
        score += W_CITY;
    }
    if !is_placeholder(state) {
        score += W_STATE;
    }
    if is_valid_pincode(pincode) {
        score += W_PINCODE;
    }
    f64::min(score, 1.0)
}

/// Enhance a raw provider payload.
pub fn enhance(raw: &RawAddress) -> EnhancedAddress {
    let city = resolve_city(raw);
    let state = resolve_state(raw);
    let pincode = resolve_pincode(raw);
    let locality = resolve_locality(raw);
    let confidence = confidence(raw, &city, &state, &pincode);

    EnhancedAddress {
        address: address_line(raw, locality.as_deref()),
        city,
        state,
        pincode,
        locality,
        confidence,
        display_name: raw.display_name.trim().to_string(),
    }
}

//! Resolver state machine.
//!
//! `transition` is pure: the driver in `resolver` performs the side effects
//! and feeds their outcomes back in as events. Success transitions check the
//! record's provenance, so a GPS step can never finish with an IP record and
//! vice versa.

use super::types::{LocationError, LocationSource, ResolvedLocation};
use serde::Serialize;

/// Sub-step of an automatic detection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CheckingPermission,
    AcquiringGps,
    IpFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResolverState {
    Idle,
    Detecting { stage: Stage },
    /// Terminal for automatic detection; the user may retry or go manual.
    PermissionDenied,
    ManualEntry { reason: String },
    Success { location: ResolvedLocation },
    /// Torn down. Nothing leaves this state.
    Cancelled,
}

impl ResolverState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Detecting { stage: Stage::CheckingPermission } => "checking permission",
            Self::Detecting { stage: Stage::AcquiringGps } => "acquiring GPS",
            Self::Detecting { stage: Stage::IpFallback } => "trying IP fallback",
            Self::PermissionDenied => "permission denied",
            Self::ManualEntry { .. } => "awaiting manual entry",
            Self::Success { .. } => "resolved",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_detecting(&self) -> bool {
        matches!(self, Self::Detecting { .. })
    }

    pub fn location(&self) -> Option<&ResolvedLocation> {
        match self {
            Self::Success { location } => Some(location),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolverEvent {
    Start,
    PermissionGranted,
    PermissionDenied,
    CapabilityMissing,
    GpsResolved(ResolvedLocation),
    GpsFailed(String),
    IpResolved(ResolvedLocation),
    IpFailed(String),
    ChooseManual,
    CandidateSelected(ResolvedLocation),
    ManualSubmitted(ResolvedLocation),
    Retry,
    Cancel,
}

impl ResolverEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::PermissionGranted => "permission granted",
            Self::PermissionDenied => "permission denied",
            Self::CapabilityMissing => "capability missing",
            Self::GpsResolved(_) => "GPS resolved",
            Self::GpsFailed(_) => "GPS failed",
            Self::IpResolved(_) => "IP resolved",
            Self::IpFailed(_) => "IP failed",
            Self::ChooseManual => "choose manual",
            Self::CandidateSelected(_) => "candidate selected",
            Self::ManualSubmitted(_) => "manual submitted",
            Self::Retry => "retry",
            Self::Cancel => "cancel",
        }
    }
}

pub const PERMISSION_DENIED_REASON: &str = "location permission was denied";

pub fn transition(state: &ResolverState, event: ResolverEvent) -> Result<ResolverState, LocationError> {
    use ResolverEvent as E;
    use ResolverState as S;

    let event_name = event.name();
    let detecting = |stage| S::Detecting { stage };

    let next = match (state, event) {
        (S::Cancelled, E::Cancel) => S::Cancelled,
        (S::Cancelled, _) => return Err(LocationError::Cancelled),
        (_, E::Cancel) => S::Cancelled,

        (S::Idle, E::Start) => detecting(Stage::CheckingPermission),
        (S::PermissionDenied | S::ManualEntry { .. } | S::Success { .. }, E::Retry) => {
            detecting(Stage::CheckingPermission)
        }

        (S::Detecting { stage: Stage::CheckingPermission }, E::PermissionGranted) => detecting(Stage::AcquiringGps),
        (S::Detecting { stage: Stage::CheckingPermission }, E::PermissionDenied) => S::PermissionDenied,
        (S::Detecting { stage: Stage::CheckingPermission }, E::CapabilityMissing) => detecting(Stage::IpFallback),

        (S::Detecting { stage: Stage::AcquiringGps }, E::GpsResolved(location)) if location.source().is_gps() => {
            S::Success { location }
        }
        (S::Detecting { stage: Stage::AcquiringGps }, E::GpsFailed(_)) => detecting(Stage::IpFallback),

        (S::Detecting { stage: Stage::IpFallback }, E::IpResolved(location))
            if location.source() == LocationSource::Ip =>
        {
            S::Success { location }
        }
        (S::Detecting { stage: Stage::IpFallback }, E::IpFailed(reason)) => S::ManualEntry { reason },

        (S::PermissionDenied, E::ChooseManual) => S::ManualEntry {
            reason: PERMISSION_DENIED_REASON.to_string(),
        },

        (_, E::CandidateSelected(location) | E::ManualSubmitted(location))
            if location.source() == LocationSource::Manual =>
        {
            S::Success { location }
        }

        (state, _) => {
            return Err(LocationError::InvalidTransition {
                state: state.name().to_string(),
                event: event_name.to_string(),
            })
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::address::EnhancedAddress;
    use crate::location::manual::ManualEntry;
    use crate::location::types::{Coordinates, Fix};

    fn addr() -> EnhancedAddress {
        EnhancedAddress {
            address: "Fort".into(),
            city: "Mumbai".into(),
            state: "Maharashtra".into(),
            pincode: "400001".into(),
            locality: None,
            confidence: 0.6,
            display_name: "Fort, Mumbai".into(),
        }
    }

    fn gps_record() -> ResolvedLocation {
        let fix = Fix { latitude: 18.93, longitude: 72.83, accuracy: 20.0, timestamp_ms: 0 };
        ResolvedLocation::from_fix(&fix, addr(), LocationSource::BrowserGps)
    }

    fn ip_record() -> ResolvedLocation {
        ResolvedLocation::from_ip(Coordinates { latitude: 19.07, longitude: 72.87 }, addr())
    }

    fn manual_record() -> ResolvedLocation {
        let entry = ManualEntry {
            address: "Fort".into(),
            city: "Mumbai".into(),
            pincode: "400001".into(),
            ..Default::default()
        };
        ResolvedLocation::from_manual(&entry, None)
    }

    fn at(stage: Stage) -> ResolverState {
        ResolverState::Detecting { stage }
    }

    #[test]
    fn test_happy_gps_path() {
        let s = transition(&ResolverState::Idle, ResolverEvent::Start).unwrap();
        assert_eq!(s, at(Stage::CheckingPermission));
        let s = transition(&s, ResolverEvent::PermissionGranted).unwrap();
        assert_eq!(s, at(Stage::AcquiringGps));
        let s = transition(&s, ResolverEvent::GpsResolved(gps_record())).unwrap();
        assert_eq!(s.location().map(|l| l.source()), Some(LocationSource::BrowserGps));
    }

    #[test]
    fn test_fallback_chain_to_manual() {
        let s = transition(&at(Stage::AcquiringGps), ResolverEvent::GpsFailed("timeout".into())).unwrap();
        assert_eq!(s, at(Stage::IpFallback));
        let s = transition(&s, ResolverEvent::IpFailed("offline".into())).unwrap();
        assert_eq!(s, ResolverState::ManualEntry { reason: "offline".into() });
    }

    #[test]
    fn test_capability_missing_skips_gps() {
        let s = transition(&at(Stage::CheckingPermission), ResolverEvent::CapabilityMissing).unwrap();
        assert_eq!(s, at(Stage::IpFallback));
    }

    #[test]
    fn test_provenance_is_checked() {
        let err = transition(&at(Stage::AcquiringGps), ResolverEvent::GpsResolved(ip_record())).unwrap_err();
        assert!(matches!(err, LocationError::InvalidTransition { .. }));
        let err = transition(&at(Stage::IpFallback), ResolverEvent::IpResolved(gps_record())).unwrap_err();
        assert!(matches!(err, LocationError::InvalidTransition { .. }));
        let err = transition(&ResolverState::Idle, ResolverEvent::ManualSubmitted(ip_record())).unwrap_err();
        assert!(matches!(err, LocationError::InvalidTransition { .. }));
    }

    #[test]
    fn test_ip_success_is_not_a_gps_step() {
        let err = transition(&at(Stage::AcquiringGps), ResolverEvent::IpResolved(ip_record())).unwrap_err();
        assert!(matches!(err, LocationError::InvalidTransition { .. }));
    }

    #[test]
    fn test_permission_denied_then_manual_or_retry() {
        let denied = transition(&at(Stage::CheckingPermission), ResolverEvent::PermissionDenied).unwrap();
        assert_eq!(denied, ResolverState::PermissionDenied);

        let manual = transition(&denied, ResolverEvent::ChooseManual).unwrap();
        assert!(matches!(manual, ResolverState::ManualEntry { .. }));

        let retry = transition(&denied, ResolverEvent::Retry).unwrap();
        assert_eq!(retry, at(Stage::CheckingPermission));
    }

    #[test]
    fn test_manual_allowed_from_anywhere_live() {
        for state in [
            ResolverState::Idle,
            at(Stage::AcquiringGps),
            ResolverState::PermissionDenied,
            ResolverState::ManualEntry { reason: "x".into() },
            ResolverState::Success { location: ip_record() },
        ] {
            let s = transition(&state, ResolverEvent::ManualSubmitted(manual_record())).unwrap();
            assert_eq!(s.location().map(|l| l.source()), Some(LocationSource::Manual));
        }
    }

    #[test]
    fn test_cancelled_is_final() {
        let s = transition(&at(Stage::IpFallback), ResolverEvent::Cancel).unwrap();
        assert_eq!(s, ResolverState::Cancelled);
        assert_eq!(transition(&s, ResolverEvent::Cancel).unwrap(), ResolverState::Cancelled);
        assert!(matches!(transition(&s, ResolverEvent::Retry), Err(LocationError::Cancelled)));
        assert!(matches!(
            transition(&s, ResolverEvent::ManualSubmitted(manual_record())),
            Err(LocationError::Cancelled)
        ));
    }

    #[test]
    fn test_stray_events_rejected() {
        assert!(transition(&ResolverState::Idle, ResolverEvent::Retry).is_err());
        assert!(transition(&ResolverState::Idle, ResolverEvent::PermissionGranted).is_err());
        assert!(transition(&at(Stage::IpFallback), ResolverEvent::GpsFailed("late".into())).is_err());
        assert!(transition(&ResolverState::Success { location: gps_record() }, ResolverEvent::Start).is_err());
    }

    #[test]
    fn test_state_serializes_tagged() {
        let json = serde_json::to_value(at(Stage::AcquiringGps)).unwrap();
        assert_eq!(json["state"], "detecting");
        assert_eq!(json["stage"], "acquiring_gps");
    }
}

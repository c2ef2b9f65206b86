//! Manual address entry: the last tier, always available to the user.

use super::address::is_valid_pincode;
use super::types::ValidationError;
use serde::{Deserialize, Serialize};

/// A manually typed address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualEntry {
    pub address: String,
    pub city: String,
    #[serde(default)]
    pub state: Option<String>,
    pub pincode: String,
    #[serde(default)]
    pub locality: Option<String>,
}

impl ManualEntry {
    /// Check required fields. Nothing is sent to any provider before this
    /// passes.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.address.trim().is_empty() {
            return Err(ValidationError::MissingAddress);
        }
        if self.city.trim().is_empty() {
            return Err(ValidationError::MissingCity);
        }
        let pincode = self.pincode.trim();
        if pincode.is_empty() {
            return Err(ValidationError::MissingPincode);
        }
        if !is_valid_pincode(pincode) {
            return Err(ValidationError::MalformedPincode(pincode.to_string()));
        }
        Ok(())
    }
}

/// Validate a pincode typed on its own (e.g. for a directory lookup).
pub fn validate_pincode(pincode: &str) -> Result<&str, ValidationError> {
    let pincode = pincode.trim();
    if pincode.is_empty() {
        Err(ValidationError::MissingPincode)
    } else if is_valid_pincode(pincode) {
        Ok(pincode)
    } else {
        Err(ValidationError::MalformedPincode(pincode.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baker_street() -> ManualEntry {
        ManualEntry {
            address: "221B Baker Street".into(),
            city: "Delhi".into(),
            state: None,
            pincode: "110001".into(),
            locality: None,
        }
    }

    #[test]
    fn test_valid_entry_without_state() {
        assert_eq!(baker_street().validate(), Ok(()));
    }

    #[test]
    fn test_missing_fields() {
        let entry = ManualEntry { address: "  ".into(), ..baker_street() };
        assert_eq!(entry.validate(), Err(ValidationError::MissingAddress));

        let entry = ManualEntry { city: String::new(), ..baker_street() };
        assert_eq!(entry.validate(), Err(ValidationError::MissingCity));

        let entry = ManualEntry { pincode: String::new(), ..baker_street() };
        assert_eq!(entry.validate(), Err(ValidationError::MissingPincode));
    }

    #[test]
    fn test_malformed_pincode() {
        for bad in ["11000", "1100011", "11000a", "1100 1"] {
            let entry = ManualEntry { pincode: bad.into(), ..baker_street() };
            assert_eq!(entry.validate(), Err(ValidationError::MalformedPincode(bad.into())));
        }
    }

    #[test]
    fn test_validate_pincode_trims() {
        assert_eq!(validate_pincode(" 560001 "), Ok("560001"));
        assert!(validate_pincode("56000").is_err());
    }
}

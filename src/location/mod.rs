//! Location subsystem for the marketplace.
//!
//! Device GPS with accuracy refinement, IP-based fallback, a reverse
//! geocoding race with address enhancement, place search, manual entry
//! and a pincode directory.

pub mod address;
pub mod cache;
pub mod geocode;
pub mod geolocation;
pub mod gps;
pub mod machine;
pub mod manual;
pub mod providers;
pub mod resolver;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use address::EnhancedAddress;
pub use geolocation::{GpsdGeolocation, ReplayGeolocation, StaticPermission};
pub use machine::{ResolverState, Stage};
pub use manual::ManualEntry;
pub use resolver::{CancelHandle, LocationResolver, ResolverBuilder, SearchHandle};
pub use types::{
    format_coords, Coordinates, Fix, LocationError, LocationSource, PermissionState, PincodeDetails,
    ResolvedLocation, SearchCandidate, ValidationError,
};

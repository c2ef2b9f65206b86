//! Location resolver: drives the fallback chain.
//!
//! Auto flow:   permission → GPS (refined) → reverse geocode → IP → manual
//! Manual flow: search → select candidate, or typed form → validate
//!
//! Side effects live here; every state change goes through
//! [`machine::transition`].

use super::address;
use super::cache::GeocodeCache;
use super::geocode::{GeocodeRace, DEFAULT_PER_CALL_TIMEOUT};
use super::geolocation::{Geolocation, GpsdGeolocation, PermissionQuery};
use super::gps::{self, AcquisitionPolicy};
use super::machine::{self, ResolverEvent, ResolverState, Stage};
use super::manual::{self, ManualEntry};
use super::providers::{
    HttpClient, IndiaPostDirectory, IpApiLocator, IpLocator, NominatimReverse, NominatimSearch, PincodeDirectory,
    PlaceSearch, ReverseGeocoder,
};
use super::types::{
    Coordinates, Fix, LocationError, LocationSource, PermissionState, PincodeDetails, ResolvedLocation,
    SearchCandidate, ValidationError,
};
use crate::config::Config;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cloneable handle that tears a resolver down from another task.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Cloneable place search that runs alongside an attempt in flight, so the
/// user can switch to search while detection is still running.
#[derive(Clone)]
pub struct SearchHandle {
    search: Option<Arc<dyn PlaceSearch>>,
    token: CancellationToken,
}

impl SearchHandle {
    /// Forward-geocode free text. Never changes resolver state.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>, LocationError> {
        if self.token.is_cancelled() {
            return Err(LocationError::Cancelled);
        }
        let query = query.trim();
        if query.is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        let search = self.search.as_ref().ok_or(LocationError::CapabilityUnavailable)?;
        let candidates = search.search(query).await?;
        tracing::debug!(query, results = candidates.len(), "place search");
        Ok(candidates)
    }
}

// ─── Builder ────────────────────────────────────────────────────

/// Collects capabilities and providers. Cheap to clone, so a server can keep
/// one as a template and stamp out a resolver per request.
#[derive(Clone)]
pub struct ResolverBuilder {
    policy: AcquisitionPolicy,
    geolocation: Option<Arc<dyn Geolocation>>,
    permissions: Option<Arc<dyn PermissionQuery>>,
    reverse: Vec<Arc<dyn ReverseGeocoder>>,
    per_call_timeout: Duration,
    cache: Option<Arc<Mutex<GeocodeCache>>>,
    ip: Option<Arc<dyn IpLocator>>,
    search: Option<Arc<dyn PlaceSearch>>,
    pincodes: Option<Arc<dyn PincodeDirectory>>,
    placeholder: Option<Coordinates>,
}

impl Default for ResolverBuilder {
    fn default() -> Self {
        Self {
            policy: AcquisitionPolicy::default(),
            geolocation: None,
            permissions: None,
            reverse: Vec::new(),
            per_call_timeout: DEFAULT_PER_CALL_TIMEOUT,
            cache: None,
            ip: None,
            search: None,
            pincodes: None,
            placeholder: None,
        }
    }
}

impl ResolverBuilder {
    /// Wire the HTTP providers, cache and (if configured) gpsd from config.
    pub fn from_config(config: &Config) -> Self {
        let geocoding = &config.geocoding;
        let http = HttpClient::new(&geocoding.user_agent, geocoding.per_call_timeout());

        let reverse = geocoding
            .endpoints
            .iter()
            .map(|ep| {
                Arc::new(NominatimReverse::new(
                    &ep.name,
                    &geocoding.base_url,
                    ep.zoom,
                    ep.country_codes.clone(),
                    http.clone(),
                )) as Arc<dyn ReverseGeocoder>
            })
            .collect();

        let mut builder = Self {
            policy: config.gps.policy(),
            reverse,
            per_call_timeout: geocoding.per_call_timeout(),
            placeholder: config.manual.placeholder(),
            ..Self::default()
        };

        if let Some(addr) = &config.gps.gpsd {
            builder.geolocation = Some(Arc::new(GpsdGeolocation::new(addr.clone())));
        }
        if config.ip.enabled {
            let ip_http = HttpClient::new(&geocoding.user_agent, config.ip.timeout());
            builder.ip = Some(Arc::new(IpApiLocator::new(&config.ip.base_url, ip_http)));
        }
        if config.search.enabled {
            builder.search = Some(Arc::new(NominatimSearch::new(
                &geocoding.base_url,
                config.search.limit,
                config.search.country_codes.clone(),
                http.clone(),
            )));
        }
        if config.pincode.enabled {
            builder.pincodes = Some(Arc::new(IndiaPostDirectory::new(&config.pincode.base_url, http)));
        }
        if config.cache.enabled {
            let path = config.cache.path.clone().unwrap_or_else(GeocodeCache::default_path);
            builder.cache = Some(Arc::new(Mutex::new(GeocodeCache::load_from(path, config.cache.ttl_days))));
        }
        builder
    }

    pub fn policy(mut self, policy: AcquisitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn geolocation(mut self, geo: Arc<dyn Geolocation>) -> Self {
        self.geolocation = Some(geo);
        self
    }

    pub fn without_geolocation(mut self) -> Self {
        self.geolocation = None;
        self
    }

    pub fn permissions(mut self, query: Arc<dyn PermissionQuery>) -> Self {
        self.permissions = Some(query);
        self
    }

    /// Append a reverse geocoder. Earlier providers win ties.
    pub fn reverse_geocoder(mut self, provider: Arc<dyn ReverseGeocoder>) -> Self {
        self.reverse.push(provider);
        self
    }

    pub fn per_call_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = timeout;
        self
    }

    pub fn cache(mut self, cache: Arc<Mutex<GeocodeCache>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn ip_locator(mut self, ip: Arc<dyn IpLocator>) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn place_search(mut self, search: Arc<dyn PlaceSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn pincode_directory(mut self, directory: Arc<dyn PincodeDirectory>) -> Self {
        self.pincodes = Some(directory);
        self
    }

    pub fn placeholder(mut self, coords: Option<Coordinates>) -> Self {
        self.placeholder = coords;
        self
    }

    pub fn build(self) -> LocationResolver {
        let mut geocoder = GeocodeRace::new(self.reverse, self.per_call_timeout);
        if let Some(cache) = self.cache {
            geocoder = geocoder.with_cache(cache);
        }
        LocationResolver {
            policy: self.policy,
            geolocation: self.geolocation,
            permissions: self.permissions,
            geocoder,
            ip: self.ip,
            search: self.search,
            pincodes: self.pincodes,
            placeholder: self.placeholder,
            state: ResolverState::Idle,
            teardown: CancellationToken::new(),
        }
    }
}

/// Builder for an IP locator bound to one client address, used by the HTTP
/// host where the caller is not the machine running the resolver.
pub fn client_ip_locator(config: &Config, client: Option<IpAddr>) -> Arc<dyn IpLocator> {
    let http = HttpClient::new(&config.geocoding.user_agent, config.ip.timeout());
    Arc::new(IpApiLocator::new(&config.ip.base_url, http).for_client(client))
}

// ─── Resolver ───────────────────────────────────────────────────

/// The location resolver with its fallback pipeline.
pub struct LocationResolver {
    policy: AcquisitionPolicy,
    geolocation: Option<Arc<dyn Geolocation>>,
    permissions: Option<Arc<dyn PermissionQuery>>,
    geocoder: GeocodeRace,
    ip: Option<Arc<dyn IpLocator>>,
    search: Option<Arc<dyn PlaceSearch>>,
    pincodes: Option<Arc<dyn PincodeDirectory>>,
    placeholder: Option<Coordinates>,
    state: ResolverState,
    teardown: CancellationToken,
}

impl LocationResolver {
    pub fn builder() -> ResolverBuilder {
        ResolverBuilder::default()
    }

    pub fn from_config(config: &Config) -> Self {
        ResolverBuilder::from_config(config).build()
    }

    pub fn state(&self) -> &ResolverState {
        &self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.teardown.clone(),
        }
    }

    pub fn search_handle(&self) -> SearchHandle {
        SearchHandle {
            search: self.search.clone(),
            token: self.teardown.clone(),
        }
    }

    /// Tear down. An attempt in flight ends with `Cancelled`; the resolver
    /// accepts nothing afterwards.
    pub fn cancel(&mut self) {
        self.teardown.cancel();
        if let Err(e) = self.apply(ResolverEvent::Cancel) {
            tracing::debug!(error = %e, "cancel on torn-down resolver");
        }
    }

    /// Run automatic detection: GPS, then IP, then hand over to manual entry.
    ///
    /// Errors are limited to `PermissionDenied`, `ManualEntryRequired` and
    /// `Cancelled`.
    pub async fn resolve(&mut self) -> Result<ResolvedLocation, LocationError> {
        self.begin()?;
        self.drive().await
    }

    /// New attempt after a result, a denial or a manual-entry handover.
    /// Permission is queried again. An attempt abandoned mid-flight is
    /// discarded and detection starts over.
    pub async fn retry(&mut self) -> Result<ResolvedLocation, LocationError> {
        self.ensure_live()?;
        let event = if self.state.is_detecting() {
            self.abandon_attempt();
            ResolverEvent::Start
        } else {
            ResolverEvent::Retry
        };
        self.apply(event)?;
        self.drive().await
    }

    /// Run the pipeline for a fix the caller already accepted (e.g. a browser
    /// refined it on its side). Skips acquisition but keeps the geocoding and
    /// IP fallback steps. `source` must be a GPS tag.
    pub async fn resolve_fix(&mut self, fix: Fix, source: LocationSource) -> Result<ResolvedLocation, LocationError> {
        if !source.is_gps() {
            return Err(LocationError::InvalidTransition {
                state: self.state.name().to_string(),
                event: format!("fix tagged {}", source),
            });
        }
        self.begin()?;
        self.apply(ResolverEvent::PermissionGranted)?;
        let token = self.teardown.clone();
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => ResolverEvent::Cancel,
            event = self.geocode_fix(fix, source) => event,
        };
        self.apply(event)?;
        self.drive().await
    }

    /// Leave a permission denial for the manual form.
    pub fn choose_manual(&mut self) -> Result<(), LocationError> {
        self.apply(ResolverEvent::ChooseManual)
    }

    /// Forward-geocode free text. Never changes state. Use
    /// [`search_handle`](Self::search_handle) to search while `resolve` runs.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>, LocationError> {
        self.ensure_live()?;
        self.search_handle().search(query).await
    }

    /// Accept a search candidate as the user's location.
    pub fn select_candidate(&mut self, candidate: &SearchCandidate) -> Result<ResolvedLocation, LocationError> {
        self.ensure_live()?;
        self.abandon_attempt();
        let enhanced = address::enhance(&candidate.raw());
        let location = ResolvedLocation::from_candidate(candidate, enhanced);
        self.apply(ResolverEvent::CandidateSelected(location.clone()))?;
        Ok(location)
    }

    /// Accept a typed address. Validation failures leave the state alone.
    pub fn submit_manual(&mut self, entry: &ManualEntry) -> Result<ResolvedLocation, LocationError> {
        self.ensure_live()?;
        entry.validate()?;
        self.abandon_attempt();
        let location = ResolvedLocation::from_manual(entry, self.placeholder);
        self.apply(ResolverEvent::ManualSubmitted(location.clone()))?;
        Ok(location)
    }

    /// Post-office data to pre-fill the manual form.
    pub async fn lookup_pincode(&self, pincode: &str) -> Result<PincodeDetails, LocationError> {
        let pincode = manual::validate_pincode(pincode)?;
        let directory = self.pincodes.as_ref().ok_or(LocationError::CapabilityUnavailable)?;
        directory.lookup(pincode).await
    }

    // ─── Driver ─────────────────────────────────────────────────

    fn ensure_live(&self) -> Result<(), LocationError> {
        if self.teardown.is_cancelled() || self.state == ResolverState::Cancelled {
            return Err(LocationError::Cancelled);
        }
        Ok(())
    }

    /// A previous attempt whose future was dropped mid-flight leaves the
    /// state in `Detecting`; its watch is already released.
    fn abandon_attempt(&mut self) {
        if self.state.is_detecting() {
            tracing::debug!(state = self.state.name(), "discarding abandoned attempt");
            self.state = ResolverState::Idle;
        }
    }

    fn begin(&mut self) -> Result<(), LocationError> {
        if let Err(e) = self.ensure_live() {
            self.state = ResolverState::Cancelled;
            return Err(e);
        }
        self.abandon_attempt();
        let event = match self.state {
            ResolverState::Idle => ResolverEvent::Start,
            _ => ResolverEvent::Retry,
        };
        self.apply(event)
    }

    fn apply(&mut self, event: ResolverEvent) -> Result<(), LocationError> {
        let next = machine::transition(&self.state, event)?;
        if next != self.state {
            tracing::info!(from = self.state.name(), to = next.name(), "resolver state");
        }
        self.state = next;
        Ok(())
    }

    async fn drive(&mut self) -> Result<ResolvedLocation, LocationError> {
        let token = self.teardown.clone();
        while let ResolverState::Detecting { stage } = self.state {
            let step = async {
                match stage {
                    Stage::CheckingPermission => self.check_permission().await,
                    Stage::AcquiringGps => self.acquire_gps().await,
                    Stage::IpFallback => self.ip_fallback().await,
                }
            };
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => ResolverEvent::Cancel,
                event = step => event,
            };
            self.apply(event)?;
        }
        self.outcome()
    }

    fn outcome(&self) -> Result<ResolvedLocation, LocationError> {
        match &self.state {
            ResolverState::Success { location } => Ok(location.clone()),
            ResolverState::PermissionDenied => Err(LocationError::PermissionDenied),
            ResolverState::ManualEntry { reason } => Err(LocationError::ManualEntryRequired {
                reason: reason.clone(),
            }),
            ResolverState::Cancelled => Err(LocationError::Cancelled),
            other => Err(LocationError::InvalidTransition {
                state: other.name().to_string(),
                event: "finish".to_string(),
            }),
        }
    }

    async fn check_permission(&self) -> ResolverEvent {
        if self.geolocation.is_none() {
            tracing::info!("no geolocation capability, skipping to IP fallback");
            return ResolverEvent::CapabilityMissing;
        }
        let state = match &self.permissions {
            Some(query) => query.query().await,
            None => PermissionState::Unknown,
        };
        match state {
            PermissionState::Denied => ResolverEvent::PermissionDenied,
            PermissionState::Granted | PermissionState::Unknown => ResolverEvent::PermissionGranted,
        }
    }

    async fn acquire_gps(&self) -> ResolverEvent {
        let Some(geo) = self.geolocation.clone() else {
            return ResolverEvent::GpsFailed(LocationError::CapabilityUnavailable.to_string());
        };
        let source = geo.source();
        match gps::acquire_fix(geo, &self.policy).await {
            Ok(fix) => self.geocode_fix(fix, source).await,
            Err(e) => {
                tracing::warn!(error = %e, "GPS acquisition failed");
                ResolverEvent::GpsFailed(e.to_string())
            }
        }
    }

    async fn geocode_fix(&self, fix: Fix, source: LocationSource) -> ResolverEvent {
        match self.geocoder.reverse(fix.latitude, fix.longitude).await {
            Ok(enhanced) => ResolverEvent::GpsResolved(ResolvedLocation::from_fix(&fix, enhanced, source)),
            Err(e) => {
                tracing::warn!(error = %e, lat = fix.latitude, lon = fix.longitude, "GPS fix could not be geocoded");
                ResolverEvent::GpsFailed(e.to_string())
            }
        }
    }

    async fn ip_fallback(&self) -> ResolverEvent {
        let Some(ip) = &self.ip else {
            return ResolverEvent::IpFailed("no IP geolocation provider is configured".into());
        };
        let located = match ip.locate().await {
            Ok(located) => located,
            Err(e) => {
                tracing::warn!(error = %e, "IP geolocation failed");
                return ResolverEvent::IpFailed(format!("IP geolocation failed: {}", e));
            }
        };
        let (Some(latitude), Some(longitude)) = (located.latitude, located.longitude) else {
            return ResolverEvent::IpFailed("IP geolocation returned no coordinates".into());
        };

        let geocoded = self.geocoder.lookup(latitude, longitude).await.unwrap_or_default();
        let merged = geocoded.fill_missing(
            located.city.as_deref(),
            located.region.as_deref(),
            located.postal.as_deref(),
        );
        if !merged.has_city_and_state() {
            return ResolverEvent::IpFailed("could not determine city and state from the IP location".into());
        }
        ResolverEvent::IpResolved(ResolvedLocation::from_ip(Coordinates { latitude, longitude }, merged))
    }
}

impl Drop for LocationResolver {
    fn drop(&mut self) {
        self.teardown.cancel();
    }
}

//! Multi-provider reverse geocoding.
//!
//! Every configured endpoint is queried at once, each under its own timeout,
//! and the race waits for all of them to settle. The winner is the first
//! provider in declaration order that returned a non-empty payload. Arrival
//! order and payload quality play no part, so the same inputs always pick the
//! same provider.

use super::address::{self, EnhancedAddress};
use super::cache::GeocodeCache;
use super::providers::ReverseGeocoder;
use super::types::{LocationError, RawAddress};
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const DEFAULT_PER_CALL_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Clone)]
pub struct GeocodeRace {
    providers: Vec<Arc<dyn ReverseGeocoder>>,
    per_call_timeout: Duration,
    cache: Option<Arc<Mutex<GeocodeCache>>>,
}

impl GeocodeRace {
    pub fn new(providers: Vec<Arc<dyn ReverseGeocoder>>, per_call_timeout: Duration) -> Self {
        Self {
            providers,
            per_call_timeout,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<Mutex<GeocodeCache>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Query all providers concurrently and pick the winner by priority.
    pub async fn race(&self, lat: f64, lon: f64) -> Option<(String, RawAddress)> {
        let per_call = self.per_call_timeout;
        let calls = self.providers.iter().map(|provider| {
            let provider = Arc::clone(provider);
            async move {
                let name = provider.name().to_string();
                let outcome = match tokio::time::timeout(per_call, provider.reverse(lat, lon)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(LocationError::ProviderTimeout { provider: name.clone() }),
                };
                (name, outcome)
            }
        });
        pick_by_priority(join_all(calls).await)
    }

    /// Race and enhance, without judging completeness. Cache hits skip the
    /// network entirely.
    pub async fn lookup(&self, lat: f64, lon: f64) -> Option<EnhancedAddress> {
        if let Some(hit) = self.cached(lat, lon) {
            tracing::debug!(lat, lon, "geocode cache hit");
            return Some(hit);
        }
        let (provider, raw) = self.race(lat, lon).await?;
        let enhanced = address::enhance(&raw);
        tracing::debug!(%provider, confidence = enhanced.confidence, city = %enhanced.city, "reverse geocoded");
        Some(enhanced)
    }

    /// Race and enhance; fails unless both city and state were found.
    pub async fn reverse(&self, lat: f64, lon: f64) -> Result<EnhancedAddress, LocationError> {
        let enhanced = self
            .lookup(lat, lon)
            .await
            .ok_or_else(|| LocationError::NoResultFound {
                provider: "reverse geocoding".to_string(),
            })?;
        if !enhanced.has_city_and_state() {
            return Err(LocationError::GeocodingIncomplete);
        }
        self.store(lat, lon, &enhanced).await;
        Ok(enhanced)
    }

    /// Update the in-memory cache under the lock, then write the file on the
    /// blocking pool. Write failures only cost a future cache hit.
    async fn store(&self, lat: f64, lon: f64, enhanced: &EnhancedAddress) {
        let Some(cache) = &self.cache else {
            return;
        };
        let snapshot = {
            let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
            if !cache.insert(lat, lon, enhanced) {
                return;
            }
            cache.snapshot()
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!(error = %e, "geocode cache not serialized");
                return;
            }
        };
        match tokio::task::spawn_blocking(move || {
            let path = snapshot.path().to_path_buf();
            snapshot.write().map_err(|e| (path, e))
        })
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err((path, e))) => {
                tracing::debug!(path = %path.display(), error = %e, "geocode cache not written")
            }
            Err(e) => tracing::debug!(error = %e, "geocode cache write task failed"),
        }
    }

    fn cached(&self, lat: f64, lon: f64) -> Option<EnhancedAddress> {
        let cache = self.cache.as_ref()?;
        let cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.get(lat, lon)
    }
}

/// First non-empty success in declaration order. Failures and empty payloads
/// only remove their own candidate.
pub fn pick_by_priority(results: Vec<(String, Result<RawAddress, LocationError>)>) -> Option<(String, RawAddress)> {
    results.into_iter().find_map(|(name, outcome)| match outcome {
        Ok(raw) if !raw.is_empty() => Some((name, raw)),
        Ok(_) => {
            tracing::debug!(provider = %name, "empty payload");
            None
        }
        Err(e) => {
            tracing::debug!(provider = %name, error = %e, "provider dropped from race");
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::testing::{bengaluru_district, bengaluru_street, FakeReverse};
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn race(providers: Vec<Arc<FakeReverse>>) -> GeocodeRace {
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn ReverseGeocoder>)
            .collect();
        GeocodeRace::new(providers, DEFAULT_PER_CALL_TIMEOUT)
    }

    #[tokio::test(start_paused = true)]
    async fn test_declaration_order_beats_arrival_order() {
        // The low-priority provider answers first with a richer payload.
        let slow_primary = Arc::new(FakeReverse::found("primary", 900, bengaluru_district()));
        let fast_fallback = Arc::new(FakeReverse::found("fallback", 50, bengaluru_street()));
        let (name, raw) = race(vec![slow_primary, fast_fallback]).race(12.93, 77.62).await.unwrap();
        assert_eq!(name, "primary");
        assert_eq!(raw, bengaluru_district());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_winner_whatever_the_timing() {
        for (d1, d2, d3) in [(10, 20, 30), (30, 20, 10), (500, 1, 250)] {
            let providers = vec![
                Arc::new(FakeReverse::not_found("z18", d1)),
                Arc::new(FakeReverse::found("z16", d2, bengaluru_district())),
                Arc::new(FakeReverse::found("z14", d3, bengaluru_street())),
            ];
            let (name, _) = race(providers).race(12.93, 77.62).await.unwrap();
            assert_eq!(name, "z16");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_called_concurrently() {
        let providers = vec![
            Arc::new(FakeReverse::found("a", 1_000, bengaluru_street())),
            Arc::new(FakeReverse::found("b", 1_000, bengaluru_street())),
            Arc::new(FakeReverse::found("c", 1_000, bengaluru_street())),
        ];
        let start = Instant::now();
        race(providers.clone()).race(12.93, 77.62).await.unwrap();
        assert_eq!(start.elapsed().as_secs(), 1);
        assert!(providers.iter().all(|p| p.calls() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_provider_times_out() {
        let providers = vec![
            Arc::new(FakeReverse::hang("stuck")),
            Arc::new(FakeReverse::found("ok", 100, bengaluru_street())),
        ];
        let start = Instant::now();
        let (name, _) = race(providers).race(12.93, 77.62).await.unwrap();
        assert_eq!(name, "ok");
        assert_eq!(start.elapsed().as_secs(), DEFAULT_PER_CALL_TIMEOUT.as_secs());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload_skipped() {
        let providers = vec![
            Arc::new(FakeReverse::found("blank", 10, RawAddress::default())),
            Arc::new(FakeReverse::unreachable("down", 10)),
            Arc::new(FakeReverse::found("ok", 10, bengaluru_street())),
        ];
        let (name, _) = race(providers).race(12.93, 77.62).await.unwrap();
        assert_eq!(name, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_winner() {
        let providers = vec![
            Arc::new(FakeReverse::not_found("a", 10)),
            Arc::new(FakeReverse::unreachable("b", 10)),
        ];
        let geo = race(providers);
        assert!(geo.race(12.93, 77.62).await.is_none());
        assert!(matches!(
            geo.reverse(12.93, 77.62).await,
            Err(LocationError::NoResultFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_requires_city_and_state() {
        let only_road = crate::location::testing::raw("MG Road", &[("road", "MG Road")]);
        let geo = race(vec![Arc::new(FakeReverse::found("a", 10, only_road))]);
        assert!(matches!(geo.reverse(12.93, 77.62).await, Err(LocationError::GeocodingIncomplete)));
        // lookup still hands back the partial address
        assert_eq!(geo.lookup(12.93, 77.62).await.unwrap().address, "MG Road");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_short_circuits_network() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(Mutex::new(GeocodeCache::load_from(dir.path().join("c.json"), 30)));
        let provider = Arc::new(FakeReverse::found("a", 10, bengaluru_street()));
        let geo = race(vec![provider.clone()]).with_cache(cache);

        let first = geo.reverse(12.93521, 77.62448).await.unwrap();
        let second = geo.reverse(12.93521, 77.62448).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_reverse_persists_cache_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache").join("c.json");
        let cache = Arc::new(Mutex::new(GeocodeCache::load_from(path.clone(), 30)));
        let geo = race(vec![Arc::new(FakeReverse::found("a", 10, bengaluru_street()))]).with_cache(cache);

        let found = geo.reverse(12.93521, 77.62448).await.unwrap();

        let reloaded = GeocodeCache::load_from(path, 30);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(12.93521, 77.62448).unwrap(), found);
    }

    #[tokio::test]
    async fn test_unwritable_cache_still_returns_address() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let cache = Arc::new(Mutex::new(GeocodeCache::load_from(blocker.join("c.json"), 30)));
        let provider = Arc::new(FakeReverse::found("a", 10, bengaluru_street()));
        let geo = race(vec![provider.clone()]).with_cache(cache);

        assert!(geo.reverse(12.93521, 77.62448).await.is_ok());
        // The in-memory entry still serves the next lookup.
        assert!(geo.reverse(12.93521, 77.62448).await.is_ok());
        assert_eq!(provider.calls(), 1);
    }
}

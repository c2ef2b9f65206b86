//! Device geolocation capabilities.
//!
//! The watch API mirrors what a browser or device offers: subscribe, receive
//! fixes or a terminal error, clear the subscription. Two sources ship here:
//! a replay of browser-forwarded fixes (JSON lines) and a native receiver
//! spoken to over the gpsd JSON protocol.

use super::types::{Fix, GeoErrorCode, LocationSource, PermissionState, PositionEvent};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifier of an active position watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Options passed when subscribing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Oldest cached fix the platform may hand back. Zero disables caching.
    pub maximum_age: Duration,
    pub timeout: Duration,
}

/// A live subscription: its id and the channel fixes arrive on.
pub struct PositionWatch {
    pub id: WatchId,
    pub events: mpsc::UnboundedReceiver<PositionEvent>,
}

/// A continuous-watch geolocation capability.
pub trait Geolocation: Send + Sync {
    /// Provenance tag for fixes from this capability.
    fn source(&self) -> LocationSource {
        LocationSource::BrowserGps
    }

    fn watch_position(&self, options: &WatchOptions) -> PositionWatch;

    /// Stop a watch. Unknown or already-cleared ids are ignored.
    fn clear_watch(&self, id: WatchId);
}

/// Platform permission query for the location permission.
#[async_trait]
pub trait PermissionQuery: Send + Sync {
    async fn query(&self) -> PermissionState;
}

/// A permission query with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermission(pub PermissionState);

#[async_trait]
impl PermissionQuery for StaticPermission {
    async fn query(&self) -> PermissionState {
        self.0
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Watch guard ────────────────────────────────────────────────

/// Owns one watch subscription and clears it exactly once: explicitly via
/// [`WatchGuard::clear`] or when dropped.
pub struct WatchGuard {
    geo: Arc<dyn Geolocation>,
    id: WatchId,
    events: mpsc::UnboundedReceiver<PositionEvent>,
    cleared: bool,
}

impl WatchGuard {
    pub fn start(geo: Arc<dyn Geolocation>, options: &WatchOptions) -> Self {
        let PositionWatch { id, events } = geo.watch_position(options);
        tracing::debug!(watch = id.0, "position watch started");
        Self {
            geo,
            id,
            events,
            cleared: false,
        }
    }

    /// Next event, or `None` once cleared or the source hung up.
    pub async fn next(&mut self) -> Option<PositionEvent> {
        if self.cleared {
            return None;
        }
        self.events.recv().await
    }

    pub fn clear(&mut self) {
        if self.cleared {
            return;
        }
        self.cleared = true;
        self.events.close();
        self.geo.clear_watch(self.id);
        tracing::debug!(watch = self.id.0, "position watch cleared");
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.clear();
    }
}

// ─── Replayed browser fixes ─────────────────────────────────────

/// One line of a fix feed: either a fix or an error code, delivered after
/// `delay_ms` from subscription.
///
/// ```json
/// {"latitude": 28.6139, "longitude": 77.2090, "accuracy": 12, "delay_ms": 800}
/// {"error": "permission_denied"}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeedEntry {
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default, alias = "timestamp")]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<GeoErrorCode>,
}

impl FeedEntry {
    pub fn fix(latitude: f64, longitude: f64, accuracy: f64, delay_ms: u64) -> Self {
        Self {
            delay_ms,
            latitude: Some(latitude),
            longitude: Some(longitude),
            accuracy: Some(accuracy),
            ..Default::default()
        }
    }

    pub fn error(code: GeoErrorCode, delay_ms: u64) -> Self {
        Self {
            delay_ms,
            error: Some(code),
            ..Default::default()
        }
    }

    pub fn event(&self) -> PositionEvent {
        if let Some(code) = self.error {
            return Err(code);
        }
        match (self.latitude, self.longitude, self.accuracy) {
            (Some(latitude), Some(longitude), Some(accuracy)) => Ok(Fix {
                latitude,
                longitude,
                accuracy,
                timestamp_ms: self
                    .timestamp_ms
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            }),
            _ => Err(GeoErrorCode::PositionUnavailable),
        }
    }
}

/// Replays a feed of browser-forwarded fixes. Each subscription takes the
/// next entry and delivers it after its delay; an exhausted feed never
/// fires, like a device that has lost signal.
pub struct ReplayGeolocation {
    source: LocationSource,
    feed: Mutex<VecDeque<FeedEntry>>,
    tasks: Mutex<HashMap<WatchId, JoinHandle<()>>>,
    next_id: AtomicU64,
    started: AtomicUsize,
    delivered: Arc<AtomicUsize>,
}

impl ReplayGeolocation {
    pub fn new(entries: impl IntoIterator<Item = FeedEntry>) -> Self {
        Self {
            source: LocationSource::BrowserGps,
            feed: Mutex::new(entries.into_iter().collect()),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            started: AtomicUsize::new(0),
            delivered: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Parse a JSON-lines feed. Blank lines and `#` comments are skipped.
    pub fn from_json_lines(text: &str) -> Result<Self, serde_json::Error> {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(serde_json::from_str::<FeedEntry>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(entries))
    }

    pub fn with_source(mut self, source: LocationSource) -> Self {
        self.source = source;
        self
    }

    pub fn watches_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Subscriptions that have not been cleared.
    pub fn active_watches(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Events actually handed to a subscriber.
    pub fn events_delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        lock(&self.feed).len()
    }
}

impl Geolocation for ReplayGeolocation {
    fn source(&self) -> LocationSource {
        self.source
    }

    fn watch_position(&self, _options: &WatchOptions) -> PositionWatch {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.started.fetch_add(1, Ordering::SeqCst);
        let (tx, events) = mpsc::unbounded_channel();
        let entry = lock(&self.feed).pop_front();
        let delivered = Arc::clone(&self.delivered);

        let task = tokio::spawn(async move {
            if let Some(entry) = entry {
                tokio::time::sleep(Duration::from_millis(entry.delay_ms)).await;
                if tx.send(entry.event()).is_ok() {
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
            }
            // The subscription stays open until cleared.
            std::future::pending::<()>().await;
            drop(tx);
        });
        lock(&self.tasks).insert(id, task);

        PositionWatch { id, events }
    }

    fn clear_watch(&self, id: WatchId) {
        if let Some(task) = lock(&self.tasks).remove(&id) {
            task.abort();
        }
    }
}

impl Drop for ReplayGeolocation {
    fn drop(&mut self) {
        for (_, task) in lock(&self.tasks).drain() {
            task.abort();
        }
    }
}

// ─── gpsd (native receiver) ─────────────────────────────────────

const GPSD_WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// Accuracy assigned to a gpsd fix that carries no error estimate.
const UNKNOWN_ACCURACY_M: f64 = 5000.0;

#[derive(Deserialize)]
struct GpsdReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
    time: Option<String>,
}

/// Parse one gpsd report line into a fix. Only TPV reports with at least a
/// 2D fix qualify.
pub fn parse_gpsd_line(line: &str) -> Option<Fix> {
    let report: GpsdReport = serde_json::from_str(line).ok()?;
    if report.class != "TPV" || report.mode < 2 {
        return None;
    }
    let accuracy = report
        .eph
        .or(match (report.epx, report.epy) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (x, y) => x.or(y),
        })
        .unwrap_or(UNKNOWN_ACCURACY_M);
    let timestamp_ms = report
        .time
        .as_deref()
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    Some(Fix {
        latitude: report.lat?,
        longitude: report.lon?,
        accuracy,
        timestamp_ms,
    })
}

/// Native GPS receiver behind a gpsd daemon (`host:port`, usually
/// `127.0.0.1:2947`). Each watch opens its own connection.
pub struct GpsdGeolocation {
    addr: String,
    tasks: Mutex<HashMap<WatchId, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl GpsdGeolocation {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

async fn stream_gpsd(addr: String, tx: mpsc::UnboundedSender<PositionEvent>) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(%addr, error = %e, "gpsd unreachable");
            let _ = tx.send(Err(GeoErrorCode::PositionUnavailable));
            return;
        }
    };
    let (read, mut write) = stream.into_split();
    if let Err(e) = write.write_all(GPSD_WATCH_COMMAND).await {
        tracing::warn!(%addr, error = %e, "gpsd rejected watch command");
        let _ = tx.send(Err(GeoErrorCode::PositionUnavailable));
        return;
    }

    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(fix) = parse_gpsd_line(&line) {
            if tx.send(Ok(fix)).is_err() {
                return;
            }
        }
    }
    let _ = tx.send(Err(GeoErrorCode::PositionUnavailable));
}

impl Geolocation for GpsdGeolocation {
    fn source(&self) -> LocationSource {
        LocationSource::NativeGps
    }

    fn watch_position(&self, _options: &WatchOptions) -> PositionWatch {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(stream_gpsd(self.addr.clone(), tx));
        lock(&self.tasks).insert(id, task);
        PositionWatch { id, events }
    }

    fn clear_watch(&self, id: WatchId) {
        if let Some(task) = lock(&self.tasks).remove(&id) {
            task.abort();
        }
    }
}

impl Drop for GpsdGeolocation {
    fn drop(&mut self) {
        for (_, task) in lock(&self.tasks).drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::gps::{acquire_fix, AcquisitionPolicy};
    use crate::location::testing::{fake_gpsd, GPSD_DELHI_TPV, GPSD_VERSION};
    use crate::location::types::LocationError;
    use tokio::net::TcpListener;

    fn options() -> WatchOptions {
        WatchOptions {
            high_accuracy: true,
            maximum_age: Duration::ZERO,
            timeout: Duration::from_secs(15),
        }
    }

    #[test]
    fn test_feed_parsing() {
        let text = r#"
            # two fixes and an error
            {"latitude": 28.6139, "longitude": 77.2090, "accuracy": 80, "delay_ms": 500}
            {"latitude": 28.6140, "longitude": 77.2091, "accuracy": 12, "timestamp": 1700000000000}
            {"error": "timeout"}
        "#;
        let geo = ReplayGeolocation::from_json_lines(text).unwrap();
        assert_eq!(geo.remaining(), 3);
    }

    #[test]
    fn test_feed_entry_events() {
        let fix = FeedEntry::fix(19.076, 72.877, 30.0, 0).event().unwrap();
        assert_eq!(fix.accuracy, 30.0);
        assert_eq!(
            FeedEntry::error(GeoErrorCode::PermissionDenied, 0).event(),
            Err(GeoErrorCode::PermissionDenied)
        );
        let incomplete = FeedEntry { latitude: Some(1.0), ..Default::default() };
        assert_eq!(incomplete.event(), Err(GeoErrorCode::PositionUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_delivers_after_delay() {
        let geo: Arc<dyn Geolocation> =
            Arc::new(ReplayGeolocation::new([FeedEntry::fix(28.6, 77.2, 40.0, 1_000)]));
        let mut guard = WatchGuard::start(Arc::clone(&geo), &options());
        let event = guard.next().await.unwrap().unwrap();
        assert_eq!(event.latitude, 28.6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_clears_on_drop() {
        let replay = Arc::new(ReplayGeolocation::new([FeedEntry::fix(28.6, 77.2, 40.0, 5_000)]));
        let geo: Arc<dyn Geolocation> = replay.clone();
        {
            let _guard = WatchGuard::start(geo, &options());
            assert_eq!(replay.active_watches(), 1);
        }
        assert_eq!(replay.active_watches(), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(replay.events_delivered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_clear_is_idempotent() {
        let replay = Arc::new(ReplayGeolocation::new(Vec::new()));
        let mut guard = WatchGuard::start(replay.clone(), &options());
        guard.clear();
        guard.clear();
        assert!(guard.next().await.is_none());
        drop(guard);
        assert_eq!(replay.active_watches(), 0);
        assert_eq!(replay.watches_started(), 1);
    }

    #[test]
    fn test_parse_gpsd_tpv() {
        let line = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":3,"time":"2026-03-01T06:30:00.000Z","lat":12.9716,"lon":77.5946,"eph":8.5}"#;
        let fix = parse_gpsd_line(line).unwrap();
        assert_eq!(fix.latitude, 12.9716);
        assert_eq!(fix.accuracy, 8.5);

        let line = r#"{"class":"TPV","mode":2,"lat":12.9,"lon":77.5,"epx":14.0,"epy":22.0}"#;
        assert_eq!(parse_gpsd_line(line).unwrap().accuracy, 22.0);
    }

    #[test]
    fn test_parse_gpsd_ignores_non_fixes() {
        assert!(parse_gpsd_line(r#"{"class":"VERSION","release":"3.25"}"#).is_none());
        assert!(parse_gpsd_line(r#"{"class":"TPV","mode":1}"#).is_none());
        assert!(parse_gpsd_line("not json").is_none());
    }

    #[tokio::test]
    async fn test_static_permission() {
        assert_eq!(StaticPermission(PermissionState::Denied).query().await, PermissionState::Denied);
    }

    #[tokio::test]
    async fn test_gpsd_watch_delivers_tpv_fix() {
        let (addr, server) = fake_gpsd(&[GPSD_VERSION, GPSD_DELHI_TPV]).await;
        let geo = Arc::new(GpsdGeolocation::new(addr));
        assert_eq!(geo.source(), LocationSource::NativeGps);

        let fix = acquire_fix(geo.clone(), &AcquisitionPolicy::default()).await.unwrap();
        assert_eq!(fix.latitude, 28.6139);
        assert_eq!(fix.longitude, 77.209);
        assert_eq!(fix.accuracy, 8.5);

        let command = server.await.unwrap();
        assert_eq!(command.as_bytes(), GPSD_WATCH_COMMAND);
        assert!(lock(&geo.tasks).is_empty());
    }

    #[tokio::test]
    async fn test_gpsd_hangup_without_fix_fails() {
        let (addr, server) = fake_gpsd(&[GPSD_VERSION]).await;
        let geo = Arc::new(GpsdGeolocation::new(addr));

        let err = acquire_fix(geo, &AcquisitionPolicy::default()).await.unwrap_err();
        assert!(matches!(err, LocationError::Geolocation(GeoErrorCode::PositionUnavailable)));
        assert!(server.await.unwrap().starts_with("?WATCH="));
    }

    #[tokio::test]
    async fn test_gpsd_unreachable_is_position_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let geo = Arc::new(GpsdGeolocation::new(addr));
        let mut watch = WatchGuard::start(geo, &options());
        assert_eq!(watch.next().await, Some(Err(GeoErrorCode::PositionUnavailable)));
    }
}

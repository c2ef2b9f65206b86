//! In-process fakes for the provider traits, shared by unit tests.

use super::providers::{IpLocator, PincodeDirectory, PlaceSearch, ReverseGeocoder};
use super::types::{IpLocation, LocationError, PincodeDetails, RawAddress, SearchCandidate};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub fn raw(display_name: &str, fields: &[(&str, &str)]) -> RawAddress {
    RawAddress {
        display_name: display_name.to_string(),
        fields: fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
    }
}

/// A full Bengaluru street address.
pub fn bengaluru_street() -> RawAddress {
    raw(
        "12, 80 Feet Road, Koramangala, Bengaluru, Karnataka, 560034, India",
        &[
            ("house_number", "12"),
            ("road", "80 Feet Road"),
            ("suburb", "Koramangala"),
            ("city", "Bengaluru"),
            ("state", "Karnataka"),
            ("postcode", "560034"),
        ],
    )
}

/// The same area at district granularity.
pub fn bengaluru_district() -> RawAddress {
    raw(
        "Bengaluru Urban, Karnataka, India",
        &[("county", "Bengaluru Urban"), ("state", "Karnataka")],
    )
}

enum Outcome {
    Found(RawAddress),
    NotFound,
    Unreachable,
    Hang,
}

pub struct FakeReverse {
    name: String,
    delay: Duration,
    outcome: Outcome,
    calls: AtomicUsize,
}

impl FakeReverse {
    fn new(name: &str, delay_ms: u64, outcome: Outcome) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::from_millis(delay_ms),
            outcome,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn found(name: &str, delay_ms: u64, raw: RawAddress) -> Self {
        Self::new(name, delay_ms, Outcome::Found(raw))
    }

    pub fn not_found(name: &str, delay_ms: u64) -> Self {
        Self::new(name, delay_ms, Outcome::NotFound)
    }

    pub fn unreachable(name: &str, delay_ms: u64) -> Self {
        Self::new(name, delay_ms, Outcome::Unreachable)
    }

    /// Never answers.
    pub fn hang(name: &str) -> Self {
        Self::new(name, 0, Outcome::Hang)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReverseGeocoder for FakeReverse {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reverse(&self, _lat: f64, _lon: f64) -> Result<RawAddress, LocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match &self.outcome {
            Outcome::Found(raw) => Ok(raw.clone()),
            Outcome::NotFound => Err(LocationError::NoResultFound { provider: self.name.clone() }),
            Outcome::Unreachable => Err(LocationError::ProviderUnreachable {
                provider: self.name.clone(),
                reason: "connection refused".into(),
            }),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

pub struct FakeIp {
    result: Option<IpLocation>,
    calls: AtomicUsize,
}

impl FakeIp {
    pub fn located(location: IpLocation) -> Self {
        Self { result: Some(location), calls: AtomicUsize::new(0) }
    }

    pub fn failing() -> Self {
        Self { result: None, calls: AtomicUsize::new(0) }
    }

    pub fn mumbai() -> Self {
        Self::located(IpLocation {
            latitude: Some(19.076),
            longitude: Some(72.8777),
            city: Some("Mumbai".into()),
            region: Some("Maharashtra".into()),
            postal: Some("400001".into()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IpLocator for FakeIp {
    async fn locate(&self) -> Result<IpLocation, LocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone().ok_or_else(|| LocationError::ProviderUnreachable {
            provider: "fake-ip".into(),
            reason: "offline".into(),
        })
    }
}

pub struct FakeSearch {
    candidates: Vec<SearchCandidate>,
    calls: AtomicUsize,
}

impl FakeSearch {
    pub fn new(candidates: Vec<SearchCandidate>) -> Self {
        Self { candidates, calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaceSearch for FakeSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>, LocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let needle = query.to_lowercase();
        Ok(self
            .candidates
            .iter()
            .filter(|c| c.display_name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }
}

pub fn connaught_place() -> SearchCandidate {
    SearchCandidate {
        display_name: "Connaught Place, New Delhi, Delhi, 110001, India".into(),
        latitude: 28.6315,
        longitude: 77.2167,
        fields: [
            ("suburb", "Connaught Place"),
            ("city", "New Delhi"),
            ("state", "Delhi"),
            ("postcode", "110001"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
    }
}

pub struct FakePincodes;

#[async_trait]
impl PincodeDirectory for FakePincodes {
    async fn lookup(&self, pincode: &str) -> Result<PincodeDetails, LocationError> {
        match pincode {
            "110001" => Ok(PincodeDetails {
                pincode: pincode.to_string(),
                district: "Central Delhi".into(),
                state: "Delhi".into(),
                localities: vec!["Connaught Place".into(), "Janpath".into()],
            }),
            _ => Err(LocationError::NoResultFound { provider: "fake-pincodes".into() }),
        }
    }
}

/// A TPV report for central New Delhi with an 8.5 m error estimate.
pub const GPSD_DELHI_TPV: &str =
    r#"{"class":"TPV","device":"/dev/ttyACM0","mode":3,"time":"2026-01-05T06:30:00.000Z","lat":28.6139,"lon":77.209,"eph":8.5}"#;

pub const GPSD_VERSION: &str = r#"{"class":"VERSION","release":"3.25","rev":"3.25","proto_major":3,"proto_minor":15}"#;

/// One-connection gpsd stand-in on an ephemeral port. It reads the client's
/// command line, writes `lines`, then hangs up. The handle yields the command.
pub async fn fake_gpsd(lines: &'static [&'static str]) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut command = String::new();
        BufReader::new(read).read_line(&mut command).await.unwrap();
        for line in lines {
            // The client may hang up as soon as it has a fix.
            if write.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                break;
            }
        }
        command
    });
    (addr, server)
}

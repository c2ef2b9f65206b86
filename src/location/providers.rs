//! Network providers: Nominatim reverse geocoding and place search,
//! ipapi.co IP geolocation, India Post pincode directory.
//!
//! HTTP goes through a blocking `ureq` agent on tokio's blocking pool, so
//! several providers can be in flight at once.

use super::types::{IpLocation, LocationError, PincodeDetails, RawAddress, SearchCandidate};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

// ─── Provider traits ────────────────────────────────────────────

/// Coordinates → address.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    fn name(&self) -> &str;

    /// An explicit "not found" is `Err(NoResultFound)`, not an empty payload.
    async fn reverse(&self, lat: f64, lon: f64) -> Result<RawAddress, LocationError>;
}

/// Free text → coordinate candidates, best first.
#[async_trait]
pub trait PlaceSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>, LocationError>;
}

/// Approximate location of the caller's IP address.
#[async_trait]
pub trait IpLocator: Send + Sync {
    async fn locate(&self) -> Result<IpLocation, LocationError>;
}

/// Pincode → post office data.
#[async_trait]
pub trait PincodeDirectory: Send + Sync {
    async fn lookup(&self, pincode: &str) -> Result<PincodeDetails, LocationError>;
}

// ─── HTTP plumbing ──────────────────────────────────────────────

/// Shared blocking HTTP agent with a per-request timeout.
#[derive(Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
}

impl HttpClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(user_agent)
            .build();
        Self { agent }
    }

    async fn get_json<T>(&self, provider: &str, url: String, query: Vec<(&'static str, String)>) -> Result<T, LocationError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let agent = self.agent.clone();
        let name = provider.to_string();
        tokio::task::spawn_blocking(move || fetch_json(&agent, &name, &url, &query))
            .await
            .map_err(|e| LocationError::ProviderUnreachable {
                provider: provider.to_string(),
                reason: e.to_string(),
            })?
    }
}

fn fetch_json<T: DeserializeOwned>(
    agent: &ureq::Agent,
    provider: &str,
    url: &str,
    query: &[(&'static str, String)],
) -> Result<T, LocationError> {
    let request = query
        .iter()
        .fold(agent.get(url), |req, (key, value)| req.query(key, value));

    let response = request.call().map_err(|e| match e {
        ureq::Error::Status(404, _) => LocationError::NoResultFound {
            provider: provider.to_string(),
        },
        ureq::Error::Status(code, _) => LocationError::ProviderUnreachable {
            provider: provider.to_string(),
            reason: format!("HTTP {}", code),
        },
        ureq::Error::Transport(t) => LocationError::ProviderUnreachable {
            provider: provider.to_string(),
            reason: t.to_string(),
        },
    })?;

    response
        .into_json()
        .map_err(|e| LocationError::InvalidResponse {
            provider: provider.to_string(),
            reason: e.to_string(),
        })
}

/// Keep the string-valued entries of a JSON object.
fn string_fields(map: BTreeMap<String, serde_json::Value>) -> BTreeMap<String, String> {
    map.into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            _ => None,
        })
        .collect()
}

// ─── Nominatim reverse ──────────────────────────────────────────

#[derive(Deserialize, Debug, Default)]
pub struct NominatimReverseResponse {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub address: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Turn a Nominatim reverse payload into a raw address. `country_codes`
/// scopes results to a comma-separated ISO 3166-1 list; anything outside is
/// treated as not found.
pub fn raw_from_nominatim(
    provider: &str,
    response: NominatimReverseResponse,
    country_codes: Option<&str>,
) -> Result<RawAddress, LocationError> {
    if let Some(error) = response.error {
        tracing::debug!(provider, %error, "nominatim reverse: no match");
        return Err(LocationError::NoResultFound {
            provider: provider.to_string(),
        });
    }

    let fields = string_fields(response.address);
    if let Some(allowed) = country_codes {
        let country = fields.get("country_code").map(|c| c.to_lowercase()).unwrap_or_default();
        let in_region = allowed
            .split(',')
            .map(|c| c.trim().to_lowercase())
            .any(|c| c == country);
        if !in_region {
            tracing::debug!(provider, %country, "nominatim reverse: outside region filter");
            return Err(LocationError::NoResultFound {
                provider: provider.to_string(),
            });
        }
    }

    Ok(RawAddress {
        display_name: response.display_name.unwrap_or_default(),
        fields,
    })
}

/// One Nominatim reverse endpoint at a fixed zoom level. Tighter zoom gives a
/// more exact address but matches less often.
pub struct NominatimReverse {
    name: String,
    base_url: String,
    zoom: u8,
    country_codes: Option<String>,
    http: HttpClient,
}

impl NominatimReverse {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, zoom: u8, country_codes: Option<String>, http: HttpClient) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            zoom,
            country_codes,
            http,
        }
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimReverse {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reverse(&self, lat: f64, lon: f64) -> Result<RawAddress, LocationError> {
        let url = format!("{}/reverse", self.base_url.trim_end_matches('/'));
        let query = vec![
            ("format", "jsonv2".to_string()),
            ("lat", lat.to_string()),
            ("lon", lon.to_string()),
            ("zoom", self.zoom.to_string()),
            ("addressdetails", "1".to_string()),
            ("accept-language", "en".to_string()),
        ];
        let response: NominatimReverseResponse = self.http.get_json(&self.name, url, query).await?;
        raw_from_nominatim(&self.name, response, self.country_codes.as_deref())
    }
}

// ─── Nominatim search ───────────────────────────────────────────

#[derive(Deserialize, Debug)]
pub struct NominatimSearchResult {
    pub lat: String,
    pub lon: String,
    pub display_name: String,
    #[serde(default)]
    pub address: BTreeMap<String, serde_json::Value>,
}

/// Convert search results, dropping entries with unparseable coordinates.
pub fn candidates_from_search(results: Vec<NominatimSearchResult>) -> Vec<SearchCandidate> {
    results
        .into_iter()
        .filter_map(|r| {
            let latitude = r.lat.parse().ok()?;
            let longitude = r.lon.parse().ok()?;
            Some(SearchCandidate {
                display_name: r.display_name,
                latitude,
                longitude,
                fields: string_fields(r.address),
            })
        })
        .collect()
}

pub struct NominatimSearch {
    base_url: String,
    limit: usize,
    country_codes: Option<String>,
    http: HttpClient,
}

impl NominatimSearch {
    pub fn new(base_url: impl Into<String>, limit: usize, country_codes: Option<String>, http: HttpClient) -> Self {
        Self {
            base_url: base_url.into(),
            limit,
            country_codes,
            http,
        }
    }
}

#[async_trait]
impl PlaceSearch for NominatimSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>, LocationError> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let mut params = vec![
            ("q", query.to_string()),
            ("format", "jsonv2".to_string()),
            ("addressdetails", "1".to_string()),
            ("limit", self.limit.clamp(1, 20).to_string()),
            ("accept-language", "en".to_string()),
        ];
        if let Some(cc) = &self.country_codes {
            params.push(("countrycodes", cc.clone()));
        }
        let results: Vec<NominatimSearchResult> = self.http.get_json("nominatim-search", url, params).await?;
        Ok(candidates_from_search(results))
    }
}

// ─── IP-based geolocation ───────────────────────────────────────

#[derive(Deserialize, Debug, Default)]
pub struct IpApiResult {
    latitude: Option<f64>,
    longitude: Option<f64>,
    city: Option<String>,
    region: Option<String>,
    postal: Option<String>,
    #[serde(default)]
    error: bool,
    reason: Option<String>,
}

pub fn ip_from_ipapi(result: IpApiResult) -> Result<IpLocation, LocationError> {
    if result.error {
        return Err(LocationError::ProviderUnreachable {
            provider: "ipapi".to_string(),
            reason: result.reason.unwrap_or_else(|| "error flag set".into()),
        });
    }
    if result.latitude.is_none() || result.longitude.is_none() {
        return Err(LocationError::NoResultFound {
            provider: "ipapi".to_string(),
        });
    }
    Ok(IpLocation {
        latitude: result.latitude,
        longitude: result.longitude,
        city: result.city,
        region: result.region,
        postal: result.postal,
    })
}

/// ipapi.co lookup for the caller's own address, or for a given client IP
/// when running behind a server.
pub struct IpApiLocator {
    base_url: String,
    client_ip: Option<IpAddr>,
    http: HttpClient,
}

impl IpApiLocator {
    pub fn new(base_url: impl Into<String>, http: HttpClient) -> Self {
        Self {
            base_url: base_url.into(),
            client_ip: None,
            http,
        }
    }

    pub fn for_client(mut self, ip: Option<IpAddr>) -> Self {
        self.client_ip = ip;
        self
    }

    fn url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.client_ip {
            Some(ip) => format!("{}/{}/json/", base, ip),
            None => format!("{}/json/", base),
        }
    }
}

#[async_trait]
impl IpLocator for IpApiLocator {
    async fn locate(&self) -> Result<IpLocation, LocationError> {
        let result: IpApiResult = self.http.get_json("ipapi", self.url(), Vec::new()).await?;
        ip_from_ipapi(result)
    }
}

// ─── India Post pincode directory ───────────────────────────────

#[derive(Deserialize, Debug)]
pub struct IndiaPostResponse {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "PostOffice", default)]
    post_office: Option<Vec<IndiaPostOffice>>,
}

#[derive(Deserialize, Debug)]
pub struct IndiaPostOffice {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "District", default)]
    district: String,
    #[serde(rename = "State", default)]
    state: String,
}

pub fn details_from_india_post(pincode: &str, responses: Vec<IndiaPostResponse>) -> Result<PincodeDetails, LocationError> {
    let not_found = || LocationError::NoResultFound {
        provider: "india-post".to_string(),
    };
    let response = responses.into_iter().next().ok_or_else(not_found)?;
    if !response.status.eq_ignore_ascii_case("success") {
        return Err(not_found());
    }
    let offices = response.post_office.unwrap_or_default();
    let first = offices.first().ok_or_else(not_found)?;

    Ok(PincodeDetails {
        pincode: pincode.to_string(),
        district: first.district.clone(),
        state: first.state.clone(),
        localities: offices.iter().map(|o| o.name.clone()).collect(),
    })
}

pub struct IndiaPostDirectory {
    base_url: String,
    http: HttpClient,
}

impl IndiaPostDirectory {
    pub fn new(base_url: impl Into<String>, http: HttpClient) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[async_trait]
impl PincodeDirectory for IndiaPostDirectory {
    async fn lookup(&self, pincode: &str) -> Result<PincodeDetails, LocationError> {
        let url = format!("{}/pincode/{}", self.base_url.trim_end_matches('/'), pincode);
        let responses: Vec<IndiaPostResponse> = self.http.get_json("india-post", url, Vec::new()).await?;
        details_from_india_post(pincode, responses)
    }
}

//! Geographic labels for peer endpoints.
//!
//! Lookups go to `ipapi.co` over HTTPS and are cached for a day, failures
//! included. Any failure degrades to an empty [`GeoLocation`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// How long a lookup result stays cached.
pub const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Cache size at which expired entries are swept out.
pub const CACHE_MAX_ENTRIES: usize = 4096;

/// Per-request timeout.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

const USER_AGENT: &str = "amneziawg-web-ui";

static COUNTRY_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2}$").unwrap_or_else(|_| unreachable!()));

/// Result of a lookup; both fields are empty when nothing is known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// Human label such as `DE / Berlin, Land Berlin`.
    pub label: Option<String>,
    /// ISO 3166-1 alpha-2 code.
    pub country_code: Option<String>,
}

impl GeoLocation {
    /// Builds a location from a lookup response body.
    #[must_use]
    pub fn from_response(raw: &Value) -> Self {
        Self {
            label: format_label(raw),
            country_code: extract_country_code(raw),
        }
    }
}

type LookupFn = Box<dyn Fn(&IpAddr) -> Option<Value> + Send + Sync>;

/// Cached endpoint geolocation.
pub struct GeoLocator {
    enabled: bool,
    http: Option<reqwest::Client>,
    cache: RwLock<HashMap<IpAddr, (Instant, GeoLocation)>>,
    custom_lookup: Option<LookupFn>,
}

impl std::fmt::Debug for GeoLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoLocator")
            .field("enabled", &self.enabled)
            .field("cached", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

impl GeoLocator {
    /// Creates a locator backed by the HTTP lookup service.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        let http = if enabled {
            reqwest::Client::builder()
                .timeout(LOOKUP_TIMEOUT)
                .user_agent(USER_AGENT)
                .build()
                .map_err(|e| debug!(error = %e, "geoip http client unavailable"))
                .ok()
        } else {
            None
        };
        Self {
            enabled,
            http,
            cache: RwLock::new(HashMap::new()),
            custom_lookup: None,
        }
    }

    /// A locator that never looks anything up.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Replaces the HTTP lookup with a function returning the raw response
    /// body, or `None` for a failed lookup. Enables the locator.
    #[must_use]
    pub fn with_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&IpAddr) -> Option<Value> + Send + Sync + 'static,
    {
        self.enabled = true;
        self.custom_lookup = Some(Box::new(lookup));
        self
    }

    /// Whether lookups are performed.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Locates an address, using the cache when fresh.
    pub async fn locate(&self, ip: IpAddr) -> GeoLocation {
        if !self.enabled || is_local(ip) {
            return GeoLocation::default();
        }

        if let Some(hit) = self.cached(ip, Instant::now()) {
            return hit;
        }

        let raw = match &self.custom_lookup {
            Some(lookup) => lookup(&ip),
            None => self.fetch(ip).await,
        };
        let location = raw.as_ref().map(GeoLocation::from_response).unwrap_or_default();
        self.remember(ip, location.clone(), Instant::now());
        location
    }

    fn remember(&self, ip: IpAddr, location: GeoLocation, now: Instant) {
        let mut cache = self.cache.write();
        if cache.len() >= CACHE_MAX_ENTRIES && !cache.contains_key(&ip) {
            cache.retain(|_, (at, _)| now.duration_since(*at) < CACHE_TTL);
            if cache.len() >= CACHE_MAX_ENTRIES {
                let oldest = cache.iter().min_by_key(|(_, (at, _))| *at).map(|(ip, _)| *ip);
                if let Some(oldest) = oldest {
                    cache.remove(&oldest);
                }
            }
        }
        cache.insert(ip, (now, location));
    }

    fn cached(&self, ip: IpAddr, now: Instant) -> Option<GeoLocation> {
        let cache = self.cache.read();
        let (at, location) = cache.get(&ip)?;
        (now.duration_since(*at) < CACHE_TTL).then(|| location.clone())
    }

    async fn fetch(&self, ip: IpAddr) -> Option<Value> {
        let http = self.http.as_ref()?;
        let url = format!("https://ipapi.co/{ip}/json/");
        let resp = match http.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(%ip, error = %e, "geoip lookup failed");
                return None;
            }
        };
        if resp.status() != reqwest::StatusCode::OK {
            debug!(%ip, status = %resp.status(), "geoip lookup rejected");
            return None;
        }
        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        if !is_json {
            return Some(Value::Object(serde_json::Map::new()));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| debug!(%ip, error = %e, "geoip response unreadable"))
            .ok()
    }
}

/// Addresses that are never looked up.
#[must_use]
pub fn is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

fn non_empty_str<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn format_label(raw: &Value) -> Option<String> {
    let country = non_empty_str(raw, "country")
        .or_else(|| non_empty_str(raw, "country_name"))
        .or_else(|| non_empty_str(raw, "countryCode"));
    let city = non_empty_str(raw, "city");
    let region = non_empty_str(raw, "region").or_else(|| non_empty_str(raw, "regionName"));

    let loc = [city, region].into_iter().flatten().collect::<Vec<_>>().join(", ");
    match (country, loc.is_empty()) {
        (Some(country), false) => Some(format!("{country} / {loc}")),
        (Some(country), true) => Some(country.to_string()),
        (None, false) => Some(loc),
        (None, true) => None,
    }
}

fn extract_country_code(raw: &Value) -> Option<String> {
    let cc = non_empty_str(raw, "country")
        .or_else(|| non_empty_str(raw, "country_code"))
        .or_else(|| non_empty_str(raw, "countryCode"))?
        .to_uppercase();
    COUNTRY_CODE.is_match(&cc).then_some(cc)
}

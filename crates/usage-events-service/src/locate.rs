use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderMap;
use serde::Deserialize;

pub const UNKNOWN_LOCATION: &str = "Unknown";

const IP_API_BASE_URL: &str = "http://ip-api.com";
const IP_API_FIELDS: &str = "status,message,country,regionName,city";

/// Resolves a client IP to a human-readable location.
///
/// Implementations never fail: any lookup problem yields
/// [`UNKNOWN_LOCATION`].
pub trait IpLocator: fmt::Debug + Send + Sync {
    fn locate(&self, ip: &str) -> String;
}

/// Looks locations up through the ip-api.com JSON endpoint.
pub struct IpApiLocator {
    agent: ureq::Agent,
    base_url: String,
}

impl IpApiLocator {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self::with_base_url(IP_API_BASE_URL, timeout)
    }

    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl fmt::Debug for IpApiLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpApiLocator")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl IpLocator for IpApiLocator {
    fn locate(&self, ip: &str) -> String {
        let ip = ip.trim();
        if ip.is_empty() {
            return UNKNOWN_LOCATION.to_string();
        }

        let url = format!("{}/json/{ip}", self.base_url);
        let response = match self.agent.get(&url).query("fields", IP_API_FIELDS).call() {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(ip, error = %err, "location lookup failed");
                return UNKNOWN_LOCATION.to_string();
            }
        };

        match response.into_json::<IpApiResponse>() {
            Ok(body) => body.location(),
            Err(err) => {
                tracing::debug!(ip, error = %err, "location lookup returned unreadable body");
                UNKNOWN_LOCATION.to_string()
            }
        }
    }
}

/// Returns one fixed location for every non-empty IP.
#[derive(Debug, Clone)]
pub struct StaticLocator {
    location: String,
}

impl StaticLocator {
    #[must_use]
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

impl Default for StaticLocator {
    fn default() -> Self {
        Self::new(UNKNOWN_LOCATION)
    }
}

impl IpLocator for StaticLocator {
    fn locate(&self, ip: &str) -> String {
        if ip.trim().is_empty() {
            return UNKNOWN_LOCATION.to_string();
        }
        self.location.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IpApiResponse {
    status: String,
    message: String,
    country: String,
    #[serde(rename = "regionName")]
    region_name: String,
    city: String,
}

impl IpApiResponse {
    fn location(&self) -> String {
        if self.status != "success" {
            tracing::debug!(status = %self.status, message = %self.message, "location lookup rejected");
            return UNKNOWN_LOCATION.to_string();
        }

        let parts: Vec<&str> = [&self.city, &self.region_name, &self.country]
            .into_iter()
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            return UNKNOWN_LOCATION.to_string();
        }
        parts.join(", ")
    }
}

/// First `X-Forwarded-For` entry when present, else the peer address.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

//! External location services over HTTP.
//!
//! Each provider is a thin `ureq` client with a bounded timeout. Providers
//! return errors freely; the resolver decides how to degrade.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

use super::{Location, LocationSource, IP_ACCURACY};

/// Source of this host's public address.
pub trait PublicIpProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn public_ip(&self) -> Result<IpAddr>;
}

/// IP address to coarse location.
pub trait IpGeolocator: Send + Sync {
    fn name(&self) -> &'static str;

    fn locate(&self, ip: IpAddr) -> Result<Location>;
}

/// Coordinates to human-readable address.
pub trait ReverseGeocoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn address(&self, latitude: f64, longitude: f64) -> Result<String>;
}

pub fn http_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

fn get_json<T: for<'de> Deserialize<'de>>(request: ureq::Request) -> Result<T> {
    let url = request.url().to_string();
    let body = request
        .call()
        .with_context(|| format!("request {}", url))?
        .into_string()
        .with_context(|| format!("read response from {}", url))?;
    serde_json::from_str(&body).with_context(|| format!("decode response from {}", url))
}

// -------------------- Public IP --------------------

/// `{"ip": "..."}` style endpoint (api.ipify.org).
pub struct IpifyIp {
    agent: ureq::Agent,
    url: String,
}

impl IpifyIp {
    pub fn new(agent: ureq::Agent, url: impl Into<String>) -> Self {
        Self {
            agent,
            url: url.into(),
        }
    }
}

#[derive(Deserialize)]
struct IpifyResponse {
    ip: String,
}

impl PublicIpProvider for IpifyIp {
    fn name(&self) -> &'static str {
        "ipify"
    }

    fn public_ip(&self) -> Result<IpAddr> {
        let response: IpifyResponse = get_json(self.agent.get(&self.url).query("format", "json"))?;
        response
            .ip
            .trim()
            .parse()
            .map_err(|e| anyhow!("ipify returned invalid address '{}': {}", response.ip, e))
    }
}

/// `{"origin": "a, b"}` style endpoint (httpbin.org/ip).
pub struct HttpBinIp {
    agent: ureq::Agent,
    url: String,
}

impl HttpBinIp {
    pub fn new(agent: ureq::Agent, url: impl Into<String>) -> Self {
        Self {
            agent,
            url: url.into(),
        }
    }
}

#[derive(Deserialize)]
struct HttpBinResponse {
    #[serde(default)]
    origin: String,
}

impl PublicIpProvider for HttpBinIp {
    fn name(&self) -> &'static str {
        "httpbin"
    }

    fn public_ip(&self) -> Result<IpAddr> {
        let response: HttpBinResponse = get_json(self.agent.get(&self.url))?;
        parse_origin(&response.origin)
    }
}

/// First entry of a comma-separated origin list.
fn parse_origin(origin: &str) -> Result<IpAddr> {
    let first = origin.split(',').next().unwrap_or("").trim();
    first
        .parse()
        .map_err(|e| anyhow!("httpbin returned invalid origin '{}': {}", origin, e))
}

// -------------------- IP geolocation --------------------

/// ipapi.co geolocation: `GET {base}/{ip}/json/`.
pub struct IpApiGeolocator {
    agent: ureq::Agent,
    base_url: String,
}

impl IpApiGeolocator {
    pub fn new(agent: ureq::Agent, base_url: impl Into<String>) -> Self {
        Self {
            agent,
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct IpApiResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    reason: Option<String>,
    city: Option<String>,
    region: Option<String>,
    country_name: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl IpGeolocator for IpApiGeolocator {
    fn name(&self) -> &'static str {
        "ipapi"
    }

    fn locate(&self, ip: IpAddr) -> Result<Location> {
        let url = format!("{}/{}/json/", self.base_url.trim_end_matches('/'), ip);
        let response: IpApiResponse = get_json(self.agent.get(&url))?;
        if response.error {
            return Err(anyhow!(
                "ipapi rejected {}: {}",
                ip,
                response.reason.unwrap_or_else(|| "unknown reason".to_string())
            ));
        }
        Ok(ip_location(
            ip,
            response.city,
            response.region,
            response.country_name,
            response.latitude,
            response.longitude,
        ))
    }
}

/// Build an IP-sourced location. The address is the known parts joined as
/// "city, region, country".
fn ip_location(
    ip: IpAddr,
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
) -> Location {
    let parts: Vec<&str> = [&city, &region, &country]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    let address = if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    };
    Location {
        source: LocationSource::Ip,
        latitude,
        longitude,
        accuracy: IP_ACCURACY.to_string(),
        address,
        timestamp: crate::now_utc(),
        ip: Some(ip.to_string()),
        city,
        region,
        country,
    }
}

// -------------------- Reverse geocoding --------------------

/// Nominatim (OpenStreetMap) reverse geocoding.
pub struct NominatimGeocoder {
    agent: ureq::Agent,
    url: String,
    user_agent: String,
}

impl NominatimGeocoder {
    pub fn new(agent: ureq::Agent, url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            agent,
            url: url.into(),
            user_agent: user_agent.into(),
        }
    }
}

#[derive(Deserialize)]
struct NominatimResponse {
    display_name: Option<String>,
}

impl ReverseGeocoder for NominatimGeocoder {
    fn name(&self) -> &'static str {
        "nominatim"
    }

    fn address(&self, latitude: f64, longitude: f64) -> Result<String> {
        let request = self
            .agent
            .get(&self.url)
            .set("User-Agent", &self.user_agent)
            .query("format", "json")
            .query("lat", &latitude.to_string())
            .query("lon", &longitude.to_string());
        let response: NominatimResponse = get_json(request)?;
        response
            .display_name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| anyhow!("no address for ({}, {})", latitude, longitude))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn origin_uses_first_forwarded_entry() {
        assert_eq!(
            parse_origin("203.0.113.9, 10.0.0.1").unwrap(),
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))
        );
        assert!(parse_origin("").is_err());
    }

    #[test]
    fn ip_location_address_skips_missing_parts() {
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        let loc = ip_location(
            ip,
            Some("Chennai".to_string()),
            None,
            Some("India".to_string()),
            Some(13.08),
            Some(80.27),
        );
        assert_eq!(loc.address.as_deref(), Some("Chennai, India"));
        assert_eq!(loc.working_area(), Some("Chennai"));
        assert_eq!(loc.accuracy, IP_ACCURACY);

        let empty = ip_location(ip, None, Some(" ".to_string()), None, None, None);
        assert_eq!(empty.address, None);
    }
}

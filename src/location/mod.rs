//! Location resolution.
//!
//! A detection is tagged with the best location estimate available when it is
//! recorded:
//! - the latest GPS fix submitted by a client device, if any
//! - otherwise an IP-based estimate, resolved on demand and never cached
//!
//! The GPS fix is process-wide with last-write-wins semantics and no expiry.
//! External lookups never raise: every failure degrades to `None`.

mod providers;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

pub use providers::{
    http_agent, HttpBinIp, IpApiGeolocator, IpGeolocator, IpifyIp, NominatimGeocoder,
    PublicIpProvider, ReverseGeocoder,
};

/// Label used when no address is available for a detection.
pub const UNKNOWN_AREA: &str = "Unknown";

/// Accuracy label for IP-based estimates.
pub const IP_ACCURACY: &str = "City-level (~10km)";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LocationSource {
    Gps,
    Ip,
}

/// A point-in-time location estimate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub source: LocationSource,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Free-form accuracy descriptor ("±12 meters", "City-level (~10km)").
    pub accuracy: String,
    pub address: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl Location {
    /// Short locality label: the first comma-delimited segment of the address.
    pub fn working_area(&self) -> Option<&str> {
        self.address
            .as_deref()
            .and_then(|address| address.split(',').next())
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
    }
}

/// Working area for an optional location, falling back to [`UNKNOWN_AREA`].
pub fn working_area(location: Option<&Location>) -> String {
    location
        .and_then(Location::working_area)
        .unwrap_or(UNKNOWN_AREA)
        .to_string()
}

// -------------------- GPS fix store --------------------

#[derive(Debug, Default)]
struct GpsSlot {
    fix: Option<Location>,
    generation: u64,
}

/// Holder for the latest GPS fix.
///
/// Every replacement bumps a generation counter so late reverse-geocoding
/// results for an older fix can be discarded.
#[derive(Debug, Default)]
pub struct GpsStore {
    slot: Mutex<GpsSlot>,
}

impl GpsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Location> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fix
            .clone()
    }

    /// Overwrite the fix. Returns the generation assigned to it.
    pub fn replace(&self, fix: Location) -> u64 {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.generation += 1;
        slot.fix = Some(fix);
        slot.generation
    }

    /// Attach an address to the fix if it is still the one at `generation`.
    pub fn set_address(&self, generation: u64, address: String) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.generation != generation {
            return false;
        }
        match slot.fix.as_mut() {
            Some(fix) => {
                fix.address = Some(address);
                true
            }
            None => false,
        }
    }
}

// -------------------- GPS submission --------------------

/// Timestamp as sent by a client device: epoch milliseconds or RFC 3339 text.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum SubmittedTimestamp {
    EpochMillis(f64),
    Text(String),
}

impl SubmittedTimestamp {
    fn resolve(&self) -> Option<DateTime<Utc>> {
        match self {
            SubmittedTimestamp::EpochMillis(ms) if ms.is_finite() => {
                DateTime::from_timestamp_millis(*ms as i64)
            }
            SubmittedTimestamp::EpochMillis(_) => None,
            SubmittedTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
        }
    }
}

/// GPS fix submitted by a client device.
#[derive(Clone, Debug, Deserialize)]
pub struct GpsSubmission {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<SubmittedTimestamp>,
}

impl GpsSubmission {
    /// Validate the submission and turn it into a GPS location record.
    pub fn into_fix(self, received_at: DateTime<Utc>) -> Result<Location> {
        let latitude = self
            .latitude
            .ok_or_else(|| anyhow!("latitude is required"))?;
        let longitude = self
            .longitude
            .ok_or_else(|| anyhow!("longitude is required"))?;
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(anyhow!("latitude out of range: {}", latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(anyhow!("longitude out of range: {}", longitude));
        }
        let accuracy = match self.accuracy {
            Some(meters) if meters.is_finite() && meters > 0.0 => format!("±{:.0} meters", meters),
            _ => UNKNOWN_AREA.to_string(),
        };
        let timestamp = self
            .timestamp
            .as_ref()
            .and_then(SubmittedTimestamp::resolve)
            .unwrap_or(received_at);
        Ok(Location {
            source: LocationSource::Gps,
            latitude: Some(latitude),
            longitude: Some(longitude),
            accuracy,
            address: None,
            timestamp,
            ip: None,
            city: None,
            region: None,
            country: None,
        })
    }
}

// -------------------- Resolver --------------------

/// Resolves the current location from the GPS fix or external IP services.
pub struct LocationResolver {
    gps: Arc<GpsStore>,
    public_ip: Vec<Box<dyn PublicIpProvider>>,
    geolocator: Box<dyn IpGeolocator>,
    geocoder: Box<dyn ReverseGeocoder>,
}

impl LocationResolver {
    /// `public_ip` providers are tried in order; the first success wins.
    pub fn new(
        gps: Arc<GpsStore>,
        public_ip: Vec<Box<dyn PublicIpProvider>>,
        geolocator: Box<dyn IpGeolocator>,
        geocoder: Box<dyn ReverseGeocoder>,
    ) -> Self {
        Self {
            gps,
            public_ip,
            geolocator,
            geocoder,
        }
    }

    pub fn gps(&self) -> &Arc<GpsStore> {
        &self.gps
    }

    /// GPS fix if known, otherwise an IP-based estimate for `client`.
    pub fn resolve_current(&self, client: Option<IpAddr>) -> Option<Location> {
        if let Some(fix) = self.gps.current() {
            return Some(fix);
        }
        self.resolve_ip(client)
    }

    /// IP-based estimate. Local or missing client addresses are replaced by
    /// this host's public address.
    pub fn resolve_ip(&self, client: Option<IpAddr>) -> Option<Location> {
        let ip = match client {
            Some(ip) if !is_local_addr(&ip) => ip,
            _ => self.public_ip()?,
        };
        match self.geolocator.locate(ip) {
            Ok(location) => Some(location),
            Err(err) => {
                log::debug!(
                    "ip geolocation via {} failed for {}: {}",
                    self.geolocator.name(),
                    ip,
                    err
                );
                None
            }
        }
    }

    fn public_ip(&self) -> Option<IpAddr> {
        for provider in &self.public_ip {
            match provider.public_ip() {
                Ok(ip) if !is_local_addr(&ip) => return Some(ip),
                Ok(ip) => log::debug!("{} returned local address {}", provider.name(), ip),
                Err(err) => log::debug!("public ip lookup via {} failed: {}", provider.name(), err),
            }
        }
        log::warn!("public ip lookup failed on all providers");
        None
    }

    /// Reverse geocode a coordinate pair into a human-readable address.
    pub fn resolve_address(&self, latitude: f64, longitude: f64) -> Option<String> {
        match self.geocoder.address(latitude, longitude) {
            Ok(address) => Some(address),
            Err(err) => {
                log::debug!(
                    "reverse geocoding via {} failed for ({}, {}): {}",
                    self.geocoder.name(),
                    latitude,
                    longitude,
                    err
                );
                None
            }
        }
    }

    /// Store a submitted GPS fix and start reverse geocoding in the background.
    ///
    /// The fix is visible immediately; its address appears once geocoding
    /// finishes, unless a newer fix has replaced it in the meantime.
    pub fn submit_gps(self: &Arc<Self>, submission: GpsSubmission) -> Result<Location> {
        let fix = submission.into_fix(crate::now_utc())?;
        let generation = self.gps.replace(fix.clone());
        let (latitude, longitude) = (fix.latitude, fix.longitude);
        log::info!(
            "gps fix saved: lat={:?} lon={:?} accuracy={}",
            latitude,
            longitude,
            fix.accuracy
        );
        if let (Some(latitude), Some(longitude)) = (latitude, longitude) {
            let resolver = Arc::clone(self);
            let spawned = std::thread::Builder::new()
                .name("reverse-geocode".to_string())
                .spawn(move || {
                    resolver.geocode_fix(generation, latitude, longitude);
                });
            if let Err(err) = spawned {
                log::warn!("failed to spawn reverse geocoding thread: {}", err);
            }
        }
        Ok(fix)
    }

    /// Resolve and attach the address for the fix at `generation`.
    pub fn geocode_fix(&self, generation: u64, latitude: f64, longitude: f64) -> bool {
        let Some(address) = self.resolve_address(latitude, longitude) else {
            return false;
        };
        let attached = self.gps.set_address(generation, address);
        if !attached {
            log::debug!("gps fix replaced before reverse geocoding finished");
        }
        attached
    }
}

/// Loopback or unspecified addresses cannot be geolocated.
pub fn is_local_addr(ip: &IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified()
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn submission(lat: Option<f64>, lon: Option<f64>) -> GpsSubmission {
        GpsSubmission {
            latitude: lat,
            longitude: lon,
            accuracy: Some(12.4),
            timestamp: None,
        }
    }

    #[test]
    fn working_area_takes_first_address_segment() {
        let mut loc = CityGeolocator(Some("Bengaluru"))
            .locate(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))
            .unwrap();
        assert_eq!(working_area(Some(&loc)), "Bengaluru");
        loc.address = Some("   , nowhere".to_string());
        assert_eq!(working_area(Some(&loc)), UNKNOWN_AREA);
        loc.address = None;
        assert_eq!(working_area(Some(&loc)), UNKNOWN_AREA);
        assert_eq!(working_area(None), UNKNOWN_AREA);
    }

    #[test]
    fn submission_requires_both_coordinates() {
        let now = crate::now_utc();
        assert!(submission(None, Some(77.0)).into_fix(now).is_err());
        assert!(submission(Some(12.0), None).into_fix(now).is_err());
        assert!(submission(Some(91.0), Some(77.0)).into_fix(now).is_err());
        assert!(submission(Some(12.0), Some(-181.0)).into_fix(now).is_err());

        let fix = submission(Some(0.0), Some(0.0)).into_fix(now).unwrap();
        assert_eq!(fix.source, LocationSource::Gps);
        assert_eq!(fix.accuracy, "±12 meters");
        assert_eq!(fix.timestamp, now);
    }

    #[test]
    fn submission_timestamp_accepts_millis_and_rfc3339() {
        let now = crate::now_utc();
        let from_json: GpsSubmission = serde_json::from_str(
            r#"{"latitude": 1.0, "longitude": 2.0, "timestamp": 1700000000000}"#,
        )
        .unwrap();
        let fix = from_json.into_fix(now).unwrap();
        assert_eq!(fix.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(fix.accuracy, UNKNOWN_AREA);

        let from_text: GpsSubmission = serde_json::from_str(
            r#"{"latitude": 1.0, "longitude": 2.0, "timestamp": "2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        let fix = from_text.into_fix(now).unwrap();
        assert_eq!(fix.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn gps_fix_wins_over_ip_lookup() {
        let gps = Arc::new(GpsStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = LocationResolver::new(
            gps.clone(),
            vec![Box::new(FixedIp(
                Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))),
                calls.clone(),
            ))],
            Box::new(CityGeolocator(Some("Pune"))),
            Box::new(FixedGeocoder(None)),
        );

        let ip_loc = resolver.resolve_current(None).expect("ip location");
        assert_eq!(ip_loc.source, LocationSource::Ip);
        assert_eq!(ip_loc.ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gps.replace(
            submission(Some(18.5), Some(73.8))
                .into_fix(crate::now_utc())
                .unwrap(),
        );
        let gps_loc = resolver.resolve_current(None).expect("gps location");
        assert_eq!(gps_loc.source, LocationSource::Gps);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn public_client_address_skips_public_ip_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = LocationResolver::new(
            Arc::new(GpsStore::new()),
            vec![Box::new(FixedIp(None, calls.clone()))],
            Box::new(CityGeolocator(Some("Pune"))),
            Box::new(FixedGeocoder(None)),
        );
        let client = IpAddr::V4(Ipv4Addr::new(49, 36, 10, 1));
        let loc = resolver.resolve_current(Some(client)).unwrap();
        assert_eq!(loc.ip.as_deref(), Some("49.36.10.1"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn public_ip_chain_falls_through_in_order() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let resolver = LocationResolver::new(
            Arc::new(GpsStore::new()),
            vec![
                Box::new(FixedIp(None, first.clone())),
                Box::new(FixedIp(Some(IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8))), second.clone())),
            ],
            Box::new(CityGeolocator(Some("Delhi"))),
            Box::new(FixedGeocoder(None)),
        );
        let loc = resolver
            .resolve_current(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .unwrap();
        assert_eq!(loc.ip.as_deref(), Some("5.6.7.8"));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lookup_failures_yield_none() {
        let resolver = offline_resolver(Arc::new(GpsStore::new()));
        assert!(resolver.resolve_current(None).is_none());
        assert!(resolver.resolve_address(1.0, 2.0).is_none());
    }

    #[test]
    fn stale_geocode_result_is_discarded() {
        let gps = Arc::new(GpsStore::new());
        let resolver = LocationResolver::new(
            gps.clone(),
            vec![],
            Box::new(CityGeolocator(None)),
            Box::new(FixedGeocoder(Some("MG Road, Bengaluru"))),
        );
        let now = crate::now_utc();
        let first = gps.replace(submission(Some(1.0), Some(1.0)).into_fix(now).unwrap());
        let second = gps.replace(submission(Some(2.0), Some(2.0)).into_fix(now).unwrap());

        assert!(!resolver.geocode_fix(first, 1.0, 1.0));
        assert_eq!(gps.current().unwrap().address, None);

        assert!(resolver.geocode_fix(second, 2.0, 2.0));
        let fix = gps.current().unwrap();
        assert_eq!(fix.address.as_deref(), Some("MG Road, Bengaluru"));
        assert_eq!(fix.working_area(), Some("MG Road"));
    }
}

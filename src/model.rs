//! # Event model
//! Canonical in-memory / persisted representation of one seismic event.
//!
//! Records are built by the normalizer from raw feed items and are immutable
//! once the store has accepted them. The [`IdentityKey`] is derived from the
//! physical attributes of the event, so two fetches that see the same quake
//! with slightly different number formatting agree on it.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::NormalizeRejection;

pub const LATITUDE_RANGE: std::ops::RangeInclusive<f64> = -90.0..=90.0;
pub const LONGITUDE_RANGE: std::ops::RangeInclusive<f64> = -180.0..=180.0;

/// Derived dedup key: `YYYYMMDDTHHMMSSZ|lat*1000|lon*1000|mag*10`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn derive(occurred_at: DateTime<Utc>, latitude: f64, longitude: f64, magnitude: f64) -> Self {
        let ts = occurred_at.trunc_subsecs(0).format("%Y%m%dT%H%M%SZ");
        Self(format!(
            "{}|{}|{}|{}",
            ts,
            scaled(latitude, 1_000.0),
            scaled(longitude, 1_000.0),
            scaled(magnitude, 10.0)
        ))
    }

    /// Wrap a key read back from storage.
    pub(crate) fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Integer rendering keeps -0.0004 and 0.0 on the same key.
fn scaled(value: f64, factor: f64) -> i64 {
    (value * factor).round() as i64
}

/// Nearest settlement as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosestCity {
    pub name: String,
    pub city_code: Option<i64>,
    /// Metres from the epicenter.
    pub distance_m: Option<f64>,
    pub population: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Airport {
    pub name: String,
    pub code: Option<String>,
    /// Metres from the epicenter.
    pub distance_m: Option<f64>,
}

/// One seismic event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub identity_key: IdentityKey,
    pub occurred_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// `None` when the provider omitted it; unknown is not zero.
    pub depth_km: Option<f64>,
    pub magnitude: f64,
    pub location_label: String,
    pub provider: Option<String>,
    pub provider_event_id: Option<String>,
    pub closest_city: Option<ClosestCity>,
    pub epicenter_name: Option<String>,
    #[serde(default)]
    pub airports: Vec<Airport>,
    /// When this client observed the record. Diagnostics only, never dedup.
    pub retrieved_at: DateTime<Utc>,
}

impl EventRecord {
    /// Build a record, validating coordinates and deriving the identity key.
    pub fn new(
        occurred_at: DateTime<Utc>,
        latitude: f64,
        longitude: f64,
        magnitude: f64,
        retrieved_at: DateTime<Utc>,
    ) -> Result<Self, NormalizeRejection> {
        check_coordinates(latitude, longitude)?;
        if !magnitude.is_finite() {
            return Err(NormalizeRejection::MalformedItem);
        }
        Ok(Self {
            identity_key: IdentityKey::derive(occurred_at, latitude, longitude, magnitude),
            occurred_at,
            latitude,
            longitude,
            depth_km: None,
            magnitude,
            location_label: String::new(),
            provider: None,
            provider_event_id: None,
            closest_city: None,
            epicenter_name: None,
            airports: Vec::new(),
            retrieved_at,
        })
    }

    /// Negative or non-finite depths are treated as unknown.
    pub fn with_depth(mut self, depth_km: Option<f64>) -> Self {
        self.depth_km = depth_km.filter(|d| d.is_finite() && *d >= 0.0);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.location_label = label.into();
        self
    }

    pub fn with_provider(mut self, provider: Option<String>, provider_event_id: Option<String>) -> Self {
        self.provider = provider;
        self.provider_event_id = provider_event_id;
        self
    }

    /// Provider-side place context. Informational only, never part of the key.
    pub fn with_location(
        mut self,
        closest_city: Option<ClosestCity>,
        epicenter_name: Option<String>,
        airports: Vec<Airport>,
    ) -> Self {
        self.closest_city = closest_city;
        self.epicenter_name = epicenter_name;
        self.airports = airports;
        self
    }
}

pub fn check_coordinates(latitude: f64, longitude: f64) -> Result<(), NormalizeRejection> {
    if !latitude.is_finite() || !longitude.is_finite() {
        return Err(NormalizeRejection::MalformedItem);
    }
    if !LATITUDE_RANGE.contains(&latitude) || !LONGITUDE_RANGE.contains(&longitude) {
        return Err(NormalizeRejection::CoordinateOutOfRange);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 9, 34, 56).unwrap()
    }

    #[test]
    fn key_ignores_subseconds_and_formatting_noise() {
        let a = IdentityKey::derive(t0(), 39.1234, 27.4561, 4.5);
        let b = IdentityKey::derive(
            t0() + chrono::Duration::milliseconds(700),
            39.12341,
            27.45609,
            4.50,
        );
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "20240115T093456Z|39123|27456|45");
    }

    #[test]
    fn key_has_no_negative_zero() {
        let a = IdentityKey::derive(t0(), -0.0004, 0.0, 0.0);
        let b = IdentityKey::derive(t0(), 0.0, 0.0, -0.04);
        assert_eq!(a, b);
        assert!(!a.as_str().contains("-0|"));
    }

    #[test]
    fn out_of_range_coordinates_rejected() {
        assert_eq!(
            EventRecord::new(t0(), 91.0, 10.0, 3.0, t0()).unwrap_err(),
            NormalizeRejection::CoordinateOutOfRange
        );
        assert_eq!(
            EventRecord::new(t0(), 10.0, -180.5, 3.0, t0()).unwrap_err(),
            NormalizeRejection::CoordinateOutOfRange
        );
        assert!(EventRecord::new(t0(), -90.0, 180.0, 3.0, t0()).is_ok());
    }

    #[test]
    fn negative_depth_is_unknown() {
        let r = EventRecord::new(t0(), 1.0, 1.0, 2.0, t0())
            .unwrap()
            .with_depth(Some(-1.5));
        assert_eq!(r.depth_km, None);
        let r = r.with_depth(Some(7.0));
        assert_eq!(r.depth_km, Some(7.0));
    }
}

// src/ingest/normalizer.rs
//! Provider payload → [`EventRecord`]s.
//!
//! Every item is validated on its own; a bad item becomes a [`Rejection`]
//! and the rest of the batch carries on. Only a payload that is not a
//! list at all is fatal.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{NormalizeError, NormalizeRejection};
use crate::ingest::types::{Normalized, RawPayload, Rejection};
use crate::model::{Airport, ClosestCity, EventRecord};

const LABEL_MAX_CHARS: usize = 256;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y.%m.%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y.%m.%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    source_offset: FixedOffset,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(FixedOffset::east_opt(3 * 3600).unwrap_or_else(|| Utc.fix()))
    }
}

impl Normalizer {
    /// `source_offset` applies to provider timestamps without an explicit offset.
    pub fn new(source_offset: FixedOffset) -> Self {
        Self { source_offset }
    }

    pub fn normalize(&self, raw: &RawPayload) -> Result<Normalized, NormalizeError> {
        let items = extract_items(&raw.body)?;

        let mut out = Normalized {
            records: Vec::with_capacity(items.len()),
            rejections: Vec::new(),
        };
        for (index, item) in items.iter().enumerate() {
            match self.normalize_item(item, raw.retrieved_at) {
                Ok(rec) => out.records.push(rec),
                Err(reason) => {
                    tracing::debug!(target: "ingest", index, reason = reason.as_str(), "feed item rejected");
                    out.rejections.push(Rejection { index, reason });
                }
            }
        }
        Ok(out)
    }

    fn normalize_item(
        &self,
        item: &Value,
        retrieved_at: DateTime<Utc>,
    ) -> Result<EventRecord, NormalizeRejection> {
        let obj = item.as_object().ok_or(NormalizeRejection::MalformedItem)?;

        let magnitude = match number(first_of(obj, &["mag", "magnitude"])) {
            Ok(Some(m)) => m,
            Ok(None) => return Err(NormalizeRejection::MissingMagnitude),
            Err(()) => return Err(NormalizeRejection::MalformedItem),
        };

        let occurred_at = self.timestamp(obj)?;
        let (latitude, longitude) = coordinates(obj)?;

        let depth_km = number(obj.get("depth")).ok().flatten();
        let label = first_of(obj, &["title", "place"])
            .and_then(Value::as_str)
            .map(normalize_text)
            .unwrap_or_default();

        let record = EventRecord::new(occurred_at, latitude, longitude, magnitude, retrieved_at)?
            .with_depth(depth_km)
            .with_label(label)
            .with_provider(
                text(obj.get("provider")),
                text(first_of(obj, &["earthquake_id", "id"])),
            );
        let record = match obj.get("location_properties").and_then(Value::as_object) {
            Some(props) => record.with_location(
                closest_city(props),
                props
                    .get("epiCenter")
                    .and_then(|e| text(e.get("name")))
                    .map(|n| normalize_text(&n)),
                airports(props),
            ),
            None => record,
        };
        Ok(record)
    }

    fn timestamp(&self, obj: &Map<String, Value>) -> Result<DateTime<Utc>, NormalizeRejection> {
        let v = first_of(obj, &["date_time", "date", "time"])
            .ok_or(NormalizeRejection::MissingTimestamp)?;
        match v {
            Value::String(s) if s.trim().is_empty() => Err(NormalizeRejection::MissingTimestamp),
            Value::String(s) => self
                .parse_timestamp(s.trim())
                .ok_or(NormalizeRejection::UnparsableTimestamp),
            // epoch milliseconds
            Value::Number(n) => n
                .as_i64()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .ok_or(NormalizeRejection::UnparsableTimestamp),
            _ => Err(NormalizeRejection::UnparsableTimestamp),
        }
    }

    pub fn parse_timestamp(&self, s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
            .and_then(|naive| self.source_offset.from_local_datetime(&naive).single())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Accepts `{"result": [...]}` or a bare array.
fn extract_items(body: &str) -> Result<Vec<Value>, NormalizeError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| NormalizeError::UnreadablePayload(format!("not json: {e}")))?;
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => match obj.remove("result") {
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(NormalizeError::UnreadablePayload(
                "`result` is not a list".to_string(),
            )),
            None => Err(NormalizeError::UnreadablePayload(
                "object without `result` list".to_string(),
            )),
        },
        _ => Err(NormalizeError::UnreadablePayload(
            "payload is neither a list nor an object".to_string(),
        )),
    }
}

fn first_of<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

/// `Ok(None)` for absent/null/blank, `Err` for something that is not a number.
fn number(v: Option<&Value>) -> Result<Option<f64>, ()> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().filter(|x| x.is_finite()).map(Some).ok_or(()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|x| x.is_finite())
            .map(Some)
            .ok_or(()),
        Some(_) => Err(()),
    }
}

fn text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// Place context is best effort: anything unreadable is left out, never rejected.
fn closest_city(props: &Map<String, Value>) -> Option<ClosestCity> {
    let city = props.get("closestCity")?.as_object()?;
    let name = normalize_text(&text(city.get("name"))?);
    if name.is_empty() {
        return None;
    }
    let whole = |key: &str| number(city.get(key)).ok().flatten().map(f64::round);
    Some(ClosestCity {
        name,
        city_code: whole("cityCode").map(|c| c as i64),
        distance_m: number(city.get("distance")).ok().flatten().filter(|d| *d >= 0.0),
        population: whole("population").filter(|p| *p >= 0.0).map(|p| p as u64),
    })
}

fn airports(props: &Map<String, Value>) -> Vec<Airport> {
    let Some(list) = props.get("airports").and_then(Value::as_array) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(Value::as_object)
        .filter_map(|a| {
            let name = normalize_text(&text(a.get("name"))?);
            (!name.is_empty()).then(|| Airport {
                name,
                code: text(a.get("code")),
                distance_m: number(a.get("distance")).ok().flatten().filter(|d| *d >= 0.0),
            })
        })
        .collect()
}

/// GeoJSON `[lon, lat]` first, then flat fields.
fn coordinates(obj: &Map<String, Value>) -> Result<(f64, f64), NormalizeRejection> {
    let from_geojson = obj
        .get("geojson")
        .and_then(|g| g.get("coordinates"))
        .and_then(Value::as_array)
        .map(|c| (number(c.get(1)), number(c.first())));

    let (lat, lon) = match from_geojson {
        Some(pair) => pair,
        None => (
            number(first_of(obj, &["lat", "latitude"])),
            number(first_of(obj, &["lng", "lon", "longitude"])),
        ),
    };

    match (lat, lon) {
        (Ok(Some(lat)), Ok(Some(lon))) => {
            crate::model::check_coordinates(lat, lon)?;
            Ok((lat, lon))
        }
        _ => Err(NormalizeRejection::MalformedItem),
    }
}

/// Normalize a place label: decode entities, drop tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

    let decoded = html_escape::decode_html_entities(s);
    let untagged = RE_TAGS.replace_all(&decoded, "");
    let collapsed = RE_WS.replace_all(&untagged, " ");
    let out = collapsed.trim();

    if out.chars().count() > LABEL_MAX_CHARS {
        out.chars().take(LABEL_MAX_CHARS).collect()
    } else {
        out.to_string()
    }
}

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::errors::ReaderError;
use crate::model::{PointLabel, ReadOptions};

pub const LATITUDE_ALIASES: &[&str] = &["latitude", "lat", "lat_dd", "y"];
pub const LONGITUDE_ALIASES: &[&str] = &["longitude", "lon", "lng", "long", "lon_dd", "x"];
pub const DATE_ALIASES: &[&str] = &[
    "observation_date",
    "date",
    "obs_date",
    "start_date",
    "collection_date",
];
pub const LABEL_ALIASES: &[&str] = &[
    "label",
    "class",
    "class_name",
    "crop",
    "crop_type",
    "landcover",
];
pub const GEOMETRY_ALIASES: &[&str] = &["geometry", "wkt", "geom", "the_geom"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Latitude,
    Longitude,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Latitude => f.write_str("latitude"),
            Axis::Longitude => f.write_str("longitude"),
        }
    }
}

/// Lowercases and snake-cases a header so `"Crop Type"` matches `crop_type`.
pub fn normalize_header(name: &str) -> String {
    name.trim_start_matches('\u{feff}')
        .trim()
        .chars()
        .map(|ch| match ch {
            ' ' | '-' | '.' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Finds the column for `field`. An explicit override must exist; otherwise
/// the first alias present (in alias priority order) wins.
pub fn resolve_field(
    reader: &'static str,
    headers: &[String],
    field: &'static str,
    overridden: Option<&str>,
    aliases: &[&str],
) -> Result<Option<usize>, ReaderError> {
    if let Some(column) = overridden {
        let wanted = normalize_header(column);
        return headers
            .iter()
            .position(|header| *header == wanted)
            .map(Some)
            .ok_or_else(|| ReaderError::UnknownColumn {
                reader,
                field,
                column: column.to_string(),
            });
    }

    Ok(aliases
        .iter()
        .find_map(|alias| headers.iter().position(|header| header == alias)))
}

pub fn parse_coordinate(value: &str, axis: Axis) -> Result<f64, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("empty {axis}"));
    }
    if let Ok(parsed) = trimmed.parse::<f64>() {
        return Ok(parsed);
    }
    parse_dms(trimmed, axis)
}

/// Degrees-minutes-seconds such as `10°30'15"N` or `122 25 9.8 W`.
fn parse_dms(value: &str, axis: Axis) -> Result<f64, String> {
    let invalid = || format!("invalid {axis} '{value}'");

    let upper = value.to_ascii_uppercase();
    let (hemisphere, body) = match (upper.chars().next(), upper.chars().last()) {
        (_, Some(last)) if "NSEW".contains(last) => (Some(last), &upper[..upper.len() - 1]),
        (Some(first), _) if "NSEW".contains(first) => (Some(first), &upper[1..]),
        _ => (None, upper.as_str()),
    };

    let sign = match (hemisphere, axis) {
        (Some('N'), Axis::Latitude) | (Some('E'), Axis::Longitude) => 1.0,
        (Some('S'), Axis::Latitude) | (Some('W'), Axis::Longitude) => -1.0,
        (Some(other), _) => return Err(format!("hemisphere '{other}' is not valid for {axis}")),
        (None, _) => 1.0,
    };

    let parts: Vec<&str> = body
        .split(|ch: char| ch.is_whitespace() || "°'\"′″:D".contains(ch))
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(invalid());
    }

    let mut numbers = Vec::with_capacity(parts.len());
    for part in &parts {
        numbers.push(part.parse::<f64>().map_err(|_| invalid())?);
    }

    let degrees = numbers[0];
    let minutes = numbers.get(1).copied().unwrap_or(0.0);
    let seconds = numbers.get(2).copied().unwrap_or(0.0);
    if !(0.0..60.0).contains(&minutes) || !(0.0..60.0).contains(&seconds) {
        return Err(invalid());
    }
    if degrees < 0.0 && hemisphere.is_some() {
        return Err(invalid());
    }

    let magnitude = degrees.abs() + minutes / 60.0 + seconds / 3600.0;
    let signed = if degrees < 0.0 { -magnitude } else { magnitude };
    Ok(sign * signed)
}

/// Parses `POINT (lon lat)` (optionally `POINT Z`). Returns `(latitude, longitude)`.
pub fn parse_wkt_point(value: &str) -> Result<(f64, f64), String> {
    let trimmed = value.trim();
    let upper = trimmed.to_ascii_uppercase();
    if !upper.starts_with("POINT") {
        return Err(format!("unsupported geometry '{trimmed}'; expected a WKT POINT"));
    }

    let open = trimmed
        .find('(')
        .ok_or_else(|| format!("malformed WKT point '{trimmed}'"))?;
    let close = trimmed
        .rfind(')')
        .filter(|close| *close > open)
        .ok_or_else(|| format!("malformed WKT point '{trimmed}'"))?;

    let coords: Vec<f64> = trimmed[open + 1..close]
        .split_whitespace()
        .map(|part| part.parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("malformed WKT point '{trimmed}'"))?;

    match coords.as_slice() {
        [lon, lat] | [lon, lat, _] => Ok((*lat, *lon)),
        _ => Err(format!("malformed WKT point '{trimmed}'")),
    }
}

pub fn parse_date(value: &str, custom_format: Option<&str>) -> Result<NaiveDate, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("empty observation date".to_string());
    }

    if let Some(format) = custom_format {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Ok(date);
        }
        if let Ok(datetime) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(datetime.date());
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Ok(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(datetime.date());
        }
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(datetime.date_naive());
    }

    Err(format!("unparseable observation date '{trimmed}'"))
}

pub fn parse_label(raw: &str, options: &ReadOptions) -> Result<PointLabel, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("missing label".to_string());
    }

    let mapped = options
        .label_map
        .get(trimmed)
        .or_else(|| {
            options
                .label_map
                .iter()
                .find(|(source, _)| source.eq_ignore_ascii_case(trimmed))
                .map(|(_, canonical)| canonical)
        })
        .map(String::as_str)
        .unwrap_or(trimmed);

    if mapped.eq_ignore_ascii_case(PointLabel::UNLABELED_MARKER) {
        Ok(PointLabel::Unlabeled)
    } else {
        Ok(PointLabel::Class(mapped.to_string()))
    }
}

/// Mean of the exterior-ring vertices of each polygon, ignoring the closing
/// vertex. Input positions are `[lon, lat, ..]`. Returns `(latitude, longitude)`.
pub fn polygon_centroid(exterior_rings: &[&Vec<Vec<f64>>]) -> Option<(f64, f64)> {
    let mut lat_sum = 0.0;
    let mut lon_sum = 0.0;
    let mut count = 0usize;

    for ring in exterior_rings {
        let vertices = match ring.as_slice() {
            [open @ .., last] if ring.len() > 1 && open.first() == Some(last) => open,
            all => all,
        };
        for position in vertices {
            if position.len() < 2 {
                return None;
            }
            lon_sum += position[0];
            lat_sum += position[1];
            count += 1;
        }
    }

    if count == 0 {
        None
    } else {
        Some((lat_sum / count as f64, lon_sum / count as f64))
    }
}

use geojson::{Feature, GeoJson, JsonObject, Value as GeometryValue};
use serde_json::Value;

use crate::errors::ReaderError;
use crate::model::{ParsedSource, PointLabel, ReadOptions, RowIssue, SourceFormat, SourceRow};
use crate::registry::PointReader;

use super::{
    normalize_header, parse_date, parse_label, polygon_centroid, resolve_field, DATE_ALIASES,
    LABEL_ALIASES,
};

/// GeoJSON features. Points map directly; polygons are reduced to the
/// centroid of their exterior ring.
pub struct GeoJsonReader;

impl Default for GeoJsonReader {
    fn default() -> Self {
        Self
    }
}

struct PropertyPlan {
    date: Option<String>,
    label: Option<String>,
}

impl GeoJsonReader {
    const NAME: &'static str = "vector_geojson";

    fn features(document: GeoJson) -> Result<Vec<Feature>, ReaderError> {
        match document {
            GeoJson::FeatureCollection(collection) => Ok(collection.features),
            GeoJson::Feature(feature) => Ok(vec![feature]),
            GeoJson::Geometry(_) => Err(ReaderError::FormatMismatch {
                reader: Self::NAME,
                reason: "bare geometry carries no properties".to_string(),
            }),
        }
    }

    /// Property keys in order of first appearance across all features.
    fn property_keys(features: &[Feature]) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for properties in features.iter().filter_map(|f| f.properties.as_ref()) {
            for key in properties.keys() {
                if !keys.iter().any(|existing| existing == key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    fn plan(features: &[Feature], options: &ReadOptions) -> Result<PropertyPlan, ReaderError> {
        let raw_keys = Self::property_keys(features);
        let normalized: Vec<String> = raw_keys.iter().map(|key| normalize_header(key)).collect();
        let columns = &options.columns;

        let date = resolve_field(
            Self::NAME,
            &normalized,
            "date",
            columns.date.as_deref(),
            DATE_ALIASES,
        )?
        .map(|index| raw_keys[index].clone());
        if date.is_none() && options.default_date.is_none() {
            return Err(ReaderError::MissingField {
                reader: Self::NAME,
                field: "date",
                available: raw_keys,
            });
        }

        let label = if options.unlabeled {
            None
        } else {
            let label = resolve_field(
                Self::NAME,
                &normalized,
                "label",
                columns.label.as_deref(),
                LABEL_ALIASES,
            )?
            .map(|index| raw_keys[index].clone());
            if label.is_none() {
                return Err(ReaderError::MissingField {
                    reader: Self::NAME,
                    field: "label",
                    available: raw_keys,
                });
            }
            label
        };

        Ok(PropertyPlan { date, label })
    }

    fn location(feature: &Feature) -> Result<(f64, f64), String> {
        let geometry = feature
            .geometry
            .as_ref()
            .ok_or_else(|| "feature has no geometry".to_string())?;

        match &geometry.value {
            GeometryValue::Point(position) => match position.as_slice() {
                [lon, lat, ..] => Ok((*lat, *lon)),
                _ => Err("point position has fewer than two coordinates".to_string()),
            },
            GeometryValue::Polygon(rings) => {
                let exterior: Vec<&Vec<Vec<f64>>> = rings.first().into_iter().collect();
                polygon_centroid(&exterior).ok_or_else(|| "polygon has no vertices".to_string())
            }
            GeometryValue::MultiPolygon(polygons) => {
                let exterior: Vec<&Vec<Vec<f64>>> =
                    polygons.iter().filter_map(|rings| rings.first()).collect();
                polygon_centroid(&exterior)
                    .ok_or_else(|| "multipolygon has no vertices".to_string())
            }
            _ => Err("unsupported geometry; expected Point, Polygon or MultiPolygon".to_string()),
        }
    }

    fn property_text(properties: Option<&JsonObject>, key: &str) -> String {
        match properties.and_then(|props| props.get(key)) {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Number(number)) => number.to_string(),
            Some(Value::Bool(flag)) => flag.to_string(),
            _ => String::new(),
        }
    }

    fn extract_feature(
        plan: &PropertyPlan,
        feature: &Feature,
        row: usize,
        options: &ReadOptions,
    ) -> Result<SourceRow, String> {
        let (latitude, longitude) = Self::location(feature)?;
        let properties = feature.properties.as_ref();

        let observation_date = match (&plan.date, options.default_date) {
            (Some(key), _) => parse_date(
                &Self::property_text(properties, key),
                options.date_format.as_deref(),
            )?,
            (None, Some(default)) => default,
            (None, None) => return Err("missing observation date".to_string()),
        };

        let label = match &plan.label {
            Some(key) => parse_label(&Self::property_text(properties, key), options)?,
            None => PointLabel::Unlabeled,
        };

        Ok(SourceRow {
            row,
            latitude,
            longitude,
            observation_date,
            label,
        })
    }
}

impl PointReader for GeoJsonReader {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::GeoJson
    }

    fn read(&self, content: &str, options: &ReadOptions) -> Result<ParsedSource, ReaderError> {
        let document: GeoJson = content
            .trim_start_matches('\u{feff}')
            .parse()
            .map_err(|err: geojson::Error| ReaderError::FormatMismatch {
                reader: Self::NAME,
                reason: err.to_string(),
            })?;

        let features = Self::features(document)?;
        if features.is_empty() {
            return Err(ReaderError::EmptyData { reader: Self::NAME });
        }

        let plan = Self::plan(&features, options)?;

        let mut rows = Vec::new();
        let mut issues = Vec::new();
        for (index, feature) in features.iter().enumerate() {
            let row = index + 1;
            match Self::extract_feature(&plan, feature, row, options) {
                Ok(parsed) => rows.push(parsed),
                Err(message) => issues.push(RowIssue::new(row, message)),
            }
        }

        Ok(ParsedSource {
            reader: Self::NAME,
            format: SourceFormat::GeoJson,
            rows,
            issues,
        })
    }
}

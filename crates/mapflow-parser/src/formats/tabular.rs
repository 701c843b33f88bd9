use csv::{ReaderBuilder, StringRecord, Trim};

use crate::errors::ReaderError;
use crate::model::{PointLabel, ParsedSource, ReadOptions, RowIssue, SourceFormat, SourceRow};
use crate::registry::PointReader;

use super::{
    normalize_header, parse_coordinate, parse_date, parse_label, parse_wkt_point, resolve_field,
    Axis, DATE_ALIASES, GEOMETRY_ALIASES, LABEL_ALIASES, LATITUDE_ALIASES, LONGITUDE_ALIASES,
};

/// Delimited text with one point per row and a header line.
pub struct TabularReader {
    name: &'static str,
    format: SourceFormat,
    delimiter: u8,
}

#[derive(Debug, Clone, Copy)]
enum CoordinateColumns {
    Pair { latitude: usize, longitude: usize },
    Geometry(usize),
}

#[derive(Debug, Clone, Copy)]
struct ColumnPlan {
    coordinates: CoordinateColumns,
    date: Option<usize>,
    label: Option<usize>,
}

impl TabularReader {
    pub const fn csv() -> Self {
        Self {
            name: "tabular_csv",
            format: SourceFormat::Csv,
            delimiter: b',',
        }
    }

    pub const fn tsv() -> Self {
        Self {
            name: "tabular_tsv",
            format: SourceFormat::Tsv,
            delimiter: b'\t',
        }
    }

    fn plan(&self, headers: &[String], options: &ReadOptions) -> Result<ColumnPlan, ReaderError> {
        let columns = &options.columns;
        let latitude = resolve_field(
            self.name,
            headers,
            "latitude",
            columns.latitude.as_deref(),
            LATITUDE_ALIASES,
        )?;
        let longitude = resolve_field(
            self.name,
            headers,
            "longitude",
            columns.longitude.as_deref(),
            LONGITUDE_ALIASES,
        )?;

        let coordinates = match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => CoordinateColumns::Pair {
                latitude,
                longitude,
            },
            _ => {
                let geometry = resolve_field(
                    self.name,
                    headers,
                    "geometry",
                    columns.geometry.as_deref(),
                    GEOMETRY_ALIASES,
                )?;
                match geometry {
                    Some(index) => CoordinateColumns::Geometry(index),
                    None => {
                        return Err(ReaderError::MissingField {
                            reader: self.name,
                            field: "coordinates",
                            available: headers.to_vec(),
                        })
                    }
                }
            }
        };

        let date = resolve_field(
            self.name,
            headers,
            "date",
            columns.date.as_deref(),
            DATE_ALIASES,
        )?;
        if date.is_none() && options.default_date.is_none() {
            return Err(ReaderError::MissingField {
                reader: self.name,
                field: "date",
                available: headers.to_vec(),
            });
        }

        let label = if options.unlabeled {
            None
        } else {
            let label = resolve_field(
                self.name,
                headers,
                "label",
                columns.label.as_deref(),
                LABEL_ALIASES,
            )?;
            if label.is_none() {
                return Err(ReaderError::MissingField {
                    reader: self.name,
                    field: "label",
                    available: headers.to_vec(),
                });
            }
            label
        };

        Ok(ColumnPlan {
            coordinates,
            date,
            label,
        })
    }

    fn extract_row(
        plan: &ColumnPlan,
        record: &StringRecord,
        row: usize,
        options: &ReadOptions,
    ) -> Result<SourceRow, String> {
        let field = |index: usize| record.get(index).unwrap_or("");

        let (latitude, longitude) = match plan.coordinates {
            CoordinateColumns::Pair {
                latitude,
                longitude,
            } => (
                parse_coordinate(field(latitude), Axis::Latitude)?,
                parse_coordinate(field(longitude), Axis::Longitude)?,
            ),
            CoordinateColumns::Geometry(index) => parse_wkt_point(field(index))?,
        };

        let observation_date = match (plan.date, options.default_date) {
            (Some(index), _) => parse_date(field(index), options.date_format.as_deref())?,
            (None, Some(default)) => default,
            (None, None) => return Err("missing observation date".to_string()),
        };

        let label = match plan.label {
            Some(index) => parse_label(field(index), options)?,
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

impl PointReader for TabularReader {
    fn name(&self) -> &'static str {
        self.name
    }

    fn format(&self) -> SourceFormat {
        self.format
    }

    fn read(&self, content: &str, options: &ReadOptions) -> Result<ParsedSource, ReaderError> {
        let content = content.trim_start_matches('\u{feff}');
        let leading = content.trim_start();
        if leading.starts_with('{') || leading.starts_with('[') {
            return Err(ReaderError::FormatMismatch {
                reader: self.name,
                reason: "content looks like JSON".to_string(),
            });
        }

        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(content.as_bytes());

        let raw_headers = reader
            .headers()
            .map_err(|source| ReaderError::Csv {
                reader: self.name,
                source,
            })?
            .clone();

        if raw_headers.len() < 2 {
            return Err(ReaderError::FormatMismatch {
                reader: self.name,
                reason: format!(
                    "header is not delimited by '{}'",
                    (self.delimiter as char).escape_default()
                ),
            });
        }

        let headers: Vec<String> = raw_headers.iter().map(normalize_header).collect();
        let plan = self.plan(&headers, options)?;

        let mut rows = Vec::new();
        let mut issues = Vec::new();

        for (index, record) in reader.records().enumerate() {
            let row = index + 1;
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    issues.push(RowIssue::new(row, err.to_string()));
                    continue;
                }
            };
            if record.iter().all(|value| value.is_empty()) {
                continue;
            }

            match Self::extract_row(&plan, &record, row, options) {
                Ok(parsed) => rows.push(parsed),
                Err(message) => issues.push(RowIssue::new(row, message)),
            }
        }

        if rows.is_empty() && issues.is_empty() {
            return Err(ReaderError::EmptyData { reader: self.name });
        }

        Ok(ParsedSource {
            reader: self.name,
            format: self.format,
            rows,
            issues,
        })
    }
}

mod common;
mod tabular;
mod vector;

pub use tabular::TabularReader;
pub use vector::GeoJsonReader;

pub(crate) use common::{
    normalize_header, parse_coordinate, parse_date, parse_label, parse_wkt_point, polygon_centroid,
    resolve_field, Axis, DATE_ALIASES, GEOMETRY_ALIASES, LABEL_ALIASES, LATITUDE_ALIASES,
    LONGITUDE_ALIASES,
};

//! Vector features and the GeoJSON loader used for management zones.

use std::{collections::BTreeMap, fs, io, path::Path};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("failed to read vector file {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("vector file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid GeoJSON: {0}")]
    Format(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub const fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn point(x: f64, y: f64) -> Self {
        Self::new(x, y, x, y)
    }

    pub fn of_points(points: &[(f64, f64)]) -> Option<Self> {
        let (&(x, y), rest) = points.split_first()?;
        Some(rest.iter().fold(Self::point(x, y), |bbox, &(x, y)| {
            bbox.union(&Self::point(x, y))
        }))
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// Euclidean distance from a point to the box, zero inside.
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        let dx = (self.min_x - x).max(0.0).max(x - self.max_x);
        let dy = (self.min_y - y).max(0.0).max(y - self.max_y);
        dx.hypot(dy)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub exterior: Vec<(f64, f64)>,
    pub holes: Vec<Vec<(f64, f64)>>,
}

impl Polygon {
    pub fn new(exterior: Vec<(f64, f64)>) -> Self {
        Self {
            exterior,
            holes: Vec::new(),
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        ring_contains(&self.exterior, x, y) && !self.holes.iter().any(|hole| ring_contains(hole, x, y))
    }
}

/// Even-odd ray cast. Points exactly on an edge may fall either side.
fn ring_contains(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point { x: f64, y: f64 },
    Polygon(Polygon),
    MultiPolygon(Vec<Polygon>),
}

impl Geometry {
    pub fn bbox(&self) -> BoundingBox {
        match self {
            Geometry::Point { x, y } => BoundingBox::point(*x, *y),
            Geometry::Polygon(polygon) => ring_bbox(&polygon.exterior),
            Geometry::MultiPolygon(polygons) => polygons
                .iter()
                .map(|polygon| ring_bbox(&polygon.exterior))
                .reduce(|a, b| a.union(&b))
                .unwrap_or(BoundingBox::point(f64::NAN, f64::NAN)),
        }
    }

    /// Areal containment; points contain only coordinates within `tolerance`.
    pub fn contains(&self, x: f64, y: f64, tolerance: f64) -> bool {
        match self {
            Geometry::Point { x: px, y: py } => (px - x).hypot(py - y) <= tolerance,
            Geometry::Polygon(polygon) => polygon.contains(x, y),
            Geometry::MultiPolygon(polygons) => polygons.iter().any(|polygon| polygon.contains(x, y)),
        }
    }

    pub fn is_point(&self) -> bool {
        matches!(self, Geometry::Point { .. })
    }
}

fn ring_bbox(ring: &[(f64, f64)]) -> BoundingBox {
    BoundingBox::of_points(ring).unwrap_or(BoundingBox::point(f64::NAN, f64::NAN))
}

/// A loaded feature. `id` comes from the GeoJSON `id` member when it is an
/// integer, otherwise from the feature's position in the collection.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorFeature {
    pub id: u64,
    pub geometry: Geometry,
    pub attributes: BTreeMap<String, Value>,
}

impl VectorFeature {
    pub fn new(id: u64, geometry: Geometry) -> Self {
        Self {
            id,
            geometry,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

pub fn load_geojson(path: impl AsRef<Path>) -> Result<Vec<VectorFeature>, VectorError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| VectorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let features = parse_geojson(&text)?;
    tracing::debug!(
        target: "forage::vector",
        path = %path.display(),
        features = features.len(),
        "vector.loaded"
    );
    Ok(features)
}

pub fn parse_geojson(text: &str) -> Result<Vec<VectorFeature>, VectorError> {
    let root: Value = serde_json::from_str(text)?;
    let kind = root.get("type").and_then(Value::as_str);
    let features = match kind {
        Some("FeatureCollection") => root
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| VectorError::Format("FeatureCollection without features".into()))?
            .iter()
            .collect::<Vec<_>>(),
        Some("Feature") => vec![&root],
        other => {
            return Err(VectorError::Format(format!(
                "expected a Feature or FeatureCollection, got {other:?}"
            )))
        }
    };

    features
        .into_iter()
        .enumerate()
        .map(|(position, feature)| parse_feature(position as u64, feature))
        .collect()
}

fn parse_feature(position: u64, feature: &Value) -> Result<VectorFeature, VectorError> {
    let id = feature.get("id").and_then(Value::as_u64).unwrap_or(position);
    let geometry = feature
        .get("geometry")
        .ok_or_else(|| VectorError::Format(format!("feature {id} has no geometry")))?;
    let geometry = parse_geometry(geometry)
        .map_err(|reason| VectorError::Format(format!("feature {id}: {reason}")))?;
    let attributes = match feature.get("properties") {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Some(Value::Null) | None => BTreeMap::new(),
        Some(_) => {
            return Err(VectorError::Format(format!(
                "feature {id} properties must be an object"
            )))
        }
    };
    Ok(VectorFeature {
        id,
        geometry,
        attributes,
    })
}

fn parse_geometry(value: &Value) -> Result<Geometry, String> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or("geometry has no type")?;
    let coordinates = value.get("coordinates").ok_or("geometry has no coordinates")?;
    match kind {
        "Point" => {
            let (x, y) = parse_position(coordinates)?;
            Ok(Geometry::Point { x, y })
        }
        "Polygon" => Ok(Geometry::Polygon(parse_polygon(coordinates)?)),
        "MultiPolygon" => coordinates
            .as_array()
            .ok_or("MultiPolygon coordinates must be an array")?
            .iter()
            .map(parse_polygon)
            .collect::<Result<Vec<_>, _>>()
            .map(Geometry::MultiPolygon),
        other => Err(format!("unsupported geometry type {other}")),
    }
}

fn parse_polygon(value: &Value) -> Result<Polygon, String> {
    let rings = value
        .as_array()
        .ok_or("polygon coordinates must be an array of rings")?
        .iter()
        .map(parse_ring)
        .collect::<Result<Vec<_>, _>>()?;
    let mut rings = rings.into_iter();
    let exterior = rings.next().ok_or("polygon has no exterior ring")?;
    Ok(Polygon {
        exterior,
        holes: rings.collect(),
    })
}

fn parse_ring(value: &Value) -> Result<Vec<(f64, f64)>, String> {
    let ring = value
        .as_array()
        .ok_or("ring must be an array of positions")?
        .iter()
        .map(parse_position)
        .collect::<Result<Vec<_>, _>>()?;
    if ring.len() < 4 {
        return Err(format!("ring needs at least 4 positions, got {}", ring.len()));
    }
    Ok(ring)
}

fn parse_position(value: &Value) -> Result<(f64, f64), String> {
    match value.as_array().map(Vec::as_slice) {
        Some([x, y, ..]) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Ok((x, y)),
            _ => Err("position must hold finite numbers".to_string()),
        },
        _ => Err("position must have at least two coordinates".to_string()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn square(id: u64, min_x: f64, min_y: f64, size: f64) -> VectorFeature {
        VectorFeature::new(
            id,
            Geometry::Polygon(Polygon::new(vec![
                (min_x, min_y),
                (min_x + size, min_y),
                (min_x + size, min_y + size),
                (min_x, min_y + size),
                (min_x, min_y),
            ])),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polygon_hole_excludes_points() {
        let polygon = Polygon {
            exterior: vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)],
            holes: vec![vec![(4.0, 4.0), (6.0, 4.0), (6.0, 6.0), (4.0, 6.0), (4.0, 4.0)]],
        };
        assert!(polygon.contains(1.0, 1.0));
        assert!(!polygon.contains(5.0, 5.0));
        assert!(!polygon.contains(11.0, 5.0));
    }

    #[test]
    fn parses_feature_collection() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "id": 7,
                 "properties": {"policy": "continuous", "animal_units_per_ha": 0.5},
                 "geometry": {"type": "Polygon",
                              "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
                {"type": "Feature", "properties": null,
                 "geometry": {"type": "Point", "coordinates": [2.5, 3.5]}}
            ]
        }"#;
        let features = parse_geojson(text).expect("parse");
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].id, 7);
        assert_eq!(features[0].attributes["policy"], Value::from("continuous"));
        assert_eq!(features[1].id, 1);
        assert_eq!(features[1].geometry, Geometry::Point { x: 2.5, y: 3.5 });
    }

    #[test]
    fn rejects_unknown_geometry() {
        let text = r#"{"type": "Feature", "properties": {},
            "geometry": {"type": "LineString", "coordinates": [[0,0],[1,1]]}}"#;
        let err = parse_geojson(text).expect_err("line strings are unsupported");
        assert!(err.to_string().contains("LineString"), "{err}");
    }
}

//! Raster and vector inputs.
//!
//! Point sources: ESRI ASCII grids (`.asc`), whitespace/comma XYZ text
//! (`.xyz`, `.txt`, `.csv`) and VTXC chunk files (`.vtxc`).
//! Vector sources: GeoJSON FeatureCollections of Polygon/MultiPolygon.

use crate::error::{PipelineError, Result};
use geocull::{AttrFilter, Coord, Point, Polygon, Ring};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Points read from a raster-like source.
#[derive(Debug, Clone, PartialEq)]
pub struct PointSource {
    pub points: Vec<Point>,
    pub has_z: bool,
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn load_points(path: &Path) -> Result<PointSource> {
    let src = match extension(path).as_str() {
        "asc" => read_ascii_grid(path)?,
        "xyz" | "txt" | "csv" => read_xyz(path)?,
        "vtxc" => {
            let chunk = vtxc::read_file(path)
                .map_err(|e| PipelineError::source_error(path.display(), e.to_string()))?;
            let points = chunk
                .vertices
                .iter()
                .map(|v| {
                    let p = Point::new(v.x, v.y, v.value);
                    if chunk.has_z {
                        p.with_z(v.z)
                    } else {
                        p
                    }
                })
                .collect();
            PointSource {
                points,
                has_z: chunk.has_z,
            }
        }
        other => {
            return Err(PipelineError::source_error(
                path.display(),
                format!("unsupported point source extension '{other}'"),
            ))
        }
    };

    tracing::info!(path = %path.display(), points = src.points.len(), has_z = src.has_z, "Loaded point source");
    Ok(src)
}

const MAX_GRID_PREALLOC: usize = 1 << 20;

/// ESRI ASCII grid flattened to cell-centre points. NODATA and NaN cells are dropped.
pub fn read_ascii_grid(path: &Path) -> Result<PointSource> {
    let err = |msg: String| PipelineError::source_error(path.display(), msg);
    let text = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
    parse_ascii_grid(&text).map_err(err)
}

fn parse_ascii_grid(text: &str) -> std::result::Result<PointSource, String> {
    let mut tokens = text.split_ascii_whitespace().peekable();
    let mut header: BTreeMap<String, f64> = BTreeMap::new();

    // Header lines are `key value` pairs; the first numeric token starts the body.
    while let Some(tok) = tokens.peek() {
        if tok.parse::<f64>().is_ok() {
            break;
        }
        let key = tok.to_ascii_lowercase();
        tokens.next();
        let value = tokens
            .next()
            .ok_or_else(|| format!("header '{key}' has no value"))?
            .parse::<f64>()
            .map_err(|e| format!("header '{key}': {e}"))?;
        header.insert(key, value);
    }

    let get = |k: &str| header.get(k).copied();
    let dimension = |k: &str| -> std::result::Result<usize, String> {
        let v = get(k).ok_or_else(|| format!("missing {k}"))?;
        if !(v >= 1.0 && v <= u32::MAX as f64 && v.fract() == 0.0) {
            return Err(format!("{k} must be a positive integer, got {v}"));
        }
        Ok(v as usize)
    };
    let ncols = dimension("ncols")?;
    let nrows = dimension("nrows")?;
    let cells = ncols
        .checked_mul(nrows)
        .ok_or_else(|| format!("{nrows}x{ncols} cells overflow"))?;
    let cell = get("cellsize").ok_or("missing cellsize")?;
    if cell.is_nan() || cell <= 0.0 {
        return Err(format!("cellsize must be positive, got {cell}"));
    }

    // Corner registration is offset half a cell from centre registration.
    let x0 = match (get("xllcenter"), get("xllcorner")) {
        (Some(c), _) => c,
        (None, Some(c)) => c + 0.5 * cell,
        (None, None) => return Err("missing xllcorner/xllcenter".into()),
    };
    let y0 = match (get("yllcenter"), get("yllcorner")) {
        (Some(c), _) => c,
        (None, Some(c)) => c + 0.5 * cell,
        (None, None) => return Err("missing yllcorner/yllcenter".into()),
    };
    let nodata = get("nodata_value");

    // A header can claim far more cells than the body holds.
    let mut points = Vec::with_capacity(cells.min(MAX_GRID_PREALLOC));
    for row in 0..nrows {
        // Rows run north to south.
        let y = y0 + (nrows - 1 - row) as f64 * cell;
        for col in 0..ncols {
            let tok = tokens
                .next()
                .ok_or_else(|| format!("grid ends early at row {row}, col {col}"))?;
            let v: f64 = tok
                .parse()
                .map_err(|e| format!("cell ({row}, {col}) '{tok}': {e}"))?;
            if v.is_nan() || nodata == Some(v) {
                continue;
            }
            points.push(Point::new(x0 + col as f64 * cell, y, v));
        }
    }
    if tokens.next().is_some() {
        return Err(format!("more than {nrows}x{ncols} cells"));
    }

    Ok(PointSource {
        points,
        has_z: false,
    })
}

/// `x y value` or `x y z value` per line. `#` comments and a leading header line are skipped.
pub fn read_xyz(path: &Path) -> Result<PointSource> {
    let err = |msg: String| PipelineError::source_error(path.display(), msg);
    let file = File::open(path).map_err(|e| err(e.to_string()))?;

    let mut points = Vec::new();
    let mut columns: Option<usize> = None;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| err(e.to_string()))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: std::result::Result<Vec<f64>, _> = line
            .split(|c: char| c == ',' || c.is_ascii_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::parse::<f64>)
            .collect();
        let fields = match fields {
            Ok(f) => f,
            Err(_) if columns.is_none() && points.is_empty() => continue,
            Err(e) => return Err(err(format!("line {}: {e}", lineno + 1))),
        };

        let n = *columns.get_or_insert(fields.len());
        if fields.len() != n || !(n == 3 || n == 4) {
            return Err(err(format!(
                "line {}: expected 3 or 4 columns consistently, got {}",
                lineno + 1,
                fields.len()
            )));
        }

        let p = if n == 4 {
            Point::new(fields[0], fields[1], fields[3]).with_z(fields[2])
        } else {
            Point::new(fields[0], fields[1], fields[2])
        };
        if p.is_finite() && !p.value.is_nan() {
            points.push(p);
        }
    }

    Ok(PointSource {
        points,
        has_z: columns == Some(4),
    })
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    geometry: Option<Geometry>,
    #[serde(default)]
    properties: Option<serde_json::Map<String, Value>>,
}

/// Positions may carry a third ordinate, which is ignored.
type Position = Vec<f64>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Geometry {
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    #[serde(other)]
    Unsupported,
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn ring_of(positions: &[Position]) -> Ring {
    Ring::new(
        positions
            .iter()
            .filter(|p| p.len() >= 2)
            .map(|p| -> Coord { [p[0], p[1]] })
            .collect(),
    )
}

fn polygon_of(id: String, source_index: usize, rings: &[Vec<Position>], attrs: &BTreeMap<String, String>) -> Option<Polygon> {
    let (outer, holes) = rings.split_first()?;
    let mut polygon = Polygon::new(id, source_index, ring_of(outer));
    polygon.holes = holes.iter().map(|h| ring_of(h)).collect();
    polygon.attributes = attrs.clone();
    Some(polygon)
}

/// Reads polygon records from a GeoJSON FeatureCollection.
///
/// The feature `id` (or `id_property`, or the feature index) names each
/// shape; MultiPolygon parts get a `#k` suffix and share the source index.
pub fn load_polygons(path: &Path, id_property: Option<&str>) -> Result<Vec<Polygon>> {
    let err = |msg: String| PipelineError::source_error(path.display(), msg);
    let file = File::open(path).map_err(|e| err(e.to_string()))?;
    let fc: FeatureCollection =
        serde_json::from_reader(BufReader::new(file)).map_err(|e| err(e.to_string()))?;
    let polygons = polygons_from(fc, id_property);

    tracing::info!(path = %path.display(), polygons = polygons.len(), "Loaded vector source");
    Ok(polygons)
}

fn polygons_from(fc: FeatureCollection, id_property: Option<&str>) -> Vec<Polygon> {
    let mut out = Vec::new();
    for (index, feature) in fc.features.into_iter().enumerate() {
        let attrs: BTreeMap<String, String> = feature
            .properties
            .iter()
            .flatten()
            .filter_map(|(k, v)| value_to_string(v).map(|s| (k.clone(), s)))
            .collect();

        let id = feature
            .id
            .as_ref()
            .and_then(value_to_string)
            .or_else(|| id_property.and_then(|p| attrs.get(p).cloned()))
            .unwrap_or_else(|| index.to_string());

        match feature.geometry {
            Some(Geometry::Polygon { coordinates }) => {
                out.extend(polygon_of(id, index, &coordinates, &attrs));
            }
            Some(Geometry::MultiPolygon { coordinates }) => {
                let many = coordinates.len() > 1;
                for (k, rings) in coordinates.iter().enumerate() {
                    let part_id = if many { format!("{id}#{k}") } else { id.clone() };
                    out.extend(polygon_of(part_id, index, rings, &attrs));
                }
            }
            Some(Geometry::Unsupported) | None => {
                tracing::debug!(feature = index, id = %id, "Skipping non-polygon feature");
            }
        }
    }
    out
}

pub fn apply_filter(polygons: Vec<Polygon>, filter: Option<&AttrFilter>) -> Vec<Polygon> {
    match filter {
        Some(f) => {
            let before = polygons.len();
            let kept: Vec<Polygon> = polygons.into_iter().filter(|p| f.matches(p)).collect();
            tracing::info!(key = %f.key, equals = %f.equals, before, kept = kept.len(), "Applied attribute filter");
            kept
        }
        None => polygons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn ascii_grid_drops_nodata_and_uses_cell_centres() {
        let text = "ncols 3\nnrows 2\nxllcorner 10.0\nyllcorner 20.0\ncellsize 2.0\nNODATA_value -9999\n\
                    1 -9999 3\n4 5 nan\n";
        let src = parse_ascii_grid(text).unwrap();
        let got: Vec<(f64, f64, f64)> = src.points.iter().map(|p| (p.x, p.y, p.value)).collect();
        assert_eq!(
            got,
            vec![(11.0, 23.0, 1.0), (15.0, 23.0, 3.0), (11.0, 21.0, 4.0), (13.0, 21.0, 5.0)]
        );
        assert!(!src.has_z);
    }

    #[test]
    fn ascii_grid_rejects_short_body() {
        let text = "ncols 2\nnrows 2\nxllcenter 0\nyllcenter 0\ncellsize 1\n1 2 3\n";
        assert!(parse_ascii_grid(text).unwrap_err().contains("ends early"));
    }

    #[test]
    fn ascii_grid_rejects_bad_dimensions() {
        let grid = |ncols: &str, nrows: &str| {
            format!("ncols {ncols}\nnrows {nrows}\nxllcenter 0\nyllcenter 0\ncellsize 1\n1 2\n")
        };
        assert!(parse_ascii_grid(&grid("2.5", "1")).unwrap_err().contains("ncols"));
        assert!(parse_ascii_grid(&grid("2", "-1")).unwrap_err().contains("nrows"));
        assert!(parse_ascii_grid(&grid("1e30", "1")).unwrap_err().contains("ncols"));

        // A huge claimed size fails on the short body instead of allocating it.
        let huge = grid("4000000000", "4000000000");
        let err = parse_ascii_grid(&huge).unwrap_err();
        assert!(err.contains("ends early") || err.contains("overflow"), "{err}");
    }

    #[test]
    fn xyz_with_header_and_z() {
        let mut f = tempfile::Builder::new().suffix(".xyz").tempfile().unwrap();
        writeln!(f, "x,y,z,value\n# comment\n1,2,-5,0.5\n3 4 -6 0.25\n").unwrap();

        let src = load_points(f.path()).unwrap();
        assert!(src.has_z);
        assert_eq!(src.points.len(), 2);
        assert_eq!(src.points[1].z, Some(-6.0));
        assert_eq!(src.points[1].value, 0.25);
    }

    #[test]
    fn xyz_rejects_ragged_rows() {
        let mut f = tempfile::Builder::new().suffix(".xyz").tempfile().unwrap();
        writeln!(f, "1 2 3\n1 2 3 4").unwrap();
        assert!(load_points(f.path()).is_err());
    }

    #[test]
    fn geojson_polygons_multipolygons_and_ids() {
        let json = r#"{
            "type": "FeatureCollection",
            "features": [
                { "type": "Feature", "id": 17,
                  "properties": { "LAND": "n", "AREA": 2.5 },
                  "geometry": { "type": "Polygon", "coordinates": [
                      [[0,0],[4,0],[4,4],[0,4],[0,0]],
                      [[1,1],[1,2],[2,2],[2,1],[1,1]] ] } },
                { "type": "Feature",
                  "properties": { "OSI_OBJ": "zone-a", "LAND": "y" },
                  "geometry": { "type": "MultiPolygon", "coordinates": [
                      [[[10,10,0],[11,10,0],[11,11,0],[10,10,0]]],
                      [[[20,20],[21,20],[21,21],[20,20]]] ] } },
                { "type": "Feature", "properties": null,
                  "geometry": { "type": "LineString", "coordinates": [[0,0],[1,1]] } },
                { "type": "Feature", "properties": {}, "geometry": null }
            ]
        }"#;
        let fc: FeatureCollection = serde_json::from_str(json).unwrap();
        let polys = polygons_from(fc, Some("OSI_OBJ"));

        assert_eq!(polys.len(), 3);
        assert_eq!(polys[0].id, "17");
        assert_eq!(polys[0].holes.len(), 1);
        assert_eq!(polys[0].attribute("AREA"), Some("2.5"));
        assert_eq!(polys[1].id, "zone-a#0");
        assert_eq!(polys[2].id, "zone-a#1");
        assert_eq!((polys[1].source_index, polys[2].source_index), (1, 1));
        assert_eq!(polys[1].outer.len(), 3);

        let water = apply_filter(polys, Some(&AttrFilter::new("LAND", "n")));
        assert_eq!(water.len(), 1);
    }
}

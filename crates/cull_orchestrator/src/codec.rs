//! Payload conversions between geometry types and stored bytes.

use crate::error::{PipelineError, Result};
use geocull::{ConvexHull, Point, Polygon};
use vtxc::{BodyEncoding, Vertex, VertexChunk};

/// Decoded chunk payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PointChunk {
    pub sequence: u32,
    pub has_z: bool,
    pub points: Vec<Point>,
}

impl PointChunk {
    pub fn new(sequence: u32, has_z: bool, points: Vec<Point>) -> Self {
        Self {
            sequence,
            has_z,
            points,
        }
    }
}

fn to_vertex(p: &Point) -> Vertex {
    Vertex {
        x: p.x,
        y: p.y,
        z: p.z.unwrap_or(f64::NAN),
        value: p.value,
    }
}

fn to_point(v: &Vertex, has_z: bool) -> Point {
    let p = Point::new(v.x, v.y, v.value);
    if has_z {
        p.with_z(v.z)
    } else {
        p
    }
}

pub fn to_vertex_chunk(chunk: &PointChunk) -> VertexChunk {
    VertexChunk {
        sequence: chunk.sequence,
        has_z: chunk.has_z,
        vertices: chunk.points.iter().map(to_vertex).collect(),
    }
}

/// Encodes `chunk` and checks it against `budget`.
///
/// A deflated body that would come out larger than the raw one is stored raw.
pub fn encode_chunk(key: &str, chunk: &PointChunk, encoding: BodyEncoding, budget: usize) -> Result<Vec<u8>> {
    let vc = to_vertex_chunk(chunk);
    let codec_err = |source| PipelineError::Codec {
        key: key.to_string(),
        source,
    };

    let raw = vtxc::encode(&vc, BodyEncoding::Raw).map_err(codec_err)?;
    let bytes = match encoding {
        BodyEncoding::Raw => raw,
        BodyEncoding::Deflate => {
            let packed = vtxc::encode(&vc, BodyEncoding::Deflate).map_err(codec_err)?;
            if packed.len() < raw.len() {
                packed
            } else {
                raw
            }
        }
    };

    if bytes.len() > budget {
        return Err(PipelineError::ChunkTooLarge {
            key: key.to_string(),
            size: bytes.len(),
            budget,
        });
    }
    Ok(bytes)
}

pub fn decode_chunk(key: &str, bytes: &[u8]) -> Result<PointChunk> {
    let vc = vtxc::parse_vtxc_bytes(bytes).map_err(|source| PipelineError::Codec {
        key: key.to_string(),
        source,
    })?;
    let points = vc.vertices.iter().map(|v| to_point(v, vc.has_z)).collect();
    Ok(PointChunk::new(vc.sequence, vc.has_z, points))
}

pub fn encode_hulls(hulls: &[ConvexHull]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(hulls)?)
}

pub fn decode_hulls(bytes: &[u8]) -> Result<Vec<ConvexHull>> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_shapes(shapes: &[Polygon]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(shapes)?)
}

pub fn decode_shapes(bytes: &[u8]) -> Result<Vec<Polygon>> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geocull::Ring;

    #[test]
    fn points_survive_storage() {
        let chunk = PointChunk::new(
            4,
            true,
            vec![
                Point::new(-70.1, 43.2, 0.8).with_z(-12.0),
                Point::new(-70.3, 43.9, 0.1).with_z(-40.5),
            ],
        );
        let bytes = encode_chunk("ds/raw-4", &chunk, BodyEncoding::Deflate, 1 << 20).unwrap();
        assert_eq!(decode_chunk("ds/raw-4", &bytes).unwrap(), chunk);
    }

    #[test]
    fn budget_is_enforced_at_write() {
        let chunk = PointChunk::new(0, false, vec![Point::new(0.0, 0.0, 0.0); 10]);
        let budget = vtxc::encoded_len(9, false);
        assert!(matches!(
            encode_chunk("ds/raw-0", &chunk, BodyEncoding::Raw, budget),
            Err(PipelineError::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn corrupt_payload_names_its_key() {
        let err = decode_chunk("ds/hull-3", b"nope").unwrap_err();
        assert!(err.to_string().contains("ds/hull-3"));
    }

    #[test]
    fn shapes_keep_attributes() {
        let shapes = vec![Polygon::new(
            "f1",
            7,
            Ring::new(vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]),
        )
        .with_attribute("LAND", "n")];
        let back = decode_shapes(&encode_shapes(&shapes).unwrap()).unwrap();
        assert_eq!(back, shapes);
    }
}

//! VTXC: dependency-light vertex-array chunk format.
//!
//! - Stores a bounded batch of sample points as f64 records.
//! - Each record is `x, y, [z], value`; z is present for the whole chunk or not at all.
//! - Carries the chunk's part index so a chunk can be placed without its key.
//! - Optional deflate compression of the record body.
//!
//! Layout (little-endian):
//!   00  : [u8;4]  magic = b"VTXC"
//!   04  : u32     version = 1
//!   08  : u32     flags (bitfield)
//!                 bit 0 => z present
//!                 bit 1 => body is deflate-compressed
//!   0C  : u32     sequence (part index)
//!   10  : u32     points_count
//!   14  : u32     body_len (bytes as stored)
//!   18  : body    points_count records of f64 x, f64 y, [f64 z], f64 value
//!
//! Encoding is deterministic: the same chunk always yields the same bytes.

use std::io::{self, ErrorKind};
use std::path::Path;

pub const VTXC_MAGIC: [u8; 4] = *b"VTXC";
pub const VTXC_VERSION: u32 = 1;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 24;

const FLAG_Z: u32 = 1 << 0;
const FLAG_DEFLATE: u32 = 1 << 1;
const KNOWN_FLAGS: u32 = FLAG_Z | FLAG_DEFLATE;

/// Deflate level used for compressed bodies (miniz scale, 0-10).
const DEFLATE_LEVEL: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BodyEncoding {
    Raw = 0,
    Deflate = 1,
}

/// One stored sample. `z` is ignored when the owning chunk has no z.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexChunk {
    pub sequence: u32,
    pub has_z: bool,
    pub vertices: Vec<Vertex>,
}

impl VertexChunk {
    /// Size this chunk occupies when written with [`BodyEncoding::Raw`].
    #[inline]
    pub fn raw_len(&self) -> usize {
        encoded_len(self.vertices.len(), self.has_z)
    }
}

/// Bytes per record.
#[inline]
pub const fn record_len(has_z: bool) -> usize {
    if has_z {
        32
    } else {
        24
    }
}

/// Uncompressed size of a chunk holding `count` records.
#[inline]
pub const fn encoded_len(count: usize, has_z: bool) -> usize {
    HEADER_LEN + count * record_len(has_z)
}

/// Largest record count whose uncompressed encoding fits `budget` bytes.
/// Always at least one, so a tiny budget still makes progress.
#[inline]
pub fn points_for_budget(budget: usize, has_z: bool) -> usize {
    (budget.saturating_sub(HEADER_LEN) / record_len(has_z)).max(1)
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated VTXC"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u32(buf: &mut &[u8]) -> io::Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

/// Parse VTXC from a contiguous byte slice. This is the single source of truth for parsing.
pub fn parse_vtxc_bytes(mut p: &[u8]) -> io::Result<VertexChunk> {
    if take(&mut p, 4)? != b"VTXC" {
        return Err(bad("bad VTXC magic"));
    }

    let version = le_u32(&mut p)?;
    if version != VTXC_VERSION {
        return Err(bad("unsupported VTXC version"));
    }

    let flags = le_u32(&mut p)?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(bad("unknown VTXC flags"));
    }
    let has_z = (flags & FLAG_Z) != 0;
    let deflated = (flags & FLAG_DEFLATE) != 0;

    let sequence = le_u32(&mut p)?;
    let count = le_u32(&mut p)? as usize;
    let body_len = le_u32(&mut p)? as usize;

    let want = count
        .checked_mul(record_len(has_z))
        .ok_or_else(|| bad("points size overflow"))?;

    let stored = take(&mut p, body_len)?;
    if !p.is_empty() {
        return Err(bad("trailing bytes after VTXC body"));
    }

    let inflated;
    let body: &[u8] = if deflated {
        inflated = miniz_oxide::inflate::decompress_to_vec_with_limit(stored, want.max(1))
            .map_err(|_| bad("corrupt deflate body"))?;
        &inflated
    } else {
        stored
    };

    if body.len() != want {
        return Err(bad("body length does not match points_count"));
    }

    let values = decode_f64s(body);
    let stride = record_len(has_z) / 8;
    let vertices = values
        .chunks_exact(stride)
        .map(|r| {
            if has_z {
                Vertex { x: r[0], y: r[1], z: r[2], value: r[3] }
            } else {
                Vertex { x: r[0], y: r[1], z: f64::NAN, value: r[2] }
            }
        })
        .collect();

    Ok(VertexChunk {
        sequence,
        has_z,
        vertices,
    })
}

fn decode_f64s(body: &[u8]) -> Vec<f64> {
    #[cfg(target_endian = "little")]
    {
        // Zero-copy view when the slice happens to be 8-aligned.
        if let Ok(as_f64) = bytemuck::try_cast_slice::<u8, f64>(body) {
            return as_f64.to_vec();
        }
    }

    body.chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

fn encode_f64s(values: &[f64]) -> Vec<u8> {
    #[cfg(target_endian = "little")]
    {
        bytemuck::cast_slice::<f64, u8>(values).to_vec()
    }

    #[cfg(not(target_endian = "little"))]
    {
        let mut out = Vec::with_capacity(values.len() * 8);
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// Serialize a chunk to bytes.
pub fn encode(chunk: &VertexChunk, encoding: BodyEncoding) -> io::Result<Vec<u8>> {
    let count = u32::try_from(chunk.vertices.len()).map_err(|_| bad("too many points"))?;

    let stride = record_len(chunk.has_z) / 8;
    let mut flat = Vec::<f64>::with_capacity(chunk.vertices.len() * stride);
    for v in &chunk.vertices {
        flat.push(v.x);
        flat.push(v.y);
        if chunk.has_z {
            flat.push(v.z);
        }
        flat.push(v.value);
    }

    let raw = encode_f64s(&flat);
    let body = match encoding {
        BodyEncoding::Raw => raw,
        BodyEncoding::Deflate => miniz_oxide::deflate::compress_to_vec(&raw, DEFLATE_LEVEL),
    };
    let body_len = u32::try_from(body.len()).map_err(|_| bad("body too large"))?;

    let mut flags = 0u32;
    if chunk.has_z {
        flags |= FLAG_Z;
    }
    if encoding == BodyEncoding::Deflate {
        flags |= FLAG_DEFLATE;
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&VTXC_MAGIC);
    out.extend_from_slice(&VTXC_VERSION.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&chunk.sequence.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(&body);

    Ok(out)
}

pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<VertexChunk> {
    let bytes = std::fs::read(path)?;
    parse_vtxc_bytes(&bytes)
}

pub fn write_file<P: AsRef<Path>>(
    path: P,
    chunk: &VertexChunk,
    encoding: BodyEncoding,
) -> io::Result<()> {
    let bytes = encode(chunk, encoding)?;
    std::fs::write(path, bytes)
}

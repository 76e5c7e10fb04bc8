//! Writing a stage's chunks out of the store.

use crate::codec::{self, PointChunk};
use crate::error::{PipelineError, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use vtxc::BodyEncoding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    /// One `.vtxc` file per chunk in a directory.
    Vtxc,
    /// A single whitespace-separated text file.
    Xyz,
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Writes `{dir}/{stage}-{sequence}.vtxc` for every chunk. Returns files written.
pub fn write_vtxc_dir(dir: &Path, stage: &str, chunks: &[PointChunk], encoding: BodyEncoding) -> Result<usize> {
    std::fs::create_dir_all(dir).map_err(io_err(dir))?;
    for chunk in chunks {
        let path = dir.join(format!("{stage}-{}.vtxc", chunk.sequence));
        vtxc::write_file(&path, &codec::to_vertex_chunk(chunk), encoding).map_err(io_err(&path))?;
    }
    Ok(chunks.len())
}

/// Writes `x y [z] value` lines in chunk order. Returns points written.
pub fn write_xyz(path: &Path, chunks: &[PointChunk]) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let mut out = BufWriter::new(File::create(path).map_err(io_err(path))?);

    let mut n = 0;
    for chunk in chunks {
        for p in &chunk.points {
            let line = match p.z {
                Some(z) if chunk.has_z => writeln!(out, "{} {} {} {}", p.x, p.y, z, p.value),
                _ => writeln!(out, "{} {} {}", p.x, p.y, p.value),
            };
            line.map_err(io_err(path))?;
            n += 1;
        }
    }
    out.flush().map_err(io_err(path))?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source;
    use geocull::Point;

    fn chunks() -> Vec<PointChunk> {
        vec![
            PointChunk::new(0, false, vec![Point::new(1.5, 2.0, 0.25)]),
            PointChunk::new(1, false, vec![Point::new(-3.0, 4.0, 1.0), Point::new(5.0, 6.0, 0.0)]),
        ]
    }

    #[test]
    fn xyz_export_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/final.xyz");
        assert_eq!(write_xyz(&path, &chunks()).unwrap(), 3);

        let back = source::read_xyz(&path).unwrap();
        let expected: Vec<Point> = chunks().into_iter().flat_map(|c| c.points).collect();
        assert_eq!(back.points, expected);
    }

    #[test]
    fn vtxc_export_writes_one_file_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(write_vtxc_dir(dir.path(), "final", &chunks(), BodyEncoding::Raw).unwrap(), 2);

        let second = vtxc::read_file(dir.path().join("final-1.vtxc")).unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(second.vertices.len(), 2);
    }
}

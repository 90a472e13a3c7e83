// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::Point3;
use ndarray::{Array1, Array2};

use crate::error::{RaytraceError, Result};
use crate::geometry::Float;
use crate::scheduler::{Receiver, Source};

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Read a 2-D .npy array as f64, promoting f32 if needed.
fn read_npy_2d(path: &Path) -> Result<Array2<f64>> {
    match ndarray_npy::read_npy::<_, Array2<f64>>(path) {
        Ok(a) => Ok(a),
        Err(_) => {
            let a32: Array2<f32> = ndarray_npy::read_npy(path)
                .map_err(|e| RaytraceError::UnsupportedDtype(format!("{}", e)))?;
            Ok(a32.mapv(|v| v as f64))
        }
    }
}

/// Load vertex positions from a .npy file of shape `N x 3`.
pub fn load_vertices(path: &Path) -> Result<Vec<Point3<Float>>> {
    let arr = read_npy_2d(path)?;
    if arr.ncols() != 3 {
        return Err(RaytraceError::WrongSize {
            what: "vertex array columns",
            expected: 3,
            got: arr.ncols(),
        });
    }
    Ok(arr
        .rows()
        .into_iter()
        .map(|r| Point3::new(r[0], r[1], r[2]))
        .collect())
}

/// Load the tetrahedron index array from a .npy file of shape `M x 4`
/// (32-bit integers).
pub fn load_tetrahedra(path: &Path) -> Result<Vec<[u32; 4]>> {
    let arr: Array2<i32> = ndarray_npy::read_npy(path)
        .map_err(|e| RaytraceError::UnsupportedDtype(format!("{}", e)))?;
    if arr.ncols() != 4 {
        return Err(RaytraceError::WrongSize {
            what: "tetrahedron array columns",
            expected: 4,
            got: arr.ncols(),
        });
    }
    let mut tets = Vec::with_capacity(arr.nrows());
    for row in arr.rows() {
        let mut tet = [0u32; 4];
        for (k, &v) in row.iter().enumerate() {
            if v < 0 {
                return Err(RaytraceError::InvalidMesh(format!(
                    "negative vertex index {} in tetrahedron array",
                    v
                )));
            }
            tet[k] = v as u32;
        }
        tets.push(tet);
    }
    Ok(tets)
}

/// Load a slowness field from a 1-D .npy file.
pub fn load_slowness(path: &Path) -> Result<Vec<Float>> {
    match ndarray_npy::read_npy::<_, Array1<f64>>(path) {
        Ok(a) => Ok(a.to_vec()),
        Err(_) => {
            let a32: Array1<f32> = ndarray_npy::read_npy(path)
                .map_err(|e| RaytraceError::UnsupportedDtype(format!("{}", e)))?;
            Ok(a32.iter().map(|&v| v as f64).collect())
        }
    }
}

/// Rows of a whitespace-separated text table, comments (#) and blank lines
/// skipped. All rows must have the same number of columns.
fn read_text_table(path: &Path) -> Result<Vec<Vec<f64>>> {
    let file = File::open(path)?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let row: std::result::Result<Vec<f64>, _> =
            trimmed.split_whitespace().map(|t| t.parse::<f64>()).collect();
        let row = row.map_err(|e| {
            RaytraceError::Other(format!("{}:{}: {}", path.display(), lineno + 1, e))
        })?;
        if let Some(first) = rows.first() {
            if row.len() != first.len() {
                return Err(RaytraceError::WrongSize {
                    what: "table row columns",
                    expected: first.len(),
                    got: row.len(),
                });
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

fn table_rows(path: &Path) -> Result<Vec<Vec<f64>>> {
    match extension(path).as_str() {
        "npy" => {
            let arr = read_npy_2d(path)?;
            Ok(arr.rows().into_iter().map(|r| r.to_vec()).collect())
        }
        "dat" | "txt" => read_text_table(path),
        other => Err(RaytraceError::UnsupportedFileFormat(other.to_string())),
    }
}

/// Load a source table from `.npy`, `.dat` or `.txt`.
///
/// Accepted shapes: 3 columns `(x, y, z)` with implicit origin time zero,
/// 4 columns `(t0, x, y, z)`, or 5 columns `(event_id, t0, x, y, z)`.
pub fn load_sources(path: &Path) -> Result<Vec<Source>> {
    let rows = table_rows(path)?;
    let mut sources = Vec::with_capacity(rows.len());
    for row in rows {
        let s = match row.len() {
            3 => Source::at(row[0], row[1], row[2]),
            4 => Source::with_t0(row[0], row[1], row[2], row[3]),
            5 => Source::with_t0(row[1], row[2], row[3], row[4]).event(row[0] as i64),
            got => {
                return Err(RaytraceError::WrongSize {
                    what: "source table columns",
                    expected: 4,
                    got,
                })
            }
        };
        sources.push(s);
    }
    Ok(sources)
}

/// Load a receiver table from `.npy`, `.dat` or `.txt`.
///
/// Accepted shapes: 3 columns `(x, y, z)` or 4 columns `(event_id, x, y, z)`.
pub fn load_receivers(path: &Path) -> Result<Vec<Receiver>> {
    let rows = table_rows(path)?;
    let mut receivers = Vec::with_capacity(rows.len());
    for row in rows {
        let r = match row.len() {
            3 => Receiver::at(row[0], row[1], row[2]),
            4 => Receiver::at(row[1], row[2], row[3]).event(row[0] as i64),
            got => {
                return Err(RaytraceError::WrongSize {
                    what: "receiver table columns",
                    expected: 3,
                    got,
                })
            }
        };
        receivers.push(r);
    }
    Ok(receivers)
}

/// Save traveltimes to `.npy` (1-D array) or `.dat` (one value per line).
pub fn save_traveltimes(path: &Path, traveltimes: &[Float]) -> Result<()> {
    match extension(path).as_str() {
        "npy" => {
            let arr = Array1::from_vec(traveltimes.to_vec());
            ndarray_npy::write_npy(path, &arr)
                .map_err(|e| RaytraceError::Other(format!("npy write error: {}", e)))?;
            Ok(())
        }
        "dat" | "txt" => {
            let mut out = BufWriter::new(File::create(path)?);
            for t in traveltimes {
                writeln!(out, "{:.12e}", t)?;
            }
            Ok(())
        }
        other => Err(RaytraceError::UnsupportedFileFormat(other.to_string())),
    }
}

/// Save raypaths as legacy ASCII VTK polydata (one polyline per non-empty
/// raypath).
pub fn save_raypaths(path: &Path, raypaths: &[Vec<Point3<Float>>]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    let n_points: usize = raypaths.iter().map(|p| p.len()).sum();
    let n_lines = raypaths.iter().filter(|p| !p.is_empty()).count();
    let line_size: usize = raypaths
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.len() + 1)
        .sum();

    writeln!(out, "# vtk DataFile Version 3.0")?;
    writeln!(out, "raypaths")?;
    writeln!(out, "ASCII")?;
    writeln!(out, "DATASET POLYDATA")?;
    writeln!(out, "POINTS {} double", n_points)?;
    for path in raypaths {
        for p in path {
            writeln!(out, "{:.12e} {:.12e} {:.12e}", p.x, p.y, p.z)?;
        }
    }
    writeln!(out, "LINES {} {}", n_lines, line_size)?;
    let mut offset = 0usize;
    for path in raypaths {
        if !path.is_empty() {
            write!(out, "{}", path.len())?;
            for k in 0..path.len() {
                write!(out, " {}", offset + k)?;
            }
            writeln!(out)?;
        }
        offset += path.len();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tetray-{}-{}", std::process::id(), name))
    }

    #[test]
    fn vertices_roundtrip_npy() {
        let path = temp_path("verts.npy");
        let arr =
            Array2::from_shape_vec((2, 3), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        ndarray_npy::write_npy(&path, &arr).unwrap();
        let pts = load_vertices(&path).unwrap();
        assert_eq!(pts.len(), 2);
        assert_eq!(pts[1], Point3::new(3.0, 4.0, 5.0));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn tetrahedra_reject_negative_index() {
        let path = temp_path("tets.npy");
        let arr = Array2::from_shape_vec((1, 4), vec![0i32, 1, 2, -1]).unwrap();
        ndarray_npy::write_npy(&path, &arr).unwrap();
        assert!(matches!(
            load_tetrahedra(&path),
            Err(RaytraceError::InvalidMesh(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn text_source_table_shapes() {
        let path = temp_path("src.dat");
        std::fs::write(&path, "# t0 x y z\n1.0 0.1 0.2 0.3\n2.0 0.4 0.5 0.6\n").unwrap();
        let sources = load_sources(&path).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].t0, 1.0);
        assert_eq!(sources[1].position, Point3::new(0.4, 0.5, 0.6));
        assert!(sources[0].event.is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn text_source_table_with_events() {
        let path = temp_path("srcev.dat");
        std::fs::write(&path, "3 0.0 0.1 0.2 0.3\n3 0.0 0.1 0.2 0.3\n").unwrap();
        let sources = load_sources(&path).unwrap();
        assert_eq!(sources[0].event, Some(3));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn ragged_text_table_rejected() {
        let path = temp_path("ragged.dat");
        std::fs::write(&path, "0.1 0.2 0.3\n0.1 0.2\n").unwrap();
        assert!(matches!(
            load_receivers(&path),
            Err(RaytraceError::WrongSize { .. })
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn unknown_extension_rejected() {
        let path = temp_path("table.csv");
        std::fs::write(&path, "0.1 0.2 0.3\n").unwrap();
        assert!(matches!(
            load_receivers(&path),
            Err(RaytraceError::UnsupportedFileFormat(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn raypaths_vtk_output() {
        let path = temp_path("rays.vtk");
        let rays = vec![
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)],
            vec![],
            vec![
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 1.0),
                Point3::new(1.0, 1.0, 1.0),
            ],
        ];
        save_raypaths(&path, &rays).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("POINTS 5 double"));
        assert!(text.contains("LINES 2 7"));
        assert!(text.contains("3 2 3 4"));
        std::fs::remove_file(&path).ok();
    }
}

//! Persistence of a finished intensity grid.
//!
//! TSV is the interchange format: one line per scan line, counts separated
//! by tabs, no header. PNG is for a quick look only.

use crate::error::ScanError;
use chrono::{DateTime, Utc};
use image::{ImageBuffer, Luma};
use log::info;
use ndarray::Array2;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Write `grid` row by row as tab-separated counts
pub fn write_tsv<W: Write>(grid: &Array2<u32>, writer: W) -> Result<(), ScanError> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(writer);

    for row in grid.rows() {
        wtr.write_record(row.iter().map(|count| count.to_string()))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn save_tsv<P: AsRef<Path>>(grid: &Array2<u32>, path: P) -> Result<(), ScanError> {
    let path = path.as_ref();
    let file = File::create(path)
        .map_err(|e| ScanError::io(e, format!("Creating {}", path.display())))?;
    write_tsv(grid, file)?;
    info!("Saved {}x{} grid to {}", grid.nrows(), grid.ncols(), path.display());
    Ok(())
}

/// Read a grid written by [`write_tsv`]
pub fn read_tsv<P: AsRef<Path>>(path: P) -> Result<Array2<u32>, ScanError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)?;

    let mut values = Vec::new();
    let mut rows = 0;
    let mut cols = None;
    for record in rdr.records() {
        let record = record?;
        if *cols.get_or_insert(record.len()) != record.len() {
            return Err(ScanError::Protocol(format!(
                "Row {} has {} columns, expected {:?}",
                rows,
                record.len(),
                cols
            )));
        }
        for field in record.iter() {
            let count = field.trim().parse::<u32>().map_err(|_| {
                ScanError::Protocol(format!("Invalid count '{}' in row {}", field, rows))
            })?;
            values.push(count);
        }
        rows += 1;
    }

    Array2::from_shape_vec((rows, cols.unwrap_or(0)), values)
        .map_err(|e| ScanError::Protocol(format!("Inconsistent grid shape: {}", e)))
}

/// Scale counts linearly onto 0..=255 between the grid's minimum and maximum
pub fn normalize_to_u8(grid: &Array2<u32>) -> Array2<u8> {
    let min = grid.iter().copied().min().unwrap_or(0);
    let max = grid.iter().copied().max().unwrap_or(0);
    let span = (max - min) as f64;
    grid.mapv(|count| {
        if span == 0.0 {
            0
        } else {
            ((count - min) as f64 / span * 255.0).round() as u8
        }
    })
}

/// Save a normalised 8-bit grayscale rendering of `grid`
pub fn save_png<P: AsRef<Path>>(grid: &Array2<u32>, path: P) -> Result<(), ScanError> {
    let scaled = normalize_to_u8(grid);
    let (height, width) = scaled.dim();

    let mut img_buffer = ImageBuffer::new(width as u32, height as u32);
    for (x, y, pixel) in img_buffer.enumerate_pixels_mut() {
        *pixel = Luma([scaled[[y as usize, x as usize]]]);
    }

    img_buffer.save(path.as_ref())?;
    info!("Saved preview image to {}", path.as_ref().display());
    Ok(())
}

/// `<prefix>_YYYYmmdd_HHMMSS` under `dir`, without extension
pub fn timestamped_path(dir: &Path, prefix: &str, started: DateTime<Utc>) -> PathBuf {
    dir.join(format!("{}_{}", prefix, started.format("%Y%m%d_%H%M%S")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::array;

    #[test]
    fn test_tsv_layout() {
        let grid = array![[1u32, 2, 3], [40, 50, 60]];
        let mut out = Vec::new();
        write_tsv(&grid, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1\t2\t3\n40\t50\t60\n");
    }

    #[test]
    fn test_save_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.tsv");
        let grid = array![[7u32, 0], [0, 9]];
        save_tsv(&grid, &path).unwrap();
        assert_eq!(read_tsv(&path).unwrap(), grid);
    }

    #[test]
    fn test_normalize_spans_full_range() {
        let grid = array![[10u32, 20], [30, 10]];
        let scaled = normalize_to_u8(&grid);
        assert_eq!(scaled[[0, 0]], 0);
        assert_eq!(scaled[[1, 0]], 255);
        assert_eq!(normalize_to_u8(&array![[5u32, 5]]), array![[0u8, 0]]);
    }

    #[test]
    fn test_png_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.png");
        let grid = Array2::from_shape_fn((3, 5), |(r, c)| (r * 5 + c) as u32);
        save_png(&grid, &path).unwrap();
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (5, 3));
    }

    #[test]
    fn test_timestamped_path() {
        let started = Utc.with_ymd_and_hms(2024, 3, 1, 14, 5, 9).unwrap();
        let path = timestamped_path(Path::new("out"), "scan", started);
        assert_eq!(path, Path::new("out").join("scan_20240301_140509"));
        let path = timestamped_path(Path::new("out"), "polar", started);
        assert_eq!(path, Path::new("out").join("polar_20240301_140509"));
    }
}

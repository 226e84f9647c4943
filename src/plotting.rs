use crate::error::ScanError;
use ndarray::Array2;
use textplots::{Chart, Plot};

/// Scale and prefix for a count axis, matching the count-rate readout
fn determine_scale(max_value: f64) -> (f64, &'static str) {
    if max_value >= 1e6 {
        (1e-6, "M")
    } else if max_value >= 1e3 {
        (1e-3, "K")
    } else {
        (1.0, "")
    }
}

/// Plot a series of counts in the terminal with automatic scaling
///
/// # Examples
/// ```
/// use rusty_raster::plotting::plot_counts;
///
/// let counts = vec![120, 4_500, 12_000, 3_900, 150];
/// plot_counts(&counts, Some("Row 10"), None, None).unwrap();
/// ```
pub fn plot_counts(
    counts: &[u32],
    title: Option<&str>,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), ScanError> {
    if counts.is_empty() {
        return Err(ScanError::InvalidState("Cannot plot empty data".to_string()));
    }

    let width = width.unwrap_or(140);
    let height = height.unwrap_or(60);

    let min_value = counts.iter().copied().min().unwrap_or(0) as f64;
    let max_value = counts.iter().copied().max().unwrap_or(0) as f64;
    let (value_scale, value_unit) = determine_scale(max_value);

    let frame: Vec<(f32, f32)> = counts
        .iter()
        .enumerate()
        .map(|(i, &count)| (i as f32, (count as f64 * value_scale) as f32))
        .collect();

    // textplots needs a non-empty x range
    let max_index = (counts.len().max(2) - 1) as f32;

    println!("{}", title.unwrap_or("Count Profile"));
    println!("X-axis: Pixel | Y-axis: {}Cps", value_unit);
    println!(
        "Range: {} pixels | Counts: {:.1} to {:.1} {}Cps",
        counts.len(),
        min_value * value_scale,
        max_value * value_scale,
        value_unit
    );
    println!("{}", "─".repeat(width));

    Chart::new(width as u32, height as u32, 0.0, max_index)
        .lineplot(&textplots::Shape::Lines(&frame))
        .nice();

    println!("Pixel →");

    Ok(())
}

/// Plot one scan line of a grid
pub fn plot_row_profile(
    grid: &Array2<u32>,
    row: usize,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), ScanError> {
    if row >= grid.nrows() {
        return Err(ScanError::InvalidState(format!(
            "Row {} outside a grid of {} rows",
            row,
            grid.nrows()
        )));
    }
    let counts: Vec<u32> = grid.row(row).to_vec();
    plot_counts(&counts, Some(&format!("Scan line {}", row)), width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determine_scale() {
        assert_eq!(determine_scale(500.0), (1.0, ""));
        assert_eq!(determine_scale(5_000.0), (1e-3, "K"));
        assert_eq!(determine_scale(5e6), (1e-6, "M"));
    }

    #[test]
    fn test_plot_row_profile() {
        let grid = Array2::from_shape_fn((3, 4), |(r, c)| (r * 100 + c) as u32);
        assert!(plot_row_profile(&grid, 1, Some(60), Some(20)).is_ok());
        assert!(plot_row_profile(&grid, 3, None, None).is_err());
    }

    #[test]
    fn test_plot_empty_data() {
        assert!(plot_counts(&[], None, None, None).is_err());
    }

    #[test]
    fn test_plot_single_pixel() {
        assert!(plot_counts(&[42], Some("Single"), Some(40), Some(10)).is_ok());
    }
}

use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest grid edge accepted; the published grid holds N² counts
pub const MAX_GRID_DIMENSION: usize = 4096;

/// Geometry and timing of one scan pass, re-read at the start of every pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Edge length of the square frame in physical units
    pub frame_size: f64,
    /// Distance between neighbouring pixels in physical units
    pub pixel_step: f64,
    /// Frame centre relative to the current stage position
    pub offset_x: f64,
    pub offset_y: f64,
    pub rotation_degrees: f64,
    /// Dwell after each unit move and before each sample
    pub dwell_millis: u32,
    /// Number of frames to acquire back to back
    pub frames: u32,
    /// Settle delay after arming, as a multiple of the dwell
    pub settle_factor: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            frame_size: 10.0,
            pixel_step: 0.5,
            offset_x: 0.0,
            offset_y: 0.0,
            rotation_degrees: 0.0,
            dwell_millis: 100,
            frames: 1,
            settle_factor: 10,
        }
    }
}

impl ScanConfig {
    /// `round(frame_size / pixel_step)`, rejecting anything below one pixel
    pub fn grid_dimension(&self) -> Result<usize, ScanError> {
        if !self.pixel_step.is_finite() || self.pixel_step <= 0.0 {
            return Err(ScanError::InvalidConfig(format!(
                "Pixel step must be strictly positive, got {}",
                self.pixel_step
            )));
        }
        if !self.frame_size.is_finite() || self.frame_size <= 0.0 {
            return Err(ScanError::InvalidConfig(format!(
                "Frame size must be strictly positive, got {}",
                self.frame_size
            )));
        }
        let dimension = (self.frame_size / self.pixel_step).round();
        if dimension < 1.0 {
            return Err(ScanError::InvalidConfig(format!(
                "Frame size {} with pixel step {} gives an empty grid",
                self.frame_size, self.pixel_step
            )));
        }
        if dimension > MAX_GRID_DIMENSION as f64 {
            return Err(ScanError::InvalidConfig(format!(
                "Grid dimension {} exceeds the maximum of {}",
                dimension, MAX_GRID_DIMENSION
            )));
        }
        Ok(dimension as usize)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        self.grid_dimension()?;
        for (name, value) in [
            ("offset_x", self.offset_x),
            ("offset_y", self.offset_y),
            ("rotation_degrees", self.rotation_degrees),
        ] {
            if !value.is_finite() {
                return Err(ScanError::InvalidConfig(format!(
                    "{} must be finite",
                    name
                )));
            }
        }
        if self.frames == 0 {
            return Err(ScanError::InvalidConfig(
                "At least one frame must be requested".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_millis as u64)
    }

    pub fn settle(&self) -> Duration {
        self.dwell() * self.settle_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grid_dimension() {
        assert_eq!(ScanConfig::default().grid_dimension().unwrap(), 20);
    }

    #[test]
    fn test_grid_dimension_rounds() {
        let config = ScanConfig {
            frame_size: 1.0,
            pixel_step: 0.3,
            ..Default::default()
        };
        assert_eq!(config.grid_dimension().unwrap(), 3);
    }

    #[test]
    fn test_rejects_empty_and_degenerate_grids() {
        let tiny = ScanConfig {
            frame_size: 0.1,
            pixel_step: 0.5,
            ..Default::default()
        };
        assert!(tiny.grid_dimension().is_err());

        let zero_step = ScanConfig {
            pixel_step: 0.0,
            ..Default::default()
        };
        assert!(zero_step.grid_dimension().is_err());

        let no_frames = ScanConfig {
            frames: 0,
            ..Default::default()
        };
        assert!(no_frames.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_grid() {
        let huge = ScanConfig {
            frame_size: 1e6,
            pixel_step: 1.0,
            ..Default::default()
        };
        assert!(matches!(huge.validate(), Err(ScanError::InvalidConfig(_))));

        let largest = ScanConfig {
            frame_size: MAX_GRID_DIMENSION as f64,
            pixel_step: 1.0,
            ..Default::default()
        };
        assert_eq!(largest.grid_dimension().unwrap(), MAX_GRID_DIMENSION);
    }

    #[test]
    fn test_settle_is_multiple_of_dwell() {
        let config = ScanConfig {
            dwell_millis: 20,
            settle_factor: 10,
            ..Default::default()
        };
        assert_eq!(config.settle(), Duration::from_millis(200));
    }
}

//! Precomputed sine/cosine samples for the scan loop.
//!
//! The table holds one sample per hundredth of a degree over `[0, 360)`.
//! Angles are rounded to that resolution and reduced modulo 360 before
//! indexing, so every finite input maps onto an existing entry.

use std::sync::OnceLock;

/// Samples per degree
pub const RESOLUTION: u32 = 100;
/// Number of entries covering one full turn
pub const TABLE_SIZE: usize = 360 * RESOLUTION as usize;

#[derive(Debug)]
pub struct AngleTable {
    sin: Vec<f64>,
    cos: Vec<f64>,
}

impl AngleTable {
    pub fn new() -> Self {
        let (sin, cos) = (0..TABLE_SIZE)
            .map(|i| {
                let radians = (i as f64 / RESOLUTION as f64).to_radians();
                (radians.sin(), radians.cos())
            })
            .unzip();
        Self { sin, cos }
    }

    /// Process-wide table, built on first use
    pub fn global() -> &'static AngleTable {
        static TABLE: OnceLock<AngleTable> = OnceLock::new();
        TABLE.get_or_init(AngleTable::new)
    }

    /// Table index for an angle in degrees.
    ///
    /// Non-finite input lands on index 0; configuration validation keeps
    /// such angles out of the scan path.
    pub fn index(degrees: f64) -> usize {
        let hundredths = (degrees * RESOLUTION as f64).round() as i64;
        hundredths.rem_euclid(TABLE_SIZE as i64) as usize
    }

    pub fn sin(&self, degrees: f64) -> f64 {
        self.sin[Self::index(degrees)]
    }

    pub fn cos(&self, degrees: f64) -> f64 {
        self.cos[Self::index(degrees)]
    }

    pub fn sin_cos(&self, degrees: f64) -> (f64, f64) {
        let i = Self::index(degrees);
        (self.sin[i], self.cos[i])
    }

    pub fn len(&self) -> usize {
        self.sin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sin.is_empty()
    }
}

impl Default for AngleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cardinal_angles() {
        let table = AngleTable::global();
        assert!((table.cos(0.0) - 1.0).abs() < 1e-12);
        assert!((table.sin(90.0) - 1.0).abs() < 1e-12);
        assert!((table.cos(180.0) + 1.0).abs() < 1e-12);
        assert!((table.sin(270.0) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_wraps_full_turn_and_negative_angles() {
        assert_eq!(AngleTable::index(360.0), 0);
        assert_eq!(AngleTable::index(359.999), 0);
        assert_eq!(AngleTable::index(-90.0), AngleTable::index(270.0));
        assert_eq!(AngleTable::index(725.5), AngleTable::index(5.5));
    }

    #[test]
    fn test_non_finite_does_not_panic() {
        let table = AngleTable::global();
        let _ = table.sin(f64::NAN);
        let _ = table.cos(f64::INFINITY);
        let _ = table.cos(f64::NEG_INFINITY);
    }

    proptest! {
        #[test]
        fn prop_every_angle_indexes_inside_table(degrees in -1.0e6f64..1.0e6) {
            prop_assert!(AngleTable::index(degrees) < TABLE_SIZE);
        }

        #[test]
        fn prop_lookup_matches_direct_evaluation(degrees in -720.0f64..720.0) {
            let table = AngleTable::global();
            let rounded = (degrees * 100.0).round() / 100.0;
            let expected = rounded.to_radians();
            prop_assert!((table.sin(degrees) - expected.sin()).abs() < 1e-9);
            prop_assert!((table.cos(degrees) - expected.cos()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_every_entry_reachable() {
        for i in 0..TABLE_SIZE {
            let degrees = i as f64 / RESOLUTION as f64;
            assert_eq!(AngleTable::index(degrees), i);
        }
    }
}

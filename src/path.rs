//! Zig-zag raster ordering.
//!
//! Even rows run left to right, odd rows right to left, so every pixel is
//! one column or one row away from its predecessor.

use crate::types::RowDirection;

/// How the stage reaches a pixel from the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First pixel of the frame, reached by the initial positioning move
    FrameStart,
    /// First pixel of a new row, one pixel step below the previous pixel
    RowAdvance,
    /// Neighbouring column in the current row's direction
    ColumnStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterPoint {
    pub col: i32,
    pub row: i32,
    pub direction: RowDirection,
    pub transition: Transition,
}

/// Restartable description of an `n x n` zig-zag scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZigZagPath {
    dimension: usize,
}

impl ZigZagPath {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.dimension * self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.dimension == 0
    }

    /// Fresh iterator starting at the first pixel
    pub fn iter(&self) -> ZigZagIter {
        ZigZagIter {
            dimension: self.dimension,
            index: 0,
        }
    }

    /// Coordinates of the `index`-th pixel in scan order
    pub fn point_at(&self, index: usize) -> Option<RasterPoint> {
        if index >= self.len() {
            return None;
        }
        let row = index / self.dimension;
        let offset = index % self.dimension;
        let direction = RowDirection::for_row(row as i32);
        let col = match direction {
            RowDirection::LeftToRight => offset,
            RowDirection::RightToLeft => self.dimension - 1 - offset,
        };
        let transition = match (row, offset) {
            (0, 0) => Transition::FrameStart,
            (_, 0) => Transition::RowAdvance,
            _ => Transition::ColumnStep,
        };
        Some(RasterPoint {
            col: col as i32,
            row: row as i32,
            direction,
            transition,
        })
    }
}

impl IntoIterator for ZigZagPath {
    type Item = RasterPoint;
    type IntoIter = ZigZagIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct ZigZagIter {
    dimension: usize,
    index: usize,
}

impl Iterator for ZigZagIter {
    type Item = RasterPoint;

    fn next(&mut self) -> Option<Self::Item> {
        let point = ZigZagPath::new(self.dimension).point_at(self.index)?;
        self.index += 1;
        Some(point)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.dimension * self.dimension).saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ZigZagIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_three_by_three_order() {
        let coords: Vec<(i32, i32)> = ZigZagPath::new(3).iter().map(|p| (p.col, p.row)).collect();
        assert_eq!(
            coords,
            vec![(0, 0), (1, 0), (2, 0), (2, 1), (1, 1), (0, 1), (0, 2), (1, 2), (2, 2)]
        );
    }

    #[test]
    fn test_transitions() {
        let points: Vec<RasterPoint> = ZigZagPath::new(2).iter().collect();
        assert_eq!(points[0].transition, Transition::FrameStart);
        assert_eq!(points[1].transition, Transition::ColumnStep);
        assert_eq!(points[2].transition, Transition::RowAdvance);
        assert_eq!(points[2].direction, RowDirection::RightToLeft);
        assert_eq!((points[2].col, points[2].row), (1, 1));
    }

    #[test]
    fn test_single_pixel() {
        let points: Vec<RasterPoint> = ZigZagPath::new(1).into_iter().collect();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].transition, Transition::FrameStart);
    }

    #[test]
    fn test_restartable() {
        let path = ZigZagPath::new(4);
        let first: Vec<RasterPoint> = path.iter().collect();
        let second: Vec<RasterPoint> = path.iter().collect();
        assert_eq!(first, second);
        assert_eq!(path.iter().len(), 16);
    }

    proptest! {
        #[test]
        fn prop_covers_grid_with_adjacent_steps(n in 1usize..40) {
            let points: Vec<RasterPoint> = ZigZagPath::new(n).iter().collect();
            prop_assert_eq!(points.len(), n * n);

            let distinct: HashSet<(i32, i32)> = points.iter().map(|p| (p.col, p.row)).collect();
            prop_assert_eq!(distinct.len(), n * n);

            for p in &points {
                prop_assert!(p.col >= 0 && (p.col as usize) < n);
                prop_assert!(p.row >= 0 && (p.row as usize) < n);
            }

            for pair in points.windows(2) {
                let dc = (pair[0].col - pair[1].col).abs();
                let dr = (pair[0].row - pair[1].row).abs();
                prop_assert_eq!(dc + dr, 1);
            }
        }
    }
}

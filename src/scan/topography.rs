//! Plane correction of the topography channel.
//!
//! The plane is fitted in pixel-index coordinates, `z = a * col + b * row + c`,
//! over the visited pixels only. Unvisited pixels still hold 0 and would pull
//! the fit towards zero height.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ScanError};

/// `z = a * col + b * row + c`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Plane {
    /// Slope along columns
    pub a: f64,
    /// Slope along rows
    pub b: f64,
    /// Offset
    pub c: f64,
}

impl Plane {
    /// Plane height at one pixel.
    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.a * col as f64 + self.b * row as f64 + self.c
    }

    /// Plane evaluated over a `rows x cols` grid.
    pub fn evaluate(&self, rows: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(row, col)| self.at(row, col))
    }
}

/// Plane-fit levelling of the topography channel.
pub struct TopographyCorrector;

impl TopographyCorrector {
    /// Least-squares plane through the masked pixels of `topo`.
    ///
    /// A region confined to a single row (or column) has no slope information
    /// across it; the missing slope is taken as zero.
    pub fn plane_fit(topo: ArrayView2<'_, f64>, visited: &Array2<bool>) -> AppResult<Plane> {
        let points: Vec<(f64, f64, f64)> = topo
            .indexed_iter()
            .filter(|((row, col), _)| visited.get((*row, *col)).copied().unwrap_or(false))
            .map(|((row, col), &z)| (col as f64, row as f64, z))
            .collect();

        if points.len() < 3 {
            return Err(ScanError::Processing(format!(
                "Plane fit needs at least 3 acquired pixels, got {}",
                points.len()
            )));
        }

        let n = points.len() as f64;
        let (sx, sy, sz) = points
            .iter()
            .fold((0.0, 0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1, acc.2 + p.2));
        let (mx, my, mz) = (sx / n, sy / n, sz / n);
        let spans_cols = points.iter().any(|p| p.0 != points[0].0);
        let spans_rows = points.iter().any(|p| p.1 != points[0].1);

        let (mut sxx, mut syy, mut sxy, mut sxz, mut syz) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for &(x, y, z) in &points {
            let (dx, dy, dz) = (x - mx, y - my, z - mz);
            sxx += dx * dx;
            syy += dy * dy;
            sxy += dx * dy;
            sxz += dx * dz;
            syz += dy * dz;
        }

        let det = sxx * syy - sxy * sxy;
        let (a, b) = match (spans_cols, spans_rows) {
            (true, true) if det.abs() > 1e-9 * sxx * syy => {
                ((sxz * syy - syz * sxy) / det, (syz * sxx - sxz * sxy) / det)
            }
            (true, false) => (sxz / sxx, 0.0),
            (false, true) => (0.0, syz / syy),
            _ => {
                return Err(ScanError::Processing(
                    "Acquired pixels are collinear, plane is undetermined".to_string(),
                ))
            }
        };

        Ok(Plane {
            a,
            b,
            c: mz - a * mx - b * my,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tilted(rows: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(r, c)| 2e-9 * c as f64 - 5e-10 * r as f64 + 1e-6)
    }

    #[test]
    fn test_plane_fit_residual_is_zero() {
        let topo = tilted(6, 8);
        let visited = Array2::from_elem((6, 8), true);
        let plane = TopographyCorrector::plane_fit(topo.view(), &visited).unwrap();
        let residual = &topo - &plane.evaluate(6, 8);
        let max = residual.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(max < 1e-15, "residual {}", max);
    }

    #[test]
    fn test_unvisited_zeros_are_excluded() {
        let mut topo = tilted(4, 4);
        let mut visited = Array2::from_elem((4, 4), true);
        for col in 0..4 {
            topo[[3, col]] = 0.0;
            visited[[3, col]] = false;
        }
        let plane = TopographyCorrector::plane_fit(topo.view(), &visited).unwrap();
        assert!((plane.a - 2e-9).abs() < 1e-18);
        assert!((plane.b + 5e-10).abs() < 1e-18);
        assert!((plane.at(3, 0) - (1e-6 - 1.5e-9)).abs() < 1e-15);
    }

    #[test]
    fn test_single_row_takes_zero_cross_slope() {
        let topo = tilted(3, 5);
        let mut visited = Array2::from_elem((3, 5), false);
        for col in 0..5 {
            visited[[0, col]] = true;
        }
        let plane = TopographyCorrector::plane_fit(topo.view(), &visited).unwrap();
        assert_eq!(plane.b, 0.0);
        assert!((plane.a - 2e-9).abs() < 1e-18);
    }

    #[test]
    fn test_too_few_points() {
        let topo = tilted(2, 2);
        let mut visited = Array2::from_elem((2, 2), false);
        visited[[0, 0]] = true;
        assert!(matches!(
            TopographyCorrector::plane_fit(topo.view(), &visited),
            Err(ScanError::Processing(_))
        ));
    }
}

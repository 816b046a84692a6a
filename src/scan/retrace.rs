//! Repositioning paths: retrace at the end of a line, approach to the first
//! pixel, and free moves between scans.
//!
//! A path walks each axis from its start to its target in increments of
//! `return_slowness`; the shorter axis is padded with its target so both axes
//! have the same number of samples. Every path ends exactly on its target.

use super::cursor::Orientation;
use super::image::ScanImage;

/// Most samples one axis of a path may have. A finer `return_slowness` over a
/// given span is rejected by configuration; paths that still exceed it (free
/// moves across the whole travel) are sampled more coarsely.
pub const MAX_PATH_POINTS: usize = 10_000_000;

/// True when walking `span` in increments of `return_slowness` stays within
/// [`MAX_PATH_POINTS`].
pub fn path_fits(span: f64, return_slowness: f64) -> bool {
    span.abs() / return_slowness <= MAX_PATH_POINTS as f64
}

/// Computes retrace and approach paths for one scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetraceController {
    orientation: Orientation,
    return_slowness: f64,
}

impl RetraceController {
    /// Controller for a raster along `orientation`, sampling paths every
    /// `return_slowness` meters.
    pub fn new(orientation: Orientation, return_slowness: f64) -> Self {
        Self {
            orientation,
            return_slowness,
        }
    }

    /// Raster orientation the retrace paths follow.
    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// Path from the last pixel of line `finished` to the first pixel of the
    /// following line.
    pub fn retrace_path(&self, image: &ScanImage, finished: usize) -> Vec<(f64, f64)> {
        let length = self
            .orientation
            .line_length(image.rows(), image.cols());
        let (from_row, from_col) = self
            .orientation
            .to_cell(length.saturating_sub(1), finished);
        let (to_row, to_col) = self.orientation.to_cell(0, finished + 1);
        path_between(
            image.position(from_row, from_col),
            image.position(to_row, to_col),
            self.return_slowness,
        )
    }

    /// Path from the current probe position to `target`, used to bring the probe
    /// to the first pixel before a scan and for free moves between scans.
    pub fn approach_path(&self, current: (f64, f64), target: (f64, f64)) -> Vec<(f64, f64)> {
        path_between(current, target, self.return_slowness)
    }
}

/// Sampled path from `from` to `to`. Identical endpoints give a single point.
pub fn path_between(from: (f64, f64), to: (f64, f64), increment: f64) -> Vec<(f64, f64)> {
    let xs = axis_samples(from.0, to.0, increment);
    let ys = axis_samples(from.1, to.1, increment);
    let count = xs.len().max(ys.len());
    (0..count)
        .map(|i| {
            (
                xs.get(i).copied().unwrap_or(to.0),
                ys.get(i).copied().unwrap_or(to.1),
            )
        })
        .collect()
}

fn axis_samples(from: f64, to: f64, increment: f64) -> Vec<f64> {
    let distance = to - from;
    if distance == 0.0 || !(increment > 0.0) {
        return vec![to];
    }
    let steps = ((distance.abs() / increment).ceil() as usize).min(MAX_PATH_POINTS);
    let increment = increment.max(distance.abs() / MAX_PATH_POINTS as f64);
    let direction = distance.signum();
    let mut samples: Vec<f64> = (0..steps)
        .map(|k| from + direction * increment * k as f64)
        .collect();
    samples.push(to);
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::ports::AxisRange;
    use crate::scan::ScanMode;

    #[test]
    fn test_path_density_limit() {
        assert!(!path_fits(1e-3, 1e-300));
        assert!(!path_fits(10e-6, 1e-13));
        assert!(path_fits(10e-6, 50e-9));
    }

    #[test]
    fn test_identical_endpoints_give_single_point() {
        assert_eq!(path_between((1.0, 2.0), (1.0, 2.0), 0.1), vec![(1.0, 2.0)]);
    }

    #[test]
    fn test_path_ends_on_target_and_pads_short_axis() {
        let path = path_between((0.0, 0.0), (1.0, 0.25), 0.25);
        assert_eq!(path.len(), 5);
        assert_eq!(path[0], (0.0, 0.0));
        assert_eq!(path[1], (0.25, 0.25));
        assert_eq!(path[4], (1.0, 0.25));
    }

    #[test]
    fn test_horizontal_retrace_returns_to_line_start() {
        let image = ScanImage::initialize(
            ScanMode::Quenching,
            [4, 3],
            AxisRange::from_array([[0.0, 3.0], [0.0, 2.0]]),
        );
        let retrace = RetraceController::new(Orientation::Horizontal, 0.5);
        let path = retrace.retrace_path(&image, 0);
        assert_eq!(path.first(), Some(&(3.0, 0.0)));
        assert_eq!(path.last(), Some(&(0.0, 1.0)));
        assert_eq!(path.len(), 7);
    }

    #[test]
    fn test_vertical_retrace_returns_to_column_start() {
        let image = ScanImage::initialize(
            ScanMode::IsoB,
            [2, 4],
            AxisRange::from_array([[0.0, 1.0], [0.0, 3.0]]),
        );
        let retrace = RetraceController::new(Orientation::Vertical, 1.0);
        let path = retrace.retrace_path(&image, 0);
        assert_eq!(path.first(), Some(&(0.0, 3.0)));
        assert_eq!(path.last(), Some(&(1.0, 0.0)));
    }

    #[test]
    fn test_approach_from_first_pixel_is_single_point() {
        let image = ScanImage::initialize(
            ScanMode::Quenching,
            [2, 2],
            AxisRange::from_array([[1.0, 2.0], [1.0, 2.0]]),
        );
        let retrace = RetraceController::new(Orientation::Horizontal, 0.1);
        assert_eq!(
            retrace.approach_path((1.0, 1.0), image.position(0, 0)),
            vec![(1.0, 1.0)]
        );
    }
}

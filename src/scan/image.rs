//! Multi-channel scan image and the live scan-line buffer.
//!
//! The image is a `rows x cols x channels` grid (`[row = y index, col = x index,
//! channel]`). Channels 0 and 1 hold the x and y position of every pixel and are
//! written once when the image is allocated. Channel 2 is the corrected
//! topography, the last channel the raw topography, and the channels in between
//! depend on the [`ScanMode`]:
//!
//! | mode      | channels                                    |
//! |-----------|---------------------------------------------|
//! | quenching | X, Y, Topo, PL, RawTopo                     |
//! | isob      | X, Y, Topo, PLdiff, PL1, PL2, RawTopo       |
//! | fullb     | X, Y, Topo, Freq, PLdiff, PL1, PL2, RawTopo |
//!
//! Unvisited pixels hold 0. Whether a pixel has been visited is decided by its
//! position in acquisition order, never by its value.

use ndarray::{s, Array1, Array2, Array3, ArrayView2};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use super::cursor::Orientation;
use super::ScanMode;
use crate::hardware::ports::AxisRange;

/// Channel indices for one scan mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayout {
    mode: ScanMode,
}

impl ChannelLayout {
    /// x position channel
    pub const X: usize = 0;
    /// y position channel
    pub const Y: usize = 1;
    /// Corrected topography channel
    pub const TOPO: usize = 2;

    /// Layout of the given mode.
    pub fn for_mode(mode: ScanMode) -> Self {
        Self { mode }
    }

    /// Acquisition mode.
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.mode.channel_count()
    }

    /// Raw (uncorrected) topography, always the last channel.
    pub fn raw_topo(&self) -> usize {
        self.channel_count() - 1
    }

    /// Photoluminescence channel (quenching).
    pub fn pl(&self) -> Option<usize> {
        matches!(self.mode, ScanMode::Quenching).then_some(3)
    }

    /// Dip frequency channel (full sweep).
    pub fn freq(&self) -> Option<usize> {
        matches!(self.mode, ScanMode::FullSweep).then_some(3)
    }

    /// First of the `PLdiff, PL1, PL2` triple (iso-B and full sweep).
    pub fn pl_diff(&self) -> Option<usize> {
        match self.mode {
            ScanMode::Quenching => None,
            ScanMode::IsoB => Some(3),
            ScanMode::FullSweep => Some(4),
        }
    }

    /// Channels mirrored into the scan-line buffer.
    pub fn line_fields(&self) -> Range<usize> {
        Self::TOPO..self.raw_topo()
    }

    /// Channel names in index order.
    pub fn names(&self) -> &'static [&'static str] {
        match self.mode {
            ScanMode::Quenching => &["X", "Y", "Topo", "PL", "RawTopo"],
            ScanMode::IsoB => &["X", "Y", "Topo", "PLdiff", "PL1", "PL2", "RawTopo"],
            ScanMode::FullSweep => &["X", "Y", "Topo", "Freq", "PLdiff", "PL1", "PL2", "RawTopo"],
        }
    }
}

/// The multi-channel image of one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanImage {
    layout: ChannelLayout,
    data: Array3<f64>,
}

impl ScanImage {
    /// Allocate a zeroed image for `resolution = [x_res, y_res]` and fill the
    /// position channels from `range`.
    pub fn initialize(mode: ScanMode, resolution: [usize; 2], range: AxisRange) -> Self {
        let [cols, rows] = resolution;
        let layout = ChannelLayout::for_mode(mode);
        let mut data = Array3::<f64>::zeros((rows, cols, layout.channel_count()));

        let xs = Array1::linspace(range.x[0], range.x[1], cols);
        let ys = Array1::linspace(range.y[0], range.y[1], rows);
        for row in 0..rows {
            for col in 0..cols {
                data[[row, col, ChannelLayout::X]] = xs[col];
                data[[row, col, ChannelLayout::Y]] = ys[row];
            }
        }

        Self { layout, data }
    }

    /// Channel layout of the image.
    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    /// Acquisition mode.
    pub fn mode(&self) -> ScanMode {
        self.layout.mode()
    }

    /// Number of rows (y resolution).
    pub fn rows(&self) -> usize {
        self.data.dim().0
    }

    /// Number of columns (x resolution).
    pub fn cols(&self) -> usize {
        self.data.dim().1
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.data.dim().2
    }

    /// Full `rows x cols x channels` array.
    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    /// One channel as a `rows x cols` view.
    pub fn channel(&self, channel: usize) -> ArrayView2<'_, f64> {
        self.data.slice(s![.., .., channel])
    }

    /// Value of one channel at one pixel.
    pub fn get(&self, row: usize, col: usize, channel: usize) -> f64 {
        self.data[[row, col, channel]]
    }

    /// `(x, y)` position of a pixel.
    pub fn position(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.data[[row, col, ChannelLayout::X]],
            self.data[[row, col, ChannelLayout::Y]],
        )
    }

    /// Write a measured value. Position channels are never written after allocation.
    pub(crate) fn set(&mut self, row: usize, col: usize, channel: usize, value: f64) {
        if channel > ChannelLayout::Y {
            self.data[[row, col, channel]] = value;
        }
    }

    /// Mask of pixels among the first `committed` in acquisition order.
    pub fn visited_mask(&self, orientation: Orientation, committed: usize) -> Array2<bool> {
        let (rows, cols) = (self.rows(), self.cols());
        Array2::from_shape_fn((rows, cols), |(row, col)| {
            orientation.raster_index(row, col, rows, cols) < committed
        })
    }
}

/// Live copy of the line being scanned, as `(axis position, value)` column pairs.
///
/// Column `2k` holds the fast-axis position and column `2k + 1` the value of the
/// k-th line field (see [`ChannelLayout::line_fields`]). Entries not yet acquired
/// on the current line carry the mean of the previous line so that live plots
/// keep a sensible scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanLineBuffer {
    data: Array2<f64>,
    line: usize,
    fill: Vec<f64>,
}

impl ScanLineBuffer {
    /// Buffer for the first line of `image`.
    pub fn new(image: &ScanImage, orientation: Orientation) -> Self {
        let fields = image.layout().line_fields().len();
        let length = orientation.line_length(image.rows(), image.cols());
        let mut buffer = Self {
            data: Array2::zeros((length, 2 * fields)),
            line: 0,
            fill: vec![0.0; fields],
        };
        buffer.refresh(image, orientation, 0, 0);
        buffer
    }

    /// `lineLength x 2*fields` array of position/value pairs.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Index of the line currently mirrored.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Number of mirrored channels.
    pub fn field_count(&self) -> usize {
        self.fill.len()
    }

    /// Rebuild the buffer for line `slow`, of which the first `acquired` fast
    /// positions hold data.
    pub fn refresh(&mut self, image: &ScanImage, orientation: Orientation, slow: usize, acquired: usize) {
        let fields = image.layout().line_fields();
        let length = self.data.nrows();
        let position_channel = match orientation {
            Orientation::Horizontal => ChannelLayout::X,
            Orientation::Vertical => ChannelLayout::Y,
        };

        if slow != self.line {
            self.fill = if slow == 0 {
                vec![0.0; fields.len()]
            } else {
                fields
                    .clone()
                    .map(|channel| {
                        let sum: f64 = (0..length)
                            .map(|fast| {
                                let (row, col) = orientation.to_cell(fast, slow - 1);
                                image.get(row, col, channel)
                            })
                            .sum();
                        sum / length as f64
                    })
                    .collect()
            };
            self.line = slow;
        }

        for fast in 0..length {
            let (row, col) = orientation.to_cell(fast, slow);
            let position = image.get(row, col, position_channel);
            for (k, channel) in fields.clone().enumerate() {
                self.data[[fast, 2 * k]] = position;
                self.data[[fast, 2 * k + 1]] = if fast < acquired {
                    image.get(row, col, channel)
                } else {
                    self.fill[k]
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> AxisRange {
        AxisRange::from_array([[0.0, 3.0], [10.0, 11.0]])
    }

    #[test]
    fn test_position_channels_follow_range() {
        let image = ScanImage::initialize(ScanMode::IsoB, [4, 2], range());
        assert_eq!((image.rows(), image.cols(), image.channels()), (2, 4, 7));
        assert_eq!(image.position(0, 0), (0.0, 10.0));
        assert_eq!(image.position(1, 3), (3.0, 11.0));
        assert_eq!(image.get(1, 2, ChannelLayout::X), 2.0);
        assert!(image.channel(3).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_position_channels_are_write_protected() {
        let mut image = ScanImage::initialize(ScanMode::Quenching, [2, 2], range());
        image.set(0, 1, ChannelLayout::X, 42.0);
        image.set(0, 1, 3, 7.0);
        assert_eq!(image.get(0, 1, ChannelLayout::X), 3.0);
        assert_eq!(image.get(0, 1, 3), 7.0);
    }

    #[test]
    fn test_layout_indices() {
        let full = ChannelLayout::for_mode(ScanMode::FullSweep);
        assert_eq!(full.raw_topo(), 7);
        assert_eq!(full.freq(), Some(3));
        assert_eq!(full.pl_diff(), Some(4));
        assert_eq!(full.line_fields(), 2..7);
        assert_eq!(full.names().len(), full.channel_count());

        let quenching = ChannelLayout::for_mode(ScanMode::Quenching);
        assert_eq!(quenching.line_fields().len(), 2);
        assert_eq!(quenching.pl(), Some(3));
        assert_eq!(quenching.pl_diff(), None);
    }

    #[test]
    fn test_visited_mask_vertical() {
        let image = ScanImage::initialize(ScanMode::Quenching, [2, 2], range());
        let mask = image.visited_mask(Orientation::Vertical, 3);
        assert!(mask[[0, 0]] && mask[[1, 0]] && mask[[0, 1]]);
        assert!(!mask[[1, 1]]);
    }

    #[test]
    fn test_line_buffer_fills_with_previous_mean() {
        let mut image = ScanImage::initialize(ScanMode::Quenching, [2, 2], range());
        image.set(0, 0, 3, 10.0);
        image.set(0, 1, 3, 20.0);
        image.set(1, 0, 3, 40.0);

        let mut buffer = ScanLineBuffer::new(&image, Orientation::Horizontal);
        assert_eq!(buffer.data().dim(), (2, 4));

        buffer.refresh(&image, Orientation::Horizontal, 1, 1);
        assert_eq!(buffer.line(), 1);
        // PL is the second field: columns 2 (position) and 3 (value)
        assert_eq!(buffer.data()[[0, 3]], 40.0);
        assert_eq!(buffer.data()[[1, 3]], 15.0);
        assert_eq!(buffer.data()[[1, 2]], 3.0);
    }
}

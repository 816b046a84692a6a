//! Raster position bookkeeping.

use serde::{Deserialize, Serialize};

/// Which image axis is stepped every pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    /// Fast axis along x (columns), one line per row
    #[default]
    Horizontal,
    /// Fast axis along y (rows), one line per column
    Vertical,
}

impl Orientation {
    /// Length of a line for an image of `rows x cols`.
    pub fn line_length(self, rows: usize, cols: usize) -> usize {
        match self {
            Orientation::Horizontal => cols,
            Orientation::Vertical => rows,
        }
    }

    /// Number of lines for an image of `rows x cols`.
    pub fn line_count(self, rows: usize, cols: usize) -> usize {
        match self {
            Orientation::Horizontal => rows,
            Orientation::Vertical => cols,
        }
    }

    /// Position of `(row, col)` in acquisition order.
    pub fn raster_index(self, row: usize, col: usize, rows: usize, cols: usize) -> usize {
        match self {
            Orientation::Horizontal => row * cols + col,
            Orientation::Vertical => col * rows + row,
        }
    }

    /// `(row, col)` of the given `(fast, slow)` indices.
    pub fn to_cell(self, fast: usize, slow: usize) -> (usize, usize) {
        match self {
            Orientation::Horizontal => (slow, fast),
            Orientation::Vertical => (fast, slow),
        }
    }
}

/// Result of moving the cursor past the pixels just acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Still on the same line
    Next,
    /// Crossed into the next line; a retrace is due
    LineEnd,
    /// Past the last line; the cursor has wrapped to `(0, 0)`
    ScanEnd,
}

/// Current pixel of the raster plus the step size of the active mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    /// Current row (y index)
    pub row: usize,
    /// Current column (x index)
    pub col: usize,
    increment: usize,
    orientation: Orientation,
    rows: usize,
    cols: usize,
}

impl ScanCursor {
    /// Cursor at `(0, 0)` of a `rows x cols` raster.
    pub fn new(rows: usize, cols: usize, increment: usize, orientation: Orientation) -> Self {
        Self {
            row: 0,
            col: 0,
            increment: increment.max(1),
            orientation,
            rows,
            cols,
        }
    }

    /// Pixels covered by one acquisition.
    pub fn increment(&self) -> usize {
        self.increment
    }

    /// Fast-axis orientation.
    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// Index along the fast axis.
    pub fn fast(&self) -> usize {
        match self.orientation {
            Orientation::Horizontal => self.col,
            Orientation::Vertical => self.row,
        }
    }

    /// Index along the slow axis (the line number).
    pub fn slow(&self) -> usize {
        match self.orientation {
            Orientation::Horizontal => self.row,
            Orientation::Vertical => self.col,
        }
    }

    /// Pixels per line.
    pub fn line_length(&self) -> usize {
        self.orientation.line_length(self.rows, self.cols)
    }

    /// Position of the cursor in acquisition order.
    pub fn raster_index(&self) -> usize {
        self.orientation
            .raster_index(self.row, self.col, self.rows, self.cols)
    }

    /// Cells covered by the next acquisition, clipped at the end of the line.
    pub fn pixels(&self) -> Vec<(usize, usize)> {
        let fast = self.fast();
        let end = (fast + self.increment).min(self.line_length());
        (fast..end)
            .map(|f| self.orientation.to_cell(f, self.slow()))
            .collect()
    }

    /// Step past the current pixels.
    pub fn advance(&mut self) -> Advance {
        let mut fast = self.fast() + self.increment;
        let mut slow = self.slow();
        let mut outcome = Advance::Next;

        if fast >= self.line_length() {
            fast = 0;
            slow += 1;
            outcome = Advance::LineEnd;
            if slow >= self.orientation.line_count(self.rows, self.cols) {
                slow = 0;
                outcome = Advance::ScanEnd;
            }
        }

        let (row, col) = self.orientation.to_cell(fast, slow);
        self.row = row;
        self.col = col;
        outcome
    }

    /// Back to `(0, 0)`.
    pub fn reset(&mut self) {
        self.row = 0;
        self.col = 0;
    }
}

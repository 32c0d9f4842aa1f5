use ddal_common::datum::OwnedRow;

/// Append-only buffer of built rows awaiting a flush.
#[derive(Debug)]
pub struct RowBuffer {
    rows: Vec<OwnedRow>,
    threshold: usize,
}

impl RowBuffer {
    /// A zero threshold is treated as 1.
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            rows: Vec::with_capacity(threshold.min(1024)),
            threshold,
        }
    }

    /// Append a row. Returns `true` once the buffer reached its threshold.
    pub fn push(&mut self, row: OwnedRow) -> bool {
        self.rows.push(row);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.threshold
    }

    /// Drain the buffer in insertion order, leaving it empty.
    pub fn take(&mut self) -> Vec<OwnedRow> {
        std::mem::take(&mut self.rows)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

use ddal_common::error::DdalResult;

use crate::worker::WorkerOutcome;

/// Folds per-worker outcomes into a statement's affected-row total.
///
/// A statement either succeeds with a total (possibly 0) or fails; a failed
/// flush never contributes a partial count.
#[derive(Debug, Default)]
pub struct Aggregator {
    total: u64,
    flushes: usize,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum one flush's outcomes. The first failure in worker order wins.
    pub fn fold(outcomes: Vec<WorkerOutcome>) -> DdalResult<u64> {
        let mut total = 0u64;
        let mut first_err = None;
        for outcome in outcomes {
            match outcome.result {
                Ok(counts) => total += counts.iter().sum::<u64>(),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Fold a flush into the running total. On failure the running total is
    /// left as it was and the error is returned.
    pub fn add_flush(&mut self, outcomes: Vec<WorkerOutcome>) -> DdalResult<u64> {
        let flushed = Self::fold(outcomes)?;
        self.total += flushed;
        self.flushes += 1;
        Ok(flushed)
    }

    pub fn running_total(&self) -> u64 {
        self.total
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.flushes = 0;
    }
}

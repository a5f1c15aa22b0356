//! Round-robin input distribution (the feeder side).

use crate::config::Framing;
use crate::error::{JoinError, Result};
use crate::pool::Rotation;
use crate::relay::DiagnosticRelay;
use crate::worker::WorkerInput;
use std::io::BufRead;
use tracing::{debug, instrument, trace};

/// Counters describing one distribution run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionStats {
    /// Records delivered to workers.
    pub records: u64,
    /// Bytes delivered to workers.
    pub bytes: u64,
    /// Indices of workers removed after a failed write, in removal order.
    pub dropped_workers: Vec<usize>,
}

/// Writes input records to worker stdin pipes in strict rotation.
#[derive(Debug)]
pub struct InputDistributor {
    inputs: Rotation<WorkerInput>,
    framing: Framing,
    stats: DistributionStats,
}

impl InputDistributor {
    pub fn new(inputs: Rotation<WorkerInput>, framing: Framing) -> Self {
        Self {
            inputs,
            framing,
            stats: DistributionStats::default(),
        }
    }

    /// Distribute every record of `input`, then close all worker stdins.
    ///
    /// Dropped workers are reported through `relay`. On error the remaining
    /// stdins are still closed (on drop), but records already sent stay sent.
    #[instrument(level = "debug", skip_all, fields(workers = self.inputs.len()))]
    pub fn run<R: BufRead>(
        mut self,
        input: &mut R,
        relay: &mut DiagnosticRelay,
    ) -> Result<DistributionStats> {
        let mut record = Vec::new();
        loop {
            record.clear();
            let n = input
                .read_until(self.framing.delimiter, &mut record)
                .map_err(JoinError::InputRead)?;
            if n == 0 {
                break;
            }
            let len = self.framing.forwarded_len(&record);
            self.dispatch(&record[..len], relay)?;
        }

        debug!(
            records = self.stats.records,
            bytes = self.stats.bytes,
            remaining_workers = self.inputs.len(),
            "Input exhausted, closing worker stdin"
        );
        for worker in self.inputs {
            trace!(worker = worker.index(), "Closing stdin");
            worker.close();
        }
        Ok(self.stats)
    }

    /// Send one record to the worker due next, dropping workers that fail.
    fn dispatch(&mut self, record: &[u8], relay: &mut DiagnosticRelay) -> Result<()> {
        while let Some(worker) = self.inputs.current_mut() {
            let index = worker.index();
            match worker.send(record) {
                Ok(()) => {
                    trace!(worker = index, len = record.len(), "Record sent");
                    self.inputs.advance();
                    self.stats.records += 1;
                    self.stats.bytes += record.len() as u64;
                    return Ok(());
                }
                Err(e) => {
                    debug!(worker = index, error = %e, "Dropping worker from input rotation");
                    relay.report(format_args!(
                        "worker {} stopped accepting input ({}), removed from rotation",
                        index, e
                    ));
                    if let Some(failed) = self.inputs.remove_current() {
                        failed.close();
                    }
                    self.stats.dropped_workers.push(index);
                }
            }
        }
        Err(JoinError::NoWorkersLeft {
            dropped: self.stats.dropped_workers.len(),
        })
    }
}

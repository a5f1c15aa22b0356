//! Run orchestration: spawn, feed, join, reap.
//!
//! ```text
//!                 ┌──────────┐  stdin   ┌──────────┐  stdout
//!   input ──────▶ │  feeder  │ ───────▶ │ worker i │ ────────┐
//!                 │ (caller) │          └──────────┘         ▼
//!                 └────┬─────┘                         ┌──────────┐
//!                      │ diagnostic relay (pipe)       │  joiner  │ ──▶ stdout
//!                      └─────────────────────────────▶ │ (thread) │ ──▶ stderr
//!                                                      └──────────┘
//! ```
//!
//! The feeder and joiner share nothing but pipes: the pool is split into
//! stdin ends for the feeder and stdout/stderr ends for the joiner before
//! the joiner starts. While the joiner runs, everything the feeder has to
//! say (its log lines included) travels through the relay, so stderr has a
//! single writer.

use crate::config::{InputSource, JoinConfig};
use crate::distributor::{DistributionStats, InputDistributor};
use crate::error::{JoinError, Result};
use crate::logging;
use crate::merger::{MergeStats, OutputMerger};
use crate::pool::{PoolParts, WorkerPool};
use crate::relay::DiagnosticRelay;
use crate::record::RecordStream;
use crate::status::TerminationReason;
use crate::worker::{WorkerOutput, WorkerProcess};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter};
use std::thread;
use tracing::{debug, info, instrument};

/// Name of the thread running the output merger.
const JOINER_THREAD: &str = "fanjoin-joiner";

/// How one worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub index: usize,
    pub reason: TerminationReason,
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub distribution: DistributionStats,
    pub merge: MergeStats,
    /// Termination of every worker, in pool order.
    pub workers: Vec<WorkerStatus>,
}

impl RunReport {
    /// The first worker, in pool order, that did not exit with status 0.
    pub fn first_failure(&self) -> Option<WorkerStatus> {
        self.workers.iter().copied().find(|w| !w.reason.is_success())
    }

    /// Process exit code for this run: 0, or the first failing worker's code.
    pub fn exit_code(&self) -> i32 {
        self.first_failure()
            .map(|w| w.reason.exit_code())
            .unwrap_or(0)
    }
}

/// Run `config.command` across the pool, merging output to this process's
/// stdout and stderr.
///
/// Worker failures are not errors here; inspect the returned report. Errors
/// are startup failures, fatal feeder or joiner errors, and reaping
/// failures. When the joiner fails, its error wins: the feeder's failure
/// that follows is only the workers dying without a reader.
#[instrument(level = "debug", skip_all, fields(command = %config.command_name(), workers = config.workers.get()))]
pub fn run(config: &JoinConfig) -> Result<RunReport> {
    // Open input before spawning so a bad path starts nothing
    let mut input = open_input(&config.input)?;
    let (relay, relay_stream) = DiagnosticRelay::channel()?;
    let log_sink = relay.log_sink()?;

    let PoolParts {
        inputs,
        outputs,
        processes,
    } = WorkerPool::spawn(config)?.split();

    let (fed, merged) = thread::scope(|scope| -> Result<_> {
        let joiner = thread::Builder::new()
            .name(JOINER_THREAD.to_string())
            .spawn_scoped(scope, move || merge_to_stdio(outputs, relay_stream))?;

        let mut relay = relay;
        let diversion = logging::divert(log_sink);
        let fed = InputDistributor::new(inputs, config.input_framing).run(&mut input, &mut relay);
        if let Err(e) = &fed {
            relay.report(format_args!("input distribution stopped early: {}", e));
        }
        drop(diversion);
        relay.close();

        let merged = joiner.join().map_err(|_| JoinError::JoinerPanicked)?;
        Ok((fed, merged))
    })?;

    let workers = reap(processes)?;
    let (distribution, merge) = settle(fed, merged)?;

    let report = RunReport {
        distribution,
        merge,
        workers,
    };
    info!(
        records = report.distribution.records,
        dropped_workers = report.distribution.dropped_workers.len(),
        exit_code = report.exit_code(),
        "Run complete"
    );
    Ok(report)
}

/// Combine the feeder and joiner outcomes, the joiner's error first.
fn settle(
    fed: Result<DistributionStats>,
    merged: Result<MergeStats>,
) -> Result<(DistributionStats, MergeStats)> {
    match (fed, merged) {
        (Ok(distribution), Ok(merge)) => Ok((distribution, merge)),
        (Err(fed), Err(merged)) => {
            debug!(error = %fed, "Feeder failure follows the joiner failure");
            Err(merged)
        }
        (_, Err(merged)) => Err(merged),
        (Err(fed), Ok(_)) => Err(fed),
    }
}

/// Open the configured input source as a buffered reader.
fn open_input(source: &InputSource) -> Result<Box<dyn BufRead>> {
    match source {
        InputSource::Stdin => Ok(Box::new(io::stdin().lock())),
        InputSource::File(path) => {
            let file = File::open(path).map_err(|source| JoinError::InputOpen {
                path: path.clone(),
                source,
            })?;
            debug!(path = %path.display(), "Reading input from file");
            Ok(Box::new(BufReader::new(file)))
        }
    }
}

/// Joiner body: merge into buffered stdout and stderr.
fn merge_to_stdio(outputs: Vec<WorkerOutput>, relay: RecordStream) -> Result<MergeStats> {
    let out = BufWriter::new(io::stdout().lock());
    // Not locked for the whole run: the feeder thread logs to stderr too
    let err = BufWriter::new(io::stderr());
    OutputMerger::new(outputs, Some(relay), out, err).run()
}

/// Wait for every worker, in pool order.
fn reap(processes: Vec<WorkerProcess>) -> Result<Vec<WorkerStatus>> {
    let mut statuses = Vec::with_capacity(processes.len());
    for mut process in processes {
        let reason = process.wait()?;
        if reason.is_success() {
            debug!(worker = process.index(), "Worker finished");
        } else {
            info!(worker = process.index(), %reason, "Worker failed");
        }
        statuses.push(WorkerStatus {
            index: process.index(),
            reason,
        });
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use std::num::NonZeroUsize;

    fn report(reasons: &[TerminationReason]) -> RunReport {
        RunReport {
            distribution: DistributionStats::default(),
            merge: MergeStats::default(),
            workers: reasons
                .iter()
                .enumerate()
                .map(|(index, &reason)| WorkerStatus { index, reason })
                .collect(),
        }
    }

    #[test]
    fn test_report_success() {
        let report = report(&[TerminationReason::Exited(0); 3]);
        assert_eq!(report.first_failure(), None);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_first_failing_worker_decides() {
        let report = report(&[
            TerminationReason::Exited(0),
            TerminationReason::Signaled(Signal::SIGTERM),
            TerminationReason::Exited(3),
        ]);
        assert_eq!(report.exit_code(), 143);
        assert_eq!(report.first_failure().map(|w| w.index), Some(1));
    }

    #[test]
    fn test_joiner_failure_outranks_feeder_failure() {
        let fed = Err(JoinError::NoWorkersLeft { dropped: 2 });
        let merged = Err(JoinError::Output {
            stream: "stdout",
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        });
        let err = settle(fed, merged).unwrap_err();
        assert!(matches!(err, JoinError::Output { stream: "stdout", .. }));
    }

    #[test]
    fn test_feeder_failure_reported_when_joiner_succeeds() {
        let fed = Err(JoinError::InputRead(io::Error::from_raw_os_error(
            nix::libc::EISDIR,
        )));
        let err = settle(fed, Ok(MergeStats::default())).unwrap_err();
        assert!(matches!(err, JoinError::InputRead(_)));

        let ok = settle(Ok(DistributionStats::default()), Ok(MergeStats::default()));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_missing_input_file_spawns_nothing() {
        let config = JoinConfig::new("/nonexistent/fanjoin-never-spawned").with_input(
            InputSource::File("/nonexistent/fanjoin-input.txt".into()),
        );
        let err = run(&config).unwrap_err();
        assert!(matches!(err, JoinError::InputOpen { .. }));
    }

    #[test]
    fn test_reap_collects_in_pool_order() {
        let config = JoinConfig::new("sh")
            .with_args(["-c", "exit $FANJOIN_WORKER"])
            .with_workers(NonZeroUsize::new(3).unwrap());
        let PoolParts {
            inputs,
            outputs,
            processes,
        } = WorkerPool::spawn(&config).unwrap().split();
        drop((inputs, outputs));

        let statuses = reap(processes).unwrap();
        let codes: Vec<_> = statuses.iter().map(|s| (s.index, s.reason)).collect();
        assert_eq!(
            codes,
            vec![
                (0, TerminationReason::Exited(0)),
                (1, TerminationReason::Exited(1)),
                (2, TerminationReason::Exited(2)),
            ]
        );
    }
}

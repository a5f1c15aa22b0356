//! Round-robin output collection (the joiner side).
//!
//! Worker stdout is collected in the same rotation the distributor used for
//! input, one record per turn, so output records come out in input order.
//! Serialized stderr runs its own, independent rotation: a worker that prints
//! nothing on stderr only gives up its turn there once its stderr closes.
//!
//! The joiner never spins. When neither head stream (nor the diagnostic
//! relay) has data, it flushes its sinks and sleeps in `poll(2)` until one
//! of them becomes readable.

use crate::error::{JoinError, Result};
use crate::pipe::wait_any_readable;
use crate::pool::Rotation;
use crate::record::{ReadOutcome, RecordStream};
use crate::worker::WorkerOutput;
use std::io::{self, Write};
use std::os::unix::io::{AsFd, BorrowedFd};
use tracing::{debug, instrument, trace};

/// Counters describing one merge run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Records copied from worker stdout.
    pub stdout_records: u64,
    /// Records copied from worker stderr.
    pub stderr_records: u64,
    /// Diagnostics copied from the relay.
    pub diagnostics: u64,
    /// Worker indices in the order their last output stream closed.
    pub retired: Vec<usize>,
}

/// One worker stream taking part in a rotation.
#[derive(Debug)]
struct StreamSlot {
    worker: usize,
    stream: RecordStream,
}

/// What happened to the head of a rotation on one turn.
enum Turn {
    /// A record was copied and the rotation moved on.
    Record,
    /// The head stream closed and left the rotation.
    Closed(usize),
    /// The head stream has no data yet.
    Blocked,
    /// The rotation is empty.
    Idle,
}

/// Copies worker output records to the two sinks in rotation order.
#[derive(Debug)]
pub struct OutputMerger<O, E> {
    stdout_ring: Rotation<StreamSlot>,
    stderr_ring: Rotation<StreamSlot>,
    relay: Option<RecordStream>,
    /// Open output streams per worker index.
    open_streams: Vec<u8>,
    out: O,
    err: E,
    stats: MergeStats,
}

impl<O: Write, E: Write> OutputMerger<O, E> {
    /// Build a merger over `outputs`, which must be in rotation order.
    ///
    /// Diagnostics read from `relay` are copied to `err` between worker
    /// stderr records.
    pub fn new(outputs: Vec<WorkerOutput>, relay: Option<RecordStream>, out: O, err: E) -> Self {
        let slots = outputs.iter().map(|o| o.index + 1).max().unwrap_or(0);
        let mut open_streams = vec![0u8; slots];
        let mut stdout_slots = Vec::with_capacity(outputs.len());
        let mut stderr_slots = Vec::new();

        for output in outputs {
            open_streams[output.index] += 1;
            stdout_slots.push(StreamSlot {
                worker: output.index,
                stream: output.stdout,
            });
            if let Some(stream) = output.stderr {
                open_streams[output.index] += 1;
                stderr_slots.push(StreamSlot {
                    worker: output.index,
                    stream,
                });
            }
        }

        Self {
            stdout_ring: Rotation::new(stdout_slots),
            stderr_ring: Rotation::new(stderr_slots),
            relay,
            open_streams,
            out,
            err,
            stats: MergeStats::default(),
        }
    }

    /// Merge until every worker stream and the relay have closed.
    #[instrument(level = "debug", skip_all, fields(
        stdout_streams = self.stdout_ring.len(),
        stderr_streams = self.stderr_ring.len()
    ))]
    pub fn run(mut self) -> Result<MergeStats> {
        while !self.is_finished() {
            let mut progressed = self.drain_relay()?;

            match take_turn(&mut self.stdout_ring, &mut self.out, "stdout")? {
                Turn::Record => {
                    self.stats.stdout_records += 1;
                    progressed = true;
                }
                Turn::Closed(worker) => {
                    self.stream_closed(worker, "stdout");
                    progressed = true;
                }
                Turn::Blocked | Turn::Idle => {}
            }

            match take_turn(&mut self.stderr_ring, &mut self.err, "stderr")? {
                Turn::Record => {
                    self.stats.stderr_records += 1;
                    progressed = true;
                }
                Turn::Closed(worker) => {
                    self.stream_closed(worker, "stderr");
                    progressed = true;
                }
                Turn::Blocked | Turn::Idle => {}
            }

            if !progressed {
                self.flush()?;
                self.wait()?;
            }
        }

        self.flush()?;
        debug!(
            stdout_records = self.stats.stdout_records,
            stderr_records = self.stats.stderr_records,
            diagnostics = self.stats.diagnostics,
            "All worker output collected"
        );
        Ok(self.stats)
    }

    fn is_finished(&self) -> bool {
        self.stdout_ring.is_empty() && self.stderr_ring.is_empty() && self.relay.is_none()
    }

    /// Copy every diagnostic currently available on the relay.
    fn drain_relay(&mut self) -> Result<bool> {
        let mut progressed = false;
        while let Some(relay) = self.relay.as_mut() {
            let mut sink = SinkWriter::new(&mut self.err);
            let outcome = relay.read_record(&mut sink).map_err(|source| {
                if sink.broken(&source) {
                    JoinError::Output {
                        stream: "stderr",
                        source,
                    }
                } else {
                    JoinError::Relay(source)
                }
            })?;
            match outcome {
                ReadOutcome::Record(_) => {
                    self.stats.diagnostics += 1;
                    progressed = true;
                }
                ReadOutcome::Eof => {
                    trace!("Diagnostic relay closed");
                    self.relay = None;
                    progressed = true;
                }
                ReadOutcome::WouldBlock => break,
            }
        }
        Ok(progressed)
    }

    fn stream_closed(&mut self, worker: usize, stream: &'static str) {
        trace!(worker, stream, "Worker stream closed");
        let open = &mut self.open_streams[worker];
        *open = open.saturating_sub(1);
        if *open == 0 {
            debug!(worker, "Worker output retired");
            self.stats.retired.push(worker);
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(|source| JoinError::Output {
            stream: "stdout",
            source,
        })?;
        self.err.flush().map_err(|source| JoinError::Output {
            stream: "stderr",
            source,
        })?;
        Ok(())
    }

    /// Sleep until the relay or one of the two head streams is readable.
    fn wait(&self) -> Result<()> {
        let mut fds: Vec<BorrowedFd<'_>> = Vec::with_capacity(3);
        if let Some(relay) = &self.relay {
            fds.push(relay.as_fd());
        }
        if let Some(head) = self.stdout_ring.current() {
            fds.push(head.stream.as_fd());
        }
        if let Some(head) = self.stderr_ring.current() {
            fds.push(head.stream.as_fd());
        }
        trace!(watched = fds.len(), "Waiting for worker output");
        wait_any_readable(&fds)?;
        Ok(())
    }
}

/// Give the head of `ring` one turn, copying at most one record into `sink`.
///
/// Only a copied record moves the rotation on; a blocked head keeps its turn.
fn take_turn<W: Write>(
    ring: &mut Rotation<StreamSlot>,
    sink: &mut W,
    stream: &'static str,
) -> Result<Turn> {
    let Some(slot) = ring.current_mut() else {
        return Ok(Turn::Idle);
    };
    let worker = slot.worker;
    let mut sink = SinkWriter::new(sink);
    let outcome = slot.stream.read_record(&mut sink).map_err(|source| {
        if sink.broken(&source) {
            JoinError::Output { stream, source }
        } else {
            JoinError::Merge {
                stream,
                index: worker,
                source,
            }
        }
    })?;
    match outcome {
        ReadOutcome::Record(_) => {
            ring.advance();
            Ok(Turn::Record)
        }
        ReadOutcome::Eof => {
            ring.remove_current();
            Ok(Turn::Closed(worker))
        }
        ReadOutcome::WouldBlock => Ok(Turn::Blocked),
    }
}

/// Passes writes through to a sink, remembering whether the sink failed.
///
/// A record copy can fail on either side; only this tells a broken sink
/// apart from a broken worker pipe.
struct SinkWriter<'a, W> {
    inner: &'a mut W,
    failed: bool,
}

impl<'a, W: Write> SinkWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            failed: false,
        }
    }

    /// Whether `error` came from the sink rather than the stream feeding it.
    fn broken(&self, error: &io::Error) -> bool {
        // write_all turns a zero-length write into WriteZero on its own
        self.failed || error.kind() == io::ErrorKind::WriteZero
    }
}

impl<W: Write> Write for SinkWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).inspect_err(|_| self.failed = true)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().inspect_err(|_| self.failed = true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Framing;
    use crate::pipe::PipeFd;
    use std::thread;
    use std::time::Duration;

    /// A worker output with pipes standing in for the process.
    fn fake_output(index: usize, with_stderr: bool) -> (WorkerOutput, PipeFd, Option<PipeFd>) {
        let (out_read, out_write) = PipeFd::pair().unwrap();
        let stdout = RecordStream::new(out_read, Framing::default()).unwrap();
        let (stderr, err_write) = if with_stderr {
            let (err_read, err_write) = PipeFd::pair().unwrap();
            let stream = RecordStream::new(err_read, Framing::default()).unwrap();
            (Some(stream), Some(err_write))
        } else {
            (None, None)
        };
        let output = WorkerOutput {
            index,
            stdout,
            stderr,
        };
        (output, out_write, err_write)
    }

    #[test]
    fn test_merges_in_rotation_order() {
        let (o0, mut w0, _) = fake_output(0, false);
        let (o1, mut w1, _) = fake_output(1, false);
        // Worker 1's data is already there before worker 0's
        w1.write_all(b"b\nd\n").unwrap();
        w0.write_all(b"a\nc\ne\n").unwrap();
        drop((w0, w1));

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let stats = OutputMerger::new(vec![o0, o1], None, &mut out, &mut err)
            .run()
            .unwrap();

        assert_eq!(out, b"a\nb\nc\nd\ne\n");
        assert!(err.is_empty());
        assert_eq!(stats.stdout_records, 5);
        assert_eq!(stats.retired, vec![1, 0]);
    }

    #[test]
    fn test_waits_for_slow_head_worker() {
        let (o0, mut w0, _) = fake_output(0, false);
        let (o1, mut w1, _) = fake_output(1, false);
        w1.write_all(b"second\n").unwrap();
        drop(w1);

        let slow = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            w0.write_all(b"first\n").unwrap();
        });

        let (mut out, mut err) = (Vec::new(), Vec::new());
        OutputMerger::new(vec![o0, o1], None, &mut out, &mut err)
            .run()
            .unwrap();
        slow.join().unwrap();

        assert_eq!(out, b"first\nsecond\n");
    }

    #[test]
    fn test_closed_worker_leaves_rotation_in_place() {
        let (o0, mut w0, _) = fake_output(0, false);
        let (o1, mut w1, _) = fake_output(1, false);
        let (o2, mut w2, _) = fake_output(2, false);
        // Worker 1 handles r2 and then dies; the others pick up its share
        w0.write_all(b"r1\nr4\nr6\n").unwrap();
        w1.write_all(b"r2\n").unwrap();
        w2.write_all(b"r3\nr5\nr7\n").unwrap();
        drop((w0, w1, w2));

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let stats = OutputMerger::new(vec![o0, o1, o2], None, &mut out, &mut err)
            .run()
            .unwrap();

        assert_eq!(out, b"r1\nr2\nr3\nr4\nr5\nr6\nr7\n");
        assert_eq!(stats.retired, vec![1, 0, 2]);
    }

    #[test]
    fn test_stderr_rotation_is_independent() {
        let (o0, w0, e0) = fake_output(0, true);
        let (o1, mut w1, e1) = fake_output(1, true);
        let (mut e0, mut e1) = (e0.unwrap(), e1.unwrap());
        // Only worker 1 writes stdout; only worker 0 writes stderr twice
        drop(w0);
        w1.write_all(b"out\n").unwrap();
        drop(w1);
        e0.write_all(b"e1\ne3\n").unwrap();
        e1.write_all(b"e2\n").unwrap();
        drop((e0, e1));

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let stats = OutputMerger::new(vec![o0, o1], None, &mut out, &mut err)
            .run()
            .unwrap();

        assert_eq!(out, b"out\n");
        assert_eq!(err, b"e1\ne2\ne3\n");
        assert_eq!(stats.stderr_records, 3);
        assert_eq!(stats.retired.len(), 2);
    }

    #[test]
    fn test_relay_diagnostics_reach_error_sink() {
        let (o0, w0, _) = fake_output(0, false);
        drop(w0);
        let (relay_read, mut relay_write) = PipeFd::pair().unwrap();
        let relay = RecordStream::new(relay_read, Framing::default()).unwrap();
        relay_write.write_all(b"fanjoin: worker 3 dropped\n").unwrap();
        drop(relay_write);

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let stats = OutputMerger::new(vec![o0], Some(relay), &mut out, &mut err)
            .run()
            .unwrap();

        assert!(out.is_empty());
        assert_eq!(err, b"fanjoin: worker 3 dropped\n");
        assert_eq!(stats.diagnostics, 1);
    }

    /// A downstream that has gone away.
    struct ClosedSink;

    impl Write for ClosedSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_closed_sink_is_reported_as_output_failure() {
        let (o0, mut w0, _) = fake_output(0, false);
        w0.write_all(b"a\n").unwrap();
        drop(w0);

        let mut err = Vec::new();
        let result = OutputMerger::new(vec![o0], None, ClosedSink, &mut err).run();

        match result {
            Err(JoinError::Output { stream, source }) => {
                assert_eq!(stream, "stdout");
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("expected an output failure, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_error_sink_fails_relay_copy() {
        let (relay_read, mut relay_write) = PipeFd::pair().unwrap();
        let relay = RecordStream::new(relay_read, Framing::default()).unwrap();
        relay_write.write_all(b"fanjoin: note\n").unwrap();
        drop(relay_write);

        let mut out = Vec::new();
        let result = OutputMerger::new(Vec::new(), Some(relay), &mut out, ClosedSink).run();
        assert!(matches!(
            result,
            Err(JoinError::Output {
                stream: "stderr",
                ..
            })
        ));
    }

    #[test]
    fn test_no_workers_finishes_immediately() {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let stats = OutputMerger::new(Vec::new(), None, &mut out, &mut err)
            .run()
            .unwrap();
        assert_eq!(stats, MergeStats::default());
    }
}

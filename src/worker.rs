//! Worker subprocess spawning and lifecycle.
//!
//! A worker is one child running the target command with its stdin, stdout
//! and (optionally) stderr connected to pipes held by the parent. The parent
//! ends are close-on-exec, so a child only ever holds its own three
//! descriptors and can never keep a sibling's pipe open.

use crate::config::JoinConfig;
use crate::error::{JoinError, Result};
use crate::pipe::PipeFd;
use crate::record::RecordStream;
use crate::status::TerminationReason;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::io::{self, Write};
use std::os::unix::io::OwnedFd;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable carrying the worker's 0-based index.
pub const WORKER_INDEX_ENV: &str = "FANJOIN_WORKER";

/// Environment variable carrying the total number of workers.
pub const WORKER_COUNT_ENV: &str = "FANJOIN_WORKERS";

/// How long an abandoned worker gets between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_millis(10);

/// A freshly spawned worker with all of its endpoints.
#[derive(Debug)]
pub struct Worker {
    /// Write end of the worker's stdin.
    pub input: WorkerInput,
    /// Read ends of the worker's stdout and stderr.
    pub output: WorkerOutput,
    /// Process handle; declared last so pipes close before it is dropped.
    pub process: WorkerProcess,
}

impl Worker {
    /// Spawn worker number `index` of the pool described by `config`.
    pub fn spawn(config: &JoinConfig, index: usize) -> Result<Self> {
        let spawn_error = |source: io::Error| spawn_failure(config, index, source);

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        // Report to the worker its position and the pool size
        cmd.env(WORKER_INDEX_ENV, index.to_string());
        cmd.env(WORKER_COUNT_ENV, config.workers.to_string());

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        if config.serialize_stderr {
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stderr(Stdio::inherit()); // Unordered, straight to our stderr
        }

        let mut child = cmd.spawn().map_err(spawn_error)?;

        // From here on the guard reaps the child if anything below fails
        let process = WorkerProcess::new(index, Pid::from_raw(child.id() as i32));

        let stdin = child
            .stdin
            .take()
            .map(|h| PipeFd::new(OwnedFd::from(h)))
            .ok_or_else(|| spawn_error(io::Error::other("stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .map(|h| PipeFd::new(OwnedFd::from(h)))
            .ok_or_else(|| spawn_error(io::Error::other("stdout not captured")))?;
        let stderr = match child.stderr.take() {
            Some(h) => Some(PipeFd::new(OwnedFd::from(h))),
            None if config.serialize_stderr => {
                return Err(spawn_error(io::Error::other("stderr not captured")));
            }
            None => None,
        };

        // Workers spawned after this one must not inherit our ends
        let set_cloexec = |pipe: &PipeFd| {
            pipe.set_cloexec()
                .map_err(|e| spawn_error(io::Error::from_raw_os_error(e as i32)))
        };
        set_cloexec(&stdin)?;
        set_cloexec(&stdout)?;
        if let Some(stderr) = &stderr {
            set_cloexec(stderr)?;
        }

        let stdout = RecordStream::new(stdout, config.output_framing).map_err(spawn_error)?;
        let stderr = stderr
            .map(|pipe| RecordStream::new(pipe, config.error_framing))
            .transpose()
            .map_err(spawn_error)?;

        debug!(
            worker = index,
            pid = process.pid().as_raw(),
            serialize_stderr = config.serialize_stderr,
            "Spawned worker"
        );

        Ok(Self {
            input: WorkerInput::new(index, stdin),
            output: WorkerOutput {
                index,
                stdout,
                stderr,
            },
            process,
        })
    }
}

/// Any failure while bringing up worker `index` is a spawn error.
fn spawn_failure(config: &JoinConfig, index: usize, source: io::Error) -> JoinError {
    JoinError::Spawn {
        index,
        command: config.command_name(),
        source,
    }
}

/// Write end of a worker's stdin.
#[derive(Debug)]
pub struct WorkerInput {
    index: usize,
    pipe: PipeFd,
}

impl WorkerInput {
    pub fn new(index: usize, pipe: PipeFd) -> Self {
        Self { index, pipe }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Write one record with a single write call.
    ///
    /// A short write is reported as `WriteZero`: the worker got a truncated
    /// record and cannot be trusted with further input.
    pub fn send(&mut self, record: &[u8]) -> io::Result<()> {
        if record.is_empty() {
            return Ok(());
        }
        let written = self.pipe.write(record)?;
        if written < record.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", written, record.len()),
            ));
        }
        Ok(())
    }

    /// Close the write end, signalling EOF to the worker.
    pub fn close(self) {
        drop(self);
    }
}

/// Read ends of a worker's output streams.
#[derive(Debug)]
pub struct WorkerOutput {
    /// Position of the worker in the pool.
    pub index: usize,
    /// The worker's stdout.
    pub stdout: RecordStream,
    /// The worker's stderr, present only when stderr is serialized.
    pub stderr: Option<RecordStream>,
}

/// Handle to a worker process used for reaping.
#[derive(Debug)]
pub struct WorkerProcess {
    index: usize,
    pid: Pid,
    /// Whether the process has been reaped
    reaped: bool,
}

impl WorkerProcess {
    pub fn new(index: usize, pid: Pid) -> Self {
        Self {
            index,
            pid,
            reaped: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Wait for the process to exit (blocking), retrying on EINTR.
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if self.reaped {
            return Err(JoinError::Io(io::Error::other(format!(
                "worker {} already reaped",
                self.index
            ))));
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    self.reaped = true;
                    return Ok(status.into());
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if self.reaped {
            return Ok(None);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(status.into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)?;
        Ok(())
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        warn!(
            worker = self.index,
            pid = self.pid.as_raw(),
            "Terminating abandoned worker"
        );
        let _ = self.terminate();
        std::thread::sleep(TERMINATE_GRACE);

        if let Ok(Some(_)) = self.try_wait() {
            return;
        }

        let _ = signal::kill(self.pid, Signal::SIGKILL);
        while let Err(Errno::EINTR) = waitpid(self.pid, None) {}
        self.reaped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ReadOutcome;
    use std::num::NonZeroUsize;

    fn sh(script: &str) -> JoinConfig {
        JoinConfig::new("sh").with_args(["-c", script])
    }

    fn wait_readable(stream: &RecordStream) {
        use std::os::unix::io::AsFd;
        crate::pipe::wait_any_readable(&[stream.as_fd()]).unwrap();
    }

    #[test]
    fn test_spawn_echo_roundtrip() {
        let config = JoinConfig::new("cat");
        let mut worker = Worker::spawn(&config, 0).expect("Failed to spawn cat");
        assert!(worker.output.stderr.is_none());

        worker.input.send(b"ping\n").unwrap();
        let Worker {
            input,
            output,
            mut process,
        } = worker;
        input.close();
        let mut stdout = output.stdout;

        let mut out = Vec::new();
        loop {
            match stdout.read_record(&mut out).unwrap() {
                ReadOutcome::Record(_) => continue,
                ReadOutcome::Eof => break,
                ReadOutcome::WouldBlock => wait_readable(&stdout),
            }
        }
        assert_eq!(out, b"ping\n");
        assert_eq!(process.wait().unwrap(), TerminationReason::Exited(0));
    }

    #[test]
    fn test_worker_environment() {
        let config = sh("echo \"$FANJOIN_WORKER/$FANJOIN_WORKERS\"")
            .with_workers(NonZeroUsize::new(3).unwrap());
        let Worker {
            output,
            mut process,
            ..
        } = Worker::spawn(&config, 2).unwrap();
        let mut stdout = output.stdout;

        assert_eq!(process.wait().unwrap(), TerminationReason::Exited(0));
        let mut out = Vec::new();
        wait_readable(&stdout);
        assert!(matches!(
            stdout.read_record(&mut out).unwrap(),
            ReadOutcome::Record(_)
        ));
        assert_eq!(out, b"2/3\n");
    }

    #[test]
    fn test_serialized_stderr_is_piped() {
        let config = sh("echo oops >&2").with_serialize_stderr(true);
        let Worker {
            output,
            mut process,
            ..
        } = Worker::spawn(&config, 0).unwrap();

        let mut stderr = output.stderr.expect("stderr should be captured");
        assert_eq!(process.wait().unwrap(), TerminationReason::Exited(0));

        let mut out = Vec::new();
        wait_readable(&stderr);
        assert!(matches!(
            stderr.read_record(&mut out).unwrap(),
            ReadOutcome::Record(_)
        ));
        assert_eq!(out, b"oops\n");
    }

    #[test]
    fn test_exit_status_reported() {
        let config = sh("exit 3");
        let mut worker = Worker::spawn(&config, 0).unwrap();
        assert_eq!(worker.process.wait().unwrap(), TerminationReason::Exited(3));
    }

    #[test]
    fn test_spawn_missing_command_fails() {
        let config = JoinConfig::new("/nonexistent/fanjoin-test-command");
        let err = Worker::spawn(&config, 1).unwrap_err();
        assert!(matches!(err, JoinError::Spawn { index: 1, .. }));
    }

    #[test]
    fn test_setup_errno_is_spawn_error() {
        let config = JoinConfig::new("cat");
        let source = io::Error::from_raw_os_error(Errno::EBADF as i32);
        let err = spawn_failure(&config, 2, source);
        assert!(matches!(err, JoinError::Spawn { index: 2, .. }));
        assert!(err.to_string().contains("worker 2 (cat)"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_drop_reaps_running_worker() {
        let config = JoinConfig::new("sleep").with_args(["60"]);
        let worker = Worker::spawn(&config, 0).unwrap();
        let pid = worker.process.pid();
        drop(worker);

        // Already reaped: waitpid now reports no such child
        assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
    }

    #[test]
    fn test_send_writes_whole_record() {
        use std::io::Read;

        let (mut reader, writer) = PipeFd::pair().unwrap();
        let mut input = WorkerInput::new(0, writer);
        input.send(b"fits easily\n").unwrap();
        input.send(b"").unwrap();
        input.close();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"fits easily\n");
    }

    #[test]
    fn test_send_to_closed_reader_fails() {
        let (reader, writer) = PipeFd::pair().unwrap();
        drop(reader);
        let mut input = WorkerInput::new(0, writer);
        let err = input.send(b"lost\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}

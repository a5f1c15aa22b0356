//! Worker termination analysis.
//!
//! Turns a raw `WaitStatus` into something the orchestrator can aggregate
//! into a single exit code.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Offset shells add to a signal number to form an exit status.
const SIGNAL_EXIT_BASE: i32 = 128;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Any other wait status (stopped, continued, ...).
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Exit code to report for this termination.
    ///
    /// Signals map to `128 + signo`, the convention shells use.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(sig) => SIGNAL_EXIT_BASE + *sig as i32,
            Self::Unknown => 1,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {}", sig),
            Self::Unknown => "terminated for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, _) => Self::Signaled(signal),
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_success() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(3).is_success());
        assert!(!TerminationReason::Signaled(Signal::SIGTERM).is_success());
        assert!(!TerminationReason::Unknown.is_success());
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(TerminationReason::Exited(0).exit_code(), 0);
        assert_eq!(TerminationReason::Exited(3).exit_code(), 3);
        assert_eq!(TerminationReason::Signaled(Signal::SIGKILL).exit_code(), 137);
        assert_eq!(TerminationReason::Signaled(Signal::SIGTERM).exit_code(), 143);
        assert_eq!(TerminationReason::Unknown.exit_code(), 1);
    }

    #[test]
    fn test_from_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            TerminationReason::from(WaitStatus::Exited(pid, 3)),
            TerminationReason::Exited(3)
        );
        assert_eq!(
            TerminationReason::from(WaitStatus::Signaled(pid, Signal::SIGSEGV, false)),
            TerminationReason::Signaled(Signal::SIGSEGV)
        );
        assert_eq!(
            TerminationReason::from(WaitStatus::StillAlive),
            TerminationReason::Unknown
        );
    }

    #[test]
    fn test_description() {
        assert_eq!(TerminationReason::Exited(2).to_string(), "exited with code 2");
        assert!(
            TerminationReason::Signaled(Signal::SIGINT)
                .to_string()
                .contains("SIGINT")
        );
    }
}

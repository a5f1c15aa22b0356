//! Diagnostic relay from the feeder to the joiner.
//!
//! The feeder never writes to stderr itself while the joiner is merging
//! worker stderr; it sends one newline-terminated message per diagnostic
//! through this pipe and the joiner copies them to the shared error sink.

use crate::config::Framing;
use crate::pipe::PipeFd;
use crate::record::RecordStream;
use std::fmt::Display;
use std::io::{self, Write};
use std::os::unix::io::AsFd;
use tracing::debug;

/// Prefix put in front of every relayed diagnostic.
pub const DIAGNOSTIC_PREFIX: &str = "fanjoin";

/// Sending half of the diagnostic relay.
#[derive(Debug)]
pub struct DiagnosticRelay {
    pipe: PipeFd,
}

impl DiagnosticRelay {
    /// Create the relay pipe, returning the sender and the joiner's stream.
    pub fn channel() -> io::Result<(Self, RecordStream)> {
        let (read_end, write_end) =
            PipeFd::pair().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let stream = RecordStream::new(read_end, Framing::default())?;
        Ok((Self { pipe: write_end }, stream))
    }

    /// Relay one diagnostic message.
    ///
    /// The joiner only stops reading before EOF when it failed, and its own
    /// error is what the run reports then. A message it can no longer take
    /// is dropped.
    pub fn report(&mut self, message: impl Display) {
        let line = format_diagnostic(&message);
        if let Err(e) = self.pipe.write_all(line.as_bytes()) {
            debug!(
                error = %e,
                message = line.trim_end(),
                "Diagnostic relay closed, message dropped"
            );
        }
    }

    /// A second write end of the relay for log output.
    ///
    /// The joiner sees EOF only once this and the relay itself are closed.
    pub fn log_sink(&self) -> io::Result<PipeFd> {
        self.pipe.as_fd().try_clone_to_owned().map(PipeFd::from)
    }

    /// Close the relay, signalling EOF to the joiner.
    pub fn close(self) {
        drop(self);
    }
}

/// Render a diagnostic as one newline-terminated record.
///
/// Embedded newlines are flattened so a message is always exactly one record.
fn format_diagnostic(message: &dyn Display) -> String {
    let text = message.to_string().replace('\n', " ");
    format!("{}: {}\n", DIAGNOSTIC_PREFIX, text)
}

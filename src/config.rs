//! Immutable run configuration.
//!
//! Built once (usually from the command line) and passed by reference into
//! every component constructor.

use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// How records are framed on one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    /// Byte terminating every record.
    pub delimiter: u8,
    /// Whether the delimiter is forwarded along with the record.
    pub keep_delimiter: bool,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            delimiter: b'\n',
            keep_delimiter: true,
        }
    }
}

impl Framing {
    pub fn new(delimiter: u8, keep_delimiter: bool) -> Self {
        Self {
            delimiter,
            keep_delimiter,
        }
    }

    /// Same delimiter, but dropped from forwarded records.
    pub fn stripped(self) -> Self {
        Self {
            keep_delimiter: false,
            ..self
        }
    }

    /// Length of the part of `record` that should be forwarded.
    ///
    /// `record` may or may not end with the delimiter (the last record of a
    /// stream can be unterminated).
    pub fn forwarded_len(&self, record: &[u8]) -> usize {
        if !self.keep_delimiter && record.last() == Some(&self.delimiter) {
            record.len() - 1
        } else {
            record.len()
        }
    }
}

/// Where input records come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InputSource {
    /// The process's own standard input.
    #[default]
    Stdin,
    /// A file opened at startup.
    File(PathBuf),
}

/// Everything a run needs to know, fixed before the first worker is spawned.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// Program every worker executes.
    pub command: OsString,
    /// Arguments passed to every worker.
    pub args: Vec<OsString>,
    /// Number of worker processes.
    pub workers: NonZeroUsize,
    /// Input source (default: stdin).
    pub input: InputSource,
    /// Framing for records read from the input and written to workers.
    pub input_framing: Framing,
    /// Framing for records merged from worker stdout.
    pub output_framing: Framing,
    /// Framing for records merged from worker stderr.
    pub error_framing: Framing,
    /// Merge worker stderr through the ordered pipeline instead of inheriting it.
    pub serialize_stderr: bool,
}

impl JoinConfig {
    /// Configuration for a single worker running `command` with newline framing.
    pub fn new(command: impl Into<OsString>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            workers: NonZeroUsize::MIN,
            input: InputSource::Stdin,
            input_framing: Framing::default(),
            output_framing: Framing::default(),
            error_framing: Framing::default(),
            serialize_stderr: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_input(mut self, input: InputSource) -> Self {
        self.input = input;
        self
    }

    /// Use `delimiter` on every stream, keeping the per-stream keep flags.
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.input_framing.delimiter = delimiter;
        self.output_framing.delimiter = delimiter;
        self.error_framing.delimiter = delimiter;
        self
    }

    pub fn with_input_framing(mut self, framing: Framing) -> Self {
        self.input_framing = framing;
        self
    }

    pub fn with_output_framing(mut self, framing: Framing) -> Self {
        self.output_framing = framing;
        self
    }

    pub fn with_error_framing(mut self, framing: Framing) -> Self {
        self.error_framing = framing;
        self
    }

    pub fn with_serialize_stderr(mut self, enabled: bool) -> Self {
        self.serialize_stderr = enabled;
        self
    }

    /// Human-readable command name for diagnostics.
    pub fn command_name(&self) -> String {
        self.command.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_default() {
        let framing = Framing::default();
        assert_eq!(framing.delimiter, b'\n');
        assert!(framing.keep_delimiter);
    }

    #[test]
    fn test_forwarded_len() {
        let keep = Framing::default();
        let strip = keep.stripped();

        assert_eq!(keep.forwarded_len(b"abc\n"), 4);
        assert_eq!(strip.forwarded_len(b"abc\n"), 3);
        // Unterminated final record is forwarded whole
        assert_eq!(strip.forwarded_len(b"abc"), 3);
        assert_eq!(strip.forwarded_len(b""), 0);
    }

    #[test]
    fn test_join_config_defaults() {
        let config = JoinConfig::new("cat");
        assert_eq!(config.command, OsString::from("cat"));
        assert!(config.args.is_empty());
        assert_eq!(config.workers.get(), 1);
        assert_eq!(config.input, InputSource::Stdin);
        assert!(!config.serialize_stderr);
    }

    #[test]
    fn test_join_config_builder() {
        let config = JoinConfig::new("sh")
            .with_args(["-c", "cat"])
            .with_workers(NonZeroUsize::new(4).unwrap())
            .with_delimiter(0)
            .with_output_framing(Framing::new(0, false))
            .with_input(InputSource::File(PathBuf::from("/tmp/input")))
            .with_serialize_stderr(true);

        assert_eq!(config.args, vec![OsString::from("-c"), OsString::from("cat")]);
        assert_eq!(config.workers.get(), 4);
        assert_eq!(config.input_framing.delimiter, 0);
        assert_eq!(config.error_framing.delimiter, 0);
        assert!(!config.output_framing.keep_delimiter);
        assert!(config.input_framing.keep_delimiter);
        assert!(config.serialize_stderr);
        assert_eq!(config.command_name(), "sh");
    }
}

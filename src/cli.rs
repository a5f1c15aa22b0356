//! Command-line interface definitions using clap.

use crate::config::{Framing, InputSource, JoinConfig};
use crate::escape::parse_delimiter;
use crate::logging::{LogConfig, LogFormat};
use crate::version;
use clap::{CommandFactory, Parser};
use clap_complete::Shell;
use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// Run a command in parallel workers, keeping output in input order.
///
/// Input records are dealt round-robin to COMMAND's workers, and their
/// output is collected in the same rotation, so the Nth output record
/// belongs to the Nth input record for any command that answers each
/// record with exactly one record.
#[derive(Parser, Debug)]
#[command(name = "fanjoin")]
#[command(author, version = version::clap_version(), long_version = version::long_version(), about)]
pub struct Cli {
    /// Number of worker processes.
    #[arg(short = 'c', long, value_name = "N", default_value_t = NonZeroUsize::MIN)]
    pub workers: NonZeroUsize,

    /// Input record delimiter (a character or an escape such as '\0', '\x1e').
    #[arg(short, long, value_name = "CHAR", value_parser = parse_delimiter, default_value = "\\n")]
    pub delimiter: u8,

    /// Delimiter of worker stdout records [default: input delimiter].
    #[arg(long, value_name = "CHAR", value_parser = parse_delimiter)]
    pub output_delimiter: Option<u8>,

    /// Delimiter of worker stderr records [default: input delimiter].
    #[arg(long, value_name = "CHAR", value_parser = parse_delimiter)]
    pub error_delimiter: Option<u8>,

    /// Read input records from a file instead of stdin ('-' for stdin).
    #[arg(short = 'f', long, value_name = "PATH")]
    pub input: Option<PathBuf>,

    /// Strip the delimiter from merged stdout records.
    #[arg(short = 'n', long)]
    pub strip_delimiter: bool,

    /// Strip the delimiter from records before handing them to workers.
    #[arg(long)]
    pub strip_input_delimiter: bool,

    /// Strip the delimiter from merged stderr records.
    #[arg(long, requires = "serialize_stderr")]
    pub strip_error_delimiter: bool,

    /// Merge worker stderr in rotation order too, instead of passing it through.
    #[arg(short = 'e', long)]
    pub serialize_stderr: bool,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log format: pretty, compact or json.
    #[arg(long, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    /// Print shell completions and exit.
    #[arg(long, value_enum, value_name = "SHELL", exclusive = true)]
    pub completions: Option<Shell>,

    /// Command to run in every worker, followed by its arguments.
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        required_unless_present = "completions"
    )]
    pub command: Vec<OsString>,
}

impl Cli {
    /// Build the run configuration, or `None` when no command was given.
    pub fn join_config(&self) -> Option<JoinConfig> {
        let (command, args) = self.command.split_first()?;

        let input = match &self.input {
            Some(path) if path.as_os_str() != "-" => InputSource::File(path.clone()),
            _ => InputSource::Stdin,
        };

        let config = JoinConfig::new(command.clone())
            .with_args(args.iter().cloned())
            .with_workers(self.workers)
            .with_input(input)
            .with_input_framing(Framing::new(self.delimiter, !self.strip_input_delimiter))
            .with_output_framing(Framing::new(
                self.output_delimiter.unwrap_or(self.delimiter),
                !self.strip_delimiter,
            ))
            .with_error_framing(Framing::new(
                self.error_delimiter.unwrap_or(self.delimiter),
                !self.strip_error_delimiter,
            ))
            .with_serialize_stderr(self.serialize_stderr);
        Some(config)
    }

    /// Logging configuration from the verbosity flags, then the environment.
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::from_verbosity(self.verbose, self.quiet)
            .with_ansi(!self.no_color)
            .with_env_overrides();
        if let Some(format) = self.log_format {
            config = config.with_format(format);
        }
        if let Some(path) = &self.log_file {
            config = config.with_file(path.clone());
        }
        config
    }
}

/// Print completions for `shell` to stdout.
pub fn print_completions(shell: Shell) {
    clap_complete::generate(
        shell,
        &mut Cli::command(),
        "fanjoin",
        &mut std::io::stdout(),
    );
}

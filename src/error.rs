//! Typed failures raised by the build pipeline.
//!
//! Stage code returns `anyhow::Result` and attaches context as it goes; the
//! variants here sit at the bottom of those chains so callers (and tests) can
//! `downcast_ref::<BuildError>()` to learn *why* a stage stopped.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// An external process exited unsuccessfully.
    #[error("running \"{}\" failed with {}", format_argv(.argv), ExitDisplay(.exit_code))]
    ToolFailure {
        argv: Vec<String>,
        /// `None` when the process was killed by a signal.
        exit_code: Option<i32>,
    },

    /// A build product or required input is absent.
    #[error("{what} missing: {}", .path.display())]
    MissingArtifact { what: String, path: PathBuf },

    #[error("missing arch-specific file {} (needed for {})", .variant.display(), .canonical.display())]
    MissingArchVariant { canonical: PathBuf, variant: PathBuf },

    /// A foreign build description could not be parsed, or referenced an
    /// identifier that could not be resolved within one level of indirection.
    #[error("cannot extract headers from {}: {reason}", .path.display())]
    ForeignDescriptionParseFailure { path: PathBuf, reason: String },

    #[error("{strategy}: {reason}")]
    MountFailure { strategy: &'static str, reason: String },

    /// Two build units would install to the same destination.
    #[error("{} is installed by both '{first}' and '{second}'", .destination.display())]
    OverlappingInstall {
        destination: PathBuf,
        first: String,
        second: String,
    },

    /// Aggregated report from the worker pool.
    #[error("{} of {total} build units failed:\n{}", failure_count(.failures), format_failures(.failures))]
    UnitFailures {
        total: usize,
        failures: Vec<(String, String)>,
    },
}

struct ExitDisplay<'a>(&'a Option<i32>);

impl fmt::Display for ExitDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("termination by signal"),
        }
    }
}

fn format_argv(argv: &[String]) -> String {
    argv.join(" ")
}

fn failure_count(failures: &[(String, String)]) -> usize {
    failures.len()
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(unit, err)| format!("  {unit}: {err}"))
        .collect::<Vec<_>>()
        .join("\n")
}

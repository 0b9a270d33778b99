use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the toolkit.
///
/// Everything propagates up to the binary entry point, which logs the error
/// and exits non-zero; nothing below `main` terminates the process.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad flags or an unusable template, raised before any side effect.
    #[error("configuration error: {0}")]
    Config(String),

    /// A check on the world failed: bad segment name, wrong segment size,
    /// missing pg_controldata field.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A filesystem operation failed; carries the path it failed on.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An external program exited non-zero, died on a signal, or could not
    /// be spawned at all.
    #[error("{program} failed: {detail}")]
    External { program: String, detail: String },

    /// A bounded wait (for a WAL file, for a sentinel) ran out.
    #[error("gave up waiting for {what} after {} seconds", limit.as_secs())]
    WaitTimeout { what: String, limit: Duration },

    /// The finish trigger (or SIGUSR1) requested immediate termination.
    #[error("finish trigger requested immediate termination")]
    FinishNow,

    /// The request cannot be served but the condition is routine; logged
    /// at info level rather than error level, still exits non-zero.
    #[error("{0}")]
    NotAvailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn external(program: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::External {
            program: program.into(),
            detail: detail.into(),
        }
    }

    /// True for conditions that should not be logged as errors.
    pub fn is_quiet(&self) -> bool {
        matches!(self, Self::NotAvailable(_))
    }
}

/// Attach the operated-on path to a raw `io::Result`.
pub trait IoResultExt<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| Error::io(path.as_ref(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let err = Error::Config("missing --state-dir".into());
        assert_eq!(err.to_string(), "configuration error: missing --state-dir");
    }

    #[test]
    fn io_errors_carry_the_path() {
        let err = std::fs::read("/nonexistent/segment").at("/nonexistent/segment");
        let msg = err.unwrap_err().to_string();
        assert!(msg.starts_with("/nonexistent/segment: "), "{msg}");
    }

    #[test]
    fn quiet_errors() {
        assert!(Error::NotAvailable("no history file".into()).is_quiet());
        assert!(!Error::FinishNow.is_quiet());
    }
}

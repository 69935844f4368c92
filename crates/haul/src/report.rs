use std::fmt;

use crate::FetchError;

/// A job that never reached its output.
#[derive(Debug)]
pub struct Failure {
    pub url: String,
    pub output: Option<String>,
    pub reason: FetchError,
}

/// Totals of one session run.
///
/// Every job, including jobs derived from a two-stage match, ends up either in `succeeded` or in
/// `failures`.
#[derive(Debug, Default)]
pub struct Report {
    pub total: usize,
    pub succeeded: usize,
    /// Connections reset at least once.
    pub resets: usize,
    pub peak_in_flight: usize,
    pub failures: Vec<Failure>,
    /// Resolved URLs recorded in links-only mode.
    pub links: Vec<String>,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Got {} of {}", self.succeeded, self.total)?;
        if self.resets > 0 {
            write!(f, " (Reset {})", self.resets)?;
        }

        for failure in &self.failures {
            write!(f, "\n  {}", failure.url)?;
            if let Some(output) = &failure.output {
                write!(f, " ({})", output)?;
            }
            write!(f, ": {}", failure.reason)?;
        }

        Ok(())
    }
}

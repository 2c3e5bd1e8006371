//! Builder error types.

use std::fmt;

use shipyard_bus::BusError;
use thiserror::Error;

/// A stage of job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Workspace,
    Clone,
    Checkout,
    Detect,
    Install,
    Build,
    Package,
    Upload,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Workspace => "workspace",
            Step::Clone => "clone",
            Step::Checkout => "checkout",
            Step::Detect => "detect",
            Step::Install => "install",
            Step::Build => "build",
            Step::Package => "package",
            Step::Upload => "upload",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A build step that did not succeed. Terminal for the build, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{step} failed: {reason}")]
pub struct StepFailure {
    pub step: Step,
    pub reason: String,
}

impl StepFailure {
    pub fn new(step: Step, reason: impl Into<String>) -> Self {
        Self {
            step,
            reason: reason.into(),
        }
    }
}

/// Failures that are not the build's fault.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

pub type BuilderResult<T> = std::result::Result<T, BuilderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_names_the_step() {
        let failure = StepFailure::new(Step::Clone, "exit status: 128");
        assert_eq!(failure.to_string(), "clone failed: exit status: 128");
    }
}

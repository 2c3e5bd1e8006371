//! Topic catalogue.

use std::fmt;
use std::str::FromStr;

use crate::BusError;

/// The topics connecting Shipyard components. Every message is keyed by the
/// build id it concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Submissions from the entry point, consumed by the orchestrator.
    BuildRequests,
    /// Jobs dispatched by the orchestrator, consumed by builders.
    BuildJobs,
    BuildStatus,
    BuildLogs,
    BuildCompletions,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::BuildRequests,
        Topic::BuildJobs,
        Topic::BuildStatus,
        Topic::BuildLogs,
        Topic::BuildCompletions,
    ];

    /// Topics carrying progress events about builds.
    pub const PROGRESS: [Topic; 3] = [Topic::BuildStatus, Topic::BuildLogs, Topic::BuildCompletions];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::BuildRequests => "build-requests",
            Topic::BuildJobs => "build-jobs",
            Topic::BuildStatus => "build-status",
            Topic::BuildLogs => "build-logs",
            Topic::BuildCompletions => "build-completions",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| BusError::TopicNotFound(s.to_string()))
    }
}

/// Comma-separated topic names, for logs and errors.
pub(crate) fn describe(topics: &[Topic]) -> String {
    topics
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::BuildJobs.to_string(), "build-jobs");
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
        assert!(matches!(
            "build-everything".parse::<Topic>(),
            Err(BusError::TopicNotFound(_))
        ));
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(&[Topic::BuildStatus, Topic::BuildLogs]),
            "build-status,build-logs"
        );
    }
}

// src/core/outcome.rs
use std::fmt;

use super::model::StageStatus;

/// Result of invoking an external tool or API. Never carries a panic or an error past the call site.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome<T> {
    Success(T),
    /// Not installed, not permitted, or not configured
    Unavailable(String),
    /// Ran out of time; whatever was produced before the cut-off
    TimedOut { partial: Option<T> },
    Failed(String),
}

impl<T> ToolOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ToolOutcome::Unavailable(_))
    }

    /// The produced value, including a partial one after a timeout
    pub fn into_value(self) -> Option<T> {
        match self {
            ToolOutcome::Success(value) => Some(value),
            ToolOutcome::TimedOut { partial } => partial,
            _ => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ToolOutcome<U> {
        match self {
            ToolOutcome::Success(value) => ToolOutcome::Success(f(value)),
            ToolOutcome::Unavailable(reason) => ToolOutcome::Unavailable(reason),
            ToolOutcome::TimedOut { partial } => ToolOutcome::TimedOut { partial: partial.map(f) },
            ToolOutcome::Failed(reason) => ToolOutcome::Failed(reason),
        }
    }

    /// Chain a fallible step onto a successful outcome
    pub fn and_then<U, F: FnOnce(T) -> ToolOutcome<U>>(self, f: F) -> ToolOutcome<U> {
        match self {
            ToolOutcome::Success(value) => f(value),
            ToolOutcome::Unavailable(reason) => ToolOutcome::Unavailable(reason),
            ToolOutcome::TimedOut { .. } => ToolOutcome::TimedOut { partial: None },
            ToolOutcome::Failed(reason) => ToolOutcome::Failed(reason),
        }
    }
}

impl<T> fmt::Display for ToolOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolOutcome::Success(_) => write!(f, "success"),
            ToolOutcome::Unavailable(reason) => write!(f, "unavailable: {}", reason),
            ToolOutcome::TimedOut { partial: Some(_) } => write!(f, "timed out with partial output"),
            ToolOutcome::TimedOut { partial: None } => write!(f, "timed out"),
            ToolOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Result of a whole stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Complete(T),
    Partial { value: T, reason: String },
    Skipped(String),
    Failed(String),
}

impl<T> StageOutcome<T> {
    pub fn status(&self) -> StageStatus {
        match self {
            StageOutcome::Complete(_) => StageStatus::Complete,
            StageOutcome::Partial { .. } => StageStatus::Partial,
            StageOutcome::Skipped(_) => StageStatus::Skipped,
            StageOutcome::Failed(_) => StageStatus::Failed,
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            StageOutcome::Complete(_) => None,
            StageOutcome::Partial { reason, .. } => Some(reason.clone()),
            StageOutcome::Skipped(reason) | StageOutcome::Failed(reason) => Some(reason.clone()),
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, StageOutcome::Partial { .. })
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            StageOutcome::Complete(value) | StageOutcome::Partial { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            StageOutcome::Complete(value) | StageOutcome::Partial { value, .. } => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_out_keeps_partial_value() {
        let outcome: ToolOutcome<Vec<u16>> = ToolOutcome::TimedOut { partial: Some(vec![80]) };
        assert_eq!(outcome.map(|ports| ports.len()).into_value(), Some(1));

        let outcome: ToolOutcome<Vec<u16>> = ToolOutcome::Unavailable("nmap not installed".to_string());
        assert!(outcome.is_unavailable());
        assert_eq!(outcome.into_value(), None);
    }

    #[test]
    fn test_stage_outcome_status() {
        let outcome = StageOutcome::Partial { value: 3, reason: "deadline".to_string() };
        assert_eq!(outcome.status(), StageStatus::Partial);
        assert_eq!(outcome.message().as_deref(), Some("deadline"));
        assert_eq!(outcome.into_value(), Some(3));

        let skipped: StageOutcome<u8> = StageOutcome::Skipped("disabled".to_string());
        assert_eq!(skipped.status(), StageStatus::Skipped);
        assert!(skipped.value().is_none());
    }
}

use std::fmt;

use thiserror::Error;

/// One invalid setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: &'static str,
    pub message: String,
}

impl Violation {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(Violation::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Startup configuration errors. Validation reports every violation at once.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {}", join(.0))]
    Invalid(Vec<Violation>),
    #[error("failed to read configuration from environment: {0}")]
    Env(#[from] envconfig::Error),
}

impl ConfigError {
    /// `Ok` when nothing was violated
    pub fn check(violations: Vec<Violation>) -> Result<(), ConfigError> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(violations))
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            ConfigError::Invalid(violations) => violations,
            ConfigError::Env(_) => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_reports_all_violations() {
        assert!(ConfigError::check(Vec::new()).is_ok());

        let err = ConfigError::check(vec![
            Violation::new("max_messages", "must be at least 1"),
            Violation::new("commit_interval_ms", "must be positive"),
        ])
        .unwrap_err();

        assert_eq!(err.violations().len(), 2);
        assert_eq!(
            err.to_string(),
            "invalid configuration: max_messages must be at least 1; commit_interval_ms must be positive"
        );
    }
}

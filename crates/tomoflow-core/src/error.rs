use std::path::PathBuf;

use thiserror::Error;

use crate::stage::Stage;

#[derive(Error, Debug)]
pub enum TomoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error in `{field}`: {reason}")]
    Configuration { field: String, reason: String },

    #[error("Ledger I/O error at {}: {reason}", path.display())]
    LedgerIo { path: PathBuf, reason: String },

    #[error("No eligible units for {stage}: {predecessor} has not completed any unit")]
    StageDependency { stage: Stage, predecessor: Stage },

    #[error("Illegal ledger transition for unit {unit}: {from} -> {to}")]
    IllegalTransition {
        unit: String,
        from: String,
        to: String,
    },

    #[error("Unknown unit: {0}")]
    UnknownUnit(String),
}

impl TomoError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::config(field, "required value is missing")
    }

    pub fn ledger_io(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::LedgerIo {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that must abort a stage before any unit is dispatched.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

pub type Result<T> = std::result::Result<T, TomoError>;

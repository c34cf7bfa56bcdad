//! Engine error taxonomy.
//!
//! Every error carries an [`ErrorContext`] naming the operation and, where known, the
//! user and day it concerned, so a log line alone is enough to act on.

use chrono::NaiveDate;
use std::fmt;
use thiserror::Error;

use crate::db::StoreError;

/// Where an error happened
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: &'static str,
    pub user_id: Option<String>,
    pub date: Option<NaiveDate>,
}

impl ErrorContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            user_id: None,
            date: None,
        }
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation={}", self.operation)?;
        if let Some(user_id) = &self.user_id {
            write!(f, " user_id={}", user_id)?;
        }
        if let Some(date) = &self.date {
            write!(f, " date={}", date)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation failed: {message} ({context})")]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("{entity} not found: {id} ({context})")]
    NotFound {
        entity: &'static str,
        id: String,
        context: ErrorContext,
    },

    #[error("backend unavailable: {source} ({context})")]
    BackendUnavailable {
        #[source]
        source: StoreError,
        context: ErrorContext,
    },

    #[error("conflicting concurrent update: {message} ({context})")]
    Conflict {
        message: String,
        context: ErrorContext,
    },
}

impl EngineError {
    pub fn validation(message: impl Into<String>, context: ErrorContext) -> Self {
        EngineError::Validation {
            message: message.into(),
            context,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>, context: ErrorContext) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
            context,
        }
    }

    /// Classify a backend failure
    pub fn from_store(err: StoreError, context: ErrorContext) -> Self {
        match err {
            StoreError::NotFound(key) => EngineError::NotFound {
                entity: "document",
                id: key.to_string(),
                context,
            },
            StoreError::PreconditionFailed(key) => EngineError::Conflict {
                message: format!("{} changed concurrently", key),
                context,
            },
            other => EngineError::BackendUnavailable {
                source: other,
                context,
            },
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            EngineError::Validation { context, .. }
            | EngineError::NotFound { context, .. }
            | EngineError::BackendUnavailable { context, .. }
            | EngineError::Conflict { context, .. } => context,
        }
    }

    /// Short machine-readable kind, used as a metric/log label
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "validation",
            EngineError::NotFound { .. } => "not_found",
            EngineError::BackendUnavailable { .. } => "backend_unavailable",
            EngineError::Conflict { .. } => "conflict",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DocKey;

    #[test]
    fn test_context_is_rendered_in_messages() {
        let err = EngineError::validation(
            "power must be positive",
            ErrorContext::new("claim_or_create_device")
                .user("u1")
                .date(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()),
        );
        assert_eq!(
            err.to_string(),
            "validation failed: power must be positive \
             (operation=claim_or_create_device user_id=u1 date=2024-06-01)"
        );
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_store_errors_are_classified() {
        let ctx = ErrorContext::new("update_device").user("u1");

        let conflict = EngineError::from_store(
            StoreError::PreconditionFailed(DocKey::new("devices", "d1")),
            ctx.clone(),
        );
        assert!(matches!(conflict, EngineError::Conflict { .. }));

        let unavailable =
            EngineError::from_store(StoreError::Unavailable("timeout".to_string()), ctx.clone());
        assert!(matches!(unavailable, EngineError::BackendUnavailable { .. }));
        assert_eq!(unavailable.context(), &ctx);

        let missing =
            EngineError::from_store(StoreError::NotFound(DocKey::new("devices", "d9")), ctx);
        assert!(matches!(missing, EngineError::NotFound { .. }));
    }
}

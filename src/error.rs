use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

/// A structured application error that can be serialized and surfaced to a
/// client as `{ message, statusCode }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message that can be shown directly to the user.
    pub message: String,
    /// HTTP status the error maps to when it reaches the route surface.
    pub status_code: u16,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default)]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default)]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    /// Construct a new application error with the provided code and message.
    /// The status defaults to 500 until a more specific constructor refines it.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            status_code: 500,
            context: HashMap::new(),
            cause: None,
        }
    }

    /// Bad request: unknown property, malformed filter, required field null.
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::new("REQUEST/VALIDATION", message).with_status(400)
    }

    /// The caller is not authorized for the attempted action.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        AppError::new("REQUEST/NOT_AUTHORIZED", message).with_status(401)
    }

    /// Unknown feather, missing object.
    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::new("REQUEST/NOT_FOUND", message).with_status(404)
    }

    /// Stale etag, foreign lock, duplicate natural key.
    pub fn conflict(message: impl Into<String>) -> Self {
        AppError::new("REQUEST/CONFLICT", message).with_status(409)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = status;
        self
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

// The wire shape is camelCase and omits empty fields; `code` and `context`
// ride along for log correlation.
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut fields = 2;
        if !self.context.is_empty() {
            fields += 1;
        }
        let mut state = serializer.serialize_struct("AppError", fields + 1)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("statusCode", &self.status_code)?;
        state.serialize_field("code", &self.code)?;
        if !self.context.is_empty() {
            state.serialize_field("context", &self.context)?;
        }
        state.end()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string()).with_status(400);
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => {
                AppError::new("SQLX/ROW_NOT_FOUND", "Record not found").with_status(404)
            }
            SqlxError::ColumnNotFound(name) => {
                AppError::new("SQLX/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            SqlxError::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                let mut app_error = AppError::new(code, db.message().to_string());
                if let Some(constraint) = db.constraint() {
                    app_error = app_error
                        .with_status(409)
                        .with_context("constraint", constraint.to_string());
                }
                app_error
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                    .with_context("column_index", index.to_string())
            }
            SqlxError::Decode(decode_err) => AppError::new("SQLX/DECODE", decode_err.to_string()),
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn builds_error_with_context_and_cause() {
        let error = AppError::new("TEST/CODE", "Something went wrong")
            .with_context("feather", "Contact")
            .with_context("id", "1234")
            .with_cause(AppError::from("inner failure"));

        assert_eq!(error.code(), "TEST/CODE");
        assert_eq!(error.message(), "Something went wrong");
        assert_eq!(error.status_code(), 500);
        assert_eq!(error.context().get("feather"), Some(&"Contact".to_string()));
        let cause = error.cause().expect("cause present");
        assert_eq!(cause.message(), "inner failure");
        assert_eq!(cause.code(), AppError::GENERIC_CODE);
    }

    #[test]
    fn classified_constructors_set_status() {
        assert_eq!(AppError::validation("bad").status_code(), 400);
        assert_eq!(AppError::unauthorized("no").status_code(), 401);
        assert_eq!(AppError::not_found("gone").status_code(), 404);
        assert_eq!(AppError::conflict("stale").status_code(), 409);
    }

    #[test]
    fn converts_anyhow_error_chain_into_nested_causes() {
        let err = (|| -> anyhow::Result<()> {
            Err(std::io::Error::other("disk full")).context("failed to save file")
        })()
        .unwrap_err();

        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), AppError::UNKNOWN_CODE);
        assert_eq!(app_error.message(), "failed to save file");

        let cause = app_error.cause().expect("io cause present");
        assert!(cause.message().contains("disk full"));
    }

    #[test]
    fn wire_shape_carries_message_and_status() {
        let error = AppError::unauthorized("Not authorized to update Contact");
        let json = serde_json::to_value(&error).expect("serialize app error");
        assert_eq!(
            json.get("message").and_then(|v| v.as_str()),
            Some("Not authorized to update Contact")
        );
        assert_eq!(json.get("statusCode").and_then(|v| v.as_u64()), Some(401));
    }

    #[test]
    fn sqlx_row_not_found_translates_to_specific_code() {
        let app_error = AppError::from(SqlxError::RowNotFound);
        assert_eq!(app_error.code(), "SQLX/ROW_NOT_FOUND");
        assert_eq!(app_error.status_code(), 404);
    }

    #[test]
    fn string_errors_default_to_500() {
        let app_error = AppError::from("it broke");
        assert_eq!(app_error.status_code(), 500);
        assert_eq!(app_error.code(), AppError::GENERIC_CODE);
    }
}

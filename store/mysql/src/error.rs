use anyhow::anyhow;
use thiserror::Error;

use crate::{Namespace, PoolId, TenantId};

/// The error taxonomy of this crate. Every failure a caller can see is one
/// of these variants; the retry decision in the transaction executor is a
/// pure match on [`StoreError::is_transient`], and the vendor-specific
/// sniffing that produces the classified variants happens in exactly one
/// place, the [`vendor`] module.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The pool is at capacity and no connection became available within
    /// the configured checkout wait. Never retried internally.
    #[error("database pool {0} is exhausted; no connection became available in time")]
    PoolExhausted(PoolId),
    #[error("no database pool with id {0} is configured")]
    UnknownPool(PoolId),
    /// Selecting the schema on a freshly acquired connection failed;
    /// distinct from pool exhaustion since it usually means the schema
    /// does not exist.
    #[error("selecting schema {schema} failed: {message}")]
    SchemaSelection { schema: Namespace, message: String },
    /// A deadlock, lock-wait timeout or serialization failure that is
    /// expected to succeed on retry. The only retryable category.
    #[error("transient transaction conflict: {0}")]
    TransientConflict(String),
    /// A duplicate entry for the named key.
    #[error("duplicate entry for key `{key}`: {message}")]
    ConstraintViolation { key: String, message: String },
    #[error("value too long for column `{column}`: {message}")]
    DataTruncation {
        column: String,
        row: Option<u64>,
        message: String,
    },
    #[error("incorrect string value {value} for column `{column}`: {message}")]
    IncorrectStringValue {
        value: String,
        column: String,
        row: Option<u64>,
        message: String,
    },
    #[error("illegal mix of collations `{left}` and `{right}` for operation `{operation}`")]
    CollationMismatch {
        left: String,
        right: String,
        operation: String,
    },
    #[error("the tenant directory is unavailable: {0}")]
    DirectoryUnavailable(String),
    #[error("tenant {0} is not assigned to any schema")]
    TenantNotFound(TenantId),
    #[error("provisioning units cannot be ordered: {0}")]
    ProvisioningOrder(String),
    #[error("database unavailable")]
    DatabaseUnavailable,
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("internal error: {0}")]
    InternalError(String),
    /// Anything we could not classify. The original diagnostic is
    /// preserved in full so operators can find the root cause.
    #[error("store error: {0:#}")]
    Unknown(anyhow::Error),
}

impl StoreError {
    /// `true` for the one category the retrying transaction executor may
    /// retry automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::TransientConflict(_))
    }

    /// `true` if this is a duplicate-entry violation of the primary key,
    /// as opposed to some other unique key.
    pub fn is_primary_key_conflict(&self) -> bool {
        match self {
            StoreError::ConstraintViolation { key, .. } => {
                key == "PRIMARY" || key.ends_with(".PRIMARY")
            }
            _ => false,
        }
    }

    /// A stable label for metrics, one per classification category.
    pub fn category(&self) -> &'static str {
        use StoreError::*;
        match self {
            PoolExhausted(_) => "pool_exhausted",
            UnknownPool(_) => "unknown_pool",
            SchemaSelection { .. } => "schema_selection",
            TransientConflict(_) => "transient_conflict",
            ConstraintViolation { .. } => "constraint_violation",
            DataTruncation { .. } => "data_truncation",
            IncorrectStringValue { .. } => "incorrect_string_value",
            CollationMismatch { .. } => "collation_mismatch",
            DirectoryUnavailable(_) => "directory_unavailable",
            TenantNotFound(_) => "tenant_not_found",
            ProvisioningOrder(_) => "provisioning_order",
            DatabaseUnavailable => "database_unavailable",
            InvalidIdentifier(_) => "invalid_identifier",
            InternalError(_) => "internal_error",
            Unknown(_) => "unknown",
        }
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match e {
            Error::DatabaseError(kind, info) => {
                let message = info.message().to_string();
                if let Some(classified) = vendor::classify(&message) {
                    return classified;
                }
                match kind {
                    DatabaseErrorKind::SerializationFailure => {
                        StoreError::TransientConflict(message)
                    }
                    DatabaseErrorKind::UniqueViolation => StoreError::ConstraintViolation {
                        key: "unknown".to_string(),
                        message,
                    },
                    DatabaseErrorKind::ClosedConnection => StoreError::DatabaseUnavailable,
                    _ => StoreError::Unknown(anyhow!(message)),
                }
            }
            e => StoreError::Unknown(anyhow::Error::new(e)),
        }
    }
}

/// Build a [`StoreError::InternalError`]; this indicates a bug in this
/// crate or its callers, not a condition the database reported.
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::StoreError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::StoreError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Recognition of MySQL diagnostic messages. All vendor-message patterns
/// live here; a message that matches none of them stays unclassified and
/// the caller falls back to the error kind or [`StoreError::Unknown`].
pub(crate) mod vendor {
    use lazy_static::lazy_static;
    use regex::Regex;

    use super::StoreError;

    lazy_static! {
        static ref DUPLICATE_ENTRY: Regex =
            Regex::new(r"^Duplicate entry '(?P<value>.*)' for key '(?P<key>[^']+)'").unwrap();
        static ref DATA_TOO_LONG: Regex =
            Regex::new(r"^Data too long for column '(?P<column>[^']+)' at row (?P<row>\d+)")
                .unwrap();
        static ref INCORRECT_STRING: Regex = Regex::new(
            r"^Incorrect string value: '(?P<value>[^']*)' for column '(?P<column>.+)' at row (?P<row>\d+)"
        )
        .unwrap();
        static ref COLLATION_MIX: Regex = Regex::new(
            r"^Illegal mix of collations \((?P<left>[^,)]+)[^)]*\) and \((?P<right>[^,)]+)[^)]*\) for operation '(?P<op>.+)'"
        )
        .unwrap();
        static ref COLLATION_MIX_BARE: Regex =
            Regex::new(r"^Illegal mix of collations for operation '(?P<op>.+)'").unwrap();
    }

    /// Map a raw MySQL error message to a classified error, or `None` if
    /// the message matches no known pattern.
    pub(crate) fn classify(message: &str) -> Option<StoreError> {
        if message.starts_with("Deadlock found when trying to get lock")
            || message.starts_with("Lock wait timeout exceeded")
        {
            return Some(StoreError::TransientConflict(message.to_string()));
        }
        if let Some(caps) = DUPLICATE_ENTRY.captures(message) {
            return Some(StoreError::ConstraintViolation {
                key: caps["key"].to_string(),
                message: message.to_string(),
            });
        }
        if let Some(caps) = DATA_TOO_LONG.captures(message) {
            return Some(StoreError::DataTruncation {
                column: caps["column"].to_string(),
                row: caps["row"].parse().ok(),
                message: message.to_string(),
            });
        }
        if let Some(caps) = INCORRECT_STRING.captures(message) {
            return Some(StoreError::IncorrectStringValue {
                value: caps["value"].to_string(),
                column: caps["column"].to_string(),
                row: caps["row"].parse().ok(),
                message: message.to_string(),
            });
        }
        if let Some(caps) = COLLATION_MIX.captures(message) {
            return Some(StoreError::CollationMismatch {
                left: caps["left"].to_string(),
                right: caps["right"].to_string(),
                operation: caps["op"].to_string(),
            });
        }
        if let Some(caps) = COLLATION_MIX_BARE.captures(message) {
            return Some(StoreError::CollationMismatch {
                left: "unknown".to_string(),
                right: "unknown".to_string(),
                operation: caps["op"].to_string(),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::vendor::classify;
    use super::*;

    #[test]
    fn duplicate_entry_carries_the_key() {
        let e = classify("Duplicate entry '42' for key 'PRIMARY'").unwrap();
        match &e {
            StoreError::ConstraintViolation { key, .. } => assert_eq!(key, "PRIMARY"),
            e => panic!("unexpected classification: {:?}", e),
        }
        assert!(e.is_primary_key_conflict());

        // MySQL 8 prefixes the key with the table name
        let e = classify("Duplicate entry 'bob' for key 'user.login_name'").unwrap();
        match &e {
            StoreError::ConstraintViolation { key, .. } => assert_eq!(key, "user.login_name"),
            e => panic!("unexpected classification: {:?}", e),
        }
        assert!(!e.is_primary_key_conflict());

        let e = classify("Duplicate entry 'x' for key 'user.PRIMARY'").unwrap();
        assert!(e.is_primary_key_conflict());
    }

    #[test]
    fn deadlock_and_lock_wait_are_transient() {
        let deadlock =
            classify("Deadlock found when trying to get lock; try restarting transaction").unwrap();
        assert!(deadlock.is_transient());

        let lock_wait =
            classify("Lock wait timeout exceeded; try restarting transaction").unwrap();
        assert!(lock_wait.is_transient());
    }

    #[test]
    fn truncation_carries_column_and_row() {
        let e = classify("Data too long for column 'display_name' at row 3").unwrap();
        match e {
            StoreError::DataTruncation { column, row, .. } => {
                assert_eq!(column, "display_name");
                assert_eq!(row, Some(3));
            }
            e => panic!("unexpected classification: {:?}", e),
        }
    }

    #[test]
    fn incorrect_string_carries_value_and_column() {
        let e = classify(
            "Incorrect string value: '\\xF0\\x9F\\x92\\xA9' for column 'comment' at row 1",
        )
        .unwrap();
        match e {
            StoreError::IncorrectStringValue {
                value, column, row, ..
            } => {
                assert_eq!(value, "\\xF0\\x9F\\x92\\xA9");
                assert_eq!(column, "comment");
                assert_eq!(row, Some(1));
            }
            e => panic!("unexpected classification: {:?}", e),
        }
    }

    #[test]
    fn collation_mix_carries_both_collations_and_operation() {
        let e = classify(
            "Illegal mix of collations (latin1_swedish_ci,IMPLICIT) and \
             (utf8mb4_general_ci,COERCIBLE) for operation '='",
        )
        .unwrap();
        match e {
            StoreError::CollationMismatch {
                left,
                right,
                operation,
            } => {
                assert_eq!(left, "latin1_swedish_ci");
                assert_eq!(right, "utf8mb4_general_ci");
                assert_eq!(operation, "=");
            }
            e => panic!("unexpected classification: {:?}", e),
        }

        let e = classify("Illegal mix of collations for operation 'concat'").unwrap();
        match e {
            StoreError::CollationMismatch { operation, .. } => assert_eq!(operation, "concat"),
            e => panic!("unexpected classification: {:?}", e),
        }
    }

    #[test]
    fn unmatched_messages_stay_unclassified() {
        assert!(classify("Unknown column 'frobnitz' in 'field list'").is_none());
        assert!(classify("").is_none());
    }

    #[test]
    fn only_transient_conflicts_are_retryable() {
        assert!(StoreError::TransientConflict("deadlock".to_string()).is_transient());
        assert!(!StoreError::PoolExhausted(PoolId(1)).is_transient());
        assert!(!StoreError::DatabaseUnavailable.is_transient());
        assert!(!StoreError::ConstraintViolation {
            key: "PRIMARY".to_string(),
            message: String::new()
        }
        .is_transient());
    }
}

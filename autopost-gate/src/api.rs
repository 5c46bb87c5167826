use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flags::FlagKey;

/// Errors reported by the remote flag store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("flag not found")]
    NotFound,
    /// The store answered but refused or could not run the query.
    #[error("flag store rejected the query: {0}")]
    Rejected(String),
    #[error("flag store unavailable: {0}")]
    Unavailable(String),
    #[error("timed out while fetching flags")]
    Timeout,
}

impl StoreError {
    /// True when the store could be reached and simply had nothing usable for us.
    pub fn store_answered(&self) -> bool {
        matches!(self, StoreError::NotFound | StoreError::Rejected(_))
    }
}

/// SQLSTATE classes that mean the server couldn't serve us rather than refused the query:
/// connection exceptions, insufficient resources and operator intervention.
fn is_outage_sqlstate(code: &str) -> bool {
    matches!(code.get(..2), Some("08" | "53" | "57"))
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        let outage = match &e {
            sqlx::Error::RowNotFound => return StoreError::NotFound,
            sqlx::Error::PoolTimedOut => return StoreError::Timeout,
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => true,
            sqlx::Error::Database(db) => db.code().is_some_and(|code| is_outage_sqlstate(&code)),
            _ => false,
        };

        if outage {
            tracing::error!("flag store connection error: {}", e);
            StoreError::Unavailable(e.to_string())
        } else {
            tracing::warn!("flag store query error: {}", e);
            StoreError::Rejected(e.to_string())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlagError {
    #[error("flag store unavailable: {0}")]
    RemoteStoreUnavailable(String),
    /// Only produced under the `throwError` missing flag policy.
    #[error("flag {0} does not exist in the flag store")]
    MissingFlag(FlagKey),
}

impl FlagError {
    /// Errors that must reach the caller instead of being absorbed by a safety default.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, FlagError::MissingFlag(_))
    }
}

/// Machine readable reason attached to every blocked outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockCode {
    KillSwitchActive,
    AutopostDisabled,
    PlatformAutopostDisabled,
    KillSwitchError,
    PlatformCheckError,
    CheckFailed,
}

impl BlockCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockCode::KillSwitchActive => "KILL_SWITCH_ACTIVE",
            BlockCode::AutopostDisabled => "AUTOPOST_DISABLED",
            BlockCode::PlatformAutopostDisabled => "PLATFORM_AUTOPOST_DISABLED",
            BlockCode::KillSwitchError => "KILL_SWITCH_ERROR",
            BlockCode::PlatformCheckError => "PLATFORM_CHECK_ERROR",
            BlockCode::CheckFailed => "CHECK_FAILED",
        }
    }
}

impl std::fmt::Display for BlockCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body written by the gate middleware when it refuses a request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DenyResponse {
    pub success: bool,
    pub error: String,
    pub code: BlockCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl IntoResponse for DenyResponse {
    fn into_response(self) -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AutopostResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InvalidateResponse {
    pub success: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_codes_serialize_screaming_snake_case() {
        for code in [
            BlockCode::KillSwitchActive,
            BlockCode::AutopostDisabled,
            BlockCode::PlatformAutopostDisabled,
            BlockCode::KillSwitchError,
            BlockCode::PlatformCheckError,
            BlockCode::CheckFailed,
        ] {
            let serialized = serde_json::to_value(code).unwrap();
            assert_eq!(serialized, serde_json::Value::String(code.to_string()));
        }
    }

    #[test]
    fn test_deny_response_is_503_and_omits_empty_platform() {
        let body = DenyResponse {
            success: false,
            error: "Autopost is currently disabled".to_string(),
            code: BlockCode::AutopostDisabled,
            message: "Automatic posting is currently disabled".to_string(),
            platform: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("platform").is_none());
        assert_eq!(json["code"], "AUTOPOST_DISABLED");

        let response = body.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::NotFound.store_answered());
        assert!(StoreError::Rejected("bad column".to_string()).store_answered());
        assert!(!StoreError::Timeout.store_answered());
        assert!(!StoreError::Unavailable("connection refused".to_string()).store_answered());

        assert_eq!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::NotFound
        );
        assert_eq!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Timeout
        );
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::Protocol("unexpected message".to_string())),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::ColumnNotFound("flag_value".to_string())),
            StoreError::Rejected(_)
        ));
    }

    #[test]
    fn test_outage_sqlstates() {
        // statement timeout, too many connections, admin shutdown, connection failure
        for code in ["57014", "53300", "57P03", "08006"] {
            assert!(is_outage_sqlstate(code), "{code}");
        }
        // undefined table, insufficient privilege, syntax error
        for code in ["42P01", "42501", "42601", ""] {
            assert!(!is_outage_sqlstate(code), "{code}");
        }
    }
}

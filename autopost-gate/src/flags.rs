use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Global kill switch: when enabled, every automated post is refused.
pub const KILL_SWITCH_KEY: &str = "KILL_SWITCH_AUTOPOST";
/// Global feature switch for automated posting.
pub const AUTOPOST_ENABLE_KEY: &str = "ENABLE_AUTOPOST";
pub const DESTINATION_KEY_PREFIX: &str = "AUTOPOST_";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagKey(String);

impl FlagKey {
    pub fn new(key: impl Into<String>) -> Self {
        FlagKey(key.into())
    }

    pub fn kill_switch() -> Self {
        FlagKey::new(KILL_SWITCH_KEY)
    }

    pub fn autopost_enable() -> Self {
        FlagKey::new(AUTOPOST_ENABLE_KEY)
    }

    /// `twitter` -> `AUTOPOST_TWITTER`
    pub fn for_destination(destination: &str) -> Self {
        FlagKey(format!(
            "{DESTINATION_KEY_PREFIX}{}",
            destination.trim().to_uppercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A row as the remote store hands it to us.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, sqlx::FromRow)]
pub struct RemoteFlag {
    pub flag_key: String,
    pub is_enabled: bool,
    pub flag_value: Option<Value>,
}

impl RemoteFlag {
    pub fn new(flag_key: impl Into<String>, is_enabled: bool) -> Self {
        RemoteFlag {
            flag_key: flag_key.into(),
            is_enabled,
            flag_value: Some(Value::Bool(is_enabled)),
        }
    }
}

/// Immutable view of one flag. A refresh produces new records, it never edits old ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagRecord {
    pub key: FlagKey,
    pub enabled: bool,
    pub raw_value: Value,
    pub observed_at: DateTime<Utc>,
}

impl FlagRecord {
    pub fn new(key: FlagKey, enabled: bool, raw_value: Value) -> Self {
        FlagRecord {
            key,
            enabled,
            raw_value,
            observed_at: Utc::now(),
        }
    }

    /// Stand-in for a flag the store has no record of.
    pub fn synthetic(key: FlagKey, enabled: bool) -> Self {
        FlagRecord::new(key, enabled, Value::Bool(enabled))
    }
}

impl From<RemoteFlag> for FlagRecord {
    fn from(flag: RemoteFlag) -> Self {
        // a null value column still has to produce a complete record
        let raw_value = match flag.flag_value {
            Some(Value::Null) | None => Value::Bool(flag.is_enabled),
            Some(value) => value,
        };
        FlagRecord::new(FlagKey::new(flag.flag_key), flag.is_enabled, raw_value)
    }
}

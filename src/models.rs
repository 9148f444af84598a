use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Kind of queued domain action. Determines the remote collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Order,
    Lead,
    Visit,
    Route,
}

impl RecordType {
    pub const ALL: [RecordType; 4] = [
        RecordType::Order,
        RecordType::Lead,
        RecordType::Visit,
        RecordType::Route,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Order => "order",
            RecordType::Lead => "lead",
            RecordType::Visit => "visit",
            RecordType::Route => "route",
        }
    }

    /// Remote collection this record type is written to.
    pub fn collection(&self) -> &'static str {
        match self {
            RecordType::Order => "orders",
            RecordType::Lead => "leads",
            RecordType::Visit => "visits",
            RecordType::Route => "routes",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order" => Ok(RecordType::Order),
            "lead" => Ok(RecordType::Lead),
            "visit" => Ok(RecordType::Visit),
            "route" => Ok(RecordType::Route),
            other => Err(format!("Unknown record type: {}", other)),
        }
    }
}

/// A unit of pending work awaiting remote persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub payload: serde_json::Value,
    /// Milliseconds since epoch, set once at creation.
    pub created_at: i64,
    pub synced: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Dead-lettered: excluded from automatic drains until re-armed.
    pub failed: bool,
    pub synced_at: Option<i64>,
}

/// Статистика очереди синхронизации
#[derive(Debug, Default, Serialize)]
pub struct QueueStats {
    pub pending_count: i64,
    pub failed_count: i64,
    pub synced_count: i64,
    pub pending_by_type: HashMap<String, i64>,
}

/// Dead-lettered record as shown to an operator. Payload is decrypted.
#[derive(Debug, Serialize)]
pub struct FailedRecordInfo {
    pub id: String,
    pub record_type: String,
    pub payload: String,
    pub attempts: u32,
    pub created_at: i64,
    pub last_attempt_at: Option<i64>,
    pub error_message: Option<String>,
}

/// Результат обновления токена
#[derive(Debug)]
pub struct TokenRefreshResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

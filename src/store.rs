use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StoreCredentials;

/// Firestore REST endpoint.
const DEFAULT_API_BASE: &str = "https://firestore.googleapis.com/v1";

/// Collection holding registered user documents.
pub const USERS_COLLECTION: &str = "users";

/// Firestore field paths on user documents.
pub const FIELD_IS_SUBSCRIBED: &str = "isSubscribed";
pub const FIELD_TRIAL_START: &str = "trialStartDate";
pub const FIELD_LAST_ACTIVITY: &str = "lastActivityDate";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Credentials were missing or invalid; no connection was ever
    /// established. Every operation on a disabled store returns this.
    #[error("Firebase not initialized properly")]
    Unavailable,
    /// The query reached the store but failed (network, auth, bad response).
    #[error("{0}")]
    Query(String),
}

/// One registered end user, decoded from a Firestore document.
/// Missing document fields decode as `None` (or `false` for the
/// subscription flag), never as an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserRecord {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_subscribed: bool,
    pub trial_start_date: Option<DateTime<Utc>>,
    pub last_activity_date: Option<DateTime<Utc>>,
}

/// Comparison operator of a field predicate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldOp {
    Equal,
    GreaterOrEqual,
    LessOrEqual,
}

impl FieldOp {
    fn wire(self) -> &'static str {
        match self {
            FieldOp::Equal => "EQUAL",
            FieldOp::GreaterOrEqual => "GREATER_THAN_OR_EQUAL",
            FieldOp::LessOrEqual => "LESS_THAN_OR_EQUAL",
        }
    }
}

/// A typed predicate value, encoded as a Firestore value object.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl FilterValue {
    fn encode(&self) -> Value {
        match self {
            FilterValue::Bool(b) => json!({ "booleanValue": b }),
            FilterValue::Timestamp(ts) => json!({
                "timestampValue": ts.to_rfc3339_opts(SecondsFormat::Micros, true)
            }),
        }
    }
}

/// One `(field, operator, value)` predicate. Queries AND these together.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: &'static str,
    pub op: FieldOp,
    pub value: FilterValue,
}

impl Filter {
    pub fn equal(field: &'static str, value: FilterValue) -> Self {
        Self {
            field,
            op: FieldOp::Equal,
            value,
        }
    }

    pub fn at_least(field: &'static str, ts: DateTime<Utc>) -> Self {
        Self {
            field,
            op: FieldOp::GreaterOrEqual,
            value: FilterValue::Timestamp(ts),
        }
    }

    pub fn at_most(field: &'static str, ts: DateTime<Utc>) -> Self {
        Self {
            field,
            op: FieldOp::LessOrEqual,
            value: FilterValue::Timestamp(ts),
        }
    }
}

/// Read-only Firestore client for user records.
///
/// Constructed once at startup and shared. When credentials are absent the
/// client is constructed disabled: `is_connected` reports false and every
/// query fails with `StoreError::Unavailable` without touching the network.
pub struct UserStore {
    client: reqwest::Client,
    backend: Option<Backend>,
}

struct Backend {
    project_id: String,
    access_token: String,
    api_base: String,
}

impl UserStore {
    pub fn new(credentials: Option<StoreCredentials>) -> Self {
        Self::with_api_base(credentials, DEFAULT_API_BASE.to_string())
    }

    /// Same as `new` but against a custom Firestore endpoint (for tests).
    pub fn with_api_base(credentials: Option<StoreCredentials>, api_base: String) -> Self {
        let backend = match credentials {
            Some(creds) => {
                info!("Firebase initialized successfully (project: {})", creds.project_id);
                Some(Backend {
                    project_id: creds.project_id,
                    access_token: creds.access_token,
                    api_base,
                })
            }
            None => {
                warn!("Firestore credentials missing; store-dependent commands are disabled");
                None
            }
        };

        Self {
            client: reqwest::Client::new(),
            backend,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    /// Query the users collection with the given predicates (ANDed).
    pub async fn query_users(&self, filters: &[Filter]) -> Result<Vec<UserRecord>, StoreError> {
        let rows = self.run_query(USERS_COLLECTION, filters).await?;

        // runQuery responses interleave result documents with bare readTime
        // entries; only rows carrying a document decode to records.
        let records = rows
            .iter()
            .filter_map(|row| row.get("document").and_then(|doc| doc.get("fields")))
            .map(decode_user)
            .collect();

        Ok(records)
    }

    async fn run_query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError> {
        let backend = self.backend.as_ref().ok_or(StoreError::Unavailable)?;

        let url = format!(
            "{}/projects/{}/databases/(default)/documents:runQuery",
            backend.api_base, backend.project_id
        );
        let body = json!({ "structuredQuery": structured_query(collection, filters) });

        debug!("Running Firestore query on '{}' with {} filter(s)", collection, filters.len());

        let response = self
            .client
            .post(&url)
            .bearer_auth(&backend.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("Firestore request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Query(format!(
                "Firestore error ({status}): {body}"
            )));
        }

        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to parse Firestore response: {e}")))
    }
}

fn structured_query(collection: &str, filters: &[Filter]) -> Value {
    let mut query = json!({ "from": [{ "collectionId": collection }] });

    match filters.len() {
        0 => {}
        1 => query["where"] = field_filter(&filters[0]),
        _ => {
            let parts: Vec<Value> = filters.iter().map(field_filter).collect();
            query["where"] = json!({
                "compositeFilter": { "op": "AND", "filters": parts }
            });
        }
    }

    query
}

fn field_filter(filter: &Filter) -> Value {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": filter.field },
            "op": filter.op.wire(),
            "value": filter.value.encode(),
        }
    })
}

fn decode_user(fields: &Value) -> UserRecord {
    UserRecord {
        email: string_field(fields, "email"),
        first_name: string_field(fields, "firstName"),
        last_name: string_field(fields, "lastName"),
        is_subscribed: bool_field(fields, FIELD_IS_SUBSCRIBED),
        trial_start_date: timestamp_field(fields, FIELD_TRIAL_START),
        last_activity_date: timestamp_field(fields, FIELD_LAST_ACTIVITY),
    }
}

fn string_field(fields: &Value, name: &str) -> Option<String> {
    fields
        .get(name)?
        .get("stringValue")?
        .as_str()
        .map(str::to_string)
}

fn bool_field(fields: &Value, name: &str) -> bool {
    fields
        .get(name)
        .and_then(|v| v.get("booleanValue"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn timestamp_field(fields: &Value, name: &str) -> Option<DateTime<Utc>> {
    let raw = fields.get(name)?.get("timestampValue")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

use crate::error::AppError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Price table keyed by code. Ordered so consumers iterate it deterministically.
pub type PriceTable = BTreeMap<String, PriceRecord>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyKind {
    #[default]
    Domestic,
    Foreign,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceRecord {
    pub code: String,
    #[serde(default, alias = "name")]
    pub display_name: String,
    pub buy: f64,
    pub sell: f64,
    #[serde(default, alias = "change")]
    pub change_absolute: f64,
    #[serde(default)]
    pub change_percent: f64,
    #[serde(default)]
    pub currency: CurrencyKind,
    #[serde(deserialize_with = "deserialize_timestamp_ms")]
    pub updated_at: i64,
}

impl PriceRecord {
    /// `sell < buy` is tolerated; only structurally broken records are refused.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.code.trim().is_empty() {
            return Err(AppError::Protocol("price record without code".to_string()));
        }

        if !self.buy.is_finite()
            || !self.sell.is_finite()
            || !self.change_absolute.is_finite()
            || !self.change_percent.is_finite()
        {
            return Err(AppError::Protocol(format!(
                "price record '{}' carries non-finite values",
                self.code
            )));
        }

        Ok(())
    }
}

/// Delta payload: absent fields leave the held record untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PartialPriceRecord {
    pub code: String,
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub buy: Option<f64>,
    #[serde(default)]
    pub sell: Option<f64>,
    #[serde(default, alias = "change")]
    pub change_absolute: Option<f64>,
    #[serde(default)]
    pub change_percent: Option<f64>,
    #[serde(default)]
    pub currency: Option<CurrencyKind>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp_ms")]
    pub updated_at: Option<i64>,
}

impl PartialPriceRecord {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.code.trim().is_empty() {
            return Err(AppError::Protocol("delta without code".to_string()));
        }

        let numbers = [
            self.buy,
            self.sell,
            self.change_absolute,
            self.change_percent,
        ];
        if numbers.iter().flatten().any(|value| !value.is_finite()) {
            return Err(AppError::Protocol(format!(
                "delta for '{}' carries non-finite values",
                self.code
            )));
        }

        Ok(())
    }

    /// Builds a full record for a code the table does not hold yet.
    pub fn to_record(&self, fallback_updated_at: i64) -> Option<PriceRecord> {
        Some(PriceRecord {
            code: self.code.clone(),
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| self.code.clone()),
            buy: self.buy?,
            sell: self.sell?,
            change_absolute: self.change_absolute.unwrap_or_default(),
            change_percent: self.change_percent.unwrap_or_default(),
            currency: self.currency.unwrap_or_default(),
            updated_at: self.updated_at.unwrap_or(fallback_updated_at),
        })
    }

    pub fn patch(&self, record: &mut PriceRecord, updated_at: i64) {
        if let Some(display_name) = &self.display_name {
            record.display_name = display_name.clone();
        }
        if let Some(buy) = self.buy {
            record.buy = buy;
        }
        if let Some(sell) = self.sell {
            record.sell = sell;
        }
        if let Some(change_absolute) = self.change_absolute {
            record.change_absolute = change_absolute;
        }
        if let Some(change_percent) = self.change_percent {
            record.change_percent = change_percent;
        }
        if let Some(currency) = self.currency {
            record.currency = currency;
        }
        record.updated_at = updated_at;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOrigin {
    Push,
    Poll,
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub records: PriceTable,
    pub captured_at: i64,
    pub origin: SnapshotOrigin,
}

impl Snapshot {
    /// Duplicate codes keep the most recently updated record.
    pub fn from_records(records: Vec<PriceRecord>, captured_at: i64, origin: SnapshotOrigin) -> Self {
        let mut table = PriceTable::new();
        for record in records {
            match table.get(&record.code) {
                Some(existing) if existing.updated_at > record.updated_at => {}
                _ => {
                    table.insert(record.code.clone(), record);
                }
            }
        }

        Self {
            records: table,
            captured_at,
            origin,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeltaBatch {
    pub changes: Vec<PartialPriceRecord>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    Snapshot(Snapshot),
    Delta(DeltaBatch),
    ServerError(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
enum ServerMessageWire {
    #[serde(rename = "prices:snapshot")]
    Snapshot(SnapshotWire),
    #[serde(rename = "prices:update")]
    Broadcast(BroadcastWire),
    #[serde(rename = "price:change")]
    Change(ChangeWire),
    #[serde(rename = "error")]
    Error(ErrorWire),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotWire {
    pub success: bool,
    #[serde(default)]
    pub data: Vec<PriceRecord>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp_ms")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastWire {
    success: bool,
    #[serde(default)]
    changes: Vec<PartialPriceRecord>,
    #[serde(default)]
    all_prices: Option<Vec<PriceRecord>>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp_ms")]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeWire {
    success: bool,
    data: PartialPriceRecord,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp_ms")]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorWire {
    message: String,
}

impl SnapshotWire {
    pub fn into_snapshot(self, origin: SnapshotOrigin) -> Result<Snapshot, AppError> {
        if !self.success {
            return Err(AppError::Rejected(
                "snapshot reported success=false".to_string(),
            ));
        }
        for record in &self.data {
            record.validate()?;
        }
        let captured_at = self.timestamp.unwrap_or_else(now_unix_ms);
        Ok(Snapshot::from_records(self.data, captured_at, origin))
    }
}

/// Decodes one inbound frame. Any invalid record rejects the whole message.
pub fn parse_push_message(payload: &mut [u8]) -> Result<PushMessage, AppError> {
    let wire: ServerMessageWire = simd_json::serde::from_slice(payload)?;

    match wire {
        ServerMessageWire::Snapshot(snapshot) => Ok(PushMessage::Snapshot(
            snapshot.into_snapshot(SnapshotOrigin::Push)?,
        )),
        ServerMessageWire::Broadcast(broadcast) => {
            if !broadcast.success {
                return Err(AppError::Rejected(
                    "broadcast reported success=false".to_string(),
                ));
            }
            let timestamp = broadcast.timestamp.unwrap_or_else(now_unix_ms);
            match broadcast.all_prices {
                // Full table wins over the change list when both are present.
                Some(all_prices) => {
                    for record in &all_prices {
                        record.validate()?;
                    }
                    Ok(PushMessage::Snapshot(Snapshot::from_records(
                        all_prices,
                        timestamp,
                        SnapshotOrigin::Push,
                    )))
                }
                None => {
                    for change in &broadcast.changes {
                        change.validate()?;
                    }
                    Ok(PushMessage::Delta(DeltaBatch {
                        changes: broadcast.changes,
                        timestamp,
                    }))
                }
            }
        }
        ServerMessageWire::Change(change) => {
            if !change.success {
                return Err(AppError::Rejected(
                    "price change reported success=false".to_string(),
                ));
            }
            change.data.validate()?;
            Ok(PushMessage::Delta(DeltaBatch {
                changes: vec![change.data],
                timestamp: change.timestamp.unwrap_or_else(now_unix_ms),
            }))
        }
        ServerMessageWire::Error(error) => Ok(PushMessage::ServerError(error.message)),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", content = "codes", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    CreateAlert,
    UpdateAlert,
    DeleteAlert,
    AddHolding,
    UpdateHolding,
    DeleteHolding,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateAlert => "create-alert",
            Self::UpdateAlert => "update-alert",
            Self::DeleteAlert => "delete-alert",
            Self::AddHolding => "add-holding",
            Self::UpdateHolding => "update-holding",
            Self::DeleteHolding => "delete-holding",
        }
    }

    pub fn is_alert(self) -> bool {
        matches!(
            self,
            Self::CreateAlert | Self::UpdateAlert | Self::DeleteAlert
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: String,
    pub kind: ActionKind,
    pub payload: serde_json::Value,
    pub enqueued_at: i64,
    pub retry_count: u32,
}

impl QueuedAction {
    pub fn new(kind: ActionKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            enqueued_at: now_unix_ms(),
            retry_count: 0,
        }
    }

    /// Identifier of the alert or holding the action mutates, when the payload names one.
    pub fn entity_id(&self) -> Option<String> {
        match self.payload.get("id")? {
            serde_json::Value::String(value) => Some(value.clone()),
            serde_json::Value::Number(value) => Some(value.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Delivered,
    PermanentlyFailed { retry_count: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentFailure {
    pub action_id: String,
    pub kind: ActionKind,
    pub retry_count: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectivityState {
    Connected,
    Disconnected,
    ReachabilityUnknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Bootstrapping,
    Live,
    Offline,
    Reconciling,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PushChannelState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Exhausted,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub phase: SyncPhase,
    pub connectivity: ConnectivityState,
    pub push_state: PushChannelState,
    pub stale: bool,
    pub offline: bool,
    pub origin: Option<SnapshotOrigin>,
    pub codes: usize,
    pub last_update_ms: Option<i64>,
    pub captured_at: Option<i64>,
    pub pending_actions: usize,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TimestampWire {
    Integer(i64),
    Float(f64),
    Text(String),
}

fn timestamp_from_wire(wire: TimestampWire) -> Result<i64, String> {
    match wire {
        TimestampWire::Integer(value) => Ok(value),
        TimestampWire::Float(value) if value.is_finite() => Ok(value as i64),
        TimestampWire::Float(value) => Err(format!("non-finite timestamp {value}")),
        TimestampWire::Text(text) => parse_timestamp_text(&text),
    }
}

fn parse_timestamp_text(text: &str) -> Result<i64, String> {
    let trimmed = text.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Ok(value);
    }
    chrono::DateTime::parse_from_rfc3339(trimmed)
        .map(|value| value.timestamp_millis())
        .map_err(|error| format!("invalid timestamp '{trimmed}': {error}"))
}

/// Accepts epoch milliseconds or RFC 3339 text.
fn deserialize_timestamp_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let wire = TimestampWire::deserialize(deserializer)?;
    timestamp_from_wire(wire).map_err(serde::de::Error::custom)
}

fn deserialize_optional_timestamp_ms<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let wire = Option::<TimestampWire>::deserialize(deserializer)?;
    wire.map(timestamp_from_wire)
        .transpose()
        .map_err(serde::de::Error::custom)
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

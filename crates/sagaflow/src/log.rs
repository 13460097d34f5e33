//! Saga log record codec.
//!
//! Every state transition is serialized as one self-describing JSON object and
//! appended to the saga's log key. The append order in storage is the durable
//! history; timestamps are informational only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::TaggedParam;

/// Kind tag of a saga log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogKind {
    SagaStart,
    SagaEnd,
    SagaAbort,
    ActionStart,
    ActionEnd,
    CompensateStart,
    CompensateEnd,
}

/// One entry of the saga log.
///
/// `sub_tx_id` is present on every `action*`/`compensate*` record and absent
/// on saga-level records. `params` is carried by `actionEnd` only: a committed
/// action's arguments are exactly what its compensation will be invoked with,
/// and an action that never reached `actionEnd` never committed and is not
/// compensated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "type")]
    pub kind: LogKind,

    #[serde(rename = "subTxID", default, skip_serializing_if = "Option::is_none")]
    pub sub_tx_id: Option<String>,

    pub time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<TaggedParam>>,
}

/// Errors from reading a stored log payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed log record: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl LogRecord {
    /// A saga-level record (`sagaStart`, `sagaEnd`, `sagaAbort`).
    pub fn saga(kind: LogKind) -> Self {
        Self {
            kind,
            sub_tx_id: None,
            time: Utc::now(),
            params: None,
        }
    }

    /// A sub-transaction record for `sub_tx_id`.
    pub fn sub_tx(kind: LogKind, sub_tx_id: impl Into<String>) -> Self {
        Self {
            kind,
            sub_tx_id: Some(sub_tx_id.into()),
            time: Utc::now(),
            params: None,
        }
    }

    /// Attach serialized action arguments.
    pub fn with_params(mut self, params: Vec<TaggedParam>) -> Self {
        self.params = Some(params);
        self
    }

    /// Serialize into the storage payload.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("log records always serialize")
    }

    /// Parse a storage payload.
    pub fn decode(payload: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(payload)?)
    }
}

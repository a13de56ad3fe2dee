//! Envelope: the typed data container flowing between steps
//!
//! Every step receives an input envelope and produces an output envelope.
//! Envelopes carry the payload, named binary blobs, metadata, run variables,
//! accumulated execution errors, and the causal [`Trace`] chain.

mod trace;

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use trace::Trace;

/// Current envelope wire version
pub const ENVELOPE_VERSION: u32 = 1;

/// Meta key used to carry a fan-out element index from the producing node to
/// the successor's execution trace.
pub const META_LOOP_INDEX: &str = "loop_index";

/// Kind of payload carried in [`Envelope::data`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// JSON payload in `data`
    #[default]
    Json,
    /// Payload lives in the `binary` map; `data` holds descriptive metadata
    Binary,
    /// No payload
    Empty,
}

/// A named binary attachment
///
/// Blobs are shared by reference: cloning an envelope (or forking it for a
/// successor) clones the `Arc`, not the bytes. On the wire blobs are base64
/// strings inside the step row's JSONB envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob(Arc<[u8]>);

impl Blob {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into().into_boxed_slice()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Blob {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Self::new(bytes))
    }
}

/// An error recorded against an envelope during execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Node that produced the error
    pub node_id: String,

    /// Human-readable message
    pub message: String,

    /// Underlying cause, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,

    /// When the error was recorded
    pub at: DateTime<Utc>,
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "[{}] {}: {}", self.node_id, self.message, cause),
            None => write!(f, "[{}] {}", self.node_id, self.message),
        }
    }
}

/// The unit of dataflow between steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique envelope id (fresh per fork)
    pub id: Uuid,

    /// When this envelope was issued
    pub issued_at: DateTime<Utc>,

    /// Wire version
    pub version: u32,

    /// Kind of payload in `data`
    #[serde(default)]
    pub data_type: DataType,

    /// The payload
    pub data: serde_json::Value,

    /// Named binary attachments, shared by reference across forks
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binary: BTreeMap<String, Blob>,

    /// String metadata propagated along the flow
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,

    /// Run-scoped variables, written by nodes and visible downstream
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, serde_json::Value>,

    /// Causal trace chain
    pub trace: Trace,

    /// Errors accumulated along the causal path
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ExecutionError>,
}

impl Envelope {
    /// Entry-point constructor: a fresh envelope with a root trace.
    pub fn new(agent_id: Uuid, run_id: Uuid, data: serde_json::Value) -> Self {
        let data_type = if data.is_null() {
            DataType::Empty
        } else {
            DataType::Json
        };
        Self {
            id: Uuid::now_v7(),
            issued_at: Utc::now(),
            version: ENVELOPE_VERSION,
            data_type,
            data,
            binary: BTreeMap::new(),
            meta: BTreeMap::new(),
            variables: BTreeMap::new(),
            trace: Trace::root(agent_id, run_id),
            errors: Vec::new(),
        }
    }

    /// Produce the envelope handed to a successor step.
    ///
    /// The fork gets a fresh identity; meta, variables and errors are copied,
    /// binary blobs are shared by reference. The trace is carried unchanged -
    /// the successor's executor chains it with [`Trace::next`] when the step
    /// actually runs, so the recorded input trace stays the producer's.
    pub fn fork(&self) -> Self {
        let mut child = self.clone();
        child.id = Uuid::now_v7();
        child.issued_at = Utc::now();
        child
    }

    /// Replace the payload, keeping everything else.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data_type = if data.is_null() {
            DataType::Empty
        } else {
            DataType::Json
        };
        self.data = data;
        self
    }

    /// Append an execution error.
    pub fn add_error(
        &mut self,
        node_id: impl Into<String>,
        message: impl Into<String>,
        cause: Option<String>,
    ) {
        self.errors.push(ExecutionError {
            node_id: node_id.into(),
            message: message.into(),
            cause,
            at: Utc::now(),
        });
    }

    /// Mark this envelope as one element of a fan-out.
    pub fn set_loop_index(&mut self, index: u64) {
        self.meta.insert(META_LOOP_INDEX.to_string(), index.to_string());
    }

    /// Fan-out element index, if this envelope came out of a fan-out node.
    pub fn loop_index(&self) -> Option<u64> {
        self.meta.get(META_LOOP_INDEX).and_then(|v| v.parse().ok())
    }
}

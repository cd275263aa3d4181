//! TaskSerializer: domain task <-> versioned wire bytes.
//!
//! Tasks go through `serde_json::Value` on both sides so the structural
//! validator sees exactly what is on the wire, whichever format carries it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::validate::{first_violation, validate_task_data};
use crate::domain::{CodecError, SCHEMA_VERSION, SerializationEnvelope, Task, TaskEnvelope};

/// Byte format of everything written to the broker.
///
/// Chosen once per deployment; mixing formats on one broker is not
/// supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// MessagePack with named fields (compact binary map).
    #[default]
    MessagePack,
    Json,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskSerializer {
    format: WireFormat,
}

impl TaskSerializer {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Validate, wrap and encode a task.
    pub fn serialize_task(&self, task: &Task) -> Result<Vec<u8>, CodecError> {
        let data = serde_json::to_value(TaskEnvelope::from(task))
            .map_err(|e| CodecError::serialization("converting task to wire data", e))?;

        if !validate_task_data(&data) {
            return Err(CodecError::Validation(format!(
                "task {} failed validation",
                task.task_id
            )));
        }

        let bytes = self.encode(&SerializationEnvelope::wrap(data), "encoding task")?;
        tracing::debug!(
            task_id = %task.task_id,
            format = ?self.format,
            size_bytes = bytes.len(),
            "serialized task"
        );
        Ok(bytes)
    }

    /// Decode, check and rebuild a task.
    ///
    /// A schema version other than the current one is only warned about.
    pub fn deserialize_task(&self, bytes: &[u8]) -> Result<Task, CodecError> {
        let raw: Value = self.decode(bytes, "decoding task")?;

        let Value::Object(mut outer) = raw else {
            return Err(CodecError::Validation("envelope is not a mapping".into()));
        };
        let Some(data) = outer.remove("data") else {
            return Err(CodecError::Validation("envelope has no 'data' field".into()));
        };

        match outer.get("version").and_then(Value::as_str) {
            Some(SCHEMA_VERSION) => {}
            other => tracing::warn!(
                found = other.unwrap_or("<none>"),
                expected = SCHEMA_VERSION,
                "task envelope schema version mismatch"
            ),
        }

        if let Some((field, problem)) = first_violation(&data) {
            tracing::warn!(field, problem, "decoded task failed validation");
            return Err(CodecError::Validation(format!("{field}: {problem}")));
        }

        let envelope: TaskEnvelope = serde_json::from_value(data)
            .map_err(|e| CodecError::Validation(format!("malformed task data: {e}")))?;
        Task::try_from(envelope)
    }

    /// Wrap any ledger record in the versioned envelope and encode it.
    pub fn encode_record<T: Serialize>(&self, record: &T) -> Result<Vec<u8>, CodecError> {
        self.encode(&SerializationEnvelope::wrap(record), "encoding record")
    }

    /// Decode a ledger record written by [`encode_record`](Self::encode_record).
    pub fn decode_record<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let envelope: SerializationEnvelope<T> = self.decode(bytes, "decoding record")?;
        if !envelope.is_current_version() {
            tracing::warn!(
                found = %envelope.version,
                expected = SCHEMA_VERSION,
                "record envelope schema version mismatch"
            );
        }
        Ok(envelope.into_data())
    }

    fn encode<T: Serialize>(&self, value: &T, context: &'static str) -> Result<Vec<u8>, CodecError> {
        match self.format {
            WireFormat::MessagePack => {
                rmp_serde::to_vec_named(value).map_err(|e| CodecError::serialization(context, e))
            }
            WireFormat::Json => {
                serde_json::to_vec(value).map_err(|e| CodecError::serialization(context, e))
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8], context: &'static str) -> Result<T, CodecError> {
        match self.format {
            WireFormat::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| CodecError::serialization(context, e))
            }
            WireFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::serialization(context, e))
            }
        }
    }
}

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::CoreError;

/// Wire attribute map. Attributes are the only channel for correlation
/// metadata; payloads stay opaque.
pub type Attributes = BTreeMap<String, String>;

pub const REQUEST_ID: &str = "request_id";
pub const KERNEL_ID: &str = "kernel_id";
pub const MAX_DECODING_STEPS: &str = "max_decoding_steps";
pub const TEMPERATURE: &str = "temperature";
pub const BATCH_SIZE: &str = "batch_size";
pub const SYSTEM_MESSAGE: &str = "system_message";
pub const SHARD_INDEX: &str = "shard_index";
pub const NUM_SHARDS: &str = "num_shards";
pub const SESSION_ID: &str = "session_id";

/// Keys written by the engine itself. Callers cannot set these.
pub const RESERVED_KEYS: &[&str] = &[REQUEST_ID, SHARD_INDEX, NUM_SHARDS, SESSION_ID];

/// Returns whether `key` is owned by the engine.
pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Per-call parameters sent alongside a request payload.
///
/// Named fields cover the keys the inference backend understands; anything
/// else goes through `extra`. Values are stringified on the wire. Can be
/// read from configuration; missing fields stay unset.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CallAttributes {
    /// Backend kernel/model that should serve the call.
    pub kernel_id: Option<String>,
    /// Upper bound on decoding steps (tokens) for the reply.
    pub max_decoding_steps: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    pub batch_size: Option<u32>,
    pub system_message: Option<String>,
    /// Caller-specific key/value pairs.
    pub extra: Attributes,
}

impl CallAttributes {
    pub fn for_kernel(kernel_id: impl Into<String>) -> Self {
        Self {
            kernel_id: Some(kernel_id.into()),
            ..Self::default()
        }
    }

    pub fn with_max_decoding_steps(mut self, steps: u32) -> Self {
        self.max_decoding_steps = Some(steps);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = Some(message.into());
        self
    }

    /// Adds a caller-specific attribute.
    ///
    /// Rejects empty keys, keys that collide with a named field, and keys
    /// reserved for the engine.
    pub fn insert_extra(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), CoreError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(CoreError::InvalidAttribute("empty attribute key"));
        }
        if is_reserved(&key) {
            return Err(CoreError::InvalidAttribute("reserved attribute key"));
        }
        if is_named(&key) {
            return Err(CoreError::InvalidAttribute("attribute has a named field"));
        }
        self.extra.insert(key, value.into());
        Ok(())
    }

    /// Flattens the attributes into their wire form.
    pub fn to_attributes(&self) -> Attributes {
        let mut out = self.extra.clone();
        if let Some(kernel_id) = &self.kernel_id {
            out.insert(KERNEL_ID.to_string(), kernel_id.clone());
        }
        if let Some(steps) = self.max_decoding_steps {
            out.insert(MAX_DECODING_STEPS.to_string(), steps.to_string());
        }
        if let Some(temperature) = self.temperature {
            out.insert(TEMPERATURE.to_string(), temperature.to_string());
        }
        if let Some(batch_size) = self.batch_size {
            out.insert(BATCH_SIZE.to_string(), batch_size.to_string());
        }
        if let Some(message) = &self.system_message {
            out.insert(SYSTEM_MESSAGE.to_string(), message.clone());
        }
        out
    }

    /// Reads call attributes back from a wire map, as a backend would.
    ///
    /// Reserved keys are skipped; unknown keys land in `extra`.
    pub fn from_attributes(attributes: &Attributes) -> Result<Self, CoreError> {
        let mut out = Self::default();
        for (key, value) in attributes {
            match key.as_str() {
                KERNEL_ID => out.kernel_id = Some(value.clone()),
                MAX_DECODING_STEPS => {
                    out.max_decoding_steps = Some(
                        value
                            .parse()
                            .map_err(|_| CoreError::InvalidAttribute("max_decoding_steps"))?,
                    )
                }
                TEMPERATURE => {
                    out.temperature = Some(
                        value
                            .parse()
                            .map_err(|_| CoreError::InvalidAttribute("temperature"))?,
                    )
                }
                BATCH_SIZE => {
                    out.batch_size = Some(
                        value
                            .parse()
                            .map_err(|_| CoreError::InvalidAttribute("batch_size"))?,
                    )
                }
                SYSTEM_MESSAGE => out.system_message = Some(value.clone()),
                k if is_reserved(k) => {}
                _ => {
                    out.extra.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(out)
    }
}

fn is_named(key: &str) -> bool {
    matches!(
        key,
        KERNEL_ID | MAX_DECODING_STEPS | TEMPERATURE | BATCH_SIZE | SYSTEM_MESSAGE
    )
}

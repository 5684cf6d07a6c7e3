use std::path::PathBuf;
use std::time::Duration;

use crate::error::StartError;

/// Construction-time settings for an [`crate::Engine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Project the topics and subscriptions live in.
    pub project_id: String,
    /// Topic requests are published to.
    pub request_topic: String,
    /// Topic replies are published to. Session-scoped subscriptions attach here.
    pub response_topic: String,
    /// Shared reply subscription, and the base name for session-scoped ones.
    pub response_subscription: String,
    /// Upper bound on calls between publish and resolution.
    pub max_concurrent_calls: usize,
    pub shard_index: Option<u32>,
    pub num_shards: Option<u32>,
    /// Scopes the reply subscription to this run when set.
    pub session_id: Option<String>,
    /// Deadline applied to calls that do not pass their own.
    pub call_timeout: Option<Duration>,
    /// Capacity of the delivery channel feeding the listener.
    pub listener_queue_capacity: usize,
    /// Environment variable naming the transport credential file.
    pub credentials_env: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_id: "local".to_string(),
            request_topic: "courier-request".to_string(),
            response_topic: "courier-response".to_string(),
            response_subscription: "courier-response-sub".to_string(),
            max_concurrent_calls: 32,
            shard_index: None,
            num_shards: None,
            session_id: None,
            call_timeout: Some(Duration::from_secs(500)),
            listener_queue_capacity: 1024,
            credentials_env: "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), StartError> {
        if self.max_concurrent_calls == 0 {
            return Err(StartError::InvalidConfig(
                "max_concurrent_calls must be positive",
            ));
        }
        if self.listener_queue_capacity == 0 {
            return Err(StartError::InvalidConfig(
                "listener_queue_capacity must be positive",
            ));
        }
        if self.request_topic.trim().is_empty() || self.response_topic.trim().is_empty() {
            return Err(StartError::InvalidConfig("topic names must not be empty"));
        }
        if self.response_subscription.trim().is_empty() {
            return Err(StartError::InvalidConfig(
                "response_subscription must not be empty",
            ));
        }
        if self.num_shards == Some(0) {
            return Err(StartError::InvalidConfig("num_shards must be positive"));
        }
        if let (Some(index), Some(count)) = (self.shard_index, self.num_shards) {
            if index >= count {
                return Err(StartError::InvalidConfig(
                    "shard_index must be below num_shards",
                ));
            }
        }
        if self
            .session_id
            .as_deref()
            .is_some_and(|s| s.trim().is_empty())
        {
            return Err(StartError::InvalidConfig("session_id must not be blank"));
        }
        Ok(())
    }

    /// Credential file path as exported by the environment.
    ///
    /// Passed through to the transport untouched; never opened here.
    pub fn credentials_path(&self) -> Option<PathBuf> {
        std::env::var_os(&self.credentials_env)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }
}

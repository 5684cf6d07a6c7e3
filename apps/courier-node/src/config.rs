use config::{Config, ConfigError, Environment, File};
use courier_core::CallAttributes;
use courier_engine::EngineConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub project_id: String,
    pub request_topic: String,
    pub response_topic: String,
    pub response_subscription: String,
    /// Subscription the demo responder consumes requests from.
    pub request_subscription: String,
    pub max_concurrent_calls: usize,
    pub shard_index: Option<u32>,
    pub num_shards: Option<u32>,
    pub session_id: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub call_timeout: Option<Duration>,
    pub listener_queue_capacity: usize,
    pub credentials_env: String,
    /// Attributes attached to every call the node issues.
    #[serde(default)]
    pub call_attributes: CallAttributes,
}

impl NodeConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("project_id", "local")?
            .set_default("request_topic", "courier-request")?
            .set_default("response_topic", "courier-response")?
            .set_default("response_subscription", "courier-response-sub")?
            .set_default("request_subscription", "courier-request-sub")?
            .set_default("max_concurrent_calls", 32)?
            .set_default("session_id", None::<String>)?
            .set_default("call_timeout", "500s")?
            .set_default("listener_queue_capacity", 1024)?
            .set_default("credentials_env", "GOOGLE_APPLICATION_CREDENTIALS")?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // .env files feed the COURIER_* environment source below.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("COURIER").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            project_id: self.project_id.clone(),
            request_topic: self.request_topic.clone(),
            response_topic: self.response_topic.clone(),
            response_subscription: self.response_subscription.clone(),
            max_concurrent_calls: self.max_concurrent_calls,
            shard_index: self.shard_index,
            num_shards: self.num_shards,
            session_id: self.session_id.clone(),
            call_timeout: self.call_timeout,
            listener_queue_capacity: self.listener_queue_capacity,
            credentials_env: self.credentials_env.clone(),
        }
    }
}

//! Chooses which reply subscription an engine binds to.
//!
//! When several shards or independent runs share one reply topic, each engine
//! binds to its own filtered subscription, `{base}-sess-{session_id}`,
//! so it never consumes a reply meant for someone else. Without a session the
//! shared, unfiltered subscription is used.

use courier_core::attributes::{Attributes, NUM_SHARDS, SESSION_ID, SHARD_INDEX};
use courier_transport::{AttributeFilter, PubSubTransport, SubscriptionSpec, TransportError};
use tracing::{debug, info};

use crate::config::EngineConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRouter {
    project_id: String,
    subscription: String,
    filter: Option<AttributeFilter>,
    shard_index: Option<u32>,
    num_shards: Option<u32>,
    session_id: Option<String>,
}

impl SubscriptionRouter {
    pub fn new(
        project_id: impl Into<String>,
        base_subscription: impl Into<String>,
        shard_index: Option<u32>,
        num_shards: Option<u32>,
        session_id: Option<String>,
    ) -> Self {
        let base_subscription = base_subscription.into();
        let (subscription, filter) = match &session_id {
            Some(session) => {
                let mut filter = AttributeFilter::new();
                if let Some(index) = shard_index {
                    filter = filter.eq(SHARD_INDEX, index.to_string());
                }
                (
                    format!("{base_subscription}-sess-{session}"),
                    Some(filter.eq(SESSION_ID, session.clone())),
                )
            }
            None => (base_subscription, None),
        };
        Self {
            project_id: project_id.into(),
            subscription,
            filter,
            shard_index,
            num_shards,
            session_id,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.project_id.clone(),
            config.response_subscription.clone(),
            config.shard_index,
            config.num_shards,
            config.session_id.clone(),
        )
    }

    pub fn subscription_name(&self) -> &str {
        &self.subscription
    }

    /// Fully qualified `projects/{project}/subscriptions/{name}` path.
    pub fn subscription_path(&self) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.project_id, self.subscription
        )
    }

    pub fn filter(&self) -> Option<&AttributeFilter> {
        self.filter.as_ref()
    }

    pub fn filter_expression(&self) -> Option<String> {
        self.filter.as_ref().map(ToString::to_string)
    }

    pub fn is_session_scoped(&self) -> bool {
        self.session_id.is_some()
    }

    /// Attributes stamped on every outbound request so the backend can echo
    /// them into its reply.
    pub fn routing_attributes(&self) -> Attributes {
        let mut out = Attributes::new();
        if let Some(index) = self.shard_index {
            out.insert(SHARD_INDEX.to_string(), index.to_string());
        }
        if let Some(count) = self.num_shards {
            out.insert(NUM_SHARDS.to_string(), count.to_string());
        }
        if let Some(session) = &self.session_id {
            out.insert(SESSION_ID.to_string(), session.clone());
        }
        out
    }

    pub fn subscription_spec(&self) -> SubscriptionSpec {
        SubscriptionSpec {
            name: self.subscription.clone(),
            filter: self.filter_expression(),
        }
    }

    /// Creates the subscription on `topic`, treating "already exists" as
    /// success.
    pub async fn ensure_subscription(
        &self,
        transport: &dyn PubSubTransport,
        topic: &str,
    ) -> Result<(), TransportError> {
        let spec = self.subscription_spec();
        match transport.create_subscription(topic, &spec).await {
            Ok(()) => {
                info!(
                    subscription = %self.subscription_path(),
                    filter = spec.filter.as_deref().unwrap_or(""),
                    "created reply subscription"
                );
                Ok(())
            }
            Err(TransportError::AlreadyExists(_)) => {
                debug!(subscription = %self.subscription_path(), "reply subscription exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

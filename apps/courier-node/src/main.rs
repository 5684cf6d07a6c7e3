use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use courier_core::CallAttributes;
use courier_engine::{Engine, EngineConfig, SubscriptionRouter};
use courier_transport::{InMemoryBroker, PubSubTransport, Responder, SubscriptionSpec};
use tracing::{error, info};

mod config;

use crate::config::NodeConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Round-trip calls through an in-memory broker and loopback backend (default)
    Demo {
        /// Number of concurrent calls
        #[arg(long, default_value_t = 4)]
        calls: usize,
        /// Request payload
        #[arg(long, default_value = "ping")]
        payload: String,
        /// Kernel id attached to each call, overriding the configured one
        #[arg(long)]
        kernel_id: Option<String>,
        /// Per-call timeout, e.g. "5s" or "250ms"
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },
    /// Print the reply subscription this node would bind to
    Subscription,
    /// Validate the configuration and print the engine settings
    Check,
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("COURIER_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let node_config = match NodeConfig::new(cli.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };
    let engine_config = node_config.engine_config();
    if let Err(err) = engine_config.validate() {
        error!("{err}");
        std::process::exit(1);
    }

    match cli.command.unwrap_or(Commands::Demo {
        calls: 4,
        payload: "ping".to_string(),
        kernel_id: None,
        timeout: None,
    }) {
        Commands::Subscription => print_subscription(&SubscriptionRouter::from_config(&engine_config)),
        Commands::Check => print_settings(&engine_config),
        Commands::Demo {
            calls,
            payload,
            kernel_id,
            timeout,
        } => {
            let mut attributes = node_config.call_attributes.clone();
            if kernel_id.is_some() {
                attributes.kernel_id = kernel_id;
            }
            if let Err(err) = run_demo(
                &node_config,
                engine_config,
                calls,
                Bytes::from(payload),
                attributes,
                timeout,
            )
            .await
            {
                error!("demo failed: {err}");
                std::process::exit(1);
            }
        }
    }
}

fn print_subscription(router: &SubscriptionRouter) {
    println!("name={}", router.subscription_name());
    println!("path={}", router.subscription_path());
    println!("filter={}", router.filter_expression().unwrap_or_default());
}

fn print_settings(config: &EngineConfig) {
    println!("project_id={}", config.project_id);
    println!("request_topic={}", config.request_topic);
    println!("response_topic={}", config.response_topic);
    println!("response_subscription={}", config.response_subscription);
    println!("max_concurrent_calls={}", config.max_concurrent_calls);
    println!(
        "call_timeout={}",
        config
            .call_timeout
            .map(|t| humantime::format_duration(t).to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!(
        "credentials={}",
        config
            .credentials_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "unset".to_string())
    );
}

/// Builds the backend reply: echoes the payload with the serving kernel.
fn loopback_reply(request: &courier_transport::ReceivedMessage) -> Option<Bytes> {
    let attributes = CallAttributes::from_attributes(&request.attributes).ok()?;
    let kernel = attributes.kernel_id.as_deref().unwrap_or("default");
    let body = String::from_utf8_lossy(&request.payload);
    Some(Bytes::from(format!("{kernel}: {body}")))
}

async fn run_demo(
    node_config: &NodeConfig,
    engine_config: EngineConfig,
    calls: usize,
    payload: Bytes,
    attributes: CallAttributes,
    timeout: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    broker.create_topic(engine_config.request_topic.clone());
    broker.create_topic(engine_config.response_topic.clone());
    broker
        .create_subscription(
            &engine_config.request_topic,
            &SubscriptionSpec::unfiltered(node_config.request_subscription.clone()),
        )
        .await?;
    let responder = Responder::spawn(
        broker.clone(),
        &node_config.request_subscription,
        engine_config.response_topic.clone(),
        loopback_reply,
    )
    .await?;

    let engine = Engine::new(engine_config, Arc::new(broker.clone()))?;
    engine.start().await?;
    info!(calls, "issuing demo calls");

    let results = engine.call_many(payload, &attributes, calls, timeout).await;
    for (index, result) in results.iter().enumerate() {
        match result {
            Ok(reply) => println!("[{index}] {}", String::from_utf8_lossy(reply)),
            Err(err) => println!("[{index}] error: {err}"),
        }
    }

    let stats = engine.stats();
    println!(
        "issued={} succeeded={} failed={} timed_out={} delivered={} unmatched={} malformed={}",
        stats.issued,
        stats.succeeded,
        stats.failed,
        stats.timed_out,
        stats.delivered,
        stats.unmatched,
        stats.malformed
    );
    engine.stop().await;
    responder.shutdown().await;
    Ok(())
}

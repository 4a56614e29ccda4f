//! ferry demo binary.
//!
//! Usage: ferry [--orders <n>] [--fail-sends <n>] [--run-secs <s>]
//!
//! Simulates a service that handles `PlaceOrder` commands. Each handler run
//! publishes `OrderPlaced` to "billing" and "shipping" through the outbox;
//! the forwarder then delivers them to the in-memory transport.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ferry_core::app::DefaultRetryStep;
use ferry_core::domain::MessageId;
use ferry_core::impls::{InMemoryConnection, InMemoryOutboxStorage, InMemoryTransport};
use ferry_core::ports::{IdGenerator, SendScope, SystemClock, UlidGenerator};
use ferry_core::{
    IncomingContext, IncomingStep, Next, Outbox, OutboxBuilder, OutboxError, OutboxOptions,
    OutboxResult, OutboxTransportDecorator, Pipeline, TransportMessage,
};

type Decorator = OutboxTransportDecorator<InMemoryOutboxStorage, InMemoryTransport>;

/// ferry: transactional outbox demo.
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(about = "Stage messages in an outbox and forward them in the background")]
struct Args {
    /// JSON file with outbox options. Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Forward loop interval in seconds (>= 1).
    #[arg(long, env = "FERRY_FORWARD_INTERVAL_SECS")]
    forward_interval_secs: Option<i64>,

    /// Cleanup loop interval in seconds (>= 1).
    #[arg(long, env = "FERRY_CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: Option<i64>,

    /// Number of PlaceOrder commands to handle.
    #[arg(long, default_value = "3")]
    orders: u32,

    /// Fail this many transport sends first, to show retries.
    #[arg(long, default_value = "0")]
    fail_sends: usize,

    /// Fail handling of the first order once, to show rollback.
    #[arg(long)]
    fail_first_order: bool,

    /// How long to let the forwarder run before shutting down.
    #[arg(long, default_value = "3")]
    run_secs: u64,

    /// Log level (trace, debug, info, warn, error). RUST_LOG wins when set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PlaceOrder {
    order_id: u32,
    amount_cents: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u32,
    amount_cents: u64,
}

/// Handles PlaceOrder by publishing OrderPlaced to every subscriber.
struct PlaceOrderHandler {
    transport: Arc<Decorator>,
    subscribers: Vec<&'static str>,
    fail_once: AtomicBool,
}

#[async_trait]
impl IncomingStep<InMemoryConnection> for PlaceOrderHandler {
    fn name(&self) -> &str {
        "PlaceOrderHandler"
    }

    async fn process(
        &self,
        ctx: &mut IncomingContext<InMemoryConnection>,
        _next: Next<'_, InMemoryConnection>,
    ) -> OutboxResult<()> {
        let command: PlaceOrder = serde_json::from_slice(&ctx.message().body)
            .map_err(|e| OutboxError::Handler(format!("json decode: {e}")))?;

        let event = OrderPlaced {
            order_id: command.order_id,
            amount_cents: command.amount_cents,
        };
        let body = serde_json::to_vec(&event)
            .map_err(|e| OutboxError::Handler(format!("json encode: {e}")))?;

        let scope = SendScope::new();
        for subscriber in &self.subscribers {
            let message = TransportMessage::default()
                .with_header("type", "OrderPlaced")
                .with_header("order-id", command.order_id.to_string())
                .with_body(body.clone());
            self.transport
                .dispatch(subscriber, message, ctx.send_strategy(), &scope)
                .await?;
        }

        if self.fail_once.swap(false, Ordering::SeqCst) {
            return Err(OutboxError::Handler(format!(
                "simulated failure for order {}",
                command.order_id
            )));
        }

        info!(order_id = command.order_id, "Order placed");
        Ok(())
    }
}

fn load_options(args: &Args) -> Result<OutboxOptions, Box<dyn std::error::Error>> {
    let mut options = match &args.config {
        Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
        None => OutboxOptions::default(),
    };
    if let Some(secs) = args.forward_interval_secs {
        options = options.with_forward_interval_secs(secs)?;
    }
    if let Some(secs) = args.cleanup_interval_secs {
        options = options.with_cleanup_interval_secs(secs)?;
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let options = load_options(&args)?;
    info!(?options, "ferry starting");

    let storage = Arc::new(InMemoryOutboxStorage::new());
    let transport = Arc::new(InMemoryTransport::new());
    transport.fail_next_sends(args.fail_sends);

    let outbox = OutboxBuilder::new(Arc::clone(&transport))
        .storage(Arc::clone(&storage))
        .options(options)
        .build()?;
    let Outbox::Enabled(components) = outbox else {
        return Err("outbox is disabled without storage".into());
    };

    let mut pipeline: Pipeline<InMemoryConnection> = Pipeline::new();
    pipeline
        .push(Arc::new(DefaultRetryStep::default()))
        .push(Arc::new(PlaceOrderHandler {
            transport: Arc::clone(&components.transport),
            subscribers: vec!["billing", "shipping"],
            fail_once: AtomicBool::new(args.fail_first_order),
        }));
    components.install(&mut pipeline)?;
    info!(steps = ?pipeline.step_names(), "Incoming pipeline ready");

    components.forwarder.start();

    let ids = UlidGenerator::new(SystemClock);
    for order_id in 1..=args.orders {
        let command = PlaceOrder {
            order_id,
            amount_cents: 1_250 * u64::from(order_id),
        };
        let message = TransportMessage::default()
            .with_header("type", "PlaceOrder")
            .with_body(serde_json::to_vec(&command)?);
        let message_id: MessageId = ids.generate_message_id();

        let mut ctx = IncomingContext::new(message_id, message);
        if let Err(err) = pipeline.run(&mut ctx).await {
            warn!(%message_id, error = %err, "Incoming message failed");
        }
    }

    tokio::time::sleep(Duration::from_secs(args.run_secs)).await;
    components.forwarder.shutdown().await;

    for (destination, message) in transport.all_delivered() {
        println!(
            "{destination:<10} {} {}",
            message.header("type").unwrap_or("?"),
            String::from_utf8_lossy(&message.body)
        );
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&components.forwarder.stats().snapshot())?
    );
    println!("pending: {}", storage.pending_count());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_beyond_u32_are_rejected() {
        assert!(Args::try_parse_from(["ferry", "--orders", "4294967296"]).is_err());
        let args = Args::try_parse_from(["ferry", "--orders", "4294967295"]).unwrap();
        assert_eq!(args.orders, u32::MAX);
    }
}

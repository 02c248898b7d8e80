//! Echo bridge: serves every configured handler with an echo service.
//!
//! Loads a trigger configuration JSON document, registers one
//! `MethodTableService` per handler entry, and runs the dispatcher until
//! Ctrl-C. With `--self-test` it calls each registered service once through
//! `RpcClient` and exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use busrpc_core::{ServiceDescriptor, TriggerConfig};
use busrpc_server::telemetry::{init_tracing, LogFormat};
use busrpc_server::{
    BusConnector, Dispatcher, DispatcherConfig, EchoHandler, HandlerConfig, InMemoryBus,
    MethodTableService, RegistrationMode, RpcClient, ServiceRegistry,
};
use clap::Parser;
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum BusKind {
    /// Process-local bus; only useful with `--self-test`.
    Memory,
    /// NATS cluster from the config's `clusterUrls`.
    #[cfg(feature = "nats")]
    Nats,
}

#[derive(Debug, Parser)]
#[command(name = "busrpc-echo")]
#[command(about = "Bridge bus requests to an echo handler")]
struct Args {
    /// Trigger configuration JSON file
    #[arg(short, long, env = "BUSRPC_CONFIG")]
    config: PathBuf,

    /// Bus transport
    #[arg(long, value_enum, env = "BUSRPC_BUS", default_value = "memory")]
    bus: BusKind,

    /// Log output format
    #[arg(long, value_enum, env = "BUSRPC_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Seconds a call waits for the handler
    #[arg(long, env = "BUSRPC_CALL_TIMEOUT_SECS", default_value_t = 30)]
    call_timeout_secs: u64,

    /// Handler invocations in flight per session
    #[arg(long, env = "BUSRPC_MAX_CONCURRENT_CALLS", default_value_t = 1)]
    max_concurrent_calls: usize,

    /// How sessions are matched against registered services
    #[arg(long, value_enum, env = "BUSRPC_REGISTRATION_MODE", default_value = "strict")]
    registration_mode: RegistrationMode,

    /// Service name used for handlers that do not set one
    #[arg(long, default_value = "EchoService")]
    service: String,

    /// Methods served by each echo service
    #[arg(long, value_delimiter = ',', default_value = "Echo")]
    methods: Vec<String>,

    /// Call every service once, then stop
    #[arg(long)]
    self_test: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;

    let raw = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("cannot read config file {}", args.config.display()))?;
    let trigger = TriggerConfig::from_json(&raw).context("invalid trigger config")?;
    info!(id = %trigger.id, handlers = trigger.handlers.len(), "loaded trigger config");

    let registry = Arc::new(ServiceRegistry::new());
    let mut handlers = Vec::with_capacity(trigger.handlers.len());
    for entry in &trigger.handlers {
        let service = entry
            .settings
            .service_name
            .clone()
            .unwrap_or_else(|| args.service.clone());
        let descriptor = ServiceDescriptor::new(entry.settings.protocol(), service);
        registry.register(MethodTableService::new(descriptor, args.methods.clone()));
        handlers.push(HandlerConfig::new(entry.settings.clone(), EchoHandler));
    }

    let connector: Arc<dyn BusConnector> = match args.bus {
        BusKind::Memory => Arc::new(InMemoryBus::new()),
        #[cfg(feature = "nats")]
        BusKind::Nats => Arc::new(busrpc_server::bus::NatsConnector),
    };

    let config = DispatcherConfig {
        call_timeout: Duration::from_secs(args.call_timeout_secs),
        max_concurrent_calls: args.max_concurrent_calls,
        registration_mode: args.registration_mode,
        ..DispatcherConfig::default()
    };
    let mut dispatcher = Dispatcher::new(
        trigger.settings.clone(),
        Arc::clone(&registry),
        Arc::clone(&connector),
        config,
    );
    dispatcher.initialize(handlers)?;
    dispatcher.start().await?;

    if args.self_test {
        let outcome = self_test(connector.as_ref(), &trigger, &registry, &args.methods).await;
        dispatcher.stop().await?;
        return outcome;
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    dispatcher.stop().await?;
    Ok(())
}

async fn self_test(
    connector: &dyn BusConnector,
    trigger: &TriggerConfig,
    registry: &ServiceRegistry,
    methods: &[String],
) -> anyhow::Result<()> {
    let method = methods.first().context("no methods configured")?;
    let client = RpcClient::connect(connector, &trigger.settings, Duration::from_secs(5)).await?;

    for (descriptor, _) in registry.entries() {
        let payload = json!({ "msg": "self-test", "service": descriptor.to_string() });
        let reply = client.call(&descriptor, method, &payload).await?;
        ensure!(
            reply.data.as_ref() == Some(&payload),
            "{descriptor} echoed {:?}",
            reply.data
        );
        info!(%descriptor, code = reply.code, "self-test call succeeded");
    }
    client.close().await?;
    Ok(())
}

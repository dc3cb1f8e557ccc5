use clap::Parser;
use farm_sync::config::SyncConfig;
use farm_sync::dispatch::transport::HttpTransport;
use farm_sync::executor::executor::LocalTaskExecutor;
use farm_sync::executor::farm::{LocalCaches, register_farm_handlers};
use farm_sync::executor::registry::TaskHandlerRegistry;
use farm_sync::executor::staging::{StagedObjectStore, register_staging_handlers};
use farm_sync::health::tracker::HealthTracker;
use farm_sync::hooks::registry::HookRegistry;
use farm_sync::policy::defaults::register_default_policies;
use farm_sync::policy::registry::LoggingPolicyRegistry;
use farm_sync::service::handlers::router;
use farm_sync::service::service::{SyncComponents, SyncService};
use farm_sync::task::types::NodeId;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Farm sync node: propagates object changes to farm peers and staging targets.
#[derive(Parser, Debug)]
#[command(name = "farm-sync-node", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "FARM_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address, overrides `node.bind`
    #[arg(long)]
    bind: Option<String>,

    /// Node identity, overrides `node.name`
    #[arg(long)]
    node_name: Option<String>,

    /// Log level, overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = SyncConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.node.bind = bind;
    }
    if let Some(name) = args.node_name {
        config.node.name = name;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .init();

    let bind_addr: SocketAddr = config.node.bind.parse()?;
    let local_node = NodeId::named(config.node.name.clone());
    tracing::info!("Starting node {} on {}", local_node, bind_addr);

    // 1. Local handlers:
    let handlers = TaskHandlerRegistry::new();
    register_farm_handlers(&handlers, LocalCaches::new())?;
    register_staging_handlers(&handlers, StagedObjectStore::new())?;
    handlers.seal();
    tracing::info!("Task handlers: {:?}", handlers.list_handlers());

    // 2. Policies and hooks:
    let policies = LoggingPolicyRegistry::new();
    register_default_policies(
        &policies,
        &config.staging_servers(),
        &config.policy.staged_object_types,
    );
    let hooks = HookRegistry::new();

    let executor = LocalTaskExecutor::new(
        local_node.clone(),
        handlers,
        hooks.clone(),
        config.executor_settings(),
    );

    // 3. Sync service:
    let transport = Arc::new(HttpTransport::new(config.request_timeout()));
    let tracker = Arc::new(HealthTracker::new(
        config.health.failure_threshold,
        config.dispatch.disabled_policy,
    ));

    let service = SyncService::new(
        local_node,
        SyncComponents {
            policies,
            hooks,
            tracker,
            transport: transport.clone(),
            prober: transport,
        },
        config.service_settings(),
    );

    for destination in &config.destinations {
        service.add_destination(destination.to_destination(), &destination.subscribed_logs())?;
    }

    service.start();

    // 4. HTTP server:
    let app = router(service.clone(), executor, config.executor.max_body_bytes);

    tracing::info!("HTTP server listening on {}", bind_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    service.shutdown();
    Ok(())
}

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};

use exec_worker::config::WorkerConfig;
use exec_worker::engine::Executor;
use exec_worker::jobs::{Dispatcher, GradingEngine};
use exec_worker::redis_manager::RedisManager;
use exec_worker::runner::SandboxedRunner;
use exec_worker::sandbox::{IsolateSandbox, SlotPool};

#[tokio::main]
async fn main() -> Result<()> {
    // Before the filter is built, so RUST_LOG may come from .env
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("exec_worker=info".parse()?),
        )
        .init();

    let config = WorkerConfig::load()?;
    info!("Starting Code Execution Worker...");

    let store = Arc::new(RedisManager::connect(&config.redis.url, config.redis.job_ttl_secs).await?);

    // Fail fast if isolate is missing or misconfigured
    let sandbox = IsolateSandbox::new(&config.sandbox);
    sandbox.ensure_available(0).await?;
    info!(
        "Confirmed isolate is available at {}",
        config.isolate_bin().display()
    );

    let pool = SlotPool::new(
        config.sandbox.max_slot_id,
        std::time::Duration::from_secs(config.sandbox.slot_idle_timeout_secs),
    );
    info!(
        "Slot pool ready with {} slots (box ids from {})",
        config.sandbox.max_slot_id + 1,
        config.sandbox.box_id_base
    );

    let runner = SandboxedRunner::new(Arc::new(sandbox), config.limits.clone());
    let executor = Executor::new(pool, runner, config.compile.clone());
    let grader = GradingEngine::new(store.clone(), store.clone());
    let dispatcher = Dispatcher::new(store, executor, grader, config.dispatcher.clone());

    tokio::select! {
        _ = dispatcher.run() => {},
        result = signal::ctrl_c() => {
            result?;
            warn!("Received shutdown signal, stopping dispatcher");
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}

// src/bin/joshua_agent.rs
// Joshua worker-pool entry point: opens the shared store, then hands
// control to the pool manager (C6), which spawns and scales run loops
// (C5) against it until a stop condition is hit.

use anyhow::Context;
use clap::Parser;

use joshua::config::AgentArgs;
use joshua::{AgentConfig, PoolConfig, PoolManager, Registry, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = AgentArgs::parse();
    let base_config = AgentConfig::load(args.config.as_deref()).context("loading agent config")?;
    let config = args.apply_to(base_config);

    let mut pool_config = PoolConfig::default();
    pool_config.stop_file = config.stop_file.clone();
    if let Some(max_agents) = args.max_agents {
        pool_config.max_agents = Some(max_agents);
    }

    std::fs::create_dir_all(&config.work_dir).context("creating work_dir")?;
    let root: Vec<&str> = config.store_root.iter().map(String::as_str).collect();
    let store = Store::open(&config.store_path, &root).context("opening store")?;
    let registry = Registry::new(store);

    tracing::info!(
        work_dir = %config.work_dir.display(),
        store_path = %config.store_path.display(),
        max_agents = pool_config.target_max_agents(),
        "starting joshua-agent pool manager"
    );

    let manager = PoolManager::new(registry, pool_config, config);
    manager.run().await.map_err(|e| anyhow::anyhow!(e.to_string()))?;

    tracing::info!("pool manager drained, exiting");
    Ok(())
}

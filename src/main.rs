use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use agentcom::api::ApiServer;
use agentcom::auth::StaticTokenAuth;
use agentcom::bus::EventBus;
use agentcom::config::Config;
use agentcom::fsm::{HubFsm, QueueSystemProbe, QuotaLedger};
use agentcom::lifecycle::AgentLifecycle;
use agentcom::queue::TaskQueue;
use agentcom::ratelimit::RateLimiter;
use agentcom::scheduler::Scheduler;
use agentcom::session::SessionContext;
use agentcom::storage::SledStore;
use agentcom::validation::IngressValidator;

#[derive(Parser, Debug)]
#[command(name = "agentcom", about = "Coordination hub for fleets of coding agents")]
struct Args {
    /// Directory for the durable task tables
    #[arg(long)]
    data_dir: Option<String>,

    /// Bind address for the admin API and agent WebSocket
    #[arg(long)]
    host: Option<String>,

    /// Bind port
    #[arg(long)]
    port: Option<u16>,

    /// Per-state invocation budget for the hub work cycler
    #[arg(long, default_value_t = 1000)]
    fsm_budget: u64,

    /// Log filter, e.g. "info" or "agentcom=debug"
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log.clone())),
        )
        .init();

    info!("starting AgentCom hub");

    let mut config = Config::load()?;
    if let Some(data_dir) = args.data_dir {
        config.queue.data_dir = data_dir;
    }
    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }

    // sled takes a directory lock here, so a second hub against the
    // same store fails fast instead of corrupting state.
    let store = Arc::new(SledStore::open(&config.queue.data_dir)?);
    let bus = EventBus::new();

    let queue = TaskQueue::open(store, bus.clone(), config.queue.clone())?;
    let limiter = RateLimiter::new(config.ratelimit.clone(), bus.clone());
    let lifecycle = AgentLifecycle::new(queue.clone(), bus.clone(), config.lifecycle.clone());
    let scheduler = Scheduler::new(
        queue.clone(),
        lifecycle.clone(),
        limiter.clone(),
        bus.clone(),
        config.lifecycle.acceptance_timeout_ms,
        agentcom::constants::STUCK_AGENT_SWEEP_INTERVAL_MS,
    );
    let fsm = HubFsm::new(
        Arc::new(QuotaLedger::new(args.fsm_budget)),
        Arc::new(QueueSystemProbe::new(queue.clone())),
        config.fsm.clone(),
    );

    let session_ctx = SessionContext {
        lifecycle: lifecycle.clone(),
        queue: queue.clone(),
        limiter: limiter.clone(),
        auth: Arc::new(StaticTokenAuth::new(config.auth.agent_token.clone())),
        validator: IngressValidator::new()?,
        config: config.session.clone(),
    };

    let api_server = ApiServer::new(
        &config,
        queue.clone(),
        lifecycle.clone(),
        limiter,
        fsm.clone(),
        session_ctx,
    )?;

    let sweep = queue.spawn_sweep(Arc::new(lifecycle));
    let scheduler_task = scheduler.spawn();
    let fsm_task = fsm.spawn();

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                error!("API server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    sweep.abort();
    scheduler_task.abort();
    fsm_task.abort();
    info!("AgentCom hub stopped");
    Ok(())
}

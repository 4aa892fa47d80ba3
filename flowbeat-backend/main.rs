mod api;
mod config;
mod flows;
mod tasks;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::flows::coordinator::ExecutionCoordinator;
use crate::flows::dispatcher::HeartbeatDispatcher;
use crate::flows::runner::FlowRunner;
use crate::flows::sqlite_repository::SqliteFlowRepository;

#[derive(Parser)]
#[command(name = "flowbeat", about = "Heartbeat-driven periodic flow scheduler")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Run a single heartbeat cycle and print the report
    Heartbeat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    let config = Config::from_env();
    init_tracing();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let engine = build_engine(&config)?;

    match cli {
        Cli::Serve => run_server(config, engine).await,
        Cli::Heartbeat => {
            let report = engine.dispatcher.run_cycle(chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flowbeat=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();
}

struct Engine {
    repo: Arc<SqliteFlowRepository>,
    coordinator: Arc<ExecutionCoordinator>,
    dispatcher: Arc<HeartbeatDispatcher>,
}

fn build_engine(config: &Config) -> Result<Engine> {
    let http_client = Arc::new(
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?,
    );

    let repo = Arc::new(
        SqliteFlowRepository::open(
            &config.database_path,
            chrono::Duration::seconds(config.claim_ttl_secs),
        )
        .with_context(|| format!("failed to open database {}", config.database_path.display()))?,
    );

    let registry = tasks::builtin_registry(http_client);
    tracing::info!(work_units = ?registry.names(), "Registered work units");

    let runner = FlowRunner::new(Arc::new(registry));
    let renew_every = Duration::from_secs((config.claim_ttl_secs / 3).max(1).unsigned_abs());
    let coordinator = Arc::new(
        ExecutionCoordinator::new(repo.clone(), runner).with_claim_renewal(renew_every),
    );
    let dispatcher = Arc::new(
        HeartbeatDispatcher::new(repo.clone(), coordinator.clone())
            .with_max_concurrency(config.max_concurrency),
    );
    Ok(Engine {
        repo,
        coordinator,
        dispatcher,
    })
}

async fn run_server(config: Config, engine: Engine) -> Result<(), Box<dyn Error>> {
    let heartbeat = Arc::new(config.heartbeat);
    tracing::info!(
        path = %heartbeat.path,
        auth = heartbeat.auth_enabled(),
        ip_whitelist = heartbeat.ip_whitelisting_enabled(),
        "Heartbeat endpoint configured"
    );

    let app_state = api::AppState {
        flow_repo: engine.repo,
        coordinator: engine.coordinator,
        dispatcher: engine.dispatcher,
        heartbeat,
    };

    let app = api::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{addr}");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use datas3t::api::{self, AppState};
use datas3t::cache::IndexCache;
use datas3t::config::Settings;
use datas3t::db::MetaStore;
use datas3t::{aggregate, deletion, error, optimizer};

#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// Opentelemetry endpoint (http://ip:port); if unset, logs go to stdout.
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();
    setup_tracing(&opt).unwrap();

    let settings = Arc::new(Settings::from_env()?);
    let meta = MetaStore::connect(&settings.db_url).await?;
    let cache = IndexCache::open(settings.cache_dir.clone().into(), settings.cache_capacity_bytes).await?;
    let state = Arc::new(AppState::new(meta, cache, settings.clone()));

    tokio::spawn(run_deletion_worker(state.clone()));
    tokio::spawn(run_optimizer_loop(state.clone()));

    let app = api::router(state.clone());
    let listener = TcpListener::bind(&settings.addr).await?;
    info!(addr = %settings.addr, "server is running");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("server is stopped");
    Ok(())
}

async fn run_deletion_worker(state: Arc<AppState>) {
    // One HTTP client shared across every fired DELETE; presigned URLs
    // carry their own auth, so no client-side credentials are needed here.
    let http = reqwest::Client::new();
    deletion::run(&state.meta, &http, Duration::from_secs(30)).await;
}

/// Periodically proposes and executes at most one aggregation per dataset
/// per pass (§4.8); errors for one dataset don't stop the scan of others.
async fn run_optimizer_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(300));
    loop {
        interval.tick().await;
        if let Err(e) = run_optimizer_pass(&state).await {
            warn!(error = %e, "optimizer pass failed");
        }
    }
}

async fn run_optimizer_pass(state: &Arc<AppState>) -> error::Result<()> {
    for dataset in state.meta.list_datasets().await? {
        let dataranges = state.meta.list_dataranges(&dataset.name).await?;
        let Some(proposal) = optimizer::propose(&dataset.name, &dataranges) else { continue };

        info!(dataset = %dataset.name, lo = proposal.lo, hi = proposal.hi, sources = proposal.source_ids.len(), "optimizer proposing aggregation");

        let s3 = state.s3_for_bucket_config(&dataset.bucket_config_name).await?;
        let started = aggregate::start(&state.meta, &state.cache, &s3, &dataset.name, proposal.lo, proposal.hi).await?;

        let meta = state.meta.clone();
        let cache_for_worker = state.clone();
        let upload_id = started.aggregate_upload_id;
        tokio::spawn(async move {
            if let Err(e) = aggregate::execute(&meta, &cache_for_worker.cache, &s3, upload_id, 4, 3).await {
                warn!(aggregate_upload_id = %upload_id, error = %e, "optimizer-driven aggregation worker failed");
            }
        });
    }
    Ok(())
}

fn setup_tracing(args: &Opt) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    if args.otlp_endpoint.is_none() {
        use tracing_subscriber::EnvFilter;

        let env_filter = EnvFilter::from_default_env();
        let enable_color = std::io::stdout().is_terminal();

        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .with_ansi(enable_color)
            .init();
        return Ok(());
    }

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&args.otlp_endpoint.clone().unwrap())
                .with_timeout(Duration::from_secs(3)),
        )
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_max_events_per_span(64)
                .with_max_attributes_per_span(16)
                .with_max_events_per_span(16)
                .with_resource(Resource::new(vec![KeyValue::new("service.name", "datas3t")])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    let fmt_layer = tracing_subscriber::fmt::layer();
    let opentelemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let registry = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with(fmt_layer)
        .with(opentelemetry);
    registry.try_init()?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

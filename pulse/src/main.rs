use clap::Parser;
use metrics_exporter_statsd::StatsdBuilder;
use relay::config::{self, MetricsConfig, RelayConfig};
use relay::errors::RelayError;
use shared::admin_service::{AdminService, Readiness};
use shared::metrics_defs::MetricType;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_NAME: &str = ".pulse-relay.toml";

#[derive(Parser)]
#[command(
    name = "pulse-relay",
    version,
    about = "Relays time-tracking requests to every configured instance"
)]
struct Cli {
    /// Path to the config file. Defaults to ~/.pulse-relay.toml, then
    /// ./.pulse-relay.toml.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let path = config_path(cli.config);
    if !path.exists() {
        if let Err(e) = std::fs::write(&path, config::DEFAULT_CONFIG) {
            tracing::error!(path = %path.display(), error = %e, "could not write starter config");
            process::exit(1);
        }
        tracing::info!(
            path = %path.display(),
            "wrote a starter config; add your instance api keys and run again"
        );
        process::exit(1);
    }

    let config = match config::load_from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "could not load config");
            process::exit(1);
        }
    };

    if let Some(metrics_config) = &config.metrics {
        if let Err(e) = install_metrics_recorder(metrics_config) {
            tracing::error!(error = %e, "could not install statsd recorder");
            process::exit(1);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "could not build runtime");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        tracing::error!(error = %e, "relay exited with error");
        process::exit(1);
    }
}

async fn serve(config: RelayConfig) -> Result<(), RelayError> {
    let readiness = Readiness::new();
    match config.admin_listener.clone() {
        Some(admin) => {
            // /ready stays 503 until the relay listener is bound
            let admin_service: AdminService<RelayError> = AdminService::new(readiness.clone());
            let admin_task =
                shared::http::run_http_service(&admin.host, admin.port, admin_service);
            tokio::try_join!(relay::run(config, readiness), admin_task)?;
            Ok(())
        }
        None => relay::run(config, readiness).await,
    }
}

fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }

    let home_config = std::env::var_os("HOME").map(|home| PathBuf::from(home).join(CONFIG_FILE_NAME));
    if let Some(path) = &home_config
        && path.exists()
    {
        return path.clone();
    }

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return local;
    }

    // Neither exists yet; the starter config goes next to the home dir
    home_config.unwrap_or(local)
}

fn install_metrics_recorder(metrics_config: &MetricsConfig) -> Result<(), String> {
    let recorder = StatsdBuilder::from(metrics_config.statsd_host.as_str(), metrics_config.statsd_port)
        .build(None)
        .map_err(|e| e.to_string())?;
    metrics::set_global_recorder(recorder).map_err(|e| e.to_string())?;

    for def in relay::metrics_defs::ALL_METRICS {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
    Ok(())
}

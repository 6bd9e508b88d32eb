use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mortality_enricher::{
    config::Config,
    health::HealthRegistry,
    server::{router, serve, setup_metrics_recorder},
    EnricherService, PipelineError,
};

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let recorder = setup_metrics_recorder()?;
    let router = router(liveness, recorder);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve metrics on {bind}: {e:#}");
        }
    }))
}

async fn run() -> Result<()> {
    let config = Config::init_with_defaults().context(
        "Failed to load configuration from environment variables. Please check your environment setup.",
    )?;
    info!("Configuration loaded: {:?}", config);

    let liveness = HealthRegistry::new("liveness");
    let server_handle = start_server(&config, liveness.clone())?;
    info!("Started metrics server on {}", config.bind_address());

    let service = EnricherService::new(config, liveness)
        .context("Failed to create mortality enricher service")?;

    // blocks until shutdown, end of input, or a fatal pipeline error
    let result = service.run().await;

    server_handle.abort();

    let summaries = result?;
    for (partition, summary) in summaries {
        info!(
            partition = partition,
            batches = summary.batches,
            records = summary.records_written,
            decode_errors = summary.decode_errors,
            join_errors = summary.join_errors,
            "Partition summary"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting mortality enricher service");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<PipelineError>())
                .map_or(1, PipelineError::exit_code);
            error!(exit_code = code, "Mortality enricher service failed: {e:#}");
            ExitCode::from(code)
        }
    }
}

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (BUILDCAST_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("BUILDCAST_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("buildcast_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = buildcast_server::config::ServerConfig::parse();
    tracing::info!("Starting publish server on {}", config.listen_addr);
    if let Some(ref db) = config.db_path {
        tracing::info!("Job records stored in {db}");
    }
    if let Some(ref endpoint) = config.s3_endpoint {
        tracing::info!("Artifacts uploaded to {endpoint}/{}", config.s3_bucket);
    }

    let server = buildcast_server::server::Server::new(config);
    server.run().await
}

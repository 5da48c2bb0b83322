//! Server state and HTTP listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::{BuildCommandFile, ServerConfig};
use crate::publish::clock::SystemClock;
use crate::publish::{
    ArtifactUploader, CommandBuilder, MemoryObjectStore, ObjectStore, PlaceholderBuilder,
    PlatformBuilder, PublishOrchestrator, S3ObjectStore, SqliteStatusStore,
};

/// State shared by all request handlers.
pub struct SharedState {
    pub orchestrator: PublishOrchestrator,
    pub config: ServerConfig,
    pub started_at: Instant,
}

pub struct Server {
    config: ServerConfig,
    builder: Option<Arc<dyn PlatformBuilder>>,
    objects: Option<Arc<dyn ObjectStore>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            builder: None,
            objects: None,
        }
    }

    /// Create a server with a custom builder and object store (for testing).
    pub fn with_backends(
        config: ServerConfig,
        builder: Arc<dyn PlatformBuilder>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            builder: Some(builder),
            objects: Some(objects),
        }
    }

    /// Build SharedState, opening the database and wiring the backends.
    fn build_state(&self) -> Result<Arc<SharedState>> {
        let store = match &self.config.db_path {
            Some(path) => {
                tracing::info!("Opening database: {path}");
                SqliteStatusStore::open(path)
                    .map_err(|e| anyhow::anyhow!("Failed to open database: {e}"))?
            }
            None => {
                tracing::info!("No database path set, job records live in memory");
                SqliteStatusStore::in_memory()
                    .map_err(|e| anyhow::anyhow!("Failed to open database: {e}"))?
            }
        }
        .with_prefix(self.config.key_prefix.clone());

        let objects = match &self.objects {
            Some(objects) => Arc::clone(objects),
            None => match self.config.s3_credentials()? {
                Some(creds) => {
                    tracing::info!(
                        endpoint = %creds.endpoint,
                        bucket = %creds.bucket,
                        "Using S3-compatible object store"
                    );
                    Arc::new(S3ObjectStore::new(creds)) as Arc<dyn ObjectStore>
                }
                None => {
                    tracing::warn!("No object store configured, artifacts are kept in memory");
                    Arc::new(MemoryObjectStore::new())
                }
            },
        };

        let builder = match &self.builder {
            Some(builder) => Arc::clone(builder),
            None => self.configured_builder()?,
        };

        let orchestrator = PublishOrchestrator::new(
            Arc::new(store),
            builder,
            ArtifactUploader::new(objects, self.config.retry_policy()),
            Arc::new(SystemClock),
            self.config.orchestrator_config(),
        );

        Ok(Arc::new(SharedState {
            orchestrator,
            config: self.config.clone(),
            started_at: Instant::now(),
        }))
    }

    fn configured_builder(&self) -> Result<Arc<dyn PlatformBuilder>> {
        let Some(path) = &self.config.build_config else {
            tracing::info!("No build config, using placeholder builds");
            return Ok(Arc::new(PlaceholderBuilder::new(Duration::from_millis(
                self.config.placeholder_delay_ms,
            ))));
        };
        let file = BuildCommandFile::load(path)?;
        let commands = file.platform_commands()?;
        let workspace = file
            .workspace
            .clone()
            .unwrap_or_else(|| self.config.build_workspace.clone());
        let timeout =
            Duration::from_secs(file.timeout_secs.unwrap_or(self.config.build_timeout_secs));
        tracing::info!(
            platforms = ?commands.keys().collect::<Vec<_>>(),
            workspace = %workspace.display(),
            timeout_secs = timeout.as_secs(),
            "Loaded build commands"
        );
        Ok(Arc::new(CommandBuilder::new(commands, workspace, timeout)))
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        spawn_sweeper(&state);

        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!("HTTP listener on {}", listener.local_addr()?);
        axum::serve(listener, crate::web::router(state)).await?;
        Ok(())
    }

    /// Start the server and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state()?;
        let router = crate::web::router(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await?;
            Ok(())
        });

        Ok((addr, handle))
    }
}

/// Periodically drop expired job records.
fn spawn_sweeper(state: &Arc<SharedState>) {
    let state = Arc::clone(state);
    let every = Duration::from_secs(state.config.purge_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // skip first tick
        loop {
            interval.tick().await;
            match state.orchestrator.purge_expired() {
                Ok(0) => {}
                Ok(n) => tracing::info!(purged = n, "Removed expired job records"),
                Err(e) => tracing::error!("Expired record sweep failed: {e}"),
            }
        }
    });
}

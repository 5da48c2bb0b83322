//! Multi-platform publishing.
//!
//! One publish request fans out into a build-and-upload workflow per target
//! platform, with a single status record that polling clients read.
//!
//! # Architecture
//!
//! - `types`: Jobs, platform states and their legal transitions
//! - `aggregate`: Overall status derived from the platform states
//! - `store`: Expiring SQLite records with per-job atomic updates
//! - `builder`: Platform builders (external commands, placeholder output)
//! - `presign`: SigV4 presigned URLs for S3-compatible storage
//! - `qr`: PNG QR codes for download links
//! - `uploader`: Artifact upload with retry and exponential backoff
//! - `orchestrator`: Job creation, workers, cancellation and downloads
//! - `clock`: Injectable time source

pub mod aggregate;
pub mod builder;
pub mod clock;
pub mod orchestrator;
pub mod presign;
pub mod qr;
pub mod store;
pub mod types;
pub mod uploader;

pub use builder::{BuildError, CommandBuilder, PlaceholderBuilder, PlatformBuilder};
pub use orchestrator::{
    CancelOutcome, DownloadLink, OrchestratorConfig, PublishError, PublishOrchestrator,
};
pub use store::{SqliteStatusStore, StatusStore, StoreError};
pub use types::{BuildJob, BuildStatus, Platform, PlatformBuildState, PublishRequest, Strategy};
pub use uploader::{
    ArtifactUploader, MemoryObjectStore, ObjectStore, RetryPolicy, S3ObjectStore, UploadError,
};

//! Command-line entry points.

use clap::Args;

use crate::{
    backend::{Backend, cloud::CloudBackend, local::LocalBackend},
    config::BackendKind,
    prelude::*,
};

pub mod queue;
pub mod results;
pub mod rm;
pub mod status;
pub mod upload;
pub mod worker;

/// Common options selecting and configuring a backend.
#[derive(Debug, Clone, Args)]
pub struct BackendOpts {
    /// Backend to talk to.
    #[clap(long, value_enum, default_value = "cloud", env = "BOOKPIPE_BACKEND")]
    pub backend: BackendKind,

    /// Root directory of the local backend.
    #[clap(long, default_value = ".bookpipe", env = "BOOKPIPE_LOCAL_ROOT")]
    pub local_root: PathBuf,

    /// S3 bucket holding work in progress (cloud backend).
    #[clap(long, default_value = "bookpipe-work", env = "BOOKPIPE_BUCKET")]
    pub bucket: String,

    /// Prefix of the SQS queue names (cloud backend).
    #[clap(long, default_value = "bookpipe-", env = "BOOKPIPE_QUEUE_PREFIX")]
    pub queue_prefix: String,
}

impl BackendOpts {
    /// Connect to the selected backend.
    pub async fn connect(&self) -> Result<Arc<dyn Backend>> {
        match self.backend {
            BackendKind::Local => {
                Ok(Arc::new(LocalBackend::new(&self.local_root).await?))
            }
            BackendKind::Cloud => Ok(Arc::new(
                CloudBackend::connect(&self.bucket, &self.queue_prefix).await?,
            )),
        }
    }
}

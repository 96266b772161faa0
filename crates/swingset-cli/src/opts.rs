//! Global CLI options and store resolution.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use swingset_kernel::KernelState;
use swingset_store::FsKvStore;

/// Global options for every command. The store may also come from the environment.
#[derive(Args, Debug, Clone)]
pub struct StoreOpts {
    /// Kernel store directory (env: SWINGSET_STORE)
    #[arg(short = 's', long, global = true, env = "SWINGSET_STORE")]
    pub store: Option<PathBuf>,

    /// JSON output envelope
    #[arg(long, global = true)]
    pub json: bool,

    /// Pretty-print JSON output (implies --json)
    #[arg(long, global = true)]
    pub pretty: bool,
}

impl StoreOpts {
    /// Open the store directory, which must already hold a kernel.
    pub fn open_store(&self) -> Result<FsKvStore> {
        let Some(dir) = &self.store else {
            bail!("no store given; pass --store or set SWINGSET_STORE");
        };
        if !dir.is_dir() {
            bail!("store directory {} does not exist", dir.display());
        }
        FsKvStore::open(dir).with_context(|| format!("open store at {}", dir.display()))
    }

    /// Read-only view of the kernel tables in the store.
    pub fn open_state(&self) -> Result<KernelState<FsKvStore>> {
        Ok(KernelState::new(Arc::new(self.open_store()?)))
    }
}

//! 🧵 Workers: the tasks that actually move bodies while the Supervisor takes the credit.
//!
//! ⚠️ Private to the supervisor. Nobody else spawns these.

use anyhow::Result;
use tokio::task::JoinHandle;

mod flush_worker;
mod refresh_worker;

pub(crate) use flush_worker::FlushWorker;
pub(crate) use refresh_worker::RefreshWorker;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    /// 🚀 Spawn it. The handle resolves when the worker has cleaned up and left.
    fn start(self) -> JoinHandle<Result<()>>;
}

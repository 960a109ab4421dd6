//! Narrow device interfaces the dispatcher and bench runner talk to.
//!
//! Everything that touches a real device (compilation, submission, timing)
//! lives behind [`Engine`] and [`Stream`]. The crate ships one
//! implementation, [`crate::sim::SimEngine`], used by tests and the planner
//! tool when no vendor runtime is linked in.

use std::time::Duration;

use primkit_core::Result;
use primkit_layout::{DeviceExt, HwDescriptor, Problem};

use crate::kernel_ctx::KernelCtx;

/// Compiled kernel returned by [`Engine::create_kernel`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelHandle {
    pub id: u64,
    pub name: String,
    pub ctx: KernelCtx,
}

pub trait Engine: Send + Sync {
    fn hw(&self) -> &HwDescriptor;

    /// Feature query (fp64, fp16, int8 dot, ...).
    fn mayiuse(&self, ext: DeviceExt) -> bool {
        self.hw().has(ext)
    }

    fn create_kernel(&self, name: &str, ctx: &KernelCtx) -> Result<KernelHandle>;

    fn create_stream(&self) -> Result<Box<dyn Stream>>;
}

pub trait Stream {
    /// Enqueue one execution; non-blocking.
    fn submit(&mut self, kernel: &KernelHandle, problem: &Problem) -> Result<()>;

    /// Block until queued work finishes; returns device time since the last wait.
    fn wait(&mut self) -> Result<Duration>;
}

//! Worker pools shared by every execution in the process.
//!
//! CPU-bound stages and the GPU-bound Vision stage draw from separate
//! capacity limits. A node holds its permit for the whole time it runs,
//! including retries.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use triagent_core::config::ExecutionConfig;
use triagent_core::error::{Result, TriagentError};
use triagent_core::types::ResourceClass;

pub struct WorkerPool {
    cpu: Arc<Semaphore>,
    gpu: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(cpu_capacity: usize, gpu_capacity: usize) -> Self {
        Self {
            cpu: Arc::new(Semaphore::new(cpu_capacity)),
            gpu: Arc::new(Semaphore::new(gpu_capacity)),
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.cpu_workers, config.gpu_workers)
    }

    fn semaphore(&self, class: ResourceClass) -> &Arc<Semaphore> {
        match class {
            ResourceClass::Cpu => &self.cpu,
            ResourceClass::Gpu => &self.gpu,
        }
    }

    /// Wait for a worker slot in `class`.
    pub async fn acquire(&self, class: ResourceClass) -> Result<OwnedSemaphorePermit> {
        self.semaphore(class)
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TriagentError::AgentUnavailable {
                agent: format!("{:?} pool", class).to_lowercase(),
                reason: "worker pool closed".into(),
            })
    }

    #[cfg(test)]
    fn available(&self, class: ResourceClass) -> usize {
        self.semaphore(class).available_permits()
    }

    /// Stop handing out permits. Waiters fail with unavailability.
    #[cfg(test)]
    fn close(&self) {
        self.cpu.close();
        self.gpu.close();
    }
}

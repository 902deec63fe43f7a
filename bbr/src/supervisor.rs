//! Lifecycle supervisor for the engine's long-running pieces: the CoAP
//! server, ND-Proxy, the multicast router, the NCP syslog receiver.
//! Each task declares the config keys it needs before it can start
//! (its "gate"); the supervisor starts tasks in declaration order and
//! stops them in reverse, so a later task can assume an earlier one is
//! already up.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bbr_core::config::ConfigStore;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Errored,
}

#[async_trait]
pub trait SupervisedTask: Send + Sync {
    fn name(&self) -> &str;

    /// Config keys that must already be set before this task may
    /// start. An empty gate always passes.
    fn gate_keys(&self) -> &[&str] {
        &[]
    }

    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

pub struct Supervisor {
    tasks: Vec<Arc<dyn SupervisedTask>>,
    config: Arc<ConfigStore>,
    status: RwLock<HashMap<String, TaskState>>,
}

impl Supervisor {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { tasks: Vec::new(), config, status: RwLock::new(HashMap::new()) }
    }

    pub fn register(&mut self, task: Arc<dyn SupervisedTask>) {
        self.status.get_mut().insert(task.name().to_string(), TaskState::Stopped);
        self.tasks.push(task);
    }

    pub async fn state_of(&self, name: &str) -> Option<TaskState> {
        self.status.read().await.get(name).copied()
    }

    /// Start every task whose gate is currently satisfied, in
    /// declaration order. A task whose gate is not satisfied is left
    /// `Stopped`, not treated as an error — `start_all` is safe to
    /// call again once more config keys show up (e.g. after the NCP
    /// reports a mesh-local prefix).
    pub async fn start_all(&self) {
        for task in &self.tasks {
            self.start_one(task).await;
        }
    }

    async fn start_one(&self, task: &Arc<dyn SupervisedTask>) {
        let current = self.state_of(task.name()).await.unwrap_or(TaskState::Stopped);
        if current == TaskState::Running {
            return;
        }
        if !self.config.has_keys(task.gate_keys()).await {
            tracing::debug!(task = task.name(), "gate not satisfied, leaving stopped");
            return;
        }
        self.set_state(task.name(), TaskState::Starting).await;
        match task.start().await {
            Ok(()) => {
                self.set_state(task.name(), TaskState::Running).await;
                tracing::info!(task = task.name(), "task started");
            }
            Err(e) => {
                self.set_state(task.name(), TaskState::Errored).await;
                tracing::error!(task = task.name(), error = %e, "task failed to start");
            }
        }
    }

    /// Stop every running task in reverse declaration order.
    pub async fn stop_all(&self) {
        for task in self.tasks.iter().rev() {
            let current = self.state_of(task.name()).await.unwrap_or(TaskState::Stopped);
            if current != TaskState::Running {
                continue;
            }
            self.set_state(task.name(), TaskState::Stopping).await;
            match task.stop().await {
                Ok(()) => {
                    self.set_state(task.name(), TaskState::Stopped).await;
                    tracing::info!(task = task.name(), "task stopped");
                }
                Err(e) => {
                    self.set_state(task.name(), TaskState::Errored).await;
                    tracing::error!(task = task.name(), error = %e, "task failed to stop cleanly");
                }
            }
        }
    }

    /// Stop then start a single named task, used when its gate keys
    /// change underneath it (e.g. the domain prefix is reconfigured).
    pub async fn restart(&self, name: &str) {
        if let Some(task) = self.tasks.iter().find(|t| t.name() == name).cloned() {
            let current = self.state_of(name).await.unwrap_or(TaskState::Stopped);
            if current == TaskState::Running {
                self.set_state(name, TaskState::Stopping).await;
                if let Err(e) = task.stop().await {
                    tracing::error!(task = name, error = %e, "restart: stop failed");
                }
            }
            self.start_one(&task).await;
        }
    }

    async fn set_state(&self, name: &str, state: TaskState) {
        self.status.write().await.insert(name.to_string(), state);
    }
}

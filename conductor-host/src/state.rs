//! Shared application state for the host server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use conductor::autorun::{RunEvent, TaskRunner};
use conductor::io::config::{ConductorConfig, load_config};
use conductor::io::init::ConductorPaths;
use conductor::io::provider::{Provider, build_provider};
use conductor::io::task_store::{FileTaskStore, TaskStore};
use conductor::io::tools::ApprovalQueue;
use conductor::orchestrator::BranchOrchestrator;
use tokio::sync::broadcast;

/// Events broadcast to SSE clients.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Live activity from the task runner.
    Run(RunEvent),
    TasksChanged,
    BranchesChanged,
    MergeStateChanged,
    ConfigChanged,
    PolicyChanged,
    TranscriptWritten {
        run_id: String,
        task_id: String,
    },
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub paths: Arc<ConductorPaths>,
    pub store: Arc<dyn TaskStore>,
    pub runner: Arc<TaskRunner>,
    pub approvals: Arc<ApprovalQueue>,
    pub event_tx: Arc<broadcast::Sender<HostEvent>>,
}

impl AppState {
    /// Load the project's config and wire the runner to the configured provider.
    pub fn open(project_dir: PathBuf) -> Result<Self> {
        let paths = ConductorPaths::new(project_dir);
        let config = load_config(&paths.config_path)?;
        let provider: Arc<dyn Provider> = Arc::from(build_provider(&config.provider, &paths.root));
        Ok(Self::with_provider(paths, config, provider))
    }

    pub fn with_provider(
        paths: ConductorPaths,
        config: ConductorConfig,
        provider: Arc<dyn Provider>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let event_tx = Arc::new(event_tx);
        let store: Arc<dyn TaskStore> = Arc::new(FileTaskStore::new(&paths.tasks_path));
        let approvals = Arc::new(ApprovalQueue::new());

        let sink_tx = Arc::clone(&event_tx);
        let runner = TaskRunner::new(paths.clone(), config, Arc::clone(&store), provider)
            .with_approver(approvals.clone())
            .with_events(Arc::new(move |event: RunEvent| {
                // No subscribers is fine.
                let _ = sink_tx.send(HostEvent::Run(event));
            }));

        Self {
            paths: Arc::new(paths),
            store,
            runner: Arc::new(runner),
            approvals,
            event_tx,
        }
    }

    pub fn orchestrator(&self) -> &BranchOrchestrator {
        self.runner.orchestrator()
    }
}

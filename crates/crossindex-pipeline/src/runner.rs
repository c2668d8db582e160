//! Wires watchers, the normalizer and the archiver into one set of tasks.
//!
//! Every task shares one [`CancellationToken`]. After cancellation the runner
//! waits up to `shutdown_grace` for the tasks to wind down, then aborts what
//! is left.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crossindex_core::IndexerError;
use crossindex_evm::{ChainWatcher, EventBatch};

use crate::archiver::Archiver;
use crate::normalizer::{Normalizer, NormalizerStats};
use crate::service::NormalizerService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Batches buffered between the watchers and the normalizer.
    pub channel_capacity: usize,
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// How the pipeline ended.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Chains whose watcher stopped on a non-transient error.
    pub failed_chains: Vec<(u64, String)>,
    /// Normalizer totals, if it wound down within the grace period.
    pub normalizer: Option<NormalizerStats>,
    /// Tasks aborted after the grace period ran out.
    pub aborted_tasks: usize,
}

enum TaskExit {
    Watcher(u64, Result<(), IndexerError>),
    Normalizer(Box<Normalizer>),
    Archiver,
}

pub struct Pipeline {
    config: PipelineConfig,
    normalizer: Normalizer,
    archiver: Option<Archiver>,
    watchers: Vec<ChainWatcher>,
    events_tx: mpsc::Sender<EventBatch>,
    events_rx: mpsc::Receiver<EventBatch>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, normalizer: Normalizer) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            config,
            normalizer,
            archiver: None,
            watchers: Vec::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn with_archiver(mut self, archiver: Archiver) -> Self {
        self.archiver = Some(archiver);
        self
    }

    /// Sender half for [`ChainWatcherBuilder::events`](crossindex_evm::ChainWatcherBuilder::events).
    pub fn events(&self) -> mpsc::Sender<EventBatch> {
        self.events_tx.clone()
    }

    pub fn add_watcher(&mut self, watcher: ChainWatcher) {
        self.watchers.push(watcher);
    }

    /// Run every task until `cancel` fires, then shut down gracefully.
    pub async fn run(self, cancel: CancellationToken) -> PipelineReport {
        let Pipeline {
            config,
            normalizer,
            archiver,
            watchers,
            events_tx,
            events_rx,
        } = self;
        // The channel closes once every watcher is gone.
        drop(events_tx);

        let mut tasks: JoinSet<TaskExit> = JoinSet::new();
        tracing::info!(chains = watchers.len(), archiver = archiver.is_some(), "pipeline starting");

        for watcher in watchers {
            let chain_id = watcher.chain_id();
            let token = cancel.clone();
            tasks.spawn(async move { TaskExit::Watcher(chain_id, watcher.run(token).await) });
        }
        let service = NormalizerService::new(normalizer, events_rx);
        let token = cancel.clone();
        tasks.spawn(async move { TaskExit::Normalizer(Box::new(service.run(token).await)) });
        if let Some(archiver) = archiver {
            let token = cancel.clone();
            tasks.spawn(async move {
                archiver.run(token).await;
                TaskExit::Archiver
            });
        }

        let mut report = PipelineReport::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    Some(joined) => record(&mut report, joined),
                    None => break,
                },
            }
        }

        tracing::info!(
            remaining = tasks.len(),
            grace_secs = config.shutdown_grace.as_secs(),
            "shutting down"
        );
        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                record(&mut report, joined);
            }
        })
        .await;
        if drained.is_err() {
            report.aborted_tasks = tasks.len();
            tracing::warn!(tasks = tasks.len(), "grace period elapsed, aborting remaining tasks");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        tracing::info!(
            failed_chains = report.failed_chains.len(),
            aborted = report.aborted_tasks,
            "pipeline stopped"
        );
        report
    }
}

fn record(report: &mut PipelineReport, joined: Result<TaskExit, tokio::task::JoinError>) {
    match joined {
        Ok(TaskExit::Watcher(chain_id, Ok(()))) => {
            tracing::debug!(chain_id, "watcher task finished");
        }
        Ok(TaskExit::Watcher(chain_id, Err(e))) => {
            tracing::error!(chain_id, error = %e, "chain watcher failed; other chains continue");
            report.failed_chains.push((chain_id, e.to_string()));
        }
        Ok(TaskExit::Normalizer(normalizer)) => {
            report.normalizer = Some(normalizer.stats().clone());
        }
        Ok(TaskExit::Archiver) => {}
        Err(e) => tracing::error!(error = %e, "pipeline task panicked or was aborted"),
    }
}

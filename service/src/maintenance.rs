//! Periodic cleanup of expired state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::operations::Orchestrator;
use crate::session::SessionKeyStore;
use crate::tokens::TokenIssuer;
use crate::upload::UploadPipeline;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub tokens: usize,
    pub uploads: usize,
    pub sessions: usize,
    pub operations: usize,
}

impl SweepReport {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.tokens == 0 && self.uploads == 0 && self.sessions == 0 && self.operations == 0
    }
}

pub struct Sweeper {
    pub sessions: Arc<SessionKeyStore>,
    pub tokens: Arc<TokenIssuer>,
    pub uploads: Arc<UploadPipeline>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Sweeper {
    /// Purge expired tokens, idle uploads (and their partial data), idle
    /// session keys and finished operation records past retention.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let report = SweepReport {
            tokens: self.tokens.purge_expired(Utc::now()),
            uploads: self.uploads.expire_idle(now).await,
            sessions: self.sessions.purge_idle(now),
            operations: self.orchestrator.purge_finished(now),
        };
        if !report.is_empty() {
            tracing::info!(
                tokens = report.tokens,
                uploads = report.uploads,
                sessions = report.sessions,
                operations = report.operations,
                "maintenance sweep"
            );
        }
        report
    }

    /// Sweep every `interval` until the task is aborted.
    #[must_use]
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

//! Background maintenance sweeps.
//!
//! One interval task retires terminal jobs past their retention age and
//! demotes aged session files into the archive tree.

use std::sync::Arc;
use std::time::Duration;

use melange_common::config::JobsConfig;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::jobs::JobManager;
use crate::session::file::FileSessionStore;

pub struct MaintenanceSweep {
    jobs: Arc<JobManager>,
    session_files: Arc<FileSessionStore>,
    config: JobsConfig,
}

impl MaintenanceSweep {
    pub fn new(
        jobs: Arc<JobManager>,
        session_files: Arc<FileSessionStore>,
        config: JobsConfig,
    ) -> Self {
        Self {
            jobs,
            session_files,
            config,
        }
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    async fn run_once(&self) {
        let retention = Duration::from_secs(self.config.terminal_retention_days * 86_400);
        let removed = self.jobs.cleanup_terminal(retention).await;
        if removed > 0 {
            debug!("sweep retired {removed} terminal jobs");
        }

        match self.session_files.archive_expired() {
            Ok(moved) if moved > 0 => debug!("sweep archived {moved} session files"),
            Ok(_) => {}
            Err(err) => warn!("session archive sweep failed: {err}"),
        }
    }
}

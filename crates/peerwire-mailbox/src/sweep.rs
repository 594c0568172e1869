use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::store::MailboxStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub mailboxes_evicted: usize,
    pub rooms_evicted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.mailboxes_evicted == 0 && self.rooms_evicted == 0
    }
}

/// Background task running [`MailboxStore::sweep`] on a fixed period.
/// Dropping the handle stops the task.
pub struct Sweeper {
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn start(store: MailboxStore, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = store.sweep();
                if report.is_empty() {
                    debug!(target = "peerwire::sweep", rooms = store.room_count(), "sweep found nothing stale");
                } else {
                    info!(
                        target = "peerwire::sweep",
                        mailboxes = report.mailboxes_evicted,
                        rooms = report.rooms_evicted,
                        remaining = store.room_count(),
                        "swept stale signaling state"
                    );
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MailboxStore {
    /// Starts the periodic sweep using the configured interval.
    pub fn spawn_sweeper(&self) -> Sweeper {
        Sweeper::start(self.clone(), self.settings().sweep_interval)
    }
}

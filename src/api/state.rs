use std::sync::Arc;

use crate::scheduler::Scheduler;
use crate::state::StateStore;
use crate::storage::findings::FindingStore;
use crate::storage::journal::JournalStore;
use crate::storage::tasks::TaskQueue;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub scheduler: Scheduler,
    pub state: Arc<dyn StateStore>,
    pub findings: FindingStore,
    pub tasks: TaskQueue,
    pub journal: JournalStore,
    /// Shared secret for trigger, control and ingest routes. `None` disables
    /// those routes entirely.
    pub secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(pool: Pool, scheduler: Scheduler, secret: Option<String>) -> Self {
        Self {
            state: scheduler.state().clone(),
            findings: FindingStore::new(pool.clone()),
            tasks: TaskQueue::new(pool.clone()),
            journal: JournalStore::new(pool.clone()),
            pool,
            scheduler,
            secret: secret.map(Arc::from),
        }
    }
}

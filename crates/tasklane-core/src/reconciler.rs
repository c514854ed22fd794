use tasklane_types::{decode_push_message, ProtocolError, TaskEvent};

use crate::cache_store::{ApplyOptions, CacheStore};
use crate::merge::{prepend_dedup, remove_by_id, replace_by_id};

/// Merges push events into the cache, one at a time, in delivery order.
///
/// One instance per push connection. Events carry the full post-mutation
/// record, so every merge suppresses revalidation.
pub struct Reconciler {
    cache: CacheStore,
    applied: u64,
}

impl Reconciler {
    pub fn new(cache: CacheStore) -> Self {
        Self { cache, applied: 0 }
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Decodes and merges one raw push message. Decoding failures are
    /// returned to the caller untouched.
    pub fn handle_message(&mut self, raw: &str) -> Result<(), ProtocolError> {
        let event = decode_push_message(raw)?;
        self.apply(event);
        Ok(())
    }

    pub fn apply(&mut self, event: TaskEvent) {
        tracing::debug!(
            event_type = event.event_type(),
            task_id = event.task_id(),
            "reconciling push event"
        );
        let options = ApplyOptions::suppressed();
        match event {
            TaskEvent::Created { task } => {
                self.cache.apply(move |tasks| prepend_dedup(tasks, task), options);
            }
            TaskEvent::Updated { task } => {
                self.cache.apply(|tasks| replace_by_id(tasks, &task), options);
            }
            TaskEvent::Deleted { task_id } => {
                self.cache.apply(|tasks| remove_by_id(tasks, &task_id), options);
            }
        }
        self.applied += 1;
    }
}

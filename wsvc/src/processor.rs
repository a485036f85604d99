//! Binding between inbound requests and the scheduler.

use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};
use wbase::Task;
use wsched::ScanScheduler;

/// Handles the typed requests a session has finished decoding.
///
/// One processor is shared by every session of a worker; it owns the mapping
/// from wire-level request ids to live tasks.
pub trait MsgProcessor: Send + Sync + fmt::Debug {
    /// Accept a validated query task for scheduling. The task's reply sink
    /// delivers the response; this call must not block on it.
    fn process_query(&self, task: Arc<Task>);

    /// Cancel the query registered under `id`. Returns whether the id was
    /// known.
    fn stop_query(&self, id: &str) -> bool;

    /// Lifecycle state of the query registered under `id`, or `None` when
    /// the id was never seen.
    fn query_status(&self, id: &str) -> Option<String>;
}

/// The production [`MsgProcessor`]: queues tasks on a [`ScanScheduler`] and
/// tracks them by request id for STOP/STATUS.
///
/// The registry holds weak references, so entries age into "completed" on
/// their own once the queue and executors drop a finished task.
#[derive(Debug)]
pub struct SchedulerProcessor {
    scheduler: Arc<ScanScheduler>,
    registry: Mutex<HashMap<String, Weak<Task>>>,
}

impl SchedulerProcessor {
    /// Create a processor feeding `scheduler`.
    pub fn new(scheduler: Arc<ScanScheduler>) -> Self {
        Self {
            scheduler,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// The scheduler this processor feeds.
    pub fn scheduler(&self) -> &Arc<ScanScheduler> {
        &self.scheduler
    }
}

impl MsgProcessor for SchedulerProcessor {
    fn process_query(&self, task: Arc<Task>) {
        {
            let mut registry = self.registry.lock();
            registry.retain(|_, weak| weak.strong_count() > 0);
            registry.insert(task.query_id().to_string(), Arc::downgrade(&task));
        }
        debug!(%task, "query registered");
        self.scheduler.queue_task(task);
    }

    fn stop_query(&self, id: &str) -> bool {
        let task = match self.registry.lock().get(id).and_then(Weak::upgrade) {
            Some(task) => task,
            None => return false,
        };
        info!(%task, "stopping query");
        if let Some(removed) = self.scheduler.cancel_task(&task) {
            // Never reached an executor: the reply sink is still owed its
            // terminal call.
            removed.send_channel().send_error("query cancelled", 499);
        }
        true
    }

    fn query_status(&self, id: &str) -> Option<String> {
        let registry = self.registry.lock();
        let weak = registry.get(id)?;
        match weak.upgrade() {
            Some(task) => {
                let state = if task.is_cancelled() {
                    "cancelled"
                } else if task.has_reservation() {
                    "running"
                } else {
                    "queued"
                };
                Some(format!("{} priority={}", state, task.priority()))
            }
            None => Some("completed".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{ChunkId, Priority, ScanInfo, ScanTable};
    use memman::{MemMan, MockMemMan};
    use wbase::{BufferChannel, SendChannel};
    use wsched::SchedulerConfig;

    fn processor() -> (SchedulerProcessor, Arc<MockMemMan>) {
        let mm = Arc::new(MockMemMan::new());
        let scheduler = Arc::new(ScanScheduler::new(
            "scan",
            Arc::clone(&mm) as Arc<dyn MemMan>,
            SchedulerConfig::default(),
        ));
        (SchedulerProcessor::new(scheduler), mm)
    }

    fn task(id: &str, channel: Arc<dyn SendChannel>) -> Arc<Task> {
        Task::new(
            id,
            "LSST",
            ChunkId::new(42),
            vec!["SELECT 1".to_string()],
            ScanInfo::new(vec![ScanTable::new("LSST", "Object", 10)]),
            Priority::High,
            channel,
        )
        .unwrap()
    }

    #[test]
    fn queries_are_registered_and_stoppable() {
        let (p, _mm) = processor();
        let channel = BufferChannel::new();
        p.process_query(task("abc", Arc::clone(&channel) as Arc<dyn SendChannel>));

        assert_eq!(p.query_status("abc").unwrap(), "queued priority=HIGH");
        assert!(p.query_status("nope").is_none());

        assert!(p.stop_query("abc"));
        assert!(!p.stop_query("missing"));
        assert_eq!(p.scheduler().task_count(), 0);
        // The removed task's reply sink got its terminal error.
        assert_eq!(channel.errors(), vec![(499, "query cancelled".to_string())]);
    }

    #[test]
    fn stopping_a_started_query_only_flags_it() {
        let (p, mm) = processor();
        let channel = BufferChannel::new();
        p.process_query(task("abc", Arc::clone(&channel) as Arc<dyn SendChannel>));

        let got = p.scheduler().get_task().unwrap();
        assert!(p.stop_query("abc"));
        assert!(got.is_cancelled());
        // No terminal reply yet: the executor will short-circuit and send it.
        assert!(channel.errors().is_empty());
        assert_eq!(p.query_status("abc").unwrap(), "cancelled priority=HIGH");
        p.scheduler().task_complete(&got);
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    fn finished_queries_report_completed() {
        let (p, _mm) = processor();
        {
            let channel = BufferChannel::new();
            let t = task("abc", Arc::clone(&channel) as Arc<dyn SendChannel>);
            p.process_query(Arc::clone(&t));
            let got = p.scheduler().get_task().unwrap();
            p.scheduler().task_complete(&got);
            drop(got);
            drop(t);
        }
        assert_eq!(p.query_status("abc").unwrap(), "completed");
    }
}

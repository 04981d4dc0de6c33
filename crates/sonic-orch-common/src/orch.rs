//! Base Orch trait.

use async_trait::async_trait;

/// Base trait for all orchestration agents.
///
/// Each Orch module implements this trait to participate in a daemon's
/// event loop. The daemon calls [`Orch::do_task`] after every change-feed
/// poll, whether or not it returned entries, so that retried entries make
/// progress.
///
/// # Thread Safety
///
/// Orch implementations must be `Send + Sync` so the daemon can hold them
/// across await points on a multi-threaded runtime.
#[async_trait]
pub trait Orch: Send + Sync {
    /// Returns the name of this Orch (for logging and debugging).
    fn name(&self) -> &str;

    /// Processes pending tasks from all consumers.
    ///
    /// Implementations should:
    /// 1. Drain pending entries from consumers
    /// 2. Process each entry
    /// 3. Re-queue entries that failed with a retryable error
    async fn do_task(&mut self);

    /// Returns the priority of this Orch (lower = higher priority).
    fn priority(&self) -> i32 {
        0
    }

    /// Returns true if this Orch has pending work.
    fn has_pending_tasks(&self) -> bool {
        false
    }

    /// Dumps pending tasks for debugging.
    fn dump_pending_tasks(&self) -> Vec<String> {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingOrch {
        name: String,
        task_count: usize,
        pending: bool,
    }

    #[async_trait]
    impl Orch for CountingOrch {
        fn name(&self) -> &str {
            &self.name
        }

        async fn do_task(&mut self) {
            self.task_count += 1;
            self.pending = false;
        }

        fn has_pending_tasks(&self) -> bool {
            self.pending
        }

        fn priority(&self) -> i32 {
            25
        }
    }

    #[tokio::test]
    async fn test_orch_do_task() {
        let mut orch = CountingOrch {
            name: "CountingOrch".to_string(),
            task_count: 0,
            pending: true,
        };

        assert_eq!(orch.name(), "CountingOrch");
        assert!(orch.has_pending_tasks());

        orch.do_task().await;
        assert_eq!(orch.task_count, 1);
        assert!(!orch.has_pending_tasks());
        assert_eq!(orch.priority(), 25);
        assert!(orch.dump_pending_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_orch_as_trait_object() {
        let mut orchs: Vec<Box<dyn Orch>> = vec![Box::new(CountingOrch {
            name: "a".to_string(),
            task_count: 0,
            pending: true,
        })];

        for orch in orchs.iter_mut() {
            orch.do_task().await;
            assert!(!orch.has_pending_tasks());
        }
    }
}

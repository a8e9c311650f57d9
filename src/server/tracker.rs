use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Counts live connection tasks so shutdown can wait for quiescence.
///
/// Cancellation travels separately (registry stop, cancel tokens); the
/// group only answers "does any task still hold a socket". A task is
/// counted from the moment it is spawned until its permit drops.
pub(crate) struct TaskGroup {
    live: AtomicUsize,
    idle: Notify,
}

impl TaskGroup {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            live: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Count one task in. The permit must travel into the task so it is
    /// released on every exit path, panics included.
    pub(crate) fn enter(self: &Arc<Self>) -> TaskPermit {
        self.live.fetch_add(1, Ordering::SeqCst);
        TaskPermit {
            group: Arc::clone(self),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Resolve once no task holds a permit. The waiter is armed before
    /// the count is re-checked so a release in between cannot be missed.
    pub(crate) async fn quiesce(&self) {
        loop {
            let mut idle = pin!(self.idle.notified());
            idle.as_mut().enable();
            if self.len() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// RAII membership in a [`TaskGroup`].
pub(crate) struct TaskPermit {
    group: Arc<TaskGroup>,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        if self.group.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.group.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn quiesce_resolves_immediately_when_empty() {
        let group = TaskGroup::new();
        tokio::time::timeout(Duration::from_millis(100), group.quiesce())
            .await
            .expect("empty group should be quiescent");
    }

    #[tokio::test]
    async fn quiesce_waits_for_every_permit() {
        let group = TaskGroup::new();
        let a = group.enter();
        let b = group.enter();
        assert_eq!(group.len(), 2);

        let waiter = tokio::spawn({
            let group = Arc::clone(&group);
            async move { group.quiesce().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(a);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(b);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("quiesce did not resolve")
            .expect("waiter panicked");
    }

    #[tokio::test]
    async fn permit_released_on_task_panic() {
        let group = TaskGroup::new();
        let permit = group.enter();
        let task = tokio::spawn(async move {
            let _permit = permit;
            panic!("handler blew up");
        });
        let _ = task.await;
        assert_eq!(group.len(), 0);
    }
}

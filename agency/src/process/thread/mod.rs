use super::*;

pub mod compactor;
/// Replication, commit and poll expiry.
pub mod driver;
pub mod heartbeat;

use std::marker::PhantomData;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// Aborts the background task when dropped.
pub struct ThreadHandle(pub AbortHandle);

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Clone)]
pub struct EventProducer<T> {
    inner: Arc<Notify>,
    phantom: PhantomData<T>,
}

impl<T> EventProducer<T> {
    /// Wakes the consumer. Events pushed while it is busy collapse into one.
    pub fn push_event(&self, _: T) {
        self.inner.notify_one();
    }
}

pub struct EventConsumer<T> {
    inner: Arc<Notify>,
    phantom: PhantomData<T>,
}

impl<T> EventConsumer<T> {
    /// Return if an event is produced or `timeout` elapsed.
    pub async fn consume_events(&self, timeout: Duration) {
        tokio::time::timeout(timeout, self.inner.notified())
            .await
            .ok();
    }
}

pub fn notify<T>() -> (EventProducer<T>, EventConsumer<T>) {
    let inner = Arc::new(Notify::new());
    (
        EventProducer {
            inner: inner.clone(),
            phantom: PhantomData,
        },
        EventConsumer {
            inner,
            phantom: PhantomData,
        },
    )
}

/// Pushed by `Agent::write` after appending, by `take_office`
/// and by a successful append response. Wakes the driver for the next
/// replication round and commit.
#[derive(Clone)]
pub struct DriverEvent;

/// Pushed by the commit advance once the commit index moved
/// `compaction_step_size` past the last compaction. Wakes the compactor.
#[derive(Clone)]
pub struct CompactionEvent;

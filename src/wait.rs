//! `Waitable` (§9 design note): "Coroutine-ish `TimeoutFuture` / watch-waits
//! → a `Waitable` trait with `wait_for_any(timeout)`; one implementation
//! is a timer, another wraps a KV watch."
//!
//! The run loop's idle wait (§4.5 step 6: "wait on any of { active watch,
//! sanity watch, 1 s timer }") is the one caller; it builds a small list
//! of `Waitable`s and waits for whichever resolves first.

use std::time::Duration;

use async_trait::async_trait;

use crate::store::Store;

/// Something the run loop can block on until it either fires or a
/// timeout elapses — a KV watch, a fixed timer, or any future source of
/// "wake me up" the loop might gain later.
#[async_trait]
pub trait Waitable: Send {
    /// Wait for this source to fire, or for `timeout` to elapse —
    /// whichever comes first. Returns `true` iff the source fired.
    async fn wait_for_any(&mut self, timeout: Duration) -> bool;
}

/// Fires once `duration` has elapsed; never returns `false` early.
pub struct Timer {
    duration: Duration,
}

impl Timer {
    pub fn new(duration: Duration) -> Self {
        Timer { duration }
    }
}

#[async_trait]
impl Waitable for Timer {
    async fn wait_for_any(&mut self, timeout: Duration) -> bool {
        let wait = self.duration.min(timeout);
        tokio::time::sleep(wait).await;
        wait == self.duration
    }
}

/// Fires when the given change-counter key is next written.
pub struct KvWatch {
    store: Store,
    key: Vec<u8>,
}

impl KvWatch {
    pub fn new(store: Store, key: Vec<u8>) -> Self {
        KvWatch { store, key }
    }
}

#[async_trait]
impl Waitable for KvWatch {
    async fn wait_for_any(&mut self, timeout: Duration) -> bool {
        let fut = self.store.watch(&self.key);
        tokio::select! {
            _ = fut => true,
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

/// Wait for whichever of `sources` fires first, or for `timeout` to
/// elapse with none of them firing. Each source runs concurrently on
/// its own task, polled to the same deadline.
pub async fn wait_for_any(sources: Vec<Box<dyn Waitable>>, timeout: Duration) -> bool {
    let mut set = tokio::task::JoinSet::new();
    for mut source in sources {
        set.spawn(async move { source.wait_for_any(timeout).await });
    }

    let mut any_fired = false;
    while let Some(result) = set.join_next().await {
        if matches!(result, Ok(true)) {
            any_fired = true;
            break;
        }
    }
    set.abort_all();
    any_fired
}

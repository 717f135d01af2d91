//! Pushing finalized history into dedicated consumer stores
//!
//! Each consumer with a `MaterializedStore` has a single-flight pump. A
//! trigger either starts the worker or, if one is already draining, leaves
//! a retry request that the worker picks up before it exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{Consumer, Historian, ThingLog};

#[derive(Debug, Default)]
pub(crate) struct UpdatePump {
    draining: AtomicBool,
    retry: AtomicBool,
}

impl UpdatePump {
    /// Request a drain; returns true when the caller must start the worker
    pub(crate) fn request(&self) -> bool {
        self.retry.store(true, Ordering::SeqCst);
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Start of a worker pass: consume pending requests
    pub(crate) fn begin_pass(&self) {
        self.retry.store(false, Ordering::SeqCst);
    }

    /// End of a worker pass: true when another pass is needed
    pub(crate) fn should_continue(&self) -> bool {
        if self.retry.load(Ordering::SeqCst) {
            return true;
        }
        self.draining.store(false, Ordering::SeqCst);
        // A request that raced the release above must not be lost.
        self.retry.load(Ordering::SeqCst)
            && self
                .draining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Give up the worker slot without draining
    pub(crate) fn release(&self) {
        self.draining.store(false, Ordering::SeqCst);
    }
}

/// Wake the pumps of every consumer of `thing` that owns a dedicated store
pub(crate) fn propagate_updates(historian: &Historian, thing: &ThingLog) {
    for consumer in historian.consumers_of(&thing.thing_id) {
        if consumer.store().is_some() {
            trigger(historian, consumer);
        }
    }
}

pub(crate) fn trigger(historian: &Historian, consumer: Arc<Consumer>) {
    if !consumer.pump.request() {
        return;
    }
    match (&historian.runtime, historian.self_ref.upgrade()) {
        (Some(handle), Some(historian)) => {
            handle.spawn(drain_to_store(historian, consumer));
        }
        _ => consumer.pump.release(),
    }
}

async fn drain_to_store(historian: Arc<Historian>, consumer: Arc<Consumer>) {
    loop {
        consumer.pump.begin_pass();
        drain_once(&historian, &consumer).await;
        if !consumer.pump.should_continue() {
            break;
        }
    }
}

async fn drain_once(historian: &Historian, consumer: &Consumer) {
    let mut wait_for_pending = false;
    loop {
        let Some(store) = consumer.store() else {
            return;
        };
        let (min_count, timeout) = if wait_for_pending {
            (1, None)
        } else {
            (0, Some(Duration::ZERO))
        };

        let Some(response) = historian
            .get_history(
                consumer.token,
                None,
                min_count,
                timeout,
                &historian.shutdown_token,
                false,
            )
            .await
        else {
            return;
        };

        if !response.is_empty() {
            match store.append_items(&response.history_items) {
                Ok(()) => {
                    debug!(
                        token = %consumer.token,
                        items = response.len(),
                        "Pushed history into dedicated store"
                    );
                    historian.clear_history(consumer.token);
                }
                Err(e) => {
                    warn!(token = %consumer.token, error = %e, "Dedicated store rejected items");
                    return;
                }
            }
        }

        if response.pending_item_count == 0 || historian.shutdown_token.is_cancelled() {
            return;
        }
        wait_for_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight() {
        let pump = UpdatePump::default();
        assert!(pump.request());
        // Worker already running: the second trigger only leaves a request
        assert!(!pump.request());

        pump.begin_pass();
        assert!(!pump.should_continue());
        // The slot is free again
        assert!(pump.request());
    }

    #[test]
    fn test_request_during_pass_forces_another_pass() {
        let pump = UpdatePump::default();
        assert!(pump.request());
        pump.begin_pass();

        assert!(!pump.request());
        assert!(pump.should_continue());
        // The worker kept its slot
        assert!(!pump.request());

        pump.begin_pass();
        assert!(!pump.should_continue());
    }
}

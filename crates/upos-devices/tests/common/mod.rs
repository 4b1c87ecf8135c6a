//! Helpers shared by the device category tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use upos_runtime::RecordingListener;

pub fn listener() -> Arc<RecordingListener> {
    Arc::new(RecordingListener::new())
}

/// Wait until `listener` recorded `count` events, failing the test after a
/// second.
pub async fn expect_events(listener: &RecordingListener, count: usize) {
    assert!(
        listener.wait_for_events(count, Duration::from_secs(1)).await,
        "expected {count} events, got {:?}",
        listener.events()
    );
}

/// Let spawned tasks run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

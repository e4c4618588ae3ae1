// Shared helpers for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use querybind::{Endpoint, EndpointOptions};
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once. Set `RUST_LOG=querybind=trace` to see fetch traces.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Counts invocations of a fetch function.
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    /// Records a call and returns its 1-based number.
    pub fn record(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Endpoint whose fetch returns `n.to_string()` after `latency`.
pub fn to_string_endpoint(
    latency: Duration,
    options: EndpointOptions<u32, String>,
) -> (Endpoint<u32, String>, Calls) {
    let calls = Calls::default();
    let counter = calls.clone();
    let endpoint = Endpoint::with_options(
        move |n: u32, _token| {
            counter.record();
            async move {
                tokio::time::sleep(latency).await;
                Ok(n.to_string())
            }
        },
        options,
    );
    (endpoint, calls)
}

/// Endpoint whose fetch returns `"{n}-{call}"`, making every fetch result distinct.
pub fn numbered_endpoint(
    latency: Duration,
    options: EndpointOptions<u32, String>,
) -> (Endpoint<u32, String>, Calls) {
    let calls = Calls::default();
    let counter = calls.clone();
    let endpoint = Endpoint::with_options(
        move |n: u32, _token| {
            let call = counter.record();
            async move {
                tokio::time::sleep(latency).await;
                Ok(format!("{n}-{call}"))
            }
        },
        options,
    );
    (endpoint, calls)
}

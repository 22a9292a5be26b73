use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    pub messages_scanned: IntCounter,
    pub matches_found: IntCounter,
    pub channels_skipped: IntCounter,
    pub rate_limit_waits: IntCounter,
    pub fetch_retries: IntCounter,
    registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(name: &str, help: &str) -> IntCounter {
    // Names and help strings are static and valid, so construction cannot fail.
    IntCounter::with_opts(Opts::new(name, help).namespace("msgscan"))
        .unwrap_or_else(|e| panic!("invalid metric {name}: {e}"))
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let messages_scanned = counter("messages_scanned", "Number of messages inspected");
        let matches_found = counter("matches_found", "Number of messages matched");
        let channels_skipped = counter(
            "channels_skipped",
            "Number of channels skipped after a fetch failure",
        );
        let rate_limit_waits = counter(
            "rate_limit_waits",
            "Number of times a fetch waited out a rate limit",
        );
        let fetch_retries = counter(
            "fetch_retries",
            "Number of page fetches retried after a transient failure",
        );

        registry.register(Box::new(messages_scanned.clone())).ok();
        registry.register(Box::new(matches_found.clone())).ok();
        registry.register(Box::new(channels_skipped.clone())).ok();
        registry.register(Box::new(rate_limit_waits.clone())).ok();
        registry.register(Box::new(fetch_retries.clone())).ok();

        Metrics {
            messages_scanned,
            matches_found,
            channels_skipped,
            rate_limit_waits,
            fetch_retries,
            registry: Arc::new(registry),
        }
    }

    pub fn gather(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

pub mod metrics;

pub use metrics::{run_metrics_server, Metrics};

/// Structured crawl/index event log: `EVENT    key=value key=value`.
///
/// The `enabled` flag comes from `Settings.crawl_log` so operators can mute
/// the per-URL firehose without touching the tracing filter.
pub fn log_event(enabled: bool, event: &str, fields: &[(&str, String)]) {
    if !enabled {
        return;
    }
    let parts = fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ");
    tracing::info!("{:<8} {}", event.to_uppercase(), parts);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_event_disabled_is_silent() {
        // Nothing to assert beyond "does not panic" — the guard returns early.
        log_event(false, "deny", &[("url", "https://example.com".to_string())]);
        log_event(true, "deny", &[("url", "https://example.com".to_string())]);
    }
}

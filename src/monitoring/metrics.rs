use anyhow::Result;
use axum::{extract::State, routing::get, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::info;

/// Process-wide metric handles. Constructed once by the composition root and
/// passed by reference; no global registry.
pub struct Metrics {
    registry: Registry,
    crawl_pages: IntCounterVec,
    index_docs: IntCounter,
    search_latency_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let crawl_pages = IntCounterVec::new(
            Opts::new("crawler_pages_total", "Total pages fetched by crawler"),
            &["domain"],
        )?;
        let index_docs = IntCounter::new("indexer_docs_total", "Total docs indexed")?;
        let search_latency_ms = Histogram::with_opts(
            HistogramOpts::new("search_latency_ms", "Search latency in milliseconds").buckets(
                vec![
                    5.0, 10.0, 20.0, 30.0, 40.0, 50.0, 75.0, 100.0, 200.0, 400.0, 800.0,
                ],
            ),
        )?;

        registry.register(Box::new(crawl_pages.clone()))?;
        registry.register(Box::new(index_docs.clone()))?;
        registry.register(Box::new(search_latency_ms.clone()))?;

        Ok(Self {
            registry,
            crawl_pages,
            index_docs,
            search_latency_ms,
        })
    }

    pub fn record_crawl(&self, domain: &str) {
        self.crawl_pages.with_label_values(&[domain]).inc();
    }

    pub fn record_index(&self) {
        self.index_docs.inc();
    }

    pub fn observe_search_latency(&self, latency_ms: f64) {
        self.search_latency_ms.observe(latency_ms);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render().unwrap_or_default()
}

/// Serve `/metrics` until the process exits.
pub async fn run_metrics_server(metrics: Arc<Metrics>, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Metrics server listening on http://{bind_addr}/metrics");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_after_increment() {
        let metrics = Metrics::new().unwrap();
        metrics.record_crawl("engineering.fb.com");
        metrics.record_crawl("engineering.fb.com");
        metrics.record_index();
        metrics.observe_search_latency(12.5);

        let text = metrics.render().unwrap();
        assert!(text.contains("crawler_pages_total"));
        assert!(text.contains("domain=\"engineering.fb.com\""));
        assert!(text.contains("indexer_docs_total 1"));
        assert!(text.contains("search_latency_ms_bucket"));
    }
}

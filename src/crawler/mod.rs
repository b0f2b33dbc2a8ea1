use crate::core::config::Settings;
use crate::frontier::allowlist::{
    is_allowed_url, is_listing_url, is_sitemap_url, normalize_url, parse_domain,
    parse_sitemap_links, sitemap_urls_for_domain,
};
use crate::frontier::robots::RobotsGate;
use crate::frontier::{unix_now, CrawlItem, Frontier, SOURCE_SEED, SOURCE_SITEMAP};
use crate::monitoring::{log_event, Metrics};
use crate::storage::PageArchive;
use crate::store::StoreClient;
use anyhow::Result;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

#[derive(Debug, Clone)]
pub struct CrawlResult {
    pub url: String,
    pub status: u16,
    pub html: String,
}

/// Stop-at-N-docs budget shared by every worker in the process.
pub struct CrawlBudget {
    max_docs: usize,
    stored: AtomicUsize,
}

impl CrawlBudget {
    pub fn new(max_docs: usize) -> Self {
        Self {
            max_docs,
            stored: AtomicUsize::new(0),
        }
    }

    /// Count one stored doc; true once the budget is exhausted.
    fn record_store(&self) -> bool {
        self.stored.fetch_add(1, Ordering::SeqCst) + 1 >= self.max_docs
    }
}

pub fn url_hash(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// All `<a href>` targets of a page, resolved against the response URL and
/// normalized. Sync on purpose: the parsed DOM must not cross an await.
fn extract_links(html: &str, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let doc = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut links = Vec::new();
    let mut seen = HashSet::new();
    for element in doc.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty()
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("javascript:")
            || href.starts_with('#')
        {
            continue;
        }
        let Ok(absolute) = base.join(href) else {
            continue;
        };
        let Some(normalized) = normalize_url(absolute.as_str()) else {
            continue;
        };
        if seen.insert(normalized.clone()) {
            links.push(normalized);
        }
    }
    links
}

/// Shared context for the worker pool. Workers hold no mutable state of
/// their own — every coordination primitive lives in the store.
#[derive(Clone)]
pub struct Crawler {
    settings: Arc<Settings>,
    store: StoreClient,
    frontier: Frontier,
    robots: RobotsGate,
    archive: Arc<PageArchive>,
    http: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl Crawler {
    pub fn new(
        settings: Arc<Settings>,
        store: StoreClient,
        archive: Arc<PageArchive>,
        http: reqwest::Client,
        metrics: Arc<Metrics>,
    ) -> Self {
        let frontier = Frontier::new(store.clone(), &settings);
        let robots = RobotsGate::new(store.clone(), http.clone(), &settings);
        Self {
            settings,
            store,
            frontier,
            robots,
            archive,
            http,
            metrics,
        }
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    fn log(&self, event: &str, fields: &[(&str, String)]) {
        log_event(self.settings.crawl_log, event, fields);
    }

    async fn fetch_html(&self, url: &str) -> Result<CrawlResult, reqwest::Error> {
        let response = self
            .http
            .get(url)
            .timeout(Duration::from_secs(self.settings.request_timeout_s))
            .send()
            .await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let html = response.text().await?;
        Ok(CrawlResult {
            url: final_url,
            status,
            html,
        })
    }

    /// Robots verdict plus rate-limit reservation. Returns the domain when
    /// the fetch may proceed; otherwise the item has been dropped or parked.
    async fn clear_for_fetch(&self, item: &CrawlItem) -> Result<Option<String>> {
        let domain = parse_domain(&item.url);
        let rules = self.robots.get_or_fetch(&domain).await?;
        if !rules.can_fetch(&self.settings.user_agent, &item.url) {
            self.log(
                "deny",
                &[("url", item.url.clone()), ("reason", "robots".to_string())],
            );
            return Ok(None);
        }
        let (allowed, next_allowed) = self
            .robots
            .reserve_next_allowed(&domain, rules.min_delay_s())
            .await?;
        if !allowed {
            self.frontier.delay(item, next_allowed).await?;
            self.log(
                "delay",
                &[
                    ("url", item.url.clone()),
                    ("until", next_allowed.to_string()),
                ],
            );
            return Ok(None);
        }
        Ok(Some(domain))
    }

    async fn handle_sitemap(&self, item: &CrawlItem, result: &CrawlResult) -> Result<()> {
        let links = parse_sitemap_links(&result.html);
        let total = links.len();
        for link in links {
            let Some(normalized) = normalize_url(&link) else {
                continue;
            };
            if !is_allowed_url(&normalized) {
                continue;
            }
            self.frontier
                .enqueue(
                    &CrawlItem::new(normalized, SOURCE_SITEMAP, item.depth + 1),
                    true,
                )
                .await?;
        }
        self.log(
            "sitemap",
            &[("url", item.url.clone()), ("links", total.to_string())],
        );
        Ok(())
    }

    async fn enqueue_discovered(
        &self,
        item: &CrawlItem,
        result: &CrawlResult,
        domain: &str,
    ) -> Result<()> {
        if item.depth >= self.settings.crawl_depth_limit {
            return Ok(());
        }
        let links = extract_links(&result.html, &result.url);
        let next_depth = item.depth + 1;
        for link in links {
            if link == item.url {
                continue;
            }
            if !self.settings.crawl_allow_external && parse_domain(&link) != domain {
                continue;
            }
            if !is_allowed_url(&link) {
                continue;
            }
            self.frontier
                .enqueue(&CrawlItem::new(link, item.source.clone(), next_depth), true)
                .await?;
        }
        Ok(())
    }

    /// Persist an article page: raw HTML to the archive, the fetch record to
    /// the store, the doc id onto the indexing queue. Listing pages, seeds
    /// at depth 0, and sitemaps are link sources only.
    async fn persist(
        &self,
        item: &CrawlItem,
        result: &CrawlResult,
        domain: &str,
    ) -> Result<bool> {
        let skip_reason = if item.source == SOURCE_SITEMAP {
            Some(item.source.clone())
        } else if item.source == SOURCE_SEED && item.depth == 0 {
            Some("seed".to_string())
        } else if is_listing_url(&item.url) {
            Some("listing".to_string())
        } else {
            None
        };
        if let Some(reason) = skip_reason {
            self.log("skip", &[("url", item.url.clone()), ("reason", reason)]);
            return Ok(false);
        }
        if !self.archive.enabled() {
            self.log(
                "skip",
                &[
                    ("url", item.url.clone()),
                    ("reason", "archive_disabled".to_string()),
                ],
            );
            return Ok(false);
        }

        let doc_id = self.store.incr(&self.settings.crawl_doc_seq_key).await?;
        let raw_path = match self.archive.store_raw_html(doc_id, &result.html).await {
            Ok(path) => path.unwrap_or_default(),
            Err(err) => {
                self.log(
                    "archive_fail",
                    &[("url", item.url.clone()), ("error", err.to_string())],
                );
                return Ok(false);
            }
        };

        let doc_key = format!("{}{}", self.settings.crawl_doc_key_prefix, doc_id);
        let fields = vec![
            ("url".to_string(), item.url.clone().into_bytes()),
            ("domain".to_string(), domain.to_string().into_bytes()),
            ("source".to_string(), item.source.clone().into_bytes()),
            ("depth".to_string(), item.depth.to_string().into_bytes()),
            ("raw_path".to_string(), raw_path.clone().into_bytes()),
            ("cleaned_path".to_string(), Vec::new()),
            ("url_hash".to_string(), url_hash(&item.url).into_bytes()),
            ("fetched_at".to_string(), unix_now().to_string().into_bytes()),
            ("status".to_string(), result.status.to_string().into_bytes()),
        ];
        self.store.hset_map(&doc_key, &fields).await?;
        self.store
            .rpush(&self.settings.raw_queue_key, &doc_id.to_string())
            .await?;
        self.log(
            "stored",
            &[
                ("id", doc_id.to_string()),
                ("url", item.url.clone()),
                ("raw", raw_path),
            ],
        );
        Ok(true)
    }

    /// One worker's loop. Correctness across the fleet comes entirely from
    /// store atomics: `SADD` dedup, `INCR` ids, and the reservation CAS.
    pub async fn worker(
        &self,
        stop: CancellationToken,
        budget: Option<Arc<CrawlBudget>>,
    ) -> Result<()> {
        loop {
            if stop.is_cancelled() {
                return Ok(());
            }
            self.frontier.requeue_delayed(100).await?;
            let Some(item) = self.frontier.dequeue().await? else {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };
            self.log(
                "pick",
                &[
                    ("url", item.url.clone()),
                    ("depth", item.depth.to_string()),
                    ("source", item.source.clone()),
                ],
            );

            let Some(domain) = self.clear_for_fetch(&item).await? else {
                continue;
            };

            let result = match self.fetch_html(&item.url).await {
                Ok(result) if result.status < 400 => result,
                Ok(result) => {
                    self.log(
                        "fail",
                        &[("url", item.url.clone()), ("status", result.status.to_string())],
                    );
                    continue;
                }
                Err(err) => {
                    // Transient failures are dropped, not retried.
                    self.log(
                        "fail",
                        &[
                            ("url", item.url.clone()),
                            ("status", "error".to_string()),
                            ("error", err.to_string()),
                        ],
                    );
                    continue;
                }
            };

            if is_sitemap_url(&result.url) {
                self.handle_sitemap(&item, &result).await?;
                continue;
            }

            self.enqueue_discovered(&item, &result, &domain).await?;
            let stored = self.persist(&item, &result, &domain).await?;
            self.metrics.record_crawl(&domain);

            if stored {
                if let Some(budget) = &budget {
                    if budget.record_store() {
                        stop.cancel();
                    }
                }
            }
        }
    }
}

/// Seed the frontier with a start URL and its domain's sitemap candidates.
pub async fn seed_queue(
    frontier: &Frontier,
    settings: &Settings,
    seed_url: &str,
    source: &str,
) -> Result<()> {
    let normalized = normalize_url(seed_url);
    log_event(
        settings.crawl_log,
        "seed_queue",
        &[(
            "normalized_url",
            normalized.clone().unwrap_or_else(|| "invalid".to_string()),
        )],
    );
    let Some(normalized) = normalized else {
        return Ok(());
    };
    frontier
        .enqueue(&CrawlItem::new(normalized.clone(), source, 0), true)
        .await?;
    let domain = parse_domain(&normalized);
    for sitemap_url in sitemap_urls_for_domain(&domain) {
        log_event(
            settings.crawl_log,
            "seed_queue",
            &[
                ("domain", domain.clone()),
                ("sitemap_url", sitemap_url.clone()),
            ],
        );
        frontier
            .enqueue(&CrawlItem::new(sitemap_url, SOURCE_SITEMAP, 0), true)
            .await?;
    }
    Ok(())
}

/// Run the worker pool to completion. With `max_docs` set, the pool drains
/// once the budget is met; with `idle_grace` set, the pool drains after the
/// queue and delay set have both been empty that long.
pub async fn run_crawlers(
    crawler: Crawler,
    workers: usize,
    max_docs: Option<usize>,
    idle_grace_s: Option<f64>,
) -> Result<()> {
    if matches!(max_docs, Some(0)) {
        return Ok(());
    }
    let stop = CancellationToken::new();
    let budget = max_docs.map(|n| Arc::new(CrawlBudget::new(n)));

    let mut pool = JoinSet::new();
    for _ in 0..workers.max(1) {
        let crawler = crawler.clone();
        let stop = stop.clone();
        let budget = budget.clone();
        pool.spawn(async move { crawler.worker(stop, budget).await });
    }
    info!("crawler pool started ({} workers)", workers.max(1));

    if let Some(grace) = idle_grace_s {
        let frontier = crawler.frontier().clone();
        let stop_watch = stop.clone();
        pool.spawn(async move {
            let mut last_active = tokio::time::Instant::now();
            loop {
                if stop_watch.is_cancelled() {
                    return Ok(());
                }
                let queue_len = frontier.queue_len().await.unwrap_or(0);
                let delay_len = frontier.delay_len().await.unwrap_or(0);
                if queue_len == 0 && delay_len == 0 {
                    if last_active.elapsed().as_secs_f64() >= grace.max(0.0) {
                        stop_watch.cancel();
                        return Ok(());
                    }
                } else {
                    last_active = tokio::time::Instant::now();
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
    }

    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                // A store failure is fatal for the whole pool; let the
                // supervisor restart us in a known state.
                error!("crawl worker failed: {err:#}");
                stop.cancel();
            }
            Err(err) => error!("crawl worker panicked: {err}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_hash_is_stable_sha256() {
        assert_eq!(
            url_hash("https://engineering.fb.com/"),
            url_hash("https://engineering.fb.com/")
        );
        assert_eq!(url_hash("a").len(), 64);
        assert_ne!(url_hash("a"), url_hash("b"));
    }

    #[test]
    fn extract_links_resolves_and_filters() {
        let html = r##"<html><body>
            <a href="/2024/01/15/systems/foo">abs path</a>
            <a href="https://engineering.fb.com/2024/02/02/ml/bar/">trailing slash</a>
            <a href="mailto:dev@example.com">mail</a>
            <a href="#section">frag</a>
            <a href="javascript:void(0)">js</a>
            <a href="/2024/01/15/systems/foo">dupe</a>
        </body></html>"##;
        let links = extract_links(html, "https://engineering.fb.com/");
        assert_eq!(
            links,
            vec![
                "https://engineering.fb.com/2024/01/15/systems/foo".to_string(),
                "https://engineering.fb.com/2024/02/02/ml/bar".to_string(),
            ]
        );
    }

    #[test]
    fn budget_trips_exactly_at_limit() {
        let budget = CrawlBudget::new(2);
        assert!(!budget.record_store());
        assert!(budget.record_store());
        assert!(budget.record_store());
    }
}

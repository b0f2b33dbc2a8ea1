pub mod allowlist;
pub mod robots;

use crate::core::config::Settings;
use crate::store::StoreClient;
use anyhow::Result;
use chrono::Utc;

pub const SOURCE_SEED: &str = "seed";
pub const SOURCE_SITEMAP: &str = "sitemap";

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// One crawl work unit. Two items with the same normalized `url` are the
/// same unit of work regardless of `source` or `depth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlItem {
    pub url: String,
    pub source: String,
    pub depth: u32,
}

impl CrawlItem {
    pub fn new(url: impl Into<String>, source: impl Into<String>, depth: u32) -> Self {
        Self {
            url: url.into(),
            source: source.into(),
            depth,
        }
    }

    /// Tab-delimited wire form: `url⇥source⇥depth`.
    pub fn serialize(&self) -> String {
        format!("{}\t{}\t{}", self.url, self.source, self.depth)
    }

    /// Inverse of `serialize`. A missing or malformed depth decodes as 0 so
    /// items written by older workers still drain.
    pub fn deserialize(raw: &str) -> Option<Self> {
        let mut parts = raw.split('\t');
        let url = parts.next()?.to_string();
        let source = parts.next()?.to_string();
        if url.is_empty() {
            return None;
        }
        let depth = parts
            .next()
            .and_then(|d| d.parse::<u32>().ok())
            .unwrap_or(0);
        Some(Self { url, source, depth })
    }
}

/// The crawler's shared work queue: FIFO list + delayed-retry sorted set +
/// seen-URL dedup set, all living in the coordination store so any number of
/// stateless workers can cooperate.
#[derive(Clone)]
pub struct Frontier {
    store: StoreClient,
    queue_key: String,
    delay_key: String,
    seen_key: String,
}

impl Frontier {
    pub fn new(store: StoreClient, settings: &Settings) -> Self {
        Self {
            store,
            queue_key: settings.crawl_queue_key.clone(),
            delay_key: settings.crawl_delay_key.clone(),
            seen_key: settings.crawl_seen_key.clone(),
        }
    }

    /// Admit an item. With dedupe on (the default), the URL passes through
    /// the seen set first via an atomic `SADD`, which guarantees at-most-once
    /// admission across all workers. Returns whether the item was enqueued.
    pub async fn enqueue(&self, item: &CrawlItem, dedupe: bool) -> Result<bool> {
        if dedupe && !self.store.sadd(&self.seen_key, &item.url).await? {
            return Ok(false);
        }
        self.store.rpush(&self.queue_key, &item.serialize()).await?;
        Ok(true)
    }

    pub async fn dequeue(&self) -> Result<Option<CrawlItem>> {
        let raw = self.store.lpop(&self.queue_key).await?;
        Ok(raw.as_deref().and_then(CrawlItem::deserialize))
    }

    /// Park an item until `when_ts` (unix seconds).
    pub async fn delay(&self, item: &CrawlItem, when_ts: i64) -> Result<()> {
        self.store
            .zadd(&self.delay_key, &item.serialize(), when_ts as f64)
            .await
    }

    /// Move every delayed item whose ready-time has passed back onto the
    /// queue, in score order. Safe under concurrent callers: the pipelined
    /// `ZREM` only succeeds for the caller that still sees the member.
    pub async fn requeue_delayed(&self, max: isize) -> Result<usize> {
        let due = self
            .store
            .zrangebyscore_limit(&self.delay_key, unix_now() as f64, max)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }
        self.store
            .move_members(&self.delay_key, &self.queue_key, &due)
            .await?;
        Ok(due.len())
    }

    pub async fn queue_len(&self) -> Result<i64> {
        self.store.llen(&self.queue_key).await
    }

    pub async fn delay_len(&self) -> Result<i64> {
        self.store.zcard(&self.delay_key).await
    }
}

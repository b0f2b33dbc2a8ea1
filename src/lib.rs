pub mod api;
pub mod core;
pub mod crawler;
pub mod embeddings;
pub mod etl;
pub mod frontier;
pub mod indexer;
pub mod monitoring;
pub mod ops;
pub mod search;
pub mod storage;
pub mod store;

// --- Primary exports ---
pub use crate::core::config::Settings;
pub use crate::crawler::{run_crawlers, seed_queue, Crawler};
pub use crate::embeddings::{EmbedError, EmbeddingProvider};
pub use crate::etl::{parse_html, ParsedDocument};
pub use crate::frontier::{CrawlItem, Frontier};
pub use crate::indexer::{create_search_index, Indexer};
pub use crate::monitoring::Metrics;
pub use crate::search::{SearchMode, SearchPlanner, SearchResult};
pub use crate::storage::PageArchive;
pub use crate::store::StoreClient;

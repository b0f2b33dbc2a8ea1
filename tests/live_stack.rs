//! Live coordination-store suite: exercises the frontier, reservation CAS,
//! indexer, and search planner against a real Redis Stack instance.
//!
//! Run with: REDIS_URL=redis://127.0.0.1:6379/0 cargo test --test live_stack -- --ignored

use engverse::api::ApiState;
use engverse::etl::ParsedDocument;
use engverse::frontier::{unix_now, CrawlItem, Frontier};
use engverse::search::{SearchMode, SearchPlanner};
use engverse::{EmbeddingProvider, Indexer, Metrics, PageArchive, Settings, StoreClient};
use std::sync::Arc;

fn test_settings(ns: &str) -> Settings {
    let mut settings = Settings::from_env();
    settings.crawl_queue_key = format!("test:{ns}:crawl:queue");
    settings.crawl_delay_key = format!("test:{ns}:crawl:delay");
    settings.crawl_seen_key = format!("test:{ns}:crawl:seen");
    settings.crawl_doc_seq_key = format!("test:{ns}:crawl:doc_seq");
    settings.crawl_doc_key_prefix = format!("test:{ns}:crawl:doc:");
    settings.raw_queue_key = format!("test:{ns}:raw:queue");
    settings.robots_key_prefix = format!("test:{ns}:robots:");
    settings.robots_next_allowed_prefix = format!("test:{ns}:robots:next_allowed:");
    settings.doc_key_prefix = format!("test:{ns}:doc:");
    settings.index_name = format!("test:{ns}:idx");
    settings.embeddings_provider = "dummy".to_string();
    settings.embeddings_dim = 16;
    settings.keyword_only = false;
    settings.crawl_log = false;
    settings
}

async fn connect(settings: &Settings) -> StoreClient {
    StoreClient::connect(&settings.redis_url)
        .await
        .expect("redis must be reachable for live tests")
}

async fn cleanup(store: &StoreClient, settings: &Settings) {
    let mut keys = vec![
        settings.crawl_queue_key.clone(),
        settings.crawl_delay_key.clone(),
        settings.crawl_seen_key.clone(),
        settings.crawl_doc_seq_key.clone(),
        settings.raw_queue_key.clone(),
    ];
    for pattern in [
        format!("{}*", settings.doc_key_prefix),
        format!("{}*", settings.crawl_doc_key_prefix),
        format!("{}*", settings.robots_key_prefix),
    ] {
        keys.extend(store.scan_match(&pattern).await.unwrap_or_default());
    }
    let _ = store.del(&keys).await;
}

fn make_indexer(settings: &Arc<Settings>, store: StoreClient) -> Indexer {
    let provider = EmbeddingProvider::Dummy {
        dim: settings.embeddings_dim,
    };
    Indexer::new(
        settings.clone(),
        store,
        Arc::new(PageArchive::Disabled),
        Some(provider),
        None,
        Arc::new(Metrics::new().unwrap()),
    )
}

fn make_planner(settings: &Arc<Settings>, store: StoreClient) -> SearchPlanner {
    let provider = EmbeddingProvider::Dummy {
        dim: settings.embeddings_dim,
    };
    SearchPlanner::new(
        settings.clone(),
        store,
        Some(provider),
        None,
        Arc::new(Metrics::new().unwrap()),
    )
}

fn article(url: &str, title: &str, content: &str) -> ParsedDocument {
    ParsedDocument {
        url: url.to_string(),
        title: title.to_string(),
        content: content.to_string(),
        authors: vec![],
        company: "Meta".to_string(),
        published_at: None,
        canonical_url: None,
        language: Some("en".to_string()),
    }
}

#[tokio::test]
#[ignore]
async fn enqueue_is_at_most_once() {
    let settings = test_settings("dedup");
    let store = connect(&settings).await;
    cleanup(&store, &settings).await;
    let frontier = Frontier::new(store.clone(), &settings);

    let item = CrawlItem::new("https://engineering.fb.com/2024/01/15/systems/foo", "seed", 1);
    assert!(frontier.enqueue(&item, true).await.unwrap());
    assert!(!frontier.enqueue(&item, true).await.unwrap());
    assert!(!frontier
        .enqueue(&CrawlItem::new(item.url.clone(), "sitemap", 3), true)
        .await
        .unwrap());
    assert_eq!(frontier.queue_len().await.unwrap(), 1);

    cleanup(&store, &settings).await;
}

#[tokio::test]
#[ignore]
async fn requeue_promotes_only_due_items_in_score_order() {
    let settings = test_settings("requeue");
    let store = connect(&settings).await;
    cleanup(&store, &settings).await;
    let frontier = Frontier::new(store.clone(), &settings);

    let now = unix_now();
    let early = CrawlItem::new("https://slack.engineering/early", "seed", 1);
    let later = CrawlItem::new("https://slack.engineering/later", "seed", 1);
    let future = CrawlItem::new("https://slack.engineering/future", "seed", 1);
    frontier.delay(&later, now - 5).await.unwrap();
    frontier.delay(&early, now - 50).await.unwrap();
    frontier.delay(&future, now + 3600).await.unwrap();

    let moved = frontier.requeue_delayed(100).await.unwrap();
    assert_eq!(moved, 2);
    assert_eq!(frontier.delay_len().await.unwrap(), 1);
    assert_eq!(frontier.dequeue().await.unwrap().unwrap().url, early.url);
    assert_eq!(frontier.dequeue().await.unwrap().unwrap().url, later.url);
    assert!(frontier.dequeue().await.unwrap().is_none());

    cleanup(&store, &settings).await;
}

#[tokio::test]
#[ignore]
async fn reservation_is_mutually_exclusive_and_spaced() {
    let settings = test_settings("reserve");
    let store = connect(&settings).await;
    cleanup(&store, &settings).await;

    let key = format!("{}engineering.fb.com", settings.robots_next_allowed_prefix);
    let now = unix_now();
    let (first_ok, first_deadline) = store.reserve_deadline(&key, now, 5).await.unwrap();
    let (second_ok, second_deadline) = store.reserve_deadline(&key, now, 5).await.unwrap();
    assert!(first_ok);
    assert!(!second_ok);
    assert_eq!(second_deadline, first_deadline);
    assert!(first_deadline >= now + 5);

    // Once the deadline passes, the next claim succeeds and moves the
    // deadline forward by at least the delay.
    let (third_ok, third_deadline) = store
        .reserve_deadline(&key, first_deadline, 5)
        .await
        .unwrap();
    assert!(third_ok);
    assert!(third_deadline - first_deadline >= 5);

    let _ = store.del(&[key]).await;
}

#[tokio::test]
#[ignore]
async fn index_then_keyword_search_round_trip() {
    let settings = Arc::new(test_settings("keyword"));
    let store = connect(&settings).await;
    cleanup(&store, &settings).await;

    engverse::create_search_index(&store, &settings).await.unwrap();
    // Second creation is a no-op, not an error.
    engverse::create_search_index(&store, &settings).await.unwrap();

    let url = "https://engineering.fb.com/2024/01/15/systems/foo";
    let indexer = make_indexer(&settings, store.clone());
    indexer
        .index_document(&article(url, "Foo", "All about foo pipelines at scale."), "seed")
        .await
        .unwrap();

    let planner = make_planner(&settings, store.clone());
    let (results, latency_ms) = planner
        .search("foo", SearchMode::Keyword, 10)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].doc_id, url);
    assert_eq!(results[0].title, "Foo");
    assert_eq!(results[0].score, 0.0);
    assert!(results[0].snippet.contains("foo"));
    assert!(latency_ms >= 0.0);

    // Prefix form of the same query also matches.
    let (results, _) = planner.search("fo", SearchMode::Keyword, 10).await.unwrap();
    assert_eq!(results.len(), 1);

    cleanup(&store, &settings).await;
}

#[tokio::test]
#[ignore]
async fn hybrid_search_ranks_by_cosine() {
    let settings = Arc::new(test_settings("hybrid"));
    let store = connect(&settings).await;
    cleanup(&store, &settings).await;

    engverse::create_search_index(&store, &settings).await.unwrap();
    let indexer = make_indexer(&settings, store.clone());
    let docs = [
        ("https://slack.engineering/kafka-deep-dive", "Kafka deep dive"),
        ("https://slack.engineering/search-ranking", "Search ranking"),
        ("https://slack.engineering/mobile-builds", "Mobile builds"),
    ];
    for (url, title) in docs {
        indexer
            .index_document(&article(url, title, &format!("{title} article body")), "seed")
            .await
            .unwrap();
    }

    let planner = make_planner(&settings, store.clone());
    let (results, _) = planner
        .search("search ranking", SearchMode::Hybrid, 3)
        .await
        .unwrap();
    assert!(!results.is_empty());
    // Every hybrid result carries a usable embedding and the list is sorted
    // by descending cosine score.
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }

    let (semantic, _) = planner
        .search("search ranking", SearchMode::Semantic, 3)
        .await
        .unwrap();
    assert!(!semantic.is_empty());

    cleanup(&store, &settings).await;
}

#[tokio::test]
#[ignore]
async fn reindex_preserves_enriched_fields() {
    let settings = Arc::new(test_settings("reindex"));
    let store = connect(&settings).await;
    cleanup(&store, &settings).await;

    let url = "https://stripe.com/blog/idempotent-reindex";
    let indexer = make_indexer(&settings, store.clone());

    let mut first = article(url, "A", "first pass content");
    first.authors = vec!["x".to_string()];
    indexer.index_document(&first, "seed").await.unwrap();

    let second = article(url, "", "second pass content");
    indexer.index_document(&second, "seed").await.unwrap();

    let doc = store
        .hgetall_raw(&format!("{}{}", settings.doc_key_prefix, url))
        .await
        .unwrap();
    let title = String::from_utf8(doc.get("title").cloned().unwrap()).unwrap();
    let authors = String::from_utf8(doc.get("authors").cloned().unwrap()).unwrap();
    let content = String::from_utf8(doc.get("content").cloned().unwrap()).unwrap();
    // Empty incoming fields keep their enriched values; non-empty fields
    // overwrite.
    assert_eq!(title, "A");
    assert_eq!(authors, "x");
    assert_eq!(content, "second pass content");

    cleanup(&store, &settings).await;
}

#[tokio::test]
#[ignore]
async fn api_router_shapes_the_search_payload() {
    let settings = Arc::new(test_settings("api"));
    let store = connect(&settings).await;
    cleanup(&store, &settings).await;

    engverse::create_search_index(&store, &settings).await.unwrap();
    let indexer = make_indexer(&settings, store.clone());
    indexer
        .index_document(
            &article(
                "https://engineering.fb.com/2024/01/15/systems/foo",
                "Foo",
                "foo body",
            ),
            "seed",
        )
        .await
        .unwrap();

    let planner = make_planner(&settings, store.clone());
    let state = Arc::new(ApiState { planner });
    let app = engverse::api::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let body: serde_json::Value = reqwest::get(format!(
        "http://{addr}/search?q=foo&mode=keyword&limit=10"
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(body["query"], "foo");
    assert_eq!(body["mode"], "keyword");
    assert_eq!(body["count"], 1);
    assert_eq!(
        body["results"][0]["doc_id"],
        "https://engineering.fb.com/2024/01/15/systems/foo"
    );

    let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    cleanup(&store, &settings).await;
}

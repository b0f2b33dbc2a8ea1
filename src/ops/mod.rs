use crate::core::config::Settings;
use crate::indexer::Indexer;
use crate::store::StoreClient;
use anyhow::Result;

fn decode_value(value: &redis::Value) -> String {
    match value {
        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
        redis::Value::SimpleString(text) => text.clone(),
        redis::Value::Int(n) => n.to_string(),
        other => format!("{other:?}"),
    }
}

fn info_field(reply: &redis::Value, name: &str) -> Option<String> {
    let redis::Value::Array(items) = reply else {
        return None;
    };
    items
        .chunks_exact(2)
        .find(|pair| decode_value(&pair[0]) == name)
        .map(|pair| decode_value(&pair[1]))
}

/// Health overview: index presence, doc counts, queue depth.
pub async fn status(store: &StoreClient, settings: &Settings) -> Result<()> {
    let (index_exists, index_docs) = match store.ft_info(&settings.index_name).await {
        Ok(reply) => (true, info_field(&reply, "num_docs")),
        Err(err) if err.to_string().to_lowercase().contains("unknown index name") => {
            (false, None)
        }
        Err(err) => return Err(err),
    };

    let doc_keys = store
        .scan_match(&format!("{}*", settings.doc_key_prefix))
        .await?
        .len();
    let crawl_keys = store
        .scan_match(&format!("{}*", settings.crawl_doc_key_prefix))
        .await?
        .len();
    let raw_queue_len = store.llen(&settings.raw_queue_key).await?;

    println!(
        "index: {} ({})",
        if index_exists { "present" } else { "missing" },
        settings.index_name
    );
    if let Some(docs) = index_docs {
        println!("index docs: {docs}");
    }
    println!("{}* keys: {doc_keys}", settings.doc_key_prefix);
    println!("crawl docs: {crawl_keys}");
    println!("raw queue: {raw_queue_len}");
    Ok(())
}

/// Wipe crawl state: queues, dedup set, id counter, fetch records, robots
/// cache, and reservations. Indexed documents stay.
pub async fn clear_crawl(store: &StoreClient, settings: &Settings) -> Result<()> {
    let base_keys = vec![
        settings.crawl_queue_key.clone(),
        settings.crawl_delay_key.clone(),
        settings.crawl_seen_key.clone(),
        settings.crawl_doc_seq_key.clone(),
        settings.raw_queue_key.clone(),
    ];
    store.del(&base_keys).await?;

    // Reservation keys share the robots prefix; deleting them first keeps
    // the per-pattern counts disjoint.
    let mut deleted = 0usize;
    for pattern in [
        format!("{}*", settings.crawl_doc_key_prefix),
        format!("{}*", settings.robots_next_allowed_prefix),
        format!("{}*", settings.robots_key_prefix),
    ] {
        let keys = store.scan_match(&pattern).await?;
        deleted += keys.len();
        store.del(&keys).await?;
    }
    println!("Cleared crawl queues and metadata. Deleted {deleted} keys.");
    Ok(())
}

/// Re-feed every stored crawl doc id into the indexing queue.
pub async fn requeue_raw(
    store: &StoreClient,
    settings: &Settings,
    clear: bool,
    batch_size: usize,
) -> Result<()> {
    if clear {
        store.del(&[settings.raw_queue_key.clone()]).await?;
    }
    let prefix = &settings.crawl_doc_key_prefix;
    let keys = store.scan_match(&format!("{prefix}*")).await?;
    let mut batch: Vec<String> = Vec::new();
    let mut total = 0usize;
    for key in keys {
        let Some(doc_id) = key.strip_prefix(prefix.as_str()) else {
            continue;
        };
        if doc_id.is_empty() {
            continue;
        }
        batch.push(doc_id.to_string());
        if batch.len() >= batch_size.max(1) {
            store.rpush_many(&settings.raw_queue_key, &batch).await?;
            total += batch.len();
            batch.clear();
        }
    }
    if !batch.is_empty() {
        store.rpush_many(&settings.raw_queue_key, &batch).await?;
        total += batch.len();
    }
    println!("Requeued {total} docs into {}.", settings.raw_queue_key);
    Ok(())
}

/// Index a single stored crawl doc, bypassing the queue.
pub async fn index_one(indexer: &Indexer, doc_id: &str) -> Result<()> {
    if indexer.process_doc_id(doc_id).await? {
        println!("Indexed {doc_id}");
    } else {
        println!("Skipped {doc_id} (missing metadata or HTML)");
    }
    Ok(())
}

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::Arc;

/// Argument to a raw search-index command. Query text travels as UTF-8;
/// packed embedding vectors travel as raw bytes and must never be re-encoded.
#[derive(Debug, Clone)]
pub enum CommandArg {
    Text(String),
    Blob(Vec<u8>),
}

impl CommandArg {
    pub fn text(value: impl Into<String>) -> Self {
        CommandArg::Text(value.into())
    }
}

/// Decode a text field out of a raw hash reply; absent or non-UTF-8 decodes
/// as "".
pub fn hash_str(map: &HashMap<String, Vec<u8>>, field: &str) -> String {
    map.get(field)
        .and_then(|v| std::str::from_utf8(v).ok())
        .unwrap_or_default()
        .to_string()
}

/// Like `hash_str` but empty values collapse to None.
pub fn hash_opt(map: &HashMap<String, Vec<u8>>, field: &str) -> Option<String> {
    let value = hash_str(map, field);
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

const RESERVE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local delay = tonumber(ARGV[2])
local current = tonumber(redis.call("GET", KEYS[1]) or "0")
if current <= now then
    local next_allowed = now + delay
    redis.call("SET", KEYS[1], next_allowed)
    return {1, next_allowed}
end
return {0, current}
"#;

/// Typed facade over the coordination store. Cloning is cheap — the
/// underlying multiplexed connection is shared.
#[derive(Clone)]
pub struct StoreClient {
    conn: MultiplexedConnection,
    reserve_script: Arc<Script>,
}

impl StoreClient {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("invalid store url: {redis_url}"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to the coordination store")?;
        Ok(Self {
            conn,
            reserve_script: Arc::new(Script::new(RESERVE_SCRIPT)),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    // --- lists -----------------------------------------------------------

    pub async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    pub async fn rpush_many(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: () = conn.rpush(key, values).await?;
        Ok(())
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.lpop(key, None).await?;
        Ok(raw)
    }

    pub async fn llen(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        let len: i64 = conn.llen(key).await?;
        Ok(len)
    }

    // --- sorted sets -----------------------------------------------------

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    /// Members with `score <= max`, in ascending score order, at most `count`.
    pub async fn zrangebyscore_limit(
        &self,
        key: &str,
        max: f64,
        count: isize,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn
            .zrangebyscore_limit(key, "-inf", max, 0, count)
            .await?;
        Ok(members)
    }

    pub async fn zcard(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        let card: i64 = conn.zcard(key).await?;
        Ok(card)
    }

    /// Pipelined `ZREM` + `RPUSH` per member, one round-trip. The `ZREM` is
    /// conditional on membership, which makes concurrent promotion idempotent.
    pub async fn move_members(
        &self,
        zset_key: &str,
        list_key: &str,
        members: &[String],
    ) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for member in members {
            pipe.zrem(zset_key, member).ignore();
            pipe.rpush(list_key, member).ignore();
        }
        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    // --- sets ------------------------------------------------------------

    /// Returns true when the member was newly inserted.
    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added == 1)
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let hit: bool = conn.sismember(key, member).await?;
        Ok(hit)
    }

    // --- hashes ----------------------------------------------------------

    /// Byte-safe hash write; embedding vectors ride along unmodified.
    pub async fn hset_map(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value.as_slice());
        }
        let mut conn = self.conn();
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn hgetall_raw(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn();
        let raw: HashMap<String, Vec<u8>> = conn.hgetall(key).await?;
        Ok(raw)
    }

    pub async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(*field);
        }
        let mut conn = self.conn();
        let values: Vec<Option<Vec<u8>>> = cmd.query_async(&mut conn).await?;
        Ok(values)
    }

    /// One `HGETALL` per key, pipelined into a single round-trip.
    pub async fn hgetall_pipeline(
        &self,
        keys: &[String],
    ) -> Result<Vec<HashMap<String, Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hgetall(key);
        }
        let mut conn = self.conn();
        let docs: Vec<HashMap<String, Vec<u8>>> = pipe.query_async(&mut conn).await?;
        Ok(docs)
    }

    // --- scalars ---------------------------------------------------------

    pub async fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        let next: i64 = conn.incr(key, 1i64).await?;
        Ok(next)
    }

    pub async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    pub async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> = conn.scan_match(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    // --- scripted compare-and-set ---------------------------------------

    /// Atomic deadline reservation: if the stored deadline has passed, write
    /// `now + delay_s` and claim the slot. Returns `(claimed, deadline)`.
    pub async fn reserve_deadline(
        &self,
        key: &str,
        now: i64,
        delay_s: i64,
    ) -> Result<(bool, i64)> {
        let mut conn = self.conn();
        let (claimed, deadline): (i64, i64) = self
            .reserve_script
            .key(key)
            .arg(now)
            .arg(delay_s)
            .invoke_async(&mut conn)
            .await?;
        Ok((claimed == 1, deadline))
    }

    // --- secondary index -------------------------------------------------

    pub async fn ft_create(&self, index: &str, prefix: &str, schema: &[String]) -> Result<()> {
        let mut cmd = redis::cmd("FT.CREATE");
        cmd.arg(index)
            .arg("ON")
            .arg("HASH")
            .arg("PREFIX")
            .arg(1)
            .arg(prefix)
            .arg("SCHEMA");
        for part in schema {
            cmd.arg(part);
        }
        let mut conn = self.conn();
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    /// Raw `FT.SEARCH`; the reply shape depends on the query so callers
    /// decode the `redis::Value` themselves.
    pub async fn ft_search(&self, index: &str, args: &[CommandArg]) -> Result<redis::Value> {
        let mut cmd = redis::cmd("FT.SEARCH");
        cmd.arg(index);
        for arg in args {
            match arg {
                CommandArg::Text(text) => cmd.arg(text),
                CommandArg::Blob(bytes) => cmd.arg(bytes.as_slice()),
            };
        }
        let mut conn = self.conn();
        let value: redis::Value = cmd.query_async(&mut conn).await?;
        Ok(value)
    }

    pub async fn ft_info(&self, index: &str) -> Result<redis::Value> {
        let mut conn = self.conn();
        let value: redis::Value = redis::cmd("FT.INFO")
            .arg(index)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }
}

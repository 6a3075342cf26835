use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use super::{KvStore, StoredBlock};
use crate::utils::{StoreError, StoreResult};

/// Insert a fresh block, or raise `expires_at` of a live one.
/// Expiry predicate matches `core::is_expired`: expired when `expires_at <= now`.
const INSERT_OR_EXTEND: &str = r"
local current = tonumber(redis.call('HGET', KEYS[1], 'expires_at'))
if current ~= nil and current <= tonumber(ARGV[2]) then
    redis.call('DEL', KEYS[1])
    current = nil
end
if current == nil then
    redis.call('HSET', KEYS[1], 'ip', ARGV[1], 'blocked_at', ARGV[2], 'expires_at', ARGV[3], 'reason', ARGV[4])
elseif current < tonumber(ARGV[3]) then
    redis.call('HSET', KEYS[1], 'expires_at', ARGV[3])
end
return redis.call('HMGET', KEYS[1], 'ip', 'blocked_at', 'expires_at', 'reason')
";

const REMOVE_IF_EXPIRED: &str = r"
local current = tonumber(redis.call('HGET', KEYS[1], 'expires_at'))
if current ~= nil and current <= tonumber(ARGV[1]) then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
";

/// Redis backed store shared by every worker of a deployment
pub struct RedisStore {
    conn: ConnectionManager,
    insert_or_extend: Script,
    remove_if_expired: Script,
}

impl RedisStore {
    /// Connect to Redis; the manager reconnects on its own after failures
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            insert_or_extend: Script::new(INSERT_OR_EXTEND),
            remove_if_expired: Script::new(REMOVE_IF_EXPIRED),
        })
    }

    fn parse_block(key: &str, fields: &[String]) -> StoreResult<StoredBlock> {
        let corrupt = |reason: &str| StoreError::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let [ip, blocked_at, expires_at, reason] = fields else {
            return Err(corrupt("blocklist record has missing fields"));
        };
        Ok(StoredBlock {
            ip: ip.clone(),
            blocked_at: blocked_at
                .parse()
                .map_err(|_| corrupt("blocked_at is not an integer"))?,
            expires_at: expires_at
                .parse()
                .map_err(|_| corrupt("expires_at is not an integer"))?,
            reason: reason.clone(),
        })
    }
}

/// `MATCH` pattern for keys starting with `prefix`
fn glob_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    /// Incremental `SCAN`; a key may be reported more than once while the
    /// keyspace is rehashing
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(glob_prefix(prefix)).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn incr_counters(&self, key: &str, deltas: &[(String, i64)]) -> StoreResult<()> {
        if deltas.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, delta) in deltas {
            pipe.hincr(key, field, *delta).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn counters(&self, key: &str) -> StoreResult<HashMap<String, i64>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn insert_or_extend(
        &self,
        key: &str,
        ip: &str,
        blocked_at: i64,
        expires_at: i64,
        reason: &str,
    ) -> StoreResult<StoredBlock> {
        let mut conn = self.conn.clone();
        let fields: Vec<String> = self
            .insert_or_extend
            .key(key)
            .arg(ip)
            .arg(blocked_at)
            .arg(expires_at)
            .arg(reason)
            .invoke_async(&mut conn)
            .await?;
        Self::parse_block(key, &fields)
    }

    async fn get_block(&self, key: &str) -> StoreResult<Option<StoredBlock>> {
        let mut conn = self.conn.clone();
        let fields: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg("ip")
            .arg("blocked_at")
            .arg("expires_at")
            .arg("reason")
            .query_async(&mut conn)
            .await?;
        if fields.iter().all(Option::is_none) {
            return Ok(None);
        }
        let fields: Vec<String> = fields.into_iter().map(Option::unwrap_or_default).collect();
        Self::parse_block(key, &fields).map(Some)
    }

    async fn remove_block_if_expired(&self, key: &str, now: i64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .remove_if_expired
            .key(key)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn record_click(&self, key: &str, member: &str, at: i64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, at).await?;
        Ok(())
    }

    async fn count_clicks(&self, key: &str, from: i64, to: i64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcount(key, from, to).await?)
    }

    async fn prune_clicks(&self, key: &str, before: i64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn
            .zrembyscore(key, "-inf", format!("({}", before))
            .await?)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_prefix_escapes_pattern_characters() {
        assert_eq!(glob_prefix("blocklist:"), "blocklist:*");
        assert_eq!(glob_prefix("a*b?[c]"), r"a\*b\?\[c\]*");
    }
}

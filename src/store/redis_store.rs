//! Redis-backed `KvStore`.

use super::{last_index, KvStore};
use crate::error::StoreResult;
use log::info;
use redis::{Client, Commands, Connection};

pub struct RedisStore {
    conn: Connection,
}

impl RedisStore {
    /// Open a connection and verify it with PING.
    pub fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let mut conn = client.get_connection()?;
        let pong: String = redis::cmd("PING").query(&mut conn)?;
        info!("Connected to Redis at {} ({})", url, pong);
        Ok(Self { conn })
    }
}

impl KvStore for RedisStore {
    fn set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        let _: () = self.conn.set(key, value)?;
        Ok(())
    }

    fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.conn.get(key)?)
    }

    fn list_push_front(&mut self, key: &str, value: &str) -> StoreResult<()> {
        let _: () = self.conn.lpush(key, value)?;
        Ok(())
    }

    fn list_trim(&mut self, key: &str, start: isize, end: isize) -> StoreResult<()> {
        let _: () = self.conn.ltrim(key, start, end)?;
        Ok(())
    }

    fn list_range(&mut self, key: &str, start: isize, end: isize) -> StoreResult<Vec<String>> {
        Ok(self.conn.lrange(key, start, end)?)
    }

    fn list_len(&mut self, key: &str) -> StoreResult<usize> {
        Ok(self.conn.llen(key)?)
    }

    fn delete(&mut self, keys: &[String]) -> StoreResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        Ok(self.conn.del(keys)?)
    }

    /// LPUSH + LTRIM inside MULTI/EXEC, so the cap holds for every reader.
    fn push_front_capped(&mut self, key: &str, values: &[String], cap: usize) -> StoreResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let _: () = redis::pipe()
            .atomic()
            .lpush(key, values)
            .ignore()
            .ltrim(key, 0, last_index(cap))
            .ignore()
            .query(&mut self.conn)?;
        Ok(())
    }
}

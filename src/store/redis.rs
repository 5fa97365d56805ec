//! Redis/Valkey stream store.
//!
//! Each [`RedisStore`] owns one multiplexed connection. A blocking
//! `XREADGROUP` occupies that connection until it returns, so a store that
//! consumes should not also be used for unrelated traffic.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadReply};
use tracing::debug;

use super::{Result, StreamEntry, StreamStore};
use crate::types::AckToken;

/// A [`StreamStore`] backed by Redis or Valkey streams.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    address: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to a store.
    ///
    /// `address` is either a `redis://` URL or a bare `host:port`.
    pub async fn connect(address: &str) -> Result<Self> {
        let url = normalize_address(address);
        let client = redis::Client::open(url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!(address = %address, "Connected to store");
        Ok(RedisStore {
            conn,
            address: address.to_string(),
        })
    }

    /// The address this store was opened with.
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Prefixes bare `host:port` addresses with the `redis://` scheme.
pub fn normalize_address(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{address}")
    }
}

fn to_entry(id: StreamId) -> Result<StreamEntry> {
    let fields = id
        .map
        .iter()
        .map(|(k, v)| Ok((k.clone(), redis::from_redis_value::<String>(v)?)))
        .collect::<Result<_>>()?;
    Ok(StreamEntry {
        id: AckToken(id.id),
        fields,
    })
}

fn first_entry(reply: Option<StreamReadReply>) -> Result<Option<StreamEntry>> {
    let first = reply
        .into_iter()
        .flat_map(|r| r.keys)
        .flat_map(|k| k.ids)
        .next();
    first.map(to_entry).transpose()
}

impl StreamStore for RedisStore {
    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<AckToken> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (k, v) in fields {
            cmd.arg(*k).arg(*v);
        }
        let id: String = cmd.query_async(&mut self.conn.clone()).await?;
        Ok(AckToken(id))
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn.clone())
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<StreamEntry>> {
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(stream)
            .arg("0")
            .query_async(&mut self.conn.clone())
            .await?;
        first_entry(reply)
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(1);
        // BLOCK 0 means "forever" to Redis; a zero duration here means "don't wait".
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let reply: Option<StreamReadReply> = cmd.query_async(&mut self.conn.clone()).await?;
        first_entry(reply)
    }

    async fn ack(&self, stream: &str, group: &str, id: &AckToken) -> Result<()> {
        let _acked: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id.as_str())
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn delivery_count(&self, stream: &str, group: &str, id: &AckToken) -> Result<i64> {
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg(id.as_str())
            .arg(id.as_str())
            .arg(1)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(reply
            .ids
            .first()
            .map_or(0, |p| i64::try_from(p.times_delivered).unwrap_or(i64::MAX)))
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(reply.is_some())
    }

    async fn range(&self, stream: &str) -> Result<Vec<StreamEntry>> {
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg("-")
            .arg("+")
            .query_async(&mut self.conn.clone())
            .await?;
        reply.ids.into_iter().map(to_entry).collect()
    }
}

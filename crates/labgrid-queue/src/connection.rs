//! Redis connection factory with key namespacing and a bounded permit pool.

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Context;
use labgrid_core::config::RedisSection;
use redis::Client;
use redis::aio::MultiplexedConnection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Connection string, e.g. `redis://localhost:6379/0`.
    pub url: String,
    /// Prefix applied to every key (e.g. `lg:prod:`).
    pub namespace: Option<String>,
    /// Upper bound on connections handed out concurrently.
    pub max_connections: NonZeroUsize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::from(&RedisSection::default())
    }
}

impl From<&RedisSection> for RedisConfig {
    fn from(section: &RedisSection) -> Self {
        Self {
            url: section.url.clone(),
            namespace: section.namespace.clone(),
            max_connections: NonZeroUsize::new(section.max_connections).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl RedisConfig {
    pub fn namespaced_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        }
    }
}

/// Dispenses multiplexed connections, at most `max_connections` at a time.
#[derive(Clone, Debug)]
pub struct RedisConnectionFactory {
    client: Client,
    permits: Arc<Semaphore>,
    config: RedisConfig,
}

impl RedisConnectionFactory {
    pub fn new(config: RedisConfig) -> anyhow::Result<Self> {
        let client =
            Client::open(config.url.clone()).context("failed to create redis client from url")?;
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_connections.get())),
            client,
            config,
        })
    }

    /// Borrow a connection. Dropping it releases the permit.
    pub async fn connection(&self) -> anyhow::Result<RedisConnection> {
        let permit = self.permits.clone().acquire_owned().await?;
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("failed to obtain multiplexed redis connection")?;
        Ok(RedisConnection {
            inner: conn,
            _permit: permit,
        })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    pub fn namespaced_key(&self, key: &str) -> String {
        self.config.namespaced_key(key)
    }
}

/// A multiplexed connection that holds its pool permit until dropped.
pub struct RedisConnection {
    inner: MultiplexedConnection,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for RedisConnection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl std::ops::DerefMut for RedisConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

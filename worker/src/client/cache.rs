//! The shared submission cache. Records live under their submission id with
//! a bounded TTL so abandoned submissions expire on their own.

use anyhow::Context;
use redis::{
    aio::ConnectionManager,
    sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType},
    AsyncCommands, RedisConnectionInfo,
};
use tokio::sync::Mutex;

use crate::client::{config::WorkerConfig, err::SubmissionError, model::Submission};

/// TTL applied on every write.
const SUBMISSION_TTL_SECS: u64 = 600;

const SENTINEL_SERVICE: &str = "mymaster";

enum CacheClient {
    /// Production: one fixed endpoint.
    Direct(ConnectionManager),
    /// Everywhere else: discover the current primary through a sentinel.
    /// A fresh connection is fetched per operation so failover takes effect.
    Sentinel(Mutex<SentinelClient>),
}

pub struct SubmissionCache {
    client: CacheClient,
}

impl SubmissionCache {
    pub async fn connect(cfg: &WorkerConfig) -> anyhow::Result<SubmissionCache> {
        let client = if cfg.production {
            let host = cfg
                .redis_host
                .as_deref()
                .context("REDIS_HOST is not configured")?;
            let url = match &cfg.redis_password {
                Some(password) => format!("redis://:{password}@{host}:6379/"),
                None => format!("redis://{host}:6379/"),
            };
            let client = redis::Client::open(url).context("invalid cache endpoint")?;
            let manager = ConnectionManager::new(client)
                .await
                .context("connecting to the submission cache")?;
            CacheClient::Direct(manager)
        } else {
            let host = cfg
                .redis_sentinels
                .as_deref()
                .context("REDIS_SENTINELS is not configured")?;
            let node_info = SentinelNodeConnectionInfo {
                tls_mode: None,
                redis_connection_info: Some(RedisConnectionInfo {
                    password: cfg.redis_password.clone(),
                    ..Default::default()
                }),
            };
            let client = SentinelClient::build(
                vec![format!("redis://{host}:5000/")],
                SENTINEL_SERVICE.to_owned(),
                Some(node_info),
                SentinelServerType::Master,
            )
            .context("building sentinel cache client")?;
            CacheClient::Sentinel(Mutex::new(client))
        };

        let cache = SubmissionCache { client };
        cache.ping().await.context("pinging the submission cache")?;
        Ok(cache)
    }

    async fn ping(&self) -> Result<(), SubmissionError> {
        match &self.client {
            CacheClient::Direct(manager) => {
                let mut conn = manager.clone();
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            }
            CacheClient::Sentinel(client) => {
                let mut conn = client.lock().await.get_async_connection().await?;
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, submission_id: &str) -> Result<Submission, SubmissionError> {
        let raw: Option<String> = match &self.client {
            CacheClient::Direct(manager) => {
                let mut conn = manager.clone();
                conn.get(submission_id).await?
            }
            CacheClient::Sentinel(client) => {
                let mut conn = client.lock().await.get_async_connection().await?;
                conn.get(submission_id).await?
            }
        };
        let raw = raw.ok_or_else(|| SubmissionError::CacheMiss(submission_id.to_owned()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn put(&self, submission: &Submission) -> Result<(), SubmissionError> {
        let payload = serde_json::to_string(submission)?;
        match &self.client {
            CacheClient::Direct(manager) => {
                let mut conn = manager.clone();
                let _: () = conn
                    .set_ex(&submission.submission_id, payload, SUBMISSION_TTL_SECS)
                    .await?;
            }
            CacheClient::Sentinel(client) => {
                let mut conn = client.lock().await.get_async_connection().await?;
                let _: () = conn
                    .set_ex(&submission.submission_id, payload, SUBMISSION_TTL_SECS)
                    .await?;
            }
        }
        Ok(())
    }
}

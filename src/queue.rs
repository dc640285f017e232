//! Redis work queue consumer.
//!
//! Jobs are pulled with BLMOVE from the shared queue into this worker's
//! processing list, and removed from the processing list only after the
//! terminal report has been persisted. A crash between the two leaves the
//! payload in the processing list, where startup recovery pushes it back
//! onto the shared queue. Delivery is therefore at-least-once; the result
//! reporter makes the duplicate delivery harmless.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Direction};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Redis key constants
pub mod keys {
    /// Worker lease key prefix for distributed worker ID allocation
    pub const WORKER_LEASE_PREFIX: &str = "judge:worker:lease:";

    /// Shared judge job queue
    pub const JUDGE_QUEUE: &str = "judge:queue";

    /// Per-worker in-flight list prefix; full key is suffixed with the worker ID
    pub const PROCESSING_PREFIX: &str = "judge:processing:";

    /// Judge result key prefix (for polling)
    pub const JUDGE_RESULT_PREFIX: &str = "judge:result:";
}

const MAX_WORKERS: u32 = 10;
const WORKER_LEASE_TTL_SECS: u64 = 120;

/// How long one BLMOVE blocks before the loop re-checks the connection.
const POP_TIMEOUT_SECS: f64 = 5.0;

/// Blocking consumer side of the job queue.
pub struct JobQueue {
    worker_id: u32,
    client: redis::Client,
    conn: MultiplexedConnection,
    ack_conn: ConnectionManager,
    processing_key: String,
    lease_handle: JoinHandle<()>,
}

impl JobQueue {
    /// Connect to Redis, allocate a worker ID, and start the lease heartbeat.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        let worker_id = allocate_worker_id(&client).await?;
        info!(
            "Allocated worker_id={} (lease {}s)",
            worker_id, WORKER_LEASE_TTL_SECS
        );

        let lease_handle = spawn_lease_heartbeat(client.clone(), worker_id);

        let ack_conn = ConnectionManager::new(client.clone())
            .await
            .context("Failed to create Redis connection manager")?;

        Ok(Self {
            worker_id,
            client,
            conn,
            ack_conn,
            processing_key: format!("{}{}", keys::PROCESSING_PREFIX, worker_id),
            lease_handle,
        })
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Acknowledgement handle usable from spawned job tasks. Shares the
    /// self-reconnecting manager connection; cloning is cheap.
    pub fn acker(&self) -> JobAcker {
        JobAcker {
            conn: self.ack_conn.clone(),
            processing_key: self.processing_key.clone(),
        }
    }

    /// Requeue payloads left in this worker's processing list by a previous
    /// crash. Returns how many were pushed back onto the shared queue.
    pub async fn recover_orphans(&mut self) -> Result<usize> {
        let orphans: Vec<String> = self
            .conn
            .lrange(&self.processing_key, 0, -1)
            .await
            .context("Failed to read processing list")?;

        if orphans.is_empty() {
            return Ok(0);
        }

        warn!(
            "Recovering {} orphaned job(s) from {}",
            orphans.len(),
            self.processing_key
        );
        for payload in &orphans {
            self.conn
                .rpush::<_, _, ()>(keys::JUDGE_QUEUE, payload)
                .await
                .context("Failed to requeue orphaned job")?;
        }
        self.conn
            .del::<_, ()>(&self.processing_key)
            .await
            .context("Failed to clear processing list")?;

        Ok(orphans.len())
    }

    /// Block until the next job payload is available.
    ///
    /// The payload is moved onto this worker's processing list before being
    /// returned, so it survives a worker crash. Automatically reconnects on
    /// connection failure.
    pub async fn pop(&mut self) -> Result<String> {
        loop {
            let result: Option<String> = match self
                .conn
                .blmove(
                    keys::JUDGE_QUEUE,
                    &self.processing_key,
                    Direction::Left,
                    Direction::Right,
                    POP_TIMEOUT_SECS,
                )
                .await
            {
                Ok(res) => res,
                Err(e) => {
                    warn!("Redis BLMOVE failed: {}. Reconnecting...", e);
                    self.reconnect().await?;
                    continue;
                }
            };

            if let Some(payload) = result {
                return Ok(payload);
            }
        }
    }

    /// Reconnect to Redis
    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.lease_handle.abort();
    }
}

/// Removes a delivered payload from the worker's processing list once its
/// terminal report has been persisted. Clone-able so each spawned job task
/// can carry its own handle.
#[derive(Clone)]
pub struct JobAcker {
    conn: ConnectionManager,
    processing_key: String,
}

impl JobAcker {
    /// Acknowledge a payload. Call only after the result is persisted;
    /// an unacked payload is redelivered by orphan recovery.
    pub async fn ack(&self, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .lrem(&self.processing_key, 1, payload)
            .await
            .context("Failed to acknowledge job")?;
        if removed == 0 {
            warn!(
                "Acked payload was not in {}; already recovered elsewhere?",
                self.processing_key
            );
        }
        Ok(())
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

/// Allocate a unique worker ID using Redis SET NX with expiration
async fn allocate_worker_id(client: &redis::Client) -> Result<u32> {
    loop {
        let mut conn = get_connection_with_retry(client).await?;

        for worker_id in 0..MAX_WORKERS {
            let key = format!("{}{}", keys::WORKER_LEASE_PREFIX, worker_id);
            let claimed: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg("claimed")
                .arg("NX")
                .arg("EX")
                .arg(WORKER_LEASE_TTL_SECS as usize)
                .query_async(&mut conn)
                .await?;

            if claimed.is_some() {
                return Ok(worker_id);
            }
        }

        warn!(
            "No free worker_id (0-{}). Retrying in 1 second...",
            MAX_WORKERS - 1
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Spawn a background task to keep the worker lease alive
fn spawn_lease_heartbeat(client: redis::Client, worker_id: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(WORKER_LEASE_TTL_SECS / 2);

        loop {
            tokio::time::sleep(interval).await;

            match get_connection_with_retry(&client).await {
                Ok(mut conn) => {
                    let key = format!("{}{}", keys::WORKER_LEASE_PREFIX, worker_id);
                    if let Err(e) = redis::cmd("EXPIRE")
                        .arg(&key)
                        .arg(WORKER_LEASE_TTL_SECS as usize)
                        .query_async::<()>(&mut conn)
                        .await
                    {
                        warn!("Failed to refresh worker lease {}: {}", worker_id, e);
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to refresh worker lease {} (connection): {}",
                        worker_id, e
                    );
                }
            }
        }
    })
}

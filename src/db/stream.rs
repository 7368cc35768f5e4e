//! Chunked streaming reads over a pinned connection.
//!
//! A [`StreamCursor`] holds one pooled connection from open until the cursor is
//! drained, closed or fails. Opening goes through the resilience engine;
//! fetching chunks never retries, since replaying a non-resumable cursor would
//! duplicate or skip records.

use super::pool::{Pool, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::models::{OperationKind, Record, Statement};
use crate::resilience::{ResilienceEngine, with_deadline};
use futures_util::Stream;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct StreamCursor {
    target: String,
    conn: Option<PooledConnection>,
    chunk_size: usize,
    delivered: u64,
    fetch_timeout: Option<Duration>,
}

impl std::fmt::Debug for StreamCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCursor")
            .field("target", &self.target)
            .field("chunk_size", &self.chunk_size)
            .field("delivered", &self.delivered)
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl StreamCursor {
    /// Acquire a connection and open a cursor over `stmt`.
    pub async fn open(
        engine: &ResilienceEngine,
        pool: &Pool,
        stmt: &Statement,
        chunk_size: usize,
        deadline: Option<Instant>,
    ) -> DbResult<Self> {
        let target = pool.target();
        if chunk_size == 0 {
            return Err(DbError::invalid_input("chunk_size must be greater than 0")
                .with_context(target, OperationKind::Stream, 0));
        }

        let conn = engine
            .run(target, OperationKind::Stream, deadline, |_| async move {
                let mut conn = pool.acquire_by(deadline).await?;
                let opened = conn.connection()?.open_cursor(stmt).await;
                conn.settle(opened)?;
                Ok(conn)
            })
            .await?;

        debug!(target_id = %target, connection_id = conn.id(), chunk_size, "Cursor opened");
        Ok(Self {
            target: target.to_string(),
            conn: Some(conn),
            chunk_size,
            delivered: 0,
            fetch_timeout: engine.operation_timeout(),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Records handed to the caller so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Whether the cursor has released its connection.
    pub fn is_exhausted(&self) -> bool {
        self.conn.is_none()
    }

    /// Fetch the next chunk at the configured size.
    pub async fn next(&mut self) -> DbResult<Option<Vec<Record>>> {
        self.next_chunk(self.chunk_size).await
    }

    /// Fetch up to `n` records (clamped to `1..=chunk_size`).
    ///
    /// Returns `None` once the result set is drained. A chunk shorter than
    /// requested means the cursor is exhausted and its connection has already
    /// been released. A backend failure releases the connection and surfaces
    /// as `StreamInterrupted` carrying the count delivered before it.
    pub async fn next_chunk(&mut self, n: usize) -> DbResult<Option<Vec<Record>>> {
        let requested = n.clamp(1, self.chunk_size);
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };

        let deadline = self.fetch_timeout.map(|t| Instant::now() + t);
        let fetched = match conn.connection() {
            Ok(c) => with_deadline("fetch chunk", deadline, c.fetch_cursor(requested)).await,
            Err(e) => Err(e),
        };
        let fetched = conn.settle(fetched);

        match fetched {
            Ok(chunk) => {
                self.delivered += chunk.len() as u64;
                if chunk.len() < requested {
                    self.finish().await;
                }
                if chunk.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(chunk))
                }
            }
            Err(e) => {
                warn!(
                    target_id = %self.target,
                    delivered = self.delivered,
                    error = %e,
                    "Stream interrupted"
                );
                if let Some(mut conn) = self.conn.take() {
                    conn.mark_broken();
                    conn.release(false);
                }
                Err(DbError::stream_interrupted(self.delivered, e).with_context(
                    &self.target,
                    OperationKind::Stream,
                    1,
                ))
            }
        }
    }

    /// Close the cursor early and return its connection.
    pub async fn close(mut self) -> DbResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let closed = match conn.connection() {
            Ok(c) => c.close_cursor().await,
            Err(e) => Err(e),
        };
        let closed = conn.settle(closed);
        conn.release(closed.is_ok());
        closed.map_err(|e| e.with_context(&self.target, OperationKind::Stream, 1))
    }

    /// Drained: close the backend cursor and release the connection.
    async fn finish(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let closed = match conn.connection() {
            Ok(c) => c.close_cursor().await,
            Err(e) => Err(e),
        };
        let closed = conn.settle(closed);
        if let Err(e) = &closed {
            debug!(target_id = %self.target, error = %e, "Failed to close drained cursor");
        }
        debug!(target_id = %self.target, delivered = self.delivered, "Cursor exhausted");
        conn.release(closed.is_ok());
    }

    /// Consume the cursor as a stream of chunks. The stream ends after the
    /// last chunk or after yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = DbResult<Vec<Record>>> {
        futures_util::stream::unfold(Some(self), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.next().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(cursor))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl Drop for StreamCursor {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            // Backend cursor is still open; the session cannot be reused as-is
            debug!(target_id = %self.target, delivered = self.delivered, "Cursor dropped while open");
            conn.mark_broken();
        }
    }
}

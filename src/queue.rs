//! The visibility-timeout work queue interface (§4.4).
//!
//! The real MQ (a Postgres-resident pub/sub + visibility-timeout queue) is an
//! external collaborator outside this spec's scope; only its four operations
//! matter here. `Queue` captures exactly those, and `EmbeddedQueue` is the
//! one adapter this crate ships: a Store-table-backed implementation with
//! the same semantics, suitable for single-process deployments and tests,
//! and swappable for a networked MQ by implementing the same trait.

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::models::TaskMessage;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub msg_id: String,
    pub payload: TaskMessage,
}

/// The four operations the coordination engine relies on. Implementations
/// must provide at-least-once delivery, a per-message invisibility lease,
/// FIFO-by-visibility (not strict), and no durable consumer offsets.
pub trait Queue: Send + Sync {
    fn send(&self, queue: &str, payload: &TaskMessage, visibility_timeout_s: u64) -> EngineResult<String>;

    fn read_with_poll(
        &self,
        queue: &str,
        batch_size: usize,
        visibility_timeout_s: u64,
        poll_ms: u64,
    ) -> EngineResult<Vec<QueueMessage>>;

    fn delete(&self, queue: &str, msg_id: &str) -> EngineResult<()>;

    fn set_visibility_timeout(&self, queue: &str, msg_id: &str, new_timeout_s: u64) -> EngineResult<()>;
}

/// A `queue_messages`-table-backed `Queue`, sharing the same connection as
/// the `Store` it was built from.
pub struct EmbeddedQueue {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl EmbeddedQueue {
    pub fn new(conn: Arc<Mutex<Connection>>, clock: Arc<dyn Clock>) -> Self {
        Self { conn, clock }
    }

    fn try_claim_batch(&self, queue: &str, batch_size: usize, visibility_timeout_s: u64) -> EngineResult<Vec<QueueMessage>> {
        let conn = self.conn.lock().map_err(|_| EngineError::TransientQueue("queue connection poisoned".into()))?;
        let now = self.clock.now();
        let visible_until = now + chrono::Duration::seconds(visibility_timeout_s as i64);

        let mut stmt = conn
            .prepare(
                "SELECT msg_id, payload FROM queue_messages
                 WHERE queue_name = ?1 AND visible_at <= ?2
                 ORDER BY visible_at ASC
                 LIMIT ?3",
            )
            .map_err(|e| EngineError::TransientQueue(e.to_string()))?;

        let rows: Vec<(String, String)> = stmt
            .query_map(params![queue, now.to_rfc3339(), batch_size as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(|e| EngineError::TransientQueue(e.to_string()))?
            .collect::<Result<_, _>>()
            .map_err(|e: rusqlite::Error| EngineError::TransientQueue(e.to_string()))?;
        drop(stmt);

        let mut claimed = Vec::with_capacity(rows.len());
        for (msg_id, payload_json) in rows {
            conn.execute(
                "UPDATE queue_messages SET visible_at = ?1 WHERE msg_id = ?2",
                params![visible_until.to_rfc3339(), msg_id],
            )
            .map_err(|e| EngineError::TransientQueue(e.to_string()))?;
            let payload: TaskMessage = serde_json::from_str(&payload_json).map_err(|e| EngineError::TransientQueue(e.to_string()))?;
            claimed.push(QueueMessage { msg_id, payload });
        }
        Ok(claimed)
    }
}

impl Queue for EmbeddedQueue {
    fn send(&self, queue: &str, payload: &TaskMessage, visibility_timeout_s: u64) -> EngineResult<String> {
        let msg_id = Uuid::new_v4().to_string();
        let payload_json = serde_json::to_string(payload).map_err(|e| EngineError::TransientQueue(e.to_string()))?;
        // New messages are immediately visible; visibility_timeout_s bounds
        // how long a *claimed* message stays hidden, not the initial delay.
        let _ = visibility_timeout_s;
        let conn = self.conn.lock().map_err(|_| EngineError::TransientQueue("queue connection poisoned".into()))?;
        conn.execute(
            "INSERT INTO queue_messages (msg_id, queue_name, payload, visible_at) VALUES (?1, ?2, ?3, ?4)",
            params![msg_id, queue, payload_json, self.clock.now().to_rfc3339()],
        )
        .map_err(|e| EngineError::TransientQueue(e.to_string()))?;
        Ok(msg_id)
    }

    fn read_with_poll(
        &self,
        queue: &str,
        batch_size: usize,
        visibility_timeout_s: u64,
        poll_ms: u64,
    ) -> EngineResult<Vec<QueueMessage>> {
        let claimed = self.try_claim_batch(queue, batch_size, visibility_timeout_s)?;
        if !claimed.is_empty() || poll_ms == 0 {
            return Ok(claimed);
        }
        thread::sleep(Duration::from_millis(poll_ms));
        self.try_claim_batch(queue, batch_size, visibility_timeout_s)
    }

    fn delete(&self, _queue: &str, msg_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock().map_err(|_| EngineError::TransientQueue("queue connection poisoned".into()))?;
        conn.execute("DELETE FROM queue_messages WHERE msg_id = ?1", params![msg_id])
            .map_err(|e| EngineError::TransientQueue(e.to_string()))?;
        Ok(())
    }

    fn set_visibility_timeout(&self, _queue: &str, msg_id: &str, new_timeout_s: u64) -> EngineResult<()> {
        let conn = self.conn.lock().map_err(|_| EngineError::TransientQueue("queue connection poisoned".into()))?;
        let visible_until = self.clock.now() + chrono::Duration::seconds(new_timeout_s as i64);
        conn.execute(
            "UPDATE queue_messages SET visible_at = ?1 WHERE msg_id = ?2",
            params![visible_until.to_rfc3339(), msg_id],
        )
        .map_err(|e| EngineError::TransientQueue(e.to_string()))?;
        Ok(())
    }
}

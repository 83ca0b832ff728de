//! Statement broadcast coordination
//!
//! An operator can broadcast one ad-hoc SQL statement to a master and a
//! fixed set of slaves and verify they all agree on the result. The master's
//! response is the reference; it must arrive before any slave response, each
//! participant answers exactly once, and agreement is case-insensitive
//! equality with the reference. An exception reported by any participant
//! fails the whole request regardless of content.

use crate::common::bus::{BusMessage, MessageBus};
use crate::common::record::attr;
use crate::common::{ReplError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Aggregate status of one broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumStatus {
    /// Not every participant has responded yet
    Waiting,
    /// Every participant responded and matched the reference
    Ok,
    /// At least one participant mismatched or reported an exception
    Failed,
}

/// Outcome recorded for one slave participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParticipantOutcome {
    Matched,
    Failed,
}

/// Response tracking for one broadcast statement.
#[derive(Debug)]
pub struct SqlBroadcast {
    id: String,
    sql: String,
    slaves: Vec<String>,
    reference: Option<String>,
    responses: HashMap<String, ParticipantOutcome>,
    master_failed: bool,
}

impl SqlBroadcast {
    /// Track a broadcast of `sql` to the given slave participants.
    pub fn new(id: impl Into<String>, sql: impl Into<String>, slaves: Vec<String>) -> Self {
        Self {
            id: id.into(),
            sql: sql.into(),
            slaves,
            reference: None,
            responses: HashMap::new(),
            master_failed: false,
        }
    }

    /// Statement id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Broadcast SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Record the master's reference response. Must arrive exactly once,
    /// before any slave response.
    pub fn master_response(&mut self, content: &str, exception: Option<&str>) -> Result<()> {
        if self.reference.is_some() {
            return Err(ReplError::protocol(format!(
                "duplicate master response for statement '{}'",
                self.id
            )));
        }
        if let Some(e) = exception {
            warn!(statement = %self.id, exception = %e, "master reported an exception");
            self.master_failed = true;
        }
        self.reference = Some(content.to_string());
        Ok(())
    }

    /// Record one slave's response.
    pub fn slave_response(
        &mut self,
        slave: &str,
        content: &str,
        exception: Option<&str>,
    ) -> Result<()> {
        if !self.slaves.iter().any(|s| s == slave) {
            return Err(ReplError::protocol(format!(
                "'{slave}' is not a participant of statement '{}'",
                self.id
            )));
        }
        let Some(reference) = &self.reference else {
            return Err(ReplError::protocol(format!(
                "response from '{slave}' before the master reference for statement '{}'",
                self.id
            )));
        };
        if self.responses.contains_key(slave) {
            return Err(ReplError::protocol(format!(
                "duplicate response from '{slave}' for statement '{}'",
                self.id
            )));
        }

        let outcome = if let Some(e) = exception {
            warn!(statement = %self.id, slave, exception = %e, "participant reported an exception");
            ParticipantOutcome::Failed
        } else if content.eq_ignore_ascii_case(reference) {
            ParticipantOutcome::Matched
        } else {
            warn!(statement = %self.id, slave, "participant result differs from the reference");
            ParticipantOutcome::Failed
        };
        self.responses.insert(slave.to_string(), outcome);
        Ok(())
    }

    /// Current aggregate status.
    pub fn status(&self) -> QuorumStatus {
        if self.master_failed
            || self
                .responses
                .values()
                .any(|o| *o == ParticipantOutcome::Failed)
        {
            return QuorumStatus::Failed;
        }
        if self.reference.is_some() && self.responses.len() == self.slaves.len() {
            QuorumStatus::Ok
        } else {
            QuorumStatus::Waiting
        }
    }
}

/// Registry of in-flight broadcasts, publishing the statement to the
/// master's topic and routing responses back by statement id.
pub struct BroadcastRegistry {
    bus: Arc<dyn MessageBus>,
    reply_topic: String,
    requests: Mutex<HashMap<String, SqlBroadcast>>,
}

impl BroadcastRegistry {
    /// Create a registry; responses are requested on `reply_topic`.
    pub fn new(bus: Arc<dyn MessageBus>, reply_topic: impl Into<String>) -> Self {
        Self {
            bus,
            reply_topic: reply_topic.into(),
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Broadcast a statement to a master topic, returning the statement id
    /// used to correlate responses.
    pub async fn broadcast(
        &self,
        master_topic: &str,
        sql: &str,
        slaves: Vec<String>,
        max_entries: u64,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let message = BusMessage::new(Bytes::from(sql.as_bytes().to_vec()))
            .with_attribute(attr::STATEMENT_ID, id.clone())
            .with_attribute(attr::SQL_TOPIC, self.reply_topic.clone())
            .with_attribute(attr::MAX_ENTRIES, max_entries.to_string());
        self.bus.publish(master_topic, message).await?;

        info!(
            statement = %id,
            topic = master_topic,
            participants = slaves.len(),
            "statement broadcast"
        );
        self.requests
            .lock()
            .await
            .insert(id.clone(), SqlBroadcast::new(id.clone(), sql, slaves));
        Ok(id)
    }

    /// Route the master's response, returning the updated status.
    pub async fn master_response(
        &self,
        statement_id: &str,
        content: &str,
        exception: Option<&str>,
    ) -> Result<QuorumStatus> {
        let mut requests = self.requests.lock().await;
        let request = requests
            .get_mut(statement_id)
            .ok_or_else(|| Self::unknown(statement_id))?;
        request.master_response(content, exception)?;
        Ok(request.status())
    }

    /// Route one slave's response, returning the updated status.
    pub async fn slave_response(
        &self,
        statement_id: &str,
        slave: &str,
        content: &str,
        exception: Option<&str>,
    ) -> Result<QuorumStatus> {
        let mut requests = self.requests.lock().await;
        let request = requests
            .get_mut(statement_id)
            .ok_or_else(|| Self::unknown(statement_id))?;
        request.slave_response(slave, content, exception)?;
        Ok(request.status())
    }

    /// Status of one broadcast, if still tracked.
    pub async fn status(&self, statement_id: &str) -> Option<QuorumStatus> {
        self.requests
            .lock()
            .await
            .get(statement_id)
            .map(|r| r.status())
    }

    /// Stop tracking a completed broadcast.
    pub async fn remove(&self, statement_id: &str) -> Option<SqlBroadcast> {
        self.requests.lock().await.remove(statement_id)
    }

    fn unknown(statement_id: &str) -> ReplError {
        ReplError::protocol(format!("unknown statement '{statement_id}'"))
    }
}

//! Command lifecycle: queued → running → terminal (succeeded|failed|rejected).
//!
//! Grounded in the original source's `control_command_runtime.py`: sequential
//! `cmd-NNNNNN` ids, a bounded queue, a status-by-id map, and a ring-buffered
//! history of at most 200 recent statuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;

pub const COMMAND_QUEUE_CAPACITY: usize = 16;
pub const COMMAND_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Rejected,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Succeeded | CommandState::Failed | CommandState::Rejected)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: CommandState,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Command {
    fn new_queued(id: String, kind: String, payload: serde_json::Value, source: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            payload,
            source,
            created_at,
            started_at: None,
            finished_at: None,
            state: CommandState::Queued,
            message: None,
            result: None,
        }
    }
}

/// A bounded command queue plus the status-by-id map and ring-buffered
/// history required to serve snapshot reads. Single-consumer: the owning
/// engine task drains it via `try_recv`/`recv`.
pub struct CommandQueue {
    next_id: u64,
    sender: mpsc::Sender<String>,
    receiver: mpsc::Receiver<String>,
    status_by_id: HashMap<String, Command>,
    history_ids: VecDeque<String>,
}

impl CommandQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        Self {
            next_id: 1,
            sender,
            receiver,
            status_by_id: HashMap::new(),
            history_ids: VecDeque::new(),
        }
    }

    fn allocate_id(&mut self) -> String {
        let id = format!("cmd-{:06}", self.next_id);
        self.next_id += 1;
        id
    }

    fn prune_history(&mut self) {
        while self.history_ids.len() > COMMAND_HISTORY_LIMIT {
            if let Some(oldest) = self.history_ids.pop_front() {
                self.status_by_id.remove(&oldest);
            }
        }
    }

    /// Enqueue a new command. Returns the queued status snapshot, or a
    /// `Rejected` snapshot with `message = "queue_full"` if the bounded
    /// channel has no capacity.
    pub fn enqueue(
        &mut self,
        kind: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Command {
        let id = self.allocate_id();
        let command = Command::new_queued(id.clone(), kind.into(), payload, source.into(), now);
        self.status_by_id.insert(id.clone(), command.clone());
        self.history_ids.push_back(id.clone());
        self.prune_history();

        match self.sender.try_send(id.clone()) {
            Ok(()) => self.status_by_id.get(&id).cloned().unwrap_or(command),
            Err(_) => self.mark_finished(&id, CommandState::Rejected, Some("queue_full"), None, now),
        }
    }

    /// Non-blocking dequeue of at most one command id for the owning engine
    /// to execute.
    pub fn try_dequeue(&mut self) -> Option<Command> {
        let id = self.receiver.try_recv().ok()?;
        self.status_by_id.get(&id).cloned()
    }

    pub fn mark_running(&mut self, id: &str, started_at: DateTime<Utc>) {
        if let Some(cmd) = self.status_by_id.get_mut(id) {
            cmd.state = CommandState::Running;
            cmd.started_at = Some(started_at);
        }
    }

    pub fn mark_finished(
        &mut self,
        id: &str,
        state: CommandState,
        message: Option<&str>,
        result: Option<serde_json::Value>,
        finished_at: DateTime<Utc>,
    ) -> Command {
        let cmd = self.status_by_id.entry(id.to_string()).or_insert_with(|| {
            Command::new_queued(id.to_string(), String::new(), serde_json::Value::Null, String::new(), finished_at)
        });
        cmd.state = state;
        cmd.message = message.map(str::to_string);
        cmd.result = result;
        cmd.finished_at = Some(finished_at);
        cmd.clone()
    }

    pub fn status(&self, id: &str) -> Option<&Command> {
        self.status_by_id.get(id)
    }

    pub fn queue_depth(&self) -> usize {
        self.status_by_id
            .values()
            .filter(|c| c.state == CommandState::Queued)
            .count()
    }

    pub fn running_count(&self) -> usize {
        self.status_by_id
            .values()
            .filter(|c| c.state == CommandState::Running)
            .count()
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_sequential_and_unique() {
        let mut q = CommandQueue::new();
        let now = Utc::now();
        let a = q.enqueue("plant.start", json!({}), "test", now);
        let b = q.enqueue("plant.stop", json!({}), "test", now);
        assert_eq!(a.id, "cmd-000001");
        assert_eq!(b.id, "cmd-000002");
    }

    #[test]
    fn lifecycle_is_monotonic() {
        let mut q = CommandQueue::new();
        let now = Utc::now();
        let cmd = q.enqueue("plant.start", json!({}), "test", now);
        assert_eq!(cmd.state, CommandState::Queued);

        let dequeued = q.try_dequeue().unwrap();
        assert_eq!(dequeued.id, cmd.id);

        q.mark_running(&cmd.id, now);
        assert_eq!(q.status(&cmd.id).unwrap().state, CommandState::Running);

        let finished = q.mark_finished(&cmd.id, CommandState::Succeeded, None, None, now);
        assert!(finished.state.is_terminal());
    }

    #[test]
    fn queue_full_rejects_with_stable_message() {
        let mut q = CommandQueue::new();
        let now = Utc::now();
        for _ in 0..COMMAND_QUEUE_CAPACITY {
            q.enqueue("plant.start", json!({}), "test", now);
        }
        let rejected = q.enqueue("plant.start", json!({}), "test", now);
        assert_eq!(rejected.state, CommandState::Rejected);
        assert_eq!(rejected.message.as_deref(), Some("queue_full"));
    }
}

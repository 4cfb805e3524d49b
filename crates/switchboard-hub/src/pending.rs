use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::RelayError;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Completion side of a pending request. Resolves exactly once.
pub type Completion = oneshot::Receiver<Result<Value, RelayError>>;

type QueueKey = (String, String);

struct PendingEntry {
    token: String,
    created_at: Instant,
    completion: oneshot::Sender<Result<Value, RelayError>>,
    timer: JoinHandle<()>,
}

impl PendingEntry {
    /// Consumes the entry: the timer is cancelled and the waiter receives `outcome`.
    fn finish(self, outcome: Result<Value, RelayError>) {
        self.timer.abort();
        // A dropped receiver means the dispatcher gave up; the entry is still consumed.
        let _ = self.completion.send(outcome);
    }
}

type Queues = HashMap<QueueKey, VecDeque<PendingEntry>>;

/// Outstanding requests per (agent, command kind), oldest first. Every entry
/// leaves its queue exactly once: by reply, by failure, or by its timer.
pub struct PendingTable {
    token_counter: AtomicU64,
    queues: Arc<Mutex<Queues>>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            token_counter: AtomicU64::new(0),
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn next_token(&self) -> String {
        let id = self.token_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("req-{id}")
    }

    /// Enqueues a request at the tail of its queue and arms its timeout.
    pub async fn register(&self, agent_id: &str, kind: &str, timeout: Duration) -> (String, Completion) {
        let token = self.next_token();
        let key = (agent_id.to_string(), kind.to_string());
        let (tx, rx) = oneshot::channel();

        // The timer cannot observe the table before the entry is inserted: it
        // needs this lock to expire anything.
        let mut queues = self.queues.lock().await;
        let timer = {
            let queues = self.queues.clone();
            let key = key.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                expire(&queues, &key, &token).await;
            })
        };
        queues.entry(key).or_default().push_back(PendingEntry {
            token: token.clone(),
            created_at: Instant::now(),
            completion: tx,
            timer,
        });
        debug!(
            event = "pending_register",
            agent_id = agent_id,
            kind = kind,
            token = %token,
            timeout_ms = timeout.as_millis() as u64
        );
        (token, rx)
    }

    /// Resolves the oldest outstanding request for (agent, kind).
    pub async fn resolve_oldest(&self, agent_id: &str, kind: &str, payload: Value) -> bool {
        let key = (agent_id.to_string(), kind.to_string());
        let entry = {
            let mut queues = self.queues.lock().await;
            let entry = queues.get_mut(&key).and_then(VecDeque::pop_front);
            prune(&mut queues, &key);
            entry
        };
        match entry {
            Some(entry) => {
                debug!(
                    event = "pending_resolved",
                    agent_id = agent_id,
                    kind = kind,
                    token = %entry.token,
                    waited_ms = entry.created_at.elapsed().as_millis() as u64,
                    by = "fifo"
                );
                entry.finish(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Resolves exactly the request carrying `token`. Unknown tokens match nothing.
    pub async fn resolve_token(&self, agent_id: &str, kind: &str, token: &str, payload: Value) -> bool {
        match self.take(agent_id, kind, token).await {
            Some(entry) => {
                debug!(
                    event = "pending_resolved",
                    agent_id = agent_id,
                    kind = kind,
                    token = token,
                    waited_ms = entry.created_at.elapsed().as_millis() as u64,
                    by = "token"
                );
                entry.finish(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Fails one request early, e.g. when the command could not be forwarded.
    pub async fn fail(&self, agent_id: &str, kind: &str, token: &str, error: RelayError) -> bool {
        match self.take(agent_id, kind, token).await {
            Some(entry) => {
                entry.finish(Err(error));
                true
            }
            None => false,
        }
    }

    pub async fn outstanding(&self, agent_id: &str, kind: &str) -> usize {
        let key = (agent_id.to_string(), kind.to_string());
        self.queues.lock().await.get(&key).map_or(0, VecDeque::len)
    }

    pub async fn total(&self) -> usize {
        self.queues.lock().await.values().map(VecDeque::len).sum()
    }

    async fn take(&self, agent_id: &str, kind: &str, token: &str) -> Option<PendingEntry> {
        let key = (agent_id.to_string(), kind.to_string());
        let mut queues = self.queues.lock().await;
        take_token(&mut queues, &key, token)
    }
}

async fn expire(queues: &Mutex<Queues>, key: &QueueKey, token: &str) {
    let entry = {
        let mut queues = queues.lock().await;
        take_token(&mut queues, key, token)
    };
    if let Some(entry) = entry {
        warn!(
            event = "pending_timeout",
            agent_id = %key.0,
            kind = %key.1,
            token = token,
            waited_ms = entry.created_at.elapsed().as_millis() as u64
        );
        // Never abort the timer from inside itself.
        let _ = entry.completion.send(Err(RelayError::Timeout));
    }
}

fn take_token(queues: &mut Queues, key: &QueueKey, token: &str) -> Option<PendingEntry> {
    let queue = queues.get_mut(key)?;
    let position = queue.iter().position(|entry| entry.token == token)?;
    let entry = queue.remove(position);
    prune(queues, key);
    entry
}

fn prune(queues: &mut Queues, key: &QueueKey) {
    if queues.get(key).is_some_and(VecDeque::is_empty) {
        queues.remove(key);
    }
}

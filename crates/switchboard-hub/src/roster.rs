use crate::blobs::BlobStore;
use crate::config::RetentionConfig;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use switchboard_core::{field_name, AgentRecord, JoinPayload, LastLocation, StoredPayload};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

const UNKNOWN_MODEL: &str = "unknown";

struct RosterInner {
    agents: HashMap<String, AgentRecord>,
    blobs: BlobStore,
}

/// Agent id -> last-known record. Records survive disconnects and are only
/// removed by `sweep_inactive`.
pub struct Roster {
    retention: RetentionConfig,
    inner: RwLock<RosterInner>,
}

impl Roster {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            inner: RwLock::new(RosterInner {
                agents: HashMap::new(),
                blobs: BlobStore::new(retention.blob_budget),
            }),
            retention,
        }
    }

    /// Merges the join into the existing record (or creates one) and binds it
    /// to `handle`. A missing agent id gets a synthetic one.
    pub async fn upsert_on_join(
        &self,
        payload: JoinPayload,
        handle: &str,
        remote_ip: Option<String>,
    ) -> AgentRecord {
        let agent_id = payload
            .agent_id
            .unwrap_or_else(|| format!("agent-{}", &Uuid::new_v4().simple().to_string()[..8]));
        let now = now_ms();
        let mut inner = self.inner.write().await;
        release_handle(&mut inner.agents, handle, &agent_id, now);

        let record = inner
            .agents
            .entry(agent_id.clone())
            .or_insert_with(|| AgentRecord::new(agent_id.clone(), now));
        let mut attributes = payload.attributes;
        if !attributes.contains_key("ip") {
            if let Some(ip) = remote_ip {
                attributes.insert("ip".to_string(), Value::String(ip));
            }
        }
        record.merge_attributes(attributes);
        if !record.attributes.contains_key("model") {
            record
                .attributes
                .insert("model".to_string(), Value::String(UNKNOWN_MODEL.to_string()));
        }
        record.transport_handle = Some(handle.to_string());
        record.last_seen = now;
        record.last_join = Some(now);
        info!(event = "roster_join", agent_id = %agent_id, handle = handle);
        record.clone()
    }

    /// Clears the handle on every record bound to it. Returns the affected agent ids.
    pub async fn handle_disconnect(&self, handle: &str) -> Vec<String> {
        let now = now_ms();
        let mut inner = self.inner.write().await;
        let mut cleared = Vec::new();
        for record in inner.agents.values_mut() {
            if record.transport_handle.as_deref() == Some(handle) {
                record.transport_handle = None;
                record.last_seen = now;
                cleared.push(record.agent_id.clone());
            }
        }
        cleared.sort();
        if !cleared.is_empty() {
            info!(event = "roster_disconnect", handle = handle, agents = ?cleared);
        }
        cleared
    }

    pub async fn lookup(&self, agent_id: &str) -> Option<AgentRecord> {
        self.inner.read().await.agents.get(agent_id).cloned()
    }

    pub async fn live_handle(&self, agent_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .agents
            .get(agent_id)
            .and_then(|record| record.transport_handle.clone())
    }

    /// Reverse lookup from a transport handle to the agent bound to it.
    pub async fn agent_for_handle(&self, handle: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .agents
            .values()
            .find(|record| record.transport_handle.as_deref() == Some(handle))
            .map(|record| record.agent_id.clone())
    }

    /// All records ordered by agent id.
    pub async fn snapshot(&self) -> Vec<AgentRecord> {
        let mut records = self
            .inner
            .read()
            .await
            .agents
            .values()
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        records
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.agents.is_empty()
    }

    /// Stamps `last_seen` for an inbound event, creating the record if needed.
    /// The connection is only bound when the agent has no live handle, so a
    /// straggler on a superseded connection never takes over from a newer join.
    pub async fn touch_from_event(&self, agent_id: &str, handle: &str) {
        let now = now_ms();
        let mut inner = self.inner.write().await;
        let unbound = inner
            .agents
            .get(agent_id)
            .map_or(true, |record| record.transport_handle.is_none());
        if unbound {
            release_handle(&mut inner.agents, handle, agent_id, now);
        }
        let record = inner
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentRecord::new(agent_id, now));
        if unbound {
            record.transport_handle = Some(handle.to_string());
        }
        record.last_seen = now;
    }

    /// Stores a reply under the field for `kind`. Returns false if the agent is gone.
    pub async fn record_payload(&self, agent_id: &str, kind: &str, data: &Value) -> bool {
        let field = field_name(kind);
        if field.is_empty() {
            return false;
        }
        let now = now_ms();
        let size_bytes = serde_json::to_vec(data).map(|bytes| bytes.len()).unwrap_or(0);
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        if !inner.agents.contains_key(agent_id) {
            return false;
        }

        let blob_id = BlobStore::blob_id(agent_id, &field);
        let stored = if size_bytes > self.retention.inline_payload_limit {
            let outcome = inner.blobs.put(blob_id.clone(), data.clone(), size_bytes);
            forget_evicted(&mut inner.agents, &outcome.evicted);
            if !outcome.stored {
                debug!(event = "payload_dropped", agent_id = agent_id, field = %field, size_bytes);
                return false;
            }
            StoredPayload::Blob {
                blob_id,
                size_bytes,
                updated_at: now,
            }
        } else {
            inner.blobs.remove(&blob_id);
            StoredPayload::Inline {
                value: data.clone(),
                updated_at: now,
            }
        };

        match inner.agents.get_mut(agent_id) {
            Some(record) => {
                record.payloads.insert(field, stored);
                true
            }
            None => false,
        }
    }

    pub async fn set_location(&self, agent_id: &str, location: LastLocation) -> bool {
        match self.inner.write().await.agents.get_mut(agent_id) {
            Some(record) => {
                record.last_location = Some(location);
                true
            }
            None => false,
        }
    }

    /// Applies a resolved address only if the location it was computed for
    /// (identified by `ts`) is still the current one.
    pub async fn apply_address(&self, agent_id: &str, ts: i64, address: String) -> Option<LastLocation> {
        let mut inner = self.inner.write().await;
        let location = inner.agents.get_mut(agent_id)?.last_location.as_mut()?;
        if location.ts != ts {
            return None;
        }
        location.address = Some(address);
        Some(location.clone())
    }

    pub async fn blob(&self, blob_id: &str) -> Option<Value> {
        self.inner.read().await.blobs.get(blob_id).cloned()
    }

    pub async fn sweep_inactive(&self, threshold: Duration) -> Vec<String> {
        self.sweep_inactive_at(now_ms(), threshold).await
    }

    /// Removes disconnected agents whose `last_seen` is older than `threshold`.
    pub async fn sweep_inactive_at(&self, now_ms: i64, threshold: Duration) -> Vec<String> {
        let cutoff = now_ms.saturating_sub(i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX));
        let mut inner = self.inner.write().await;
        let mut removed = inner
            .agents
            .values()
            .filter(|record| !record.is_connected() && record.last_seen < cutoff)
            .map(|record| record.agent_id.clone())
            .collect::<Vec<_>>();
        removed.sort();
        for agent_id in &removed {
            inner.agents.remove(agent_id);
            inner.blobs.remove_agent(agent_id);
        }
        if !removed.is_empty() {
            info!(event = "roster_sweep", removed = removed.len());
        }
        removed
    }
}

/// A handle belongs to one agent at a time: rebinding it detaches other records.
fn release_handle(agents: &mut HashMap<String, AgentRecord>, handle: &str, keep: &str, now: i64) {
    for record in agents.values_mut() {
        if record.agent_id != keep && record.transport_handle.as_deref() == Some(handle) {
            record.transport_handle = None;
            record.last_seen = now;
        }
    }
}

fn forget_evicted(agents: &mut HashMap<String, AgentRecord>, evicted: &[String]) {
    for blob_id in evicted {
        let Some((agent_id, field)) = blob_id.split_once('/') else {
            continue;
        };
        if let Some(record) = agents.get_mut(agent_id) {
            let stale = matches!(
                record.payloads.get(field),
                Some(StoredPayload::Blob { blob_id: id, .. }) if id == blob_id
            );
            if stale {
                record.payloads.remove(field);
            }
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

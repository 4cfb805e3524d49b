use serde_json::Value;
use std::collections::{HashMap, VecDeque};

struct BlobEntry {
    value: Value,
    size_bytes: usize,
    seq: u64,
}

/// Byte-budgeted store for payloads too large to keep inline on agent records.
/// Blob ids are `<agentId>/<field>`, so each agent field holds at most one blob.
pub struct BlobStore {
    budget: usize,
    used: usize,
    seq: u64,
    blobs: HashMap<String, BlobEntry>,
    order: VecDeque<(String, u64)>,
}

/// Result of a `put`: whether the blob was kept, and which older blobs made room for it.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PutOutcome {
    pub stored: bool,
    pub evicted: Vec<String>,
}

impl BlobStore {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            seq: 0,
            blobs: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn blob_id(agent_id: &str, field: &str) -> String {
        format!("{agent_id}/{field}")
    }

    pub fn put(&mut self, id: String, value: Value, size_bytes: usize) -> PutOutcome {
        self.remove(&id);
        if size_bytes > self.budget {
            return PutOutcome::default();
        }

        let mut evicted = Vec::new();
        while self.used + size_bytes > self.budget {
            let Some((oldest, seq)) = self.order.pop_front() else {
                break;
            };
            if self.blobs.get(&oldest).is_some_and(|entry| entry.seq == seq) {
                self.remove(&oldest);
                evicted.push(oldest);
            }
        }

        self.seq += 1;
        self.used += size_bytes;
        self.order.push_back((id.clone(), self.seq));
        self.blobs.insert(
            id,
            BlobEntry {
                value,
                size_bytes,
                seq: self.seq,
            },
        );
        PutOutcome {
            stored: true,
            evicted,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.blobs.get(id).map(|entry| &entry.value)
    }

    /// Drops the blob and its eviction-order entry.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.blobs.remove(id) {
            Some(entry) => {
                self.used -= entry.size_bytes;
                self.order.retain(|(queued, seq)| !(queued == id && *seq == entry.seq));
                true
            }
            None => false,
        }
    }

    /// Drops every blob belonging to one agent.
    pub fn remove_agent(&mut self, agent_id: &str) -> usize {
        let prefix = format!("{agent_id}/");
        let ids = self
            .blobs
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect::<Vec<_>>();
        for id in &ids {
            self.remove(id);
        }
        ids.len()
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evicts_oldest_when_budget_exceeded() {
        let mut store = BlobStore::new(100);
        assert!(store.put("a/x".into(), json!("first"), 40).stored);
        assert!(store.put("b/x".into(), json!("second"), 40).stored);
        let outcome = store.put("c/x".into(), json!("third"), 40);
        assert!(outcome.stored);
        assert_eq!(outcome.evicted, vec!["a/x".to_string()]);
        assert!(store.get("a/x").is_none());
        assert_eq!(store.used_bytes(), 80);
    }

    #[test]
    fn replacing_a_blob_does_not_double_count() {
        let mut store = BlobStore::new(100);
        store.put("a/x".into(), json!(1), 60);
        store.put("a/x".into(), json!(2), 60);
        assert_eq!(store.used_bytes(), 60);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a/x"), Some(&json!(2)));

        let outcome = store.put("b/x".into(), json!(3), 50);
        assert_eq!(outcome.evicted, vec!["a/x".to_string()]);
        assert_eq!(store.used_bytes(), 50);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn repeated_replacement_keeps_order_bounded() {
        let mut store = BlobStore::new(64 * 1024 * 1024);
        for n in 0..1_000 {
            assert!(store.put("A1/auditTrail".into(), json!(n), 100_000).stored);
        }
        assert_eq!(store.len(), 1);
        assert_eq!(store.used_bytes(), 100_000);
        assert_eq!(store.order.len(), 1);

        store.put("A2/auditTrail".into(), json!("other"), 10);
        store.remove("A1/auditTrail");
        assert_eq!(store.order.len(), 1);
        assert_eq!(store.order.front().map(|(id, _)| id.as_str()), Some("A2/auditTrail"));
    }

    #[test]
    fn oversized_blob_is_rejected() {
        let mut store = BlobStore::new(10);
        let outcome = store.put("a/x".into(), json!("big"), 11);
        assert!(!outcome.stored);
        assert!(store.is_empty());
    }

    #[test]
    fn remove_agent_drops_only_that_agent() {
        let mut store = BlobStore::new(1_000);
        store.put(BlobStore::blob_id("a", "logs"), json!(1), 10);
        store.put(BlobStore::blob_id("a", "dump"), json!(2), 10);
        store.put(BlobStore::blob_id("ab", "logs"), json!(3), 10);
        assert_eq!(store.remove_agent("a"), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("ab/logs").is_some());
        assert_eq!(store.used_bytes(), 10);
    }
}

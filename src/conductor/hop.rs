//! Per-hop request id tables.
//!
//! Every connection the router forwards requests to has its own table. The
//! router replaces the requester's id with a fresh one from the table, so ids
//! seen by the destination are unique among its outstanding requests no
//! matter how many sources share it, and puts the original id back when the
//! response returns.

use std::collections::HashMap;

use acp_proto::Id;

use super::SourceIndex;

/// Who is waiting for the response to a forwarded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Relayed on behalf of another connection.
    Forwarded { source: SourceIndex, original_id: Id },
    /// Sent by the conductor itself to complete a component's handshake.
    Handshake,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingRequest {
    pub origin: Origin,
    pub method: String,
}

#[derive(Debug)]
pub(crate) struct HopTable {
    next_id: i64,
    capacity: usize,
    pending: HashMap<Id, PendingRequest>,
}

impl HopTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: 0,
            capacity,
            pending: HashMap::new(),
        }
    }

    /// Assign a downstream id, or hand the request back if the table is full.
    pub fn insert(&mut self, request: PendingRequest) -> Result<Id, PendingRequest> {
        if self.pending.len() >= self.capacity {
            return Err(request);
        }
        let id = loop {
            let candidate = Id::Number(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&candidate) {
                break candidate;
            }
        };
        self.pending.insert(id.clone(), request);
        Ok(id)
    }

    pub fn remove(&mut self, id: &Id) -> Option<PendingRequest> {
        self.pending.remove(id)
    }

    pub fn has_pending(&self, method: &str) -> bool {
        self.pending.values().any(|request| request.method == method)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn forwarded(source: SourceIndex, original: i64) -> PendingRequest {
        PendingRequest {
            origin: Origin::Forwarded {
                source,
                original_id: Id::Number(original),
            },
            method: "session/prompt".to_string(),
        }
    }

    #[test]
    fn colliding_upstream_ids_get_distinct_downstream_ids() {
        let mut table = HopTable::new(16);
        // Two different sources both use id 1.
        let a = table.insert(forwarded(0, 1)).unwrap();
        let b = table.insert(forwarded(2, 1)).unwrap();
        assert_ne!(a, b);

        assert_eq!(table.remove(&b), Some(forwarded(2, 1)));
        assert_eq!(table.remove(&a), Some(forwarded(0, 1)));
        assert_eq!(table.remove(&a), None);
    }

    #[test]
    fn ids_stay_unique_while_pending() {
        let mut table = HopTable::new(1000);
        let ids: HashSet<_> = (0..1000).map(|n| table.insert(forwarded(0, n)).unwrap()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn full_table_refuses() {
        let mut table = HopTable::new(2);
        let first = table.insert(forwarded(0, 1)).unwrap();
        table.insert(forwarded(0, 2)).unwrap();
        assert_eq!(table.insert(forwarded(0, 3)), Err(forwarded(0, 3)));

        table.remove(&first);
        assert!(table.insert(forwarded(0, 3)).is_ok());
        assert_eq!(table.len(), 2);
        assert!(table.has_pending("session/prompt"));
        assert!(!table.has_pending("initialize"));
    }
}

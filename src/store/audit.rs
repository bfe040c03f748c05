//! Audit-event storage: one trait, two backends.
//!
//! The legacy backend keeps every event in a single unified table; the
//! partitioned backend shards rows by entity type. Both are written on
//! every record and both list in `created_at DESC, id DESC` order, so the
//! cursor scheme (and therefore page boundaries) cannot tell them apart.
//! A feature flag picks which one serves each read.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::models::audit::{AuditEvent, EntityType};
use crate::pagination::KeysetRow;

impl KeysetRow for AuditEvent {
    fn keyset_key(&self) -> (i64, u64) {
        (self.created_at.timestamp_micros(), self.id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<u64>,
    pub author_id: Option<u64>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    /// Pin the listing to one entity (the group/project endpoints).
    pub scope: Option<(EntityType, u64)>,
}

impl AuditFilter {
    fn matches(&self, e: &AuditEvent) -> bool {
        if let Some((ty, id)) = self.scope {
            if e.entity_type != ty || e.entity_id != id {
                return false;
            }
        }
        if let Some(ty) = self.entity_type {
            if e.entity_type != ty {
                return false;
            }
        }
        if let Some(id) = self.entity_id {
            if e.entity_id != id {
                return false;
            }
        }
        if let Some(author) = self.author_id {
            if e.author_id != author {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if e.created_at > before {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if e.created_at < after {
                return false;
            }
        }
        true
    }
}

pub trait AuditEventStore: Send + Sync {
    fn record(&self, event: AuditEvent);
    fn find(&self, id: u64) -> Option<AuditEvent>;
    /// Matching events in `created_at DESC, id DESC` order.
    fn list(&self, filter: &AuditFilter) -> Vec<AuditEvent>;
    /// Move authorship between users (ghost migration).
    fn reassign_author(&self, from: u64, to: u64);
}

fn sort_desc(rows: &mut Vec<AuditEvent>) {
    rows.sort_by(|a, b| b.keyset_key().cmp(&a.keyset_key()));
}

/// The unified table.
#[derive(Default)]
pub struct LegacyAuditStore {
    rows: RwLock<Vec<AuditEvent>>,
}

impl AuditEventStore for LegacyAuditStore {
    fn record(&self, event: AuditEvent) {
        self.rows.write().unwrap().push(event);
    }

    fn find(&self, id: u64) -> Option<AuditEvent> {
        self.rows.read().unwrap().iter().find(|e| e.id == id).cloned()
    }

    fn list(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let mut out: Vec<AuditEvent> = self
            .rows
            .read()
            .unwrap()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        sort_desc(&mut out);
        out
    }

    fn reassign_author(&self, from: u64, to: u64) {
        for e in self.rows.write().unwrap().iter_mut() {
            if e.author_id == from {
                e.author_id = to;
            }
        }
    }
}

/// One table per entity type.
#[derive(Default)]
pub struct PartitionedAuditStore {
    partitions: RwLock<HashMap<EntityType, Vec<AuditEvent>>>,
}

impl AuditEventStore for PartitionedAuditStore {
    fn record(&self, event: AuditEvent) {
        self.partitions
            .write()
            .unwrap()
            .entry(event.entity_type)
            .or_default()
            .push(event);
    }

    fn find(&self, id: u64) -> Option<AuditEvent> {
        let partitions = self.partitions.read().unwrap();
        partitions
            .values()
            .flat_map(|rows| rows.iter())
            .find(|e| e.id == id)
            .cloned()
    }

    fn list(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let partitions = self.partitions.read().unwrap();
        let mut out: Vec<AuditEvent> = match filter.entity_type.or(filter.scope.map(|(t, _)| t)) {
            // A type filter lets us touch a single partition.
            Some(ty) => partitions
                .get(&ty)
                .map(|rows| rows.iter().filter(|e| filter.matches(e)).cloned().collect())
                .unwrap_or_default(),
            None => partitions
                .values()
                .flat_map(|rows| rows.iter())
                .filter(|e| filter.matches(e))
                .cloned()
                .collect(),
        };
        sort_desc(&mut out);
        out
    }

    fn reassign_author(&self, from: u64, to: u64) {
        for rows in self.partitions.write().unwrap().values_mut() {
            for e in rows.iter_mut() {
                if e.author_id == from {
                    e.author_id = to;
                }
            }
        }
    }
}

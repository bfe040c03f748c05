use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::user::UserId;

/// Which kind of entity an audit event is scoped to. Doubles as the
/// partition key for the per-entity-type storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    User,
    Group,
    Project,
    Instance,
}

impl EntityType {
    pub fn parse(s: &str) -> Option<EntityType> {
        match s {
            "User" => Some(EntityType::User),
            "Group" => Some(EntityType::Group),
            "Project" => Some(EntityType::Project),
            "Instance" => Some(EntityType::Instance),
            _ => None,
        }
    }
}

/// Immutable once recorded.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: u64,
    pub author_id: UserId,
    pub entity_id: u64,
    pub entity_type: EntityType,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

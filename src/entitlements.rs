//! Capability lookup consulted by every handler: licensed features,
//! feature flags, and instance-level settings. One swappable object in
//! shared state instead of conditionals scattered through handlers; the
//! CLI and tests reconfigure it at runtime.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::models::group::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    AuditEvents,
    Epics,
    Subepics,
    EpicColors,
    RelatedEpics,
    MinimalAccessRole,
    CustomRoles,
    ServiceAccounts,
    MergeRequestApprovals,
    CustomFileTemplates,
}

impl Feature {
    pub const ALL: [Feature; 10] = [
        Feature::AuditEvents,
        Feature::Epics,
        Feature::Subepics,
        Feature::EpicColors,
        Feature::RelatedEpics,
        Feature::MinimalAccessRole,
        Feature::CustomRoles,
        Feature::ServiceAccounts,
        Feature::MergeRequestApprovals,
        Feature::CustomFileTemplates,
    ];

    pub fn parse(s: &str) -> Option<Feature> {
        match s {
            "audit_events" => Some(Feature::AuditEvents),
            "epics" => Some(Feature::Epics),
            "subepics" => Some(Feature::Subepics),
            "epic_colors" => Some(Feature::EpicColors),
            "related_epics" => Some(Feature::RelatedEpics),
            "minimal_access_role" => Some(Feature::MinimalAccessRole),
            "custom_roles" => Some(Feature::CustomRoles),
            "service_accounts" => Some(Feature::ServiceAccounts),
            "merge_request_approvals" => Some(Feature::MergeRequestApprovals),
            "custom_file_templates" => Some(Feature::CustomFileTemplates),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Serve audit-event reads from the partitioned per-entity tables
    /// instead of the legacy unified table.
    ReadAuditEventsFromPartitionedTables,
}

impl Flag {
    pub fn parse(s: &str) -> Option<Flag> {
        match s {
            "read_audit_events_from_partitioned_tables" => {
                Some(Flag::ReadAuditEventsFromPartitionedTables)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Snapshot {
    features: HashSet<Feature>,
    flags: HashSet<Flag>,
    saas: bool,
    instance_plan: Plan,
    member_promotion_management: bool,
}

#[derive(Debug)]
pub struct Entitlements {
    inner: RwLock<Snapshot>,
}

impl Default for Entitlements {
    fn default() -> Self {
        Entitlements {
            inner: RwLock::new(Snapshot {
                features: HashSet::new(),
                flags: HashSet::new(),
                saas: false,
                instance_plan: Plan::Free,
                member_promotion_management: false,
            }),
        }
    }
}

impl Entitlements {
    pub fn licensed(&self, feature: Feature) -> bool {
        self.inner.read().unwrap().features.contains(&feature)
    }

    pub fn set_licensed(&self, feature: Feature, on: bool) {
        let mut inner = self.inner.write().unwrap();
        if on {
            inner.features.insert(feature);
        } else {
            inner.features.remove(&feature);
        }
    }

    pub fn license_all(&self, features: &[Feature]) {
        let mut inner = self.inner.write().unwrap();
        inner.features.extend(features.iter().copied());
    }

    pub fn flag(&self, flag: Flag) -> bool {
        self.inner.read().unwrap().flags.contains(&flag)
    }

    pub fn set_flag(&self, flag: Flag, on: bool) {
        let mut inner = self.inner.write().unwrap();
        if on {
            inner.flags.insert(flag);
        } else {
            inner.flags.remove(&flag);
        }
    }

    pub fn saas(&self) -> bool {
        self.inner.read().unwrap().saas
    }

    pub fn set_saas(&self, on: bool) {
        self.inner.write().unwrap().saas = on;
    }

    pub fn instance_plan(&self) -> Plan {
        self.inner.read().unwrap().instance_plan
    }

    pub fn set_instance_plan(&self, plan: Plan) {
        self.inner.write().unwrap().instance_plan = plan;
    }

    /// Self-managed setting: queue promotions into billable roles for
    /// administrator approval instead of applying them.
    pub fn member_promotion_management(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.member_promotion_management && !inner.saas && inner.instance_plan == Plan::Ultimate
    }

    pub fn set_member_promotion_management(&self, on: bool) {
        self.inner.write().unwrap().member_promotion_management = on;
    }
}

//! In-memory world state. The persistence engine behind the original
//! system is an external collaborator; this store reproduces its visible
//! contract (committed reads, immediate visibility of writes) with
//! read/write-locked tables and monotonic id sequences.

pub mod audit;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};

use self::audit::{AuditEventStore, LegacyAuditStore, PartitionedAuditStore};
use crate::models::audit::{AuditEvent, EntityType};
use crate::models::epic::{Epic, RelatedEpicLink};
use crate::models::group::{Group, GroupId, Project, ProjectId, Subscription, Visibility};
use crate::models::member::{GroupLink, Invitation, Member, MembershipSource, MemberRole};
use crate::models::merge_request::MergeRequest;
use crate::models::token::{self, PersonalAccessToken, TokenScope};
use crate::models::user::{User, UserId, UserKind, UserState};

#[derive(Default)]
struct Sequences {
    users: AtomicU64,
    groups: AtomicU64,
    projects: AtomicU64,
    epics: AtomicU64,
    epic_links: AtomicU64,
    group_links: AtomicU64,
    member_roles: AtomicU64,
    invitations: AtomicU64,
    tokens: AtomicU64,
    merge_requests: AtomicU64,
    audit_events: AtomicU64,
}

fn next(seq: &AtomicU64) -> u64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Default)]
pub struct Store {
    seq: Sequences,
    users: RwLock<BTreeMap<UserId, User>>,
    groups: RwLock<BTreeMap<GroupId, Group>>,
    projects: RwLock<BTreeMap<ProjectId, Project>>,
    members: RwLock<Vec<Member>>,
    member_roles: RwLock<BTreeMap<u64, MemberRole>>,
    group_links: RwLock<Vec<GroupLink>>,
    invitations: RwLock<Vec<Invitation>>,
    epics: RwLock<BTreeMap<u64, Epic>>,
    epic_iids: RwLock<HashMap<GroupId, u64>>,
    epic_links: RwLock<Vec<RelatedEpicLink>>,
    merge_requests: RwLock<BTreeMap<u64, MergeRequest>>,
    mr_iids: RwLock<HashMap<ProjectId, u64>>,
    tokens: RwLock<BTreeMap<u64, PersonalAccessToken>>,
    token_digests: RwLock<HashMap<String, u64>>,
    ghost_user: Mutex<Option<UserId>>,
    pub legacy_audit: LegacyAuditStore,
    pub partitioned_audit: PartitionedAuditStore,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    // ── Users ────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        username: &str,
        name: &str,
        email: &str,
        admin: bool,
        kind: UserKind,
    ) -> User {
        let user = User {
            id: next(&self.seq.users),
            username: username.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            admin,
            kind,
            state: UserState::Active,
            created_at: Utc::now(),
        };
        self.users.write().unwrap().insert(user.id, user.clone());
        user
    }

    pub fn user(&self, id: UserId) -> Option<User> {
        self.users.read().unwrap().get(&id).cloned()
    }

    pub fn user_by_username(&self, username: &str) -> Option<User> {
        self.users
            .read()
            .unwrap()
            .values()
            .find(|u| u.username == username)
            .cloned()
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        self.users
            .read()
            .unwrap()
            .values()
            .find(|u| u.email == email)
            .cloned()
    }

    pub fn update_user<F: FnOnce(&mut User)>(&self, id: UserId, f: F) -> Option<User> {
        let mut users = self.users.write().unwrap();
        let user = users.get_mut(&id)?;
        f(user);
        Some(user.clone())
    }

    pub fn delete_user(&self, id: UserId) -> bool {
        self.users.write().unwrap().remove(&id).is_some()
    }

    /// Instance-wide tombstone account, created on first use.
    pub fn ghost_user(&self) -> User {
        let mut slot = self.ghost_user.lock().unwrap();
        if let Some(id) = *slot {
            if let Some(user) = self.user(id) {
                return user;
            }
        }
        let ghost = self.create_user("ghost", "Ghost User", "ghost@internal", false, UserKind::Ghost);
        *slot = Some(ghost.id);
        ghost
    }

    pub fn service_accounts_of(&self, group_id: GroupId) -> Vec<User> {
        self.users
            .read()
            .unwrap()
            .values()
            .filter(|u| u.provisioned_by() == Some(group_id))
            .cloned()
            .collect()
    }

    // ── Personal access tokens ───────────────────────────────────

    pub fn create_token(
        &self,
        user_id: UserId,
        name: &str,
        scopes: Vec<TokenScope>,
        expires_at: Option<chrono::NaiveDate>,
    ) -> (String, PersonalAccessToken) {
        let (raw, digest) = token::generate();
        let token = PersonalAccessToken {
            id: next(&self.seq.tokens),
            user_id,
            name: name.to_string(),
            scopes,
            token_digest: digest.clone(),
            revoked: false,
            expires_at,
            created_at: Utc::now(),
        };
        self.tokens.write().unwrap().insert(token.id, token.clone());
        self.token_digests.write().unwrap().insert(digest, token.id);
        (raw, token)
    }

    pub fn token(&self, id: u64) -> Option<PersonalAccessToken> {
        self.tokens.read().unwrap().get(&id).cloned()
    }

    pub fn tokens_of(&self, user_id: UserId) -> Vec<PersonalAccessToken> {
        self.tokens
            .read()
            .unwrap()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn resolve_token(&self, raw: &str) -> Option<(PersonalAccessToken, User)> {
        let digest = token::digest(raw);
        let id = *self.token_digests.read().unwrap().get(&digest)?;
        let token = self.token(id)?;
        if !token.active() || !token.matches(raw) {
            return None;
        }
        let user = self.user(token.user_id)?;
        Some((token, user))
    }

    pub fn revoke_token(&self, id: u64) -> bool {
        let mut tokens = self.tokens.write().unwrap();
        match tokens.get_mut(&id) {
            Some(t) if !t.revoked => {
                t.revoked = true;
                true
            }
            _ => false,
        }
    }

    pub fn revoke_tokens_of(&self, user_id: UserId) {
        let mut tokens = self.tokens.write().unwrap();
        for t in tokens.values_mut().filter(|t| t.user_id == user_id) {
            t.revoked = true;
        }
    }

    // ── Groups & projects ────────────────────────────────────────

    pub fn create_group(
        &self,
        path: &str,
        name: &str,
        visibility: Visibility,
        parent_id: Option<GroupId>,
        subscription: Option<Subscription>,
    ) -> Group {
        let group = Group {
            id: next(&self.seq.groups),
            path: path.to_string(),
            name: name.to_string(),
            visibility,
            parent_id,
            settings: Default::default(),
            subscription,
            created_at: Utc::now(),
        };
        self.groups.write().unwrap().insert(group.id, group.clone());
        group
    }

    pub fn group(&self, id: GroupId) -> Option<Group> {
        self.groups.read().unwrap().get(&id).cloned()
    }

    pub fn update_group<F: FnOnce(&mut Group)>(&self, id: GroupId, f: F) -> Option<Group> {
        let mut groups = self.groups.write().unwrap();
        let group = groups.get_mut(&id)?;
        f(group);
        Some(group.clone())
    }

    /// Self first, then parents up to the root.
    pub fn ancestor_chain(&self, id: GroupId) -> Vec<GroupId> {
        let groups = self.groups.read().unwrap();
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(gid) = cursor {
            match groups.get(&gid) {
                Some(g) => {
                    chain.push(g.id);
                    cursor = g.parent_id;
                }
                None => break,
            }
        }
        chain
    }

    pub fn root_ancestor(&self, id: GroupId) -> Option<Group> {
        let chain = self.ancestor_chain(id);
        chain.last().and_then(|gid| self.group(*gid))
    }

    /// The group and every group beneath it.
    pub fn hierarchy(&self, root: GroupId) -> Vec<GroupId> {
        let groups = self.groups.read().unwrap();
        let mut out = vec![root];
        let mut i = 0;
        while i < out.len() {
            let parent = out[i];
            out.extend(
                groups
                    .values()
                    .filter(|g| g.parent_id == Some(parent))
                    .map(|g| g.id),
            );
            i += 1;
        }
        out
    }

    pub fn projects_in(&self, groups: &[GroupId]) -> Vec<Project> {
        self.projects
            .read()
            .unwrap()
            .values()
            .filter(|p| groups.contains(&p.group_id))
            .cloned()
            .collect()
    }

    /// Removes the group subtree and everything scoped to it.
    pub fn delete_group(&self, id: GroupId) {
        let subtree = self.hierarchy(id);
        let project_ids: Vec<ProjectId> =
            self.projects_in(&subtree).iter().map(|p| p.id).collect();

        self.groups.write().unwrap().retain(|gid, _| !subtree.contains(gid));
        self.projects.write().unwrap().retain(|pid, _| !project_ids.contains(pid));
        self.members.write().unwrap().retain(|m| match m.source {
            MembershipSource::Group(g) => !subtree.contains(&g),
            MembershipSource::Project(p) => !project_ids.contains(&p),
        });
        self.invitations.write().unwrap().retain(|i| match i.source {
            MembershipSource::Group(g) => !subtree.contains(&g),
            MembershipSource::Project(p) => !project_ids.contains(&p),
        });
        self.group_links
            .write()
            .unwrap()
            .retain(|l| !subtree.contains(&l.shared_group) && !subtree.contains(&l.invited_group));

        let doomed_epics: Vec<u64> = {
            let epics = self.epics.read().unwrap();
            epics
                .values()
                .filter(|e| subtree.contains(&e.group_id))
                .map(|e| e.id)
                .collect()
        };
        self.epics.write().unwrap().retain(|eid, _| !doomed_epics.contains(eid));
        self.epic_links.write().unwrap().retain(|l| {
            !doomed_epics.contains(&l.source_epic_id) && !doomed_epics.contains(&l.target_epic_id)
        });
        self.merge_requests
            .write()
            .unwrap()
            .retain(|_, mr| !project_ids.contains(&mr.project_id));
    }

    pub fn create_project(
        &self,
        path: &str,
        name: &str,
        visibility: Visibility,
        group_id: GroupId,
    ) -> Project {
        let project = Project {
            id: next(&self.seq.projects),
            path: path.to_string(),
            name: name.to_string(),
            visibility,
            group_id,
            created_at: Utc::now(),
        };
        self.projects.write().unwrap().insert(project.id, project.clone());
        project
    }

    pub fn project(&self, id: ProjectId) -> Option<Project> {
        self.projects.read().unwrap().get(&id).cloned()
    }

    // ── Members ──────────────────────────────────────────────────

    pub fn add_member(&self, member: Member) {
        self.members.write().unwrap().push(member);
    }

    pub fn find_member(&self, source: MembershipSource, user_id: UserId) -> Option<Member> {
        self.members
            .read()
            .unwrap()
            .iter()
            .find(|m| m.source == source && m.user_id == user_id)
            .cloned()
    }

    pub fn members_of(&self, source: MembershipSource) -> Vec<Member> {
        self.members
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.source == source)
            .cloned()
            .collect()
    }

    pub fn update_member<F: FnOnce(&mut Member)>(
        &self,
        source: MembershipSource,
        user_id: UserId,
        f: F,
    ) -> Option<Member> {
        let mut members = self.members.write().unwrap();
        let member = members
            .iter_mut()
            .find(|m| m.source == source && m.user_id == user_id)?;
        f(member);
        Some(member.clone())
    }

    pub fn remove_member(&self, source: MembershipSource, user_id: UserId) -> bool {
        let mut members = self.members.write().unwrap();
        let before = members.len();
        members.retain(|m| !(m.source == source && m.user_id == user_id));
        members.len() != before
    }

    pub fn memberships_of(&self, user_id: UserId) -> Vec<Member> {
        self.members
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect()
    }

    // ── Custom roles ─────────────────────────────────────────────

    pub fn create_member_role(
        &self,
        namespace: Option<GroupId>,
        name: &str,
        base_access_level: crate::authz::AccessLevel,
    ) -> MemberRole {
        let role = MemberRole {
            id: next(&self.seq.member_roles),
            namespace,
            name: name.to_string(),
            base_access_level,
        };
        self.member_roles.write().unwrap().insert(role.id, role.clone());
        role
    }

    pub fn member_role(&self, id: u64) -> Option<MemberRole> {
        self.member_roles.read().unwrap().get(&id).cloned()
    }

    // ── Group links ──────────────────────────────────────────────

    pub fn add_group_link(&self, mut link: GroupLink) -> GroupLink {
        link.id = next(&self.seq.group_links);
        self.group_links.write().unwrap().push(link.clone());
        link
    }

    pub fn group_link(&self, shared: GroupId, invited: GroupId) -> Option<GroupLink> {
        self.group_links
            .read()
            .unwrap()
            .iter()
            .find(|l| l.shared_group == shared && l.invited_group == invited)
            .cloned()
    }

    pub fn links_into(&self, groups: &[GroupId]) -> Vec<GroupLink> {
        self.group_links
            .read()
            .unwrap()
            .iter()
            .filter(|l| groups.contains(&l.shared_group))
            .cloned()
            .collect()
    }

    pub fn remove_group_link(&self, shared: GroupId, invited: GroupId) -> bool {
        let mut links = self.group_links.write().unwrap();
        let before = links.len();
        links.retain(|l| !(l.shared_group == shared && l.invited_group == invited));
        links.len() != before
    }

    // ── Invitations ──────────────────────────────────────────────

    pub fn add_invitation(&self, mut invitation: Invitation) -> Invitation {
        invitation.id = next(&self.seq.invitations);
        self.invitations.write().unwrap().push(invitation.clone());
        invitation
    }

    pub fn invitations_of(&self, source: MembershipSource) -> Vec<Invitation> {
        self.invitations
            .read()
            .unwrap()
            .iter()
            .filter(|i| i.source == source)
            .cloned()
            .collect()
    }

    pub fn find_invitation(&self, source: MembershipSource, email: &str) -> Option<Invitation> {
        self.invitations
            .read()
            .unwrap()
            .iter()
            .find(|i| i.source == source && i.email == email)
            .cloned()
    }

    pub fn remove_invitation(&self, source: MembershipSource, email: &str) -> bool {
        let mut invitations = self.invitations.write().unwrap();
        let before = invitations.len();
        invitations.retain(|i| !(i.source == source && i.email == email));
        invitations.len() != before
    }

    // ── Epics ────────────────────────────────────────────────────

    pub fn create_epic<F: FnOnce(&mut Epic)>(&self, group_id: GroupId, author_id: UserId, f: F) -> Epic {
        let iid = {
            let mut iids = self.epic_iids.write().unwrap();
            let counter = iids.entry(group_id).or_insert(0);
            *counter += 1;
            *counter
        };
        let now = Utc::now();
        let mut epic = Epic {
            id: next(&self.seq.epics),
            iid,
            group_id,
            title: String::new(),
            description: None,
            state: crate::models::epic::EpicState::Opened,
            confidential: false,
            labels: Vec::new(),
            parent_id: None,
            color: crate::models::epic::DEFAULT_EPIC_COLOR.to_string(),
            start_date_fixed: None,
            start_date_is_fixed: false,
            due_date_fixed: None,
            due_date_is_fixed: false,
            author_id,
            created_at: now,
            updated_at: now,
        };
        f(&mut epic);
        self.epics.write().unwrap().insert(epic.id, epic.clone());
        epic
    }

    pub fn epic(&self, id: u64) -> Option<Epic> {
        self.epics.read().unwrap().get(&id).cloned()
    }

    pub fn epic_by_iid(&self, group_id: GroupId, iid: u64) -> Option<Epic> {
        self.epics
            .read()
            .unwrap()
            .values()
            .find(|e| e.group_id == group_id && e.iid == iid)
            .cloned()
    }

    pub fn epics_of(&self, group_id: GroupId) -> Vec<Epic> {
        self.epics
            .read()
            .unwrap()
            .values()
            .filter(|e| e.group_id == group_id)
            .cloned()
            .collect()
    }

    pub fn epics_authored_by(&self, author_id: UserId) -> Vec<Epic> {
        self.epics
            .read()
            .unwrap()
            .values()
            .filter(|e| e.author_id == author_id)
            .cloned()
            .collect()
    }

    pub fn update_epic<F: FnOnce(&mut Epic)>(&self, id: u64, f: F) -> Option<Epic> {
        let mut epics = self.epics.write().unwrap();
        let epic = epics.get_mut(&id)?;
        f(epic);
        epic.updated_at = Utc::now();
        Some(epic.clone())
    }

    /// Reassign authorship without touching `updated_at` — used by the
    /// ghost migration, which must not look like an edit.
    pub fn reassign_epic_author(&self, id: u64, author_id: UserId) {
        if let Some(epic) = self.epics.write().unwrap().get_mut(&id) {
            epic.author_id = author_id;
        }
    }

    pub fn delete_epic(&self, id: u64) -> bool {
        let removed = self.epics.write().unwrap().remove(&id).is_some();
        if removed {
            self.epic_links
                .write()
                .unwrap()
                .retain(|l| l.source_epic_id != id && l.target_epic_id != id);
            // Children are detached, not deleted.
            let mut epics = self.epics.write().unwrap();
            for epic in epics.values_mut() {
                if epic.parent_id == Some(id) {
                    epic.parent_id = None;
                }
            }
        }
        removed
    }

    // ── Related epic links ───────────────────────────────────────

    pub fn add_epic_link(&self, mut link: RelatedEpicLink) -> RelatedEpicLink {
        link.id = next(&self.seq.epic_links);
        self.epic_links.write().unwrap().push(link.clone());
        link
    }

    pub fn epic_link(&self, id: u64) -> Option<RelatedEpicLink> {
        self.epic_links.read().unwrap().iter().find(|l| l.id == id).cloned()
    }

    pub fn epic_links_of(&self, epic_id: u64) -> Vec<RelatedEpicLink> {
        self.epic_links
            .read()
            .unwrap()
            .iter()
            .filter(|l| l.source_epic_id == epic_id || l.target_epic_id == epic_id)
            .cloned()
            .collect()
    }

    pub fn epic_link_between(&self, a: u64, b: u64) -> Option<RelatedEpicLink> {
        self.epic_links
            .read()
            .unwrap()
            .iter()
            .find(|l| {
                (l.source_epic_id == a && l.target_epic_id == b)
                    || (l.source_epic_id == b && l.target_epic_id == a)
            })
            .cloned()
    }

    pub fn remove_epic_link(&self, id: u64) -> bool {
        let mut links = self.epic_links.write().unwrap();
        let before = links.len();
        links.retain(|l| l.id != id);
        links.len() != before
    }

    // ── Merge requests ───────────────────────────────────────────

    pub fn create_merge_request<F: FnOnce(&mut MergeRequest)>(
        &self,
        project_id: ProjectId,
        author_id: UserId,
        f: F,
    ) -> MergeRequest {
        let iid = {
            let mut iids = self.mr_iids.write().unwrap();
            let counter = iids.entry(project_id).or_insert(0);
            *counter += 1;
            *counter
        };
        let now = Utc::now();
        let mut mr = MergeRequest {
            id: next(&self.seq.merge_requests),
            iid,
            project_id,
            title: String::new(),
            state: crate::models::merge_request::MergeRequestState::Opened,
            author_id,
            approvals_required: 0,
            approvals_given: 0,
            created_at: now,
            updated_at: now,
        };
        f(&mut mr);
        self.merge_requests.write().unwrap().insert(mr.id, mr.clone());
        mr
    }

    pub fn merge_request_by_iid(&self, project_id: ProjectId, iid: u64) -> Option<MergeRequest> {
        self.merge_requests
            .read()
            .unwrap()
            .values()
            .find(|mr| mr.project_id == project_id && mr.iid == iid)
            .cloned()
    }

    pub fn merge_requests_of(&self, project_id: ProjectId) -> Vec<MergeRequest> {
        self.merge_requests
            .read()
            .unwrap()
            .values()
            .filter(|mr| mr.project_id == project_id)
            .cloned()
            .collect()
    }

    // ── Audit events ─────────────────────────────────────────────

    /// Dual-write: the legacy unified table and the partitioned tables
    /// both receive every event under the same id and timestamp.
    pub fn record_audit(
        &self,
        author_id: UserId,
        entity_type: EntityType,
        entity_id: u64,
        details: serde_json::Value,
        created_at: Option<DateTime<Utc>>,
    ) -> AuditEvent {
        let event = AuditEvent {
            id: next(&self.seq.audit_events),
            author_id,
            entity_id,
            entity_type,
            details,
            ip_address: None,
            created_at: created_at.unwrap_or_else(Utc::now),
        };
        self.legacy_audit.record(event.clone());
        self.partitioned_audit.record(event.clone());
        event
    }

    pub fn audit_store(&self, partitioned: bool) -> &dyn AuditEventStore {
        if partitioned {
            &self.partitioned_audit
        } else {
            &self.legacy_audit
        }
    }

    /// Rewrites authorship in both backends; only the ghost migration
    /// does this.
    pub fn reassign_audit_author(&self, from: UserId, to: UserId) {
        self.legacy_audit.reassign_author(from, to);
        self.partitioned_audit.reassign_author(from, to);
    }
}

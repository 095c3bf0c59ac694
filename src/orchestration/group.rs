//! Groups of sessions and the members that belong to them.
//!
//! The [`Organization`] is plain serializable data. It is shared as
//! `Arc<RwLock<Organization>>` between the coordinator, the watchdog and
//! whatever persists it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

use crate::reflection::ReflectionCycle;
use crate::{plog, plog_debug, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the coordinator drives a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GroupMode {
    /// Same prompt to every member at once.
    #[default]
    Broadcast,
    /// Members in order, each seeing the previous member's output.
    Sequential,
    /// The orchestrator plans, workers execute, the orchestrator synthesizes.
    Orchestrator,
    /// Orchestrator mode repeated under a reflection cycle.
    OrchestratorReflect,
}

impl fmt::Display for GroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupMode::Broadcast => write!(f, "broadcast"),
            GroupMode::Sequential => write!(f, "sequential"),
            GroupMode::Orchestrator => write!(f, "orchestrator"),
            GroupMode::OrchestratorReflect => write!(f, "orchestrator-reflect"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemberRole {
    #[default]
    Worker,
    Orchestrator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub session: String,
    pub group_id: GroupId,
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_model: Option<String>,
    /// System prompt prefixed onto every task delegated to this member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

impl Member {
    pub fn new(session: &str, group_id: GroupId, role: MemberRole) -> Self {
        Self {
            session: session.to_string(),
            group_id,
            role,
            preferred_model: None,
            persona: None,
        }
    }

    /// Members set up deliberately for multi-agent work. Reconciliation
    /// never relocates these.
    pub fn has_multi_agent_provenance(&self) -> bool {
        self.role == MemberRole::Orchestrator || self.preferred_model.is_some()
    }

    pub fn is_orchestrator(&self) -> bool {
        self.role == MemberRole::Orchestrator
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub is_multi_agent: bool,
    #[serde(default)]
    pub mode: GroupMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_orchestrator_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_worker_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<ReflectionCycle>,
    /// Set on groups created by reconciliation for one repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn new(name: &str, mode: GroupMode, is_multi_agent: bool) -> Self {
        Self {
            id: GroupId::new(),
            name: name.to_string(),
            is_multi_agent,
            mode,
            orchestrator_prompt: None,
            default_orchestrator_model: None,
            default_worker_model: None,
            reflection: None,
            repository_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Read-only mapping from worktree to repository, used for auto-placement.
pub trait WorktreeLookup {
    fn repository_for(&self, worktree_id: &str) -> Option<String>;
}

impl WorktreeLookup for HashMap<String, String> {
    fn repository_for(&self, worktree_id: &str) -> Option<String> {
        self.get(worktree_id).cloned()
    }
}

/// A live session as reconciliation sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlacement {
    pub session: String,
    pub worktree_id: Option<String>,
}

impl SessionPlacement {
    pub fn new(session: &str, worktree_id: Option<&str>) -> Self {
        Self {
            session: session.to_string(),
            worktree_id: worktree_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub members: Vec<Member>,
}

impl Organization {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a group. Any mode other than broadcast makes it multi-agent.
    pub fn create_group(&mut self, name: &str, mode: GroupMode, is_multi_agent: bool) -> GroupId {
        let group = Group::new(name, mode, is_multi_agent || mode != GroupMode::Broadcast);
        let id = group.id;
        plog!("Group created: name={} id={} mode={}", name, id.short(), mode);
        self.groups.push(group);
        id
    }

    /// Remove a group together with its membership records.
    pub fn delete_group(&mut self, id: GroupId) -> Result<Group> {
        let idx = self
            .groups
            .iter()
            .position(|g| g.id == id)
            .ok_or_else(|| Error::GroupNotFound(id.to_string()))?;
        self.members.retain(|m| m.group_id != id);
        let group = self.groups.remove(idx);
        plog!("Group deleted: name={} id={}", group.name, id.short());
        Ok(group)
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn group_mut(&mut self, id: GroupId) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    pub fn group_by_name(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    fn require_group(&self, id: GroupId) -> Result<&Group> {
        self.group(id)
            .ok_or_else(|| Error::GroupNotFound(id.to_string()))
    }

    fn require_group_mut(&mut self, id: GroupId) -> Result<&mut Group> {
        self.group_mut(id)
            .ok_or_else(|| Error::GroupNotFound(id.to_string()))
    }

    pub fn member(&self, session: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.session == session)
    }

    fn member_mut(&mut self, session: &str) -> Result<&mut Member> {
        self.members
            .iter_mut()
            .find(|m| m.session == session)
            .ok_or_else(|| Error::MemberNotFound(session.to_string()))
    }

    /// Members of a group, in the order they joined.
    pub fn members_of(&self, id: GroupId) -> Vec<&Member> {
        self.members.iter().filter(|m| m.group_id == id).collect()
    }

    pub fn workers_of(&self, id: GroupId) -> Vec<&Member> {
        self.members
            .iter()
            .filter(|m| m.group_id == id && !m.is_orchestrator())
            .collect()
    }

    pub fn orchestrator_of(&self, id: GroupId) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.group_id == id && m.is_orchestrator())
    }

    /// Put `session` in the group, moving it out of any other group.
    pub fn add_member(&mut self, id: GroupId, session: &str, role: MemberRole) -> Result<()> {
        self.require_group(id)?;
        crate::session::validate_session_name(session)?;

        // A move keeps the member's model and persona
        match self.members.iter_mut().find(|m| m.session == session) {
            Some(member) => {
                member.group_id = id;
                member.role = MemberRole::Worker;
            }
            None => self.members.push(Member::new(session, id, MemberRole::Worker)),
        }
        if role == MemberRole::Orchestrator {
            self.promote_orchestrator(id, session)?;
        }
        plog_debug!("Member added: session={} group={} role={:?}", session, id.short(), role);
        Ok(())
    }

    pub fn remove_member(&mut self, session: &str) -> Result<Member> {
        let idx = self
            .members
            .iter()
            .position(|m| m.session == session)
            .ok_or_else(|| Error::MemberNotFound(session.to_string()))?;
        Ok(self.members.remove(idx))
    }

    /// Make `session` the group's orchestrator, demoting the previous one.
    /// Returns the demoted member's session name.
    pub fn promote_orchestrator(&mut self, id: GroupId, session: &str) -> Result<Option<String>> {
        self.require_group(id)?;
        match self.member(session) {
            Some(m) if m.group_id == id => {}
            _ => return Err(Error::MemberNotFound(session.to_string())),
        }

        let mut demoted = None;
        for member in self.members.iter_mut().filter(|m| m.group_id == id) {
            if member.session == session {
                member.role = MemberRole::Orchestrator;
            } else if member.is_orchestrator() {
                member.role = MemberRole::Worker;
                demoted = Some(member.session.clone());
            }
        }
        if let Some(previous) = &demoted {
            plog!("Orchestrator of {} changed: {} -> {}", id.short(), previous, session);
        }
        Ok(demoted)
    }

    pub fn set_mode(&mut self, id: GroupId, mode: GroupMode) -> Result<()> {
        let group = self.require_group_mut(id)?;
        group.mode = mode;
        if mode != GroupMode::Broadcast {
            group.is_multi_agent = true;
        }
        Ok(())
    }

    pub fn set_persona(&mut self, session: &str, persona: Option<&str>) -> Result<()> {
        self.member_mut(session)?.persona = persona.map(str::to_string);
        Ok(())
    }

    pub fn set_preferred_model(&mut self, session: &str, model: Option<&str>) -> Result<()> {
        self.member_mut(session)?.preferred_model = model.map(str::to_string);
        Ok(())
    }

    pub fn set_reflection(&mut self, id: GroupId, cycle: Option<ReflectionCycle>) -> Result<()> {
        self.require_group_mut(id)?.reflection = cycle;
        Ok(())
    }

    /// Sessions that belong to a multi-agent group.
    pub fn multi_agent_sessions(&self) -> HashSet<String> {
        let multi: HashSet<GroupId> = self
            .groups
            .iter()
            .filter(|g| g.is_multi_agent)
            .map(|g| g.id)
            .collect();
        self.members
            .iter()
            .filter(|m| multi.contains(&m.group_id))
            .map(|m| m.session.clone())
            .collect()
    }

    /// Bring membership in line with the live sessions.
    ///
    /// Drops members whose session is gone, and places ungrouped sessions
    /// into one group per repository. Members of user-created groups, members
    /// with multi-agent provenance, and members inside a multi-agent group are
    /// left where they are. Returns a description of every change made.
    pub fn reconcile(
        &mut self,
        sessions: &[SessionPlacement],
        lookup: &dyn WorktreeLookup,
    ) -> Vec<String> {
        let mut changes = Vec::new();

        let live: HashSet<&str> = sessions.iter().map(|s| s.session.as_str()).collect();
        let before = self.members.len();
        self.members.retain(|m| {
            let keep = live.contains(m.session.as_str());
            if !keep {
                changes.push(format!("Removed member '{}': session no longer exists", m.session));
            }
            keep
        });
        if self.members.len() != before {
            plog_debug!("reconcile: dropped {} stale members", before - self.members.len());
        }

        let multi_agent_groups: HashSet<GroupId> = self
            .groups
            .iter()
            .filter(|g| g.is_multi_agent)
            .map(|g| g.id)
            .collect();

        let repository_groups: HashSet<GroupId> = self
            .groups
            .iter()
            .filter(|g| g.repository_id.is_some())
            .map(|g| g.id)
            .collect();
        let all_groups: HashSet<GroupId> = self.groups.iter().map(|g| g.id).collect();

        for placement in sessions {
            if let Some(member) = self.member(&placement.session) {
                if member.has_multi_agent_provenance()
                    || multi_agent_groups.contains(&member.group_id)
                {
                    continue;
                }
                // Only ungrouped sessions and repository groups are managed here
                if all_groups.contains(&member.group_id)
                    && !repository_groups.contains(&member.group_id)
                {
                    continue;
                }
            }

            let Some(repository) = placement
                .worktree_id
                .as_deref()
                .and_then(|wt| lookup.repository_for(wt))
            else {
                continue;
            };

            let target = self.repository_group(&repository);
            let current = self.member(&placement.session).map(|m| m.group_id);
            if current == Some(target) {
                continue;
            }

            match self.members.iter_mut().find(|m| m.session == placement.session) {
                Some(member) => member.group_id = target,
                None => self
                    .members
                    .push(Member::new(&placement.session, target, MemberRole::Worker)),
            }
            changes.push(format!(
                "Placed '{}' in repository group '{}'",
                placement.session, repository
            ));
        }

        // Repository groups emptied by the moves above
        let occupied: HashSet<GroupId> = self.members.iter().map(|m| m.group_id).collect();
        self.groups.retain(|g| {
            let empty_auto = g.repository_id.is_some() && !g.is_multi_agent && !occupied.contains(&g.id);
            if empty_auto {
                changes.push(format!("Removed empty repository group '{}'", g.name));
            }
            !empty_auto
        });

        if !changes.is_empty() {
            plog!("Organization reconciled: {} change(s)", changes.len());
        }
        changes
    }

    fn repository_group(&mut self, repository: &str) -> GroupId {
        if let Some(group) = self
            .groups
            .iter()
            .find(|g| !g.is_multi_agent && g.repository_id.as_deref() == Some(repository))
        {
            return group.id;
        }
        let name = repository
            .rsplit(['/', '\\'])
            .find(|s| !s.is_empty())
            .unwrap_or(repository);
        let mut group = Group::new(name, GroupMode::Broadcast, false);
        group.repository_id = Some(repository.to_string());
        let id = group.id;
        self.groups.push(group);
        id
    }
}

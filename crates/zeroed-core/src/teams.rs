use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::api::ApiError;
use crate::datastore::{DataStore, Record, random_hex};
use crate::task::Task;
use crate::tasks::{TaskDraft, create_task};

pub const INVITATION_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    View,
    EditTasks,
    ManageMembers,
    DeleteTeam,
}

impl TeamRole {
    fn rank(self) -> u8 {
        match self {
            TeamRole::Owner => 3,
            TeamRole::Admin => 2,
            TeamRole::Member => 1,
            TeamRole::Viewer => 0,
        }
    }

    pub fn allows(self, permission: Permission) -> bool {
        let needed = match permission {
            Permission::View => TeamRole::Viewer,
            Permission::EditTasks => TeamRole::Member,
            Permission::ManageMembers => TeamRole::Admin,
            Permission::DeleteTeam => TeamRole::Owner,
        };
        self.rank() >= needed.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TeamRole::Owner => "owner",
            TeamRole::Admin => "admin",
            TeamRole::Member => "member",
            TeamRole::Viewer => "viewer",
        }
    }
}

impl FromStr for TeamRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Ok(TeamRole::Owner),
            "admin" => Ok(TeamRole::Admin),
            "member" => Ok(TeamRole::Member),
            "viewer" => Ok(TeamRole::Viewer),
            other => Err(anyhow!("unknown team role: {other}")),
        }
    }
}

impl fmt::Display for TeamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Record for Team {
    const FILE: &'static str = "teams.data";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamMember {
    pub id: Uuid,
    pub team_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    pub role: TeamRole,
    pub joined_at: DateTime<Utc>,
}

impl Record for TeamMember {
    const FILE: &'static str = "team_members.data";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamInvitation {
    pub id: Uuid,
    pub team_id: Uuid,
    pub email: String,
    pub role: TeamRole,
    pub token: String,
    pub invited_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
}

impl Record for TeamInvitation {
    const FILE: &'static str = "invitations.data";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

impl Record for Project {
    const FILE: &'static str = "projects.data";
}

fn membership(members: &[TeamMember], team_id: Uuid, user_id: Uuid) -> Option<&TeamMember> {
    members
        .iter()
        .find(|m| m.team_id == team_id && m.user_id == user_id)
}

/// The caller's membership, provided their role grants `permission`.
pub fn require_permission(
    store: &DataStore,
    team_id: Uuid,
    user_id: Uuid,
    permission: Permission,
) -> anyhow::Result<TeamMember> {
    let members = store.load::<TeamMember>()?;
    let member = membership(&members, team_id, user_id)
        .ok_or_else(|| ApiError::NotFound("team not found".to_string()))?;
    if !member.role.allows(permission) {
        return Err(ApiError::Forbidden(format!(
            "{} role cannot do this",
            member.role
        ))
        .into());
    }
    Ok(member.clone())
}

#[instrument(skip(store, now))]
pub fn create_team(
    store: &DataStore,
    user_id: Uuid,
    email: Option<String>,
    name: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Team> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("team name cannot be empty".to_string()).into());
    }
    let team = Team {
        id: Uuid::new_v4(),
        name: name.to_string(),
        created_by: user_id,
        created_at: now,
    };
    store.update(|teams: &mut Vec<Team>| {
        teams.push(team.clone());
        Ok(())
    })?;
    store.update(|members: &mut Vec<TeamMember>| {
        members.push(TeamMember {
            id: Uuid::new_v4(),
            team_id: team.id,
            user_id,
            email,
            role: TeamRole::Owner,
            joined_at: now,
        });
        Ok(())
    })?;
    info!(team = %team.name, "created team");
    Ok(team)
}

/// Teams the user belongs to, paired with their role.
pub fn teams_for_user(store: &DataStore, user_id: Uuid) -> anyhow::Result<Vec<(Team, TeamRole)>> {
    let members = store.load::<TeamMember>()?;
    Ok(store
        .load::<Team>()?
        .into_iter()
        .filter_map(|team| {
            let role = membership(&members, team.id, user_id)?.role;
            Some((team, role))
        })
        .collect())
}

/// Resolves a team the user belongs to by name or id prefix.
pub fn find_team(store: &DataStore, user_id: Uuid, selector: &str) -> anyhow::Result<Team> {
    let selector = selector.trim();
    let needle = selector.replace('-', "").to_ascii_lowercase();
    teams_for_user(store, user_id)?
        .into_iter()
        .map(|(team, _)| team)
        .find(|team| {
            team.name.eq_ignore_ascii_case(selector)
                || (needle.len() >= 4 && team.id.simple().to_string().starts_with(&needle))
        })
        .ok_or_else(|| ApiError::NotFound(format!("no team matches {selector}")).into())
}

pub fn team_members(
    store: &DataStore,
    team_id: Uuid,
    user_id: Uuid,
) -> anyhow::Result<Vec<TeamMember>> {
    require_permission(store, team_id, user_id, Permission::View)?;
    let mut members: Vec<TeamMember> = store
        .load::<TeamMember>()?
        .into_iter()
        .filter(|m| m.team_id == team_id)
        .collect();
    members.sort_by_key(|m| (std::cmp::Reverse(m.role.rank()), m.joined_at));
    Ok(members)
}

/// Creates an invitation valid for seven days; ownership cannot be invited.
#[instrument(skip(store, now))]
pub fn invite_member(
    store: &DataStore,
    team_id: Uuid,
    inviter: Uuid,
    email: &str,
    role: TeamRole,
    now: DateTime<Utc>,
) -> anyhow::Result<TeamInvitation> {
    require_permission(store, team_id, inviter, Permission::ManageMembers)?;
    if role == TeamRole::Owner {
        return Err(ApiError::BadRequest("the owner role cannot be granted by invitation".to_string()).into());
    }
    let email = email.trim().to_ascii_lowercase();
    if !email.contains('@') {
        return Err(ApiError::BadRequest(format!("invalid e-mail address: {email}")).into());
    }
    if store.load::<TeamMember>()?.iter().any(|m| {
        m.team_id == team_id
            && m.email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(&email))
    }) {
        return Err(ApiError::Conflict(format!("{email} is already a member")).into());
    }

    let invitation = TeamInvitation {
        id: Uuid::new_v4(),
        team_id,
        email,
        role,
        token: random_hex(24),
        invited_by: inviter,
        created_at: now,
        expires_at: now + Duration::days(INVITATION_TTL_DAYS),
        accepted_at: None,
    };
    store.update(|invitations: &mut Vec<TeamInvitation>| {
        invitations.retain(|inv| {
            !(inv.team_id == team_id && inv.accepted_at.is_none() && inv.email == invitation.email)
        });
        invitations.push(invitation.clone());
        Ok(())
    })?;
    info!(email = %invitation.email, role = %role, "invited team member");
    Ok(invitation)
}

#[instrument(skip(store, token, now))]
pub fn accept_invitation(
    store: &DataStore,
    token: &str,
    user_id: Uuid,
    email: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<TeamMember> {
    let invitation = store.update(|invitations: &mut Vec<TeamInvitation>| {
        let invitation = invitations
            .iter_mut()
            .find(|inv| inv.token == token.trim())
            .ok_or_else(|| ApiError::NotFound("invitation not found".to_string()))?;
        if invitation.accepted_at.is_some() {
            return Err(ApiError::Conflict("invitation was already accepted".to_string()).into());
        }
        if now >= invitation.expires_at {
            return Err(ApiError::BadRequest("invitation has expired".to_string()).into());
        }
        if !invitation.email.eq_ignore_ascii_case(email.trim()) {
            warn!(invited = %invitation.email, "invitation e-mail mismatch");
            return Err(ApiError::Forbidden(
                "invitation was sent to a different e-mail address".to_string(),
            )
            .into());
        }
        invitation.accepted_at = Some(now);
        Ok(invitation.clone())
    })?;

    let member = store.update(|members: &mut Vec<TeamMember>| {
        if membership(members, invitation.team_id, user_id).is_some() {
            return Err(ApiError::Conflict("already a member of this team".to_string()).into());
        }
        let member = TeamMember {
            id: Uuid::new_v4(),
            team_id: invitation.team_id,
            user_id,
            email: Some(invitation.email.clone()),
            role: invitation.role,
            joined_at: now,
        };
        members.push(member.clone());
        Ok(member)
    });
    if member.is_err() {
        // Leave the invitation usable when membership could not be written.
        store.update(|invitations: &mut Vec<TeamInvitation>| {
            if let Some(inv) = invitations.iter_mut().find(|inv| inv.id == invitation.id) {
                inv.accepted_at = None;
            }
            Ok(())
        })?;
    }
    let member = member?;
    info!(team = %member.team_id, role = %member.role, "joined team");
    Ok(member)
}

fn owner_count(members: &[TeamMember], team_id: Uuid) -> usize {
    members
        .iter()
        .filter(|m| m.team_id == team_id && m.role == TeamRole::Owner)
        .count()
}

/// Admins remove others; anyone may leave. The last owner stays.
#[instrument(skip(store))]
pub fn remove_member(
    store: &DataStore,
    team_id: Uuid,
    actor: Uuid,
    target: Uuid,
) -> anyhow::Result<TeamMember> {
    let acting_role = if actor == target {
        None
    } else {
        Some(require_permission(store, team_id, actor, Permission::ManageMembers)?.role)
    };
    store.update(|members: &mut Vec<TeamMember>| {
        let idx = members
            .iter()
            .position(|m| m.team_id == team_id && m.user_id == target)
            .ok_or_else(|| ApiError::NotFound("member not found".to_string()))?;
        let removes_other_owner = members[idx].role == TeamRole::Owner
            && acting_role.is_some_and(|role| role != TeamRole::Owner);
        if removes_other_owner {
            return Err(ApiError::Forbidden("only owners can remove an owner".to_string()).into());
        }
        if members[idx].role == TeamRole::Owner && owner_count(members, team_id) == 1 {
            return Err(ApiError::Conflict("cannot remove the last owner".to_string()).into());
        }
        Ok(members.remove(idx))
    })
}

/// Only owners hand out or take away ownership.
#[instrument(skip(store))]
pub fn change_role(
    store: &DataStore,
    team_id: Uuid,
    actor: Uuid,
    target: Uuid,
    role: TeamRole,
) -> anyhow::Result<TeamMember> {
    let acting = require_permission(store, team_id, actor, Permission::ManageMembers)?;
    store.update(|members: &mut Vec<TeamMember>| {
        let owners = owner_count(members, team_id);
        let member = members
            .iter_mut()
            .find(|m| m.team_id == team_id && m.user_id == target)
            .ok_or_else(|| ApiError::NotFound("member not found".to_string()))?;
        let touches_owner = role == TeamRole::Owner || member.role == TeamRole::Owner;
        if touches_owner && acting.role != TeamRole::Owner {
            return Err(ApiError::Forbidden("only owners can change ownership".to_string()).into());
        }
        if member.role == TeamRole::Owner && role != TeamRole::Owner && owners == 1 {
            return Err(ApiError::Conflict("cannot demote the last owner".to_string()).into());
        }
        member.role = role;
        Ok(member.clone())
    })
}

/// Drops the team with its members, invitations, projects and tasks.
#[instrument(skip(store))]
pub fn delete_team(store: &DataStore, team_id: Uuid, actor: Uuid) -> anyhow::Result<()> {
    require_permission(store, team_id, actor, Permission::DeleteTeam)?;
    store.update(|rows: &mut Vec<Task>| {
        rows.retain(|t| t.team_id != Some(team_id));
        Ok(())
    })?;
    store.update(|rows: &mut Vec<Project>| {
        rows.retain(|p| p.team_id != team_id);
        Ok(())
    })?;
    store.update(|rows: &mut Vec<TeamInvitation>| {
        rows.retain(|i| i.team_id != team_id);
        Ok(())
    })?;
    store.update(|rows: &mut Vec<TeamMember>| {
        rows.retain(|m| m.team_id != team_id);
        Ok(())
    })?;
    store.update(|rows: &mut Vec<Team>| {
        rows.retain(|t| t.id != team_id);
        Ok(())
    })?;
    info!(team = %team_id, "deleted team");
    Ok(())
}

pub fn create_project(
    store: &DataStore,
    team_id: Uuid,
    actor: Uuid,
    name: &str,
    description: Option<String>,
    now: DateTime<Utc>,
) -> anyhow::Result<Project> {
    require_permission(store, team_id, actor, Permission::EditTasks)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("project name cannot be empty".to_string()).into());
    }
    store.update(|projects: &mut Vec<Project>| {
        if projects
            .iter()
            .any(|p| p.team_id == team_id && !p.archived && p.name.eq_ignore_ascii_case(name))
        {
            return Err(ApiError::Conflict(format!("project {name} already exists")).into());
        }
        let project = Project {
            id: Uuid::new_v4(),
            team_id,
            name: name.to_string(),
            description,
            archived: false,
            created_at: now,
        };
        projects.push(project.clone());
        Ok(project)
    })
}

/// A task shared with the team; the assignee must be a member.
pub fn create_team_task(
    store: &DataStore,
    team_id: Uuid,
    actor: Uuid,
    mut draft: TaskDraft,
    now: DateTime<Utc>,
) -> anyhow::Result<Task> {
    require_permission(store, team_id, actor, Permission::EditTasks)?;
    if let Some(assignee) = draft.assignee_id
        && membership(&store.load::<TeamMember>()?, team_id, assignee).is_none()
    {
        return Err(ApiError::BadRequest("assignee is not a team member".to_string()).into());
    }
    if let Some(project_id) = draft.project_id
        && !store
            .load::<Project>()?
            .iter()
            .any(|p| p.id == project_id && p.team_id == team_id)
    {
        return Err(ApiError::NotFound("project not found".to_string()).into());
    }
    draft.team_id = Some(team_id);
    create_task(store, actor, draft, None, now)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    use super::{
        Permission, TeamRole, accept_invitation, change_role, create_project, create_team,
        create_team_task, delete_team, invite_member, remove_member, team_members,
    };
    use crate::api::ApiError;
    use crate::datastore::DataStore;
    use crate::task::Task;
    use crate::tasks::TaskDraft;

    fn status(err: &anyhow::Error) -> u16 {
        err.downcast_ref::<ApiError>().map_or(500, ApiError::status)
    }

    #[test]
    fn role_permissions() {
        assert!(TeamRole::Viewer.allows(Permission::View));
        assert!(!TeamRole::Viewer.allows(Permission::EditTasks));
        assert!(TeamRole::Member.allows(Permission::EditTasks));
        assert!(!TeamRole::Member.allows(Permission::ManageMembers));
        assert!(TeamRole::Admin.allows(Permission::ManageMembers));
        assert!(!TeamRole::Admin.allows(Permission::DeleteTeam));
        assert!(TeamRole::Owner.allows(Permission::DeleteTeam));
    }

    #[test]
    fn invitation_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let now = Utc
            .with_ymd_and_hms(2026, 10, 18, 9, 0, 0)
            .single()
            .expect("valid now");
        let owner = Uuid::new_v4();
        let guest = Uuid::new_v4();
        let team = create_team(&store, owner, Some("o@x.test".into()), "Core", now).expect("team");

        let err = invite_member(&store, team.id, owner, "g@x.test", TeamRole::Owner, now)
            .expect_err("owner invite");
        assert_eq!(status(&err), 400);

        let invite = invite_member(&store, team.id, owner, "G@x.test", TeamRole::Member, now)
            .expect("invite");
        assert_eq!(invite.expires_at, now + Duration::days(7));

        let err = accept_invitation(&store, &invite.token, guest, "other@x.test", now)
            .expect_err("wrong email");
        assert_eq!(status(&err), 403);
        let late = now + Duration::days(8);
        let err = accept_invitation(&store, &invite.token, guest, "g@x.test", late)
            .expect_err("expired");
        assert_eq!(status(&err), 400);

        let member = accept_invitation(&store, &invite.token, guest, "g@X.test", now)
            .expect("accept");
        assert_eq!(member.role, TeamRole::Member);
        let err = accept_invitation(&store, &invite.token, guest, "g@x.test", now)
            .expect_err("reused");
        assert_eq!(status(&err), 409);

        let err = invite_member(&store, team.id, guest, "h@x.test", TeamRole::Viewer, now)
            .expect_err("member cannot invite");
        assert_eq!(status(&err), 403);
        assert_eq!(team_members(&store, team.id, guest).expect("members").len(), 2);
    }

    #[test]
    fn last_owner_is_protected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let admin = Uuid::new_v4();
        let team = create_team(&store, owner, None, "Ops", now).expect("team");
        let invite = invite_member(&store, team.id, owner, "a@x.test", TeamRole::Admin, now)
            .expect("invite");
        accept_invitation(&store, &invite.token, admin, "a@x.test", now).expect("accept");

        let err = remove_member(&store, team.id, owner, owner).expect_err("last owner");
        assert_eq!(status(&err), 409);
        let err = change_role(&store, team.id, admin, admin, TeamRole::Owner)
            .expect_err("admin self-promotion");
        assert_eq!(status(&err), 403);

        change_role(&store, team.id, owner, admin, TeamRole::Owner).expect("promote");
        remove_member(&store, team.id, owner, owner).expect("leave");
        let err = delete_team(&store, team.id, owner).expect_err("gone");
        assert_eq!(status(&err), 404);
    }

    #[test]
    fn admins_cannot_remove_owners() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let now = Utc::now();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let admin = Uuid::new_v4();
        let team = create_team(&store, first, None, "Ops", now).expect("team");
        for (user, email) in [(second, "o2@x.test"), (admin, "a@x.test")] {
            let invite = invite_member(&store, team.id, first, email, TeamRole::Admin, now)
                .expect("invite");
            accept_invitation(&store, &invite.token, user, email, now).expect("accept");
        }
        change_role(&store, team.id, first, second, TeamRole::Owner).expect("promote");

        let err = remove_member(&store, team.id, admin, first).expect_err("admin removes owner");
        assert_eq!(status(&err), 403);

        let removed = remove_member(&store, team.id, second, first).expect("owner removes owner");
        assert_eq!(removed.user_id, first);
    }

    #[test]
    fn team_tasks_and_cleanup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let team = create_team(&store, owner, None, "Launch", now).expect("team");
        let project = create_project(&store, team.id, owner, "Website", None, now).expect("project");

        let draft = TaskDraft {
            title: "Write copy".to_string(),
            project_id: Some(project.id),
            assignee_id: Some(Uuid::new_v4()),
            ..TaskDraft::default()
        };
        assert!(create_team_task(&store, team.id, owner, draft.clone(), now).is_err());

        let draft = TaskDraft {
            assignee_id: Some(owner),
            ..draft
        };
        let task = create_team_task(&store, team.id, owner, draft, now).expect("task");
        assert_eq!(task.team_id, Some(team.id));

        delete_team(&store, team.id, owner).expect("delete");
        assert!(store.load::<Task>().expect("tasks").is_empty());
    }
}

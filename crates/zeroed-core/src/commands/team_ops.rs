use anyhow::anyhow;
use tracing::{info, instrument};
use uuid::Uuid;

use super::Ctx;
use crate::cli::TeamCommand;
use crate::quick_add::parse_quick_add;
use crate::settings::SettingKey;
use crate::tasks::TaskDraft;
use crate::teams::{
    Project, accept_invitation, change_role, create_project, create_team, create_team_task,
    delete_team, find_team, invite_member, remove_member, team_members, teams_for_user,
};
use crate::webhook::WebhookEvent;

/// Matches a member by e-mail or user id.
fn member_id(ctx: &Ctx<'_>, team_id: Uuid, selector: &str) -> anyhow::Result<Uuid> {
    let selector = selector.trim();
    team_members(ctx.store, team_id, ctx.user_id())?
        .into_iter()
        .find(|m| {
            m.user_id.to_string() == selector
                || m.email
                    .as_deref()
                    .is_some_and(|email| email.eq_ignore_ascii_case(selector))
        })
        .map(|m| m.user_id)
        .ok_or_else(|| anyhow!("no member {selector} in this team"))
}

#[instrument(skip(ctx))]
pub(super) fn cmd_team(ctx: &mut Ctx<'_>, sub: TeamCommand) -> anyhow::Result<()> {
    match sub {
        TeamCommand::Create { name } => {
            info!("command team create");
            let team = create_team(
                ctx.store,
                ctx.user_id(),
                ctx.profile.email.clone(),
                &name,
                ctx.now,
            )?;
            println!("Created team '{}'.", team.name);
        }
        TeamCommand::Invite { team, email, role } => {
            info!("command team invite");
            let team = find_team(ctx.store, ctx.user_id(), &team)?;
            let invitation = invite_member(ctx.store, team.id, ctx.user_id(), &email, role, ctx.now)?;
            println!(
                "Invited {} to '{}' as {}; token {} expires {}.",
                invitation.email,
                team.name,
                invitation.role,
                invitation.token,
                invitation.expires_at.format("%Y-%m-%d")
            );
        }
        TeamCommand::Accept { token, email } => {
            info!("command team accept");
            ctx.require_enabled(SettingKey::SignupsEnabled)?;
            let email = email
                .or_else(|| ctx.profile.email.clone())
                .ok_or_else(|| anyhow!("no e-mail on the profile; pass --email"))?;
            let member = accept_invitation(ctx.store, &token, ctx.user_id(), &email, ctx.now)?;
            println!("Joined team as {}.", member.role);
        }
        TeamCommand::List => {
            let rows = teams_for_user(ctx.store, ctx.user_id())?
                .into_iter()
                .map(|(team, role)| vec![team.name, role.to_string()])
                .collect();
            ctx.renderer.print_table(&["Team", "Role"], rows)?;
        }
        TeamCommand::Members { team } => {
            let team = find_team(ctx.store, ctx.user_id(), &team)?;
            let rows = team_members(ctx.store, team.id, ctx.user_id())?
                .into_iter()
                .map(|m| {
                    vec![
                        m.email.unwrap_or_else(|| m.user_id.to_string()),
                        m.role.to_string(),
                        m.joined_at.format("%Y-%m-%d").to_string(),
                    ]
                })
                .collect();
            ctx.renderer.print_table(&["Member", "Role", "Joined"], rows)?;
        }
        TeamCommand::Remove { team, member } => {
            info!("command team remove");
            let team = find_team(ctx.store, ctx.user_id(), &team)?;
            let target = member_id(ctx, team.id, &member)?;
            remove_member(ctx.store, team.id, ctx.user_id(), target)?;
            println!("Removed {member} from '{}'.", team.name);
        }
        TeamCommand::Role { team, member, role } => {
            info!("command team role");
            let team = find_team(ctx.store, ctx.user_id(), &team)?;
            let target = member_id(ctx, team.id, &member)?;
            let updated = change_role(ctx.store, team.id, ctx.user_id(), target, role)?;
            println!("{member} is now {} in '{}'.", updated.role, team.name);
        }
        TeamCommand::Delete { team } => {
            info!("command team delete");
            let team = find_team(ctx.store, ctx.user_id(), &team)?;
            delete_team(ctx.store, team.id, ctx.user_id())?;
            println!("Deleted team '{}'.", team.name);
        }
        TeamCommand::Project {
            team,
            name,
            description,
        } => {
            info!("command team project");
            let team = find_team(ctx.store, ctx.user_id(), &team)?;
            let project = create_project(ctx.store, team.id, ctx.user_id(), &name, description, ctx.now)?;
            println!("Created project '{}' in '{}'.", project.name, team.name);
        }
        TeamCommand::Task {
            team,
            text,
            assign,
            project,
        } => {
            info!("command team task");
            let team = find_team(ctx.store, ctx.user_id(), &team)?;
            let mut draft = TaskDraft::from(parse_quick_add(&text.join(" "), ctx.now));
            draft.list_name = None;
            if let Some(selector) = assign.as_deref() {
                draft.assignee_id = Some(member_id(ctx, team.id, selector)?);
            }
            if let Some(name) = project.as_deref() {
                let found = ctx
                    .store
                    .load::<Project>()?
                    .into_iter()
                    .find(|p| p.team_id == team.id && !p.archived && p.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| anyhow!("no project named {name} in '{}'", team.name))?;
                draft.project_id = Some(found.id);
            }
            let task = create_team_task(ctx.store, team.id, ctx.user_id(), draft, ctx.now)?;
            println!("Created task {} in '{}'.", task.number, team.name);
            ctx.emit(WebhookEvent::TaskCreated, &task);
        }
    }
    Ok(())
}


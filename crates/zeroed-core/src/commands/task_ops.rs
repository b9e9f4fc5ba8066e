use std::collections::HashSet;

use anyhow::anyhow;
use serde_json::json;
use tracing::{info, instrument};

use super::{Ctx, read_stdin};
use crate::ai::{CompletionClient, brain_dump, break_down_task};
use crate::cli::{ListArgs, ListsCommand, ModifyArgs};
use crate::datetime::parse_clock_time;
use crate::filter::build_query;
use crate::quick_add::parse_quick_add;
use crate::task::{Priority, Task, TaskStatus};
use crate::tasks::{
    TaskDraft, TaskPatch, add_subtask, archive_list, complete_task, create_list, create_task,
    delete_task, find_task_index, lists_for_user, move_task, reopen_task, set_status,
    tasks_for_user, update_task,
};
use crate::webhook::WebhookEvent;

#[instrument(skip(ctx, text, notes))]
pub(super) fn cmd_add(
    ctx: &mut Ctx<'_>,
    text: &[String],
    list: Option<String>,
    notes: Option<String>,
) -> anyhow::Result<()> {
    info!("command add");
    let parsed = parse_quick_add(&text.join(" "), ctx.now);
    let mut draft = TaskDraft::from(parsed);
    if list.is_some() {
        draft.list_name = list;
    }
    draft.notes = notes;

    let default_list = ctx.default_list();
    let task = create_task(ctx.store, ctx.user_id(), draft, default_list.as_deref(), ctx.now)?;
    println!("Created task {}.", task.number);
    ctx.emit(WebhookEvent::TaskCreated, &task);
    Ok(())
}

/// Subtasks directly under their parent when both are shown.
fn nest(tasks: Vec<&Task>) -> Vec<Task> {
    let shown: HashSet<_> = tasks.iter().map(|t| t.id).collect();
    let mut out = Vec::with_capacity(tasks.len());
    for root in tasks
        .iter()
        .filter(|t| t.parent_id.is_none_or(|p| !shown.contains(&p)))
    {
        out.push((*root).clone());
        let mut children: Vec<&Task> = tasks
            .iter()
            .copied()
            .filter(|t| t.parent_id == Some(root.id))
            .collect();
        children.sort_by_key(|t| (t.position, t.number));
        out.extend(children.into_iter().cloned());
    }
    out
}

#[instrument(skip(ctx))]
pub(super) fn cmd_list(ctx: &mut Ctx<'_>, args: ListArgs) -> anyhow::Result<()> {
    info!("command list");
    let tasks = tasks_for_user(ctx.store, ctx.user_id())?;
    let lists = lists_for_user(ctx.store, ctx.user_id())?;
    let today = ctx.today();

    let list_id = match args.list.as_deref() {
        Some(name) => Some(
            lists
                .iter()
                .find(|l| l.name.eq_ignore_ascii_case(name))
                .map(|l| l.id)
                .ok_or_else(|| anyhow!("no list named {name}"))?,
        ),
        None => None,
    };

    let query = build_query(&args.conditions, args.sort, today, ctx.week_start)?;
    let matched: Vec<&Task> = query
        .run(&tasks)
        .into_iter()
        .filter(|t| args.all || t.is_open())
        .filter(|t| !args.today || t.is_overdue(today) || t.is_due_on(today))
        .filter(|t| list_id.is_none_or(|id| t.list_id == Some(id)))
        .collect();

    let shown: Vec<Task> = if args.sort.is_some() {
        matched.into_iter().cloned().collect()
    } else {
        nest(matched)
    };
    ctx.renderer.print_task_table(&shown, &lists, today)
}

#[instrument(skip(ctx))]
pub(super) fn cmd_info(ctx: &mut Ctx<'_>, selector: &str) -> anyhow::Result<()> {
    let tasks = tasks_for_user(ctx.store, ctx.user_id())?;
    let lists = lists_for_user(ctx.store, ctx.user_id())?;
    let task = &tasks[find_task_index(&tasks, ctx.user_id(), selector)?];
    let mut subtasks: Vec<Task> = tasks
        .iter()
        .filter(|t| t.parent_id == Some(task.id))
        .cloned()
        .collect();
    subtasks.sort_by_key(|t| (t.position, t.number));
    ctx.renderer.print_task_info(task, &lists, &subtasks)
}

#[instrument(skip(ctx))]
pub(super) fn cmd_modify(ctx: &mut Ctx<'_>, args: ModifyArgs) -> anyhow::Result<()> {
    info!("command modify");
    let due_date = args
        .due
        .as_deref()
        .map(|token| ctx.parse_date(token))
        .transpose()?;
    let due_time = args
        .at
        .as_deref()
        .map(|token| parse_clock_time(token).ok_or_else(|| anyhow!("invalid time: {token}")))
        .transpose()?;

    let patch = TaskPatch {
        title: args.title,
        notes: args.notes,
        priority: args.priority,
        due_date,
        due_time,
        clear_due: args.clear_due,
        estimated_minutes: args.estimate,
        add_tags: args.add_tags,
        remove_tags: args.remove_tags,
        list_name: args.list,
        ..TaskPatch::default()
    };

    let task = update_task(ctx.store, ctx.user_id(), &args.task, patch, ctx.now)?;
    println!("Modified task {}.", task.number);
    ctx.emit(WebhookEvent::TaskUpdated, &task);
    Ok(())
}

#[instrument(skip(ctx))]
pub(super) fn cmd_done(ctx: &mut Ctx<'_>, selectors: &[String]) -> anyhow::Result<()> {
    info!("command done");
    for selector in selectors {
        let task = complete_task(ctx.store, ctx.user_id(), selector, ctx.now)?;
        println!("Completed task {} '{}'.", task.number, task.title);
        ctx.emit(WebhookEvent::TaskCompleted, &task);
    }
    Ok(())
}

fn change_status(ctx: &mut Ctx<'_>, selector: &str, status: TaskStatus) -> anyhow::Result<()> {
    let task = set_status(ctx.store, ctx.user_id(), selector, status, ctx.now)?;
    println!("Task {} is now {}.", task.number, task.status);
    ctx.emit(WebhookEvent::TaskUpdated, &task);
    Ok(())
}

pub(super) fn cmd_start(ctx: &mut Ctx<'_>, selector: &str) -> anyhow::Result<()> {
    info!("command start");
    change_status(ctx, selector, TaskStatus::InProgress)
}

pub(super) fn cmd_cancel(ctx: &mut Ctx<'_>, selector: &str) -> anyhow::Result<()> {
    info!("command cancel");
    change_status(ctx, selector, TaskStatus::Cancelled)
}

pub(super) fn cmd_reopen(ctx: &mut Ctx<'_>, selector: &str) -> anyhow::Result<()> {
    info!("command reopen");
    let task = reopen_task(ctx.store, ctx.user_id(), selector, ctx.now)?;
    println!("Reopened task {}.", task.number);
    ctx.emit(WebhookEvent::TaskUpdated, &task);
    Ok(())
}

#[instrument(skip(ctx))]
pub(super) fn cmd_delete(ctx: &mut Ctx<'_>, selector: &str) -> anyhow::Result<()> {
    info!("command delete");
    let removed = delete_task(ctx.store, ctx.user_id(), selector)?;
    for task in &removed {
        ctx.emit(WebhookEvent::TaskDeleted, &json!({ "id": task.id, "number": task.number }));
    }
    match removed.len() {
        1 => println!("Deleted 1 task."),
        n => println!("Deleted {n} tasks."),
    }
    Ok(())
}

pub(super) fn cmd_move(ctx: &mut Ctx<'_>, selector: &str, position: usize) -> anyhow::Result<()> {
    info!("command move");
    let task = move_task(ctx.store, ctx.user_id(), selector, position, ctx.now)?;
    println!("Moved task {} to position {}.", task.number, task.position);
    ctx.emit(WebhookEvent::TaskUpdated, &task);
    Ok(())
}

#[instrument(skip(ctx, text))]
pub(super) fn cmd_subtask(ctx: &mut Ctx<'_>, parent: &str, text: &[String]) -> anyhow::Result<()> {
    info!("command subtask");
    let draft = TaskDraft::from(parse_quick_add(&text.join(" "), ctx.now));
    let task = add_subtask(ctx.store, ctx.user_id(), parent, draft, ctx.now)?;
    println!("Created subtask {}.", task.number);
    ctx.emit(WebhookEvent::TaskCreated, &task);
    Ok(())
}

pub(super) fn cmd_lists(ctx: &mut Ctx<'_>, sub: ListsCommand) -> anyhow::Result<()> {
    match sub {
        ListsCommand::Add { name } => {
            let list = create_list(ctx.store, ctx.user_id(), &name, ctx.now)?;
            println!("Created list '{}'.", list.name);
            ctx.emit(WebhookEvent::ListCreated, &list);
        }
        ListsCommand::Archive { name } => {
            let list = archive_list(ctx.store, ctx.user_id(), &name)?;
            println!("Archived list '{}'.", list.name);
        }
        ListsCommand::Show => {
            let lists = lists_for_user(ctx.store, ctx.user_id())?;
            let tasks = tasks_for_user(ctx.store, ctx.user_id())?;
            let rows = lists
                .iter()
                .filter(|l| !l.is_archived)
                .map(|l| {
                    let open = tasks
                        .iter()
                        .filter(|t| t.list_id == Some(l.id) && t.is_open())
                        .count();
                    vec![l.name.clone(), open.to_string()]
                })
                .collect();
            ctx.renderer.print_table(&["List", "Open"], rows)?;
        }
    }
    Ok(())
}

#[instrument(skip(ctx, text))]
pub(super) fn cmd_dump(ctx: &mut Ctx<'_>, text: &[String], dry_run: bool) -> anyhow::Result<()> {
    info!("command dump");
    let text = if text.is_empty() {
        read_stdin()?
    } else {
        text.join(" ")
    };
    let client = ctx.completion_client()?;
    let parsed = brain_dump(
        client.as_ref().map(|c| c as &dyn CompletionClient),
        &text,
        ctx.now,
    );

    if dry_run {
        let rows = parsed
            .iter()
            .map(|p| {
                vec![
                    p.title.clone(),
                    p.due_date.map(|d| d.to_string()).unwrap_or_default(),
                    p.priority.map(Priority::as_str).unwrap_or_default().to_string(),
                    p.list_name.clone().unwrap_or_default(),
                    p.tags.join(" "),
                ]
            })
            .collect();
        return ctx
            .renderer
            .print_table(&["Title", "Due", "Pri", "List", "Tags"], rows);
    }

    let default_list = ctx.default_list();
    let mut created = 0usize;
    for item in parsed {
        if item.title.trim().is_empty() {
            continue;
        }
        let task = create_task(
            ctx.store,
            ctx.user_id(),
            TaskDraft::from(item),
            default_list.as_deref(),
            ctx.now,
        )?;
        println!("Created task {} '{}'.", task.number, task.title);
        ctx.emit(WebhookEvent::TaskCreated, &task);
        created += 1;
    }
    if created == 0 {
        println!("No tasks found in the text.");
    }
    Ok(())
}

#[instrument(skip(ctx))]
pub(super) fn cmd_breakdown(ctx: &mut Ctx<'_>, selector: &str, apply: bool) -> anyhow::Result<()> {
    info!("command breakdown");
    let tasks = tasks_for_user(ctx.store, ctx.user_id())?;
    let task = tasks[find_task_index(&tasks, ctx.user_id(), selector)?].clone();
    let client = ctx.completion_client()?;
    let suggestions = break_down_task(
        client.as_ref().map(|c| c as &dyn CompletionClient),
        &task.title,
        task.notes.as_deref(),
    );

    if !apply {
        let rows = suggestions
            .iter()
            .enumerate()
            .map(|(idx, s)| {
                vec![
                    (idx + 1).to_string(),
                    s.title.clone(),
                    s.estimated_minutes
                        .map(|m| format!("{m}m"))
                        .unwrap_or_default(),
                ]
            })
            .collect();
        return ctx.renderer.print_table(&["#", "Subtask", "Estimate"], rows);
    }

    let parent = task.number.to_string();
    for suggestion in suggestions {
        let draft = TaskDraft {
            title: suggestion.title,
            estimated_minutes: suggestion.estimated_minutes,
            ..TaskDraft::default()
        };
        let sub = add_subtask(ctx.store, ctx.user_id(), &parent, draft, ctx.now)?;
        println!("Created subtask {} '{}'.", sub.number, sub.title);
        ctx.emit(WebhookEvent::TaskCreated, &sub);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::nest;
    use crate::task::Task;

    #[test]
    fn subtasks_follow_their_parent() {
        let now = Utc::now();
        let user = Uuid::new_v4();
        let parent = Task::new_pending(user, "Trip".to_string(), now, 1);
        let other = Task::new_pending(user, "Laundry".to_string(), now, 2);
        let mut child = Task::new_pending(user, "Book hotel".to_string(), now, 3);
        child.parent_id = Some(parent.id);
        let mut orphan = Task::new_pending(user, "Pack".to_string(), now, 4);
        orphan.parent_id = Some(Uuid::new_v4());

        let ordered = nest(vec![&parent, &other, &child, &orphan]);
        let numbers: Vec<u64> = ordered.iter().map(|t| t.number).collect();
        assert_eq!(numbers, vec![1, 3, 2, 4]);
    }
}

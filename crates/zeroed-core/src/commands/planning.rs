use chrono::NaiveTime;
use tracing::{info, instrument};

use super::Ctx;
use crate::cli::{FilterCommand, FocusCommand, GoalCommand, HabitCommand};
use crate::datetime::project_local_to_utc;
use crate::filter::{
    build_query, delete_smart_filter, find_smart_filter, run_smart_filter, save_smart_filter,
    smart_filters_for_user,
};
use crate::focus::{
    FocusSession, active_session, focus_minutes_between, start_session, stop_session,
};
use crate::goals::{
    Goal, GoalPeriod, NewGoal, create_goal, goals_for_user, record_goal_progress,
    refresh_goal_progress,
};
use crate::habits::{HabitLog, compute_streak, create_habit, habits_for_user, log_habit};
use crate::tasks::lists_for_user;
use crate::webhook::WebhookEvent;

#[instrument(skip(ctx))]
pub(super) fn cmd_filter(ctx: &mut Ctx<'_>, sub: FilterCommand) -> anyhow::Result<()> {
    match sub {
        FilterCommand::Save {
            name,
            conditions,
            sort,
        } => {
            info!("command filter save");
            // Fail on conditions that cannot resolve before storing them.
            build_query(&conditions, sort, ctx.today(), ctx.week_start)?;
            let filter = save_smart_filter(ctx.store, ctx.user_id(), &name, conditions, sort, ctx.now)?;
            println!("Saved filter '{}'.", filter.name);
        }
        FilterCommand::Run { name } => {
            let tasks = run_smart_filter(ctx.store, ctx.user_id(), &name, ctx.now, ctx.week_start)?;
            let lists = lists_for_user(ctx.store, ctx.user_id())?;
            ctx.renderer.print_task_table(&tasks, &lists, ctx.today())?;
        }
        FilterCommand::List => {
            let today = ctx.today();
            let mut rows = Vec::new();
            for filter in smart_filters_for_user(ctx.store, ctx.user_id())? {
                let query = build_query(&filter.conditions, filter.sort, today, ctx.week_start)?;
                rows.push(vec![filter.name, query.to_query_string()]);
            }
            ctx.renderer.print_table(&["Filter", "Query"], rows)?;
        }
        FilterCommand::Show { name } => {
            let filter = find_smart_filter(ctx.store, ctx.user_id(), &name)?;
            let query = build_query(&filter.conditions, filter.sort, ctx.today(), ctx.week_start)?;
            ctx.renderer.print_json(&serde_json::json!({
                "name": filter.name,
                "conditions": filter.conditions,
                "sort": filter.sort,
                "query": query.to_query_string(),
            }))?;
        }
        FilterCommand::Delete { name } => {
            delete_smart_filter(ctx.store, ctx.user_id(), &name)?;
            println!("Deleted filter '{name}'.");
        }
    }
    Ok(())
}

#[instrument(skip(ctx))]
pub(super) fn cmd_habit(ctx: &mut Ctx<'_>, sub: HabitCommand) -> anyhow::Result<()> {
    match sub {
        HabitCommand::Add {
            name,
            frequency,
            target,
        } => {
            info!("command habit add");
            let habit = create_habit(ctx.store, ctx.user_id(), &name, frequency, target, ctx.now)?;
            println!("Tracking habit '{}' ({}).", habit.name, habit.frequency);
        }
        HabitCommand::Log { name, date } => {
            info!("command habit log");
            let date = match date.as_deref() {
                Some(token) => ctx.parse_date(token)?,
                None => ctx.today(),
            };
            let progress = log_habit(ctx.store, ctx.user_id(), &name, date, ctx.now)?;
            println!(
                "Logged '{}' for {date}: {}/{}, streak {}.",
                progress.habit.name,
                progress.count,
                progress.habit.target_per_day,
                progress.habit.current_streak
            );
            if progress.completed_now {
                ctx.emit(WebhookEvent::HabitCompleted, &progress);
            }
        }
        HabitCommand::List => {
            let today = ctx.today();
            let logs: Vec<HabitLog> = ctx
                .store
                .load::<HabitLog>()?
                .into_iter()
                .filter(|log| log.user_id == ctx.user_id())
                .collect();
            let rows = habits_for_user(ctx.store, ctx.user_id())?
                .iter()
                .map(|habit| {
                    let own: Vec<HabitLog> = logs
                        .iter()
                        .filter(|log| log.habit_id == habit.id)
                        .cloned()
                        .collect();
                    let done_today = own
                        .iter()
                        .find(|log| log.date == today)
                        .map(|log| log.count)
                        .unwrap_or(0);
                    vec![
                        habit.name.clone(),
                        habit.frequency.to_string(),
                        format!("{done_today}/{}", habit.target_per_day),
                        compute_streak(habit, &own, today).to_string(),
                        habit.best_streak.to_string(),
                    ]
                })
                .collect();
            ctx.renderer
                .print_table(&["Habit", "Schedule", "Today", "Streak", "Best"], rows)?;
        }
    }
    Ok(())
}

fn goal_row(goal: &Goal) -> Vec<String> {
    vec![
        goal.title.clone(),
        goal.target_type.to_string(),
        format!(
            "{}/{} ({}%)",
            goal.current_value,
            goal.target_value,
            goal.progress_percent()
        ),
        goal.period.as_str().to_string(),
        format!("{}..{}", goal.start_date, goal.end_date),
        if goal.completed_at.is_some() { "yes" } else { "" }.to_string(),
    ]
}

const GOAL_HEADERS: [&str; 6] = ["Goal", "Type", "Progress", "Period", "Range", "Done"];

#[instrument(skip(ctx))]
pub(super) fn cmd_goal(ctx: &mut Ctx<'_>, sub: GoalCommand) -> anyhow::Result<()> {
    match sub {
        GoalCommand::Add {
            title,
            target_type,
            target,
            period,
            start,
            end,
        } => {
            info!("command goal add");
            let range = match (start.as_deref(), end.as_deref()) {
                (Some(start), Some(end)) => Some((ctx.parse_date(start)?, ctx.parse_date(end)?)),
                _ => None,
            };
            let period = if range.is_some() {
                GoalPeriod::Custom
            } else {
                period
            };
            let goal = create_goal(
                ctx.store,
                ctx.user_id(),
                NewGoal {
                    title,
                    target_type,
                    target_value: target,
                    period,
                    range,
                },
                ctx.week_start,
                ctx.now,
            )?;
            println!(
                "Created goal '{}' ({} {} by {}).",
                goal.title, goal.target_value, goal.target_type, goal.end_date
            );
        }
        GoalCommand::List => {
            let rows = goals_for_user(ctx.store, ctx.user_id())?
                .iter()
                .map(goal_row)
                .collect();
            ctx.renderer.print_table(&GOAL_HEADERS, rows)?;
        }
        GoalCommand::Refresh => {
            info!("command goal refresh");
            let goals = refresh_goal_progress(ctx.store, ctx.user_id(), ctx.week_start, ctx.now)?;
            for goal in goals.iter().filter(|g| g.completed_at == Some(ctx.now)) {
                println!("Goal reached: '{}'.", goal.title);
                ctx.emit(WebhookEvent::GoalCompleted, goal);
            }
            let rows = goals.iter().map(goal_row).collect();
            ctx.renderer.print_table(&GOAL_HEADERS, rows)?;
        }
        GoalCommand::Progress { title, value } => {
            info!("command goal progress");
            let goal = record_goal_progress(ctx.store, ctx.user_id(), &title, value, ctx.now)?;
            println!(
                "'{}' is at {}/{} ({}%).",
                goal.title,
                goal.current_value,
                goal.target_value,
                goal.progress_percent()
            );
            if goal.completed_at == Some(ctx.now) {
                ctx.emit(WebhookEvent::GoalCompleted, &goal);
            }
        }
    }
    Ok(())
}

#[instrument(skip(ctx))]
pub(super) fn cmd_focus(ctx: &mut Ctx<'_>, sub: FocusCommand) -> anyhow::Result<()> {
    match sub {
        FocusCommand::Start {
            kind,
            task,
            minutes,
        } => {
            info!("command focus start");
            let session = start_session(
                ctx.store,
                ctx.user_id(),
                kind,
                task.as_deref(),
                minutes,
                ctx.now,
            )?;
            println!(
                "Started {} for {} minutes, until {}.",
                session.kind,
                session.planned_minutes,
                session.planned_end().format("%H:%M UTC")
            );
        }
        FocusCommand::Stop => {
            info!("command focus stop");
            let session = stop_session(ctx.store, ctx.user_id(), ctx.now)?;
            println!(
                "Stopped {} after {} minutes.",
                session.kind,
                session.actual_minutes.unwrap_or(0)
            );
        }
        FocusCommand::Status => {
            match active_session(ctx.store, ctx.user_id())? {
                Some(session) => println!(
                    "{} running, {} minutes left.",
                    session.kind,
                    session.remaining_minutes(ctx.now).max(0)
                ),
                None => println!("No active session."),
            }
            let midnight = project_local_to_utc(ctx.today().and_time(NaiveTime::MIN))?;
            let sessions = ctx.store.load::<FocusSession>()?;
            let minutes = focus_minutes_between(&sessions, ctx.user_id(), midnight, ctx.now);
            println!("Focused today: {minutes} minutes.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    use super::goal_row;
    use crate::goals::{Goal, GoalPeriod, TargetType};

    #[test]
    fn goal_rows_show_progress_and_range() {
        let day = |d| NaiveDate::from_ymd_opt(2026, 10, d).expect("date");
        let goal = Goal {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            title: "Ship it".to_string(),
            target_type: TargetType::TasksCompleted,
            target_value: 8,
            current_value: 2,
            period: GoalPeriod::Weekly,
            start_date: day(12),
            end_date: day(18),
            completed_at: None,
            created_at: Utc::now(),
        };
        let row = goal_row(&goal);
        assert_eq!(row[2], "2/8 (25%)");
        assert_eq!(row[3], "weekly");
        assert_eq!(row[4], "2026-10-12..2026-10-18");
        assert_eq!(row[5], "");
    }
}

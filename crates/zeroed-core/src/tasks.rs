use anyhow::anyhow;
use chrono::{
  DateTime,
  NaiveDate,
  NaiveTime,
  Utc
};
use tracing::{
  debug,
  info,
  instrument
};
use uuid::Uuid;

use crate::datastore::DataStore;
use crate::quick_add::ParsedTask;
use crate::task::{
  Priority,
  Task,
  TaskList,
  TaskStatus
};

/// Fields for a task that does not exist yet.
#[derive(Debug, Clone, Default)]
pub struct TaskDraft {
  pub title:             String,
  pub notes:             Option<String>,
  pub priority:          Option<Priority>,
  pub due_date:          Option<NaiveDate>,
  pub due_time:          Option<NaiveTime>,
  pub estimated_minutes: Option<u32>,
  pub tags:              Vec<String>,
  pub list_name:         Option<String>,
  pub list_id:           Option<Uuid>,
  pub parent_id:         Option<Uuid>,
  pub team_id:           Option<Uuid>,
  pub project_id:        Option<Uuid>,
  pub assignee_id:       Option<Uuid>
}

impl From<ParsedTask> for TaskDraft {
  fn from(parsed: ParsedTask) -> Self {
    Self {
      title: parsed.title,
      priority: parsed.priority,
      due_date: parsed.due_date,
      due_time: parsed.due_time,
      estimated_minutes: parsed
        .estimated_minutes,
      tags: parsed.tags,
      list_name: parsed.list_name,
      ..Self::default()
    }
  }
}

/// Partial edit; `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
  pub title:             Option<String>,
  pub notes:             Option<String>,
  pub priority:          Option<Priority>,
  pub due_date:          Option<NaiveDate>,
  pub due_time:          Option<NaiveTime>,
  pub clear_due:         bool,
  pub estimated_minutes: Option<u32>,
  pub add_tags:          Vec<String>,
  pub remove_tags:       Vec<String>,
  pub list_name:         Option<String>,
  pub assignee_id:       Option<Uuid>
}

impl TaskPatch {
  pub fn is_empty(&self) -> bool {
    self.title.is_none()
      && self.notes.is_none()
      && self.priority.is_none()
      && self.due_date.is_none()
      && self.due_time.is_none()
      && !self.clear_due
      && self.estimated_minutes.is_none()
      && self.add_tags.is_empty()
      && self.remove_tags.is_empty()
      && self.list_name.is_none()
      && self.assignee_id.is_none()
  }
}

/// Finds a task by display number or by a prefix of its id.
pub fn find_task_index(
  tasks: &[Task],
  user_id: Uuid,
  selector: &str
) -> anyhow::Result<usize> {
  let selector = selector.trim();
  if let Ok(number) =
    selector.trim_start_matches('#').parse::<u64>()
    && let Some(idx) =
      tasks.iter().position(|t| {
        t.user_id == user_id
          && t.number == number
      })
  {
    return Ok(idx);
  }

  let needle = selector
    .replace('-', "")
    .to_ascii_lowercase();
  if needle.len() >= 4 {
    let hits: Vec<usize> = tasks
      .iter()
      .enumerate()
      .filter(|(_, t)| {
        t.user_id == user_id
          && t
            .id
            .simple()
            .to_string()
            .starts_with(&needle)
      })
      .map(|(idx, _)| idx)
      .collect();
    match hits.as_slice() {
      | [idx] => return Ok(*idx),
      | [] => {}
      | _ => {
        return Err(anyhow!(
          "task selector {selector} is \
           ambiguous"
        ));
      }
    }
  }

  Err(anyhow!("no task matches {selector}"))
}

pub fn tasks_for_user(
  store: &DataStore,
  user_id: Uuid
) -> anyhow::Result<Vec<Task>> {
  let mut tasks: Vec<Task> = store
    .load::<Task>()?
    .into_iter()
    .filter(|t| t.user_id == user_id)
    .collect();
  tasks.sort_by_key(|t| t.number);
  Ok(tasks)
}

/// Open tasks due on `today` or earlier, oldest first.
pub fn due_or_overdue(
  tasks: &[Task],
  today: NaiveDate
) -> Vec<&Task> {
  let mut out: Vec<&Task> = tasks
    .iter()
    .filter(|t| {
      t.is_open()
        && t.due_date
          .is_some_and(|due| due <= today)
    })
    .collect();
  out.sort_by_key(|t| {
    (t.due_date, t.due_time, t.number)
  });
  out
}

#[instrument(skip(store, draft, now), fields(title = %draft.title))]
pub fn create_task(
  store: &DataStore,
  user_id: Uuid,
  draft: TaskDraft,
  default_list: Option<&str>,
  now: DateTime<Utc>
) -> anyhow::Result<Task> {
  let title = draft.title.trim().to_string();
  if title.is_empty() {
    return Err(anyhow!(
      "task title cannot be empty"
    ));
  }

  let mut tasks = store.load::<Task>()?;

  let (list_id, parent_id) =
    if let Some(parent_id) = draft.parent_id
    {
      let parent = tasks
        .iter()
        .find(|t| {
          t.id == parent_id
            && t.user_id == user_id
        })
        .ok_or_else(|| {
          anyhow!(
            "parent task {parent_id} not \
             found"
          )
        })?;
      if parent.parent_id.is_some() {
        return Err(anyhow!(
          "subtasks cannot have subtasks"
        ));
      }
      (parent.list_id, Some(parent_id))
    } else if let Some(list_id) =
      draft.list_id
    {
      (Some(list_id), None)
    } else if let Some(name) = draft
      .list_name
      .as_deref()
      .or(default_list)
      .filter(|n| !n.trim().is_empty())
    {
      let list =
        ensure_list(store, user_id, name, now)?;
      (Some(list.id), None)
    } else {
      (None, None)
    };

  let number = store.next_task_number(&tasks);
  let position = next_position(
    &tasks, user_id, list_id, parent_id
  );

  let mut task = Task::new_pending(
    user_id, title, now, number
  );
  task.notes = draft
    .notes
    .filter(|n| !n.trim().is_empty());
  task.priority = draft.priority;
  task.due_date = draft.due_date;
  task.due_time = draft.due_time;
  task.estimated_minutes =
    draft.estimated_minutes;
  task.tags = normalize_tags(draft.tags);
  task.list_id = list_id;
  task.parent_id = parent_id;
  task.position = position;
  task.team_id = draft.team_id;
  task.project_id = draft.project_id;
  task.assignee_id = draft.assignee_id;

  tasks.push(task.clone());
  store.save(&tasks)?;

  info!(number = task.number, id = %task.id, "created task");
  Ok(task)
}

/// Adds a child under `parent_selector`; the child lives in the parent's list.
#[instrument(skip(store, draft, now))]
pub fn add_subtask(
  store: &DataStore,
  user_id: Uuid,
  parent_selector: &str,
  mut draft: TaskDraft,
  now: DateTime<Utc>
) -> anyhow::Result<Task> {
  let tasks = store.load::<Task>()?;
  let idx = find_task_index(
    &tasks,
    user_id,
    parent_selector
  )?;
  draft.parent_id = Some(tasks[idx].id);
  draft.list_id = None;
  draft.list_name = None;
  create_task(store, user_id, draft, None, now)
}

#[instrument(skip(store, patch, now))]
pub fn update_task(
  store: &DataStore,
  user_id: Uuid,
  selector: &str,
  patch: TaskPatch,
  now: DateTime<Utc>
) -> anyhow::Result<Task> {
  if patch.is_empty() {
    return Err(anyhow!(
      "nothing to change"
    ));
  }

  let list_id = match patch
    .list_name
    .as_deref()
  {
    | Some(name) => {
      Some(
        ensure_list(store, user_id, name, now)?
          .id
      )
    }
    | None => None
  };

  store.update(|tasks: &mut Vec<Task>| {
    let idx = find_task_index(
      tasks, user_id, selector
    )?;

    if let Some(list_id) = list_id
      && tasks[idx].list_id != Some(list_id)
    {
      let parent = tasks[idx].parent_id;
      let position = next_position(
        tasks,
        user_id,
        Some(list_id),
        parent
      );
      tasks[idx].list_id = Some(list_id);
      tasks[idx].position = position;
    }

    let task = &mut tasks[idx];
    if let Some(title) = patch.title {
      let title = title.trim().to_string();
      if title.is_empty() {
        return Err(anyhow!(
          "task title cannot be empty"
        ));
      }
      task.title = title;
    }
    if let Some(notes) = patch.notes {
      task.notes = Some(notes)
        .filter(|n| !n.trim().is_empty());
    }
    if let Some(priority) = patch.priority {
      task.priority = Some(priority);
    }
    if patch.clear_due {
      task.due_date = None;
      task.due_time = None;
      task.reminder_sent_at = None;
    }
    if let Some(date) = patch.due_date {
      task.due_date = Some(date);
      task.reminder_sent_at = None;
    }
    if let Some(time) = patch.due_time {
      task.due_time = Some(time);
      task.reminder_sent_at = None;
    }
    if let Some(minutes) =
      patch.estimated_minutes
    {
      task.estimated_minutes = Some(minutes);
    }
    if let Some(assignee) = patch.assignee_id
    {
      task.assignee_id = Some(assignee);
    }
    let mut tags = task.tags.clone();
    tags.extend(patch.add_tags);
    tags.retain(|tag| {
      !patch.remove_tags.iter().any(|r| {
        r.eq_ignore_ascii_case(tag)
      })
    });
    task.tags = normalize_tags(tags);
    task.updated_at = now;

    info!(number = task.number, "updated task");
    Ok(task.clone())
  })
}

#[instrument(skip(store, now))]
pub fn set_status(
  store: &DataStore,
  user_id: Uuid,
  selector: &str,
  status: TaskStatus,
  now: DateTime<Utc>
) -> anyhow::Result<Task> {
  store.update(|tasks: &mut Vec<Task>| {
    let idx = find_task_index(
      tasks, user_id, selector
    )?;
    let task = &mut tasks[idx];
    task.set_status(status, now);
    info!(number = task.number, status = %status, "changed task status");
    Ok(task.clone())
  })
}

pub fn complete_task(
  store: &DataStore,
  user_id: Uuid,
  selector: &str,
  now: DateTime<Utc>
) -> anyhow::Result<Task> {
  set_status(
    store,
    user_id,
    selector,
    TaskStatus::Completed,
    now
  )
}

pub fn reopen_task(
  store: &DataStore,
  user_id: Uuid,
  selector: &str,
  now: DateTime<Utc>
) -> anyhow::Result<Task> {
  set_status(
    store,
    user_id,
    selector,
    TaskStatus::Pending,
    now
  )
}

/// Removes the task and its subtasks, returning everything removed.
#[instrument(skip(store))]
pub fn delete_task(
  store: &DataStore,
  user_id: Uuid,
  selector: &str
) -> anyhow::Result<Vec<Task>> {
  store.update(|tasks: &mut Vec<Task>| {
    let idx = find_task_index(
      tasks, user_id, selector
    )?;
    let root = tasks[idx].id;

    let (removed, kept): (Vec<Task>, Vec<Task>) =
      std::mem::take(tasks)
        .into_iter()
        .partition(|t| {
          t.id == root
            || t.parent_id == Some(root)
        });
    *tasks = kept;

    info!(
      root = %root,
      removed = removed.len(),
      "deleted task"
    );
    Ok(removed)
  })
}

/// Moves a task among its siblings; sibling positions end up `0..n`.
#[instrument(skip(store, now))]
pub fn move_task(
  store: &DataStore,
  user_id: Uuid,
  selector: &str,
  position: usize,
  now: DateTime<Utc>
) -> anyhow::Result<Task> {
  store.update(|tasks: &mut Vec<Task>| {
    let idx = find_task_index(
      tasks, user_id, selector
    )?;
    let moving = tasks[idx].id;
    let list_id = tasks[idx].list_id;
    let parent_id = tasks[idx].parent_id;

    let mut siblings: Vec<(i64, u64, Uuid)> =
      tasks
        .iter()
        .filter(|t| {
          t.user_id == user_id
            && t.list_id == list_id
            && t.parent_id == parent_id
            && t.id != moving
        })
        .map(|t| (t.position, t.number, t.id))
        .collect();
    siblings.sort();

    let mut order: Vec<Uuid> =
      siblings.into_iter().map(|s| s.2).collect();
    let slot = position.min(order.len());
    order.insert(slot, moving);

    for (pos, id) in order.iter().enumerate() {
      if let Some(task) =
        tasks.iter_mut().find(|t| t.id == *id)
      {
        task.position = pos as i64;
        if task.id == moving {
          task.updated_at = now;
        }
      }
    }

    debug!(slot, siblings = order.len(), "reordered siblings");
    tasks
      .iter()
      .find(|t| t.id == moving)
      .cloned()
      .ok_or_else(|| {
        anyhow!("moved task vanished")
      })
  })
}

#[instrument(skip(store, now))]
pub fn create_list(
  store: &DataStore,
  user_id: Uuid,
  name: &str,
  now: DateTime<Utc>
) -> anyhow::Result<TaskList> {
  let name = name.trim();
  if name.is_empty() {
    return Err(anyhow!(
      "list name cannot be empty"
    ));
  }

  store.update(|lists: &mut Vec<TaskList>| {
    if lists.iter().any(|l| {
      l.user_id == user_id
        && l.name.eq_ignore_ascii_case(name)
    }) {
      return Err(anyhow!(
        "a list named {name} already \
         exists"
      ));
    }
    let position = lists
      .iter()
      .filter(|l| l.user_id == user_id)
      .map(|l| l.position + 1)
      .max()
      .unwrap_or(0);
    let list = TaskList::new(
      user_id,
      name.to_string(),
      position,
      now
    );
    lists.push(list.clone());
    info!(list = %list.name, "created list");
    Ok(list)
  })
}

/// Returns the user's list called `name`, creating it when missing.
pub fn ensure_list(
  store: &DataStore,
  user_id: Uuid,
  name: &str,
  now: DateTime<Utc>
) -> anyhow::Result<TaskList> {
  let existing = store
    .load::<TaskList>()?
    .into_iter()
    .find(|l| {
      l.user_id == user_id
        && l.name.eq_ignore_ascii_case(name.trim())
    });
  match existing {
    | Some(list) if list.is_archived => {
      Err(anyhow!(
        "list {} is archived",
        list.name
      ))
    }
    | Some(list) => Ok(list),
    | None => {
      create_list(store, user_id, name, now)
    }
  }
}

#[instrument(skip(store))]
pub fn archive_list(
  store: &DataStore,
  user_id: Uuid,
  name: &str
) -> anyhow::Result<TaskList> {
  store.update(|lists: &mut Vec<TaskList>| {
    let list = lists
      .iter_mut()
      .find(|l| {
        l.user_id == user_id
          && l.name.eq_ignore_ascii_case(
            name.trim()
          )
      })
      .ok_or_else(|| {
        anyhow!("no list named {name}")
      })?;
    list.is_archived = true;
    info!(list = %list.name, "archived list");
    Ok(list.clone())
  })
}

pub fn lists_for_user(
  store: &DataStore,
  user_id: Uuid
) -> anyhow::Result<Vec<TaskList>> {
  let mut lists: Vec<TaskList> = store
    .load::<TaskList>()?
    .into_iter()
    .filter(|l| {
      l.user_id == user_id && !l.is_archived
    })
    .collect();
  lists.sort_by_key(|l| l.position);
  Ok(lists)
}

fn next_position(
  tasks: &[Task],
  user_id: Uuid,
  list_id: Option<Uuid>,
  parent_id: Option<Uuid>
) -> i64 {
  tasks
    .iter()
    .filter(|t| {
      t.user_id == user_id
        && t.list_id == list_id
        && t.parent_id == parent_id
    })
    .map(|t| t.position + 1)
    .max()
    .unwrap_or(0)
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
  let mut out: Vec<String> = Vec::new();
  for tag in tags {
    let tag = tag
      .trim()
      .trim_start_matches('#')
      .to_string();
    if !tag.is_empty()
      && !out
        .iter()
        .any(|t| t.eq_ignore_ascii_case(&tag))
    {
      out.push(tag);
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use chrono::{
    DateTime,
    TimeZone,
    Utc
  };
  use uuid::Uuid;

  use super::{
    TaskDraft,
    TaskPatch,
    add_subtask,
    archive_list,
    create_list,
    create_task,
    delete_task,
    lists_for_user,
    move_task,
    update_task
  };
  use crate::datastore::DataStore;
  use crate::task::Task;

  fn now() -> DateTime<Utc> {
    Utc
      .with_ymd_and_hms(2026, 10, 18, 9, 0, 0)
      .single()
      .expect("valid now")
  }

  fn draft(title: &str) -> TaskDraft {
    TaskDraft {
      title: title.to_string(),
      ..TaskDraft::default()
    }
  }

  fn open_store(
    dir: &tempfile::TempDir
  ) -> (DataStore, Uuid) {
    let store =
      DataStore::open(dir.path()).expect("open");
    let user =
      store.profile().expect("profile").user_id;
    (store, user)
  }

  #[test]
  fn create_assigns_number_position_and_list() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, user) = open_store(&dir);

    let a = create_task(
      &store,
      user,
      draft("  First  "),
      Some("Inbox"),
      now()
    )
    .expect("create");
    let b = create_task(
      &store,
      user,
      draft("Second"),
      Some("inbox"),
      now()
    )
    .expect("create");

    assert_eq!(a.title, "First");
    assert_eq!((a.number, b.number), (1, 2));
    assert_eq!((a.position, b.position), (0, 1));
    assert_eq!(a.list_id, b.list_id);
    assert_eq!(
      lists_for_user(&store, user)
        .expect("lists")
        .len(),
      1
    );

    assert!(
      create_task(
        &store,
        user,
        draft("   "),
        None,
        now()
      )
      .is_err()
    );
  }

  #[test]
  fn subtasks_are_one_level_and_cascade_on_delete()
  {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, user) = open_store(&dir);

    let parent = create_task(
      &store,
      user,
      draft("Launch"),
      Some("Work"),
      now()
    )
    .expect("parent");
    let child = add_subtask(
      &store,
      user,
      "1",
      draft("Write post"),
      now()
    )
    .expect("child");
    assert_eq!(child.parent_id, Some(parent.id));
    assert_eq!(child.list_id, parent.list_id);
    assert_eq!(child.position, 0);

    let nested = add_subtask(
      &store,
      user,
      &child.number.to_string(),
      draft("Too deep"),
      now()
    );
    assert!(nested.is_err());

    let removed =
      delete_task(&store, user, "1").expect("delete");
    assert_eq!(removed.len(), 2);
    assert!(
      store.load::<Task>().expect("load").is_empty()
    );
  }

  #[test]
  fn move_keeps_positions_dense() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, user) = open_store(&dir);
    for title in ["a", "b", "c", "d"] {
      create_task(
        &store,
        user,
        draft(title),
        Some("Inbox"),
        now()
      )
      .expect("create");
    }

    move_task(&store, user, "4", 0, now())
      .expect("move");
    move_task(&store, user, "1", 99, now())
      .expect("move");

    let mut tasks = store.load::<Task>().expect("load");
    tasks.sort_by_key(|t| t.position);
    let order: Vec<&str> =
      tasks.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(order, vec!["d", "b", "c", "a"]);
    let positions: Vec<i64> =
      tasks.iter().map(|t| t.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
  }

  #[test]
  fn list_names_are_unique_case_insensitively() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, user) = open_store(&dir);

    create_list(&store, user, "Errands", now())
      .expect("create");
    assert!(
      create_list(&store, user, "errands", now())
        .is_err()
    );

    archive_list(&store, user, "ERRANDS")
      .expect("archive");
    assert!(
      lists_for_user(&store, user)
        .expect("lists")
        .is_empty()
    );
  }

  #[test]
  fn update_edits_tags_and_rejects_empty_patch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, user) = open_store(&dir);
    let mut d = draft("Tidy");
    d.tags = vec!["home".to_string()];
    create_task(&store, user, d, None, now())
      .expect("create");

    let updated = update_task(
      &store,
      user,
      "1",
      TaskPatch {
        add_tags: vec!["#weekend".to_string()],
        remove_tags: vec!["HOME".to_string()],
        ..TaskPatch::default()
      },
      now()
    )
    .expect("update");
    assert_eq!(updated.tags, vec!["weekend"]);

    assert!(
      update_task(
        &store,
        user,
        "1",
        TaskPatch::default(),
        now()
      )
      .is_err()
    );
  }
}

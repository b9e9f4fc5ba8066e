use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

use crate::task::Task;

/// A row type persisted as one JSON object per line in `FILE`.
pub trait Record: Serialize + DeserializeOwned + Clone {
    const FILE: &'static str;
}

/// The local account the datastore belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub user_id: Uuid,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub display_name: Option<String>,

    /// Routes `tasks+<token>@...` mail to this account.
    pub inbound_token: String,

    pub created_at: DateTime<Utc>,
}

impl Record for Profile {
    const FILE: &'static str = "profile.data";
}

impl Profile {
    pub fn new(email: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            email,
            display_name: None,
            inbound_token: random_hex(8),
            created_at: now,
        }
    }
}

#[derive(Debug)]
pub struct DataStore {
    pub data_dir: PathBuf,
}

impl DataStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let store = Self { data_dir };
        if store.load::<Profile>()?.is_empty() {
            let profile = Profile::new(None, Utc::now());
            info!(user = %profile.user_id, "created local profile");
            store.save(&[profile])?;
        }

        info!(data_dir = %store.data_dir.display(), "opened datastore");
        Ok(store)
    }

    pub fn path_of<T: Record>(&self) -> PathBuf {
        self.data_dir.join(T::FILE)
    }

    /// Loads every row of a collection; a missing file is an empty collection.
    #[tracing::instrument(skip(self), fields(file = T::FILE))]
    pub fn load<T: Record>(&self) -> anyhow::Result<Vec<T>> {
        let path = self.path_of::<T>();
        if !path.exists() {
            return Ok(vec![]);
        }
        load_jsonl(&path).with_context(|| format!("failed to load {}", T::FILE))
    }

    #[tracing::instrument(skip(self, records), fields(file = T::FILE))]
    pub fn save<T: Record>(&self, records: &[T]) -> anyhow::Result<()> {
        save_jsonl_atomic(&self.path_of::<T>(), records)
            .with_context(|| format!("failed to save {}", T::FILE))
    }

    /// Load, mutate, save. Nothing is written when `f` fails.
    pub fn update<T, R, F>(&self, f: F) -> anyhow::Result<R>
    where
        T: Record,
        F: FnOnce(&mut Vec<T>) -> anyhow::Result<R>,
    {
        let mut records = self.load::<T>()?;
        let out = f(&mut records)?;
        self.save(&records)?;
        Ok(out)
    }

    pub fn profile(&self) -> anyhow::Result<Profile> {
        self.load::<Profile>()?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("datastore has no profile"))
    }

    pub fn profile_by_token(&self, token: &str) -> anyhow::Result<Option<Profile>> {
        Ok(self
            .load::<Profile>()?
            .into_iter()
            .find(|p| p.inbound_token.eq_ignore_ascii_case(token.trim())))
    }

    pub fn next_task_number(&self, tasks: &[Task]) -> u64 {
        tasks.iter().map(|t| t.number).max().unwrap_or(0) + 1
    }
}

pub(crate) fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[tracing::instrument(skip(path))]
fn load_jsonl<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    debug!(file = %path.display(), "loading jsonl");
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: T = serde_json::from_str(trimmed)
            .with_context(|| format!("failed parsing {} line {}", path.display(), idx + 1))?;
        out.push(record);
    }

    debug!(count = out.len(), "loaded records from jsonl");
    Ok(out)
}

#[tracing::instrument(skip(path, records))]
fn save_jsonl_atomic<T: Serialize>(path: &Path, records: &[T]) -> anyhow::Result<()> {
    debug!(file = %path.display(), count = records.len(), "saving jsonl atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    for record in records {
        let serialized = serde_json::to_string(record)?;
        writeln!(temp, "{serialized}")?;
    }
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::{DataStore, Profile};
    use crate::task::Task;

    #[test]
    fn open_creates_profile_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = DataStore::open(dir.path()).expect("open").profile().expect("profile");
        let second = DataStore::open(dir.path()).expect("reopen").profile().expect("profile");
        assert_eq!(first, second);
        assert_eq!(first.inbound_token.len(), 16);
    }

    #[test]
    fn update_persists_and_failed_update_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let now = Utc
            .with_ymd_and_hms(2026, 10, 18, 9, 0, 0)
            .single()
            .expect("valid now");

        store
            .update(|tasks: &mut Vec<Task>| {
                tasks.push(Task::new_pending(Uuid::nil(), "one".to_string(), now, 1));
                Ok(())
            })
            .expect("update");

        let failed = store.update(|tasks: &mut Vec<Task>| {
            tasks.clear();
            Err::<(), _>(anyhow::anyhow!("boom"))
        });
        assert!(failed.is_err());

        let tasks = store.load::<Task>().expect("load");
        assert_eq!(tasks.len(), 1);
        assert_eq!(store.next_task_number(&tasks), 2);
    }

    #[test]
    fn finds_profile_by_inbound_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let profile: Profile = store.profile().expect("profile");
        let found = store
            .profile_by_token(&profile.inbound_token.to_uppercase())
            .expect("lookup");
        assert_eq!(found.map(|p| p.user_id), Some(profile.user_id));
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace};

use crate::config::Config;
use crate::datastore::{DataStore, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    MaintenanceMode,
    SignupsEnabled,
    AiFeaturesEnabled,
    IntegrationsEnabled,
}

impl SettingKey {
    pub const ALL: [SettingKey; 4] = [
        SettingKey::MaintenanceMode,
        SettingKey::SignupsEnabled,
        SettingKey::AiFeaturesEnabled,
        SettingKey::IntegrationsEnabled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::MaintenanceMode => "maintenance_mode",
            SettingKey::SignupsEnabled => "signups_enabled",
            SettingKey::AiFeaturesEnabled => "ai_features_enabled",
            SettingKey::IntegrationsEnabled => "integrations_enabled",
        }
    }

    pub fn default_value(self) -> bool {
        !matches!(self, SettingKey::MaintenanceMode)
    }
}

impl FromStr for SettingKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| anyhow!("unknown platform setting: {wanted}"))
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformSetting {
    pub key: SettingKey,
    pub value: bool,
    pub updated_at: DateTime<Utc>,
}

impl Record for PlatformSetting {
    const FILE: &'static str = "platform_settings.data";
}

type Snapshot = BTreeMap<SettingKey, bool>;

/// Platform flags with a short-lived read cache; writes clear it.
#[derive(Debug)]
pub struct PlatformSettings {
    ttl: Duration,
    cache: Mutex<Option<(Instant, Snapshot)>>,
}

impl PlatformSettings {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(Duration::from_secs(cfg.u64_or("settings.cache_ttl", 30)?)))
    }

    /// Every flag, defaults filled in.
    #[instrument(skip(self, store))]
    pub fn all(&self, store: &DataStore) -> anyhow::Result<Snapshot> {
        let mut cache = self.cache.lock();
        if let Some((loaded_at, snapshot)) = cache.as_ref()
            && loaded_at.elapsed() < self.ttl
        {
            trace!("platform settings served from cache");
            return Ok(snapshot.clone());
        }

        let mut snapshot: Snapshot = SettingKey::ALL
            .into_iter()
            .map(|key| (key, key.default_value()))
            .collect();
        for row in store.load::<PlatformSetting>()? {
            snapshot.insert(row.key, row.value);
        }
        debug!(?snapshot, "loaded platform settings");
        *cache = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    pub fn get(&self, store: &DataStore, key: SettingKey) -> anyhow::Result<bool> {
        Ok(self
            .all(store)?
            .get(&key)
            .copied()
            .unwrap_or_else(|| key.default_value()))
    }

    #[instrument(skip(self, store, now))]
    pub fn set(
        &self,
        store: &DataStore,
        key: SettingKey,
        value: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        store.update(|rows: &mut Vec<PlatformSetting>| {
            rows.retain(|row| row.key != key);
            rows.push(PlatformSetting {
                key,
                value,
                updated_at: now,
            });
            Ok(())
        })?;
        self.invalidate();
        info!(%key, value, "updated platform setting");
        Ok(())
    }

    pub fn invalidate(&self) {
        *self.cache.lock() = None;
    }
}

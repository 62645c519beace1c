use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const QUOTA_FILE: &str = "quota.json";

/// Messages used on one local calendar day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct QuotaState {
    day: NaiveDate,
    used: u32,
}

impl QuotaState {
    fn roll_over(&mut self, today: NaiveDate) {
        if self.day != today {
            self.day = today;
            self.used = 0;
        }
    }
}

/// Daily free-message counter, reset at local midnight.
///
/// The caller consults it before sending; the session controller only
/// decrements after a successful stream.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    file_path: Option<PathBuf>,
    daily_limit: u32,
    state: Arc<Mutex<QuotaState>>,
}

impl QuotaTracker {
    /// Load the counter from `file_path`; a missing or unreadable file starts fresh
    pub fn open(file_path: PathBuf, daily_limit: u32) -> Self {
        let today = Local::now().date_naive();
        let state = match read_state(&file_path) {
            Ok(Some(state)) => state,
            Ok(None) => QuotaState { day: today, used: 0 },
            Err(e) => {
                tracing::warn!("Resetting message quota: {:#}", e);
                QuotaState { day: today, used: 0 }
            }
        };

        Self {
            file_path: Some(file_path),
            daily_limit,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// `<dir>/quota.json`
    pub fn in_dir(dir: &Path, daily_limit: u32) -> Self {
        Self::open(dir.join(QUOTA_FILE), daily_limit)
    }

    /// Not persisted
    pub fn in_memory(daily_limit: u32) -> Self {
        Self {
            file_path: None,
            daily_limit,
            state: Arc::new(Mutex::new(QuotaState {
                day: Local::now().date_naive(),
                used: 0,
            })),
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    pub fn remaining_messages_today(&self) -> u32 {
        self.remaining_on(Local::now().date_naive())
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining_messages_today() > 0
    }

    /// Count one message against today's quota; saturates at zero remaining
    pub fn decrement(&self) {
        self.decrement_on(Local::now().date_naive());
    }

    fn remaining_on(&self, today: NaiveDate) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.roll_over(today);
        self.daily_limit.saturating_sub(state.used)
    }

    fn decrement_on(&self, today: NaiveDate) {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.roll_over(today);
            if state.used < self.daily_limit {
                state.used += 1;
            }
            state.clone()
        };
        tracing::debug!(
            "Message quota: {} of {} used on {}",
            snapshot.used,
            self.daily_limit,
            snapshot.day
        );
        self.persist(&snapshot);
    }

    fn persist(&self, state: &QuotaState) {
        let Some(ref path) = self.file_path else {
            return;
        };
        if let Err(e) = write_state(path, state) {
            tracing::error!("Failed to save message quota: {:#}", e);
        }
    }
}

fn read_state(path: &Path) -> Result<Option<QuotaState>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).context("Failed to read quota file")?;
    let state = serde_json::from_str(&content).context("Failed to parse quota file")?;
    Ok(Some(state))
}

fn write_state(path: &Path, state: &QuotaState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create quota directory")?;
    }
    let json = serde_json::to_string_pretty(state).context("Failed to serialize quota")?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json).context("Failed to write quota file")?;
    fs::rename(&tmp_path, path).context("Failed to replace quota file")?;
    Ok(())
}

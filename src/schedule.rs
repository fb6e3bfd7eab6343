//! Photos Backup - Schedule Tracker
//!
//! Persisted schedule and backup history, plus the async loop that fires
//! scheduled backups.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Months, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::api::BackupEngine;
use crate::builder::ArchiveSummary;
use crate::error::{BackupError, BackupResult};
use crate::manifest::BackupMode;
use crate::operation::OperationLock;

const STATE_FILE: &str = "schedule.json";
const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// How often a scheduled backup runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    #[default]
    Weekly,
    Monthly,
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(format!("unknown frequency '{}'", other)),
        }
    }
}

/// Backup schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Schedule {
    pub enabled: bool,
    pub frequency: Frequency,
    /// Only run on an unmetered network (enforced by the host)
    pub require_unmetered_network: bool,
    /// Export only photos added since the last successful backup
    pub incremental: bool,
    /// Last scheduled attempt (epoch millis)
    pub last_run_at: Option<i64>,
}

impl Schedule {
    /// Earliest time the next run may start
    pub fn next_run_at(&self) -> Option<i64> {
        let last = self.last_run_at?;
        let next = match self.frequency {
            Frequency::Daily => last + DAY_MILLIS,
            Frequency::Weekly => last + 7 * DAY_MILLIS,
            Frequency::Monthly => Utc
                .timestamp_millis_opt(last)
                .single()
                .and_then(|t| t.checked_add_months(Months::new(1)))
                .map_or(last + 30 * DAY_MILLIS, |t| t.timestamp_millis()),
        };
        Some(next)
    }

    /// Whether a run is due at `now`
    pub fn is_due(&self, now: i64) -> bool {
        self.enabled && self.next_run_at().map_or(true, |next| now >= next)
    }
}

/// One finished (or failed) build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHistoryEntry {
    /// Backup id, same as the manifest's `backupId` on success
    pub id: String,
    pub created_at: i64,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub photo_count: usize,
    pub mode: BackupMode,
    pub success: bool,
    pub error: Option<String>,
    /// Started by the scheduler rather than a user
    pub scheduled: bool,
}

impl BackupHistoryEntry {
    pub fn succeeded(summary: &ArchiveSummary, scheduled: bool) -> Self {
        Self {
            id: summary.backup_id.clone(),
            created_at: summary.created_at,
            path: summary.handle.path().to_path_buf(),
            size_bytes: summary.size_bytes,
            photo_count: summary.photo_count,
            mode: summary.mode,
            success: true,
            error: None,
            scheduled,
        }
    }

    pub fn failed(path: &Path, mode: BackupMode, error: &BackupError, scheduled: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now().timestamp_millis(),
            path: path.to_path_buf(),
            size_bytes: 0,
            photo_count: 0,
            mode,
            success: false,
            error: Some(error.to_string()),
            scheduled,
        }
    }
}

/// State persisted to `schedule.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct TrackerState {
    schedule: Schedule,
    /// Oldest first
    history: Vec<BackupHistoryEntry>,
}

/// Schedule Tracker
pub struct ScheduleTracker {
    /// State file path
    state_path: PathBuf,
    history_limit: usize,
    state: RwLock<TrackerState>,
}

impl ScheduleTracker {
    /// Load state from `state_dir`, starting empty if nothing was saved yet
    pub fn load_or_create(state_dir: &Path, history_limit: usize) -> BackupResult<Self> {
        let state_path = state_dir.join(STATE_FILE);

        let state = if state_path.exists() {
            let data = std::fs::read(&state_path)?;
            serde_json::from_slice(&data).map_err(|e| {
                BackupError::Serialization(format!("{}: {}", state_path.display(), e))
            })?
        } else {
            TrackerState::default()
        };

        Ok(Self {
            state_path,
            history_limit: history_limit.max(1),
            state: RwLock::new(state),
        })
    }

    /// Write state atomically. Callers hold the write guard so saves land in order.
    fn save(&self, state: &TrackerState) -> BackupResult<()> {
        let data = serde_json::to_vec_pretty(state)?;
        let dir = self.state_path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, &data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.state_path)?;
        Ok(())
    }

    pub fn get_schedule(&self) -> Schedule {
        self.state.read().schedule.clone()
    }

    /// Replace the schedule. `last_run_at` is kept from the stored schedule.
    pub fn set_schedule(&self, schedule: Schedule) -> BackupResult<()> {
        let mut state = self.state.write();
        let last_run_at = state.schedule.last_run_at;
        state.schedule = Schedule { last_run_at, ..schedule };
        self.save(&state)?;
        log::info!("Backup schedule updated");
        Ok(())
    }

    /// History, oldest first
    pub fn history(&self) -> Vec<BackupHistoryEntry> {
        self.state.read().history.clone()
    }

    /// Append an entry, dropping the oldest beyond the limit
    pub fn record(&self, entry: BackupHistoryEntry) -> BackupResult<()> {
        let mut state = self.state.write();
        state.history.push(entry);
        let excess = state.history.len().saturating_sub(self.history_limit);
        state.history.drain(..excess);
        self.save(&state)
    }

    pub fn last_successful(&self) -> Option<BackupHistoryEntry> {
        self.state.read().history.iter().rev().find(|e| e.success).cloned()
    }

    pub fn find(&self, id: &str) -> Option<BackupHistoryEntry> {
        self.state.read().history.iter().find(|e| e.id == id).cloned()
    }

    /// Stamp the schedule's last run
    pub fn mark_run(&self, now: i64) -> BackupResult<()> {
        let mut state = self.state.write();
        state.schedule.last_run_at = Some(now);
        self.save(&state)
    }

    /// Enabled and nothing else running
    pub fn is_run_now_allowed(&self, lock: &OperationLock) -> bool {
        self.state.read().schedule.enabled && !lock.is_busy()
    }
}

/// Fire scheduled backups until `shutdown` flips to `true` (or its sender goes away)
pub async fn run_scheduler(
    engine: Arc<BackupEngine>,
    dest_dir: PathBuf,
    poll_every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    log::info!(
        "Backup scheduler started, checking every {}s",
        poll_every.as_secs()
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let engine = Arc::clone(&engine);
                let dir = dest_dir.clone();
                let now = Utc::now().timestamp_millis();
                match tokio::task::spawn_blocking(move || engine.run_scheduled_backup(&dir, now)).await {
                    Ok(Ok(Some(summary))) => log::info!(
                        "Scheduled backup {} written to {}",
                        summary.backup_id,
                        summary.handle.path().display()
                    ),
                    Ok(Ok(None)) => log::debug!("No scheduled backup due"),
                    Ok(Err(e)) => log::warn!("Scheduled backup failed: {}", e),
                    Err(e) => log::error!("Scheduled backup task died: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log::info!("Backup scheduler stopped");
}

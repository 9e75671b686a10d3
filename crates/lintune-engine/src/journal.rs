use anyhow::{anyhow, Context, Result};
use lintune_core::StepId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::fs_utils::{read_optional, write_atomic};
use crate::HostLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalState {
    Started,
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub step: String,
    pub state: JournalState,
    pub at_unix: u64,
}

/// Append-only record of one run. Advisory only: the probe stays the source
/// of truth, the journal just remembers which step a crashed run was inside.
pub struct RunJournal<'a> {
    layout: &'a HostLayout,
    run_id: String,
    seq: u64,
    interrupted: Option<StepId>,
}

impl<'a> RunJournal<'a> {
    /// Claims the active-run marker. A leftover marker from an interrupted
    /// run is replaced; its journal file stays for inspection and the step
    /// it was inside is kept as [`RunJournal::interrupted`].
    pub fn begin(layout: &'a HostLayout) -> Result<Self> {
        layout.ensure_state_dirs()?;
        let mut interrupted = None;
        if let Some(previous) = read_active_run(layout)? {
            warn!(run_id = %previous, "replacing active marker left by an interrupted run");
            interrupted = read_interrupted_step(layout).unwrap_or_else(|err| {
                warn!(error = %format!("{err:#}"), "ignoring unreadable run journal");
                None
            });
        }

        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system time is before unix epoch")?;
        let run_id = format!("run-{}-{}", started.as_nanos(), std::process::id());
        write_atomic(&layout.run_active_path(), format!("{run_id}\n").as_bytes())
            .context("failed to write active run marker")?;
        debug!(run_id = %run_id, "run journal opened");
        Ok(Self {
            layout,
            run_id,
            seq: 0,
            interrupted,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The step the previous, unfinished run was inside when it stopped.
    pub fn interrupted(&self) -> Option<StepId> {
        self.interrupted
    }

    pub fn record(&mut self, step: StepId, state: JournalState) -> Result<()> {
        self.seq += 1;
        let entry = JournalEntry {
            seq: self.seq,
            step: step.as_str().to_string(),
            state,
            at_unix: current_unix_timestamp()?,
        };
        let path = self.layout.run_journal_path(&self.run_id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open run journal: {}", path.display()))?;
        let line = serde_json::to_string(&entry).context("failed to encode journal entry")?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .with_context(|| format!("failed to append run journal: {}", path.display()))
    }

    /// Marks the run as finished by clearing the active marker.
    pub fn finish(self) -> Result<()> {
        let path = self.layout.run_active_path();
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to clear active run marker: {}", path.display()))?;
        }
        debug!(run_id = %self.run_id, "run journal closed");
        Ok(())
    }
}

pub fn read_active_run(layout: &HostLayout) -> Result<Option<String>> {
    let path = layout.run_active_path();
    let raw = read_optional(&path)
        .with_context(|| format!("failed to read active run marker: {}", path.display()))?;
    Ok(raw
        .map(|raw| raw.trim().to_string())
        .filter(|run_id| !run_id.is_empty()))
}

pub fn read_journal(layout: &HostLayout, run_id: &str) -> Result<Vec<JournalEntry>> {
    let path = layout.run_journal_path(run_id);
    let Some(raw) = read_optional(&path)
        .with_context(|| format!("failed to read run journal: {}", path.display()))?
    else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => entries.push(entry),
            // A crash can leave a torn final line.
            Err(err) if index + 1 == raw.lines().count() => {
                warn!(path = %path.display(), error = %err, "ignoring torn journal line");
            }
            Err(err) => {
                return Err(anyhow!(
                    "invalid journal line {} in {}: {err}",
                    index + 1,
                    path.display()
                ));
            }
        }
    }
    Ok(entries)
}

/// The step an unfinished run had started but never finished, if any.
pub fn read_interrupted_step(layout: &HostLayout) -> Result<Option<StepId>> {
    let Some(run_id) = read_active_run(layout)? else {
        return Ok(None);
    };
    let entries = read_journal(layout, &run_id)?;
    let Some(last) = entries.last() else {
        return Ok(None);
    };
    if last.state != JournalState::Started {
        return Ok(None);
    }
    StepId::parse(&last.step).map(Some)
}

fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

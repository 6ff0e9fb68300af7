//! File-backed work order + run records for the demo binary.
//!
//! Each submitted work order gets one JSON file under `<data_dir>/work_orders/
//! <id>.json`, written with the same temp-then-rename atomic-replace idiom
//! `agentgate_core::queue::persistence` uses for the queue snapshot. This is
//! the "file-backed" half of the in-memory/file-backed stack the CLI runs
//! over in place of a durable database.
//!
//! Restart reconciliation is out of scope (open question resolution):
//! a record's `status` reflects whatever the last process to touch it left
//! behind, and nothing here attempts to resume a `Running` work order that
//! a prior process never finished.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agentgate_core::collaborators::{PersistenceStore, RunListFilter, StatusPatch};
use agentgate_core::model::{IterationData, Run, RunId, WorkOrder, WorkOrderId, WorkOrderStatus};

/// One persisted work order: its immutable intent, current status, and
/// the most recent run's full record, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrderRecord {
    pub work_order: WorkOrder,
    pub status: WorkOrderStatus,
    pub last_run: Option<Run>,
    pub updated_at: DateTime<Utc>,
}

pub fn work_orders_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("work_orders")
}

fn record_path(data_dir: &Path, id: WorkOrderId) -> PathBuf {
    work_orders_dir(data_dir).join(format!("{id}.json"))
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn write_atomic(path: &Path, record: &WorkOrderRecord) -> Result<()> {
    let contents = serde_json::to_vec_pretty(record).context("failed to serialize work order record")?;
    let tmp = tmp_path_for(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    std::fs::write(&tmp, &contents).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

pub fn save_record(data_dir: &Path, record: &WorkOrderRecord) -> Result<()> {
    write_atomic(&record_path(data_dir, record.work_order.id), record)
}

pub fn load_record(data_dir: &Path, id: WorkOrderId) -> Result<Option<WorkOrderRecord>> {
    let path = record_path(data_dir, id);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let record = serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
            Ok(Some(record))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

pub fn delete_record(data_dir: &Path, id: WorkOrderId) -> Result<()> {
    let path = record_path(data_dir, id);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// List every persisted record. Corrupt files are skipped with a warning
/// rather than failing the whole listing.
pub fn list_records(data_dir: &Path) -> Result<Vec<WorkOrderRecord>> {
    let dir = work_orders_dir(data_dir);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in std::fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(entry.path()) {
            Ok(contents) => match serde_json::from_str::<WorkOrderRecord>(&contents) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "skipping unparsable work order record"),
            },
            Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable work order record"),
        }
    }
    Ok(records)
}

/// `PersistenceStore` implementation that writes straight through to the
/// file-backed record for each run's work order. `save_iteration` is a
/// no-op: `Run::iterations` already carries the full per-iteration
/// history, so `save_run` alone keeps the on-disk record current.
pub struct FileBackedPersistenceStore {
    data_dir: PathBuf,
}

impl FileBackedPersistenceStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }
}

#[async_trait]
impl PersistenceStore for FileBackedPersistenceStore {
    async fn save_run(&self, run: &Run) -> anyhow::Result<()> {
        if let Some(mut record) = load_record(&self.data_dir, run.work_order_id)? {
            record.last_run = Some(run.clone());
            record.updated_at = Utc::now();
            save_record(&self.data_dir, &record)?;
        }
        Ok(())
    }

    async fn save_iteration(&self, _run_id: RunId, _iteration: u32, _data: &IterationData) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load_run(&self, id: RunId) -> anyhow::Result<Option<Run>> {
        for record in list_records(&self.data_dir)? {
            if let Some(run) = &record.last_run {
                if run.id == id {
                    return Ok(Some(run.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn list_runs(&self, filter: RunListFilter) -> anyhow::Result<Vec<Run>> {
        Ok(list_records(&self.data_dir)?
            .into_iter()
            .filter(|r| filter.work_order_id.is_none_or(|id| id == r.work_order.id))
            .filter(|r| filter.status.is_none_or(|s| s == r.status))
            .filter_map(|r| r.last_run)
            .collect())
    }

    async fn update_status(&self, id: WorkOrderId, status: WorkOrderStatus, _patch: StatusPatch) -> anyhow::Result<()> {
        if let Some(mut record) = load_record(&self.data_dir, id)? {
            record.status = status;
            record.work_order.status = status;
            record.updated_at = Utc::now();
            save_record(&self.data_dir, &record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgate_core::model::WorkspaceSource;

    fn sample_work_order() -> WorkOrder {
        WorkOrder::new_root("do the thing", WorkspaceSource::LocalPath { path: "/tmp".to_string() })
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let work_order = sample_work_order();
        let id = work_order.id;
        let record = WorkOrderRecord {
            work_order,
            status: WorkOrderStatus::Queued,
            last_run: None,
            updated_at: Utc::now(),
        };

        save_record(dir.path(), &record).unwrap();
        let loaded = load_record(dir.path(), id).unwrap().expect("record present");
        assert_eq!(loaded.work_order.id, id);
        assert_eq!(loaded.status, WorkOrderStatus::Queued);
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_record(dir.path(), WorkOrderId::new()).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn list_records_skips_corrupt_files_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let work_order = sample_work_order();
        let record = WorkOrderRecord {
            work_order,
            status: WorkOrderStatus::Succeeded,
            last_run: None,
            updated_at: Utc::now(),
        };
        save_record(dir.path(), &record).unwrap();

        std::fs::create_dir_all(work_orders_dir(dir.path())).unwrap();
        std::fs::write(work_orders_dir(dir.path()).join("garbage.json"), "not json").unwrap();

        let records = list_records(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn delete_record_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let work_order = sample_work_order();
        let id = work_order.id;
        let record = WorkOrderRecord { work_order, status: WorkOrderStatus::Queued, last_run: None, updated_at: Utc::now() };
        save_record(dir.path(), &record).unwrap();

        delete_record(dir.path(), id).unwrap();
        assert!(load_record(dir.path(), id).unwrap().is_none());
    }
}

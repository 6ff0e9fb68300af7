//! Lease Manager (§4.5).
//!
//! Enforces that at most one run operates on a workspace at a time. The
//! lease table is a `Mutex<HashMap>` serialized per workspace, mirroring
//! the granularity the Process Tracker uses for its own map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::errors::OperationalError;
use crate::model::{Lease, LeaseId, WorkOrderId, WorkspaceId};

#[derive(Debug, Default)]
pub struct LeaseManager {
    leases: Mutex<HashMap<WorkspaceId, Lease>>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lease over `workspace_id`. Fails with `LeaseUnavailable`
    /// only if an *unexpired* lease already exists; an expired lease is
    /// silently replaced.
    pub fn acquire(
        &self,
        workspace_id: WorkspaceId,
        holder_id: WorkOrderId,
        ttl: Duration,
    ) -> Result<Lease, OperationalError> {
        let mut guard = self.leases.lock().expect("lease table poisoned");
        let now = Utc::now();

        if let Some(existing) = guard.get(&workspace_id) {
            if existing.expires_at > now {
                return Err(OperationalError::LeaseUnavailable);
            }
        }

        let ttl_ms = ttl.as_millis() as u64;
        let lease = Lease {
            id: LeaseId::new(),
            workspace_id: workspace_id.clone(),
            holder_work_order_id: holder_id,
            expires_at: now + chrono::Duration::milliseconds(ttl_ms as i64),
            ttl_ms,
        };
        guard.insert(workspace_id, lease.clone());
        Ok(lease)
    }

    /// Extend `expires_at` by the lease's original TTL. Returns `false`
    /// (with a logged warning, never an error) if the lease id is not
    /// currently held — renewal failure is recoverable, not fatal.
    pub fn renew(&self, lease_id: LeaseId) -> bool {
        let mut guard = self.leases.lock().expect("lease table poisoned");
        let entry = guard.values_mut().find(|l| l.id == lease_id);
        match entry {
            Some(lease) => {
                lease.expires_at = Utc::now() + chrono::Duration::milliseconds(lease.ttl_ms as i64);
                true
            }
            None => {
                warn!(lease_id = %lease_id, "renew called on a lease that is no longer held");
                false
            }
        }
    }

    /// Drop the lease on `workspace_id`, if any. Safe to call on all exit
    /// paths including after a crash recovery where no lease was ever
    /// acquired.
    pub fn release(&self, workspace_id: &WorkspaceId) {
        let mut guard = self.leases.lock().expect("lease table poisoned");
        guard.remove(workspace_id);
    }

    pub fn get(&self, workspace_id: &WorkspaceId) -> Option<Lease> {
        let guard = self.leases.lock().expect("lease table poisoned");
        guard.get(workspace_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_acquire_again_fails() {
        let mgr = LeaseManager::new();
        let ws = WorkspaceId::from("ws-1");
        let holder = WorkOrderId::new();

        mgr.acquire(ws.clone(), holder, Duration::from_secs(60))
            .unwrap();

        let err = mgr
            .acquire(ws, WorkOrderId::new(), Duration::from_secs(60))
            .unwrap_err();
        assert_eq!(err, OperationalError::LeaseUnavailable);
    }

    #[test]
    fn release_then_acquire_succeeds() {
        let mgr = LeaseManager::new();
        let ws = WorkspaceId::from("ws-1");
        let holder = WorkOrderId::new();

        let lease = mgr
            .acquire(ws.clone(), holder, Duration::from_secs(60))
            .unwrap();
        mgr.release(&lease.workspace_id);

        assert!(mgr.acquire(ws, WorkOrderId::new(), Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn expired_lease_is_acquirable_by_another_caller() {
        let mgr = LeaseManager::new();
        let ws = WorkspaceId::from("ws-1");
        let original_holder = WorkOrderId::new();

        let mut lease = mgr
            .acquire(ws.clone(), original_holder, Duration::from_secs(60))
            .unwrap();
        // Force expiry by poking the stored record directly through a
        // fresh acquire/release cycle is not possible without a clock
        // seam here, so we simulate by mutating the lease we got back and
        // re-inserting it -- acceptable since this test exercises the
        // comparison logic, not wall-clock passage.
        lease.expires_at = Utc::now() - chrono::Duration::seconds(1);
        {
            let mut guard = mgr.leases.lock().unwrap();
            guard.insert(ws.clone(), lease);
        }

        assert!(mgr.acquire(ws, WorkOrderId::new(), Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn renew_unknown_lease_returns_false() {
        let mgr = LeaseManager::new();
        assert!(!mgr.renew(LeaseId::new()));
    }

    #[test]
    fn renew_extends_expiry() {
        let mgr = LeaseManager::new();
        let ws = WorkspaceId::from("ws-1");
        let lease = mgr
            .acquire(ws.clone(), WorkOrderId::new(), Duration::from_secs(60))
            .unwrap();
        let before = mgr.get(&ws).unwrap().expires_at;

        std::thread::sleep(Duration::from_millis(5));
        assert!(mgr.renew(lease.id));

        let after = mgr.get(&ws).unwrap().expires_at;
        assert!(after >= before);
    }
}

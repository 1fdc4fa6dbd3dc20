//! Approval coordinator
//!
//! Owns the queue of guarded commands waiting for a human decision. Each
//! approval moves from requested to exactly one of approved, rejected or
//! expired. The removal from the state store is the single point where a
//! decision wins; a second decision on the same id is an
//! [`OrchestratorError::ApprovalConflict`] and changes nothing.

use crate::config::ApprovalConfig;
use crate::error::{OrchestratorError, Result};
use crate::executor::CommandExecutor;
use crate::notify::{dispatch, Notification, NotificationKind, NotificationSink};
use crate::state::StateStore;
use crate::types::{
    now, ApprovalId, CommandId, CommandStatus, LogLevel, PendingApproval, Resolution,
};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const SOURCE: &str = "approvals";

/// Bounded memory of resolved ids
#[derive(Debug)]
struct Tombstones {
    order: VecDeque<ApprovalId>,
    ids: HashSet<ApprovalId>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: ApprovalId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn contains(&self, id: &ApprovalId) -> bool {
        self.ids.contains(id)
    }
}

#[derive(Debug)]
pub struct ApprovalCoordinator {
    store: Arc<StateStore>,
    executor: Arc<CommandExecutor>,
    notifier: Arc<dyn NotificationSink>,
    config: ApprovalConfig,
    resolved: Mutex<Tombstones>,
}

impl ApprovalCoordinator {
    pub fn new(
        store: Arc<StateStore>,
        executor: Arc<CommandExecutor>,
        notifier: Arc<dyn NotificationSink>,
        config: ApprovalConfig,
    ) -> Self {
        let resolved = Mutex::new(Tombstones::new(config.tombstone_capacity));
        Self {
            store,
            executor,
            notifier,
            config,
            resolved,
        }
    }

    /// Park a queued command behind a new approval
    pub fn request(&self, command_id: &CommandId, reason: String) -> Result<PendingApproval> {
        let record = self
            .store
            .command(command_id)
            .ok_or_else(|| OrchestratorError::CommandNotFound(command_id.clone()))?;
        if record.status != CommandStatus::Queued {
            return Err(OrchestratorError::InvalidState(format!(
                "command {} is {}, only queued commands can await approval",
                command_id, record.status
            )));
        }

        let requested_at = now();
        let expires_at = self
            .config
            .approval_timeout_secs
            .map(|secs| requested_at + chrono::Duration::seconds(secs as i64));
        let approval = PendingApproval {
            id: ApprovalId::new(),
            command_id: command_id.clone(),
            command_text: record.text.clone(),
            working_directory: record.working_directory.clone(),
            reason: reason.clone(),
            requested_at,
            expires_at,
        };

        self.store.add_approval(approval.clone());
        self.store.log(
            LogLevel::Warn,
            format!(
                "Approval required: {} in {} ({})",
                record.text,
                record.working_directory.display(),
                reason
            ),
            SOURCE,
        );
        dispatch(
            &self.notifier,
            Notification::new(
                NotificationKind::ApprovalRequired,
                "Approval required",
                format!("{}\n{}", record.text, reason),
            ),
        );
        Ok(approval)
    }

    fn conflict(&self, id: &ApprovalId) -> OrchestratorError {
        let reason = if self.resolved.lock().contains(id) {
            "approval already resolved"
        } else {
            "no pending approval with this id"
        };
        OrchestratorError::ApprovalConflict {
            id: id.clone(),
            reason: reason.to_string(),
        }
    }

    fn take(&self, id: &ApprovalId, resolution: Resolution) -> Result<PendingApproval> {
        match self.store.take_approval(id, resolution) {
            Some(approval) => {
                self.resolved.lock().insert(id.clone());
                Ok(approval)
            }
            None => Err(self.conflict(id)),
        }
    }

    /// Release the command to the executor
    pub fn approve(&self, id: &ApprovalId) -> Result<CommandId> {
        let approval = self.take(id, Resolution::Approved)?;
        self.store.log(
            LogLevel::Info,
            format!("Approved: {}", approval.command_text),
            SOURCE,
        );
        self.executor.execute(&approval.command_id)?;
        Ok(approval.command_id)
    }

    /// Reject the command; nothing is spawned
    pub fn reject(&self, id: &ApprovalId) -> Result<CommandId> {
        let approval = self.take(id, Resolution::Rejected)?;
        self.store.update_command(&approval.command_id, |r| {
            r.status = CommandStatus::Rejected;
            r.reason = Some("rejected by operator".to_string());
        })?;
        self.store.log(
            LogLevel::Info,
            format!("Rejected: {}", approval.command_text),
            SOURCE,
        );
        Ok(approval.command_id)
    }

    /// Reject every approval past its deadline. Returns how many expired.
    pub fn expire_overdue(&self) -> usize {
        let current = now();
        let overdue: Vec<ApprovalId> = self
            .store
            .pending_approvals()
            .into_iter()
            .filter(|a| a.expires_at.is_some_and(|at| at <= current))
            .map(|a| a.id)
            .collect();

        let mut expired = 0;
        for id in overdue {
            // Lost races to a human decision are fine.
            let Ok(approval) = self.take(&id, Resolution::Expired) else {
                continue;
            };
            if let Err(err) = self.store.update_command(&approval.command_id, |r| {
                r.status = CommandStatus::Rejected;
                r.reason = Some("approval expired".to_string());
            }) {
                tracing::warn!(%err, "could not reject expired command");
            }
            self.store.log(
                LogLevel::Warn,
                format!("Approval expired: {}", approval.command_text),
                SOURCE,
            );
            expired += 1;
        }
        expired
    }

    /// Periodic expiry sweep; `None` when expiry is disabled
    pub fn spawn_expiry_sweep(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.config.approval_timeout_secs?;
        let coordinator = self.clone();
        let period = Duration::from_millis(self.config.sweep_interval_ms.max(10));
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = coordinator.expire_overdue();
                if expired > 0 {
                    tracing::debug!(expired, "approval sweep");
                }
            }
        }))
    }
}

//! Task dispatch coordinator
//!
//! The coordinator handles:
//! - Persisting tasks and broadcasting them to eligible delegates
//! - Acquire, with connectivity validation for non-whitelisted delegates
//! - Synchronous execution through the wait registry
//! - Asynchronous completion through registered callbacks
//! - Requeue on another delegate within a retry budget
//! - Expiry, abort and reclaiming tasks from vanished delegates

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::wait::{TaskCompletion, WaitRegistry};
use crate::clock::Clock;
use crate::config::DispatchSettings;
use crate::delegate::model::DelegateStatus;
use crate::delegate::registry::DelegateRegistry;
use crate::error::{AppError, Result};
use crate::selection::audit::{BatchSelectionLog, SelectionConclusion, SelectionLogService};
use crate::selection::matcher::CapabilityMatcher;
use crate::selection::whitelist::ConnectionWhitelist;
use crate::store::Store;
use crate::task::model::{
    ConnectionCheck, DelegateTask, DelegateTaskResponse, ResponseCode, TaskRequest, TaskStatus,
};

/// Reason recorded when validation found no delegate that can reach the task's resources
pub const NO_DELEGATE_REACHED: &str = "No delegates could reach the resource";

/// Callback invoked exactly once when an asynchronous task finishes
pub type CompletionCallback = Box<dyn FnOnce(TaskCompletion) + Send + 'static>;

/// Events emitted by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// A queued task was offered to these delegates
    TaskBroadcast {
        account_id: String,
        task_id: Uuid,
        delegate_ids: Vec<Uuid>,
        is_async: bool,
    },
    /// A delegate won the task
    TaskAssigned {
        account_id: String,
        task_id: Uuid,
        delegate_id: Uuid,
    },
    /// The task reached a terminal status
    TaskCompleted {
        account_id: String,
        task_id: Uuid,
        status: TaskStatus,
    },
    /// The task was aborted; its assignee should stop working on it
    TaskAborted {
        account_id: String,
        task_id: Uuid,
        delegate_id: Option<Uuid>,
    },
    /// The task was taken back from a delegate and queued again
    TaskRequeued {
        account_id: String,
        task_id: Uuid,
        from_delegate: Uuid,
    },
}

impl DispatchEvent {
    pub fn account_id(&self) -> &str {
        match self {
            DispatchEvent::TaskBroadcast { account_id, .. }
            | DispatchEvent::TaskAssigned { account_id, .. }
            | DispatchEvent::TaskCompleted { account_id, .. }
            | DispatchEvent::TaskAborted { account_id, .. }
            | DispatchEvent::TaskRequeued { account_id, .. } => account_id,
        }
    }

    /// Whether a delegate's stream should receive this event
    pub fn concerns_delegate(&self, account: &str, delegate_id: Uuid) -> bool {
        if self.account_id() != account {
            return false;
        }
        match self {
            DispatchEvent::TaskBroadcast { delegate_ids, .. } => delegate_ids.contains(&delegate_id),
            DispatchEvent::TaskAssigned { delegate_id: d, .. } => *d == delegate_id,
            DispatchEvent::TaskAborted { delegate_id: d, .. } => *d == Some(delegate_id),
            DispatchEvent::TaskRequeued { from_delegate, .. } => *from_delegate == delegate_id,
            DispatchEvent::TaskCompleted { .. } => false,
        }
    }
}

/// What a delegate gets back from an acquire call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcquireOutcome {
    /// The task is the delegate's to run
    Assigned { task: DelegateTask },
    /// The delegate must check connectivity and report back before it can run the task
    ValidationRequired { task: DelegateTask },
}

/// Result of a synchronous execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed(TaskCompletion),
    /// No response arrived within the task timeout
    TimedOut { task_id: Uuid },
}

/// A queued task visible to a polling delegate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTaskEvent {
    pub task_id: Uuid,
    pub is_async: bool,
}

pub struct TaskDispatchCoordinator {
    store: Store,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
    registry: Arc<DelegateRegistry>,
    matcher: Arc<CapabilityMatcher>,
    whitelist: Arc<ConnectionWhitelist>,
    selection_logs: Arc<SelectionLogService>,
    waiters: WaitRegistry,
    callbacks: Mutex<HashMap<Uuid, CompletionCallback>>,
    event_tx: broadcast::Sender<DispatchEvent>,
}

impl TaskDispatchCoordinator {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
        registry: Arc<DelegateRegistry>,
        matcher: Arc<CapabilityMatcher>,
        whitelist: Arc<ConnectionWhitelist>,
        selection_logs: Arc<SelectionLogService>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            store,
            clock,
            settings,
            registry,
            matcher,
            whitelist,
            selection_logs,
            waiters: WaitRegistry::new(),
            callbacks: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Subscribe to dispatch events
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.event_tx.subscribe()
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<DelegateRegistry> {
        &self.registry
    }

    pub fn selection_logs(&self) -> &Arc<SelectionLogService> {
        &self.selection_logs
    }

    pub fn whitelist(&self) -> &Arc<ConnectionWhitelist> {
        &self.whitelist
    }

    pub async fn get_task(&self, account_id: &str, task_id: Uuid) -> Result<DelegateTask> {
        self.store.get_task(account_id, task_id).await
    }

    // Submission

    fn build_task(&self, account_id: &str, request: TaskRequest) -> Result<DelegateTask> {
        if request.data.task_type.trim().is_empty() {
            return Err(AppError::InvalidRequest("Task type is required".to_string()));
        }
        if request.data.timeout_ms == 0 {
            return Err(AppError::InvalidRequest("Task timeout must be positive".to_string()));
        }
        if request.data.deadline(self.clock.now()).is_none() {
            return Err(AppError::InvalidRequest("Task timeout is too large".to_string()));
        }
        Ok(DelegateTask::from_request(account_id, request, self.clock.now()))
    }

    /// Persist a new task with zero broadcasts
    pub async fn save_delegate_task(&self, account_id: &str, request: TaskRequest) -> Result<DelegateTask> {
        let task = self.build_task(account_id, request)?;
        self.store.insert_task(&task).await?;
        tracing::info!(task_id = %task.id, account_id, task_type = %task.data.task_type, "Task saved");
        Ok(task)
    }

    /// Submit an asynchronous task. `callback` fires once when it finishes.
    pub async fn queue_task(
        &self,
        account_id: &str,
        mut request: TaskRequest,
        callback: Option<CompletionCallback>,
    ) -> Result<DelegateTask> {
        request.data.is_async = true;
        let task = self.build_task(account_id, request)?;

        if let Some(callback) = callback {
            self.callbacks.lock().insert(task.id, callback);
        }
        if let Err(e) = self.store.insert_task(&task).await {
            self.callbacks.lock().remove(&task.id);
            return Err(e);
        }
        tracing::info!(task_id = %task.id, account_id, task_type = %task.data.task_type, "Task queued");

        self.broadcast(&task).await?;
        self.store.get_task(account_id, task.id).await
    }

    /// Submit a synchronous task and wait for its result or its timeout.
    ///
    /// Fails fast with `Unavailable` when no active delegate can take the task.
    pub async fn execute_task(&self, account_id: &str, mut request: TaskRequest) -> Result<ExecutionOutcome> {
        request.data.is_async = false;
        let task = self.build_task(account_id, request)?;

        let mut batch = self.selection_logs.create_batch(account_id, task.id);
        let candidates = match task.pre_assigned_delegate_id {
            Some(delegate_id) => {
                let assignable = self.registry.is_active(account_id, delegate_id).await?
                    && self.matcher.can_assign(&mut batch, delegate_id, &task).await?;
                if assignable {
                    vec![delegate_id]
                } else {
                    Vec::new()
                }
            }
            None => self.eligible_delegates(&task, &mut batch).await?,
        };

        if candidates.is_empty() {
            let message = assignment_error_message(&batch);
            self.selection_logs.save(batch).await;
            tracing::warn!(task_id = %task.id, account_id, "{}", message);
            return Err(AppError::Unavailable(message));
        }

        let rx = self.waiters.register(task.id);
        if let Err(e) = self.store.insert_task(&task).await {
            self.waiters.cancel(task.id);
            return Err(e);
        }
        tracing::info!(task_id = %task.id, account_id, task_type = %task.data.task_type, "Executing task");

        if task.pre_assigned_delegate_id.is_none() {
            self.publish_broadcast(&task, candidates).await?;
        }
        self.selection_logs.save(batch).await;

        let timeout = std::time::Duration::from_millis(task.data.timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(completion)) if completion.status == TaskStatus::Expired => {
                Ok(ExecutionOutcome::TimedOut { task_id: task.id })
            }
            Ok(Ok(completion)) => Ok(ExecutionOutcome::Completed(completion)),
            Ok(Err(_)) => Err(AppError::Internal(format!(
                "Waiter for task {} was dropped",
                task.id
            ))),
            Err(_) => {
                self.waiters.cancel(task.id);
                if self
                    .finish(&task, TaskStatus::Expired, None, Some("Task timed out waiting for a response"))
                    .await?
                {
                    return Ok(ExecutionOutcome::TimedOut { task_id: task.id });
                }
                // A response landed between the timeout and the expiry
                let finished = self.store.get_task(account_id, task.id).await?;
                Ok(ExecutionOutcome::Completed(completion_of(&finished)))
            }
        }
    }

    // Broadcast

    /// Active, untried delegates that pass the matcher
    async fn eligible_delegates(
        &self,
        task: &DelegateTask,
        batch: &mut BatchSelectionLog,
    ) -> Result<Vec<Uuid>> {
        let delegates = self
            .registry
            .list_active_delegates(&task.account_id, batch)
            .await?;

        Ok(delegates
            .iter()
            .filter(|d| !task.has_tried(d.id))
            .filter(|d| self.matcher.can_assign_delegate(batch, d, task))
            .map(|d| d.id)
            .collect())
    }

    /// Offer a queued task to every eligible delegate and count the round.
    /// Pre-assigned tasks are never broadcast.
    pub async fn broadcast(&self, task: &DelegateTask) -> Result<Vec<Uuid>> {
        if task.pre_assigned_delegate_id.is_some() || task.status != TaskStatus::Queued {
            return Ok(Vec::new());
        }

        let mut batch = self.selection_logs.create_batch(&task.account_id, task.id);
        let candidates = self.eligible_delegates(task, &mut batch).await?;
        self.selection_logs.save(batch).await;

        if candidates.is_empty() {
            tracing::debug!(task_id = %task.id, "No eligible delegates for broadcast");
            self.store
                .record_task_broadcast(&task.account_id, task.id, self.clock.now())
                .await?;
            return Ok(candidates);
        }

        self.publish_broadcast(task, candidates.clone()).await?;
        Ok(candidates)
    }

    async fn publish_broadcast(&self, task: &DelegateTask, delegate_ids: Vec<Uuid>) -> Result<()> {
        if !self
            .store
            .record_task_broadcast(&task.account_id, task.id, self.clock.now())
            .await?
        {
            return Ok(());
        }

        tracing::debug!(task_id = %task.id, delegates = delegate_ids.len(), "Broadcasting task");
        let _ = self.event_tx.send(DispatchEvent::TaskBroadcast {
            account_id: task.account_id.clone(),
            task_id: task.id,
            delegate_ids,
            is_async: task.is_async(),
        });
        Ok(())
    }

    /// Queued tasks a delegate could pick up right now
    pub async fn pending_task_events(
        &self,
        account_id: &str,
        delegate_id: Uuid,
    ) -> Result<Vec<PendingTaskEvent>> {
        let delegate = self.registry.get(account_id, delegate_id).await?;
        let mut scratch = BatchSelectionLog::disabled(account_id, Uuid::nil());

        Ok(self
            .store
            .list_queued_tasks(account_id)
            .await?
            .into_iter()
            .filter(|t| t.pre_assigned_delegate_id.map_or(true, |d| d == delegate_id))
            .filter(|t| !t.has_tried(delegate_id))
            .filter(|t| self.matcher.can_assign_delegate(&mut scratch, &delegate, t))
            .map(|t| PendingTaskEvent {
                task_id: t.id,
                is_async: t.is_async(),
            })
            .collect())
    }

    // Acquire

    /// A delegate asks for a task it was offered. Returns `None` when the task
    /// is gone, taken, or not for this delegate.
    pub async fn acquire_delegate_task(
        &self,
        account_id: &str,
        delegate_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<AcquireOutcome>> {
        let task = match self.store.get_task(account_id, task_id).await {
            Ok(task) => task,
            Err(AppError::NotFound(_)) => {
                tracing::warn!(%task_id, %delegate_id, "Acquire for unknown task");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if task.status != TaskStatus::Queued || task.delegate_id.is_some() {
            tracing::debug!(%task_id, %delegate_id, "Task already acquired or finished");
            return Ok(None);
        }
        if task.pre_assigned_delegate_id.map_or(false, |d| d != delegate_id) {
            tracing::debug!(%task_id, %delegate_id, "Task is pre-assigned to another delegate");
            return Ok(None);
        }
        if task.has_tried(delegate_id) {
            return Ok(None);
        }

        let delegate = match self.registry.get(account_id, delegate_id).await {
            Ok(delegate) if delegate.status == DelegateStatus::Enabled => delegate,
            Ok(_) | Err(AppError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut batch = self.selection_logs.create_batch(account_id, task_id);
        if !self.matcher.can_assign_delegate(&mut batch, &delegate, &task) {
            self.selection_logs.save(batch).await;
            return Ok(None);
        }

        if !self.settings.revalidate_whitelisted
            && self.whitelist.is_whitelisted(&task, delegate_id).await?
        {
            let assigned = self.assign(&task, delegate_id, &mut batch).await?;
            self.selection_logs.save(batch).await;
            return Ok(assigned.map(|task| AcquireOutcome::Assigned { task }));
        }
        self.selection_logs.save(batch).await;

        if self.whitelist.should_validate(&task, delegate_id).await? {
            self.store
                .start_task_validation(account_id, task_id, delegate_id, self.clock.now())
                .await?;
            tracing::info!(%task_id, %delegate_id, "Delegate validating connectivity for task");
            let task = self.store.get_task(account_id, task_id).await?;
            return Ok(Some(AcquireOutcome::ValidationRequired { task }));
        }

        tracing::debug!(%task_id, %delegate_id, "Delegate is blacklisted for task");
        Ok(None)
    }

    /// Compare-and-swap assignment
    async fn assign(
        &self,
        task: &DelegateTask,
        delegate_id: Uuid,
        batch: &mut BatchSelectionLog,
    ) -> Result<Option<DelegateTask>> {
        if !self
            .store
            .assign_task(&task.account_id, task.id, delegate_id)
            .await?
        {
            tracing::debug!(task_id = %task.id, %delegate_id, "Lost assignment race");
            return Ok(None);
        }

        batch.log_task_assigned(delegate_id, self.clock.now());
        tracing::info!(task_id = %task.id, %delegate_id, "Task assigned");
        let _ = self.event_tx.send(DispatchEvent::TaskAssigned {
            account_id: task.account_id.clone(),
            task_id: task.id,
            delegate_id,
        });

        Ok(Some(self.store.get_task(&task.account_id, task.id).await?))
    }

    /// Record a delegate's connectivity checks and assign the task to it if it
    /// is now whitelisted
    pub async fn report_connection_results(
        &self,
        account_id: &str,
        delegate_id: Uuid,
        task_id: Uuid,
        results: &[ConnectionCheck],
    ) -> Result<Option<DelegateTask>> {
        self.whitelist
            .save_connection_results(account_id, delegate_id, results)
            .await?;
        self.store
            .complete_task_validation(account_id, task_id, delegate_id)
            .await?;

        let task = self.store.get_task(account_id, task_id).await?;
        if task.status != TaskStatus::Queued {
            return Ok(None);
        }

        if results.iter().any(|r| r.validated) && self.whitelist.is_whitelisted(&task, delegate_id).await? {
            let mut batch = self.selection_logs.create_batch(account_id, task_id);
            let assigned = self.assign(&task, delegate_id, &mut batch).await?;
            self.selection_logs.save(batch).await;
            return Ok(assigned);
        }

        self.fail_if_all_delegates_failed(account_id, delegate_id, task_id)
            .await?;
        Ok(None)
    }

    /// Fail the task once validation is over and no connected delegate is
    /// whitelisted for it. Returns true if the task was failed.
    pub async fn fail_if_all_delegates_failed(
        &self,
        account_id: &str,
        delegate_id: Uuid,
        task_id: Uuid,
    ) -> Result<bool> {
        let task = self.store.get_task(account_id, task_id).await?;
        if task.status != TaskStatus::Queued {
            return Ok(false);
        }
        if !task.validation_complete(self.clock.now(), self.settings.validation_timeout) {
            tracing::debug!(%task_id, %delegate_id, "Validation still in progress");
            return Ok(false);
        }
        if !self
            .whitelist
            .connected_whitelisted_delegates(&task)
            .await?
            .is_empty()
        {
            return Ok(false);
        }

        tracing::info!(%task_id, "No whitelisted delegate left, failing task");
        self.finish(
            &task,
            TaskStatus::Error,
            Some(DelegateTaskResponse::failed(NO_DELEGATE_REACHED)),
            Some(NO_DELEGATE_REACHED),
        )
        .await
    }

    // Completion

    /// Apply a delegate's result. Only the assignee is heard, and only once.
    pub async fn process_delegate_response(
        &self,
        account_id: &str,
        delegate_id: Uuid,
        task_id: Uuid,
        response: DelegateTaskResponse,
    ) -> Result<()> {
        let task = self.store.get_task(account_id, task_id).await?;

        if task.status.is_terminal() {
            tracing::warn!(%task_id, %delegate_id, status = task.status.as_str(), "Ignoring response for finished task");
            return Ok(());
        }
        if task.delegate_id != Some(delegate_id) {
            tracing::warn!(%task_id, %delegate_id, "Ignoring response from a delegate that does not own the task");
            return Ok(());
        }

        match response.response_code {
            ResponseCode::Ok => {
                if self
                    .finish(&task, TaskStatus::Completed, Some(response), None)
                    .await?
                {
                    self.whitelist.refresh(&task, delegate_id).await?;
                }
            }
            ResponseCode::Failed => {
                let reason = response
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Delegate reported failure".to_string());
                self.finish(&task, TaskStatus::Error, Some(response), Some(&reason))
                    .await?;
            }
            ResponseCode::RetryOnOtherDelegate => {
                let reason = response
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Delegate asked to retry elsewhere".to_string());
                self.requeue_or_fail(&task, delegate_id, &reason).await?;
            }
        }
        Ok(())
    }

    /// Hand the task to another delegate if the retry budget allows and one
    /// is available, otherwise fail it
    async fn requeue_or_fail(&self, task: &DelegateTask, delegate_id: Uuid, reason: &str) -> Result<()> {
        let mut tried: BTreeSet<Uuid> = task.already_tried_delegates.clone();
        tried.insert(delegate_id);

        if tried.len() >= self.settings.retry_budget as usize {
            let message = format!("Retry budget exhausted after {} delegates: {}", tried.len(), reason);
            self.finish(task, TaskStatus::Error, None, Some(&message)).await?;
            return Ok(());
        }

        let mut scratch = BatchSelectionLog::disabled(&task.account_id, task.id);
        let alternatives = self
            .registry
            .list_active_delegates(&task.account_id, &mut scratch)
            .await?
            .into_iter()
            .filter(|d| !tried.contains(&d.id))
            .any(|d| self.matcher.can_assign_delegate(&mut scratch, &d, task));
        if !alternatives || task.pre_assigned_delegate_id.is_some() {
            let message = format!("No other delegate available to retry task: {}", reason);
            self.finish(task, TaskStatus::Error, None, Some(&message)).await?;
            return Ok(());
        }

        if !self
            .store
            .requeue_task(&task.account_id, task.id, delegate_id)
            .await?
        {
            return Ok(());
        }

        tracing::info!(task_id = %task.id, from = %delegate_id, reason, "Task requeued");
        let _ = self.event_tx.send(DispatchEvent::TaskRequeued {
            account_id: task.account_id.clone(),
            task_id: task.id,
            from_delegate: delegate_id,
        });

        let requeued = self.store.get_task(&task.account_id, task.id).await?;
        self.broadcast(&requeued).await?;
        Ok(())
    }

    /// Move the task to a terminal status and wake whoever is waiting on it.
    /// Returns false if another path finished it first.
    async fn finish(
        &self,
        task: &DelegateTask,
        status: TaskStatus,
        response: Option<DelegateTaskResponse>,
        error_reason: Option<&str>,
    ) -> Result<bool> {
        if !self
            .store
            .finish_task(&task.account_id, task.id, status, response.as_ref(), error_reason)
            .await?
        {
            tracing::debug!(task_id = %task.id, "Task already finished");
            return Ok(false);
        }

        tracing::info!(task_id = %task.id, status = status.as_str(), "Task finished");
        let completion = TaskCompletion {
            account_id: task.account_id.clone(),
            task_id: task.id,
            status,
            delegate_id: task.delegate_id,
            response,
            error_reason: error_reason.map(str::to_string),
        };

        self.waiters.notify(completion.clone());
        let callback = self.callbacks.lock().remove(&task.id);
        if let Some(callback) = callback {
            callback(completion);
        }

        let _ = self.event_tx.send(DispatchEvent::TaskCompleted {
            account_id: task.account_id.clone(),
            task_id: task.id,
            status,
        });
        Ok(true)
    }

    /// Expire an unfinished task, explaining why no delegate took it
    pub async fn expire_task(&self, account_id: &str, task_id: Uuid) -> Result<bool> {
        let task = self.store.get_task(account_id, task_id).await?;
        let reason = self.selection_logs.expiry_message(account_id, task_id).await;
        self.finish(&task, TaskStatus::Expired, None, Some(&reason)).await
    }

    /// Abort an unfinished task and tell its assignee
    pub async fn abort_task(&self, account_id: &str, task_id: Uuid) -> Result<bool> {
        let task = self.store.get_task(account_id, task_id).await?;
        if !self
            .finish(&task, TaskStatus::Aborted, None, Some("Task aborted"))
            .await?
        {
            return Ok(false);
        }

        let _ = self.event_tx.send(DispatchEvent::TaskAborted {
            account_id: task.account_id.clone(),
            task_id,
            delegate_id: task.delegate_id,
        });
        Ok(true)
    }

    // Periodic work

    /// Re-offer queued tasks whose last round is older than the interval
    pub async fn rebroadcast_due(&self) -> Result<usize> {
        let due = self
            .store
            .list_tasks_due_for_broadcast(
                self.clock.now(),
                self.settings.rebroadcast_interval,
                self.settings.max_broadcast_rounds,
            )
            .await?;

        let mut offered = 0;
        for task in due {
            match self.broadcast(&task).await {
                Ok(delegates) if !delegates.is_empty() => offered += 1,
                Ok(_) => {}
                Err(e) => tracing::error!(task_id = %task.id, "Failed to rebroadcast task: {}", e),
            }
        }
        Ok(offered)
    }

    /// Expire every task past its deadline, then drop callbacks for tasks
    /// finished elsewhere
    pub async fn expire_overdue(&self) -> Result<usize> {
        let mut expired = 0;
        for (account_id, task_id) in self.store.list_overdue_tasks(self.clock.now()).await? {
            match self.expire_task(&account_id, task_id).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(%task_id, "Failed to expire task: {}", e),
            }
        }
        self.sweep_finished_callbacks().await;
        Ok(expired)
    }

    /// Fire and remove callbacks whose task reached a terminal status without
    /// passing through this process, or no longer exists. Returns how many
    /// were removed.
    pub async fn sweep_finished_callbacks(&self) -> usize {
        let pending: Vec<Uuid> = self.callbacks.lock().keys().copied().collect();
        let mut swept = 0;

        for task_id in pending {
            let completion = match self.store.find_task(task_id).await {
                Ok(Some(task)) if task.status.is_terminal() => Some(completion_of(&task)),
                Ok(Some(_)) => continue,
                Ok(None) => None,
                Err(e) => {
                    tracing::error!(%task_id, "Failed to check task for callback sweep: {}", e);
                    continue;
                }
            };

            let Some(callback) = self.callbacks.lock().remove(&task_id) else {
                continue;
            };
            swept += 1;
            match completion {
                Some(completion) => {
                    tracing::debug!(%task_id, "Task finished elsewhere, firing callback");
                    callback(completion);
                }
                None => tracing::warn!(%task_id, "Dropping callback for missing task"),
            }
        }
        swept
    }

    /// Requeue or fail tasks held by delegates that stopped heartbeating
    pub async fn reclaim_from_inactive_delegates(&self) -> Result<usize> {
        let mut reclaimed = 0;
        for task in self.store.list_acquired_tasks().await? {
            let Some(delegate_id) = task.delegate_id else {
                continue;
            };
            if self.registry.is_active(&task.account_id, delegate_id).await? {
                continue;
            }
            tracing::warn!(task_id = %task.id, %delegate_id, "Assignee disconnected before responding");
            self.requeue_or_fail(&task, delegate_id, "Delegate disconnected before responding")
                .await?;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}

fn completion_of(task: &DelegateTask) -> TaskCompletion {
    TaskCompletion {
        account_id: task.account_id.clone(),
        task_id: task.id,
        status: task.status,
        delegate_id: task.delegate_id,
        response: task.response.clone(),
        error_reason: task.error_reason.clone(),
    }
}

/// Explain why no delegate could take a task
fn assignment_error_message(batch: &BatchSelectionLog) -> String {
    let reasons: Vec<String> = batch
        .entries()
        .iter()
        .filter(|e| e.conclusion != SelectionConclusion::Accepted)
        .map(|e| format!("{} ({})", e.message, e.delegate_ids.len()))
        .collect();

    if reasons.is_empty() {
        "No active delegates available to run the task".to_string()
    } else {
        format!(
            "No eligible delegates could perform the required capabilities for this task: {}",
            reasons.join("; ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::delegate::model::NewDelegate;
    use crate::store::test_support::memory_store;
    use crate::task::capability::ExecutionCapability;
    use crate::task::model::TaskData;
    use chrono::Duration;

    struct Fixture {
        coordinator: Arc<TaskDispatchCoordinator>,
        registry: Arc<DelegateRegistry>,
        clock: FakeClock,
    }

    async fn fixture_with(settings: DispatchSettings) -> Fixture {
        let store = memory_store().await;
        let clock = FakeClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let registry = Arc::new(DelegateRegistry::new(
            store.clone(),
            shared.clone(),
            settings.max_heartbeat_age,
        ));
        let matcher = Arc::new(CapabilityMatcher::new(registry.clone(), shared.clone()));
        let whitelist = Arc::new(ConnectionWhitelist::new(
            store.clone(),
            shared.clone(),
            settings.clone(),
            registry.clone(),
            matcher.clone(),
        ));
        let selection_logs = Arc::new(SelectionLogService::new(
            store.clone(),
            shared.clone(),
            settings.selection_logs_enabled,
        ));
        let coordinator = Arc::new(TaskDispatchCoordinator::new(
            store,
            shared,
            settings,
            registry.clone(),
            matcher,
            whitelist,
            selection_logs,
        ));
        Fixture {
            coordinator,
            registry,
            clock,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(DispatchSettings::default()).await
    }

    async fn register(f: &Fixture, host: &str, tags: &[&str]) -> Uuid {
        f.registry
            .register(
                "acct",
                NewDelegate {
                    host_name: host.to_string(),
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id
    }

    fn request(tags: &[&str]) -> TaskRequest {
        TaskRequest::new(TaskData::new("SHELL", 60_000)).with_tags(tags.iter().copied())
    }

    #[tokio::test]
    async fn test_save_delegate_task_starts_with_zero_broadcasts() {
        let f = fixture().await;
        let task = f.coordinator.save_delegate_task("acct", request(&[])).await.unwrap();
        assert_eq!(task.broadcast_count, 0);
        let stored = f.coordinator.get_task("acct", task.id).await.unwrap();
        assert_eq!(stored.broadcast_count, 0);
        assert_eq!(stored.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_zero_timeout_is_rejected() {
        let f = fixture().await;
        let err = f
            .coordinator
            .save_delegate_task("acct", TaskRequest::new(TaskData::new("SHELL", 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_oversized_timeout_is_rejected() {
        let f = fixture().await;
        let huge = TaskRequest::new(TaskData::new("SHELL", 10_000_000_000_000_000));
        match f.coordinator.save_delegate_task("acct", huge.clone()).await {
            Err(AppError::InvalidRequest(msg)) => assert_eq!(msg, "Task timeout is too large"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(
            f.coordinator.execute_task("acct", huge).await,
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_broadcasts_to_matching_delegates_only() {
        let f = fixture().await;
        let matching = register(&f, "h1", &["a"]).await;
        let _other = register(&f, "h2", &["b"]).await;
        let mut events = f.coordinator.subscribe();

        let task = f.coordinator.queue_task("acct", request(&["a"]), None).await.unwrap();

        match events.try_recv().unwrap() {
            DispatchEvent::TaskBroadcast { task_id, delegate_ids, is_async, .. } => {
                assert_eq!(task_id, task.id);
                assert_eq!(delegate_ids, vec![matching]);
                assert!(is_async);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let stored = f.coordinator.get_task("acct", task.id).await.unwrap();
        assert_eq!(stored.broadcast_count, 1);
    }

    #[tokio::test]
    async fn test_pre_assigned_task_is_not_broadcast() {
        let f = fixture().await;
        let owner = register(&f, "h1", &[]).await;
        let other = register(&f, "h2", &[]).await;
        let mut events = f.coordinator.subscribe();

        let task = f
            .coordinator
            .queue_task("acct", request(&[]).pre_assigned_to(owner), None)
            .await
            .unwrap();
        assert!(events.try_recv().is_err());

        assert!(f
            .coordinator
            .acquire_delegate_task("acct", other, task.id)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            f.coordinator.acquire_delegate_task("acct", owner, task.id).await.unwrap(),
            Some(AcquireOutcome::Assigned { .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_assigns_once() {
        let f = fixture().await;
        let d1 = register(&f, "h1", &[]).await;
        let d2 = register(&f, "h2", &[]).await;
        let task = f.coordinator.queue_task("acct", request(&[]), None).await.unwrap();

        let first = f.coordinator.acquire_delegate_task("acct", d1, task.id).await.unwrap();
        match first {
            Some(AcquireOutcome::Assigned { task }) => assert_eq!(task.delegate_id, Some(d1)),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(f
            .coordinator
            .acquire_delegate_task("acct", d2, task.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_acquire_rechecks_capabilities() {
        let f = fixture().await;
        let untagged = register(&f, "h1", &["x"]).await;
        let task = f.coordinator.queue_task("acct", request(&["gpu"]), None).await.unwrap();

        assert!(f
            .coordinator
            .acquire_delegate_task("acct", untagged, task.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_connectivity_validation_flow() {
        let f = fixture().await;
        let delegate = register(&f, "h1", &[]).await;
        let req = request(&[]).with_capability(ExecutionCapability::Http {
            url: "https://artifacts".to_string(),
        });
        let task = f.coordinator.queue_task("acct", req, None).await.unwrap();

        let outcome = f
            .coordinator
            .acquire_delegate_task("acct", delegate, task.id)
            .await
            .unwrap();
        assert!(matches!(outcome, Some(AcquireOutcome::ValidationRequired { .. })));

        let assigned = f
            .coordinator
            .report_connection_results(
                "acct",
                delegate,
                task.id,
                &[ConnectionCheck {
                    criteria: "https://artifacts".to_string(),
                    validated: true,
                }],
            )
            .await
            .unwrap();
        assert_eq!(assigned.unwrap().delegate_id, Some(delegate));
    }

    #[tokio::test]
    async fn test_all_delegates_failing_validation_fails_task() {
        let f = fixture().await;
        let delegate = register(&f, "h1", &[]).await;
        let req = request(&[]).with_capability(ExecutionCapability::Http {
            url: "https://unreachable".to_string(),
        });
        let task = f.coordinator.queue_task("acct", req, None).await.unwrap();

        f.coordinator
            .acquire_delegate_task("acct", delegate, task.id)
            .await
            .unwrap();
        let assigned = f
            .coordinator
            .report_connection_results(
                "acct",
                delegate,
                task.id,
                &[ConnectionCheck {
                    criteria: "https://unreachable".to_string(),
                    validated: false,
                }],
            )
            .await
            .unwrap();
        assert!(assigned.is_none());

        let stored = f.coordinator.get_task("acct", task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
        assert_eq!(stored.error_reason.as_deref(), Some(NO_DELEGATE_REACHED));
    }

    #[tokio::test]
    async fn test_async_callback_fires_once() {
        let f = fixture().await;
        let delegate = register(&f, "h1", &[]).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let task = f
            .coordinator
            .queue_task(
                "acct",
                request(&[]),
                Some(Box::new(move |completion: TaskCompletion| {
                    let _ = tx.send(completion);
                })),
            )
            .await
            .unwrap();

        f.coordinator.acquire_delegate_task("acct", delegate, task.id).await.unwrap();
        let response = DelegateTaskResponse::ok(serde_json::json!({"exit_code": 0}));
        f.coordinator
            .process_delegate_response("acct", delegate, task.id, response.clone())
            .await
            .unwrap();
        f.coordinator
            .process_delegate_response("acct", delegate, task.id, DelegateTaskResponse::failed("late"))
            .await
            .unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.status, TaskStatus::Completed);
        assert_eq!(completion.response, Some(response));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_execute_fails_fast_without_delegates() {
        let f = fixture().await;
        let err = f.coordinator.execute_task("acct", request(&[])).await.unwrap_err();
        assert!(matches!(err, AppError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_execute_waits_for_response() {
        let f = fixture().await;
        let delegate = register(&f, "h1", &[]).await;
        let mut events = f.coordinator.subscribe();

        let responder = {
            let coordinator = f.coordinator.clone();
            tokio::spawn(async move {
                loop {
                    if let Ok(DispatchEvent::TaskBroadcast { task_id, .. }) = events.recv().await {
                        coordinator
                            .acquire_delegate_task("acct", delegate, task_id)
                            .await
                            .unwrap();
                        coordinator
                            .process_delegate_response(
                                "acct",
                                delegate,
                                task_id,
                                DelegateTaskResponse::ok(serde_json::json!("done")),
                            )
                            .await
                            .unwrap();
                        break;
                    }
                }
            })
        };

        let outcome = f.coordinator.execute_task("acct", request(&[])).await.unwrap();
        responder.await.unwrap();
        match outcome {
            ExecutionOutcome::Completed(completion) => {
                assert_eq!(completion.status, TaskStatus::Completed);
                assert_eq!(completion.delegate_id, Some(delegate));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let f = fixture().await;
        register(&f, "h1", &[]).await;

        let outcome = f
            .coordinator
            .execute_task("acct", TaskRequest::new(TaskData::new("SHELL", 50)))
            .await
            .unwrap();
        let task_id = match outcome {
            ExecutionOutcome::TimedOut { task_id } => task_id,
            other => panic!("unexpected outcome: {:?}", other),
        };
        let stored = f.coordinator.get_task("acct", task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Expired);
    }

    #[tokio::test]
    async fn test_retry_on_other_delegate_requeues() {
        let f = fixture().await;
        let d1 = register(&f, "h1", &[]).await;
        let d2 = register(&f, "h2", &[]).await;
        let task = f.coordinator.queue_task("acct", request(&[]), None).await.unwrap();

        f.coordinator.acquire_delegate_task("acct", d1, task.id).await.unwrap();
        f.coordinator
            .process_delegate_response("acct", d1, task.id, DelegateTaskResponse::retry_on_other_delegate("busy"))
            .await
            .unwrap();

        let stored = f.coordinator.get_task("acct", task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert!(stored.has_tried(d1));
        assert!(f.coordinator.acquire_delegate_task("acct", d1, task.id).await.unwrap().is_none());
        assert!(f.coordinator.acquire_delegate_task("acct", d2, task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_without_alternative_fails() {
        let f = fixture().await;
        let d1 = register(&f, "h1", &[]).await;
        let task = f.coordinator.queue_task("acct", request(&[]), None).await.unwrap();

        f.coordinator.acquire_delegate_task("acct", d1, task.id).await.unwrap();
        f.coordinator
            .process_delegate_response("acct", d1, task.id, DelegateTaskResponse::retry_on_other_delegate("busy"))
            .await
            .unwrap();

        let stored = f.coordinator.get_task("acct", task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
        assert!(stored.error_reason.unwrap().contains("No other delegate"));
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let settings = DispatchSettings {
            retry_budget: 2,
            ..DispatchSettings::default()
        };
        let f = fixture_with(settings).await;
        let delegates = [
            register(&f, "h1", &[]).await,
            register(&f, "h2", &[]).await,
            register(&f, "h3", &[]).await,
        ];
        let task = f.coordinator.queue_task("acct", request(&[]), None).await.unwrap();

        for delegate in &delegates[..2] {
            f.coordinator.acquire_delegate_task("acct", *delegate, task.id).await.unwrap();
            f.coordinator
                .process_delegate_response(
                    "acct",
                    *delegate,
                    task.id,
                    DelegateTaskResponse::retry_on_other_delegate("busy"),
                )
                .await
                .unwrap();
        }

        let stored = f.coordinator.get_task("acct", task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
        assert!(stored.error_reason.unwrap().starts_with("Retry budget exhausted"));
    }

    #[tokio::test]
    async fn test_response_from_non_assignee_is_ignored() {
        let f = fixture().await;
        let d1 = register(&f, "h1", &[]).await;
        let d2 = register(&f, "h2", &[]).await;
        let task = f.coordinator.queue_task("acct", request(&[]), None).await.unwrap();
        f.coordinator.acquire_delegate_task("acct", d1, task.id).await.unwrap();

        f.coordinator
            .process_delegate_response("acct", d2, task.id, DelegateTaskResponse::ok(serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(
            f.coordinator.get_task("acct", task.id).await.unwrap().status,
            TaskStatus::Acquired
        );
    }

    #[tokio::test]
    async fn test_abort_notifies_assignee() {
        let f = fixture().await;
        let d1 = register(&f, "h1", &[]).await;
        let task = f.coordinator.queue_task("acct", request(&[]), None).await.unwrap();
        f.coordinator.acquire_delegate_task("acct", d1, task.id).await.unwrap();
        let mut events = f.coordinator.subscribe();

        assert!(f.coordinator.abort_task("acct", task.id).await.unwrap());
        assert!(!f.coordinator.abort_task("acct", task.id).await.unwrap());

        let mut saw_abort = false;
        while let Ok(event) = events.try_recv() {
            if let DispatchEvent::TaskAborted { delegate_id, .. } = event {
                assert_eq!(delegate_id, Some(d1));
                saw_abort = true;
            }
        }
        assert!(saw_abort);
    }

    #[tokio::test]
    async fn test_expire_overdue_uses_selection_logs() {
        let f = fixture().await;
        register(&f, "h1", &["a"]).await;
        let task = f.coordinator.queue_task("acct", request(&["gpu"]), None).await.unwrap();

        f.clock.advance(Duration::minutes(2));
        assert_eq!(f.coordinator.expire_overdue().await.unwrap(), 1);

        let stored = f.coordinator.get_task("acct", task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Expired);
        assert!(stored.error_reason.unwrap().contains("The selector gpu is configured in"));
    }

    #[tokio::test]
    async fn test_expire_overdue_skips_unreadable_task() {
        let f = fixture().await;
        let broken = f.coordinator.queue_task("acct", request(&[]), None).await.unwrap();
        let healthy = f.coordinator.queue_task("acct", request(&[]), None).await.unwrap();

        sqlx::query("UPDATE delegate_tasks SET tags = 'not json' WHERE id = ?")
            .bind(broken.id.to_string())
            .execute(f.coordinator.store.pool())
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(2));
        assert_eq!(f.coordinator.expire_overdue().await.unwrap(), 1);
        let stored = f.coordinator.get_task("acct", healthy.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Expired);
    }

    #[tokio::test]
    async fn test_callback_for_task_finished_elsewhere_is_swept() {
        let f = fixture().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let task = f
            .coordinator
            .queue_task(
                "acct",
                request(&[]),
                Some(Box::new(move |completion: TaskCompletion| {
                    let _ = tx.send(completion);
                })),
            )
            .await
            .unwrap();

        // Another instance aborts the task through the shared store
        assert!(f
            .coordinator
            .store
            .finish_task("acct", task.id, TaskStatus::Aborted, None, Some("Task aborted"))
            .await
            .unwrap());
        f.coordinator.callbacks.lock().insert(Uuid::new_v4(), Box::new(|_: TaskCompletion| {}));

        assert_eq!(f.coordinator.expire_overdue().await.unwrap(), 0);
        assert!(f.coordinator.callbacks.lock().is_empty());

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.task_id, task.id);
        assert_eq!(completion.status, TaskStatus::Aborted);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_rebroadcast_due_respects_interval() {
        let f = fixture().await;
        register(&f, "h1", &[]).await;
        let task = f.coordinator.queue_task("acct", request(&[]), None).await.unwrap();

        assert_eq!(f.coordinator.rebroadcast_due().await.unwrap(), 0);
        f.clock.advance(Duration::seconds(6));
        assert_eq!(f.coordinator.rebroadcast_due().await.unwrap(), 1);
        assert_eq!(
            f.coordinator.get_task("acct", task.id).await.unwrap().broadcast_count,
            2
        );
    }

    #[tokio::test]
    async fn test_reclaim_from_disconnected_delegate() {
        let f = fixture().await;
        let d1 = register(&f, "h1", &[]).await;
        let req = TaskRequest::new(TaskData::new("SHELL", 3_600_000));
        let task = f.coordinator.queue_task("acct", req, None).await.unwrap();
        f.coordinator.acquire_delegate_task("acct", d1, task.id).await.unwrap();

        f.clock.advance(Duration::seconds(20));
        let d2 = register(&f, "h2", &[]).await;
        f.clock.advance(Duration::seconds(300));

        assert_eq!(f.coordinator.reclaim_from_inactive_delegates().await.unwrap(), 1);
        let stored = f.coordinator.get_task("acct", task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert!(f.coordinator.acquire_delegate_task("acct", d2, task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pending_task_events() {
        let f = fixture().await;
        let d1 = register(&f, "h1", &["a"]).await;
        let mine = f.coordinator.queue_task("acct", request(&["a"]), None).await.unwrap();
        f.coordinator.queue_task("acct", request(&["z"]), None).await.unwrap();

        let pending = f.coordinator.pending_task_events("acct", d1).await.unwrap();
        assert_eq!(
            pending,
            vec![PendingTaskEvent {
                task_id: mine.id,
                is_async: true
            }]
        );
    }

    #[test]
    fn test_event_routing() {
        let delegate = Uuid::new_v4();
        let event = DispatchEvent::TaskBroadcast {
            account_id: "acct".to_string(),
            task_id: Uuid::new_v4(),
            delegate_ids: vec![delegate],
            is_async: false,
        };
        assert!(event.concerns_delegate("acct", delegate));
        assert!(!event.concerns_delegate("other", delegate));
        assert!(!event.concerns_delegate("acct", Uuid::new_v4()));
    }
}

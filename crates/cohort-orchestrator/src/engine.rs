use crate::assignment::{AssignmentEngine, AssignmentRecord};
use crate::config::{CoordinationStrategy, OrchestratorConfig};
use crate::events::{AgentEvent, Subscribers, TaskEvent};
use crate::formation::{Formation, FormationManager, FormationType};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::types::{
    Agent, AgentRole, AgentStatus, AgentUpdate, CoordinationRule, Group, Position, Task,
    TaskPriority, TaskStatus, TaskType,
};
use chrono::{DateTime, Utc};
use cohort_core::{CohortError, CohortResult};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const GROUP_METADATA_KEY: &str = "group_id";
const SHUTDOWN_REASON: &str = "shutdown";
const REPLACED_REASON: &str = "replaced";

/// Running totals since the orchestrator was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorCounters {
    pub cycles: u64,
    pub cycle_errors: u64,
    pub tasks_added: u64,
    pub tasks_assigned: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
}

/// Agent registry summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSummary {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub by_role: HashMap<AgentRole, usize>,
}

/// Point-in-time view of the whole orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationStatus {
    pub active: bool,
    pub strategy: CoordinationStrategy,
    pub agents: AgentSummary,
    pub groups: usize,
    pub formations: usize,
    pub rules: usize,
    pub tasks: SchedulerStats,
    pub counters: OrchestratorCounters,
    pub timestamp: DateTime<Utc>,
}

/// What an agent is currently working on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub task_id: String,
    pub title: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub progress: f64,
}

struct OrchestratorState {
    agents: HashMap<String, Agent>,
    scheduler: Scheduler,
    groups: HashMap<String, Group>,
    formations: FormationManager,
    rules: HashMap<String, CoordinationRule>,
    counters: OrchestratorCounters,
}

impl OrchestratorState {
    /// Free the agents of a task that reached a terminal status and build the
    /// matching event.
    fn settle(&mut self, task: &Task) -> TaskEvent {
        let mut released = Vec::new();
        for agent_id in &task.assigned_agents {
            if let Some(agent) = self.agents.get_mut(agent_id) {
                if agent.current_task.as_deref() == Some(task.id.as_str()) {
                    agent.current_task = None;
                    agent.status = AgentStatus::Idle;
                    released.push(agent_id.clone());
                }
            }
        }

        match task.status {
            TaskStatus::Completed => {
                self.counters.tasks_completed += 1;
                TaskEvent::Completed {
                    task_id: task.id.clone(),
                    agent_ids: released,
                }
            }
            TaskStatus::Failed => {
                self.counters.tasks_failed += 1;
                TaskEvent::Failed {
                    task_id: task.id.clone(),
                    reason: task.failure_reason.clone(),
                }
            }
            _ => {
                self.counters.tasks_cancelled += 1;
                TaskEvent::Cancelled {
                    task_id: task.id.clone(),
                    reason: task.failure_reason.clone().unwrap_or_default(),
                }
            }
        }
    }

    fn untag_members(&mut self, group: &Group) {
        for member in &group.members {
            if let Some(agent) = self.agents.get_mut(member) {
                let tagged = agent
                    .metadata
                    .get(GROUP_METADATA_KEY)
                    .and_then(|v| v.as_str())
                    == Some(group.id.as_str());
                if tagged {
                    agent.metadata.remove(GROUP_METADATA_KEY);
                }
            }
        }
    }

    fn drop_group(&mut self, group_id: &str) -> Option<Group> {
        let group = self.groups.remove(group_id)?;
        if let Some(formation_id) = &group.formation_id {
            self.formations.remove(formation_id);
        }
        self.untag_members(&group);
        Some(group)
    }
}

struct Shared {
    config: OrchestratorConfig,
    state: RwLock<OrchestratorState>,
    /// Always locked after `state`, never across an await.
    engine: parking_lot::Mutex<AssignmentEngine>,
    subscribers: Subscribers,
    running: AtomicBool,
}

impl Shared {
    /// One assignment pass: match ready tasks against available agents.
    async fn run_cycle(&self) -> CohortResult<usize> {
        let mut events = Vec::new();
        let assigned = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            state.counters.cycles += 1;

            let ready: Vec<Task> = state
                .scheduler
                .ready()
                .into_iter()
                .take(self.config.max_tasks_per_cycle)
                .cloned()
                .collect();
            if ready.is_empty() {
                return Ok(0);
            }

            let mut idle: Vec<String> = state
                .agents
                .values()
                .filter(|agent| agent.is_available())
                .map(|agent| agent.id.clone())
                .collect();
            if idle.is_empty() {
                debug!(ready = ready.len(), "No available agents this cycle");
                return Ok(0);
            }
            idle.sort();

            let mut engine = self.engine.lock();
            let mut assigned = 0;
            for task in &ready {
                if idle.is_empty() {
                    break;
                }
                let selected = {
                    let pool: Vec<&Agent> =
                        idle.iter().filter_map(|id| state.agents.get(id)).collect();
                    engine.assign(task, &pool)
                };
                if selected.is_empty() {
                    continue;
                }

                if !state.scheduler.assign(&task.id, &selected) {
                    return Err(CohortError::Orchestrator(format!(
                        "ready task {} disappeared before assignment",
                        task.id
                    )));
                }
                for agent_id in &selected {
                    if let Some(agent) = state.agents.get_mut(agent_id) {
                        agent.current_task = Some(task.id.clone());
                        agent.status = AgentStatus::Busy;
                    }
                }
                idle.retain(|id| !selected.contains(id));
                state.counters.tasks_assigned += 1;
                assigned += 1;

                info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    agents = ?selected,
                    "Task dispatched"
                );
                events.push(TaskEvent::Assigned {
                    task_id: task.id.clone(),
                    agent_ids: selected,
                });
            }
            assigned
        };

        self.subscribers.emit_tasks(&events);
        Ok(assigned)
    }
}

/// Run one pass with errors and panics contained. Returns how long to sleep
/// before the next pass.
async fn guarded_pass<F>(shared: &Shared, pass: F) -> Duration
where
    F: Future<Output = CohortResult<usize>>,
{
    let fault = match AssertUnwindSafe(pass).catch_unwind().await {
        Ok(Ok(_)) => return shared.config.cycle_interval(),
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("cycle panicked: {}", panic_message(payload.as_ref())),
    };
    error!(
        error = %fault,
        backoff_ms = shared.config.error_backoff_ms,
        "Orchestration cycle failed; backing off"
    );
    shared.state.write().await.counters.cycle_errors += 1;
    shared.config.error_backoff()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn run_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    info!("Orchestration loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let delay = guarded_pass(&shared, shared.run_cycle()).await;

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("Orchestration loop stopped");
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Coordinates agents, tasks, groups, and formations.
///
/// The orchestrator is an explicit handle: construct one per coordination
/// domain and share it behind an `Arc`. Registration and task calls are
/// serialized with the background cycle through a single state lock.
///
/// ```no_run
/// # async fn demo() -> cohort_core::CohortResult<()> {
/// use cohort_orchestrator::{Agent, AgentRole, Orchestrator, OrchestratorConfig, Task, TaskType};
///
/// let orchestrator = Orchestrator::new(OrchestratorConfig::default());
/// orchestrator.register_agent(Agent::new("a1", "Aria", AgentRole::Dps, 30)).await?;
/// orchestrator.add_task(Task::new(TaskType::Combat, "Clear the camp")).await;
/// orchestrator.start().await;
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let shared = Shared {
            state: RwLock::new(OrchestratorState {
                agents: HashMap::new(),
                scheduler: Scheduler::new(config.task_history_capacity),
                groups: HashMap::new(),
                formations: FormationManager::new(),
                rules: HashMap::new(),
                counters: OrchestratorCounters::default(),
            }),
            engine: parking_lot::Mutex::new(AssignmentEngine::new(
                config.assignment_history_capacity,
            )),
            subscribers: Subscribers::default(),
            running: AtomicBool::new(false),
            config,
        };
        Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    // --- Lifecycle ---

    /// Spawn the background cycle. Returns `false` if it is already running.
    pub async fn start(&self) -> bool {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            warn!("Orchestrator already running");
            return false;
        }
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.shared.clone(), rx));
        *worker = Some(Worker { handle, shutdown });
        self.shared.running.store(true, Ordering::SeqCst);
        info!(
            interval_ms = self.shared.config.cycle_interval_ms,
            strategy = %self.shared.config.strategy,
            "Orchestrator started"
        );
        true
    }

    /// Signal the background cycle to stop and wait for it, bounded by the
    /// configured stop timeout. Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(Worker {
            mut handle,
            shutdown,
        }) = self.worker.lock().await.take()
        else {
            return false;
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(self.shared.config.stop_timeout(), &mut handle).await {
            Ok(Ok(())) => info!("Orchestrator stopped"),
            Ok(Err(e)) => warn!(error = %e, "Orchestration worker ended abnormally"),
            Err(_) => {
                warn!(
                    timeout_ms = self.shared.config.stop_timeout_ms,
                    "Orchestration worker did not stop in time; aborting"
                );
                handle.abort();
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
        true
    }

    /// Run a single assignment pass now. Returns the number of tasks assigned.
    pub async fn run_cycle(&self) -> CohortResult<usize> {
        self.shared.run_cycle().await
    }

    /// Stop the cycle, cancel every active task, and return all agents to idle.
    pub async fn shutdown(&self) {
        self.stop().await;

        let events = {
            let mut guard = self.shared.state.write().await;
            let state = &mut *guard;
            let active: Vec<String> = state.scheduler.active().map(|t| t.id.clone()).collect();
            let mut events = Vec::with_capacity(active.len());
            for task_id in active {
                if let Some(task) = state.scheduler.cancel(&task_id, SHUTDOWN_REASON) {
                    events.push(state.settle(&task));
                }
            }
            for agent in state.agents.values_mut() {
                agent.current_task = None;
                agent.status = AgentStatus::Idle;
            }
            info!(cancelled = events.len(), "Orchestrator shut down");
            events
        };
        self.shared.subscribers.emit_tasks(&events);
    }

    // --- Agents ---

    /// Register an agent, or replace a known one. A replaced agent keeps its
    /// current task.
    pub async fn register_agent(&self, mut agent: Agent) -> CohortResult<()> {
        let agent_id = agent.id.clone();
        {
            let mut state = self.shared.state.write().await;
            let carried = match state.agents.get(&agent_id) {
                Some(existing) => existing
                    .current_task
                    .clone()
                    .map(|task_id| (task_id, existing.status)),
                None => {
                    let max = self.shared.config.max_agents;
                    if state.agents.len() >= max {
                        warn!(agent_id = %agent_id, max, "Agent registry full");
                        return Err(CohortError::Capacity(format!(
                            "cannot register agent {agent_id}: registry holds the maximum of {max} agents"
                        )));
                    }
                    None
                }
            };

            // Only the orchestrator hands out tasks.
            match carried {
                Some((task_id, status)) => {
                    agent.current_task = Some(task_id);
                    agent.status = status;
                }
                None => {
                    if let Some(stale) = agent.current_task.take() {
                        debug!(agent_id = %agent_id, task_id = %stale, "Dropping unknown current task");
                    }
                    if agent.status == AgentStatus::Busy {
                        agent.status = AgentStatus::Idle;
                    }
                }
            }
            agent.last_update = Utc::now();
            state.agents.insert(agent_id.clone(), agent);
        }

        info!(agent_id = %agent_id, "Agent registered");
        self.shared
            .subscribers
            .emit_agent(&AgentEvent::Registered { agent_id });
        Ok(())
    }

    /// Remove an agent, cancelling its active task and dropping it from
    /// groups and formations.
    pub async fn unregister_agent(&self, agent_id: &str) -> Option<Agent> {
        let (agent, events) = {
            let mut guard = self.shared.state.write().await;
            let state = &mut *guard;
            let Some(agent) = state.agents.remove(agent_id) else {
                warn!(agent_id = %agent_id, "Cannot unregister unknown agent");
                return None;
            };

            let mut events = Vec::new();
            if let Some(task_id) = &agent.current_task {
                if let Some(task) = state.scheduler.cancel(task_id, "agent unregistered") {
                    events.push(state.settle(&task));
                }
            }

            let mut emptied = Vec::new();
            for group in state.groups.values_mut() {
                if group.members.iter().any(|m| m == agent_id) {
                    group.members.retain(|m| m != agent_id);
                    if group.leader.as_deref() == Some(agent_id) {
                        group.leader = group.members.first().cloned();
                    }
                    if group.members.is_empty() {
                        emptied.push(group.id.clone());
                    }
                }
            }
            for group_id in emptied {
                state.drop_group(&group_id);
                info!(group_id = %group_id, "Group dissolved after losing its last member");
            }
            state.formations.remove_member(agent_id);
            self.shared.engine.lock().forget_agent(agent_id);

            (agent, events)
        };

        info!(agent_id = %agent_id, "Agent unregistered");
        self.shared.subscribers.emit_tasks(&events);
        self.shared.subscribers.emit_agent(&AgentEvent::Unregistered {
            agent_id: agent_id.to_string(),
        });
        Some(agent)
    }

    /// Merge a partial state update into a registered agent.
    pub async fn update_agent_state(&self, agent_id: &str, update: AgentUpdate) -> bool {
        {
            let mut state = self.shared.state.write().await;
            let Some(agent) = state.agents.get_mut(agent_id) else {
                warn!(agent_id = %agent_id, "State update for unknown agent");
                return false;
            };
            agent.apply(update);
        }
        debug!(agent_id = %agent_id, "Agent state updated");
        self.shared.subscribers.emit_agent(&AgentEvent::Updated {
            agent_id: agent_id.to_string(),
        });
        true
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.shared.state.read().await.agents.get(agent_id).cloned()
    }

    /// All registered agents, sorted by id.
    pub async fn agents(&self) -> Vec<Agent> {
        let state = self.shared.state.read().await;
        let mut agents: Vec<Agent> = state.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub async fn agent_count(&self) -> usize {
        self.shared.state.read().await.agents.len()
    }

    // --- Tasks ---

    /// Queue a task. A task with an existing id replaces it; if that task
    /// was active it is cancelled with reason `"replaced"` and its agents are
    /// freed first.
    pub async fn add_task(&self, task: Task) -> String {
        let mut events = Vec::with_capacity(2);
        let task_id = {
            let mut guard = self.shared.state.write().await;
            let state = &mut *guard;
            if state.scheduler.is_active(&task.id) {
                if let Some(replaced) = state.scheduler.cancel(&task.id, REPLACED_REASON) {
                    events.push(state.settle(&replaced));
                }
            }
            state.counters.tasks_added += 1;
            state.scheduler.add(task)
        };
        info!(task_id = %task_id, "Task queued");
        events.push(TaskEvent::Added {
            task_id: task_id.clone(),
        });
        self.shared.subscribers.emit_tasks(&events);
        task_id
    }

    /// Cancel a pending or active task, freeing its agents.
    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> bool {
        let event = {
            let mut guard = self.shared.state.write().await;
            let state = &mut *guard;
            let Some(task) = state.scheduler.cancel(task_id, reason) else {
                return false;
            };
            state.settle(&task)
        };
        self.shared.subscribers.emit_tasks(&[event]);
        true
    }

    /// Report progress on an active task. A terminal status frees its agents.
    pub async fn update_task_progress(
        &self,
        task_id: &str,
        progress: f64,
        status: Option<TaskStatus>,
    ) -> bool {
        let event = {
            let mut guard = self.shared.state.write().await;
            let state = &mut *guard;
            let Some(task) = state.scheduler.update_progress(task_id, progress, status) else {
                return false;
            };
            if task.status.is_terminal() {
                state.settle(&task)
            } else {
                TaskEvent::Progress {
                    task_id: task.id.clone(),
                    progress: task.progress,
                    status: task.status,
                }
            }
        };
        self.shared.subscribers.emit_tasks(&[event]);
        true
    }

    /// Mark an active task failed, freeing its agents.
    pub async fn fail_task(&self, task_id: &str, reason: &str) -> bool {
        let event = {
            let mut guard = self.shared.state.write().await;
            let state = &mut *guard;
            let Some(task) = state.scheduler.fail(task_id, reason) else {
                return false;
            };
            state.settle(&task)
        };
        self.shared.subscribers.emit_tasks(&[event]);
        true
    }

    /// Look a task up in the backlog, the active set, or recent history.
    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.shared.state.read().await.scheduler.get(task_id).cloned()
    }

    /// Ids of tasks currently eligible for assignment, in dispatch order.
    pub async fn ready_tasks(&self) -> Vec<String> {
        let state = self.shared.state.read().await;
        state.scheduler.ready().iter().map(|t| t.id.clone()).collect()
    }

    /// Whether the recorded task dependencies contain a cycle.
    pub async fn has_dependency_cycle(&self) -> bool {
        self.shared.state.read().await.scheduler.has_cycle()
    }

    pub async fn task_statistics(&self) -> SchedulerStats {
        self.shared.state.read().await.scheduler.stats()
    }

    /// Feed a finished task's outcome back into assignment scoring.
    pub fn update_performance(
        &self,
        agent_id: &str,
        task_type: TaskType,
        success: bool,
        efficiency: f64,
    ) {
        self.shared
            .engine
            .lock()
            .update_performance(agent_id, task_type, success, efficiency);
    }

    /// The most recent `limit` assignment records, oldest first.
    pub fn assignment_history(&self, limit: usize) -> Vec<AssignmentRecord> {
        let engine = self.shared.engine.lock();
        let records: Vec<&AssignmentRecord> = engine.history().collect();
        let skip = records.len().saturating_sub(limit);
        records.into_iter().skip(skip).cloned().collect()
    }

    // --- Groups and formations ---

    /// Create a group from registered agents, optionally laid out in a
    /// formation anchored at the leader. Unknown member ids are skipped. An
    /// existing group with the same id is replaced.
    pub async fn create_group(
        &self,
        group_id: impl Into<String>,
        name: impl Into<String>,
        members: &[String],
        formation: Option<FormationType>,
    ) -> CohortResult<Group> {
        let group_id = group_id.into();
        let name = name.into();

        let mut guard = self.shared.state.write().await;
        let state = &mut *guard;

        let mut known: Vec<String> = Vec::with_capacity(members.len());
        for member in members {
            if !state.agents.contains_key(member) {
                warn!(group_id = %group_id, agent_id = %member, "Skipping unknown group member");
            } else if !known.contains(member) {
                known.push(member.clone());
            }
        }
        if known.is_empty() {
            return Err(CohortError::NotFound(format!(
                "group {group_id} has no registered members"
            )));
        }

        if state.drop_group(&group_id).is_some() {
            debug!(group_id = %group_id, "Replacing existing group");
        }

        let leader = known[0].clone();
        let formation_id = formation.map(|formation_type| {
            let anchor = state
                .agents
                .get(&leader)
                .and_then(|agent| agent.position)
                .unwrap_or_default();
            state
                .formations
                .create(name.clone(), formation_type, &known, anchor)
                .id
                .clone()
        });

        for member in &known {
            if let Some(agent) = state.agents.get_mut(member) {
                agent.metadata.insert(
                    GROUP_METADATA_KEY.to_string(),
                    serde_json::Value::String(group_id.clone()),
                );
            }
        }

        let group = Group {
            id: group_id.clone(),
            name,
            members: known,
            leader: Some(leader),
            formation_id,
            created_at: Utc::now(),
        };
        state.groups.insert(group_id.clone(), group.clone());
        info!(group_id = %group_id, members = group.members.len(), "Group created");
        Ok(group)
    }

    /// Dissolve a group, removing its formation and member tags.
    pub async fn dissolve_group(&self, group_id: &str) -> bool {
        let mut state = self.shared.state.write().await;
        match state.drop_group(group_id) {
            Some(_) => {
                info!(group_id = %group_id, "Group dissolved");
                true
            }
            None => {
                warn!(group_id = %group_id, "Cannot dissolve unknown group");
                false
            }
        }
    }

    pub async fn get_group(&self, group_id: &str) -> Option<Group> {
        self.shared.state.read().await.groups.get(group_id).cloned()
    }

    pub async fn groups(&self) -> Vec<Group> {
        let state = self.shared.state.read().await;
        let mut groups: Vec<Group> = state.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups
    }

    pub async fn formation(&self, formation_id: &str) -> Option<Formation> {
        self.shared
            .state
            .read()
            .await
            .formations
            .get(formation_id)
            .cloned()
    }

    /// World position assigned to an agent by a formation.
    pub async fn formation_position(&self, formation_id: &str, agent_id: &str) -> Option<Position> {
        self.shared
            .state
            .read()
            .await
            .formations
            .position_of(formation_id, agent_id)
    }

    /// Move a formation's anchor.
    pub async fn move_formation(&self, formation_id: &str, anchor: Position) -> bool {
        self.shared
            .state
            .write()
            .await
            .formations
            .set_anchor(formation_id, anchor)
    }

    /// Rotate a formation around its anchor.
    pub async fn rotate_formation(&self, formation_id: &str, degrees: f64) -> bool {
        self.shared
            .state
            .write()
            .await
            .formations
            .set_rotation(formation_id, degrees)
    }

    // --- Coordination rules ---

    /// Store a rule, replacing any rule with the same id.
    pub async fn add_rule(&self, rule: CoordinationRule) {
        let mut state = self.shared.state.write().await;
        debug!(rule_id = %rule.id, "Coordination rule stored");
        state.rules.insert(rule.id.clone(), rule);
    }

    pub async fn remove_rule(&self, rule_id: &str) -> bool {
        self.shared.state.write().await.rules.remove(rule_id).is_some()
    }

    /// All rules, highest priority first.
    pub async fn rules(&self) -> Vec<CoordinationRule> {
        let state = self.shared.state.read().await;
        let mut rules: Vec<CoordinationRule> = state.rules.values().cloned().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        rules
    }

    /// Enabled rules that apply to an agent, highest priority first.
    pub async fn rules_for_agent(&self, agent_id: &str) -> Vec<CoordinationRule> {
        self.rules()
            .await
            .into_iter()
            .filter(|rule| rule.enabled && rule.applies_to(agent_id))
            .collect()
    }

    // --- Callbacks ---

    pub fn add_task_callback<F>(&self, callback: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.add_task(Arc::new(callback));
    }

    pub fn add_agent_callback<F>(&self, callback: F)
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.add_agent(Arc::new(callback));
    }

    // --- Observability ---

    pub async fn status(&self) -> OrchestrationStatus {
        let state = self.shared.state.read().await;

        let mut agents = AgentSummary {
            total: state.agents.len(),
            ..Default::default()
        };
        for agent in state.agents.values() {
            *agents.by_role.entry(agent.role).or_insert(0) += 1;
            if agent.is_available() {
                agents.available += 1;
            }
            if agent.current_task.is_some() {
                agents.busy += 1;
            }
        }

        OrchestrationStatus {
            active: self.is_running(),
            strategy: self.shared.config.strategy,
            agents,
            groups: state.groups.len(),
            formations: state.formations.count(),
            rules: state.rules.len(),
            tasks: state.scheduler.stats(),
            counters: state.counters.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Current task of every busy agent, keyed by agent id.
    pub async fn agent_assignments(&self) -> HashMap<String, AgentAssignment> {
        let state = self.shared.state.read().await;
        state
            .agents
            .values()
            .filter_map(|agent| {
                let task = state.scheduler.get(agent.current_task.as_deref()?)?;
                Some((
                    agent.id.clone(),
                    AgentAssignment {
                        task_id: task.id.clone(),
                        title: task.title.clone(),
                        task_type: task.task_type,
                        priority: task.priority,
                        progress: task.progress,
                    },
                ))
            })
            .collect()
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::TaskRequirements;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn test_cycle_skips_without_agents() {
        let orch = orchestrator();
        orch.add_task(Task::new(TaskType::Combat, "fight")).await;
        assert_eq!(orch.run_cycle().await.unwrap(), 0);
        assert_eq!(orch.task_statistics().await.pending, 1);
        assert_eq!(orch.status().await.counters.cycles, 1);
    }

    #[tokio::test]
    async fn test_cycle_skips_without_tasks() {
        let orch = orchestrator();
        orch.register_agent(Agent::new("a1", "Aria", AgentRole::Dps, 10))
            .await
            .unwrap();
        assert_eq!(orch.run_cycle().await.unwrap(), 0);
        assert!(orch.get_agent("a1").await.unwrap().is_available());
    }

    #[tokio::test]
    async fn test_cycle_assigns_and_marks_busy() {
        let orch = orchestrator();
        orch.register_agent(Agent::new("a1", "Aria", AgentRole::Dps, 10))
            .await
            .unwrap();
        let task_id = orch
            .add_task(Task::new(TaskType::Combat, "fight"))
            .await;

        assert_eq!(orch.run_cycle().await.unwrap(), 1);

        let agent = orch.get_agent("a1").await.unwrap();
        assert_eq!(agent.current_task.as_deref(), Some(task_id.as_str()));
        assert_eq!(agent.status, AgentStatus::Busy);

        let task = orch.get_task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_agents, vec!["a1"]);
    }

    #[tokio::test]
    async fn test_no_double_booking_within_cycle() {
        let orch = orchestrator();
        orch.register_agent(Agent::new("a1", "Aria", AgentRole::Dps, 10))
            .await
            .unwrap();
        orch.add_task(Task::new(TaskType::Combat, "first").with_priority(TaskPriority::High))
            .await;
        orch.add_task(Task::new(TaskType::Combat, "second")).await;

        assert_eq!(orch.run_cycle().await.unwrap(), 1);
        let stats = orch.task_statistics().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.pending, 1);

        let assignments = orch.agent_assignments().await;
        assert_eq!(assignments["a1"].title, "first");
    }

    #[tokio::test]
    async fn test_cycle_respects_task_cap() {
        let config = OrchestratorConfig {
            max_tasks_per_cycle: 2,
            ..Default::default()
        };
        let orch = Orchestrator::new(config);
        for i in 0..4 {
            orch.register_agent(Agent::new(format!("a{i}"), "g", AgentRole::Gatherer, 5))
                .await
                .unwrap();
            orch.add_task(Task::new(TaskType::Gathering, format!("ore {i}")))
                .await;
        }
        assert_eq!(orch.run_cycle().await.unwrap(), 2);
        assert_eq!(orch.run_cycle().await.unwrap(), 2);
        assert_eq!(orch.run_cycle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_group_task_takes_several_agents() {
        let orch = orchestrator();
        for (id, role) in [
            ("tank", AgentRole::Tank),
            ("healer", AgentRole::Healer),
            ("dps", AgentRole::Dps),
            ("trader", AgentRole::Trader),
        ] {
            orch.register_agent(Agent::new(id, id, role, 30)).await.unwrap();
        }
        let task_id = orch
            .add_task(Task::new(TaskType::Combat, "dungeon").with_requirements(
                TaskRequirements {
                    required_agents: Some(3),
                    ..Default::default()
                },
            ))
            .await;

        orch.run_cycle().await.unwrap();
        let mut agents = orch.get_task(&task_id).await.unwrap().assigned_agents;
        agents.sort();
        assert_eq!(agents, vec!["dps", "healer", "tank"]);
        assert!(orch.get_agent("trader").await.unwrap().is_available());
    }

    #[tokio::test]
    async fn test_register_replaces_but_keeps_task() {
        let orch = orchestrator();
        orch.register_agent(Agent::new("a1", "Aria", AgentRole::Dps, 10))
            .await
            .unwrap();
        let task_id = orch.add_task(Task::new(TaskType::Combat, "fight")).await;
        orch.run_cycle().await.unwrap();

        orch.register_agent(Agent::new("a1", "Aria II", AgentRole::Dps, 11))
            .await
            .unwrap();
        let agent = orch.get_agent("a1").await.unwrap();
        assert_eq!(agent.name, "Aria II");
        assert_eq!(agent.current_task, Some(task_id));
        assert_eq!(orch.agent_count().await, 1);
    }

    async fn exploding_pass() -> CohortResult<usize> {
        panic!("scoring bug")
    }

    async fn failing_pass() -> CohortResult<usize> {
        Err(CohortError::Orchestrator("scheduler out of sync".into()))
    }

    fn backoff_config() -> OrchestratorConfig {
        OrchestratorConfig {
            cycle_interval_ms: 10,
            error_backoff_ms: 250,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_panicking_pass_backs_off() {
        let orch = Orchestrator::new(backoff_config());
        let delay = guarded_pass(&orch.shared, exploding_pass()).await;
        assert_eq!(delay, Duration::from_millis(250));
        assert_eq!(orch.status().await.counters.cycle_errors, 1);

        // The state lock is usable again after the unwind.
        orch.register_agent(Agent::new("a1", "Aria", AgentRole::Dps, 10))
            .await
            .unwrap();
        assert_eq!(orch.agent_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_pass_backs_off() {
        let orch = Orchestrator::new(backoff_config());
        let delay = guarded_pass(&orch.shared, failing_pass()).await;
        assert_eq!(delay, Duration::from_millis(250));
        assert_eq!(orch.status().await.counters.cycle_errors, 1);
    }

    #[tokio::test]
    async fn test_clean_pass_uses_cycle_interval() {
        let orch = Orchestrator::new(backoff_config());
        let delay = guarded_pass(&orch.shared, orch.shared.run_cycle()).await;
        assert_eq!(delay, Duration::from_millis(10));
        let counters = orch.status().await.counters;
        assert_eq!((counters.cycles, counters.cycle_errors), (1, 0));
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_update_unknown_agent() {
        let orch = orchestrator();
        assert!(!orch.update_agent_state("ghost", AgentUpdate::default()).await);
    }

    #[tokio::test]
    async fn test_rules_ordering_and_filtering() {
        let orch = orchestrator();
        let mut low = CoordinationRule::new("low", "always", "wave");
        low.priority = 1;
        let mut high = CoordinationRule::new("high", "health < 30", "retreat");
        high.priority = 10;
        high.applicable_agents = vec!["a1".into()];
        let mut off = CoordinationRule::new("off", "never", "dance");
        off.enabled = false;

        orch.add_rule(low).await;
        orch.add_rule(high).await;
        orch.add_rule(off).await;

        let ids: Vec<String> = orch.rules().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["high", "low", "off"]);

        let for_a1: Vec<String> = orch
            .rules_for_agent("a1")
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(for_a1, vec!["high", "low"]);

        let for_a2: Vec<String> = orch
            .rules_for_agent("a2")
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(for_a2, vec!["low"]);

        assert!(orch.remove_rule("low").await);
        assert!(!orch.remove_rule("low").await);
        assert_eq!(orch.status().await.rules, 2);
    }

    #[tokio::test]
    async fn test_assignment_history_limit() {
        let orch = orchestrator();
        orch.register_agent(Agent::new("a1", "Aria", AgentRole::Generalist, 10))
            .await
            .unwrap();
        for i in 0..3 {
            let id = orch
                .add_task(Task::new(TaskType::Social, format!("chat {i}")))
                .await;
            orch.run_cycle().await.unwrap();
            orch.update_task_progress(&id, 100.0, Some(TaskStatus::Completed))
                .await;
        }
        assert_eq!(orch.assignment_history(10).len(), 3);
        assert_eq!(orch.assignment_history(2).len(), 2);
        assert_eq!(orch.status().await.counters.tasks_completed, 3);
    }
}

//! Multi-agent coordination core: task scheduling, agent selection, and
//! spatial formations behind a single orchestrator.
//!
//! Agents register with the [`Orchestrator`], tasks are queued into its
//! [`Scheduler`], and each cycle the [`AssignmentEngine`] matches ready tasks
//! to available agents. Groups of agents can be laid out in formations
//! through the [`FormationManager`].
//!
//! # Main types
//!
//! - [`Orchestrator`]: Owns all state and runs the periodic assignment cycle.
//! - [`Scheduler`]: Dependency-aware task backlog with bounded history.
//! - [`AssignmentEngine`]: Scores agents and selects individuals or groups.
//! - [`FormationManager`]: Template and custom spatial layouts.
//! - [`OrchestratorConfig`]: Cycle timing, capacities, and strategy.

/// Agent scoring, group selection, and performance learning.
pub mod assignment;
/// Orchestrator configuration.
pub mod config;
/// The orchestrator and its background cycle.
pub mod engine;
/// Task and agent notifications.
pub mod events;
/// Spatial formations.
pub mod formation;
/// Dependency-aware task scheduler.
pub mod scheduler;
/// Shared orchestration types (Agent, Task, Group, etc.).
pub mod types;

pub use assignment::{AssignmentEngine, AssignmentRecord};
pub use config::{CoordinationStrategy, OrchestratorConfig};
pub use engine::{
    AgentAssignment, AgentSummary, OrchestrationStatus, Orchestrator, OrchestratorCounters,
};
pub use events::{AgentCallback, AgentEvent, TaskCallback, TaskEvent};
pub use formation::{Formation, FormationManager, FormationType, Offset};
pub use scheduler::{Scheduler, SchedulerStats};
pub use types::{
    Agent, AgentRole, AgentStatus, AgentUpdate, CoordinationRule, Difficulty, Group, Position,
    Resources, Task, TaskPriority, TaskRequirements, TaskStatus, TaskType,
};

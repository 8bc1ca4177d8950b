use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A point in world space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to another position.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Combat/utility role of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Tank,
    Healer,
    Dps,
    Support,
    Leader,
    Scout,
    Gatherer,
    Crafter,
    Trader,
    Generalist,
}

impl AgentRole {
    /// How well this role suits a task type, in `[0, 1]`.
    pub fn affinity(self, task_type: TaskType) -> f64 {
        use AgentRole::*;
        use TaskType::*;
        match (self, task_type) {
            (Tank, Combat) => 0.9,
            (Healer, Combat) => 0.8,
            (Dps, Combat) => 1.0,
            (Support, Combat) => 0.6,
            (Leader, Combat) => 0.6,
            (Tank, Questing) | (Healer, Questing) | (Dps, Questing) => 0.7,
            (Leader, Questing) => 0.8,
            (Gatherer, Gathering) => 1.0,
            (Scout, Gathering) => 0.6,
            (Crafter, Crafting) => 1.0,
            (Gatherer, Crafting) => 0.5,
            (Scout, Exploration) => 1.0,
            (Dps, Exploration) => 0.6,
            (Trader, Trading) => 1.0,
            (Crafter, Trading) => 0.6,
            (Leader, Social) | (Trader, Social) => 0.8,
            (Support, Social) => 0.7,
            (Leader, Coordination) => 1.0,
            (Support, Coordination) => 0.8,
            (Healer, Coordination) => 0.6,
            (Support, Maintenance) | (Crafter, Maintenance) => 0.7,
            (Generalist, _) => 0.6,
            (_, Combat) => 0.3,
            _ => 0.5,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentRole::Tank => "tank",
            AgentRole::Healer => "healer",
            AgentRole::Dps => "dps",
            AgentRole::Support => "support",
            AgentRole::Leader => "leader",
            AgentRole::Scout => "scout",
            AgentRole::Gatherer => "gatherer",
            AgentRole::Crafter => "crafter",
            AgentRole::Trader => "trader",
            AgentRole::Generalist => "generalist",
        };
        f.write_str(name)
    }
}

/// Lifecycle status reported for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Ready,
    Busy,
    Resting,
    Offline,
}

/// Resource levels of an agent, each a percentage in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub health: f64,
    pub mana: f64,
    pub stamina: f64,
    pub durability: f64,
    pub inventory_free: f64,
}

impl Resources {
    pub fn average(&self) -> f64 {
        (self.health + self.mana + self.stamina + self.durability + self.inventory_free) / 5.0
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            health: 100.0,
            mana: 100.0,
            stamina: 100.0,
            durability: 100.0,
            inventory_free: 100.0,
        }
    }
}

/// A managed character the orchestrator can assign work to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub level: u32,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub buffs: Vec<String>,
    #[serde(default)]
    pub debuffs: Vec<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub in_combat: bool,
    pub role: AgentRole,
    #[serde(default)]
    pub specializations: Vec<String>,
    /// Capability name to proficiency score.
    #[serde(default)]
    pub capabilities: HashMap<String, f64>,
    pub last_update: DateTime<Utc>,
    pub status: AgentStatus,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: AgentRole, level: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            level,
            position: None,
            zone: None,
            resources: Resources::default(),
            buffs: Vec::new(),
            debuffs: Vec::new(),
            target: None,
            in_combat: false,
            role,
            specializations: Vec::new(),
            capabilities: HashMap::new(),
            last_update: Utc::now(),
            status: AgentStatus::Idle,
            current_task: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_capability(mut self, name: impl Into<String>, score: f64) -> Self {
        self.capabilities.insert(name.into(), score);
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Free to take a task: no current task and idle or ready.
    pub fn is_available(&self) -> bool {
        self.current_task.is_none()
            && matches!(self.status, AgentStatus::Idle | AgentStatus::Ready)
    }

    /// Whether the agent covers a required capability, either through a
    /// positive capability score or a matching specialization.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.get(name).is_some_and(|score| *score > 0.0)
            || self.specializations.iter().any(|s| s == name)
    }

    /// Shallow-merge a partial update. Fields absent from `update` are kept.
    pub fn apply(&mut self, update: AgentUpdate) {
        let AgentUpdate {
            name,
            level,
            position,
            zone,
            resources,
            buffs,
            debuffs,
            target,
            in_combat,
            role,
            specializations,
            capabilities,
            status,
            metadata,
        } = update;

        if let Some(v) = name {
            self.name = v;
        }
        if let Some(v) = level {
            self.level = v;
        }
        if let Some(v) = position {
            self.position = Some(v);
        }
        if let Some(v) = zone {
            self.zone = Some(v);
        }
        if let Some(v) = resources {
            self.resources = v;
        }
        if let Some(v) = buffs {
            self.buffs = v;
        }
        if let Some(v) = debuffs {
            self.debuffs = v;
        }
        if let Some(v) = target {
            self.target = Some(v);
        }
        if let Some(v) = in_combat {
            self.in_combat = v;
        }
        if let Some(v) = role {
            self.role = v;
        }
        if let Some(v) = specializations {
            self.specializations = v;
        }
        if let Some(v) = capabilities {
            self.capabilities = v;
        }
        if let Some(v) = status {
            self.status = v;
        }
        if let Some(v) = metadata {
            self.metadata.extend(v);
        }
        self.last_update = Utc::now();
    }
}

/// Partial agent state pushed by a perception source.
///
/// Unknown JSON fields are ignored on deserialization. `current_task` is not
/// part of the update: only the orchestrator assigns work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub level: Option<u32>,
    pub position: Option<Position>,
    pub zone: Option<String>,
    pub resources: Option<Resources>,
    pub buffs: Option<Vec<String>>,
    pub debuffs: Option<Vec<String>>,
    pub target: Option<String>,
    pub in_combat: Option<bool>,
    pub role: Option<AgentRole>,
    pub specializations: Option<Vec<String>>,
    pub capabilities: Option<HashMap<String, f64>>,
    pub status: Option<AgentStatus>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Category of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Combat,
    Questing,
    Gathering,
    Crafting,
    Exploration,
    Trading,
    Social,
    Coordination,
    Maintenance,
}

impl TaskType {
    /// Number of agents a task of this type needs before requirement adjustments.
    pub fn base_agent_count(self) -> usize {
        match self {
            TaskType::Coordination => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskType::Combat => "combat",
            TaskType::Questing => "questing",
            TaskType::Gathering => "gathering",
            TaskType::Crafting => "crafting",
            TaskType::Exploration => "exploration",
            TaskType::Trading => "trading",
            TaskType::Social => "social",
            TaskType::Coordination => "coordination",
            TaskType::Maintenance => "maintenance",
        };
        f.write_str(name)
    }
}

/// Task urgency. Variants are declared most urgent first, so the derived
/// `Ord` sorts `Critical` before `Background`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
    Background,
}

/// Status of a task in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    OnHold,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Difficulty tier used to scale the number of agents a task needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Normal,
    Hard,
    Extreme,
}

/// Requirements attached to a task. Keys the scorer does not know about land
/// in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRequirements {
    pub difficulty: Option<Difficulty>,
    pub min_level: Option<u32>,
    pub capabilities: Vec<String>,
    pub group_content: bool,
    pub raid_content: bool,
    #[serde(alias = "required_characters")]
    pub required_agents: Option<usize>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A unit of work in the orchestration backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(default)]
    pub requirements: TaskRequirements,
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default)]
    pub assigned_agents: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub location: Option<Position>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub rewards: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Percentage in `[0, 100]`.
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Task {
    pub fn new(task_type: TaskType, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            title: title.into(),
            description: String::new(),
            priority: TaskPriority::Medium,
            status: TaskStatus::Pending,
            requirements: TaskRequirements::default(),
            estimated_duration_secs: None,
            assigned_agents: Vec::new(),
            dependencies: Vec::new(),
            location: None,
            zone: None,
            rewards: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            failure_reason: None,
            subtasks: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_location(mut self, location: Position) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_estimated_duration(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }
}

/// A coordination rule kept by the orchestrator. Conditions and actions are
/// opaque strings interpreted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationRule {
    pub id: String,
    pub condition: String,
    pub action: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Agents this rule applies to; empty means every agent.
    #[serde(default)]
    pub applicable_agents: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl CoordinationRule {
    pub fn new(id: impl Into<String>, condition: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            condition: condition.into(),
            action: action.into(),
            priority: 0,
            enabled: true,
            applicable_agents: Vec::new(),
        }
    }

    pub fn applies_to(&self, agent_id: &str) -> bool {
        self.applicable_agents.is_empty() || self.applicable_agents.iter().any(|a| a == agent_id)
    }
}

/// A set of agents coordinated together, optionally in a formation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    pub leader: Option<String>,
    pub formation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new(TaskType::Gathering, "Collect ore");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert!(task.dependencies.is_empty());
        assert!(task.assigned_agents.is_empty());
        assert!(Uuid::parse_str(&task.id).is_ok());
    }

    #[test]
    fn test_priority_ordering() {
        let mut priorities = vec![
            TaskPriority::Low,
            TaskPriority::Critical,
            TaskPriority::Background,
            TaskPriority::High,
            TaskPriority::Medium,
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                TaskPriority::Critical,
                TaskPriority::High,
                TaskPriority::Medium,
                TaskPriority::Low,
                TaskPriority::Background,
            ]
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::OnHold.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_agent_availability() {
        let mut agent = Agent::new("a1", "Aria", AgentRole::Healer, 10);
        assert!(agent.is_available());

        agent.status = AgentStatus::Ready;
        assert!(agent.is_available());

        agent.status = AgentStatus::Resting;
        assert!(!agent.is_available());

        agent.status = AgentStatus::Idle;
        agent.current_task = Some("t1".into());
        assert!(!agent.is_available());
    }

    #[test]
    fn test_agent_apply_is_shallow_merge() {
        let mut agent = Agent::new("a1", "Aria", AgentRole::Healer, 10)
            .with_position(Position::new(1.0, 2.0, 3.0));
        let before = agent.last_update;

        agent.apply(AgentUpdate {
            level: Some(12),
            in_combat: Some(true),
            ..Default::default()
        });

        assert_eq!(agent.level, 12);
        assert!(agent.in_combat);
        assert_eq!(agent.name, "Aria");
        assert_eq!(agent.position, Some(Position::new(1.0, 2.0, 3.0)));
        assert!(agent.last_update >= before);
    }

    #[test]
    fn test_agent_update_ignores_unknown_fields() {
        let update: AgentUpdate =
            serde_json::from_str(r#"{"level": 7, "screen_region": [0, 0, 10, 10]}"#).unwrap();
        assert_eq!(update.level, Some(7));
        assert!(update.name.is_none());
    }

    #[test]
    fn test_has_capability() {
        let mut agent = Agent::new("a1", "Brom", AgentRole::Crafter, 20)
            .with_capability("smithing", 0.8)
            .with_capability("tailoring", 0.0);
        agent.specializations.push("alchemy".into());

        assert!(agent.has_capability("smithing"));
        assert!(agent.has_capability("alchemy"));
        assert!(!agent.has_capability("tailoring"));
        assert!(!agent.has_capability("fishing"));
    }

    #[test]
    fn test_requirements_accept_legacy_keys() {
        let req: TaskRequirements = serde_json::from_str(
            r#"{"difficulty": "hard", "required_characters": 3, "boss": "dragon"}"#,
        )
        .unwrap();
        assert_eq!(req.difficulty, Some(Difficulty::Hard));
        assert_eq!(req.required_agents, Some(3));
        assert_eq!(req.extra.get("boss"), Some(&serde_json::json!("dragon")));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(AgentRole::Tank.to_string(), "tank");
        assert_eq!(AgentRole::Dps.to_string(), "dps");
        assert_eq!(TaskType::Coordination.to_string(), "coordination");
    }

    #[test]
    fn test_rule_applies_to() {
        let mut rule = CoordinationRule::new("r1", "health < 30", "retreat");
        assert!(rule.applies_to("anyone"));
        rule.applicable_agents = vec!["a1".into()];
        assert!(rule.applies_to("a1"));
        assert!(!rule.applies_to("a2"));
    }

    #[test]
    fn test_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert!((a.distance_to(&b) - 5.0).abs() < 1e-9);
    }
}

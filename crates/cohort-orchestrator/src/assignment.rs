use crate::types::{Agent, AgentRole, Difficulty, Position, Task, TaskType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Smoothing factor for the per-agent performance average.
pub const PERFORMANCE_LEARNING_RATE: f64 = 0.2;

const NEUTRAL: f64 = 0.5;

const AFFINITY_WEIGHT: f64 = 0.4;
const RESOURCE_WEIGHT: f64 = 0.2;
const PERFORMANCE_WEIGHT: f64 = 0.1;
const UNDER_LEVEL_PENALTY: f64 = 0.3;
const LEVEL_BONUS_PER_LEVEL: f64 = 0.02;
const MAX_LEVEL_BONUS: f64 = 0.2;
const MAX_PROXIMITY_BONUS: f64 = 0.2;
const PROXIMITY_RANGE: f64 = 1000.0;
const CAPABILITY_STEP: f64 = 0.1;
const BUSY_PENALTY: f64 = 0.2;

const INDIVIDUAL_SHARE: f64 = 0.6;
const SYNERGY_SHARE: f64 = 0.4;
const DIVERSITY_WEIGHT: f64 = 0.3;
const TRINITY_BONUS: f64 = 0.4;
const PARTIAL_TRINITY_BONUS: f64 = 0.2;
const MAX_BALANCE_BONUS: f64 = 0.2;
/// Level standard deviation at which the balance bonus reaches zero.
const BALANCE_RANGE: f64 = 10.0;
const MAX_CLUSTER_BONUS: f64 = 0.1;
const CLUSTER_RANGE: f64 = 500.0;

/// One selection made by the engine, kept for analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub task_id: String,
    pub task_type: TaskType,
    pub agent_ids: Vec<String>,
    pub score: f64,
    pub assigned_at: DateTime<Utc>,
}

/// Scores agents against tasks and picks who should take them.
///
/// Tasks needing one agent go to the best individual scorer. Larger tasks
/// grow a group greedily from the best individual, adding whichever candidate
/// maximizes `0.6 * individual + 0.4 * synergy`. The only learned state is a
/// per-agent, per-task-type moving average of reported performance.
pub struct AssignmentEngine {
    performance: HashMap<String, HashMap<TaskType, f64>>,
    history: VecDeque<AssignmentRecord>,
    history_capacity: usize,
}

impl AssignmentEngine {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            performance: HashMap::new(),
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
        }
    }

    /// Number of agents a task needs.
    ///
    /// Starts from the task type's base count, adjusts for difficulty, applies
    /// the group (2) and raid (4) floors, then raises to any explicit count.
    pub fn required_count(task: &Task) -> usize {
        let req = &task.requirements;
        let mut count = task.task_type.base_agent_count();

        count = match req.difficulty {
            Some(Difficulty::Easy) => count.saturating_sub(1).max(1),
            Some(Difficulty::Hard) => count + 1,
            Some(Difficulty::Extreme) => count + 2,
            Some(Difficulty::Normal) | None => count,
        };
        if req.group_content {
            count = count.max(2);
        }
        if req.raid_content {
            count = count.max(4);
        }
        if let Some(explicit) = req.required_agents {
            count = count.max(explicit);
        }
        count
    }

    /// Select agents for `task` from `candidates`.
    ///
    /// Returns an empty list when there are no candidates. When fewer
    /// candidates exist than the task needs, all of them are selected. Every
    /// call is recorded in the history, empty selections with a score of 0.
    pub fn assign(&mut self, task: &Task, candidates: &[&Agent]) -> Vec<String> {
        let required = Self::required_count(task);
        if required == 0 || candidates.is_empty() {
            self.record(task, &[], 0.0);
            return Vec::new();
        }

        let (selected, score) = if required == 1 {
            match self.best_individual(task, candidates) {
                Some((idx, score)) => (vec![candidates[idx].id.clone()], score),
                None => (Vec::new(), 0.0),
            }
        } else {
            self.select_group(task, candidates, required)
        };

        debug!(
            task_id = %task.id,
            required,
            selected = selected.len(),
            score,
            "Assignment selected"
        );
        self.record(task, &selected, score);
        selected
    }

    fn best_individual(&self, task: &Task, candidates: &[&Agent]) -> Option<(usize, f64)> {
        candidates
            .iter()
            .enumerate()
            .map(|(idx, agent)| (idx, self.score_agent(agent, task)))
            .fold(None, |best, (idx, score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((idx, score)),
            })
    }

    fn select_group(&self, task: &Task, candidates: &[&Agent], size: usize) -> (Vec<String>, f64) {
        let scores: Vec<f64> = candidates
            .iter()
            .map(|agent| self.score_agent(agent, task))
            .collect();

        let Some((first, _)) = self.best_individual(task, candidates) else {
            return (Vec::new(), 0.0);
        };
        let mut chosen = vec![first];
        let mut remaining: Vec<usize> = (0..candidates.len()).filter(|&i| i != first).collect();

        while chosen.len() < size && !remaining.is_empty() {
            let mut best: Option<(usize, f64)> = None;
            for (pos, &idx) in remaining.iter().enumerate() {
                let mut group: Vec<&Agent> = chosen.iter().map(|&i| candidates[i]).collect();
                group.push(candidates[idx]);
                let combined = INDIVIDUAL_SHARE * scores[idx]
                    + SYNERGY_SHARE * Self::synergy_score(&group, task);
                if best.map_or(true, |(_, b)| combined > b) {
                    best = Some((pos, combined));
                }
            }
            let Some((pos, _)) = best else {
                break;
            };
            chosen.push(remaining.remove(pos));
        }

        let group: Vec<&Agent> = chosen.iter().map(|&i| candidates[i]).collect();
        let mean_individual =
            chosen.iter().map(|&i| scores[i]).sum::<f64>() / chosen.len() as f64;
        let score = INDIVIDUAL_SHARE * mean_individual
            + SYNERGY_SHARE * Self::synergy_score(&group, task);
        let ids = group.iter().map(|agent| agent.id.clone()).collect();
        (ids, score)
    }

    /// Fitness of a single agent for a task, in `[0, 1]`.
    pub fn score_agent(&self, agent: &Agent, task: &Task) -> f64 {
        let req = &task.requirements;

        let mut score = agent.role.affinity(task.task_type) * AFFINITY_WEIGHT;
        score += (agent.resources.average() / 100.0).clamp(0.0, 1.0) * RESOURCE_WEIGHT;

        let min_level = req.min_level.unwrap_or(1);
        if agent.level < min_level {
            score -= UNDER_LEVEL_PENALTY;
        } else {
            let surplus = f64::from(agent.level - min_level);
            score += (surplus * LEVEL_BONUS_PER_LEVEL).min(MAX_LEVEL_BONUS);
        }

        if let (Some(position), Some(location)) = (agent.position, task.location) {
            let distance = position.distance_to(&location);
            score += MAX_PROXIMITY_BONUS * (1.0 - distance / PROXIMITY_RANGE).max(0.0);
        }

        for capability in &req.capabilities {
            if agent.has_capability(capability) {
                score += CAPABILITY_STEP;
            } else {
                score -= CAPABILITY_STEP;
            }
        }

        score += self
            .performance(&agent.id, task.task_type)
            .unwrap_or(NEUTRAL)
            * PERFORMANCE_WEIGHT;

        if agent.current_task.is_some() {
            score -= BUSY_PENALTY;
        }

        if !score.is_finite() {
            return 0.0;
        }
        score.clamp(0.0, 1.0)
    }

    /// How well a set of agents complements each other for a task, in `[0, 1]`.
    /// Groups smaller than two score a neutral 0.5.
    pub fn synergy_score(group: &[&Agent], task: &Task) -> f64 {
        if group.len() < 2 {
            return NEUTRAL;
        }
        let n = group.len() as f64;

        let roles: HashSet<AgentRole> = group.iter().map(|agent| agent.role).collect();
        let mut score = roles.len() as f64 / n * DIVERSITY_WEIGHT;

        if task.task_type == TaskType::Combat {
            let trinity = [AgentRole::Tank, AgentRole::Healer, AgentRole::Dps]
                .iter()
                .filter(|role| roles.contains(role))
                .count();
            if trinity == 3 {
                score += TRINITY_BONUS;
            } else if trinity == 2 {
                score += PARTIAL_TRINITY_BONUS;
            }
        }

        let mean = group.iter().map(|a| f64::from(a.level)).sum::<f64>() / n;
        let variance = group
            .iter()
            .map(|a| (f64::from(a.level) - mean).powi(2))
            .sum::<f64>()
            / n;
        score += MAX_BALANCE_BONUS * (1.0 - variance.sqrt() / BALANCE_RANGE).max(0.0);

        let positions: Vec<Position> = group.iter().filter_map(|a| a.position).collect();
        if positions.len() >= 2 {
            let mut spread = 0.0_f64;
            for (i, a) in positions.iter().enumerate() {
                for b in &positions[i + 1..] {
                    spread = spread.max(a.distance_to(b));
                }
            }
            score += MAX_CLUSTER_BONUS * (1.0 - spread / CLUSTER_RANGE).max(0.0);
        }

        score.clamp(0.0, 1.0)
    }

    /// Fold a finished task's outcome into the agent's moving average.
    pub fn update_performance(
        &mut self,
        agent_id: &str,
        task_type: TaskType,
        success: bool,
        efficiency: f64,
    ) {
        let outcome = if success {
            efficiency.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let entry = self
            .performance
            .entry(agent_id.to_string())
            .or_default()
            .entry(task_type)
            .or_insert(NEUTRAL);
        *entry = *entry * (1.0 - PERFORMANCE_LEARNING_RATE) + outcome * PERFORMANCE_LEARNING_RATE;
        debug!(agent_id = %agent_id, task_type = %task_type, performance = *entry, "Performance updated");
    }

    pub fn performance(&self, agent_id: &str, task_type: TaskType) -> Option<f64> {
        self.performance
            .get(agent_id)
            .and_then(|by_type| by_type.get(&task_type))
            .copied()
    }

    /// Drop everything learned about an agent.
    pub fn forget_agent(&mut self, agent_id: &str) {
        self.performance.remove(agent_id);
    }

    /// Past selections, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &AssignmentRecord> {
        self.history.iter()
    }

    fn record(&mut self, task: &Task, agent_ids: &[String], score: f64) {
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(AssignmentRecord {
            task_id: task.id.clone(),
            task_type: task.task_type,
            agent_ids: agent_ids.to_vec(),
            score,
            assigned_at: Utc::now(),
        });
    }
}

impl Default for AssignmentEngine {
    fn default() -> Self {
        Self::new(1000)
    }
}

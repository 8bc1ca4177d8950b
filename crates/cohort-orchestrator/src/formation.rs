use crate::types::Position;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Spatial template used to lay out a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormationType {
    Line,
    Wedge,
    Circle,
    Box,
    Custom,
}

/// Position relative to the formation anchor, before scale and rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    pub x: f64,
    pub y: f64,
}

impl Offset {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

const DIAG: f64 = 2.121_320_343_559_642_4; // 3 / sqrt(2)

const LINE: [Offset; 8] = [
    Offset::new(0.0, 0.0),
    Offset::new(-2.0, 0.0),
    Offset::new(2.0, 0.0),
    Offset::new(-4.0, 0.0),
    Offset::new(4.0, 0.0),
    Offset::new(-6.0, 0.0),
    Offset::new(6.0, 0.0),
    Offset::new(-8.0, 0.0),
];

const WEDGE: [Offset; 8] = [
    Offset::new(0.0, 2.0),
    Offset::new(-2.0, 0.0),
    Offset::new(2.0, 0.0),
    Offset::new(-4.0, -2.0),
    Offset::new(4.0, -2.0),
    Offset::new(-6.0, -4.0),
    Offset::new(6.0, -4.0),
    Offset::new(0.0, -4.0),
];

const CIRCLE: [Offset; 8] = [
    Offset::new(3.0, 0.0),
    Offset::new(0.0, 3.0),
    Offset::new(-3.0, 0.0),
    Offset::new(0.0, -3.0),
    Offset::new(DIAG, DIAG),
    Offset::new(-DIAG, DIAG),
    Offset::new(-DIAG, -DIAG),
    Offset::new(DIAG, -DIAG),
];

const BOX: [Offset; 8] = [
    Offset::new(-2.0, 2.0),
    Offset::new(2.0, 2.0),
    Offset::new(-2.0, -2.0),
    Offset::new(2.0, -2.0),
    Offset::new(0.0, 2.0),
    Offset::new(0.0, -2.0),
    Offset::new(-2.0, 0.0),
    Offset::new(2.0, 0.0),
];

const FALLBACK_SPACING: f64 = 2.0;

impl FormationType {
    /// Fixed slot table for the template; empty for custom formations.
    pub fn template(self) -> &'static [Offset] {
        match self {
            FormationType::Line => &LINE,
            FormationType::Wedge => &WEDGE,
            FormationType::Circle => &CIRCLE,
            FormationType::Box => &BOX,
            FormationType::Custom => &[],
        }
    }

    /// Offset for the agent at `index`. Agents past the template's capacity
    /// trail behind the anchor in a straight line.
    pub fn slot(self, index: usize) -> Offset {
        let template = self.template();
        template.get(index).copied().unwrap_or_else(|| {
            let overflow = index - template.len() + 1;
            Offset::new(0.0, -FALLBACK_SPACING * overflow as f64)
        })
    }
}

/// A group laid out around a world anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formation {
    pub id: String,
    pub name: String,
    pub formation_type: FormationType,
    pub offsets: HashMap<String, Offset>,
    pub center: Position,
    pub rotation_deg: f64,
    pub scale: f64,
    pub adaptive: bool,
}

impl Formation {
    /// World position of a member: `rotate(scale(offset)) + center`, with the
    /// center's z.
    pub fn world_position(&self, agent_id: &str) -> Option<Position> {
        let offset = self.offsets.get(agent_id)?;
        let x = offset.x * self.scale;
        let y = offset.y * self.scale;
        let (sin, cos) = self.rotation_deg.to_radians().sin_cos();
        Some(Position::new(
            x * cos - y * sin + self.center.x,
            x * sin + y * cos + self.center.y,
            self.center.z,
        ))
    }

    /// World positions of every member.
    pub fn positions(&self) -> HashMap<String, Position> {
        self.offsets
            .keys()
            .filter_map(|id| self.world_position(id).map(|pos| (id.clone(), pos)))
            .collect()
    }
}

/// Registry of active formations.
#[derive(Debug, Default)]
pub struct FormationManager {
    formations: HashMap<String, Formation>,
}

impl FormationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lay out `agent_ids` in template order around `center`.
    pub fn create(
        &mut self,
        name: impl Into<String>,
        formation_type: FormationType,
        agent_ids: &[String],
        center: Position,
    ) -> &Formation {
        let offsets = agent_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), formation_type.slot(i)))
            .collect();
        self.insert(name.into(), formation_type, offsets, center)
    }

    /// Register a formation with caller-supplied offsets.
    pub fn create_custom(
        &mut self,
        name: impl Into<String>,
        offsets: HashMap<String, Offset>,
        center: Position,
    ) -> &Formation {
        self.insert(name.into(), FormationType::Custom, offsets, center)
    }

    fn insert(
        &mut self,
        name: String,
        formation_type: FormationType,
        offsets: HashMap<String, Offset>,
        center: Position,
    ) -> &Formation {
        let id = Uuid::new_v4().to_string();
        let formation = Formation {
            id: id.clone(),
            name,
            formation_type,
            offsets,
            center,
            rotation_deg: 0.0,
            scale: 1.0,
            adaptive: false,
        };
        self.formations.entry(id).or_insert(formation)
    }

    pub fn get(&self, formation_id: &str) -> Option<&Formation> {
        self.formations.get(formation_id)
    }

    pub fn remove(&mut self, formation_id: &str) -> Option<Formation> {
        self.formations.remove(formation_id)
    }

    pub fn position_of(&self, formation_id: &str, agent_id: &str) -> Option<Position> {
        self.formations.get(formation_id)?.world_position(agent_id)
    }

    /// Move the anchor without touching membership.
    pub fn set_anchor(&mut self, formation_id: &str, center: Position) -> bool {
        match self.formations.get_mut(formation_id) {
            Some(formation) => {
                formation.center = center;
                true
            }
            None => false,
        }
    }

    pub fn set_rotation(&mut self, formation_id: &str, degrees: f64) -> bool {
        match self.formations.get_mut(formation_id) {
            Some(formation) => {
                formation.rotation_deg = degrees.rem_euclid(360.0);
                true
            }
            None => false,
        }
    }

    /// Set the spread multiplier. Non-positive or non-finite scales are rejected.
    pub fn set_scale(&mut self, formation_id: &str, scale: f64) -> bool {
        if !scale.is_finite() || scale <= 0.0 {
            return false;
        }
        match self.formations.get_mut(formation_id) {
            Some(formation) => {
                formation.scale = scale;
                true
            }
            None => false,
        }
    }

    /// Drop an agent from every formation it belongs to.
    pub fn remove_member(&mut self, agent_id: &str) {
        for formation in self.formations.values_mut() {
            formation.offsets.remove(agent_id);
        }
    }

    pub fn count(&self) -> usize {
        self.formations.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("a{i}")).collect()
    }

    fn assert_close(actual: Position, x: f64, y: f64, z: f64) {
        assert!(
            (actual.x - x).abs() < EPS && (actual.y - y).abs() < EPS && (actual.z - z).abs() < EPS,
            "expected ({x}, {y}, {z}), got {actual:?}"
        );
    }

    #[test]
    fn test_circle_unrotated_matches_template() {
        let mut manager = FormationManager::new();
        let members = ids(4);
        let id = manager
            .create("ring", FormationType::Circle, &members, Position::default())
            .id
            .clone();

        for (i, member) in members.iter().enumerate() {
            let expected = CIRCLE[i];
            let pos = manager.position_of(&id, member).unwrap();
            assert_close(pos, expected.x, expected.y, 0.0);
        }
    }

    #[test]
    fn test_circle_rotated_ninety_degrees() {
        let mut manager = FormationManager::new();
        let members = ids(4);
        let id = manager
            .create("ring", FormationType::Circle, &members, Position::default())
            .id
            .clone();
        assert!(manager.set_rotation(&id, 90.0));

        for (i, member) in members.iter().enumerate() {
            let offset = CIRCLE[i];
            let pos = manager.position_of(&id, member).unwrap();
            assert_close(pos, -offset.y, offset.x, 0.0);
        }
    }

    #[test]
    fn test_anchor_scale_and_z() {
        let mut manager = FormationManager::new();
        let members = ids(2);
        let id = manager
            .create("line", FormationType::Line, &members, Position::default())
            .id
            .clone();

        assert!(manager.set_anchor(&id, Position::new(100.0, 50.0, 7.5)));
        assert!(manager.set_scale(&id, 3.0));

        // Slot 1 of a line is (-2, 0).
        let pos = manager.position_of(&id, "a1").unwrap();
        assert_close(pos, 94.0, 50.0, 7.5);
        assert_eq!(manager.get(&id).unwrap().offsets.len(), 2);
    }

    #[test]
    fn test_invalid_scale_rejected() {
        let mut manager = FormationManager::new();
        let id = manager
            .create("box", FormationType::Box, &ids(1), Position::default())
            .id
            .clone();
        assert!(!manager.set_scale(&id, 0.0));
        assert!(!manager.set_scale(&id, f64::NAN));
        assert_eq!(manager.get(&id).unwrap().scale, 1.0);
    }

    #[test]
    fn test_overflow_uses_linear_fallback() {
        assert_eq!(FormationType::Wedge.slot(8), Offset::new(0.0, -2.0));
        assert_eq!(FormationType::Wedge.slot(9), Offset::new(0.0, -4.0));
        assert_eq!(FormationType::Custom.slot(0), Offset::new(0.0, -2.0));

        let mut manager = FormationManager::new();
        let members = ids(10);
        let formation = manager.create("big", FormationType::Box, &members, Position::default());
        assert_eq!(formation.offsets.len(), 10);
        assert_eq!(formation.offsets["a9"], Offset::new(0.0, -4.0));
    }

    #[test]
    fn test_custom_offsets() {
        let mut manager = FormationManager::new();
        let mut offsets = HashMap::new();
        offsets.insert("scout".to_string(), Offset::new(10.0, 0.0));
        let id = manager
            .create_custom("picket", offsets, Position::new(1.0, 1.0, 0.0))
            .id
            .clone();
        assert_close(manager.position_of(&id, "scout").unwrap(), 11.0, 1.0, 0.0);
        assert!(manager.position_of(&id, "nobody").is_none());
    }

    #[test]
    fn test_remove_member_and_formation() {
        let mut manager = FormationManager::new();
        let id = manager
            .create("line", FormationType::Line, &ids(3), Position::default())
            .id
            .clone();
        manager.remove_member("a1");
        assert_eq!(manager.get(&id).unwrap().positions().len(), 2);

        assert!(manager.remove(&id).is_some());
        assert_eq!(manager.count(), 0);
        assert!(!manager.set_anchor(&id, Position::default()));
    }
}

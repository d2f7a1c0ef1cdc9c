//! Per-frame agent records as delivered by the data source.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Identifier of a logical agent, stable for as long as it keeps appearing.
///
/// Ids travel to the GPU as `f32` for hit testing, which holds every integer
/// only up to [`MAX_EXACT_INSTANCE_ID`] in magnitude. Larger ids still render,
/// but picking may report a neighbouring id.
pub type InstanceId = i32;

/// Largest id magnitude that survives the round trip through `f32`.
pub const MAX_EXACT_INSTANCE_ID: InstanceId = 1 << 24;

/// Whether `id` can be recovered exactly from the agent-info target.
pub fn is_exactly_pickable(id: InstanceId) -> bool {
    id.unsigned_abs() <= MAX_EXACT_INSTANCE_ID as u32
}

/// Identifier of an agent type; indirects to geometry and color.
pub type TypeId = i32;

/// Shape class of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum AgentKind {
    /// A rigid body placed by position, rotation and radius.
    #[default]
    Point,
    /// A polyline with a tube radius.
    Fiber,
}

/// One agent in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub instance_id: InstanceId,
    pub type_id: TypeId,
    #[serde(default)]
    pub kind: AgentKind,
    pub position: Vec3,
    /// Euler XYZ in radians.
    #[serde(default)]
    pub rotation: Vec3,
    #[serde(default = "default_radius")]
    pub radius: f32,
    /// Flat `x, y, z` triples. Only meaningful for fibers.
    #[serde(default)]
    pub points: Vec<f32>,
}

fn default_radius() -> f32 {
    1.0
}

impl AgentRecord {
    /// A point agent with no rotation.
    pub fn point(instance_id: InstanceId, type_id: TypeId, position: Vec3, radius: f32) -> Self {
        Self {
            instance_id,
            type_id,
            kind: AgentKind::Point,
            position,
            rotation: Vec3::ZERO,
            radius,
            points: Vec::new(),
        }
    }

    /// A fiber agent positioned at its first point.
    pub fn fiber(instance_id: InstanceId, type_id: TypeId, points: &[Vec3], radius: f32) -> Self {
        Self {
            instance_id,
            type_id,
            kind: AgentKind::Fiber,
            position: points.first().copied().unwrap_or(Vec3::ZERO),
            rotation: Vec3::ZERO,
            radius,
            points: points.iter().flat_map(|p| p.to_array()).collect(),
        }
    }

    /// Decode the fiber polyline, rejecting malformed point lists.
    pub fn fiber_points(&self) -> Result<Vec<Vec3>, RecordError> {
        if self.points.len() % 3 != 0 {
            return Err(RecordError::FiberPointsNotTriples {
                instance_id: self.instance_id,
                len: self.points.len(),
            });
        }
        let count = self.points.len() / 3;
        if count < 2 {
            return Err(RecordError::FiberTooShort {
                instance_id: self.instance_id,
                count,
            });
        }
        Ok(self
            .points
            .chunks_exact(3)
            .map(|c| Vec3::new(c[0], c[1], c[2]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_points_decode() {
        let rec = AgentRecord::fiber(7, 1, &[Vec3::ZERO, Vec3::X, Vec3::new(1.0, 1.0, 0.0)], 0.5);
        let pts = rec.fiber_points().unwrap();
        assert_eq!(pts.len(), 3);
        assert_eq!(pts[2], Vec3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn test_fiber_points_not_triples() {
        let mut rec = AgentRecord::fiber(7, 1, &[Vec3::ZERO, Vec3::X], 0.5);
        rec.points.push(1.0);
        assert_eq!(
            rec.fiber_points(),
            Err(RecordError::FiberPointsNotTriples { instance_id: 7, len: 7 })
        );
    }

    #[test]
    fn test_fiber_too_short() {
        let rec = AgentRecord::fiber(3, 1, &[Vec3::ONE], 0.5);
        assert!(matches!(rec.fiber_points(), Err(RecordError::FiberTooShort { count: 1, .. })));
    }

    #[test]
    fn test_record_json_defaults() {
        let json = r#"{ "instanceId": 4, "typeId": 2, "position": [1.0, 2.0, 3.0] }"#;
        let rec: AgentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.kind, AgentKind::Point);
        assert_eq!(rec.radius, 1.0);
        assert_eq!(rec.position, Vec3::new(1.0, 2.0, 3.0));
        assert!(rec.points.is_empty());
    }

    #[test]
    fn test_pickable_id_range() {
        assert!(is_exactly_pickable(0));
        assert!(is_exactly_pickable(MAX_EXACT_INSTANCE_ID));
        assert!(is_exactly_pickable(-MAX_EXACT_INSTANCE_ID));
        assert!(!is_exactly_pickable(MAX_EXACT_INSTANCE_ID + 1));
        assert!(!is_exactly_pickable(InstanceId::MIN));

        // The limit is where f32 stops representing every integer
        assert_eq!(MAX_EXACT_INSTANCE_ID as f32 as InstanceId, MAX_EXACT_INSTANCE_ID);
        let over = MAX_EXACT_INSTANCE_ID + 1;
        assert_ne!(over as f32 as InstanceId, over);
    }
}

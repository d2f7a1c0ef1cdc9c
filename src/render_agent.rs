//! Persistent render-side state for one agent.

use std::sync::Arc;

use glam::{EulerRot, Quat, Vec3};

use crate::agent::{AgentKind, InstanceId, TypeId};
use crate::mesh_asset::AtomicStructure;

/// Which shared geometry an instanced draw uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GeometryKey {
    /// Unit sphere, also the fallback for anything unresolved.
    Sphere,
    /// A loaded mesh asset, by name.
    Mesh(String),
}

impl GeometryKey {
    pub fn label(&self) -> &str {
        match self {
            GeometryKey::Sphere => crate::type_map::DEFAULT_MESH_NAME,
            GeometryKey::Mesh(name) => name,
        }
    }
}

/// What an agent is drawn as.
#[derive(Debug, Clone, Default)]
pub enum RenderObject {
    /// Nothing is drawn (hidden, or never resolved).
    #[default]
    None,
    /// One instance of a shared mesh, scaled uniformly.
    Mesh { geometry: GeometryKey, scale: f32 },
    /// One sphere per atom of a structure.
    Atoms { structure: Arc<AtomicStructure>, scale: f32 },
    /// A tube along a polyline with sphere endcaps.
    Fiber { points: Vec<Vec3>, radius: f32 },
}

impl RenderObject {
    pub fn is_none(&self) -> bool {
        matches!(self, RenderObject::None)
    }

    /// True while the agent is drawn with the default sphere.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            RenderObject::Mesh {
                geometry: GeometryKey::Sphere,
                ..
            }
        )
    }
}

#[derive(Debug, Clone)]
pub struct RenderAgent {
    pub instance_id: InstanceId,
    pub type_id: TypeId,
    pub kind: AgentKind,
    /// Present in the most recent frame.
    pub active: bool,
    /// Excluded by the type visibility filter.
    pub hidden: bool,
    /// Type is in the current highlight set.
    pub highlighted: bool,
    pub followed: bool,
    pub color_index: usize,
    pub object: RenderObject,
    pub position: Vec3,
    pub rotation: Vec3,
    pub radius: f32,
    /// Geometry must be resolved again on the next update.
    pub stale: bool,
    /// Resolved with a placeholder while an asset is still loading.
    pub awaiting_asset: bool,
    seen: bool,
}

impl RenderAgent {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            type_id: -1,
            kind: AgentKind::Point,
            active: false,
            hidden: false,
            highlighted: false,
            followed: false,
            color_index: 0,
            object: RenderObject::None,
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            radius: 1.0,
            stale: true,
            awaiting_asset: false,
            seen: false,
        }
    }

    pub fn quat(&self) -> Quat {
        Quat::from_euler(EulerRot::XYZ, self.rotation.x, self.rotation.y, self.rotation.z)
    }

    /// Set the transform, returning the position delta since the last one.
    /// The first placement reports a zero delta.
    pub fn place(&mut self, position: Vec3, rotation: Vec3, radius: f32) -> Vec3 {
        let delta = if self.seen { position - self.position } else { Vec3::ZERO };
        self.position = position;
        self.rotation = rotation;
        self.radius = radius;
        self.seen = true;
        delta
    }

    /// Drawn this frame.
    pub fn is_visible(&self) -> bool {
        self.active && !self.hidden && !self.object.is_none()
    }

    /// Radius of a sphere enclosing what is drawn, in world units.
    pub fn bounding_radius(&self) -> f32 {
        match &self.object {
            RenderObject::None => 0.0,
            RenderObject::Mesh {
                geometry: GeometryKey::Sphere,
                scale,
            } => self.radius * scale,
            RenderObject::Mesh { scale, .. } => self.radius.max(1.0) * scale,
            RenderObject::Atoms { structure, scale } => structure.bounds.bounding_radius() * scale,
            RenderObject::Fiber { points, radius } => {
                let c = self.position;
                points.iter().map(|p| p.distance(c)).fold(0.0, f32::max) + radius
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_place_has_zero_delta() {
        let mut agent = RenderAgent::new(1);
        assert_eq!(agent.place(Vec3::new(3.0, 0.0, 0.0), Vec3::ZERO, 1.0), Vec3::ZERO);
        assert_eq!(
            agent.place(Vec3::new(4.0, 1.0, 0.0), Vec3::ZERO, 1.0),
            Vec3::new(1.0, 1.0, 0.0)
        );
    }

    #[test]
    fn test_visibility_requires_object() {
        let mut agent = RenderAgent::new(1);
        agent.active = true;
        assert!(!agent.is_visible());
        agent.object = RenderObject::Mesh {
            geometry: GeometryKey::Sphere,
            scale: 2.0,
        };
        assert!(agent.is_visible());
        assert!(agent.object.is_fallback());
        assert_eq!(agent.bounding_radius(), 2.0);
        agent.hidden = true;
        assert!(!agent.is_visible());
    }
}

//! Reconciliation of per-frame agent records against persistent render agents.
//!
//! Render agents live in a flat arena indexed through a dense remap of
//! instance ids. Each frame every slot is first marked inactive, then the
//! slots touched by the frame are reactivated and updated. Slots are never
//! freed during a session.
//!
//! After reconciling, [`AgentSceneManager::build_instances`] refills the
//! instance pools the renderer draws from.

use std::collections::{BTreeMap, HashMap, HashSet};

use glam::{Quat, Vec3};

use crate::agent::{
    is_exactly_pickable, AgentKind, AgentRecord, InstanceId, TypeId, MAX_EXACT_INSTANCE_ID,
};
use crate::asset_queue::{AssetLoadQueue, AssetOutcome};
use crate::color::{signed_type_color, ColorTable};
use crate::config::{LodConfig, RenderStyle};
use crate::instance_pool::InstancedBufferPool;
use crate::mesh_asset::AgentGeometry;
use crate::path_trail::PathTrailTracker;
use crate::render_agent::{GeometryKey, RenderAgent, RenderObject};
use crate::type_map::TypeMap;

/// The shared state reconciliation reads and writes besides the agent pool.
pub struct SceneContext<'a> {
    pub type_map: &'a TypeMap,
    pub assets: &'a mut AssetLoadQueue,
    pub colors: &'a ColorTable,
    pub paths: &'a mut PathTrailTracker,
    pub style: RenderStyle,
}

/// Counters for one reconcile call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub active: usize,
    pub hidden: usize,
    pub resolved: usize,
    pub rejected: usize,
}

/// A fiber to draw this frame. Index `i` pairs with instance `i` of the fiber pool.
#[derive(Debug, Clone)]
pub struct FiberInstance {
    pub instance_id: InstanceId,
    pub points: Vec<Vec3>,
    pub radius: f32,
}

/// Geometry for a point agent of `type_id`, falling back to the sphere.
/// The flag is true while a referenced asset is still loading.
pub fn geometry_for_type(
    type_id: TypeId,
    type_map: &TypeMap,
    assets: &mut AssetLoadQueue,
) -> (RenderObject, bool) {
    let Some(binding) = type_map.get(type_id) else {
        return (sphere(1.0), false);
    };
    let Some(mesh) = &binding.mesh else {
        return (sphere(binding.scale), false);
    };

    match assets.request(mesh).outcome() {
        Some(AssetOutcome::Ready(AgentGeometry::Mesh(_))) => (
            RenderObject::Mesh {
                geometry: GeometryKey::Mesh(mesh.clone()),
                scale: binding.scale,
            },
            false,
        ),
        Some(AssetOutcome::Ready(AgentGeometry::Atoms(_))) => {
            log::warn!("Asset '{}' is a structure, not a mesh", mesh);
            (sphere(binding.scale), false)
        }
        Some(AssetOutcome::Failed(_)) | Some(AssetOutcome::Cancelled) => {
            (sphere(binding.scale), false)
        }
        None => (sphere(binding.scale), true),
    }
}

/// Atomic structure for `type_id`, if it has one and it is loaded.
/// The flag is true while the structure is still loading.
pub fn structure_for_type(
    type_id: TypeId,
    type_map: &TypeMap,
    assets: &mut AssetLoadQueue,
) -> (Option<RenderObject>, bool) {
    let Some(binding) = type_map.get(type_id) else {
        return (None, false);
    };
    let Some(pdb) = &binding.pdb else {
        return (None, false);
    };

    match assets.request(pdb).outcome() {
        Some(AssetOutcome::Ready(AgentGeometry::Atoms(structure))) => (
            Some(RenderObject::Atoms {
                structure: structure.clone(),
                scale: binding.scale,
            }),
            false,
        ),
        Some(AssetOutcome::Ready(AgentGeometry::Mesh(_))) => {
            log::warn!("Asset '{}' is a mesh, not a structure", pdb);
            (None, false)
        }
        Some(_) => (None, false),
        None => (None, true),
    }
}

fn sphere(scale: f32) -> RenderObject {
    RenderObject::Mesh {
        geometry: GeometryKey::Sphere,
        scale,
    }
}

pub struct AgentSceneManager {
    agents: Vec<RenderAgent>,
    index: HashMap<InstanceId, usize>,
    hidden_types: HashSet<TypeId>,
    highlighted_types: HashSet<TypeId>,
    followed: Option<InstanceId>,
    mesh_pools: BTreeMap<GeometryKey, InstancedBufferPool>,
    endcap_pool: InstancedBufferPool,
    fiber_pool: InstancedBufferPool,
    fibers: Vec<FiberInstance>,
    chunk_size: usize,
    atom_radius: f32,
    lod: LodConfig,
    lod_origin: Vec3,
}

impl AgentSceneManager {
    pub fn new(chunk_size: usize, atom_radius: f32) -> Self {
        let mut mesh_pools = BTreeMap::new();
        mesh_pools.insert(
            GeometryKey::Sphere,
            InstancedBufferPool::new("Sphere Instances", chunk_size),
        );
        Self {
            agents: Vec::new(),
            index: HashMap::new(),
            hidden_types: HashSet::new(),
            highlighted_types: HashSet::new(),
            followed: None,
            mesh_pools,
            endcap_pool: InstancedBufferPool::new("Fiber Endcap Instances", chunk_size),
            fiber_pool: InstancedBufferPool::new("Fiber Instances", chunk_size),
            fibers: Vec::new(),
            chunk_size,
            atom_radius,
            lod: LodConfig::default(),
            lod_origin: Vec3::ZERO,
        }
    }

    pub fn with_lod(mut self, lod: LodConfig) -> Self {
        self.lod = lod;
        self
    }

    /// Move the point detail levels are measured from, normally the camera.
    /// Returns true if any visible structure changes level, in which case
    /// the caller should rebuild instances.
    pub fn set_lod_origin(&mut self, origin: Vec3) -> bool {
        let previous = std::mem::replace(&mut self.lod_origin, origin);
        self.agents.iter().filter(|a| a.is_visible()).any(|a| match &a.object {
            RenderObject::Atoms { structure, .. } => {
                let level_at = |from: Vec3| {
                    structure.level(self.lod.level(from.distance(a.position))).len()
                };
                level_at(previous) != level_at(origin)
            }
            _ => false,
        })
    }

    /// Detail level a structure at `position` is drawn with.
    fn lod_level(&self, position: Vec3) -> usize {
        self.lod.level(self.lod_origin.distance(position))
    }

    /// Apply one frame of records.
    pub fn reconcile(&mut self, records: &[AgentRecord], ctx: &mut SceneContext) -> ReconcileStats {
        for agent in &mut self.agents {
            agent.active = false;
        }

        let mut stats = ReconcileStats::default();
        for record in records {
            let slot = self.slot_for(record.instance_id);

            let fiber_points = match record.kind {
                AgentKind::Point => None,
                AgentKind::Fiber => match record.fiber_points() {
                    Ok(points) => Some(points),
                    Err(e) => {
                        log::warn!("Skipping agent update: {}", e);
                        stats.rejected += 1;
                        // Keep showing last frame's shape rather than dropping it
                        let agent = &mut self.agents[slot];
                        agent.active = !agent.object.is_none();
                        continue;
                    }
                },
            };

            let hidden = self.hidden_types.contains(&record.type_id);
            let highlighted = self.highlighted_types.contains(&record.type_id);
            let agent = &mut self.agents[slot];
            agent.active = true;

            if hidden {
                agent.hidden = true;
                agent.object = RenderObject::None;
                stats.hidden += 1;
                continue;
            }

            let was_hidden = std::mem::replace(&mut agent.hidden, false);
            if agent.stale
                || was_hidden
                || agent.type_id != record.type_id
                || agent.kind != record.kind
            {
                agent.type_id = record.type_id;
                agent.kind = record.kind;
                agent.radius = record.radius;
                resolve(agent, ctx, self.followed);
                stats.resolved += 1;
            }
            agent.highlighted = highlighted;

            if let (Some(points), RenderObject::Fiber { points: current, radius }) =
                (fiber_points, &mut agent.object)
            {
                *current = points;
                *radius = record.radius;
            }

            let delta = agent.place(record.position, record.rotation, record.radius);
            if ctx.paths.has_path(record.instance_id) {
                ctx.paths.add_point(record.instance_id, record.position, delta);
            }
            stats.active += 1;
        }

        log::debug!(
            "Reconciled {} records: {} active, {} hidden, {} resolved, {} rejected ({} slots)",
            records.len(),
            stats.active,
            stats.hidden,
            stats.resolved,
            stats.rejected,
            self.agents.len()
        );
        stats
    }

    /// Re-resolve stale agents that are on screen without waiting for a new frame.
    /// Returns how many were resolved.
    pub fn refresh(&mut self, ctx: &mut SceneContext) -> usize {
        let mut count = 0;
        for agent in &mut self.agents {
            if agent.stale && agent.active && !agent.hidden {
                resolve(agent, ctx, self.followed);
                count += 1;
            }
        }
        count
    }

    /// Rebuild every instance pool from the visible agents.
    pub fn build_instances(&mut self) {
        let mut counts: HashMap<GeometryKey, usize> = HashMap::new();
        let mut endcaps = 0;
        let mut fibers = 0;
        for agent in self.agents.iter().filter(|a| a.is_visible()) {
            match &agent.object {
                RenderObject::None => {}
                RenderObject::Mesh { geometry, .. } => {
                    *counts.entry(geometry.clone()).or_default() += 1;
                }
                RenderObject::Atoms { structure, .. } => {
                    *counts.entry(GeometryKey::Sphere).or_default() +=
                        structure.level(self.lod_level(agent.position)).len();
                }
                RenderObject::Fiber { .. } => {
                    endcaps += 2;
                    fibers += 1;
                }
            }
        }

        for key in counts.keys() {
            if !self.mesh_pools.contains_key(key) {
                let label = format!("{} Instances", key.label());
                self.mesh_pools
                    .insert(key.clone(), InstancedBufferPool::new(label, self.chunk_size));
            }
        }
        for (key, pool) in &mut self.mesh_pools {
            pool.begin_frame(counts.get(key).copied().unwrap_or(0));
        }
        self.endcap_pool.begin_frame(endcaps);
        self.fiber_pool.begin_frame(fibers);
        self.fibers.clear();

        let any_highlight = !self.highlighted_types.is_empty();
        for agent in self.agents.iter().filter(|a| a.is_visible()) {
            let type_color = signed_type_color(agent.color_index, !any_highlight || agent.highlighted);
            let id = agent.instance_id;

            match &agent.object {
                RenderObject::None => {}
                RenderObject::Mesh { geometry, scale } => {
                    let size = match geometry {
                        GeometryKey::Sphere => agent.radius * scale,
                        GeometryKey::Mesh(_) => *scale,
                    };
                    if let Some(pool) = self.mesh_pools.get_mut(geometry) {
                        pool.push(agent.position, size, agent.quat(), id, type_color);
                    }
                }
                RenderObject::Atoms { structure, scale } => {
                    let q = agent.quat();
                    let lod = self.lod_level(agent.position);
                    let radius = self.atom_radius * scale * structure.level_radius_scale(lod);
                    if let Some(pool) = self.mesh_pools.get_mut(&GeometryKey::Sphere) {
                        for atom in structure.level(lod) {
                            pool.push(
                                agent.position + q * (*atom * *scale),
                                radius,
                                Quat::IDENTITY,
                                id,
                                type_color,
                            );
                        }
                    }
                }
                RenderObject::Fiber { points, radius } => {
                    for end in [points.first(), points.last()].into_iter().flatten() {
                        self.endcap_pool.push(*end, *radius, Quat::IDENTITY, id, type_color);
                    }
                    self.fiber_pool.push(Vec3::ZERO, 1.0, Quat::IDENTITY, id, type_color);
                    self.fibers.push(FiberInstance {
                        instance_id: id,
                        points: points.clone(),
                        radius: *radius,
                    });
                }
            }
        }

        for pool in self.mesh_pools.values_mut() {
            pool.end_frame();
        }
        self.endcap_pool.end_frame();
        self.fiber_pool.end_frame();
    }

    /// Hide every agent whose type is in `hidden`. Applies immediately and on later frames.
    pub fn set_visible_by_ids(&mut self, hidden: &[TypeId]) {
        self.hidden_types = hidden.iter().copied().collect();
        for agent in &mut self.agents {
            let hide = self.hidden_types.contains(&agent.type_id);
            if hide && !agent.hidden {
                agent.hidden = true;
                agent.object = RenderObject::None;
            } else if !hide && agent.hidden {
                agent.hidden = false;
                agent.stale = true;
            }
        }
    }

    /// Draw the given types at full saturation and everything else desaturated.
    /// An empty set draws every type at full saturation.
    pub fn set_highlight_by_ids(&mut self, types: &[TypeId]) {
        self.highlighted_types = types.iter().copied().collect();
        for agent in &mut self.agents {
            agent.highlighted = self.highlighted_types.contains(&agent.type_id);
        }
    }

    /// Follow `id`. Returns false, leaving the current follow untouched, if the
    /// id has never appeared.
    pub fn set_followed(&mut self, id: InstanceId) -> bool {
        let Some(&slot) = self.index.get(&id) else {
            log::warn!("Cannot follow agent {}: it has never appeared", id);
            return false;
        };
        self.unfollow();
        self.agents[slot].followed = true;
        self.followed = Some(id);
        true
    }

    pub fn unfollow(&mut self) {
        if let Some(slot) = self.followed.take().and_then(|id| self.index.get(&id).copied()) {
            self.agents[slot].followed = false;
        }
    }

    pub fn followed(&self) -> Option<InstanceId> {
        self.followed
    }

    /// Position of the followed agent while it is on screen.
    pub fn followed_position(&self) -> Option<Vec3> {
        self.followed
            .and_then(|id| self.agent(id))
            .filter(|a| a.is_visible())
            .map(|a| a.position)
    }

    /// Mark every agent of the given types for re-resolution.
    pub fn invalidate_types(&mut self, types: &[TypeId]) {
        let set: HashSet<TypeId> = types.iter().copied().collect();
        for agent in self.agents.iter_mut().filter(|a| set.contains(&a.type_id)) {
            agent.stale = true;
        }
    }

    /// Mark agents drawn with a placeholder for re-resolution.
    pub fn invalidate_awaiting(&mut self) {
        for agent in self.agents.iter_mut().filter(|a| a.awaiting_asset) {
            agent.stale = true;
        }
    }

    pub fn invalidate_all(&mut self) {
        for agent in &mut self.agents {
            agent.stale = true;
        }
    }

    /// Closest visible agent whose bounding sphere the ray hits.
    pub fn ray_pick(&self, origin: Vec3, direction: Vec3) -> Option<InstanceId> {
        let dir = direction.normalize_or_zero();
        if dir == Vec3::ZERO {
            return None;
        }
        self.agents
            .iter()
            .filter(|a| a.is_visible())
            .filter_map(|a| ray_sphere(origin, dir, a.position, a.bounding_radius()).map(|t| (t, a)))
            .min_by(|x, y| x.0.total_cmp(&y.0))
            .map(|(_, a)| a.instance_id)
    }

    /// Drop every render agent and filter. Pools keep their capacity.
    pub fn reset(&mut self) {
        self.agents.clear();
        self.index.clear();
        self.hidden_types.clear();
        self.highlighted_types.clear();
        self.followed = None;
        self.fibers.clear();
        self.build_instances();
        log::info!("Scene cleared");
    }

    pub fn agent(&self, id: InstanceId) -> Option<&RenderAgent> {
        self.index.get(&id).map(|&slot| &self.agents[slot])
    }

    pub fn agents(&self) -> &[RenderAgent] {
        &self.agents
    }

    /// Slots ever allocated this session.
    pub fn slot_count(&self) -> usize {
        self.agents.len()
    }

    pub fn active_count(&self) -> usize {
        self.agents.iter().filter(|a| a.active).count()
    }

    pub fn visible_count(&self) -> usize {
        self.agents.iter().filter(|a| a.is_visible()).count()
    }

    pub fn mesh_pools(&self) -> &BTreeMap<GeometryKey, InstancedBufferPool> {
        &self.mesh_pools
    }

    pub fn mesh_pools_mut(&mut self) -> &mut BTreeMap<GeometryKey, InstancedBufferPool> {
        &mut self.mesh_pools
    }

    pub fn endcap_pool(&self) -> &InstancedBufferPool {
        &self.endcap_pool
    }

    pub fn endcap_pool_mut(&mut self) -> &mut InstancedBufferPool {
        &mut self.endcap_pool
    }

    pub fn fiber_pool(&self) -> &InstancedBufferPool {
        &self.fiber_pool
    }

    pub fn fiber_pool_mut(&mut self) -> &mut InstancedBufferPool {
        &mut self.fiber_pool
    }

    pub fn fibers(&self) -> &[FiberInstance] {
        &self.fibers
    }

    fn slot_for(&mut self, id: InstanceId) -> usize {
        if let Some(&slot) = self.index.get(&id) {
            return slot;
        }
        if !is_exactly_pickable(id) {
            log::warn!(
                "Agent id {} exceeds {} and cannot be picked exactly",
                id,
                MAX_EXACT_INSTANCE_ID
            );
        }
        let slot = self.agents.len();
        self.agents.push(RenderAgent::new(id));
        self.index.insert(id, slot);
        slot
    }
}

fn resolve(agent: &mut RenderAgent, ctx: &mut SceneContext, followed: Option<InstanceId>) {
    agent.stale = false;
    agent.color_index = ctx.colors.color_index(agent.type_id);
    agent.followed = followed == Some(agent.instance_id);

    let previous = std::mem::take(&mut agent.object);
    let (object, awaiting) = match agent.kind {
        AgentKind::Fiber => {
            let points = match previous {
                RenderObject::Fiber { points, .. } => points,
                _ => Vec::new(),
            };
            (
                RenderObject::Fiber {
                    points,
                    radius: agent.radius,
                },
                false,
            )
        }
        AgentKind::Point => match ctx.style {
            RenderStyle::Instanced => {
                let (atoms, atoms_pending) =
                    structure_for_type(agent.type_id, ctx.type_map, ctx.assets);
                match atoms {
                    Some(object) => (object, false),
                    None => {
                        let (object, mesh_pending) =
                            geometry_for_type(agent.type_id, ctx.type_map, ctx.assets);
                        (object, atoms_pending || mesh_pending)
                    }
                }
            }
            RenderStyle::Generic => geometry_for_type(agent.type_id, ctx.type_map, ctx.assets),
        },
    };
    agent.object = object;
    agent.awaiting_asset = awaiting;

    if ctx.paths.has_path(agent.instance_id) {
        ctx.paths
            .set_path_color(agent.instance_id, ctx.colors.color(agent.color_index));
    }
}

/// Distance along a normalized ray to the first hit on a sphere.
fn ray_sphere(origin: Vec3, dir: Vec3, center: Vec3, radius: f32) -> Option<f32> {
    let oc = origin - center;
    let b = oc.dot(dir);
    let c = oc.length_squared() - radius * radius;
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let sqrt = disc.sqrt();
    let t = if -b - sqrt >= 0.0 { -b - sqrt } else { -b + sqrt };
    (t >= 0.0).then_some(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset_queue::{AssetProvider, FileAssetProvider};
    use crate::config::DEFAULT_VOLUME_BOUNDS;
    use crate::error::AssetError;
    use crate::gpu::mesh::create_sphere_geometry;
    use crate::mesh_asset::{AtomicStructure, MeshAsset};
    use crate::type_map::TypeGeometryBinding;
    use approx::assert_relative_eq;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        manager: AgentSceneManager,
        type_map: TypeMap,
        assets: AssetLoadQueue,
        colors: ColorTable,
        paths: PathTrailTracker,
        style: RenderStyle,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_provider(Arc::new(FileAssetProvider::new(std::env::temp_dir())))
        }

        fn with_provider(provider: Arc<dyn AssetProvider>) -> Self {
            Self {
                manager: AgentSceneManager::new(64, 1.0),
                type_map: TypeMap::new(),
                assets: AssetLoadQueue::new(provider, 2).unwrap(),
                colors: ColorTable::from_hex(&["#ff0000".into(), "#00ff00".into()]),
                paths: PathTrailTracker::new(8, [0.0; 3], DEFAULT_VOLUME_BOUNDS),
                style: RenderStyle::Instanced,
            }
        }

        fn reconcile(&mut self, records: &[AgentRecord]) -> ReconcileStats {
            let mut ctx = SceneContext {
                type_map: &self.type_map,
                assets: &mut self.assets,
                colors: &self.colors,
                paths: &mut self.paths,
                style: self.style,
            };
            self.manager.reconcile(records, &mut ctx)
        }

        fn refresh(&mut self) -> usize {
            let mut ctx = SceneContext {
                type_map: &self.type_map,
                assets: &mut self.assets,
                colors: &self.colors,
                paths: &mut self.paths,
                style: self.style,
            };
            self.manager.refresh(&mut ctx)
        }
    }

    fn point(id: InstanceId, type_id: TypeId, x: f32) -> AgentRecord {
        AgentRecord::point(id, type_id, Vec3::new(x, 0.0, 0.0), 1.0)
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut f = Fixture::new();
        let frame = vec![point(1, 0, 0.0), point(2, 1, 3.0)];
        f.reconcile(&frame);
        f.manager.build_instances();
        let once: Vec<_> = f.manager.mesh_pools()[&GeometryKey::Sphere].transforms().to_vec();

        f.reconcile(&frame);
        f.manager.build_instances();
        let twice = f.manager.mesh_pools()[&GeometryKey::Sphere].transforms().to_vec();

        assert_eq!(once, twice);
        assert_eq!(f.manager.slot_count(), 2);
        assert_eq!(f.manager.visible_count(), 2);
    }

    #[test]
    fn test_type_change_reresolves() {
        let mut f = Fixture::new();
        f.reconcile(&[point(1, 0, 0.0)]);
        assert_eq!(f.manager.agent(1).unwrap().color_index, 0);
        let stats = f.reconcile(&[point(1, 1, 0.0)]);
        assert_eq!(stats.resolved, 1);
        assert_eq!(f.manager.agent(1).unwrap().color_index, 1);
        let stats = f.reconcile(&[point(1, 1, 1.0)]);
        assert_eq!(stats.resolved, 0);
    }

    #[test]
    fn test_hidden_types_are_not_submitted() {
        let mut f = Fixture::new();
        f.manager.set_visible_by_ids(&[1]);
        let stats = f.reconcile(&[point(1, 0, 0.0), point(2, 1, 0.0)]);
        assert_eq!(stats.hidden, 1);
        f.manager.build_instances();
        assert_eq!(f.manager.mesh_pools()[&GeometryKey::Sphere].used(), 1);

        // Unhiding re-resolves on the next frame
        f.manager.set_visible_by_ids(&[]);
        let stats = f.reconcile(&[point(1, 0, 0.0), point(2, 1, 0.0)]);
        assert_eq!(stats.resolved, 1);
        f.manager.build_instances();
        assert_eq!(f.manager.mesh_pools()[&GeometryKey::Sphere].used(), 2);
    }

    #[test]
    fn test_highlight_sign_encoding() {
        let mut f = Fixture::new();
        f.reconcile(&[point(1, 0, 0.0), point(2, 1, 0.0)]);
        f.manager.build_instances();
        let ids = f.manager.mesh_pools()[&GeometryKey::Sphere].identities().to_vec();
        assert!(ids.iter().all(|p| p[1] > 0.0));

        f.manager.set_highlight_by_ids(&[1]);
        f.manager.build_instances();
        let ids = f.manager.mesh_pools()[&GeometryKey::Sphere].identities().to_vec();
        let of = |id: f32| ids.iter().find(|p| p[0] == id).unwrap()[1];
        assert_eq!(of(1.0), -1.0);
        assert_eq!(of(2.0), 2.0);
    }

    #[test]
    fn test_malformed_fiber_skips_only_that_agent() {
        let mut f = Fixture::new();
        let mut bad = AgentRecord::fiber(5, 0, &[Vec3::ZERO, Vec3::X], 0.5);
        bad.points.pop();
        let stats = f.reconcile(&[bad, point(6, 0, 2.0)]);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.active, 1);
        assert!(!f.manager.agent(5).unwrap().is_visible());
        assert!(f.manager.agent(6).unwrap().is_visible());
    }

    #[test]
    fn test_fiber_builds_endcaps_and_fiber_instance() {
        let mut f = Fixture::new();
        let fiber = AgentRecord::fiber(3, 0, &[Vec3::ZERO, Vec3::X, Vec3::new(2.0, 1.0, 0.0)], 0.25);
        f.reconcile(&[fiber]);
        f.manager.build_instances();
        assert_eq!(f.manager.endcap_pool().used(), 2);
        assert_eq!(f.manager.fiber_pool().used(), 1);
        assert_eq!(f.manager.fibers()[0].points.len(), 3);
        assert_eq!(f.manager.endcap_pool().transforms()[1], [2.0, 1.0, 0.0, 0.25]);
    }

    #[test]
    fn test_follow_unknown_id_is_noop() {
        let mut f = Fixture::new();
        f.reconcile(&[point(1, 0, 4.0)]);
        assert!(f.manager.set_followed(1));
        assert!(!f.manager.set_followed(99));
        assert_eq!(f.manager.followed(), Some(1));
        assert_eq!(f.manager.followed_position(), Some(Vec3::new(4.0, 0.0, 0.0)));
        f.manager.unfollow();
        assert!(!f.manager.agent(1).unwrap().followed);
    }

    #[test]
    fn test_paths_receive_deltas() {
        let mut f = Fixture::new();
        f.reconcile(&[point(1, 0, 0.0)]);
        f.paths.add_path_for_agent(1, [1.0; 3]);
        f.reconcile(&[point(1, 0, 1.0)]);
        f.reconcile(&[point(1, 0, 3.0)]);
        let ends = f.paths.path(1).unwrap().segment_end_points();
        assert_eq!(ends, vec![Vec3::new(1.0, 0.0, 0.0), Vec3::new(3.0, 0.0, 0.0)]);
    }

    #[test]
    fn test_missing_binding_falls_back_to_sphere() {
        let mut f = Fixture::new();
        f.type_map.insert(0, TypeGeometryBinding::mesh("agentvis-missing.obj").with_scale(2.0));
        f.reconcile(&[point(1, 0, 0.0), point(2, 7, 0.0)]);
        assert!(f.manager.agent(1).unwrap().object.is_fallback());
        assert!(f.manager.agent(1).unwrap().awaiting_asset);
        assert!(f.manager.agent(2).unwrap().object.is_fallback());

        // The fetch fails, and the agent stays a sphere without retrying
        f.assets.wait_idle(Duration::from_secs(5));
        f.manager.invalidate_awaiting();
        assert_eq!(f.refresh(), 1);
        let agent = f.manager.agent(1).unwrap();
        assert!(agent.object.is_fallback());
        assert!(!agent.awaiting_asset);
    }

    struct StaticProvider;

    impl AssetProvider for StaticProvider {
        fn fetch(&self, name: &str) -> Result<AgentGeometry, AssetError> {
            if name.ends_with(".pdb") {
                let pdb = "ATOM      1  N   ALA A   1       1.000   0.000   0.000\n\
                           ATOM      2  C   ALA A   1      -1.000   0.000   0.000\n";
                return Ok(AgentGeometry::Atoms(Arc::new(AtomicStructure::from_pdb(
                    name.to_string(),
                    pdb,
                )?)));
            }
            let (v, i) = create_sphere_geometry(2, 4);
            Ok(AgentGeometry::Mesh(Arc::new(MeshAsset::new(name.to_string(), v, i))))
        }
    }

    #[test]
    fn test_late_asset_replaces_placeholder() {
        let mut f = Fixture::with_provider(Arc::new(StaticProvider));
        f.type_map.insert(0, TypeGeometryBinding::mesh("body.obj"));
        f.reconcile(&[point(1, 0, 0.0)]);
        assert!(f.manager.agent(1).unwrap().object.is_fallback());

        f.assets.wait_idle(Duration::from_secs(5));
        f.manager.invalidate_awaiting();
        f.refresh();
        f.manager.build_instances();
        let key = GeometryKey::Mesh("body.obj".into());
        assert_eq!(f.manager.mesh_pools()[&key].used(), 1);
        assert_eq!(f.manager.mesh_pools()[&GeometryKey::Sphere].used(), 0);
    }

    #[test]
    fn test_atoms_expand_into_sphere_pool_only_when_instanced() {
        let mut f = Fixture::with_provider(Arc::new(StaticProvider));
        f.type_map.insert(0, TypeGeometryBinding::pdb("mol.pdb"));
        f.reconcile(&[point(1, 0, 10.0)]);
        f.assets.wait_idle(Duration::from_secs(5));
        f.manager.invalidate_awaiting();
        f.refresh();
        f.manager.build_instances();

        let pool = &f.manager.mesh_pools()[&GeometryKey::Sphere];
        assert_eq!(pool.used(), 2);
        assert_eq!(pool.transforms()[0], [11.0, 0.0, 0.0, 1.0]);
        assert!(pool.identities().iter().all(|p| p[0] == 1.0));

        f.style = RenderStyle::Generic;
        f.manager.invalidate_all();
        f.refresh();
        f.manager.build_instances();
        assert_eq!(f.manager.mesh_pools()[&GeometryKey::Sphere].used(), 1);
    }

    #[test]
    fn test_distant_structure_uses_coarser_level() {
        let mut f = Fixture::with_provider(Arc::new(StaticProvider));
        f.type_map.insert(0, TypeGeometryBinding::pdb("mol.pdb"));
        f.reconcile(&[point(1, 0, 10.0)]);
        f.assets.wait_idle(Duration::from_secs(5));
        f.manager.invalidate_awaiting();
        f.refresh();
        f.manager.build_instances();
        assert_eq!(f.manager.mesh_pools()[&GeometryKey::Sphere].used(), 2);

        assert!(f.manager.set_lod_origin(Vec3::new(510.0, 0.0, 0.0)));
        f.manager.build_instances();
        let pool = &f.manager.mesh_pools()[&GeometryKey::Sphere];
        assert_eq!(pool.used(), 1);
        let t = pool.transforms()[0];
        assert_eq!([t[0], t[1], t[2]], [10.0, 0.0, 0.0]);
        assert_relative_eq!(t[3], 2f32.cbrt(), epsilon = 1e-5);

        // Same level, nothing to rebuild
        assert!(!f.manager.set_lod_origin(Vec3::new(520.0, 0.0, 0.0)));
        assert!(f.manager.set_lod_origin(Vec3::new(30.0, 0.0, 0.0)));
        f.manager.build_instances();
        assert_eq!(f.manager.mesh_pools()[&GeometryKey::Sphere].used(), 2);
    }

    #[test]
    fn test_ray_pick_nearest() {
        let mut f = Fixture::new();
        f.reconcile(&[point(1, 0, 0.0), point(2, 0, 5.0)]);
        let hit = f.manager.ray_pick(Vec3::new(10.0, 0.0, 0.0), Vec3::NEG_X);
        assert_eq!(hit, Some(2));
        let miss = f.manager.ray_pick(Vec3::new(10.0, 5.0, 0.0), Vec3::NEG_X);
        assert_eq!(miss, None);
    }

    #[test]
    fn test_reset_clears_slots() {
        let mut f = Fixture::new();
        f.reconcile(&[point(1, 0, 0.0)]);
        f.manager.set_followed(1);
        f.manager.reset();
        assert_eq!(f.manager.slot_count(), 0);
        assert_eq!(f.manager.followed(), None);
        assert_eq!(f.manager.mesh_pools()[&GeometryKey::Sphere].used(), 0);
    }
}

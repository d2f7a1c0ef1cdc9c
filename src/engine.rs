//! One viewer's worth of scene state and the commands the UI layer issues.
//!
//! The engine owns the render-agent pool, the asset cache, the color table
//! and the path tracker, and lends them to reconciliation as a
//! [`SceneContext`]. Nothing here is global, so several engines can coexist.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use glam::Vec3;

use crate::agent::{AgentRecord, InstanceId, TypeId};
use crate::asset_queue::{AssetLoadQueue, AssetProvider};
use crate::camera::Camera;
use crate::color::{parse_hex_color, ColorTable};
use crate::config::{RenderStyle, ViewerConfig};
use crate::path_trail::PathTrailTracker;
use crate::scene_manager::{AgentSceneManager, ReconcileStats, SceneContext};
use crate::type_map::TypeMap;

pub struct SceneEngine {
    config: ViewerConfig,
    manager: AgentSceneManager,
    paths: PathTrailTracker,
    assets: AssetLoadQueue,
    colors: ColorTable,
    type_map: TypeMap,
    style: RenderStyle,
    frames_applied: u64,
}

/// Borrow everything but the manager as a reconcile context.
macro_rules! scene_context {
    ($engine:expr) => {
        SceneContext {
            type_map: &$engine.type_map,
            assets: &mut $engine.assets,
            colors: &$engine.colors,
            paths: &mut $engine.paths,
            style: $engine.style,
        }
    };
}

impl SceneEngine {
    pub fn new(config: ViewerConfig, provider: Arc<dyn AssetProvider>) -> Result<Self> {
        config.validate().context("Invalid viewer config")?;
        let assets = AssetLoadQueue::new(provider, config.assets.max_workers)
            .context("Failed to start asset workers")?;

        Ok(Self {
            manager: AgentSceneManager::new(config.instance_chunk, config.atom_radius)
                .with_lod(config.lod.clone()),
            paths: {
                let mut paths = PathTrailTracker::new(
                    config.paths.max_segments,
                    config.path_end_color(),
                    config.volume_bounds,
                );
                paths.set_show_paths(config.paths.show);
                paths
            },
            assets,
            colors: ColorTable::from_hex(&config.palette),
            type_map: TypeMap::new(),
            style: config.render_style,
            frames_applied: 0,
            config,
        })
    }

    /// Reconcile one frame and rebuild instance data.
    pub fn apply_frame(&mut self, records: &[AgentRecord]) -> ReconcileStats {
        let mut ctx = scene_context!(self);
        let stats = self.manager.reconcile(records, &mut ctx);
        self.manager.build_instances();
        self.frames_applied += 1;
        stats
    }

    /// Per-display-tick housekeeping: install finished assets and re-resolve
    /// the agents waiting on them. Returns true if instance data changed.
    pub fn tick(&mut self) -> bool {
        let settled = self.assets.poll();
        if !settled.is_empty() {
            self.manager.invalidate_awaiting();
        }
        self.refresh()
    }

    /// Block until queued asset loads finish (or `timeout`), then tick.
    pub fn wait_for_assets(&mut self, timeout: Duration) -> bool {
        let settled = self.assets.wait_idle(timeout);
        if !settled.is_empty() {
            self.manager.invalidate_awaiting();
        }
        self.tick()
    }

    /// Measure structure detail levels from `position`, rebuilding instances
    /// if any structure changes level.
    pub fn set_view_position(&mut self, position: Vec3) -> bool {
        let changed = self.manager.set_lod_origin(position);
        if changed {
            self.manager.build_instances();
        }
        changed
    }

    /// Merge type bindings. Agents of changed types are re-resolved now.
    pub fn set_type_map(&mut self, type_map: TypeMap) {
        let overrides: Vec<(TypeId, String)> = type_map
            .iter()
            .filter_map(|(id, b)| b.color.clone().map(|c| (*id, c)))
            .collect();
        let mut changed = self.type_map.merge(type_map);

        for (type_id, hex) in overrides {
            match parse_hex_color(&hex) {
                Some(rgb) => {
                    let index = self.colors.add_color(rgb);
                    self.colors.set_color_for_ids(&[type_id], index);
                    changed.push(type_id);
                }
                None => log::warn!("Type {} has invalid color '{}'", type_id, hex),
            }
        }

        log::info!("Type map updated, {} types changed", changed.len());
        self.manager.invalidate_types(&changed);
        self.refresh();
    }

    /// Assign palette entry `index` to the given types.
    pub fn set_color_for_ids(&mut self, ids: &[TypeId], index: usize) {
        self.colors.set_color_for_ids(ids, index);
        self.manager.invalidate_types(ids);
        self.refresh();
    }

    pub fn set_visible_by_ids(&mut self, hidden_types: &[TypeId]) {
        self.manager.set_visible_by_ids(hidden_types);
        self.refresh();
        self.manager.build_instances();
    }

    pub fn set_highlight_by_ids(&mut self, types: &[TypeId]) {
        self.manager.set_highlight_by_ids(types);
        self.manager.build_instances();
    }

    /// Follow an agent. Unknown ids are ignored with a warning.
    pub fn set_followed_agent(&mut self, id: InstanceId) -> bool {
        self.manager.set_followed(id)
    }

    pub fn unfollow(&mut self) {
        self.manager.unfollow();
    }

    /// Start a path for an agent, colored like the agent.
    pub fn add_path_for_agent(&mut self, id: InstanceId) -> bool {
        let Some(agent) = self.manager.agent(id) else {
            log::warn!("Cannot trace agent {}: it has never appeared", id);
            return false;
        };
        let color = self.colors.color(agent.color_index);
        self.paths.add_path_for_agent(id, color)
    }

    pub fn remove_path_for_agent(&mut self, id: InstanceId) -> bool {
        self.paths.remove_path_for_agent(id)
    }

    pub fn set_show_paths(&mut self, show: bool) {
        self.paths.set_show_paths(show);
    }

    pub fn set_volume_bounds(&mut self, bounds: [f32; 6]) {
        self.config.volume_bounds = bounds;
        self.paths.set_volume_bounds(bounds);
    }

    pub fn set_render_style(&mut self, style: RenderStyle) {
        if style == self.style {
            return;
        }
        log::info!("Render style changed to {:?}", style);
        self.style = style;
        self.manager.invalidate_all();
        self.refresh();
    }

    /// Tear down for a new data source. Pending loads are cancelled before
    /// the caches they could repopulate are cleared.
    pub fn reset_for_new_trajectory(&mut self) {
        self.assets.cancel_all();
        self.assets.clear();
        self.manager.reset();
        self.paths.clear();
        self.type_map.clear();
        self.colors.clear_assignments();
        self.frames_applied = 0;
        log::info!("Reset for new trajectory");
    }

    /// CPU picking against agent bounding spheres.
    pub fn pick_with_ray(
        &self,
        camera: &Camera,
        x: f32,
        y: f32,
        width: u32,
        height: u32,
    ) -> Option<InstanceId> {
        let (origin, dir) = camera.screen_ray(x, y, width, height);
        self.manager.ray_pick(origin, dir)
    }

    fn refresh(&mut self) -> bool {
        let mut ctx = scene_context!(self);
        let resolved = self.manager.refresh(&mut ctx);
        if resolved > 0 {
            log::debug!("Re-resolved {} agents", resolved);
            self.manager.build_instances();
        }
        resolved > 0
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn style(&self) -> RenderStyle {
        self.style
    }

    pub fn manager(&self) -> &AgentSceneManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut AgentSceneManager {
        &mut self.manager
    }

    pub fn paths(&self) -> &PathTrailTracker {
        &self.paths
    }

    pub fn colors(&self) -> &ColorTable {
        &self.colors
    }

    pub fn assets(&self) -> &AssetLoadQueue {
        &self.assets
    }

    pub fn type_map(&self) -> &TypeMap {
        &self.type_map
    }

    pub fn frames_applied(&self) -> u64 {
        self.frames_applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset_queue::FileAssetProvider;
    use crate::type_map::TypeGeometryBinding;

    fn engine() -> SceneEngine {
        SceneEngine::new(
            ViewerConfig::default(),
            Arc::new(FileAssetProvider::new(std::env::temp_dir())),
        )
        .unwrap()
    }

    #[test]
    fn test_commands_on_unknown_ids_are_noops() {
        let mut engine = engine();
        assert!(!engine.set_followed_agent(42));
        assert!(!engine.add_path_for_agent(42));
        assert!(!engine.remove_path_for_agent(42));
        assert_eq!(engine.manager().followed(), None);
    }

    #[test]
    fn test_type_map_color_override() {
        let mut engine = engine();
        engine.apply_frame(&[AgentRecord::point(1, 3, Vec3::ZERO, 1.0)]);
        let before = engine.manager().agent(1).unwrap().color_index;

        let mut map = TypeMap::new();
        map.insert(
            3,
            TypeGeometryBinding {
                color: Some("#123456".into()),
                ..Default::default()
            },
        );
        engine.set_type_map(map);

        let after = engine.manager().agent(1).unwrap().color_index;
        assert_ne!(before, after);
        assert_eq!(engine.colors().color(after), parse_hex_color("#123456").unwrap());
    }

    #[test]
    fn test_path_uses_agent_color() {
        let mut engine = engine();
        engine.apply_frame(&[AgentRecord::point(1, 2, Vec3::ZERO, 1.0)]);
        assert!(engine.add_path_for_agent(1));
        let expected = engine.colors().color_for_type(2);
        assert_eq!(engine.paths().path(1).unwrap().color(), expected);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut engine = engine();
        let mut map = TypeMap::new();
        map.insert(0, TypeGeometryBinding::mesh("agentvis-missing.obj"));
        engine.set_type_map(map);
        engine.apply_frame(&[AgentRecord::point(1, 0, Vec3::ZERO, 1.0)]);
        engine.add_path_for_agent(1);

        engine.reset_for_new_trajectory();
        assert_eq!(engine.manager().slot_count(), 0);
        assert!(engine.paths().is_empty());
        assert!(engine.type_map().is_empty());
        assert!(engine.assets().state("agentvis-missing.obj").is_none());
        assert_eq!(engine.frames_applied(), 0);
    }

    #[test]
    fn test_style_switch_reresolves() {
        let mut engine = engine();
        engine.apply_frame(&[AgentRecord::point(1, 0, Vec3::ZERO, 1.0)]);
        engine.set_render_style(RenderStyle::Generic);
        assert_eq!(engine.style(), RenderStyle::Generic);
        assert!(engine.manager().agent(1).unwrap().is_visible());
    }
}

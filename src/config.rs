//! Viewer configuration.
//!
//! Everything is optional in the JSON form; missing fields take the defaults
//! below, which match the look of the stock viewer.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Default extent of the simulation volume, `[min_x, min_y, min_z, max_x, max_y, max_z]`.
pub const DEFAULT_VOLUME_BOUNDS: [f32; 6] = [-150.0, -150.0, -150.0, 150.0, 150.0, 150.0];

/// Default maximum number of segments retained per path.
pub const DEFAULT_MAX_PATH_SEGMENTS: usize = 32;

/// Default number of concurrent asset fetches.
pub const DEFAULT_MAX_ASSET_WORKERS: usize = 4;

/// Default growth increment for instance buffers.
pub const DEFAULT_INSTANCE_CHUNK: usize = 1024;

fn default_palette() -> Vec<String> {
    [
        "#fee34d", "#f7b232", "#bf5736", "#94a7fc", "#ce8ec9", "#58606c", "#0ba345", "#9267cb",
        "#81dbe6", "#bd7800", "#bbbb99", "#5b79f0", "#89a500", "#da8692", "#418463", "#9f516c",
        "#00aabf",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// How agents are drawn and picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RenderStyle {
    /// Simple meshes, no ambient occlusion, CPU ray picking.
    Generic,
    /// Instanced spheres and atomic structures with the full pass chain and GPU picking.
    #[default]
    Instanced,
}

fn default_ao_radius1() -> f32 {
    1.2
}
fn default_ao_radius2() -> f32 {
    0.6
}
fn default_ao_threshold1() -> f32 {
    139.0
}
fn default_ao_threshold2() -> f32 {
    181.0
}
fn default_ao_falloff1() -> f32 {
    16.0
}
fn default_ao_falloff2() -> f32 {
    35.0
}
fn default_blur_radius1() -> f32 {
    1.5
}
fn default_blur_radius2() -> f32 {
    1.94
}
fn default_blur_depth_cutoff() -> f32 {
    0.5
}
fn default_outline_thickness() -> f32 {
    2.0
}
fn default_follow_thickness() -> f32 {
    3.0
}
fn default_alpha() -> f32 {
    0.8
}
fn default_outline_color() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}
fn default_follow_color() -> [f32; 3] {
    [35.0 / 255.0, 1.0, 0.0]
}
fn default_background() -> [f32; 3] {
    [0.0, 0.0, 0.0]
}

/// Parameters for the ambient occlusion, blur and outline passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderParams {
    #[serde(default = "default_ao_radius1")]
    pub ao_radius1: f32,
    #[serde(default = "default_ao_radius2")]
    pub ao_radius2: f32,
    /// View distance at which the first occlusion term starts to fade.
    #[serde(default = "default_ao_threshold1")]
    pub ao_threshold1: f32,
    #[serde(default = "default_ao_threshold2")]
    pub ao_threshold2: f32,
    /// Distance over which each occlusion term fades out past its threshold.
    #[serde(default = "default_ao_falloff1")]
    pub ao_falloff1: f32,
    #[serde(default = "default_ao_falloff2")]
    pub ao_falloff2: f32,
    #[serde(default = "default_blur_radius1")]
    pub blur_radius1: f32,
    #[serde(default = "default_blur_radius2")]
    pub blur_radius2: f32,
    /// Blur taps whose view depth differs from the center by more than this are ignored.
    #[serde(default = "default_blur_depth_cutoff")]
    pub blur_depth_cutoff: f32,
    #[serde(default = "default_outline_thickness")]
    pub outline_thickness: f32,
    #[serde(default = "default_outline_color")]
    pub outline_color: [f32; 3],
    #[serde(default = "default_alpha")]
    pub outline_alpha: f32,
    #[serde(default = "default_follow_thickness")]
    pub follow_thickness: f32,
    #[serde(default = "default_follow_color")]
    pub follow_color: [f32; 3],
    #[serde(default = "default_alpha")]
    pub follow_alpha: f32,
    #[serde(default = "default_background")]
    pub background_color: [f32; 3],
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            ao_radius1: default_ao_radius1(),
            ao_radius2: default_ao_radius2(),
            ao_threshold1: default_ao_threshold1(),
            ao_threshold2: default_ao_threshold2(),
            ao_falloff1: default_ao_falloff1(),
            ao_falloff2: default_ao_falloff2(),
            blur_radius1: default_blur_radius1(),
            blur_radius2: default_blur_radius2(),
            blur_depth_cutoff: default_blur_depth_cutoff(),
            outline_thickness: default_outline_thickness(),
            outline_color: default_outline_color(),
            outline_alpha: default_alpha(),
            follow_thickness: default_follow_thickness(),
            follow_color: default_follow_color(),
            follow_alpha: default_alpha(),
            background_color: default_background(),
        }
    }
}

fn default_max_segments() -> usize {
    DEFAULT_MAX_PATH_SEGMENTS
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathConfig {
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
    /// Color the oldest segment fades to. Defaults to the background.
    #[serde(default)]
    pub end_color: Option<[f32; 3]>,
    #[serde(default = "default_true")]
    pub show: bool,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            max_segments: default_max_segments(),
            end_color: None,
            show: true,
        }
    }
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_ASSET_WORKERS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Directory that asset names are resolved against.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            root: None,
        }
    }
}

fn default_lod_stops() -> Vec<f32> {
    vec![40.0, 100.0, 150.0]
}

/// Level of detail for atomic structures, chosen per agent by camera distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LodConfig {
    /// Ascending distances. Closer than `distance_stops[i]` selects level `i`;
    /// beyond the last stop selects the level after it.
    #[serde(default = "default_lod_stops")]
    pub distance_stops: Vec<f32>,
    /// Added to the selected level. Higher is coarser.
    #[serde(default)]
    pub bias: usize,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            distance_stops: default_lod_stops(),
            bias: 0,
        }
    }
}

impl LodConfig {
    /// Level for an agent `distance` away from the camera. Callers clamp the
    /// result to the levels a structure actually has.
    pub fn level(&self, distance: f32) -> usize {
        let level = self
            .distance_stops
            .iter()
            .position(|stop| distance < *stop)
            .unwrap_or(self.distance_stops.len());
        level + self.bias
    }
}

fn default_chunk() -> usize {
    DEFAULT_INSTANCE_CHUNK
}
fn default_bounds() -> [f32; 6] {
    DEFAULT_VOLUME_BOUNDS
}
fn default_atom_radius() -> f32 {
    1.0
}

/// Top-level configuration for a viewer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerConfig {
    #[serde(default)]
    pub render: RenderParams,
    #[serde(default)]
    pub paths: PathConfig,
    #[serde(default)]
    pub assets: AssetConfig,
    #[serde(default = "default_chunk")]
    pub instance_chunk: usize,
    #[serde(default = "default_bounds")]
    pub volume_bounds: [f32; 6],
    #[serde(default)]
    pub render_style: RenderStyle,
    /// Radius of a single atom sphere before the type's scale is applied.
    #[serde(default = "default_atom_radius")]
    pub atom_radius: f32,
    #[serde(default)]
    pub lod: LodConfig,
    #[serde(default = "default_palette")]
    pub palette: Vec<String>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            render: RenderParams::default(),
            paths: PathConfig::default(),
            assets: AssetConfig::default(),
            instance_chunk: default_chunk(),
            volume_bounds: default_bounds(),
            render_style: RenderStyle::default(),
            atom_radius: default_atom_radius(),
            lod: LodConfig::default(),
            palette: default_palette(),
        }
    }
}

impl ViewerConfig {
    /// Load and validate a config from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.max_segments == 0 {
            return Err(ConfigError::Invalid("paths.maxSegments must be positive".into()));
        }
        if self.assets.max_workers == 0 {
            return Err(ConfigError::Invalid("assets.maxWorkers must be positive".into()));
        }
        if self.instance_chunk == 0 {
            return Err(ConfigError::Invalid("instanceChunk must be positive".into()));
        }
        if self.palette.is_empty() {
            return Err(ConfigError::Invalid("palette cannot be empty".into()));
        }
        if self.lod.distance_stops.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::Invalid("lod.distanceStops must be ascending".into()));
        }
        let b = &self.volume_bounds;
        if (0..3).any(|i| b[i + 3] < b[i]) {
            return Err(ConfigError::Invalid(format!("volume bounds {:?} are inverted", b)));
        }
        Ok(())
    }

    /// Color the path fade ends at.
    pub fn path_end_color(&self) -> [f32; 3] {
        self.paths.end_color.unwrap_or(self.render.background_color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: ViewerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.paths.max_segments, 32);
        assert_eq!(config.assets.max_workers, 4);
        assert_eq!(config.volume_bounds, DEFAULT_VOLUME_BOUNDS);
        assert_eq!(config.render.ao_threshold2, 181.0);
        assert_eq!(config.render_style, RenderStyle::Instanced);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_camel_case_overrides() {
        let json = r#"{
            "renderStyle": "generic",
            "paths": { "maxSegments": 8, "endColor": [1.0, 0.0, 0.0] },
            "render": { "followThickness": 5.0 }
        }"#;
        let config: ViewerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.render_style, RenderStyle::Generic);
        assert_eq!(config.paths.max_segments, 8);
        assert_eq!(config.path_end_color(), [1.0, 0.0, 0.0]);
        assert_eq!(config.render.follow_thickness, 5.0);
        assert_eq!(config.render.outline_thickness, 2.0);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = ViewerConfig::default();
        config.assets.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_path_end_color_falls_back_to_background() {
        let mut config = ViewerConfig::default();
        config.render.background_color = [0.2, 0.3, 0.4];
        assert_eq!(config.path_end_color(), [0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_lod_level_by_distance() {
        let lod = LodConfig::default();
        assert_eq!(lod.level(0.0), 0);
        assert_eq!(lod.level(39.9), 0);
        assert_eq!(lod.level(40.0), 1);
        assert_eq!(lod.level(120.0), 2);
        assert_eq!(lod.level(1.0e6), 3);
        assert_eq!(lod.level(f32::NAN), 3);

        let biased = LodConfig {
            bias: 1,
            ..LodConfig::default()
        };
        assert_eq!(biased.level(10.0), 1);
        assert_eq!(biased.level(500.0), 4);
    }

    #[test]
    fn test_validate_rejects_unsorted_lod_stops() {
        let json = r#"{ "lod": { "distanceStops": [100.0, 40.0] } }"#;
        let config: ViewerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.lod.bias, 0);
        assert!(config.validate().is_err());
    }
}

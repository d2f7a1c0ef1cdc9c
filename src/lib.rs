pub mod agent;
pub mod asset_queue;
pub mod camera;
pub mod color;
pub mod config;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod instance_pool;
pub mod mesh_asset;
pub mod path_trail;
pub mod render_agent;
pub mod scene_manager;
pub mod type_map;
pub mod viewer;

#[cfg(not(target_arch = "wasm32"))]
pub mod cli;

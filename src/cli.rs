use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::agent::{AgentRecord, InstanceId};
use crate::asset_queue::FileAssetProvider;
use crate::config::{RenderStyle, ViewerConfig};
use crate::type_map::TypeMap;
use crate::viewer::Viewer;

/// How long a frame may wait for its geometry before rendering with fallbacks.
const ASSET_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum StyleArg {
    Instanced,
    Generic,
}

impl From<StyleArg> for RenderStyle {
    fn from(value: StyleArg) -> Self {
        match value {
            StyleArg::Instanced => RenderStyle::Instanced,
            StyleArg::Generic => RenderStyle::Generic,
        }
    }
}

#[derive(clap::Args)]
struct SceneArgs {
    /// JSON file holding an array of frames, each an array of agent records
    #[arg(long)]
    frames: PathBuf,

    /// JSON type map (type id to mesh/pdb/scale/color)
    #[arg(long)]
    type_map: Option<PathBuf>,

    /// JSON viewer config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory geometry assets are loaded from (overrides the config)
    #[arg(long)]
    assets: Option<PathBuf>,

    /// Render style (overrides the config)
    #[arg(long, value_enum)]
    style: Option<StyleArg>,

    /// Output width
    #[arg(long, default_value_t = 800)]
    width: u32,

    /// Output height
    #[arg(long, default_value_t = 600)]
    height: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Render frames to PNG files
    Render {
        #[command(flatten)]
        scene: SceneArgs,

        /// Output directory for frames
        #[arg(long)]
        out: PathBuf,

        /// Agent to follow with the camera
        #[arg(long)]
        follow: Option<InstanceId>,

        /// Agents to draw paths for
        #[arg(long, value_delimiter = ',')]
        trace: Vec<InstanceId>,
    },
    /// Report which agent is under a pixel of a frame
    Pick {
        #[command(flatten)]
        scene: SceneArgs,

        /// Frame index to pick in
        #[arg(long, default_value_t = 0)]
        frame: usize,

        #[arg(long)]
        x: u32,

        #[arg(long)]
        y: u32,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Render {
            scene,
            out,
            follow,
            trace,
        } => pollster::block_on(render_offline(scene, out, follow, trace)),
        Commands::Pick { scene, frame, x, y } => pollster::block_on(pick(scene, frame, x, y)),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} from {:?}", what, path))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {} in {:?}", what, path))
}

/// Load frames and config, and build a viewer ready for the first frame.
async fn load_scene(scene: &SceneArgs) -> Result<(Viewer, Vec<Vec<AgentRecord>>)> {
    let frames: Vec<Vec<AgentRecord>> = read_json(&scene.frames, "frames")?;
    let mut config = match &scene.config {
        Some(path) => ViewerConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => ViewerConfig::default(),
    };
    if let Some(style) = scene.style {
        config.render_style = style.into();
    }

    let root = scene
        .assets
        .clone()
        .or_else(|| config.assets.root.clone())
        .or_else(|| scene.type_map.as_ref().and_then(|p| p.parent().map(Path::to_path_buf)))
        .unwrap_or_else(|| PathBuf::from("."));
    log::info!("Loading assets from {:?}", root);

    let mut viewer = Viewer::headless(
        config,
        Arc::new(FileAssetProvider::new(root)),
        scene.width,
        scene.height,
    )
    .await?;

    if let Some(path) = &scene.type_map {
        let type_map: TypeMap = read_json(path, "type map")?;
        viewer.engine_mut().set_type_map(type_map);
    }

    Ok((viewer, frames))
}

async fn render_offline(
    scene: SceneArgs,
    out_dir: PathBuf,
    follow: Option<InstanceId>,
    trace: Vec<InstanceId>,
) -> Result<()> {
    let (mut viewer, frames) = load_scene(&scene).await?;
    std::fs::create_dir_all(&out_dir)?;
    let (width, height) = viewer.renderer().size();

    println!("Rendering {} frames to {:?}...", frames.len(), out_dir);

    for (i, frame) in frames.iter().enumerate() {
        let stats = viewer.apply_frame(frame);
        viewer.engine_mut().wait_for_assets(ASSET_WAIT);

        // Follow and trace targets only exist once they have appeared
        if let Some(id) = follow {
            if viewer.engine().manager().followed().is_none() && viewer.engine().manager().agent(id).is_some() {
                viewer.engine_mut().set_followed_agent(id);
            }
        }
        for id in &trace {
            if !viewer.engine().paths().has_path(*id) && viewer.engine().manager().agent(*id).is_some() {
                viewer.engine_mut().add_path_for_agent(*id);
            }
        }

        viewer.tick();
        viewer.render();
        let pixels = viewer.read_output_rgba()?;

        let frame_path = out_dir.join(format!("frame_{:05}.png", i));
        image::save_buffer(&frame_path, &pixels, width, height, image::ColorType::Rgba8)
            .with_context(|| format!("Failed to write {:?}", frame_path))?;

        log::debug!("Frame {}: {:?}", i, stats);
        if i % 60 == 0 {
            print!(".");
            use std::io::Write;
            std::io::stdout().flush()?;
        }
    }
    println!("\nDone.");

    Ok(())
}

async fn pick(scene: SceneArgs, frame: usize, x: u32, y: u32) -> Result<()> {
    let (mut viewer, frames) = load_scene(&scene).await?;
    let records = frames
        .get(frame)
        .with_context(|| format!("Frame {} out of range ({} frames)", frame, frames.len()))?;

    viewer.apply_frame(records);
    viewer.engine_mut().wait_for_assets(ASSET_WAIT);
    viewer.tick();
    viewer.render();

    match viewer.hit_test(x, y)? {
        Some(id) => {
            let agent = viewer.engine().manager().agent(id);
            let type_name = agent
                .map(|a| viewer.engine().type_map().display_name(a.type_id))
                .unwrap_or_default();
            println!("{} {}", id, type_name);
        }
        None => println!("none"),
    }
    Ok(())
}

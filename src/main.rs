//! Spot Overlay - command line front end
//!
//! CLI commands:
//! - render: map measures onto a mesh, image or volume and write the colors
//! - bounds: print intensity bounds of each measure under every scale
//! - colormaps: list colormaps and their gradient stops

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use spot_overlay::colormap;
use spot_overlay::config::{Env, Settings};
use spot_overlay::geometry::{Geometry, Substrate, VolumeGrid};
use spot_overlay::loaders::{MeasuresLoader, SpotLayout};
use spot_overlay::logging;
use spot_overlay::normalize::{Bounds, Scale};
use spot_overlay::workspace::{OverlaySnapshot, Workspace};

#[derive(Parser)]
#[command(name = "spot_overlay")]
#[command(about = "Overlay per-spot measurements on images, meshes and volumes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to overlay.yaml (default: $SPOT_OVERLAY_SETTINGS or overlay.yaml)
    #[arg(short, long)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Map measures onto a substrate and write per-primitive colors
    Render {
        /// Measures CSV
        #[arg(long)]
        measures: PathBuf,

        /// CSV uses name,x,y,z,sx,sy,sz instead of name,x,y,z,r
        #[arg(long)]
        cuboids: bool,

        #[command(flatten)]
        substrate: SubstrateArgs,

        /// Physical volume size as SX,SY,SZ (default: one unit per voxel)
        #[arg(long, requires = "volume")]
        volume_size: Option<String>,

        /// Measure to display (default: from settings, else the first one)
        #[arg(long)]
        measure: Option<String>,

        /// Output file, .json or .png (image substrates only)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print intensity bounds per measure and scale
    Bounds {
        #[arg(long)]
        measures: PathBuf,

        #[arg(long)]
        cuboids: bool,

        /// Only this measure
        #[arg(long)]
        measure: Option<String>,
    },

    /// List available colormaps
    Colormaps,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct SubstrateArgs {
    /// Wavefront OBJ mesh
    #[arg(long)]
    mesh: Option<PathBuf>,

    /// PNG or JPEG image
    #[arg(long)]
    image: Option<PathBuf>,

    /// Voxel grid as LXxLYxLZ
    #[arg(long)]
    volume: Option<String>,
}

#[derive(Serialize)]
struct RenderOutput {
    generated: String,
    substrate: &'static str,
    measure: Option<String>,
    scale: Scale,
    min: f64,
    max: f64,
    primitives: usize,
    mapped: usize,
    base_color: [f32; 3],
    colors: Vec<[f32; 3]>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let env = Env::load();
    logging::init_logging(&env.log_dir)?;
    tracing::info!("Spot Overlay starting up");

    let cli = Cli::parse();
    let settings_path = cli.settings.clone().unwrap_or(env.settings_path);
    let explicit_settings = cli.settings.is_some();

    match cli.command {
        Commands::Render {
            measures,
            cuboids,
            substrate,
            volume_size,
            measure,
            output,
        } => {
            let settings = read_settings_text(&settings_path, explicit_settings)?;
            let snapshot = render(
                &measures,
                layout(cuboids),
                &substrate,
                volume_size.as_deref(),
                measure.as_deref(),
                settings,
            )
            .await?;
            write_output(&snapshot, &output)?;
        }

        Commands::Bounds {
            measures,
            cuboids,
            measure,
        } => {
            let settings = if settings_path.exists() {
                Settings::load(&settings_path)?
            } else if explicit_settings {
                bail!("Settings file not found: {}", settings_path.display());
            } else {
                Settings::default()
            };
            print_bounds(&measures, layout(cuboids), measure.as_deref(), &settings)?;
        }

        Commands::Colormaps => {
            for map in colormap::ALL {
                let stops: Vec<String> = map
                    .gradient()
                    .into_iter()
                    .map(|(stop, color)| format!("{} {}", stop, color))
                    .collect();
                println!("{:8} {}", map.id, stops.join(", "));
            }
        }
    }

    Ok(())
}

fn layout(cuboids: bool) -> SpotLayout {
    if cuboids {
        SpotLayout::Cuboid
    } else {
        SpotLayout::Sphere
    }
}

/// Settings are optional unless given explicitly on the command line
fn read_settings_text(path: &Path, explicit: bool) -> anyhow::Result<Option<String>> {
    if !path.exists() {
        if explicit {
            bail!("Settings file not found: {}", path.display());
        }
        tracing::debug!("No settings at {}, using defaults", path.display());
        return Ok(None);
    }
    tracing::info!("Loading settings from {}", path.display());
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings {}", path.display()))?;
    Ok(Some(text))
}

fn read_bytes(path: &Path) -> anyhow::Result<Arc<[u8]>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Arc::from(bytes))
}

async fn render(
    measures: &Path,
    layout: SpotLayout,
    substrate: &SubstrateArgs,
    volume_size: Option<&str>,
    measure: Option<&str>,
    settings: Option<String>,
) -> anyhow::Result<OverlaySnapshot> {
    let workspace = Workspace::new();

    workspace.load_measures(read_bytes(measures)?, layout);
    if let Some(mesh) = &substrate.mesh {
        workspace.load_mesh(read_bytes(mesh)?);
    } else if let Some(image) = &substrate.image {
        workspace.load_image(read_bytes(image)?);
    } else if let Some(volume) = &substrate.volume {
        let lengths = parse_lengths(volume)?;
        let size = match volume_size {
            Some(size) => parse_size(size)?,
            None => lengths.map(|l| l as f32),
        };
        workspace.set_geometry(Geometry::volume(VolumeGrid::new(lengths, size)));
    }
    // Applied once the loads above have settled
    if let Some(text) = settings {
        workspace.load_settings(Arc::from(text));
    }
    workspace.wait_idle().await;

    if let Some(name) = measure {
        workspace.select_measure_by_name(name)?;
        workspace.wait_idle().await;
    }

    let errors = workspace.errors();
    if !errors.is_empty() {
        bail!(errors.join("\n"));
    }

    let snapshot = workspace.snapshot();
    tracing::info!(
        "Rendered measure {:?} on {} primitives",
        snapshot.measure,
        snapshot.geometry.as_ref().map_or(0, |g| g.primitive_count())
    );
    Ok(snapshot)
}

fn write_output(snapshot: &OverlaySnapshot, output: &Path) -> anyhow::Result<()> {
    let Some(geometry) = &snapshot.geometry else {
        bail!("No geometry loaded");
    };
    let Some(colors) = &snapshot.colors else {
        bail!("Nothing was rendered");
    };

    let extension = output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("json")
        .to_ascii_lowercase();
    match extension.as_str() {
        "png" => {
            let Substrate::Image { width, height } = geometry.substrate() else {
                bail!("PNG output needs an image substrate, got {}", geometry.kind());
            };
            let bytes = colors
                .iter()
                .map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
                .collect();
            let picture = image::RgbImage::from_raw(*width, *height, bytes)
                .context("Color buffer does not match the image size")?;
            picture
                .save(output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
        }
        _ => {
            let result = RenderOutput {
                generated: chrono::Utc::now().to_rfc3339(),
                substrate: geometry.kind(),
                measure: snapshot.measure.clone(),
                scale: snapshot.scale,
                min: snapshot.bounds.min,
                max: snapshot.bounds.max,
                primitives: geometry.primitive_count(),
                mapped: snapshot.mapping.as_ref().map_or(0, |m| m.mapped_count()),
                base_color: snapshot.base_color,
                colors: colors.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect(),
            };
            std::fs::write(output, serde_json::to_string_pretty(&result)?)
                .with_context(|| format!("Failed to write {}", output.display()))?;
        }
    }

    println!("Wrote {}", output.display());
    Ok(())
}

fn print_bounds(
    path: &Path,
    layout: SpotLayout,
    only: Option<&str>,
    settings: &Settings,
) -> anyhow::Result<()> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let data = MeasuresLoader::new(layout).parse(file, |_| Ok(()))?;

    let measures: Vec<_> = data
        .measures
        .iter()
        .filter(|m| only.map_or(true, |name| m.name == name))
        .collect();
    if measures.is_empty() {
        bail!("No matching measures in {}", path.display());
    }

    println!(
        "{} spots, hotspot quantile {}",
        data.spots.len(),
        settings.hotspot_quantile
    );
    for measure in measures {
        println!("## {}", measure.name);
        for scale in Scale::ALL {
            let bounds = Bounds::from_values(&measure.values, scale, settings.hotspot_quantile);
            println!(
                "  {:6} {:14} min={:.4} max={:.4}",
                scale.id(),
                scale.legend(),
                bounds.min,
                bounds.max
            );
        }
    }
    Ok(())
}

/// "64x64x32" -> [64, 64, 32]
fn parse_lengths(text: &str) -> anyhow::Result<[usize; 3]> {
    let parts: Vec<usize> = text
        .split('x')
        .map(|p| p.trim().parse::<usize>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("Invalid volume dimensions: {}", text))?;
    match parts[..] {
        [x, y, z] if x > 0 && y > 0 && z > 0 => Ok([x, y, z]),
        _ => bail!("Volume dimensions must be LXxLYxLZ, got {}", text),
    }
}

/// "1.5,1.5,3" -> [1.5, 1.5, 3.0]
fn parse_size(text: &str) -> anyhow::Result<[f32; 3]> {
    let parts: Vec<f32> = text
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("Invalid volume size: {}", text))?;
    match parts[..] {
        [x, y, z] if x > 0.0 && y > 0.0 && z > 0.0 => Ok([x, y, z]),
        _ => bail!("Volume size must be SX,SY,SZ, got {}", text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_volume_args() {
        assert_eq!(parse_lengths("64x32x8").unwrap(), [64, 32, 8]);
        assert!(parse_lengths("64x32").is_err());
        assert!(parse_lengths("0x1x1").is_err());
        assert_eq!(parse_size("1.5, 2,3").unwrap(), [1.5, 2.0, 3.0]);
        assert!(parse_size("1,2,-3").is_err());
    }

    #[test]
    fn test_cli_requires_one_substrate() {
        let parsed = Cli::try_parse_from([
            "spot_overlay", "render", "--measures", "m.csv", "--mesh", "a.obj", "--image", "b.png",
            "--output", "o.json",
        ]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from([
            "spot_overlay", "render", "--measures", "m.csv", "--volume", "4x4x4", "--output",
            "o.json",
        ]);
        assert!(parsed.is_ok());
    }
}

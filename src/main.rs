use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use simplelog::{Config, LevelFilter, WriteLogger};

use pagetile::cache::TileCoordinate;
use pagetile::config::PagetileConfig;
use pagetile::coordinator::RenderCoordinator;
use pagetile::pool::WorkerCount;
use pagetile::render::{SyntheticModule, synthetic_document};

/// Drives a synthetic zoom sweep through the render pool and tile cache,
/// then prints the collected statistics as JSON.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker count (1-4), overrides the configuration
    #[arg(long)]
    workers: Option<usize>,

    /// Pages in the synthetic document
    #[arg(long, default_value_t = 6)]
    pages: u32,

    /// Comma-separated zoom levels to sweep through
    #[arg(long, value_delimiter = ',', default_value = "1,2,4,8,16,3,1.5")]
    zoom: Vec<f32>,

    #[arg(long, default_value = "pagetile.log")]
    log_file: PathBuf,

    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

fn main() -> Result<()> {
    let args = Args::parse();

    WriteLogger::init(
        args.log_level,
        Config::default(),
        File::create(&args.log_file)
            .with_context(|| format!("cannot create log file {:?}", args.log_file))?,
    )?;
    better_panic::install();

    let mut config = match &args.config {
        Some(path) => PagetileConfig::load(path)?,
        None => PagetileConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = WorkerCount::Fixed(workers);
        config.validate()?;
    }

    let coordinator = RenderCoordinator::create(&config, Arc::new(SyntheticModule::default()))?;
    let document = coordinator.open_document(&synthetic_document(args.pages.max(1)), true)?;
    info!(
        "sweeping {} zoom levels over {} pages",
        args.zoom.len(),
        document.page_count
    );
    coordinator.set_viewport(1280.0, 800.0);

    let mut previous_zoom = None;
    for &zoom in &args.zoom {
        let focal_page = document.page_count / 2;
        if let Some(previous) = previous_zoom {
            coordinator.on_zoom_change(previous, zoom, focal_page, (focal_page, focal_page));
        }
        previous_zoom = Some(zoom);

        for page in 0..document.page_count {
            let first = TileCoordinate {
                document: document.document,
                page,
                tile_x: 0,
                tile_y: 0,
                scale: zoom,
                tile_size: 256,
            };
            let tile_size = coordinator.decide(&first)?.tile_size;
            // The visible corner of the page: up to 3x3 tiles
            let tiles: Vec<_> = (0..3)
                .flat_map(|y| (0..3).map(move |x| (x, y)))
                .map(|(tile_x, tile_y)| TileCoordinate {
                    tile_x,
                    tile_y,
                    tile_size,
                    ..first
                })
                .collect();

            for tile in &tiles {
                if coordinator.get_tile(tile).is_some() {
                    continue;
                }
                if coordinator.get_best_available_tile(tile).is_none() {
                    debug!(
                        "nothing to show yet for page {page} tile ({}, {})",
                        tile.tile_x, tile.tile_y
                    );
                }
                if let Err(e) = coordinator.request_render(tile) {
                    warn!("render of page {page} at zoom {zoom} failed: {e}");
                }
            }
        }
    }

    let stats = coordinator.get_stats();
    coordinator.shutdown();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

//! cxr-rs CLI: serve the classifier over HTTP, classify single files, and
//! inspect checkpoints.

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cxr::core::DeviceSelection;
use cxr::infer::{Pipeline, ServiceConfig};
use cxr::models::ModelRegistry;
use cxr::InferBackend;

#[derive(Parser)]
#[command(name = "cxr")]
#[command(author, version)]
#[command(about = "Chest radiograph classification with Grad-CAM heatmaps")]
#[command(long_about = "cxr-rs: classify chest X-rays with an EfficientNet-B0 checkpoint and
explain each prediction with a Grad-CAM overlay.

EXAMPLES:
  # Serve the HTTP API on the default address
  cxr serve --model-path models/best_model.pth

  # Classify one image and save the overlay
  cxr predict chest.png --heatmap-out chest_cam.png

  # Show what a checkpoint contains
  cxr inspect --model-path models/best_model.pth

ENVIRONMENT:
  MODEL_PATH   Checkpoint path           [default: models/best_model.pth]
  IMG_SIZE     Square input resolution   [default: 224]
  DEVICE       auto, cpu, gpu[:N]        [default: auto]

Settings resolve as: defaults < --config file < environment < flags.")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API (GET /health, POST /predict, POST /reload)
    Serve {
        #[command(flatten)]
        settings: SettingsArgs,

        /// Listen address
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Classify one image and print the JSON response
    Predict {
        /// Image file (PNG, JPEG, ...)
        image: PathBuf,

        /// Write the heatmap overlay here; the format follows the extension
        #[arg(long, value_name = "FILE")]
        heatmap_out: Option<PathBuf>,

        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Load the checkpoint and print its labels, architecture and device
    Inspect {
        #[command(flatten)]
        settings: SettingsArgs,
    },
}

/// Settings shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
struct SettingsArgs {
    /// JSON config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Checkpoint path (.pth, .pt or .mpk)
    #[arg(long, value_name = "PATH")]
    model_path: Option<PathBuf>,

    /// Square input resolution the checkpoint was trained at
    #[arg(long, value_name = "N")]
    image_size: Option<usize>,

    /// Compute device: auto, cpu, gpu, gpu:N
    #[arg(long, value_name = "DEVICE")]
    device: Option<DeviceSelection>,
}

impl SettingsArgs {
    /// Resolve the full configuration, flags taking precedence.
    fn resolve(&self) -> Result<ServiceConfig> {
        let mut config = ServiceConfig::load(self.config.as_deref())
            .context("Failed to load configuration")?;

        if let Some(path) = &self.model_path {
            config.model_path = path.clone();
        }
        if let Some(size) = self.image_size {
            config.image_size = size;
        }
        if let Some(device) = self.device {
            config.device = device;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    match cli.command {
        Commands::Serve { settings, bind } => handle_serve(settings, bind),
        Commands::Predict {
            image,
            heatmap_out,
            settings,
        } => handle_predict(image, heatmap_out, settings),
        Commands::Inspect { settings } => handle_inspect(settings),
    }
}

fn build_registry(config: &ServiceConfig) -> Arc<ModelRegistry<InferBackend>> {
    Arc::new(ModelRegistry::new(
        &config.model_path,
        config.load_options(),
    ))
}

fn handle_serve(settings: SettingsArgs, bind: Option<String>) -> Result<()> {
    let mut config = settings.resolve()?;
    if let Some(bind) = bind {
        config.bind = bind;
    }

    let registry = build_registry(&config);
    // The service starts without a model; /health reports it and /reload retries.
    if let Ok(state) = registry.reload() {
        tracing::info!(
            path = %state.source().display(),
            device = state.device_label(),
            "model ready"
        );
    }

    let pipeline = Arc::new(Pipeline::from_config(registry, &config));
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(server::serve(pipeline, &config.bind))
}

fn handle_predict(
    image: PathBuf,
    heatmap_out: Option<PathBuf>,
    settings: SettingsArgs,
) -> Result<()> {
    let config = settings.resolve()?;
    let registry = build_registry(&config);
    registry
        .reload()
        .with_context(|| format!("Failed to load model from {}", config.model_path.display()))?;

    let bytes = std::fs::read(&image)
        .with_context(|| format!("Failed to read image {}", image.display()))?;

    let pipeline = Pipeline::from_config(registry, &config);
    let output = pipeline
        .run(&bytes)
        .with_context(|| format!("Prediction failed for {}", image.display()))?;

    if let Some(path) = heatmap_out {
        match &output.overlay {
            Some(overlay) => {
                overlay
                    .image()
                    .save(&path)
                    .with_context(|| format!("Failed to write heatmap {}", path.display()))?;
                tracing::info!(path = %path.display(), "heatmap written");
            }
            None => bail!("No heatmap was produced for {}", image.display()),
        }
    }

    println!("{}", serde_json::to_string_pretty(&output.to_response())?);
    Ok(())
}

fn handle_inspect(settings: SettingsArgs) -> Result<()> {
    let config = settings.resolve()?;
    let registry = build_registry(&config);
    let state = registry
        .reload()
        .with_context(|| format!("Failed to load model from {}", config.model_path.display()))?;

    let model_config = state.config();
    let normalization = state.normalization();

    println!("Checkpoint: {}", state.source().display());
    println!("─────────────────────────────────────────");
    println!("  Architecture:   efficientnet_b0");
    println!("  Stages:         {}", model_config.stages.len());
    println!("  Head channels:  {}", model_config.head_channels);
    println!("  Feature layers: {}", state.n_feature_layers());
    println!("  Image size:     {}x{}", state.image_size(), state.image_size());
    println!("  Mean:           {:?}", normalization.mean);
    println!("  Std:            {:?}", normalization.std);
    println!("  Device:         {}", state.device_label());
    println!();
    println!("  Classes:        {}", state.n_classes());
    for (index, label) in state.labels().iter().enumerate() {
        println!("    {:>2}  {}", index, label);
    }
    println!();

    match config.target_layers.resolve(state.n_feature_layers()) {
        Ok(layer) => println!("  Grad-CAM layer: features.{}", layer),
        Err(e) => println!("  Grad-CAM layer: unavailable ({})", e),
    }

    Ok(())
}

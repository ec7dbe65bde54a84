use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facereg_core::{Detector, Embedder, FaceDetector, FaceRecognizer, IngestLimits};
use std::path::PathBuf;

mod client;

use client::Client;

#[derive(Parser)]
#[command(name = "facereg", about = "facereg face-recognition CLI")]
struct Cli {
    /// Base URL of the faceregd server
    #[arg(long, env = "FACEREG_SERVER", default_value = "http://localhost:5001")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered persons
    List,
    /// Register the most prominent face in an image
    Register {
        /// Name of the person
        #[arg(short, long)]
        name: String,
        /// Image file (JPEG, PNG, WebP or BMP)
        image: PathBuf,
    },
    /// Recognize every face in an image
    Recognize { image: PathBuf },
    /// Rename a person
    Rename { id: i64, name: String },
    /// Delete a person and their embeddings
    Delete { id: i64 },
    /// Show daemon status
    Status,
    /// Run detection and embedding locally, without the daemon
    Detect {
        image: PathBuf,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long, env = "FACEREG_MODEL_DIR")]
        models: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.server);

    let output = match cli.command {
        Commands::List => client.list().await?,
        Commands::Register { name, image } => client.register(&name, &image).await?,
        Commands::Recognize { image } => client.recognize(&image).await?,
        Commands::Rename { id, name } => client.rename(id, &name).await?,
        Commands::Delete { id } => client.delete(id).await?,
        Commands::Status => client.status().await?,
        Commands::Detect { image, models } => {
            let models = models.unwrap_or_else(facereg_core::default_model_dir);
            return detect_local(image, models).await;
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Diagnostics: decode, detect and embed on this machine.
async fn detect_local(image: PathBuf, model_dir: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let bytes = std::fs::read(&image).with_context(|| format!("failed to read {}", image.display()))?;
        let decoded = facereg_core::ingest::decode_bytes(&bytes, &IngestLimits::default())?;
        println!(
            "{}: {}x{} {:?}",
            image.display(),
            decoded.width(),
            decoded.height(),
            decoded.format
        );

        let scrfd = model_dir.join(facereg_core::SCRFD_MODEL_FILE);
        let arcface = model_dir.join(facereg_core::ARCFACE_MODEL_FILE);
        let mut detector = FaceDetector::load(&scrfd.to_string_lossy())?;
        let mut recognizer = FaceRecognizer::load(&arcface.to_string_lossy())?;

        let start = std::time::Instant::now();
        let faces = detector.detect(&decoded.rgb)?;
        println!("{} face(s) in {:.1?}", faces.len(), start.elapsed());

        for (i, face) in faces.iter().enumerate() {
            let (x, y, w, h) = face.clamped(decoded.width(), decoded.height());
            let embedding = recognizer.extract(&decoded.rgb, face)?;
            println!(
                "  [{i}] box=({x}, {y}, {w}, {h}) score={:.3} dim={} norm={:.4}",
                face.confidence,
                embedding.dim(),
                embedding.norm()
            );
        }
        Ok(())
    })
    .await?
}

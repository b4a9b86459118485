use anyhow::Context;
use clap::{Parser, Subcommand};
use gunshot_identifier::audio_processor::AudioContainer;
use gunshot_identifier::{AnalysisOrchestrator, AnalysisRequest, AnalyzerConfig, AudioProcessor, MfccExtractor, Result};
use log::info;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "gunshot-identifier", version, about = "Identify the weapon behind a recorded gunshot")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify and localize a single recording
    Analyze {
        file: PathBuf,
        /// Overrides the type guessed from the file extension
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long)]
        cloud_endpoint: Option<String>,
        /// Caller identity for the audit log
        #[arg(long)]
        caller: Option<String>,
    },
    /// Print the feature vector of a recording
    Features { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AnalyzerConfig::load_from_file(path),
        None => AnalyzerConfig::default(),
    }
    .with_env_overrides();

    match cli.command {
        Command::Analyze {
            file,
            content_type,
            model,
            cloud_endpoint,
            caller,
        } => {
            if let Some(model) = model {
                config.model.path = model;
            }
            if let Some(endpoint) = cloud_endpoint {
                config.cloud.endpoint = Some(endpoint);
            }
            analyze_file(&config, &file, content_type, caller).await
        }
        Command::Features { file } => print_features(&config, &file),
    }
}

async fn analyze_file(
    config: &AnalyzerConfig,
    file: &Path,
    content_type: Option<String>,
    caller: Option<String>,
) -> Result<()> {
    let content_type = match content_type {
        Some(content_type) => content_type,
        None => guess_content_type(file)?,
    };
    info!("Analyzing {} as {}", file.display(), content_type);

    let audio = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let orchestrator = AnalysisOrchestrator::from_config(config)?;

    let mut request = AnalysisRequest::new(audio, content_type);
    request.caller = caller;
    let response = orchestrator.respond(request).await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_features(config: &AnalyzerConfig, file: &Path) -> Result<()> {
    let processor = AudioProcessor::from_config(&config.audio);
    let extractor = MfccExtractor::from_config(config.audio.sample_rate as f32, &config.features);

    let sample = processor.load_audio_file(file)?;
    info!(
        "Loaded {} samples ({:.2} seconds, {} channel(s))",
        sample.len(),
        sample.duration_secs(),
        sample.channel_count()
    );

    let features = extractor.extract(&sample);
    let named: Vec<serde_json::Value> = extractor
        .feature_names()
        .into_iter()
        .zip(features.as_slice())
        .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
        .collect();

    let output = serde_json::json!({ "file": file.display().to_string(), "features": named });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn guess_content_type(file: &Path) -> Result<String> {
    let container = file
        .extension()
        .and_then(|e| e.to_str())
        .and_then(AudioContainer::from_extension)
        .with_context(|| format!("cannot infer audio type of {}; pass --content-type", file.display()))?;
    Ok(container.content_type().to_string())
}

use std::{
    io::Write,
    path::PathBuf,
    sync::Arc,
};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use crowdscan::{
    AnalysisEvent, AnalysisOptions, Analyzer, Category, CategorySet, ContentId, CrowdscanError,
    Detector, DetectorCredentials, DetectorSlot, FfmpegLogLevel, FileCache, HttpDetector,
    RemoteFetcher, VideoFile, VideoSource, YtDlpFetcher,
    configuration::{DEFAULT_CACHE_VERSION, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_INTERVAL_SECONDS},
    detector::{DEFAULT_DETECTOR_ENDPOINT, DEFAULT_DETECTOR_MODEL},
    motion::DEFAULT_MOTION_THRESHOLD,
};

const CLI_AFTER_HELP: &str = "Examples:\n  crowdscan analyze crowd.mp4 --progress\n  crowdscan analyze https://www.youtube.com/watch?v=VIDEO_ID --interval 2\n  crowdscan analyze crowd.mp4 --class adults=man,woman --class children=child,kid\n  crowdscan probe crowd.mp4 --json\n  crowdscan completions zsh > _crowdscan";

#[derive(Debug, Parser)]
#[command(
    name = "crowdscan",
    version,
    about = "Count people in a video over time",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone, Default)]
struct GlobalOptions {
    /// Show additional logging output.
    #[arg(long, global = true)]
    verbose: bool,

    /// FFmpeg log level (quiet, error, warning, info, debug).
    #[arg(long, global = true)]
    log_level: Option<FfmpegLogLevel>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Analyse a video and stream status records as NDJSON on stdout.
    #[command(
        about = "Build a people-count timeline",
        after_help = "Examples:\n  crowdscan analyze crowd.mp4\n  crowdscan analyze crowd.mp4 --interval 0.5 --motion-threshold 8 --progress"
    )]
    Analyze {
        /// Local video path or http(s) URL.
        input: String,

        #[command(flatten)]
        analysis: AnalysisArgs,

        #[command(flatten)]
        detector: DetectorArgs,

        /// Directory holding cached timelines.
        #[arg(long, default_value = "cache")]
        cache_dir: PathBuf,

        /// Show a progress bar on stderr.
        #[arg(long)]
        progress: bool,
    },

    /// Print stream metadata for a local video.
    #[command(about = "Print video metadata", visible_alias = "info")]
    Probe {
        /// Local video path.
        input: PathBuf,

        /// Output metadata as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the cache key an input resolves to.
    #[command(about = "Print the cache key for an input")]
    CacheKey {
        /// Local video path or http(s) URL.
        input: String,

        /// Cache-format version tag.
        #[arg(long, default_value = DEFAULT_CACHE_VERSION)]
        cache_version: String,
    },

    /// Generate shell completion scripts.
    #[command(about = "Generate shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Parser, Clone)]
struct AnalysisArgs {
    /// Seconds between sampled frames.
    #[arg(long, env = "FRAME_INTERVAL_SECONDS", default_value_t = DEFAULT_INTERVAL_SECONDS)]
    interval: f64,

    /// Mean luma difference (0-255) above which a frame counts as changed.
    #[arg(long, env = "MOTION_THRESHOLD", default_value_t = DEFAULT_MOTION_THRESHOLD)]
    motion_threshold: f64,

    /// Minimum detection confidence (0-1).
    #[arg(long, env = "DETECTOR_CONFIDENCE", default_value_t = DEFAULT_CONFIDENCE_THRESHOLD)]
    confidence: f32,

    /// Category to count, as NAME=LABEL[,LABEL...]. Repeatable; defaults
    /// to men and women.
    #[arg(long = "class", value_parser = CategorySet::parse_category)]
    classes: Vec<Category>,

    /// Cache-format version tag.
    #[arg(long, env = "CACHE_VERSION", default_value = DEFAULT_CACHE_VERSION)]
    cache_version: String,

    /// Downscale sampled frames wider than this many pixels.
    #[arg(long)]
    max_width: Option<u32>,
}

#[derive(Debug, Parser, Clone)]
struct DetectorArgs {
    /// Detector API key.
    #[arg(long, env = "ROBOFLOW_API_KEY", hide_env_values = true, default_value = "")]
    api_key: String,

    /// Detector model id.
    #[arg(long, env = "ROBOFLOW_MODEL_ID", default_value = DEFAULT_DETECTOR_MODEL)]
    model_id: String,

    /// Detector endpoint base URL.
    #[arg(long, env = "ROBOFLOW_API_URL", default_value = DEFAULT_DETECTOR_ENDPOINT)]
    api_url: String,
}

impl AnalysisArgs {
    fn to_options(&self) -> AnalysisOptions {
        let mut options = AnalysisOptions::new()
            .with_interval_seconds(self.interval)
            .with_motion_threshold(self.motion_threshold)
            .with_confidence_threshold(self.confidence)
            .with_cache_version(self.cache_version.clone());
        if !self.classes.is_empty() {
            options = options.with_categories(CategorySet::new(self.classes.clone()));
        }
        if let Some(width) = self.max_width {
            options = options.with_max_frame_width(width);
        }
        options
    }
}

fn apply_global_options(global: &GlobalOptions) {
    let default_filter = if global.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .init();

    if let Some(level) = global.log_level {
        crowdscan::set_ffmpeg_log_level(level);
    }
}

/// Initialise the detector. A failure is recorded in the slot and reported
/// by the analysis itself as its first event.
fn load_detector(args: &DetectorArgs, confidence: f32) -> Arc<DetectorSlot> {
    let slot = Arc::new(DetectorSlot::new());
    let initialized = slot.initialize(|| {
        let credentials = DetectorCredentials::new(&args.api_key, &args.api_url, &args.model_id)?;
        Ok(Arc::new(HttpDetector::new(credentials, confidence)) as Arc<dyn Detector>)
    });
    if let Err(error) = initialized {
        eprintln!("{} {}", "warning:".yellow().bold(), error.to_string().yellow());
    }
    slot
}

fn progress_bar() -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template("{spinner:.green} {bar:40.cyan/blue} {pos}% {msg}")?;
    bar.set_style(style.progress_chars("##-"));
    Ok(bar)
}

fn describe(event: &AnalysisEvent) -> &'static str {
    match event {
        AnalysisEvent::CheckingUrl { .. } => "checking source",
        AnalysisEvent::Downloading { .. } => "downloading",
        AnalysisEvent::Analyzing { .. } => "analyzing",
        AnalysisEvent::Cached { .. } => "cached",
        AnalysisEvent::Complete { .. } => "complete",
        AnalysisEvent::Error { .. } => "failed",
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    apply_global_options(&cli.global);

    match cli.command {
        Commands::Analyze {
            input,
            analysis,
            detector,
            cache_dir,
            progress,
        } => {
            let options = analysis.to_options();
            let detectors = load_detector(&detector, options.confidence_threshold());
            let analyzer = Analyzer::new(detectors, Arc::new(FileCache::new(cache_dir)))
                .with_options(options);

            let bar = if progress { Some(progress_bar()?) } else { None };
            let mut stdout = std::io::stdout().lock();

            let mut sink = |event: AnalysisEvent| -> Result<(), CrowdscanError> {
                if let Some(bar) = &bar {
                    if let Some(percent) = event.progress() {
                        bar.set_position(u64::from(percent));
                    }
                    bar.set_message(describe(&event));
                }
                writeln!(stdout, "{}", event.to_ndjson()?)?;
                stdout.flush()?;
                Ok(())
            };

            let result = analyzer.stream(&VideoSource::parse(&input), &mut sink);
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }

            let timeline = result?;
            match timeline.summary() {
                Some(summary) => eprintln!(
                    "{} {} record(s), {summary}",
                    "success:".green().bold(),
                    timeline.len(),
                ),
                None => eprintln!("{} no frames sampled", "success:".green().bold()),
            }
        }
        Commands::Probe { input, json } => {
            let video = VideoFile::open(&input)?;
            let metadata = video.metadata();
            if json {
                println!("{}", serde_json::to_string_pretty(metadata)?);
            } else {
                println!("{} {}", "file".cyan().bold(), input.display());
                println!("Format: {}", metadata.format);
                println!("Duration: {:.2}s", metadata.duration.as_secs_f64());
                println!("Codec: {}", metadata.codec);
                println!("Resolution: {}x{}", metadata.width, metadata.height);
                println!("Frame rate: {:.3} fps", metadata.frames_per_second);
                println!("Frames: {}", metadata.frame_count);
            }
        }
        Commands::CacheKey {
            input,
            cache_version,
        } => {
            let id = match VideoSource::parse(&input) {
                VideoSource::Local(path) => ContentId::for_file(path)?,
                VideoSource::Remote(url) => ContentId::Remote(YtDlpFetcher::new().probe(&url)?.id),
            };
            let key = id.cache_key(&cache_version);
            let payload = json!({
                "key": key.to_string(),
                "file": key.file_name(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "crowdscan", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("{} {error}", "error:".red().bold());
        std::process::exit(1);
    }
}

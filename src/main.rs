use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use cleanview::auth::{CredentialGate, EnvKeyProvider, KeyState};
use cleanview::config::Config;
use cleanview::session::{run_attempt, AttemptOptions, SessionController, SessionState};
use cleanview::veo::{
    setup_ctrlc_handler, AspectRatio, CancelToken, Resolution, VeoClient,
    DEFAULT_GENERATION_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_PROMPT, GEMINI_API_KEY_ENV,
};

/// Default name for the downloaded result.
const DEFAULT_OUTPUT_FILENAME: &str = "clean-video.mp4";

/// Parse and validate an aspect ratio (16:9 or 9:16)
fn parse_aspect_ratio(s: &str) -> Result<AspectRatio, String> {
    AspectRatio::from_str(s)
        .ok_or_else(|| format!("Unknown aspect ratio '{}'. Use 16:9 or 9:16", s))
}

/// Parse and validate a resolution (720p or 1080p)
fn parse_resolution(s: &str) -> Result<Resolution, String> {
    Resolution::from_str(s)
        .ok_or_else(|| format!("Unknown resolution '{}'. Use 720p or 1080p", s))
}

/// Parse and validate the poll interval (1-120 seconds)
fn parse_poll_interval(s: &str) -> Result<u64, String> {
    let secs: u64 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid number of seconds", s))?;
    if !(1..=120).contains(&secs) {
        return Err(format!(
            "Poll interval must be between 1 and 120 seconds, got {}",
            secs
        ));
    }
    Ok(secs)
}

/// Parse and validate the generation timeout (1-3600 seconds)
fn parse_timeout(s: &str) -> Result<u64, String> {
    let secs: u64 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid number of seconds", s))?;
    if !(1..=3600).contains(&secs) {
        return Err(format!(
            "Timeout must be between 1 and 3600 seconds, got {}",
            secs
        ));
    }
    Ok(secs)
}

/// cleanview: AI text and watermark removal for videos
#[derive(Parser)]
#[command(name = "cleanview")]
#[command(version, about = "Remove text, logos and watermarks from videos with generative AI")]
#[command(long_about = "Extracts a reference frame from a source video, asks a Veo video \
    model to regenerate the scene without text, subtitles or watermarks, and downloads \
    the cleaned result.")]
#[command(after_help = "EXAMPLES:
    # Clean a video, writing clean-video.mp4
    cleanview clean input.mp4

    # Custom output path and portrait aspect ratio
    cleanview clean input.mp4 -o cleaned.mp4 -a 9:16

    # 1080p output with an extra instruction
    cleanview clean input.mp4 -r 1080p -p \"Keep the clock in the corner.\"

    # Check or change the selected API key
    cleanview key --select
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clean a video: extract a reference frame, generate, download the result
    Clean {
        /// Source video file
        input: PathBuf,

        /// Output file (default: clean-video.mp4)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output aspect ratio (default: probed from the source)
        #[arg(short = 'a', long, value_parser = parse_aspect_ratio)]
        aspect_ratio: Option<AspectRatio>,

        /// Output resolution
        #[arg(short = 'r', long, value_parser = parse_resolution)]
        resolution: Option<Resolution>,

        /// Extra instruction appended to the built-in cleaning prompt
        #[arg(short = 'p', long)]
        prompt: Option<String>,

        /// Generation model override
        #[arg(short = 'm', long)]
        model: Option<String>,

        /// Seconds between status polls
        #[arg(long, value_parser = parse_poll_interval)]
        poll_interval: Option<u64>,

        /// Overall generation ceiling in seconds
        #[arg(long, value_parser = parse_timeout)]
        timeout: Option<u64>,

        /// Path to a config file (default: ~/.config/cleanview/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show the API key selection state, optionally opening the selector
    Key {
        /// Open the key selector even if a key is already selected
        #[arg(long)]
        select: bool,
    },
}

/// Load .env file and check for GEMINI_API_KEY
///
/// Loads environment variables from .env file in the project root.
/// Does not override existing environment variables.
fn load_env() {
    // dotenv::dotenv() returns Err if .env doesn't exist, which is fine
    let _ = dotenv::dotenv();

    if std::env::var(GEMINI_API_KEY_ENV).is_err() {
        eprintln!("Warning: GEMINI_API_KEY environment variable not set.");
        eprintln!("         You will be prompted for an API key before generation.\n");
    }
}

/// Load config honoring an explicit --config path (which must exist).
fn load_config(explicit: Option<PathBuf>) -> Result<Config, String> {
    match explicit {
        Some(path) => Config::load_from_explicit(path).map_err(|e| e.to_string()),
        None => match Config::load() {
            Ok(cfg) => Ok(cfg),
            Err(e) => {
                eprintln!("Warning: Failed to load config file: {}", e);
                eprintln!("Using default settings.\n");
                Ok(Config::default())
            }
        },
    }
}

/// Build a client from the environment plus resolved overrides.
fn build_client(
    model: Option<&str>,
    base_url: Option<&str>,
    poll_interval: Duration,
) -> Result<VeoClient, String> {
    let mut client = VeoClient::new().map_err(|_| {
        format!(
            "{} environment variable is not set.\n\n\
            Add your API key to a .env file:\n\
                echo '{}=your-api-key-here' >> .env\n\n\
            Or set it as an environment variable:\n\
                export {}=\"your-api-key-here\"\n\n\
            Get your API key at: https://aistudio.google.com/",
            GEMINI_API_KEY_ENV, GEMINI_API_KEY_ENV, GEMINI_API_KEY_ENV
        )
    })?;

    if let Some(model) = model {
        client.set_model(model.to_string());
    }
    if let Some(base_url) = base_url {
        client.set_base_url(base_url.to_string());
    }
    client.set_poll_interval(poll_interval);

    Ok(client)
}

#[allow(clippy::too_many_arguments)]
fn run_clean(
    input: PathBuf,
    output: Option<PathBuf>,
    aspect_ratio: Option<AspectRatio>,
    resolution: Option<Resolution>,
    prompt: Option<String>,
    model: Option<String>,
    poll_interval: Option<u64>,
    timeout: Option<u64>,
    config_path: Option<PathBuf>,
) -> Result<(), String> {
    let cfg = load_config(config_path)?;

    // Merge settings: CLI args > config file > built-in defaults
    let output = output
        .or_else(|| cfg.output.filename.clone().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_FILENAME));

    let aspect_ratio = aspect_ratio.or_else(|| {
        cfg.generation
            .aspect_ratio
            .as_deref()
            .and_then(AspectRatio::from_str)
    });

    let resolution = resolution
        .or_else(|| {
            cfg.generation
                .resolution
                .as_deref()
                .and_then(Resolution::from_str)
        })
        .unwrap_or(Resolution::P720);

    let poll_interval = poll_interval
        .or(cfg.api.poll_interval_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_POLL_INTERVAL);

    let timeout = timeout
        .or(cfg.api.timeout_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_GENERATION_TIMEOUT);

    let model = model.or(cfg.api.model.clone());

    let mut full_prompt = DEFAULT_PROMPT.to_string();
    for extra in [cfg.generation.prompt.as_deref(), prompt.as_deref()]
        .into_iter()
        .flatten()
    {
        let extra = extra.trim();
        if !extra.is_empty() {
            full_prompt.push(' ');
            full_prompt.push_str(extra);
        }
    }

    // Credential gate: resolve the key before the first attempt.
    let mut gate = CredentialGate::new(EnvKeyProvider::new());
    if gate.check_key() != KeyState::Present && gate.prompt_for_key() != KeyState::Present {
        return Err("Could not obtain an API key.".to_string());
    }

    let cancel = CancelToken::new();
    setup_ctrlc_handler(cancel.clone())
        .map_err(|e| format!("Failed to install Ctrl+C handler: {}", e))?;

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to create async runtime: {}", e))?;

    let mut controller = SessionController::new();
    let options = AttemptOptions {
        prompt: full_prompt,
        aspect_ratio,
        resolution,
        timeout,
    };

    loop {
        let client = build_client(model.as_deref(), cfg.api.base_url.as_deref(), poll_interval)?;

        println!("Cleaning {} ...", input.display());
        println!("{}", cleanview::session::PROCESSING_MESSAGE);

        rt.block_on(run_attempt(
            &mut controller,
            &client,
            &input,
            &options,
            &output,
            &cancel,
        ));

        match controller.state() {
            SessionState::Completed { output } => {
                println!();
                println!("Done. Saved cleaned video to {}", output.display());
                return Ok(());
            }
            SessionState::Error { message } => {
                return Err(message.clone());
            }
            SessionState::Idle if controller.auth_required() => {
                eprintln!();
                eprintln!("The service rejected the API key (missing permissions or billing).");
                eprintln!("Select a key tied to a project with billing enabled.");
                gate.force_reprompt();
                if gate.prompt_for_key() == KeyState::Present {
                    controller.auth_resolved();
                    continue;
                }
                return Err("Could not obtain a usable API key.".to_string());
            }
            other => {
                return Err(format!("Unexpected session state: {:?}", other));
            }
        }
    }
}

fn run_key(select: bool) -> Result<(), String> {
    let mut gate = CredentialGate::new(EnvKeyProvider::new());

    match gate.check_key() {
        KeyState::Present => println!("An API key is selected."),
        _ => println!("No API key selected."),
    }

    if select || gate.prompt_visible() {
        match gate.prompt_for_key() {
            KeyState::Present => println!("API key updated."),
            _ => return Err("Key selection did not complete.".to_string()),
        }
    }

    Ok(())
}

fn main() {
    // Load .env file before anything else
    load_env();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Clean {
            input,
            output,
            aspect_ratio,
            resolution,
            prompt,
            model,
            poll_interval,
            timeout,
            config,
        } => run_clean(
            input,
            output,
            aspect_ratio,
            resolution,
            prompt,
            model,
            poll_interval,
            timeout,
            config,
        ),
        Commands::Key { select } => run_key(select),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aspect_ratio_valid() {
        assert_eq!(parse_aspect_ratio("16:9"), Ok(AspectRatio::Landscape));
        assert_eq!(parse_aspect_ratio("9:16"), Ok(AspectRatio::Portrait));
    }

    #[test]
    fn test_parse_aspect_ratio_invalid() {
        assert!(parse_aspect_ratio("21:9").is_err());
        assert!(parse_aspect_ratio("").is_err());
    }

    #[test]
    fn test_parse_resolution_valid() {
        assert_eq!(parse_resolution("720p"), Ok(Resolution::P720));
        assert_eq!(parse_resolution("1080p"), Ok(Resolution::P1080));
    }

    #[test]
    fn test_parse_resolution_invalid() {
        assert!(parse_resolution("4k").is_err());
    }

    #[test]
    fn test_parse_poll_interval_bounds() {
        assert_eq!(parse_poll_interval("8"), Ok(8));
        assert_eq!(parse_poll_interval("1"), Ok(1));
        assert_eq!(parse_poll_interval("120"), Ok(120));
        assert!(parse_poll_interval("0").is_err());
        assert!(parse_poll_interval("121").is_err());
        assert!(parse_poll_interval("abc").is_err());
    }

    #[test]
    fn test_parse_timeout_bounds() {
        assert_eq!(parse_timeout("600"), Ok(600));
        assert!(parse_timeout("0").is_err());
        assert!(parse_timeout("3601").is_err());
    }

    #[test]
    fn test_default_output_filename() {
        assert_eq!(DEFAULT_OUTPUT_FILENAME, "clean-video.mp4");
    }

    #[test]
    fn test_env_var_accessible_after_dotenv() {
        // dotenv::dotenv() returns Err if .env doesn't exist, which is fine
        let _ = dotenv::dotenv();
        std::env::set_var("CLEANVIEW_MAIN_TEST_VAR", "1");
        assert_eq!(std::env::var("CLEANVIEW_MAIN_TEST_VAR").unwrap(), "1");
        std::env::remove_var("CLEANVIEW_MAIN_TEST_VAR");
    }

    #[test]
    fn test_cli_parses_clean_command() {
        let cli = Cli::try_parse_from([
            "cleanview",
            "clean",
            "input.mp4",
            "-o",
            "out.mp4",
            "-a",
            "9:16",
            "-r",
            "1080p",
            "--poll-interval",
            "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Clean {
                input,
                output,
                aspect_ratio,
                resolution,
                poll_interval,
                ..
            } => {
                assert_eq!(input, PathBuf::from("input.mp4"));
                assert_eq!(output, Some(PathBuf::from("out.mp4")));
                assert_eq!(aspect_ratio, Some(AspectRatio::Portrait));
                assert_eq!(resolution, Some(Resolution::P1080));
                assert_eq!(poll_interval, Some(4));
            }
            _ => panic!("expected clean command"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_aspect_ratio() {
        let result = Cli::try_parse_from(["cleanview", "clean", "input.mp4", "-a", "3:2"]);
        assert!(result.is_err());
    }
}

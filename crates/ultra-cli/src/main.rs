//! Ultra CLI
//!
//! Runs the four-stage synthesis pipeline from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Ask every configured model
//! ultra analyze --config ultra.yaml "Explain photosynthesis"
//!
//! # Pick models, pattern and lead synthesizer
//! ultra analyze -c ultra.yaml -m claude -m gpt --pattern critique --lead claude "..."
//!
//! # Run a JSON request ("-" reads stdin)
//! ultra analyze -c ultra.yaml --request request.json --output json
//!
//! # List patterns, validate configuration
//! ultra patterns
//! ultra check-config -c ultra.yaml --health
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;
use ultra_core::{PatternStrategy, RequestPayload};
use ultra_runtime::{AdapterFactoryRegistry, Orchestrator, RuntimeConfig};

#[derive(Parser)]
#[command(name = "ultra")]
#[command(author, version, about = "Multi-model synthesis: ask several LLMs, refine, synthesize")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run the initial, meta, hyper and ultra stages for a prompt
    Analyze(AnalyzeArgs),

    /// List the available analysis patterns
    Patterns,

    /// Validate a configuration file
    CheckConfig {
        /// Path to the configuration file (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Also probe every configured model
        #[arg(long)]
        health: bool,
    },
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Path to the configuration file (YAML or JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// JSON request file ("-" for stdin); replaces the prompt options
    #[arg(long, conflicts_with_all = ["prompt", "models", "pattern", "lead"])]
    request: Option<PathBuf>,

    /// The question to analyze
    prompt: Option<String>,

    /// Models to include (repeatable); defaults to every configured model
    #[arg(short, long = "model", value_name = "MODEL")]
    models: Vec<String>,

    /// Analysis pattern
    #[arg(short, long, default_value = "gut")]
    pattern: String,

    /// Preferred synthesizer
    #[arg(long, value_name = "MODEL")]
    lead: Option<String>,

    /// Overall deadline in seconds
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<f64>,

    /// Report stage progress on stderr
    #[arg(long)]
    progress: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "final")]
    output: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Only the final answer
    Final,
    /// The complete response as JSON
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match cli.command {
        Command::Analyze(args) => analyze(args).await,
        Command::Patterns => {
            patterns();
            Ok(())
        }
        Command::CheckConfig { config, health } => check_config(&config, health).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so `--output json` stays machine-readable.
fn init_logging(cli: &Cli) {
    let progress = matches!(&cli.command, Command::Analyze(args) if args.progress);
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let directives = if progress && cli.verbose == 0 {
        format!("{level},ultra_runtime::progress=info")
    } else {
        level.to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn analyze(args: AnalyzeArgs) -> Result<()> {
    let orchestrator = load(&args.config)?;

    let payload = match &args.request {
        Some(path) => {
            let json = read_request(path)?;
            let mut payload = RequestPayload::from_json(&json)
                .with_context(|| format!("Invalid request in {}", path.display()))?;
            if let Some(timeout) = args.timeout {
                payload.options.timeout_seconds = Some(timeout);
            }
            payload.options.show_progress |= args.progress;
            payload
        }
        None => {
            let Some(prompt) = args.prompt else {
                bail!("A prompt or --request is required");
            };
            let models = if args.models.is_empty() {
                orchestrator.registry().names()
            } else {
                args.models
            };
            let mut payload = RequestPayload::new(prompt, models, args.pattern);
            payload.lead_model = args.lead;
            payload.options.timeout_seconds = args.timeout;
            payload.options.show_progress = args.progress;
            payload
        }
    };

    info!(models = %payload.models.join(", "), pattern = %payload.analysis_type, "Analyzing");
    let response = orchestrator.analyze_payload(&payload).await?;

    match args.output {
        OutputFormat::Final => {
            println!("{}", response.ultra_response);
            if response.is_partial() {
                eprintln!(
                    "Partial result; dropped: {}",
                    response.dropped_models().join(", ")
                );
            }
        }
        OutputFormat::Json => println!("{}", response.to_json_pretty()?),
    }
    Ok(())
}

fn patterns() {
    for pattern in PatternStrategy::ALL {
        println!("{:<12} {}", pattern.name(), pattern.description());
    }
}

async fn check_config(path: &Path, health: bool) -> Result<()> {
    let orchestrator = load(path)?;
    let registry = orchestrator.registry();

    println!("Configuration OK: {}", path.display());
    for model in registry.list_available() {
        println!("  {:<20} {}", model.name, model.provider);
    }

    if health {
        let results = registry.health_check().await;
        let unhealthy: Vec<&String> = results
            .iter()
            .filter(|(_, healthy)| !**healthy)
            .map(|(name, _)| name)
            .collect();
        for (name, healthy) in &results {
            println!("  {:<20} {}", name, if *healthy { "healthy" } else { "UNHEALTHY" });
        }
        if !unhealthy.is_empty() {
            bail!("{} model(s) failed the health check", unhealthy.len());
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<Orchestrator> {
    let config = RuntimeConfig::from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let orchestrator = Orchestrator::from_config(config, &AdapterFactoryRegistry::with_defaults())
        .context("Failed to build models from configuration")?;
    Ok(orchestrator)
}

fn read_request(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut json = String::new();
        std::io::stdin()
            .read_to_string(&mut json)
            .context("Failed to read request from stdin")?;
        return Ok(json);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_analyze() {
        let cli = Cli::try_parse_from([
            "ultra", "analyze", "-c", "ultra.yaml", "-m", "a", "-m", "b", "--pattern", "critique",
            "--timeout", "30", "Explain photosynthesis",
        ])
        .unwrap();
        let Command::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.models, vec!["a", "b"]);
        assert_eq!(args.pattern, "critique");
        assert_eq!(args.timeout, Some(30.0));
        assert_eq!(args.prompt.as_deref(), Some("Explain photosynthesis"));
    }

    #[test]
    fn test_request_conflicts_with_prompt() {
        let result = Cli::try_parse_from([
            "ultra", "analyze", "-c", "ultra.yaml", "--request", "r.json", "question",
        ]);
        assert!(result.is_err());
    }
}

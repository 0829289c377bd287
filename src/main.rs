//! # Agent Stack CLI (`agent-stack`)
//!
//! ## Usage
//!
//! ```bash
//! agent-stack --config ./config/stack.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `agent-stack synth` | Render the provisioning template |
//! | `agent-stack plan` | Print resources grouped into creation phases |
//! | `agent-stack mapping` | Print the vector index body |
//! | `agent-stack handle <event.json>` | Run one custom-resource event through the gate |
//! | `agent-stack bootstrap` | Create the index directly, with retries |
//! | `agent-stack serve` | Start the HTTP gate provider |
//! | `agent-stack llm <provider> <model>` | Resolve an LLM provider descriptor |
//! | `agent-stack extract <part> <file>` | Extract a tagged part of an LLM completion |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use agent_stack::{config, handler, llm, logging, server, stack};

/// Agent Stack: a declarative Bedrock agent stack with an idempotent
/// vector-index bootstrap gate.
#[derive(Parser)]
#[command(name = "agent-stack", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/stack.toml")]
    config: PathBuf,

    /// Log at info level when `RUST_LOG` is unset.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the stack as a provisioning template (JSON).
    Synth {
        /// Write to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print resources grouped into creation phases.
    ///
    /// Every resource appears one phase after its deepest dependency.
    Plan,

    /// Print the index settings and mappings the gate will create.
    Mapping,

    /// Handle one custom-resource event.
    ///
    /// Reads the event JSON from a file, or from stdin with `-`, runs it
    /// through the gate and prints the engine response. The exit code is 0
    /// even when the response status is FAILED.
    Handle {
        /// Event file, or `-` for stdin.
        #[arg(default_value = "-")]
        event: PathBuf,
    },

    /// Create the stack's vector index directly.
    ///
    /// Retryable failures (throttling, policy propagation, 5xx) are retried
    /// with exponential backoff until `[provider].timeout_secs`; terminal
    /// failures stop immediately.
    Bootstrap {
        /// Collection endpoint. Defaults to `[collection].endpoint`.
        #[arg(long)]
        endpoint: Option<String>,

        /// Run against an in-memory collection and print the index body.
        #[arg(long)]
        dry_run: bool,
    },

    /// Start the HTTP gate provider on `[provider].bind`.
    Serve,

    /// Resolve and print an LLM provider descriptor.
    Llm {
        /// `openai`, `azure-openai`, `vertexai`, `aws-bedrock` or `anthropic`.
        provider: String,
        model: String,
        #[arg(long)]
        temperature: Option<f64>,
    },

    /// Extract part of an LLM completion.
    Extract {
        /// `code`, `answer`, `data`, `markdown` or `thinking`.
        part: String,
        /// Completion file, or `-` for stdin.
        #[arg(default_value = "-")]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::setup_tracing(cli.verbose);

    // Commands that don't require config
    match &cli.command {
        Commands::Llm {
            provider,
            model,
            temperature,
        } => {
            llm::run_llm(provider, model, *temperature, cli.verbose)?;
            return Ok(());
        }
        Commands::Extract { part, input } => {
            llm::run_extract(part, input)?;
            return Ok(());
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Synth { out } => {
            stack::run_synth(&cfg, out.as_deref())?;
        }
        Commands::Plan => {
            stack::run_plan(&cfg)?;
        }
        Commands::Mapping => {
            stack::run_mapping(&cfg)?;
        }
        Commands::Handle { event } => {
            handler::run_handle(&cfg, &event).await?;
        }
        Commands::Bootstrap { endpoint, dry_run } => {
            handler::run_bootstrap(&cfg, endpoint, dry_run).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Llm { .. } | Commands::Extract { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

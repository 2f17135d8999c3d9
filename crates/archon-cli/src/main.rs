mod config;
mod lint_cmd;
mod route_cmd;
mod run_cmd;
mod schema_cmd;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use archon_core::duration::parse_duration;

use config::{ArchonConfig, ConfigOverrides};
use lint_cmd::LintFormat;
use schema_cmd::DocType;

#[derive(Parser)]
#[command(name = "archon", about = "DAG-aware multi-agent plan orchestrator")]
struct Cli {
    /// Postbox root directory (overrides ARCHON_POSTBOX_ROOT)
    #[arg(long, global = true)]
    postbox_root: Option<PathBuf>,

    /// Archive root directory (overrides ARCHON_ARCHIVE_ROOT)
    #[arg(long, global = true)]
    archive_root: Option<PathBuf>,

    /// Log directory for traces and task logs (overrides ARCHON_LOG_DIR)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan
    Run {
        /// Path to the plan YAML file
        plan_path: PathBuf,
        /// Validate and print the DAG without executing
        #[arg(long)]
        dry_run: bool,
        /// Maximum number of concurrently running tasks
        #[arg(long, default_value_t = 10)]
        max_concurrent: usize,
        /// Overall plan timeout (e.g. 30m, 2h)
        #[arg(long)]
        plan_timeout: Option<String>,
        /// Print the execution trace to stdout on termination
        #[arg(long)]
        log_trace: bool,
        /// Alert policy YAML file
        #[arg(long)]
        alert_policy: Option<PathBuf>,
        /// Treat partial_success results as success
        #[arg(long)]
        partial_success_ok: bool,
    },
    /// Validate a plan without executing it
    Lint {
        /// Path to the plan YAML file
        plan_path: PathBuf,
        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: LintFormat,
    },
    /// Schema-validate a plan or message document
    SchemaCheck {
        /// Path to the document
        file: PathBuf,
        /// Document type (auto infers from extension/content)
        #[arg(long = "type", value_enum, default_value = "auto")]
        doc_type: DocType,
    },
    /// Run the message router
    Route {
        /// Keep sweeping on an interval instead of once
        #[arg(long)]
        watch: bool,
        /// Sweep interval in watch mode (e.g. 5s)
        #[arg(long, default_value = "5s")]
        interval: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<u8> {
    let mut overrides = ConfigOverrides {
        postbox_root: cli.postbox_root,
        archive_root: cli.archive_root,
        log_dir: cli.log_dir,
        plan_timeout: None,
    };

    match cli.command {
        Commands::Run {
            plan_path,
            dry_run,
            max_concurrent,
            plan_timeout,
            log_trace,
            alert_policy,
            partial_success_ok,
        } => {
            if let Some(timeout) = &plan_timeout {
                // Fail fast on a bad flag before touching anything.
                parse_duration(timeout)
                    .map_err(|e| anyhow::anyhow!("--plan-timeout: {e}"))?;
            }
            overrides.plan_timeout = plan_timeout;
            let config = ArchonConfig::resolve(&overrides)?;
            let options = run_cmd::RunOptions {
                dry_run,
                max_concurrent,
                log_trace,
                alert_policy,
                partial_success_ok,
            };
            run_cmd::run_plan(&config, &plan_path, &options).await
        }
        Commands::Lint { plan_path, format } => lint_cmd::lint_plan(&plan_path, format),
        Commands::SchemaCheck { file, doc_type } => schema_cmd::schema_check(&file, doc_type),
        Commands::Route { watch, interval } => {
            let config = ArchonConfig::resolve(&overrides)?;
            let interval = parse_duration(&interval)
                .map_err(|e| anyhow::anyhow!("--interval: {e}"))?;
            if watch {
                route_cmd::watch(&config, interval).await
            } else {
                route_cmd::sweep_once(&config)
            }
        }
    }
}

//! tablekeeper: keeps the managed DynamoDB tables provisioned
//!
//! Runs the provisioning worker in the foreground, or performs one-shot
//! status, setup and deletion operations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tablekeeper_worker::aws::{AwsContext, DynamoClient, FromAwsContext, TableOperations};
use tablekeeper_worker::config::{Environment, WorkerConfig};
use tablekeeper_worker::status::StatusManager;
use tablekeeper_worker::{HealthStatus, Orchestrator, SetupService};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tablekeeper")]
#[command(about = "Self-healing DynamoDB table provisioning worker")]
#[command(version)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "TABLEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Deployment environment (overrides the config file)
    #[arg(short, long)]
    environment: Option<Environment>,

    /// AWS region (overrides the config file)
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// AWS profile to use (overrides AWS_PROFILE env var)
    #[arg(long)]
    aws_profile: Option<String>,

    /// Describe and log only; never create or delete tables
    #[arg(long)]
    dry_run: bool,

    /// Skip the ACTIVE poll and index check after creating tables
    #[arg(long)]
    skip_validation: bool,

    /// Run setup even if a previous run completed
    #[arg(long)]
    force_recreate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker until interrupted
    Run,
    /// Run a single setup cycle and exit
    Once,
    /// Print the persisted status
    Status,
    /// Print the derived health summary
    Health,
    /// Delete every managed table
    Delete,
    /// Reset status and run setup again
    ForceSetup,
}

impl Args {
    fn worker_config(&self) -> Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::load(path)?,
            None => WorkerConfig::default(),
        };
        if let Some(environment) = self.environment {
            config.environment = environment;
        }
        if let Some(region) = &self.region {
            config.tables.region = region.clone();
        }
        if let Some(profile) = &self.aws_profile {
            config.tables.aws_profile = Some(profile.clone());
        }
        config.flags.dry_run |= self.dry_run;
        config.flags.skip_validation |= self.skip_validation;
        config.flags.force_recreate |= self.force_recreate;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&e);
        std::process::exit(1);
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }

    if std::env::var("RUST_BACKTRACE").is_err() {
        let _ = writeln!(
            stderr,
            "\n\x1b[2mSet RUST_BACKTRACE=1 for a detailed backtrace\x1b[0m"
        );
    } else {
        let backtrace = e.backtrace();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            let _ = writeln!(stderr, "\n\x1b[2mBacktrace:\x1b[0m\n{backtrace}");
        }
    }
}

fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    for target in ["aws_config", "aws_sdk_dynamodb", "aws_smithy_runtime"] {
        if let Ok(directive) = format!("{target}=warn").parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut config = args.worker_config()?;

    match args.command {
        Command::Status => {
            let status = StatusManager::new(&config.status.path, config.environment);
            match status.load_status().await? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => println!("No status recorded yet at {}", status.path().display()),
            }
            return Ok(());
        }
        Command::Health => {
            let status = StatusManager::new(&config.status.path, config.environment);
            let result = status.load_status().await?;
            let health = HealthStatus::from_result(result.as_ref(), config.max_retries());
            println!("{}", serde_json::to_string_pretty(&health)?);
            return Ok(());
        }
        Command::Run => {}
        Command::Once | Command::Delete | Command::ForceSetup => config.flags.run_once = true,
    }

    info!(
        environment = %config.environment,
        region = %config.region(),
        dry_run = config.flags.dry_run,
        "Loading AWS configuration"
    );
    let aws = AwsContext::with_profile(config.region(), config.aws_profile()).await;
    let tables: Arc<dyn TableOperations> = Arc::new(DynamoClient::from_context(&aws));

    let orchestrator = Orchestrator::new(config, tables)?;
    let service = SetupService::new(orchestrator.clone());

    match args.command {
        Command::Delete => service.schedule_delete().await?,
        Command::ForceSetup => orchestrator.status_manager().reset_status().await?,
        _ => {}
    }

    let mode = orchestrator.start().await?;
    info!(mode = %mode, "Worker running, press Ctrl-C to stop");

    tokio::select! {
        _ = orchestrator.wait_stopped() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupt received, stopping");
            orchestrator.stop().await;
        }
    }

    if matches!(args.command, Command::Run) {
        return Ok(());
    }

    let Some(result) = service.get_status().await? else {
        anyhow::bail!("worker stopped without recording a status");
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        anyhow::bail!(
            "run finished with status {}: {}",
            result.status,
            result.error_message.as_deref().unwrap_or(&result.message)
        );
    }
    Ok(())
}

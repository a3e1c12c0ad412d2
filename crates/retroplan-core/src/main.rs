//! `retroplan` command line: validate plan documents and dry-run them
//! against echoing capabilities

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use retroplan_core::demo::{echo_registry, example_document};
use retroplan_core::telemetry::{init_tracing, LogFormat};
use retroplan_core::{Coordinator, PlanDocument, StaticProposer};
use retroplan_model::{PolicyConfig, RunStatus};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "retroplan", version, about = "Plan, execute and retrospectively validate tasks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a plan document and its policy without running anything
    Validate {
        /// Plan document (yaml, yml or json)
        document: PathBuf,
        /// Policy file (yaml, toml or json)
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Dry-run a plan document with every capability echoing its inputs
    Run {
        /// Plan document (yaml, yml or json)
        document: PathBuf,
        /// Policy file (yaml, toml or json)
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Log as JSON lines on stderr
        #[arg(long)]
        json_logs: bool,
    },
    /// Print an example plan document
    SchemaExample {
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Yaml)]
        format: Format,
    },
}

/// Serialization format of the printed document
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

fn load_policy(path: Option<&PathBuf>) -> anyhow::Result<PolicyConfig> {
    match path {
        Some(path) => PolicyConfig::from_path(path)
            .with_context(|| format!("loading policy {}", path.display())),
        None => Ok(PolicyConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { document, policy } => {
            init_tracing(LogFormat::Pretty);
            load_policy(policy.as_ref())?;
            let doc = PlanDocument::load(&document)
                .with_context(|| format!("loading document {}", document.display()))?;

            let checks = doc.check();
            for check in &checks {
                match &check.error {
                    None => println!("ok      {} ({} steps)", check.candidate, check.steps),
                    Some(error) => println!("invalid {}: {error}", check.candidate),
                }
            }
            if !checks.iter().any(|c| c.is_valid()) {
                anyhow::bail!("no valid candidate in {}", document.display());
            }
        }
        Command::Run {
            document,
            policy,
            json_logs,
        } => {
            init_tracing(if json_logs {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            });
            let policy = load_policy(policy.as_ref())?;
            let doc = PlanDocument::load(&document)
                .with_context(|| format!("loading document {}", document.display()))?;

            let mut coordinator = Coordinator::builder(
                echo_registry(&doc),
                StaticProposer::new(doc.candidates.clone()),
            )
            .policy(policy)
            .build()?;
            let report = coordinator.run(doc.brief).await?;
            coordinator
                .audit()
                .verify_integrity()
                .context("audit chain verification")?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status != RunStatus::Done {
                std::process::exit(2);
            }
        }
        Command::SchemaExample { format } => {
            let doc = example_document();
            match format {
                Format::Yaml => print!("{}", serde_yaml::to_string(&doc)?),
                Format::Json => println!("{}", serde_json::to_string_pretty(&doc)?),
            }
        }
    }
    Ok(())
}

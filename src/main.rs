use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use selfpatch::config::{self, Config};
use selfpatch::diff;
use selfpatch::draft::OpenRouterClient;
use selfpatch::git_ops::Git;
use selfpatch::pipeline::{Pipeline, PipelineError};
use selfpatch::store::Proposal;
use selfpatch::util::truncate;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "selfpatch=info";

#[derive(Parser, Debug)]
#[command(
    name = "selfpatch",
    about = "Propose, sandbox-test and transactionally apply drafted patches",
    version
)]
struct Cli {
    /// Any directory inside the target repository
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Config file (overrides $SELFPATCH_CONFIG and the default location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record a new proposal
    New(NewArgs),
    /// List proposals
    List,
    /// Show one proposal with its diff
    Show { id: u64 },
    /// Draft, validate and preflight a diff for a proposal
    Draft { id: u64 },
    /// Apply a drafted proposal on a fresh branch
    Apply { id: u64 },
    /// Mark a proposal rejected
    Reject { id: u64 },
    /// Rebuild the source index
    Reindex,
    /// Recent draft and apply runs
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Store the drafting API key in the system keychain (reads stdin if omitted)
    SetApiKey { key: Option<String> },
}

#[derive(Args, Debug)]
struct NewArgs {
    title: String,
    /// Free-text description of the change
    #[arg(long, default_value = "")]
    notes: String,
    /// Read notes from a file instead
    #[arg(long, conflicts_with = "notes")]
    notes_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Commands::SetApiKey { key } = &cli.command {
        let key = match key {
            Some(key) => key.clone(),
            None => read_line_from_stdin()?,
        };
        config::store_api_key(&key)?;
        println!("API key stored in the system keychain.");
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;
    config
        .validate()
        .with_context(|| format!("invalid configuration ({})", Config::config_location()))?;
    let repo_root = resolve_repo_root(&config, &cli.repo)?;
    tracing::debug!(repo = %repo_root.display(), "repository resolved");

    let needs_backend = matches!(cli.command, Commands::Draft { .. });
    let llm = config.llm.clone();
    let mut pipeline = Pipeline::open(config, repo_root)?;
    if needs_backend {
        pipeline = pipeline.with_backend(Arc::new(OpenRouterClient::from_config(&llm)?));
    }

    let outcome = run(&pipeline, cli.command).await;
    if let Err(err) = &outcome {
        if let Some(log) = err.log() {
            eprintln!("{}", log);
        }
    }
    outcome.map_err(anyhow::Error::from)
}

async fn run(pipeline: &Pipeline, command: Commands) -> Result<(), PipelineError> {
    match command {
        Commands::New(args) => {
            let notes = match &args.notes_file {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => args.notes,
            };
            let proposal = pipeline.new_proposal(&args.title, &notes)?;
            println!("Created proposal #{}: {}", proposal.id, proposal.title);
        }
        Commands::List => {
            let proposals = pipeline.list()?;
            if proposals.is_empty() {
                println!("No proposals yet. Create one with `selfpatch new <title>`.");
            }
            for proposal in &proposals {
                println!("{}", list_line(proposal));
            }
        }
        Commands::Show { id } => {
            let proposal = pipeline.show(id)?;
            println!("#{} [{}] {}", proposal.id, proposal.status, proposal.title);
            println!(
                "created {}  updated {}",
                proposal.created_at.format("%Y-%m-%d %H:%M"),
                proposal.updated_at.format("%Y-%m-%d %H:%M")
            );
            if !proposal.notes.trim().is_empty() {
                println!("\n{}", proposal.notes.trim_end());
            }
            if proposal.diff.is_empty() {
                println!("\n(no diff drafted yet)");
            } else {
                print!("\n{}", proposal.diff);
            }
        }
        Commands::Draft { id } => {
            let report = pipeline.draft(id).await?;
            for warning in &report.warnings {
                eprintln!("warning: {}", warning);
            }
            print!("{}", report.log.render());
            let (added, removed) = diff::stats(&report.diff);
            println!(
                "Draft stored for proposal #{} (+{} -{}, {} attempt(s)). Review with `selfpatch show {}`.",
                id, added, removed, report.attempts, id
            );
        }
        Commands::Apply { id } => {
            let result = pipeline.apply(id)?;
            print!("{}", result.log.render());
            match &result.commit {
                Some(commit) => println!(
                    "Applied proposal #{} on branch {} (commit {}).",
                    id,
                    result.branch,
                    truncate(commit, 12)
                ),
                None => println!(
                    "Proposal #{} changed nothing; branch {} has no new commit.",
                    id, result.branch
                ),
            }
        }
        Commands::Reject { id } => {
            let proposal = pipeline.reject(id)?;
            println!("Proposal #{} is now {}.", proposal.id, proposal.status);
        }
        Commands::Reindex => {
            let stats = pipeline.reindex()?;
            println!(
                "Indexed {} file(s), removed {}, {} with parse errors, {} unreadable.",
                stats.indexed, stats.removed, stats.with_errors, stats.skipped
            );
        }
        Commands::History { limit } => {
            for run in pipeline.history(limit)? {
                let verdict = if run.passed { "pass" } else { "FAIL" };
                let mut line = format!(
                    "{}  #{:<4} {:<5} {}",
                    run.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    run.proposal_id,
                    format!("{:?}", run.kind).to_lowercase(),
                    verdict
                );
                if let Some(step) = &run.failed_step {
                    line.push_str(&format!("  at {}", step));
                }
                if let Some(branch) = &run.branch {
                    line.push_str(&format!("  {}", branch));
                }
                println!("{}", line);
            }
        }
        Commands::SetApiKey { .. } => {}
    }
    Ok(())
}

fn list_line(proposal: &Proposal) -> String {
    let size = if proposal.diff.is_empty() {
        "no diff".to_string()
    } else {
        let (added, removed) = diff::stats(&proposal.diff);
        format!("+{} -{}", added, removed)
    };
    format!(
        "#{:<4} {:<9} {:<12} {}",
        proposal.id,
        proposal.status.to_string(),
        size,
        truncate(&proposal.title, 70)
    )
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    if let Err(err) = result {
        eprintln!("tracing init failed: {}", err);
    }
}

fn resolve_repo_root(config: &Config, start: &Path) -> Result<PathBuf> {
    if let Some(root) = config::repo_root_override() {
        return root
            .canonicalize()
            .with_context(|| format!("SELFPATCH_REPO_ROOT {} does not exist", root.display()));
    }
    let git = Git::new(config.tools.git.clone(), config.tools.git_timeout());
    git.show_toplevel(start)
}

fn read_line_from_stdin() -> Result<String> {
    eprint!("API key: ");
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use skillet::cli;
use skillet::config::Config;
use skillet::errors::FrameworkError;
use skillet::{daemon, runtime};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(
    name = "skillet",
    version,
    about = "Local-first skill runtime for AI agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the framework version
    Version,
    /// Initialize the workspace and a default identity
    Init,
    /// Show workspace, identity and skill status
    Info,
    /// Search across every loaded skill
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Manage agent identities
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Inspect and maintain skills
    Skills {
        #[command(subcommand)]
        action: SkillsAction,
    },
    /// Run the daemon in the foreground
    Daemon {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Anything else dispatches to a skill's command root
    #[command(external_subcommand)]
    Skill(Vec<String>),
}

#[derive(Subcommand, Debug)]
enum IdentityAction {
    /// Register a new identity
    Register {
        code: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },
    /// Switch the active identity
    Use { code: String },
    /// Print the active identity code
    Whoami,
    /// List registered identities
    List,
    /// Remove an identity and its store
    Remove { code: String },
}

#[derive(Subcommand, Debug)]
enum SkillsAction {
    /// List skills in dependency order
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print one skill's manifest
    Describe { name: String },
    /// Re-discover skills and re-run boot
    Reload,
    /// Dump all manifests as JSON
    Export,
    /// Validate manifests and dependencies without touching the store
    Check,
    /// Diagnose store, migrations and checksum drift
    Doctor,
    /// Print a skill's config schema
    Config { name: String },
    /// Apply pending migrations
    Migrate {
        #[arg(long)]
        down: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error[{}]: {e}", e.kind());
            ExitCode::from(e.exit_code().clamp(0, 255) as u8)
        }
    }
}

async fn run(cli: Cli) -> skillet::errors::Result<()> {
    let config = Config::current()?;

    match cli.command {
        Command::Version => {
            println!("skillet {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Init => cli::init(&config),
        Command::Info => cli::info(&config),
        Command::Search { query, limit, json } => {
            let ctx = runtime::boot(config.clone())?;
            let out = cli::search_cmd(&ctx, &query, limit, json);
            runtime::teardown();
            out
        }
        Command::Identity { action } => match action {
            IdentityAction::Register {
                code,
                name,
                role,
                project,
            } => cli::identity_register(
                &config,
                &code,
                name.as_deref(),
                role.as_deref(),
                project.as_deref(),
            ),
            IdentityAction::Use { code } => cli::identity_use(&config, &code),
            IdentityAction::Whoami => cli::identity_whoami(&config),
            IdentityAction::List => cli::identity_list(&config),
            IdentityAction::Remove { code } => cli::identity_remove(&config, &code),
        },
        Command::Skills { action } => match action {
            SkillsAction::List { json } => cli::skills_list(&config, json),
            SkillsAction::Describe { name } => cli::skills_describe(&config, &name),
            SkillsAction::Reload => cli::skills_reload(&config),
            SkillsAction::Export => cli::skills_export(&config),
            SkillsAction::Check => cli::skills_check(&config),
            SkillsAction::Doctor => cli::skills_doctor(&config),
            SkillsAction::Config { name } => cli::skills_config(&config, &name),
            SkillsAction::Migrate { down } => cli::skills_migrate(&config, down),
        },
        Command::Daemon { host, port } => {
            let ctx = runtime::boot(config.clone())?;
            let mut opts = daemon::DaemonOptions::from_config(&config)?;
            if let Some(host) = host {
                let current_port = opts.addr.port();
                opts.addr = format!("{host}:{}", port.unwrap_or(current_port))
                    .parse()
                    .map_err(|e| FrameworkError::InvalidArgument(format!("bad host: {e}")))?;
            } else if let Some(port) = port {
                opts.addr.set_port(port);
            }
            let result = daemon::run(ctx, opts)
                .await
                .map_err(|e| FrameworkError::Internal(e.to_string()));
            runtime::teardown();
            result
        }
        Command::Skill(argv) => {
            let Some((name, rest)) = argv.split_first() else {
                return Err(FrameworkError::InvalidArgument("missing subcommand".into()));
            };
            debug!(skill = %name, "dispatching to skill command root");
            let ctx = runtime::boot(config.clone())?;
            let out = cli::dispatch_skill(&ctx, name, rest);
            runtime::teardown();
            out
        }
    }
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strata::binder::ProjectBinder;
use strata::models::{NewSnapshot, Priority};
use strata::{
    archive, env, Config, ContextError, ErrorKind, InstanceRegistry, PriorityLoader,
    SessionFacade,
};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Priority-tiered context store for long-running agent sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind the working directory to a project and start (or reuse) an instance
    Init {
        /// Prompt recorded before the command runs
        prompt: String,

        /// Use this project if it exists
        #[arg(long)]
        project_id: Option<String>,
    },
    /// Record a finished command's prompt and output
    Finalize {
        project_id: String,
        instance_id: String,
        prompt: String,
        /// File holding the command's output
        output_file: Option<PathBuf>,
    },
    /// Show the current shell session
    Session,
    /// End the current shell session
    End,
    /// Append a snapshot
    Store {
        project_id: String,
        /// JSON payload
        json: String,
        #[arg(long, default_value = "HIGH")]
        priority: String,
        #[arg(long, default_value = "code")]
        content_type: String,
        #[arg(long)]
        phase: Option<i64>,
    },
    /// Print every tier of a project's context as JSON
    Context {
        project_id: String,
        #[arg(long)]
        phase: Option<i64>,
    },
    /// Register an instance and print its critical context as JSON
    Load {
        instance_id: String,
        project_id: String,
        #[arg(long)]
        phase: Option<i64>,
    },
    /// List a project's instances
    Instances { project_id: String },
    /// List projects
    Projects,
    /// Reset an instance's token counter
    ClearTokens { instance_id: String },
    /// Complete instances whose heartbeat is stale
    Reap {
        /// Staleness threshold; defaults to the configured value
        #[arg(long)]
        stale_secs: Option<u64>,
    },
    /// Extract transcripts and store them as decision snapshots
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Target project; resolved from the working directory when absent
        #[arg(long)]
        project_id: Option<String>,
        #[arg(long, default_value = "MEDIUM")]
        priority: String,
        #[arg(long)]
        phase: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "strata=warn,strata_core=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load();

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<ContextError>().map(ContextError::kind) {
            Some(ErrorKind::NotFound) => {
                eprintln!("Warning: {}", err);
                ExitCode::SUCCESS
            }
            _ => {
                eprintln!("Error: {}", err);
                ExitCode::FAILURE
            }
        },
    }
}

fn new_or_existing(created: bool) -> &'static str {
    if created {
        "new"
    } else {
        "existing"
    }
}

fn loader_for(config: &Config) -> anyhow::Result<PriorityLoader> {
    let db = config.open_database()?;
    let registry = InstanceRegistry::new(db.clone());
    Ok(PriorityLoader::from_config(db, registry, config))
}

async fn run(command: Commands, config: &Config) -> anyhow::Result<()> {
    match command {
        Commands::Init { prompt, project_id } => {
            let facade = SessionFacade::from_config(config)?;
            let start = facade.initialize(&prompt, project_id.as_deref()).await?;
            if let Some(rejected) = &start.rejected_project_id {
                eprintln!(
                    "Warning: project '{}' not found, using auto-detected project",
                    rejected
                );
            }
            println!(
                "Project: {} ({})",
                start.project_id,
                new_or_existing(start.project_created)
            );
            println!(
                "Instance: {} ({})",
                start.instance_id,
                new_or_existing(start.instance_created)
            );
            facade.shutdown().await;
        }
        Commands::Finalize {
            project_id,
            instance_id,
            prompt,
            output_file,
        } => {
            let facade = SessionFacade::from_config(config)?;
            let snapshot_id = facade
                .finalize(&project_id, &instance_id, &prompt, output_file.as_deref())
                .await?;
            println!("Context stored: snapshot_id={}", snapshot_id);
        }
        Commands::Session => {
            let facade = SessionFacade::from_config(config)?;
            match facade.current_session() {
                Some(session) => {
                    println!("Project: {}", session.project_id);
                    println!("Instance: {}", session.instance_id);
                    println!("Started: {}", session.started_at);
                    println!("Host: {}", session.hostname);
                    println!("PID: {}", session.pid);
                    println!("CWD: {}", session.cwd);
                }
                None => println!("No active session"),
            }
        }
        Commands::End => {
            let facade = SessionFacade::from_config(config)?;
            facade.end_session().await?;
            println!("Session ended");
        }
        Commands::Store {
            project_id,
            json,
            priority,
            content_type,
            phase,
        } => {
            let priority = Priority::parse(&priority)?;
            let snapshot = NewSnapshot::from_json_str(project_id, &json)?
                .priority(priority)
                .content_type(content_type)
                .phase(phase);
            let loader = loader_for(config)?;
            let snapshot_id = loader.store_context(snapshot).await?;
            println!("Context stored: snapshot_id={}", snapshot_id);
        }
        Commands::Context { project_id, phase } => {
            let loader = loader_for(config)?;
            let full = loader.get_full_context(&project_id, phase).await?;
            println!("{}", serde_json::to_string_pretty(&full)?);
        }
        Commands::Load {
            instance_id,
            project_id,
            phase,
        } => {
            let loader = loader_for(config)?.with_background_tiers(false);
            let loaded = loader
                .load_for_instance(&instance_id, &project_id, phase)
                .await?;
            println!("{}", serde_json::to_string_pretty(&loaded)?);
        }
        Commands::Instances { project_id } => {
            let registry = InstanceRegistry::new(config.open_database()?);
            for instance in registry.list_project_instances(&project_id)? {
                println!(
                    "{}\t{}\t{}\ttokens={}\t{}",
                    instance.instance_id,
                    instance.status.as_str(),
                    instance.hostname,
                    instance.current_token_usage,
                    instance.last_heartbeat.to_rfc3339()
                );
            }
        }
        Commands::Projects => {
            let db = config.open_database()?;
            for project in db.list_projects()? {
                println!(
                    "{}\t{}\t{}",
                    project.project_id,
                    project.name,
                    project.created_at.to_rfc3339()
                );
            }
        }
        Commands::ClearTokens { instance_id } => {
            let registry = InstanceRegistry::new(config.open_database()?);
            if !registry.clear_tokens(&instance_id)? {
                return Err(ContextError::not_found(format!("instance {}", instance_id)).into());
            }
            println!("Token usage cleared");
        }
        Commands::Reap { stale_secs } => {
            let registry = InstanceRegistry::new(config.open_database()?);
            let threshold = stale_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.heartbeat_stale());
            let reaped = registry.reap_stale(threshold)?;
            println!("Reaped {} stale instance(s)", reaped);
        }
        Commands::Ingest {
            files,
            project_id,
            priority,
            phase,
        } => {
            let priority = Priority::parse(&priority)?;
            let db = config.open_database()?;
            let project_id = match project_id {
                Some(id) if db.project_exists(&id)? => id,
                explicit => {
                    let cwd = env::Environment::detect()?.cwd;
                    let binder = ProjectBinder::new(db.clone(), config.mapping_file());
                    let resolution = binder.resolve(&cwd, explicit.as_deref())?;
                    if let Some(rejected) = resolution.rejected_explicit {
                        eprintln!(
                            "Warning: project '{}' not found, using auto-detected project",
                            rejected
                        );
                    }
                    resolution.project_id
                }
            };

            let registry = InstanceRegistry::new(db.clone());
            let loader = PriorityLoader::from_config(db, registry, config);
            for outcome in archive::ingest(&loader, &files, &project_id, priority, phase).await {
                match (outcome.snapshot_id, outcome.error) {
                    (Some(id), _) => println!(
                        "{}: {} snapshot_id={}",
                        outcome.source.display(),
                        outcome.status,
                        id
                    ),
                    (None, error) => println!(
                        "{}: {} {}",
                        outcome.source.display(),
                        outcome.status,
                        error.unwrap_or_default()
                    ),
                }
            }
        }
    }

    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use cadence::config::Config;
use cadence::core::GraphStatus;
use cadence::orchestration::{CommandExecutor, EventBus, TracingSink};
use cadence::plan::ProjectPlan;
use cadence::registry::ProjectRegistry;
use cadence::state::{FileStore, PersistenceStore, ProjectId};
use cadence::Result;

/// Cadence - task-graph orchestration with quality checkpoints
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CADENCE_DEBUG=1     Enable debug logging (alternative to --debug)\n    CADENCE_LOG=<filter> Full tracing filter, e.g. cadence=trace")]
pub struct Cli {
    /// Enable debug logging (stderr)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a plan and print the run report as JSON
    Run {
        /// Plan file (.toml or .json)
        plan: PathBuf,

        /// Project id (random if omitted)
        #[arg(long)]
        project: Option<String>,

        /// Directory the executor runs in
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },

    /// Print the built graph (nodes, edges, cycles) as JSON
    Plan {
        /// Plan file (.toml or .json)
        plan: PathBuf,
    },

    /// Inspect persisted projects
    Projects {
        #[command(subcommand)]
        action: ProjectsAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ProjectsAction {
    /// List projects with stored checkpoints
    List,
    /// Delete a project's stored checkpoints
    Delete {
        /// Project id
        id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cadence::log::init(cli.debug);

    let config = Config::load()?;
    debug!(command = ?cli.command, "starting");

    match cli.command {
        Command::Run {
            plan,
            project,
            working_dir,
        } => run_plan(config, plan, project, working_dir),
        Command::Plan { plan } => print_plan(&config, plan),
        Command::Projects { action } => run_projects(&config, action),
    }
}

fn run_plan(
    config: Config,
    plan_path: PathBuf,
    project: Option<String>,
    working_dir: Option<PathBuf>,
) -> Result<()> {
    let plan = ProjectPlan::load(&plan_path)?;
    config.ensure_dirs()?;

    let executor = CommandExecutor::new(config.effective_command(), config.effective_args())?;
    let store = FileStore::new(config.store_dir()?);
    let working_dir = match working_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let rt = tokio::runtime::Runtime::new()?;
    let status = rt.block_on(async {
        let bus = EventBus::new(Arc::new(TracingSink), config.engine.event_buffer);
        let mut registry = ProjectRegistry::new(
            config.engine.clone(),
            Arc::new(executor),
            Arc::new(store),
            bus.publisher(),
        )
        .with_working_dir(working_dir);

        let id = match project {
            Some(id) => registry.start_as(ProjectId::from(id), &plan)?,
            None => registry.start(&plan)?,
        };
        info!(project = %id, plan = %plan_path.display(), "running plan");
        let status = registry.wait(&id).await?;
        drop(registry);
        bus.shutdown();
        Ok::<_, cadence::Error>(status)
    })?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.report.status != GraphStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_plan(config: &Config, plan_path: PathBuf) -> Result<()> {
    let plan = ProjectPlan::load(&plan_path)?;
    let built = plan.build(&config.engine)?;
    let order = built.graph.topological_order()?;
    let output = serde_json::json!({
        "nodes": built.graph.nodes().collect::<Vec<_>>(),
        "edges": built.graph.edges().collect::<Vec<_>>(),
        "order": order,
        "checkpoints": built.checkpoints,
        "cycles": built.cycles,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_projects(config: &Config, action: ProjectsAction) -> Result<()> {
    let store = FileStore::new(config.store_dir()?);
    let rt = tokio::runtime::Runtime::new()?;
    match action {
        ProjectsAction::List => {
            let projects = rt.block_on(store.list_projects())?;
            println!("{}", serde_json::to_string_pretty(&projects)?);
        }
        ProjectsAction::Delete { id } => {
            let id = ProjectId::from(id);
            rt.block_on(store.delete_project(&id))?;
            println!("Deleted project {}", id);
        }
    }
    Ok(())
}

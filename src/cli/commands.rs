//! Command dispatch

use std::io;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_complete::generate;
use regex::Regex;
use tracing::{debug, instrument};

use crate::application::{Schedule, Scheduler};
use crate::cli::args::{Cli, Commands, ConfigCommands};
use crate::cli::error::{CliError, CliResult};
use crate::cli::output;
use crate::config::{global_config_path, local_config_path, Settings};
use crate::domain::CutflowDetail;
use crate::infrastructure::di::ServiceContainer;
use crate::infrastructure::{load_analysis, Analysis, InfraError};

pub fn execute_command(cli: &Cli) -> CliResult<()> {
    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()
            .map_err(|e| InfraError::io("resolve current directory", e))?,
    };

    match &cli.command {
        None => Err(CliError::Usage(
            "no command given, see `cutgraph --help`".to_string(),
        )),
        Some(Commands::Completion { shell }) => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(*shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
        Some(Commands::Config { command }) => cmd_config(command, &project_dir),
        Some(command) => {
            let settings = Settings::load(Some(&project_dir))?;
            let services = ServiceContainer::new(settings);
            match command {
                Commands::Tree { analysis } => cmd_tree(&services, analysis),
                Commands::Plan { analysis } => cmd_plan(&services, analysis),
                Commands::Graph { analysis, output } => {
                    cmd_graph(&services, analysis, output.as_deref())
                }
                Commands::Run {
                    analysis,
                    output,
                    only,
                } => cmd_run(&services, analysis, output.as_deref(), only.as_deref()),
                Commands::Config { .. } | Commands::Completion { .. } => Ok(()),
            }
        }
    }
}

fn load(services: &ServiceContainer, path: &Path, output_dir: Option<&Path>) -> CliResult<Analysis> {
    let output_dir = output_dir.unwrap_or(services.settings.output.directory.as_path());
    Ok(load_analysis(path, &services.settings, output_dir)?)
}

fn schedule<'a>(
    services: &ServiceContainer,
    analysis: &'a Analysis,
) -> CliResult<Schedule<'a, CutflowDetail>> {
    let schedule = Scheduler::new(&analysis.tree, analysis.namer.as_ref())
        .with_options(services.build_options())
        .build(&analysis.regions)
        .map_err(InfraError::from)?;
    for skipped in schedule.graph().skipped() {
        output::warning(&format!("region '{}' skipped: {}", skipped.name, skipped.error));
    }
    Ok(schedule)
}

#[instrument(level = "debug", skip(services))]
fn cmd_tree(services: &ServiceContainer, path: &Path) -> CliResult<()> {
    let analysis = load(services, path, None)?;
    output::data(&analysis.tree.to_tree_string());
    Ok(())
}

#[instrument(level = "debug", skip(services))]
fn cmd_plan(services: &ServiceContainer, path: &Path) -> CliResult<()> {
    let analysis = load(services, path, None)?;
    let schedule = schedule(services, &analysis)?;
    let graph = schedule.graph();

    output::section(&format!("{} action(s)", graph.len()));
    for action in schedule.ordered_actions() {
        output::planned(action);
    }
    output::field("fingerprint", &schedule.fingerprint());
    Ok(())
}

#[instrument(level = "debug", skip(services))]
fn cmd_graph(services: &ServiceContainer, path: &Path, target: Option<&Path>) -> CliResult<()> {
    let analysis = load(services, path, None)?;
    let schedule = schedule(services, &analysis)?;
    let dot = schedule.graph().to_dot();
    match target {
        Some(file) => {
            std::fs::write(file, dot)
                .map_err(|e| InfraError::io(format!("write {}", file.display()), e))?;
            output::field("Wrote", &file.display());
        }
        None => output::data(&dot),
    }
    Ok(())
}

#[instrument(level = "debug", skip(services))]
fn cmd_run(
    services: &ServiceContainer,
    path: &Path,
    output_dir: Option<&Path>,
    only: Option<&str>,
) -> CliResult<()> {
    let mut analysis = load(services, path, output_dir)?;
    if let Some(pattern) = only {
        let re = Regex::new(pattern)
            .map_err(|e| CliError::InvalidArgs(format!("--only '{pattern}': {e}")))?;
        analysis.regions.retain(|r| re.is_match(r.name()));
        debug!("--only '{}' keeps {} region(s)", pattern, analysis.regions.len());
    }
    if analysis.regions.is_empty() {
        return Err(CliError::Usage("no regions to run".to_string()));
    }

    let table = std::mem::take(&mut analysis.table);
    let schedule = schedule(services, &analysis)?;
    let backend = services.backend(table);
    let monitor = services.monitor();
    let report = schedule.execute(&backend, monitor.as_ref());

    for (name, region) in &report.regions {
        output::section(name);
        for outcome in &region.outcomes {
            output::outcome(outcome);
        }
    }

    let failed = report.regions.values().filter(|r| !r.is_success()).count();
    if failed > 0 {
        return Err(CliError::RunFailed {
            failed,
            total: report.regions.len(),
        });
    }
    Ok(())
}

fn cmd_config(command: &ConfigCommands, project_dir: &Path) -> CliResult<()> {
    match command {
        ConfigCommands::Show => {
            let settings = Settings::load(Some(project_dir))?;
            output::data(&settings.to_toml()?);
        }
        ConfigCommands::Path => {
            let global = global_config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<no config dir>".to_string());
            let local: PathBuf = local_config_path(project_dir);
            output::field("global", &global);
            output::field("local", &local.display());
        }
        ConfigCommands::Template => output::data(&Settings::template()),
    }
    Ok(())
}

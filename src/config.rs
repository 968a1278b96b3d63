//! Configuration management with layered loading
//!
//! Precedence (lowest to highest):
//! 1. Compiled defaults
//! 2. Global config: `$XDG_CONFIG_HOME/cutgraph/cutgraph.toml`
//! 3. Local config: `<project_dir>/.cutgraph.toml`
//! 4. Environment variables: `CUTGRAPH_*` prefix, `__` between section and key

use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, ConfigError, Environment};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::application::{BuildOptions, UnknownSystematicPolicy};
use crate::domain::{BranchNamer, DefaultNamer, ScheduleNamer};
use crate::infrastructure::{InfraError, InfraResult};

/// Which [`BranchNamer`] to use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NamingScheme {
    /// Variation-aware suffixing
    #[default]
    Schedule,
    /// Logical names for every systematic
    Default,
}

impl std::str::FromStr for NamingScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(Self::Schedule),
            "default" => Ok(Self::Default),
            other => Err(format!("unknown naming scheme '{other}' (schedule|default)")),
        }
    }
}

/// Physical column naming.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NamingConfig {
    pub scheme: NamingScheme,
    /// Label used for the nominal systematic in files and on the command line
    pub nominal_name: String,
    pub separator: String,
    /// `JES_up__jet_pt` instead of `jet_pt__JES_up`
    pub systematic_first: bool,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            scheme: NamingScheme::Schedule,
            nominal_name: "nominal".into(),
            separator: crate::domain::namer::DEFAULT_SEPARATOR.into(),
            systematic_first: false,
        }
    }
}

impl NamingConfig {
    pub fn namer(&self) -> Arc<dyn BranchNamer> {
        match self.scheme {
            NamingScheme::Schedule => Arc::new(ScheduleNamer::new(
                self.separator.clone(),
                self.systematic_first,
            )),
            NamingScheme::Default => Arc::new(DefaultNamer),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Cost of actions without a cost hint
    pub default_cost: f64,
    pub on_unknown_systematic: UnknownSystematicPolicy,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        let defaults = BuildOptions::default();
        Self {
            default_cost: defaults.default_cost,
            on_unknown_systematic: defaults.on_unknown_systematic,
        }
    }
}

impl SchedulingConfig {
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            default_cost: self.default_cost,
            on_unknown_systematic: self.on_unknown_systematic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Evaluate rows with rayon
    pub parallel: bool,
    /// Progress line interval in realized actions; 0 disables it
    pub progress_every: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            progress_every: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("cutgraph-out"),
        }
    }
}

/// Raw sections for intermediate parsing: `None` means "not specified,
/// inherit from the layer below".
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawNamingConfig {
    pub scheme: Option<NamingScheme>,
    pub nominal_name: Option<String>,
    pub separator: Option<String>,
    pub systematic_first: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawSchedulingConfig {
    pub default_cost: Option<f64>,
    pub on_unknown_systematic: Option<UnknownSystematicPolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawExecutionConfig {
    pub parallel: Option<bool>,
    pub progress_every: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawOutputConfig {
    pub directory: Option<PathBuf>,
}

/// Raw settings for intermediate parsing.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawSettings {
    pub naming: RawNamingConfig,
    pub scheduling: RawSchedulingConfig,
    pub execution: RawExecutionConfig,
    pub output: RawOutputConfig,
}

/// Unified configuration for cutgraph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub naming: NamingConfig,
    pub scheduling: SchedulingConfig,
    pub execution: ExecutionConfig,
    pub output: OutputConfig,
}

/// Get the XDG config directory for cutgraph.
pub fn global_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "cutgraph").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the global config file.
pub fn global_config_path() -> Option<PathBuf> {
    global_config_dir().map(|dir| dir.join("cutgraph.toml"))
}

/// Get the path to the local config file in a project directory.
pub fn local_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".cutgraph.toml")
}

/// Expand `~`, `$VAR` and `${VAR}`; unexpandable input is returned as is.
pub fn expand_env_vars(path: &str) -> String {
    shellexpand::full(path)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Load a TOML file into RawSettings for manual merging.
fn load_raw_settings(path: &Path) -> InfraResult<RawSettings> {
    let content =
        std::fs::read_to_string(path).map_err(|e| InfraError::io(format!("read {}", path.display()), e))?;
    toml::from_str(&content).map_err(|e| InfraError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

impl Settings {
    /// Expand shell variables and tilde in path-like fields.
    fn expand_paths(&mut self) {
        let expanded = expand_env_vars(self.output.directory.to_string_lossy().as_ref());
        self.output.directory = PathBuf::from(expanded);
    }

    /// Merge overlay config onto self (base): overlay wins where specified.
    fn merge_with(&self, overlay: &RawSettings) -> Self {
        let naming = &overlay.naming;
        let scheduling = &overlay.scheduling;
        let execution = &overlay.execution;
        Self {
            naming: NamingConfig {
                scheme: naming.scheme.unwrap_or(self.naming.scheme),
                nominal_name: naming
                    .nominal_name
                    .clone()
                    .unwrap_or_else(|| self.naming.nominal_name.clone()),
                separator: naming
                    .separator
                    .clone()
                    .unwrap_or_else(|| self.naming.separator.clone()),
                systematic_first: naming
                    .systematic_first
                    .unwrap_or(self.naming.systematic_first),
            },
            scheduling: SchedulingConfig {
                default_cost: scheduling
                    .default_cost
                    .unwrap_or(self.scheduling.default_cost),
                on_unknown_systematic: scheduling
                    .on_unknown_systematic
                    .unwrap_or(self.scheduling.on_unknown_systematic),
            },
            execution: ExecutionConfig {
                parallel: execution.parallel.unwrap_or(self.execution.parallel),
                progress_every: execution
                    .progress_every
                    .unwrap_or(self.execution.progress_every),
            },
            output: OutputConfig {
                directory: overlay
                    .output
                    .directory
                    .clone()
                    .unwrap_or_else(|| self.output.directory.clone()),
            },
        }
    }

    /// Load settings with layered precedence.
    ///
    /// # Arguments
    /// * `project_dir` - Optional project directory for local config
    pub fn load(project_dir: Option<&Path>) -> InfraResult<Self> {
        let mut current = Self::default();

        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                debug!("global config: {}", global_path.display());
                current = current.merge_with(&load_raw_settings(&global_path)?);
            }
        }

        if let Some(project) = project_dir {
            let local_path = local_config_path(project);
            if local_path.exists() {
                debug!("local config: {}", local_path.display());
                current = current.merge_with(&load_raw_settings(&local_path)?);
            }
        }

        current = Self::apply_env_overrides(current)?;
        current.expand_paths();
        current.validate()?;
        Ok(current)
    }

    /// Apply CUTGRAPH_* environment variables as explicit overrides.
    fn apply_env_overrides(mut settings: Self) -> InfraResult<Self> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("CUTGRAPH")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(config_err)?;

        if let Ok(val) = config.get_string("naming.scheme") {
            settings.naming.scheme = val
                .parse()
                .map_err(|message| InfraError::Config { message })?;
        }
        if let Ok(val) = config.get_string("naming.nominal_name") {
            settings.naming.nominal_name = val;
        }
        if let Ok(val) = config.get_string("naming.separator") {
            settings.naming.separator = val;
        }
        if let Ok(val) = config.get_bool("naming.systematic_first") {
            settings.naming.systematic_first = val;
        }
        if let Ok(val) = config.get_float("scheduling.default_cost") {
            settings.scheduling.default_cost = val;
        }
        if let Ok(val) = config.get_string("scheduling.on_unknown_systematic") {
            settings.scheduling.on_unknown_systematic = match val.as_str() {
                "error" => UnknownSystematicPolicy::Error,
                "skip-region" => UnknownSystematicPolicy::SkipRegion,
                other => {
                    return Err(InfraError::Config {
                        message: format!(
                            "unknown on_unknown_systematic '{other}' (error|skip-region)"
                        ),
                    })
                }
            };
        }
        if let Ok(val) = config.get_bool("execution.parallel") {
            settings.execution.parallel = val;
        }
        if let Ok(val) = config.get_int("execution.progress_every") {
            settings.execution.progress_every = u64::try_from(val).unwrap_or(0);
        }
        if let Ok(val) = config.get_string("output.directory") {
            settings.output.directory = PathBuf::from(val);
        }

        Ok(settings)
    }

    /// Reject values no schedule could be built with.
    pub fn validate(&self) -> InfraResult<()> {
        let invalid = |message: String| Err(InfraError::Config { message });
        if self.naming.nominal_name.trim().is_empty() {
            return invalid("naming.nominal_name must not be empty".into());
        }
        if self.naming.scheme == NamingScheme::Schedule && self.naming.separator.is_empty() {
            return invalid("naming.separator must not be empty".into());
        }
        let cost = self.scheduling.default_cost;
        if !cost.is_finite() || cost < 0.0 {
            return invalid(format!(
                "scheduling.default_cost must be finite and non-negative, got {cost}"
            ));
        }
        Ok(())
    }

    /// Show the effective configuration as TOML.
    pub fn to_toml(&self) -> InfraResult<String> {
        toml::to_string_pretty(self).map_err(|e| InfraError::Config {
            message: format!("serialize config: {e}"),
        })
    }

    /// Generate a template config file.
    pub fn template() -> String {
        r#"# cutgraph configuration
#
# Locations (by precedence, lowest to highest):
#   Global: ~/.config/cutgraph/cutgraph.toml
#   Local:  <project_dir>/.cutgraph.toml
#   Env:    CUTGRAPH_<SECTION>__<KEY>, e.g. CUTGRAPH_NAMING__SEPARATOR=__

[naming]
# "schedule" suffixes variations (jet_pt__JES_up), "default" never renames
# scheme = "schedule"
# nominal_name = "nominal"
# separator = "__"
# systematic_first = false

[scheduling]
# Cost of filters and variables without a cost hint
# default_cost = 1.0
# "error" fails the build, "skip-region" drops the region with a warning
# on_unknown_systematic = "error"

[execution]
# parallel = true
# Print a progress line every N realized actions (0 = off)
# progress_every = 0

[output]
# directory = "cutgraph-out"
"#
        .to_string()
    }
}

fn config_err(e: ConfigError) -> InfraError {
    InfraError::Config {
        message: e.to_string(),
    }
}

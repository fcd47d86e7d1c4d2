use std::{
    env,
    path::{Path, PathBuf},
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::Serialize;
use thiserror::Error;
use types::{ConfigError, EngineConfig, SandboxConfig};

const SYSTEM_CONFIG_DIR: &str = "/etc/stepforge";
const USER_CONFIG_DIR: &str = ".config/stepforge";
const WORKSPACE_CONFIG_DIR: &str = ".stepforge";
pub const CONFIG_FILE_NAME: &str = "stepforge.toml";
const CONFIG_ENV_PREFIX: &str = "STEPFORGE__";

#[derive(Debug, Clone)]
pub struct ConfigSearchPaths {
    pub system_dir: PathBuf,
    pub user_dir: Option<PathBuf>,
    pub workspace_dir: PathBuf,
}

impl ConfigSearchPaths {
    pub fn discover(workspace: &Path) -> Self {
        let user_dir = env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(USER_CONFIG_DIR));
        Self {
            system_dir: PathBuf::from(SYSTEM_CONFIG_DIR),
            user_dir,
            workspace_dir: workspace.join(WORKSPACE_CONFIG_DIR),
        }
    }
}

/// Values given on the command line. They win over every other layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trajectory: Option<TrajectoryOverrides>,
    /// Replaces any sandbox source found in lower layers instead of being
    /// merged with it.
    #[serde(skip)]
    pub sandbox_source: Option<SandboxSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrajectoryOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxSource {
    Image(String),
    Container(String),
    Dockerfile {
        dockerfile: PathBuf,
        context: Option<PathBuf>,
    },
    Archive(PathBuf),
}

impl SandboxSource {
    fn apply(self, sandbox: &mut SandboxConfig) {
        sandbox.image = None;
        sandbox.container = None;
        sandbox.dockerfile = None;
        sandbox.build_context = None;
        sandbox.archive = None;
        match self {
            Self::Image(image) => sandbox.image = Some(image),
            Self::Container(id) => sandbox.container = Some(id),
            Self::Dockerfile {
                dockerfile,
                context,
            } => {
                sandbox.dockerfile = Some(dockerfile);
                sandbox.build_context = context;
            }
            Self::Archive(archive) => sandbox.archive = Some(archive),
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration file `{}` does not exist", path.display())]
    MissingConfigFile { path: PathBuf },
    #[error("failed to load configuration: {0}")]
    ConfigExtract(#[source] Box<figment::Error>),
    #[error(transparent)]
    ConfigValidation(#[from] ConfigError),
}

impl From<figment::Error> for BootstrapError {
    fn from(value: figment::Error) -> Self {
        Self::ConfigExtract(Box::new(value))
    }
}

pub fn load_config(
    workspace: &Path,
    explicit_file: Option<&Path>,
    cli_overrides: CliOverrides,
) -> Result<EngineConfig, BootstrapError> {
    let paths = ConfigSearchPaths::discover(workspace);
    load_config_with_paths(&paths, explicit_file, cli_overrides)
}

/// Layers, lowest first: built-in defaults, system file, user file,
/// workspace file, `--config` file, `STEPFORGE__*` environment, command
/// line.
pub fn load_config_with_paths(
    paths: &ConfigSearchPaths,
    explicit_file: Option<&Path>,
    cli_overrides: CliOverrides,
) -> Result<EngineConfig, BootstrapError> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
    figment = merge_directory(figment, &paths.system_dir);
    if let Some(user_dir) = &paths.user_dir {
        figment = merge_directory(figment, user_dir);
    }
    figment = merge_directory(figment, &paths.workspace_dir);
    if let Some(path) = explicit_file {
        if !path.is_file() {
            return Err(BootstrapError::MissingConfigFile {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }
    figment = figment.merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"));

    let sandbox_source = cli_overrides.sandbox_source.clone();
    figment = figment.merge(Serialized::defaults(cli_overrides));

    let mut config: EngineConfig = figment.extract()?;
    if let Some(source) = sandbox_source {
        source.apply(config.sandbox.get_or_insert_with(SandboxConfig::default));
    }
    config.validate()?;
    Ok(config)
}

fn merge_directory(figment: Figment, directory: &Path) -> Figment {
    let path = directory.join(CONFIG_FILE_NAME);
    if path.is_file() {
        tracing::debug!(path = %path.display(), "merging configuration file");
        figment.merge(Toml::file(path))
    } else {
        figment
    }
}

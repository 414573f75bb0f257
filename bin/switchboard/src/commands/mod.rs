pub mod gateway;
pub mod onboard;
pub mod skills;
pub mod status;

use std::path::{Path, PathBuf};
use switchboard_core::{Config, Paths, Result, Workspace};

/// Where the CLI reads its configuration from.
pub struct Resolved {
    pub paths: Paths,
    pub config_path: PathBuf,
    pub config: Config,
}

impl Resolved {
    pub fn workspace(&self) -> Workspace {
        Workspace::new(self.config.workspace_dir(&self.paths))
    }
}

/// An explicit `--config` must exist; the default location falls back to
/// built-in defaults when absent.
pub fn resolve(config_path: Option<PathBuf>) -> Result<Resolved> {
    let paths = Paths::new();
    let (config_path, config) = match config_path {
        Some(path) => {
            let config = Config::load(&path)?;
            (path, config)
        }
        None => (paths.config_file(), Config::load_or_default(&paths)?),
    };
    Ok(Resolved {
        paths,
        config_path,
        config,
    })
}

pub fn log_buffer_size(config_path: Option<&Path>) -> usize {
    resolve(config_path.map(Path::to_path_buf))
        .map(|r| r.config.gateway.log_buffer_size)
        .unwrap_or_else(|_| switchboard_core::config::GatewayConfig::default().log_buffer_size)
}

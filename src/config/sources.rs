use super::models::Config;
use config::{ConfigError, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

const CONFIG_ENV_VAR: &str = "IMGPIPE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/imgpipe.toml";
const ENV_PREFIX: &str = "IMGPIPE";
const ENV_SEPARATOR: &str = "__";

/// Where the TOML layer comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigFile {
    /// Given on the command line; must exist
    Explicit(PathBuf),
    /// `$IMGPIPE_CONFIG` or `config/imgpipe.toml`; skipped when missing
    Discovered(PathBuf),
}

impl ConfigFile {
    pub fn discover() -> Self {
        let path = std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        ConfigFile::Discovered(path)
    }

    fn path(&self) -> &Path {
        match self {
            ConfigFile::Explicit(path) | ConfigFile::Discovered(path) => path,
        }
    }
}

/// Layers, lowest to highest priority:
/// struct defaults, TOML file, `.env` (via dotenvy), process environment
pub fn load(file: ConfigFile) -> Result<Config, ConfigError> {
    // Missing .env is fine; values only fill unset variables
    let _ = dotenvy::dotenv();
    load_from_sources(file)
}

/// Same as [`load`] without reading `.env`
pub fn load_from_sources(file: ConfigFile) -> Result<Config, ConfigError> {
    let path = file.path();
    let required = matches!(file, ConfigFile::Explicit(_));

    let mut builder = config::Config::builder();
    if required || path.exists() {
        tracing::info!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(required),
        );
    } else {
        tracing::warn!(
            path = %path.display(),
            "No configuration file, using defaults and environment"
        );
    }

    // IMGPIPE__BROKER__ADDRESS -> broker.address
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

use rust_cli_config::{ConfigError, Environment as EnvironmentSource, File};
use serde::de::DeserializeOwned;

use crate::environment::Environment;

/// Directory containing configuration files relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Base configuration file loaded for all environments.
const BASE_CONFIG_FILE: &str = "base.yaml";

/// Prefix for environment variable configuration overrides.
const ENV_PREFIX: &str = "APP";

const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested configuration keys in environment variables.
///
/// Example: `APP_SOURCE__DATABASE=sampledata` sets the `source.database` field.
const ENV_SEPARATOR: &str = "__";

/// Separator for list elements in environment variables.
const LIST_SEPARATOR: &str = ",";

/// Trait implemented by top level configuration objects loadable with [`load_config`].
pub trait Config {
    /// Keys that should be parsed as comma separated lists when read from the environment.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// Loads hierarchical configuration from YAML files and environment variables.
///
/// Sources are merged in this order:
/// 1. `configuration/base.yaml`
/// 2. `configuration/{environment}.yaml`, where the environment comes from `APP_ENVIRONMENT`
/// 3. Environment variables prefixed with `APP`, using `__` for nesting
///
/// Both files are optional so that a deployment can be configured from the environment alone.
pub fn load_config<T>() -> Result<T, ConfigError>
where
    T: Config + DeserializeOwned,
{
    let base_path = std::env::current_dir()
        .map_err(|err| ConfigError::Message(format!("cannot determine current directory: {err}")))?;
    let configuration_directory = base_path.join(CONFIGURATION_DIR);

    let environment = Environment::load().map_err(|err| ConfigError::Message(err.to_string()))?;
    let environment_filename = format!("{environment}.yaml");

    let mut environment_source = EnvironmentSource::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true);

    if !<T as Config>::LIST_PARSE_KEYS.is_empty() {
        environment_source = environment_source.list_separator(LIST_SEPARATOR);

        for key in <T as Config>::LIST_PARSE_KEYS {
            environment_source = environment_source.with_list_parse_key(key);
        }
    }

    let settings = rust_cli_config::Config::builder()
        .add_source(File::from(configuration_directory.join(BASE_CONFIG_FILE)).required(false))
        .add_source(File::from(configuration_directory.join(environment_filename)).required(false))
        // E.g. `APP_DESTINATION__SQLITE__PATH=warehouse.sqlite` sets
        // `ReplicatorConfig { destination: Sqlite { path } }`.
        .add_source(environment_source)
        .build()?;

    settings.try_deserialize::<T>()
}

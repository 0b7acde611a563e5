mod settings;

use std::collections::HashSet;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    DeviceSettings, DispatcherSettings, ModemSettings, ServerSettings, Settings, StoreSettings,
};

const DEFAULT_FILE: &str = "config/default";
const ENV_PREFIX: &str = "SMSGATE";

/// Loads `config/default.*` (if present) and `SMSGATE_*` environment
/// variables, merged over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load(DEFAULT_FILE, false)
}

/// Like [`load_config`] but reads the given file, which must exist.
pub fn load_config_file(path: &str) -> Result<Settings, ConfigError> {
    load(path, true)
}

fn load(path: &str, required: bool) -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name(path).required(required))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available, then fill the gaps
    let partial: PartialSettings = config.try_deserialize()?;
    let settings = partial.merge();
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    let dispatcher = &settings.dispatcher;
    if dispatcher.pool_size == 0 {
        return Err(invalid("dispatcher.pool_size must be at least 1"));
    }
    if dispatcher.pool_low > dispatcher.pool_size {
        return Err(invalid("dispatcher.pool_low must not exceed pool_size"));
    }

    let modem = &settings.modem;
    if modem.backoff_min_ms > modem.backoff_max_ms {
        return Err(invalid("modem.backoff_min_ms must not exceed backoff_max_ms"));
    }
    if modem.backoff_factor.is_nan() || modem.backoff_factor < 1.0 {
        return Err(invalid("modem.backoff_factor must be at least 1.0"));
    }

    let mut ids = HashSet::new();
    for device in &settings.devices {
        if !ids.insert(device.id.as_str()) {
            return Err(invalid(&format!("duplicate device id {:?}", device.id)));
        }
    }
    Ok(())
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Message(format!("invalid configuration: {reason}"))
}

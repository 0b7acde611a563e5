use std::time::Duration;

use serde::Deserialize;

use crate::dispatcher::engine::DEFAULT_DRAIN_TIMEOUT;
use crate::modem::ConnectionSettings;
use crate::modem::backoff::BackoffSettings;

/// Top-level configuration for the gateway.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub dispatcher: DispatcherSettings,
    pub modem: ModemSettings,
    pub devices: Vec<DeviceSettings>,
}

/// Address the WebSocket producer API binds to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StoreSettings {
    /// Directory of the sled database.
    pub path: String,
}

/// Pool sizing and timing of the dispatch coordinator.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DispatcherSettings {
    pub pool_size: usize,
    pub pool_low: usize,
    pub poll_interval_secs: u64,
    pub drain_timeout_secs: u64,
}

impl DispatcherSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Timeouts, retry limit and reconnect backoff shared by all devices.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ModemSettings {
    pub handshake_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub retry_limit: u32,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_factor: f32,
}

impl ModemSettings {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            retry_limit: self.retry_limit,
            backoff: BackoffSettings {
                min: Duration::from_millis(self.backoff_min_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                factor: self.backoff_factor,
            },
        }
    }
}

/// One AT modem reachable over TCP.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeviceSettings {
    pub id: String,
    pub address: String,
}

/// Configuration as found in files and the environment; any value may be
/// missing and is filled in from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub store: Option<PartialStoreSettings>,
    pub dispatcher: Option<PartialDispatcherSettings>,
    pub modem: Option<PartialModemSettings>,
    pub devices: Option<Vec<DeviceSettings>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDispatcherSettings {
    pub pool_size: Option<usize>,
    pub pool_low: Option<usize>,
    pub poll_interval_secs: Option<u64>,
    pub drain_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialModemSettings {
    pub handshake_timeout_secs: Option<u64>,
    pub send_timeout_secs: Option<u64>,
    pub retry_limit: Option<u32>,
    pub backoff_min_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub backoff_factor: Option<f32>,
}

impl PartialSettings {
    /// Overlay whatever was specified on top of the defaults.
    pub fn merge(self) -> Settings {
        let default = Settings::default();
        let server = self.server.unwrap_or_default();
        let store = self.store.unwrap_or_default();
        let dispatcher = self.dispatcher.unwrap_or_default();
        let modem = self.modem.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            store: StoreSettings {
                path: store.path.unwrap_or(default.store.path),
            },
            dispatcher: DispatcherSettings {
                pool_size: dispatcher
                    .pool_size
                    .unwrap_or(default.dispatcher.pool_size),
                pool_low: dispatcher.pool_low.unwrap_or(default.dispatcher.pool_low),
                poll_interval_secs: dispatcher
                    .poll_interval_secs
                    .unwrap_or(default.dispatcher.poll_interval_secs),
                drain_timeout_secs: dispatcher
                    .drain_timeout_secs
                    .unwrap_or(default.dispatcher.drain_timeout_secs),
            },
            modem: ModemSettings {
                handshake_timeout_secs: modem
                    .handshake_timeout_secs
                    .unwrap_or(default.modem.handshake_timeout_secs),
                send_timeout_secs: modem
                    .send_timeout_secs
                    .unwrap_or(default.modem.send_timeout_secs),
                retry_limit: modem.retry_limit.unwrap_or(default.modem.retry_limit),
                backoff_min_ms: modem
                    .backoff_min_ms
                    .unwrap_or(default.modem.backoff_min_ms),
                backoff_max_ms: modem
                    .backoff_max_ms
                    .unwrap_or(default.modem.backoff_max_ms),
                backoff_factor: modem
                    .backoff_factor
                    .unwrap_or(default.modem.backoff_factor),
            },
            devices: self.devices.unwrap_or(default.devices),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let connection = ConnectionSettings::default();
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            store: StoreSettings {
                path: "smsgate_db".to_string(),
            },
            dispatcher: DispatcherSettings {
                pool_size: 10,
                pool_low: 3,
                poll_interval_secs: 60,
                drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT.as_secs(),
            },
            modem: ModemSettings {
                handshake_timeout_secs: connection.handshake_timeout.as_secs(),
                send_timeout_secs: connection.send_timeout.as_secs(),
                retry_limit: connection.retry_limit,
                backoff_min_ms: connection.backoff.min.as_millis() as u64,
                backoff_max_ms: connection.backoff.max.as_millis() as u64,
                backoff_factor: connection.backoff.factor,
            },
            devices: Vec::new(),
        }
    }
}

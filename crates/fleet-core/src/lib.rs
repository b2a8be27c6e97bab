pub mod config;

pub use config::{
    BusConfig, ConfigError, ControllerConfig, DaemonConfig, DispatchMode, FleetConfig,
    StoreConfig, DEFAULT_CONFIG_PATH,
};

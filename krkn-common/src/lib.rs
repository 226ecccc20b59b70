//! Shared building blocks for the Kraken chaos-run supervisor.
//!
//! - [`ports`]: signal-server port allocation with deterministic fallbacks
//! - [`config`]: Kraken config file access, auth config, `KRKN_*` env parsing
//! - [`environment`]: environment builders that inject credentials into the tool
//! - [`logging`]: tracing subscriber initialisation shared by binaries

pub mod config;
pub mod environment;
pub mod logging;
pub mod ports;
pub mod util;

pub use config::{AuthConfig, ConfigError, EnvError, EnvParser, KrknConfigFile};
pub use environment::{
    EnvironmentBuilder, IbmCloudEnvironment, KubeconfigEnvironment, Platform, builder_for_platform,
};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use ports::{
    DEFAULT_SIGNAL_PORT, PORT_RANGE_END, PORT_RANGE_START, PortAllocator, PortExhaustionError,
    PortRange, validate_port_range,
};
pub use util::mask_sensitive_env;

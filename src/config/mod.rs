//! Config loading and persistence.

mod load;
mod schema;

pub use load::{ConfigFileError, load, load_or_default};
pub use schema::{
    Config, ConfigOverride, ConsensusConfig, ConsensusConfigOverride, FileLoggingConfig,
    LogFormat, LogRotation, LoggingConfig, LoggingConfigOverride, ReactorConfig,
    ReactorConfigOverride,
};

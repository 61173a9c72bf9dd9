//! Configuration, paths, errors and logging shared by the AppMarket crates.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    CheckoutFallback, Config, PollConfig, DEFAULT_LOG_LEVEL, DEFAULT_SUPABASE_ANON_KEY,
    DEFAULT_SUPABASE_URL, DEFAULT_WEB_APP_URL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{
    init_logging_for_service, init_with_config, parse_level, LogConfig,
};
pub use paths::Paths;

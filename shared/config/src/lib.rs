mod config;
mod load;

pub use config::{Config, Fileserve, Plugins, Resources, World};
pub use load::{get, get_or_defaults, init, init_defaults, load_time, ConfigError, ConfigRef};

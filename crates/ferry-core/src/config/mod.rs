mod build;
mod resolve;
mod sources;
mod types;

pub use self::build::build_jobs;
pub use self::resolve::{
    config_template, expand_env_placeholders, load, resolve_config_path, DEFAULT_CONFIG_PATHS,
};
pub use self::sources::parse_sources;
pub use self::types::*;

mod defaults;
mod deserialize;
mod resolve;
mod types;

pub use self::defaults::{parse_human_duration, parse_human_size};
pub use self::resolve::{
    default_config_search_paths, load_config, minimal_config_template, parse_config,
    resolve_config_path, ConfigSource,
};
pub use self::types::*;

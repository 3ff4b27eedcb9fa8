// Configuration loading

pub mod paths;
pub mod settings;

pub use paths::{config_dir, discovery_dir};
pub use settings::Settings;

pub mod campaign;
pub mod clap_args;
pub mod config;
pub mod error;
pub mod execution_unit;
pub mod metrics;
pub mod monitor;
pub mod plugin;
pub mod process_control;
pub mod resources;
pub mod settings;
pub mod summary;
pub mod sweep;
pub mod template;
pub mod value_domain;

pub use campaign::{Campaign, CampaignOptions, CampaignReport};
pub use config::CampaignConfig;
pub use error::CampaignError;

//! CLI presentation: text and json formatters per command family.

mod calibration;
mod lifecycle;
mod sessions;
mod shared;

pub use calibration::{format_import, format_regeneration, format_summary};
pub use lifecycle::{
    format_config, format_jobs, format_master, format_master_checks, format_retention,
};
pub use sessions::{format_resolution, format_sessions};
pub use shared::Palette;

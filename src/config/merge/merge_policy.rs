//! Merge rules: defaults first, later sources override earlier ones key by key.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("storage.catalog_path", ".astrocal/catalog")?
        .set_default("storage.library_root", ".")?
        .set_default("storage.calibrated_dir", "Calibrated")?
        .set_default("grouping.night_window_hours", 16.0)?
        .set_default("matching.dark_temperature_tolerance_c", 5.0)?
        .set_default(
            "masters.min_frames_per_master",
            crate::master::DEFAULT_MIN_FRAMES_PER_MASTER as i64,
        )
}

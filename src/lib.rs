//! astrocal: Session Grouping & Calibration Resolution
//!
//! Catalogues astronomical exposures, partitions them into observing sessions, resolves
//! which calibration data may calibrate each light session, builds master calibration
//! frames through an external combiner, calibrates lights, and moves consumed frames
//! through a verified soft-delete and cloud-archive lifecycle.

pub mod api;
pub mod catalog;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod header;
pub mod import;
pub mod logging;
pub mod master;
pub mod orchestrator;
pub mod progress;
pub mod regeneration;
pub mod resolver;
pub mod retention;
pub mod session;
pub mod types;

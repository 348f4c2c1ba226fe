//! CLI domain: parse, route, help, output, and presentation only.
//! No domain orchestration; single route table dispatches to the calibration API.

mod help;
mod output;
mod parse;
mod presentation;
mod route;

pub use help::command_name;
pub use output::{exit_code, map_error};
pub use parse::{Cli, Commands, OutputFormat, SessionKindFilter};
pub use presentation::{format_config, Palette};
pub use route::{load_config, wants_json, RunContext};

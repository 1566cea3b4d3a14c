//! Command implementations for the strata CLI.

pub mod build;
pub mod clean;
pub mod preflight;
pub mod show;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use preflight::cmd_preflight;
pub use show::cmd_show;

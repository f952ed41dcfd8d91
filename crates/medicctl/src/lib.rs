//! Medic Control - command line front end for the Medic diagnostic core

pub mod approval;
pub mod commands;
pub mod progress;
pub mod render;

/// Environment variable holding a tracing filter
pub const LOG_ENV: &str = "MEDIC_LOG";

/// Tracing filter directive: `-v` flags win over `MEDIC_LOG`, default `warn`
pub fn log_directive(verbose: u8, env: Option<&str>) -> String {
    match (verbose, env) {
        (0, Some(filter)) if !filter.trim().is_empty() => filter.trim().to_string(),
        (0, _) => "warn".to_string(),
        (1, _) => "info".to_string(),
        _ => "debug".to_string(),
    }
}

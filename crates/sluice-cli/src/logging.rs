//! Log output of the `sluice` binary.
//!
//! Logs go to stderr; stdout carries command output only.

use tracing_subscriber::EnvFilter;

/// Crates whose events follow `--log-level`. Everything else logs warnings only.
const SLUICE_TARGETS: &[&str] = &["sluice", "sluice_engine", "sluice_state"];

/// Install the global subscriber. `RUST_LOG` takes precedence over `log_level`.
pub fn init(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn default_directives(log_level: &str) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(SLUICE_TARGETS.iter().map(|target| format!("{target}={log_level}")));
    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_scope_level_to_sluice_crates() {
        assert_eq!(
            default_directives("debug"),
            "warn,sluice=debug,sluice_engine=debug,sluice_state=debug"
        );
    }
}

//! Process-level setup shared by the CLI and embedding applications.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,seoinsikt_engine=debug";

/// Initialize logging with tracing_subscriber.
///
/// `RUST_LOG` overrides the default filter. Calling this more than once, or
/// after the host installed its own subscriber, is a no-op.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!("[LIFECYCLE] Logging initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_logging();
        init_logging();
    }
}

//! Log output setup.

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber filtered by `filter`.
///
/// `RUST_LOG` takes precedence when set. Returns `false` and leaves the
/// existing subscriber in place if the process already has one.
pub fn init(filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok();
    if !installed {
        tracing::debug!("global subscriber already installed, keeping it");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init("debug");
        assert!(!init("not a [valid filter"), "second init must keep the first subscriber");
        tracing::info!("logging initialised");
    }
}

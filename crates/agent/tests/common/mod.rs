//! Common test utilities for kiln-agent integration tests

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize tracing once per test binary. `RUST_LOG` overrides the default `warn`.
pub fn init_test_tracing() {
    INIT.call_once(|| {
        use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Filters come from the `CANOPY_LOG` environment variable (standard
//! `tracing_subscriber::EnvFilter` syntax), defaulting to `info`.

use std::sync::Once;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter
const FILTER_ENV: &str = "CANOPY_LOG";

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber. Safe to call more than
/// once; only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .with_env_var(FILTER_ENV)
            .from_env_lossy();

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    });
}

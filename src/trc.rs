//! Tracing configuration and initialization.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

enum TrcMode {
    /// Plain, verbose output for users who configured their own filter.
    Ugly,
    /// Compact output routed through an indicatif layer.
    Pretty,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        let maybe_env_filter =
            EnvFilter::try_from_env("FHCACHE_LOG").or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            Ok(env_filter) => Self {
                // Someone asking for a specific filter wants to read the events, not watch
                // spinners.
                mode: TrcMode::Ugly,
                env_filter,
            },
            Err(_) => Self {
                mode: TrcMode::Pretty,
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    pub fn init(self) -> Result<(), TryInitError> {
        match self.mode {
            TrcMode::Ugly => self.init_ugly_mode(),
            TrcMode::Pretty => self.init_pretty_mode(),
        }
    }

    fn init_ugly_mode(self) -> Result<(), TryInitError> {
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_thread_ids(true)
            .finish()
            .try_init()
    }

    fn init_pretty_mode(self) -> Result<(), TryInitError> {
        let indicatif_layer = IndicatifLayer::new();
        tracing_subscriber::registry()
            .with(self.env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .with(indicatif_layer)
            .try_init()
    }
}

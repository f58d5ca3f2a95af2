/*!
Logging and profiling setup for the simulator.

Two implementations share one API:

- real: compiled with `feature = "profiling"`. Adds a tracing-chrome layer
  when `ENABLE_PROFILING` is set; the trace file is flushed when the returned
  guard is dropped.
- stub: logging only.

`RUST_LOG` overrides the default filter in both cases.
*/

fn default_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "debug,quadtile_lib=info"
    } else {
        "info"
    }
}

#[cfg(feature = "profiling")]
mod inner {
    use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    /// Hold until exit; dropping it flushes the trace file
    pub struct ProfilingGuard {
        _flush: Option<FlushGuard>,
    }

    pub fn setup_logging_and_profiling() -> ProfilingGuard {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(super::default_filter()));
        let fmt_layer = fmt::layer().with_filter(filter);

        if std::env::var("ENABLE_PROFILING").is_ok() {
            let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
            tracing_subscriber::registry()
                .with(chrome_layer)
                .with(fmt_layer)
                .init();
            tracing::info!("ENABLE_PROFILING set - recording chrome trace");
            ProfilingGuard {
                _flush: Some(guard),
            }
        } else {
            tracing_subscriber::registry().with(fmt_layer).init();
            ProfilingGuard { _flush: None }
        }
    }
}

#[cfg(not(feature = "profiling"))]
mod inner {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    pub struct ProfilingGuard;

    pub fn setup_logging_and_profiling() -> ProfilingGuard {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(super::default_filter()));
        tracing_subscriber::registry()
            .with(fmt::layer().with_filter(filter))
            .init();
        ProfilingGuard
    }
}

pub use inner::*;

//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use stepweave_types::config::LoggingConfig;
//!
//! // Human-readable logs at the configured level
//! stepweave_observe::tracing_setup::init_tracing(&LoggingConfig::default(), None).unwrap();
//! ```

use stepweave_types::config::LoggingConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(feature = "otel")]
use std::sync::OnceLock;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider as _;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace::SdkTracerProvider;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
#[cfg(feature = "otel")]
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Filter directive used when `RUST_LOG` is unset.
///
/// A CLI verbosity override wins over the configured level.
pub fn filter_directive<'a>(config: &'a LoggingConfig, override_level: Option<&'a str>) -> &'a str {
    override_level.unwrap_or(config.level.as_str())
}

/// Initialize the global tracing subscriber.
///
/// - Logs go to stderr so command output on stdout stays machine-readable.
/// - `config.json` switches the fmt layer to JSON lines.
/// - `config.otel` bridges spans to OpenTelemetry with a stdout exporter when
///   the crate is built with the `otel` feature; otherwise it logs a warning.
/// - `RUST_LOG` takes precedence over both `override_level` and `config.level`.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or the global
/// subscriber has already been set.
pub fn init_tracing(
    config: &LoggingConfig,
    override_level: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directive(config, override_level))?,
    };

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer);

    #[cfg(feature = "otel")]
    {
        let otel_layer = config.otel.then(|| {
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
                .build();
            let tracer = provider.tracer("stepweave");

            let _ = TRACER_PROVIDER.set(provider.clone());
            opentelemetry::global::set_tracer_provider(provider);

            tracing_opentelemetry::layer().with_tracer(tracer)
        });
        subscriber.with(otel_layer).try_init()?;
    }

    #[cfg(not(feature = "otel"))]
    {
        subscriber.try_init()?;
        if config.otel {
            tracing::warn!("logging.otel is set but stepweave was built without the `otel` feature");
        }
    }

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    #[cfg(feature = "otel")]
    if let Some(provider) = TRACER_PROVIDER.get()
        && let Err(e) = provider.shutdown()
    {
        eprintln!("Warning: OTel tracer provider shutdown error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_level_wins() {
        let config = LoggingConfig::default();
        assert_eq!(filter_directive(&config, Some("debug")), "debug");
    }

    #[test]
    fn configured_level_is_the_fallback() {
        let config = LoggingConfig {
            level: "info,stepweave_core=debug".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(filter_directive(&config, None), "info,stepweave_core=debug");
        assert!(EnvFilter::try_new(filter_directive(&config, None)).is_ok());
    }

    #[test]
    fn shutdown_without_init_is_noop() {
        shutdown_tracing();
    }
}

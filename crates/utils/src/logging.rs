use std::str::FromStr;

use tracing::subscriber::Subscriber;
use tracing_subscriber::layer::{Filter, SubscriberExt};
use tracing_subscriber::{Layer, Registry};

/// Initializes tracing to stdout.
///
/// Trace filtering defaults to `INFO` and can be configured using the
/// conventional `RUST_LOG` environment variable.
///
/// Registers a panic hook so that panics are reported through the subscriber
/// rather than lost on stderr.
pub fn setup_tracing() -> anyhow::Result<()> {
    let subscriber = Registry::default().with(stdout_layer().with_filter(env_or_default_filter()));
    tracing::subscriber::set_global_default(subscriber)?;

    // Register panic hook now that tracing is initialized.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = true, "{info}");
    }));

    Ok(())
}

fn stdout_layer<S>() -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync + 'static>
where
    S: Subscriber,
    for<'a> S: tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .boxed()
}

/// Creates a filter from the `RUST_LOG` env var with a default of `INFO` if unset.
///
/// # Panics
///
/// Panics if `RUST_LOG` fails to parse.
fn env_or_default_filter<S>() -> Box<dyn Filter<S> + Send + Sync + 'static> {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::filter::{FilterExt, Targets};
    use tracing_subscriber::EnvFilter;

    // `tracing` does not allow differentiating between invalid and missing env var so we manually
    // do this instead. The alternative is to silently ignore parsing errors which I think is worse.
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(rust_log) => FilterExt::boxed(
            EnvFilter::from_str(&rust_log)
                .expect("RUST_LOG should contain a valid filter configuration"),
        ),
        Err(std::env::VarError::NotUnicode(_)) => panic!("RUST_LOG contained non-unicode"),
        Err(std::env::VarError::NotPresent) => {
            FilterExt::boxed(Targets::new().with_default(LevelFilter::INFO))
        },
    }
}

use std::env;
use std::io::IsTerminal;

use secrecy::ExposeSecret;
use sentry::integrations::tracing as sentry_tracing;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

use crate::config::{LogFormat, Settings};

pub fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let sentry = &settings.sentry;
    let dsn = sentry.dsn.as_ref()?;

    Some(sentry::init(sentry::ClientOptions {
        dsn: dsn.expose_secret().as_str().parse().ok(),
        release: sentry::release_name!(),
        environment: sentry.environment.clone().map(Into::into),
        sample_rate: sentry.sample_rate,
        ..Default::default()
    }))
}

pub fn init_tracing(settings: &Settings) {
    // Warnings and errors become Sentry events, info lines become breadcrumbs.
    let sentry_layer = settings.sentry.is_enabled().then(|| {
        sentry_tracing::layer().event_filter(|metadata| match *metadata.level() {
            Level::ERROR | Level::WARN => sentry_tracing::EventFilter::Event,
            Level::INFO => sentry_tracing::EventFilter::Breadcrumb,
            Level::DEBUG | Level::TRACE => sentry_tracing::EventFilter::Ignore,
        })
    });

    let (level, env_filter) = parse_rust_log(settings.logging.level);

    let pretty = match settings.logging.format {
        LogFormat::Auto => std::io::stderr().is_terminal(),
        LogFormat::Pretty => true,
        LogFormat::Simplified => false,
    };
    let format = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(pretty)
        .with_target(true);
    let format = if pretty {
        format.pretty().boxed()
    } else {
        format.compact().without_time().boxed()
    };

    tracing_subscriber::registry()
        .with(format.with_filter(level))
        .with(sentry_layer)
        .with(env_filter)
        .init();
}

/// Returns the level of the stderr output and the filter of all tracing layers.
///
/// A plain level in `RUST_LOG` replaces the configured level. Any other value is used as the
/// filter directly.
pub fn parse_rust_log(configured: LevelFilter) -> (LevelFilter, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        Err(_) => configured,
    };

    // Maximum verbosity, narrowed down to `level` by the output layer.
    let env_filter = EnvFilter::new(
        "INFO,\
        faasbench_cli=TRACE,\
        faasbench_core=TRACE,\
        faasbench_cloud=TRACE,\
        ",
    );

    (level, env_filter)
}

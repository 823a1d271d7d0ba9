use std::future::Future;
use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;
use faasbench_core::Events;
use faasbench_core::events::EventBus;

use crate::config::Settings;
use crate::{bench, deploy, observability};

/// Benchmarks serverless functions across cloud providers.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML settings file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Bench(BenchCommand),
    Deploy(DeployCommand),
    Generate(GenerateCommand),
    Remove(RemoveCommand),
    Version(VersionCommand),
}

/// run the benchmark against all configured functions
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "bench")]
struct BenchCommand {
    /// path to the benchmark config, overriding the settings
    #[argh(option)]
    config: Option<PathBuf>,
}

/// deploy the benchmark functions to all targets of the deploy config
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "deploy")]
struct DeployCommand {}

/// write a benchmark config for the deployed functions
///
/// Lists the functions of every deployment target and keeps those running an enabled benchmark
/// with a selected memory size.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "generate")]
struct GenerateCommand {
    /// path of the generated benchmark config, overriding the settings
    #[argh(option)]
    output: Option<PathBuf>,
}

/// remove the benchmark functions from all targets of the deploy config
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "remove")]
struct RemoveCommand {}

/// print the faasbench version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let settings = Settings::load(args.config.as_deref())?;

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&settings);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&settings);
    tracing::debug!(?settings);

    let settings = &settings;
    runtime.block_on(async {
        match args.command {
            Command::Bench(BenchCommand { config }) => {
                with_events(settings, |events| async move {
                    bench::bench(settings, config.as_deref(), &events).await
                })
                .await
            }
            Command::Deploy(DeployCommand {}) => {
                with_events(settings, |events| async move {
                    deploy::deploy(settings, &events).await
                })
                .await
            }
            Command::Generate(GenerateCommand { output }) => {
                with_events(settings, |events| async move {
                    deploy::generate(settings, output.as_deref(), &events).await
                })
                .await
            }
            Command::Remove(RemoveCommand {}) => {
                with_events(settings, |events| async move {
                    deploy::remove(settings, &events).await
                })
                .await
            }
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    })
}

/// Runs a command with an event bus printing to stdout, closing it once the command completes.
async fn with_events<F, Fut>(settings: &Settings, command: F) -> Result<()>
where
    F: FnOnce(Events) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let bus = EventBus::builder()
        .capacity(settings.events.capacity)
        .colors(settings.events.colors)
        .start();

    let result = command(bus.events()).await;
    bus.close().await;

    if let Err(ref err) = result {
        let error: &(dyn std::error::Error + 'static) = err.as_ref();
        tracing::error!(error, "command failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_commands_on_a_zero_capacity_bus() {
        let mut settings = Settings::default();
        settings.events.capacity = 0;
        settings.events.colors = false;

        with_events(&settings, |events| async move {
            events.info("version", env!("CARGO_PKG_VERSION"));
            Ok(())
        })
        .await
        .unwrap();
    }
}

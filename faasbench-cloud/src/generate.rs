//! Generation of benchmark configs from deployed functions.

use std::sync::Arc;

use faasbench_core::Events;
use faasbench_core::config::{AuthConfig, BenchmarkConfig, BenchmarkFunctionConfig, DeployConfig};
use faasbench_core::timeline::TimelineError;

use crate::deployer::DeployedFunction;
use crate::orchestrator::DeployOrchestrator;

/// Returns `true` if the function runs an enabled benchmark with a selected memory size.
pub fn is_selected(config: &DeployConfig, function: &DeployedFunction) -> bool {
    config.includes_memory_size(function.memory)
        && config.benchmark_parameter(&function.benchmark).is_some()
}

/// Turns a deployed function into a benchmark target invoking it with the benchmark's parameter.
pub fn to_function_config(
    config: &DeployConfig,
    function: &DeployedFunction,
) -> BenchmarkFunctionConfig {
    let parameter = config
        .benchmark_parameter(&function.benchmark)
        .unwrap_or_default();

    let provider = function.provider;
    let auth = AuthConfig::new(
        provider.auth_header(),
        function.auth.clone().unwrap_or_default(),
    );

    BenchmarkFunctionConfig {
        name: format!("{provider}-{}-{}", function.benchmark, function.memory),
        provider,
        region: function.region.clone(),
        memory_size: function.memory,
        url: format!("{}?parameter={parameter}", function.url),
        auth,
    }
}

/// Lists all deployed functions and builds a benchmark config for the selected ones.
///
/// The workload is copied from the deploy config.
pub async fn benchmark_config(
    orchestrator: &DeployOrchestrator,
    config: &DeployConfig,
    events: &Events,
) -> Result<BenchmarkConfig, TimelineError> {
    let filter_config = Arc::new(config.clone());
    let transform_config = Arc::clone(&filter_config);

    let functions = orchestrator
        .generate_benchmark_functions(
            events,
            move |function| is_selected(&filter_config, function),
            move |function| to_function_config(&transform_config, function),
        )
        .await?;

    Ok(BenchmarkConfig {
        workload: config.workload.clone(),
        functions,
    })
}

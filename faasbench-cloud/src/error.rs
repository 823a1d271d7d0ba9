use std::io;
use std::path::PathBuf;

use faasbench_core::Provider;
use thiserror::Error;

/// Errors obtaining an identity token for a function.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read service account JSON `{}`", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid service account JSON")]
    Credentials(#[source] serde_json::Error),

    #[error("invalid target URL `{url}`: {reason}")]
    TargetUrl { url: String, reason: String },

    #[error("failed to sign token assertion")]
    Sign(#[source] jsonwebtoken::errors::Error),

    #[error("token exchange failed: {context}")]
    Exchange {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("token endpoint returned no identity token")]
    MissingToken,
}

/// Errors deploying, listing or removing benchmark functions.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The deployment script could not be started or awaited.
    #[error("failed to run `{}` in {region}", .script.display())]
    Spawn {
        script: PathBuf,
        region: String,
        #[source]
        source: io::Error,
    },

    /// The deployment script exited unsuccessfully.
    #[error(
        "`{} {command}` failed in {region} ({status}){}",
        .script.display(),
        output_suffix(.output)
    )]
    Script {
        script: PathBuf,
        command: &'static str,
        region: String,
        status: std::process::ExitStatus,
        output: String,
    },

    /// A line printed by `get-urls` is not a deployed function record.
    #[error("failed to parse line: {line}")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no functions parsed from script output")]
    NoFunctions,

    #[error("no deployer registered for provider {0}")]
    UnknownProvider(Provider),
}

fn output_suffix(output: &str) -> String {
    let output = output.trim();
    if output.is_empty() {
        String::new()
    } else {
        format!(", output: {output}")
    }
}

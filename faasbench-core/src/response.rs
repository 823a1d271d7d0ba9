//! Decoding of benchmark function responses into archive records.

use reqwest::Response;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

/// Provider request identifiers taken from the response headers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    #[serde(rename = "aws-request-id", skip_serializing_if = "Option::is_none")]
    pub aws_request_id: Option<String>,
    #[serde(rename = "function-execution-id", skip_serializing_if = "Option::is_none")]
    pub gcp_execution_id: Option<String>,
    #[serde(rename = "azure-invocation-id", skip_serializing_if = "Option::is_none")]
    pub azure_invocation_id: Option<String>,
    #[serde(rename = "ali-request-id", skip_serializing_if = "Option::is_none")]
    pub alibaba_request_id: Option<String>,
}

impl ResponseHeader {
    /// Extracts the known request id headers. Lookups are case-insensitive.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        };

        Self {
            aws_request_id: get("aws-request-id"),
            gcp_execution_id: get("function-execution-id"),
            azure_invocation_id: get("azure-invocation-id"),
            alibaba_request_id: get("ali-request-id"),
        }
    }
}

/// One archived benchmark result: the request ids and the JSON body returned by the function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResponse {
    pub header: ResponseHeader,
    pub body: serde_json::Value,
}

/// Errors decoding a benchmark response.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to read response body")]
    Body(#[source] reqwest::Error),
    #[error("response body is not valid JSON")]
    Json(#[source] serde_json::Error),
}

impl BenchmarkResponse {
    /// Reads the full body of `response` and decodes it as JSON.
    pub async fn decode(response: Response) -> Result<Self, DecodeError> {
        let header = ResponseHeader::from_headers(response.headers());
        let bytes = response.bytes().await.map_err(DecodeError::Body)?;
        Self::from_parts(header, &bytes)
    }

    /// Builds a response from already extracted headers and the raw body.
    pub fn from_parts(header: ResponseHeader, body: &[u8]) -> Result<Self, DecodeError> {
        let body = serde_json::from_slice(body).map_err(DecodeError::Json)?;
        Ok(Self { header, body })
    }

    /// Serializes the response as a single JSON line, without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

//! The cloud providers that can host benchmarked functions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A cloud provider hosting serverless functions.
///
/// Each provider expects the function key in a provider-specific request header, see
/// [`Provider::auth_header`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Google Cloud Run functions.
    Gcp,
    /// AWS Lambda behind an API gateway.
    Aws,
    /// Azure Functions.
    Azure,
    /// Alibaba Cloud Function Compute.
    Alibaba,
}

impl Provider {
    /// All supported providers.
    pub const ALL: [Provider; 4] = [
        Provider::Gcp,
        Provider::Aws,
        Provider::Azure,
        Provider::Alibaba,
    ];

    /// The lowercase name used in configuration files, event kinds and archive paths.
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Gcp => "gcp",
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Alibaba => "alibaba",
        }
    }

    /// The request header carrying the function key or bearer token.
    pub fn auth_header(self) -> &'static str {
        match self {
            Provider::Gcp => "Authorization",
            Provider::Aws => "x-api-key",
            Provider::Azure => "x-functions-key",
            Provider::Alibaba => "Authorization",
        }
    }

    /// Whether functions of this provider can be invoked without an auth header.
    pub fn allows_anonymous(self) -> bool {
        matches!(self, Provider::Alibaba)
    }

    /// Regions functions can be deployed to.
    pub fn regions(self) -> &'static [&'static str] {
        match self {
            Provider::Gcp => GCP_REGIONS,
            Provider::Aws => AWS_REGIONS,
            Provider::Azure => AZURE_REGIONS,
            Provider::Alibaba => ALIBABA_REGIONS,
        }
    }

    /// Returns `true` if `region` is a known region of this provider.
    pub fn is_valid_region(self, region: &str) -> bool {
        self.regions().contains(&region)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown provider name.
#[derive(Debug, thiserror::Error)]
#[error("unknown provider `{0}`")]
pub struct UnknownProvider(String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|provider| provider.as_str() == s)
            .ok_or_else(|| UnknownProvider(s.to_owned()))
    }
}

const GCP_REGIONS: &[&str] = &[
    "asia-east1",
    "asia-northeast1",
    "asia-south1",
    "asia-southeast1",
    "australia-southeast1",
    "europe-north1",
    "europe-west1",
    "europe-west2",
    "europe-west3",
    "europe-west4",
    "northamerica-northeast1",
    "southamerica-east1",
    "us-central1",
    "us-east1",
    "us-east4",
    "us-west1",
];

const AWS_REGIONS: &[&str] = &[
    "ap-northeast-1",
    "ap-south-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "ca-central-1",
    "eu-central-1",
    "eu-north-1",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "sa-east-1",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
];

const AZURE_REGIONS: &[&str] = &[
    "australiaeast",
    "brazilsouth",
    "canadacentral",
    "centralindia",
    "centralus",
    "eastasia",
    "eastus",
    "eastus2",
    "francecentral",
    "germanywestcentral",
    "japaneast",
    "northeurope",
    "southeastasia",
    "swedencentral",
    "uksouth",
    "westeurope",
    "westus",
    "westus2",
];

const ALIBABA_REGIONS: &[&str] = &[
    "ap-northeast-1",
    "ap-south-1",
    "ap-southeast-1",
    "ap-southeast-3",
    "ap-southeast-5",
    "cn-beijing",
    "cn-hangzhou",
    "cn-hongkong",
    "cn-shanghai",
    "cn-shenzhen",
    "eu-central-1",
    "eu-west-1",
    "us-east-1",
    "us-west-1",
];

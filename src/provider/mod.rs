//! Upstream provisioners
//!
//! Each reseller integration turns a plan request into a normalized
//! [`PlanDescriptor`]. The orchestrator does not care which reseller backs a
//! plan; it only consumes the descriptor.

pub mod nettify;
pub mod proxiesfo;

pub use nettify::NettifyProvisioner;
pub use proxiesfo::ProxiesFoProvisioner;

use crate::error::ProviderError;
use crate::instance::PlanDescriptor;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Timeout for every reseller HTTP call
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait UpstreamProvisioner: Send + Sync {
    /// Short name for logs, e.g. "proxiesfo"
    fn name(&self) -> &'static str;

    async fn provision_plan(&self, params: &PlanParameters) -> Result<PlanDescriptor, ProviderError>;
}

/// Fields of a plan request, as submitted by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanParameters {
    pub reseller: Option<String>,
    pub plan_type: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Bandwidth in GB
    pub bandwidth: Option<String>,
    pub duration: Option<String>,
    pub threads: Option<String>,
    /// Duration of unlimited plans in hours
    pub hours: Option<String>,
    /// Anything else; forwarded untouched where the reseller accepts a form
    pub extra: BTreeMap<String, String>,
}

impl PlanParameters {
    /// Parse an `application/x-www-form-urlencoded` body. Empty values count as absent
    pub fn from_form(body: &str) -> Result<Self, ProviderError> {
        let mut params = Self::default();

        for pair in body.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(key)?;
            let value = decode_component(value)?;
            params.set(&key, value);
        }

        Ok(params)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let value = if value.is_empty() { None } else { Some(value) };
        match key {
            "reseller" => self.reseller = value,
            "plan_type" => self.plan_type = value,
            "username" => self.username = value,
            "password" => self.password = value,
            "bandwidth" => self.bandwidth = value,
            "duration" => self.duration = value,
            "threads" => self.threads = value,
            "hours" => self.hours = value,
            other => match value {
                Some(v) => {
                    self.extra.insert(other.to_string(), v);
                }
                None => {
                    self.extra.remove(other);
                }
            },
        }
    }
}

fn decode_component(raw: &str) -> Result<String, ProviderError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .map_err(|e| ProviderError::InvalidParameters(format!("bad form encoding: {}", e)))
}

/// Map a reqwest failure to the provider taxonomy
pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> ProviderError {
    if err.is_decode() {
        ProviderError::MalformedResponse(format!("{}: {}", provider, err))
    } else {
        ProviderError::UpstreamUnavailable(format!("{}: {}", provider, err))
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::UpstreamUnavailable(format!("failed to build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_form() {
        let params = PlanParameters::from_form(
            "reseller=residential&bandwidth=2.5&username=john+doe&password=p%40ss&note=hello%20there&threads=",
        )
        .unwrap();

        assert_eq!(params.reseller.as_deref(), Some("residential"));
        assert_eq!(params.bandwidth.as_deref(), Some("2.5"));
        assert_eq!(params.username.as_deref(), Some("john doe"));
        assert_eq!(params.password.as_deref(), Some("p@ss"));
        assert_eq!(params.threads, None);
        assert_eq!(params.extra.get("note").map(String::as_str), Some("hello there"));
    }

    #[test]
    fn test_from_form_empty_body() {
        assert_eq!(PlanParameters::from_form("").unwrap(), PlanParameters::default());
    }

    #[test]
    fn test_set_overrides_and_clears() {
        let mut params = PlanParameters::default();
        params.set("duration", "30");
        params.set("duration", "");
        params.set("country", "de");
        assert_eq!(params.duration, None);
        assert_eq!(params.extra.len(), 1);
    }
}

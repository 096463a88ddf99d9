//! proxies.fo reseller integration
//!
//! One purchase yields a plan served from two regions, `eu` and `usa`, that
//! share credentials and the upstream auth port.

use super::{http_client, transport_error, PlanParameters, UpstreamProvisioner};
use crate::config::ProxiesFoConfig;
use crate::error::ProviderError;
use crate::instance::{PlanDescriptor, RegionClass, RegionDescriptor};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

pub const EU_HOST: &str = "pr-eu.proxies.fo";
pub const USA_HOST: &str = "pr-us.proxies.fo";
pub const EU_PUBLIC_PORT: u16 = 1338;
pub const USA_PUBLIC_PORT: u16 = 1337;

/// Reseller product ids by product name
fn reseller_id(name: &str) -> Option<&'static str> {
    match name {
        "residential" => Some("7c9ea873-63f9-4013-9147-3807cc6f0553"),
        "isp" => Some("3471aa35-7922-488a-a7a9-b92a5510080e"),
        "datacenter" => Some("b3fd0f3c-693d-4ec5-b49f-c77feaab0b72"),
        _ => None,
    }
}

pub struct ProxiesFoProvisioner {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ProxiesFoProvisioner {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: http_client()?,
        })
    }

    /// None when no API key is configured
    pub fn from_config(config: &ProxiesFoConfig) -> Option<Result<Self, ProviderError>> {
        config
            .resolved_api_key()
            .map(|key| Self::new(config.base_url.clone(), key))
    }
}

/// Form sent to `/plans/new`, with the reseller's defaults applied
pub fn build_form(params: &PlanParameters) -> Result<Vec<(String, String)>, ProviderError> {
    let reseller = params.reseller.as_deref().unwrap_or_default();
    let id = reseller_id(reseller).ok_or_else(|| {
        ProviderError::InvalidParameters(format!("invalid reseller type: {:?}", reseller))
    })?;

    let mut form: Vec<(String, String)> = params
        .extra
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    form.push(("reseller".to_string(), id.to_string()));

    if reseller == "datacenter" {
        form.push(("duration".into(), params.duration.clone().unwrap_or_else(|| "1".into())));
        form.push(("threads".into(), params.threads.clone().unwrap_or_else(|| "500".into())));
        if let Some(bw) = &params.bandwidth {
            form.push(("bandwidth".into(), bw.clone()));
        }
    } else {
        // Bandwidth plans always run for 180 days
        form.push(("duration".into(), "180".into()));
        form.push(("bandwidth".into(), params.bandwidth.clone().unwrap_or_else(|| "1".into())));
        if let Some(threads) = &params.threads {
            form.push(("threads".into(), threads.clone()));
        }
    }

    for (key, value) in [
        ("plan_type", &params.plan_type),
        ("username", &params.username),
        ("password", &params.password),
        ("hours", &params.hours),
    ] {
        if let Some(v) = value {
            form.push((key.to_string(), v.clone()));
        }
    }

    Ok(form)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NewPlanResponse {
    success: Option<bool>,
    error: Option<String>,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NewPlanData {
    auth_username: String,
    auth_password: String,
    #[serde(rename = "ID")]
    id: String,
    auth_port: f64,
    ends_date: f64,
}

/// Turn a `/plans/new` response body into a plan descriptor
pub fn parse_new_plan(body: &str) -> Result<PlanDescriptor, ProviderError> {
    let response: NewPlanResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::MalformedResponse(format!("proxies.fo: {}", e)))?;

    let success = response.success.ok_or_else(|| {
        ProviderError::MalformedResponse("proxies.fo: missing 'Success' field".to_string())
    })?;
    if !success {
        let message = response
            .error
            .unwrap_or_else(|| "Unknown error from Proxies.fo API".to_string());
        return Err(ProviderError::InvalidParameters(format!("proxies.fo: {}", message)));
    }

    let data = response.data.ok_or_else(|| {
        ProviderError::MalformedResponse("proxies.fo: 'Data' field missing".to_string())
    })?;
    let data: NewPlanData = serde_json::from_value(data)
        .map_err(|e| ProviderError::MalformedResponse(format!("proxies.fo: bad 'Data': {}", e)))?;

    if !(1.0..=65535.0).contains(&data.auth_port) {
        return Err(ProviderError::MalformedResponse(format!(
            "proxies.fo: AuthPort {} out of range",
            data.auth_port
        )));
    }
    let auth_port = data.auth_port as u16;
    let region = |region_class, host: &str, public_port| RegionDescriptor {
        region_class,
        upstream_host: host.to_string(),
        upstream_port: auth_port,
        upstream_auth_port: auth_port,
        public_port,
    };

    Ok(PlanDescriptor {
        plan_id: data.id,
        username: data.auth_username,
        password: data.auth_password,
        expires_at: data.ends_date as i64,
        regions: vec![
            region(RegionClass::Eu, EU_HOST, EU_PUBLIC_PORT),
            region(RegionClass::Usa, USA_HOST, USA_PUBLIC_PORT),
        ],
    })
}

#[async_trait]
impl UpstreamProvisioner for ProxiesFoProvisioner {
    fn name(&self) -> &'static str {
        "proxiesfo"
    }

    async fn provision_plan(&self, params: &PlanParameters) -> Result<PlanDescriptor, ProviderError> {
        let form = build_form(params)?;
        let url = format!("{}/plans/new", self.base_url);
        debug!(url = %url, reseller = ?params.reseller, "Creating proxies.fo plan");

        let response = self
            .client
            .post(&url)
            .header("X-Api-Auth", &self.api_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error("proxies.fo", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("proxies.fo", e))?;

        if status.is_server_error() {
            warn!(status = status.as_u16(), "proxies.fo returned a server error");
            return Err(ProviderError::UpstreamUnavailable(format!(
                "proxies.fo: HTTP {}",
                status.as_u16()
            )));
        }
        debug!(status = status.as_u16(), body = %body, "proxies.fo response");

        let plan = parse_new_plan(&body)?;
        info!(plan_id = %plan.plan_id, expires_at = plan.expires_at, "proxies.fo plan created");
        Ok(plan)
    }
}

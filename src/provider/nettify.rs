//! Nettify reseller integration
//!
//! A plan lives in exactly one region, chosen by its plan type. The create
//! call does not return the password, so it is read back from the plan
//! details endpoint.

use super::{http_client, transport_error, PlanParameters, UpstreamProvisioner};
use crate::config::NettifyConfig;
use crate::error::ProviderError;
use crate::instance::{unix_now, PlanDescriptor, RegionClass, RegionDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const UPSTREAM_HOST: &str = "proxy.nettify.xyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanType {
    Residential,
    Datacenter,
    Mobile,
    Unlimited,
}

impl PlanType {
    pub fn parse(raw: Option<&str>) -> Result<Self, ProviderError> {
        match raw.unwrap_or("residential") {
            "residential" => Ok(Self::Residential),
            "datacenter" => Ok(Self::Datacenter),
            "mobile" => Ok(Self::Mobile),
            "unlimited" => Ok(Self::Unlimited),
            other => Err(ProviderError::InvalidParameters(format!(
                "unknown nettify plan type: {:?}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Residential => "residential",
            Self::Datacenter => "datacenter",
            Self::Mobile => "mobile",
            Self::Unlimited => "unlimited",
        }
    }

    /// Region, public port and upstream auth port served for this plan type
    pub fn region(&self) -> RegionDescriptor {
        let (region_class, public_port, auth_port) = match self {
            Self::Residential => (RegionClass::Alpha, 9876, 8080),
            Self::Datacenter => (RegionClass::Beta, 8080, 8765),
            Self::Mobile => (RegionClass::Mobile, 8080, 7654),
            Self::Unlimited => (RegionClass::Unlim, 8080, 6543),
        };
        RegionDescriptor {
            region_class,
            upstream_host: UPSTREAM_HOST.to_string(),
            upstream_port: auth_port,
            upstream_auth_port: auth_port,
            public_port,
        }
    }
}

/// JSON body for `POST /plans/create`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatePlanRequest {
    pub username: String,
    pub password: String,
    pub plan_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_hours: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_mb: Option<u64>,
}

/// Validate parameters and build the create request. `now` suffixes the username
pub fn build_request(params: &PlanParameters, now: i64) -> Result<(PlanType, CreatePlanRequest), ProviderError> {
    let plan_type = PlanType::parse(params.plan_type.as_deref())?;

    let password = params
        .password
        .clone()
        .ok_or_else(|| ProviderError::InvalidParameters("password is required".to_string()))?;
    let username = format!("{}_{}", params.username.as_deref().unwrap_or("user"), now);

    let mut request = CreatePlanRequest {
        username,
        password,
        plan_type: plan_type.as_str(),
        duration_hours: None,
        bandwidth_mb: None,
    };

    if plan_type == PlanType::Unlimited {
        let hours = params.hours.as_deref().unwrap_or("1");
        let hours: u32 = hours
            .trim()
            .parse()
            .map_err(|_| ProviderError::InvalidParameters(format!("invalid hours: {:?}", hours)))?;
        request.duration_hours = Some(hours);
    } else {
        let gb = params.bandwidth.as_deref().unwrap_or("1");
        let gb: f64 = gb
            .trim()
            .parse()
            .map_err(|_| ProviderError::InvalidParameters(format!("invalid bandwidth: {:?}", gb)))?;
        if !gb.is_finite() || gb <= 0.0 {
            return Err(ProviderError::InvalidParameters(format!(
                "bandwidth must be positive, got {}",
                gb
            )));
        }
        request.bandwidth_mb = Some((gb * 1024.0) as u64);
    }

    Ok((plan_type, request))
}

#[derive(Debug, Deserialize)]
struct CreatePlanResponse {
    username: Option<String>,
    plan_id: Option<String>,
    message: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PlanDetails {
    password: Option<String>,
}

/// Extract `(plan_id, username)` from a `/plans/create` response
pub fn parse_create_response(status: u16, body: &str) -> Result<(String, String), ProviderError> {
    let parsed: Result<CreatePlanResponse, _> = serde_json::from_str(body);

    if status != 200 {
        let message = parsed
            .ok()
            .and_then(|r| r.message)
            .map(|m| match m {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            });
        let text = match message {
            Some(m) => format!("nettify API error ({}): {}", status, m),
            None => format!("nettify API error: status code {}", status),
        };
        return Err(if status >= 500 {
            ProviderError::UpstreamUnavailable(text)
        } else {
            ProviderError::InvalidParameters(text)
        });
    }

    let response = parsed.map_err(|e| ProviderError::MalformedResponse(format!("nettify: {}", e)))?;
    let username = response.username.ok_or_else(|| {
        ProviderError::MalformedResponse("nettify: username missing in response".to_string())
    })?;
    let plan_id = response.plan_id.ok_or_else(|| {
        ProviderError::MalformedResponse("nettify: plan_id missing in response".to_string())
    })?;
    Ok((plan_id, username))
}

/// Extract the password from a `/plans/<id>` response
pub fn parse_details_response(body: &str) -> Result<String, ProviderError> {
    let details: PlanDetails = serde_json::from_str(body)
        .map_err(|e| ProviderError::MalformedResponse(format!("nettify: {}", e)))?;
    details.password.ok_or_else(|| {
        ProviderError::MalformedResponse("nettify: password missing in plan details".to_string())
    })
}

pub struct NettifyProvisioner {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl NettifyProvisioner {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: http_client()?,
        })
    }

    /// None when no API key is configured
    pub fn from_config(config: &NettifyConfig) -> Option<Result<Self, ProviderError>> {
        config
            .resolved_api_key()
            .map(|key| Self::new(config.base_url.clone(), key))
    }

    async fn fetch_password(&self, plan_id: &str) -> Result<String, ProviderError> {
        let url = format!("{}/plans/{}", self.base_url, urlencoding::encode(plan_id));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| transport_error("nettify", e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error("nettify", e))?;
        if status.is_server_error() {
            return Err(ProviderError::UpstreamUnavailable(format!(
                "nettify: plan details HTTP {}",
                status.as_u16()
            )));
        }
        parse_details_response(&body)
    }
}

#[async_trait]
impl UpstreamProvisioner for NettifyProvisioner {
    fn name(&self) -> &'static str {
        "nettify"
    }

    async fn provision_plan(&self, params: &PlanParameters) -> Result<PlanDescriptor, ProviderError> {
        let (plan_type, request) = build_request(params, unix_now())?;
        let url = format!("{}/plans/create", self.base_url);
        debug!(
            url = %url,
            plan_type = plan_type.as_str(),
            username = %request.username,
            "Creating nettify plan"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("nettify", e))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| transport_error("nettify", e))?;
        debug!(status, body = %body, "nettify response");

        let (plan_id, username) = parse_create_response(status, &body).map_err(|e| {
            warn!(status, error = %e, "nettify rejected plan");
            e
        })?;
        let password = self.fetch_password(&plan_id).await?;

        info!(plan_id = %plan_id, plan_type = plan_type.as_str(), "nettify plan created");
        Ok(PlanDescriptor {
            plan_id,
            username,
            password,
            expires_at: 0,
            regions: vec![plan_type.region()],
        })
    }
}

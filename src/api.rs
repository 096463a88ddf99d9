//! Control API
//!
//! Thin HTTP surface over the orchestrator. Everything except `/health` and
//! `/version` requires the bearer token.

use crate::error::{json_error_response, ApiErrorCode, ErrorResponse};
use crate::instance::Instance;
use crate::orchestrator::Orchestrator;
use crate::provider::{PlanParameters, UpstreamProvisioner};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_ok<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_error_response(ApiErrorCode::InternalError, e.to_string()),
    }
}

/// Journal entry as shown by `GET /proxies`
#[derive(Serialize)]
struct ProxyView<'a> {
    #[serde(flatten)]
    instance: &'a Instance,
    client_endpoint: String,
}

/// Shared request-handling state
pub struct ApiState {
    orchestrator: Arc<Orchestrator>,
    proxiesfo: Option<Arc<dyn UpstreamProvisioner>>,
    nettify: Option<Arc<dyn UpstreamProvisioner>>,
    auth_token: String,
}

pub struct ApiServer {
    bind_addr: SocketAddr,
    state: ApiState,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        orchestrator: Arc<Orchestrator>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            state: ApiState {
                orchestrator,
                proxiesfo: None,
                nettify: None,
                auth_token,
            },
            shutdown_rx,
        }
    }

    pub fn with_proxiesfo(mut self, provisioner: Arc<dyn UpstreamProvisioner>) -> Self {
        self.state.proxiesfo = Some(provisioner);
        self
    }

    pub fn with_nettify(mut self, provisioner: Arc<dyn UpstreamProvisioner>) -> Self {
        self.state.nettify = Some(provisioner);
        self
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Control API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let state = Arc::new(self.state);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %peer, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<ApiState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => {
            return Ok(json_ok(&serde_json::json!({
                "status": "healthy",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })));
        }
        (&Method::GET, "/version") => {
            return Ok(json_ok(&serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            })));
        }
        _ => {}
    }

    if !check_auth(&req, &state.auth_token) {
        warn!(%method, %path, "Unauthorized API request");
        return Ok(json_error_response(
            ApiErrorCode::Unauthorized,
            "missing or invalid bearer token",
        ));
    }

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/plan") => {
            let body = req.collect().await?.to_bytes();
            create_plan(&state, state.proxiesfo.as_deref(), "proxies.fo", &body).await
        }
        (&Method::POST, "/nettify/plan") => {
            let body = req.collect().await?.to_bytes();
            create_plan(&state, state.nettify.as_deref(), "nettify", &body).await
        }
        (&Method::GET, "/proxies") => list_proxies(&state).await,
        (&Method::POST, "/restore") => match state.orchestrator.restore().await {
            Ok(report) => json_ok(&report),
            Err(e) => {
                error!(error = %e, "Restore failed");
                ErrorResponse::from_orchestrator(&e).into_response()
            }
        },
        (&Method::GET, "/ports") => json_ok(&state.orchestrator.usage().await),
        _ => json_error_response(ApiErrorCode::NotFound, format!("no route for {} {}", method, path)),
    };

    Ok(response)
}

async fn create_plan(
    state: &ApiState,
    provisioner: Option<&dyn UpstreamProvisioner>,
    provider_label: &str,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let Some(provisioner) = provisioner else {
        return json_error_response(
            ApiErrorCode::ProviderNotConfigured,
            format!("{} integration is not configured", provider_label),
        );
    };

    let body = match std::str::from_utf8(body) {
        Ok(body) => body,
        Err(_) => return json_error_response(ApiErrorCode::BadRequest, "request body is not UTF-8"),
    };
    let params = match PlanParameters::from_form(body) {
        Ok(params) => params,
        Err(e) => return json_error_response(ApiErrorCode::BadRequest, format!("Invalid form data: {}", e)),
    };

    match state.orchestrator.provision_with(provisioner, &params).await {
        Ok(provisioned) => {
            let proxies: Vec<String> = provisioned.instances.iter().map(Instance::client_url).collect();
            info!(
                provider = provisioner.name(),
                plan_id = %provisioned.plan.plan_id,
                proxies = proxies.len(),
                "Plan provisioned"
            );
            json_ok(&serde_json::json!({
                "success": true,
                "plan_id": provisioned.plan.plan_id,
                "username": provisioned.plan.username,
                "password": provisioned.plan.password,
                "expires_at": provisioned.plan.expires_at,
                "proxies": proxies,
            }))
        }
        Err(e) => {
            warn!(provider = provisioner.name(), error = %e, "Plan provisioning failed");
            ErrorResponse::from_orchestrator(&e).into_response()
        }
    }
}

async fn list_proxies(state: &ApiState) -> Response<Full<Bytes>> {
    match state.orchestrator.instances().await {
        Ok(instances) => {
            let views: Vec<ProxyView<'_>> = instances
                .iter()
                .map(|instance| ProxyView {
                    instance,
                    client_endpoint: instance.client_endpoint(),
                })
                .collect();
            json_ok(&views)
        }
        Err(e) => ErrorResponse::from_orchestrator(&e).into_response(),
    }
}

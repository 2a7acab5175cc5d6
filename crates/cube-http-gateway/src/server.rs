//! HTTP front end.
//!
//! Every path and method lands in one fallback handler:
//!
//! ```text
//! HTTP ──→ AuthLayer ──→ route (URI table or method) ──→ call_method ──→ HttpReply
//!            401             400                          504 / 500
//! ```

use crate::auth::{AuthConfig, AuthLayer, Identity, JwtVerifier};
use crate::error::GatewayError;
use crate::payload::{Body, HttpReply, RequestParams};
use crate::settings::GatewaySettings;
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    Extension, Router,
};
use bytes::Bytes;
use cube_node::Node;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Shared by every request.
#[derive(Clone)]
pub struct GatewayState {
    node: Arc<dyn Node>,
    settings: Arc<GatewaySettings>,
}

/// Router forwarding every request through `node`.
pub fn build_router(node: Arc<dyn Node>, settings: GatewaySettings) -> Router {
    let auth = AuthLayer::new(AuthConfig {
        verifier: (!settings.jwt_secret.is_empty()).then(|| JwtVerifier::new(&settings.jwt_secret)),
        only_authorized: settings.only_authorized_requests,
    });
    let state = GatewayState {
        node,
        settings: Arc::new(settings),
    };

    Router::new()
        .fallback(handle_http)
        .layer(auth)
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` fires or its sender drops.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = shutdown.await;
    })
    .await
}

async fn handle_http(
    State(state): State<GatewayState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    identity: Option<Extension<Identity>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let remote_addr = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let identity = identity.map(|Extension(identity)| identity);

    match forward(&state, identity, remote_addr, method, uri, headers, body).await {
        Ok(response) => response,
        Err(e) => {
            warn!(status = e.status().as_u16(), error = %e, "Request failed");
            e.into_response()
        }
    }
}

async fn forward(
    state: &GatewayState,
    identity: Option<Identity>,
    remote_addr: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let settings = &state.settings;
    let request_uri = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());

    if settings.dev {
        debug!(
            method = %method,
            uri = %uri,
            headers = ?headers,
            body = %String::from_utf8_lossy(&body),
            "Received request"
        );
    }

    let channel = settings.route(method.as_str(), &request_uri)?;

    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(ToString::to_string))
        .unwrap_or_default();

    let request = RequestParams {
        input_time: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        method: method.to_string(),
        host,
        remote_addr,
        request_uri,
        body: Body::from_bytes(&body),
        user_id: None,
        device_id: None,
        headers: RequestParams::collect_headers(&headers),
    }
    .with_identity(identity.as_ref())
    .into_request()?;

    if settings.dev {
        debug!(
            channel = %channel,
            request = %serde_json::to_string(&request).unwrap_or_default(),
            "Routing request"
        );
    }

    let response = state
        .node
        .call_method(&channel, request, settings.timeout)
        .await?;
    let reply = HttpReply::from_response(response)?;

    if settings.dev {
        debug!(status = reply.status, body = ?reply.body, "Reply");
    }

    let status = reply.status_code()?;
    Ok(match reply.body {
        Some(body) => (status, body.into_bytes()).into_response(),
        None => status.into_response(),
    })
}

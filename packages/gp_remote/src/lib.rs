// Library interface for gp_remote
// Exposes the HTTP surface over the VPN supervisor for embedding in other applications

pub mod config;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use vpn_supervisor::{ConnectOutcome, Credentials, Supervisor};

/// Prefix of the `/connect` body when a browser login is required
pub const SAML_URL_PREFIX: &str = "SAML-URL:";

const INVALID_INFORMATION: &str = "Missing or invalid information";

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/health", get(health))
        .with_state(state)
}

/// Body of `POST /connect`
#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub saml: Option<String>,
    #[serde(default, rename = "gw")]
    pub gateway: String,
    #[serde(default, rename = "gwdom")]
    pub gateway_domain: String,
    #[serde(default, rename = "oc-addtl-args")]
    pub extra_args: Option<Vec<String>>,
}

impl From<ConnectRequest> for Credentials {
    fn from(req: ConnectRequest) -> Self {
        Credentials {
            user: req.user,
            password: req.password,
            saml_cookie: req.saml,
            gateway: req.gateway,
            gateway_domain: req.gateway_domain,
            extra_args: req.extra_args.unwrap_or_default(),
        }
    }
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn get_status(State(state): State<AppState>) -> Response {
    let status = state.supervisor.status().await;
    (StatusCode::OK, status.to_string()).into_response()
}

async fn connect(
    State(state): State<AppState>,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Response {
    let credentials: Credentials = match payload {
        Ok(Json(req)) => req.into(),
        Err(rejection) => {
            warn!("connect: Unreadable request body: {}", rejection);
            return (StatusCode::BAD_REQUEST, INVALID_INFORMATION).into_response();
        }
    };

    match state.supervisor.connect(&credentials).await {
        Ok(ConnectOutcome::SamlChallenge { url }) => {
            (StatusCode::OK, format!("{}{}", SAML_URL_PREFIX, url)).into_response()
        }
        Ok(ConnectOutcome::Connected) => (StatusCode::OK, "connected").into_response(),
        Ok(ConnectOutcome::Disconnected) => (StatusCode::OK, "disconnected").into_response(),
        Ok(ConnectOutcome::Failed { reason }) => {
            info!("connect: Client reported failure: {}", reason);
            (StatusCode::BAD_GATEWAY, reason).into_response()
        }
        Err(e) if e.is_invalid_input() => {
            warn!("connect: {}", e);
            (StatusCode::BAD_REQUEST, INVALID_INFORMATION).into_response()
        }
        Err(e) => {
            warn!("connect: {}", e);
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

async fn disconnect(State(state): State<AppState>) -> Response {
    let status = state.supervisor.disconnect().await;
    (StatusCode::OK, status.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::path::PathBuf;
    use std::time::Duration;
    use tower::ServiceExt;
    use vpn_supervisor::ClientCommand;

    fn test_router(command: ClientCommand) -> Router {
        create_router(AppState {
            supervisor: Arc::new(Supervisor::new(command)),
        })
    }

    fn scripted(script: &str) -> ClientCommand {
        ClientCommand {
            program: PathBuf::from("/bin/sh"),
            leading_args: vec!["-c".into(), script.into(), "openconnect".into()],
            terminate_grace: Some(Duration::from_secs(5)),
        }
    }

    async fn body_string(resp: Response) -> String {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn saml_body() -> serde_json::Value {
        serde_json::json!({
            "user": "alice",
            "saml": "prelogin-cookie",
            "gw": "gw-group",
            "gwdom": "vpn.example.com",
        })
    }

    #[tokio::test]
    async fn test_status_starts_disconnected() {
        let app = test_router(ClientCommand::default());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "disconnected");
    }

    #[tokio::test]
    async fn test_disconnect_without_client() {
        let app = test_router(ClientCommand::default());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/disconnect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "disconnected");
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_router(ClientCommand::default());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "ok");
    }

    #[tokio::test]
    async fn test_connect_malformed_json() {
        let app = test_router(ClientCommand::default());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/connect")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(resp).await, INVALID_INFORMATION);
    }

    #[tokio::test]
    async fn test_connect_both_secrets_rejected() {
        let app = test_router(ClientCommand::default());
        let mut body = saml_body();
        body["password"] = serde_json::json!("hunter2");
        let resp = app.oneshot(post_json("/connect", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(resp).await, INVALID_INFORMATION);
    }

    #[tokio::test]
    async fn test_connect_missing_fields_rejected() {
        let app = test_router(ClientCommand::default());
        let body = serde_json::json!({ "user": "alice", "password": "hunter2" });
        let resp = app.oneshot(post_json("/connect", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_connect_launch_failure() {
        let app = test_router(ClientCommand {
            program: PathBuf::from("/nonexistent/openconnect"),
            ..Default::default()
        });
        let resp = app.oneshot(post_json("/connect", saml_body())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(resp).await.contains("/nonexistent/openconnect"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_returns_saml_url() {
        let app = test_router(scripted(
            "echo 'SAML REDIRECT 1 https://idp.example/login'; exec sleep 30",
        ));

        let resp = app
            .clone()
            .oneshot(post_json("/connect", saml_body()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_string(resp).await,
            "SAML-URL:https://idp.example/login"
        );

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/disconnect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_string(resp).await, "disconnected");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_then_status_connected() {
        let app = test_router(scripted(
            "echo 'ESP session established with server'; while :; do sleep 0.1; done",
        ));
        let mut body = saml_body();
        body["oc-addtl-args"] = serde_json::json!(["--os=linux-64"]);

        let resp = app
            .clone()
            .oneshot(post_json("/connect", body))
            .await
            .unwrap();
        assert_eq!(body_string(resp).await, "connected");

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_string(resp).await, "connected");

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/disconnect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_string(resp).await, "disconnected");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_reports_client_failure() {
        let app = test_router(scripted(
            "echo 'Failed to complete authentication' >&2; sleep 0.5; exit 1",
        ));
        let resp = app.oneshot(post_json("/connect", saml_body())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            body_string(resp).await,
            "Failed to complete authentication"
        );
    }

    #[test]
    fn test_connect_request_field_names() {
        let req: ConnectRequest = serde_json::from_value(serde_json::json!({
            "user": "alice",
            "password": null,
            "saml": "cookie",
            "gw": "gw-group",
            "gwdom": "vpn.example.com",
            "oc-addtl-args": ["-v"],
        }))
        .unwrap();
        let creds: Credentials = req.into();
        assert_eq!(creds.user, "alice");
        assert!(creds.password.is_none());
        assert_eq!(creds.saml_cookie.as_deref(), Some("cookie"));
        assert_eq!(creds.gateway, "gw-group");
        assert_eq!(creds.gateway_domain, "vpn.example.com");
        assert_eq!(creds.extra_args, vec!["-v"]);
    }
}

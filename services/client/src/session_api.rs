//! Client for the backend's session-creation endpoint.
//!
//! `POST {base}{prefix}/sesion` with `{"usuario_id": ...}` answers
//! `{"id_sesion": ..., "url_websocket": ...}`. The transport endpoint is derived
//! from the backend base URL, so the WebSocket always targets the same host.

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use voz_core::SessionHandle;

use crate::error::SessionCreationFault;

#[derive(Serialize, Debug)]
pub struct CreateSessionRequest {
    pub usuario_id: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionResponse {
    pub id_sesion: String,
    pub url_websocket: String,
}

/// Obtains a session handle from the backend. No retries: a failure ends the attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionCreator: Send + Sync {
    async fn create_session(
        &self,
        user_id: Option<String>,
    ) -> Result<SessionHandle, SessionCreationFault>;
}

pub struct HttpSessionCreator {
    client: reqwest::Client,
    base_url: Url,
    api_prefix: String,
}

impl HttpSessionCreator {
    pub fn new(base_url: &str, api_prefix: &str) -> Result<Self, SessionCreationFault> {
        let base_url =
            Url::parse(base_url).map_err(|_| SessionCreationFault::InvalidUrl(base_url.into()))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(SessionCreationFault::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            api_prefix: api_prefix.trim_end_matches('/').to_string(),
        })
    }

    pub fn session_url(&self) -> Url {
        with_path(&self.base_url, &format!("{}/sesion", self.api_prefix))
    }
}

#[async_trait]
impl SessionCreator for HttpSessionCreator {
    #[instrument(skip(self), fields(url = %self.session_url()))]
    async fn create_session(
        &self,
        user_id: Option<String>,
    ) -> Result<SessionHandle, SessionCreationFault> {
        let response = self
            .client
            .post(self.session_url())
            .json(&CreateSessionRequest {
                usuario_id: user_id,
            })
            .send()
            .await
            .map_err(SessionCreationFault::Request)?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "Session creation rejected");
            return Err(SessionCreationFault::Status(status));
        }

        let body: CreateSessionResponse = response
            .json()
            .await
            .map_err(SessionCreationFault::InvalidResponse)?;
        debug!(?body, "Session created");

        let endpoint = transport_endpoint(
            &self.base_url,
            &self.api_prefix,
            &body.url_websocket,
            &body.id_sesion,
        )?;
        info!(session_id = %body.id_sesion, %endpoint, "Obtained session handle");
        Ok(SessionHandle {
            session_id: body.id_sesion,
            transport_endpoint: endpoint.to_string(),
        })
    }
}

/// Builds `{ws base}{prefix}{url_websocket}?id_sesion={id}`.
///
/// An absolute `ws://` or `wss://` URL from the backend is used as-is apart from the query.
pub fn transport_endpoint(
    base_url: &Url,
    api_prefix: &str,
    url_websocket: &str,
    session_id: &str,
) -> Result<Url, SessionCreationFault> {
    let mut endpoint = if url_websocket.starts_with("ws://") || url_websocket.starts_with("wss://")
    {
        Url::parse(url_websocket)
            .map_err(|_| SessionCreationFault::InvalidUrl(url_websocket.to_string()))?
    } else {
        let path = if url_websocket.starts_with('/') {
            format!("{}{}", api_prefix.trim_end_matches('/'), url_websocket)
        } else {
            format!("{}/{}", api_prefix.trim_end_matches('/'), url_websocket)
        };
        let mut endpoint = with_path(base_url, &path);
        let scheme = match base_url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        endpoint
            .set_scheme(scheme)
            .map_err(|_| SessionCreationFault::InvalidUrl(base_url.to_string()))?;
        endpoint
    };
    endpoint
        .query_pairs_mut()
        .clear()
        .append_pair("id_sesion", session_id);
    Ok(endpoint)
}

fn with_path(base_url: &Url, path: &str) -> Url {
    let mut url = base_url.clone();
    let joined = format!("{}{}", base_url.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url.set_query(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    fn base(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn test_transport_endpoint_from_relative_path() {
        let endpoint =
            transport_endpoint(&base("http://localhost:8000"), "/api", "/voz/abc", "abc").unwrap();
        assert_eq!(
            endpoint.as_str(),
            "ws://localhost:8000/api/voz/abc?id_sesion=abc"
        );
    }

    #[test]
    fn test_transport_endpoint_secure_and_unprefixed() {
        let endpoint =
            transport_endpoint(&base("https://voz.example.com/"), "/api/", "voz", "s 1").unwrap();
        assert_eq!(
            endpoint.as_str(),
            "wss://voz.example.com/api/voz?id_sesion=s+1"
        );

        let endpoint = transport_endpoint(&base("http://host:81/app"), "", "/voz", "x").unwrap();
        assert_eq!(endpoint.as_str(), "ws://host:81/app/voz?id_sesion=x");
    }

    #[test]
    fn test_transport_endpoint_absolute_url() {
        let endpoint = transport_endpoint(
            &base("http://localhost:8000"),
            "/api",
            "wss://media.example.com/voz?old=1",
            "abc",
        )
        .unwrap();
        assert_eq!(
            endpoint.as_str(),
            "wss://media.example.com/voz?id_sesion=abc"
        );
    }

    #[test]
    fn test_creator_rejects_bad_base_url() {
        assert!(matches!(
            HttpSessionCreator::new("not a url", "/api"),
            Err(SessionCreationFault::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpSessionCreator::new("ftp://host", "/api"),
            Err(SessionCreationFault::InvalidUrl(_))
        ));
        let creator = HttpSessionCreator::new("http://localhost:8000", "/api").unwrap();
        assert_eq!(
            creator.session_url().as_str(),
            "http://localhost:8000/api/sesion"
        );
    }

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_create_session_success() {
        let app = Router::new().route(
            "/api/sesion",
            post(|Json(body): Json<Value>| async move {
                let user = body["usuario_id"].as_str().unwrap_or("anon").to_string();
                Json(json!({ "id_sesion": user, "url_websocket": "/voz" }))
            }),
        );
        let base_url = serve(app).await;
        let creator = HttpSessionCreator::new(&base_url, "/api").unwrap();

        let handle = creator
            .create_session(Some("abc".to_string()))
            .await
            .unwrap();
        assert_eq!(handle.session_id, "abc");
        let expected = format!(
            "{}/api/voz?id_sesion=abc",
            base_url.replacen("http", "ws", 1)
        );
        assert_eq!(handle.transport_endpoint, expected);

        let handle = creator.create_session(None).await.unwrap();
        assert_eq!(handle.session_id, "anon");
    }

    #[tokio::test]
    async fn test_create_session_non_2xx_is_fault() {
        let app = Router::new().route(
            "/api/sesion",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let base_url = serve(app).await;
        let creator = HttpSessionCreator::new(&base_url, "/api").unwrap();

        let err = creator.create_session(None).await.unwrap_err();
        assert!(matches!(
            err,
            SessionCreationFault::Status(status) if status == StatusCode::SERVICE_UNAVAILABLE
        ));
    }

    #[tokio::test]
    async fn test_create_session_invalid_body_is_fault() {
        let app = Router::new().route(
            "/api/sesion",
            post(|| async { Json(json!({ "id": "abc" })) }),
        );
        let base_url = serve(app).await;
        let creator = HttpSessionCreator::new(&base_url, "/api").unwrap();

        let err = creator.create_session(None).await.unwrap_err();
        assert!(matches!(err, SessionCreationFault::InvalidResponse(_)));
    }
}

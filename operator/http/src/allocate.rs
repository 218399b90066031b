//! The allocation handler.
//!
//! Allocation assigns a `StandingBy` game server of the requested build to a game session by
//! moving it to the `Active` state. Candidate selection is served entirely from the object cache's
//! field indexes; only the final state transition reaches the Kubernetes API.

use crate::Body;
use bytes::Bytes;
use futures::future;
use gameserver_operator_k8s_api::{
    self as k8s, GameServer, GameServerHealth, GameServerState, PortDetails, ResourceExt,
};
use gameserver_operator_k8s_index::{fields, IndexError, SharedCache};
use http::{header, Request, Response, StatusCode};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    fmt,
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// An allocation request, as posted by game clients' matchmakers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AllocateRequest {
    #[serde(rename = "buildID")]
    pub build_id: String,

    #[serde(rename = "sessionID")]
    pub session_id: String,

    #[serde(rename = "sessionCookie", default)]
    pub session_cookie: Option<String>,

    #[serde(rename = "initialPlayers", default)]
    pub initial_players: Vec<String>,
}

/// Describes how to reach an allocated game server.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Allocation {
    #[serde(rename = "IPV4Address")]
    pub ipv4_address: String,

    #[serde(rename = "Ports")]
    pub ports: Vec<PortDetails>,

    #[serde(rename = "SessionID")]
    pub session_id: String,

    #[serde(rename = "GameServerName")]
    pub game_server_name: String,
}

/// Transitions a game server to the `Active` state for a session.
#[async_trait::async_trait]
pub trait ActivateGameServer: Clone + Send + Sync + 'static {
    /// Activates `gs` for the requested session, returning the updated resource.
    ///
    /// Must fail with [`ActivateError::Conflict`] if `gs` was modified since it was cached.
    async fn activate(
        &self,
        gs: &GameServer,
        req: &AllocateRequest,
    ) -> Result<GameServer, ActivateError>;
}

#[derive(Debug, Error)]
pub enum ActivateError {
    #[error("game server was modified concurrently")]
    Conflict,

    #[error("failed to update game server status: {0}")]
    Kube(#[from] kube::Error),
}

/// Activates game servers by patching their status subresource.
#[derive(Clone)]
pub struct KubeActivator {
    client: k8s::Client,
}

/// Serves allocation requests.
#[derive(Clone)]
pub struct Allocate<A> {
    cache: SharedCache,
    activator: A,
}

#[derive(Debug, Error)]
enum InvalidRequest {
    #[error("invalid request body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid {field}: {value:?} is not a UUID")]
    NotUuid { field: &'static str, value: String },
}

// === impl AllocateRequest ===

impl AllocateRequest {
    fn parse(body: &[u8]) -> Result<Self, InvalidRequest> {
        let req = serde_json::from_slice::<Self>(body)?;
        for (field, value) in [("buildID", &req.build_id), ("sessionID", &req.session_id)] {
            if uuid::Uuid::parse_str(value).is_err() {
                return Err(InvalidRequest::NotUuid {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(req)
    }
}

// === impl Allocation ===

impl Allocation {
    fn from_game_server(gs: &GameServer, session_id: &str) -> Self {
        let status = gs.status.clone().unwrap_or_default();
        Self {
            ipv4_address: status.public_ip.unwrap_or_default(),
            ports: gs.port_details(),
            session_id: session_id.to_string(),
            game_server_name: gs.name_unchecked(),
        }
    }
}

// === impl KubeActivator ===

impl KubeActivator {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }
}

impl fmt::Debug for KubeActivator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeActivator").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ActivateGameServer for KubeActivator {
    async fn activate(
        &self,
        gs: &GameServer,
        req: &AllocateRequest,
    ) -> Result<GameServer, ActivateError> {
        let namespace = gs.namespace().unwrap_or_default();
        let api = k8s::Api::<GameServer>::namespaced(self.client.clone(), &namespace);

        // The resource version makes the API server reject the patch if the game server changed
        // since it was cached, e.g. because a concurrent request allocated it.
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": gs.resource_version(),
            },
            "status": {
                "state": GameServerState::Active,
                "sessionID": req.session_id,
                "sessionCookie": req.session_cookie,
                "initialPlayers": req.initial_players,
            },
        });
        match api
            .patch_status(
                &gs.name_unchecked(),
                &k8s::PatchParams::default(),
                &k8s::Patch::Merge(patch),
            )
            .await
        {
            Ok(gs) => Ok(gs),
            Err(kube::Error::Api(error)) if error.code == 409 => Err(ActivateError::Conflict),
            Err(error) => Err(error.into()),
        }
    }
}

// === impl Allocate ===

impl<A> Allocate<A> {
    pub fn new(cache: SharedCache, activator: A) -> Self {
        Self { cache, activator }
    }
}

impl<A: ActivateGameServer> Allocate<A> {
    async fn allocate(self, body: Bytes) -> Response<Body> {
        let req = match AllocateRequest::parse(&body) {
            Ok(req) => req,
            Err(error) => {
                debug!(%error, "Rejecting allocation request");
                return text_response(StatusCode::BAD_REQUEST, error.to_string());
            }
        };

        let candidates = match self.candidates(&req) {
            Ok(Candidates::Allocated(gs)) => {
                debug!(session = %req.session_id, gs = %gs.name_unchecked(), "Session is already allocated");
                return json_response(&Allocation::from_game_server(&gs, &req.session_id));
            }
            Ok(Candidates::UnknownBuild) => {
                return text_response(
                    StatusCode::NOT_FOUND,
                    format!("build {} not found", req.build_id),
                );
            }
            Ok(Candidates::StandingBy(candidates)) => candidates,
            Err(error) => {
                warn!(%error, "Failed to look up game servers");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string());
            }
        };

        for gs in candidates {
            match self.activator.activate(&gs, &req).await {
                Ok(gs) => {
                    info!(
                        session = %req.session_id,
                        build = %req.build_id,
                        namespace = %gs.namespace().unwrap_or_default(),
                        gs = %gs.name_unchecked(),
                        "Allocated game server",
                    );
                    return json_response(&Allocation::from_game_server(&gs, &req.session_id));
                }
                Err(ActivateError::Conflict) => {
                    debug!(gs = %gs.name_unchecked(), "Game server changed, trying the next one");
                }
                Err(error) => {
                    warn!(gs = %gs.name_unchecked(), %error, "Failed to allocate game server");
                    return text_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string());
                }
            }
        }

        text_response(
            StatusCode::TOO_MANY_REQUESTS,
            format!("no standing-by game servers for build {}", req.build_id),
        )
    }

    /// Resolves the request against the cache. The cache lock is released before any
    /// game server is activated.
    fn candidates(&self, req: &AllocateRequest) -> Result<Candidates, IndexError> {
        let cache = self.cache.read();
        let game_servers = cache.game_servers();

        if let Some(gs) = game_servers
            .list_by(fields::GAME_SERVER_SESSION_ID, &req.session_id)?
            .into_iter()
            .next()
        {
            return Ok(Candidates::Allocated(gs));
        }

        let Some(build) = cache
            .builds()
            .list_by(fields::GAME_SERVER_BUILD_ID, &req.build_id)?
            .into_iter()
            .next()
        else {
            return Ok(Candidates::UnknownBuild);
        };
        let namespace = build.namespace().unwrap_or_default();

        let standing_by = game_servers
            .list_by_in(
                &namespace,
                fields::GAME_SERVER_STATE,
                GameServerState::StandingBy.as_str(),
            )?
            .into_iter()
            .filter(|gs| gs.health() != Some(GameServerHealth::Unhealthy))
            .filter(|gs| {
                gs.labels_map().get(k8s::LABEL_BUILD_ID).map(String::as_str)
                    == Some(req.build_id.as_str())
            })
            .collect();
        Ok(Candidates::StandingBy(standing_by))
    }
}

enum Candidates {
    Allocated(Arc<GameServer>),
    UnknownBuild,
    StandingBy(Vec<Arc<GameServer>>),
}

impl<A, B> tower::Service<Request<B>> for Allocate<A>
where
    A: ActivateGameServer,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: fmt::Display,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let allocate = self.clone();
        Box::pin(async move {
            let body = match req.into_body().collect().await {
                Ok(body) => body.to_bytes(),
                Err(error) => {
                    debug!(%error, "Failed to read request body");
                    return Ok(text_response(
                        StatusCode::BAD_REQUEST,
                        format!("failed to read request body: {error}"),
                    ));
                }
            };
            Ok(allocate.allocate(body).await)
        })
    }
}

fn json_response<T: Serialize>(body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(json) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json))
            .expect("allocation response must be valid"),
        Err(error) => text_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

fn text_response(status: StatusCode, msg: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(msg))
        .expect("text response must be valid")
}

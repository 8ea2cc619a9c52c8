use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use beacon_core::cluster::Announcement;
use beacon_core::config::ConnectorConfig;

use super::announcements::{AnnouncementRegistry, Registration};
use super::transport::CONNECTOR_PATH;
use crate::cluster::ClusterViewService;

/// Inbound half of the connector protocol.
pub struct ConnectorServer {
    views: Arc<ClusterViewService>,
    announcements: Arc<AnnouncementRegistry>,
    config: ConnectorConfig,
    server_info: Option<String>,
}

/// Outcome of one inbound ping.
#[derive(Debug, Clone, PartialEq)]
pub enum PingReply {
    Accepted(Announcement),
    Loop(Announcement),
    BadRequest(String),
    Unavailable(String),
}

impl ConnectorServer {
    /// Create the inbound side of the connector protocol.
    pub fn new(
        views: Arc<ClusterViewService>,
        announcements: Arc<AnnouncementRegistry>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            views,
            announcements,
            config,
            server_info: None,
        }
    }

    /// Server info sent with every reply.
    pub fn with_server_info(mut self, info: impl Into<String>) -> Self {
        self.server_info = Some(info.into());
        self
    }

    /// Register an incoming announcement and build our answer.
    pub async fn handle_ping(&self, sender_id: &str, body: &str) -> PingReply {
        let mut incoming = match Announcement::from_json(body) {
            Ok(a) => a,
            Err(e) => return PingReply::BadRequest(e.to_string()),
        };
        if incoming.owner_id != sender_id {
            return PingReply::BadRequest(format!(
                "owner {} does not match path {}",
                incoming.owner_id, sender_id
            ));
        }

        let me = self.views.sling_id().to_string();
        let local_view = match self.views.local_cluster_view().await {
            Ok(view) => view,
            Err(e) => return PingReply::Unavailable(e.to_string()),
        };

        if local_view.contains(&incoming.owner_id) {
            tracing::debug!(sender = %sender_id, "Ping from within the local cluster");
            return PingReply::Loop(Announcement::loop_response(me));
        }

        let reset_backoff = incoming.reset_backoff;
        incoming.inherited = false;
        match self.announcements.register_announcement(incoming).await {
            Ok(Registration::Registered | Registration::Refreshed) => {}
            Ok(Registration::AlreadyAttached) => {
                return PingReply::Loop(Announcement::loop_response(me));
            }
            Ok(Registration::Invalid) => {
                return PingReply::BadRequest("invalid announcement".to_string());
            }
            Err(e) => {
                tracing::warn!(sender = %sender_id, "Failed to register announcement: {}", e);
                return PingReply::Unavailable(e.to_string());
            }
        }

        let mut reply = Announcement::new(me)
            .with_cluster_view(local_view.clone())
            .with_ttl(self.config.announcement_ttl_secs);
        reply.server_info = self.server_info.clone();
        if self.config.server_backoff_secs > 0 && !reset_backoff {
            reply.backoff_interval_secs = Some(self.config.server_backoff_secs);
        }
        if let Err(e) = self
            .announcements
            .add_all_except(&mut reply, &local_view, Some(sender_id))
            .await
        {
            tracing::warn!(sender = %sender_id, "Failed to collect announcements for reply: {}", e);
        }

        PingReply::Accepted(reply)
    }
}

impl IntoResponse for PingReply {
    fn into_response(self) -> Response {
        match self {
            PingReply::Accepted(reply) | PingReply::Loop(reply) => {
                (StatusCode::OK, Json(reply)).into_response()
            }
            PingReply::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            PingReply::Unavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, message).into_response()
            }
        }
    }
}

/// Router serving `POST /beacon/connector/{sling_id}`.
pub fn connector_router(server: Arc<ConnectorServer>) -> Router {
    Router::new()
        .route(&format!("{}/{{sling_id}}", CONNECTOR_PATH), post(connector_handler))
        .with_state(server)
        .layer(TraceLayer::new_for_http())
}

async fn connector_handler(
    State(server): State<Arc<ConnectorServer>>,
    Path(sling_id): Path<String>,
    body: String,
) -> PingReply {
    server.handle_ping(&sling_id, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DiscoveryPaths, HeartbeatStore, VotingHandler};
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use beacon_core::cluster::{ClusterView, InstanceDescription};
    use beacon_core::config::TieBreak;
    use beacon_core::time::ManualClock;
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn server(config: ConnectorConfig) -> (Arc<ConnectorServer>, Arc<AnnouncementRegistry>) {
        server_with_view(config, true).await
    }

    /// A server for instance "me"; with `established` unset no vote ever
    /// ran, so its local cluster view stays undefined.
    async fn server_with_view(
        config: ConnectorConfig,
        established: bool,
    ) -> (Arc<ConnectorServer>, Arc<AnnouncementRegistry>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let paths = DiscoveryPaths::new("/discovery");
        let heartbeats = Arc::new(HeartbeatStore::new(
            store.clone(),
            paths.clone(),
            clock.clone(),
            "me",
            Duration::from_secs(15),
        ));
        heartbeats.write_heartbeat(&[], &BTreeMap::new()).await.unwrap();
        if established {
            let live: BTreeSet<String> = ["me".to_string()].into_iter().collect();
            VotingHandler::new(
                store.clone(),
                paths.clone(),
                clock.clone(),
                "me",
                TieBreak::Lexicographic,
                Duration::from_secs(60),
            )
            .analyze_votings(&live)
            .await
            .unwrap();
        }

        let views = Arc::new(ClusterViewService::new(heartbeats, store.clone(), paths.clone()));
        let announcements = Arc::new(AnnouncementRegistry::new(store, paths, clock, "me", 30));
        let server = Arc::new(ConnectorServer::new(views, announcements.clone(), config));
        (server, announcements)
    }

    fn remote(owner: &str) -> Announcement {
        Announcement::new(owner).with_cluster_view(ClusterView::new(
            "remote",
            vec![InstanceDescription::new(owner).with_leader(true)],
        ))
    }

    async fn post_json(router: Router, sling_id: &str, body: String) -> (StatusCode, String) {
        let request = Request::builder()
            .method("POST")
            .uri(format!("{}/{}", CONNECTOR_PATH, sling_id))
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_ping_registers_and_answers() {
        let (server, announcements) = server(ConnectorConfig {
            server_backoff_secs: 20,
            ..Default::default()
        })
        .await;
        let router = connector_router(server);

        let (status, body) = post_json(router, "r1", remote("r1").to_json().unwrap()).await;
        assert_eq!(status, StatusCode::OK);

        let reply = Announcement::from_json(&body).unwrap();
        assert_eq!(reply.owner_id, "me");
        assert!(!reply.loop_detected);
        assert_eq!(reply.backoff_interval_secs, Some(20));
        assert!(reply.topology_announcements.is_empty());

        assert!(announcements.has_active_announcement("r1").await);
    }

    #[tokio::test]
    async fn test_owner_mismatch_is_bad_request() {
        let (server, _) = server(ConnectorConfig::default()).await;
        let (status, _) = post_json(
            connector_router(server),
            "other",
            remote("r1").to_json().unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_garbage_body_is_bad_request() {
        let (server, _) = server(ConnectorConfig::default()).await;
        let (status, _) = post_json(connector_router(server), "r1", "{not json".into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ping_from_self_is_loop() {
        let (server, _) = server(ConnectorConfig::default()).await;
        let reply = server
            .handle_ping("me", &remote("me").to_json().unwrap())
            .await;
        match reply {
            PingReply::Loop(a) => {
                assert!(a.loop_detected);
                assert_eq!(a.owner_id, "me");
            }
            other => panic!("expected loop, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_backoff_honored() {
        let (server, _) = server(ConnectorConfig {
            server_backoff_secs: 20,
            ..Default::default()
        })
        .await;
        let mut incoming = remote("r1");
        incoming.reset_backoff = true;
        let PingReply::Accepted(reply) = server
            .handle_ping("r1", &incoming.to_json().unwrap())
            .await
        else {
            panic!("expected accepted reply");
        };
        assert_eq!(reply.backoff_interval_secs, None);
    }

    #[tokio::test]
    async fn test_undefined_view_is_unavailable() {
        let (server, announcements) = server_with_view(ConnectorConfig::default(), false).await;
        let (status, _) = post_json(
            connector_router(server),
            "r1",
            remote("r1").to_json().unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!announcements.has_active_announcement("r1").await);
    }

    #[tokio::test]
    async fn test_oversized_ttl_is_bad_request() {
        let (server, announcements) = server(ConnectorConfig::default()).await;
        let incoming = remote("r1").with_ttl(10_000_000_000_000_000);
        let (status, _) = post_json(
            connector_router(server),
            "r1",
            incoming.to_json().unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(announcements.list_local_announcements().await.is_empty());
    }
}

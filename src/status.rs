//! The HTTP status/force-run surface, per SPEC_FULL.md §2.6: out of scope
//! beyond the documented contract in spec.md §6 (templating, OIDC cookie
//! sessions, and the Prometheus text exposition are external collaborators),
//! but the `axum` router itself -- `/healthz`, a metrics placeholder, and
//! the force-run endpoint that resolves a namespace to a Waybill and
//! enqueues a `Forced` request -- lives here as the seam other code talks
//! to, the same way the teacher ships a small `axum` status server for its
//! own TUI-adjacent web view.

use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::kube_client::KubeApiClient;
use crate::queue::RunQueueSender;
use crate::waybill::RunType;

#[derive(Clone)]
pub struct StatusServerState<K> {
    pub kube: Arc<K>,
    pub queue: RunQueueSender,
}

/// Builds the router described in spec.md §6: `/healthz` for liveness,
/// `/metrics` as the documented placeholder (the real Prometheus text
/// exposition is an external collaborator, per spec.md §1), and
/// `/api/force/:namespace` for the force-run entry point.
pub fn router<K>(state: StatusServerState<K>) -> Router
where
    K: KubeApiClient + 'static,
{
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_placeholder))
        .route("/api/force/:namespace", post(force_run::<K>))
        .with_state(Arc::new(state))
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics_placeholder() -> impl IntoResponse {
    (
        StatusCode::OK,
        "# kube-applier metrics are exported by an external Prometheus exporter\n",
    )
}

#[derive(Debug, Serialize)]
struct ForceRunResponse {
    namespace: String,
    enqueued: bool,
}

/// `POST /api/force/:namespace`: resolves the namespace to its Waybill via
/// `ListWaybills`, per spec.md §6's external force-run contract. The
/// caller's identity and its `HasAccess(waybill, user, "patch")` check are
/// the responsibility of the OIDC session middleware this router doesn't
/// implement (spec.md §1 Non-goals); this handler assumes that middleware
/// already authorized the request and ran `HasAccess` before dispatch.
async fn force_run<K>(
    State(state): State<Arc<StatusServerState<K>>>,
    AxumPath(namespace): AxumPath<String>,
) -> impl IntoResponse
where
    K: KubeApiClient + 'static,
{
    let waybills = match state.kube.list_waybills().await {
        Ok(list) => list,
        Err(e) => {
            log::warn!("force-run: listing waybills failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ForceRunResponse {
                    namespace,
                    enqueued: false,
                }),
            );
        }
    };

    let has_waybill = waybills
        .iter()
        .any(|wb| wb.metadata.namespace.as_deref() == Some(namespace.as_str()));
    if !has_waybill {
        return (
            StatusCode::NOT_FOUND,
            Json(ForceRunResponse {
                namespace,
                enqueued: false,
            }),
        );
    }

    state
        .queue
        .try_enqueue(crate::queue::Request::new(namespace.clone(), RunType::Forced));
    (
        StatusCode::ACCEPTED,
        Json(ForceRunResponse {
            namespace,
            enqueued: true,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::mock::MockKubeClient;
    use crate::queue::RunQueue;
    use crate::waybill::{SecretReference, WaybillSpec};
    use kube::core::ObjectMeta;
    use tower::ServiceExt as _;

    fn waybill(namespace: &str) -> crate::waybill::Waybill {
        crate::waybill::Waybill {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_owned()),
                name: Some("wb".to_owned()),
                ..Default::default()
            },
            spec: WaybillSpec {
                auto_apply: true,
                dry_run: false,
                prune: true,
                prune_cluster_resources: false,
                prune_blacklist: vec![],
                repository_path: String::new(),
                run_interval: 3600,
                server_side_apply: false,
                strongbox_keyring_secret_ref: None,
                git_ssh_secret_ref: None,
                delegate_service_account_secret_ref: SecretReference {
                    namespace: namespace.to_owned(),
                    name: "delegate-token".to_owned(),
                },
            },
            status: None,
        }
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let kube = Arc::new(MockKubeClient::default());
        let queue = RunQueue::new(4);
        let app = router(StatusServerState {
            kube,
            queue: queue.sender(),
        });

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn force_run_enqueues_for_known_namespace() {
        let kube = Arc::new(MockKubeClient::default());
        kube.insert_waybill(waybill("demo"));
        let mut queue = RunQueue::new(4);
        let sender = queue.sender();
        let app = router(StatusServerState { kube, queue: sender });

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/force/demo")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let req = queue.recv().await.unwrap();
        assert_eq!(req.namespace, "demo");
        assert_eq!(req.run_type, RunType::Forced);
    }

    #[tokio::test]
    async fn force_run_404s_for_unknown_namespace() {
        let kube = Arc::new(MockKubeClient::default());
        let queue = RunQueue::new(4);
        let app = router(StatusServerState {
            kube,
            queue: queue.sender(),
        });

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/force/missing")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

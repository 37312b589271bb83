//! Validating admission webhook for the IPAM ConfigMap
//!
//! Rejects writes to `kube-system/hostnic-ipam-config` whose data does not
//! parse as an IPAM config. Every other ConfigMap is allowed untouched.

use crate::error::ControllerError;
use axum::routing::{get, post};
use axum::{Json, Router};
use crds::labels::{IPAM_CONFIG_NAME, IPAM_CONFIG_NAMESPACE};
use ipam::validate_ipam_config;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use std::net::SocketAddr;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const VALIDATE_PATH: &str = "/validate-ipam-config";

pub fn router() -> Router {
    Router::new()
        .route(VALIDATE_PATH, post(validate))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
}

/// Whether `cm` is the IPAM ConfigMap
fn is_ipam_config(cm: &ConfigMap) -> bool {
    cm.name_any() == IPAM_CONFIG_NAME && cm.namespace().as_deref() == Some(IPAM_CONFIG_NAMESPACE)
}

/// Admission decision for one request
pub fn review_config_map(req: &AdmissionRequest<ConfigMap>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let Some(cm) = req.object.as_ref().filter(|cm| is_ipam_config(cm)) else {
        return response;
    };
    let data = cm.data.clone().unwrap_or_default();
    match validate_ipam_config(&data) {
        Ok(config) => {
            debug!("Accepted IPAM config with {} namespaces", config.namespaces.len());
            response
        }
        Err(e) => {
            warn!("Denied IPAM config {:?} by {}: {}", req.operation, req.user_info.username.as_deref().unwrap_or("unknown"), e);
            response.deny(e.to_string())
        }
    }
}

async fn validate(Json(review): Json<AdmissionReview<ConfigMap>>) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<ConfigMap> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!("Malformed admission review: {}", e);
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(review_config_map(&req).into_review())
}

/// Serves the webhook on `addr` until `shutdown` flips to true
pub async fn serve(addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Webhook listening on {}", addr);
    axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn review(name: &str, namespace: &str, data: Value) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "ConfigMap"},
                "resource": {"group": "", "version": "v1", "resource": "configmaps"},
                "name": name,
                "namespace": namespace,
                "operation": "UPDATE",
                "userInfo": {"username": "admin"},
                "object": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": name, "namespace": namespace},
                    "data": data
                },
                "dryRun": false
            }
        })
    }

    async fn post_review(body: Value) -> Value {
        let request = Request::builder()
            .method("POST")
            .uri(VALIDATE_PATH)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_valid_config_is_allowed() {
        let body = review(
            IPAM_CONFIG_NAME,
            IPAM_CONFIG_NAMESPACE,
            json!({"ipam": "{\"Default\": [\"vxnet-a\"]}", "autoAssign": "true"}),
        );
        let reply = post_review(body).await;
        assert_eq!(reply["response"]["allowed"], json!(true));
        assert_eq!(reply["response"]["uid"], json!("705ab4f5-6393-11e8-b7cc-42010a800002"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_denied() {
        let body = review(IPAM_CONFIG_NAME, IPAM_CONFIG_NAMESPACE, json!({"ipam": "{not json"}));
        let reply = post_review(body).await;
        assert_eq!(reply["response"]["allowed"], json!(false));
        assert!(reply["response"]["status"]["message"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_other_config_maps_pass() {
        let body = review("coredns", "kube-system", json!({"ipam": "{not json"}));
        let reply = post_review(body).await;
        assert_eq!(reply["response"]["allowed"], json!(true));
    }

    #[tokio::test]
    async fn test_healthz() {
        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

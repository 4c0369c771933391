//! Health check HTTP server.
//!
//! `/health/ready` reports whether this replica holds a member lease and so
//! may accept work (200 when up, 503 when down). `/health/live` only says
//! the process is running.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use flowpool_lease::{MembershipCoordinator, ReadinessCheck};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// What the health endpoints read on every request.
#[derive(Debug)]
pub struct HealthState {
    pub check: ReadinessCheck,
    pub coordinator: Arc<MembershipCoordinator>,
}

/// Spawns the HTTP server for `/health/ready` and `/health/live`.
pub fn spawn_http_server(addr: SocketAddr, state: Arc<HealthState>) {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("failed to bind health server on {addr}: {e}");
                return;
            }
        };

        info!("health endpoint on http://{addr}");

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("health listener accept error: {e}");
                    continue;
                }
            };

            let state = Arc::clone(&state);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { handle_request(req, &state) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!("http connection error: {e}");
                }
            });
        }
    });
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: &HealthState,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    Ok(route(req.uri().path(), state))
}

/// Routes a request path to its response.
fn route(path: &str, state: &HealthState) -> Response<Full<Bytes>> {
    match path {
        "/health/ready" | "/health" => readiness_response(state),
        "/health/live" => json_response(StatusCode::OK, r#"{"status":"UP"}"#.to_string()),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .expect("static builder never fails"),
    }
}

fn readiness_response(state: &HealthState) -> Response<Full<Bytes>> {
    let report = state.check.evaluate(&state.coordinator);
    let code = if report.is_up() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "name": "Lease Acquisition",
        "checks": [report],
        "status": report.status,
    });
    json_response(code, body.to_string())
}

fn json_response(code: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static builder never fails")
}

#[cfg(test)]
mod tests {
    use flowpool_lease::{
        MemberLeaseEvent, MemberLeaseEventKind, MemberLeaseListener, ProcessIdentity,
    };
    use http_body_util::BodyExt;

    use super::*;

    fn state(require_lease: bool) -> HealthState {
        HealthState {
            check: ReadinessCheck {
                lease_enabled: true,
                require_lease,
                pool_name: "orders".into(),
                identity: ProcessIdentity {
                    namespace: "ns".into(),
                    pod_name: "web-0".into(),
                },
            },
            coordinator: Arc::new(MembershipCoordinator::new()),
        }
    }

    async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ready_is_503_until_a_lease_is_bound() {
        let s = state(true);
        let resp = route("/health/ready", &s);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "DOWN");
        assert_eq!(json["checks"][0]["leaseAcquired"], false);

        s.coordinator.on_member_lease_event(&MemberLeaseEvent {
            kind: MemberLeaseEventKind::Acquired,
            pool_name: "orders".into(),
            pod_name: "web-0".into(),
            lease_name: "flow-pool-member-orders-02".into(),
        });
        let resp = route("/health/ready", &s);
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["checks"][0]["leaseName"], "flow-pool-member-orders-02");
        assert_eq!(json["checks"][0]["podName"], "web-0");
    }

    #[tokio::test]
    async fn ready_without_required_lease_is_200() {
        let resp = route("/health/ready", &state(false));
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn live_is_always_200() {
        assert_eq!(route("/health/live", &state(true)).status(), StatusCode::OK);
    }

    #[test]
    fn unknown_path_is_404() {
        assert_eq!(route("/metrics", &state(true)).status(), StatusCode::NOT_FOUND);
    }
}

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};

use crate::manager::SwitchManager;

/// Start the HTTP statistics server on the specified port.
pub async fn serve_stats(manager: Arc<SwitchManager>, port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Statistics server listening on http://{}/stats", addr);

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let manager = Arc::clone(&manager);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let manager = Arc::clone(&manager);
                handle_request(req, manager)
            });

            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);

            if let Err(e) = conn.await {
                error!("Connection error: {}", e);
            }
        });
    }
}

async fn handle_request<B>(
    req: Request<B>,
    manager: Arc<SwitchManager>,
) -> Result<Response<String>, Infallible> {
    match req.uri().path() {
        "/stats" => {
            let stats = manager.stats().await;
            let body =
                serde_json::to_string_pretty(&stats).unwrap_or_else(|_| "{}".to_string());
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(body)
                .unwrap())
        }
        "/health" => Ok(Response::builder()
            .status(StatusCode::OK)
            .body("OK".to_string())
            .unwrap()),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body("Not Found".to_string())
            .unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_responds_ok() {
        let manager = SwitchManager::new();
        let resp = handle_request(request("/health"), manager).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), "OK");
    }

    #[tokio::test]
    async fn stats_endpoint_serves_the_aggregate_schema() {
        let manager = SwitchManager::new();
        manager.add_vlan(9999).await.unwrap();

        let resp = handle_request(request("/stats"), manager).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["Content-Type"],
            "application/json"
        );

        let json: serde_json::Value = serde_json::from_str(resp.body()).unwrap();
        assert_eq!(json["vlan_count"], 1);
        assert!(json["vlans"]["vlan_9999"].is_object());
        assert_eq!(json["total_frames"], 0);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let manager = SwitchManager::new();
        let resp = handle_request(request("/nope"), manager).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

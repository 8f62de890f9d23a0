use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::HosterResult;
use crate::pool::HostPool;
use crate::store::EntityRow;
use crate::store::db::Db;
use crate::store::entities::NODES;

/// State shared by every proxied request.
pub struct ProxyState {
    pub db: Db,
    pub pool: Arc<HostPool>,
    pub config: Arc<Config>,
}

/// Hostname-keyed reverse proxy: one backend per hostname, no retry,
/// no path routing. HTTP and WebSocket only.
#[must_use]
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

/// Bind and serve the proxy until cancelled.
pub async fn run(state: Arc<ProxyState>, cancel: CancellationToken) -> HosterResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.proxy_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "proxy listening");

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn handle(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let Some(hostname) = request_hostname(&request) else {
        return not_found_page();
    };

    let deployment = match state.db.find_deployment_by_hostname(&hostname).await {
        Ok(Some(deployment)) => deployment,
        Ok(None) => {
            debug!(%hostname, "no deployment for hostname");
            return not_found_page();
        }
        Err(err) => {
            warn!(%hostname, error = %err, "hostname lookup failed");
            return unavailable_page();
        }
    };

    let proxy_port = deployment
        .attr_i64("proxy_port")
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(0);

    if deployment.status != "running" || proxy_port == 0 {
        return match deployment.status.as_str() {
            "stopped" | "stopping" => stopped_page(),
            _ => unavailable_page(),
        };
    }

    match forward(&state, &deployment, proxy_port, &hostname, client_ip, request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(
                deployment = %deployment.id,
                error = %err,
                "upstream request failed"
            );
            unavailable_page()
        }
    }
}

async fn forward(
    state: &ProxyState,
    deployment: &EntityRow,
    proxy_port: u16,
    hostname: &str,
    client_ip: Option<std::net::IpAddr>,
    mut request: Request,
) -> HosterResult<Response> {
    let stream = open_upstream(state, deployment, proxy_port).await?;

    // Taken before the request is consumed so a 101 can bridge the
    // two connections afterwards.
    let client_upgrade = request.extensions_mut().remove::<hyper::upgrade::OnUpgrade>();

    let headers = request.headers_mut();
    headers.insert(
        "x-forwarded-host",
        HeaderValue::from_str(hostname)
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    if let Some(ip) = client_ip {
        headers.insert(
            "x-real-ip",
            HeaderValue::from_str(&ip.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );
    }
    headers.insert(
        "x-deployment-id",
        HeaderValue::from_str(&deployment.id)
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );

    let (mut sender, connection) =
        hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(stream))
            .await
            .map_err(|e| crate::error::HosterError::ConnectionFailed(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(err) = connection.with_upgrades().await {
            debug!(error = %err, "upstream connection closed");
        }
    });

    let mut response = sender
        .send_request(request)
        .await
        .map_err(|e| crate::error::HosterError::ConnectionFailed(e.to_string()))?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let server_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(async move {
                match tokio::try_join!(client_upgrade, server_upgrade) {
                    Ok((client, server)) => {
                        let mut client = TokioIo::new(client);
                        let mut server = TokioIo::new(server);
                        if let Err(err) =
                            tokio::io::copy_bidirectional(&mut client, &mut server).await
                        {
                            debug!(error = %err, "websocket bridge closed");
                        }
                    }
                    Err(err) => debug!(error = %err, "upgrade handshake failed"),
                }
            });
        }
    }

    Ok(response.map(Body::new))
}

/// Local nodes answer on loopback; remote ones get a fresh SSH tunnel
/// for this request.
async fn open_upstream(
    state: &ProxyState,
    deployment: &EntityRow,
    proxy_port: u16,
) -> HosterResult<Box<dyn ProxyStream>> {
    let node_id = deployment
        .attr_str("node_id")
        .ok_or_else(|| crate::error::HosterError::NotFound("deployment has no node".into()))?;
    let node = state
        .db
        .fetch(NODES, node_id)
        .await?
        .ok_or_else(|| crate::error::HosterError::NotFound(format!("nodes/{node_id}")))?;

    if node.attr_bool("local") {
        let stream = TcpStream::connect(("127.0.0.1", proxy_port)).await?;
        Ok(Box::new(stream))
    } else {
        let agent = state.pool.agent(node_id).await?;
        let tunnel = agent.open_tunnel(proxy_port).await?;
        Ok(Box::new(tunnel))
    }
}

trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

/// Host header minus any port suffix, lowercased.
fn request_hostname(request: &Request) -> Option<String> {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())?;

    let host = raw.rsplit_once(':').map_or(raw, |(host, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            host
        } else {
            raw
        }
    });

    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

fn themed_page(status: StatusCode, title: &str, message: &str) -> Response {
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title}</title>\n<style>\n\
         body {{ font-family: sans-serif; background: #f5f6f8; color: #2c3e50;\n\
                display: flex; align-items: center; justify-content: center; height: 100vh; }}\n\
         .card {{ background: #fff; border-radius: 8px; padding: 3rem 4rem;\n\
                 box-shadow: 0 2px 12px rgba(0,0,0,0.08); text-align: center; }}\n\
         h1 {{ margin: 0 0 0.5rem; font-size: 1.6rem; }}\n\
         p {{ margin: 0; color: #7f8c8d; }}\n\
         </style></head>\n<body><div class=\"card\"><h1>{title}</h1><p>{message}</p></div></body>\n</html>\n"
    );
    (status, Html(body)).into_response()
}

fn not_found_page() -> Response {
    themed_page(
        StatusCode::NOT_FOUND,
        "Deployment not found",
        "No deployment answers to this hostname.",
    )
}

fn stopped_page() -> Response {
    themed_page(
        StatusCode::SERVICE_UNAVAILABLE,
        "Deployment stopped",
        "This deployment is currently stopped. Start it to restore service.",
    )
}

fn unavailable_page() -> Response {
    themed_page(
        StatusCode::SERVICE_UNAVAILABLE,
        "Deployment unavailable",
        "The deployment did not answer. Please try again shortly.",
    )
}

#[cfg(test)]
mod tests {
    use axum::http::Request as HttpRequest;

    use super::*;

    fn request_with_host(host: &str) -> Request {
        HttpRequest::builder()
            .uri("/")
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn hostname_strips_port_and_case() {
        let req = request_with_host("My-App.Apps.Example.com:30001");
        assert_eq!(
            request_hostname(&req).as_deref(),
            Some("my-app.apps.example.com")
        );
    }

    #[test]
    fn hostname_without_port_passes_through() {
        let req = request_with_host("app.apps.example.com");
        assert_eq!(
            request_hostname(&req).as_deref(),
            Some("app.apps.example.com")
        );
    }

    #[test]
    fn missing_host_is_none() {
        let req = HttpRequest::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(request_hostname(&req), None);
    }

    #[tokio::test]
    async fn error_pages_are_html() {
        let page = stopped_page();
        assert_eq!(page.status(), StatusCode::SERVICE_UNAVAILABLE);
        let content_type = page.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/html"));
    }
}

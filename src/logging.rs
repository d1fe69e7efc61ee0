use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::info;

/// Access log for the record API. One line per request with the resolved
/// client address, timing, and response size.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let remote_addr = client_addr(&request);

    let response = next.run(request).await;

    let bytes = response
        .headers()
        .get("content-length")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("-")
        .to_string();

    info!(
        target: "access_log",
        %method,
        path,
        query = query.as_deref().unwrap_or(""),
        status = response.status().as_u16(),
        bytes,
        elapsed_ms = start.elapsed().as_millis() as u64,
        remote = remote_addr,
        "request"
    );

    response
}

/// Prefer proxy-forwarded addresses when present.
fn client_addr(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .or_else(|| request.headers().get("x-real-ip"))
        .and_then(|h| h.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

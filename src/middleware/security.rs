use axum::{extract::Request, middleware::Next, response::Response};

/// Adds security headers to every response. The only HTML this service
/// serves is the OAuth callback shell, so the policy is strict.
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Frame-Options", "DENY".parse().unwrap());
    headers.insert("X-Content-Type-Options", "nosniff".parse().unwrap());
    headers.insert(
        "Referrer-Policy",
        "strict-origin-when-cross-origin".parse().unwrap(),
    );
    // HSTS — always set since the service runs behind HTTPS in production.
    // Proxies / load balancers will strip it for plain HTTP clients anyway.
    headers.insert(
        "Strict-Transport-Security",
        "max-age=31536000; includeSubDomains".parse().unwrap(),
    );
    headers.insert(
        "Content-Security-Policy",
        "default-src 'self'; style-src 'unsafe-inline'".parse().unwrap(),
    );
    response
}

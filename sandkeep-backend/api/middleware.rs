use axum::{
    body::Body,
    http::{Request, Uri},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tracing::Span;

pub async fn enrich_current_span_middleware(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();

    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("UNKNOWN");

    let current_span = Span::current();
    current_span.record("http.uri", uri.path());
    current_span.record("http.host", host);
    if let Some(query) = uri.query() {
        current_span.record("http.query", query);
    }

    next.run(req).await
}

/// Permanent redirect from `/path/` to `/path`, keeping the query.
/// The root path is left alone.
pub async fn strip_trailing_slash(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri();
    let Some(path) = uri.path().strip_suffix('/').filter(|p| !p.is_empty()) else {
        return next.run(req).await;
    };

    let location = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    Redirect::permanent(&location).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;

    async fn serve() -> String {
        let app = Router::new()
            .route("/", get(|| async { "root" }))
            .route("/items", get(|| async { "items" }))
            .layer(axum::middleware::from_fn(strip_trailing_slash));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn redirect_keeps_query_and_spares_root() {
        let base = serve().await;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        let resp = client.get(format!("{base}/items/?page=2")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 308);
        assert_eq!(resp.headers()["location"], "/items?page=2");

        let resp = client.get(format!("{base}/")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.text().await.unwrap(), "root");
    }
}

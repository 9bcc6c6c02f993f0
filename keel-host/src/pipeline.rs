//! Request pipeline assembly.
//!
//! Stages run in a fixed order regardless of which optional ones are
//! enabled:
//!
//! ```text
//! [body-parsing?, identity-header?, authorization?, dev-diagnostics?, routes, error-handler?]
//! ```
//!
//! Every stage wraps the `/api` router only, including its 404 fallback, so
//! unknown `/api` paths pass through the same stages as known ones. Routes
//! registered on the app root bypass the pipeline.

use std::sync::Arc;

use axum::{http::StatusCode, middleware, routing::MethodRouter, Router};
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

use crate::body::parse_body;
use crate::config::{ErrorHandling, HostConfig, API_PREFIX};
use crate::error::HostError;
use crate::stages::{authorize, handle_route_errors, identity_layer, log_request, panic_response};

/// One stage of the request pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    BodyParsing,
    IdentityHeader,
    Authorization,
    DevDiagnostics,
    Routes,
    ErrorHandler,
}

/// Route tables handed to a [`RouteRegistrar`].
#[derive(Debug, Default)]
pub struct Routes {
    app: Router,
    api: Router,
}

impl Routes {
    /// Add a route under the `/api` prefix. `path` is relative to it.
    pub fn api(&mut self, path: &str, route: MethodRouter) -> &mut Self {
        self.api = std::mem::take(&mut self.api).route(path, route);
        self
    }

    /// Add a route on the app root, outside the pipeline.
    pub fn app(&mut self, path: &str, route: MethodRouter) -> &mut Self {
        self.app = std::mem::take(&mut self.app).route(path, route);
        self
    }

    /// Merge a whole router under the `/api` prefix.
    pub fn merge_api(&mut self, router: Router) -> &mut Self {
        self.api = std::mem::take(&mut self.api).merge(router);
        self
    }

    /// Merge a whole router on the app root.
    pub fn merge_app(&mut self, router: Router) -> &mut Self {
        self.app = std::mem::take(&mut self.app).merge(router);
        self
    }
}

/// Supplies the application's routes each time a pipeline is built.
pub trait RouteRegistrar: Send + Sync {
    fn register(&self, routes: &mut Routes);
}

impl<F> RouteRegistrar for F
where
    F: Fn(&mut Routes) + Send + Sync,
{
    fn register(&self, routes: &mut Routes) {
        self(routes);
    }
}

/// Stages enabled by `config`, in execution order.
#[must_use]
pub fn plan(config: &HostConfig) -> Vec<PipelineStage> {
    let mut stages = Vec::with_capacity(6);
    if config.body_parsing().options().is_some() {
        stages.push(PipelineStage::BodyParsing);
    }
    if !config.identity().is_empty() {
        stages.push(PipelineStage::IdentityHeader);
    }
    if config.authorizer().is_some() {
        stages.push(PipelineStage::Authorization);
    }
    if config.env().is_development() {
        stages.push(PipelineStage::DevDiagnostics);
    }
    stages.push(PipelineStage::Routes);
    if config.error_handling().is_enabled() {
        stages.push(PipelineStage::ErrorHandler);
    }
    stages
}

/// A fully assembled request handler plus the stage list it was built from.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
    router: Router,
}

impl Pipeline {
    /// Build a pipeline from `config`, asking `registrar` for the routes.
    ///
    /// # Errors
    /// Returns [`HostError::InvalidIdentity`] if the identity value cannot be
    /// sent as a header.
    pub fn build(config: &HostConfig, registrar: &dyn RouteRegistrar) -> Result<Self, HostError> {
        let stages = plan(config);

        let mut routes = Routes::default();
        registrar.register(&mut routes);
        let Routes { app, api } = routes;
        let mut api = api.fallback(|| async { StatusCode::NOT_FOUND });

        // Layers wrap outward, so the last stage is applied first.
        for stage in stages.iter().rev() {
            api = apply(*stage, api, config)?;
        }

        let router = app
            .nest(API_PREFIX, api)
            .layer(TraceLayer::new_for_http());

        debug!(stages = ?stages, "pipeline built");
        Ok(Self { stages, router })
    }

    #[must_use]
    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// The request handler, ready to be served.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

fn apply(stage: PipelineStage, api: Router, config: &HostConfig) -> Result<Router, HostError> {
    let api = match stage {
        PipelineStage::BodyParsing => match config.body_parsing().options() {
            Some(options) => api.layer(middleware::from_fn_with_state(Arc::new(options), parse_body)),
            None => api,
        },
        PipelineStage::IdentityHeader => {
            api.layer(identity_layer(config.identity_header().clone(), config.identity())?)
        }
        PipelineStage::Authorization => match config.authorizer() {
            Some(authorizer) => api.layer(middleware::from_fn_with_state(authorizer.clone(), authorize)),
            None => api,
        },
        PipelineStage::DevDiagnostics => api
            .layer(middleware::from_fn(log_request))
            .layer(CorsLayer::permissive()),
        PipelineStage::Routes => api,
        PipelineStage::ErrorHandler => {
            let sink = match config.error_handling() {
                ErrorHandling::WithSink(sink) => Some(Arc::clone(sink)),
                _ => None,
            };
            api.layer(CatchPanicLayer::custom(panic_response))
                .layer(middleware::from_fn_with_state(sink, handle_route_errors))
        }
    };
    Ok(api)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use axum::{
        body::Body,
        extract::Request,
        http::{header, Method, StatusCode},
        response::Response,
        routing::{get, post},
        Json,
    };
    use http_body_util::BodyExt;
    use keel_core::{bearer, AuthError, Authorizer, HostEnv};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::body::ParsedBody;
    use crate::config::{BodyParserOverrides, BodyParsing, IDENTITY_HEADER};
    use crate::error::RouteError;

    fn register(routes: &mut Routes) {
        routes
            .api("/hello", get(|| async { "hello" }))
            .api(
                "/echo",
                post(|body: ParsedBody| async move {
                    match body {
                        ParsedBody::Json(v) => Json(v),
                        ParsedBody::Form(f) => Json(json!(f)),
                        ParsedBody::Text(t) => Json(json!(t)),
                    }
                }),
            )
            .api("/raw", post(|body: axum::body::Bytes| async move { body.len().to_string() }))
            .api(
                "/fail",
                get(|| async { Err::<(), _>(RouteError::not_found("widget 7 does not exist")) }),
            )
            .api("/panic", get(exploding))
            .app("/status", get(|| async { "up" }));
    }

    async fn exploding() -> &'static str {
        panic!("handler exploded")
    }

    fn build(config: &HostConfig) -> Pipeline {
        match Pipeline::build(config, &register) {
            Ok(p) => p,
            Err(e) => panic!("pipeline build failed: {e}"),
        }
    }

    fn dev_env() -> HostEnv {
        match HostEnv::from_lookup(|key| (key == "DEPLOY_ENV").then(|| "development".to_owned())) {
            Ok(env) => env,
            Err(e) => panic!("env failed: {e}"),
        }
    }

    async fn send(pipeline: &Pipeline, request: Request) -> Response {
        match pipeline.router().oneshot(request).await {
            Ok(r) => r,
            Err(e) => match e {},
        }
    }

    fn request(method: Method, uri: &str, body: Body) -> Request {
        match Request::builder().method(method).uri(uri).body(body) {
            Ok(r) => r,
            Err(e) => panic!("bad request: {e}"),
        }
    }

    fn json_request(uri: &str, body: &'static str) -> Request {
        match Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
        {
            Ok(r) => r,
            Err(e) => panic!("bad request: {e}"),
        }
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        match resp.into_body().collect().await {
            Ok(c) => c.to_bytes().to_vec(),
            Err(e) => panic!("body read failed: {e}"),
        }
    }

    async fn body_json(resp: Response) -> Value {
        match serde_json::from_slice(&body_bytes(resp).await) {
            Ok(v) => v,
            Err(e) => panic!("response is not JSON: {e}"),
        }
    }

    fn capture_sink() -> (Arc<Mutex<Vec<String>>>, ErrorHandling) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = ErrorHandling::WithSink(Arc::new(move |report: &str| {
            if let Ok(mut seen) = sink_seen.lock() {
                seen.push(report.to_owned());
            }
        }));
        (seen, sink)
    }

    // ── Stage order ─────────────────────────────────────────────────────────

    #[test]
    fn stage_order_holds_for_every_combination() {
        for mask in 0_u8..32 {
            let body = mask & 1 != 0;
            let identity = mask & 2 != 0;
            let auth = mask & 4 != 0;
            let dev = mask & 8 != 0;
            let errors = mask & 16 != 0;

            let mut config = HostConfig::new(if dev { dev_env() } else { HostEnv::default() })
                .with_body_parsing(if body { BodyParsing::Defaults } else { BodyParsing::Disabled })
                .with_error_handling(if errors { ErrorHandling::Enabled } else { ErrorHandling::Disabled });
            if identity {
                config.set_identity("keel");
            }
            if auth {
                config.set_authorizer(Some(Authorizer::constant(true)));
            }

            let mut expected = Vec::new();
            if body {
                expected.push(PipelineStage::BodyParsing);
            }
            if identity {
                expected.push(PipelineStage::IdentityHeader);
            }
            if auth {
                expected.push(PipelineStage::Authorization);
            }
            if dev {
                expected.push(PipelineStage::DevDiagnostics);
            }
            expected.push(PipelineStage::Routes);
            if errors {
                expected.push(PipelineStage::ErrorHandler);
            }

            assert_eq!(plan(&config), expected, "mask {mask:05b}");
            assert_eq!(build(&config).stages(), expected.as_slice(), "mask {mask:05b}");
        }
    }

    // ── Identity & authorization ────────────────────────────────────────────

    #[tokio::test]
    async fn identity_header_is_set_on_api_responses() {
        let config = HostConfig::default().with_identity("keel/0.1");
        let resp = send(&build(&config), request(Method::GET, "/api/hello", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(IDENTITY_HEADER).and_then(|v| v.to_str().ok()),
            Some("keel/0.1")
        );
    }

    #[tokio::test]
    async fn identity_header_name_is_configurable() {
        let config = HostConfig::default()
            .with_identity("keel")
            .with_identity_header(header::SERVER);
        let resp = send(&build(&config), request(Method::GET, "/api/hello", Body::empty())).await;
        assert!(resp.headers().get(header::SERVER).is_some());
        assert!(resp.headers().get(IDENTITY_HEADER).is_none());
    }

    #[tokio::test]
    async fn empty_identity_sends_no_header() {
        let resp = send(&build(&HostConfig::default()), request(Method::GET, "/api/hello", Body::empty())).await;
        assert!(resp.headers().get(IDENTITY_HEADER).is_none());
    }

    #[tokio::test]
    async fn denial_is_401_with_empty_body_and_identity() {
        let config = HostConfig::default()
            .with_identity("keel")
            .with_authorizer(Authorizer::constant(false));
        let resp = send(&build(&config), request(Method::GET, "/api/hello", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().get(IDENTITY_HEADER).is_some(), "identity runs before authorization");
        assert!(body_bytes(resp).await.is_empty(), "401 body must be empty");
    }

    #[tokio::test]
    async fn bearer_token_grants_access() {
        let config = HostConfig::default()
            .with_authorizer(bearer(|token| async move { Ok(token == "abc123") }));
        let pipeline = build(&config);

        let granted = match Request::builder()
            .uri("/api/hello")
            .header(header::AUTHORIZATION, "Bearer abc123")
            .body(Body::empty())
        {
            Ok(r) => r,
            Err(e) => panic!("bad request: {e}"),
        };
        assert_eq!(send(&pipeline, granted).await.status(), StatusCode::OK);

        let anonymous = request(Method::GET, "/api/hello", Body::empty());
        assert_eq!(send(&pipeline, anonymous).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn authorizer_error_is_500_not_denial() {
        let config = HostConfig::default().with_authorizer(Authorizer::from_fn(|_meta| async {
            Err(AuthError::Check("directory unreachable".to_owned()))
        }));
        let resp = send(&build(&config), request(Method::GET, "/api/hello", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_bytes(resp).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_api_path_is_still_authorized() {
        let config = HostConfig::default()
            .with_identity("keel")
            .with_authorizer(Authorizer::constant(false));
        let pipeline = build(&config);
        for uri in ["/api/hello", "/api/nope", "/api/deeply/nested/nothing"] {
            let resp = send(&pipeline, request(Method::GET, uri, Body::empty())).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{uri}");
            assert!(resp.headers().get(IDENTITY_HEADER).is_some(), "{uri}");
        }
    }

    #[tokio::test]
    async fn unknown_api_path_is_404_with_identity() {
        let config = HostConfig::default().with_identity("keel");
        let resp = send(&build(&config), request(Method::GET, "/api/nope", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.headers().get(IDENTITY_HEADER).is_some());
    }

    #[tokio::test]
    async fn body_parsing_runs_before_authorization() {
        let config = HostConfig::default().with_authorizer(Authorizer::constant(false));
        let resp = send(&build(&config), json_request("/api/echo", "{not json")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "malformed body rejected before the 401");

        let resp = send(&build(&config), json_request("/api/echo", r#"{"a":1}"#)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn app_root_routes_bypass_the_pipeline() {
        let config = HostConfig::default()
            .with_identity("keel")
            .with_authorizer(Authorizer::constant(false));
        let resp = send(&build(&config), request(Method::GET, "/status", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::OK, "authorization applies to /api only");
        assert!(resp.headers().get(IDENTITY_HEADER).is_none());
    }

    // ── Error handling ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn route_error_is_reported_and_rendered_as_json() {
        let (seen, sink) = capture_sink();
        let config = HostConfig::default().with_error_handling(sink);
        let resp = send(&build(&config), request(Method::GET, "/api/fail?verbose=1", Body::empty())).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await, json!({"error": "widget 7 does not exist"}));

        let reports = seen.lock().map(|s| s.clone()).unwrap_or_default();
        assert_eq!(
            reports,
            vec!["Error in [GET] '/api/fail?verbose=1':\n\nwidget 7 does not exist".to_owned()],
            "report must carry the original URL"
        );
    }

    #[tokio::test]
    async fn disabled_error_handling_gives_bare_status() {
        let config = HostConfig::default().with_error_handling(ErrorHandling::Disabled);
        let resp = send(&build(&config), request(Method::GET, "/api/fail", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_bytes(resp).await.is_empty());
    }

    #[tokio::test]
    async fn handler_panic_becomes_500_json() {
        let (seen, sink) = capture_sink();
        let config = HostConfig::default().with_error_handling(sink);
        let resp = send(&build(&config), request(Method::GET, "/api/panic", Body::empty())).await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await, json!({"error": "Internal Server Error"}));
        let reports = seen.lock().map(|s| s.clone()).unwrap_or_default();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("handler exploded"), "got {reports:?}");
    }

    // ── Development diagnostics ─────────────────────────────────────────────

    #[tokio::test]
    async fn cors_is_permissive_only_in_development() {
        let cross_origin = || {
            match Request::builder()
                .method(Method::GET)
                .uri("/api/hello")
                .header(header::ORIGIN, "https://elsewhere.example")
                .body(Body::empty())
            {
                Ok(r) => r,
                Err(e) => panic!("bad request: {e}"),
            }
        };

        let dev = send(&build(&HostConfig::new(dev_env())), cross_origin()).await;
        assert!(dev.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_some());

        let prod = send(&build(&HostConfig::default()), cross_origin()).await;
        assert!(prod.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Ok(mut out) = self.0.lock() {
                out.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn text(&self) -> String {
            self.0
                .lock()
                .map(|out| String::from_utf8_lossy(&out).into_owned())
                .unwrap_or_default()
        }
    }

    async fn logged_lines(config: &HostConfig) -> String {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);
        let resp = send(&build(config), request(Method::GET, "/api/hello?page=2", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        capture.text()
    }

    #[tokio::test]
    async fn development_requests_are_logged() {
        let dev = logged_lines(&HostConfig::new(dev_env())).await;
        assert!(dev.contains("incoming request"), "got {dev}");
        assert!(dev.contains("path=/hello") && dev.contains("page"), "got {dev}");

        let prod = logged_lines(&HostConfig::default()).await;
        assert!(!prod.contains("incoming request"), "got {prod}");
    }

    // ── Body parsing ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn json_body_is_parsed() {
        let resp = send(&build(&HostConfig::default()), json_request("/api/echo", r#"{"a":1}"#)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({"a": 1}));
    }

    #[tokio::test]
    async fn strict_mode_rejects_top_level_scalars() {
        let pipeline = build(&HostConfig::default());
        let resp = send(&pipeline, json_request("/api/echo", "42")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let lenient = HostConfig::default().with_body_parsing(BodyParsing::Overrides(BodyParserOverrides {
            strict: Some(false),
            ..BodyParserOverrides::default()
        }));
        let resp = send(&build(&lenient), json_request("/api/echo", "42")).await;
        assert_eq!(body_json(resp).await, json!(42));
    }

    #[tokio::test]
    async fn oversize_body_is_413() {
        let small = HostConfig::default().with_body_parsing(BodyParsing::Overrides(BodyParserOverrides {
            limit: Some(8),
            ..BodyParserOverrides::default()
        }));
        let resp = send(&build(&small), json_request("/api/echo", r#"{"too":"long for eight"}"#)).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn gzip_body_is_inflated() {
        use std::io::Write;
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        if let Err(e) = encoder.write_all(br#"{"zipped":true}"#) {
            panic!("compress failed: {e}");
        }
        let compressed = match encoder.finish() {
            Ok(c) => c,
            Err(e) => panic!("compress failed: {e}"),
        };
        let req = match Request::builder()
            .method(Method::POST)
            .uri("/api/echo")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Body::from(compressed))
        {
            Ok(r) => r,
            Err(e) => panic!("bad request: {e}"),
        };
        let resp = send(&build(&HostConfig::default()), req).await;
        assert_eq!(body_json(resp).await, json!({"zipped": true}));
    }

    #[tokio::test]
    async fn non_utf8_charset_is_415() {
        let req = match Request::builder()
            .method(Method::POST)
            .uri("/api/echo")
            .header(header::CONTENT_TYPE, "text/plain; charset=latin1")
            .body(Body::from("hi"))
        {
            Ok(r) => r,
            Err(e) => panic!("bad request: {e}"),
        };
        let resp = send(&build(&HostConfig::default()), req).await;
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn form_body_is_parsed() {
        let req = match Request::builder()
            .method(Method::POST)
            .uri("/api/echo")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("name=keel&tag=a&tag=b"))
        {
            Ok(r) => r,
            Err(e) => panic!("bad request: {e}"),
        };
        let resp = send(&build(&HostConfig::default()), req).await;
        assert_eq!(body_json(resp).await, json!({"name": ["keel"], "tag": ["a", "b"]}));
    }

    #[tokio::test]
    async fn raw_bytes_stay_readable_after_parsing() {
        let resp = send(&build(&HostConfig::default()), json_request("/api/raw", r#"{"a":1}"#)).await;
        assert_eq!(body_bytes(resp).await, b"7");
    }

    #[tokio::test]
    async fn disabled_body_parsing_leaves_no_parsed_body() {
        let config = HostConfig::default().with_body_parsing(BodyParsing::Disabled);
        let resp = send(&build(&config), json_request("/api/echo", r#"{"a":1}"#)).await;
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE, "ParsedBody extractor must reject");
    }
}

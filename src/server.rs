//! Axum router construction and S3 request dispatch.
//!
//! Path-style requests arrive on `/s3/:bucket` and `/s3/:bucket/*key`.
//! Virtual-hosted requests are recognised by a middleware that runs before
//! the route handlers: when the `Host` names a bucket under the configured
//! base domain, it dispatches straight away with that bucket and the whole
//! path as the key.  Both styles end in [`dispatch`].
//!
//! S3 distinguishes operations by query parameters and headers, not just
//! path and method, so dispatch classifies each request into an
//! [`Operation`] before checking the credential's permissions for it.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::auth;
use crate::errors::{generate_request_id, S3Error, SERVER_NAME};
use crate::handlers::{multipart, object};
use crate::metrics::{metrics_handler, metrics_middleware, AUTH_FAILURES_TOTAL, S3_OPERATIONS_TOTAL};
use crate::registry::store::{Account, Permission};
use crate::resolver::{resolve_account, resolve_virtual_hosted, BucketTarget};
use crate::AppState;

/// Build the axum [`Router`] with every gateway route.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check endpoint (not part of S3 API).
        .route("/health", get(health_check))
        // Prometheus metrics endpoint.
        .route("/metrics", get(metrics_handler))
        // Path-style S3 routes (wildcard key captures slashes).
        .route("/s3/:bucket", any(handle_bucket))
        .route("/s3/:bucket/*key", any(handle_object))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        // virtual_host_middleware is innermost so it sees every request,
        // fallback included, before a route handler does.
        .layer(middleware::from_fn_with_state(state, virtual_host_middleware))
        // common_headers_middleware adds standard S3 headers.
        .layer(middleware::from_fn(common_headers_middleware))
        // metrics_middleware captures the full request lifecycle.
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        // Bodies are bounded per operation in `read_body`.
        .layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Adds common S3 response headers to every response:
/// - `x-amz-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `cloudmux`
async fn common_headers_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses already carry the id echoed in their XML body.
    if !headers.contains_key("x-amz-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-amz-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert(header::DATE, value);
    }
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));

    response
}

// -- Virtual-hosted resolution -------------------------------------------------

/// Dispatch requests whose `Host` is `<bucket>.<base_domain>`; pass
/// everything else on to ordinary routing.
async fn virtual_host_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let settings = match state.registry.get_settings().await {
        Ok(settings) => settings,
        Err(e) => {
            warn!("failed to load settings: {:#}", e);
            return next.run(req).await;
        }
    };
    let Some(base_domain) = settings.virtual_hosted.active_domain() else {
        return next.run(req).await;
    };

    let host = auth::request_host(req.uri(), req.headers());
    match resolve_virtual_hosted(&host, base_domain, req.uri().path()) {
        Some(target) => {
            debug!("virtual-hosted request for bucket {}", target.bucket);
            dispatch(state, target, req).await
        }
        None => next.run(req).await,
    }
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status":"ok"}` with 200 OK.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

// -- Path-style entry points ---------------------------------------------------

/// `/s3/:bucket` -- bucket-level operations.
async fn handle_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    req: Request,
) -> Response {
    dispatch(state, BucketTarget::new(bucket, ""), req).await
}

/// `/s3/:bucket/*key` -- object-level operations.
async fn handle_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    req: Request,
) -> Response {
    dispatch(state, BucketTarget::new(bucket, key), req).await
}

// -- Query parameter parsing helper ------------------------------------------

/// Parse a raw query string into a map.  Flags without a value (`?uploads`,
/// `?delete`) map to an empty string.
fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            let decoded_k = percent_encoding::percent_decode_str(k)
                .decode_utf8_lossy()
                .into_owned();
            let decoded_v = percent_encoding::percent_decode_str(v)
                .decode_utf8_lossy()
                .into_owned();
            map.insert(decoded_k, decoded_v);
        }
    }
    map
}

// -- Operation classification -------------------------------------------------

/// The S3 operation a request maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    HeadBucket,
    CreateBucket,
    DeleteObjects,
    GetObject,
    HeadObject,
    PutObject,
    CopyObject,
    DeleteObject,
    CreateMultipartUpload,
    UploadPart,
    UploadPartCopy,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    ListParts,
}

impl Operation {
    /// Classify by method, key presence, query flags, and the copy-source
    /// header.
    pub fn classify(
        method: &Method,
        target: &BucketTarget,
        query: &HashMap<String, String>,
        headers: &HeaderMap,
    ) -> Result<Self, S3Error> {
        let copy = headers.contains_key("x-amz-copy-source");

        if target.key.is_empty() {
            return match *method {
                Method::HEAD => Ok(Operation::HeadBucket),
                Method::PUT => Ok(Operation::CreateBucket),
                Method::POST if query.contains_key("delete") => Ok(Operation::DeleteObjects),
                _ => Err(S3Error::MethodNotAllowed),
            };
        }

        let op = match *method {
            Method::GET if query.contains_key("uploadId") => Operation::ListParts,
            Method::GET => Operation::GetObject,
            Method::HEAD => Operation::HeadObject,
            Method::PUT if query.contains_key("partNumber") && query.contains_key("uploadId") => {
                if copy {
                    Operation::UploadPartCopy
                } else {
                    Operation::UploadPart
                }
            }
            Method::PUT if copy => Operation::CopyObject,
            Method::PUT => Operation::PutObject,
            Method::DELETE if query.contains_key("uploadId") => Operation::AbortMultipartUpload,
            Method::DELETE => Operation::DeleteObject,
            Method::POST if query.contains_key("uploads") => Operation::CreateMultipartUpload,
            Method::POST if query.contains_key("uploadId") => Operation::CompleteMultipartUpload,
            _ => return Err(S3Error::MethodNotAllowed),
        };
        Ok(op)
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::HeadBucket => "HeadBucket",
            Operation::CreateBucket => "CreateBucket",
            Operation::DeleteObjects => "DeleteObjects",
            Operation::GetObject => "GetObject",
            Operation::HeadObject => "HeadObject",
            Operation::PutObject => "PutObject",
            Operation::CopyObject => "CopyObject",
            Operation::DeleteObject => "DeleteObject",
            Operation::CreateMultipartUpload => "CreateMultipartUpload",
            Operation::UploadPart => "UploadPart",
            Operation::UploadPartCopy => "UploadPartCopy",
            Operation::CompleteMultipartUpload => "CompleteMultipartUpload",
            Operation::AbortMultipartUpload => "AbortMultipartUpload",
            Operation::ListParts => "ListParts",
        }
    }

    /// Permissions the credential must hold.
    pub fn permissions(self) -> &'static [Permission] {
        match self {
            Operation::HeadBucket | Operation::CreateBucket => &[],
            Operation::GetObject | Operation::HeadObject | Operation::ListParts => {
                &[Permission::Read]
            }
            Operation::CopyObject | Operation::UploadPartCopy => {
                &[Permission::Read, Permission::Write]
            }
            Operation::PutObject
            | Operation::UploadPart
            | Operation::CreateMultipartUpload
            | Operation::CompleteMultipartUpload
            | Operation::AbortMultipartUpload => &[Permission::Write],
            Operation::DeleteObject | Operation::DeleteObjects => &[Permission::Delete],
        }
    }
}

// -- Dispatch -------------------------------------------------------------------

/// Authenticate, authorise, and run one S3 request against `target`.
///
/// Errors are rendered with the request path as the `Resource`.
pub async fn dispatch(state: Arc<AppState>, target: BucketTarget, req: Request) -> Response {
    let resource = req.uri().path().to_string();
    match run(&state, &target, req).await {
        Ok(response) => response,
        Err(e) => e.into_response_for(&resource),
    }
}

async fn run(state: &AppState, target: &BucketTarget, req: Request) -> Result<Response, S3Error> {
    let ctx = auth::authenticate(
        state.credentials.as_ref(),
        state.registry.as_ref(),
        req.method(),
        req.uri(),
        req.headers(),
    )
    .await
    .inspect_err(|e| {
        counter!(AUTH_FAILURES_TOTAL, "code" => e.code()).increment(1);
    })?;
    state.last_used.record(&ctx.credential.id);

    let account =
        resolve_account(state.registry.as_ref(), &target.bucket, &ctx.credential).await?;

    let query = parse_query(req.uri().query());
    let op = Operation::classify(req.method(), target, &query, req.headers())?;
    for permission in op.permissions() {
        if !ctx.credential.allows(*permission) {
            debug!(
                "credential {} lacks {:?} for {}",
                ctx.credential.access_key_id,
                permission,
                op.name()
            );
            return Err(S3Error::access_denied());
        }
    }

    let result = execute(state, &account, op, target, &query, req).await;
    let status = if result.is_ok() { "ok" } else { "error" };
    counter!(S3_OPERATIONS_TOTAL, "operation" => op.name(), "status" => status).increment(1);
    result
}

async fn execute(
    state: &AppState,
    account: &Account,
    op: Operation,
    target: &BucketTarget,
    query: &HashMap<String, String>,
    req: Request,
) -> Result<Response, S3Error> {
    match op {
        Operation::HeadBucket => return Ok(StatusCode::OK.into_response()),
        Operation::CreateBucket => return Err(S3Error::BucketAlreadyExists),
        _ => {}
    }

    let settings = state.registry.get_settings().await?;
    let backend = state.backends.client_for(account, &settings).await?;
    let backend = backend.as_ref();
    let key = target.key.as_str();
    let (parts, body) = req.into_parts();
    let headers = &parts.headers;
    let limit = state.config.server.max_object_size;

    match op {
        Operation::HeadBucket | Operation::CreateBucket => Err(S3Error::MethodNotAllowed),
        Operation::DeleteObjects => {
            let body = read_body(body, headers, limit, false).await?;
            object::delete_objects(backend, &body).await
        }
        Operation::GetObject => object::get_object(backend, key, headers).await,
        Operation::HeadObject => object::head_object(backend, key).await,
        Operation::PutObject => {
            let body = read_body(body, headers, limit, true).await?;
            object::put_object(backend, key, headers, body).await
        }
        Operation::CopyObject => object::copy_object(backend, key, headers).await,
        Operation::DeleteObject => object::delete_object(backend, key).await,
        Operation::CreateMultipartUpload => {
            multipart::create_multipart_upload(backend, key, headers).await
        }
        Operation::UploadPart => {
            // Range-check the part number before reading the body.
            crate::handlers::part_number(query)?;
            let body = read_body(body, headers, limit, true).await?;
            multipart::upload_part(backend, key, query, body).await
        }
        Operation::UploadPartCopy => {
            multipart::upload_part_copy(backend, key, query, headers).await
        }
        Operation::CompleteMultipartUpload => {
            let body = read_body(body, headers, limit, false).await?;
            multipart::complete_multipart_upload(backend, key, query, &body).await
        }
        Operation::AbortMultipartUpload => {
            multipart::abort_multipart_upload(backend, key, query).await
        }
        Operation::ListParts => multipart::list_parts(backend, key, query).await,
    }
}

/// Buffer a request body of at most `limit` bytes.
///
/// With `require_length`, a missing `Content-Length` is rejected, and a
/// declared length above `limit` is rejected before reading.
async fn read_body(
    body: Body,
    headers: &HeaderMap,
    limit: u64,
    require_length: bool,
) -> Result<Bytes, S3Error> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .map(|v| {
            v.to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| S3Error::invalid_request("Invalid Content-Length"))
        })
        .transpose()?;

    match declared {
        None if require_length => return Err(S3Error::MissingContentLength),
        Some(len) if len > limit => return Err(S3Error::EntityTooLarge),
        _ => {}
    }

    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| S3Error::EntityTooLarge)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::factory::MemoryBackendFactory;
    use crate::backend::memory::MemoryStore;
    use crate::config::Config;
    use crate::last_used::LastUsedRecorder;
    use crate::registry::memory::MemoryRegistry;
    use crate::registry::store::{AccountRegistry, CredentialStore, Settings, VirtualHosted};
    use crate::registry::testing::{account, credential};
    use crate::xml::parse_error;
    use tower::ServiceExt;

    const SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";
    const NOW: &str = "20260222T120000Z";
    const HOST: &str = "gw.example.com";

    struct Harness {
        app: Router,
        registry: Arc<MemoryRegistry>,
        store: Arc<MemoryStore>,
    }

    fn harness_with(config: Config) -> Harness {
        let registry = Arc::new(MemoryRegistry::new(Settings {
            virtual_hosted: VirtualHosted {
                enabled: true,
                base_domain: HOST.to_string(),
            },
            ..Settings::default()
        }));
        registry.put_account(account("acc1", "photos", 0, 0)).unwrap();
        registry.put_account(account("acc2", "videos", 0, 0)).unwrap();
        use Permission::*;
        for cred in [
            credential("c-full", "AKFULL", "acc1", &[Read, Write, Delete]),
            credential("c-read", "AKREAD", "acc1", &[Read]),
            credential("c-other", "AKOTHER", "acc2", &[Read, Write, Delete]),
        ] {
            registry.put_credential(cred).unwrap();
        }
        let mut revoked = credential("c-off", "AKOFF", "acc1", &[Read]);
        revoked.is_active = false;
        registry.put_credential(revoked).unwrap();

        let store = MemoryStore::new();
        let (last_used, _worker) = LastUsedRecorder::spawn(registry.clone(), 16);
        let state = Arc::new(AppState {
            config,
            registry: registry.clone(),
            credentials: registry.clone(),
            backends: Arc::new(MemoryBackendFactory::new(store.clone())),
            last_used,
        });
        Harness {
            app: app(state),
            registry,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default())
    }

    struct Call<'a> {
        method: &'a str,
        uri: &'a str,
        host: &'a str,
        body: Vec<u8>,
        headers: Vec<(&'a str, &'a str)>,
        access_key: Option<&'a str>,
        secret: &'a str,
        content_length: bool,
    }

    impl<'a> Call<'a> {
        fn new(method: &'a str, uri: &'a str) -> Self {
            Self {
                method,
                uri,
                host: HOST,
                body: Vec::new(),
                headers: Vec::new(),
                access_key: Some("AKFULL"),
                secret: SECRET,
                content_length: true,
            }
        }

        fn body(mut self, body: &[u8]) -> Self {
            self.body = body.to_vec();
            self
        }

        fn header(mut self, name: &'a str, value: &'a str) -> Self {
            self.headers.push((name, value));
            self
        }

        fn key(mut self, access_key: &'a str) -> Self {
            self.access_key = Some(access_key);
            self
        }

        fn unsigned(mut self) -> Self {
            self.access_key = None;
            self
        }

        async fn send(self, app: &Router) -> Response {
            let mut headers = HeaderMap::new();
            headers.insert(header::HOST, HeaderValue::from_str(self.host).unwrap());
            for (name, value) in &self.headers {
                headers.insert(
                    axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    HeaderValue::from_str(value).unwrap(),
                );
            }
            if self.content_length && (self.method == "PUT" || self.method == "POST") {
                headers.insert(
                    header::CONTENT_LENGTH,
                    HeaderValue::from(self.body.len() as u64),
                );
            }
            if let Some(access_key) = self.access_key {
                auth::testing::sign(self.method, self.uri, &mut headers, access_key, self.secret, NOW);
            }

            let mut req = axum::http::Request::builder()
                .method(self.method)
                .uri(self.uri)
                .body(Body::from(self.body))
                .unwrap();
            *req.headers_mut() = headers;
            app.clone().oneshot(req).await.unwrap()
        }
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn error_code(resp: Response) -> String {
        parse_error(&body_string(resp).await).unwrap().code
    }

    fn between<'s>(text: &'s str, open: &str, close: &str) -> &'s str {
        let start = text.find(open).unwrap() + open.len();
        let end = text[start..].find(close).unwrap() + start;
        &text[start..end]
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness();
        let resp = Call::new("GET", "/health").unsigned().send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["server"], SERVER_NAME);
        assert_eq!(body_string(resp).await, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let h = harness();
        let resp = Call::new("PUT", "/s3/photos/cats/tom.txt")
            .body(b"meow")
            .header("content-type", "text/plain")
            .send(&h.app)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("etag"));
        assert!(resp.headers().contains_key("x-amz-request-id"));
        assert_eq!(h.store.keys("photos").await, vec!["cats/tom.txt"]);

        let resp = Call::new("GET", "/s3/photos/cats/tom.txt").send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/plain");
        assert_eq!(body_string(resp).await, "meow");

        let resp = Call::new("HEAD", "/s3/photos/cats/tom.txt").send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-length"], "4");
    }

    #[tokio::test]
    async fn test_range_get_is_partial() {
        let h = harness();
        Call::new("PUT", "/s3/photos/digits")
            .body(b"0123456789")
            .send(&h.app)
            .await;
        let resp = Call::new("GET", "/s3/photos/digits")
            .header("range", "bytes=2-4")
            .send(&h.app)
            .await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()["content-range"], "bytes 2-4/10");
        assert_eq!(body_string(resp).await, "234");
    }

    #[tokio::test]
    async fn test_missing_key_is_no_such_key() {
        let h = harness();
        let resp = Call::new("GET", "/s3/photos/nope").send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_string(resp).await;
        let doc = parse_error(&body).unwrap();
        assert_eq!(doc.code, "NoSuchKey");
        assert_eq!(doc.resource, "/s3/photos/nope");
    }

    #[tokio::test]
    async fn test_authentication_failures() {
        let h = harness();

        let resp = Call::new("GET", "/s3/photos/x").unsigned().send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(resp).await, "InvalidRequest");

        let resp = Call::new("GET", "/s3/photos/x").key("AKNOBODY").send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_code(resp).await, "InvalidAccessKeyId");

        let mut call = Call::new("GET", "/s3/photos/x");
        call.secret = "not-the-secret";
        let resp = call.send(&h.app).await;
        assert_eq!(error_code(resp).await, "SignatureDoesNotMatch");

        let resp = Call::new("GET", "/s3/photos/x").key("AKOFF").send(&h.app).await;
        assert_eq!(error_code(resp).await, "AccessDenied");
    }

    #[tokio::test]
    async fn test_credential_cannot_cross_accounts() {
        let h = harness();
        let resp = Call::new("GET", "/s3/photos/x").key("AKOTHER").send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_code(resp).await, "AccessDenied");

        let resp = Call::new("GET", "/s3/nosuch/x").send(&h.app).await;
        assert_eq!(error_code(resp).await, "NoSuchBucket");
    }

    #[tokio::test]
    async fn test_permissions_enforced() {
        let h = harness();
        let resp = Call::new("PUT", "/s3/photos/x")
            .key("AKREAD")
            .body(b"data")
            .send(&h.app)
            .await;
        assert_eq!(error_code(resp).await, "AccessDenied");
        assert!(h.store.keys("photos").await.is_empty());

        let resp = Call::new("DELETE", "/s3/photos/x").key("AKREAD").send(&h.app).await;
        assert_eq!(error_code(resp).await, "AccessDenied");

        // Copy needs write as well as read.
        let resp = Call::new("PUT", "/s3/photos/y")
            .key("AKREAD")
            .header("x-amz-copy-source", "/photos/x")
            .send(&h.app)
            .await;
        assert_eq!(error_code(resp).await, "AccessDenied");
    }

    #[tokio::test]
    async fn test_last_used_recorded() {
        let h = harness();
        Call::new("GET", "/s3/photos/x").send(&h.app).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let cred = h
            .registry
            .get_credential_by_access_key("AKFULL")
            .await
            .unwrap()
            .unwrap();
        assert!(cred.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_virtual_hosted_request() {
        let h = harness();
        let mut put = Call::new("PUT", "/cats/tom.txt").body(b"meow");
        put.host = "photos.gw.example.com";
        assert_eq!(put.send(&h.app).await.status(), StatusCode::OK);
        assert_eq!(h.store.keys("photos").await, vec!["cats/tom.txt"]);

        let mut get = Call::new("GET", "/cats/tom.txt");
        get.host = "photos.gw.example.com:9020";
        let resp = get.send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "meow");

        // Not a bucket label: falls through to ordinary routing.
        let mut get = Call::new("GET", "/cats/tom.txt");
        get.host = "a.b.gw.example.com";
        assert_eq!(get.send(&h.app).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_virtual_hosted_disabled() {
        let h = harness();
        h.registry
            .update_settings(Settings::default())
            .await
            .unwrap();
        let mut get = Call::new("GET", "/cats/tom.txt");
        get.host = "photos.gw.example.com";
        assert_eq!(get.send(&h.app).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bucket_level_methods() {
        let h = harness();
        let resp = Call::new("HEAD", "/s3/photos").send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = Call::new("PUT", "/s3/photos").send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(error_code(resp).await, "BucketAlreadyExists");

        let resp = Call::new("GET", "/s3/photos").send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let resp = Call::new("POST", "/s3/photos/x").send(&h.app).await;
        assert_eq!(error_code(resp).await, "MethodNotAllowed");
    }

    #[tokio::test]
    async fn test_body_limits() {
        let h = harness();
        let mut call = Call::new("PUT", "/s3/photos/x").body(b"data");
        call.content_length = false;
        let resp = call.send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::LENGTH_REQUIRED);
        assert_eq!(error_code(resp).await, "MissingContentLength");

        let mut config = Config::default();
        config.server.max_object_size = 3;
        let h = harness_with(config);
        let resp = Call::new("PUT", "/s3/photos/x").body(b"data").send(&h.app).await;
        assert_eq!(error_code(resp).await, "EntityTooLarge");
        assert!(h.store.keys("photos").await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_delete() {
        let h = harness();
        for key in ["/s3/photos/a", "/s3/photos/b"] {
            Call::new("PUT", key).body(b"x").send(&h.app).await;
        }
        let xml = b"<Delete><Object><Key>a</Key></Object><Object><Key>b</Key></Object></Delete>";
        let resp = Call::new("POST", "/s3/photos?delete").body(xml).send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.contains("<Deleted><Key>a</Key></Deleted>"));
        assert!(h.store.keys("photos").await.is_empty());

        let resp = Call::new("POST", "/s3/photos?delete")
            .key("AKREAD")
            .body(xml)
            .send(&h.app)
            .await;
        assert_eq!(error_code(resp).await, "AccessDenied");
    }

    #[tokio::test]
    async fn test_multipart_over_http() {
        let h = harness();
        let resp = Call::new("POST", "/s3/photos/big.bin?uploads").send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        let upload_id = between(&body, "<UploadId>", "</UploadId>").to_string();

        let uri = format!("/s3/photos/big.bin?partNumber=1&uploadId={upload_id}");
        let resp = Call::new("PUT", &uri).body(b"hello ").send(&h.app).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let etag1 = resp.headers()["etag"].to_str().unwrap().to_string();

        let uri = format!("/s3/photos/big.bin?partNumber=2&uploadId={upload_id}");
        let resp = Call::new("PUT", &uri).body(b"world").send(&h.app).await;
        let etag2 = resp.headers()["etag"].to_str().unwrap().to_string();

        let uri = format!("/s3/photos/big.bin?uploadId={upload_id}");
        let resp = Call::new("GET", &uri).send(&h.app).await;
        let listing = body_string(resp).await;
        assert_eq!(listing.matches("<Part>").count(), 2);

        let complete = format!(
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>{etag1}</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>{etag2}</ETag></Part>\
             </CompleteMultipartUpload>"
        );
        let resp = Call::new("POST", &uri)
            .body(complete.as_bytes())
            .send(&h.app)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = Call::new("GET", "/s3/photos/big.bin").send(&h.app).await;
        assert_eq!(body_string(resp).await, "hello world");

        // The upload is gone once completed.
        let resp = Call::new("DELETE", &uri).send(&h.app).await;
        assert_eq!(error_code(resp).await, "NoSuchUpload");
    }

    #[tokio::test]
    async fn test_part_number_out_of_range() {
        let h = harness();
        for n in ["0", "10001"] {
            let uri = format!("/s3/photos/k?partNumber={n}&uploadId=whatever");
            let resp = Call::new("PUT", &uri).body(b"x").send(&h.app).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(error_code(resp).await, "InvalidPartNumber");
        }
    }

    #[test]
    fn test_parse_query() {
        let q = parse_query(Some("uploads&partNumber=3&uploadId=abc%2Fdef"));
        assert_eq!(q["uploads"], "");
        assert_eq!(q["partNumber"], "3");
        assert_eq!(q["uploadId"], "abc/def");
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_classify() {
        let target = BucketTarget::new("b", "k");
        let none = HashMap::new();
        let headers = HeaderMap::new();
        let mut copy = HeaderMap::new();
        copy.insert("x-amz-copy-source", HeaderValue::from_static("/b/src"));
        let part = parse_query(Some("partNumber=1&uploadId=u"));

        assert_eq!(
            Operation::classify(&Method::PUT, &target, &part, &copy).unwrap(),
            Operation::UploadPartCopy
        );
        assert_eq!(
            Operation::classify(&Method::PUT, &target, &none, &copy).unwrap(),
            Operation::CopyObject
        );
        assert_eq!(
            Operation::classify(&Method::DELETE, &target, &parse_query(Some("uploadId=u")), &headers)
                .unwrap(),
            Operation::AbortMultipartUpload
        );
        assert!(Operation::classify(&Method::PATCH, &target, &none, &headers).is_err());
        assert_eq!(
            Operation::AbortMultipartUpload.permissions(),
            &[Permission::Write]
        );
    }
}

use std::path::Path;

use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, Query, State},
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::{
    app_state::AppState,
    auth::{self, CurrentUser, TokenKind},
    db,
    error::AppError,
    ingest, rag,
    models::{
        AskParams, AskResponse, Credentials, MessageResponse, RefreshRequest, TokenPair,
        UploadResponse,
    },
};

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    let max_upload = app_state.config.max_upload_bytes;
    Router::new()
        .route("/signup", post(signup_handler))
        .route("/signin", post(signin_handler))
        .route("/refresh", post(refresh_handler))
        .route("/protected", get(protected_handler))
        .route(
            "/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(max_upload)),
        )
        .route("/ask", get(ask_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

/// CORS para los orígenes configurados. Con `*` no se permiten credenciales.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Origen CORS inválido ignorado: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

// --- Handlers de autenticación ---

#[axum::debug_handler(state = AppState)]
async fn signup_handler(
    State(state): State<AppState>,
    Json(payload): Json<Credentials>,
) -> Result<Json<TokenPair>, AppError> {
    let username = payload.username.trim().to_string();
    if username.is_empty() || payload.password.is_empty() {
        return Err(AppError::BadRequest(
            "Username and password must not be empty".to_string(),
        ));
    }

    if db::find_user_by_username(&state.db, &username).await?.is_some() {
        return Err(AppError::UsernameTaken);
    }

    let password = payload.password;
    let hashed = tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(anyhow::Error::from)??;
    let user = db::insert_user(&state.db, &username, &hashed).await?;
    info!("Usuario registrado: {} (id {})", user.username, user.id);

    Ok(Json(state.tokens.issue_pair(&user.username)?))
}

#[axum::debug_handler(state = AppState)]
async fn signin_handler(
    State(state): State<AppState>,
    Json(payload): Json<Credentials>,
) -> Result<Json<TokenPair>, AppError> {
    let user = db::find_user_by_username(&state.db, payload.username.trim())
        .await?
        .ok_or(AppError::InvalidCredentials)?;

    let hashed = user.hashed_password.clone();
    let password = payload.password;
    let valid = tokio::task::spawn_blocking(move || auth::verify_password(&password, &hashed))
        .await
        .map_err(anyhow::Error::from)?;
    if !valid {
        return Err(AppError::InvalidCredentials);
    }
    info!(
        "Login de '{}' (id {}, alta {})",
        user.username,
        user.id,
        user.created_at.format("%Y-%m-%d")
    );

    Ok(Json(state.tokens.issue_pair(&user.username)?))
}

/// Emite un nuevo access token y devuelve el mismo refresh token (sin rotación).
#[axum::debug_handler(state = AppState)]
async fn refresh_handler(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let claims = state
        .tokens
        .decode(&payload.refresh_token, TokenKind::Refresh)
        .map_err(|_| AppError::InvalidRefreshToken)?;

    let access_token = state.tokens.create_access_token(&claims.sub)?;
    Ok(Json(TokenPair::bearer(access_token, payload.refresh_token)))
}

#[axum::debug_handler(state = AppState)]
async fn protected_handler(CurrentUser(user): CurrentUser) -> Json<MessageResponse> {
    Json(MessageResponse {
        message: format!("Hello {}, you are authenticated!", user.username),
    })
}

// --- Handlers de documentos ---

#[axum::debug_handler(state = AppState)]
async fn upload_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .and_then(ingest::sanitize_filename)
            .ok_or_else(|| AppError::BadRequest("Uploaded file has no valid name".to_string()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Could not read uploaded file: {e}")))?;
        upload = Some((filename, bytes));
        break;
    }

    let (filename, bytes) =
        upload.ok_or_else(|| AppError::BadRequest("Missing 'file' field".to_string()))?;

    // Nada se escribe ni se indexa si la extensión no está soportada.
    ingest::DocumentKind::from_path(Path::new(&filename))?;

    let path = ingest::save_upload(&state.upload_dir, &user.username, &filename, &bytes).await?;
    debug!("Copia de la subida en {}", path.display());
    let summary = ingest::ingest_upload(
        &state.vector_store,
        &state.llm_manager,
        &state.splitter,
        &filename,
        &bytes,
        &user.username,
    )
    .await?;

    Ok(Json(UploadResponse {
        message: "Document uploaded successfully.".to_string(),
        filename,
        chunks: summary.chunks_created,
    }))
}

#[axum::debug_handler(state = AppState)]
async fn ask_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<AskParams>,
) -> Result<Json<AskResponse>, AppError> {
    if params.q.trim().is_empty() {
        return Err(AppError::BadRequest(
            "Query parameter 'q' must not be empty".to_string(),
        ));
    }

    let answer = rag::rag_query(
        &state.vector_store,
        &state.llm_manager,
        &user.username,
        &params.q,
        state.config.retriever_top_k,
    )
    .await?;

    Ok(Json(AskResponse {
        question: params.q,
        answer,
    }))
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        embeddings::HashingEmbedder,
        llm::{testing::EchoChat, LlmManager},
        vector_store::{MetadataFilter, VectorStore},
    };
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
        response::Response,
    };
    use chrono::Duration;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const SECRET: &str = "integration-secret";
    const BOUNDARY: &str = "docrag-test-boundary";

    struct TestApp {
        router: Router,
        state: AppState,
        _dir: TempDir,
    }

    async fn test_app() -> TestApp {
        let dir = TempDir::new().unwrap();
        let upload_dir = dir.path().join("uploads").to_string_lossy().to_string();
        let config = AppConfig::from_source(|key| match key {
            "JWT_SECRET_KEY" => Some(SECRET.to_string()),
            "EMBEDDING_PROVIDER" => Some("hashing".to_string()),
            "UPLOAD_DIR" => Some(upload_dir.clone()),
            _ => None,
        })
        .unwrap();

        let pool = db::connect("sqlite::memory:").await.unwrap();
        db::ensure_schema(&pool).await.unwrap();
        let store = VectorStore::open(dir.path().join("index")).await.unwrap();
        let llm = LlmManager::new(Arc::new(HashingEmbedder::default()), Arc::new(EchoChat::default()));
        let state = AppState::new(config, pool, store, llm).unwrap();

        TestApp {
            router: create_router(state.clone()),
            state,
            _dir: dir,
        }
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let response: Response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn json_post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn authed_get(uri: &str, token: &str) -> Request<Body> {
        Request::get(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    fn upload_request(token: &str, filename: &str, content: &str) -> Request<Body> {
        upload_bytes(token, filename, content.as_bytes())
    }

    fn upload_bytes(token: &str, filename: &str, content: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::post("/upload")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn signup(app: &TestApp, username: &str, password: &str) -> TokenPair {
        let (status, body) = send(
            app,
            json_post("/signup", json!({ "username": username, "password": password })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "signup failed: {body}");
        serde_json::from_value(body).unwrap()
    }

    fn ask_uri(question: &str) -> String {
        format!("/ask?q={}", question.replace(' ', "%20").replace('?', "%3F"))
    }

    #[tokio::test]
    async fn signup_returns_a_usable_token_pair() {
        let app = test_app().await;
        let pair = signup(&app, "alice", "wonderland").await;

        assert_eq!(pair.token_type, "bearer");
        let (status, body) = send(&app, authed_get("/protected", &pair.access_token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Hello alice, you are authenticated!");
    }

    #[tokio::test]
    async fn duplicate_signup_is_rejected_with_400() {
        let app = test_app().await;
        signup(&app, "alice", "first").await;

        let (status, body) = send(
            &app,
            json_post("/signup", json!({ "username": "alice", "password": "second" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "Username already exists");
    }

    #[tokio::test]
    async fn signin_checks_the_stored_hash() {
        let app = test_app().await;
        signup(&app, "alice", "wonderland").await;

        let (status, _) = send(
            &app,
            json_post("/signin", json!({ "username": "alice", "password": "nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &app,
            json_post("/signin", json!({ "username": "mallory", "password": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            &app,
            json_post("/signin", json!({ "username": "alice", "password": "wonderland" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let pair: TokenPair = serde_json::from_value(body).unwrap();
        let (status, _) = send(&app, authed_get("/protected", &pair.access_token)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_endpoints_reject_missing_expired_and_tampered_tokens() {
        let app = test_app().await;
        let pair = signup(&app, "alice", "wonderland").await;

        let expired = auth::TokenService::new(SECRET, Duration::hours(-2), Duration::days(7))
            .create_access_token("alice")
            .unwrap();
        let mut parts: Vec<String> = pair.access_token.split('.').map(String::from).collect();
        let flipped = if parts[1].starts_with('e') { "f" } else { "e" };
        parts[1].replace_range(0..1, flipped);
        let tampered = parts.join(".");

        for uri in ["/protected", "/ask?q=hello"] {
            let (status, _) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri} without token");

            for token in [&expired, &tampered, &pair.refresh_token] {
                let (status, body) = send(&app, authed_get(uri, token)).await;
                assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
                assert_eq!(body["detail"], "Invalid token");
            }
        }

        let (status, _) = send(&app, upload_request(&expired, "a.txt", "hi")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn tokens_for_unknown_users_yield_404() {
        let app = test_app().await;
        let ghost = app.state.tokens.create_access_token("ghost").unwrap();

        let (status, body) = send(&app, authed_get("/protected", &ghost)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "User not found");
    }

    #[tokio::test]
    async fn refresh_mints_an_accepted_access_token() {
        let app = test_app().await;
        let pair = signup(&app, "alice", "wonderland").await;

        let (status, body) = send(
            &app,
            json_post("/refresh", json!({ "refresh_token": pair.refresh_token })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let refreshed: TokenPair = serde_json::from_value(body).unwrap();
        assert_eq!(refreshed.refresh_token, pair.refresh_token);

        let (status, _) = send(&app, authed_get("/protected", &refreshed.access_token)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn refresh_rejects_invalid_tokens() {
        let app = test_app().await;
        let pair = signup(&app, "alice", "wonderland").await;

        for token in ["garbage", pair.access_token.as_str()] {
            let (status, body) =
                send(&app, json_post("/refresh", json!({ "refresh_token": token }))).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["detail"], "Invalid refresh token");
        }
    }

    #[tokio::test]
    async fn uploaded_text_answers_questions_without_leaking_other_tenants() {
        let app = test_app().await;
        let alice = signup(&app, "alice", "a-pass").await;
        let bob = signup(&app, "bob", "b-pass").await;

        let (status, body) = send(
            &app,
            upload_request(&alice.access_token, "falcon.txt", "The falcon project budget is 42 million."),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["message"], "Document uploaded successfully.");
        assert_eq!(body["chunks"], 1);

        let (status, _) = send(
            &app,
            upload_request(&bob.access_token, "bob.txt", "The falcon project budget is 7 million."),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let question = "What is the falcon project budget?";
        let (status, body) = send(&app, authed_get(&ask_uri(question), &alice.access_token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["question"], question);
        let answer = body["answer"].as_str().unwrap();
        assert!(answer.contains("42 million"));
        assert!(!answer.contains("7 million"));

        let (_, body) = send(&app, authed_get(&ask_uri(question), &bob.access_token)).await;
        let answer = body["answer"].as_str().unwrap();
        assert!(answer.contains("7 million"));
        assert!(!answer.contains("42 million"));
    }

    #[tokio::test]
    async fn same_named_uploads_keep_each_users_content() {
        let app = test_app().await;
        let alice = signup(&app, "alice", "a-pass").await;
        let bob = signup(&app, "bob", "b-pass").await;

        let (status, _) = send(
            &app,
            upload_request(&alice.access_token, "notes.txt", "alice shopping list: apples"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(
            &app,
            upload_request(&bob.access_token, "notes.txt", "bob private salary 999"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, authed_get(&ask_uri("What is in my notes?"), &alice.access_token)).await;
        let answer = body["answer"].as_str().unwrap();
        assert!(answer.contains("apples"));
        assert!(!answer.contains("salary"));

        let alice_copy = app.state.upload_dir.join("alice").join("notes.txt");
        let bob_copy = app.state.upload_dir.join("bob").join("notes.txt");
        assert_eq!(std::fs::read_to_string(alice_copy).unwrap(), "alice shopping list: apples");
        assert_eq!(std::fs::read_to_string(bob_copy).unwrap(), "bob private salary 999");
    }

    #[tokio::test]
    async fn uploaded_pdf_answers_questions() {
        let app = test_app().await;
        let alice = signup(&app, "alice", "a-pass").await;
        let pdf = crate::ingest::testing::single_page_pdf("The ferret burrow code is 31337");

        let (status, body) = send(&app, upload_bytes(&alice.access_token, "burrow.pdf", &pdf)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["chunks"].as_u64().unwrap() > 0);

        let (status, body) =
            send(&app, authed_get(&ask_uri("What is the burrow code?"), &alice.access_token)).await;
        assert_eq!(status, StatusCode::OK);
        let answer = body["answer"].as_str().unwrap();
        assert!(!answer.is_empty());
        assert!(answer.contains("31337"));
    }

    #[tokio::test]
    async fn unsupported_uploads_fail_without_touching_the_index() {
        let app = test_app().await;
        let alice = signup(&app, "alice", "a-pass").await;

        let (status, body) = send(&app, upload_request(&alice.access_token, "deck.pptx", "binary")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().contains("Unsupported file type"));
        let indexed = app
            .state
            .vector_store
            .count(&MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(indexed, 0);
        assert!(!app.state.upload_dir.join("alice").join("deck.pptx").exists());
    }

    #[tokio::test]
    async fn upload_without_a_file_field_is_a_bad_request() {
        let app = test_app().await;
        let alice = signup(&app, "alice", "a-pass").await;
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nvalue\r\n--{BOUNDARY}--\r\n"
        );
        let request = Request::post("/upload")
            .header(header::AUTHORIZATION, format!("Bearer {}", alice.access_token))
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap();

        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn blank_questions_are_rejected() {
        let app = test_app().await;
        let alice = signup(&app, "alice", "a-pass").await;

        let (status, _) = send(&app, authed_get("/ask?q=%20", &alice.access_token)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = test_app().await;
        let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn cors_preflight_allows_the_configured_origin() {
        let app = test_app().await;
        let router = app
            .router
            .clone()
            .layer(cors_layer(&["http://localhost:5173".to_string()]));

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/signin")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:5173"
        );
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
    }
}

pub mod chat;
pub mod config;
pub mod error;
pub mod generation;
pub mod payments;
pub mod reconstruct;
pub mod render;
pub mod security;
pub mod store;
pub mod tokens;

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartError;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use http::{Extensions, HeaderMap, HeaderValue, Method, StatusCode};
use image::ImageFormat;
use modelgen_mesh::ExportFormat;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::chat::{ChatEngine, ChatStep, WELCOME_MESSAGE};
use crate::config::{RateLimit, ServerConfig};
use crate::error::ApiError;
use crate::generation::{
    ChatTurn, GeneratedCode, GenerationError, LanguageModel, OpenAiCompatibleModel, ScadGenerator,
    Shape, TemplateModel, apply_parameters, extract_parameters, normalize_number,
};
use crate::payments::{
    OfflineGateway, OrderRecord, OrderStatus, Package, PaymentConfirmation, PaymentError,
    PaymentGateway, PaymentService, RazorpayGateway,
};
use crate::reconstruct::{
    HttpReconstructor, ImageReconstructor, ReconstructError, UnavailableReconstructor,
    preview_from_image,
};
use crate::render::{CadRenderer, OpenScadRenderer};
use crate::security::{CsrfTokens, RateLimiter, validate_file_name, validate_identifier};
use crate::store::{
    ListQuery, ModelMeta, ModelType, ParameterValue, SortOrder, Store, StoreError, UploadInfo,
    file_exists, new_id,
};
use crate::tokens::{Operation, TokenLedger};

pub const USER_HEADER: &str = "x-user-id";
pub const CSRF_HEADER: &str = "x-csrf-token";
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to open data directory: {0}")]
    Store(#[from] StoreError),
    #[error("failed to build language model client: {0}")]
    LanguageModel(#[source] reqwest::Error),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error(transparent)]
    Reconstruct(#[from] ReconstructError),
}

/// The external collaborators behind their traits.
pub struct Services {
    pub language_model: Arc<dyn LanguageModel>,
    pub renderer: Arc<dyn CadRenderer>,
    pub reconstructor: Arc<dyn ImageReconstructor>,
    pub gateway: Arc<dyn PaymentGateway>,
}

impl Services {
    /// Real clients where the configuration names an endpoint, offline
    /// stand-ins otherwise.
    pub fn from_config(config: &ServerConfig) -> Result<Self, StartupError> {
        let language_model: Arc<dyn LanguageModel> = match &config.language_model.url {
            Some(url) => {
                info!(url, model = %config.language_model.model, "using language model endpoint");
                Arc::new(
                    OpenAiCompatibleModel::new(url.clone(), &config.language_model)
                        .map_err(StartupError::LanguageModel)?,
                )
            }
            None => {
                warn!("no language model configured, generating from templates");
                Arc::new(TemplateModel)
            }
        };

        let gateway: Arc<dyn PaymentGateway> = match &config.razorpay {
            Some(credentials) => Arc::new(RazorpayGateway::new(credentials.clone())?),
            None => {
                warn!("Razorpay is not configured, payments use the offline gateway");
                Arc::new(OfflineGateway)
            }
        };

        let reconstructor: Arc<dyn ImageReconstructor> = match &config.reconstruct_url {
            Some(url) => Arc::new(HttpReconstructor::new(url.clone())?),
            None => Arc::new(UnavailableReconstructor),
        };

        Ok(Self {
            language_model,
            renderer: Arc::new(OpenScadRenderer::new(config.openscad.clone())),
            reconstructor,
            gateway,
        })
    }
}

pub struct AppState {
    config: ServerConfig,
    store: Store,
    csrf: CsrfTokens,
    limiter: RateLimiter,
    ledger: Arc<TokenLedger>,
    payments: PaymentService,
    generator: ScadGenerator,
    chat: ChatEngine,
    renderer: Arc<dyn CadRenderer>,
    reconstructor: Arc<dyn ImageReconstructor>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub async fn new(config: ServerConfig, services: Services) -> Result<SharedState, StartupError> {
        let store = Store::open(config.data_dir.clone()).await?;
        let ledger = Arc::new(TokenLedger::new(
            store.clone(),
            config.free_generations,
            config.costs.clone(),
        ));
        let payments = PaymentService::new(
            store.clone(),
            ledger.clone(),
            services.gateway,
            config.packages.clone(),
        );
        let generator = ScadGenerator::new(
            services.language_model.clone(),
            config.language_model.max_retries,
        );
        let chat =
            ChatEngine::new(services.language_model).with_idle_timeout(config.session_idle());
        let csrf = CsrfTokens::new(config.session_idle());
        info!(
            data_dir = %config.data_dir.display(),
            packages = config.packages.len(),
            "application state ready"
        );

        Ok(Arc::new(Self {
            config,
            store,
            csrf,
            limiter: RateLimiter::default(),
            ledger,
            payments,
            generator,
            chat,
            renderer: services.renderer,
            reconstructor: services.reconstructor,
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

pub fn app(state: SharedState) -> Router {
    let body_limit = state.config.max_image_bytes + MULTIPART_OVERHEAD;
    Router::new()
        .route("/api/health", get(health))
        .route("/api/session", get(session))
        .route("/api/chat/start", post(chat_start))
        .route("/api/chat/message", post(chat_message))
        .route("/api/chat/history/{session_id}", get(chat_history))
        .route("/api/generate", post(generate))
        .route("/api/3d-model/{model_id}", get(model_details))
        .route("/api/my-models", get(my_models))
        .route("/api/download-model/{model_id}/{format}", get(download_model))
        .route("/api/upload-image", post(upload_image))
        .route("/api/user-images", get(user_images))
        .route("/api/generate-3d-from-image", post(generate_from_image))
        .route("/api/packages", get(packages))
        .route("/api/create-payment", post(create_payment))
        .route("/api/verify-payment", post(verify_payment))
        .route("/api/payment-history", get(payment_history))
        .route("/api/balance", get(balance))
        .route("/preview/{user_id}/{model_id}", get(preview_file))
        .route("/model/{user_id}/{file_name}", get(mesh_file))
        .fallback(unknown_route)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    success: bool,
    user_id: String,
    csrf_token: String,
}

#[derive(Debug, Serialize)]
struct ChatStartResponse {
    success: bool,
    session_id: String,
    welcome_message: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatMessageRequest {
    session_id: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ChatMessageResponse {
    success: bool,
    response: String,
    #[serde(flatten)]
    model: Option<ModelPayload>,
}

#[derive(Debug, Serialize)]
struct ChatHistoryResponse {
    success: bool,
    session_id: String,
    history: Vec<ChatTurn>,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    model_type: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    model_id: Option<String>,
}

/// What chat replies, generation and image conversion report about a model.
#[derive(Debug, Serialize)]
struct ModelPayload {
    model_id: String,
    model_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mesh_url: Option<String>,
    parameters: BTreeMap<String, ParameterValue>,
    revision: u64,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    success: bool,
    session_id: String,
    model: ModelPayload,
}

#[derive(Debug, Serialize)]
struct ModelDetailsResponse {
    success: bool,
    model_id: String,
    model_type: &'static str,
    created_at: String,
    updated_at: String,
    revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview_url: Option<String>,
    formats: BTreeMap<&'static str, String>,
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    page: Option<String>,
    sort: Option<String>,
    #[serde(rename = "type")]
    model_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct ModelSummary {
    model_id: String,
    model_type: &'static str,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    success: bool,
    page: usize,
    models: Vec<ModelSummary>,
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct UserImagesResponse {
    success: bool,
    images: Vec<UploadInfo>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    success: bool,
    file_id: String,
    file_size: u64,
    file_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ImageConversionRequest {
    file_id: String,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ImageConversionResponse {
    success: bool,
    #[serde(flatten)]
    model: ModelPayload,
    processing_time: f64,
}

#[derive(Debug, Serialize)]
struct PackagesResponse {
    success: bool,
    packages: Vec<Package>,
}

#[derive(Debug, Deserialize)]
struct CreatePaymentRequest {
    package_id: String,
}

#[derive(Debug, Serialize)]
struct OrderView {
    order_id: String,
    gateway_order_id: String,
    amount: u64,
    currency: String,
    tokens: u64,
    status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreatePaymentResponse {
    success: bool,
    order: OrderView,
}

#[derive(Debug, Deserialize)]
struct VerifyPaymentRequest {
    order_id: String,
    gateway_payment_id: String,
    gateway_order_id: String,
    gateway_signature: String,
}

#[derive(Debug, Serialize)]
struct VerifyPaymentResponse {
    success: bool,
    tokens: u64,
    new_balance: u64,
}

#[derive(Debug, Serialize)]
struct PaymentHistoryEntry {
    order_id: String,
    package_id: String,
    amount: u64,
    currency: String,
    tokens: u64,
    status: OrderStatus,
    created_at: String,
}

impl From<OrderRecord> for PaymentHistoryEntry {
    fn from(order: OrderRecord) -> Self {
        Self {
            order_id: order.order_id,
            package_id: order.package_id,
            amount: order.amount,
            currency: order.currency,
            tokens: order.tokens,
            status: order.status,
            created_at: order.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PaymentHistoryResponse {
    success: bool,
    history: Vec<PaymentHistoryEntry>,
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    success: bool,
    balance: u64,
    free_generations_remaining: u32,
}

/// Files a model can be downloaded as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownloadFormat {
    Stl,
    Obj,
    Scad,
}

impl DownloadFormat {
    const ALL: [Self; 3] = [Self::Stl, Self::Obj, Self::Scad];

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "stl" => Some(Self::Stl),
            "obj" => Some(Self::Obj),
            "scad" => Some(Self::Scad),
            _ => None,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Stl => "stl",
            Self::Obj => "obj",
            Self::Scad => "scad",
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Self::Stl => ExportFormat::Stl.content_type(),
            Self::Obj => ExportFormat::Obj.content_type(),
            Self::Scad => "text/plain; charset=utf-8",
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn unknown_route() -> ApiError {
    ApiError::not_found("no such endpoint")
}

/// Issues a CSRF token. A caller that presents an earlier user id keeps it.
/// Issuance is throttled per peer address.
async fn session(
    State(state): State<SharedState>,
    extensions: Extensions,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>, ApiError> {
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "local".to_string());
    throttle(&state, "session", &peer, state.config.rate_limits.session)?;

    let user_id = match header_value(&headers, USER_HEADER).filter(|id| validate_identifier(id)) {
        Some(user_id) => user_id.to_string(),
        None => format!("user_{}", uuid::Uuid::new_v4().simple()),
    };
    let csrf_token = state.csrf.issue(&user_id);
    info!(user_id, "session issued");
    Ok(Json(SessionResponse {
        success: true,
        user_id,
        csrf_token,
    }))
}

async fn chat_start(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<ChatStartResponse>, ApiError> {
    let user_id = authorized(&state, &headers)?;
    throttle(
        &state,
        "chat_start",
        &user_id,
        state.config.rate_limits.chat_start,
    )?;
    let session_id = state.chat.start(&user_id);
    Ok(Json(ChatStartResponse {
        success: true,
        session_id,
        welcome_message: WELCOME_MESSAGE,
    }))
}

async fn chat_message(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChatMessageResponse>, ApiError> {
    let user_id = authorized(&state, &headers)?;
    throttle(
        &state,
        "chat_message",
        &user_id,
        state.config.rate_limits.chat_message,
    )?;
    let request: ChatMessageRequest = parse_json(&body)?;
    let message = request.message.trim();
    if message.is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }

    let (shape, values) = match state
        .chat
        .message(&user_id, &request.session_id, message)
        .await?
    {
        ChatStep::Reply(response) => {
            return Ok(Json(ChatMessageResponse {
                success: true,
                response,
                model: None,
            }));
        }
        ChatStep::Build { shape, values } => (shape, values),
    };

    let model_id = new_id("model");
    let built = charged(
        &state,
        &user_id,
        Operation::ParametricGeneration,
        &model_id,
        create_parametric(
            &state,
            &user_id,
            &model_id,
            GeneratedCode::from_shape(shape, &values),
            &BTreeMap::new(),
            Some(message),
        ),
    )
    .await;

    let (response, model) = match built {
        Ok(model) => (
            format!(
                "Here's your {}! Adjust the parameters to refine it.",
                shape.name
            ),
            Some(model),
        ),
        Err(err) if err.status == StatusCode::PAYMENT_REQUIRED => (
            format!("I couldn't build that yet: {}. Buy more tokens to keep generating.", err.message),
            None,
        ),
        Err(err) => {
            state.chat.record_reply(
                &request.session_id,
                "Something went wrong while building your model. Please try again.",
            );
            return Err(err);
        }
    };
    state.chat.record_reply(&request.session_id, &response);
    Ok(Json(ChatMessageResponse {
        success: true,
        response,
        model,
    }))
}

async fn chat_history(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<ChatHistoryResponse>, ApiError> {
    let user_id = authenticated(&state, &headers)?;
    let history = state.chat.history(&user_id, &session_id)?;
    Ok(Json(ChatHistoryResponse {
        success: true,
        session_id,
        history,
    }))
}

/// Fresh generation from a prompt or a known shape, or an in-place update of
/// `model_id`. Parameter-only updates are free; a prompt always costs.
async fn generate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<GenerateResponse>, ApiError> {
    let user_id = authorized(&state, &headers)?;
    throttle(&state, "generate", &user_id, state.config.rate_limits.generate)?;
    let request: GenerateRequest = parse_json(&body)?;

    let session_id = match request.session_id {
        Some(id) if validate_identifier(&id) => id,
        Some(_) => return Err(ApiError::bad_request("invalid session_id")),
        None => new_id("session"),
    };
    let parameters = parameter_strings(request.parameters)?;
    let prompt = request
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty());
    let model_type = request
        .model_type
        .as_deref()
        .map(str::trim)
        .filter(|model_type| !model_type.is_empty());

    let model = match (request.model_id.as_deref(), prompt) {
        (Some(model_id), None) => {
            update_parametric(&state, &user_id, model_id, None, &parameters).await?
        }
        (Some(model_id), Some(prompt)) => {
            charged(
                &state,
                &user_id,
                Operation::ParametricGeneration,
                model_id,
                update_parametric(&state, &user_id, model_id, Some(prompt), &parameters),
            )
            .await?
        }
        (None, _) => {
            let Some(description) = prompt.or(model_type) else {
                return Err(ApiError::bad_request("a prompt or model_type is required"));
            };
            let template = match prompt {
                None => model_type.and_then(Shape::named),
                Some(_) => None,
            };
            let model_id = new_id("model");
            charged(
                &state,
                &user_id,
                Operation::ParametricGeneration,
                &model_id,
                async {
                    let generated = match template {
                        Some(shape) => GeneratedCode::from_shape(shape, &parameters),
                        None => state.generator.generate(description, None).await,
                    };
                    create_parametric(
                        &state,
                        &user_id,
                        &model_id,
                        generated,
                        &parameters,
                        Some(description),
                    )
                    .await
                },
            )
            .await?
        }
    };

    Ok(Json(GenerateResponse {
        success: true,
        session_id,
        model,
    }))
}

async fn model_details(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(model_id): Path<String>,
) -> Result<Json<ModelDetailsResponse>, ApiError> {
    let user_id = authenticated(&state, &headers)?;
    let meta = state.store.load_model(&user_id, &model_id).await?;

    let mut formats = BTreeMap::new();
    for format in DownloadFormat::ALL {
        if format_available(&state, &meta, format).await? {
            formats.insert(
                format.extension(),
                format!("/api/download-model/{model_id}/{}", format.extension()),
            );
        }
    }

    Ok(Json(ModelDetailsResponse {
        success: true,
        preview_url: existing_preview_url(&state, &meta).await?,
        model_id: meta.model_id,
        model_type: meta.model_type.as_str(),
        created_at: meta.created_at.to_rfc3339(),
        updated_at: meta.updated_at.to_rfc3339(),
        revision: meta.revision,
        formats,
    }))
}

async fn my_models(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<ModelsResponse>, ApiError> {
    let user_id = authenticated(&state, &headers)?;
    let page = match query.page.as_deref() {
        None => 1,
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|page| *page >= 1)
            .ok_or_else(|| ApiError::bad_request(format!("invalid page `{raw}`")))?,
    };
    let sort = match query.sort.as_deref() {
        None => SortOrder::Newest,
        Some(raw) => SortOrder::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("invalid sort `{raw}`")))?,
    };
    let model_type = match query.model_type.as_deref() {
        None | Some("") | Some("all") => None,
        Some(raw) => Some(
            ModelType::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("invalid type `{raw}`")))?,
        ),
    };

    let (metas, has_more) = state
        .store
        .list_models(
            &user_id,
            &ListQuery {
                page,
                sort,
                model_type,
            },
        )
        .await?;

    let mut models = Vec::with_capacity(metas.len());
    for meta in metas {
        models.push(ModelSummary {
            preview_url: existing_preview_url(&state, &meta).await?,
            model_id: meta.model_id,
            model_type: meta.model_type.as_str(),
            created_at: meta.created_at.to_rfc3339(),
        });
    }

    Ok(Json(ModelsResponse {
        success: true,
        page,
        models,
        has_more,
    }))
}

async fn download_model(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((model_id, format)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let user_id = authenticated(&state, &headers)?;
    let format = DownloadFormat::parse(&format).ok_or_else(|| {
        ApiError::bad_request(format!("unsupported format `{format}`, use stl, obj or scad"))
    })?;
    state.store.load_model(&user_id, &model_id).await?;

    let bytes = match format {
        DownloadFormat::Obj => obj_bytes(&state, &user_id, &model_id).await?,
        other => {
            state
                .store
                .read_artifact(&user_id, &model_id, other.extension())
                .await?
        }
    };
    info!(user_id, model_id, format = format.extension(), "model downloaded");
    file_response(
        bytes,
        format.content_type(),
        Some(&format!("{model_id}.{}", format.extension())),
    )
}

async fn upload_image(
    State(state): State<SharedState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let user_id = authorized(&state, &headers)?;
    throttle(&state, "upload", &user_id, state.config.rate_limits.upload)?;

    let mut image = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some("image") {
            image = Some(field.bytes().await.map_err(multipart_error)?);
            break;
        }
    }
    let bytes = image.ok_or_else(|| ApiError::bad_request("multipart field `image` is required"))?;
    if bytes.is_empty() {
        return Err(ApiError::bad_request("uploaded image is empty"));
    }
    if bytes.len() > state.config.max_image_bytes {
        return Err(ApiError::payload_too_large(format!(
            "image exceeds the {} byte limit",
            state.config.max_image_bytes
        )));
    }

    let (extension, file_type) = match image::guess_format(&bytes) {
        Ok(ImageFormat::Png) => ("png", "image/png"),
        Ok(ImageFormat::Jpeg) => ("jpg", "image/jpeg"),
        Ok(ImageFormat::WebP) => ("webp", "image/webp"),
        _ => {
            return Err(ApiError::bad_request(
                "unsupported image type, upload PNG, JPEG or WebP",
            ));
        }
    };
    let file_id = format!("{}.{extension}", uuid::Uuid::new_v4().simple());
    state.store.save_upload(&user_id, &file_id, &bytes).await?;
    info!(user_id, file_id, size = bytes.len(), "image uploaded");

    Ok(Json(UploadResponse {
        success: true,
        file_id,
        file_size: bytes.len() as u64,
        file_type,
    }))
}

async fn user_images(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<UserImagesResponse>, ApiError> {
    let user_id = authenticated(&state, &headers)?;
    let images = state.store.list_uploads(&user_id).await?;
    Ok(Json(UserImagesResponse {
        success: true,
        images,
    }))
}

async fn generate_from_image(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ImageConversionResponse>, ApiError> {
    let user_id = authorized(&state, &headers)?;
    throttle(
        &state,
        "image_to_3d",
        &user_id,
        state.config.rate_limits.image_to_3d,
    )?;
    let request: ImageConversionRequest = parse_json(&body)?;
    if !validate_file_name(&request.file_id) {
        return Err(ApiError::bad_request("invalid file_id"));
    }
    let parameters = parameter_strings(request.parameters)?;
    let image = state.store.read_upload(&user_id, &request.file_id).await?;

    let model_id = new_id("img3d");
    let started = Instant::now();
    let model = charged(
        &state,
        &user_id,
        Operation::ImageTo3d,
        &model_id,
        convert_image(&state, &user_id, &model_id, &request.file_id, image, &parameters),
    )
    .await?;

    Ok(Json(ImageConversionResponse {
        success: true,
        model,
        processing_time: started.elapsed().as_secs_f64(),
    }))
}

async fn packages(State(state): State<SharedState>) -> Json<PackagesResponse> {
    Json(PackagesResponse {
        success: true,
        packages: state.payments.packages().to_vec(),
    })
}

async fn create_payment(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CreatePaymentResponse>, ApiError> {
    let user_id = authorized(&state, &headers)?;
    let request: CreatePaymentRequest = parse_json(&body)?;
    let order = state
        .payments
        .create_order(&user_id, &request.package_id)
        .await?;

    Ok(Json(CreatePaymentResponse {
        success: true,
        order: OrderView {
            order_id: order.order_id,
            gateway_order_id: order.gateway_order_id,
            amount: order.amount,
            currency: order.currency,
            tokens: order.tokens,
            status: order.status,
            key_id: state.payments.key_id().map(str::to_string),
        },
    }))
}

async fn verify_payment(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<VerifyPaymentResponse>, ApiError> {
    let user_id = authorized(&state, &headers)?;
    let request: VerifyPaymentRequest = parse_json(&body)?;
    let confirmation = PaymentConfirmation {
        gateway_order_id: request.gateway_order_id,
        gateway_payment_id: request.gateway_payment_id,
        signature: request.gateway_signature,
    };
    let verified = state
        .payments
        .verify(&user_id, &request.order_id, &confirmation)
        .await?;

    Ok(Json(VerifyPaymentResponse {
        success: true,
        tokens: verified.tokens,
        new_balance: verified.new_balance,
    }))
}

async fn payment_history(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<PaymentHistoryResponse>, ApiError> {
    let user_id = authenticated(&state, &headers)?;
    let history = state.payments.history(&user_id).await?;
    Ok(Json(PaymentHistoryResponse {
        success: true,
        history: history.into_iter().map(PaymentHistoryEntry::from).collect(),
    }))
}

async fn balance(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user_id = authenticated(&state, &headers)?;
    let view = state.ledger.balance(&user_id).await?;
    Ok(Json(BalanceResponse {
        success: true,
        balance: view.balance,
        free_generations_remaining: view.free_generations_remaining,
    }))
}

async fn preview_file(
    State(state): State<SharedState>,
    Path((user_id, model_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let png = state.store.read_preview(&user_id, &model_id).await?;
    file_response(png, "image/png", None)
}

async fn mesh_file(
    State(state): State<SharedState>,
    Path((user_id, file_name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let model_id = file_name
        .strip_suffix(".stl")
        .ok_or_else(|| ApiError::not_found(format!("`{file_name}` not found")))?;
    let stl = state.store.read_artifact(&user_id, model_id, "stl").await?;
    file_response(stl, ExportFormat::Stl.content_type(), None)
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("request body is required"));
    }

    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("invalid JSON body: {err}")))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

/// The caller's user id, which must have been issued by `/api/session`.
fn authenticated(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let user_id = header_value(headers, USER_HEADER)
        .filter(|id| validate_identifier(id))
        .ok_or_else(|| ApiError::forbidden("missing or invalid user id"))?;
    if !state.csrf.is_known(user_id) {
        return Err(ApiError::forbidden(
            "unknown session, request /api/session first",
        ));
    }
    Ok(user_id.to_string())
}

/// [`authenticated`] plus a matching CSRF token, required on every POST.
fn authorized(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let user_id = authenticated(state, headers)?;
    let token = header_value(headers, CSRF_HEADER).unwrap_or_default();
    if !state.csrf.verify(&user_id, token) {
        return Err(ApiError::forbidden("missing or invalid CSRF token"));
    }
    Ok(user_id)
}

fn throttle(
    state: &AppState,
    route: &'static str,
    user_id: &str,
    limit: RateLimit,
) -> Result<(), ApiError> {
    state
        .limiter
        .check(route, user_id, limit)
        .map_err(|retry_after| {
            warn!(route, user_id, ?retry_after, "rate limit exceeded");
            ApiError::too_many_requests(retry_after)
        })
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::payload_too_large("upload exceeds the size limit")
    } else {
        ApiError::bad_request(format!("invalid multipart body: {}", err.body_text()))
    }
}

/// Request parameters as canonical numeric strings.
fn parameter_strings(
    raw: BTreeMap<String, serde_json::Value>,
) -> Result<BTreeMap<String, String>, ApiError> {
    raw.into_iter()
        .map(|(name, value)| {
            if !validate_identifier(&name) {
                return Err(ApiError::bad_request(format!(
                    "invalid parameter name `{name}`"
                )));
            }
            let text = match value {
                serde_json::Value::String(text) => text,
                serde_json::Value::Number(number) => number.to_string(),
                other => other.to_string(),
            };
            let normalized = normalize_number(&text)
                .ok_or(GenerationError::InvalidParameter {
                    name: name.clone(),
                    value: text,
                })?;
            Ok((name, normalized))
        })
        .collect()
}

/// Charges `operation`, runs `work`, and refunds the charge if `work` fails.
async fn charged<T>(
    state: &AppState,
    user_id: &str,
    operation: Operation,
    reference: &str,
    work: impl Future<Output = Result<T, ApiError>>,
) -> Result<T, ApiError> {
    let charge = state.ledger.charge(user_id, operation, reference).await?;
    let result = work.await;
    if result.is_err() {
        if let Err(err) = state.ledger.refund(user_id, charge, reference).await {
            error!(user_id, reference, %err, "refund failed");
        }
    }
    result
}

async fn create_parametric(
    state: &AppState,
    user_id: &str,
    model_id: &str,
    generated: GeneratedCode,
    supplied: &BTreeMap<String, String>,
    prompt: Option<&str>,
) -> Result<ModelPayload, ApiError> {
    let defaults = match generated.shape.and_then(Shape::named) {
        Some(shape) => shape
            .parameters
            .iter()
            .map(|parameter| (parameter.name.to_string(), parameter.default.to_string()))
            .collect(),
        None => extract_parameters(&generated.code),
    };
    let code = apply_parameters(&generated.code, supplied)?;

    let now = Utc::now();
    let meta = ModelMeta {
        model_id: model_id.to_string(),
        user_id: user_id.to_string(),
        model_type: ModelType::Parametric,
        shape: generated.shape.map(str::to_string),
        prompt: prompt.map(str::to_string),
        source_file: None,
        parameters: parameter_schema(&code, &defaults),
        revision: 1,
        created_at: now,
        updated_at: now,
    };
    let source = state
        .store
        .write_artifact(user_id, model_id, "scad", code.as_bytes())
        .await?;
    render(state, &meta, &source).await?;
    state.store.save_model(&meta).await?;
    info!(
        user_id,
        model_id,
        source = ?generated.source,
        attempts = generated.attempts,
        "model created"
    );
    model_payload(state, &meta, Some(code)).await
}

/// Rewrites an existing parametric model in place: new values for its
/// parameters, or a language-model edit when `prompt` is given.
async fn update_parametric(
    state: &AppState,
    user_id: &str,
    model_id: &str,
    prompt: Option<&str>,
    supplied: &BTreeMap<String, String>,
) -> Result<ModelPayload, ApiError> {
    let mut meta = state.store.load_model(user_id, model_id).await?;
    if meta.model_type != ModelType::Parametric {
        return Err(ApiError::bad_request(format!(
            "model `{model_id}` was derived from an image and cannot be regenerated"
        )));
    }
    let current = state.store.read_artifact(user_id, model_id, "scad").await?;
    let current = String::from_utf8(current).map_err(ApiError::internal)?;

    let code = match prompt {
        None => {
            if let Some(unknown) = supplied
                .keys()
                .find(|name| !meta.parameters.contains_key(*name))
            {
                return Err(ApiError::bad_request(format!(
                    "model `{model_id}` has no parameter `{unknown}`"
                )));
            }
            apply_parameters(&current, supplied)?
        }
        Some(prompt) => {
            let generated = state.generator.generate(prompt, Some(&current)).await;
            if generated.shape.is_some() {
                meta.shape = generated.shape.map(str::to_string);
            }
            meta.prompt = Some(prompt.to_string());
            apply_parameters(&generated.code, supplied)?
        }
    };

    let defaults = meta
        .parameters
        .iter()
        .map(|(name, parameter)| (name.clone(), parameter.default.clone()))
        .collect();
    meta.parameters = parameter_schema(&code, &defaults);
    meta.revision += 1;
    meta.updated_at = Utc::now();

    let source = state
        .store
        .write_artifact(user_id, model_id, "scad", code.as_bytes())
        .await?;
    render(state, &meta, &source).await?;
    state.store.save_model(&meta).await?;
    info!(user_id, model_id, revision = meta.revision, "model regenerated");
    model_payload(state, &meta, Some(code)).await
}

fn parameter_schema(
    code: &str,
    defaults: &BTreeMap<String, String>,
) -> BTreeMap<String, ParameterValue> {
    extract_parameters(code)
        .into_iter()
        .map(|(name, value)| {
            let default = defaults.get(&name).cloned().unwrap_or_else(|| value.clone());
            (name, ParameterValue { value, default })
        })
        .collect()
}

/// Produces the mesh and preview next to `source`. A toolchain failure leaves
/// them absent.
async fn render(
    state: &AppState,
    meta: &ModelMeta,
    source: &std::path::Path,
) -> Result<(), ApiError> {
    state
        .store
        .remove_renders(&meta.user_id, &meta.model_id)
        .await?;

    let mesh = state
        .store
        .artifact_path(&meta.user_id, &meta.model_id, "stl")?;
    if let Err(err) = state.renderer.render_mesh(source, &mesh).await {
        warn!(model_id = %meta.model_id, %err, "mesh render failed");
        return Ok(());
    }
    let preview = state.store.preview_path(&meta.user_id, &meta.model_id)?;
    if let Err(err) = state.renderer.render_preview(source, &preview).await {
        warn!(model_id = %meta.model_id, %err, "preview render failed");
    }
    Ok(())
}

async fn convert_image(
    state: &AppState,
    user_id: &str,
    model_id: &str,
    file_id: &str,
    image: Vec<u8>,
    parameters: &BTreeMap<String, String>,
) -> Result<ModelPayload, ApiError> {
    let stl = state
        .reconstructor
        .reconstruct(image.clone(), file_id, parameters)
        .await?;
    state
        .store
        .write_artifact(user_id, model_id, "stl", &stl)
        .await?;

    let preview = tokio::task::spawn_blocking(move || preview_from_image(&image))
        .await
        .map_err(ApiError::internal)?;
    match preview {
        Ok(png) => {
            state.store.write_preview(user_id, model_id, &png).await?;
        }
        Err(err) => warn!(model_id, %err, "image preview failed"),
    }

    let now = Utc::now();
    let meta = ModelMeta {
        model_id: model_id.to_string(),
        user_id: user_id.to_string(),
        model_type: ModelType::Image,
        shape: None,
        prompt: None,
        source_file: Some(file_id.to_string()),
        parameters: BTreeMap::new(),
        revision: 1,
        created_at: now,
        updated_at: now,
    };
    state.store.save_model(&meta).await?;
    info!(user_id, model_id, file_id, "image converted to model");
    model_payload(state, &meta, None).await
}

async fn model_payload(
    state: &AppState,
    meta: &ModelMeta,
    code: Option<String>,
) -> Result<ModelPayload, ApiError> {
    let mesh = state
        .store
        .artifact_path(&meta.user_id, &meta.model_id, "stl")?;
    let mesh_url = file_exists(&mesh)
        .await
        .then(|| format!("/model/{}/{}.stl", meta.user_id, meta.model_id));

    Ok(ModelPayload {
        model_id: meta.model_id.clone(),
        model_type: meta.model_type.as_str(),
        code,
        preview_url: existing_preview_url(state, meta).await?,
        mesh_url,
        parameters: meta.parameters.clone(),
        revision: meta.revision,
    })
}

async fn existing_preview_url(
    state: &AppState,
    meta: &ModelMeta,
) -> Result<Option<String>, ApiError> {
    let preview = state.store.preview_path(&meta.user_id, &meta.model_id)?;
    Ok(file_exists(&preview)
        .await
        .then(|| format!("/preview/{}/{}", meta.user_id, meta.model_id)))
}

async fn format_available(
    state: &AppState,
    meta: &ModelMeta,
    format: DownloadFormat,
) -> Result<bool, ApiError> {
    let artifact = |ext: &str| state.store.artifact_path(&meta.user_id, &meta.model_id, ext);
    Ok(match format {
        DownloadFormat::Obj => {
            file_exists(&artifact("obj")?).await || file_exists(&artifact("stl")?).await
        }
        other => file_exists(&artifact(other.extension())?).await,
    })
}

/// OBJ export, converted from the STL on first request.
async fn obj_bytes(state: &AppState, user_id: &str, model_id: &str) -> Result<Vec<u8>, ApiError> {
    match state.store.read_artifact(user_id, model_id, "obj").await {
        Ok(bytes) => return Ok(bytes),
        Err(StoreError::NotFound(_)) => {}
        Err(err) => return Err(err.into()),
    }
    let stl = state.store.read_artifact(user_id, model_id, "stl").await?;
    let mesh = modelgen_mesh::parse_stl(&stl).map_err(ApiError::internal)?;
    let obj = ExportFormat::Obj
        .encode(&mesh, model_id)
        .map_err(ApiError::internal)?;
    state
        .store
        .write_artifact(user_id, model_id, "obj", &obj)
        .await?;
    Ok(obj)
}

fn file_response(
    bytes: Vec<u8>,
    content_type: &'static str,
    attachment: Option<&str>,
) -> Result<Response, ApiError> {
    let mut response = Response::new(Body::from(bytes));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Some(file_name) = attachment {
        let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\""))
            .map_err(ApiError::internal)?;
        response.headers_mut().insert(CONTENT_DISPOSITION, disposition);
    }
    Ok(response)
}

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::{ClientConfig, ClientContext};
use crate::error::{ClientError, Result};
use crate::wire::{
    Balance, ChatMessageRequest, ChatReply, ChatStart, CreatePaymentRequest,
    CreatePaymentResponse, GenerateRequest, GenerateResponse, ImageConversion,
    ImageConversionRequest, ModelDetails, ModelPage, ModelQuery, PaymentHistory, PaymentOrder,
    PaymentRecord, PaymentVerification, SessionGrant, UploadReceipt, UploadedImage, UserImages,
    VerifyPaymentRequest,
};

pub const CSRF_HEADER: &str = "X-CSRF-Token";
pub const USER_HEADER: &str = "X-User-Id";

/// One method per backend endpoint.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn start_chat(&self) -> Result<ChatStart>;

    async fn send_message(&self, session_id: &str, message: &str) -> Result<ChatReply>;

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse>;

    async fn model_details(&self, model_id: &str) -> Result<ModelDetails>;

    async fn my_models(&self, query: &ModelQuery) -> Result<ModelPage>;

    async fn download_model(&self, model_id: &str, format: &str) -> Result<Vec<u8>>;

    async fn upload_image(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadReceipt>;

    /// Images uploaded earlier, newest first.
    async fn user_images(&self) -> Result<Vec<UploadedImage>>;

    async fn generate_from_image(
        &self,
        file_id: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<ImageConversion>;

    async fn create_payment(&self, package_id: &str) -> Result<PaymentOrder>;

    async fn verify_payment(&self, request: &VerifyPaymentRequest) -> Result<PaymentVerification>;

    async fn payment_history(&self) -> Result<Vec<PaymentRecord>>;

    async fn balance(&self) -> Result<Balance>;

    /// Raw bytes of a static asset such as `/preview/{user}/{model}`.
    async fn fetch_asset(&self, path: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: Client,
    base: Url,
    context: ClientContext,
}

impl HttpBackend {
    /// Bootstraps a session: asks the backend for a user id and CSRF token.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        Self::bootstrap(config, None).await
    }

    /// Like [`HttpBackend::connect`], but asks to keep an earlier user id so
    /// its models and balance stay reachable.
    pub async fn resume(config: &ClientConfig, user_id: &str) -> Result<Self> {
        Self::bootstrap(config, Some(user_id)).await
    }

    async fn bootstrap(config: &ClientConfig, user_id: Option<&str>) -> Result<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;
        let url = join(&config.base_url, "/api/session")?;
        let mut request = http.get(url);
        if let Some(user_id) = user_id {
            request = request.header(USER_HEADER, user_id);
        }
        let grant: SessionGrant = decode_response(request.send().await?).await?;
        info!(user_id = %grant.user_id, base = %config.base_url, "session established");

        Ok(Self {
            http,
            base: config.base_url.clone(),
            context: ClientContext {
                user_id: grant.user_id,
                csrf_token: grant.csrf_token,
            },
        })
    }

    pub fn with_context(config: &ClientConfig, context: ClientContext) -> Result<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base: config.base_url.clone(),
            context,
        })
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    fn get(&self, path: &str) -> Result<RequestBuilder> {
        let url = join(&self.base, path)?;
        Ok(self
            .http
            .get(url)
            .header(USER_HEADER, &self.context.user_id))
    }

    fn post(&self, path: &str) -> Result<RequestBuilder> {
        let url = join(&self.base, path)?;
        Ok(self
            .http
            .post(url)
            .header(USER_HEADER, &self.context.user_id)
            .header(CSRF_HEADER, &self.context.csrf_token))
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        debug!(path, "POST");
        let response = self.post(path)?.json(body).send().await?;
        decode_response(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(path, "GET");
        let response = self.get(path)?.send().await?;
        decode_response(response).await
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        debug!(path, "GET bytes");
        let response = self.get(path)?.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(status_error(status, &bytes));
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn start_chat(&self) -> Result<ChatStart> {
        self.post_json("/api/chat/start", &serde_json::json!({}))
            .await
    }

    async fn send_message(&self, session_id: &str, message: &str) -> Result<ChatReply> {
        self.post_json(
            "/api/chat/message",
            &ChatMessageRequest {
                session_id,
                message,
            },
        )
        .await
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        self.post_json("/api/generate", request).await
    }

    async fn model_details(&self, model_id: &str) -> Result<ModelDetails> {
        self.get_json(&format!("/api/3d-model/{model_id}")).await
    }

    async fn my_models(&self, query: &ModelQuery) -> Result<ModelPage> {
        let mut path = format!("/api/my-models?page={}", query.page.max(1));
        if let Some(sort) = &query.sort {
            path.push_str(&format!("&sort={sort}"));
        }
        if let Some(model_type) = &query.model_type {
            path.push_str(&format!("&type={model_type}"));
        }
        self.get_json(&path).await
    }

    async fn download_model(&self, model_id: &str, format: &str) -> Result<Vec<u8>> {
        self.get_bytes(&format!("/api/download-model/{model_id}/{format}"))
            .await
    }

    async fn upload_image(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadReceipt> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(content_type)?;
        let form = Form::new().part("image", part);
        debug!(file_name, "POST multipart");
        let response = self
            .post("/api/upload-image")?
            .multipart(form)
            .send()
            .await?;
        decode_response(response).await
    }

    async fn user_images(&self) -> Result<Vec<UploadedImage>> {
        let response: UserImages = self.get_json("/api/user-images").await?;
        Ok(response.images)
    }

    async fn generate_from_image(
        &self,
        file_id: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<ImageConversion> {
        self.post_json(
            "/api/generate-3d-from-image",
            &ImageConversionRequest {
                file_id,
                parameters,
            },
        )
        .await
    }

    async fn create_payment(&self, package_id: &str) -> Result<PaymentOrder> {
        let response: CreatePaymentResponse = self
            .post_json("/api/create-payment", &CreatePaymentRequest { package_id })
            .await?;
        Ok(response.order)
    }

    async fn verify_payment(&self, request: &VerifyPaymentRequest) -> Result<PaymentVerification> {
        self.post_json("/api/verify-payment", request).await
    }

    async fn payment_history(&self) -> Result<Vec<PaymentRecord>> {
        let response: PaymentHistory = self.get_json("/api/payment-history").await?;
        Ok(response.history)
    }

    async fn balance(&self) -> Result<Balance> {
        self.get_json("/api/balance").await
    }

    async fn fetch_asset(&self, path: &str) -> Result<Vec<u8>> {
        self.get_bytes(path).await
    }
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path.trim_start_matches('/'))
        .map_err(|err| ClientError::Config(format!("invalid request path `{path}`: {err}")))
}

async fn decode_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let bytes = response.bytes().await?;
    decode_body(status, &bytes)
}

/// Maps a finished response onto the error taxonomy: non-success status,
/// `success: false`, or a body that does not match `T`.
pub(crate) fn decode_body<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T> {
    if !status.is_success() {
        return Err(status_error(status, body));
    }

    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|err| ClientError::malformed(format!("response is not JSON: {err}")))?;
    let Some(object) = value.as_object() else {
        return Err(ClientError::malformed("response is not a JSON object"));
    };

    if object.get("success").and_then(serde_json::Value::as_bool) == Some(false) {
        let message = object
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("request was rejected");
        return Err(ClientError::Rejected(message.to_string()));
    }

    serde_json::from_value(value).map_err(|err| ClientError::malformed(err.to_string()))
}

fn status_error(status: StatusCode, body: &[u8]) -> ClientError {
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("error")?.as_str().map(str::to_string))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    ClientError::Status {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use crate::error::ClientError;
    use crate::wire::{ChatStart, PaymentVerification};

    use super::decode_body;

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).expect("json encoding should succeed")
    }

    #[test]
    fn decodes_successful_body() {
        let start: ChatStart = decode_body(
            StatusCode::OK,
            &body(json!({"success": true, "session_id": "s1", "welcome_message": "hello"})),
        )
        .expect("body should decode");
        assert_eq!(start.session_id, "s1");
        assert_eq!(start.welcome_message.as_deref(), Some("hello"));
    }

    #[test]
    fn non_success_status_carries_server_message() {
        let err = decode_body::<ChatStart>(
            StatusCode::PAYMENT_REQUIRED,
            &body(json!({"success": false, "error": "insufficient tokens"})),
        )
        .expect_err("402 should fail");
        match err {
            ClientError::Status { status, message } => {
                assert_eq!(status, 402);
                assert_eq!(message, "insufficient tokens");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_json_error_body_falls_back_to_reason() {
        let err = decode_body::<ChatStart>(StatusCode::BAD_GATEWAY, b"<html>")
            .expect_err("502 should fail");
        assert!(matches!(
            err,
            ClientError::Status { status: 502, ref message } if message == "Bad Gateway"
        ));
    }

    #[test]
    fn success_false_is_rejected() {
        let err = decode_body::<PaymentVerification>(
            StatusCode::OK,
            &body(json!({"success": false, "error": "signature mismatch"})),
        )
        .expect_err("success false should fail");
        assert!(matches!(err, ClientError::Rejected(ref message) if message == "signature mismatch"));
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let err = decode_body::<PaymentVerification>(
            StatusCode::OK,
            &body(json!({"success": true, "tokens": "many"})),
        )
        .expect_err("bad shape should fail");
        assert!(matches!(err, ClientError::Malformed(_)));

        let err = decode_body::<ChatStart>(StatusCode::OK, b"[1, 2]").expect_err("array");
        assert!(matches!(err, ClientError::Malformed(_)));
    }
}

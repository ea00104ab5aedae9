use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct SessionGrant {
    pub user_id: String,
    pub csrf_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatStart {
    pub session_id: String,
    #[serde(default)]
    pub welcome_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessageRequest<'a> {
    pub session_id: &'a str,
    pub message: &'a str,
}

/// Model metadata as it travels inside chat replies and generation responses.
/// Every field is optional on the wire; `ModelState::from_payload` decides
/// whether the combination is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub revision: u64,
}

impl ModelPayload {
    pub fn carries_model(&self) -> bool {
        self.model_id.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatReply {
    pub response: String,
    #[serde(flatten)]
    pub model: ModelPayload,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    pub parameters: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    pub session_id: String,
    pub model: ModelPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelDetails {
    pub model_id: String,
    pub model_type: String,
    pub created_at: String,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub formats: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSummary {
    pub model_id: String,
    pub model_type: String,
    pub created_at: String,
    #[serde(default)]
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelPage {
    pub models: Vec<ModelSummary>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelQuery {
    pub page: u32,
    pub sort: Option<String>,
    pub model_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadReceipt {
    pub file_id: String,
    pub file_size: u64,
    pub file_type: String,
}

/// An earlier upload that can be converted again.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadedImage {
    pub file_id: String,
    pub file_size: u64,
    pub file_type: String,
    pub uploaded_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UserImages {
    pub images: Vec<UploadedImage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageConversionRequest<'a> {
    pub file_id: &'a str,
    pub parameters: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageConversion {
    #[serde(flatten)]
    pub model: ModelPayload,
    #[serde(default)]
    pub processing_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatePaymentRequest<'a> {
    pub package_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentOrder {
    pub order_id: String,
    pub gateway_order_id: String,
    pub amount: u64,
    pub currency: String,
    pub tokens: u64,
    pub status: OrderStatus,
    #[serde(default)]
    pub key_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CreatePaymentResponse {
    pub order: PaymentOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyPaymentRequest {
    pub order_id: String,
    pub gateway_payment_id: String,
    pub gateway_order_id: String,
    pub gateway_signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentVerification {
    pub tokens: u64,
    pub new_balance: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRecord {
    pub order_id: String,
    pub package_id: String,
    pub amount: u64,
    pub currency: String,
    pub tokens: u64,
    pub status: OrderStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PaymentHistory {
    pub history: Vec<PaymentRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Balance {
    pub balance: u64,
    pub free_generations_remaining: u32,
}

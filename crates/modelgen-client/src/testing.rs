use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use modelgen_mesh::Mesh;
use modelgen_mesh::export::to_binary_stl;
use serde_json::json;

use crate::backend::Backend;
use crate::error::{ClientError, Result};
use crate::payment::{GatewayCallback, PaymentWidget};
use crate::wire::{
    Balance, ChatReply, ChatStart, GenerateRequest, GenerateResponse, ImageConversion,
    ModelDetails, ModelPage, ModelPayload, ModelQuery, OrderStatus, PaymentOrder, PaymentRecord,
    PaymentVerification, UploadReceipt, UploadedImage, VerifyPaymentRequest,
};

pub(crate) const VALID_SIGNATURE: &str = "valid-sig";

/// Scripted in-memory backend. Every call is recorded by endpoint name.
#[derive(Default)]
pub(crate) struct FakeBackend {
    pub calls: Mutex<Vec<String>>,
    pub chat_replies: Mutex<VecDeque<Result<ChatReply>>>,
    pub generations: Mutex<VecDeque<(Duration, Result<GenerateResponse>)>>,
    pub generate_requests: Mutex<Vec<GenerateRequest>>,
    pub conversions: Mutex<VecDeque<Result<ImageConversion>>>,
    pub assets: Mutex<HashMap<String, Vec<u8>>>,
    pub uploads: Mutex<Vec<UploadedImage>>,
    pub balance: Mutex<u64>,
    pub orders: Mutex<HashMap<String, OrderStatus>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn push_generation(&self, delay: Duration, response: Result<GenerateResponse>) {
        self.generations
            .lock()
            .expect("generations lock")
            .push_back((delay, response));
    }

    pub fn push_chat_reply(&self, reply: Result<ChatReply>) {
        self.chat_replies
            .lock()
            .expect("chat lock")
            .push_back(reply);
    }

    pub fn put_asset(&self, path: &str, bytes: Vec<u8>) {
        self.assets
            .lock()
            .expect("assets lock")
            .insert(path.to_string(), bytes);
    }

    fn record(&self, call: &str) {
        self.calls.lock().expect("calls lock").push(call.to_string());
    }
}

pub(crate) fn model_payload(model_id: &str, parameters: serde_json::Value) -> ModelPayload {
    ModelPayload {
        model_id: Some(model_id.to_string()),
        model_type: Some("parametric".to_string()),
        code: Some(format!("// {model_id}\nsphere(r = radius);")),
        preview_url: Some(format!("/preview/u1/{model_id}")),
        mesh_url: Some(format!("/model/u1/{model_id}.stl")),
        parameters: Some(parameters),
        revision: 1,
    }
}

pub(crate) fn generated(model_id: &str, parameters: serde_json::Value) -> Result<GenerateResponse> {
    Ok(GenerateResponse {
        session_id: "s1".to_string(),
        model: model_payload(model_id, parameters),
    })
}

/// Axis-aligned box from the origin to `size`, as binary STL.
pub(crate) fn box_stl(size: [f64; 3]) -> Vec<u8> {
    let [x, y, z] = size;
    let mesh = Mesh {
        vertices: vec![
            [0.0, 0.0, 0.0],
            [x, 0.0, 0.0],
            [x, y, 0.0],
            [0.0, y, 0.0],
            [0.0, 0.0, z],
            [x, 0.0, z],
            [x, y, z],
            [0.0, y, z],
        ],
        triangles: vec![
            [0, 2, 1],
            [0, 3, 2],
            [4, 5, 6],
            [4, 6, 7],
            [0, 1, 5],
            [0, 5, 4],
            [2, 3, 7],
            [2, 7, 6],
            [1, 2, 6],
            [1, 6, 5],
            [0, 4, 7],
            [0, 7, 3],
        ],
    };
    to_binary_stl(&mesh, "box").expect("stl export should succeed")
}

fn not_scripted(call: &str) -> ClientError {
    ClientError::Status {
        status: 404,
        message: format!("{call} is not scripted"),
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn start_chat(&self) -> Result<ChatStart> {
        self.record("start_chat");
        Ok(ChatStart {
            session_id: "s1".to_string(),
            welcome_message: Some("What would you like to build?".to_string()),
        })
    }

    async fn send_message(&self, _session_id: &str, _message: &str) -> Result<ChatReply> {
        self.record("send_message");
        self.chat_replies
            .lock()
            .expect("chat lock")
            .pop_front()
            .unwrap_or_else(|| Err(not_scripted("send_message")))
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        self.record("generate");
        self.generate_requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.generations.lock().expect("generations lock").pop_front();
        let Some((delay, response)) = next else {
            return Err(not_scripted("generate"));
        };
        tokio::time::sleep(delay).await;
        response
    }

    async fn model_details(&self, model_id: &str) -> Result<ModelDetails> {
        self.record("model_details");
        Ok(ModelDetails {
            model_id: model_id.to_string(),
            model_type: "parametric".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            preview_url: Some(format!("/preview/u1/{model_id}")),
            formats: BTreeMap::from([(
                "stl".to_string(),
                format!("/api/download-model/{model_id}/stl"),
            )]),
        })
    }

    async fn my_models(&self, query: &ModelQuery) -> Result<ModelPage> {
        self.record("my_models");
        Ok(serde_json::from_value(json!({
            "models": [{
                "model_id": format!("model_page{}", query.page),
                "model_type": query.model_type.clone().unwrap_or_else(|| "parametric".to_string()),
                "created_at": "2026-01-01T00:00:00Z"
            }],
            "has_more": query.page < 2
        }))
        .expect("page fixture should decode"))
    }

    async fn download_model(&self, model_id: &str, format: &str) -> Result<Vec<u8>> {
        self.record("download_model");
        self.assets
            .lock()
            .expect("assets lock")
            .get(&format!("/model/u1/{model_id}.{format}"))
            .cloned()
            .ok_or_else(|| not_scripted("download_model"))
    }

    async fn upload_image(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadReceipt> {
        self.record("upload_image");
        Ok(UploadReceipt {
            file_id: format!("upload_{file_name}"),
            file_size: bytes.len() as u64,
            file_type: content_type.to_string(),
        })
    }

    async fn generate_from_image(
        &self,
        _file_id: &str,
        _parameters: &BTreeMap<String, String>,
    ) -> Result<ImageConversion> {
        self.record("generate_from_image");
        self.conversions
            .lock()
            .expect("conversions lock")
            .pop_front()
            .unwrap_or_else(|| Err(not_scripted("generate_from_image")))
    }

    async fn create_payment(&self, package_id: &str) -> Result<PaymentOrder> {
        self.record("create_payment");
        if package_id != "p1" {
            return Err(ClientError::Status {
                status: 400,
                message: format!("unknown package {package_id}"),
            });
        }
        let order_id = format!("order_{}", self.orders.lock().expect("orders lock").len() + 1);
        self.orders
            .lock()
            .expect("orders lock")
            .insert(order_id.clone(), OrderStatus::Pending);
        Ok(PaymentOrder {
            gateway_order_id: format!("gw_{order_id}"),
            order_id,
            amount: 500,
            currency: "INR".to_string(),
            tokens: 100,
            status: OrderStatus::Pending,
            key_id: Some("key_test".to_string()),
        })
    }

    async fn verify_payment(&self, request: &VerifyPaymentRequest) -> Result<PaymentVerification> {
        self.record("verify_payment");
        if request.gateway_signature != VALID_SIGNATURE {
            return Err(ClientError::Rejected("payment verification failed".to_string()));
        }
        let mut orders = self.orders.lock().expect("orders lock");
        let Some(status) = orders.get_mut(&request.order_id) else {
            return Err(ClientError::Rejected("order not found".to_string()));
        };
        *status = OrderStatus::Completed;
        let mut balance = self.balance.lock().expect("balance lock");
        *balance += 100;
        Ok(PaymentVerification {
            tokens: 100,
            new_balance: *balance,
        })
    }

    async fn user_images(&self) -> Result<Vec<UploadedImage>> {
        self.record("user_images");
        Ok(self.uploads.lock().expect("uploads lock").clone())
    }

    async fn payment_history(&self) -> Result<Vec<PaymentRecord>> {
        self.record("payment_history");
        Ok(Vec::new())
    }

    async fn balance(&self) -> Result<Balance> {
        self.record("balance");
        Ok(Balance {
            balance: *self.balance.lock().expect("balance lock"),
            free_generations_remaining: 5,
        })
    }

    async fn fetch_asset(&self, path: &str) -> Result<Vec<u8>> {
        self.record("fetch_asset");
        self.assets
            .lock()
            .expect("assets lock")
            .get(path)
            .cloned()
            .ok_or_else(|| not_scripted("fetch_asset"))
    }
}

/// Checkout that signs with a fixed signature.
pub(crate) struct FakeWidget {
    pub signature: String,
}

#[async_trait]
impl PaymentWidget for FakeWidget {
    async fn checkout(&self, order: &PaymentOrder) -> Result<GatewayCallback> {
        Ok(GatewayCallback {
            gateway_payment_id: format!("pay_{}", order.order_id),
            gateway_order_id: order.gateway_order_id.clone(),
            gateway_signature: self.signature.clone(),
        })
    }
}

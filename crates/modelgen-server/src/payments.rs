use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::RazorpayConfig;
use crate::security::validate_identifier;
use crate::store::{Store, StoreError, new_id};
use crate::tokens::{LedgerError, TokenLedger};

const ORDERS: &str = "orders";
const RAZORPAY_API: &str = "https://api.razorpay.com/v1";
/// Signature the offline gateway accepts.
pub const OFFLINE_SIGNATURE: &str = "offline";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("unknown package `{0}`")]
    UnknownPackage(String),
    #[error("unknown order `{0}`")]
    UnknownOrder(String),
    #[error("payment does not belong to this order")]
    OrderMismatch,
    #[error("verification failed: {0}")]
    VerificationFailed(String),
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        Self::Gateway(err.to_string())
    }
}

/// A purchasable bundle of tokens. `price` is in major currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub tokens: u64,
    pub price: u64,
    pub currency: String,
}

impl Package {
    pub fn defaults() -> Vec<Self> {
        [("small", 50, 99), ("medium", 200, 299), ("large", 500, 599)]
            .into_iter()
            .map(|(id, tokens, price)| Self {
                id: id.to_string(),
                tokens,
                price,
                currency: "INR".to_string(),
            })
            .collect()
    }

    /// Price in the smallest currency unit, as gateways expect it.
    pub fn amount(&self) -> u64 {
        self.price * 100
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub gateway_order_id: String,
    pub user_id: String,
    pub package_id: String,
    pub amount: u64,
    pub currency: String,
    pub tokens: u64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub gateway_payment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Public key handed to the checkout widget, if the gateway has one.
    fn key_id(&self) -> Option<&str>;

    /// Registers an order with the gateway and returns its order id.
    async fn create_order(
        &self,
        amount: u64,
        currency: &str,
        receipt: &str,
    ) -> Result<String, PaymentError>;

    async fn verify(&self, confirmation: &PaymentConfirmation) -> Result<(), PaymentError>;
}

/// Razorpay orders API. A payment is accepted when the checkout signature is
/// the HMAC-SHA256 of `order_id|payment_id` under the key secret, and the
/// payment fetched back from the gateway belongs to the order and went through.
pub struct RazorpayGateway {
    http: Client,
    credentials: RazorpayConfig,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct RazorpayOrderRequest<'a> {
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayPayment {
    order_id: Option<String>,
    status: String,
}

impl RazorpayGateway {
    pub fn new(credentials: RazorpayConfig) -> Result<Self, PaymentError> {
        Ok(Self {
            http: Client::builder().build()?,
            credentials,
            base_url: RAZORPAY_API.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn signature_matches(&self, confirmation: &PaymentConfirmation) -> bool {
        let Ok(signature) = hex::decode(confirmation.signature.trim()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.credentials.key_secret.as_bytes()) else {
            return false;
        };
        mac.update(confirmation.gateway_order_id.as_bytes());
        mac.update(b"|");
        mac.update(confirmation.gateway_payment_id.as_bytes());
        mac.verify_slice(&signature).is_ok()
    }

    async fn checked<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PaymentError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Gateway(format!("{status}: {body}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn key_id(&self) -> Option<&str> {
        Some(&self.credentials.key_id)
    }

    async fn create_order(
        &self,
        amount: u64,
        currency: &str,
        receipt: &str,
    ) -> Result<String, PaymentError> {
        let response = self
            .http
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.credentials.key_id, Some(&self.credentials.key_secret))
            .json(&RazorpayOrderRequest {
                amount,
                currency,
                receipt,
            })
            .send()
            .await?;
        let order: RazorpayOrder = Self::checked(response).await?;
        Ok(order.id)
    }

    async fn verify(&self, confirmation: &PaymentConfirmation) -> Result<(), PaymentError> {
        if confirmation.signature.is_empty() {
            return Err(PaymentError::VerificationFailed(
                "missing payment signature".to_string(),
            ));
        }
        if !self.signature_matches(confirmation) {
            return Err(PaymentError::VerificationFailed(
                "payment signature does not match".to_string(),
            ));
        }
        let response = self
            .http
            .get(format!(
                "{}/payments/{}",
                self.base_url, confirmation.gateway_payment_id
            ))
            .basic_auth(&self.credentials.key_id, Some(&self.credentials.key_secret))
            .send()
            .await?;
        let payment: RazorpayPayment = Self::checked(response).await?;

        if payment.order_id.as_deref() != Some(confirmation.gateway_order_id.as_str()) {
            return Err(PaymentError::OrderMismatch);
        }
        match payment.status.as_str() {
            "captured" | "authorized" => Ok(()),
            other => Err(PaymentError::VerificationFailed(format!(
                "payment status is `{other}`"
            ))),
        }
    }
}

/// Development gateway: orders are local and any payment carrying
/// [`OFFLINE_SIGNATURE`] is accepted.
#[derive(Debug, Default)]
pub struct OfflineGateway;

#[async_trait]
impl PaymentGateway for OfflineGateway {
    fn key_id(&self) -> Option<&str> {
        None
    }

    async fn create_order(
        &self,
        _amount: u64,
        _currency: &str,
        _receipt: &str,
    ) -> Result<String, PaymentError> {
        Ok(new_id("offline"))
    }

    async fn verify(&self, confirmation: &PaymentConfirmation) -> Result<(), PaymentError> {
        if confirmation.signature == OFFLINE_SIGNATURE && !confirmation.gateway_payment_id.is_empty()
        {
            Ok(())
        } else {
            Err(PaymentError::VerificationFailed(
                "signature was not accepted".to_string(),
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPayment {
    pub tokens: u64,
    pub new_balance: u64,
}

pub struct PaymentService {
    store: Store,
    ledger: Arc<TokenLedger>,
    gateway: Arc<dyn PaymentGateway>,
    packages: Vec<Package>,
    verify_lock: Mutex<()>,
}

impl PaymentService {
    pub fn new(
        store: Store,
        ledger: Arc<TokenLedger>,
        gateway: Arc<dyn PaymentGateway>,
        packages: Vec<Package>,
    ) -> Self {
        Self {
            store,
            ledger,
            gateway,
            packages,
            verify_lock: Mutex::new(()),
        }
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn key_id(&self) -> Option<&str> {
        self.gateway.key_id()
    }

    pub async fn create_order(
        &self,
        user_id: &str,
        package_id: &str,
    ) -> Result<OrderRecord, PaymentError> {
        let package = self
            .packages
            .iter()
            .find(|package| package.id == package_id)
            .ok_or_else(|| PaymentError::UnknownPackage(package_id.to_string()))?;

        let order_id = new_id("order");
        let gateway_order_id = self
            .gateway
            .create_order(package.amount(), &package.currency, &order_id)
            .await?;

        let record = OrderRecord {
            order_id: order_id.clone(),
            gateway_order_id,
            user_id: user_id.to_string(),
            package_id: package.id.clone(),
            amount: package.amount(),
            currency: package.currency.clone(),
            tokens: package.tokens,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            gateway_payment_id: None,
        };
        self.store.write_record(ORDERS, &order_id, &record).await?;
        info!(user_id, order_id, package_id, amount = record.amount, "payment order created");
        Ok(record)
    }

    /// Credits the order's tokens once. Re-verifying a completed order with
    /// the same payment returns the same result without crediting again.
    pub async fn verify(
        &self,
        user_id: &str,
        order_id: &str,
        confirmation: &PaymentConfirmation,
    ) -> Result<VerifiedPayment, PaymentError> {
        if !validate_identifier(&confirmation.gateway_payment_id)
            || !validate_identifier(&confirmation.gateway_order_id)
        {
            return Err(PaymentError::VerificationFailed(
                "malformed gateway identifiers".to_string(),
            ));
        }
        let _guard = self.verify_lock.lock().await;
        let mut record: OrderRecord = self
            .store
            .read_record(ORDERS, order_id)
            .await?
            .filter(|record: &OrderRecord| record.user_id == user_id)
            .ok_or_else(|| PaymentError::UnknownOrder(order_id.to_string()))?;

        if record.gateway_order_id != confirmation.gateway_order_id {
            warn!(user_id, order_id, "gateway order id mismatch");
            return Err(PaymentError::OrderMismatch);
        }

        if record.status == OrderStatus::Completed {
            if record.gateway_payment_id.as_deref()
                != Some(confirmation.gateway_payment_id.as_str())
            {
                return Err(PaymentError::OrderMismatch);
            }
            let balance = self.ledger.balance(user_id).await?;
            return Ok(VerifiedPayment {
                tokens: record.tokens,
                new_balance: balance.balance,
            });
        }

        self.gateway.verify(confirmation).await.inspect_err(|err| {
            warn!(user_id, order_id, %err, "payment verification failed");
        })?;

        let new_balance = self.ledger.credit(user_id, record.tokens, order_id).await?;
        record.status = OrderStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.gateway_payment_id = Some(confirmation.gateway_payment_id.clone());
        self.store.write_record(ORDERS, order_id, &record).await?;
        info!(user_id, order_id, tokens = record.tokens, "payment verified");

        Ok(VerifiedPayment {
            tokens: record.tokens,
            new_balance,
        })
    }

    /// The user's orders, newest first.
    pub async fn history(&self, user_id: &str) -> Result<Vec<OrderRecord>, PaymentError> {
        let mut orders: Vec<OrderRecord> = self.store.read_records(ORDERS).await?;
        orders.retain(|order| order.user_id == user_id);
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::Costs;
    use crate::store::Store;
    use crate::tokens::TokenLedger;

    use axum::routing::{get, post};
    use axum::{Json, Router};
    use hmac::Mac;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use crate::config::RazorpayConfig;

    use super::{
        HmacSha256, OFFLINE_SIGNATURE, OfflineGateway, OrderStatus, Package, PaymentConfirmation,
        PaymentError, PaymentGateway, PaymentService, RazorpayGateway,
    };

    const SECRET: &str = "rzp_secret";

    fn sign(order_id: &str, payment_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).expect("any key length works");
        mac.update(format!("{order_id}|{payment_id}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Serves the two Razorpay endpoints the gateway uses; every payment is
    /// captured against `order_g1`.
    async fn fake_razorpay() -> Option<String> {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                eprintln!("skipping gateway test: local socket bind not permitted ({err})");
                return None;
            }
            Err(err) => panic!("listener should bind: {err}"),
        };
        let addr = listener.local_addr().expect("listener should expose address");
        let router = Router::new()
            .route("/orders", post(|| async { Json(json!({"id": "order_g1"})) }))
            .route(
                "/payments/{payment_id}",
                get(|| async {
                    Json::<Value>(json!({"order_id": "order_g1", "status": "captured"}))
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("fake gateway should run");
        });
        Some(format!("http://{addr}"))
    }

    fn razorpay(base_url: String) -> RazorpayGateway {
        RazorpayGateway::new(RazorpayConfig {
            key_id: "rzp_test".to_string(),
            key_secret: SECRET.to_string(),
        })
        .expect("client builds")
        .with_base_url(base_url)
    }

    async fn service(dir: &tempfile::TempDir) -> (PaymentService, Arc<TokenLedger>) {
        let store = Store::open(dir.path()).await.expect("store opens");
        let ledger = Arc::new(TokenLedger::new(store.clone(), 0, Costs::default()));
        let service = PaymentService::new(
            store,
            ledger.clone(),
            Arc::new(OfflineGateway),
            Package::defaults(),
        );
        (service, ledger)
    }

    fn confirmation(gateway_order_id: &str, signature: &str) -> PaymentConfirmation {
        PaymentConfirmation {
            gateway_order_id: gateway_order_id.to_string(),
            gateway_payment_id: "pay_1".to_string(),
            signature: signature.to_string(),
        }
    }

    #[test]
    fn default_packages_are_priced_in_paise() {
        let packages = Package::defaults();
        assert_eq!(packages[0].tokens, 50);
        assert_eq!(packages[0].amount(), 9_900);
        assert_eq!(packages[2].amount(), 59_900);
    }

    #[tokio::test]
    async fn verified_order_credits_once() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let (service, ledger) = service(&dir).await;

        let order = service.create_order("u1", "medium").await.expect("order");
        assert_eq!(order.tokens, 200);
        assert_eq!(order.status, OrderStatus::Pending);

        let confirm = confirmation(&order.gateway_order_id, OFFLINE_SIGNATURE);
        let first = service
            .verify("u1", &order.order_id, &confirm)
            .await
            .expect("verifies");
        assert_eq!(first.tokens, 200);
        assert_eq!(first.new_balance, 200);

        let again = service
            .verify("u1", &order.order_id, &confirm)
            .await
            .expect("re-verification succeeds");
        assert_eq!(again.new_balance, 200);
        assert_eq!(ledger.balance("u1").await.expect("balance").balance, 200);

        let history = service.history("u1").await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn rejected_signature_credits_nothing() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let (service, ledger) = service(&dir).await;
        let order = service.create_order("u1", "small").await.expect("order");

        let err = service
            .verify("u1", &order.order_id, &confirmation(&order.gateway_order_id, "forged"))
            .await
            .expect_err("bad signature");
        assert!(matches!(err, PaymentError::VerificationFailed(_)));
        assert_eq!(ledger.balance("u1").await.expect("balance").balance, 0);

        let err = service
            .verify("u1", &order.order_id, &confirmation("other", OFFLINE_SIGNATURE))
            .await
            .expect_err("wrong gateway order");
        assert!(matches!(err, PaymentError::OrderMismatch));

        let err = service
            .verify(
                "u2",
                &order.order_id,
                &confirmation(&order.gateway_order_id, OFFLINE_SIGNATURE),
            )
            .await
            .expect_err("someone else's order");
        assert!(matches!(err, PaymentError::UnknownOrder(_)));
    }

    #[tokio::test]
    async fn unknown_package_and_history_order() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let (service, _) = service(&dir).await;
        assert!(matches!(
            service.create_order("u1", "huge").await,
            Err(PaymentError::UnknownPackage(_))
        ));

        let first = service.create_order("u1", "small").await.expect("order");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = service.create_order("u1", "large").await.expect("order");
        service.create_order("u2", "small").await.expect("order");

        let history = service.history("u1").await.expect("history");
        let ids = history
            .iter()
            .map(|order| order.order_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![second.order_id.as_str(), first.order_id.as_str()]);
    }

    #[tokio::test]
    async fn razorpay_requires_the_hmac_signature() {
        let Some(base_url) = fake_razorpay().await else {
            return;
        };
        let gateway = razorpay(base_url);

        let forged = PaymentConfirmation {
            gateway_order_id: "order_g1".to_string(),
            gateway_payment_id: "pay_1".to_string(),
            signature: "forged-not-an-hmac".to_string(),
        };
        assert!(matches!(
            gateway.verify(&forged).await,
            Err(PaymentError::VerificationFailed(_))
        ));

        let other_payment = PaymentConfirmation {
            signature: sign("order_g1", "pay_2"),
            ..forged.clone()
        };
        assert!(matches!(
            gateway.verify(&other_payment).await,
            Err(PaymentError::VerificationFailed(_))
        ));

        let genuine = PaymentConfirmation {
            signature: sign("order_g1", "pay_1"),
            ..forged
        };
        gateway.verify(&genuine).await.expect("signed payment verifies");
    }

    #[tokio::test]
    async fn razorpay_orders_credit_only_genuine_payments() {
        let Some(base_url) = fake_razorpay().await else {
            return;
        };
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let store = Store::open(dir.path()).await.expect("store opens");
        let ledger = Arc::new(TokenLedger::new(store.clone(), 0, Costs::default()));
        let service = PaymentService::new(
            store,
            ledger.clone(),
            Arc::new(razorpay(base_url)),
            Package::defaults(),
        );

        let order = service.create_order("u1", "small").await.expect("order");
        assert_eq!(order.gateway_order_id, "order_g1");

        let traversal = PaymentConfirmation {
            gateway_order_id: "order_g1".to_string(),
            gateway_payment_id: "../orders/x".to_string(),
            signature: sign("order_g1", "../orders/x"),
        };
        assert!(matches!(
            service.verify("u1", &order.order_id, &traversal).await,
            Err(PaymentError::VerificationFailed(_))
        ));
        let query = PaymentConfirmation {
            gateway_payment_id: "a?b".to_string(),
            signature: sign("order_g1", "a?b"),
            ..traversal
        };
        assert!(matches!(
            service.verify("u1", &order.order_id, &query).await,
            Err(PaymentError::VerificationFailed(_))
        ));

        let forged = confirmation("order_g1", "deadbeef");
        assert!(matches!(
            service.verify("u1", &order.order_id, &forged).await,
            Err(PaymentError::VerificationFailed(_))
        ));
        assert_eq!(ledger.balance("u1").await.expect("balance").balance, 0);

        let genuine = confirmation("order_g1", &sign("order_g1", "pay_1"));
        let verified = service
            .verify("u1", &order.order_id, &genuine)
            .await
            .expect("genuine payment verifies");
        assert_eq!(verified.new_balance, 50);
    }
}

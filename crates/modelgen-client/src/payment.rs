use async_trait::async_trait;
use tracing::info;

use crate::backend::Backend;
use crate::error::{ClientError, Result};
use crate::wire::{OrderStatus, PaymentOrder, VerifyPaymentRequest};

/// Signed result handed back by the checkout widget. Opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCallback {
    pub gateway_payment_id: String,
    pub gateway_order_id: String,
    pub gateway_signature: String,
}

/// Third-party checkout. Takes the order to the gateway and returns its
/// callback, or an error if the user abandoned or the charge failed.
#[async_trait]
pub trait PaymentWidget: Send + Sync {
    async fn checkout(&self, order: &PaymentOrder) -> Result<GatewayCallback>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub order_id: String,
    pub tokens: u64,
    pub new_balance: u64,
    pub status: OrderStatus,
}

/// Create order, run checkout, forward the callback for verification.
/// The order is reported completed only after the backend confirms it.
pub async fn purchase(
    backend: &dyn Backend,
    widget: &dyn PaymentWidget,
    package_id: &str,
) -> Result<PaymentReceipt> {
    let order = backend.create_payment(package_id).await?;
    info!(
        order_id = %order.order_id,
        amount = order.amount,
        currency = %order.currency,
        "payment order created"
    );
    if order.status != OrderStatus::Pending {
        return Err(ClientError::malformed(format!(
            "new order {} is not pending",
            order.order_id
        )));
    }

    let callback = widget.checkout(&order).await?;
    let verification = backend
        .verify_payment(&VerifyPaymentRequest {
            order_id: order.order_id.clone(),
            gateway_payment_id: callback.gateway_payment_id,
            gateway_order_id: callback.gateway_order_id,
            gateway_signature: callback.gateway_signature,
        })
        .await?;
    info!(
        order_id = %order.order_id,
        tokens = verification.tokens,
        new_balance = verification.new_balance,
        "payment verified"
    );

    Ok(PaymentReceipt {
        order_id: order.order_id,
        tokens: verification.tokens,
        new_balance: verification.new_balance,
        status: OrderStatus::Completed,
    })
}

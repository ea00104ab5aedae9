use async_trait::async_trait;
use modelgen_client::wire::PaymentOrder;
use modelgen_client::{ClientError, GatewayCallback, PaymentWidget, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Mutex;

/// Checkout for terminals: shows the order and reads back the values the
/// gateway's checkout page reported after paying.
pub struct TerminalCheckout<R> {
    input: Mutex<R>,
}

impl<R> TerminalCheckout<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(input: R) -> Self {
        Self {
            input: Mutex::new(input),
        }
    }

    async fn prompt(&self, label: &str) -> Result<String> {
        eprint!("{label}: ");
        let mut line = String::new();
        let read = self.input.lock().await.read_line(&mut line).await?;
        let value = line.trim();
        if read == 0 || value.is_empty() {
            return Err(ClientError::Rejected("checkout cancelled".to_string()));
        }
        Ok(value.to_string())
    }
}

#[async_trait]
impl<R> PaymentWidget for TerminalCheckout<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn checkout(&self, order: &PaymentOrder) -> Result<GatewayCallback> {
        eprintln!(
            "Order {} for {} tokens: {} {:.2}",
            order.order_id,
            order.tokens,
            order.currency,
            order.amount as f64 / 100.0
        );
        eprintln!("Gateway order id: {}", order.gateway_order_id);
        if let Some(key_id) = &order.key_id {
            eprintln!("Gateway key: {key_id}");
        }
        eprintln!("Complete the payment, then enter what the gateway returned. Leave empty to cancel.");

        let gateway_payment_id = self.prompt("payment id").await?;
        let gateway_signature = self.prompt("signature").await?;
        Ok(GatewayCallback {
            gateway_payment_id,
            gateway_order_id: order.gateway_order_id.clone(),
            gateway_signature,
        })
    }
}

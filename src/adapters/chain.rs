use crate::config::ChainConfig;
use crate::error::{Result, RpcError, SentinelError};
use crate::ports::ChainClient;
use crate::rpc::{to_hex_quantity, CallOptions, ResilientRpcAdapter};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

const WEI_PER_NATIVE: u64 = 1_000_000_000_000_000_000;

/// Convert a decimal native-token amount into wei
pub fn native_to_wei(amount: Decimal) -> Result<u128> {
    if amount <= Decimal::ZERO {
        return Err(SentinelError::Validation(format!(
            "top-up amount must be positive, got {}",
            amount
        )));
    }
    amount
        .checked_mul(Decimal::from(WEI_PER_NATIVE))
        .and_then(|wei| wei.trunc().to_u128())
        .ok_or_else(|| SentinelError::Validation(format!("top-up amount {} out of range", amount)))
}

/// Funding account access over the resilient RPC adapter.
///
/// Top-ups are sent with `eth_sendTransaction` from a node-managed funder
/// account, so no key material lives in this process. The send goes out
/// exactly once; only the receipt lookups that follow are retried.
pub struct RpcChainClient {
    rpc: ResilientRpcAdapter,
    smart_account: String,
    funder: String,
    paymaster_enabled: bool,
    receipt_timeout: Duration,
    receipt_poll: Duration,
}

impl RpcChainClient {
    pub fn new(rpc: ResilientRpcAdapter, config: &ChainConfig) -> Self {
        Self {
            rpc,
            smart_account: config.smart_account_address.clone(),
            funder: config.funder_address.clone(),
            paymaster_enabled: config.paymaster_enabled,
            receipt_timeout: Duration::from_millis(config.receipt_timeout_ms),
            receipt_poll: Duration::from_millis(config.receipt_poll_ms.max(1)),
        }
    }

    /// Poll for the top-up receipt so the balance re-check sees the mined
    /// transfer. Gives up quietly at the deadline; a reverted receipt is an error.
    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<()> {
        let deadline = Instant::now() + self.receipt_timeout;
        loop {
            match self
                .rpc
                .call("eth_getTransactionReceipt", json!([tx_hash]), CallOptions::default())
                .await
            {
                Ok(Value::Null) => {}
                Ok(receipt) => {
                    if receipt["status"] == "0x0" {
                        return Err(SentinelError::Remediation(format!(
                            "top-up {} reverted",
                            tx_hash
                        )));
                    }
                    debug!("Top-up {} mined", tx_hash);
                    return Ok(());
                }
                Err(e) => debug!("Receipt lookup for {} failed: {}", tx_hash, e),
            }

            if Instant::now() >= deadline {
                warn!(
                    "Top-up {} not mined within {}ms",
                    tx_hash,
                    self.receipt_timeout.as_millis()
                );
                return Ok(());
            }
            tokio::time::sleep(self.receipt_poll).await;
        }
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn get_smart_account_balance(&self) -> Result<u128> {
        self.rpc.get_balance(&self.smart_account).await
    }

    async fn is_paymaster_enabled(&self) -> Result<bool> {
        Ok(self.paymaster_enabled)
    }

    #[instrument(skip(self))]
    async fn prefund_smart_account(&self, amount: &str) -> Result<String> {
        let amount: Decimal = amount
            .parse()
            .map_err(|e| SentinelError::Validation(format!("bad top-up amount {:?}: {}", amount, e)))?;
        let wei = native_to_wei(amount)?;

        let value = self
            .rpc
            .send_once(
                "eth_sendTransaction",
                json!([{
                    "from": self.funder,
                    "to": self.smart_account,
                    "value": to_hex_quantity(wei),
                }]),
            )
            .await?;

        let tx_hash = value
            .as_str()
            .map(String::from)
            .ok_or_else(|| RpcError::InvalidResponse(format!("eth_sendTransaction returned {}", value)))?;
        info!(
            "Prefund of {} with {} from {} submitted: {}",
            self.smart_account, amount, self.funder, tx_hash
        );
        self.wait_for_receipt(&tx_hash).await?;
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::transport::MockRpcTransport;
    use crate::rpc::{RpcAdapterSettings, RpcEndpoint, RpcTransport};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn client_with(transport: Arc<dyn RpcTransport>, settings: RpcAdapterSettings) -> RpcChainClient {
        let rpc = ResilientRpcAdapter::new(
            settings,
            vec![
                RpcEndpoint::new("http://node.local", 0).unwrap(),
                RpcEndpoint::new("http://backup.local", 1).unwrap(),
            ],
            transport,
        );
        RpcChainClient::new(
            rpc,
            &ChainConfig {
                smart_account_address: "0xaccount".into(),
                funder_address: "0xfunder".into(),
                paymaster_enabled: false,
                receipt_timeout_ms: 50,
                receipt_poll_ms: 5,
            },
        )
    }

    fn client(transport: MockRpcTransport) -> RpcChainClient {
        client_with(Arc::new(transport), RpcAdapterSettings::default())
    }

    fn mined(_: &str, _: &str, _: &Value) -> std::result::Result<Value, RpcError> {
        Ok(json!({ "status": "0x1" }))
    }

    #[test]
    fn test_native_to_wei() {
        assert_eq!(native_to_wei(dec!(0.5)).unwrap(), 500_000_000_000_000_000);
        assert!(native_to_wei(dec!(0)).is_err());
        assert!(native_to_wei(dec!(-1)).is_err());
    }

    #[tokio::test]
    async fn test_prefund_sends_hex_value() {
        let mut transport = MockRpcTransport::new();
        transport
            .expect_send()
            .withf(|_, method, params| {
                method == "eth_sendTransaction"
                    && params[0]["from"] == "0xfunder"
                    && params[0]["to"] == "0xaccount"
                    && params[0]["value"] == "0x6f05b59d3b20000"
            })
            .times(1)
            .returning(|_, _, _| Ok(json!("0xhash")));
        transport
            .expect_send()
            .withf(|_, method, params| method == "eth_getTransactionReceipt" && params[0] == "0xhash")
            .times(1)
            .returning(mined);

        let hash = client(transport).prefund_smart_account("0.5").await.unwrap();
        assert_eq!(hash, "0xhash");
    }

    /// Node that accepts every transaction but answers the first one late
    struct SlowNode {
        sends: AtomicU32,
    }

    #[async_trait]
    impl RpcTransport for SlowNode {
        async fn send(&self, _url: &str, method: &str, _params: &Value) -> std::result::Result<Value, RpcError> {
            if method != "eth_sendTransaction" {
                return Ok(json!({ "status": "0x1" }));
            }
            if self.sends.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(json!("0xhash"))
        }
    }

    #[tokio::test]
    async fn test_prefund_is_never_resubmitted() {
        let node = Arc::new(SlowNode {
            sends: AtomicU32::new(0),
        });
        let settings = RpcAdapterSettings {
            max_retries: 3,
            timeout: Duration::from_millis(10),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RpcAdapterSettings::default()
        };

        let result = client_with(node.clone(), settings)
            .prefund_smart_account("0.5")
            .await;
        assert!(matches!(
            result,
            Err(SentinelError::Rpc(RpcError::Timeout { .. }))
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(node.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prefund_waits_for_pending_receipt() {
        let mut transport = MockRpcTransport::new();
        let lookups = Arc::new(AtomicU32::new(0));
        transport
            .expect_send()
            .withf(|_, method, _| method == "eth_sendTransaction")
            .times(1)
            .returning(|_, _, _| Ok(json!("0xhash")));
        let seen = lookups.clone();
        transport
            .expect_send()
            .withf(|_, method, _| method == "eth_getTransactionReceipt")
            .returning(move |_, _, _| {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(Value::Null)
                } else {
                    Ok(json!({ "status": "0x1" }))
                }
            });

        client(transport).prefund_smart_account("0.5").await.unwrap();
        assert_eq!(lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reverted_top_up_is_an_error() {
        let mut transport = MockRpcTransport::new();
        transport
            .expect_send()
            .withf(|_, method, _| method == "eth_sendTransaction")
            .returning(|_, _, _| Ok(json!("0xhash")));
        transport
            .expect_send()
            .withf(|_, method, _| method == "eth_getTransactionReceipt")
            .returning(|_, _, _| Ok(json!({ "status": "0x0" })));

        let err = client(transport).prefund_smart_account("0.5").await.unwrap_err();
        assert!(matches!(err, SentinelError::Remediation(_)));
    }

    #[tokio::test]
    async fn test_balance_reads_smart_account() {
        let mut transport = MockRpcTransport::new();
        transport
            .expect_send()
            .withf(|_, method, params| method == "eth_getBalance" && params[0] == "0xaccount")
            .returning(|_, _, _| Ok(json!("0xde0b6b3a7640000")));

        let balance = client(transport).get_smart_account_balance().await.unwrap();
        assert_eq!(balance, 1_000_000_000_000_000_000);
    }
}

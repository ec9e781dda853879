use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::OwnOrder;

/// Outgoing HTLC payment for one leg of a swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub destination: String,
    pub units: u128,
    pub r_hash: String,
    /// CLTV delta required on the final hop.
    pub cltv_delta: u32,
    /// Upper bound on the total route time lock, if the receiver imposed one.
    pub max_time_lock: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    #[error("no route found: {0}")]
    NoRoute(String),
    #[error("payment failed: {0}")]
    Failed(String),
}

/// A payment-channel network client for a single currency.
#[async_trait]
pub trait PaymentClient: Send + Sync {
    fn currency(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// CLTV delta this client requires on the final hop of incoming payments.
    fn final_lock(&self) -> u32;

    fn minutes_per_block(&self) -> f64;

    /// Our own node identifier on this network.
    async fn destination(&self) -> Result<String>;

    /// Registers an invoice that is held, not settled, until the preimage is
    /// supplied through `resolve_pending_htlc`. Returns the payment request.
    async fn add_hodl_invoice(&self, r_hash: &str, units: u128, cltv_delta: u32)
    -> Result<String>;

    async fn remove_invoice(&self, r_hash: &str) -> Result<()>;

    /// Total time lock of the best route to `destination`, `None` without a route.
    async fn route_time_lock(
        &self,
        destination: &str,
        units: u128,
        final_cltv_delta: u32,
    ) -> Result<Option<u32>>;

    async fn block_height(&self) -> Result<u32>;

    /// Resolves with the hex preimage once the receiver settles.
    async fn send_payment(&self, request: PaymentRequest) -> Result<String, PaymentError>;

    async fn resolve_pending_htlc(&self, r_hash: &str, preimage: &str) -> Result<()>;
}

/// Delivers opaque envelopes to remote peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, peer_pub_key: &str, envelope: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub pair_id: String,
    pub order_id: String,
    pub quantity: i64,
}

/// The order-matching collaborator. It owns hold state; we only request and
/// release holds.
#[async_trait]
pub trait OrderBook: Send + Sync {
    async fn own_order(&self, pair_id: &str, order_id: &str) -> Result<Option<OwnOrder>>;

    async fn hold_order_quantity(&self, pair_id: &str, order_id: &str, quantity: i64)
    -> Result<Hold>;

    async fn release_hold(&self, hold: Hold) -> Result<()>;

    async fn complete_order(&self, pair_id: &str, order_id: &str, quantity: i64) -> Result<()>;
}

/// Payment clients indexed by currency ticker.
#[derive(Clone, Default)]
pub struct PaymentClients {
    by_currency: HashMap<String, Arc<dyn PaymentClient>>,
}

impl PaymentClients {
    pub fn new(clients: impl IntoIterator<Item = Arc<dyn PaymentClient>>) -> Self {
        let by_currency = clients
            .into_iter()
            .map(|c| (c.currency().to_string(), c))
            .collect();
        Self { by_currency }
    }

    /// Only connected clients count as set up.
    pub fn get(&self, currency: &str) -> Option<Arc<dyn PaymentClient>> {
        self.by_currency
            .get(currency)
            .filter(|c| c.is_connected())
            .cloned()
    }
}

impl std::fmt::Debug for PaymentClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentClients")
            .field("currencies", &self.by_currency.keys().collect::<Vec<_>>())
            .finish()
    }
}

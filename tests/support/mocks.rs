//! In-memory collaborators: one payment network per currency, a loopback
//! peer hub and a simple order book. Wiring two `SwapService`s through these
//! runs the whole protocol without external processes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use xswap_engine::swap::clients::{
    Hold, OrderBook, PaymentClient, PaymentClients, PaymentError, PaymentRequest, PeerTransport,
};
use xswap_engine::swap::packets::SwapPacket;
use xswap_engine::swap::preimage::{PreimageSource, RandomPreimages};
use xswap_engine::swap::store::{DealRepository, SqliteDealStore};
use xswap_engine::swap::timeouts::SwapTimeouts;
use xswap_engine::swap::{
    OrderType, OwnOrder, SwapCollaborators, SwapService, SwapServiceConfig,
};

pub const BLOCK_HEIGHT: u32 = 1_000;

/// Payments on one currency between registered destinations.
#[derive(Default)]
pub struct MockNetwork {
    receivers: Mutex<HashMap<String, SwapService>>,
    invoices: Mutex<HashMap<(String, String), u128>>,
    held: Mutex<HashMap<(String, String), oneshot::Sender<String>>>,
    payments: Mutex<Vec<PaymentRequest>>,
    parked_destinations: Mutex<HashSet<String>>,
    parked: Mutex<HashMap<String, oneshot::Sender<Result<String, PaymentError>>>>,
}

impl MockNetwork {
    pub fn register(&self, destination: &str, service: SwapService) {
        self.receivers
            .lock()
            .unwrap()
            .insert(destination.to_string(), service);
    }

    pub fn payments(&self) -> Vec<PaymentRequest> {
        self.payments.lock().unwrap().clone()
    }

    pub fn has_invoice(&self, destination: &str, r_hash: &str) -> bool {
        self.invoices
            .lock()
            .unwrap()
            .contains_key(&(destination.to_string(), r_hash.to_string()))
    }

    /// Payments to `destination` hang until the test calls `release`.
    pub fn park_payments_to(&self, destination: &str) {
        self.parked_destinations
            .lock()
            .unwrap()
            .insert(destination.to_string());
    }

    pub fn is_parked(&self, r_hash: &str) -> bool {
        self.parked.lock().unwrap().contains_key(r_hash)
    }

    pub fn release(&self, r_hash: &str, outcome: Result<String, PaymentError>) -> Result<()> {
        let tx = self
            .parked
            .lock()
            .unwrap()
            .remove(r_hash)
            .context("no parked payment")?;
        tx.send(outcome)
            .map_err(|_| anyhow::anyhow!("payer went away"))
    }

    /// Stands in for an HTLC paid to `destination` by someone outside the
    /// market. The receiver yields the preimage it is settled with.
    pub fn hold_htlc(&self, destination: &str, r_hash: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.held
            .lock()
            .unwrap()
            .insert((destination.to_string(), r_hash.to_string()), tx);
        rx
    }
}

pub struct MockPaymentClient {
    currency: String,
    destination: String,
    network: Arc<MockNetwork>,
    connected: AtomicBool,
    no_route: AtomicBool,
    removed: Mutex<Vec<String>>,
}

impl MockPaymentClient {
    pub fn new(currency: &str, destination: &str, network: Arc<MockNetwork>) -> Self {
        Self {
            currency: currency.to_string(),
            destination: destination.to_string(),
            network,
            connected: AtomicBool::new(true),
            no_route: AtomicBool::new(false),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn destination_id(&self) -> &str {
        &self.destination
    }

    pub fn set_no_route(&self) {
        self.no_route.store(true, Ordering::SeqCst);
    }

    pub fn removed_invoices(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentClient for MockPaymentClient {
    fn currency(&self) -> &str {
        &self.currency
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn final_lock(&self) -> u32 {
        match self.currency.as_str() {
            "BTC" => 40,
            _ => 100,
        }
    }

    fn minutes_per_block(&self) -> f64 {
        match self.currency.as_str() {
            "BTC" => 10.0,
            "LTC" => 2.5,
            _ => 0.25,
        }
    }

    async fn destination(&self) -> Result<String> {
        Ok(self.destination.clone())
    }

    async fn add_hodl_invoice(&self, r_hash: &str, units: u128, _cltv_delta: u32) -> Result<String> {
        self.network
            .invoices
            .lock()
            .unwrap()
            .insert((self.destination.clone(), r_hash.to_string()), units);
        Ok(format!("{}:{}:{r_hash}", self.currency, self.destination))
    }

    async fn remove_invoice(&self, r_hash: &str) -> Result<()> {
        self.network
            .invoices
            .lock()
            .unwrap()
            .remove(&(self.destination.clone(), r_hash.to_string()));
        self.removed.lock().unwrap().push(r_hash.to_string());
        Ok(())
    }

    async fn route_time_lock(
        &self,
        destination: &str,
        _units: u128,
        final_cltv_delta: u32,
    ) -> Result<Option<u32>> {
        if self.no_route.load(Ordering::SeqCst) || destination.is_empty() {
            return Ok(None);
        }
        // One intermediate hop.
        Ok(Some(BLOCK_HEIGHT + final_cltv_delta + 20))
    }

    async fn block_height(&self) -> Result<u32> {
        Ok(BLOCK_HEIGHT)
    }

    async fn send_payment(&self, request: PaymentRequest) -> Result<String, PaymentError> {
        self.network.payments.lock().unwrap().push(request.clone());

        let parked = self
            .network
            .parked_destinations
            .lock()
            .unwrap()
            .contains(&request.destination);
        if parked {
            let (tx, rx) = oneshot::channel();
            self.network
                .parked
                .lock()
                .unwrap()
                .insert(request.r_hash.clone(), tx);
            return rx
                .await
                .map_err(|_| PaymentError::Failed("parked payment dropped".to_string()))?;
        }

        let receiver = self
            .network
            .receivers
            .lock()
            .unwrap()
            .get(&request.destination)
            .cloned()
            .ok_or_else(|| PaymentError::NoRoute(request.destination.clone()))?;
        let key = (request.destination.clone(), request.r_hash.clone());
        if !self.network.invoices.lock().unwrap().contains_key(&key) {
            return Err(PaymentError::Failed("unknown invoice".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        self.network.held.lock().unwrap().insert(key.clone(), tx);
        if let Err(err) = receiver
            .htlc_accepted(&request.r_hash, request.units, &self.currency)
            .await
        {
            self.network.held.lock().unwrap().remove(&key);
            return Err(PaymentError::Failed(err.to_string()));
        }
        rx.await
            .map_err(|_| PaymentError::Failed("htlc cancelled".to_string()))
    }

    async fn resolve_pending_htlc(&self, r_hash: &str, preimage: &str) -> Result<()> {
        let tx = self
            .network
            .held
            .lock()
            .unwrap()
            .remove(&(self.destination.clone(), r_hash.to_string()))
            .context("no held htlc")?;
        tx.send(preimage.to_string())
            .map_err(|_| anyhow::anyhow!("payer went away"))
    }
}

/// Delivers envelopes between registered services. Envelopes to unknown
/// peers are recorded and dropped.
#[derive(Default)]
pub struct PeerHub {
    services: Mutex<HashMap<String, SwapService>>,
    sent: Mutex<Vec<(String, String, SwapPacket)>>,
}

impl PeerHub {
    pub fn register(&self, pub_key: &str, service: SwapService) {
        self.services
            .lock()
            .unwrap()
            .insert(pub_key.to_string(), service);
    }

    pub fn disconnect(&self, pub_key: &str) {
        self.services.lock().unwrap().remove(pub_key);
    }

    /// Packets sent by `from`, in order.
    pub fn sent_by(&self, from: &str) -> Vec<SwapPacket> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(f, _, _)| f == from)
            .map(|(_, _, p)| p.clone())
            .collect()
    }

    pub fn kinds_sent_by(&self, from: &str) -> Vec<&'static str> {
        self.sent_by(from).iter().map(SwapPacket::kind).collect()
    }
}

pub struct LoopbackTransport {
    me: String,
    hub: Arc<PeerHub>,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn send(&self, peer_pub_key: &str, envelope: Vec<u8>) -> Result<()> {
        let packet = SwapPacket::decode(&envelope).context("decode outgoing envelope")?;
        self.hub.sent.lock().unwrap().push((
            self.me.clone(),
            peer_pub_key.to_string(),
            packet,
        ));
        let target = self.hub.services.lock().unwrap().get(peer_pub_key).cloned();
        if let Some(service) = target {
            service.envelope_received(&self.me, &envelope)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockOrderBook {
    orders: Mutex<HashMap<String, OwnOrder>>,
    holds: Mutex<Vec<Hold>>,
    released: Mutex<Vec<Hold>>,
    completed: Mutex<Vec<Hold>>,
}

impl MockOrderBook {
    pub fn add_order(&self, order: OwnOrder) {
        self.orders.lock().unwrap().insert(order.id.clone(), order);
    }

    pub fn order(&self, id: &str) -> Option<OwnOrder> {
        self.orders.lock().unwrap().get(id).cloned()
    }

    pub fn holds(&self) -> Vec<Hold> {
        self.holds.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<Hold> {
        self.released.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<Hold> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderBook for MockOrderBook {
    async fn own_order(&self, pair_id: &str, order_id: &str) -> Result<Option<OwnOrder>> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .get(order_id)
            .filter(|o| o.pair_id == pair_id)
            .cloned())
    }

    async fn hold_order_quantity(
        &self,
        pair_id: &str,
        order_id: &str,
        quantity: i64,
    ) -> Result<Hold> {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(order_id).context("order not found")?;
        anyhow::ensure!(order.available_quantity() >= quantity, "insufficient quantity");
        order.hold += quantity;
        let hold = Hold {
            pair_id: pair_id.to_string(),
            order_id: order_id.to_string(),
            quantity,
        };
        self.holds.lock().unwrap().push(hold.clone());
        Ok(hold)
    }

    async fn release_hold(&self, hold: Hold) -> Result<()> {
        if let Some(order) = self.orders.lock().unwrap().get_mut(&hold.order_id) {
            order.hold -= hold.quantity;
        }
        self.released.lock().unwrap().push(hold);
        Ok(())
    }

    async fn complete_order(&self, pair_id: &str, order_id: &str, quantity: i64) -> Result<()> {
        if let Some(order) = self.orders.lock().unwrap().get_mut(order_id) {
            order.hold -= quantity;
            order.quantity -= quantity;
        }
        self.completed.lock().unwrap().push(Hold {
            pair_id: pair_id.to_string(),
            order_id: order_id.to_string(),
            quantity,
        });
        Ok(())
    }
}

/// Always hands out the same secret.
pub struct FixedPreimages(pub [u8; 32]);

impl PreimageSource for FixedPreimages {
    fn next_preimage(&mut self) -> [u8; 32] {
        self.0
    }
}

pub fn limit_order(id: &str, pair_id: &str, price: i64, quantity: i64, is_buy: bool) -> OwnOrder {
    OwnOrder {
        id: id.to_string(),
        local_id: format!("local-{id}"),
        pair_id: pair_id.to_string(),
        price,
        quantity,
        hold: 0,
        is_buy,
        order_type: OrderType::Limit,
    }
}

pub struct Node {
    pub pub_key: String,
    pub service: SwapService,
    pub handle: JoinHandle<()>,
    pub btc: Arc<MockPaymentClient>,
    pub eth: Arc<MockPaymentClient>,
    pub orderbook: Arc<MockOrderBook>,
}

pub struct NodeOptions {
    pub repository: Box<dyn DealRepository>,
    pub preimages: Box<dyn PreimageSource>,
    pub timeouts: SwapTimeouts,
    pub orderbook: Arc<MockOrderBook>,
}

impl NodeOptions {
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            repository: Box::new(SqliteDealStore::open_in_memory()?),
            preimages: Box::new(RandomPreimages),
            timeouts: SwapTimeouts::default(),
            orderbook: Arc::default(),
        })
    }
}

/// Two currencies and a peer hub shared by every node spawned from it.
#[derive(Default)]
pub struct Market {
    pub hub: Arc<PeerHub>,
    pub btc: Arc<MockNetwork>,
    pub eth: Arc<MockNetwork>,
}

impl Market {
    pub fn spawn_node(&self, pub_key: &str, options: NodeOptions) -> Result<Node> {
        let btc = Arc::new(MockPaymentClient::new(
            "BTC",
            &format!("{pub_key}-btc"),
            self.btc.clone(),
        ));
        let eth = Arc::new(MockPaymentClient::new(
            "ETH",
            &format!("{pub_key}-eth"),
            self.eth.clone(),
        ));
        let orderbook = options.orderbook;

        let clients = PaymentClients::new([
            btc.clone() as Arc<dyn PaymentClient>,
            eth.clone() as Arc<dyn PaymentClient>,
        ]);
        let (service, handle) = SwapService::spawn(
            SwapServiceConfig {
                node_pub_key: pub_key.to_string(),
                timeouts: options.timeouts,
            },
            SwapCollaborators {
                clients,
                peers: Arc::new(LoopbackTransport {
                    me: pub_key.to_string(),
                    hub: self.hub.clone(),
                }),
                orderbook: orderbook.clone(),
                repository: options.repository,
                preimages: options.preimages,
            },
        )?;

        self.hub.register(pub_key, service.clone());
        self.btc.register(btc.destination_id(), service.clone());
        self.eth.register(eth.destination_id(), service.clone());

        Ok(Node {
            pub_key: pub_key.to_string(),
            service,
            handle,
            btc,
            eth,
            orderbook,
        })
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use super::amounts::{MakerTakerAmounts, calculate_lock_buffer, split_pair};
use super::clients::{
    Hold, OrderBook, PaymentClient, PaymentClients, PaymentError, PaymentRequest, PeerTransport,
};
use super::packets::{
    InvoiceExchangeAckBody, InvoiceExchangeBody, SwapAcceptedBody, SwapCompleteBody,
    SwapFailedBody, SwapPacket, SwapRequestBody,
};
use super::preimage::{self, PreimageSource, payment_hash_hex};
use super::sanity::{Probe, ProbeRole, SANITY_UNITS, SanityProbes};
use super::service::{SwapCollaborators, SwapServiceConfig};
use super::store::DealRepository;
use super::timeouts::{FiredTimer, TimeoutRegistry, TimerAction};
use super::{
    OwnOrder, PeerOrder, SwapDeal, SwapError, SwapEvent, SwapFailureReason, SwapPhase, SwapRole,
    SwapState, SwapSuccess, now_millis,
};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SwapError>>;

pub(crate) enum Command {
    ExecuteSwap {
        maker: PeerOrder,
        taker: OwnOrder,
        reply: Reply<SwapSuccess>,
    },
    Packet {
        peer: String,
        packet: SwapPacket,
    },
    HtlcAccepted {
        r_hash: String,
        units: u128,
        currency: String,
        reply: Reply<()>,
    },
    PaymentSent {
        r_hash: String,
        result: Result<String, PaymentError>,
    },
    BeginSanitySwap {
        peer: String,
        currency: String,
        peer_destination: String,
        reply: Reply<String>,
    },
    ExpectSanitySwap {
        peer: String,
        currency: String,
        r_hash: String,
        peer_destination: String,
        reply: Reply<String>,
    },
    GetDeal {
        r_hash: String,
        reply: oneshot::Sender<Option<SwapDeal>>,
    },
    ActiveDeals {
        reply: oneshot::Sender<Vec<SwapDeal>>,
    },
}

/// Single owner of all deal state. Every packet, client event and timer is
/// handled here one at a time.
pub(crate) struct SwapManager {
    config: SwapServiceConfig,
    clients: PaymentClients,
    peers: Arc<dyn PeerTransport>,
    orderbook: Arc<dyn OrderBook>,
    repo: Box<dyn DealRepository>,
    preimages: Box<dyn PreimageSource>,

    /// Active deals only; finished ones live in the repository.
    deals: HashMap<String, SwapDeal>,
    used_hashes: HashSet<String>,
    holds: HashMap<String, Hold>,
    pending: HashMap<String, Reply<SwapSuccess>>,
    /// Taker deals whose outgoing payment settled before the incoming HTLC showed up.
    payment_sent: HashSet<String>,
    timers: TimeoutRegistry,
    probes: SanityProbes,

    events: broadcast::Sender<SwapEvent>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl SwapManager {
    /// Loads every stored deal and re-arms timers for the active ones.
    pub(crate) fn new(
        config: SwapServiceConfig,
        parts: SwapCollaborators,
        events: broadcast::Sender<SwapEvent>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Result<Self> {
        let stored = parts.repository.load_all().context("load stored deals")?;

        let mut manager = Self {
            config,
            clients: parts.clients,
            peers: parts.peers,
            orderbook: parts.orderbook,
            repo: parts.repository,
            preimages: parts.preimages,
            deals: HashMap::new(),
            used_hashes: HashSet::new(),
            holds: HashMap::new(),
            pending: HashMap::new(),
            payment_sent: HashSet::new(),
            timers: TimeoutRegistry::default(),
            probes: SanityProbes::default(),
            events,
            commands,
        };

        for deal in stored {
            manager.used_hashes.insert(deal.r_hash.clone());
            if deal.is_active() {
                tracing::info!(
                    r_hash = %deal.r_hash,
                    role = deal.role.as_str(),
                    phase = %deal.phase,
                    "resuming active deal"
                );
                manager.arm_phase_timer(&deal);
                // The order book keeps its holds across restarts; we only
                // need to know what to release or complete.
                if deal.role == SwapRole::Maker {
                    manager.holds.insert(
                        deal.r_hash.clone(),
                        Hold {
                            pair_id: deal.pair_id.clone(),
                            order_id: deal.order_id.clone(),
                            quantity: deal.quantity.unwrap_or(deal.proposed_quantity),
                        },
                    );
                }
                manager.deals.insert(deal.r_hash.clone(), deal);
            }
        }

        Ok(manager)
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = wait_until(deadline) => self.fire_timers().await,
            }
        }
        tracing::debug!("swap manager stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::ExecuteSwap {
                maker,
                taker,
                reply,
            } => self.execute_swap(maker, taker, reply).await,
            Command::Packet { peer, packet } => self.packet_received(&peer, packet).await,
            Command::HtlcAccepted {
                r_hash,
                units,
                currency,
                reply,
            } => {
                let result = self.htlc_accepted(&r_hash, units, &currency).await;
                let _ = reply.send(result);
            }
            Command::PaymentSent { r_hash, result } => self.payment_sent(&r_hash, result).await,
            Command::BeginSanitySwap {
                peer,
                currency,
                peer_destination,
                reply,
            } => {
                self.begin_sanity_swap(&peer, &currency, &peer_destination, reply)
                    .await
            }
            Command::ExpectSanitySwap {
                peer,
                currency,
                r_hash,
                peer_destination,
                reply,
            } => {
                self.expect_sanity_swap(&peer, &currency, &r_hash, &peer_destination, reply)
                    .await
            }
            Command::GetDeal { r_hash, reply } => {
                let _ = reply.send(self.deal(&r_hash));
            }
            Command::ActiveDeals { reply } => {
                let mut deals: Vec<_> = self.deals.values().cloned().collect();
                deals.sort_by(|a, b| {
                    (a.create_time, &a.r_hash).cmp(&(b.create_time, &b.r_hash))
                });
                let _ = reply.send(deals);
            }
        }
    }

    fn deal(&self, r_hash: &str) -> Option<SwapDeal> {
        if let Some(deal) = self.deals.get(r_hash) {
            return Some(deal.clone());
        }
        match self.repo.get(r_hash) {
            Ok(deal) => deal,
            Err(err) => {
                tracing::warn!(r_hash, error = %format!("{err:#}"), "load deal failed");
                None
            }
        }
    }

    // ---- taker: start ----

    async fn execute_swap(&mut self, maker: PeerOrder, taker: OwnOrder, reply: Reply<SwapSuccess>) {
        let mut deal = match self.create_taker_deal(&maker, &taker).await {
            Ok(deal) => deal,
            Err(err) => {
                tracing::warn!(
                    order_id = %maker.id,
                    local_id = %taker.local_id,
                    error = %err,
                    "swap rejected before start"
                );
                let _ = reply.send(Err(err));
                return;
            }
        };

        let r_hash = deal.r_hash.clone();
        self.pending.insert(r_hash.clone(), reply);
        if let Err(err) = self.request_swap(&mut deal).await {
            self.fail_deal(&r_hash, err.reason, &err.message, false)
                .await;
        }
    }

    async fn create_taker_deal(
        &mut self,
        maker: &PeerOrder,
        taker: &OwnOrder,
    ) -> Result<SwapDeal, SwapError> {
        if maker.peer_pub_key == self.config.node_pub_key {
            return Err(SwapError::new(
                SwapFailureReason::SwapToYourself,
                "cannot swap against our own order",
            ));
        }
        if maker.pair_id != taker.pair_id {
            return Err(SwapError::new(
                SwapFailureReason::InvalidSwapRequest,
                format!("pair mismatch {} vs {}", maker.pair_id, taker.pair_id),
            ));
        }

        let amounts =
            MakerTakerAmounts::calculate(taker.quantity, maker.price, maker.is_buy, &maker.pair_id)?;
        let taker_client = self.client(&amounts.taker.currency)?;
        self.client(&amounts.maker.currency)?;

        let (r_preimage, r_hash) = preimage::generate(self.preimages.as_mut());
        if self.is_used_hash(&r_hash)? {
            return Err(SwapError::new(
                SwapFailureReason::PaymentHashReuse,
                format!("payment hash {r_hash} already used"),
            ));
        }

        let taker_destination = taker_client.destination().await.map_err(|e| {
            SwapError::new(
                SwapFailureReason::SwapClientNotSetup,
                format!("fetch {} destination: {e:#}", amounts.taker.currency),
            )
        })?;

        let deal = SwapDeal {
            role: SwapRole::Taker,
            phase: SwapPhase::SwapCreated,
            state: SwapState::Active,
            error_message: None,
            failure_reason: None,
            peer_pub_key: maker.peer_pub_key.clone(),
            order_id: maker.id.clone(),
            local_id: taker.local_id.clone(),
            pair_id: maker.pair_id.clone(),
            order_type: taker.order_type,
            is_buy: maker.is_buy,
            proposed_quantity: taker.quantity,
            quantity: None,
            price: maker.price,
            taker_amount: amounts.taker.amount,
            taker_units: amounts.taker.units,
            taker_currency: amounts.taker.currency.clone(),
            taker_pub_key: Some(taker_destination),
            taker_cltv_delta: taker_client.final_lock(),
            maker_amount: amounts.maker.amount,
            maker_units: amounts.maker.units,
            maker_currency: amounts.maker.currency.clone(),
            maker_pub_key: None,
            maker_cltv_delta: None,
            r_hash,
            r_preimage: Some(r_preimage),
            payment_request: None,
            taker_max_time_lock: None,
            destination: None,
            create_time: now_millis(),
            execute_time: None,
            complete_time: None,
        };

        self.used_hashes.insert(deal.r_hash.clone());
        self.persist(&deal)?;
        tracing::info!(
            r_hash = %deal.r_hash,
            peer = %deal.peer_pub_key,
            order_id = %deal.order_id,
            amounts = %amounts,
            "beginning swap"
        );
        Ok(deal)
    }

    async fn request_swap(&mut self, deal: &mut SwapDeal) -> Result<(), SwapError> {
        self.set_phase(deal, SwapPhase::SwapRequested)?;
        let request = SwapPacket::SwapRequest(SwapRequestBody {
            r_hash: deal.r_hash.clone(),
            order_id: deal.order_id.clone(),
            pair_id: deal.pair_id.clone(),
            proposed_quantity: deal.proposed_quantity,
            taker_cltv_delta: deal.taker_cltv_delta,
            taker_destination: deal.taker_pub_key.clone().unwrap_or_default(),
        });
        self.send_packet(&deal.peer_pub_key, &request)
            .await
            .map_err(|e| {
                SwapError::new(
                    SwapFailureReason::RemoteError,
                    format!("send swap request: {e:#}"),
                )
            })
    }

    // ---- packets ----

    async fn packet_received(&mut self, peer: &str, packet: SwapPacket) {
        tracing::debug!(peer, kind = packet.kind(), r_hash = packet.r_hash(), "packet received");
        match packet {
            SwapPacket::SwapRequest(body) => self.on_swap_requested(peer, body).await,
            SwapPacket::SwapAccepted(body) => self.on_swap_accepted(peer, body).await,
            SwapPacket::InvoiceExchange(body) => self.on_invoice_exchange(peer, body).await,
            SwapPacket::InvoiceExchangeAck(body) => {
                self.on_invoice_exchange_ack(peer, body).await
            }
            SwapPacket::SwapComplete(body) => self.on_swap_complete(peer, body).await,
            SwapPacket::SwapFailed(body) => self.on_swap_failed(peer, body).await,
        }
    }

    /// The active deal `r_hash` if it belongs to `peer`, has `role` and sits in
    /// one of `phases`. Anything else is a stale or duplicate packet.
    fn expect_deal(
        &self,
        peer: &str,
        r_hash: &str,
        role: SwapRole,
        phases: &[SwapPhase],
        kind: &str,
    ) -> Option<SwapDeal> {
        let Some(deal) = self.deals.get(r_hash) else {
            tracing::debug!(peer, r_hash, kind, "ignoring packet for unknown or finished deal");
            return None;
        };
        if deal.peer_pub_key != peer || deal.role != role || !phases.contains(&deal.phase) {
            tracing::warn!(
                peer,
                r_hash,
                kind,
                role = deal.role.as_str(),
                phase = %deal.phase,
                "ignoring unexpected packet"
            );
            return None;
        }
        Some(deal.clone())
    }

    async fn on_swap_requested(&mut self, peer: &str, body: SwapRequestBody) {
        let (order, amounts, hold) = match self.validate_request(peer, &body).await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(peer, r_hash = %body.r_hash, error = %err, "rejecting swap request");
                let packet = SwapPacket::failed(&body.r_hash, err.reason, err.message);
                if let Err(e) = self.send_packet(peer, &packet).await {
                    tracing::warn!(peer, error = %format!("{e:#}"), "send swap failed");
                }
                return;
            }
        };

        let mut deal = SwapDeal {
            role: SwapRole::Maker,
            phase: SwapPhase::SwapCreated,
            state: SwapState::Active,
            error_message: None,
            failure_reason: None,
            peer_pub_key: peer.to_string(),
            order_id: order.id.clone(),
            local_id: order.local_id.clone(),
            pair_id: body.pair_id.clone(),
            order_type: order.order_type,
            is_buy: order.is_buy,
            proposed_quantity: body.proposed_quantity,
            quantity: Some(body.proposed_quantity),
            price: order.price,
            taker_amount: amounts.taker.amount,
            taker_units: amounts.taker.units,
            taker_currency: amounts.taker.currency.clone(),
            taker_pub_key: Some(body.taker_destination.clone()),
            taker_cltv_delta: body.taker_cltv_delta,
            maker_amount: amounts.maker.amount,
            maker_units: amounts.maker.units,
            maker_currency: amounts.maker.currency.clone(),
            maker_pub_key: None,
            maker_cltv_delta: None,
            r_hash: body.r_hash.clone(),
            r_preimage: None,
            payment_request: None,
            taker_max_time_lock: None,
            destination: Some(body.taker_destination.clone()),
            create_time: now_millis(),
            execute_time: None,
            complete_time: None,
        };

        self.used_hashes.insert(deal.r_hash.clone());
        if let Err(err) = self.persist(&deal) {
            if let Err(e) = self.orderbook.release_hold(hold).await {
                tracing::warn!(r_hash = %deal.r_hash, error = %format!("{e:#}"), "release hold failed");
            }
            let packet = SwapPacket::failed(&deal.r_hash, err.reason, err.message);
            if let Err(e) = self.send_packet(peer, &packet).await {
                tracing::warn!(peer, error = %format!("{e:#}"), "send swap failed");
            }
            return;
        }
        self.holds.insert(deal.r_hash.clone(), hold);
        tracing::info!(
            r_hash = %deal.r_hash,
            peer,
            order_id = %deal.order_id,
            amounts = %amounts,
            "accepting swap request"
        );

        if let Err(err) = self.accept_deal(&mut deal).await {
            self.fail_deal(&deal.r_hash, err.reason, &err.message, true)
                .await;
        }
    }

    /// Checks a request against our order book and reserves the quantity.
    /// Nothing is recorded unless this succeeds.
    async fn validate_request(
        &mut self,
        peer: &str,
        body: &SwapRequestBody,
    ) -> Result<(OwnOrder, MakerTakerAmounts, Hold), SwapError> {
        if self.is_used_hash(&body.r_hash)? {
            return Err(SwapError::new(
                SwapFailureReason::PaymentHashReuse,
                "payment hash reuse",
            ));
        }
        if peer == self.config.node_pub_key {
            return Err(SwapError::new(
                SwapFailureReason::SwapToYourself,
                "swap request from our own node",
            ));
        }
        if body.r_hash.is_empty()
            || body.proposed_quantity <= 0
            || body.taker_destination.is_empty()
        {
            return Err(SwapError::new(
                SwapFailureReason::InvalidSwapRequest,
                "swap request is missing required fields",
            ));
        }

        let (base, quote) = split_pair(&body.pair_id)?;
        self.client(base)?;
        self.client(quote)?;

        let order_not_found = |msg: String| SwapError::new(SwapFailureReason::OrderNotFound, msg);
        let order = self
            .orderbook
            .own_order(&body.pair_id, &body.order_id)
            .await
            .map_err(|e| order_not_found(format!("lookup order {}: {e:#}", body.order_id)))?
            .ok_or_else(|| order_not_found(format!("order {} not found", body.order_id)))?;

        if self
            .deals
            .values()
            .any(|d| d.role == SwapRole::Maker && d.order_id == order.id)
        {
            return Err(SwapError::new(
                SwapFailureReason::OrderOnHold,
                format!("order {} is on hold for another swap", order.id),
            ));
        }

        let available = order.available_quantity();
        if body.proposed_quantity > available {
            return Err(order_not_found(format!(
                "proposed quantity {} exceeds available quantity {available}",
                body.proposed_quantity
            )));
        }

        let amounts = MakerTakerAmounts::calculate(
            body.proposed_quantity,
            order.price,
            order.is_buy,
            &body.pair_id,
        )?;

        let hold = self
            .orderbook
            .hold_order_quantity(&body.pair_id, &order.id, body.proposed_quantity)
            .await
            .map_err(|e| order_not_found(format!("hold order {}: {e:#}", order.id)))?;

        Ok((order, amounts, hold))
    }

    async fn accept_deal(&mut self, deal: &mut SwapDeal) -> Result<(), SwapError> {
        let maker_client = self.client(&deal.maker_currency)?;
        let taker_client = self.client(&deal.taker_currency)?;
        let taker_destination = deal.destination.clone().unwrap_or_default();

        let route_lock = taker_client
            .route_time_lock(&taker_destination, deal.taker_units, deal.taker_cltv_delta)
            .await
            .map_err(|e| client_error("query route to taker", e))?
            .ok_or_else(|| {
                SwapError::new(
                    SwapFailureReason::NoRouteFound,
                    "no route to fit this order volume, try a smaller amount",
                )
            })?;
        let height = taker_client
            .block_height()
            .await
            .map_err(|e| client_error("fetch block height", e))?;
        let maker_destination = maker_client
            .destination()
            .await
            .map_err(|e| client_error("fetch maker destination", e))?;

        // Our own final lock on top leaves room for other routes.
        let taker_max_time_lock = route_lock.saturating_sub(height) + taker_client.final_lock();
        let lock_buffer = calculate_lock_buffer(
            taker_max_time_lock,
            taker_client.minutes_per_block(),
            maker_client.minutes_per_block(),
        );
        let maker_cltv_delta = lock_buffer.saturating_add(maker_client.final_lock());
        tracing::debug!(
            r_hash = %deal.r_hash,
            taker_max_time_lock,
            lock_buffer,
            maker_cltv_delta,
            "computed lock deltas"
        );

        deal.maker_pub_key = Some(maker_destination.clone());
        deal.taker_max_time_lock = Some(taker_max_time_lock);
        deal.maker_cltv_delta = Some(maker_cltv_delta);

        let maker_payment_request = maker_client
            .add_hodl_invoice(&deal.r_hash, deal.maker_units, maker_cltv_delta)
            .await
            .map_err(|e| client_error("add maker invoice", e))?;

        self.set_phase(deal, SwapPhase::SwapAccepted)?;

        let accepted = SwapPacket::SwapAccepted(SwapAcceptedBody {
            r_hash: deal.r_hash.clone(),
            quantity: deal.quantity.unwrap_or(deal.proposed_quantity),
            maker_cltv_delta,
            maker_destination,
            maker_payment_request,
        });
        self.send_packet(&deal.peer_pub_key, &accepted)
            .await
            .map_err(|e| remote_error("send swap accepted", e))
    }

    async fn on_swap_accepted(&mut self, peer: &str, body: SwapAcceptedBody) {
        let Some(mut deal) = self.expect_deal(
            peer,
            &body.r_hash,
            SwapRole::Taker,
            &[SwapPhase::SwapRequested],
            "swap_accepted",
        ) else {
            return;
        };
        let result = self.exchange_invoice(&mut deal, body).await;
        self.fail_on_err(&deal.r_hash, result).await;
    }

    async fn exchange_invoice(
        &mut self,
        deal: &mut SwapDeal,
        body: SwapAcceptedBody,
    ) -> Result<(), SwapError> {
        self.timers.clear(&deal.r_hash);

        let invalid = |msg: &str| SwapError::new(SwapFailureReason::InvalidSwapPacketReceived, msg);
        if body.quantity <= 0 {
            return Err(invalid("accepted quantity must be a positive number"));
        }
        if body.quantity > deal.proposed_quantity {
            return Err(invalid(
                "accepted quantity should not be greater than proposed quantity",
            ));
        }
        if body.maker_destination.is_empty() {
            return Err(invalid("maker destination is missing"));
        }
        if body.quantity < deal.proposed_quantity {
            let amounts =
                MakerTakerAmounts::calculate(body.quantity, deal.price, deal.is_buy, &deal.pair_id)?;
            deal.taker_amount = amounts.taker.amount;
            deal.taker_units = amounts.taker.units;
            deal.maker_amount = amounts.maker.amount;
            deal.maker_units = amounts.maker.units;
        }

        deal.quantity = Some(body.quantity);
        deal.maker_cltv_delta = Some(body.maker_cltv_delta);
        deal.maker_pub_key = Some(body.maker_destination.clone());
        deal.destination = Some(body.maker_destination);
        deal.payment_request = Some(body.maker_payment_request);

        let taker_client = self.client(&deal.taker_currency)?;
        let taker_payment_request = taker_client
            .add_hodl_invoice(&deal.r_hash, deal.taker_units, deal.taker_cltv_delta)
            .await
            .map_err(|e| client_error("add taker invoice", e))?;

        self.set_phase(deal, SwapPhase::InvoiceExchange)?;

        let packet = SwapPacket::InvoiceExchange(InvoiceExchangeBody {
            r_hash: deal.r_hash.clone(),
            taker_payment_request,
        });
        self.send_packet(&deal.peer_pub_key, &packet)
            .await
            .map_err(|e| remote_error("send invoice exchange", e))
    }

    async fn on_invoice_exchange(&mut self, peer: &str, body: InvoiceExchangeBody) {
        let Some(mut deal) = self.expect_deal(
            peer,
            &body.r_hash,
            SwapRole::Maker,
            &[SwapPhase::SwapAccepted],
            "invoice_exchange",
        ) else {
            return;
        };

        deal.payment_request = Some(body.taker_payment_request);
        let result = self.acknowledge_invoice(&mut deal).await;
        self.fail_on_err(&body.r_hash, result).await;
    }

    async fn acknowledge_invoice(&mut self, deal: &mut SwapDeal) -> Result<(), SwapError> {
        self.set_phase(deal, SwapPhase::InvoiceExchange)?;
        let ack = SwapPacket::InvoiceExchangeAck(InvoiceExchangeAckBody {
            r_hash: deal.r_hash.clone(),
        });
        self.send_packet(&deal.peer_pub_key, &ack)
            .await
            .map_err(|e| remote_error("send invoice exchange ack", e))
    }

    async fn on_invoice_exchange_ack(&mut self, peer: &str, body: InvoiceExchangeAckBody) {
        let Some(mut deal) = self.expect_deal(
            peer,
            &body.r_hash,
            SwapRole::Taker,
            &[SwapPhase::InvoiceExchange],
            "invoice_exchange_ack",
        ) else {
            return;
        };

        let result = self.pay_maker(&mut deal).await;
        self.fail_on_err(&body.r_hash, result).await;
    }

    /// Taker: both invoices exist, pay the maker leg.
    async fn pay_maker(&mut self, deal: &mut SwapDeal) -> Result<(), SwapError> {
        let maker_client = self.client(deal.outgoing_currency())?;
        self.set_phase(deal, SwapPhase::SendingPayment)?;
        tracing::info!(r_hash = %deal.r_hash, "invoices exchanged, paying maker");
        let cltv_delta = deal
            .maker_cltv_delta
            .unwrap_or_else(|| maker_client.final_lock());
        self.spawn_payment(
            maker_client,
            PaymentRequest {
                destination: deal.destination.clone().unwrap_or_default(),
                units: deal.maker_units,
                r_hash: deal.r_hash.clone(),
                cltv_delta,
                max_time_lock: None,
            },
        );
        Ok(())
    }

    async fn on_swap_complete(&mut self, peer: &str, body: SwapCompleteBody) {
        let Some(current) = self.deals.get(&body.r_hash) else {
            tracing::debug!(peer, r_hash = %body.r_hash, "ignoring swap complete for finished deal");
            return;
        };
        if current.role == SwapRole::Taker {
            tracing::debug!(peer, r_hash = %body.r_hash, "taker ignores swap complete");
            return;
        }
        let Some(mut deal) = self.expect_deal(
            peer,
            &body.r_hash,
            SwapRole::Maker,
            &[SwapPhase::SendingPayment, SwapPhase::PaymentReceived],
            "swap_complete",
        ) else {
            return;
        };

        let payment_received = deal.phase == SwapPhase::PaymentReceived;
        if let Err(err) = self.set_phase(&mut deal, SwapPhase::SwapTakerCompleted) {
            self.fail_deal(&deal.r_hash, err.reason, &err.message, true)
                .await;
            return;
        }
        if payment_received {
            self.complete_deal(deal.clone()).await;
            self.send_swap_complete(&deal).await;
        }
    }

    async fn on_swap_failed(&mut self, peer: &str, body: SwapFailedBody) {
        let remote_reason = SwapFailureReason::from_code(body.failure_reason)
            .unwrap_or(SwapFailureReason::UnknownError);
        tracing::warn!(
            peer,
            r_hash = %body.r_hash,
            reason = %remote_reason,
            message = %body.error_message,
            "peer reported swap failure"
        );

        let Some(deal) = self.deals.get(&body.r_hash) else {
            self.append_failure_message(
                peer,
                &body.r_hash,
                &format!("{} - {}", body.failure_reason, body.error_message),
            );
            return;
        };
        if deal.peer_pub_key != peer {
            tracing::warn!(peer, r_hash = %body.r_hash, "ignoring swap failed from another peer");
            return;
        }
        if deal.awaits_payment_outcome() {
            tracing::warn!(
                peer,
                r_hash = %body.r_hash,
                phase = %deal.phase,
                "peer failed a deal with funds in flight, waiting for the payment outcome"
            );
            return;
        }

        let reason = if deal.role == SwapRole::Taker
            && deal.phase == SwapPhase::SwapRequested
            && remote_reason.is_request_rejection()
        {
            remote_reason
        } else {
            SwapFailureReason::RemoteError
        };
        let message = if body.error_message.is_empty() {
            remote_reason.to_string()
        } else {
            body.error_message
        };
        self.fail_deal(&body.r_hash, reason, &message, false).await;
    }

    // ---- payment-channel events ----

    async fn htlc_accepted(
        &mut self,
        r_hash: &str,
        units: u128,
        currency: &str,
    ) -> Result<(), SwapError> {
        let Some(deal) = self.deals.get(r_hash).cloned() else {
            return self.sanity_htlc_accepted(r_hash, units, currency).await;
        };

        let awaiting = match deal.role {
            SwapRole::Maker => SwapPhase::InvoiceExchange,
            SwapRole::Taker => SwapPhase::SendingPayment,
        };
        if deal.phase != awaiting {
            tracing::warn!(r_hash, phase = %deal.phase, "unexpected htlc for deal");
            return Err(SwapError::new(
                SwapFailureReason::InvalidResolveRequest,
                format!("deal {r_hash} is not awaiting payment"),
            ));
        }

        let (expected_units, expected_currency) = deal.incoming_leg();
        if units != expected_units || currency != expected_currency {
            let err = SwapError::new(
                SwapFailureReason::SendPaymentFailure,
                format!(
                    "invalid remote payment: expected {expected_units} {expected_currency}, got {units} {currency}"
                ),
            );
            tracing::error!(r_hash, error = %err, "rejecting htlc");
            self.fail_deal(r_hash, err.reason, &err.message, true)
                .await;
            return Err(err);
        }

        tracing::info!(r_hash, units = %units, currency, role = deal.role.as_str(), "htlc accepted");
        let mut deal = deal;
        let result = match deal.role {
            SwapRole::Maker => self.forward_payment(&mut deal).await,
            SwapRole::Taker => self.claim_payment(&mut deal).await,
        };
        if let Err(err) = &result {
            self.fail_deal(r_hash, err.reason, &err.message, true)
                .await;
        }
        result
    }

    /// Maker: the taker's payment is held, pay the taker leg under the same hash.
    async fn forward_payment(&mut self, deal: &mut SwapDeal) -> Result<(), SwapError> {
        let taker_client = self.client(deal.outgoing_currency())?;
        self.set_phase(deal, SwapPhase::SendingPayment)?;
        self.spawn_payment(
            taker_client,
            PaymentRequest {
                destination: deal.destination.clone().unwrap_or_default(),
                units: deal.taker_units,
                r_hash: deal.r_hash.clone(),
                cltv_delta: deal.taker_cltv_delta,
                max_time_lock: deal.taker_max_time_lock,
            },
        );
        Ok(())
    }

    /// Taker: the maker paid us, settle with our preimage.
    async fn claim_payment(&mut self, deal: &mut SwapDeal) -> Result<(), SwapError> {
        let preimage = deal.r_preimage.clone().ok_or_else(|| {
            SwapError::new(
                SwapFailureReason::InvalidResolveRequest,
                "taker deal has no preimage",
            )
        })?;
        let taker_client = self.client(&deal.taker_currency)?;
        self.set_phase(deal, SwapPhase::PaymentReceived)?;
        taker_client
            .resolve_pending_htlc(&deal.r_hash, &preimage)
            .await
            .map_err(|e| client_error("resolve incoming htlc", e))?;

        if self.payment_sent.remove(&deal.r_hash) {
            self.complete_deal(deal.clone()).await;
            self.send_swap_complete(deal).await;
        }
        Ok(())
    }

    async fn payment_sent(&mut self, r_hash: &str, result: Result<String, PaymentError>) {
        if self.probes.contains(r_hash) {
            self.sanity_payment_sent(r_hash, result).await;
            return;
        }
        let Some(mut deal) = self.deals.get(r_hash).cloned() else {
            match result {
                Ok(preimage) => self.settle_failed_deal(r_hash, preimage).await,
                Err(err) => tracing::debug!(r_hash, error = %err, "payment result for finished deal"),
            }
            return;
        };

        let preimage = match result {
            Ok(preimage) => preimage,
            Err(err) => {
                if matches!(
                    deal.phase,
                    SwapPhase::SendingPayment | SwapPhase::SwapTakerCompleted
                ) {
                    let reason = match err {
                        PaymentError::NoRoute(_) => SwapFailureReason::NoRouteFound,
                        PaymentError::Failed(_) => SwapFailureReason::SendPaymentFailure,
                    };
                    self.fail_deal(r_hash, reason, &err.to_string(), true)
                        .await;
                } else {
                    tracing::warn!(r_hash, phase = %deal.phase, error = %err, "late payment failure ignored");
                }
                return;
            }
        };

        match (deal.role, deal.phase) {
            (SwapRole::Taker, SwapPhase::SendingPayment) => {
                self.payment_sent.insert(r_hash.to_string());
            }
            (SwapRole::Taker, SwapPhase::PaymentReceived) => {
                self.complete_deal(deal.clone()).await;
                self.send_swap_complete(&deal).await;
            }
            (SwapRole::Maker, SwapPhase::SendingPayment | SwapPhase::SwapTakerCompleted) => {
                let result = self.settle_with_preimage(&mut deal, preimage).await;
                self.fail_on_err(r_hash, result).await;
            }
            (_, phase) => {
                tracing::debug!(r_hash, phase = %phase, "ignoring payment result");
            }
        }
    }

    /// Maker: our payment to the taker revealed the preimage, use it on the
    /// HTLC we are holding.
    async fn settle_with_preimage(
        &mut self,
        deal: &mut SwapDeal,
        preimage: String,
    ) -> Result<(), SwapError> {
        if payment_hash_hex(&preimage).as_deref() != Some(deal.r_hash.as_str()) {
            return Err(SwapError::new(
                SwapFailureReason::SendPaymentFailure,
                "payment returned a preimage that does not match the hash",
            ));
        }
        let taker_completed = deal.phase == SwapPhase::SwapTakerCompleted;
        let maker_client = self.client(&deal.maker_currency)?;

        deal.r_preimage = Some(preimage.clone());
        if let Some(active) = self.deals.get_mut(&deal.r_hash) {
            active.r_preimage = Some(preimage.clone());
        }
        maker_client
            .resolve_pending_htlc(&deal.r_hash, &preimage)
            .await
            .map_err(|e| client_error("resolve incoming htlc", e))?;
        self.set_phase(deal, SwapPhase::PaymentReceived)?;

        if taker_completed {
            self.complete_deal(deal.clone()).await;
            self.send_swap_complete(deal).await;
        }
        Ok(())
    }

    /// Our payment settled after the deal had already failed here. The
    /// preimage it revealed still claims the HTLC we are holding.
    async fn settle_failed_deal(&mut self, r_hash: &str, preimage: String) {
        let mut deal = match self.repo.get(r_hash) {
            Ok(Some(deal)) if deal.role == SwapRole::Maker && deal.state == SwapState::Error => deal,
            Ok(_) => {
                tracing::debug!(r_hash, "payment result for finished deal");
                return;
            }
            Err(e) => {
                tracing::warn!(r_hash, error = %format!("{e:#}"), "load deal failed");
                return;
            }
        };
        if payment_hash_hex(&preimage).as_deref() != Some(r_hash) {
            tracing::error!(r_hash, "late payment returned a preimage that does not match the hash");
            return;
        }
        let Some(client) = self.clients.get(&deal.maker_currency) else {
            tracing::error!(r_hash, currency = %deal.maker_currency, "no client to settle late payment");
            return;
        };
        if let Err(e) = client.resolve_pending_htlc(r_hash, &preimage).await {
            tracing::error!(r_hash, error = %format!("{e:#}"), "settle htlc of failed deal");
            return;
        }

        tracing::warn!(r_hash, reason = ?deal.failure_reason, "settled incoming htlc of failed deal");
        deal.r_preimage = Some(preimage);
        if let Err(e) = self.repo.save(&deal) {
            tracing::error!(r_hash, error = %format!("{e:#}"), "persist late preimage");
        }
    }

    // ---- terminal transitions ----

    async fn complete_deal(&mut self, mut deal: SwapDeal) {
        let r_hash = deal.r_hash.clone();
        if let Err(err) = self.set_phase(&mut deal, SwapPhase::SwapCompleted) {
            tracing::error!(r_hash = %r_hash, error = %err, "completed deal not persisted");
            self.deals.remove(&r_hash);
        }
        self.timers.clear(&r_hash);
        self.payment_sent.remove(&r_hash);

        if let Some(hold) = self.holds.remove(&r_hash)
            && let Err(e) = self
                .orderbook
                .complete_order(&hold.pair_id, &hold.order_id, hold.quantity)
                .await
        {
            tracing::warn!(r_hash = %r_hash, error = %format!("{e:#}"), "complete order failed");
        }

        let Some(success) = deal.success() else {
            return;
        };
        tracing::info!(
            r_hash = %r_hash,
            role = deal.role.as_str(),
            received = %format!("{} {}", success.units_received, success.currency_received),
            sent = %format!("{} {}", success.units_sent, success.currency_sent),
            "swap completed"
        );
        if let Some(reply) = self.pending.remove(&r_hash) {
            let _ = reply.send(Ok(success.clone()));
        }
        let _ = self.events.send(SwapEvent::Paid(success));
    }

    async fn send_swap_complete(&mut self, deal: &SwapDeal) {
        let packet = SwapPacket::SwapComplete(SwapCompleteBody {
            r_hash: deal.r_hash.clone(),
        });
        if let Err(e) = self.send_packet(&deal.peer_pub_key, &packet).await {
            tracing::warn!(r_hash = %deal.r_hash, error = %format!("{e:#}"), "send swap complete failed");
        }
    }

    async fn fail_on_err(&mut self, r_hash: &str, result: Result<(), SwapError>) {
        if let Err(err) = result {
            self.fail_deal(r_hash, err.reason, &err.message, true).await;
        }
    }

    /// Moves an active deal to `Error`. The hold is released and the peer is
    /// told independently; neither depends on the other succeeding.
    async fn fail_deal(
        &mut self,
        r_hash: &str,
        reason: SwapFailureReason,
        message: &str,
        notify_peer: bool,
    ) {
        let Some(mut deal) = self.deals.remove(r_hash) else {
            tracing::debug!(r_hash, reason = %reason, "fail for inactive deal");
            return;
        };
        self.timers.clear(r_hash);
        self.payment_sent.remove(r_hash);

        deal.state = SwapState::Error;
        deal.failure_reason = Some(reason);
        deal.error_message = (!message.is_empty()).then(|| message.to_string());
        deal.complete_time = Some(now_millis().max(deal.create_time));
        tracing::warn!(
            r_hash,
            role = deal.role.as_str(),
            phase = %deal.phase,
            reason = %reason,
            message,
            "deal failed"
        );
        if let Err(e) = self.repo.save(&deal) {
            tracing::error!(r_hash, error = %format!("{e:#}"), "persist failed deal");
        }

        if let Some(hold) = self.holds.remove(r_hash)
            && let Err(e) = self.orderbook.release_hold(hold).await
        {
            tracing::warn!(r_hash, error = %format!("{e:#}"), "release hold failed");
        }

        if deal.has_open_invoice()
            && let Some(client) = self.clients.get(deal.incoming_leg().1)
            && let Err(e) = client.remove_invoice(r_hash).await
        {
            tracing::warn!(r_hash, error = %format!("{e:#}"), "remove invoice failed");
        }

        if notify_peer {
            let packet = SwapPacket::failed(r_hash, reason, message);
            if let Err(e) = self.send_packet(&deal.peer_pub_key, &packet).await {
                tracing::warn!(r_hash, error = %format!("{e:#}"), "send swap failed");
            }
        }

        if let Some(reply) = self.pending.remove(r_hash) {
            let _ = reply.send(Err(SwapError::new(reason, message)));
        }
        let _ = self.events.send(SwapEvent::Failed(deal));
    }

    /// A failure report for a deal that already failed here is recorded on
    /// the stored deal.
    fn append_failure_message(&mut self, peer: &str, r_hash: &str, message: &str) {
        let stored = match self.repo.get(r_hash) {
            Ok(Some(deal)) => deal,
            Ok(None) => {
                tracing::debug!(peer, r_hash, "swap failed for unknown deal");
                return;
            }
            Err(e) => {
                tracing::warn!(r_hash, error = %format!("{e:#}"), "load deal failed");
                return;
            }
        };
        if stored.state != SwapState::Error || stored.peer_pub_key != peer {
            tracing::debug!(peer, r_hash, "ignoring swap failed for settled deal");
            return;
        }
        let mut deal = stored;
        deal.error_message = Some(match deal.error_message.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}; {message}"),
            _ => message.to_string(),
        });
        if let Err(e) = self.repo.save(&deal) {
            tracing::warn!(r_hash, error = %format!("{e:#}"), "persist failure message");
        }
    }

    // ---- timers ----

    async fn fire_timers(&mut self) {
        for FiredTimer { r_hash, action } in self.timers.pop_expired(Instant::now()) {
            match action {
                TimerAction::FailDeal { awaited, reason } => {
                    let due = self
                        .deals
                        .get(&r_hash)
                        .is_some_and(|d| d.phase == awaited);
                    if due {
                        tracing::warn!(r_hash = %r_hash, phase = %awaited, "deal timed out");
                        self.fail_deal(
                            &r_hash,
                            reason,
                            &format!("timed out waiting in {awaited}"),
                            true,
                        )
                        .await;
                    }
                }
                TimerAction::CompleteDeal { awaited } => {
                    let Some(deal) = self.deals.get(&r_hash).cloned() else {
                        continue;
                    };
                    if deal.phase == awaited {
                        tracing::info!(
                            r_hash = %r_hash,
                            "completion signal never arrived, completing deal"
                        );
                        self.complete_deal(deal).await;
                    }
                }
                TimerAction::ExpireProbe => self.expire_probe(&r_hash).await,
            }
        }
    }

    /// The one timer a deal in its current phase waits on.
    fn phase_timer(&self, deal: &SwapDeal) -> Option<(Duration, TimerAction)> {
        let t = &self.config.timeouts;
        let fail = |after: Duration, reason| {
            Some((
                after,
                TimerAction::FailDeal {
                    awaited: deal.phase,
                    reason,
                },
            ))
        };
        match (deal.role, deal.phase) {
            (_, SwapPhase::SwapCreated | SwapPhase::SwapRequested) => {
                fail(t.accept, SwapFailureReason::DealTimedOut)
            }
            (_, SwapPhase::SwapAccepted) | (SwapRole::Taker, SwapPhase::InvoiceExchange) => {
                fail(t.invoice_exchange, SwapFailureReason::SwapTimedOut)
            }
            // Our payment to the taker is in flight; only its outcome ends the deal.
            (SwapRole::Maker, SwapPhase::SendingPayment | SwapPhase::SwapTakerCompleted) => None,
            (SwapRole::Maker, SwapPhase::InvoiceExchange)
            | (_, SwapPhase::SendingPayment | SwapPhase::SwapTakerCompleted) => {
                fail(t.payment_receive, SwapFailureReason::SwapTimedOut)
            }
            (_, SwapPhase::PaymentReceived) => Some((
                t.completed,
                TimerAction::CompleteDeal {
                    awaited: SwapPhase::PaymentReceived,
                },
            )),
            (_, SwapPhase::SwapCompleted) => None,
        }
    }

    fn arm_phase_timer(&mut self, deal: &SwapDeal) {
        match self.phase_timer(deal) {
            Some((after, action)) if deal.is_active() => {
                self.timers.arm(&deal.r_hash, after, action)
            }
            _ => self.timers.clear(&deal.r_hash),
        }
    }

    // ---- helpers ----

    /// Persists the transition, then re-arms the deal's timer for the new phase.
    fn set_phase(&mut self, deal: &mut SwapDeal, phase: SwapPhase) -> Result<(), SwapError> {
        let from = deal.phase;
        deal.phase = phase;
        match phase {
            SwapPhase::SendingPayment => {
                deal.execute_time = Some(now_millis().max(deal.create_time));
            }
            SwapPhase::SwapCompleted => {
                deal.state = SwapState::Completed;
                let floor = deal.execute_time.unwrap_or(deal.create_time);
                deal.complete_time = Some(now_millis().max(floor));
            }
            _ => {}
        }
        tracing::info!(
            r_hash = %deal.r_hash,
            role = deal.role.as_str(),
            from = %from,
            to = %phase,
            "deal phase changed"
        );
        self.persist(deal)?;
        self.arm_phase_timer(deal);
        Ok(())
    }

    fn persist(&mut self, deal: &SwapDeal) -> Result<(), SwapError> {
        self.repo.save(deal).map_err(|e| {
            tracing::error!(r_hash = %deal.r_hash, error = %format!("{e:#}"), "persist deal failed");
            SwapError::new(
                SwapFailureReason::UnknownError,
                format!("persist deal: {e:#}"),
            )
        })?;
        if deal.is_active() {
            self.deals.insert(deal.r_hash.clone(), deal.clone());
        } else {
            self.deals.remove(&deal.r_hash);
        }
        Ok(())
    }

    fn is_used_hash(&self, r_hash: &str) -> Result<bool, SwapError> {
        if self.used_hashes.contains(r_hash) || self.probes.contains(r_hash) {
            return Ok(true);
        }
        self.repo.contains(r_hash).map_err(|e| {
            SwapError::new(
                SwapFailureReason::UnknownError,
                format!("lookup payment hash: {e:#}"),
            )
        })
    }

    fn client(&self, currency: &str) -> Result<Arc<dyn PaymentClient>, SwapError> {
        self.clients.get(currency).ok_or_else(|| {
            SwapError::new(
                SwapFailureReason::SwapClientNotSetup,
                format!("no connected payment client for {currency}"),
            )
        })
    }

    async fn send_packet(&mut self, peer: &str, packet: &SwapPacket) -> Result<()> {
        tracing::debug!(peer, kind = packet.kind(), r_hash = packet.r_hash(), "sending packet");
        self.peers
            .send(peer, packet.to_envelope())
            .await
            .with_context(|| format!("send {} to {peer}", packet.kind()))
    }

    /// Payments settle only once the far side reveals the preimage, so they
    /// run off the worker and report back as `PaymentSent`.
    fn spawn_payment(&self, client: Arc<dyn PaymentClient>, request: PaymentRequest) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let r_hash = request.r_hash.clone();
            let result = client.send_payment(request).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::PaymentSent { r_hash, result });
            }
        });
    }

    // ---- sanity swaps ----

    async fn begin_sanity_swap(
        &mut self,
        peer: &str,
        currency: &str,
        peer_destination: &str,
        reply: Reply<String>,
    ) {
        if peer == self.config.node_pub_key {
            let _ = reply.send(Err(SwapError::new(
                SwapFailureReason::SwapToYourself,
                "sanity swap with ourselves",
            )));
            return;
        }
        let (preimage, r_hash) = preimage::generate(self.preimages.as_mut());
        let prepared = self.prepare_probe(currency, &r_hash).await;
        let client = match prepared {
            Ok(client) => client,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };

        tracing::info!(peer, currency, r_hash = %r_hash, "starting sanity swap");
        self.probes.insert(
            &r_hash,
            Probe::new(
                ProbeRole::Initiator,
                peer,
                currency,
                peer_destination,
                Some(preimage),
                reply,
            ),
        );
        self.timers.arm(
            &r_hash,
            self.config.timeouts.sanity_complete,
            TimerAction::ExpireProbe,
        );
        let cltv_delta = client.final_lock();
        self.spawn_payment(
            client,
            PaymentRequest {
                destination: peer_destination.to_string(),
                units: SANITY_UNITS,
                r_hash,
                cltv_delta,
                max_time_lock: None,
            },
        );
    }

    async fn expect_sanity_swap(
        &mut self,
        peer: &str,
        currency: &str,
        r_hash: &str,
        peer_destination: &str,
        reply: Reply<String>,
    ) {
        if r_hash.len() != 64 || hex::decode(r_hash).is_err() {
            let _ = reply.send(Err(SwapError::new(
                SwapFailureReason::InvalidSwapRequest,
                format!("invalid payment hash {r_hash}"),
            )));
            return;
        }
        if let Err(err) = self.prepare_probe(currency, r_hash).await {
            let _ = reply.send(Err(err));
            return;
        }

        tracing::info!(peer, currency, r_hash, "expecting sanity swap");
        self.probes.insert(
            r_hash,
            Probe::new(
                ProbeRole::Responder,
                peer,
                currency,
                peer_destination,
                None,
                reply,
            ),
        );
        self.timers.arm(
            r_hash,
            self.config.timeouts.sanity_init,
            TimerAction::ExpireProbe,
        );
    }

    /// Reserves `r_hash` for a probe and adds the one-unit hodl invoice.
    async fn prepare_probe(
        &mut self,
        currency: &str,
        r_hash: &str,
    ) -> Result<Arc<dyn PaymentClient>, SwapError> {
        let client = self.client(currency)?;
        if self.is_used_hash(r_hash)? {
            return Err(SwapError::new(
                SwapFailureReason::PaymentHashReuse,
                format!("payment hash {r_hash} already used"),
            ));
        }
        client
            .add_hodl_invoice(r_hash, SANITY_UNITS, client.final_lock())
            .await
            .map_err(|e| client_error("add sanity invoice", e))?;
        self.used_hashes.insert(r_hash.to_string());
        Ok(client)
    }

    async fn sanity_htlc_accepted(
        &mut self,
        r_hash: &str,
        units: u128,
        currency: &str,
    ) -> Result<(), SwapError> {
        let invalid = |msg: String| SwapError::new(SwapFailureReason::InvalidResolveRequest, msg);
        if units != SANITY_UNITS {
            return Err(invalid(format!("no deal for payment hash {r_hash}")));
        }
        let Some(probe) = self.probes.get(r_hash) else {
            return Err(invalid(format!("no sanity swap expected for {r_hash}")));
        };
        if probe.currency != currency || probe.htlc_received {
            return Err(invalid(format!("unexpected sanity htlc for {r_hash}")));
        }
        let role = probe.role;
        let preimage = probe.preimage.clone();
        let peer_destination = probe.peer_destination.clone();
        let client = self.client(currency)?;
        if let Some(probe) = self.probes.get_mut(r_hash) {
            probe.htlc_received = true;
        }

        match role {
            ProbeRole::Responder => {
                tracing::debug!(r_hash, "sanity htlc received, paying back");
                self.timers.arm(
                    r_hash,
                    self.config.timeouts.sanity_complete,
                    TimerAction::ExpireProbe,
                );
                let cltv_delta = client.final_lock();
                self.spawn_payment(
                    client,
                    PaymentRequest {
                        destination: peer_destination,
                        units: SANITY_UNITS,
                        r_hash: r_hash.to_string(),
                        cltv_delta,
                        max_time_lock: None,
                    },
                );
                Ok(())
            }
            ProbeRole::Initiator => {
                let preimage = preimage.unwrap_or_default();
                if let Err(e) = client.resolve_pending_htlc(r_hash, &preimage).await {
                    let err = client_error("resolve sanity htlc", e);
                    self.timers.clear(r_hash);
                    self.probes.finish(r_hash, Err(err.clone()));
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    async fn sanity_payment_sent(&mut self, r_hash: &str, result: Result<String, PaymentError>) {
        let Some(probe) = self.probes.get(r_hash) else {
            return;
        };
        let role = probe.role;
        let peer = probe.peer_pub_key.clone();
        let currency = probe.currency.clone();

        let outcome = match (role, result) {
            (_, Err(err)) => Err(SwapError::new(
                match err {
                    PaymentError::NoRoute(_) => SwapFailureReason::NoRouteFound,
                    PaymentError::Failed(_) => SwapFailureReason::SendPaymentFailure,
                },
                err.to_string(),
            )),
            (ProbeRole::Initiator, Ok(_)) => Ok(()),
            (ProbeRole::Responder, Ok(preimage)) => {
                if payment_hash_hex(&preimage).as_deref() != Some(r_hash) {
                    Err(SwapError::new(
                        SwapFailureReason::SendPaymentFailure,
                        "sanity payment returned a wrong preimage",
                    ))
                } else {
                    match self.client(&currency) {
                        Ok(client) => client
                            .resolve_pending_htlc(r_hash, &preimage)
                            .await
                            .map_err(|e| client_error("resolve sanity htlc", e)),
                        Err(err) => Err(err),
                    }
                }
            }
        };

        self.timers.clear(r_hash);
        match &outcome {
            Ok(()) => tracing::info!(r_hash, peer = %peer, currency = %currency, "sanity swap succeeded"),
            Err(err) => tracing::warn!(r_hash, peer = %peer, error = %err, "sanity swap failed"),
        }
        self.probes.finish(r_hash, outcome);
    }

    async fn expire_probe(&mut self, r_hash: &str) {
        let Some((peer, currency)) = self
            .probes
            .get(r_hash)
            .map(|p| (p.peer_pub_key.clone(), p.currency.clone()))
        else {
            return;
        };
        tracing::warn!(r_hash, peer = %peer, currency = %currency, "sanity swap timed out");
        if let Some(client) = self.clients.get(&currency)
            && let Err(e) = client.remove_invoice(r_hash).await
        {
            tracing::warn!(r_hash, error = %format!("{e:#}"), "remove sanity invoice failed");
        }
        self.probes.finish(
            r_hash,
            Err(SwapError::new(
                SwapFailureReason::SwapTimedOut,
                "sanity swap timed out",
            )),
        );
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn client_error(what: &str, err: anyhow::Error) -> SwapError {
    SwapError::new(
        SwapFailureReason::UnexpectedClientError,
        format!("{what}: {err:#}"),
    )
}

fn remote_error(what: &str, err: anyhow::Error) -> SwapError {
    SwapError::new(SwapFailureReason::RemoteError, format!("{what}: {err:#}"))
}

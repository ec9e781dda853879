use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::clients::{OrderBook, PaymentClients, PaymentError, PeerTransport};
use super::manager::{Command, SwapManager};
use super::packets::SwapPacket;
use super::preimage::PreimageSource;
use super::store::DealRepository;
use super::timeouts::SwapTimeouts;
use super::{OwnOrder, PeerOrder, SwapDeal, SwapError, SwapEvent, SwapFailureReason, SwapSuccess};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapServiceConfig {
    /// Our identity on the peer network.
    pub node_pub_key: String,
    pub timeouts: SwapTimeouts,
}

pub struct SwapCollaborators {
    pub clients: PaymentClients,
    pub peers: Arc<dyn PeerTransport>,
    pub orderbook: Arc<dyn OrderBook>,
    pub repository: Box<dyn DealRepository>,
    pub preimages: Box<dyn PreimageSource>,
}

/// Handle to a running swap worker. Cheap to clone; every call is queued and
/// handled in arrival order.
#[derive(Clone)]
pub struct SwapService {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SwapEvent>,
}

impl SwapService {
    /// Loads persisted deals, then starts the worker. The worker stops once
    /// every handle is dropped.
    pub fn spawn(
        config: SwapServiceConfig,
        parts: SwapCollaborators,
    ) -> Result<(Self, JoinHandle<()>)> {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let manager = SwapManager::new(config, parts, events.clone(), commands.downgrade())?;
        let handle = tokio::spawn(manager.run(rx));

        Ok((Self { commands, events }, handle))
    }

    /// Starts a swap as taker against `maker` and resolves once it settles or fails.
    pub async fn execute_swap(
        &self,
        maker: PeerOrder,
        taker: OwnOrder,
    ) -> Result<SwapSuccess, SwapError> {
        self.call(|reply| Command::ExecuteSwap {
            maker,
            taker,
            reply,
        })
        .await?
    }

    /// Entry point for envelopes from the peer transport.
    pub fn envelope_received(&self, peer: &str, envelope: &[u8]) -> Result<(), SwapError> {
        let packet = SwapPacket::decode(envelope)?;
        self.commands
            .send(Command::Packet {
                peer: peer.to_string(),
                packet,
            })
            .map_err(|_| stopped())
    }

    /// Called by a payment client when an HTLC for `r_hash` arrives and is held.
    pub async fn htlc_accepted(
        &self,
        r_hash: &str,
        units: u128,
        currency: &str,
    ) -> Result<(), SwapError> {
        self.call(|reply| Command::HtlcAccepted {
            r_hash: r_hash.to_string(),
            units,
            currency: currency.to_string(),
            reply,
        })
        .await?
    }

    /// Reports the outcome of a payment we sent under `r_hash`: the revealed
    /// preimage, or why it failed. Payment clients call this for payments
    /// still in flight after a restart; repeated reports are ignored.
    pub fn payment_sent(
        &self,
        r_hash: &str,
        result: Result<String, PaymentError>,
    ) -> Result<(), SwapError> {
        self.commands
            .send(Command::PaymentSent {
                r_hash: r_hash.to_string(),
                result,
            })
            .map_err(|_| stopped())
    }

    /// Runs a one-unit probe to `peer` on `currency`. Returns the probe's hash.
    pub async fn begin_sanity_swap(
        &self,
        peer: &str,
        currency: &str,
        peer_destination: &str,
    ) -> Result<String, SwapError> {
        self.call(|reply| Command::BeginSanitySwap {
            peer: peer.to_string(),
            currency: currency.to_string(),
            peer_destination: peer_destination.to_string(),
            reply,
        })
        .await?
    }

    /// Accepts an announced probe from `peer` and waits for it to finish.
    pub async fn expect_sanity_swap(
        &self,
        peer: &str,
        currency: &str,
        r_hash: &str,
        peer_destination: &str,
    ) -> Result<String, SwapError> {
        self.call(|reply| Command::ExpectSanitySwap {
            peer: peer.to_string(),
            currency: currency.to_string(),
            r_hash: r_hash.to_string(),
            peer_destination: peer_destination.to_string(),
            reply,
        })
        .await?
    }

    pub async fn deal(&self, r_hash: &str) -> Result<Option<SwapDeal>, SwapError> {
        self.call(|reply| Command::GetDeal {
            r_hash: r_hash.to_string(),
            reply,
        })
        .await
    }

    pub async fn active_deals(&self) -> Result<Vec<SwapDeal>, SwapError> {
        self.call(|reply| Command::ActiveDeals { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapEvent> {
        self.events.subscribe()
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SwapError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}

fn stopped() -> SwapError {
    SwapError::new(SwapFailureReason::UnknownError, "swap worker stopped")
}

pub mod amounts;
pub mod clients;
pub mod failure;
mod manager;
pub mod packets;
pub mod preimage;
pub mod sanity;
pub mod service;
pub mod store;
pub mod timeouts;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use failure::{SwapError, SwapFailureReason};
pub use service::{SwapCollaborators, SwapService, SwapServiceConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapRole {
    Taker,
    Maker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Active,
    Error,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapPhase {
    SwapCreated,
    SwapRequested,
    SwapAccepted,
    InvoiceExchange,
    SendingPayment,
    PaymentReceived,
    /// Maker only: the taker told us it has finished its part. Lets the maker
    /// tell "taker received payment" apart from "taker has fully committed".
    SwapTakerCompleted,
    SwapCompleted,
}

impl SwapRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Taker => "taker",
            Self::Maker => "maker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "taker" => Some(Self::Taker),
            "maker" => Some(Self::Maker),
            _ => None,
        }
    }
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Limit => "limit",
            Self::Market => "market",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "limit" => Some(Self::Limit),
            "market" => Some(Self::Market),
            _ => None,
        }
    }
}

impl SwapState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl SwapPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SwapCreated => "swap_created",
            Self::SwapRequested => "swap_requested",
            Self::SwapAccepted => "swap_accepted",
            Self::InvoiceExchange => "invoice_exchange",
            Self::SendingPayment => "sending_payment",
            Self::PaymentReceived => "payment_received",
            Self::SwapTakerCompleted => "swap_taker_completed",
            Self::SwapCompleted => "swap_completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "swap_created" => Some(Self::SwapCreated),
            "swap_requested" => Some(Self::SwapRequested),
            "swap_accepted" => Some(Self::SwapAccepted),
            "invoice_exchange" => Some(Self::InvoiceExchange),
            "sending_payment" => Some(Self::SendingPayment),
            "payment_received" => Some(Self::PaymentReceived),
            "swap_taker_completed" => Some(Self::SwapTakerCompleted),
            "swap_completed" => Some(Self::SwapCompleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for SwapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote order resting in the book that we are taking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerOrder {
    pub id: String,
    pub pair_id: String,
    /// Price in quote currency, 10^-8 units.
    pub price: i64,
    /// Quantity in base currency, 10^-8 units.
    pub quantity: i64,
    pub is_buy: bool,
    pub order_type: OrderType,
    pub peer_pub_key: String,
}

/// One of our own orders, as seen by the order-matching service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnOrder {
    pub id: String,
    pub local_id: String,
    pub pair_id: String,
    pub price: i64,
    pub quantity: i64,
    /// Quantity already reserved by in-flight swaps.
    pub hold: i64,
    pub is_buy: bool,
    pub order_type: OrderType,
}

impl OwnOrder {
    pub fn available_quantity(&self) -> i64 {
        self.quantity.saturating_sub(self.hold)
    }
}

/// The record of one attempted swap, keyed by `r_hash`.
///
/// `taker_*` fields describe the leg the taker receives (paid by the maker),
/// `maker_*` fields the leg the maker receives (paid by the taker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapDeal {
    pub role: SwapRole,
    pub phase: SwapPhase,
    pub state: SwapState,
    pub error_message: Option<String>,
    pub failure_reason: Option<SwapFailureReason>,

    pub peer_pub_key: String,
    pub order_id: String,
    pub local_id: String,
    pub pair_id: String,
    pub order_type: OrderType,
    pub is_buy: bool,
    pub proposed_quantity: i64,
    pub quantity: Option<i64>,
    pub price: i64,

    pub taker_amount: i64,
    pub taker_units: u128,
    pub taker_currency: String,
    pub taker_pub_key: Option<String>,
    pub taker_cltv_delta: u32,

    pub maker_amount: i64,
    pub maker_units: u128,
    pub maker_currency: String,
    pub maker_pub_key: Option<String>,
    pub maker_cltv_delta: Option<u32>,

    pub r_hash: String,
    pub r_preimage: Option<String>,
    pub payment_request: Option<String>,

    pub taker_max_time_lock: Option<u32>,
    pub destination: Option<String>,

    pub create_time: i64,
    pub execute_time: Option<i64>,
    pub complete_time: Option<i64>,
}

impl SwapDeal {
    pub fn is_active(&self) -> bool {
        self.state == SwapState::Active
    }

    /// Units and currency we expect to arrive as an incoming HTLC.
    pub fn incoming_leg(&self) -> (u128, &str) {
        match self.role {
            SwapRole::Maker => (self.maker_units, &self.maker_currency),
            SwapRole::Taker => (self.taker_units, &self.taker_currency),
        }
    }

    /// Our hodl invoice exists and no payment towards it has started, so it
    /// can still be withdrawn.
    pub fn has_open_invoice(&self) -> bool {
        matches!(
            (self.role, self.phase),
            (SwapRole::Maker, SwapPhase::SwapAccepted | SwapPhase::InvoiceExchange)
                | (SwapRole::Taker, SwapPhase::InvoiceExchange)
        )
    }

    /// Funds are committed on both legs: as maker our payment to the taker
    /// is out, or either side has already claimed its incoming HTLC. Only
    /// the payment outcome may end such a deal.
    pub fn awaits_payment_outcome(&self) -> bool {
        matches!(
            (self.role, self.phase),
            (
                SwapRole::Maker,
                SwapPhase::SendingPayment | SwapPhase::SwapTakerCompleted | SwapPhase::PaymentReceived
            ) | (SwapRole::Taker, SwapPhase::PaymentReceived)
        )
    }

    /// Currency of the payment we send.
    pub fn outgoing_currency(&self) -> &str {
        match self.role {
            SwapRole::Maker => &self.taker_currency,
            SwapRole::Taker => &self.maker_currency,
        }
    }

    /// Settlement summary, available once the deal has completed.
    pub fn success(&self) -> Option<SwapSuccess> {
        if self.state != SwapState::Completed {
            return None;
        }
        let was_maker = self.role == SwapRole::Maker;
        Some(SwapSuccess {
            order_id: self.order_id.clone(),
            local_id: self.local_id.clone(),
            pair_id: self.pair_id.clone(),
            r_hash: self.r_hash.clone(),
            r_preimage: self.r_preimage.clone().unwrap_or_default(),
            peer_pub_key: self.peer_pub_key.clone(),
            price: self.price,
            role: self.role,
            order_type: self.order_type,
            quantity: self.quantity.unwrap_or(self.proposed_quantity),
            amount_received: if was_maker { self.maker_amount } else { self.taker_amount },
            amount_sent: if was_maker { self.taker_amount } else { self.maker_amount },
            units_received: if was_maker { self.maker_units } else { self.taker_units },
            units_sent: if was_maker { self.taker_units } else { self.maker_units },
            currency_received: if was_maker {
                self.maker_currency.clone()
            } else {
                self.taker_currency.clone()
            },
            currency_sent: if was_maker {
                self.taker_currency.clone()
            } else {
                self.maker_currency.clone()
            },
        })
    }
}

/// The result of a successful swap, from our point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapSuccess {
    pub order_id: String,
    pub local_id: String,
    pub pair_id: String,
    pub r_hash: String,
    pub r_preimage: String,
    pub peer_pub_key: String,
    pub price: i64,
    pub role: SwapRole,
    pub order_type: OrderType,
    pub quantity: i64,
    /// Display units (10^-8).
    pub amount_received: i64,
    pub amount_sent: i64,
    /// Smallest base units of the respective currency.
    pub units_received: u128,
    pub units_sent: u128,
    pub currency_received: String,
    pub currency_sent: String,
}

/// Broadcast to subscribers when a deal reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub enum SwapEvent {
    Paid(SwapSuccess),
    Failed(SwapDeal),
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

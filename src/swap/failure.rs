use serde::{Deserialize, Serialize};

/// Every reason a swap can fail. The numeric code (declaration order) is what
/// travels in `SwapFailed` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapFailureReason {
    /// Could not find the order specified by a swap request.
    OrderNotFound,
    /// The order is on hold for a different ongoing swap.
    OrderOnHold,
    /// The swap request contained invalid data.
    InvalidSwapRequest,
    /// No connected payment client for one of the pair's currencies.
    SwapClientNotSetup,
    /// Could not find a route to complete the swap.
    NoRouteFound,
    /// A payment client call failed for an unexpected reason.
    UnexpectedClientError,
    /// Received a packet from the peer with invalid data.
    InvalidSwapPacketReceived,
    /// The call to send payment failed.
    SendPaymentFailure,
    /// The resolve request for an incoming HTLC was invalid.
    InvalidResolveRequest,
    /// The swap attempts to reuse a payment hash.
    PaymentHashReuse,
    /// Timed out waiting for the swap to complete execution.
    SwapTimedOut,
    /// Timed out waiting for the peer to respond to our swap request.
    DealTimedOut,
    UnknownError,
    /// Error or unexpected behavior on behalf of the remote peer.
    RemoteError,
    /// Tried to execute a swap against our own order.
    SwapToYourself,
}

impl SwapFailureReason {
    pub const ALL: [SwapFailureReason; 15] = [
        Self::OrderNotFound,
        Self::OrderOnHold,
        Self::InvalidSwapRequest,
        Self::SwapClientNotSetup,
        Self::NoRouteFound,
        Self::UnexpectedClientError,
        Self::InvalidSwapPacketReceived,
        Self::SendPaymentFailure,
        Self::InvalidResolveRequest,
        Self::PaymentHashReuse,
        Self::SwapTimedOut,
        Self::DealTimedOut,
        Self::UnknownError,
        Self::RemoteError,
        Self::SwapToYourself,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OrderNotFound => "order_not_found",
            Self::OrderOnHold => "order_on_hold",
            Self::InvalidSwapRequest => "invalid_swap_request",
            Self::SwapClientNotSetup => "swap_client_not_setup",
            Self::NoRouteFound => "no_route_found",
            Self::UnexpectedClientError => "unexpected_client_error",
            Self::InvalidSwapPacketReceived => "invalid_swap_packet_received",
            Self::SendPaymentFailure => "send_payment_failure",
            Self::InvalidResolveRequest => "invalid_resolve_request",
            Self::PaymentHashReuse => "payment_hash_reuse",
            Self::SwapTimedOut => "swap_timed_out",
            Self::DealTimedOut => "deal_timed_out",
            Self::UnknownError => "unknown_error",
            Self::RemoteError => "remote_error",
            Self::SwapToYourself => "swap_to_yourself",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }

    /// Reasons a maker reports when it turns down a swap request outright.
    /// A taker still waiting for acceptance adopts these instead of
    /// `RemoteError`.
    pub fn is_request_rejection(self) -> bool {
        matches!(
            self,
            Self::OrderNotFound
                | Self::OrderOnHold
                | Self::InvalidSwapRequest
                | Self::SwapClientNotSetup
                | Self::NoRouteFound
                | Self::PaymentHashReuse
                | Self::SwapToYourself
        )
    }
}

impl std::fmt::Display for SwapFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only error the engine's public API returns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("swap failed ({reason}): {message}")]
pub struct SwapError {
    pub reason: SwapFailureReason,
    /// Diagnostic text, never matched on.
    pub message: String,
}

impl SwapError {
    pub fn new(reason: SwapFailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

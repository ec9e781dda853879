//! Wire framing for swap packets: a protobuf envelope whose oneof field number
//! is the body discriminant.

use prost::Message as _;

use crate::swap::{SwapError, SwapFailureReason};

#[derive(Clone, PartialEq, prost::Message)]
pub struct SwapRequestBody {
    #[prost(string, tag = "1")]
    pub r_hash: String,
    #[prost(string, tag = "2")]
    pub order_id: String,
    #[prost(string, tag = "3")]
    pub pair_id: String,
    #[prost(int64, tag = "4")]
    pub proposed_quantity: i64,
    #[prost(uint32, tag = "5")]
    pub taker_cltv_delta: u32,
    #[prost(string, tag = "6")]
    pub taker_destination: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SwapAcceptedBody {
    #[prost(string, tag = "1")]
    pub r_hash: String,
    #[prost(int64, tag = "2")]
    pub quantity: i64,
    #[prost(uint32, tag = "3")]
    pub maker_cltv_delta: u32,
    #[prost(string, tag = "4")]
    pub maker_destination: String,
    #[prost(string, tag = "5")]
    pub maker_payment_request: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SwapFailedBody {
    #[prost(string, tag = "1")]
    pub r_hash: String,
    #[prost(uint32, tag = "2")]
    pub failure_reason: u32,
    #[prost(string, tag = "3")]
    pub error_message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SwapCompleteBody {
    #[prost(string, tag = "1")]
    pub r_hash: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InvoiceExchangeBody {
    #[prost(string, tag = "1")]
    pub r_hash: String,
    #[prost(string, tag = "2")]
    pub taker_payment_request: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InvoiceExchangeAckBody {
    #[prost(string, tag = "1")]
    pub r_hash: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(oneof = "SwapPacket", tags = "1, 2, 3, 4, 5, 6")]
    pub body: Option<SwapPacket>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum SwapPacket {
    #[prost(message, tag = "1")]
    SwapRequest(SwapRequestBody),
    #[prost(message, tag = "2")]
    SwapAccepted(SwapAcceptedBody),
    #[prost(message, tag = "3")]
    SwapFailed(SwapFailedBody),
    #[prost(message, tag = "4")]
    SwapComplete(SwapCompleteBody),
    #[prost(message, tag = "5")]
    InvoiceExchange(InvoiceExchangeBody),
    #[prost(message, tag = "6")]
    InvoiceExchangeAck(InvoiceExchangeAckBody),
}

impl SwapPacket {
    pub fn r_hash(&self) -> &str {
        match self {
            Self::SwapRequest(b) => &b.r_hash,
            Self::SwapAccepted(b) => &b.r_hash,
            Self::SwapFailed(b) => &b.r_hash,
            Self::SwapComplete(b) => &b.r_hash,
            Self::InvoiceExchange(b) => &b.r_hash,
            Self::InvoiceExchangeAck(b) => &b.r_hash,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SwapRequest(_) => "swap_request",
            Self::SwapAccepted(_) => "swap_accepted",
            Self::SwapFailed(_) => "swap_failed",
            Self::SwapComplete(_) => "swap_complete",
            Self::InvoiceExchange(_) => "invoice_exchange",
            Self::InvoiceExchangeAck(_) => "invoice_exchange_ack",
        }
    }

    pub fn to_envelope(&self) -> Vec<u8> {
        Envelope {
            body: Some(self.clone()),
        }
        .encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SwapError> {
        let envelope = Envelope::decode(bytes).map_err(|e| {
            SwapError::new(
                SwapFailureReason::InvalidSwapPacketReceived,
                format!("malformed envelope: {e}"),
            )
        })?;
        envelope.body.ok_or_else(|| {
            SwapError::new(
                SwapFailureReason::InvalidSwapPacketReceived,
                "envelope carries no known packet body",
            )
        })
    }

    pub fn failed(r_hash: &str, reason: SwapFailureReason, message: impl Into<String>) -> Self {
        Self::SwapFailed(SwapFailedBody {
            r_hash: r_hash.to_string(),
            failure_reason: reason.code(),
            error_message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_dispatches_on_body_tag() {
        let packet = SwapPacket::SwapRequest(SwapRequestBody {
            r_hash: "aa".into(),
            order_id: "order-1".into(),
            pair_id: "BTC_ETH".into(),
            proposed_quantity: 100,
            taker_cltv_delta: 40,
            taker_destination: "taker-dest".into(),
        });
        let bytes = packet.to_envelope();
        // Field 1, length-delimited.
        assert_eq!(bytes[0], 0x0a);
        assert_eq!(SwapPacket::decode(&bytes).unwrap(), packet);

        let ack = SwapPacket::InvoiceExchangeAck(InvoiceExchangeAckBody { r_hash: "bb".into() });
        let bytes = ack.to_envelope();
        assert_eq!(bytes[0], 6 << 3 | 2);
        let decoded = SwapPacket::decode(&bytes).unwrap();
        assert_eq!(decoded.kind(), "invoice_exchange_ack");
        assert_eq!(decoded.r_hash(), "bb");
    }

    #[test]
    fn failed_packet_carries_reason_code() {
        let packet = SwapPacket::failed("cc", SwapFailureReason::OrderOnHold, "busy");
        match SwapPacket::decode(&packet.to_envelope()).unwrap() {
            SwapPacket::SwapFailed(body) => {
                assert_eq!(body.failure_reason, 1);
                assert_eq!(body.error_message, "busy");
            }
            other => panic!("unexpected packet {}", other.kind()),
        }
    }

    #[test]
    fn unknown_or_garbage_envelopes_fail_closed() {
        let err = SwapPacket::decode(&[]).unwrap_err();
        assert_eq!(err.reason, SwapFailureReason::InvalidSwapPacketReceived);

        // Field 9, length 0: a discriminant nobody knows.
        let err = SwapPacket::decode(&[9 << 3 | 2, 0]).unwrap_err();
        assert_eq!(err.reason, SwapFailureReason::InvalidSwapPacketReceived);

        let err = SwapPacket::decode(&[0x0a, 0x05, 0x01]).unwrap_err();
        assert_eq!(err.reason, SwapFailureReason::InvalidSwapPacketReceived);
    }
}

//! One-unit probe payments that check both parties can route to each other
//! before real value moves. A probe shares the payment-hash space with deals
//! but is never persisted.
//!
//! The initiator knows the preimage and pays one unit to the responder. The
//! responder, holding that HTLC, pays one unit back under the same hash; the
//! initiator settles it, which reveals the preimage to the responder, who can
//! then settle the first payment.

use std::collections::HashMap;

use tokio::sync::oneshot;

use super::SwapError;

pub const SANITY_UNITS: u128 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeRole {
    Initiator,
    Responder,
}

#[derive(Debug)]
pub struct Probe {
    pub role: ProbeRole,
    pub peer_pub_key: String,
    pub currency: String,
    /// Where the peer receives on this network.
    pub peer_destination: String,
    /// Known up front by the initiator, learned by the responder.
    pub preimage: Option<String>,
    pub htlc_received: bool,
    waiter: Option<oneshot::Sender<Result<String, SwapError>>>,
}

impl Probe {
    pub fn new(
        role: ProbeRole,
        peer_pub_key: &str,
        currency: &str,
        peer_destination: &str,
        preimage: Option<String>,
        waiter: oneshot::Sender<Result<String, SwapError>>,
    ) -> Self {
        Self {
            role,
            peer_pub_key: peer_pub_key.to_string(),
            currency: currency.to_string(),
            peer_destination: peer_destination.to_string(),
            preimage,
            htlc_received: false,
            waiter: Some(waiter),
        }
    }
}

#[derive(Debug, Default)]
pub struct SanityProbes {
    probes: HashMap<String, Probe>,
}

impl SanityProbes {
    pub fn insert(&mut self, r_hash: &str, probe: Probe) {
        self.probes.insert(r_hash.to_string(), probe);
    }

    pub fn contains(&self, r_hash: &str) -> bool {
        self.probes.contains_key(r_hash)
    }

    pub fn get(&self, r_hash: &str) -> Option<&Probe> {
        self.probes.get(r_hash)
    }

    pub fn get_mut(&mut self, r_hash: &str) -> Option<&mut Probe> {
        self.probes.get_mut(r_hash)
    }

    /// Removes the probe and reports `result` to whoever started it.
    pub fn finish(&mut self, r_hash: &str, result: Result<(), SwapError>) -> Option<Probe> {
        let mut probe = self.probes.remove(r_hash)?;
        if let Some(waiter) = probe.waiter.take() {
            let _ = waiter.send(result.map(|()| r_hash.to_string()));
        }
        Some(probe)
    }
}

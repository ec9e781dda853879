use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::swap::{SwapFailureReason, SwapPhase};

/// Per-phase timer durations. Serialised as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapTimeouts {
    /// Taker waiting for the maker to accept a request.
    #[serde(with = "duration_ms")]
    pub accept: Duration,
    #[serde(with = "duration_ms")]
    pub invoice_exchange: Duration,
    #[serde(with = "duration_ms")]
    pub payment_receive: Duration,
    /// Grace period for the completion signal once funds were received.
    #[serde(with = "duration_ms")]
    pub completed: Duration,
    #[serde(with = "duration_ms")]
    pub sanity_init: Duration,
    #[serde(with = "duration_ms")]
    pub sanity_complete: Duration,
}

impl Default for SwapTimeouts {
    fn default() -> Self {
        Self {
            accept: Duration::from_millis(100_000),
            invoice_exchange: Duration::from_millis(100_000),
            payment_receive: Duration::from_millis(100_000),
            completed: Duration::from_millis(100_000),
            sanity_init: Duration::from_millis(3_000),
            sanity_complete: Duration::from_millis(10_000),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// What to do when a timer fires. Every action names the phase it was armed
/// for; the manager ignores it if the deal has moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    FailDeal {
        awaited: SwapPhase,
        reason: SwapFailureReason,
    },
    /// Funds were received but the completion signal never came.
    CompleteDeal { awaited: SwapPhase },
    ExpireProbe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTimer {
    pub r_hash: String,
    pub action: TimerAction,
}

/// At most one armed timer per payment hash. Re-arming replaces the previous
/// timer; superseded heap entries are skipped lazily.
#[derive(Debug, Default)]
pub struct TimeoutRegistry {
    queue: BinaryHeap<Reverse<(Instant, u64, String)>>,
    armed: HashMap<String, (u64, TimerAction)>,
    next_seq: u64,
}

impl TimeoutRegistry {
    pub fn arm(&mut self, r_hash: &str, after: Duration, action: TimerAction) {
        self.arm_at(r_hash, Instant::now() + after, action);
    }

    pub fn arm_at(&mut self, r_hash: &str, deadline: Instant, action: TimerAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.armed.insert(r_hash.to_string(), (seq, action));
        self.queue.push(Reverse((deadline, seq, r_hash.to_string())));
    }

    pub fn clear(&mut self, r_hash: &str) {
        self.armed.remove(r_hash);
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_stale_head();
        self.queue.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Removes and returns every live timer with `deadline <= now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<FiredTimer> {
        let mut fired = Vec::new();
        loop {
            self.drop_stale_head();
            let Some(Reverse((deadline, _, _))) = self.queue.peek() else {
                break;
            };
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, _, r_hash))) = self.queue.pop() else {
                break;
            };
            if let Some((_, action)) = self.armed.remove(&r_hash) {
                fired.push(FiredTimer { r_hash, action });
            }
        }
        fired
    }

    fn drop_stale_head(&mut self) {
        loop {
            let stale = match self.queue.peek() {
                Some(Reverse((_, seq, r_hash))) => self
                    .armed
                    .get(r_hash)
                    .is_none_or(|(live, _)| live != seq),
                None => return,
            };
            if !stale {
                return;
            }
            self.queue.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCEPT: TimerAction = TimerAction::FailDeal {
        awaited: SwapPhase::SwapRequested,
        reason: SwapFailureReason::DealTimedOut,
    };

    #[test]
    fn defaults_serialise_as_millis() {
        let json = serde_json::to_value(SwapTimeouts::default()).unwrap();
        assert_eq!(json["accept"], 100_000);
        assert_eq!(json["sanity_init"], 3_000);

        let parsed: SwapTimeouts = serde_json::from_str(r#"{"accept": 250}"#).unwrap();
        assert_eq!(parsed.accept, Duration::from_millis(250));
        assert_eq!(parsed.sanity_complete, Duration::from_secs(10));
    }

    #[test]
    fn fires_in_deadline_order() {
        let now = Instant::now();
        let mut reg = TimeoutRegistry::default();
        reg.arm_at("b", now + Duration::from_secs(2), ACCEPT);
        reg.arm_at("a", now + Duration::from_secs(1), TimerAction::ExpireProbe);
        reg.arm_at("c", now + Duration::from_secs(9), ACCEPT);

        assert_eq!(reg.next_deadline(), Some(now + Duration::from_secs(1)));
        let fired = reg.pop_expired(now + Duration::from_secs(5));
        let hashes: Vec<_> = fired.iter().map(|f| f.r_hash.as_str()).collect();
        assert_eq!(hashes, ["a", "b"]);
        assert_eq!(fired[0].action, TimerAction::ExpireProbe);
        assert_eq!(reg.next_deadline(), Some(now + Duration::from_secs(9)));
    }

    #[test]
    fn rearming_replaces_and_clear_cancels() {
        let now = Instant::now();
        let mut reg = TimeoutRegistry::default();
        reg.arm_at("a", now + Duration::from_secs(1), ACCEPT);
        let later = TimerAction::CompleteDeal {
            awaited: SwapPhase::PaymentReceived,
        };
        reg.arm_at("a", now + Duration::from_secs(10), later);

        assert!(reg.pop_expired(now + Duration::from_secs(5)).is_empty());
        assert_eq!(reg.next_deadline(), Some(now + Duration::from_secs(10)));

        reg.clear("a");
        assert_eq!(reg.next_deadline(), None);
        assert!(reg.pop_expired(now + Duration::from_secs(60)).is_empty());
    }
}

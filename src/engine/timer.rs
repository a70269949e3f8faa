//! The timer wheel behind the event loop. Every event carries the
//! serial of its target state; the serial is validated when the timer
//! fires, so a deleted state's leftovers are dropped instead of
//! dangling.

use std::time::Duration;

use futures::future::poll_fn;
use tokio_util::time::delay_queue::{DelayQueue, Key};

use crate::engine::state::SerialNumber;

pub type TimerKey = Key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Retransmit the current outbound message or give up.
    Retransmit,
    /// IKEv2 liveness probe tick.
    Liveness,
    /// IKEv1 DPD tick; same engine, v1 flavor.
    Dpd,
    /// Stop holding the operator channel open.
    ReleaseWhack,
    /// Soft-lifetime rekey of an established SA.
    SaReplace,
    /// Soft-lifetime rekey, skipped when the SA has been idle.
    SaReplaceIfUsed,
    /// Hard expiry.
    SaExpire,
    /// Bound on how long a crypto task may stay in flight.
    CryptoTimeout,
    /// Global: NAT-T keepalives on the ESP-in-UDP port.
    NatKeepalive,
    /// Global: ask the kernel to expire bare shunts.
    ShuntScan,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Retransmit => "EVENT_RETRANSMIT",
            EventKind::Liveness => "EVENT_v2_LIVENESS",
            EventKind::Dpd => "EVENT_DPD",
            EventKind::ReleaseWhack => "EVENT_RELEASE_WHACK",
            EventKind::SaReplace => "EVENT_SA_REPLACE",
            EventKind::SaReplaceIfUsed => "EVENT_SA_REPLACE_IF_USED",
            EventKind::SaExpire => "EVENT_SA_EXPIRE",
            EventKind::CryptoTimeout => "EVENT_CRYPTO_TIMEOUT",
            EventKind::NatKeepalive => "EVENT_NAT_T_KEEPALIVE",
            EventKind::ShuntScan => "EVENT_SHUNT_SCAN",
        }
    }

    /// Global events carry no state serial.
    pub fn is_global(self) -> bool {
        matches!(self, EventKind::NatKeepalive | EventKind::ShuntScan)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub kind: EventKind,
    pub serial: SerialNumber,
}

#[derive(Default)]
pub struct TimerQueue {
    queue: DelayQueue<TimerEvent>,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            queue: DelayQueue::new(),
        }
    }

    pub fn schedule(&mut self, kind: EventKind, serial: SerialNumber, delay: Duration) -> TimerKey {
        debug_assert!(kind.is_global() == serial.is_nobody());
        // a month out is a config bug, not a schedule
        debug_assert!(delay < Duration::from_secs(3600 * 24 * 31));
        tracing::trace!(
            "inserting event {} for {} in {:?}",
            kind.name(),
            serial,
            delay
        );
        self.queue.insert(TimerEvent { kind, serial }, delay)
    }

    /// Cancel a scheduled event; quietly ignores an already-fired key.
    pub fn cancel(&mut self, key: TimerKey) {
        let _ = self.queue.try_remove(&key);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Next expired event. Only polled when non-empty; the event loop
    /// guards with `is_empty`.
    pub async fn next_expired(&mut self) -> Option<TimerEvent> {
        poll_fn(|cx| self.queue.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn events_fire_in_monotonic_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(
            EventKind::SaExpire,
            SerialNumber(2),
            Duration::from_millis(200),
        );
        timers.schedule(
            EventKind::Retransmit,
            SerialNumber(1),
            Duration::from_millis(100),
        );

        let first = timers.next_expired().await.unwrap();
        assert_eq!(first.kind, EventKind::Retransmit);
        let second = timers.next_expired().await.unwrap();
        assert_eq!(second.kind, EventKind::SaExpire);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_events_do_not_fire() {
        let mut timers = TimerQueue::new();
        let key = timers.schedule(
            EventKind::Retransmit,
            SerialNumber(1),
            Duration::from_millis(100),
        );
        timers.schedule(
            EventKind::Liveness,
            SerialNumber(1),
            Duration::from_millis(150),
        );
        timers.cancel(key);

        let fired = timers.next_expired().await.unwrap();
        assert_eq!(fired.kind, EventKind::Liveness);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_fire_is_harmless() {
        let mut timers = TimerQueue::new();
        let key = timers.schedule(
            EventKind::CryptoTimeout,
            SerialNumber(3),
            Duration::from_millis(10),
        );
        let _ = timers.next_expired().await;
        timers.cancel(key);
    }
}

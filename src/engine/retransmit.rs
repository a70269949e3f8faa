//! Retransmission: capped exponential backoff, the give-up path, and
//! the keying-attempt replacement logic with the IKEv1/IKEv2 fallback
//! flip.

use crate::config::conn::Policy;
use crate::engine::state::{SaKind, SerialNumber, StateLabel};
use crate::engine::timer::EventKind;
use crate::engine::Engine;

pub const MAX_RETRANSMITS_PER_EXCHANGE: u32 = 12;

fn backoff_ms(base: u64, cap: u64, x: u32) -> u64 {
    // The saturation test is a right shift so the left shift below
    // cannot overflow; x is bounded by the first arm.
    if x > MAX_RETRANSMITS_PER_EXCHANGE || (cap >> x) < base {
        cap
    } else {
        base << x
    }
}

/// Delay before retransmit number `x` (0-based), in milliseconds.
/// Doubles from `base`, saturates at `cap`, fires once more at the cap,
/// then returns 0 meaning "give up".
pub fn retrans_delay_ms(base: u64, cap: u64, x: u32) -> u64 {
    let delay = backoff_ms(base, cap, x);
    if x > 1 && delay == cap && backoff_ms(base, cap, x - 1) == cap {
        // the previous attempt was already at the cap
        0
    } else {
        delay
    }
}

/// Diagnostic attached to the give-up log line, keyed on how far the
/// exchange got.
fn giveup_details(label: StateLabel, newest_ipsec_is_nobody: bool) -> &'static str {
    match label {
        StateLabel::MainI3 | StateLabel::AggrI2 | StateLabel::ParentI2 => {
            ".  Possible authentication failure: no acceptable response to our first encrypted message"
        }
        StateLabel::MainI1 | StateLabel::AggrI1 => {
            ".  No response (or no acceptable response) to our first IKEv1 message"
        }
        StateLabel::ParentI1 => {
            ".  No response (or no acceptable response) to our first IKEv2 message"
        }
        StateLabel::QuickI1 if newest_ipsec_is_nobody => {
            ".  No acceptable response to our first Quick Mode message: perhaps peer likes no proposal"
        }
        _ => "",
    }
}

impl Engine {
    /// A retransmit timer fired for `serial`: either send the stored
    /// message again with a longer fuse, or give up, maybe schedule a
    /// fresh keying attempt, and delete the state.
    pub(crate) async fn handle_retransmit(&mut self, serial: SerialNumber) {
        let Some(st) = self.table.get(serial) else {
            return;
        };
        let conn_id = st.connection;
        let Some(conn) = self.conns.get(conn_id) else {
            self.delete_state(serial, "connection vanished").await;
            return;
        };

        let base = conn.retransmit_interval.as_millis() as u64;
        let cap = conn.retransmit_timeout.as_millis() as u64;
        let try_limit = conn.keying_tries;
        let policy = conn.policy;
        let opportunistic = policy.contains(Policy::OPPORTUNISTIC);
        let newest_ipsec_is_nobody = conn.newest_ipsec_sa.is_nobody();

        tracing::debug!(
            "handling {} for {} \"{}\" {} attempt {} of {}",
            EventKind::Retransmit.name(),
            st.remote_addr,
            conn.name,
            serial,
            st.try_count,
            try_limit
        );

        let delay_ms = if self.impair_retransmits {
            tracing::info!("suppressing retransmit because impair-retransmits is set");
            0
        } else {
            let st = self.table.get_mut(serial).expect("checked above");
            let x = st.retransmit_count;
            st.retransmit_count += 1;
            retrans_delay_ms(base, cap, x)
        };

        if delay_ms != 0 {
            let st = self.table.get_mut(serial).expect("checked above");
            tracing::info!(
                "{}: retransmission; will wait {}ms for response",
                st.label.name(),
                delay_ms
            );
            if st.label.suppress_retransmit() {
                // the responder's first reply is never retransmitted
                tracing::debug!(
                    "skipped initial reply retransmission to avoid amplification attacks"
                );
            } else if let Some(packet) = st.tpacket.clone() {
                let remote = st.remote_addr;
                let local = st.local_addr;
                self.send_packet(local, remote, &packet).await;
            }
            let key = self.timers.schedule(
                EventKind::Retransmit,
                serial,
                std::time::Duration::from_millis(delay_ms),
            );
            self.table.get_mut(serial).expect("checked above").events.event =
                Some((EventKind::Retransmit, key));
            return;
        }

        // Give up on this exchange.
        let (label, retransmit_count, try_count) = {
            let st = self.table.get(serial).expect("checked above");
            (st.label, st.retransmit_count, st.try_count)
        };
        // a suppressed retransmit is a one-way trip; no fresh attempt
        let try_count = if self.impair_retransmits { 0 } else { try_count };
        if !opportunistic {
            tracing::warn!(
                "max number of retransmissions ({}) reached {}{}",
                retransmit_count,
                label.name(),
                giveup_details(label, newest_ipsec_is_nobody)
            );
        }

        // Keying attempts: try_count of 0 means this was a one-shot
        // exchange; a limit of 0 means unlimited attempts.
        if try_count != 0 && (try_limit == 0 || try_count < try_limit) {
            let new_try = try_count + 1;
            let story = if try_limit == 0 {
                format!("starting keying attempt {} of an unlimited number", new_try)
            } else {
                format!("starting keying attempt {} of at most {}", new_try, try_limit)
            };

            {
                let st = self.table.get_mut(serial).expect("checked above");
                if st.whack.is_some() {
                    // release whack because the observer will get bored
                    tracing::info!("{}, but releasing whack", story);
                    st.release_whack(&story);
                } else if !opportunistic {
                    tracing::info!("{}", story);
                }
            }

            // Alternate major versions every third attempt when policy
            // allows both.
            if new_try % 3 == 0 {
                let is_v2 = self
                    .table
                    .get(serial)
                    .map(|s| s.version == crate::ike::IkeVersion::V2)
                    .unwrap_or(false);
                if let Some(conn) = self.conns.get_mut(conn_id) {
                    if is_v2 && conn.policy.contains(Policy::IKEV1_ALLOW) {
                        conn.failed_ikev2 = true;
                        tracing::info!("next attempt will be IKEv1");
                    } else if !is_v2
                        && conn
                            .policy
                            .intersects(Policy::IKEV2_ALLOW | Policy::IKEV2_PROPOSE)
                    {
                        conn.failed_ikev2 = false;
                        tracing::info!("next attempt will be IKEv2");
                    }
                }
            }

            self.initiate_replacement(conn_id, new_try).await;
        } else if try_count != 0 {
            tracing::debug!("maximum number of keying tries reached, deleting state");
        }

        // An IKEv2 child timing out takes its still-unestablished parent
        // along.
        let parent = {
            let st = self.table.get(serial).expect("checked above");
            (st.kind == SaKind::ChildSa).then_some(st.parent)
        };
        if let Some(parent) = parent {
            if self
                .table
                .get(parent)
                .map(|p| p.label == StateLabel::ParentI2)
                .unwrap_or(false)
            {
                self.delete_state(parent, "retransmit limit reached").await;
            }
        }

        self.delete_state(serial, "retransmit limit reached").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_saturates_then_gives_up() {
        // base 500ms, cap 60s
        let expected = [500, 1000, 2000, 4000, 8000, 16000, 32000, 60000, 0];
        for (x, want) in expected.iter().enumerate() {
            assert_eq!(
                retrans_delay_ms(500, 60_000, x as u32),
                *want,
                "count {}",
                x
            );
        }
    }

    #[test]
    fn delay_is_monotonic_until_giveup() {
        let mut last = 0;
        for x in 0..8 {
            let d = retrans_delay_ms(500, 60_000, x);
            assert!(d >= last, "delay shrank at {}", x);
            assert!(d <= 60_000, "delay exceeds cap at {}", x);
            last = d;
        }
    }

    #[test]
    fn base_at_or_above_cap_fires_once_then_gives_up() {
        assert_eq!(retrans_delay_ms(60_000, 60_000, 0), 60_000);
        assert_eq!(retrans_delay_ms(60_000, 60_000, 1), 60_000);
        assert_eq!(retrans_delay_ms(60_000, 60_000, 2), 0);
    }

    #[test]
    fn count_beyond_hard_limit_gives_up() {
        assert_eq!(retrans_delay_ms(1, u64::MAX, MAX_RETRANSMITS_PER_EXCHANGE + 2), 0);
    }

    #[test]
    fn giveup_diagnostics_name_the_failure() {
        assert!(giveup_details(StateLabel::ParentI2, true).contains("authentication failure"));
        assert!(giveup_details(StateLabel::ParentI1, true).contains("IKEv2"));
        assert!(giveup_details(StateLabel::MainI1, true).contains("IKEv1"));
        assert!(giveup_details(StateLabel::QuickI1, true).contains("Quick Mode"));
        assert_eq!(giveup_details(StateLabel::QuickI1, false), "");
        assert_eq!(giveup_details(StateLabel::MainR2, true), "");
    }
}

//! Traffic-selector narrowing (RFC 7296 section 2.9).
//!
//! On the responder, pick the connection and SPD route that best fit the
//! initiator's TSi/TSr payloads, scoring prefix fit, then port fit, then
//! protocol fit in lexicographic order. On the initiator, check the
//! responder's (possibly narrowed) answer against our single route and
//! adopt it.

use crate::config::conn::{trusted_ca, ConnId, ConnectionStore, End, Policy};
use crate::ike::ts::{end_to_ts, iprange_bits, ts_to_subnet, TrafficSelector, TsPayload};

/// How the connection end is allowed to relate to the peer's selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Narrowing {
    /// end == TS: responder refuses narrowing
    Equals,
    /// end <= TS: responder may narrow the peer's selector to our end
    EndNarrowerThanTs,
    /// end >= TS: initiator accepts a narrowed answer
    EndWiderThanTs,
}

fn responder_narrowing(policy: Policy) -> Narrowing {
    if policy.contains(Policy::ALLOW_NARROWING) {
        Narrowing::EndNarrowerThanTs
    } else {
        Narrowing::Equals
    }
}

fn initiator_widening(policy: Policy) -> Narrowing {
    if policy.contains(Policy::ALLOW_NARROWING) {
        Narrowing::EndWiderThanTs
    } else {
        Narrowing::Equals
    }
}

/// Protocol fit; 0 means no match. An exact match always wins big; in
/// the narrowing modes a wildcard on either side can be tightened to
/// the other side's protocol.
fn match_protocol(end: &End, ts: &TrafficSelector, narrowing: Narrowing) -> u32 {
    if end.protocol == ts.ipprotoid {
        return 255;
    }
    match narrowing {
        Narrowing::Equals => 0,
        Narrowing::EndNarrowerThanTs => {
            // peer's wildcard covers our protocol, or our wildcard
            // policy narrows down to the peer's
            if ts.ipprotoid == 0 || end.protocol == 0 {
                1
            } else {
                0
            }
        }
        Narrowing::EndWiderThanTs => {
            if end.protocol == 0 {
                1
            } else {
                0
            }
        }
    }
}

/// Port-range fit; 0 means no match, otherwise 1 + ports covered by the
/// usable intersection. Port 0 on an end means the whole 0..65535
/// range.
fn match_port_range(end: &End, ts: &TrafficSelector, narrowing: Narrowing) -> u32 {
    let end_low = end.port;
    let end_high = if end.port == 0 { 65535 } else { end.port };

    match narrowing {
        Narrowing::Equals => {
            if end_low == ts.startport && end_high == ts.endport {
                1 + (end_high - end_low) as u32
            } else {
                0
            }
        }
        Narrowing::EndNarrowerThanTs => {
            // the negotiated range will be the intersection; any
            // overlap can be narrowed to
            let low = end_low.max(ts.startport);
            let high = end_high.min(ts.endport);
            if low <= high {
                1 + (high - low) as u32
            } else {
                0
            }
        }
        Narrowing::EndWiderThanTs => {
            if end_low <= ts.startport && end_high >= ts.endport {
                1 + (ts.endport - ts.startport) as u32
            } else {
                0
            }
        }
    }
}

/// The negotiated selector: the peer's proposal cut down to what the
/// end's policy covers. The prefix pass already guarantees the address
/// range sits inside the end's subnet.
fn intersect_ts(end: &End, ts: &TrafficSelector) -> TrafficSelector {
    let announced = end_to_ts(end);
    TrafficSelector {
        ts_type: ts.ts_type,
        ipprotoid: if announced.ipprotoid != 0 {
            announced.ipprotoid
        } else {
            ts.ipprotoid
        },
        startport: announced.startport.max(ts.startport),
        endport: announced.endport.min(ts.endport),
        start_addr: ts.start_addr,
        end_addr: ts.end_addr,
    }
}

/// Address-range fit: the TS must sit inside the end's client subnet
/// (the end is wider than the TS; the prefix pass is hardwired to this
/// direction). Score is subnet maskbits plus the range's bit size, so
/// wider acceptable selectors win. A selector pinned to exactly our
/// configured port doubles its score.
fn match_address_range(end: &End, ts: &TrafficSelector) -> u32 {
    let ts_range = iprange_bits(ts.start_addr, ts.end_addr);
    let maskbits = end.client.prefix_len() as u32;

    let mut f = if end.client.contains(&ts.start_addr) && end.client.contains(&ts.end_addr) {
        maskbits + ts_range
    } else {
        0
    };

    if f != 0 && end.port != 0 && ts.startport == end.port && ts.endport == end.port {
        f <<= 1;
    }
    f
}

struct Ends<'a> {
    /// end compared against TSi
    i: &'a End,
    /// end compared against TSr
    r: &'a End,
}

/// Prefix fitness over every TSi x TSr combination:
/// (fit_i << 8) + fit_r, or None when nothing fits.
fn evaluate_connection_fit(
    e: &Ends<'_>,
    tsi: &[TrafficSelector],
    tsr: &[TrafficSelector],
) -> Option<i64> {
    let mut bestfit: Option<i64> = None;
    for tni in tsi {
        let fit_i = match_address_range(e.i, tni);
        if fit_i == 0 {
            continue;
        }
        for tnr in tsr {
            let fit_r = match_address_range(e.r, tnr);
            if fit_r == 0 {
                continue;
            }
            let fitbits = ((fit_i as i64) << 8) + fit_r as i64;
            if Some(fitbits) > bestfit {
                bestfit = Some(fitbits);
            }
        }
    }
    bestfit
}

/// Best (score, tsi index, tsr index) under `score_one`, or None.
fn evaluate_pairwise_fit(
    e: &Ends<'_>,
    tsi: &[TrafficSelector],
    tsr: &[TrafficSelector],
    score_one: impl Fn(&End, &TrafficSelector) -> u32,
) -> Option<(i64, usize, usize)> {
    let mut best: Option<(i64, usize, usize)> = None;
    for (ni, tni) in tsi.iter().enumerate() {
        let fit_i = score_one(e.i, tni);
        if fit_i == 0 {
            continue;
        }
        for (nr, tnr) in tsr.iter().enumerate() {
            let fit_r = score_one(e.r, tnr);
            if fit_r == 0 {
                continue;
            }
            let matchiness = (fit_i + fit_r) as i64;
            if best.map_or(true, |(b, _, _)| matchiness > b) {
                best = Some((matchiness, ni, nr));
            }
        }
    }
    best
}

fn evaluate_port_fit(
    narrowing: Narrowing,
    e: &Ends<'_>,
    tsi: &[TrafficSelector],
    tsr: &[TrafficSelector],
) -> Option<(i64, usize, usize)> {
    evaluate_pairwise_fit(e, tsi, tsr, |end, ts| match_port_range(end, ts, narrowing))
}

fn evaluate_protocol_fit(
    narrowing: Narrowing,
    e: &Ends<'_>,
    tsi: &[TrafficSelector],
    tsr: &[TrafficSelector],
) -> Option<(i64, usize, usize)> {
    evaluate_pairwise_fit(e, tsi, tsr, |end, ts| match_protocol(end, ts, narrowing))
}

/// Outcome of responder-side narrowing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrowResult {
    /// Connection the child SA should be rebound to.
    pub conn: ConnId,
    /// Index of the winning SPD route within that connection.
    pub route: usize,
    pub ts_this: TrafficSelector,
    pub ts_that: TrafficSelector,
}

#[derive(Debug, Default, Clone, Copy)]
struct BestFit {
    n: i64,
    p: i64,
    pr: i64,
}

impl BestFit {
    fn new() -> Self {
        BestFit {
            n: -1,
            p: -1,
            pr: -1,
        }
    }
}

/// Evaluate every route of `conn` against the payloads, updating
/// `best`/`winner` when a route beats the running best in lexicographic
/// (prefix, port, protocol) order.
fn scan_connection_routes(
    store: &ConnectionStore,
    conn_id: ConnId,
    responder: bool,
    tsi: &[TrafficSelector],
    tsr: &[TrafficSelector],
    best: &mut BestFit,
    winner: &mut Option<(ConnId, usize, usize, usize)>,
) {
    let conn = match store.get(conn_id) {
        Some(c) => c,
        None => return,
    };
    let narrowing = if responder {
        responder_narrowing(conn.policy)
    } else {
        initiator_widening(conn.policy)
    };

    for (ri, route) in conn.spd.iter().enumerate() {
        let e = if responder {
            Ends {
                i: &route.that,
                r: &route.this,
            }
        } else {
            Ends {
                i: &route.this,
                r: &route.that,
            }
        };

        let Some(bfit_n) = evaluate_connection_fit(&e, tsi, tsr) else {
            tracing::trace!("prefix fitness rejected {} route {}", conn.name, ri);
            continue;
        };
        let Some((bfit_p, ..)) = evaluate_port_fit(narrowing, &e, tsi, tsr) else {
            tracing::trace!("port fitness rejected {} route {}", conn.name, ri);
            continue;
        };
        let Some((bfit_pr, best_tsi, best_tsr)) = evaluate_protocol_fit(narrowing, &e, tsi, tsr)
        else {
            tracing::trace!("protocol fitness rejected {} route {}", conn.name, ri);
            continue;
        };

        // lexicographic: prefix first, port second, protocol last
        if (bfit_n, bfit_p, bfit_pr) <= (best.n, best.p, best.pr) {
            tracing::trace!("{} route {} does not beat the running best", conn.name, ri);
            continue;
        }

        tracing::debug!(
            "better TS fit: {} route {} tsi[{}] tsr[{}] (n={} p={} pr={})",
            conn.name,
            ri,
            best_tsi,
            best_tsr,
            bfit_n,
            bfit_p,
            bfit_pr
        );
        *best = BestFit {
            n: bfit_n,
            p: bfit_p,
            pr: bfit_pr,
        };
        *winner = Some((conn_id, ri, best_tsi, best_tsr));
    }
}

/// Single-port-or-wildcard extraction for the group-instance fallback.
/// Multi-port ranges disqualify the selector.
fn template_port(ts: &TrafficSelector) -> Option<u16> {
    if ts.startport == ts.endport {
        Some(ts.startport)
    } else if ts.startport == 0 && ts.endport == 65535 {
        Some(0)
    } else {
        None
    }
}

/// Responder-side narrowing: choose the best connection and route for
/// the peer's TSi/TSr, walking the inbound connection, every connection
/// on the same host pair, and finally the group-instance templates.
pub fn process_ts_request(
    store: &mut ConnectionStore,
    inbound: ConnId,
    tsi: &TsPayload,
    tsr: &TsPayload,
) -> Option<NarrowResult> {
    let tsi = &tsi.selectors[..];
    let tsr = &tsr.selectors[..];

    let mut best = BestFit::new();
    let mut winner: Option<(ConnId, usize, usize, usize)> = None;

    // Pass 1: the connection the IKE SA arrived on.
    scan_connection_routes(store, inbound, true, tsi, tsr, &mut best, &mut winner);

    // Pass 2: other connections sharing the host pair, filtered on
    // identity and trust anchors. Group templates are skipped; they are
    // only reachable through instantiation.
    let (this_id, that_id, that_ca, host_pairs) = {
        let c = store.get(inbound)?;
        let mut pairs = Vec::new();
        for route in &c.spd {
            let found = store.find_host_pair(
                route.this.host_addr,
                route.this.port,
                route.that.host_addr,
                route.that.port,
            );
            if !found.is_empty() {
                pairs = found;
                break; // first non-empty host pair wins
            }
        }
        (
            c.spd[0].this.id.clone(),
            c.spd[0].that.id.clone(),
            c.spd[0].that.ca.clone(),
            pairs,
        )
    };

    for d_id in host_pairs {
        if d_id == inbound {
            continue;
        }
        let d = match store.get(d_id) {
            Some(d) => d,
            None => continue,
        };
        if d.policy.contains(Policy::GROUP) {
            continue;
        }
        let d_route = &d.spd[0];
        if !(this_id.same_id(&d_route.this.id)
            && that_id.match_id(&d_route.that.id)
            && trusted_ca(that_ca.as_deref(), d_route.that.ca.as_deref()))
        {
            tracing::debug!(
                "connection {} does not match IDs or CA of inbound connection",
                d.name
            );
            continue;
        }
        scan_connection_routes(store, d_id, true, tsi, tsr, &mut best, &mut winner);
    }

    // Pass 3: nothing fits; can a group-instance template with different
    // protoports be adopted? Requires exactly one selector per side,
    // each either a single port or the full wildcard range.
    if winner.is_none() {
        let best_id = inbound;
        let rewrite = {
            let best_conn = store.get(best_id)?;
            let templates = store.group_instance_templates();
            let mut rewrite = None;
            let ports = if tsi.len() == 1 && tsr.len() == 1 {
                template_port(&tsi[0]).zip(template_port(&tsr[0]))
            } else {
                None
            };
            if let Some((t_sport, t_dport)) = ports {
                for t_id in templates {
                    let t = match store.get(t_id) {
                        Some(t) => t,
                        None => continue,
                    };
                    if t.foodgroup.is_none()
                        || t.foodgroup != best_conn.foodgroup
                        || t.name == best_conn.name
                    {
                        continue;
                    }
                    let b_route = &best_conn.spd[0];
                    let t_route = &t.spd[0];
                    if !t_route.that.client.contains(&b_route.that.client)
                        || t_route.this.client.network() != b_route.this.client.network()
                    {
                        continue;
                    }
                    if t_route.that.protocol != tsi[0].ipprotoid
                        || t_route.this.port != t_sport
                        || t_route.that.port != t_dport
                    {
                        continue;
                    }
                    tracing::debug!(
                        "adopting protoports of group instance template {}",
                        t.name
                    );
                    rewrite = Some((
                        t.name.clone(),
                        t_route.that.protocol,
                        t_route.this.port,
                        t_route.that.port,
                    ));
                    break;
                }
            }
            rewrite
        };

        let (name, protocol, sport, dport) = rewrite?;
        let best_conn = store.get_mut(best_id)?;
        for route in &mut best_conn.spd {
            route.that.protocol = protocol;
            route.this.port = sport;
            route.that.port = dport;
        }
        best_conn.name = name;
        winner = Some((best_id, 0, 0, 0));
    }

    // TSi describes the initiator's traffic (our "that" side), TSr
    // ours; the negotiated selectors are the peer's proposals narrowed
    // to the winning route.
    let (conn_id, route_idx, ti, tr) = winner?;
    let conn = store.get(conn_id)?;
    let route = &conn.spd[route_idx];
    let result = NarrowResult {
        conn: conn_id,
        route: route_idx,
        ts_this: intersect_ts(&route.this, &tsr[tr]),
        ts_that: intersect_ts(&route.that, &tsi[ti]),
    };
    tracing::debug!(
        "narrowed to {} route {}: this {} that {}",
        conn.name,
        route_idx,
        result.ts_this,
        result.ts_that
    );
    Some(result)
}

/// Initiator-side check of the responder's TSi/TSr answer. On success
/// the connection adopts the narrowed subnet, port and protocol, and the
/// chosen selector pair is returned for the child SA.
pub fn process_ts_response(
    store: &mut ConnectionStore,
    conn_id: ConnId,
    tsi: &TsPayload,
    tsr: &TsPayload,
) -> Option<(TrafficSelector, TrafficSelector)> {
    let tsi = &tsi.selectors[..];
    let tsr = &tsr.selectors[..];

    let (ts_this, ts_that) = {
        let conn = store.get(conn_id)?;
        let route = conn.spd.first()?;
        let e = Ends {
            i: &route.this,
            r: &route.that,
        };

        evaluate_connection_fit(&e, tsi, tsr)?;
        let widening = initiator_widening(conn.policy);
        let (_, pi, pr) = evaluate_port_fit(widening, &e, tsi, tsr)?;
        evaluate_protocol_fit(widening, &e, tsi, tsr)?;
        (tsi[pi], tsr[pr])
    };

    let this_subnet = ts_to_subnet(&ts_this).ok()?;
    let that_subnet = ts_to_subnet(&ts_that).ok()?;

    let conn = store.get_mut(conn_id)?;
    let route = conn.spd.first_mut()?;
    route.this.client = this_subnet;
    route.this.port = ts_this.startport;
    route.this.protocol = ts_this.ipprotoid;
    route.that.client = that_subnet;
    route.that.port = ts_that.startport;
    route.that.protocol = ts_that.ipprotoid;

    tracing::debug!("accepted narrowed selectors this {} that {}", ts_this, ts_that);
    Some((ts_this, ts_that))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::conn::{
        ConnKind, Connection, ConnectionStore, DpdAction, End, PeerId, SpdRoute,
    };
    use crate::crypto::cipher::CipherSuite;
    use crate::engine::state::SerialNumber;
    use crate::ike::ts::TrafficSelector;
    use std::time::Duration;

    fn end(client: &str, host: &str, port: u16, protocol: u8) -> End {
        End {
            client: client.parse().unwrap(),
            host_addr: host.parse().unwrap(),
            port,
            protocol,
            has_port_wildcard: false,
            id: PeerId::None,
            ca: None,
            sig_pub_key: None,
        }
    }

    fn conn(name: &str, policy: Policy, this: End, that: End) -> Connection {
        Connection {
            name: name.to_string(),
            kind: ConnKind::Permanent,
            policy,
            foodgroup: None,
            spd: vec![SpdRoute { this, that }],
            retransmit_interval: Duration::from_millis(500),
            retransmit_timeout: Duration::from_secs(60),
            keying_tries: 3,
            dpd_delay: Duration::ZERO,
            dpd_timeout: Duration::from_secs(120),
            dpd_action: DpdAction::Hold,
            rekey_margin: Duration::from_secs(540),
            sa_lifetime: Duration::from_secs(3600),
            margin: Duration::from_secs(60),
            psk: None,
            sig_key: None,
            if_id: None,
            suite: CipherSuite::default(),
            newest_isakmp_sa: SerialNumber::NOBODY,
            newest_ipsec_sa: SerialNumber::NOBODY,
            failed_ikev2: false,
        }
    }

    fn range(proto: u8, ports: (u16, u16), start: &str, end: &str) -> TrafficSelector {
        TrafficSelector::ipv4(
            proto,
            ports,
            start.parse().unwrap(),
            end.parse().unwrap(),
        )
    }

    fn basic_store(policy: Policy) -> (ConnectionStore, ConnId) {
        let mut store = ConnectionStore::new();
        let id = store.add(conn(
            "east-west",
            policy,
            end("10.0.1.0/24", "192.0.2.1", 0, 0),
            end("10.0.2.0/24", "192.0.2.2", 0, 0),
        ));
        (store, id)
    }

    #[test]
    fn exact_match_is_accepted_without_narrowing() {
        let (mut store, id) = basic_store(Policy::IKEV2_ALLOW);
        // peer asks for exactly our subnets; TSi is the peer's side
        let tsi = TsPayload::single(range(0, (0, 65535), "10.0.2.0", "10.0.2.255"));
        let tsr = TsPayload::single(range(0, (0, 65535), "10.0.1.0", "10.0.1.255"));

        let result = process_ts_request(&mut store, id, &tsi, &tsr).expect("fit");
        assert_eq!(result.conn, id);
        assert_eq!(
            result.ts_this,
            range(0, (0, 65535), "10.0.1.0", "10.0.1.255")
        );
        assert_eq!(
            result.ts_that,
            range(0, (0, 65535), "10.0.2.0", "10.0.2.255")
        );
    }

    #[test]
    fn narrower_request_is_accepted_with_narrowing_enabled() {
        let (mut store, id) = basic_store(Policy::IKEV2_ALLOW | Policy::ALLOW_NARROWING);
        let tsi = TsPayload::single(range(6, (443, 443), "10.0.2.5", "10.0.2.5"));
        let tsr = TsPayload::single(range(0, (0, 65535), "10.0.1.0", "10.0.1.255"));

        let result = process_ts_request(&mut store, id, &tsi, &tsr).expect("fit");
        // the peer's narrower request survives as the intersection
        assert_eq!(result.ts_that, range(6, (443, 443), "10.0.2.5", "10.0.2.5"));
        assert_eq!(
            result.ts_this,
            range(0, (0, 65535), "10.0.1.0", "10.0.1.255")
        );
    }

    #[test]
    fn narrower_request_is_rejected_without_narrowing() {
        let (mut store, id) = basic_store(Policy::IKEV2_ALLOW);
        let tsi = TsPayload::single(range(6, (443, 443), "10.0.2.5", "10.0.2.5"));
        let tsr = TsPayload::single(range(0, (0, 65535), "10.0.1.0", "10.0.1.255"));
        assert!(process_ts_request(&mut store, id, &tsi, &tsr).is_none());
    }

    #[test]
    fn out_of_policy_range_is_rejected() {
        let (mut store, id) = basic_store(Policy::IKEV2_ALLOW);
        let tsi = TsPayload::single(range(0, (0, 65535), "10.0.99.0", "10.0.99.255"));
        let tsr = TsPayload::single(range(0, (0, 65535), "10.0.1.0", "10.0.1.255"));
        assert!(process_ts_request(&mut store, id, &tsi, &tsr).is_none());
    }

    #[test]
    fn host_pair_sibling_with_better_fit_wins() {
        let (mut store, id) = basic_store(Policy::IKEV2_ALLOW);
        // same host pair, more specific remote subnet
        let better = store.add(conn(
            "east-west-dmz",
            Policy::IKEV2_ALLOW,
            end("10.0.1.0/24", "192.0.2.1", 0, 0),
            end("10.0.2.128/25", "192.0.2.2", 0, 0),
        ));

        let tsi = TsPayload::single(range(0, (0, 65535), "10.0.2.128", "10.0.2.255"));
        let tsr = TsPayload::single(range(0, (0, 65535), "10.0.1.0", "10.0.1.255"));
        let result = process_ts_request(&mut store, id, &tsi, &tsr).expect("fit");
        assert_eq!(result.conn, better);
        assert_eq!(
            result.ts_that,
            range(0, (0, 65535), "10.0.2.128", "10.0.2.255")
        );
    }

    #[test]
    fn group_instance_template_rewrites_protoports() {
        let mut store = ConnectionStore::new();
        let mut base = conn(
            "fg-base",
            Policy::IKEV2_ALLOW,
            end("10.0.1.0/24", "192.0.2.1", 0, 0),
            end("10.0.2.0/24", "192.0.2.2", 9, 0),
        );
        base.foodgroup = Some("private".to_string());
        let base_id = store.add(base);

        let mut tmpl = conn(
            "fg-web",
            Policy::IKEV2_ALLOW | Policy::GROUPINSTANCE,
            end("10.0.1.0/24", "192.0.2.1", 0, 0),
            end("10.0.0.0/16", "192.0.2.2", 443, 6),
        );
        tmpl.kind = ConnKind::Template;
        tmpl.foodgroup = Some("private".to_string());
        store.add(tmpl);

        // single selector per side: wildcard source port, 443 dest port
        let tsi = TsPayload::single(range(6, (0, 65535), "10.0.2.7", "10.0.2.7"));
        let tsr = TsPayload::single(range(6, (443, 443), "10.0.1.1", "10.0.1.1"));

        let result = process_ts_request(&mut store, base_id, &tsi, &tsr).expect("template fit");
        assert_eq!(result.conn, base_id);
        let rewritten = store.get(base_id).unwrap();
        assert_eq!(rewritten.name, "fg-web");
        assert_eq!(rewritten.spd[0].that.port, 443);
        assert_eq!(rewritten.spd[0].that.protocol, 6);
    }

    #[test]
    fn response_narrowing_updates_connection() {
        let mut store = ConnectionStore::new();
        let id = store.add(conn(
            "east-west",
            Policy::IKEV2_ALLOW | Policy::ALLOW_NARROWING,
            end("10.0.1.0/24", "192.0.2.1", 0, 0),
            end("10.0.2.0/24", "192.0.2.2", 0, 0),
        ));

        // responder narrowed us down to one host and one port
        let tsi = TsPayload::single(range(6, (8080, 8080), "10.0.1.4", "10.0.1.4"));
        let tsr = TsPayload::single(range(6, (8080, 8080), "10.0.2.9", "10.0.2.9"));

        let (ts_this, ts_that) =
            process_ts_response(&mut store, id, &tsi, &tsr).expect("narrowed fit");
        assert_eq!(ts_this.startport, 8080);
        assert_eq!(ts_that.ipprotoid, 6);

        let conn = store.get(id).unwrap();
        assert_eq!(conn.spd[0].this.client.to_string(), "10.0.1.4/32");
        assert_eq!(conn.spd[0].that.client.to_string(), "10.0.2.9/32");
        assert_eq!(conn.spd[0].that.port, 8080);
    }

    #[test]
    fn response_widening_rejected_without_narrowing_policy() {
        let mut store = ConnectionStore::new();
        let id = store.add(conn(
            "east-west",
            Policy::IKEV2_ALLOW,
            end("10.0.1.0/24", "192.0.2.1", 0, 0),
            end("10.0.2.0/24", "192.0.2.2", 0, 0),
        ));
        let tsi = TsPayload::single(range(6, (8080, 8080), "10.0.1.4", "10.0.1.4"));
        let tsr = TsPayload::single(range(6, (8080, 8080), "10.0.2.9", "10.0.2.9"));
        assert!(process_ts_response(&mut store, id, &tsi, &tsr).is_none());
    }

    #[test]
    fn address_fit_prefers_wider_selector_and_pinned_port() {
        let e = end("10.0.1.0/24", "192.0.2.1", 0, 0);
        let wide = range(0, (0, 65535), "10.0.1.0", "10.0.1.255");
        let narrow = range(0, (0, 65535), "10.0.1.5", "10.0.1.5");
        assert!(match_address_range(&e, &wide) > match_address_range(&e, &narrow));

        let pinned_end = end("10.0.1.0/24", "192.0.2.1", 22, 6);
        let pinned_ts = range(6, (22, 22), "10.0.1.0", "10.0.1.255");
        let loose_ts = range(6, (0, 65535), "10.0.1.0", "10.0.1.255");
        assert_eq!(
            match_address_range(&pinned_end, &pinned_ts),
            2 * match_address_range(&pinned_end, &loose_ts)
        );
    }

    #[test]
    fn protocol_fit_scores() {
        let tcp_end = end("10.0.1.0/24", "192.0.2.1", 0, 6);
        let any_end = end("10.0.1.0/24", "192.0.2.1", 0, 0);
        let tcp_ts = range(6, (0, 65535), "10.0.1.0", "10.0.1.255");
        let any_ts = range(0, (0, 65535), "10.0.1.0", "10.0.1.255");

        assert_eq!(match_protocol(&tcp_end, &tcp_ts, Narrowing::Equals), 255);
        assert_eq!(match_protocol(&tcp_end, &any_ts, Narrowing::Equals), 0);
        assert_eq!(
            match_protocol(&tcp_end, &any_ts, Narrowing::EndNarrowerThanTs),
            1
        );
        assert_eq!(
            match_protocol(&tcp_end, &tcp_ts, Narrowing::EndNarrowerThanTs),
            255
        );
        assert_eq!(match_protocol(&any_end, &tcp_ts, Narrowing::EndWiderThanTs), 1);
    }

    #[test]
    fn port_fit_scores() {
        let any = end("10.0.1.0/24", "192.0.2.1", 0, 0);
        let ssh = end("10.0.1.0/24", "192.0.2.1", 22, 6);
        let full = range(0, (0, 65535), "10.0.1.0", "10.0.1.255");
        let single = range(6, (22, 22), "10.0.1.0", "10.0.1.255");

        assert_eq!(match_port_range(&any, &full, Narrowing::Equals), 65536);
        assert_eq!(match_port_range(&ssh, &full, Narrowing::Equals), 0);
        assert_eq!(match_port_range(&ssh, &full, Narrowing::EndNarrowerThanTs), 1);
        assert_eq!(match_port_range(&ssh, &single, Narrowing::EndNarrowerThanTs), 1);
        assert_eq!(match_port_range(&any, &single, Narrowing::EndWiderThanTs), 1);
        assert_eq!(match_port_range(&ssh, &single, Narrowing::EndWiderThanTs), 1);
    }
}

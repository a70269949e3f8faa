//! The state table: serial -> SA state, with a secondary index by IKE
//! SPI pair. Serials are handed out here and never reused.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::config::conn::ConnId;
use crate::engine::state::{SaKind, SaRole, SaState, SerialNumber, SpiPair, StateLabel};
use crate::ike::IkeVersion;

#[derive(Default)]
pub struct StateTable {
    states: HashMap<SerialNumber, SaState>,
    by_spi: HashMap<SpiPair, SerialNumber>,
    next_serial: u64,
}

impl StateTable {
    pub fn new() -> Self {
        StateTable {
            states: HashMap::new(),
            by_spi: HashMap::new(),
            next_serial: SerialNumber::FIRST.0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        kind: SaKind,
        role: SaRole,
        version: IkeVersion,
        connection: ConnId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        label: StateLabel,
    ) -> SerialNumber {
        let serial = SerialNumber(self.next_serial);
        self.next_serial += 1;
        let state = SaState::new(
            serial, kind, role, version, connection, local_addr, remote_addr, label,
        );
        tracing::debug!("created state {} ({:?}, {})", serial, kind, label.name());
        self.states.insert(serial, state);
        serial
    }

    pub fn get(&self, serial: SerialNumber) -> Option<&SaState> {
        self.states.get(&serial)
    }

    pub fn get_mut(&mut self, serial: SerialNumber) -> Option<&mut SaState> {
        self.states.get_mut(&serial)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SaState> {
        self.states.values()
    }

    pub fn serials(&self) -> Vec<SerialNumber> {
        let mut all: Vec<_> = self.states.keys().copied().collect();
        all.sort();
        all
    }

    /// Register the SPI pair of a state. At most one state may occupy a
    /// given pair; a duplicate is a protocol-level conflict and is
    /// reported, not silently overwritten.
    pub fn index_spis(&mut self, serial: SerialNumber, spis: SpiPair) -> bool {
        if let Some(existing) = self.by_spi.get(&spis) {
            if *existing != serial {
                tracing::warn!(
                    "SPI pair {:016x}/{:016x} already bound to {}",
                    spis.initiator,
                    spis.responder,
                    existing
                );
                return false;
            }
        }
        if let Some(state) = self.states.get_mut(&serial) {
            // drop a previous half-open binding (responder SPI was 0)
            self.by_spi.remove(&state.spis);
            state.spis = spis;
            self.by_spi.insert(spis, serial);
            true
        } else {
            false
        }
    }

    pub fn find_by_spis(&self, spis: SpiPair) -> Option<SerialNumber> {
        self.by_spi.get(&spis).copied()
    }

    /// Lookup for a response whose responder SPI we have not recorded
    /// yet: match on the initiator half alone.
    pub fn find_by_initiator_spi(&self, initiator: u64) -> Option<SerialNumber> {
        self.states
            .values()
            .find(|s| s.spis.initiator == initiator)
            .map(|s| s.serial)
    }

    pub fn children_of(&self, parent: SerialNumber) -> Vec<SerialNumber> {
        let mut kids: Vec<_> = self
            .states
            .values()
            .filter(|s| s.parent == parent)
            .map(|s| s.serial)
            .collect();
        kids.sort();
        kids
    }

    /// States bound to a connection, for DPD actions and teardown.
    pub fn by_connection(&self, conn: ConnId) -> Vec<SerialNumber> {
        let mut all: Vec<_> = self
            .states
            .values()
            .filter(|s| s.connection == conn)
            .map(|s| s.serial)
            .collect();
        all.sort();
        all
    }

    /// Remove a state and, for a parent, its whole family. Returns the
    /// removed states, victim first, so the caller can cancel timers,
    /// orphan crypto tasks and release operator handles.
    pub fn remove_family(&mut self, serial: SerialNumber) -> Vec<SaState> {
        let mut victims = vec![serial];
        victims.extend(self.children_of(serial));

        let mut removed = Vec::with_capacity(victims.len());
        for victim in victims {
            if let Some(state) = self.states.remove(&victim) {
                self.by_spi.remove(&state.spis);
                tracing::debug!("deleted state {} ({})", victim, state.label.name());
                removed.push(state);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn make(table: &mut StateTable, kind: SaKind, label: StateLabel) -> SerialNumber {
        table.create(
            kind,
            SaRole::Responder,
            IkeVersion::V2,
            ConnId(0),
            addr("192.0.2.1:500"),
            addr("192.0.2.2:500"),
            label,
        )
    }

    #[test]
    fn serials_are_monotonic_and_unique() {
        let mut table = StateTable::new();
        let a = make(&mut table, SaKind::IkeSa, StateLabel::ParentR1);
        let b = make(&mut table, SaKind::IkeSa, StateLabel::ParentR1);
        assert!(b > a);
        assert!(a >= SerialNumber::FIRST);

        // serials of deleted states are never reissued
        table.remove_family(b);
        let c = make(&mut table, SaKind::IkeSa, StateLabel::ParentR1);
        assert!(c > b);
    }

    #[test]
    fn spi_lookup_and_uniqueness() {
        let mut table = StateTable::new();
        let a = make(&mut table, SaKind::IkeSa, StateLabel::ParentR1);
        let b = make(&mut table, SaKind::IkeSa, StateLabel::ParentR1);

        let spis = SpiPair {
            initiator: 0x1111,
            responder: 0x2222,
        };
        assert!(table.index_spis(a, spis));
        assert_eq!(table.find_by_spis(spis), Some(a));

        // the same pair cannot be claimed by another state
        assert!(!table.index_spis(b, spis));
        assert_eq!(table.find_by_spis(spis), Some(a));

        // rebinding the same state (responder SPI learned) is fine
        let full = SpiPair {
            initiator: 0x1111,
            responder: 0x3333,
        };
        assert!(table.index_spis(a, full));
        assert_eq!(table.find_by_spis(full), Some(a));
        assert_eq!(table.find_by_spis(spis), None);
    }

    #[test]
    fn parent_deletion_cascades_to_children() {
        let mut table = StateTable::new();
        let parent = make(&mut table, SaKind::IkeSa, StateLabel::ParentR2);
        let child1 = make(&mut table, SaKind::ChildSa, StateLabel::V2IpsecR);
        let child2 = make(&mut table, SaKind::ChildSa, StateLabel::V2IpsecR);
        table.get_mut(child1).unwrap().parent = parent;
        table.get_mut(child2).unwrap().parent = parent;
        let other = make(&mut table, SaKind::IkeSa, StateLabel::ParentI1);

        let removed = table.remove_family(parent);
        let serials: Vec<_> = removed.iter().map(|s| s.serial).collect();
        assert_eq!(serials, vec![parent, child1, child2]);
        assert!(table.get(parent).is_none());
        assert!(table.get(child1).is_none());
        assert!(table.get(other).is_some());
    }

    #[test]
    fn initiator_spi_lookup_for_half_open() {
        let mut table = StateTable::new();
        let a = make(&mut table, SaKind::IkeSa, StateLabel::ParentI1);
        table.get_mut(a).unwrap().spis = SpiPair {
            initiator: 0xabcd,
            responder: 0,
        };
        assert_eq!(table.find_by_initiator_spi(0xabcd), Some(a));
        assert_eq!(table.find_by_initiator_spi(0x9999), None);
    }
}

//! The connection state table: correlates outgoing (tunnel-originated)
//! flows with their incoming replies so the outside port can decide
//! whether a frame belongs to a stolen connection.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::{classify, Direction, FlowKey};

const MAX_STATE_AGE: u64 = 180;

struct StateEntry {
    key: FlowKey,
    last_seen: u64,
}

/// Fixed-capacity, linearly-scanned table of active flows. One mutex
/// guards the whole table; it is small and bounded, so a coarse lock
/// matches the historical design without adding complexity here.
pub struct StateTable {
    entries: Vec<Option<StateEntry>>,
    live_count: usize,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl StateTable {
    pub fn new(capacity: usize) -> Self {
        Self { entries: (0..capacity).map(|_| None).collect(), live_count: 0 }
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    fn find(&self, key: &FlowKey) -> Option<usize> {
        self.entries.iter().position(|e| e.as_ref().map(|e| &e.key) == Some(key))
    }

    /// Look up a matching state for `buf` in the given direction, refreshing
    /// its timestamp if found, without creating a new entry.
    pub fn update_if_exists(&mut self, buf: &[u8], dir: Direction) -> Option<usize> {
        let key = classify(buf, dir).ok()?;
        let i = self.find(&key)?;
        self.entries[i].as_mut().unwrap().last_seen = now_secs();
        Some(i)
    }

    /// Look up or create a state for `buf` in the given direction.
    pub fn update(&mut self, buf: &[u8], dir: Direction) -> Result<usize, StateError> {
        let key = classify(buf, dir).map_err(StateError::Classify)?;
        if let Some(i) = self.find(&key) {
            self.entries[i].as_mut().unwrap().last_seen = now_secs();
            return Ok(i);
        }
        let i = self.entries.iter().position(|e| e.is_none()).ok_or(StateError::Full)?;
        self.entries[i] = Some(StateEntry { key, last_seen: now_secs() });
        self.live_count += 1;
        Ok(i)
    }

    pub fn cleanup(&mut self) {
        let now = now_secs();
        for slot in self.entries.iter_mut() {
            if let Some(e) = slot {
                if e.last_seen + MAX_STATE_AGE < now {
                    *slot = None;
                    self.live_count -= 1;
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("frame did not classify into a trackable flow: {0}")]
    Classify(crate::error::ClassifyError),
    #[error("state table full")]
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ETHERTYPE_IPV4, PROTO_TCP};

    fn eth(src: [u8; 6], dst: [u8; 6], ethertype: u16) -> Vec<u8> {
        let mut v = vec![0u8; 14];
        v[0..6].copy_from_slice(&dst);
        v[6..12].copy_from_slice(&src);
        v[12..14].copy_from_slice(&ethertype.to_be_bytes());
        v
    }

    fn tcp_frame(src_ip: [u8; 4], dst_ip: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let mut frame = eth([1; 6], [2; 6], ETHERTYPE_IPV4);
        let mut ip = vec![0u8; 24];
        ip[0] = 0x45;
        ip[9] = PROTO_TCP;
        ip[12..16].copy_from_slice(&src_ip);
        ip[16..20].copy_from_slice(&dst_ip);
        ip[20..22].copy_from_slice(&sport.to_be_bytes());
        ip[22..24].copy_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&ip);
        frame
    }

    #[test]
    fn outgoing_then_incoming_matches() {
        let mut st = StateTable::new(16);
        let out = tcp_frame([10, 0, 0, 5], [93, 184, 216, 34], 54321, 80);
        st.update(&out, Direction::Outgoing).unwrap();
        assert_eq!(st.live_count(), 1);

        let reply = tcp_frame([93, 184, 216, 34], [10, 0, 0, 5], 80, 54321);
        assert!(st.update_if_exists(&reply, Direction::Incoming).is_some());
    }

    #[test]
    fn unrelated_traffic_does_not_match() {
        let mut st = StateTable::new(16);
        let out = tcp_frame([10, 0, 0, 5], [93, 184, 216, 34], 54321, 80);
        st.update(&out, Direction::Outgoing).unwrap();

        let other = tcp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1111, 2222);
        assert!(st.update_if_exists(&other, Direction::Incoming).is_none());
    }

    #[test]
    fn cleanup_evicts_aged_entries() {
        let mut st = StateTable::new(16);
        let out = tcp_frame([10, 0, 0, 5], [93, 184, 216, 34], 54321, 80);
        st.update(&out, Direction::Outgoing).unwrap();
        st.entries[0].as_mut().unwrap().last_seen = 0;
        st.cleanup();
        assert_eq!(st.live_count(), 0);
    }
}

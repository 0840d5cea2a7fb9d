//! The pending interest table.
//!
//! Entries are keyed by the interest message with its lifetime and nonce
//! tail stripped, and addressed externally by a monotonic serial.  Each
//! entry owns a list of per-face items recording downstream (received)
//! and upstream (sent) state; all deadlines are wrapped times.

use crate::face::FaceId;
use crate::fib::NpeId;
use crate::sched::{EventHandle, WrappedTime, WTHZ};
use std::collections::{HashMap, VecDeque};

pub type Serial = u32;

/* pit face item flags */
pub const PFI_UPSTREAM: u32 = 0x0100; /* tracks an interest we sent */
pub const PFI_UPENDING: u32 = 0x0200; /* sent and not yet answered */
pub const PFI_SENDUPST: u32 = 0x0400; /* send upstream at expiry */
pub const PFI_UPHUNGRY: u32 = 0x0800; /* expired with nothing to feed it */
pub const PFI_DNSTREAM: u32 = 0x1000; /* tracks a received interest */
pub const PFI_PENDING: u32 = 0x2000; /* downstream awaiting data */
pub const PFI_SUPDATA: u32 = 0x4000; /* suppressed data reply */
pub const PFI_ATTENTION: u32 = 0x8000; /* new upstream for the strategy */
pub const PFI_DCFACE: u32 = 0x1_0000; /* direct-control grace applied */
pub const PFI_INACTIVE: u32 = 0x2_0000; /* upstream with no recent traffic */

pub const TYPICAL_NONCE_SIZE: usize = 12;

/// Nonce bytes; the common short case stays inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nonce {
    Inline([u8; TYPICAL_NONCE_SIZE], u8),
    Heap(Box<[u8]>),
}

impl Nonce {
    pub fn empty() -> Self {
        Nonce::Inline([0; TYPICAL_NONCE_SIZE], 0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() <= TYPICAL_NONCE_SIZE {
            let mut buf = [0u8; TYPICAL_NONCE_SIZE];
            buf[..bytes.len()].copy_from_slice(bytes);
            Nonce::Inline(buf, bytes.len() as u8)
        } else {
            Nonce::Heap(bytes.into())
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Nonce::Inline(buf, len) => &buf[..*len as usize],
            Nonce::Heap(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-face state within one PIT entry.
#[derive(Debug, Clone)]
pub struct PitFaceItem {
    pub faceid: FaceId,
    pub flags: u32,
    pub renewed: WrappedTime,
    pub expiry: WrappedTime,
    pub nonce: Nonce,
}

impl PitFaceItem {
    pub fn new(faceid: FaceId, flags: u32, now: WrappedTime) -> Self {
        Self {
            faceid,
            flags,
            renewed: now,
            expiry: now,
            nonce: Nonce::empty(),
        }
    }

    pub fn nonce_matches(&self, bytes: &[u8]) -> bool {
        !self.nonce.is_empty() && self.nonce.as_bytes() == bytes
    }

    pub fn is_downstream(&self) -> bool {
        (self.flags & PFI_DNSTREAM) != 0
    }

    pub fn is_upstream(&self) -> bool {
        (self.flags & PFI_UPSTREAM) != 0
    }

    /// Expiry from an interest lifetime in 1/4096 s wire units, clamped
    /// to [1/4 s, 7 days] and rounded up to 1/8 s.  Renews the item.
    pub fn set_expiry_from_lifetime(&mut self, now: WrappedTime, lifetime_units: u64) {
        let clamped = clamp_lifetime(lifetime_units);
        let ticks = (clamped * WTHZ + 4095) / 4096;
        self.renewed = now;
        self.expiry = now.plus_ticks(ticks as u32);
    }

    /// Expiry a fixed number of microseconds out; does not renew.
    pub fn set_expiry_from_micros(&mut self, now: WrappedTime, micros: u64) {
        self.expiry = now.plus_micros(micros);
    }

    /// Remaining lifetime at `now`, in wire units, for re-encoding.
    pub fn remaining_lifetime_units(&self) -> u64 {
        let ticks = self.expiry.ticks_since(self.renewed) as u64;
        round_up_lifetime(ticks * 4096 / WTHZ)
    }
}

/// Round a lifetime up to the nearest 1/8 second (512 wire units).
pub fn round_up_lifetime(units: u64) -> u64 {
    ((units + 511) >> 9) << 9
}

/// Clamp to [1/4 s, one week] and round up to 1/8 s.
pub fn clamp_lifetime(units: u64) -> u64 {
    let min = 4096 / 4;
    let max = 7 * 24 * 3600 * 4096u64;
    round_up_lifetime(units.clamp(min, max))
}

/// One pending interest.
#[derive(Debug)]
pub struct InterestEntry {
    pub serial: Serial,
    /// The canonical interest message (lifetime/nonce tail stripped and
    /// re-closed); doubles as the hash key.
    pub key: Vec<u8>,
    pub npe: NpeId,
    pub pfl: Vec<PitFaceItem>,
    /// Propagation (expiry wheel) event.
    pub ev: Option<EventHandle>,
    /// When the propagation event is due, for cheap advance checks.
    pub ev_due: WrappedTime,
    /// Strategy wakeup event.
    pub strategy_ev: Option<EventHandle>,
    pub birth: WrappedTime,
    pub renewed: WrappedTime,
    pub renewals: u32,
}

impl InterestEntry {
    pub fn pfi(&self, faceid: FaceId, dirflag: u32) -> Option<&PitFaceItem> {
        self.pfl
            .iter()
            .find(|p| p.faceid == faceid && (p.flags & dirflag) != 0)
    }

    pub fn pfi_mut(&mut self, faceid: FaceId, dirflag: u32) -> Option<&mut PitFaceItem> {
        self.pfl
            .iter_mut()
            .find(|p| p.faceid == faceid && (p.flags & dirflag) != 0)
    }

    /// Find or append the item for (faceid, direction); returns its index.
    pub fn seek_pfi(&mut self, faceid: FaceId, dirflag: u32, now: WrappedTime) -> usize {
        if let Some(i) = self
            .pfl
            .iter()
            .position(|p| p.faceid == faceid && (p.flags & dirflag) != 0)
        {
            return i;
        }
        self.pfl.push(PitFaceItem::new(faceid, dirflag, now));
        self.pfl.len() - 1
    }

    /// True iff item `idx`'s nonce occurs in no other item of the entry.
    pub fn nonce_unique(&self, idx: usize) -> bool {
        let p = &self.pfl[idx];
        if p.nonce.is_empty() {
            return true;
        }
        !self
            .pfl
            .iter()
            .enumerate()
            .any(|(i, q)| i != idx && q.nonce_matches(p.nonce.as_bytes()))
    }

    pub fn downstreams(&self) -> impl Iterator<Item = &PitFaceItem> {
        self.pfl.iter().filter(|p| p.is_downstream())
    }

    pub fn upstreams(&self) -> impl Iterator<Item = &PitFaceItem> {
        self.pfl.iter().filter(|p| p.is_upstream())
    }

    /// Count of downstreams still marked pending.
    pub fn pending_count(&self) -> usize {
        self.pfl
            .iter()
            .filter(|p| p.is_downstream() && (p.flags & PFI_PENDING) != 0)
            .count()
    }
}

/// The PIT: key index plus serial-addressed entries.
#[derive(Debug, Default)]
pub struct Pit {
    by_key: HashMap<Vec<u8>, Serial>,
    entries: HashMap<Serial, InterestEntry>,
    iserial: Serial,
}

impl Pit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, key: &[u8]) -> Option<Serial> {
        self.by_key.get(key).copied()
    }

    pub fn get(&self, serial: Serial) -> Option<&InterestEntry> {
        self.entries.get(&serial)
    }

    pub fn get_mut(&mut self, serial: Serial) -> Option<&mut InterestEntry> {
        self.entries.get_mut(&serial)
    }

    pub fn serials(&self) -> Vec<Serial> {
        self.entries.keys().copied().collect()
    }

    /// Find or create the entry for `key`; true when newly created.
    pub fn seek(&mut self, key: &[u8], npe: NpeId, now: WrappedTime) -> (Serial, bool) {
        if let Some(&serial) = self.by_key.get(key) {
            return (serial, false);
        }
        self.iserial = self.iserial.wrapping_add(1);
        let serial = self.iserial;
        self.by_key.insert(key.to_vec(), serial);
        self.entries.insert(
            serial,
            InterestEntry {
                serial,
                key: key.to_vec(),
                npe,
                pfl: Vec::new(),
                ev: None,
                ev_due: now,
                strategy_ev: None,
                birth: now,
                renewed: now,
                renewals: 0,
            },
        );
        (serial, true)
    }

    /// Remove the entry; the caller unwinds face counts, events, and the
    /// npe link from the returned value.
    pub fn remove(&mut self, serial: Serial) -> Option<InterestEntry> {
        let entry = self.entries.remove(&serial)?;
        self.by_key.remove(&entry.key);
        Some(entry)
    }
}

/* ---------------------------------------------------------------- *
 * Nonce table
 * ---------------------------------------------------------------- */

/// Outcome of recording a nonce sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceSighting {
    Fresh,
    SeenFromSelf,
    SeenFromOther,
}

#[derive(Debug)]
struct NonceEntry {
    faceid: FaceId,
    expiry: WrappedTime,
}

/// Recently seen interest nonces, for loop suppression.
#[derive(Debug, Default)]
pub struct NonceTable {
    map: HashMap<Box<[u8]>, NonceEntry>,
    /// Expiry-ordered queue of keys for the reaper.
    queue: VecDeque<(Box<[u8]>, WrappedTime)>,
}

impl NonceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Record a sighting of `nonce` from `faceid`.
    pub fn record(
        &mut self,
        nonce: &[u8],
        faceid: FaceId,
        now: WrappedTime,
        retain_ticks: u32,
    ) -> NonceSighting {
        if nonce.is_empty() {
            return NonceSighting::Fresh;
        }
        let expiry = now.plus_ticks(retain_ticks);
        if let Some(e) = self.map.get_mut(nonce) {
            if now.is_before(e.expiry) {
                return if e.faceid == faceid {
                    NonceSighting::SeenFromSelf
                } else {
                    NonceSighting::SeenFromOther
                };
            }
            e.faceid = faceid;
            e.expiry = expiry;
            self.queue.push_back((nonce.into(), expiry));
            return NonceSighting::Fresh;
        }
        self.map.insert(nonce.into(), NonceEntry { faceid, expiry });
        self.queue.push_back((nonce.into(), expiry));
        NonceSighting::Fresh
    }

    /// Drop entries whose retention has passed.
    pub fn prune(&mut self, now: WrappedTime) {
        while let Some((key, expiry)) = self.queue.front() {
            if now.is_before(*expiry) {
                break;
            }
            // only drop the map entry if it was not re-recorded later
            if let Some(e) = self.map.get(key.as_ref()) {
                if e.expiry.is_at_or_before(now) {
                    self.map.remove(key.as_ref());
                }
            }
            let _ = expiry;
            self.queue.pop_front();
        }
    }
}

/// Default nonce retention, in ticks (six seconds).
pub fn default_nonce_retention() -> u32 {
    (6 * WTHZ) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> WrappedTime {
        WrappedTime(1000)
    }

    #[test]
    fn seek_coalesces_same_key() {
        let mut pit = Pit::new();
        let (a, created) = pit.seek(b"interest-key", 3, now());
        assert!(created);
        let (b, created) = pit.seek(b"interest-key", 3, now());
        assert!(!created);
        assert_eq!(a, b);
        assert_eq!(pit.len(), 1);
    }

    #[test]
    fn remove_clears_key_index() {
        let mut pit = Pit::new();
        let (a, _) = pit.seek(b"k", 0, now());
        pit.remove(a).unwrap();
        assert_eq!(pit.lookup(b"k"), None);
        let (b, created) = pit.seek(b"k", 0, now());
        assert!(created);
        assert_ne!(a, b);
    }

    #[test]
    fn pfi_direction_seek_keeps_one_each() {
        let mut pit = Pit::new();
        let (s, _) = pit.seek(b"k", 0, now());
        let e = pit.get_mut(s).unwrap();
        let d = e.seek_pfi(5, PFI_DNSTREAM, now());
        let u = e.seek_pfi(5, PFI_UPSTREAM, now());
        assert_ne!(d, u);
        assert_eq!(e.seek_pfi(5, PFI_DNSTREAM, now()), d);
        assert_eq!(e.pfl.len(), 2);
    }

    #[test]
    fn nonce_uniqueness_across_entry_items() {
        let mut pit = Pit::new();
        let (s, _) = pit.seek(b"k", 0, now());
        let e = pit.get_mut(s).unwrap();
        let a = e.seek_pfi(5, PFI_DNSTREAM, now());
        e.pfl[a].nonce = Nonce::from_bytes(&[1; 12]);
        let b = e.seek_pfi(6, PFI_DNSTREAM, now());
        e.pfl[b].nonce = Nonce::from_bytes(&[1; 12]);
        assert!(!e.nonce_unique(b));
        e.pfl[b].nonce = Nonce::from_bytes(&[2; 12]);
        assert!(e.nonce_unique(b));
    }

    #[test]
    fn long_nonces_go_to_the_heap() {
        let long = vec![7u8; 40];
        let n = Nonce::from_bytes(&long);
        assert!(matches!(n, Nonce::Heap(_)));
        assert_eq!(n.as_bytes(), &long[..]);
        let short = Nonce::from_bytes(&[1, 2, 3]);
        assert!(matches!(short, Nonce::Inline(_, 3)));
        assert_eq!(short.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn lifetime_clamping() {
        // below the quarter-second floor
        assert_eq!(clamp_lifetime(1), 1024);
        // rounds up to 1/8 s
        assert_eq!(clamp_lifetime(4097), 4608);
        // a week at most
        assert_eq!(clamp_lifetime(u64::MAX), 7 * 24 * 3600 * 4096);
    }

    #[test]
    fn expiry_from_lifetime_renews() {
        let mut p = PitFaceItem::new(1, PFI_DNSTREAM, WrappedTime(100));
        p.set_expiry_from_lifetime(WrappedTime(200), 4096);
        assert_eq!(p.renewed, WrappedTime(200));
        assert_eq!(p.expiry, WrappedTime(200).plus_ticks(WTHZ as u32));
        // and the remaining lifetime round-trips
        assert_eq!(p.remaining_lifetime_units(), 4096);
    }

    #[test]
    fn nonce_table_detects_duplicates() {
        let mut t = NonceTable::new();
        let n = [9u8; 12];
        assert_eq!(t.record(&n, 5, now(), 100), NonceSighting::Fresh);
        assert_eq!(t.record(&n, 5, now(), 100), NonceSighting::SeenFromSelf);
        assert_eq!(t.record(&n, 6, now(), 100), NonceSighting::SeenFromOther);
    }

    #[test]
    fn nonce_table_prunes_by_time() {
        let mut t = NonceTable::new();
        let n = [9u8; 12];
        t.record(&n, 5, WrappedTime(0), 100);
        t.prune(WrappedTime(50));
        assert_eq!(t.len(), 1);
        t.prune(WrappedTime(100));
        assert_eq!(t.len(), 0);
        assert_eq!(t.record(&n, 6, WrappedTime(101), 100), NonceSighting::Fresh);
    }
}

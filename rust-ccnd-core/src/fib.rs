//! The name prefix table (FIB).
//!
//! Entries are keyed by flatname prefixes and arranged in a tree through
//! parent ids.  Each entry carries its forwarding list, the cached
//! forward-to/tap sets derived from the ancestor chain, the per-prefix
//! strategy state cells, and the list of PIT entries hanging off the
//! prefix.

use crate::face::{FaceId, NOFACEID};
use crate::strategy::StrategyInstance;
use log::debug;
use rust_ccnd_common::name::flatname_ncomps;
use std::collections::HashMap;

/* forwarding flags */
pub const FORW_ACTIVE: u32 = 1;
pub const FORW_CHILD_INHERIT: u32 = 2;
pub const FORW_ADVERTISE: u32 = 4;
pub const FORW_LAST: u32 = 8;
pub const FORW_CAPTURE: u32 = 16;
pub const FORW_LOCAL: u32 = 32;
pub const FORW_TAP: u32 = 64;
pub const FORW_CAPTURE_OK: u32 = 128;
pub const FORW_PUBMASK: u32 = 255;
/// Private: entry has been refreshed since the last aging pass.
pub const FORW_REFRESHED: u32 = 1 << 16;

/// Seconds between forwarding-entry aging passes.
pub const FWU_SECS: i32 = 5;

/* per-prefix strategy state cells */
pub const CCN_UNINIT: u32 = !0;
pub const CCN_MAGIC_MASK: u32 = 0x00FF_FFFF;
pub const CCN_AGED: u32 = 0x1000_0000;
pub const STRATEGY_STATE_N: usize = 4;
pub type NameprefixState = [u32; STRATEGY_STATE_N];

pub type NpeId = u32;

/// One face an interest under this prefix may be forwarded to.
#[derive(Debug, Clone)]
pub struct Forwarding {
    pub faceid: FaceId,
    pub flags: u32,
    /// Seconds remaining.
    pub expires: i32,
}

/// A node of the name prefix tree.
#[derive(Debug)]
pub struct NameprefixEntry {
    pub flatname: Vec<u8>,
    pub parent: Option<NpeId>,
    pub children: u32,
    pub forwarding: Vec<Forwarding>,
    /// Cached effective forwarding set, valid while `fgen` is current.
    pub forward_to: Vec<FaceId>,
    pub tap: Vec<FaceId>,
    /// Aggregated CCN_FORW_* flags seen along the chain.
    pub nsflags: u32,
    pub fgen: u32,
    /// Strategy state cells for this prefix.
    pub sst: NameprefixState,
    /// Explicit strategy instance, when one was set on this prefix.
    pub si: Option<Box<StrategyInstance>>,
    /// Serials of the PIT entries linked here, in insertion order.
    pub pit_serials: Vec<u32>,
}

impl NameprefixEntry {
    fn new(flatname: Vec<u8>, parent: Option<NpeId>, fgen: u32) -> Self {
        Self {
            flatname,
            parent,
            children: 0,
            forwarding: Vec::new(),
            forward_to: Vec::new(),
            tap: Vec::new(),
            nsflags: 0,
            fgen: fgen.wrapping_sub(1),
            sst: [CCN_UNINIT; STRATEGY_STATE_N],
            si: None,
            pit_serials: Vec::new(),
        }
    }
}

/// The FIB proper.
#[derive(Debug, Default)]
pub struct Fib {
    arena: Vec<Option<NameprefixEntry>>,
    free: Vec<NpeId>,
    by_name: HashMap<Vec<u8>, NpeId>,
    /// Generation counter; cached forward-to sets go stale when bumped.
    pub fgen: u32,
}

impl Fib {
    pub fn new() -> Self {
        Self {
            fgen: 1,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn get(&self, id: NpeId) -> Option<&NameprefixEntry> {
        self.arena.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: NpeId) -> Option<&mut NameprefixEntry> {
        self.arena.get_mut(id as usize)?.as_mut()
    }

    pub fn lookup(&self, flatname: &[u8]) -> Option<NpeId> {
        self.by_name.get(flatname).copied()
    }

    pub fn ids(&self) -> Vec<NpeId> {
        (0..self.arena.len() as u32)
            .filter(|&i| self.arena[i as usize].is_some())
            .collect()
    }

    /// Find the deepest existing entry that is a prefix of `flatname`.
    pub fn longest_match(&self, flatname: &[u8]) -> Option<NpeId> {
        let mut best = None;
        let mut pos = 0usize;
        loop {
            if let Some(&id) = self.by_name.get(&flatname[..pos]) {
                best = Some(id);
            }
            if pos + 2 > flatname.len() {
                break;
            }
            let len = u16::from_be_bytes([flatname[pos], flatname[pos + 1]]) as usize;
            pos += 2 + len;
            if pos > flatname.len() {
                break;
            }
        }
        best
    }

    fn alloc(&mut self, entry: NameprefixEntry) -> NpeId {
        if let Some(id) = self.free.pop() {
            self.arena[id as usize] = Some(entry);
            id
        } else {
            self.arena.push(Some(entry));
            (self.arena.len() - 1) as NpeId
        }
    }

    /// Find or create the entry for `flatname`, materializing every
    /// ancestor.  New entries inherit the parent's strategy state cells.
    pub fn seek(&mut self, flatname: &[u8]) -> NpeId {
        let mut parent: Option<NpeId> = None;
        let mut pos = 0usize;
        let mut id = self.seek_one(&flatname[..0], &mut parent);
        while pos < flatname.len() {
            let len = u16::from_be_bytes([flatname[pos], flatname[pos + 1]]) as usize;
            pos += 2 + len;
            debug_assert!(pos <= flatname.len());
            id = self.seek_one(&flatname[..pos], &mut parent);
        }
        id
    }

    fn seek_one(&mut self, prefix: &[u8], parent: &mut Option<NpeId>) -> NpeId {
        if let Some(&id) = self.by_name.get(prefix) {
            *parent = Some(id);
            return id;
        }
        let mut entry = NameprefixEntry::new(prefix.to_vec(), *parent, self.fgen);
        if let Some(pid) = *parent {
            let psst = self.get(pid).map(|p| p.sst);
            if let Some(psst) = psst {
                entry.sst = psst;
            }
            if let Some(p) = self.get_mut(pid) {
                p.children += 1;
            }
        }
        let id = self.alloc(entry);
        self.by_name.insert(prefix.to_vec(), id);
        *parent = Some(id);
        id
    }

    /// Remove one entry.  The caller must have verified it is childless
    /// and idle; the parent's child count is maintained here.
    pub fn remove(&mut self, id: NpeId) -> Option<NameprefixEntry> {
        let entry = self.arena.get_mut(id as usize)?.take()?;
        self.by_name.remove(&entry.flatname);
        if let Some(pid) = entry.parent {
            if let Some(p) = self.get_mut(pid) {
                p.children = p.children.saturating_sub(1);
            }
        }
        self.free.push(id);
        Some(entry)
    }

    /// Find or create the forwarding for (entry, faceid).
    pub fn seek_forwarding(&mut self, id: NpeId, faceid: FaceId) -> &mut Forwarding {
        let pos = self
            .get(id)
            .and_then(|e| e.forwarding.iter().position(|f| f.faceid == faceid));
        let entry = self.get_mut(id).expect("live npe");
        match pos {
            Some(i) => &mut entry.forwarding[i],
            None => {
                entry.forwarding.push(Forwarding {
                    faceid,
                    flags: FORW_CHILD_INHERIT | FORW_ACTIVE,
                    expires: 0x7FFF_FFFF,
                });
                entry.forwarding.last_mut().expect("just pushed")
            }
        }
    }

    /// Register or refresh a forwarding.  `flags < 0` keeps the current
    /// public flags.  Returns the effective flags, with FORW_REFRESHED
    /// set when an existing registration was refreshed.
    pub fn reg_prefix(
        &mut self,
        flatname: &[u8],
        faceid: FaceId,
        flags: i32,
        expires: i32,
    ) -> Result<u32, ()> {
        if flags >= 0 && (flags as u32 & FORW_PUBMASK) != flags as u32 {
            return Err(());
        }
        let id = self.seek(flatname);
        let existed = self
            .get(id)
            .map(|e| e.forwarding.iter().any(|f| f.faceid == faceid))
            .unwrap_or(false);
        let f = self.seek_forwarding(id, faceid);
        f.expires = expires;
        let public = if flags < 0 {
            f.flags & FORW_PUBMASK
        } else {
            flags as u32
        };
        f.flags = FORW_REFRESHED | public;
        self.fgen = self.fgen.wrapping_add(1);
        let mut res = public;
        if existed {
            res |= FORW_REFRESHED;
        }
        debug!(
            "fib: reg {} comps face {} flags {:#x} expires {}",
            flatname_ncomps(flatname),
            faceid,
            public,
            expires
        );
        Ok(res)
    }

    /// Drop the forwarding for (prefix, faceid), if present.
    pub fn unreg_prefix(&mut self, flatname: &[u8], faceid: FaceId) -> bool {
        let Some(id) = self.lookup(flatname) else {
            return false;
        };
        let Some(entry) = self.get_mut(id) else {
            return false;
        };
        let before = entry.forwarding.len();
        entry.forwarding.retain(|f| f.faceid != faceid);
        if entry.forwarding.len() != before {
            self.fgen = self.fgen.wrapping_add(1);
            true
        } else {
            false
        }
    }

    /// Recompute the cached forward-to set for `id` from its ancestors.
    ///
    /// `alive` reports face liveness.
    pub fn update_forward_to<F>(&mut self, id: NpeId, alive: F)
    where
        F: Fn(FaceId) -> bool,
    {
        let mut x: Vec<FaceId> = Vec::new();
        let mut tap: Vec<FaceId> = Vec::new();
        let mut wantflags = FORW_ACTIVE;
        let mut lastfaceid = NOFACEID;
        let mut namespace_flags = 0u32;
        let mut cursor = Some(id);
        while let Some(cid) = cursor {
            let entry = match self.get(cid) {
                Some(e) => e,
                None => break,
            };
            let mut moreflags = FORW_CHILD_INHERIT;
            for f in &entry.forwarding {
                if !alive(f.faceid) {
                    continue;
                }
                /* the sense of CAPTURE_OK is inverted for this test */
                let tflags = f.flags ^ FORW_CAPTURE_OK;
                if (tflags & wantflags) == wantflags {
                    if !x.contains(&f.faceid) {
                        x.push(f.faceid);
                    }
                    if (f.flags & FORW_TAP) != 0 && !tap.contains(&f.faceid) {
                        tap.push(f.faceid);
                    }
                    if (f.flags & FORW_LAST) != 0 {
                        lastfaceid = f.faceid;
                    }
                }
                namespace_flags |= f.flags;
                if (f.flags & FORW_CAPTURE) != 0 {
                    moreflags |= FORW_CAPTURE_OK;
                }
            }
            wantflags |= moreflags;
            cursor = entry.parent;
        }
        if lastfaceid != NOFACEID {
            if let Some(i) = x.iter().position(|&f| f == lastfaceid) {
                let f = x.remove(i);
                x.push(f);
            }
        }
        let fgen = self.fgen;
        if let Some(entry) = self.get_mut(id) {
            entry.forward_to = x;
            entry.tap = tap;
            entry.nsflags = namespace_flags;
            entry.fgen = fgen;
        }
    }

    /// The cached set, refreshed if the generation moved on.
    pub fn forward_to<F>(&mut self, id: NpeId, alive: F) -> Vec<FaceId>
    where
        F: Fn(FaceId) -> bool,
    {
        let stale = self.get(id).map(|e| e.fgen != self.fgen).unwrap_or(false);
        if stale {
            self.update_forward_to(id, alive);
        }
        self.get(id).map(|e| e.forward_to.clone()).unwrap_or_default()
    }

    /// Walk up from `id` to the nearest entry that has forwardings.
    pub fn nearest_forwarding_npe(&self, id: NpeId) -> NpeId {
        let mut cur = id;
        loop {
            let Some(entry) = self.get(cur) else {
                return cur;
            };
            if !entry.forwarding.is_empty() || entry.parent.is_none() {
                return cur;
            }
            cur = entry.parent.expect("checked");
        }
    }

    /// One 5-second aging pass: drop unrefreshed or dead-face entries,
    /// decrement lifetimes, clear the refresh bit on expiry.
    pub fn age_forwarding<F>(&mut self, alive: F)
    where
        F: Fn(FaceId) -> bool,
    {
        for slot in self.arena.iter_mut() {
            let Some(entry) = slot.as_mut() else { continue };
            entry.forwarding.retain(|f| {
                (f.flags & FORW_REFRESHED) != 0 && alive(f.faceid)
            });
            for f in entry.forwarding.iter_mut() {
                f.expires -= FWU_SECS;
                if f.expires <= 0 {
                    f.flags &= !FORW_REFRESHED;
                }
            }
        }
        self.fgen = self.fgen.wrapping_add(1);
    }

    /// Reaper pass: retire idle leaves and scrub dead faces out of the
    /// cached sets.  Returns the retired count.
    pub fn check_entries<F>(&mut self, alive: F) -> usize
    where
        F: Fn(FaceId) -> bool,
    {
        let mut removed = 0;
        for id in self.ids() {
            let retire = {
                let Some(e) = self.get(id) else { continue };
                e.children == 0
                    && e.forwarding.is_empty()
                    && e.pit_serials.is_empty()
                    && (e.sst[0] == CCN_UNINIT || (e.sst[0] & CCN_AGED) != 0)
                    && e.si.is_none()
            };
            if retire {
                self.remove(id);
                removed += 1;
                continue;
            }
            if let Some(e) = self.get_mut(id) {
                e.forward_to.retain(|&f| alive(f));
                e.tap.retain(|&f| alive(f));
                if e.sst[0] != CCN_UNINIT {
                    e.sst[0] |= CCN_AGED;
                }
            }
        }
        removed
    }

    /// Ancestor chain starting at `id` (inclusive).
    pub fn chain(&self, id: NpeId) -> Vec<NpeId> {
        let mut out = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            out.push(c);
            cur = self.get(c).and_then(|e| e.parent);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_ccnd_common::name::Name;

    fn flat(uri: &str) -> Vec<u8> {
        Name::from_uri(uri).unwrap().flat().to_vec()
    }

    fn all_alive(_f: FaceId) -> bool {
        true
    }

    #[test]
    fn seek_materializes_ancestors() {
        let mut fib = Fib::new();
        let id = fib.seek(&flat("ccnx:/a/b/c"));
        let chain = fib.chain(id);
        // /a/b/c, /a/b, /a, and the root
        assert_eq!(chain.len(), 4);
        assert_eq!(fib.get(chain[3]).unwrap().children, 1);
        // second seek finds the same entry
        assert_eq!(fib.seek(&flat("ccnx:/a/b/c")), id);
        assert_eq!(fib.len(), 4);
    }

    #[test]
    fn child_inherit_descends() {
        let mut fib = Fib::new();
        fib.reg_prefix(&flat("ccnx:/x"), 6, (FORW_ACTIVE | FORW_CHILD_INHERIT) as i32, 100)
            .unwrap();
        let deep = fib.seek(&flat("ccnx:/x/y/z"));
        let ft = fib.forward_to(deep, all_alive);
        assert_eq!(ft, vec![6]);
    }

    #[test]
    fn non_inherit_does_not_descend() {
        let mut fib = Fib::new();
        fib.reg_prefix(&flat("ccnx:/x"), 6, FORW_ACTIVE as i32, 100).unwrap();
        let deep = fib.seek(&flat("ccnx:/x/y"));
        assert!(fib.forward_to(deep, all_alive).is_empty());
        let exact = fib.lookup(&flat("ccnx:/x")).unwrap();
        assert_eq!(fib.forward_to(exact, all_alive), vec![6]);
    }

    #[test]
    fn capture_blocks_capture_ok_ancestors() {
        let mut fib = Fib::new();
        // the broad catch-all carries CAPTURE_OK, i.e. captures apply
        fib.reg_prefix(
            &flat("ccnx:/x"),
            6,
            (FORW_ACTIVE | FORW_CHILD_INHERIT | FORW_CAPTURE_OK) as i32,
            100,
        )
        .unwrap();
        fib.reg_prefix(
            &flat("ccnx:/x/y"),
            7,
            (FORW_ACTIVE | FORW_CHILD_INHERIT | FORW_CAPTURE) as i32,
            100,
        )
        .unwrap();
        let deep = fib.seek(&flat("ccnx:/x/y/z"));
        let ft = fib.forward_to(deep, all_alive);
        assert_eq!(ft, vec![7]);
        // without the capture the catch-all is in play
        let above = fib.seek(&flat("ccnx:/x/other"));
        assert_eq!(fib.forward_to(above, all_alive), vec![6]);
        // an ancestor without CAPTURE_OK is indifferent to the capture
        fib.reg_prefix(
            &flat("ccnx:/x"),
            8,
            (FORW_ACTIVE | FORW_CHILD_INHERIT) as i32,
            100,
        )
        .unwrap();
        let mut ft = fib.forward_to(deep, all_alive);
        ft.sort_unstable();
        assert_eq!(ft, vec![7, 8]);
    }

    #[test]
    fn tap_collects_separately() {
        let mut fib = Fib::new();
        fib.reg_prefix(
            &flat("ccnx:/t"),
            5,
            (FORW_ACTIVE | FORW_CHILD_INHERIT | FORW_TAP) as i32,
            100,
        )
        .unwrap();
        fib.reg_prefix(&flat("ccnx:/t"), 6, (FORW_ACTIVE | FORW_CHILD_INHERIT) as i32, 100)
            .unwrap();
        let id = fib.seek(&flat("ccnx:/t/u"));
        let _ = fib.forward_to(id, all_alive);
        let e = fib.get(id).unwrap();
        assert_eq!(e.tap, vec![5]);
        assert!(e.forward_to.contains(&5) && e.forward_to.contains(&6));
    }

    #[test]
    fn last_moves_to_tail() {
        let mut fib = Fib::new();
        fib.reg_prefix(
            &flat("ccnx:/l"),
            5,
            (FORW_ACTIVE | FORW_CHILD_INHERIT | FORW_LAST) as i32,
            100,
        )
        .unwrap();
        fib.reg_prefix(&flat("ccnx:/l"), 6, (FORW_ACTIVE | FORW_CHILD_INHERIT) as i32, 100)
            .unwrap();
        let id = fib.lookup(&flat("ccnx:/l")).unwrap();
        let ft = fib.forward_to(id, all_alive);
        assert_eq!(*ft.last().unwrap(), 5);
    }

    #[test]
    fn register_then_unregister_restores_state() {
        let mut fib = Fib::new();
        let before = fib.len();
        fib.reg_prefix(&flat("ccnx:/r"), 9, (FORW_ACTIVE | FORW_CHILD_INHERIT) as i32, 30)
            .unwrap();
        assert!(fib.unreg_prefix(&flat("ccnx:/r"), 9));
        // aging retires the empty entry once its state goes stale
        fib.check_entries(all_alive);
        fib.check_entries(all_alive);
        assert_eq!(fib.len(), before);
        let id = fib.lookup(&flat("ccnx:/r"));
        assert!(id.is_none());
    }

    #[test]
    fn aging_drops_unrefreshed_entries() {
        let mut fib = Fib::new();
        fib.reg_prefix(&flat("ccnx:/a"), 4, FORW_ACTIVE as i32, 4).unwrap();
        let id = fib.lookup(&flat("ccnx:/a")).unwrap();
        // first pass: expires goes to -1 and the refresh bit drops
        fib.age_forwarding(all_alive);
        assert_eq!(fib.get(id).unwrap().forwarding.len(), 1);
        // second pass: unrefreshed entry is removed
        fib.age_forwarding(all_alive);
        assert!(fib.get(id).unwrap().forwarding.is_empty());
    }

    #[test]
    fn refresh_keeps_entry_alive() {
        let mut fib = Fib::new();
        fib.reg_prefix(&flat("ccnx:/a"), 4, FORW_ACTIVE as i32, 4).unwrap();
        let id = fib.lookup(&flat("ccnx:/a")).unwrap();
        fib.age_forwarding(all_alive);
        let res = fib
            .reg_prefix(&flat("ccnx:/a"), 4, FORW_ACTIVE as i32, 4)
            .unwrap();
        assert!(res & FORW_REFRESHED != 0);
        fib.age_forwarding(all_alive);
        assert_eq!(fib.get(id).unwrap().forwarding.len(), 1);
    }

    #[test]
    fn longest_match_walks_down() {
        let mut fib = Fib::new();
        fib.seek(&flat("ccnx:/a"));
        fib.seek(&flat("ccnx:/a/b"));
        let m = fib.longest_match(&flat("ccnx:/a/b/c/d")).unwrap();
        assert_eq!(fib.get(m).unwrap().flatname, flat("ccnx:/a/b"));
    }

    #[test]
    fn children_inherit_strategy_cells() {
        let mut fib = Fib::new();
        let pid = fib.seek(&flat("ccnx:/p"));
        fib.get_mut(pid).unwrap().sst = [42, 1, 2, 3];
        let cid = fib.seek(&flat("ccnx:/p/q"));
        assert_eq!(fib.get(cid).unwrap().sst, [42, 1, 2, 3]);
    }
}

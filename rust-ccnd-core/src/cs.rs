//! The content store.
//!
//! ContentObjects are indexed two ways: a skiplist ordered by the
//! digest-extended name for interest matching, and a direct accession
//! ring (with a straggler side table for swept survivors) for O(1)
//! lookup by accession.  Capacity enforcement marks and sweeps stale
//! entries rather than rejecting arrivals.

use crate::face::FaceId;
use log::{debug, warn};
use rand::rngs::SmallRng;
use rand::RngCore;
use rust_ccnd_common::name::{compare_flatnames, flatname_from_components};
use rust_ccnd_common::packet::{
    self, content_matches_interest, component_body, ParsedContentObject, ParsedInterest,
};
use std::collections::{HashMap, VecDeque};

/* content entry flags */
pub const CONTENT_STALE: u32 = 1;
pub const CONTENT_PRECIOUS: u32 = 2;
pub const CONTENT_SLOWSEND: u32 = 4;

const SKIPLIST_MAX_DEPTH: usize = 30;

/// A stored, digest-extended ContentObject.
#[derive(Debug)]
pub struct ContentEntry {
    pub accession: u64,
    pub msg: Vec<u8>,
    pub pco: ParsedContentObject,
    /// Name including the digest component, flatname form.
    pub flatname: Vec<u8>,
    pub arrival_faceid: FaceId,
    pub flags: u32,
    skiplinks: Vec<u64>,
}

impl ContentEntry {
    pub fn size(&self) -> usize {
        self.msg.len()
    }

    pub fn ncomps(&self) -> usize {
        self.pco.ncomps()
    }

    pub fn is_stale(&self) -> bool {
        (self.flags & CONTENT_STALE) != 0
    }

    /// The wire form with the digest component excised, in two pieces.
    pub fn wire_parts(&self) -> (&[u8], &[u8]) {
        let n = self.pco.ncomps();
        let a = self.pco.comps[n - 1];
        let b = self.pco.comps[n];
        (&self.msg[..a], &self.msg[b..])
    }
}

/// Result of offering a ContentObject to the store.
#[derive(Debug, PartialEq, Eq)]
pub enum CsInsertOutcome {
    /// Newly stored under this accession.
    New(u64),
    /// Byte-identical duplicate of a live entry.
    Duplicate(u64),
    /// Duplicate of a stale entry; freshness should be re-armed.
    Refreshed(u64),
    /// Same digest-extended name, different bytes: both discarded.
    Collision,
}

/// Pointer into the skiplist: either the head links or an entry's links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pred {
    Head,
    At(u64),
}

#[derive(Debug)]
pub struct ContentStore {
    /// Accession of ring slot 0.
    base: u64,
    ring: VecDeque<Option<ContentEntry>>,
    stragglers: HashMap<u64, ContentEntry>,
    by_name: HashMap<Vec<u8>, u64>,
    head_links: Vec<u64>,
    /// Last minted accession.
    accession: u64,
    live: usize,
    pub capacity: usize,
    pub n_stale: usize,
    min_stale: u64,
    max_stale: u64,
    /// Accessions that arrived with no interested party.
    pub unsol: Vec<u64>,
}

impl ContentStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            base: 1,
            ring: VecDeque::new(),
            stragglers: HashMap::new(),
            by_name: HashMap::new(),
            head_links: Vec::new(),
            accession: 0,
            live: 0,
            capacity,
            n_stale: 0,
            min_stale: u64::MAX,
            max_stale: 0,
            unsol: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn last_accession(&self) -> u64 {
        self.accession
    }

    pub fn base_accession(&self) -> u64 {
        self.base
    }

    pub fn stale_bounds(&self) -> Option<(u64, u64)> {
        if self.min_stale <= self.max_stale {
            Some((self.min_stale, self.max_stale))
        } else {
            None
        }
    }

    /// Over the eviction threshold (capacity plus one eighth)?
    pub fn needs_cleaning(&self) -> bool {
        self.live > self.capacity + (self.capacity >> 3)
    }

    pub fn get(&self, accession: u64) -> Option<&ContentEntry> {
        if accession >= self.base {
            self.ring
                .get((accession - self.base) as usize)?
                .as_ref()
        } else {
            self.stragglers.get(&accession)
        }
    }

    pub fn get_mut(&mut self, accession: u64) -> Option<&mut ContentEntry> {
        if accession >= self.base {
            self.ring
                .get_mut((accession - self.base) as usize)?
                .as_mut()
        } else {
            self.stragglers.get_mut(&accession)
        }
    }

    fn links(&self, p: Pred) -> &Vec<u64> {
        match p {
            Pred::Head => &self.head_links,
            Pred::At(a) => &self.get(a).expect("live skiplist node").skiplinks,
        }
    }

    fn links_mut(&mut self, p: Pred) -> &mut Vec<u64> {
        match p {
            Pred::Head => &mut self.head_links,
            Pred::At(a) => &mut self.get_mut(a).expect("live skiplist node").skiplinks,
        }
    }

    /// Per-level predecessors for `key`.  With `wanted_old`, stop at that
    /// exact entry so its links can be unstitched.
    fn skiplist_findbefore(&self, key: &[u8], wanted_old: Option<u64>) -> Vec<Pred> {
        let n = self.head_links.len();
        let mut preds = vec![Pred::Head; n];
        let mut c = Pred::Head;
        for i in (0..n).rev() {
            loop {
                let next = self.links(c).get(i).copied().unwrap_or(0);
                if next == 0 {
                    break;
                }
                let content = self.get(next).expect("skiplist member");
                let order = compare_flatnames(&content.flatname, key);
                if order == std::cmp::Ordering::Greater {
                    break;
                }
                if order == std::cmp::Ordering::Equal
                    && (wanted_old == Some(next) || wanted_old.is_none())
                {
                    break;
                }
                c = Pred::At(next);
            }
            preds[i] = c;
        }
        preds
    }

    fn skiplist_insert(&mut self, accession: u64, rng: &mut SmallRng) {
        let mut d = 1;
        while d < SKIPLIST_MAX_DEPTH - 1 && (rng.next_u32() & 3) == 0 {
            d += 1;
        }
        while self.head_links.len() < d {
            self.head_links.push(0);
        }
        let key = self.get(accession).expect("inserting live entry").flatname.clone();
        let preds = self.skiplist_findbefore(&key, None);
        let d = d.min(preds.len());
        let mut links = Vec::with_capacity(d);
        for (i, p) in preds.iter().take(d).enumerate() {
            let pl = self.links(*p);
            links.push(pl.get(i).copied().unwrap_or(0));
        }
        for (i, p) in preds.iter().take(d).enumerate() {
            let pl = self.links_mut(*p);
            while pl.len() <= i {
                pl.push(0);
            }
            pl[i] = accession;
        }
        self.get_mut(accession).expect("live entry").skiplinks = links;
    }

    fn skiplist_remove(&mut self, accession: u64) {
        let (key, links) = {
            let e = self.get(accession).expect("removing live entry");
            (e.flatname.clone(), e.skiplinks.clone())
        };
        let preds = self.skiplist_findbefore(&key, Some(accession));
        let d = links.len().min(preds.len());
        for i in 0..d {
            let pl = self.links_mut(preds[i]);
            if pl.get(i).copied() == Some(accession) {
                pl[i] = links[i];
            }
        }
        if let Some(e) = self.get_mut(accession) {
            e.skiplinks.clear();
        }
    }

    /// Next entry in name order.
    pub fn skiplist_next(&self, accession: u64) -> Option<u64> {
        let next = *self.get(accession)?.skiplinks.first()?;
        if next == 0 {
            None
        } else {
            Some(next)
        }
    }

    /// First entry at or after `key` in name order.
    fn first_at_or_after(&self, key: &[u8]) -> Option<u64> {
        let preds = self.skiplist_findbefore(key, None);
        let first = match preds.first() {
            Some(p) => self.links(*p).first().copied().unwrap_or(0),
            None => 0,
        };
        if first == 0 {
            None
        } else {
            Some(first)
        }
    }

    /// Offer a digest-extended ContentObject to the store.
    pub fn insert(
        &mut self,
        msg: Vec<u8>,
        pco: ParsedContentObject,
        arrival_faceid: FaceId,
        rng: &mut SmallRng,
    ) -> CsInsertOutcome {
        let flatname = flatname_of(&msg, &pco);
        if let Some(&old) = self.by_name.get(&flatname) {
            let same = self.get(old).map(|e| e.msg == msg).unwrap_or(false);
            if !same {
                warn!("ContentObject name collision!!!!!");
                self.remove(old);
                return CsInsertOutcome::Collision;
            }
            let was_stale = self.get(old).map(|e| e.is_stale()).unwrap_or(false);
            if was_stale {
                self.unstale(old);
                if let Some(e) = self.get_mut(old) {
                    e.arrival_faceid = arrival_faceid;
                }
                return CsInsertOutcome::Refreshed(old);
            }
            return CsInsertOutcome::Duplicate(old);
        }
        self.accession += 1;
        let accession = self.accession;
        debug_assert_eq!(self.base + self.ring.len() as u64, accession);
        let mut flags = 0;
        if pco.content_type == packet::CONTENT_TYPE_KEY
            && accession <= ((self.capacity + 7) / 8) as u64
        {
            flags |= CONTENT_PRECIOUS;
        }
        let entry = ContentEntry {
            accession,
            msg,
            pco,
            flatname: flatname.clone(),
            arrival_faceid,
            flags,
            skiplinks: Vec::new(),
        };
        self.ring.push_back(Some(entry));
        self.by_name.insert(flatname, accession);
        self.live += 1;
        self.skiplist_insert(accession, rng);
        CsInsertOutcome::New(accession)
    }

    /// Remove an entry outright.
    pub fn remove(&mut self, accession: u64) -> bool {
        if self.get(accession).is_none() {
            return false;
        }
        self.skiplist_remove(accession);
        let entry = if accession >= self.base {
            self.ring[(accession - self.base) as usize].take()
        } else {
            self.stragglers.remove(&accession)
        };
        let Some(entry) = entry else { return false };
        self.by_name.remove(&entry.flatname);
        if entry.is_stale() {
            self.n_stale -= 1;
        }
        self.live -= 1;
        debug!("cs: removed accession {}", accession);
        self.compact();
        true
    }

    /// Mark an entry stale (no effect if already stale).
    pub fn mark_stale(&mut self, accession: u64) {
        let Some(e) = self.get_mut(accession) else { return };
        if e.is_stale() {
            return;
        }
        e.flags |= CONTENT_STALE;
        self.n_stale += 1;
        if accession < self.min_stale {
            self.min_stale = accession;
        }
        if accession > self.max_stale {
            self.max_stale = accession;
        }
    }

    fn unstale(&mut self, accession: u64) {
        if let Some(e) = self.get_mut(accession) {
            if e.is_stale() {
                e.flags &= !CONTENT_STALE;
                self.n_stale -= 1;
            }
        }
    }

    /// Reset the stale accession window after a completed sweep.
    pub fn reset_stale_bounds(&mut self) {
        self.min_stale = u64::MAX;
        self.max_stale = 0;
    }

    pub fn set_min_stale(&mut self, a: u64) {
        self.min_stale = a;
    }

    /// Advance the ring base past a sparse front, keeping survivors in
    /// the straggler table.
    fn compact(&mut self) {
        while matches!(self.ring.front(), Some(None)) {
            self.ring.pop_front();
            self.base += 1;
        }
        let window = self.ring.len();
        if window < 1024 || window < 4 * self.capacity.max(1) {
            return;
        }
        let chunk = window / 4;
        let occupied = self.ring.iter().take(chunk).filter(|s| s.is_some()).count();
        if occupied * 32 > chunk {
            return;
        }
        for _ in 0..chunk {
            match self.ring.pop_front() {
                Some(Some(e)) => {
                    self.stragglers.insert(e.accession, e);
                }
                Some(None) => {}
                None => break,
            }
            self.base += 1;
        }
    }

    /* --- interest matching --- */

    /// Find the best match for an interest, honoring staleness and the
    /// rightmost child selector.
    pub fn find_match(&self, interest: &[u8], pi: &ParsedInterest, stale_ok: bool) -> Option<u64> {
        let prefix_flat = interest_prefix_flat(interest, pi);
        let probe = first_candidate_probe(interest, pi, &prefix_flat);
        let mut candidate = self.first_at_or_after(&probe);
        let rightmost = (pi.orderpref & 1) != 0;
        let mut last_match = None;
        while let Some(a) = candidate {
            let entry = self.get(a)?;
            if !entry.flatname.starts_with(&prefix_flat) {
                break;
            }
            let acceptable = (stale_ok || !entry.is_stale())
                && content_matches_interest(&entry.msg, &entry.pco, interest, pi);
            if acceptable {
                if !rightmost {
                    return Some(a);
                }
                last_match = Some(a);
                candidate = self.next_child_at_level(a, pi.prefix_comps());
            } else {
                candidate = self.skiplist_next(a);
            }
        }
        last_match
    }

    /// Skip to the next sibling subtree below `level` name components.
    fn next_child_at_level(&self, accession: u64, level: usize) -> Option<u64> {
        let entry = self.get(accession)?;
        if entry.ncomps() <= level + 1 {
            return None;
        }
        let mut name = rust_ccnd_common::name::Name::from_components(
            rust_ccnd_common::name::flatname_comps(&entry.flatname).take(level + 1),
        );
        name.next_sibling();
        let next = self.first_at_or_after(name.flat())?;
        if next == accession {
            return self.skiplist_next(accession);
        }
        Some(next)
    }

    /// Enumerate all live entries in name order (diagnostics, stats).
    pub fn enumerate(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.live);
        let mut c = self.head_links.first().copied().unwrap_or(0);
        while c != 0 {
            out.push(c);
            c = self
                .get(c)
                .and_then(|e| e.skiplinks.first().copied())
                .unwrap_or(0);
        }
        out
    }
}

/// Flatname (including digest component) of a parsed object.
pub fn flatname_of(msg: &[u8], pco: &ParsedContentObject) -> Vec<u8> {
    let mut comps = Vec::with_capacity(pco.ncomps());
    for i in 0..pco.ncomps() {
        comps.push(component_body(msg, pco.comps[i]).unwrap_or(&[]));
    }
    flatname_from_components(comps)
}

/// Flatname of the interest's name prefix.
fn interest_prefix_flat(interest: &[u8], pi: &ParsedInterest) -> Vec<u8> {
    let mut comps = Vec::with_capacity(pi.prefix_comps());
    for i in 0..pi.prefix_comps() {
        comps.push(component_body(interest, pi.comps[i]).unwrap_or(&[]));
    }
    flatname_from_components(comps)
}

/// The leftmost skiplist probe: the prefix itself, or with the first
/// excluded component appended when the Exclude starts `<Any/><Comp>`.
fn first_candidate_probe(interest: &[u8], pi: &ParsedInterest, prefix_flat: &[u8]) -> Vec<u8> {
    use rust_ccnd_common::ccnb::{dtag, Decoder};
    let Some(ex) = &pi.exclude_span else {
        return prefix_flat.to_vec();
    };
    let body = &interest[ex.clone()];
    let mut d = Decoder::new(body);
    if d.enter(dtag::EXCLUDE).is_err() {
        return prefix_flat.to_vec();
    }
    if !d.try_enter(dtag::ANY) || d.close().is_err() {
        return prefix_flat.to_vec();
    }
    if d.peek_dtag() != Some(dtag::COMPONENT) {
        return prefix_flat.to_vec();
    }
    let start = d.pos();
    if d.skip_element().is_err() {
        return prefix_flat.to_vec();
    }
    match component_body(body, start) {
        Ok(comp) => {
            let mut probe = prefix_flat.to_vec();
            probe.extend_from_slice(&(comp.len() as u16).to_be_bytes());
            probe.extend_from_slice(comp);
            probe
        }
        Err(_) => prefix_flat.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rust_ccnd_common::name::Name;
    use rust_ccnd_common::packet::{
        content_digest, encode_content_object, parse_content_object, parse_interest,
        splice_digest_component, ContentObjectParams, InterestTemplate,
    };

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn make_object(uri: &str, payload: &[u8]) -> (Vec<u8>, ParsedContentObject) {
        let params = ContentObjectParams::new(Name::from_uri(uri).unwrap(), [1; 32], 99);
        let msg = encode_content_object(&params, payload, |signed| {
            content_digest(signed).to_vec()
        });
        let pco = parse_content_object(&msg).unwrap();
        let digest = content_digest(&msg);
        let full = splice_digest_component(&msg, &pco, &digest);
        let pco = parse_content_object(&full).unwrap();
        (full, pco)
    }

    fn store_with(entries: &[(&str, &[u8])]) -> (ContentStore, SmallRng) {
        let mut cs = ContentStore::new(100);
        let mut r = rng();
        for (uri, payload) in entries {
            let (msg, pco) = make_object(uri, payload);
            let out = cs.insert(msg, pco, 1, &mut r);
            assert!(matches!(out, CsInsertOutcome::New(_)));
        }
        (cs, r)
    }

    fn interest(uri: &str) -> (Vec<u8>, ParsedInterest) {
        let msg = InterestTemplate::new(Name::from_uri(uri).unwrap()).encode();
        let msg = msg.to_vec();
        let pi = parse_interest(&msg).unwrap();
        (msg, pi)
    }

    #[test]
    fn insert_and_exact_lookup() {
        let (cs, _) = store_with(&[("ccnx:/a/b", b"one")]);
        let (imsg, pi) = interest("ccnx:/a/b");
        let m = cs.find_match(&imsg, &pi, false).unwrap();
        assert_eq!(&cs.get(m).unwrap().msg[cs.get(m).unwrap().pco.content_body.clone()], b"one");
    }

    #[test]
    fn duplicate_is_reported_and_store_unchanged() {
        let (mut cs, mut r) = store_with(&[("ccnx:/a/b", b"one")]);
        let (msg, pco) = make_object("ccnx:/a/b", b"one");
        let out = cs.insert(msg, pco, 2, &mut r);
        assert!(matches!(out, CsInsertOutcome::Duplicate(_)));
        assert_eq!(cs.len(), 1);
    }

    #[test]
    fn collision_drops_both() {
        let (mut cs, mut r) = store_with(&[("ccnx:/n", b"x")]);
        // same digest-extended flatname, different bytes (simulated by
        // grafting the first object's name onto a different body)
        let (msg1, pco1) = make_object("ccnx:/n", b"x");
        let (_msg2, _) = make_object("ccnx:/n", b"y");
        let victim = cs.enumerate()[0];
        let mut forged = msg1.clone();
        // flip a payload byte so bytes differ while flatname agrees
        let at = pco1.content_body.start;
        forged[at] ^= 0xFF;
        let forged_pco = parse_content_object(&forged).unwrap();
        let out = cs.insert(forged, forged_pco, 2, &mut r);
        assert_eq!(out, CsInsertOutcome::Collision);
        assert_eq!(cs.len(), 0);
        assert!(cs.get(victim).is_none());
        let (imsg, pi) = interest("ccnx:/n");
        assert!(cs.find_match(&imsg, &pi, true).is_none());
    }

    #[test]
    fn stale_refresh_on_rearrival() {
        let (mut cs, mut r) = store_with(&[("ccnx:/a", b"v")]);
        let a = cs.enumerate()[0];
        cs.mark_stale(a);
        assert_eq!(cs.n_stale, 1);
        let (msg, pco) = make_object("ccnx:/a", b"v");
        let out = cs.insert(msg, pco, 2, &mut r);
        assert_eq!(out, CsInsertOutcome::Refreshed(a));
        assert_eq!(cs.n_stale, 0);
        assert_eq!(cs.get(a).unwrap().arrival_faceid, 2);
    }

    #[test]
    fn stale_entries_do_not_match_unless_allowed() {
        let (mut cs, _) = store_with(&[("ccnx:/s/x", b"v")]);
        let a = cs.enumerate()[0];
        cs.mark_stale(a);
        let (imsg, pi) = interest("ccnx:/s");
        assert!(cs.find_match(&imsg, &pi, false).is_none());
        assert_eq!(cs.find_match(&imsg, &pi, true), Some(a));
    }

    #[test]
    fn skiplist_enumerates_in_name_order() {
        let (cs, _) = store_with(&[
            ("ccnx:/z", b"3"),
            ("ccnx:/a/long", b"2"),
            ("ccnx:/a", b"1"),
            ("ccnx:/m/q", b"4"),
        ]);
        let names: Vec<Vec<u8>> = cs
            .enumerate()
            .iter()
            .map(|&a| cs.get(a).unwrap().flatname.clone())
            .collect();
        let mut sorted = names.clone();
        sorted.sort_by(|x, y| compare_flatnames(x, y));
        assert_eq!(names, sorted);
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn leftmost_match_takes_least_name() {
        let (cs, _) = store_with(&[("ccnx:/p/bb", b"2"), ("ccnx:/p/a", b"1")]);
        let (imsg, pi) = interest("ccnx:/p");
        let m = cs.find_match(&imsg, &pi, false).unwrap();
        let e = cs.get(m).unwrap();
        assert_eq!(&e.msg[e.pco.content_body.clone()], b"1");
    }

    #[test]
    fn rightmost_match_takes_greatest_child() {
        let (cs, _) = store_with(&[
            ("ccnx:/p/a", b"1"),
            ("ccnx:/p/bb", b"2"),
            ("ccnx:/p/cc", b"3"),
        ]);
        let mut t = InterestTemplate::new(Name::from_uri("ccnx:/p").unwrap());
        t.orderpref = Some(1);
        let imsg = t.encode().to_vec();
        let pi = parse_interest(&imsg).unwrap();
        let m = cs.find_match(&imsg, &pi, false).unwrap();
        let e = cs.get(m).unwrap();
        assert_eq!(&e.msg[e.pco.content_body.clone()], b"3");
    }

    #[test]
    fn exclusion_fast_path_skips_excluded_head() {
        let (cs, _) = store_with(&[("ccnx:/p/a", b"1"), ("ccnx:/p/b", b"2")]);
        let mut t = InterestTemplate::new(Name::from_uri("ccnx:/p").unwrap());
        t.exclude = vec![
            packet::ExcludeEntry::Any,
            packet::ExcludeEntry::Component(b"a".to_vec()),
        ];
        let imsg = t.encode().to_vec();
        let pi = parse_interest(&imsg).unwrap();
        let m = cs.find_match(&imsg, &pi, false).unwrap();
        let e = cs.get(m).unwrap();
        assert_eq!(&e.msg[e.pco.content_body.clone()], b"2");
    }

    #[test]
    fn removal_keeps_accession_maps_consistent() {
        let (mut cs, _) = store_with(&[("ccnx:/1", b"a"), ("ccnx:/2", b"b"), ("ccnx:/3", b"c")]);
        let all = cs.enumerate();
        assert!(cs.remove(all[1]));
        assert!(cs.get(all[1]).is_none());
        assert_eq!(cs.len(), 2);
        assert_eq!(cs.enumerate().len(), 2);
        // the others still resolve through the ring
        assert!(cs.get(all[0]).is_some());
        assert!(cs.get(all[2]).is_some());
    }

    #[test]
    fn precious_marking_applies_to_early_keys() {
        let mut cs = ContentStore::new(80);
        let mut r = rng();
        let name = Name::from_uri("ccnx:/key").unwrap();
        let mut params = ContentObjectParams::new(name, [1; 32], 1);
        params.content_type = packet::CONTENT_TYPE_KEY;
        let msg = encode_content_object(&params, b"K", |s| content_digest(s).to_vec());
        let pco = parse_content_object(&msg).unwrap();
        let digest = content_digest(&msg);
        let full = splice_digest_component(&msg, &pco, &digest);
        let pco = parse_content_object(&full).unwrap();
        let out = cs.insert(full, pco, 1, &mut r);
        let CsInsertOutcome::New(a) = out else { panic!() };
        assert!(cs.get(a).unwrap().flags & CONTENT_PRECIOUS != 0);
    }
}

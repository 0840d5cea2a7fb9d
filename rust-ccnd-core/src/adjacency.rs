//! Adjacency GUID negotiation.
//!
//! Two peer daemons on a datagram link agree on a shared random GUID so
//! each can name the link unambiguously.  The exchange runs over the
//! ordinary interest/content path under `ccnx:/%C1.M.FACE`: a solicit
//! interest bounds an unknown GUID with an Exclude range, the peer fills
//! in the other half, and commit requests carry signed per-face objects
//! until both sides have sent and received them.

use crate::daemon::Daemon;
use crate::face::{
    Face, FaceId, FACE_ADJ, FACE_BC, FACE_CONNECTING, FACE_GG, FACE_MCAST, FACE_NORECV,
    FACE_NOSEND, FACE_PASSIVE, FACE_PERMANENT, FACE_UNDECIDED, NOFACEID,
};
use crate::fib::{FORW_ACTIVE, FORW_CHILD_INHERIT};
use crate::internal_client::{InternalClient, Upcall};
use crate::keystore::SigningParams;
use crate::sched::Action;
use log::{debug, info};
use rand::RngCore;
use rust_ccnd_common::name::Name;
use rust_ccnd_common::packet::{
    component_body, ExcludeEntry, InterestTemplate, ParsedInterest, AOK_CS,
};

/* adjacency state bits */
pub const ADJ_SOL_SENT: u16 = 1 << 0;
pub const ADJ_SOL_RECV: u16 = 1 << 1;
pub const ADJ_OFR_SENT: u16 = 1 << 2;
pub const ADJ_OFR_RECV: u16 = 1 << 3;
pub const ADJ_CRQ_SENT: u16 = 1 << 4;
pub const ADJ_CRQ_RECV: u16 = 1 << 5;
pub const ADJ_DAT_SENT: u16 = 1 << 6;
pub const ADJ_DAT_RECV: u16 = 1 << 7;
pub const ADJ_TIMEDWAIT: u16 = 1 << 8;
pub const ADJ_PINGING: u16 = 1 << 9;
pub const ADJ_RETRYING: u16 = 1 << 10;
pub const ADJ_ACTIVE: u16 = 1 << 11;

/// Refresh period for established adjacencies, seconds.
pub const ADJ_REFRESH_SEC: u64 = 120;

/// Marker bytes leading a GUID name component.
const GUID_MARKER: &[u8; 6] = b"\xC1.M.G\x00";
/// Marker bytes leading a node-key component.
const NODE_MARKER: &[u8; 6] = b"\xC1.M.K\x00";

/// Faces in any of these states do not negotiate adjacencies.
const ADJ_INELIGIBLE: u32 = FACE_CONNECTING
    | FACE_UNDECIDED
    | FACE_NOSEND
    | FACE_GG
    | FACE_MCAST
    | FACE_PASSIVE
    | FACE_NORECV
    | FACE_BC
    | FACE_ADJ;

fn guid_component(guid: &[u8]) -> Vec<u8> {
    let mut c = Vec::with_capacity(GUID_MARKER.len() + guid.len());
    c.extend_from_slice(GUID_MARKER);
    c.extend_from_slice(guid);
    c
}

impl Daemon {
    /// Record the adjusted adjacency state, with a debug trace.
    pub(crate) fn adjstate_change(&mut self, faceid: FaceId, set: u16, clear: u16) -> u16 {
        let Some(face) = self.faces.get_mut(faceid) else { return 0 };
        let old = face.adjstate;
        let new = (old & !clear) | set;
        if new != old {
            face.adjstate = new;
            if self.debugging(crate::config::DBG_FACES) {
                let mut s: Vec<u8> = b"sSoOcCdDTPRA".to_vec();
                for (i, ch) in s.iter_mut().enumerate() {
                    if (new >> i) & 1 == 0 {
                        *ch = b'.';
                    }
                }
                debug!(
                    "adjstate {} {} {:#x}",
                    faceid,
                    String::from_utf8_lossy(&s),
                    self.faces.get(faceid).map(|f| f.flags).unwrap_or(0)
                );
            }
        }
        old
    }

    /// Bind a guid to a face; fails on duplicates.
    pub(crate) fn set_face_guid(&mut self, faceid: FaceId, guid: &[u8]) -> Result<(), ()> {
        if guid.len() > 255 {
            return Err(());
        }
        if self.faces.get(faceid).map(|f| f.guid.is_some()).unwrap_or(true) {
            return Err(());
        }
        if self.faces.by_guid.contains_key(guid) {
            return Err(());
        }
        self.faces.by_guid.insert(guid.to_vec(), faceid);
        if let Some(f) = self.faces.get_mut(faceid) {
            f.guid = Some(guid.to_vec());
        }
        Ok(())
    }

    pub(crate) fn forget_face_guid(&mut self, faceid: FaceId) {
        let guid = self.faces.get_mut(faceid).and_then(|f| {
            f.guid_cob = None;
            f.guid.take()
        });
        if let Some(g) = guid {
            self.faces.by_guid.remove(&g);
        }
    }

    pub(crate) fn faceid_from_guid(&self, guid: &[u8]) -> FaceId {
        self.faces.by_guid.get(guid).copied().unwrap_or(NOFACEID)
    }

    /// Generate a face guid within the exclusive bounds (lo, hi).
    pub(crate) fn generate_face_guid(&mut self, faceid: FaceId, size: usize, lo: &[u8], hi: &[u8]) {
        let eligible = self
            .faces
            .get(faceid)
            .map(|f| (f.flags & (FACE_GG | FACE_UNDECIDED | FACE_PASSIVE)) == 0)
            .unwrap_or(false);
        if !eligible || lo.len() != size || hi.len() != size {
            return;
        }
        /* find the first differing byte and the usable range */
        let mut i = 0;
        while i < size && lo[i] == hi[i] {
            i += 1;
        }
        if i == size || lo[i] > hi[i] {
            return;
        }
        let span = (size - i).min(8);
        let mut range: u64 = 0;
        for k in i..i + span {
            let l = *lo.get(k).unwrap_or(&0) as u64;
            let h = *hi.get(k).unwrap_or(&0) as u64;
            range = (range << 8).wrapping_add(h.wrapping_sub(l));
        }
        if range < 2 {
            return;
        }
        let mut guid = lo.to_vec();
        let mut r = ((self.rng.next_u64() % (range - 1)) + 1) as u128;
        for k in (0..size).rev() {
            if r == 0 {
                break;
            }
            r += guid[k] as u128;
            guid[k] = (r & 0xff) as u8;
            r >>= 8;
        }
        let _ = self.set_face_guid(faceid, &guid);
    }
}

impl InternalClient {
    /// URI for the adjacency prefix bound to this face's guid.
    pub(crate) fn adjacency_uri(&self, face: &Face) -> Option<String> {
        let guid = face.guid.as_ref()?;
        let mut name = Name::from_uri("ccnx:/%C1.M.FACE").ok()?;
        name.append(&guid_component(guid));
        Some(name.to_uri())
    }

    /// Schedule negotiation of a link guid if the face qualifies.
    pub(crate) fn schedule_adjacency_negotiation(&mut self, d: &mut Daemon, faceid: FaceId) {
        let Some(face) = d.faces.get(faceid) else { return };
        if (face.flags & ADJ_INELIGIBLE) != 0 {
            return;
        }
        let is_permanent = (face.flags & FACE_PERMANENT) != 0;
        /* dally a bit longer for faces we initiated ourselves */
        let mut delay = 2_000 + (d.random() % 131_072) as u64;
        if !is_permanent {
            delay += 200_000;
        }
        d.schedule(delay, Action::AdjacencySolicit(faceid), 0);
    }

    /// Scheduled entry point for sending a solicit.
    pub(crate) fn do_solicit(&mut self, d: &mut Daemon, faceid: FaceId) {
        let Some(face) = d.faces.get(faceid) else { return };
        if face.adjstate != 0 || (face.flags & ADJ_INELIGIBLE) != 0 {
            return;
        }
        self.send_adjacency_solicit(d, faceid);
    }

    /// Send the solicitation interest, bounding an unknown guid.
    fn send_adjacency_solicit(&mut self, d: &mut Daemon, faceid: FaceId) {
        let Some(face) = d.faces.get(faceid) else { return };
        if face.guid.is_some() || face.adjstate != 0 {
            return;
        }
        /* proposed partial guid: one reserved zero byte, six of ours,
         * six for the other side */
        let mut g = vec![0u8; 13];
        for b in g[1..7].iter_mut() {
            *b = d.rng.next_u32() as u8;
        }
        let mut hi = g.clone();
        for b in hi[7..13].iter_mut() {
            *b = 0xff;
        }
        let name = Name::from_uri("ccnx:/%C1.M.FACE").expect("static uri");
        let mut t = InterestTemplate::new(name);
        t.exclude = vec![
            ExcludeEntry::Any,
            ExcludeEntry::Component(guid_component(&g)),
            ExcludeEntry::Component(guid_component(&hi)),
            ExcludeEntry::Any,
        ];
        t.answerfrom = Some(0); /* no cached content, please */
        t.scope = Some(2);
        t.faceid = Some(faceid); /* bypass the FIB */
        if d.set_face_guid(faceid, &g).is_ok() {
            /* the guid slot holds our proposal until the offer */
            self.express_interest(d, &t, Upcall::SolicitResponse(faceid));
            d.adjstate_change(faceid, ADJ_SOL_SENT, 0);
        }
    }

    /// Content arrived for a solicit: stale cache, start over.
    pub(crate) fn solicit_response_content(&mut self, d: &mut Daemon, faceid: FaceId) {
        let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
        if (state & ADJ_SOL_SENT) != 0 {
            self.adjacency_timed_reset(d, faceid);
        }
    }

    /// Express the offer or commit-request interest.
    pub(crate) fn adjacency_offer_or_commit_req(&mut self, d: &mut Daemon, faceid: FaceId) {
        let Some(face) = d.faces.get(faceid) else { return };
        let Some(guid) = face.guid.clone() else { return };
        let state = face.adjstate;
        if (state & (ADJ_SOL_SENT | ADJ_TIMEDWAIT)) != 0 {
            return;
        }
        if (state & ADJ_PINGING) != 0 {
            return;
        }
        let mut name = Name::from_uri("ccnx:/%C1.M.FACE").expect("static uri");
        name.append(&guid_component(&guid));
        name.append(b"\xC1.M.NODE");
        let mut t = InterestTemplate::new(name);
        let mut own_key = Vec::with_capacity(NODE_MARKER.len() + 32);
        own_key.extend_from_slice(NODE_MARKER);
        own_key.extend_from_slice(&self.ccnd_id);
        t.exclude = vec![ExcludeEntry::Component(own_key)];
        t.answerfrom = Some(0);
        t.scope = Some(2);
        t.faceid = Some(faceid);
        d.adjstate_change(faceid, ADJ_PINGING, ADJ_RETRYING);
        self.express_interest(d, &t, Upcall::IncomingAdjacency(faceid));
        let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
        if (state & ADJ_OFR_RECV) != 0 {
            d.adjstate_change(faceid, ADJ_CRQ_SENT, 0);
        } else {
            d.adjstate_change(faceid, ADJ_OFR_SENT, 0);
        }
    }

    /// Data came back for an offer or commit request.
    pub(crate) fn incoming_adjacency_content(&mut self, d: &mut Daemon, faceid: FaceId) {
        let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
        if (state & ADJ_TIMEDWAIT) != 0 {
            return;
        }
        if (state & (ADJ_OFR_SENT | ADJ_CRQ_SENT)) != 0 {
            d.adjstate_change(faceid, ADJ_DAT_RECV, 0);
        }
        d.adjstate_change(faceid, 0, ADJ_PINGING | ADJ_RETRYING);
        let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
        let cob = d.faces.get(faceid).and_then(|f| f.guid_cob.clone());
        if (state & ADJ_CRQ_RECV) != 0 && (state & ADJ_DAT_SENT) == 0 {
            if let Some(cob) = cob {
                self.put(cob);
                d.adjstate_change(faceid, ADJ_DAT_SENT, 0);
                let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
                if (state & ADJ_DAT_RECV) == 0 {
                    self.adjacency_offer_or_commit_req(d, faceid);
                }
            }
        }
        self.register_adjacency(d, faceid, FORW_CHILD_INHERIT | FORW_ACTIVE);
    }

    /// An expressed adjacency interest went unanswered twice.
    pub(crate) fn adjacency_interest_timed_out(
        &mut self,
        d: &mut Daemon,
        faceid: FaceId,
        _kind: Upcall,
    ) {
        if d.faces.get(faceid).is_none() {
            return;
        }
        self.adjacency_timed_reset(d, faceid);
    }

    /// The `%C1.M.FACE` namespace handler.
    pub(crate) fn handle_adjacency_interest(
        &mut self,
        d: &mut Daemon,
        msg: &[u8],
        pi: &ParsedInterest,
        requester: FaceId,
    ) {
        let prefix_comps = pi.prefix_comps();
        /* answer by guid from any face when the cache may be used */
        if prefix_comps >= 2 && (pi.answerfrom & AOK_CS) != 0 && self.answer_by_guid(d, msg, pi) {
            return;
        }
        let faceid = requester;
        if d.faces.get(faceid).is_none() {
            return;
        }
        let has_guid = d
            .faces
            .get(faceid)
            .map(|f| f.guid.is_some())
            .unwrap_or(false);
        let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
        let soliciting = (state & ADJ_SOL_SENT) != 0;
        if prefix_comps == 1 && (!has_guid || soliciting) {
            if let Some((lo, hi)) = extract_bounds(msg, pi) {
                if lo.len() > GUID_MARKER.len()
                    && lo.starts_with(GUID_MARKER)
                    && hi.starts_with(GUID_MARKER)
                {
                    let lo = lo[GUID_MARKER.len()..].to_vec();
                    let hi = hi[GUID_MARKER.len()..].to_vec();
                    if soliciting {
                        /* solicitations crossed in the mail; the greater
                         * proposal wins the right to name the link */
                        let ours = d.faces.get(faceid).and_then(|f| f.guid.clone());
                        if let Some(ours) = ours {
                            if lo.len() >= ours.len() && lo.as_slice() > ours.as_slice() {
                                d.forget_face_guid(faceid);
                                d.adjstate_change(faceid, 0, ADJ_SOL_SENT);
                            }
                        }
                    }
                    d.adjstate_change(faceid, ADJ_SOL_RECV, ADJ_TIMEDWAIT);
                    let size = lo.len();
                    d.generate_face_guid(faceid, size, &lo, &hi);
                    let got = d
                        .faces
                        .get(faceid)
                        .map(|f| f.guid.is_some())
                        .unwrap_or(false);
                    if got {
                        self.init_face_guid_cob(d, faceid);
                        /* a no-op for the winner, which still holds
                         * SOL_SENT and awaits the peer's offer */
                        self.adjacency_offer_or_commit_req(d, faceid);
                        return;
                    }
                }
            }
        }
        self.check_offer_matches_my_solicit(d, faceid, msg, pi);
        let has_cob = d
            .faces
            .get(faceid)
            .map(|f| f.guid_cob.is_some())
            .unwrap_or(false);
        if !has_cob {
            self.init_face_guid_cob(d, faceid);
        }
        let cob_matches = d
            .faces
            .get(faceid)
            .and_then(|f| f.guid_cob.as_ref())
            .map(|cob| cob_matches_interest(cob, msg, pi))
            .unwrap_or(false);
        if cob_matches {
            if prefix_comps == 3 {
                d.adjstate_change(faceid, ADJ_CRQ_RECV, 0);
            }
            let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
            if (state & (ADJ_DAT_RECV | ADJ_OFR_RECV)) != 0 {
                let cob = d
                    .faces
                    .get(faceid)
                    .and_then(|f| f.guid_cob.clone())
                    .expect("checked");
                self.put(cob);
                d.adjstate_change(faceid, ADJ_DAT_SENT, 0);
                let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
                if (state & ADJ_DAT_RECV) == 0 {
                    self.adjacency_offer_or_commit_req(d, faceid);
                }
            }
            self.register_adjacency(d, faceid, FORW_CHILD_INHERIT | FORW_ACTIVE);
        }
    }

    /// Serve a guid request for an established adjacency on any face.
    fn answer_by_guid(&mut self, d: &mut Daemon, msg: &[u8], pi: &ParsedInterest) -> bool {
        let Some(comp) = component_body(msg, pi.comps[1]).ok() else {
            return false;
        };
        if comp.len() < GUID_MARKER.len() || !comp.starts_with(GUID_MARKER) {
            return false;
        }
        let faceid = d.faceid_from_guid(&comp[GUID_MARKER.len()..]);
        if faceid == NOFACEID {
            return false;
        }
        let adj = d
            .faces
            .get(faceid)
            .map(|f| (f.flags & FACE_ADJ) != 0)
            .unwrap_or(false);
        if !adj {
            return false;
        }
        if d.faces.get(faceid).map(|f| f.guid_cob.is_none()).unwrap_or(true) {
            self.init_face_guid_cob(d, faceid);
        }
        let Some(cob) = d.faces.get(faceid).and_then(|f| f.guid_cob.clone()) else {
            return false;
        };
        if cob_matches_interest(&cob, msg, pi) {
            self.put(cob);
            true
        } else {
            false
        }
    }

    /// Did an incoming offer answer our own solicitation?
    fn check_offer_matches_my_solicit(
        &mut self,
        d: &mut Daemon,
        faceid: FaceId,
        msg: &[u8],
        pi: &ParsedInterest,
    ) {
        if pi.prefix_comps() != 3 {
            return;
        }
        let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
        if (state & ADJ_SOL_SENT) == 0 {
            return;
        }
        let Some(ours) = d.faces.get(faceid).and_then(|f| f.guid.clone()) else {
            return;
        };
        let Ok(node) = component_body(msg, pi.comps[2]) else { return };
        if node != b"\xC1.M.NODE" {
            return;
        }
        let Ok(offered) = component_body(msg, pi.comps[1]) else { return };
        if !offered.starts_with(GUID_MARKER) {
            return;
        }
        let offered = &offered[GUID_MARKER.len()..];
        /* must extend our proposal: same high half, nonzero low half */
        if ours.len() <= 6 || offered.len() != ours.len() {
            return;
        }
        if offered[..ours.len() - 6] != ours[..ours.len() - 6] {
            return;
        }
        d.forget_face_guid(faceid);
        let _ = d.set_face_guid(faceid, offered);
        d.adjstate_change(faceid, ADJ_OFR_RECV, ADJ_SOL_SENT);
        self.init_face_guid_cob(d, faceid);
    }

    /// Create the signed per-face object naming the guid.
    pub(crate) fn init_face_guid_cob(&mut self, d: &mut Daemon, faceid: FaceId) {
        let Some(face) = d.faces.get(faceid) else { return };
        if face.guid.is_none() || face.guid_cob.is_some() {
            return;
        }
        if (face.adjstate & (ADJ_OFR_SENT | ADJ_OFR_RECV | ADJ_SOL_RECV)) == 0 {
            return;
        }
        let guid = face.guid.clone().expect("checked");
        let mut name = Name::from_uri("ccnx:/%C1.M.FACE").expect("static uri");
        name.append(&guid_component(&guid));
        name.append(b"\xC1.M.NODE");
        let mut key_comp = Vec::with_capacity(NODE_MARKER.len() + 32);
        key_comp.extend_from_slice(NODE_MARKER);
        key_comp.extend_from_slice(&self.ccnd_id);
        name.append(&key_comp);
        name.append_str(&format!("face~{}", faceid));
        self.append_version_and_segment(d, &mut name);
        let seconds = 60;
        let nfresh = 20; /* flush after this many freshness periods */
        let sp = SigningParams {
            freshness_seconds: Some(seconds),
            ..Default::default()
        };
        let cob = self.sign(d, name, b"", &sp);
        if let Some(f) = d.faces.get_mut(faceid) {
            f.guid_cob = Some(cob);
        }
        d.schedule(
            nfresh * seconds as u64 * 1_000_000 - 800_000,
            Action::FlushGuidCob(faceid),
            0,
        );
    }

    /// Register `ccnx:/%C1.M.FACE/<guid>` toward the face once both
    /// sides have exchanged data.
    fn register_adjacency(&mut self, d: &mut Daemon, faceid: FaceId, forwarding_flags: u32) {
        let both = ADJ_DAT_RECV | ADJ_DAT_SENT;
        let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
        if (state & both) != both {
            return;
        }
        let Some(guid) = d.faces.get(faceid).and_then(|f| f.guid.clone()) else {
            return;
        };
        let (adj, lifetime) = if (forwarding_flags & FORW_ACTIVE) != 0 {
            (FACE_ADJ, ADJ_REFRESH_SEC as i32)
        } else {
            (0, 0)
        };
        let mut name = Name::from_uri("ccnx:/%C1.M.FACE").expect("static uri");
        name.append(&guid_component(&guid));
        if d.reg_prefix(name.flat(), faceid, forwarding_flags as i32, lifetime)
            .is_err()
        {
            return;
        }
        let flags = d.faces.get(faceid).map(|f| f.flags).unwrap_or(0);
        if (flags & FACE_ADJ) != adj {
            if let Some(f) = d.faces.get_mut(faceid) {
                f.flags ^= FACE_ADJ;
            }
            info!("adjacency established on face {}: {}", faceid, name.to_uri());
            d.face_status_change(faceid);
        }
        if lifetime != 0 && (state & ADJ_ACTIVE) == 0 {
            d.schedule(
                lifetime as u64 * 1_000_000,
                Action::AdjacencyRefresh(faceid),
                0,
            );
            d.adjstate_change(faceid, ADJ_ACTIVE, 0);
        }
    }

    /// Scheduled refresh of an established adjacency.
    pub(crate) fn adjacency_do_refresh(&mut self, d: &mut Daemon, faceid: FaceId, cancel: bool) -> i64 {
        if d.faces.get(faceid).is_none() {
            return 0;
        }
        if cancel {
            d.adjstate_change(faceid, 0, ADJ_ACTIVE);
            return 0;
        }
        let both = ADJ_DAT_RECV | ADJ_DAT_SENT;
        let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
        if (state & both) == both {
            self.adjacency_offer_or_commit_req(d, faceid);
            let state = d.faces.get(faceid).map(|f| f.adjstate).unwrap_or(0);
            if (state & ADJ_PINGING) != 0 {
                let jitter = d.random() as u64 % (ADJ_REFRESH_SEC * 1_000_000);
                return ((ADJ_REFRESH_SEC * 1_000_000 + jitter) / 2) as i64;
            }
        }
        d.adjstate_change(faceid, 0, ADJ_ACTIVE);
        0
    }

    /// Schedule recovery from a broken negotiation.
    pub(crate) fn adjacency_timed_reset(&mut self, d: &mut Daemon, faceid: FaceId) {
        if d.faces.get(faceid).is_none() {
            return;
        }
        let had_adj = d
            .faces
            .get(faceid)
            .map(|f| (f.flags & FACE_ADJ) != 0)
            .unwrap_or(false);
        if had_adj {
            if let Some(f) = d.faces.get_mut(faceid) {
                f.flags &= !FACE_ADJ;
            }
            d.face_status_change(faceid);
        }
        d.adjstate_change(faceid, ADJ_TIMEDWAIT, !ADJ_ACTIVE);
        d.forget_face_guid(faceid);
        let delay = 9_000_000 + (d.random() % 8_000_000) as u64;
        d.schedule(delay, Action::AdjacencyReset(faceid), 0);
    }

    /// Two-phase recovery: linger in TIMEDWAIT, then start over.
    pub(crate) fn adjacency_do_reset(&mut self, d: &mut Daemon, faceid: FaceId) -> i64 {
        let Some(face) = d.faces.get(faceid) else { return 0 };
        if (face.adjstate & ADJ_TIMEDWAIT) == 0 {
            return 0;
        }
        if face.adjstate != ADJ_TIMEDWAIT {
            d.adjstate_change(faceid, ADJ_TIMEDWAIT, !ADJ_ACTIVE);
            d.forget_face_guid(faceid);
            return 666_666;
        }
        d.adjstate_change(faceid, 0, !0);
        self.schedule_adjacency_negotiation(d, faceid);
        0
    }
}

/// Pull the lower and upper guid bounds out of a solicit's Exclude.
fn extract_bounds<'m>(msg: &'m [u8], pi: &ParsedInterest) -> Option<(&'m [u8], &'m [u8])> {
    use rust_ccnd_common::ccnb::{dtag, Decoder};
    let ex = pi.exclude_span.clone()?;
    let body = &msg[ex];
    let mut d = Decoder::new(body);
    d.enter(dtag::EXCLUDE).ok()?;
    if !d.try_enter(dtag::ANY) {
        return None;
    }
    d.close().ok()?;
    let lo_at = d.pos();
    if d.peek_dtag() != Some(dtag::COMPONENT) {
        return None;
    }
    d.skip_element().ok()?;
    let hi_at = d.pos();
    if d.peek_dtag() != Some(dtag::COMPONENT) {
        return None;
    }
    d.skip_element().ok()?;
    if !d.try_enter(dtag::ANY) {
        return None;
    }
    d.close().ok()?;
    if !d.at_close() {
        return None;
    }
    let lo = component_body(body, lo_at).ok()?;
    let hi = component_body(body, hi_at).ok()?;
    if lo.len() != hi.len() {
        return None;
    }
    Some((lo, hi))
}

/// Does the stored guid object satisfy this interest?
fn cob_matches_interest(cob: &[u8], msg: &[u8], pi: &ParsedInterest) -> bool {
    use rust_ccnd_common::packet::{
        content_digest, content_matches_interest, parse_content_object, splice_digest_component,
    };
    let Ok(pco) = parse_content_object(cob) else { return false };
    let digest = content_digest(cob);
    let full = splice_digest_component(cob, &pco, &digest);
    let Ok(full_pco) = parse_content_object(&full) else { return false };
    content_matches_interest(&full, &full_pco, msg, pi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testutil::*;
    use crate::face::FACE_DGRAM;
    use rust_ccnd_common::packet::parse_interest;

    fn solicit_bounds(lo7: [u8; 7]) -> (Vec<u8>, Vec<u8>) {
        let mut lo = lo7.to_vec();
        lo.extend_from_slice(&[0; 6]);
        let mut hi = lo7.to_vec();
        hi.extend_from_slice(&[0xff; 6]);
        (lo, hi)
    }

    /// A solicitation as the peer daemon would send it.
    fn peer_solicit(lo: &[u8], hi: &[u8]) -> Vec<u8> {
        let name = Name::from_uri("ccnx:/%C1.M.FACE").unwrap();
        let mut t = InterestTemplate::new(name);
        t.exclude = vec![
            ExcludeEntry::Any,
            ExcludeEntry::Component(guid_component(lo)),
            ExcludeEntry::Component(guid_component(hi)),
            ExcludeEntry::Any,
        ];
        t.answerfrom = Some(0);
        t.scope = Some(2);
        t.encode().to_vec()
    }

    #[test]
    fn permanent_undecided_face_is_ineligible() {
        let (mut d, _k) = test_daemon();
        let f = add_plain_face(&mut d, FACE_PERMANENT | FACE_UNDECIDED | FACE_DGRAM);
        d.with_internal(|d, ic| ic.do_solicit(d, f));
        assert_eq!(d.faces.get(f).unwrap().adjstate, 0);
        assert!(d.faces.get(f).unwrap().guid.is_none());
        /* once the face leaves the undecided state, permanence is no bar */
        d.faces.get_mut(f).unwrap().flags &= !FACE_UNDECIDED;
        d.with_internal(|d, ic| ic.do_solicit(d, f));
        let face = d.faces.get(f).unwrap();
        assert!(face.adjstate & ADJ_SOL_SENT != 0);
        assert!(face.guid.is_some());
    }

    #[test]
    fn solicit_proposes_a_half_random_guid() {
        let (mut d, _k) = test_daemon();
        let f = add_plain_face(&mut d, FACE_DGRAM);
        d.with_internal(|d, ic| ic.do_solicit(d, f));
        let guid = d.faces.get(f).unwrap().guid.clone().expect("proposal kept");
        assert_eq!(guid.len(), 13);
        assert_eq!(guid[0], 0, "reserved byte");
        assert_eq!(&guid[7..], &[0u8; 6], "peer half left open");
        /* the solicit rides an ordinary interest, steered at the face */
        let ic = d.internal.as_ref().unwrap();
        assert_eq!(ic.expressed.len(), 1);
        let pi = parse_interest(&ic.expressed[0].wire).unwrap();
        assert_eq!(pi.scope, 2);
        assert_eq!(pi.faceid, Some(f));
        assert_eq!(pi.answerfrom, 0);
        assert!(pi.exclude_span.is_some());
    }

    #[test]
    fn incoming_solicit_generates_an_offer_in_bounds() {
        let (mut d, _k) = test_daemon();
        let f = add_plain_face(&mut d, FACE_DGRAM);
        let (lo, hi) = solicit_bounds([0, 1, 2, 3, 4, 5, 6]);
        let msg = peer_solicit(&lo, &hi);
        let pi = parse_interest(&msg).unwrap();
        d.with_internal(|d, ic| ic.handle_adjacency_interest(d, &msg, &pi, f));
        let face = d.faces.get(f).unwrap();
        let guid = face.guid.clone().expect("offer generated");
        assert_eq!(&guid[..7], &lo[..7], "their half is preserved");
        assert!(guid.as_slice() > lo.as_slice());
        assert!(guid.as_slice() < hi.as_slice());
        assert!(face.adjstate & ADJ_SOL_RECV != 0);
        assert!(face.adjstate & ADJ_OFR_SENT != 0);
        assert!(face.adjstate & ADJ_PINGING != 0);
        assert!(face.guid_cob.is_some());
        /* the offer went out as a commit-style interest */
        assert_eq!(d.internal.as_ref().unwrap().expressed.len(), 1);
    }

    #[test]
    fn crossing_solicits_yield_to_the_greater_proposal() {
        let (mut d, _k) = test_daemon();
        let f = add_plain_face(&mut d, FACE_DGRAM);
        d.with_internal(|d, ic| ic.do_solicit(d, f));
        let ours = d.faces.get(f).unwrap().guid.clone().unwrap();
        /* the peer's proposal sorts above ours (leading 1 vs 0) */
        let (lo, hi) = solicit_bounds([1, 9, 9, 9, 9, 9, 9]);
        let msg = peer_solicit(&lo, &hi);
        let pi = parse_interest(&msg).unwrap();
        d.with_internal(|d, ic| ic.handle_adjacency_interest(d, &msg, &pi, f));
        let face = d.faces.get(f).unwrap();
        assert!(face.adjstate & ADJ_SOL_SENT == 0, "our solicit abandoned");
        let guid = face.guid.clone().expect("regenerated in their range");
        assert_ne!(guid, ours);
        assert_eq!(&guid[..7], &lo[..7]);
        assert!(face.adjstate & ADJ_OFR_SENT != 0);
    }

    #[test]
    fn crossing_solicits_keep_our_greater_proposal() {
        let (mut d, _k) = test_daemon();
        let f = add_plain_face(&mut d, FACE_DGRAM);
        d.with_internal(|d, ic| ic.do_solicit(d, f));
        let ours = d.faces.get(f).unwrap().guid.clone().unwrap();
        /* an all-zero proposal can never beat ours */
        let (lo, hi) = solicit_bounds([0, 0, 0, 0, 0, 0, 0]);
        let msg = peer_solicit(&lo, &hi);
        let pi = parse_interest(&msg).unwrap();
        d.with_internal(|d, ic| ic.handle_adjacency_interest(d, &msg, &pi, f));
        let face = d.faces.get(f).unwrap();
        assert_eq!(face.guid.as_deref(), Some(ours.as_slice()));
        assert!(face.adjstate & ADJ_SOL_SENT != 0, "we still expect their offer");
        assert!(face.adjstate & ADJ_SOL_RECV != 0);
    }

    #[test]
    fn commit_exchange_registers_the_adjacency_prefix() {
        let (mut d, _k) = test_daemon();
        let f = add_plain_face(&mut d, FACE_DGRAM);
        let guid: Vec<u8> = (0u8..13).collect();
        d.set_face_guid(f, &guid).unwrap();
        /* we offered, the peer's commit request has arrived */
        d.adjstate_change(f, ADJ_OFR_SENT | ADJ_CRQ_RECV, 0);
        d.with_internal(|d, ic| ic.init_face_guid_cob(d, f));
        assert!(d.faces.get(f).unwrap().guid_cob.is_some());
        /* the peer's data lands */
        d.with_internal(|d, ic| ic.incoming_adjacency_content(d, f));
        let face = d.faces.get(f).unwrap();
        assert!(face.adjstate & ADJ_DAT_RECV != 0);
        assert!(face.adjstate & ADJ_DAT_SENT != 0);
        assert!(face.adjstate & ADJ_ACTIVE != 0);
        assert!(face.flags & FACE_ADJ != 0);
        /* the per-link prefix now routes to the face */
        let mut name = Name::from_uri("ccnx:/%C1.M.FACE").unwrap();
        name.append(&guid_component(&guid));
        let npe = d.fib.lookup(name.flat()).expect("adjacency prefix registered");
        let want = FORW_ACTIVE | FORW_CHILD_INHERIT;
        assert!(d
            .fib
            .get(npe)
            .unwrap()
            .forwarding
            .iter()
            .any(|fw| fw.faceid == f && (fw.flags & want) == want));
    }

    #[test]
    fn timed_reset_forgets_the_guid() {
        let (mut d, _k) = test_daemon();
        let f = add_plain_face(&mut d, FACE_DGRAM);
        d.set_face_guid(f, &[7; 13]).unwrap();
        d.faces.get_mut(f).unwrap().flags |= FACE_ADJ;
        d.adjstate_change(f, ADJ_SOL_SENT | ADJ_OFR_SENT, 0);
        d.with_internal(|d, ic| ic.adjacency_timed_reset(d, f));
        let face = d.faces.get(f).unwrap();
        assert!(face.guid.is_none());
        assert!(face.guid_cob.is_none());
        assert!(face.flags & FACE_ADJ == 0);
        assert!(face.adjstate & ADJ_TIMEDWAIT != 0);
        assert!(d.faces.by_guid.is_empty());
    }
}

//! The daemon proper: every table, the event dispatcher, and the
//! interest/content processing paths.
//!
//! One `Daemon` owns everything and runs on one thread; methods take
//! `&mut self` and nothing is shared.  Socket plumbing and the poll loop
//! live in `io.rs`; the control plane lives in `internal_client.rs`.

use crate::config::{Config, DBG_CONTENT, DBG_INTEREST, DBG_MATCH, DBG_TRAFFIC};
use crate::cs::{ContentStore, CsInsertOutcome, CONTENT_PRECIOUS, CONTENT_SLOWSEND};
use crate::face::{
    Face, FaceAttrRegistry, FaceId, FaceTable, ContentQueue, CQ_ASAP, CQ_N, CQ_NORMAL, CQ_SLOW,
    FACE_ADJ, FACE_DC, FACE_DGRAM, FACE_GG, FACE_LC, FACE_LINK, FACE_LOCAL, FACE_LOOPBACK,
    FACE_MCAST, FACE_NOSEND, FACE_PASSIVE, FACE_PERMANENT, FACE_SEQOK, FACE_SEQPROBE,
    FACE_UNDECIDED, FAM_APP, FAM_BCAST, FAM_DC, FAM_VALID, NOFACEID,
};
use crate::fib::{Fib, NpeId, FORW_ACTIVE, FORW_CHILD_INHERIT, FORW_CAPTURE_OK, FORW_LAST, FORW_LOCAL};
use crate::internal_client::InternalClient;
use crate::keystore::Keystore;
use crate::pit::{
    default_nonce_retention, Nonce, NonceSighting, NonceTable, Pit, Serial, PFI_ATTENTION,
    PFI_DCFACE, PFI_DNSTREAM, PFI_PENDING, PFI_SENDUPST, PFI_SUPDATA, PFI_UPENDING, PFI_UPHUNGRY,
    PFI_UPSTREAM,
};
use crate::sched::{Action, Clock, EventHandle, Scheduler, WrappedTime, MICROS_PER_TICK, WTHZ};
use crate::strategy::{create_instance, StrategyCtx, StrategyInstance, StrategyOp};
use bytes::BytesMut;
use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use rust_ccnd_common::ccnb::{self, dtag};
use rust_ccnd_common::meter::FaceMeter;
use rust_ccnd_common::name::Name;
use rust_ccnd_common::packet::{
    self, classify, content_digest, content_matches_interest, parse_content_object,
    parse_interest, parse_sequence_number, splice_digest_component, MessageKind, ParsedInterest,
    AOK_CS, AOK_EXPIRE, AOK_STALE, DEFAULT_LIFETIME_UNITS,
};

/// Interest lifetime used for housekeeping cadence (4 s, as micros).
pub(crate) const INTEREST_LIFETIME_MICROSEC: u64 = 4_000_000;

/// Counters reported on the stats surface.
#[derive(Debug, Default, Clone)]
pub struct DaemonCounters {
    pub interests_accepted: u64,
    pub interests_dropped: u64,
    pub interests_sent: u64,
    pub interests_stuffed: u64,
    pub content_items_sent: u64,
    pub content_dups_recvd: u64,
}

pub struct Daemon {
    pub(crate) cfg: Config,
    pub(crate) clock: Clock,
    pub(crate) sched: Scheduler,
    pub(crate) faces: FaceTable,
    pub(crate) faceattrs: FaceAttrRegistry,
    pub(crate) fib: Fib,
    pub(crate) pit: Pit,
    pub(crate) nonces: NonceTable,
    pub(crate) cs: ContentStore,
    pub(crate) rng: SmallRng,
    pub(crate) ccnd_id: [u8; 32],
    pub(crate) internal: Option<Box<InternalClient>>,
    pub(crate) face0: FaceId,
    pub(crate) ipv4_faceid: FaceId,
    pub(crate) ipv6_faceid: FaceId,
    pub(crate) running: bool,
    /// Face whose interest is currently being serviced (for the control
    /// plane, which answers through face 0).
    pub(crate) interest_faceid: FaceId,
    pub(crate) counters: DaemonCounters,
    reaper: Option<EventHandle>,
    age_forwarding_ev: Option<EventHandle>,
    clean_ev: Option<EventHandle>,
    /// Restart accession for the stale sweep.
    clean_pos: u64,
    /// Status changes noted while the internal client was busy.
    pending_status: Vec<FaceId>,
    pub(crate) io: crate::io::IoState,
}

impl Daemon {
    pub fn new(cfg: Config) -> Self {
        let capacity = cfg.capacity;
        let mut seed = [0u8; 32];
        getrandom_seed(&mut seed);
        let mut d = Self {
            cfg,
            clock: Clock::new(),
            sched: Scheduler::new(),
            faces: FaceTable::new(),
            faceattrs: FaceAttrRegistry::new(),
            fib: Fib::new(),
            pit: Pit::new(),
            nonces: NonceTable::new(),
            cs: ContentStore::new(capacity),
            rng: SmallRng::from_seed(seed),
            ccnd_id: [0; 32],
            internal: None,
            face0: NOFACEID,
            ipv4_faceid: NOFACEID,
            ipv6_faceid: NOFACEID,
            running: false,
            interest_faceid: NOFACEID,
            counters: DaemonCounters::default(),
            reaper: None,
            age_forwarding_ev: None,
            clean_ev: None,
            clean_pos: 0,
            pending_status: Vec::new(),
            io: crate::io::IoState::new(),
        };
        d.clock.update();
        // face 0: the internal pseudo-face
        let face0 = Face::new(crate::face::FaceIo::None, FACE_GG | FACE_LOCAL);
        d.face0 = d.faces.enroll(face0).expect("face table empty");
        debug_assert_eq!(d.face0, 0);
        d
    }

    /// Bring up the keystore and internal client.  Listeners are set up
    /// separately by [`crate::io`].
    pub fn start_internal(&mut self, keystore: Keystore) {
        self.ccnd_id = keystore.ccnd_id();
        let ic = InternalClient::start(self, keystore);
        self.internal = Some(Box::new(ic));
        self.reap_needed(55_000);
        self.age_forwarding_needed();
    }

    /* --- small helpers --- */

    pub fn wtnow(&self) -> WrappedTime {
        self.clock.wtnow()
    }

    pub(crate) fn now_us(&self) -> u64 {
        self.clock.abs_micros()
    }

    pub(crate) fn random(&mut self) -> u32 {
        self.rng.next_u32() & 0x7fff_ffff
    }

    pub fn debugging(&self, bits: u32) -> bool {
        (self.cfg.debug & bits) != 0
    }

    pub fn counters(&self) -> &DaemonCounters {
        &self.counters
    }

    pub fn ccnd_id(&self) -> [u8; 32] {
        self.ccnd_id
    }

    pub fn pit_len(&self) -> usize {
        self.pit.len()
    }

    pub fn cs_len(&self) -> usize {
        self.cs.len()
    }

    pub(crate) fn schedule(&mut self, delay_us: u64, action: Action, evint: u64) -> EventHandle {
        let now = self.now_us();
        self.sched.schedule(now, delay_us, action, evint)
    }

    pub(crate) fn cancel_event(&mut self, h: EventHandle) {
        if let Some(ev) = self.sched.cancel(h) {
            self.dispatch_action(h, &ev, true);
        }
    }

    /// Run all due events; returns the delay to the next one.
    pub fn run_due(&mut self) -> Option<u64> {
        self.clock.update();
        loop {
            let now = self.now_us();
            let Some((h, ev)) = self.sched.pop_due(now) else { break };
            let delay = self.dispatch_action(h, &ev, false);
            if delay > 0 {
                let now = self.now_us();
                self.sched.requeue(h, ev, now, delay as u64);
            }
        }
        let now = self.now_us();
        self.sched.next_delay_us(now)
    }

    /// The scheduler's action demultiplexer.  A positive return
    /// reschedules the same event that many microseconds out.
    fn dispatch_action(&mut self, h: EventHandle, ev: &crate::sched::ScheduledEvent, cancel: bool) -> i64 {
        match ev.action {
            Action::Reap => {
                if cancel {
                    self.reaper = None;
                    return 0;
                }
                self.reap()
            }
            Action::AgeForwarding => {
                if cancel {
                    self.age_forwarding_ev = None;
                    return 0;
                }
                self.age_forwarding_pass()
            }
            Action::CleanContent => {
                if cancel {
                    self.clean_ev = None;
                    return 0;
                }
                self.clean_pass()
            }
            Action::Propagate(serial) => {
                if let Some(e) = self.pit.get_mut(serial) {
                    if e.ev == Some(h) {
                        e.ev = None;
                    }
                }
                if cancel {
                    return 0;
                }
                self.do_propagate(serial, h)
            }
            Action::StrategyWakeup(serial) => {
                if let Some(e) = self.pit.get_mut(serial) {
                    if e.strategy_ev == Some(h) {
                        e.strategy_ev = None;
                    }
                }
                if cancel {
                    return 0;
                }
                self.strategy_callout(serial, StrategyOp::from_u64(ev.evint), NOFACEID);
                0
            }
            Action::ContentSender(faceid, class) => {
                if cancel {
                    if let Some(f) = self.faces.get_mut(faceid) {
                        if let Some(q) = f.queues[class as usize].as_mut() {
                            if q.sender == Some(h) {
                                q.sender = None;
                            }
                        }
                    }
                    return 0;
                }
                self.content_sender(faceid, class, h)
            }
            Action::ExpireContent(accession) => {
                if !cancel {
                    self.expire_content(accession);
                }
                0
            }
            Action::NoticePush => self.with_internal(|d, ic| ic.notice_push(d, cancel)).unwrap_or(0),
            Action::InternalClientDrain => {
                if cancel {
                    return 0;
                }
                self.process_internal_client_buffer();
                self.with_internal(|d, ic| ic.sweep_expressed(d));
                /* evint 1 marks the periodic sweep; zero is a one-shot */
                if ev.evint == 1 {
                    1_000_000
                } else {
                    0
                }
            }
            Action::AdjacencySolicit(faceid) => {
                if !cancel {
                    self.with_internal(|d, ic| ic.do_solicit(d, faceid));
                }
                0
            }
            Action::AdjacencyReset(faceid) => {
                if cancel {
                    return 0;
                }
                self.with_internal(|d, ic| ic.adjacency_do_reset(d, faceid))
                    .unwrap_or(0)
            }
            Action::AdjacencyRefresh(faceid) => self
                .with_internal(|d, ic| ic.adjacency_do_refresh(d, faceid, cancel))
                .unwrap_or(0),
            Action::FlushGuidCob(faceid) => {
                if !cancel {
                    if let Some(f) = self.faces.get_mut(faceid) {
                        f.guid_cob = None;
                    }
                }
                0
            }
        }
    }

    /// Borrow the internal client alongside the daemon.
    pub(crate) fn with_internal<R>(
        &mut self,
        f: impl FnOnce(&mut Daemon, &mut InternalClient) -> R,
    ) -> Option<R> {
        let mut ic = self.internal.take()?;
        let r = f(self, &mut *ic);
        self.internal = Some(ic);
        Some(r)
    }

    /// Drain everything the internal client has produced into face 0.
    pub fn process_internal_client_buffer(&mut self) {
        self.drain_face0_backlog();
        while let Some(faceid) = {
            if self.pending_status.is_empty() {
                None
            } else {
                Some(self.pending_status.remove(0))
            }
        } {
            self.with_internal(|d, ic| {
                ic.note_face_change(d, faceid);
                ic.schedule_adjacency_negotiation(d, faceid);
            });
        }
        loop {
            let msgs = match self.internal.as_mut() {
                Some(ic) => ic.take_output(),
                None => return,
            };
            if msgs.is_empty() {
                return;
            }
            for msg in msgs {
                let face0 = self.face0;
                if let Some(f) = self.faces.get_mut(face0) {
                    f.meters
                        .bump(FaceMeter::BytesIn, self.clock.sec, msg.len() as u64);
                }
                self.process_input_message(face0, &msg, false);
            }
        }
    }

    /* ------------------------------------------------------------ *
     * Message dispatch
     * ------------------------------------------------------------ */

    /// Dispatch one complete ccnb message from a face.
    pub fn process_input_message(&mut self, faceid: FaceId, msg: &[u8], pdu_ok: bool) {
        let Some(face) = self.faces.get_mut(faceid) else { return };
        if (face.flags & FACE_UNDECIDED) != 0 {
            face.flags &= !FACE_UNDECIDED;
            if (face.flags & FACE_LOOPBACK) != 0 {
                face.flags |= FACE_GG;
            }
            /* first proof that this stream speaks our protocol */
            self.register_new_face(faceid);
        }
        match classify(msg) {
            Some(MessageKind::Interest) => self.process_incoming_interest(faceid, msg),
            Some(MessageKind::ContentObject) => self.process_incoming_content(faceid, msg),
            Some(MessageKind::LinkPdu) if pdu_ok => self.process_incoming_pdu(faceid, msg),
            Some(MessageKind::SequenceNumber) => self.process_incoming_link_message(faceid, msg),
            other => {
                debug!(
                    "discarding unknown message; kind={:?}, size={}",
                    other,
                    msg.len()
                );
            }
        }
    }

    /// Unwrap a CCNProtocolDataUnit and process the inner messages.
    fn process_incoming_pdu(&mut self, faceid: FaceId, msg: &[u8]) {
        if let Some(face) = self.faces.get_mut(faceid) {
            if (face.flags & (FACE_LINK | FACE_GG)) != FACE_LINK {
                face.flags |= FACE_LINK;
                face.flags &= !FACE_GG;
                self.register_new_face(faceid);
            }
        }
        // peel the PDU header, collect the inner elements, then dispatch
        let mut d = ccnb::Decoder::new(msg);
        if d.enter(dtag::CCN_PROTOCOL_DATA_UNIT).is_err() {
            return;
        }
        let mut inner = Vec::new();
        while !d.at_close() {
            match d.skip_element() {
                Ok(span) => inner.push(msg[span].to_vec()),
                Err(e) => {
                    debug!("malformed PDU on face {}: {}", faceid, e);
                    return;
                }
            }
        }
        for m in inner {
            if self.faces.get(faceid).is_none() {
                return;
            }
            /* pdu_ok false bounds the recursion depth */
            self.process_input_message(faceid, &m, false);
        }
    }

    /// SequenceNumber link messages confirm packet ordering on unicast
    /// datagram links.
    fn process_incoming_link_message(&mut self, faceid: FaceId, msg: &[u8]) {
        let Ok(seq) = parse_sequence_number(msg) else {
            debug!("bad SequenceNumber on face {}", faceid);
            return;
        };
        let Some(face) = self.faces.get_mut(faceid) else { return };
        if (face.flags & FACE_DGRAM) == 0 {
            return;
        }
        if face.rseq.wrapping_add(1) == seq {
            face.rrun += 1;
            if face.rrun >= 3 && (face.flags & FACE_SEQOK) == 0 {
                debug!("link sequence established on face {}", faceid);
                face.flags |= FACE_SEQOK;
            }
        } else {
            face.rrun = 0;
        }
        face.rseq = seq;
    }

    /* ------------------------------------------------------------ *
     * Interests
     * ------------------------------------------------------------ */

    pub fn process_incoming_interest(&mut self, faceid: FaceId, msg: &[u8]) {
        if msg.len() > 65535 {
            warn!("oversize Interest from face {} discarded", faceid);
            return;
        }
        let pi = match parse_interest(msg) {
            Ok(pi) => pi,
            Err(e) => {
                info!("error parsing Interest - {}", e);
                return;
            }
        };
        let sec = self.clock.sec;
        let face_flags = match self.faces.get_mut(faceid) {
            Some(face) => {
                face.meters.bump(FaceMeter::InterestsIn, sec, 1);
                face.flags
            }
            None => return,
        };
        if pi.scope >= 0 && pi.scope < 2 && (face_flags & FACE_GG) == 0 {
            if self.debugging(DBG_TRAFFIC) {
                debug!("interest_outofscope face {}", faceid);
            }
            self.counters.interests_dropped += 1;
            return;
        }
        if self.debugging(DBG_INTEREST | DBG_MATCH | DBG_TRAFFIC) {
            debug!("interest_from face {} ({} bytes)", faceid, msg.len());
        }
        self.counters.interests_accepted += 1;
        let key = pi.pit_key(msg);
        if let Some(serial) = self.pit.lookup(&key) {
            /* in the PIT already; no need to consult the store */
            let npe = self.pit.get(serial).map(|e| e.npe).expect("entry npe");
            if self.drop_nonlocal_interest(npe, faceid) {
                return;
            }
            self.propagate_interest(faceid, msg, &pi, npe);
            return;
        }
        let flat = interest_name_flat(msg, &pi);
        let npe = self.fib.seek(&flat);
        if self.drop_nonlocal_interest(npe, faceid) {
            return;
        }
        let s_ok = (pi.answerfrom & AOK_STALE) != 0;
        let mut matched = false;
        if (pi.answerfrom & AOK_CS) != 0 {
            if let Some(accession) = self.cs.find_match(msg, &pi, s_ok) {
                if self.debugging(DBG_MATCH) {
                    debug!("match accession {} for face {}", accession, faceid);
                }
                let queued_already = self
                    .faces
                    .get(faceid)
                    .map(|f| {
                        f.queues
                            .iter()
                            .flatten()
                            .any(|q| q.contains(accession))
                    })
                    .unwrap_or(false);
                if !queued_already {
                    self.face_send_queue_insert(faceid, accession);
                    /* other matched interests on this face are consumed too */
                    self.match_interests(accession, None, Some(faceid));
                }
                if (pi.answerfrom & AOK_EXPIRE) != 0 {
                    self.cs.mark_stale(accession);
                }
                matched = true;
            }
        }
        if !matched && (pi.answerfrom & AOK_EXPIRE) == 0 {
            self.propagate_interest(faceid, msg, &pi, npe);
        }
    }

    /// Drop an interest arriving from outside for a local-only namespace.
    fn drop_nonlocal_interest(&mut self, npe: NpeId, faceid: FaceId) -> bool {
        let stale = self
            .fib
            .get(npe)
            .map(|e| e.fgen != self.fib.fgen)
            .unwrap_or(true);
        if stale {
            let faces = &self.faces;
            self.fib.update_forward_to(npe, |f| faces.get(f).is_some());
        }
        let local = self
            .fib
            .get(npe)
            .map(|e| (e.nsflags & FORW_LOCAL) != 0)
            .unwrap_or(false);
        let gg = self
            .faces
            .get(faceid)
            .map(|f| (f.flags & FACE_GG) != 0)
            .unwrap_or(false);
        if local && !gg {
            debug!("interest_nonlocal face {}", faceid);
            self.counters.interests_dropped += 1;
            return true;
        }
        false
    }

    /// The effective outbound face set for an interest.
    fn get_outbound_faces(
        &mut self,
        from: FaceId,
        pi: &ParsedInterest,
        npe: NpeId,
    ) -> Vec<FaceId> {
        if pi.scope == 0 {
            return Vec::new();
        }
        let from_flags = self.faces.get(from).map(|f| f.flags).unwrap_or(0);
        if (from_flags & FACE_GG) != 0 {
            if let Some(steer) = pi.faceid {
                return vec![steer];
            }
        }
        let fwd = self.fib.nearest_forwarding_npe(npe);
        let faces = &self.faces;
        let ft = self.fib.forward_to(fwd, |f| faces.get(f).is_some());
        if ft.is_empty() {
            return Vec::new();
        }
        let nsflags = self.fib.get(fwd).map(|e| e.nsflags).unwrap_or(0);
        let mut checkmask: u32 = 0;
        if (nsflags & FORW_LOCAL) != 0 {
            checkmask = if (from_flags & FACE_GG) != 0 { FACE_GG } else { !0 };
        } else if pi.scope == 1 {
            checkmask = FACE_GG;
        } else if pi.scope == 2 {
            checkmask = FACE_GG & !from_flags;
        }
        let wantmask = checkmask;
        if wantmask == FACE_GG {
            checkmask |= FACE_DC;
        }
        let mut out = Vec::new();
        for fid in ft {
            if fid == from {
                continue;
            }
            let Some(face) = self.faces.get(fid) else { continue };
            if (face.flags & checkmask) == wantmask {
                out.push(fid);
            }
        }
        out
    }

    /// Generate a nonce for an interest that arrived without one.
    fn generate_nonce(&mut self, faceid: FaceId) -> Vec<u8> {
        if self.debugging(crate::config::DBG_FACES) {
            /* debug nonce: ccndid-pid-faceid-time-random */
            let mut s = Vec::with_capacity(12);
            s.extend_from_slice(&self.ccnd_id[..3]);
            let pid = std::process::id() as u16;
            s.extend_from_slice(&pid.to_be_bytes());
            s.extend_from_slice(&(faceid as u16).to_be_bytes());
            s.push(self.clock.sec as u8);
            s.push((self.clock.usec as u64 * 256 / 1_000_000) as u8);
            while s.len() < 12 {
                s.push(self.rng.next_u32() as u8);
            }
            s
        } else {
            let mut s = vec![0u8; 6];
            self.rng.fill_bytes(&mut s);
            s
        }
    }

    /// Schedule the propagation of an interest message.
    pub(crate) fn propagate_interest(
        &mut self,
        faceid: FaceId,
        msg: &[u8],
        pi: &ParsedInterest,
        npe: NpeId,
    ) {
        let now = self.wtnow();
        let key = pi.pit_key(msg);
        let (serial, is_new) = self.pit.seek(&key, npe, now);
        if is_new {
            if let Some(e) = self.fib.get_mut(npe) {
                e.pit_serials.push(serial);
            }
        }
        let outbound = self.get_outbound_faces(faceid, pi, npe);
        let (nonce, generated) = match &pi.nonce {
            Some(r) => (msg[r.clone()].to_vec(), false),
            None => (self.generate_nonce(faceid), true),
        };
        let sighting = if generated {
            NonceSighting::Fresh
        } else {
            self.nonces
                .record(&nonce, faceid, now, default_nonce_retention())
        };
        let lifetime = pi.lifetime_units();
        let new_downstream;
        let mut suppressed = false;
        {
            let Some(e) = self.pit.get_mut(serial) else { return };
            let before = e.pfl.len();
            let idx = e.seek_pfi(faceid, PFI_DNSTREAM, now);
            new_downstream = e.pfl.len() != before;
            e.pfl[idx].nonce = Nonce::from_bytes(&nonce);
            let unique = e.nonce_unique(idx);
            if generated || (unique && sighting != NonceSighting::SeenFromOther) {
                e.renewed = now;
                e.renewals += 1;
                if (e.pfl[idx].flags & PFI_PENDING) == 0 {
                    e.pfl[idx].flags |= PFI_PENDING;
                    if let Some(f) = self.faces.get_mut(faceid) {
                        f.pending_interests += 1;
                    }
                }
            } else {
                /* nonce seen before; do not forward */
                suppressed = true;
                e.pfl[idx].flags |= PFI_SUPDATA;
            }
            e.pfl[idx].set_expiry_from_lifetime(now, lifetime);
        }
        let mut new_upstream = false;
        if let Some(e) = self.pit.get_mut(serial) {
            for ob in outbound {
                let before = e.pfl.len();
                let idx = e.seek_pfi(ob, PFI_UPSTREAM, now);
                if e.pfl.len() != before {
                    e.pfl[idx].flags |= PFI_ATTENTION;
                    new_upstream = true;
                }
                if e.pfl[idx].expiry.is_before(now) {
                    e.pfl[idx].expiry = now.plus_ticks(1);
                    e.pfl[idx].flags &= !PFI_UPHUNGRY;
                }
            }
        }
        if is_new {
            self.strategy_callout(serial, StrategyOp::First, faceid);
        } else if new_upstream {
            self.strategy_callout(serial, StrategyOp::Update, NOFACEID);
        } else if new_downstream {
            self.strategy_callout(serial, StrategyOp::NewDn, faceid);
        } else if !suppressed {
            self.strategy_callout(serial, StrategyOp::Refresh, faceid);
        }
        self.arm_propagate_event(serial);
    }

    /// Compute the delay until the next timed action on an entry.
    fn ie_next_usec(&self, serial: Serial) -> (u64, WrappedTime) {
        let now = self.wtnow();
        let horizon: u32 = 3;
        let base = WrappedTime(now.0.wrapping_sub(horizon));
        let mut mn: u32 = (600 * WTHZ) as u32 + horizon;
        if let Some(e) = self.pit.get(serial) {
            for p in &e.pfl {
                let delta = p.expiry.ticks_since(base);
                if delta < mn {
                    mn = delta;
                }
            }
        }
        mn = mn.saturating_sub(horizon);
        ((mn as u64) * MICROS_PER_TICK, now.plus_ticks(mn))
    }

    /// Make sure the propagate event fires no later than the earliest
    /// face-item expiry.
    fn arm_propagate_event(&mut self, serial: Serial) {
        let (usec, expiry) = self.ie_next_usec(serial);
        let (ev, ev_due) = match self.pit.get(serial) {
            Some(e) => (e.ev, e.ev_due),
            None => return,
        };
        if let Some(h) = ev {
            if expiry.plus_ticks(2).is_before(ev_due) {
                self.cancel_event(h);
            } else {
                return;
            }
        }
        let h = self.schedule(usec, Action::Propagate(serial), 0);
        if let Some(e) = self.pit.get_mut(serial) {
            e.ev = Some(h);
            e.ev_due = expiry;
        }
    }

    /// Destroy one pit face item, maintaining face counters.
    fn pfi_destroy(&mut self, serial: Serial, faceid: FaceId, dirflag: u32) {
        let Some(e) = self.pit.get_mut(serial) else { return };
        let Some(i) = e
            .pfl
            .iter()
            .position(|p| p.faceid == faceid && (p.flags & dirflag) != 0)
        else {
            return;
        };
        let p = e.pfl.remove(i);
        if (p.flags & PFI_PENDING) != 0 {
            if let Some(f) = self.faces.get_mut(faceid) {
                f.pending_interests -= 1;
            }
        }
        if (p.flags & PFI_UPSTREAM) != 0 && (p.flags & PFI_UPENDING) != 0 {
            if let Some(f) = self.faces.get_mut(faceid) {
                f.outstanding_interests -= 1;
            }
        }
    }

    /// Execute the next timed action on a propagating interest: expire
    /// downstreams, feed hungry upstreams, time the whole entry out.
    fn do_propagate(&mut self, serial: Serial, h: EventHandle) -> i64 {
        if self.pit.get(serial).is_none() {
            return 0;
        }
        let now = self.wtnow();
        let mut mn: u32 = (600 * WTHZ) as u32;
        let mut pending = 0usize;
        /* downstream pass */
        let snapshot: Vec<(FaceId, u32, WrappedTime, WrappedTime)> = self
            .pit
            .get(serial)
            .map(|e| {
                e.pfl
                    .iter()
                    .map(|p| (p.faceid, p.flags, p.renewed, p.expiry))
                    .collect()
            })
            .unwrap_or_default();
        let mut viable: Vec<(FaceId, WrappedTime)> = Vec::new();
        for &(fid, flags, renewed, expiry) in &snapshot {
            if (flags & PFI_DNSTREAM) == 0 {
                continue;
            }
            if expiry.is_at_or_before(now) {
                if self.debugging(DBG_TRAFFIC) {
                    debug!("interest_expiry i={} face {}", serial, fid);
                }
                self.strategy_callout(serial, StrategyOp::ExpDn, fid);
                self.pfi_destroy(serial, fid, PFI_DNSTREAM);
                continue;
            }
            if (flags & PFI_PENDING) == 0 {
                continue;
            }
            let rem = expiry.ticks_since(now);
            if rem < mn {
                mn = rem;
            }
            pending += 1;
            /* a downstream about to lapse is no good for renewals */
            let life = expiry.ticks_since(renewed);
            if rem.saturating_mul(8) <= life {
                continue;
            }
            viable.push((fid, expiry));
        }
        viable.sort_by(|a, b| b.1.cmp_wrapped(a.1));
        viable.truncate(2);
        /* upstream pass */
        let snapshot: Vec<(FaceId, u32, WrappedTime)> = self
            .pit
            .get(serial)
            .map(|e| {
                e.pfl
                    .iter()
                    .map(|p| (p.faceid, p.flags, p.expiry))
                    .collect()
            })
            .unwrap_or_default();
        let mut upstreams = 0usize;
        for &(fid, flags, expiry) in &snapshot {
            if (flags & PFI_UPSTREAM) == 0 {
                continue;
            }
            let face_flags = self.faces.get(fid).map(|f| f.flags);
            let usable = matches!(face_flags, Some(ff) if (ff & FACE_NOSEND) == 0);
            if !usable {
                self.pfi_destroy(serial, fid, PFI_UPSTREAM);
                continue;
            }
            let mut expiry = expiry;
            if (face_flags.unwrap_or(0) & FACE_DC) != 0 && (flags & PFI_DCFACE) == 0 {
                /* 60 ms extra grace before bothering a DC face */
                let grace = ((60_000 + MICROS_PER_TICK - 1) / MICROS_PER_TICK) as u32;
                expiry = expiry.plus_ticks(grace);
                if let Some(e) = self.pit.get_mut(serial) {
                    if let Some(p) = e.pfi_mut(fid, PFI_UPSTREAM) {
                        p.expiry = expiry;
                        p.flags |= PFI_DCFACE;
                    }
                }
            }
            if now.plus_ticks(1).is_before(expiry) {
                let rem = expiry.ticks_since(now);
                if rem < mn {
                    mn = rem;
                }
                upstreams += 1;
                continue;
            }
            if (flags & PFI_UPENDING) != 0 {
                self.strategy_callout(serial, StrategyOp::ExpUp, fid);
            }
            let feeder = viable.iter().find(|(dfid, _)| *dfid != fid).map(|(f, _)| *f);
            match feeder {
                Some(down_fid) => {
                    let (down, up) = match self.pit.get(serial) {
                        Some(e) => (
                            e.pfl
                                .iter()
                                .position(|p| p.faceid == down_fid && p.is_downstream()),
                            e.pfl.iter().position(|p| p.faceid == fid && p.is_upstream()),
                        ),
                        None => (None, None),
                    };
                    if let (Some(down), Some(up)) = (down, up) {
                        self.send_interest(serial, down, up);
                        upstreams += 1;
                        if let Some(e) = self.pit.get(serial) {
                            if let Some(p) = e.pfi(fid, PFI_UPSTREAM) {
                                let rem = p.expiry.ticks_since(now);
                                if rem < mn {
                                    mn = rem;
                                }
                            }
                        }
                    }
                }
                None => {
                    /* expired, and nothing fresh enough to feed it */
                    if let Some(e) = self.pit.get_mut(serial) {
                        if let Some(p) = e.pfi_mut(fid, PFI_UPSTREAM) {
                            p.flags |= PFI_UPHUNGRY;
                        }
                    }
                }
            }
        }
        if pending == 0 && upstreams == 0 {
            self.strategy_callout(serial, StrategyOp::Timeout, NOFACEID);
            self.consume_interest(serial);
            return 0;
        }
        if mn == 0 {
            mn = 1;
        }
        if let Some(e) = self.pit.get_mut(serial) {
            e.ev = Some(h);
            e.ev_due = now.plus_ticks(mn);
        }
        (mn as u64 * MICROS_PER_TICK) as i64
    }

    /// Forward the entry's interest to one upstream, re-encoding the
    /// lifetime/nonce tail from the downstream's state.
    pub(crate) fn send_interest(&mut self, serial: Serial, down: usize, up: usize) {
        let now = self.wtnow();
        let Some(e) = self.pit.get_mut(serial) else { return };
        if down >= e.pfl.len() || up >= e.pfl.len() {
            return;
        }
        let down_faceid = e.pfl[down].faceid;
        let nonce = e.pfl[down].nonce.clone();
        let lifetime = {
            let x = &e.pfl[down];
            crate::pit::round_up_lifetime(
                x.expiry.ticks_since(x.renewed) as u64 * 4096 / WTHZ,
            )
        };
        let up_faceid = e.pfl[up].faceid;
        let was_upending = (e.pfl[up].flags & PFI_UPENDING) != 0;
        {
            let p = &mut e.pfl[up];
            p.nonce = nonce.clone();
            p.renewed = now;
            p.expiry = now.plus_ticks(((lifetime * WTHZ + 4095) / 4096) as u32);
            p.flags |= PFI_UPENDING;
            p.flags &= !(PFI_SENDUPST | PFI_UPHUNGRY);
        }
        let body_len = e.key.len() - 1;
        let mut tail = BytesMut::new();
        if lifetime != DEFAULT_LIFETIME_UNITS {
            ccnb::append_tagged_binary_number(&mut tail, dtag::INTEREST_LIFETIME, lifetime);
        }
        ccnb::append_tagged_blob(&mut tail, dtag::NONCE, nonce.as_bytes());
        ccnb::element_end(&mut tail);
        let head = e.key[..body_len].to_vec();
        if self.faces.get(up_faceid).is_none() {
            return;
        }
        self.interest_faceid = down_faceid;
        self.counters.interests_sent += 1;
        let sec = self.clock.sec;
        if let Some(f) = self.faces.get_mut(up_faceid) {
            f.meters.bump(FaceMeter::InterestsOut, sec, 1);
            if !was_upending {
                f.outstanding_interests += 1;
            }
        }
        if self.debugging(DBG_TRAFFIC) {
            debug!("interest_to face {} i={}", up_faceid, serial);
        }
        self.stuff_and_send(up_faceid, &head, &tail);
    }

    /// Remove a pending interest entirely.
    pub(crate) fn consume_interest(&mut self, serial: Serial) {
        let Some(entry) = self.pit.remove(serial) else { return };
        if let Some(h) = entry.ev {
            self.sched.cancel(h);
        }
        if let Some(h) = entry.strategy_ev {
            self.sched.cancel(h);
        }
        if let Some(e) = self.fib.get_mut(entry.npe) {
            e.pit_serials.retain(|&s| s != serial);
        }
        for p in &entry.pfl {
            if (p.flags & PFI_PENDING) != 0 {
                if let Some(f) = self.faces.get_mut(p.faceid) {
                    f.pending_interests -= 1;
                }
            }
            if (p.flags & PFI_UPSTREAM) != 0 && (p.flags & PFI_UPENDING) != 0 {
                if let Some(f) = self.faces.get_mut(p.faceid) {
                    f.outstanding_interests -= 1;
                }
            }
        }
    }

    /* ------------------------------------------------------------ *
     * Strategy engine glue
     * ------------------------------------------------------------ */

    /// Run the strategy callout for a pit entry.
    pub(crate) fn strategy_callout(&mut self, serial: Serial, op: StrategyOp, faceid: FaceId) {
        let Some(entry_npe) = self.pit.get(serial).map(|e| e.npe) else { return };
        let owner = self
            .fib
            .chain(entry_npe)
            .into_iter()
            .find(|&id| self.fib.get(id).map(|e| e.si.is_some()).unwrap_or(false));
        let mut inst: Box<StrategyInstance> = match owner {
            Some(o) => self
                .fib
                .get_mut(o)
                .and_then(|e| e.si.take())
                .expect("owner has instance"),
            None => Box::new(create_instance("default", None).expect("builtin default")),
        };
        let params = inst.parameters.clone();
        let mut ctx = StrategyCtx {
            d: self,
            serial,
            npe: owner.unwrap_or(entry_npe),
            parameters: params,
            init_error: None,
        };
        inst.strategy.callout(&mut ctx, op, faceid);
        if let Some(o) = owner {
            if let Some(e) = self.fib.get_mut(o) {
                e.si = Some(inst);
            }
        }
        if matches!(op, StrategyOp::First | StrategyOp::Update) {
            if let Some(e) = self.pit.get_mut(serial) {
                for p in e.pfl.iter_mut() {
                    p.flags &= !PFI_ATTENTION;
                }
            }
        }
    }

    /// Schedule (op != Nop) or cancel the per-entry strategy wakeup.
    pub(crate) fn strategy_settimer(&mut self, serial: Serial, micros: u64, op: StrategyOp) {
        let old = self.pit.get_mut(serial).and_then(|e| e.strategy_ev.take());
        if let Some(h) = old {
            self.sched.cancel(h);
        }
        if op == StrategyOp::Nop {
            return;
        }
        let h = self.schedule(micros, Action::StrategyWakeup(serial), op as u64);
        if let Some(e) = self.pit.get_mut(serial) {
            e.strategy_ev = Some(h);
        }
    }

    /// The FIB tap set applying to an entry's prefix.
    pub(crate) fn tap_for_entry(&mut self, serial: Serial) -> Vec<FaceId> {
        let Some(npe) = self.pit.get(serial).map(|e| e.npe) else {
            return Vec::new();
        };
        let fwd = self.fib.nearest_forwarding_npe(npe);
        let faces = &self.faces;
        let _ = self.fib.forward_to(fwd, |f| faces.get(f).is_some());
        self.fib.get(fwd).map(|e| e.tap.clone()).unwrap_or_default()
    }

    /// Install a strategy instance on a prefix.
    pub(crate) fn set_strategy(
        &mut self,
        flatname: &[u8],
        class_id: &str,
        parameters: Option<String>,
    ) -> Result<(), (u32, String)> {
        let Some(inst) = create_instance(class_id, parameters) else {
            return Err((504, format!("unknown strategy '{}'", class_id)));
        };
        let npe = self.fib.seek(flatname);
        self.remove_strategy(flatname);
        let mut inst = Box::new(inst);
        let params = inst.parameters.clone();
        let mut ctx = StrategyCtx {
            d: self,
            serial: 0,
            npe,
            parameters: params,
            init_error: None,
        };
        inst.strategy.callout(&mut ctx, StrategyOp::Init, NOFACEID);
        let err = ctx.init_error.take();
        if let Some(msg) = err {
            return Err((450, msg));
        }
        if let Some(e) = self.fib.get_mut(npe) {
            e.si = Some(inst);
        }
        Ok(())
    }

    /// The strategy effective for a prefix (walking ancestors).
    pub(crate) fn get_strategy(&self, flatname: &[u8]) -> (String, Option<String>) {
        if let Some(start) = self.fib.longest_match(flatname) {
            for id in self.fib.chain(start) {
                if let Some(si) = self.fib.get(id).and_then(|e| e.si.as_ref()) {
                    return (si.class_id.clone(), si.parameters.clone());
                }
            }
        }
        ("default".to_string(), None)
    }

    /// Remove the explicit strategy from a prefix, if any.
    pub(crate) fn remove_strategy(&mut self, flatname: &[u8]) -> bool {
        let Some(npe) = self.fib.lookup(flatname) else { return false };
        let Some(mut inst) = self.fib.get_mut(npe).and_then(|e| e.si.take()) else {
            return false;
        };
        let params = inst.parameters.clone();
        let mut ctx = StrategyCtx {
            d: self,
            serial: 0,
            npe,
            parameters: params,
            init_error: None,
        };
        inst.strategy.callout(&mut ctx, StrategyOp::Finalize, NOFACEID);
        true
    }

    /* ------------------------------------------------------------ *
     * Content
     * ------------------------------------------------------------ */

    pub fn process_incoming_content(&mut self, faceid: FaceId, wire_msg: &[u8]) {
        let pco = match parse_content_object(wire_msg) {
            Ok(p) => p,
            Err(e) => {
                info!("error parsing ContentObject - {}", e);
                return;
            }
        };
        let sec = self.clock.sec;
        if let Some(face) = self.faces.get_mut(faceid) {
            face.meters.bump(FaceMeter::ContentIn, sec, 1);
        } else {
            return;
        }
        if wire_msg.len() > 65535 - 36 {
            warn!("oversize ContentObject from face {} discarded", faceid);
            return;
        }
        /* make the implicit digest component explicit */
        let digest = content_digest(wire_msg);
        let msg = splice_digest_component(wire_msg, &pco, &digest);
        let pco = match parse_content_object(&msg) {
            Ok(p) => p,
            Err(_) => {
                warn!("indigestible ContentObject from face {}", faceid);
                return;
            }
        };
        if self.debugging(DBG_CONTENT) {
            debug!("content_from face {} ({} bytes)", faceid, msg.len());
        }
        let freshness = pco.freshness_seconds;
        let outcome = self.cs.insert(msg, pco, faceid, &mut self.rng);
        let (accession, is_new) = match outcome {
            CsInsertOutcome::New(a) => {
                if self.cs.needs_cleaning() {
                    self.clean_needed();
                }
                self.set_content_timer(a, freshness);
                (a, true)
            }
            CsInsertOutcome::Refreshed(a) => {
                self.set_content_timer(a, freshness);
                (a, false)
            }
            CsInsertOutcome::Duplicate(a) => {
                self.counters.content_dups_recvd += 1;
                debug!("received duplicate ContentObject from {} (accession {})", faceid, a);
                (a, false)
            }
            CsInsertOutcome::Collision => return,
        };
        let n_matches = self.match_interests(accession, Some(faceid), None);
        if is_new {
            if n_matches < 0 {
                self.cs.remove(accession);
                return;
            }
            let gg = self
                .faces
                .get(faceid)
                .map(|f| (f.flags & FACE_GG) != 0)
                .unwrap_or(false);
            if n_matches == 0 && !gg {
                if let Some(e) = self.cs.get_mut(accession) {
                    e.flags |= CONTENT_SLOWSEND;
                }
                self.cs.unsol.push(accession);
            }
        }
        /* if this satisfied interests from the source, do not echo it */
        if let Some(face) = self.faces.get_mut(faceid) {
            for q in face.queues.iter_mut().flatten() {
                q.send_queue.retain(|&a| a != accession);
            }
        }
    }

    /// Find and consume interests matched by this content.  Returns -1
    /// when a local namespace forbids accepting it from `from`.
    pub(crate) fn match_interests(
        &mut self,
        accession: u64,
        from: Option<FaceId>,
        only_face: Option<FaceId>,
    ) -> i32 {
        let flatname = match self.cs.get(accession) {
            Some(e) => e.flatname.clone(),
            None => return 0,
        };
        let ncomps = rust_ccnd_common::name::flatname_ncomps(&flatname);
        let mut start = None;
        for ci in (0..=ncomps).rev() {
            let prefix = prefix_of_flat(&flatname, ci);
            if let Some(id) = self.fib.lookup(prefix) {
                start = Some(id);
                break;
            }
        }
        let Some(start) = start else { return 0 };
        let arrival = self
            .cs
            .get(accession)
            .map(|e| e.arrival_faceid)
            .unwrap_or(NOFACEID);
        let satisfied_face = from.unwrap_or(arrival);
        let from_gg = from
            .and_then(|f| self.faces.get(f))
            .map(|f| (f.flags & FACE_GG) != 0);
        let mut n_matched = 0i32;
        for id in self.fib.chain(start) {
            let stale = self
                .fib
                .get(id)
                .map(|e| e.fgen != self.fib.fgen)
                .unwrap_or(true);
            if stale {
                let faces = &self.faces;
                self.fib.update_forward_to(id, |f| faces.get(f).is_some());
            }
            let local = self
                .fib
                .get(id)
                .map(|e| (e.nsflags & FORW_LOCAL) != 0)
                .unwrap_or(false);
            if local && from_gg == Some(false) {
                return -1;
            }
            n_matched += self.consume_matching_interests(id, accession, only_face, satisfied_face);
        }
        n_matched
    }

    /// Consume interests under one prefix entry that the content matches.
    fn consume_matching_interests(
        &mut self,
        npe: NpeId,
        accession: u64,
        only_face: Option<FaceId>,
        satisfied_face: FaceId,
    ) -> i32 {
        let serials = self
            .fib
            .get(npe)
            .map(|e| e.pit_serials.clone())
            .unwrap_or_default();
        let mut matches = 0;
        for serial in serials {
            let Some(entry) = self.pit.get(serial) else { continue };
            if let Some(of) = only_face {
                let pending_on = entry
                    .pfl
                    .iter()
                    .any(|p| p.faceid == of && (p.flags & PFI_PENDING) != 0);
                if !pending_on {
                    continue;
                }
            }
            let Ok(pi) = parse_interest(&entry.key) else { continue };
            let ok = match self.cs.get(accession) {
                Some(c) => content_matches_interest(&c.msg, &c.pco, &entry.key, &pi),
                None => false,
            };
            if !ok {
                continue;
            }
            let pending: Vec<FaceId> = entry
                .pfl
                .iter()
                .filter(|p| (p.flags & PFI_PENDING) != 0)
                .map(|p| p.faceid)
                .collect();
            for fid in pending {
                self.face_send_queue_insert(fid, accession);
            }
            matches += 1;
            self.strategy_callout(serial, StrategyOp::Satisfied, satisfied_face);
            self.consume_interest(serial);
        }
        matches
    }

    /* ------------------------------------------------------------ *
     * Content queues
     * ------------------------------------------------------------ */

    fn choose_content_delay_class(&self, faceid: FaceId, content_flags: u32) -> u8 {
        let Some(face) = self.faces.get(faceid) else { return CQ_ASAP };
        if (face.flags & (FACE_LINK | FACE_MCAST)) != 0 {
            return if (content_flags & CONTENT_SLOWSEND) != 0 {
                CQ_SLOW
            } else {
                CQ_NORMAL
            };
        }
        if (face.flags & FACE_DGRAM) != 0 {
            return CQ_NORMAL;
        }
        if (face.flags & (FACE_GG | FACE_LOCAL)) != 0 {
            return CQ_ASAP;
        }
        CQ_NORMAL
    }

    fn choose_face_delay(&self, faceid: FaceId, class: u8) -> u32 {
        if class == CQ_ASAP {
            return 1;
        }
        let mcast = self
            .faces
            .get(faceid)
            .map(|f| (f.flags & FACE_MCAST) != 0)
            .unwrap_or(false);
        if mcast {
            let shift = if class == CQ_SLOW { 2 } else { 0 };
            return self.cfg.data_pause_microsec << shift;
        }
        1
    }

    fn randomize_content_delay(&mut self, min_usec: u32, rand_usec: u32) -> u32 {
        let usec = min_usec + rand_usec;
        if usec < 2 {
            return 1;
        }
        if usec <= 20 || rand_usec < 2 {
            return usec;
        }
        let usec = min_usec + self.random() % rand_usec;
        usec.max(1)
    }

    /// Queue a ContentObject to be sent on a face.
    pub(crate) fn face_send_queue_insert(&mut self, faceid: FaceId, accession: u64) -> i32 {
        let content_flags = match self.cs.get(accession) {
            Some(e) => e.flags,
            None => return -1,
        };
        let can = self
            .faces
            .get(faceid)
            .map(|f| f.can_send())
            .unwrap_or(false);
        if !can {
            return -1;
        }
        let class = self.choose_content_delay_class(faceid, content_flags);
        let min_usec = self.choose_face_delay(faceid, class);
        let Some(face) = self.faces.get_mut(faceid) else { return -1 };
        /* it might already be scheduled in another class */
        for (k, q) in face.queues.iter().enumerate() {
            if k != class as usize {
                if let Some(q) = q {
                    if q.contains(accession) {
                        return 0;
                    }
                }
            }
        }
        if face.queues[class as usize].is_none() {
            face.queues[class as usize] = Some(ContentQueue::new(min_usec));
        }
        let (need_sender, min_u, rand_u, qlen) = {
            let q = face.queues[class as usize].as_mut().expect("just created");
            if !q.contains(accession) {
                q.send_queue.push(accession);
            }
            (q.sender.is_none(), q.min_usec, q.rand_usec, q.send_queue.len())
        };
        if need_sender {
            let delay = self.randomize_content_delay(min_u, rand_u);
            let h = self.schedule(delay as u64, Action::ContentSender(faceid, class), 0);
            if let Some(face) = self.faces.get_mut(faceid) {
                if let Some(q) = face.queues[class as usize].as_mut() {
                    q.ready = qlen;
                    q.sender = Some(h);
                }
            }
        }
        0
    }

    /// Send one content object now.
    fn send_content(&mut self, faceid: FaceId, accession: u64) {
        let can = self
            .faces
            .get(faceid)
            .map(|f| f.can_send())
            .unwrap_or(false);
        if !can {
            return;
        }
        let Some(entry) = self.cs.get(accession) else { return };
        let (head, tail) = entry.wire_parts();
        let (head, tail) = (head.to_vec(), tail.to_vec());
        if self.debugging(DBG_CONTENT) {
            debug!("content_to face {} accession {}", faceid, accession);
        }
        let sec = self.clock.sec;
        if let Some(f) = self.faces.get_mut(faceid) {
            f.meters.bump(FaceMeter::ContentOut, sec, 1);
        }
        self.counters.content_items_sent += 1;
        self.stuff_and_send(faceid, &head, &tail);
    }

    /// Scheduled event: drain one face content queue with burst pacing.
    fn content_sender(&mut self, faceid: FaceId, class: u8, h: EventHandle) -> i64 {
        let c = class as usize;
        if c >= CQ_N || self.faces.get(faceid).is_none() {
            return 0;
        }
        let (mut ready, nrun, burst_nsec, queue_len, can_send) = {
            let face = self.faces.get(faceid).expect("checked");
            let Some(q) = face.queues[c].as_ref() else { return 0 };
            (
                q.ready,
                q.nrun,
                q.burst_nsec,
                q.send_queue.len(),
                face.can_send(),
            )
        };
        if !can_send {
            self.clear_sender(faceid, c);
            return 0;
        }
        if ready > queue_len || (ready == 0 && nrun >= 12 && nrun < 120) {
            ready = queue_len;
        }
        let mut nsec: u64 = 0;
        let burst_max = ready.min(2);
        if burst_max == 0 {
            if let Some(q) = self.queue_mut(faceid, c) {
                q.nrun = 0;
            }
        }
        let mut sent = 0usize;
        while sent < burst_max && nsec < 1_000_000 {
            let accession = match self.queue_mut(faceid, c) {
                Some(q) => match q.send_queue.get(sent) {
                    Some(&a) => a,
                    None => break,
                },
                None => return 0,
            };
            match self.cs.get(accession).map(|e| e.size()) {
                None => {
                    if let Some(q) = self.queue_mut(faceid, c) {
                        q.nrun = 0;
                    }
                }
                Some(size) => {
                    self.send_content(faceid, accession);
                    if self.faces.get(faceid).is_none() {
                        return 0;
                    }
                    nsec += burst_nsec as u64 * ((size as u64 + 1023) / 1024);
                    if let Some(q) = self.queue_mut(faceid, c) {
                        q.nrun += 1;
                    }
                }
            }
            sent += 1;
        }
        let (remaining, nrun, min_u, rand_u) = {
            let Some(q) = self.queue_mut(faceid, c) else { return 0 };
            q.ready = ready.saturating_sub(sent);
            q.send_queue.drain(..sent.min(q.send_queue.len()));
            (q.send_queue.len(), q.nrun, q.min_usec, q.rand_usec)
        };
        /* yield to the poll loop between bursts */
        let mut delay = (nsec + 499) / 1000 + 1;
        let ready_now = self.queue_mut(faceid, c).map(|q| q.ready).unwrap_or(0);
        if ready_now > 0 {
            self.keep_sender(faceid, c, h);
            return delay as i64;
        }
        if let Some(q) = self.queue_mut(faceid, c) {
            q.ready = remaining;
        }
        if (12..120).contains(&nrun) {
            /* a preferred provider; forgo the randomized delay */
            if remaining == 0 {
                delay += burst_nsec as u64 / 50;
            }
            self.keep_sender(faceid, c, h);
            return delay as i64;
        }
        let any_live = {
            let accs: Vec<u64> = self
                .queue_mut(faceid, c)
                .map(|q| q.send_queue.clone())
                .unwrap_or_default();
            accs.iter().any(|&a| self.cs.get(a).is_some())
        };
        if any_live {
            if let Some(q) = self.queue_mut(faceid, c) {
                q.nrun = 0;
            }
            let d = self.randomize_content_delay(min_u, rand_u);
            self.keep_sender(faceid, c, h);
            return d as i64;
        }
        if let Some(q) = self.queue_mut(faceid, c) {
            q.send_queue.clear();
            q.ready = 0;
        }
        self.clear_sender(faceid, c);
        0
    }

    fn queue_mut(&mut self, faceid: FaceId, c: usize) -> Option<&mut ContentQueue> {
        self.faces.get_mut(faceid)?.queues[c].as_mut()
    }

    fn keep_sender(&mut self, faceid: FaceId, c: usize, h: EventHandle) {
        if let Some(q) = self.queue_mut(faceid, c) {
            q.sender = Some(h);
        }
    }

    fn clear_sender(&mut self, faceid: FaceId, c: usize) {
        if let Some(q) = self.queue_mut(faceid, c) {
            q.sender = None;
        }
    }

    /* ------------------------------------------------------------ *
     * Freshness and eviction
     * ------------------------------------------------------------ */

    /// Schedule content expiration from its FreshnessSeconds.
    fn set_content_timer(&mut self, accession: u64, freshness: Option<u32>) {
        if self.cfg.force_zero_freshness {
            /* keep just long enough to drain the send queues */
            let micros = 8 * self.cfg.data_pause_microsec as u64 + 10_000;
            self.schedule(micros, Action::ExpireContent(accession), 0);
            return;
        }
        let mut seconds: i64 = match freshness {
            Some(s) => s as i64,
            None => self.cfg.tts_default as i64,
        };
        let limit = self.cfg.tts_limit as i64;
        if seconds <= 0 || (limit > 0 && seconds > limit) {
            seconds = limit;
        }
        if seconds <= 0 {
            return;
        }
        if seconds > ((1u64 << 31) / 1_000_000) as i64 {
            debug!("FreshnessSeconds too large on accession {}", accession);
            return;
        }
        self.schedule(seconds as u64 * 1_000_000, Action::ExpireContent(accession), 0);
    }

    /// Freshness ran out: mark stale, or remove outright when over quota.
    fn expire_content(&mut self, accession: u64) {
        if self.cs.get(accession).is_none() {
            return;
        }
        let n = self.cs.len();
        let cap = self.cs.capacity;
        let no_stale_backlog = self.cs.stale_bounds().is_none();
        if (n - (n >> 3)) > cap || (n > cap && no_stale_backlog) {
            if self.cs.remove(accession) {
                return;
            }
        }
        self.cs.mark_stale(accession);
    }

    pub(crate) fn clean_needed(&mut self) {
        if self.clean_ev.is_none() {
            self.clean_ev = Some(self.schedule(5_000, Action::CleanContent, 0));
        }
    }

    /// Periodic content cleaning: unsolicited first, then the stale
    /// accession range (bounded work per pass), then mark old content
    /// stale for the next round.
    fn clean_pass(&mut self) -> i64 {
        const CHECK_LIMIT: usize = 500;
        if self.cs.len() <= self.cs.capacity {
            self.clean_ev = None;
            self.clean_pos = 0;
            return 0;
        }
        /* toss unsolicited content first */
        let unsol: Vec<u64> = self.cs.unsol.drain(..).collect();
        let (now_batch, rest) = if unsol.len() > CHECK_LIMIT {
            let rest = unsol[CHECK_LIMIT..].to_vec();
            (unsol[..CHECK_LIMIT].to_vec(), rest)
        } else {
            (unsol, Vec::new())
        };
        for a in now_batch {
            let precious = self
                .cs
                .get(a)
                .map(|e| (e.flags & CONTENT_PRECIOUS) != 0)
                .unwrap_or(true);
            if !precious {
                self.cs.remove(a);
            }
        }
        if !rest.is_empty() {
            self.cs.unsol = rest;
            return 500;
        }
        if let Some((min_stale, max_stale)) = self.cs.stale_bounds() {
            let limit = max_stale.min(self.cs.last_accession());
            let mut a = if self.clean_pos > min_stale && self.clean_pos <= max_stale {
                self.clean_pos
            } else {
                min_stale
            };
            let mut budget = CHECK_LIMIT;
            let mut first_surviving_stale = u64::MAX;
            while a <= limit && self.cs.len() > self.cs.capacity {
                if budget == 0 {
                    self.clean_pos = a;
                    if first_surviving_stale < a {
                        self.cs.set_min_stale(first_surviving_stale);
                    } else {
                        self.cs.set_min_stale(a);
                    }
                    return 5_000;
                }
                budget -= 1;
                let is_stale = self.cs.get(a).map(|e| e.is_stale()).unwrap_or(false);
                if is_stale && !self.cs.remove(a) && first_surviving_stale == u64::MAX {
                    first_surviving_stale = a;
                }
                a += 1;
            }
            if a > limit {
                self.cs.reset_stale_bounds();
                self.clean_pos = 0;
            } else {
                self.cs.set_min_stale(a);
                self.clean_pos = 0;
            }
            if self.cs.len() > self.cs.capacity {
                return 5_000;
            }
        } else {
            /* nothing stale: age older content so the next pass can reap */
            let limit = self.cs.last_accession();
            let mut n = self.cs.len();
            let mut a = self.cs.base_accession();
            while a <= limit && n > self.cs.capacity {
                let flags = self.cs.get(a).map(|e| e.flags);
                if let Some(flags) = flags {
                    if (flags & (crate::cs::CONTENT_STALE | CONTENT_PRECIOUS)) == 0 {
                        self.cs.mark_stale(a);
                        n -= 1;
                    }
                }
                a += 1;
            }
            return 5_000;
        }
        self.clean_ev = None;
        0
    }

    /* ------------------------------------------------------------ *
     * Registration and face lifecycle
     * ------------------------------------------------------------ */

    /// Register or refresh (prefix, faceid) in the FIB.
    pub(crate) fn reg_prefix(
        &mut self,
        flatname: &[u8],
        faceid: FaceId,
        flags: i32,
        expires: i32,
    ) -> Result<u32, ()> {
        if self.faces.get(faceid).is_none() {
            return Err(());
        }
        /* LAST doubles as the way to mark a direct-control face */
        if flags >= 0 && (flags as u32 & FORW_LAST) != 0 {
            if let Some(f) = self.faces.get_mut(faceid) {
                f.flags |= FACE_DC;
            }
        }
        let res = self.fib.reg_prefix(flatname, faceid, flags, expires)?;
        let npe = self.fib.lookup(flatname).expect("just registered");
        self.update_npe_children(npe, faceid);
        Ok(res)
    }

    /// Register a prefix given as a URI.
    pub fn reg_uri(&mut self, uri: &str, faceid: FaceId, flags: i32, expires: i32) -> Result<u32, ()> {
        let name = Name::from_uri(uri).map_err(|_| ())?;
        self.reg_prefix(name.flat(), faceid, flags, expires)
    }

    /// A FIB change: accelerate existing interests toward the new face.
    fn update_npe_children(&mut self, npe: NpeId, faceid: FaceId) {
        let mut usec: u64 = 6_000; /* a little time for the registration */
        for serial in self.pit.serials() {
            let Some(entry) = self.pit.get(serial) else { continue };
            let in_subtree = self.fib.chain(entry.npe).contains(&npe);
            if !in_subtree {
                continue;
            }
            let already_upstream = entry
                .pfl
                .iter()
                .any(|p| p.faceid == faceid && p.is_upstream());
            if already_upstream {
                continue;
            }
            /* choose a downstream face to attribute the send to */
            let mut fface = None;
            for p in entry.pfl.iter().filter(|p| p.is_downstream()) {
                let gg = self
                    .faces
                    .get(p.faceid)
                    .map(|f| (f.flags & FACE_GG) != 0)
                    .unwrap_or(false);
                if fface.is_none() || !gg {
                    fface = Some(p.faceid);
                }
            }
            let Some(fface) = fface else { continue };
            let Ok(pi) = parse_interest(&entry.key) else { continue };
            let entry_npe = entry.npe;
            let ob = self.get_outbound_faces(fface, &pi, entry_npe);
            if !ob.contains(&faceid) {
                continue;
            }
            let now = self.wtnow();
            if let Some(e) = self.pit.get_mut(serial) {
                let idx = e.seek_pfi(faceid, PFI_UPSTREAM, now);
                if (e.pfl[idx].flags & PFI_UPENDING) == 0 {
                    e.pfl[idx].set_expiry_from_micros(now, usec);
                    usec += 200;
                }
            }
            self.arm_propagate_event(serial);
        }
    }

    /// Called when a face is first created, and possibly again when it
    /// leaves the undecided state.
    pub(crate) fn register_new_face(&mut self, faceid: FaceId) {
        let Some(face) = self.faces.get(faceid) else { return };
        if faceid == 0 || (face.flags & (FACE_UNDECIDED | FACE_PASSIVE)) != 0 {
            return;
        }
        let gg = (face.flags & FACE_GG) != 0;
        self.face_status_change(faceid);
        if !gg && !self.cfg.autoreg.is_empty() {
            let uris = self.cfg.autoreg.clone();
            for uri in uris {
                let _ = self.reg_uri(
                    &uri,
                    faceid,
                    (FORW_CAPTURE_OK | FORW_CHILD_INHERIT | FORW_ACTIVE) as i32,
                    0x7FFF_FFFF,
                );
            }
        }
        self.link_state_init(faceid);
    }

    /// Start link sequence probing on fresh unicast datagram faces.
    fn link_state_init(&mut self, faceid: FaceId) {
        if let Some(face) = self.faces.get_mut(faceid) {
            if (face.flags & (FACE_DGRAM | FACE_MCAST | FACE_GG)) == FACE_DGRAM {
                face.flags |= FACE_SEQPROBE;
            }
        }
    }

    /// Fix builtin face attributes and queue notifications.
    pub(crate) fn face_status_change(&mut self, faceid: FaceId) {
        if let Some(face) = self.faces.get_mut(faceid) {
            let mut set = 0u32;
            if (face.flags & (FACE_UNDECIDED | FACE_PASSIVE | FACE_NOSEND)) == 0 {
                set |= 1 << FAM_VALID;
            }
            if (face.flags & FACE_GG) != 0 {
                set |= 1 << FAM_APP;
            }
            if (face.flags & FACE_MCAST) != 0 {
                set |= 1 << FAM_BCAST;
            }
            if (face.flags & FACE_DC) != 0 {
                set |= 1 << FAM_DC;
            }
            let clear = (1 << FAM_VALID) | (1 << FAM_APP) | (1 << FAM_BCAST) | (1 << FAM_DC);
            face.faceattr_packed = (face.faceattr_packed & !clear) | set;
        }
        if self.internal.is_some() {
            self.with_internal(|d, ic| {
                ic.note_face_change(d, faceid);
                ic.schedule_adjacency_negotiation(d, faceid);
            });
        } else {
            /* the internal client is on the stack above us */
            self.pending_status.push(faceid);
        }
    }

    /// Tear down a face completely.
    pub fn destroy_face(&mut self, faceid: FaceId) -> bool {
        let Some(face) = self.faces.release(faceid) else { return false };
        let undecided = (face.flags & FACE_UNDECIDED) != 0;
        for q in face.queues.iter().flatten() {
            if let Some(h) = q.sender {
                self.sched.cancel(h);
            }
        }
        self.io.forget_fd(face.recv_fd);
        crate::io::close_face_io(face);
        info!(
            "{} face id {} (slot {})",
            if undecided { "recycling" } else { "releasing" },
            faceid,
            faceid & crate::face::MAXFACES
        );
        if !undecided {
            self.with_internal(|d, ic| ic.note_face_change(d, faceid));
        }
        true
    }

    /* ------------------------------------------------------------ *
     * Stuffing
     * ------------------------------------------------------------ */

    /// Send a message, possibly wrapped in a PDU and with small link
    /// maintenance messages stuffed behind it.
    pub(crate) fn stuff_and_send(&mut self, faceid: FaceId, data1: &[u8], data2: &[u8]) {
        let Some(face) = self.faces.get(faceid) else { return };
        let flags = face.flags;
        let recvcount = face.recvcount;
        if (flags & FACE_LINK) != 0 {
            let mut c = BytesMut::with_capacity(data1.len() + data2.len() + 16);
            ccnb::element_begin(&mut c, dtag::CCN_PROTOCOL_DATA_UNIT);
            c.extend_from_slice(data1);
            c.extend_from_slice(data2);
            self.stuff_interest(faceid, &mut c);
            self.append_link_stuff(faceid, &mut c);
            ccnb::element_end(&mut c);
            self.send(faceid, &c);
            return;
        }
        if !data2.is_empty()
            || self.cfg.mtu > data1.len() + data2.len()
            || (flags & (FACE_SEQOK | FACE_SEQPROBE)) != 0
            || recvcount == 0
        {
            let mut c = BytesMut::with_capacity(data1.len() + data2.len() + 16);
            c.extend_from_slice(data1);
            c.extend_from_slice(data2);
            self.stuff_interest(faceid, &mut c);
            self.append_link_stuff(faceid, &mut c);
            self.send(faceid, &c);
            return;
        }
        let data = data1.to_vec();
        self.send(faceid, &data);
    }

    /// Stuff a quiet datagram link with a link-check probe interest.
    fn stuff_interest(&mut self, faceid: FaceId, c: &mut BytesMut) -> usize {
        let Some(face) = self.faces.get(faceid) else { return 0 };
        if face.recvcount > 0 {
            return 0;
        }
        let checkflags = FACE_DGRAM | FACE_MCAST | FACE_GG | FACE_LC;
        if (face.flags & checkflags) != FACE_DGRAM {
            return 0;
        }
        if self.cfg.mtu > 0 && c.len() + 64 > self.cfg.mtu {
            return 0;
        }
        let name = match Name::from_uri("ccnx:/%C1.M.S.neighborhood") {
            Ok(n) => n,
            Err(_) => return 0,
        };
        let mut t = packet::InterestTemplate::new(name);
        t.scope = Some(2);
        let nonce = self.generate_nonce(faceid);
        t.nonce = Some(nonce);
        let probe = t.encode();
        c.extend_from_slice(&probe);
        self.counters.interests_stuffed += 1;
        let sec = self.clock.sec;
        if let Some(f) = self.faces.get_mut(faceid) {
            f.flags |= FACE_LC;
            f.meters.bump(FaceMeter::InterestsOut, sec, 1);
        }
        if self.debugging(DBG_TRAFFIC) {
            debug!("stuff_interest_to face {}", faceid);
        }
        1
    }

    /// Append link sequence-number stuff when the peer plays along.
    fn append_link_stuff(&mut self, faceid: FaceId, c: &mut BytesMut) {
        let Some(face) = self.faces.get_mut(faceid) else { return };
        if (face.flags & (FACE_SEQOK | FACE_SEQPROBE)) == 0 {
            return;
        }
        let seq = face.pktseq as u64;
        face.pktseq = face.pktseq.wrapping_add(1);
        face.flags &= !FACE_SEQPROBE;
        c.extend_from_slice(&packet::encode_sequence_number(seq));
    }

    /* ------------------------------------------------------------ *
     * Housekeeping
     * ------------------------------------------------------------ */

    pub(crate) fn reap_needed(&mut self, init_delay_usec: u64) {
        if self.reaper.is_none() {
            self.reaper = Some(self.schedule(init_delay_usec, Action::Reap, 0));
        }
    }

    /// The reaper: inactive datagram faces, idle name prefixes, expired
    /// nonces, and the external stop signal.
    fn reap(&mut self) -> i64 {
        self.check_dgram_faces();
        let faces = &self.faces;
        self.fib.check_entries(|f| faces.get(f).is_some());
        let now = self.wtnow();
        self.nonces.prune(now);
        self.io.check_comm_file(&mut self.running);
        (2 * INTEREST_LIFETIME_MICROSEC) as i64
    }

    /// Sweep datagram child faces that have gone quiet.
    fn check_dgram_faces(&mut self) -> usize {
        let mut victims = Vec::new();
        for face in self.faces.iter_mut() {
            if (face.flags & FACE_DGRAM) == 0 || face.addr.is_none() {
                continue;
            }
            face.flags &= !FACE_LC; /* rate limit link check interests */
            if face.recvcount == 0 {
                if (face.flags & (FACE_PERMANENT | FACE_ADJ)) == 0 {
                    victims.push(face.faceid);
                }
            } else if face.recvcount == 1 {
                face.recvcount = 0;
            } else {
                face.recvcount = 1; /* go around twice */
            }
        }
        let n = victims.len();
        for faceid in victims {
            self.destroy_face(faceid);
        }
        n
    }

    fn age_forwarding_needed(&mut self) {
        if self.age_forwarding_ev.is_none() {
            self.age_forwarding_ev = Some(self.schedule(
                crate::fib::FWU_SECS as u64 * 1_000_000,
                Action::AgeForwarding,
                0,
            ));
        }
    }

    fn age_forwarding_pass(&mut self) -> i64 {
        let faces = &self.faces;
        self.fib.age_forwarding(|f| faces.get(f).is_some());
        (crate::fib::FWU_SECS as u64 * 1_000_000) as i64
    }

    /// Post a comment line on the notice stream.
    pub(crate) fn notice_comment(&mut self, text: &str) {
        let text = text.to_string();
        self.with_internal(|d, ic| ic.notice_text(d, &text));
    }
}

/// Entropy for the daemon PRNG, from the OS when possible.
fn getrandom_seed(seed: &mut [u8; 32]) {
    use std::io::Read;
    if let Ok(mut f) = std::fs::File::open("/dev/urandom") {
        if f.read_exact(seed).is_ok() {
            return;
        }
    }
    let pid = std::process::id() as u64;
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    seed[..8].copy_from_slice(&pid.to_le_bytes());
    seed[8..16].copy_from_slice(&t.to_le_bytes());
}

/// Flatname of an interest's name components.
pub(crate) fn interest_name_flat(msg: &[u8], pi: &ParsedInterest) -> Vec<u8> {
    let mut comps = Vec::with_capacity(pi.prefix_comps());
    for i in 0..pi.prefix_comps() {
        comps.push(packet::component_body(msg, pi.comps[i]).unwrap_or(&[]));
    }
    rust_ccnd_common::name::flatname_from_components(comps)
}

/// The flatname prefix covering the first `n` components.
fn prefix_of_flat(flat: &[u8], n: usize) -> &[u8] {
    let mut pos = 0usize;
    for _ in 0..n {
        if pos + 2 > flat.len() {
            break;
        }
        let len = u16::from_be_bytes([flat[pos], flat[pos + 1]]) as usize;
        pos += 2 + len;
    }
    &flat[..pos.min(flat.len())]
}

/// Shared scaffolding for the in-process tests: a daemon with a tempdir
/// keystore, socketless faces, manual clock stepping, and packet
/// builders.  Strategy and adjacency tests reuse it too.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    pub(crate) use crate::face::FaceIo;
    use rust_ccnd_common::packet::{encode_content_object, ContentObjectParams, InterestTemplate};

    pub(crate) fn test_daemon() -> (Daemon, tempfile::TempDir) {
        let mut cfg = Config::default();
        cfg.capacity = 16;
        let mut d = Daemon::new(cfg);
        d.cs.capacity = 16;
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::open(dir.path(), "9695", &mut d.rng).unwrap();
        d.start_internal(ks);
        (d, dir)
    }

    /// A socketless face that stays out of adjacency negotiation.
    pub(crate) fn add_face(d: &mut Daemon, flags: u32) -> FaceId {
        let flags = flags | crate::face::FACE_NORECV;
        let fid = d.faces.enroll(Face::new(FaceIo::None, flags)).unwrap();
        d.register_new_face(fid);
        fid
    }

    /// A face with exactly the given flags and no lifecycle callouts,
    /// for driving the adjacency machinery by hand.
    pub(crate) fn add_plain_face(d: &mut Daemon, flags: u32) -> FaceId {
        d.faces.enroll(Face::new(FaceIo::None, flags)).unwrap()
    }

    /// Advance the clock in steps, firing everything that comes due.
    pub(crate) fn run_for(d: &mut Daemon, micros: u64) {
        let mut left = micros;
        while left > 0 {
            let step = left.min(50_000);
            d.clock.advance_micros(step);
            left -= step;
            let _ = d.run_due();
            d.process_internal_client_buffer();
        }
    }

    pub(crate) fn make_content(uri: &str, payload: &[u8], freshness: Option<u32>) -> Vec<u8> {
        let mut params = ContentObjectParams::new(Name::from_uri(uri).unwrap(), [9; 32], 77);
        params.freshness_seconds = freshness;
        encode_content_object(&params, payload, |s| content_digest(s).to_vec()).to_vec()
    }

    pub(crate) fn make_interest(uri: &str, nonce: Option<Vec<u8>>) -> Vec<u8> {
        let mut t = InterestTemplate::new(Name::from_uri(uri).unwrap());
        t.nonce = nonce;
        t.encode().to_vec()
    }

    /// Wrap a control payload the way clients do: a signed ContentObject
    /// that rides in the request name.
    pub(crate) fn signed_arg(payload: &[u8]) -> Vec<u8> {
        let params = ContentObjectParams::new(Name::from_uri("ccnx:/req").unwrap(), [3; 32], 5);
        encode_content_object(&params, payload, |s| content_digest(s).to_vec()).to_vec()
    }

    /// A scope-1 request interest for `ccnx:/ccnx/<id>/<op>/<arg>`.
    pub(crate) fn control_interest(d: &Daemon, op: &str, arg: &[u8], nonce: u8) -> Vec<u8> {
        let mut name = Name::new();
        name.append_str("ccnx");
        name.append(&d.ccnd_id());
        name.append_str(op);
        name.append(arg);
        let mut t = InterestTemplate::new(name);
        t.scope = Some(1);
        t.nonce = Some(vec![nonce; 12]);
        t.encode().to_vec()
    }

    /// Seed a PIT entry by hand: one pending downstream, upstreams
    /// flagged for strategy attention.  Returns (serial, npe).
    pub(crate) fn seed_pit_entry(
        d: &mut Daemon,
        uri: &str,
        down: FaceId,
        ups: &[FaceId],
    ) -> (Serial, NpeId) {
        let imsg = make_interest(uri, Some(vec![0xAB; 12]));
        let pi = parse_interest(&imsg).unwrap();
        let key = pi.pit_key(&imsg);
        let flat = interest_name_flat(&imsg, &pi);
        let npe = d.fib.seek(&flat);
        let now = d.wtnow();
        let (serial, created) = d.pit.seek(&key, npe, now);
        if created {
            d.fib.get_mut(npe).unwrap().pit_serials.push(serial);
        }
        let e = d.pit.get_mut(serial).unwrap();
        let i = e.seek_pfi(down, PFI_DNSTREAM, now);
        e.pfl[i].flags |= PFI_PENDING;
        e.pfl[i].set_expiry_from_lifetime(now, DEFAULT_LIFETIME_UNITS);
        for &u in ups {
            let i = e.seek_pfi(u, PFI_UPSTREAM, now);
            e.pfl[i].flags |= PFI_ATTENTION;
        }
        if let Some(f) = d.faces.get_mut(down) {
            f.pending_interests += 1;
        }
        (serial, npe)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use rust_ccnd_common::packet::{
        ForwardingEntry, InterestTemplate, StrategySelection,
    };

    #[test]
    fn cache_hit_satisfies_without_pit_entry() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, FACE_GG);
        let b = add_face(&mut d, 0);
        d.process_incoming_content(a, &make_content("ccnx:/test/hello", b"world", Some(60)));
        assert_eq!(d.cs_len(), 1);
        d.process_incoming_interest(b, &make_interest("ccnx:/test/hello", Some(vec![1; 6])));
        assert_eq!(d.pit_len(), 0);
        run_for(&mut d, 20_000);
        assert_eq!(d.counters().content_items_sent, 1);
    }

    #[test]
    fn interest_forwards_upstream_once() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        d.reg_uri(
            "ccnx:/x",
            b,
            (crate::fib::FORW_ACTIVE | crate::fib::FORW_CHILD_INHERIT) as i32,
            1000,
        )
        .unwrap();
        let nonce = vec![7u8; 12];
        d.process_incoming_interest(a, &make_interest("ccnx:/x/y", Some(nonce.clone())));
        assert_eq!(d.pit_len(), 1);
        {
            let serial = d.pit.serials()[0];
            let e = d.pit.get(serial).unwrap();
            let down = e.pfi(a, PFI_DNSTREAM).unwrap();
            assert!(down.flags & PFI_PENDING != 0);
            assert!(e.pfi(b, PFI_UPSTREAM).is_some());
        }
        run_for(&mut d, 300_000);
        assert_eq!(d.counters().interests_sent, 1);
        let serial = d.pit.serials()[0];
        let e = d.pit.get(serial).unwrap();
        let up = e.pfi(b, PFI_UPSTREAM).unwrap();
        assert!(up.flags & PFI_UPENDING != 0);
        assert_eq!(up.nonce.as_bytes(), &nonce[..]);
        assert_eq!(d.faces.get(a).unwrap().pending_interests, 1);
        assert_eq!(d.faces.get(b).unwrap().outstanding_interests, 1);
    }

    #[test]
    fn duplicate_nonce_is_suppressed() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let c = add_face(&mut d, 0);
        d.reg_uri(
            "ccnx:/x",
            b,
            (crate::fib::FORW_ACTIVE | crate::fib::FORW_CHILD_INHERIT) as i32,
            1000,
        )
        .unwrap();
        let nonce = vec![7u8; 12];
        d.process_incoming_interest(a, &make_interest("ccnx:/x/y", Some(nonce.clone())));
        run_for(&mut d, 300_000);
        assert_eq!(d.counters().interests_sent, 1);
        /* the same nonce from another face must not fan out again */
        d.process_incoming_interest(c, &make_interest("ccnx:/x/y", Some(nonce)));
        assert_eq!(d.pit_len(), 1);
        let serial = d.pit.serials()[0];
        let e = d.pit.get(serial).unwrap();
        let dn = e.pfi(c, PFI_DNSTREAM).unwrap();
        assert!(dn.flags & PFI_SUPDATA != 0);
        assert!(dn.flags & PFI_PENDING == 0);
        run_for(&mut d, 300_000);
        assert_eq!(d.counters().interests_sent, 1);
    }

    #[test]
    fn unanswered_interest_times_out_cleanly() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        d.reg_uri(
            "ccnx:/x",
            b,
            (crate::fib::FORW_ACTIVE | crate::fib::FORW_CHILD_INHERIT) as i32,
            1000,
        )
        .unwrap();
        let mut t = InterestTemplate::new(Name::from_uri("ccnx:/x/y").unwrap());
        t.nonce = Some(vec![5; 12]);
        t.lifetime_units = Some(1024); /* quarter second */
        d.process_incoming_interest(a, &t.encode());
        assert_eq!(d.pit_len(), 1);
        run_for(&mut d, 2_000_000);
        assert_eq!(d.pit_len(), 0);
        assert_eq!(d.faces.get(a).unwrap().pending_interests, 0);
        assert_eq!(d.faces.get(b).unwrap().outstanding_interests, 0);
    }

    #[test]
    fn content_satisfies_pending_interest() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        d.reg_uri(
            "ccnx:/x",
            b,
            (crate::fib::FORW_ACTIVE | crate::fib::FORW_CHILD_INHERIT) as i32,
            1000,
        )
        .unwrap();
        d.process_incoming_interest(a, &make_interest("ccnx:/x/y", Some(vec![2; 12])));
        run_for(&mut d, 300_000);
        assert_eq!(d.pit_len(), 1);
        d.process_incoming_content(b, &make_content("ccnx:/x/y", b"payload", Some(10)));
        assert_eq!(d.pit_len(), 0);
        run_for(&mut d, 20_000);
        assert_eq!(d.counters().content_items_sent, 1);
        assert_eq!(d.faces.get(a).unwrap().pending_interests, 0);
        assert_eq!(d.faces.get(b).unwrap().outstanding_interests, 0);
    }

    #[test]
    fn pending_counts_match_pit_contents() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let c = add_face(&mut d, 0);
        d.process_incoming_interest(a, &make_interest("ccnx:/p/1", Some(vec![1; 12])));
        d.process_incoming_interest(c, &make_interest("ccnx:/p/2", Some(vec![2; 12])));
        d.process_incoming_interest(c, &make_interest("ccnx:/p/3", Some(vec![3; 12])));
        let mut per_face: std::collections::HashMap<FaceId, i32> = Default::default();
        for serial in d.pit.serials() {
            for p in &d.pit.get(serial).unwrap().pfl {
                if p.is_downstream() && (p.flags & PFI_PENDING) != 0 {
                    *per_face.entry(p.faceid).or_default() += 1;
                }
            }
        }
        assert_eq!(
            per_face.get(&a).copied().unwrap_or(0),
            d.faces.get(a).unwrap().pending_interests
        );
        assert_eq!(
            per_face.get(&c).copied().unwrap_or(0),
            d.faces.get(c).unwrap().pending_interests
        );
    }

    #[test]
    fn freshness_expiry_marks_content_stale() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, FACE_GG);
        d.process_incoming_content(a, &make_content("ccnx:/f/1", b"v", Some(1)));
        assert_eq!(d.cs_len(), 1);
        run_for(&mut d, 2_500_000);
        assert_eq!(d.cs.n_stale, 1);
        /* a fresh-only interest finds nothing */
        d.process_incoming_interest(a, &make_interest("ccnx:/f", Some(vec![4; 6])));
        /* nothing was sent because nothing matched */
        run_for(&mut d, 20_000);
        assert_eq!(d.counters().content_items_sent, 0);
    }

    #[test]
    fn clean_pass_reaps_stale_down_to_capacity() {
        let (mut d, _k) = test_daemon();
        d.cs.capacity = 4;
        let a = add_face(&mut d, FACE_GG);
        for i in 0..10 {
            let uri = format!("ccnx:/bulk/{:02}", i);
            d.process_incoming_content(a, &make_content(&uri, b"v", Some(1)));
        }
        assert_eq!(d.cs_len(), 10);
        run_for(&mut d, 3_000_000);
        /* expiries removed or staled; cleaning runs down to capacity */
        d.clean_needed();
        run_for(&mut d, 1_000_000);
        assert!(d.cs_len() <= 4, "store still holds {}", d.cs_len());
    }

    #[test]
    fn prefixreg_request_round_trip() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, FACE_GG);
        let fe = ForwardingEntry {
            action: Some("prefixreg".into()),
            name: Some(Name::from_uri("ccnx:/reg/me").unwrap()),
            ccnd_id: Some(d.ccnd_id().to_vec()),
            faceid: Some(a),
            flags: Some(crate::fib::FORW_ACTIVE | crate::fib::FORW_CHILD_INHERIT),
            lifetime_seconds: Some(100),
        };
        let arg = signed_arg(&fe.encode());
        d.process_incoming_interest(a, &control_interest(&d, "prefixreg", &arg, 6));
        run_for(&mut d, 600_000);
        let flat = Name::from_uri("ccnx:/reg/me").unwrap();
        let npe = d.fib.lookup(flat.flat()).expect("prefix registered");
        let entry = d.fib.get(npe).unwrap();
        assert!(entry.forwarding.iter().any(|f| f.faceid == a));
        /* and the signed response made it back out */
        assert!(d.counters().content_items_sent >= 1);
        assert_eq!(d.pit_len(), 0);
    }

    #[test]
    fn strategy_requests_round_trip() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, FACE_GG);
        let prefix = Name::from_uri("ccnx:/strat/zone").unwrap();
        /* setstrategy installs the class on the prefix */
        let ss = StrategySelection {
            action: Some("setstrategy".into()),
            name: Some(prefix.clone()),
            ccnd_id: Some(d.ccnd_id().to_vec()),
            class_id: Some("loadsharing".into()),
            parameters: None,
            lifetime_seconds: None,
        };
        let arg = signed_arg(&ss.encode());
        d.process_incoming_interest(a, &control_interest(&d, "setstrategy", &arg, 0x11));
        run_for(&mut d, 600_000);
        assert_eq!(d.get_strategy(prefix.flat()).0, "loadsharing");
        assert_eq!(d.pit_len(), 0);
        let replies_so_far = d.counters().content_items_sent;
        assert!(replies_so_far >= 1);
        /* getstrategy walks ancestors: ask about a deeper name */
        let deeper = Name::from_uri("ccnx:/strat/zone/deeper").unwrap();
        let ss = StrategySelection {
            action: Some("getstrategy".into()),
            name: Some(deeper.clone()),
            ccnd_id: Some(d.ccnd_id().to_vec()),
            class_id: None,
            parameters: None,
            lifetime_seconds: None,
        };
        let arg = signed_arg(&ss.encode());
        d.process_incoming_interest(a, &control_interest(&d, "getstrategy", &arg, 0x22));
        run_for(&mut d, 600_000);
        assert_eq!(d.get_strategy(deeper.flat()).0, "loadsharing");
        assert!(d.counters().content_items_sent > replies_so_far);
        assert_eq!(d.pit_len(), 0);
        /* removestrategy reverts the prefix to the builtin default */
        let ss = StrategySelection {
            action: Some("removestrategy".into()),
            name: Some(prefix.clone()),
            ccnd_id: Some(d.ccnd_id().to_vec()),
            class_id: None,
            parameters: None,
            lifetime_seconds: None,
        };
        let arg = signed_arg(&ss.encode());
        d.process_incoming_interest(a, &control_interest(&d, "removestrategy", &arg, 0x33));
        run_for(&mut d, 600_000);
        assert_eq!(d.get_strategy(prefix.flat()).0, "default");
        assert_eq!(d.pit_len(), 0);
    }

    #[test]
    fn unknown_strategy_class_is_nacked() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, FACE_GG);
        let prefix = Name::from_uri("ccnx:/strat/bad").unwrap();
        let ss = StrategySelection {
            action: Some("setstrategy".into()),
            name: Some(prefix.clone()),
            ccnd_id: Some(d.ccnd_id().to_vec()),
            class_id: Some("bogus".into()),
            parameters: None,
            lifetime_seconds: None,
        };
        let arg = signed_arg(&ss.encode());
        d.process_incoming_interest(a, &control_interest(&d, "setstrategy", &arg, 0x44));
        run_for(&mut d, 600_000);
        /* nothing installed, but a NACK reply still satisfied the ask */
        assert_eq!(d.get_strategy(prefix.flat()).0, "default");
        assert!(d.counters().content_items_sent >= 1);
        assert_eq!(d.pit_len(), 0);
    }

    #[test]
    fn destroyface_request_removes_face() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, FACE_GG);
        let victim = add_face(&mut d, 0);
        let fi = rust_ccnd_common::packet::FaceInstance {
            action: Some("destroyface".into()),
            ccnd_id: Some(d.ccnd_id().to_vec()),
            faceid: Some(victim),
            ..Default::default()
        };
        let arg = signed_arg(&fi.encode());
        d.process_incoming_interest(a, &control_interest(&d, "destroyface", &arg, 0x55));
        run_for(&mut d, 600_000);
        assert!(d.faces.get(victim).is_none());
        assert!(d.counters().content_items_sent >= 1);
        assert_eq!(d.pit_len(), 0);
    }

    #[test]
    fn newface_request_creates_udp_peer() {
        let (mut d, _k) = test_daemon();
        /* a real wildcard UDP face so the new peer has a sending socket */
        let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let wild = d
            .faces
            .enroll(Face::new(
                FaceIo::Udp(sock),
                FACE_PASSIVE | FACE_DGRAM | crate::face::FACE_INET,
            ))
            .unwrap();
        d.ipv4_faceid = wild;
        let a = add_face(&mut d, FACE_GG);
        let fi = rust_ccnd_common::packet::FaceInstance {
            action: Some("newface".into()),
            ccnd_id: Some(d.ccnd_id().to_vec()),
            ipproto: Some(17),
            host: Some("127.0.0.1".into()),
            port: Some("9699".into()),
            ..Default::default()
        };
        let arg = signed_arg(&fi.encode());
        d.process_incoming_interest(a, &control_interest(&d, "newface", &arg, 0x66));
        run_for(&mut d, 600_000);
        let peer: std::net::SocketAddr = "127.0.0.1:9699".parse().unwrap();
        let fid = *d.faces.dgram_by_addr.get(&peer).expect("peer face created");
        let face = d.faces.get(fid).unwrap();
        assert!(face.flags & FACE_PERMANENT != 0);
        assert!(face.flags & FACE_DGRAM != 0);
        assert_eq!(face.sendface, wild);
        /* the completed FaceInstance went back to the requester */
        assert!(d.counters().content_items_sent >= 1);
    }

    #[test]
    fn notice_line_reports_flags_peer_and_adjacency_uri() {
        let (mut d, _k) = test_daemon();
        let f = add_face(&mut d, 0);
        let peer: std::net::SocketAddr = "10.1.2.3:9695".parse().unwrap();
        d.faces.get_mut(f).unwrap().addr = Some(peer);
        d.set_face_guid(f, &[1, 2, 3]).unwrap();
        d.faces.get_mut(f).unwrap().flags |= FACE_ADJ;
        let flags = d.faces.get(f).unwrap().flags;
        let line = d
            .with_internal(|d, ic| ic.face_notice_line(d, f))
            .unwrap();
        assert_eq!(
            line,
            format!(
                "newface({}, {:#x}, 10.1.2.3:9695, ccnx:/%C1.M.FACE/%C1.M.G%00%01%02%03);\n",
                f, flags
            )
        );
    }

    #[test]
    fn notice_line_reports_destroyed_faces() {
        let (mut d, _k) = test_daemon();
        let f = add_face(&mut d, 0);
        d.destroy_face(f);
        let line = d
            .with_internal(|d, ic| ic.face_notice_line(d, f))
            .unwrap();
        assert_eq!(line, format!("destroyface({});\n", f));
    }

    #[test]
    fn scope1_interest_from_external_face_is_dropped() {
        let (mut d, _k) = test_daemon();
        let ext = add_face(&mut d, 0);
        let mut t = InterestTemplate::new(Name::from_uri("ccnx:/s").unwrap());
        t.scope = Some(1);
        t.nonce = Some(vec![8; 6]);
        d.process_incoming_interest(ext, &t.encode());
        assert_eq!(d.pit_len(), 0);
        assert_eq!(d.counters().interests_dropped, 1);
    }

    #[test]
    fn local_namespace_rejects_external_faces() {
        let (mut d, _k) = test_daemon();
        let ext = add_face(&mut d, 0);
        /* %C1.M.S.localhost is registered LOCAL by the internal client */
        let mut t =
            InterestTemplate::new(Name::from_uri("ccnx:/%C1.M.S.localhost/x").unwrap());
        t.nonce = Some(vec![9; 6]);
        d.process_incoming_interest(ext, &t.encode());
        assert_eq!(d.pit_len(), 0);
        assert!(d.counters().interests_dropped >= 1);
    }
}

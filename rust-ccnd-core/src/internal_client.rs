//! The internal client: face 0's other half.
//!
//! Control-plane namespaces are served here over the ordinary
//! Interest/ContentObject path.  The daemon's sends to face 0 arrive at
//! [`InternalClient::dispatch`]; whatever the client produces is drained
//! back into face 0 as input at the top of every loop turn.

use crate::daemon::Daemon;
use crate::face::{FaceId, FACE_GG, FACE_REGOK};
use crate::fib::{
    FORW_ACTIVE, FORW_ADVERTISE, FORW_CAPTURE, FORW_CHILD_INHERIT, FORW_LOCAL, FORW_PUBMASK,
};
use crate::keystore::{Keystore, SigningParams};
use crate::sched::{Action, EventHandle, WrappedTime, WTHZ};
use log::{debug, info};
use rust_ccnd_common::name::Name;
use rust_ccnd_common::packet::{
    classify, parse_content_object, parse_interest, FaceInstance, ForwardingEntry,
    InterestTemplate, MessageKind, ParsedInterest, StrategySelection, AOK_NEW, CONTENT_TYPE_KEY,
    CONTENT_TYPE_NACK,
};
use std::net::ToSocketAddrs;

/// Registered operations, one per served namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Ping,
    NewFace,
    DestroyFace,
    Prefixreg,
    Selfreg,
    Unreg,
    SetStrategy,
    GetStrategy,
    RemoveStrategy,
    Notice,
    Service,
    Adjacency,
}

struct Filter {
    prefix: Vec<u8>,
    ncomps: usize,
    op: Op,
}

/// Why we expressed an interest ourselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upcall {
    SolicitResponse(FaceId),
    IncomingAdjacency(FaceId),
}

pub(crate) struct Expressed {
    pub name_flat: Vec<u8>,
    pub wire: Vec<u8>,
    pub kind: Upcall,
    pub deadline: WrappedTime,
    pub retried: bool,
}

struct Notice {
    base: Name,
    seq: u64,
    pending: String,
}

pub struct InternalClient {
    pub(crate) keystore: Keystore,
    pub(crate) ccnd_id: [u8; 32],
    outbuf: Vec<Vec<u8>>,
    filters: Vec<Filter>,
    pub(crate) expressed: Vec<Expressed>,
    notice: Option<Notice>,
    chface: Vec<FaceId>,
    notice_push_ev: Option<EventHandle>,
    service_cob: Option<Vec<u8>>,
    neighbor_cob: Option<Vec<u8>>,
    timestamp: u64,
}

impl InternalClient {
    /// Register the served namespaces and their FIB entries.
    pub fn start(d: &mut Daemon, keystore: Keystore) -> Self {
        let ccnd_id = keystore.ccnd_id();
        let mut ic = Self {
            keystore,
            ccnd_id,
            outbuf: Vec::new(),
            filters: Vec::new(),
            expressed: Vec::new(),
            notice: None,
            chface: Vec::new(),
            notice_push_ev: None,
            service_cob: None,
            neighbor_cob: None,
            timestamp: 1,
        };
        let idname = ic.ccnd_uri_name();
        ic.listen(d, extend(&idname, &["ping"]), Op::Ping, false);
        ic.listen(d, extend(&idname, &["newface"]), Op::NewFace, false);
        ic.listen(d, extend(&idname, &["destroyface"]), Op::DestroyFace, false);
        ic.listen(d, extend(&idname, &["prefixreg"]), Op::Prefixreg, false);
        ic.listen(d, extend(&idname, &["selfreg"]), Op::Selfreg, false);
        ic.listen(d, extend(&idname, &["unreg"]), Op::Unreg, false);
        ic.listen(d, extend(&idname, &["setstrategy"]), Op::SetStrategy, false);
        ic.listen(d, extend(&idname, &["getstrategy"]), Op::GetStrategy, false);
        ic.listen(d, extend(&idname, &["removestrategy"]), Op::RemoveStrategy, false);
        ic.listen(d, extend(&idname, &["notice.txt"]), Op::Notice, false);
        let localhost = Name::from_uri("ccnx:/%C1.M.S.localhost/%C1.M.SRV/ccnd")
            .expect("static uri");
        ic.listen(d, localhost, Op::Service, true);
        let neighborhood = Name::from_uri("ccnx:/%C1.M.S.neighborhood").expect("static uri");
        ic.listen(d, neighborhood, Op::Service, true);
        let face_ns = Name::from_uri("ccnx:/%C1.M.FACE").expect("static uri");
        ic.listen(d, face_ns, Op::Adjacency, true);
        /* one forwarding entry covers most of the served namespace */
        let _ = d.reg_prefix(
            ic.ccnd_uri_name().flat(),
            0,
            (FORW_CHILD_INHERIT | FORW_ACTIVE | FORW_CAPTURE | FORW_ADVERTISE) as i32,
            0x7FFF_FFFF,
        );
        let local_only = Name::from_uri("ccnx:/%C1.M.S.localhost").expect("static uri");
        let _ = d.reg_prefix(
            local_only.flat(),
            0,
            (FORW_CHILD_INHERIT | FORW_ACTIVE | FORW_LOCAL) as i32,
            0x7FFF_FFFF,
        );
        ic
    }

    fn ccnd_uri_name(&self) -> Name {
        let mut n = Name::new();
        n.append_str("ccnx").append(&self.ccnd_id);
        n
    }

    fn listen(&mut self, d: &mut Daemon, name: Name, op: Op, reg_wanted: bool) {
        if reg_wanted {
            let _ = d.reg_prefix(
                name.flat(),
                0,
                (FORW_CHILD_INHERIT | FORW_ACTIVE) as i32,
                0x7FFF_FFFF,
            );
        }
        self.filters.push(Filter {
            prefix: name.flat().to_vec(),
            ncomps: name.ncomps(),
            op,
        });
    }

    /* --- output plumbing --- */

    /// Messages the daemon should treat as face-0 input.
    pub fn take_output(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbuf)
    }

    /// Hand a ContentObject (or Interest) to the daemon via face 0.
    pub(crate) fn put(&mut self, msg: Vec<u8>) {
        self.outbuf.push(msg);
    }

    pub(crate) fn sign(
        &mut self,
        d: &Daemon,
        name: Name,
        payload: &[u8],
        sp: &SigningParams,
    ) -> Vec<u8> {
        let ts = {
            let wall = (d.clock.sec << 12) | ((d.clock.usec as u64) * 4096 / 1_000_000);
            self.timestamp = self.timestamp.max(wall).max(self.timestamp + 1);
            self.timestamp
        };
        self.keystore.sign_content(name, payload, ts, sp)
    }

    /// Express an interest of our own through the forwarding machinery.
    pub(crate) fn express_interest(
        &mut self,
        d: &mut Daemon,
        template: &InterestTemplate,
        kind: Upcall,
    ) {
        let wire = template.encode().to_vec();
        let deadline = d.wtnow().plus_ticks((4 * WTHZ) as u32);
        self.expressed.push(Expressed {
            name_flat: template.name.flat().to_vec(),
            wire: wire.clone(),
            kind,
            deadline,
            retried: false,
        });
        self.put(wire);
    }

    /// Retire or re-express interests whose lifetime lapsed.
    pub(crate) fn sweep_expressed(&mut self, d: &mut Daemon) {
        let now = d.wtnow();
        let mut timed_out = Vec::new();
        let mut i = 0;
        while i < self.expressed.len() {
            if now.is_before(self.expressed[i].deadline) {
                i += 1;
                continue;
            }
            if !self.expressed[i].retried {
                self.expressed[i].retried = true;
                self.expressed[i].deadline = now.plus_ticks((4 * WTHZ) as u32);
                let wire = self.expressed[i].wire.clone();
                self.put(wire);
                i += 1;
                continue;
            }
            timed_out.push(self.expressed.remove(i));
        }
        for e in timed_out {
            match e.kind {
                Upcall::SolicitResponse(faceid) | Upcall::IncomingAdjacency(faceid) => {
                    self.adjacency_interest_timed_out(d, faceid, e.kind);
                }
            }
        }
    }

    /* --- input from the daemon --- */

    /// Face 0 received these bytes from the daemon.
    pub fn dispatch(&mut self, d: &mut Daemon, msg: &[u8]) {
        match classify(msg) {
            Some(MessageKind::Interest) => {
                if let Ok(pi) = parse_interest(msg) {
                    self.handle_interest(d, msg, &pi);
                }
            }
            Some(MessageKind::ContentObject) => self.handle_content(d, msg),
            _ => debug!("internal client ignoring message of {} bytes", msg.len()),
        }
    }

    /// Content matching one of our own expressed interests.
    fn handle_content(&mut self, d: &mut Daemon, msg: &[u8]) {
        let Ok(pco) = parse_content_object(msg) else { return };
        let flat = crate::cs::flatname_of(msg, &pco);
        let found = self
            .expressed
            .iter()
            .position(|e| flat.starts_with(&e.name_flat));
        let Some(i) = found else { return };
        let e = self.expressed.remove(i);
        match e.kind {
            Upcall::SolicitResponse(faceid) => self.solicit_response_content(d, faceid),
            Upcall::IncomingAdjacency(faceid) => self.incoming_adjacency_content(d, faceid),
        }
    }

    /// An interest reached one of the registered namespaces.
    fn handle_interest(&mut self, d: &mut Daemon, msg: &[u8], pi: &ParsedInterest) {
        let flat = crate::daemon::interest_name_flat(msg, pi);
        let mut best: Option<(usize, usize)> = None; /* (filter idx, ncomps) */
        for (i, f) in self.filters.iter().enumerate() {
            if flat.starts_with(&f.prefix) && best.map(|(_, n)| f.ncomps > n).unwrap_or(true) {
                best = Some((i, f.ncomps));
            }
        }
        let Some((fidx, matched_comps)) = best else { return };
        let op = self.filters[fidx].op;
        if d.debugging(crate::config::DBG_FACES) {
            debug!("internal client answering {:?}", op);
        }
        let requester = d.interest_faceid;
        if (pi.answerfrom & AOK_NEW) == 0
            && !matches!(op, Op::Service | Op::Notice | Op::Adjacency)
        {
            return;
        }
        match op {
            Op::Ping => {
                let freshness = if pi.prefix_comps() == matched_comps { 60 } else { 5 };
                self.reply(d, msg, pi, Ok(Vec::new()), freshness);
            }
            Op::Service => self.serve_service_cob(d, msg, pi),
            Op::Notice => self.start_notice(d),
            Op::Adjacency => self.handle_adjacency_interest(d, msg, pi, requester),
            _ => {
                /* signed request carried in the next name component */
                if pi.prefix_comps() < matched_comps + 1 {
                    return;
                }
                let arg = match component_at(msg, pi, matched_comps) {
                    Some(a) => a.to_vec(),
                    None => return,
                };
                let verified = self.verify_request(&arg);
                let result = match (op, verified) {
                    (_, Err(e)) => Err(e),
                    (Op::NewFace, Ok(())) => self.req_newface(d, &arg, requester),
                    (Op::DestroyFace, Ok(())) => self.req_destroyface(d, &arg, requester),
                    (Op::Prefixreg, Ok(())) => self.req_prefix_or_self_reg(d, &arg, requester, false),
                    (Op::Selfreg, Ok(())) => self.req_prefix_or_self_reg(d, &arg, requester, true),
                    (Op::Unreg, Ok(())) => self.req_unreg(d, &arg, requester),
                    (Op::SetStrategy, Ok(())) => self.req_strategy(d, &arg, requester, "setstrategy"),
                    (Op::GetStrategy, Ok(())) => self.req_strategy(d, &arg, requester, "getstrategy"),
                    (Op::RemoveStrategy, Ok(())) => {
                        self.req_strategy(d, &arg, requester, "removestrategy")
                    }
                    _ => Err((450, "bad request".to_string())),
                };
                self.reply(d, msg, pi, result, 10);
            }
        }
    }

    /// Check the embedded signature on a control request.
    fn verify_request(&self, arg: &[u8]) -> Result<(), (u32, String)> {
        let pco = parse_content_object(arg)
            .map_err(|_| (504, "request payload does not parse".to_string()))?;
        let signed = &arg[pco.signed_span.clone()];
        let bits = &arg[pco.signature_bits.clone()];
        if !Keystore::verify_signature(signed, bits) {
            return Err((430, "request signature does not verify".to_string()));
        }
        Ok(())
    }

    /// Sign and emit the response object (or a NACK).
    fn reply(
        &mut self,
        d: &mut Daemon,
        msg: &[u8],
        pi: &ParsedInterest,
        result: Result<Vec<u8>, (u32, String)>,
        freshness: u32,
    ) {
        let mut name = Name::new();
        for i in 0..pi.prefix_comps() {
            if let Some(c) = component_at(msg, pi, i) {
                name.append(c);
            }
        }
        let mut sp = SigningParams {
            freshness_seconds: Some(freshness),
            ..Default::default()
        };
        let body = match result {
            Ok(body) => body,
            Err((code, text)) => {
                info!("control request failed: {} {}", code, text);
                sp.content_type = CONTENT_TYPE_NACK;
                rust_ccnd_common::packet::encode_status_response(code, &text).to_vec()
            }
        };
        let cob = self.sign(d, name, &body, &sp);
        self.put(cob);
    }

    /* --- the request handlers --- */

    fn require_gg(&self, d: &Daemon, requester: FaceId) -> Result<(), (u32, String)> {
        let ok = d
            .faces
            .get(requester)
            .map(|f| (f.flags & FACE_GG) != 0)
            .unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err((430, "not authorized".to_string()))
        }
    }

    fn req_newface(
        &mut self,
        d: &mut Daemon,
        arg: &[u8],
        requester: FaceId,
    ) -> Result<Vec<u8>, (u32, String)> {
        self.require_gg(d, requester)?;
        let mut fi = parse_payload_face_instance(arg)?;
        self.check_ccndid(fi.ccnd_id.as_deref())?;
        if fi.action.as_deref() != Some("newface") {
            return Err((504, "expected newface action".to_string()));
        }
        let host = fi.host.clone().ok_or((504, "missing Host".to_string()))?;
        let port = fi.port.clone().ok_or((504, "missing Port".to_string()))?;
        let ipproto = fi.ipproto.unwrap_or(17);
        let addr = resolve_host(&host, &port)?;
        let mcast = match addr {
            std::net::SocketAddr::V4(a) => a.ip().is_multicast(),
            std::net::SocketAddr::V6(a) => a.ip().is_multicast(),
        };
        let faceid = if mcast {
            d.make_mcast_face(addr, fi.mcast_interface.as_deref(), fi.mcast_ttl)
                .ok_or((453, "could not set up multicast".to_string()))?
        } else if ipproto == 6 {
            d.make_stream_face(addr)
                .ok_or((450, "could not connect".to_string()))?
        } else {
            d.make_dgram_face(addr)
                .ok_or((450, "could not create face".to_string()))?
        };
        info!("newface: created face {} for {}:{}", faceid, host, port);
        fi.action = None;
        fi.ccnd_id = Some(self.ccnd_id.to_vec());
        fi.faceid = Some(faceid);
        fi.lifetime_seconds = fi.lifetime_seconds.or(Some(0x7FFF_FFFF));
        Ok(fi.encode().to_vec())
    }

    fn req_destroyface(
        &mut self,
        d: &mut Daemon,
        arg: &[u8],
        requester: FaceId,
    ) -> Result<Vec<u8>, (u32, String)> {
        self.require_gg(d, requester)?;
        let mut fi = parse_payload_face_instance(arg)?;
        self.check_ccndid(fi.ccnd_id.as_deref())?;
        let faceid = fi.faceid.ok_or((504, "missing FaceID".to_string()))?;
        if !d.destroy_face(faceid) {
            return Err((450, "could not destroy face".to_string()));
        }
        fi.action = None;
        fi.ccnd_id = Some(self.ccnd_id.to_vec());
        Ok(fi.encode().to_vec())
    }

    fn req_prefix_or_self_reg(
        &mut self,
        d: &mut Daemon,
        arg: &[u8],
        requester: FaceId,
        selfreg: bool,
    ) -> Result<Vec<u8>, (u32, String)> {
        /* prefixreg additionally accepts REGOK faces */
        let authorized = d
            .faces
            .get(requester)
            .map(|f| (f.flags & (FACE_GG | FACE_REGOK)) != 0)
            .unwrap_or(false);
        if selfreg {
            self.require_gg(d, requester)?;
        } else if !authorized {
            return Err((430, "not authorized".to_string()));
        }
        let mut fe = parse_payload_forwarding_entry(arg)?;
        self.check_ccndid(fe.ccnd_id.as_deref())?;
        let name = fe.name.clone().ok_or((504, "missing Name".to_string()))?;
        let faceid = if selfreg {
            requester
        } else {
            fe.faceid.unwrap_or(requester)
        };
        let flags = fe
            .flags
            .unwrap_or(FORW_ACTIVE | FORW_CHILD_INHERIT);
        if (flags & FORW_PUBMASK) != flags {
            return Err((504, "invalid forwarding flags".to_string()));
        }
        let lifetime = fe.lifetime_seconds.unwrap_or(2000) as i32;
        d.reg_prefix(name.flat(), faceid, flags as i32, lifetime)
            .map_err(|_| (450, "registration failed".to_string()))?;
        fe.action = None;
        fe.ccnd_id = Some(self.ccnd_id.to_vec());
        fe.faceid = Some(faceid);
        fe.flags = Some(flags);
        fe.lifetime_seconds = Some(lifetime as u32);
        Ok(fe.encode().to_vec())
    }

    fn req_unreg(
        &mut self,
        d: &mut Daemon,
        arg: &[u8],
        requester: FaceId,
    ) -> Result<Vec<u8>, (u32, String)> {
        self.require_gg(d, requester)?;
        let mut fe = parse_payload_forwarding_entry(arg)?;
        self.check_ccndid(fe.ccnd_id.as_deref())?;
        let name = fe.name.clone().ok_or((504, "missing Name".to_string()))?;
        let faceid = fe.faceid.unwrap_or(requester);
        if !d.fib.unreg_prefix(name.flat(), faceid) {
            return Err((450, "not registered".to_string()));
        }
        fe.action = None;
        fe.ccnd_id = Some(self.ccnd_id.to_vec());
        fe.faceid = Some(faceid);
        Ok(fe.encode().to_vec())
    }

    fn req_strategy(
        &mut self,
        d: &mut Daemon,
        arg: &[u8],
        requester: FaceId,
        action: &str,
    ) -> Result<Vec<u8>, (u32, String)> {
        self.require_gg(d, requester)?;
        let mut ss = parse_payload_strategy_selection(arg)?;
        self.check_ccndid(ss.ccnd_id.as_deref())?;
        let name = ss.name.clone().ok_or((504, "missing Name".to_string()))?;
        match action {
            "setstrategy" => {
                let class = ss
                    .class_id
                    .clone()
                    .ok_or((504, "missing strategy class".to_string()))?;
                d.set_strategy(name.flat(), &class, ss.parameters.clone())?;
            }
            "getstrategy" => {
                let (class, params) = d.get_strategy(name.flat());
                ss.class_id = Some(class);
                ss.parameters = params;
            }
            "removestrategy" => {
                if !d.remove_strategy(name.flat()) {
                    return Err((450, "no strategy set".to_string()));
                }
            }
            _ => return Err((450, "bad strategy action".to_string())),
        }
        ss.action = None;
        ss.ccnd_id = Some(self.ccnd_id.to_vec());
        Ok(ss.encode().to_vec())
    }

    fn check_ccndid(&self, id: Option<&[u8]>) -> Result<(), (u32, String)> {
        match id {
            None => Ok(()),
            Some(id) if id == self.ccnd_id.as_slice() => Ok(()),
            Some(_) => Err((531, "wrong ccnd_id".to_string())),
        }
    }

    /* --- service description objects --- */

    fn serve_service_cob(&mut self, d: &mut Daemon, msg: &[u8], pi: &ParsedInterest) {
        let local = component_at(msg, pi, 0)
            .map(|c| c == b"\xC1.M.S.localhost")
            .unwrap_or(false);
        let cob = if local {
            if self.service_cob.is_none() {
                let mut name = Name::from_uri("ccnx:/%C1.M.S.localhost/%C1.M.SRV/ccnd/KEY")
                    .expect("static uri");
                self.append_version_and_segment(d, &mut name);
                let sp = SigningParams {
                    freshness_seconds: Some(600),
                    content_type: CONTENT_TYPE_KEY,
                    include_key_bits: true,
                    ..Default::default()
                };
                let key = self.keystore.public_key().to_vec();
                self.service_cob = Some(self.sign(d, name, &key, &sp));
            }
            self.service_cob.clone()
        } else {
            if self.neighbor_cob.is_none() {
                let mut name = Name::from_uri("ccnx:/%C1.M.S.neighborhood/%C1.M.SRV/ccnd/KEY")
                    .expect("static uri");
                self.append_version_and_segment(d, &mut name);
                let sp = SigningParams {
                    freshness_seconds: Some(5),
                    content_type: CONTENT_TYPE_KEY,
                    include_key_bits: true,
                    ..Default::default()
                };
                let key = self.keystore.public_key().to_vec();
                self.neighbor_cob = Some(self.sign(d, name, &key, &sp));
            }
            self.neighbor_cob.clone()
        };
        if let Some(cob) = cob {
            self.put(cob);
        }
    }

    pub(crate) fn append_version_and_segment(&mut self, d: &Daemon, name: &mut Name) {
        let ts = {
            let wall = (d.clock.sec << 12) | ((d.clock.usec as u64) * 4096 / 1_000_000);
            self.timestamp = self.timestamp.max(wall).max(self.timestamp + 1);
            self.timestamp
        };
        let mut vcomp = vec![0xFDu8];
        let be = ts.to_be_bytes();
        let mut i = 0;
        while i < be.len() - 1 && be[i] == 0 {
            i += 1;
        }
        vcomp.extend_from_slice(&be[i..]);
        name.append(&vcomp);
        name.append(&[0x00]);
    }

    /* --- the notice stream --- */

    /// Start publishing face status notices (idempotent).
    fn start_notice(&mut self, d: &mut Daemon) {
        if self.notice.is_some() {
            return;
        }
        let mut base = self.ccnd_uri_name();
        base.append_str("notice.txt");
        self.notice = Some(Notice {
            base,
            seq: 0,
            pending: String::new(),
        });
        self.chface = d.faces.faceids();
        self.schedule_notice_push(d);
    }

    /// Record a face status change for the notice stream.
    pub(crate) fn note_face_change(&mut self, d: &mut Daemon, faceid: FaceId) {
        if self.notice.is_none() {
            return;
        }
        if !self.chface.contains(&faceid) {
            self.chface.push(faceid);
        }
        self.schedule_notice_push(d);
    }

    /// Free-form line on the notice stream (debug surfacing).
    pub(crate) fn notice_text(&mut self, d: &mut Daemon, text: &str) {
        if let Some(n) = self.notice.as_mut() {
            n.pending.push_str(text);
            n.pending.push('\n');
            self.schedule_notice_push(d);
        } else {
            info!("{}", text);
        }
    }

    fn schedule_notice_push(&mut self, d: &mut Daemon) {
        if self.notice_push_ev.is_none() {
            /* small delay coalesces bursts of changes */
            self.notice_push_ev = Some(d.schedule(2_000, Action::NoticePush, 0));
        }
    }

    /// Publish the pending notices as the next sequence element.
    pub(crate) fn notice_push(&mut self, d: &mut Daemon, cancel: bool) -> i64 {
        self.notice_push_ev = None;
        if cancel {
            return 0;
        }
        let changed = std::mem::take(&mut self.chface);
        for faceid in changed {
            let line = self.face_notice_line(d, faceid);
            if let Some(n) = self.notice.as_mut() {
                n.pending.push_str(&line);
            }
        }
        let Some(n) = self.notice.as_mut() else { return 0 };
        if n.pending.is_empty() {
            return 0;
        }
        let seq = n.seq;
        n.seq += 1;
        let mut name = n.base.clone();
        let mut comp = vec![0x00u8];
        if seq > 0 {
            let be = seq.to_be_bytes();
            let mut i = 0;
            while i < be.len() - 1 && be[i] == 0 {
                i += 1;
            }
            comp.extend_from_slice(&be[i..]);
        }
        name.append(&comp);
        let body = std::mem::take(&mut n.pending);
        let sp = SigningParams {
            freshness_seconds: Some(2),
            ..Default::default()
        };
        let cob = self.sign(d, name, body.as_bytes(), &sp);
        self.put(cob);
        0
    }

    /// One status line: `newface(id, 0xflags[, peer[, adj-uri]]);`
    pub(crate) fn face_notice_line(&self, d: &Daemon, faceid: FaceId) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        match d.faces.get(faceid) {
            None => {
                let _ = writeln!(out, "destroyface({});", faceid);
            }
            Some(face) => {
                let _ = write!(out, "newface({}, 0x{:x}", faceid, face.flags);
                if let Some(addr) = &face.addr {
                    let _ = write!(out, ", {}", addr);
                }
                if (face.flags & crate::face::FACE_ADJ) != 0 {
                    if let Some(uri) = self.adjacency_uri(face) {
                        if face.addr.is_none() {
                            let _ = write!(out, ", ");
                        }
                        let _ = write!(out, ", {}", uri);
                    }
                }
                let _ = writeln!(out, ");");
            }
        }
        out
    }
}

/* --- small parsing helpers --- */

fn component_at<'m>(msg: &'m [u8], pi: &ParsedInterest, index: usize) -> Option<&'m [u8]> {
    if index >= pi.prefix_comps() {
        return None;
    }
    rust_ccnd_common::packet::component_body(msg, pi.comps[index]).ok()
}

fn payload_of(arg: &[u8]) -> Result<&[u8], (u32, String)> {
    let pco = parse_content_object(arg)
        .map_err(|_| (504, "request payload does not parse".to_string()))?;
    Ok(&arg[pco.content_body])
}

fn parse_payload_face_instance(arg: &[u8]) -> Result<FaceInstance, (u32, String)> {
    FaceInstance::parse(payload_of(arg)?)
        .map_err(|_| (504, "FaceInstance does not parse".to_string()))
}

fn parse_payload_forwarding_entry(arg: &[u8]) -> Result<ForwardingEntry, (u32, String)> {
    ForwardingEntry::parse(payload_of(arg)?)
        .map_err(|_| (504, "ForwardingEntry does not parse".to_string()))
}

fn parse_payload_strategy_selection(arg: &[u8]) -> Result<StrategySelection, (u32, String)> {
    StrategySelection::parse(payload_of(arg)?)
        .map_err(|_| (504, "StrategySelection does not parse".to_string()))
}

fn resolve_host(host: &str, port: &str) -> Result<std::net::SocketAddr, (u32, String)> {
    /* numeric fast path first; getaddrinfo only when necessary */
    if let (Ok(ip), Ok(p)) = (host.parse::<std::net::IpAddr>(), port.parse::<u16>()) {
        return Ok(std::net::SocketAddr::from((ip, p)));
    }
    let spec = format!("{}:{}", host, port);
    match spec.to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .ok_or((501, format!("no address for {}", spec))),
        Err(_) => Err((501, format!("cannot resolve {}", spec))),
    }
}

/// Extend a name with string components.
fn extend(base: &Name, comps: &[&str]) -> Name {
    let mut n = base.clone();
    for c in comps {
        n.append_str(c);
    }
    n
}

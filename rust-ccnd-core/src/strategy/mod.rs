//! The strategy engine.
//!
//! A strategy is a per-prefix policy governing upstream selection and
//! retransmission timing.  The engine serializes callouts: an instance is
//! taken out of its prefix for the duration of one callout, so a strategy
//! can freely use the context without aliasing the tables it reads.

mod default;
mod faceattr;
mod loadsharing;
mod null;
mod parallel;
mod trace;

pub use default::DefaultStrategy;
pub use faceattr::FaceattrStrategy;
pub use loadsharing::LoadsharingStrategy;
pub use null::NullStrategy;
pub use parallel::ParallelStrategy;
pub use trace::TraceStrategy;

use crate::daemon::Daemon;
use crate::face::FaceId;
use crate::fib::{NameprefixState, NpeId};
use crate::pit::Serial;
use crate::sched::WrappedTime;

/// Callout operations, in the order of a pit entry's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyOp {
    Nop = 0,
    Init,
    First,
    Update,
    NewUp,
    NewDn,
    ExpUp,
    ExpDn,
    Refresh,
    Timer,
    Satisfied,
    Timeout,
    Finalize,
}

impl StrategyOp {
    pub fn from_u64(v: u64) -> StrategyOp {
        match v {
            1 => StrategyOp::Init,
            2 => StrategyOp::First,
            3 => StrategyOp::Update,
            4 => StrategyOp::NewUp,
            5 => StrategyOp::NewDn,
            6 => StrategyOp::ExpUp,
            7 => StrategyOp::ExpDn,
            8 => StrategyOp::Refresh,
            9 => StrategyOp::Timer,
            10 => StrategyOp::Satisfied,
            11 => StrategyOp::Timeout,
            12 => StrategyOp::Finalize,
            _ => StrategyOp::Nop,
        }
    }
}

/// One strategy class implementation.
pub trait Strategy: std::fmt::Debug {
    fn callout(&mut self, ctx: &mut StrategyCtx<'_>, op: StrategyOp, faceid: FaceId);
}

/// A strategy bound to a prefix, with its parameter string.
#[derive(Debug)]
pub struct StrategyInstance {
    pub class_id: String,
    pub parameters: Option<String>,
    pub strategy: Box<dyn Strategy>,
}

/// The built-in class ids, wire-visible through get/setstrategy.
pub const CLASS_IDS: &[&str] = &[
    "default",
    "parallel",
    "loadsharing",
    "null",
    "trace",
    "faceattr",
];

/// Instantiate a class by id.  The Init callout still has to run.
pub fn create_instance(class_id: &str, parameters: Option<String>) -> Option<StrategyInstance> {
    let strategy: Box<dyn Strategy> = match class_id {
        "default" => Box::new(DefaultStrategy::new()),
        "parallel" => Box::new(ParallelStrategy),
        "loadsharing" => Box::new(LoadsharingStrategy::new()),
        "null" => Box::new(NullStrategy),
        "trace" => Box::new(TraceStrategy::new()),
        "faceattr" => Box::new(FaceattrStrategy),
        _ => return None,
    };
    Some(StrategyInstance {
        class_id: class_id.to_string(),
        parameters,
        strategy,
    })
}

/// What the engine hands a strategy during a callout.
///
/// All accessors are keyed by pfi index or faceid; snapshots are cheap
/// copies so the strategy never holds a live borrow into the tables.
pub struct StrategyCtx<'a> {
    pub(crate) d: &'a mut Daemon,
    pub(crate) serial: Serial,
    /// Prefix the instance is registered on (for Init error reporting).
    pub(crate) npe: NpeId,
    /// Parameter string of the instance under callout.
    pub(crate) parameters: Option<String>,
    /// Set by a failing Init; surfaced through the control reply.
    pub(crate) init_error: Option<String>,
}

impl<'a> StrategyCtx<'a> {
    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn parameters(&self) -> Option<&str> {
        self.parameters.as_deref()
    }

    pub fn wtnow(&self) -> WrappedTime {
        self.d.clock.wtnow()
    }

    pub fn random(&mut self) -> u32 {
        self.d.random()
    }

    /// Record an Init failure (or, for faceattr, the report string).
    pub fn init_error(&mut self, msg: impl Into<String>) {
        self.init_error = Some(msg.into());
    }

    /// Post a comment line on the notice stream.
    pub fn notice(&mut self, text: &str) {
        self.d.notice_comment(text);
    }

    /* --- pit face items --- */

    pub fn pfl_len(&self) -> usize {
        self.d.pit.get(self.serial).map(|e| e.pfl.len()).unwrap_or(0)
    }

    pub fn pfi_faceid(&self, i: usize) -> FaceId {
        self.d.pit.get(self.serial).map(|e| e.pfl[i].faceid).unwrap_or(crate::face::NOFACEID)
    }

    pub fn pfi_flags(&self, i: usize) -> u32 {
        self.d.pit.get(self.serial).map(|e| e.pfl[i].flags).unwrap_or(0)
    }

    pub fn pfi_expiry(&self, i: usize) -> WrappedTime {
        self.d
            .pit
            .get(self.serial)
            .map(|e| e.pfl[i].expiry)
            .unwrap_or_default()
    }

    pub fn set_pfi_flags(&mut self, i: usize, set: u32, clear: u32) {
        if let Some(e) = self.d.pit.get_mut(self.serial) {
            if let Some(p) = e.pfl.get_mut(i) {
                p.flags = (p.flags & !clear) | set;
            }
        }
    }

    /// Arm the item's expiry `micros` from now (does not renew).
    pub fn set_pfi_expiry_micros(&mut self, i: usize, micros: u64) {
        let now = self.d.clock.wtnow();
        if let Some(e) = self.d.pit.get_mut(self.serial) {
            if let Some(p) = e.pfl.get_mut(i) {
                p.set_expiry_from_micros(now, micros);
            }
        }
    }

    /// Forward the interest to the upstream at `up`, sourcing the nonce
    /// and lifetime from the downstream at `down`.
    pub fn send_interest(&mut self, down: usize, up: usize) {
        self.d.send_interest(self.serial, down, up);
    }

    /// Schedule (or with Nop cancel) the strategy wakeup timer.
    pub fn settimer(&mut self, micros: u64, op: StrategyOp) {
        self.d.strategy_settimer(self.serial, micros, op);
    }

    /// Faceids the FIB taps for this entry's prefix.
    pub fn tap_faces(&mut self) -> Vec<FaceId> {
        self.d.tap_for_entry(self.serial)
    }

    /* --- per-prefix state cells --- */

    /// State cells for the entry's prefix (`k = 0`) or its ancestors.
    pub fn get_state(&self, k: usize) -> Option<NameprefixState> {
        let id = self.state_npe(k)?;
        self.d.fib.get(id).map(|e| e.sst)
    }

    pub fn set_state(&mut self, k: usize, st: NameprefixState) {
        if let Some(id) = self.state_npe(k) {
            if let Some(e) = self.d.fib.get_mut(id) {
                e.sst = st;
            }
        }
    }

    fn state_npe(&self, k: usize) -> Option<NpeId> {
        let entry = self.d.pit.get(self.serial)?;
        let mut id = Some(entry.npe);
        for _ in 0..k {
            id = self.d.fib.get(id?).and_then(|e| e.parent);
        }
        id
    }

    /* --- faces --- */

    pub fn face_exists(&self, faceid: FaceId) -> bool {
        self.d.faces.get(faceid).is_some()
    }

    pub fn face_outstanding_interests(&self, faceid: FaceId) -> i32 {
        self.d
            .faces
            .get(faceid)
            .map(|f| f.outstanding_interests)
            .unwrap_or(0)
    }

    pub fn face_pending_interests(&self, faceid: FaceId) -> i32 {
        self.d
            .faces
            .get(faceid)
            .map(|f| f.pending_interests)
            .unwrap_or(0)
    }

    pub fn faceattr_bool_index(&mut self, name: &str) -> Option<usize> {
        self.d.faceattrs.bool_index(name)
    }

    pub fn faceattr_index(&mut self, name: &str) -> usize {
        self.d.faceattrs.cell_index(name)
    }

    pub fn faceattr_lookup(&self, name: &str) -> Option<usize> {
        self.d.faceattrs.lookup(name)
    }

    pub fn faceattr_names(&self) -> Vec<(String, usize)> {
        self.d
            .faceattrs
            .names()
            .map(|(n, i)| (n.to_string(), i))
            .collect()
    }

    pub fn faceattr_get(&self, faceid: FaceId, index: usize) -> u32 {
        self.d.faces.get(faceid).map(|f| f.attr_get(index)).unwrap_or(0)
    }

    pub fn faceattr_set(&mut self, faceid: FaceId, index: usize, value: u32) -> Result<(), ()> {
        match self.d.faces.get_mut(faceid) {
            Some(f) => f.attr_set(index, value),
            None => Err(()),
        }
    }

    /// Ceiling for predicted response times, from the configuration.
    pub fn predicted_response_limit(&self) -> u32 {
        self.d.cfg.predicted_response_limit
    }

    /// Run a nested callout on another instance (for wrappers).
    pub fn delegate(&mut self, inner: &mut StrategyInstance, op: StrategyOp, faceid: FaceId) {
        let saved = self.parameters.take();
        self.parameters = inner.parameters.clone();
        inner.strategy.callout(self, op, faceid);
        self.parameters = saved;
    }
}

//! Distribution-by-performance strategy.
//!
//! The number of outstanding interests is a proxy for the performance of
//! a face; an interest goes to the face with the minimum, picked at
//! random among ties.  Faces that time out are marked slow and penalized
//! until they answer again.

use super::{Strategy, StrategyCtx, StrategyOp};
use crate::face::FaceId;
use crate::pit::{PFI_ATTENTION, PFI_INACTIVE, PFI_SENDUPST, PFI_UPENDING, PFI_UPSTREAM};

const INACTIVE_PENALTY: i64 = 1000;
const SLOW_PENALTY: i64 = 32;

#[derive(Debug, Default)]
pub struct LoadsharingStrategy {
    slow_idx: Option<usize>,
}

impl LoadsharingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    fn effective_depth(&self, ctx: &StrategyCtx<'_>, i: usize) -> i64 {
        let faceid = ctx.pfi_faceid(i);
        let mut depth = ctx.face_outstanding_interests(faceid) as i64;
        if (ctx.pfi_flags(i) & PFI_INACTIVE) != 0 {
            depth += INACTIVE_PENALTY;
        }
        if let Some(idx) = self.slow_idx {
            if ctx.faceattr_get(faceid, idx) != 0 {
                depth += SLOW_PENALTY;
            }
        }
        depth
    }
}

impl Strategy for LoadsharingStrategy {
    fn callout(&mut self, ctx: &mut StrategyCtx<'_>, op: StrategyOp, faceid: FaceId) {
        match op {
            StrategyOp::Init => {
                self.slow_idx = ctx.faceattr_bool_index("slow");
            }
            StrategyOp::First | StrategyOp::Update => {
                let n = ctx.pfl_len();
                let upending = (0..n)
                    .filter(|&i| (ctx.pfi_flags(i) & PFI_UPENDING) != 0)
                    .count();
                if upending == 0 {
                    let mut smallestq = i64::MAX;
                    let mut count = 0u32;
                    for i in 0..n {
                        if (ctx.pfi_flags(i) & PFI_ATTENTION) == 0 {
                            continue;
                        }
                        let flags = ctx.pfi_flags(i);
                        /*
                         * Penalized faces still get probed occasionally
                         * so their status stays current.
                         */
                        if (flags & PFI_INACTIVE) != 0 && (ctx.random() & 255) == 0 {
                            ctx.set_pfi_flags(i, PFI_SENDUPST, 0);
                        }
                        if let Some(idx) = self.slow_idx {
                            if ctx.faceattr_get(ctx.pfi_faceid(i), idx) != 0
                                && (ctx.random() & 63) == 0
                            {
                                ctx.set_pfi_flags(i, PFI_SENDUPST, 0);
                            }
                        }
                        let depth = self.effective_depth(ctx, i);
                        if depth < smallestq {
                            smallestq = depth;
                            count = 1;
                        } else if depth == smallestq {
                            count += 1;
                        }
                    }
                    if count > 0 {
                        let mut best = ctx.random() % count;
                        for i in 0..n {
                            let flags = ctx.pfi_flags(i);
                            if (flags & PFI_ATTENTION) == 0 {
                                continue;
                            }
                            let depth = self.effective_depth(ctx, i);
                            if depth == smallestq && (flags & PFI_UPSTREAM) != 0 {
                                if best == 0 {
                                    ctx.set_pfi_flags(i, PFI_SENDUPST, 0);
                                    break;
                                }
                                best -= 1;
                            }
                        }
                    }
                }
                for i in 0..n {
                    ctx.set_pfi_flags(i, 0, PFI_ATTENTION);
                }
            }
            StrategyOp::ExpUp => {
                if let Some(idx) = self.slow_idx {
                    let _ = ctx.faceattr_set(faceid, idx, 1);
                }
            }
            StrategyOp::Satisfied => {
                if let Some(idx) = self.slow_idx {
                    let _ = ctx.faceattr_set(faceid, idx, 0);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testutil::*;
    use crate::daemon::Daemon;
    use crate::face::NOFACEID;
    use crate::fib::NpeId;
    use crate::pit::Serial;

    fn callout(
        d: &mut Daemon,
        s: &mut LoadsharingStrategy,
        serial: Serial,
        npe: NpeId,
        op: StrategyOp,
        faceid: FaceId,
    ) {
        let mut ctx = StrategyCtx {
            d,
            serial,
            npe,
            parameters: None,
            init_error: None,
        };
        s.callout(&mut ctx, op, faceid);
    }

    #[test]
    fn init_registers_the_slow_attribute() {
        let (mut d, _k) = test_daemon();
        let mut s = LoadsharingStrategy::new();
        callout(&mut d, &mut s, 0, 0, StrategyOp::Init, NOFACEID);
        assert!(d.faceattrs.lookup("slow").is_some());
    }

    #[test]
    fn update_picks_the_least_loaded_upstream() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let c = add_face(&mut d, 0);
        let (serial, npe) = seed_pit_entry(&mut d, "ccnx:/ls/min", a, &[b, c]);
        d.faces.get_mut(b).unwrap().outstanding_interests = 3;
        d.faces.get_mut(c).unwrap().outstanding_interests = 1;
        let mut s = LoadsharingStrategy::new();
        callout(&mut d, &mut s, serial, npe, StrategyOp::Init, NOFACEID);
        callout(&mut d, &mut s, serial, npe, StrategyOp::Update, NOFACEID);
        let e = d.pit.get(serial).unwrap();
        assert!(e.pfi(c, PFI_UPSTREAM).unwrap().flags & PFI_SENDUPST != 0);
        assert!(e.pfi(b, PFI_UPSTREAM).unwrap().flags & PFI_SENDUPST == 0);
        /* attention is consumed either way */
        for up in e.upstreams() {
            assert!(up.flags & PFI_ATTENTION == 0);
        }
    }

    #[test]
    fn slow_faces_are_penalized() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let c = add_face(&mut d, 0);
        let (serial, npe) = seed_pit_entry(&mut d, "ccnx:/ls/slow", a, &[b, c]);
        let mut s = LoadsharingStrategy::new();
        callout(&mut d, &mut s, serial, npe, StrategyOp::Init, NOFACEID);
        /* b is idle but slow; c carries traffic below the penalty */
        let idx = d.faceattrs.lookup("slow").unwrap();
        d.faces.get_mut(b).unwrap().attr_set(idx, 1).unwrap();
        d.faces.get_mut(b).unwrap().outstanding_interests = 0;
        d.faces.get_mut(c).unwrap().outstanding_interests = 5;
        callout(&mut d, &mut s, serial, npe, StrategyOp::Update, NOFACEID);
        let e = d.pit.get(serial).unwrap();
        assert!(e.pfi(c, PFI_UPSTREAM).unwrap().flags & PFI_SENDUPST != 0);
    }

    #[test]
    fn expup_marks_slow_and_satisfied_clears_it() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let (serial, npe) = seed_pit_entry(&mut d, "ccnx:/ls/mark", a, &[b]);
        let mut s = LoadsharingStrategy::new();
        callout(&mut d, &mut s, serial, npe, StrategyOp::Init, NOFACEID);
        let idx = d.faceattrs.lookup("slow").unwrap();
        callout(&mut d, &mut s, serial, npe, StrategyOp::ExpUp, b);
        assert_eq!(d.faces.get(b).unwrap().attr_get(idx), 1);
        callout(&mut d, &mut s, serial, npe, StrategyOp::Satisfied, b);
        assert_eq!(d.faces.get(b).unwrap().attr_get(idx), 0);
    }
}

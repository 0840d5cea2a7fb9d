//! Send to every eligible upstream in parallel.
//!
//! Better latency when independent sources exist, at the cost of extra
//! traffic.

use super::{Strategy, StrategyCtx, StrategyOp};
use crate::face::FaceId;
use crate::pit::{PFI_ATTENTION, PFI_SENDUPST};

#[derive(Debug)]
pub struct ParallelStrategy;

impl Strategy for ParallelStrategy {
    fn callout(&mut self, ctx: &mut StrategyCtx<'_>, op: StrategyOp, _faceid: FaceId) {
        /* expiry times need no adjustment when everything goes out now */
        if op == StrategyOp::Update || op == StrategyOp::First {
            for i in 0..ctx.pfl_len() {
                if (ctx.pfi_flags(i) & PFI_ATTENTION) != 0 {
                    ctx.set_pfi_flags(i, PFI_SENDUPST, PFI_ATTENTION);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testutil::*;
    use crate::face::NOFACEID;
    use crate::pit::PFI_UPSTREAM;

    #[test]
    fn update_flips_attention_into_sendupst() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let c = add_face(&mut d, 0);
        let (serial, npe) = seed_pit_entry(&mut d, "ccnx:/par/x", a, &[b, c]);
        let mut s = ParallelStrategy;
        let mut ctx = StrategyCtx {
            d: &mut d,
            serial,
            npe,
            parameters: None,
            init_error: None,
        };
        s.callout(&mut ctx, StrategyOp::Update, NOFACEID);
        let e = d.pit.get(serial).unwrap();
        for up in e.pfl.iter().filter(|p| (p.flags & PFI_UPSTREAM) != 0) {
            assert!(up.flags & PFI_SENDUPST != 0);
            assert!(up.flags & PFI_ATTENTION == 0);
        }
        /* everything is marked, nothing is sent eagerly */
        assert_eq!(d.counters().interests_sent, 0);
    }
}

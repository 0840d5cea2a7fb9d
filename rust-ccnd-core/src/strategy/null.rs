//! A null strategy for testing purposes.
//!
//! Services Update by sending to all permitted upstreams; otherwise does
//! nothing at all.

use super::{Strategy, StrategyCtx, StrategyOp};
use crate::face::FaceId;
use crate::pit::{PFI_ATTENTION, PFI_SENDUPST};

#[derive(Debug)]
pub struct NullStrategy;

impl Strategy for NullStrategy {
    fn callout(&mut self, ctx: &mut StrategyCtx<'_>, op: StrategyOp, _faceid: FaceId) {
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

    #[test]
    fn update_services_attention_and_nothing_else() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let (serial, npe) = seed_pit_entry(&mut d, "ccnx:/null/x", a, &[b]);
        let mut s = NullStrategy;
        /* a timer wakeup leaves the items alone */
        let before: Vec<u32> = d.pit.get(serial).unwrap().pfl.iter().map(|p| p.flags).collect();
        let mut ctx = StrategyCtx {
            d: &mut d,
            serial,
            npe,
            parameters: None,
            init_error: None,
        };
        s.callout(&mut ctx, StrategyOp::Timer, NOFACEID);
        let after: Vec<u32> = d.pit.get(serial).unwrap().pfl.iter().map(|p| p.flags).collect();
        assert_eq!(before, after);
        /* update flips the flagged upstream */
        let mut ctx = StrategyCtx {
            d: &mut d,
            serial,
            npe,
            parameters: None,
            init_error: None,
        };
        s.callout(&mut ctx, StrategyOp::Update, NOFACEID);
        let e = d.pit.get(serial).unwrap();
        let up = e.pfi(b, crate::pit::PFI_UPSTREAM).unwrap();
        assert!(up.flags & PFI_SENDUPST != 0);
        assert!(up.flags & PFI_ATTENTION == 0);
    }
}

//! The default forwarding strategy.
//!
//! Keeps, per prefix, the face that supplied content most recently, the
//! one before that, and a predicted response time.  The best face gets
//! the interest immediately; the others are staggered behind the
//! prediction so a healthy source answers before any duplicates leave.

use super::{Strategy, StrategyCtx, StrategyOp};
use crate::face::{FaceId, NOFACEID};
use crate::fib::{NameprefixState, CCN_AGED, CCN_MAGIC_MASK, CCN_UNINIT};
use crate::pit::{PFI_ATTENTION, PFI_DNSTREAM, PFI_PENDING, PFI_SENDUPST, PFI_UPENDING, PFI_UPSTREAM};

const MINE: u32 = 0x65e272;

const DUMMY: NameprefixState = [MINE, NOFACEID, NOFACEID, 50_000];

/* cell layout: [magic, src, osrc, usec] */
const SRC: usize = 1;
const OSRC: usize = 2;
const USEC: usize = 3;

#[derive(Debug, Default)]
pub struct DefaultStrategy;

impl DefaultStrategy {
    pub fn new() -> Self {
        Self
    }
}

struct Cells {
    st: NameprefixState,
    own: bool,
    parent: NameprefixState,
    parent_own: bool,
}

fn load_cells(ctx: &mut StrategyCtx<'_>) -> Cells {
    let mut parent_own = false;
    let parent = match ctx.get_state(1) {
        None => DUMMY,
        Some(s) if s[0] == CCN_UNINIT => {
            parent_own = true;
            ctx.set_state(1, DUMMY);
            DUMMY
        }
        Some(s) if (s[0] & CCN_MAGIC_MASK) == MINE => {
            parent_own = true;
            s
        }
        Some(_) => DUMMY,
    };
    let mut st = ctx.get_state(0).unwrap_or(DUMMY);
    if (st[0] & CCN_AGED) != 0 {
        if (st[0] & CCN_MAGIC_MASK) != MINE {
            st = parent;
        }
        st[0] = MINE;
        ctx.set_state(0, st);
    }
    let own = st[0] == MINE;
    if !own {
        st = DUMMY; /* do not walk on somebody else's state */
    }
    Cells {
        st,
        own,
        parent,
        parent_own,
    }
}

fn store_cells(ctx: &mut StrategyCtx<'_>, c: &Cells) {
    if c.own {
        ctx.set_state(0, c.st);
    }
    if c.parent_own {
        ctx.set_state(1, c.parent);
    }
}

/// Decrease the prediction a little on an expected answer, increase it
/// more on a miss, and remember where content came from.
fn adjust_predicted_response(s: &mut NameprefixState, faceid: FaceId, limit: u32) {
    let mut t = s[USEC];
    if faceid == NOFACEID {
        t += t >> 3;
        if t > limit {
            t = limit;
        }
    } else if faceid == s[SRC] {
        t -= t >> 7;
        if t < 127 {
            t = 127;
        }
    }
    s[USEC] = t;
    if faceid == NOFACEID {
        return;
    }
    if s[SRC] == NOFACEID {
        s[SRC] = faceid;
    } else if s[SRC] != faceid {
        s[OSRC] = s[SRC];
        s[SRC] = faceid;
    }
}

impl Strategy for DefaultStrategy {
    fn callout(&mut self, ctx: &mut StrategyCtx<'_>, op: StrategyOp, faceid: FaceId) {
        let mut c = load_cells(ctx);
        match op {
            StrategyOp::First => {
                let mut best = c.st[SRC];
                if best == NOFACEID {
                    best = c.st[OSRC];
                    c.st[SRC] = best;
                }
                let mut down = None;
                for i in 0..ctx.pfl_len() {
                    if (ctx.pfi_flags(i) & PFI_DNSTREAM) != 0 {
                        down = Some(i);
                        break;
                    }
                }
                let Some(x) = down else {
                    store_cells(ctx, &c);
                    return;
                };
                if (ctx.pfi_flags(x) & PFI_PENDING) == 0 {
                    store_cells(ctx, &c);
                    return;
                }
                let mut randlow: u32;
                let randrange: u32;
                if best == NOFACEID {
                    randlow = 4_000;
                    randrange = 75_000;
                } else {
                    randlow = c.st[USEC];
                    if randlow < 2_000 {
                        randlow = 100 + ctx.random() % 4096;
                    }
                    randrange = (randlow + 1) / 2;
                }
                let taps = ctx.tap_faces();
                let mut nleft: u32 = 0;
                for i in 0..ctx.pfl_len() {
                    let flags = ctx.pfi_flags(i);
                    if (flags & PFI_UPSTREAM) == 0 {
                        continue;
                    }
                    let fid = ctx.pfi_faceid(i);
                    if fid == best {
                        if (flags & PFI_UPENDING) == 0 {
                            ctx.send_interest(x, i);
                        }
                        ctx.settimer(c.st[USEC] as u64, StrategyOp::Timer);
                    } else if (flags & PFI_UPENDING) != 0 {
                        /* already on the wire */
                    } else if taps.contains(&fid) {
                        ctx.send_interest(x, i);
                    } else if fid == c.st[OSRC] {
                        ctx.set_pfi_expiry_micros(i, randlow as u64);
                    } else {
                        nleft += 1;
                        ctx.set_pfi_flags(i, PFI_SENDUPST, 0);
                    }
                }
                if nleft > 0 {
                    /* send the remainder in order, with randomized timing */
                    let mut amt = (2 * randrange + nleft - 1) / nleft;
                    if amt == 0 {
                        amt = 1;
                    }
                    let mut usec = randlow;
                    for i in 0..ctx.pfl_len() {
                        if (ctx.pfi_flags(i) & PFI_SENDUPST) != 0 {
                            ctx.set_pfi_expiry_micros(i, usec as u64);
                            usec += ctx.random() % amt;
                        }
                    }
                }
            }
            StrategyOp::Update => {
                for i in 0..ctx.pfl_len() {
                    if (ctx.pfi_flags(i) & PFI_ATTENTION) != 0 {
                        ctx.set_pfi_flags(i, PFI_SENDUPST, PFI_ATTENTION);
                    }
                }
            }
            StrategyOp::Timer => {
                let limit = ctx.predicted_response_limit();
                adjust_predicted_response(&mut c.st, NOFACEID, limit);
                adjust_predicted_response(&mut c.parent, NOFACEID, limit);
            }
            StrategyOp::Satisfied => {
                let limit = ctx.predicted_response_limit();
                adjust_predicted_response(&mut c.st, faceid, limit);
                adjust_predicted_response(&mut c.parent, faceid, limit);
            }
            StrategyOp::Init
            | StrategyOp::Finalize
            | StrategyOp::Timeout
            | StrategyOp::NewUp
            | StrategyOp::NewDn
            | StrategyOp::ExpUp
            | StrategyOp::ExpDn
            | StrategyOp::Refresh
            | StrategyOp::Nop => {}
        }
        store_cells(ctx, &c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testutil::*;
    use crate::daemon::Daemon;
    use crate::fib::NpeId;
    use crate::pit::Serial;

    fn callout(d: &mut Daemon, serial: Serial, npe: NpeId, op: StrategyOp, faceid: FaceId) {
        let mut s = DefaultStrategy::new();
        let mut ctx = StrategyCtx {
            d,
            serial,
            npe,
            parameters: None,
            init_error: None,
        };
        s.callout(&mut ctx, op, faceid);
    }

    fn cells(d: &Daemon, npe: NpeId) -> NameprefixState {
        d.fib.get(npe).unwrap().sst
    }

    #[test]
    fn first_with_known_best_sends_immediately() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let c = add_face(&mut d, 0);
        let (serial, npe) = seed_pit_entry(&mut d, "ccnx:/ds/known", a, &[b, c]);
        d.fib.get_mut(npe).unwrap().sst = [MINE, b, NOFACEID, 50_000];
        callout(&mut d, serial, npe, StrategyOp::First, a);
        let e = d.pit.get(serial).unwrap();
        let best = e.pfi(b, PFI_UPSTREAM).unwrap();
        assert!(best.flags & PFI_UPENDING != 0);
        /* the other upstream waits its turn */
        let other = e.pfi(c, PFI_UPSTREAM).unwrap();
        assert!(other.flags & PFI_UPENDING == 0);
        assert!(other.flags & PFI_SENDUPST != 0);
        assert!(e.strategy_ev.is_some(), "response timer armed");
        assert_eq!(d.counters().interests_sent, 1);
    }

    #[test]
    fn first_with_unknown_best_staggers_everything() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let c = add_face(&mut d, 0);
        let (serial, npe) = seed_pit_entry(&mut d, "ccnx:/ds/unknown", a, &[b, c]);
        let now = d.wtnow();
        callout(&mut d, serial, npe, StrategyOp::First, a);
        assert_eq!(d.counters().interests_sent, 0);
        let e = d.pit.get(serial).unwrap();
        for up in e.upstreams() {
            assert!(up.flags & PFI_SENDUPST != 0);
            /* no earlier than the 4 ms floor of the random window */
            assert!(up.expiry.ticks_since(now) >= 2);
        }
        /* the prefix state is claimed with the starting prediction */
        let st = cells(&d, npe);
        assert_eq!(st[0], MINE);
        assert_eq!(st[USEC], 50_000);
    }

    #[test]
    fn timer_inflates_the_prediction_by_an_eighth() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let (serial, npe) = seed_pit_entry(&mut d, "ccnx:/ds/timer", a, &[b]);
        d.fib.get_mut(npe).unwrap().sst = [MINE, b, NOFACEID, 8_000];
        callout(&mut d, serial, npe, StrategyOp::Timer, NOFACEID);
        assert_eq!(cells(&d, npe)[USEC], 9_000);
    }

    #[test]
    fn prediction_is_capped_at_the_configured_limit() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let (serial, npe) = seed_pit_entry(&mut d, "ccnx:/ds/cap", a, &[b]);
        let limit = d.cfg.predicted_response_limit;
        d.fib.get_mut(npe).unwrap().sst = [MINE, b, NOFACEID, limit - 1];
        callout(&mut d, serial, npe, StrategyOp::Timer, NOFACEID);
        assert_eq!(cells(&d, npe)[USEC], limit);
    }

    #[test]
    fn satisfied_rotates_sources_and_decays_prediction() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let (serial, npe) = seed_pit_entry(&mut d, "ccnx:/ds/rotate", a, &[b]);
        d.fib.get_mut(npe).unwrap().sst = [MINE, 5, NOFACEID, 8_000];
        /* content from a new face rotates src/osrc, untouched prediction */
        callout(&mut d, serial, npe, StrategyOp::Satisfied, 9);
        let st = cells(&d, npe);
        assert_eq!(st[SRC], 9);
        assert_eq!(st[OSRC], 5);
        assert_eq!(st[USEC], 8_000);
        /* content from the expected face decays the prediction */
        callout(&mut d, serial, npe, StrategyOp::Satisfied, 9);
        let st = cells(&d, npe);
        assert_eq!(st[SRC], 9);
        assert_eq!(st[USEC], 8_000 - (8_000 >> 7));
    }
}

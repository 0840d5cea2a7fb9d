//! A tracing wrapper around another strategy.
//!
//! The first part of the parameter string (up to the first slash) names
//! the traced class; the remainder becomes its parameter string.  Every
//! callout is logged with the pit face items before and after.

use super::{create_instance, Strategy, StrategyCtx, StrategyInstance, StrategyOp};
use crate::face::FaceId;
use crate::pit::{
    PFI_ATTENTION, PFI_DCFACE, PFI_DNSTREAM, PFI_INACTIVE, PFI_PENDING, PFI_SENDUPST, PFI_SUPDATA,
    PFI_UPENDING, PFI_UPHUNGRY, PFI_UPSTREAM,
};
use log::info;
use std::fmt::Write as _;

#[derive(Debug, Default)]
pub struct TraceStrategy {
    inner: Option<Box<StrategyInstance>>,
}

impl TraceStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Human-readable rendition of one pit face item.
fn format_pfi(ctx: &StrategyCtx<'_>, i: usize, out: &mut String) {
    let flags = ctx.pfi_flags(i);
    let faceid = ctx.pfi_faceid(i);
    out.push(' ');
    out.push(if (flags & PFI_UPSTREAM) != 0 {
        'u'
    } else if (flags & PFI_DNSTREAM) != 0 {
        'd'
    } else {
        '?'
    });
    if (flags & (PFI_PENDING | PFI_UPENDING)) != 0 {
        out.push('p');
    }
    if (flags & PFI_UPHUNGRY) != 0 {
        out.push('h');
    }
    if (flags & PFI_SENDUPST) != 0 {
        out.push('s');
    }
    if (flags & PFI_ATTENTION) != 0 {
        out.push('a');
    }
    if (flags & PFI_INACTIVE) != 0 {
        out.push('q');
    }
    if (flags & PFI_SUPDATA) != 0 {
        out.push('x');
    }
    if (flags & PFI_DCFACE) != 0 {
        out.push('c');
    }
    let _ = write!(out, "{}", faceid);
    if ctx.face_exists(faceid) {
        if (flags & PFI_DNSTREAM) != 0 {
            let _ = write!(out, "-{}", ctx.face_pending_interests(faceid));
        } else {
            let _ = write!(out, "+{}", ctx.face_outstanding_interests(faceid));
        }
    }
    let delta = ctx.pfi_expiry(i).ticks_since(ctx.wtnow());
    if delta <= 0xffffff {
        let _ = write!(out, "@{}", delta);
    }
}

fn format_pfl(ctx: &StrategyCtx<'_>, out: &mut String) {
    for i in 0..ctx.pfl_len() {
        format_pfi(ctx, i, out);
    }
}

impl Strategy for TraceStrategy {
    fn callout(&mut self, ctx: &mut StrategyCtx<'_>, op: StrategyOp, faceid: FaceId) {
        let sp = match ctx.parameters() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => "default".to_string(),
        };
        let serial = ctx.serial();
        let mut pfl = String::new();
        format_pfl(ctx, &mut pfl);

        if op == StrategyOp::Init {
            let (tname, tparams) = match sp.split_once('/') {
                Some((t, p)) => (t, Some(p.to_string())),
                None => (sp.as_str(), None),
            };
            let tname = if tname.is_empty() { "default" } else { tname };
            if tname == "default" && !sp.starts_with("default") {
                // record the defaulting so it can be seen from outside
                ctx.notice(&format!("# trace: inner strategy defaulted to 'default' (parameters {:?})", sp));
            }
            let Some(mut inner) = create_instance(tname, tparams) else {
                ctx.init_error("traced strategy name unknown");
                return;
            };
            ctx.delegate(&mut inner, op, faceid);
            self.inner = Some(Box::new(inner));
            info!("st-{} Init - i={}", sp, serial);
            return;
        }

        if let Some(inner) = self.inner.as_mut() {
            ctx.delegate(inner, op, faceid);
        }
        if op == StrategyOp::Finalize {
            self.inner = None;
            info!("st-{} Finalize i={}", sp, serial);
            return;
        }
        let mut after = String::new();
        format_pfl(ctx, &mut after);
        info!("st-{} {:?} {} i={}{} ///{}", sp, op, faceid, serial, pfl, after);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testutil::*;
    use crate::face::NOFACEID;
    use crate::pit::PFI_UPSTREAM;

    #[test]
    fn unknown_inner_class_fails_init() {
        let (mut d, _k) = test_daemon();
        let mut s = TraceStrategy::new();
        let mut ctx = StrategyCtx {
            d: &mut d,
            serial: 0,
            npe: 0,
            parameters: Some("bogus".into()),
            init_error: None,
        };
        s.callout(&mut ctx, StrategyOp::Init, NOFACEID);
        assert!(ctx.init_error.is_some());
    }

    #[test]
    fn callouts_delegate_to_the_inner_class() {
        let (mut d, _k) = test_daemon();
        let a = add_face(&mut d, 0);
        let b = add_face(&mut d, 0);
        let (serial, npe) = seed_pit_entry(&mut d, "ccnx:/tr/x", a, &[b]);
        let mut s = TraceStrategy::new();
        let mut ctx = StrategyCtx {
            d: &mut d,
            serial,
            npe,
            parameters: Some("null".into()),
            init_error: None,
        };
        s.callout(&mut ctx, StrategyOp::Init, NOFACEID);
        assert!(ctx.init_error.is_none());
        let mut ctx = StrategyCtx {
            d: &mut d,
            serial,
            npe,
            parameters: Some("null".into()),
            init_error: None,
        };
        s.callout(&mut ctx, StrategyOp::Update, NOFACEID);
        /* the wrapped null strategy serviced the flagged upstream */
        let e = d.pit.get(serial).unwrap();
        let up = e.pfi(b, PFI_UPSTREAM).unwrap();
        assert!(up.flags & PFI_SENDUPST != 0);
        assert!(up.flags & PFI_ATTENTION == 0);
    }
}

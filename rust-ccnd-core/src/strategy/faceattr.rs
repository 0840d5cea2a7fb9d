//! Not really a strategy: a way of poking face attributes from outside.
//!
//! A parameter string of the form `faceid/attrname=value` sets an
//! attribute (value: a non-negative number, `true`, or `false`).  A bare
//! faceid reports the face's non-zero attributes.  Either way the Init
//! "fails" with the report string, so nothing is ever instantiated.

use super::{Strategy, StrategyCtx, StrategyOp};
use crate::face::FaceId;
use std::fmt::Write as _;

#[derive(Debug)]
pub struct FaceattrStrategy;

impl Strategy for FaceattrStrategy {
    fn callout(&mut self, ctx: &mut StrategyCtx<'_>, op: StrategyOp, _faceid: FaceId) {
        if op != StrategyOp::Init {
            return;
        }
        let s = ctx.parameters().unwrap_or("").to_string();
        let outcome = run(ctx, &s);
        match outcome {
            Ok(report) => ctx.init_error(report),
            Err(()) => ctx.init_error("Sorry, Charlie"),
        }
    }
}

fn run(ctx: &mut StrategyCtx<'_>, s: &str) -> Result<String, ()> {
    let bytes = s.as_bytes();
    let mut i = 0usize;
    let mut faceid: FaceId = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        faceid = faceid.wrapping_mul(10).wrapping_add((bytes[i] - b'0') as u32);
        i += 1;
    }
    if i == bytes.len() {
        return show(ctx, faceid);
    }
    if bytes[i] != b'/' {
        return Err(());
    }
    i += 1;
    let attr_start = i;
    while i < bytes.len() && bytes[i] != b'=' {
        if !bytes[i].is_ascii_alphabetic() {
            return Err(());
        }
        i += 1;
    }
    if i == attr_start || i == bytes.len() {
        return Err(());
    }
    let attr = &s[attr_start..i];
    i += 1;
    if i == bytes.len() {
        return Err(());
    }
    let valtext = &s[i..];
    let (value, is_bool) = if valtext.eq_ignore_ascii_case("true") {
        (1u32, true)
    } else if valtext.eq_ignore_ascii_case("false") {
        (0u32, true)
    } else {
        let v = valtext.parse::<u32>().map_err(|_| ())?;
        (v, false)
    };
    if !ctx.face_exists(faceid) {
        return Err(());
    }
    let index = if is_bool {
        ctx.faceattr_bool_index(attr).ok_or(())?
    } else {
        ctx.faceattr_index(attr)
    };
    ctx.faceattr_set(faceid, index, value).map_err(|_| ())?;
    Ok(s.to_string())
}

fn show(ctx: &mut StrategyCtx<'_>, faceid: FaceId) -> Result<String, ()> {
    if !ctx.face_exists(faceid) {
        return Err(());
    }
    let mut out = format!("{}", faceid);
    let mut dlm = '/';
    for (name, index) in ctx.faceattr_names() {
        let v = ctx.faceattr_get(faceid, index);
        if v != 0 {
            let _ = write!(out, "{}{}={}", dlm, name, v);
            dlm = '&';
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testutil::*;
    use crate::face::NOFACEID;

    #[test]
    fn init_sets_the_named_attribute() {
        let (mut d, _k) = test_daemon();
        let f = add_plain_face(&mut d, 0);
        let params = format!("{}/slow=true", f);
        let mut s = FaceattrStrategy;
        let mut ctx = StrategyCtx {
            d: &mut d,
            serial: 0,
            npe: 0,
            parameters: Some(params.clone()),
            init_error: None,
        };
        s.callout(&mut ctx, StrategyOp::Init, NOFACEID);
        /* init always "fails" with the report string */
        assert_eq!(ctx.init_error.as_deref(), Some(params.as_str()));
        let idx = d.faceattrs.lookup("slow").unwrap();
        assert_eq!(d.faces.get(f).unwrap().attr_get(idx), 1);
    }

    #[test]
    fn bare_faceid_reports_nonzero_attributes() {
        let (mut d, _k) = test_daemon();
        let f = add_plain_face(&mut d, 0);
        let mut s = FaceattrStrategy;
        let mut ctx = StrategyCtx {
            d: &mut d,
            serial: 0,
            npe: 0,
            parameters: Some(f.to_string()),
            init_error: None,
        };
        s.callout(&mut ctx, StrategyOp::Init, NOFACEID);
        /* a fresh unadorned face has nothing to report but its id */
        assert_eq!(ctx.init_error.as_deref(), Some(f.to_string().as_str()));
    }

    #[test]
    fn malformed_parameters_are_rejected() {
        let (mut d, _k) = test_daemon();
        let mut s = FaceattrStrategy;
        let mut ctx = StrategyCtx {
            d: &mut d,
            serial: 0,
            npe: 0,
            parameters: Some("12/sl0w!=x".into()),
            init_error: None,
        };
        s.callout(&mut ctx, StrategyOp::Init, NOFACEID);
        assert_eq!(ctx.init_error.as_deref(), Some("Sorry, Charlie"));
    }
}

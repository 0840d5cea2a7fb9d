//! The stats HTTP surface.
//!
//! Any stream face whose first bytes are `GET ` is hijacked and answered
//! with a one-shot HTTP response: an HTML dashboard by default, XML with
//! `?f=xml`, JSON with `?f=json`.  `?l=<level>` adjusts the debug
//! bitmask.  The connection always closes after one response.

use crate::daemon::Daemon;
use crate::face::FaceId;
use crate::fib::FORW_REFRESHED;
use log::info;
use rust_ccnd_common::meter::FaceMeter;
use rust_ccnd_common::name::Name;
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Serialize)]
struct FaceStats {
    faceid: FaceId,
    flags: String,
    pending_interests: i32,
    outstanding_interests: i32,
    peer: Option<String>,
    bytes_in: u64,
    bytes_out: u64,
    interests_in: u64,
    interests_out: u64,
    content_in: u64,
    content_out: u64,
    interest_rate_in: u64,
    content_rate_out: u64,
}

#[derive(Serialize)]
struct ForwardingStats {
    prefix: String,
    faceid: FaceId,
    flags: u32,
    expires: i32,
}

#[derive(Serialize)]
struct Snapshot {
    ccnd_id: String,
    uptime_seconds: u64,
    debug: u32,
    interests_accepted: u64,
    interests_dropped: u64,
    interests_sent: u64,
    interests_stuffed: u64,
    content_items_sent: u64,
    content_dups_recvd: u64,
    content_store_size: usize,
    content_store_capacity: usize,
    content_store_stale: usize,
    pit_size: usize,
    faces: Vec<FaceStats>,
    forwarding: Vec<ForwardingStats>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn collect(d: &Daemon) -> Snapshot {
    let sec = d.clock.sec;
    let mut faces = Vec::new();
    for f in d.faces.iter() {
        faces.push(FaceStats {
            faceid: f.faceid,
            flags: format!("{:#x}", f.flags),
            pending_interests: f.pending_interests,
            outstanding_interests: f.outstanding_interests,
            peer: f.addr.map(|a| a.to_string()),
            bytes_in: f.meters.get(FaceMeter::BytesIn).total(),
            bytes_out: f.meters.get(FaceMeter::BytesOut).total(),
            interests_in: f.meters.get(FaceMeter::InterestsIn).total(),
            interests_out: f.meters.get(FaceMeter::InterestsOut).total(),
            content_in: f.meters.get(FaceMeter::ContentIn).total(),
            content_out: f.meters.get(FaceMeter::ContentOut).total(),
            interest_rate_in: f.meters.get(FaceMeter::InterestsIn).rate(sec),
            content_rate_out: f.meters.get(FaceMeter::ContentOut).rate(sec),
        });
    }
    faces.sort_by_key(|f| f.faceid);
    let mut forwarding = Vec::new();
    for id in d.fib.ids() {
        let Some(e) = d.fib.get(id) else { continue };
        if e.forwarding.is_empty() {
            continue;
        }
        let name = Name::from_components(rust_ccnd_common::name::flatname_comps(&e.flatname));
        for fwd in &e.forwarding {
            forwarding.push(ForwardingStats {
                prefix: name.to_uri(),
                faceid: fwd.faceid,
                flags: fwd.flags & !FORW_REFRESHED,
                expires: fwd.expires,
            });
        }
    }
    forwarding.sort_by(|a, b| a.prefix.cmp(&b.prefix).then(a.faceid.cmp(&b.faceid)));
    let c = d.counters();
    Snapshot {
        ccnd_id: hex(&d.ccnd_id()),
        uptime_seconds: d.clock.uptime_secs(),
        debug: d.cfg.debug,
        interests_accepted: c.interests_accepted,
        interests_dropped: c.interests_dropped,
        interests_sent: c.interests_sent,
        interests_stuffed: c.interests_stuffed,
        content_items_sent: c.content_items_sent,
        content_dups_recvd: c.content_dups_recvd,
        content_store_size: d.cs.len(),
        content_store_capacity: d.cs.capacity,
        content_store_stale: d.cs.n_stale,
        pit_size: d.pit_len(),
        faces,
        forwarding,
    }
}

fn render_html(s: &Snapshot) -> String {
    let mut b = String::new();
    let _ = write!(
        b,
        "<html><head><title>ccnd[{}]</title></head><body>\n<h2>ccnd {}</h2>\n",
        &s.ccnd_id[..8],
        s.ccnd_id
    );
    let _ = write!(
        b,
        "<p>up {} s, debug {:#x}, store {}/{} ({} stale), pit {}</p>\n",
        s.uptime_seconds, s.debug, s.content_store_size, s.content_store_capacity,
        s.content_store_stale, s.pit_size
    );
    let _ = write!(
        b,
        "<p>interests: accepted {}, dropped {}, sent {}, stuffed {}; \
         content: sent {}, dups {}</p>\n",
        s.interests_accepted,
        s.interests_dropped,
        s.interests_sent,
        s.interests_stuffed,
        s.content_items_sent,
        s.content_dups_recvd
    );
    b.push_str("<h3>Faces</h3>\n<table border=1><tr><th>face</th><th>flags</th><th>peer</th><th>pend</th><th>outst</th><th>bytes i/o</th><th>intr i/o</th><th>data i/o</th><th>rates i-intr/o-data</th></tr>\n");
    for f in &s.faces {
        let _ = write!(
            b,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}/{}</td><td>{}/{}</td><td>{}/{}</td><td>{}/{}</td></tr>\n",
            f.faceid,
            f.flags,
            f.peer.as_deref().unwrap_or("-"),
            f.pending_interests,
            f.outstanding_interests,
            f.bytes_in,
            f.bytes_out,
            f.interests_in,
            f.interests_out,
            f.content_in,
            f.content_out,
            f.interest_rate_in,
            f.content_rate_out,
        );
    }
    b.push_str("</table>\n<h3>Forwarding</h3>\n<table border=1><tr><th>prefix</th><th>face</th><th>flags</th><th>expires</th></tr>\n");
    for e in &s.forwarding {
        let _ = write!(
            b,
            "<tr><td>{}</td><td>{}</td><td>{:#x}</td><td>{}</td></tr>\n",
            e.prefix, e.faceid, e.flags, e.expires
        );
    }
    b.push_str("</table>\n</body></html>\n");
    b
}

fn render_xml(s: &Snapshot) -> String {
    let mut b = String::from("<?xml version=\"1.0\"?>\n<ccnd>\n");
    let _ = write!(b, "  <identity>{}</identity>\n", s.ccnd_id);
    let _ = write!(b, "  <uptime>{}</uptime>\n", s.uptime_seconds);
    let _ = write!(
        b,
        "  <cs size=\"{}\" capacity=\"{}\" stale=\"{}\"/>\n",
        s.content_store_size, s.content_store_capacity, s.content_store_stale
    );
    let _ = write!(b, "  <pit size=\"{}\"/>\n", s.pit_size);
    let _ = write!(
        b,
        "  <interests accepted=\"{}\" dropped=\"{}\" sent=\"{}\" stuffed=\"{}\"/>\n",
        s.interests_accepted, s.interests_dropped, s.interests_sent, s.interests_stuffed
    );
    b.push_str("  <faces>\n");
    for f in &s.faces {
        let _ = write!(
            b,
            "    <face id=\"{}\" flags=\"{}\" pending=\"{}\" outstanding=\"{}\"",
            f.faceid, f.flags, f.pending_interests, f.outstanding_interests
        );
        if let Some(p) = &f.peer {
            let _ = write!(b, " peer=\"{}\"", p);
        }
        b.push_str("/>\n");
    }
    b.push_str("  </faces>\n  <forwarding>\n");
    for e in &s.forwarding {
        let _ = write!(
            b,
            "    <entry prefix=\"{}\" face=\"{}\" flags=\"{}\" expires=\"{}\"/>\n",
            e.prefix, e.faceid, e.flags, e.expires
        );
    }
    b.push_str("  </forwarding>\n</ccnd>\n");
    b
}

/// Answer an HTTP connection that hijacked a stream face.
pub(crate) fn handle_http_connection(d: &mut Daemon, faceid: FaceId) {
    let request = match d.faces.get(faceid) {
        Some(f) => String::from_utf8_lossy(&f.inbuf).to_string(),
        None => return,
    };
    let first_line = request.lines().next().unwrap_or("");
    info!("http request on face {}: {}", faceid, first_line);
    let path = first_line
        .strip_prefix("GET ")
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or("/");
    let (path, query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };
    let mut format = "html";
    if let Some(q) = query {
        for kv in q.split('&') {
            match kv.split_once('=') {
                Some(("f", v)) => format = if v == "xml" { "xml" } else if v == "json" { "json" } else { "html" },
                Some(("l", v)) => {
                    if let Ok(level) = v.parse::<i64>() {
                        d.cfg.debug = if level < 0 { u32::MAX } else { level as u32 };
                        info!("debug bitmask set to {:#x} via stats surface", d.cfg.debug);
                    }
                }
                _ => {}
            }
        }
    }
    let response = if path == "/" {
        let snap = collect(d);
        let (body, ctype) = match format {
            "xml" => (render_xml(&snap), "text/xml"),
            "json" => (
                serde_json::to_string_pretty(&snap).unwrap_or_else(|_| "{}".into()),
                "application/json",
            ),
            _ => (render_html(&snap), "text/html"),
        };
        http_response("200 OK", ctype, body.as_bytes())
    } else {
        http_response("404 Not Found", "text/plain", b"no such resource\n")
    };
    d.finish_http_response(faceid, response);
}

fn http_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

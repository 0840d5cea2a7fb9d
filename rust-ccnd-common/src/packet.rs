//! Typed views over ccnb-encoded messages.
//!
//! Parsers produce offset spans into the original buffer rather than
//! copies, the way the daemon wants them: prefix comparisons and PIT keys
//! are raw byte ranges, and component bodies are decoded on demand.

use crate::ccnb::{self, dtag, Decoder};
use crate::error::Error;
use crate::name::{compare_components, Name};
use bytes::BytesMut;
use sha2::{Digest, Sha256};
use std::ops::Range;

/// AnswerOriginKind bits.
pub const AOK_CS: u32 = 1;
pub const AOK_NEW: u32 = 2;
pub const AOK_DEFAULT: u32 = AOK_CS | AOK_NEW;
pub const AOK_STALE: u32 = 4;
pub const AOK_EXPIRE: u32 = 0x10;

/// ContentObject type codes (the three-byte wire values).
pub const CONTENT_TYPE_DATA: u32 = 0x0C04C0;
pub const CONTENT_TYPE_ENCR: u32 = 0x10D091;
pub const CONTENT_TYPE_GONE: u32 = 0x18E344;
pub const CONTENT_TYPE_KEY: u32 = 0x28463F;
pub const CONTENT_TYPE_LINK: u32 = 0x2C834A;
pub const CONTENT_TYPE_NACK: u32 = 0x34008A;

/// Interest lifetime units per second (the wire carries 1/4096 s).
pub const LIFETIME_UNITS_PER_SEC: u64 = 4096;
/// Default interest lifetime (4 seconds).
pub const DEFAULT_LIFETIME_UNITS: u64 = 4 * LIFETIME_UNITS_PER_SEC;

/// What kind of message leads the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Interest,
    ContentObject,
    LinkPdu,
    SequenceNumber,
    Unknown(u64),
}

/// Peek the outermost DTAG to classify a message.
pub fn classify(msg: &[u8]) -> Option<MessageKind> {
    let d = Decoder::new(msg);
    Some(match d.peek_dtag()? {
        dtag::INTEREST => MessageKind::Interest,
        dtag::CONTENT_OBJECT => MessageKind::ContentObject,
        dtag::CCN_PROTOCOL_DATA_UNIT => MessageKind::LinkPdu,
        dtag::SEQUENCE_NUMBER => MessageKind::SequenceNumber,
        other => MessageKind::Unknown(other),
    })
}

/* ---------------------------------------------------------------- *
 * Interest
 * ---------------------------------------------------------------- */

/// Offset view of a parsed Interest.
#[derive(Debug, Clone)]
pub struct ParsedInterest {
    /// Span of the whole Name element.
    pub name_span: Range<usize>,
    /// Start offset of each Component element, plus a final sentinel at
    /// the position of the Name closer.
    pub comps: Vec<usize>,
    pub min_suffix: u32,
    pub max_suffix: Option<u32>,
    /// Body span of PublisherPublicKeyDigest, if present.
    pub publisher_digest: Option<Range<usize>>,
    /// Span of the whole Exclude element, if present.
    pub exclude_span: Option<Range<usize>>,
    /// ChildSelector: 0 (the default) leftmost, odd rightmost preferred.
    pub orderpref: i32,
    pub answerfrom: u32,
    /// Scope: -1 when absent.
    pub scope: i32,
    /// InterestLifetime in 1/4096 s units, if present.
    pub lifetime: Option<u64>,
    /// Body span of the Nonce, if present.
    pub nonce: Option<Range<usize>>,
    /// FaceID steering element (used by the control plane).
    pub faceid: Option<u32>,
    /// Offset where the lifetime/nonce tail begins; everything before
    /// this participates in PIT similarity.
    pub pit_key_end: usize,
}

impl ParsedInterest {
    /// Number of name components.
    pub fn prefix_comps(&self) -> usize {
        self.comps.len().saturating_sub(1)
    }

    /// The lifetime in wire units, defaulted.
    pub fn lifetime_units(&self) -> u64 {
        self.lifetime.unwrap_or(DEFAULT_LIFETIME_UNITS)
    }

    /// The PIT key: the message up to the lifetime/nonce tail, re-closed
    /// so the key is itself a well-formed Interest.
    pub fn pit_key(&self, msg: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.pit_key_end + 1);
        key.extend_from_slice(&msg[..self.pit_key_end]);
        key.push(ccnb::CCN_CLOSE);
        key
    }

    /// Raw bytes of the name prefix (component elements, no Name header).
    pub fn prefix_bytes<'m>(&self, msg: &'m [u8]) -> &'m [u8] {
        &msg[self.comps[0]..self.comps[self.prefix_comps()]]
    }
}

/// Decode the body of a Component element found at `elem_start`.
pub fn component_body(msg: &[u8], elem_start: usize) -> Result<&[u8], Error> {
    let mut d = Decoder::new(&msg[elem_start..]);
    d.enter(dtag::COMPONENT)?;
    let b = d.read_blob()?;
    d.close()?;
    Ok(b)
}

/// Parse an Interest message.
pub fn parse_interest(msg: &[u8]) -> Result<ParsedInterest, Error> {
    let mut d = Decoder::new(msg);
    d.enter(dtag::INTEREST)?;
    let name_start = d.pos();
    let mut comps = Vec::new();
    d.enter(dtag::NAME)?;
    while d.peek_dtag() == Some(dtag::COMPONENT) {
        comps.push(d.pos());
        d.skip_element()?;
    }
    comps.push(d.pos());
    d.close()?;
    let name_span = name_start..d.pos();

    let min_suffix = d.opt_tagged_number(dtag::MIN_SUFFIX_COMPONENTS)?.unwrap_or(0) as u32;
    let max_suffix = d.opt_tagged_number(dtag::MAX_SUFFIX_COMPONENTS)?.map(|v| v as u32);
    let publisher_digest = match d.peek_dtag() {
        Some(dtag::PUBLISHER_PUBLIC_KEY_DIGEST) => {
            d.enter(dtag::PUBLISHER_PUBLIC_KEY_DIGEST)?;
            let body = d.read_blob()?;
            let end = d.pos();
            d.close()?;
            Some(end - body.len()..end)
        }
        _ => None,
    };
    let exclude_span = if d.peek_dtag() == Some(dtag::EXCLUDE) {
        Some(d.skip_element()?)
    } else {
        None
    };
    let orderpref = d
        .opt_tagged_number(dtag::CHILD_SELECTOR)?
        .map(|v| v as i32)
        .unwrap_or(0);
    let answerfrom = d
        .opt_tagged_number(dtag::ANSWER_ORIGIN_KIND)?
        .map(|v| v as u32)
        .unwrap_or(AOK_DEFAULT);
    let scope = d.opt_tagged_number(dtag::SCOPE)?.map(|v| v as i32).unwrap_or(-1);
    let pit_key_end = d.pos();
    let lifetime = d.opt_tagged_binary_number(dtag::INTEREST_LIFETIME)?;
    let nonce = match d.peek_dtag() {
        Some(dtag::NONCE) => {
            d.enter(dtag::NONCE)?;
            let body = d.read_blob()?;
            let end = d.pos();
            d.close()?;
            Some(end - body.len()..end)
        }
        _ => None,
    };
    let faceid = d.opt_tagged_number(dtag::FACE_ID)?.map(|v| v as u32);
    d.close()?;
    Ok(ParsedInterest {
        name_span,
        comps,
        min_suffix,
        max_suffix,
        publisher_digest,
        exclude_span,
        orderpref,
        answerfrom,
        scope,
        lifetime,
        nonce,
        faceid,
        pit_key_end,
    })
}

/// Entry in an Exclude specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExcludeEntry {
    Any,
    Component(Vec<u8>),
}

/// Builder for outgoing Interests.
#[derive(Debug, Clone, Default)]
pub struct InterestTemplate {
    pub name: Name,
    pub min_suffix: Option<u32>,
    pub max_suffix: Option<u32>,
    pub exclude: Vec<ExcludeEntry>,
    pub orderpref: Option<u32>,
    pub answerfrom: Option<u32>,
    pub scope: Option<u32>,
    pub lifetime_units: Option<u64>,
    pub nonce: Option<Vec<u8>>,
    pub faceid: Option<u32>,
}

impl InterestTemplate {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut b = BytesMut::new();
        ccnb::element_begin(&mut b, dtag::INTEREST);
        self.name.encode(&mut b);
        if let Some(v) = self.min_suffix {
            ccnb::append_tagged_number(&mut b, dtag::MIN_SUFFIX_COMPONENTS, v as u64);
        }
        if let Some(v) = self.max_suffix {
            ccnb::append_tagged_number(&mut b, dtag::MAX_SUFFIX_COMPONENTS, v as u64);
        }
        if !self.exclude.is_empty() {
            ccnb::element_begin(&mut b, dtag::EXCLUDE);
            for e in &self.exclude {
                match e {
                    ExcludeEntry::Any => {
                        ccnb::element_begin(&mut b, dtag::ANY);
                        ccnb::element_end(&mut b);
                    }
                    ExcludeEntry::Component(c) => {
                        ccnb::append_tagged_blob(&mut b, dtag::COMPONENT, c)
                    }
                }
            }
            ccnb::element_end(&mut b);
        }
        if let Some(v) = self.orderpref {
            ccnb::append_tagged_number(&mut b, dtag::CHILD_SELECTOR, v as u64);
        }
        if let Some(v) = self.answerfrom {
            ccnb::append_tagged_number(&mut b, dtag::ANSWER_ORIGIN_KIND, v as u64);
        }
        if let Some(v) = self.scope {
            ccnb::append_tagged_number(&mut b, dtag::SCOPE, v as u64);
        }
        if let Some(v) = self.lifetime_units {
            ccnb::append_tagged_binary_number(&mut b, dtag::INTEREST_LIFETIME, v);
        }
        if let Some(n) = &self.nonce {
            ccnb::append_tagged_blob(&mut b, dtag::NONCE, n);
        }
        if let Some(v) = self.faceid {
            ccnb::append_tagged_number(&mut b, dtag::FACE_ID, v as u64);
        }
        ccnb::element_end(&mut b);
        b
    }
}

/// Evaluate an Exclude element against a single component value.
pub fn component_excluded(exclude_elem: &[u8], comp: &[u8]) -> bool {
    let mut d = Decoder::new(exclude_elem);
    if d.enter(dtag::EXCLUDE).is_err() {
        return false;
    }
    let mut any_open = false;
    while !d.at_close() {
        match d.peek_dtag() {
            Some(dtag::ANY) => {
                if d.enter(dtag::ANY).is_err() || d.close().is_err() {
                    return false;
                }
                any_open = true;
            }
            Some(dtag::BLOOM) => {
                // Bloom filters are deprecated; treat as a range wildcard.
                if d.skip_element().is_err() {
                    return false;
                }
                any_open = true;
            }
            Some(dtag::COMPONENT) => {
                let start = d.pos();
                if d.skip_element().is_err() {
                    return false;
                }
                let body = match component_body(exclude_elem, start) {
                    Ok(b) => b,
                    Err(_) => return false,
                };
                match compare_components(comp, body) {
                    std::cmp::Ordering::Equal => return true,
                    std::cmp::Ordering::Less => return any_open,
                    std::cmp::Ordering::Greater => any_open = false,
                }
            }
            _ => return false,
        }
    }
    any_open
}

/* ---------------------------------------------------------------- *
 * ContentObject
 * ---------------------------------------------------------------- */

/// Offset view of a parsed ContentObject.
#[derive(Debug, Clone)]
pub struct ParsedContentObject {
    pub signature_span: Range<usize>,
    /// Body span of SignatureBits.
    pub signature_bits: Range<usize>,
    /// Name through Content, the signed portion.
    pub signed_span: Range<usize>,
    pub name_span: Range<usize>,
    /// Component element starts plus the sentinel at the Name closer.
    pub comps: Vec<usize>,
    /// Body span of PublisherPublicKeyDigest.
    pub publisher_digest: Range<usize>,
    pub timestamp: u64,
    pub content_type: u32,
    pub freshness_seconds: Option<u32>,
    pub final_block_id: Option<Range<usize>>,
    /// Whole Content element.
    pub content_span: Range<usize>,
    /// Blob body of Content.
    pub content_body: Range<usize>,
}

impl ParsedContentObject {
    pub fn ncomps(&self) -> usize {
        self.comps.len().saturating_sub(1)
    }
}

/// Parse a ContentObject message.
pub fn parse_content_object(msg: &[u8]) -> Result<ParsedContentObject, Error> {
    let mut d = Decoder::new(msg);
    d.enter(dtag::CONTENT_OBJECT)?;

    let sig_start = d.pos();
    d.enter(dtag::SIGNATURE)?;
    if d.peek_dtag() == Some(dtag::DIGEST_ALGORITHM) {
        d.skip_element()?;
    }
    if d.peek_dtag() == Some(dtag::WITNESS) {
        d.skip_element()?;
    }
    d.enter(dtag::SIGNATURE_BITS)?;
    let bits = d.read_blob()?;
    let bits_end = d.pos();
    let signature_bits = bits_end - bits.len()..bits_end;
    d.close()?;
    d.close()?;
    let signature_span = sig_start..d.pos();

    let signed_start = d.pos();
    let name_start = d.pos();
    let mut comps = Vec::new();
    d.enter(dtag::NAME)?;
    while d.peek_dtag() == Some(dtag::COMPONENT) {
        comps.push(d.pos());
        d.skip_element()?;
    }
    comps.push(d.pos());
    d.close()?;
    let name_span = name_start..d.pos();

    d.enter(dtag::SIGNED_INFO)?;
    d.enter(dtag::PUBLISHER_PUBLIC_KEY_DIGEST)?;
    let pub_body = d.read_blob()?;
    let pub_end = d.pos();
    let publisher_digest = pub_end - pub_body.len()..pub_end;
    d.close()?;
    let timestamp = d
        .opt_tagged_binary_number(dtag::TIMESTAMP)?
        .ok_or_else(|| Error::packet("missing Timestamp"))?;
    let content_type = match d.peek_dtag() {
        Some(dtag::TYPE) => {
            let b = d.tagged_blob(dtag::TYPE)?;
            let mut v: u32 = 0;
            for &x in b.iter().take(4) {
                v = (v << 8) | x as u32;
            }
            v
        }
        _ => CONTENT_TYPE_DATA,
    };
    let freshness_seconds = d.opt_tagged_number(dtag::FRESHNESS_SECONDS)?.map(|v| v as u32);
    let final_block_id = if d.peek_dtag() == Some(dtag::FINAL_BLOCK_ID) {
        Some(d.skip_element()?)
    } else {
        None
    };
    if d.peek_dtag() == Some(dtag::KEY_LOCATOR) {
        d.skip_element()?;
    }
    d.close()?;

    let content_start = d.pos();
    d.enter(dtag::CONTENT)?;
    let body = d.read_blob()?;
    let body_end = d.pos();
    let content_body = body_end - body.len()..body_end;
    d.close()?;
    let content_span = content_start..d.pos();
    let signed_span = signed_start..d.pos();
    d.close()?;

    Ok(ParsedContentObject {
        signature_span,
        signature_bits,
        signed_span,
        name_span,
        comps,
        publisher_digest,
        timestamp,
        content_type,
        freshness_seconds,
        final_block_id,
        content_span,
        content_body,
    })
}

/// The implicit digest: SHA-256 over the entire encoded ContentObject.
pub fn content_digest(msg: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(msg);
    h.finalize().into()
}

/// Rewrite the message with `Component(digest)` appended to the Name.
pub fn splice_digest_component(msg: &[u8], pco: &ParsedContentObject, digest: &[u8; 32]) -> Vec<u8> {
    let at = *pco.comps.last().expect("comps sentinel");
    let mut comp = BytesMut::new();
    ccnb::append_tagged_blob(&mut comp, dtag::COMPONENT, digest);
    let mut out = Vec::with_capacity(msg.len() + comp.len());
    out.extend_from_slice(&msg[..at]);
    out.extend_from_slice(&comp);
    out.extend_from_slice(&msg[at..]);
    out
}

/// Full field-by-field test of a content object against an interest.
///
/// `content` must already carry its digest component.
pub fn content_matches_interest(
    content: &[u8],
    pco: &ParsedContentObject,
    interest: &[u8],
    pi: &ParsedInterest,
) -> bool {
    let prefix = pi.prefix_comps();
    if pco.ncomps() < prefix {
        return false;
    }
    let want = pi.prefix_bytes(interest);
    let got_end = pco.comps[prefix];
    let got = &content[pco.comps[0]..got_end];
    if want != got {
        return false;
    }
    let suffix = (pco.ncomps() - prefix) as u32;
    if suffix < pi.min_suffix {
        return false;
    }
    if let Some(max) = pi.max_suffix {
        if suffix > max {
            return false;
        }
    }
    if let Some(pd) = &pi.publisher_digest {
        if interest[pd.clone()] != content[pco.publisher_digest.clone()] {
            return false;
        }
    }
    if let Some(ex) = &pi.exclude_span {
        if suffix >= 1 {
            let comp = match component_body(content, pco.comps[prefix]) {
                Ok(c) => c,
                Err(_) => return false,
            };
            if component_excluded(&interest[ex.clone()], comp) {
                return false;
            }
        }
    }
    true
}

/* ---------------------------------------------------------------- *
 * ContentObject construction
 * ---------------------------------------------------------------- */

/// Everything but the payload for building a ContentObject.
#[derive(Debug, Clone)]
pub struct ContentObjectParams {
    pub name: Name,
    pub publisher_digest: [u8; 32],
    /// Binary timestamp value (seconds with 12-bit fraction).
    pub timestamp: u64,
    pub content_type: u32,
    pub freshness_seconds: Option<u32>,
    pub final_block_id: Option<Vec<u8>>,
    pub key_locator_name: Option<Name>,
    /// Raw Key blob for serving public keys inline.
    pub key_bits: Option<Vec<u8>>,
}

impl ContentObjectParams {
    pub fn new(name: Name, publisher_digest: [u8; 32], timestamp: u64) -> Self {
        Self {
            name,
            publisher_digest,
            timestamp,
            content_type: CONTENT_TYPE_DATA,
            freshness_seconds: None,
            final_block_id: None,
            key_locator_name: None,
            key_bits: None,
        }
    }
}

/// Assemble a ContentObject, obtaining the signature bits from `sign`,
/// which is handed the signed span (Name through Content).
pub fn encode_content_object<F>(params: &ContentObjectParams, content: &[u8], sign: F) -> BytesMut
where
    F: FnOnce(&[u8]) -> Vec<u8>,
{
    let mut signed = BytesMut::new();
    params.name.encode(&mut signed);
    ccnb::element_begin(&mut signed, dtag::SIGNED_INFO);
    ccnb::append_tagged_blob(
        &mut signed,
        dtag::PUBLISHER_PUBLIC_KEY_DIGEST,
        &params.publisher_digest,
    );
    ccnb::append_tagged_binary_number(&mut signed, dtag::TIMESTAMP, params.timestamp);
    if params.content_type != CONTENT_TYPE_DATA {
        let be = params.content_type.to_be_bytes();
        ccnb::append_tagged_blob(&mut signed, dtag::TYPE, &be[1..]);
    }
    if let Some(fs) = params.freshness_seconds {
        ccnb::append_tagged_number(&mut signed, dtag::FRESHNESS_SECONDS, fs as u64);
    }
    if let Some(fb) = &params.final_block_id {
        ccnb::element_begin(&mut signed, dtag::FINAL_BLOCK_ID);
        ccnb::append_blob(&mut signed, fb);
        ccnb::element_end(&mut signed);
    }
    if let Some(kl) = &params.key_locator_name {
        ccnb::element_begin(&mut signed, dtag::KEY_LOCATOR);
        ccnb::element_begin(&mut signed, dtag::KEY_NAME);
        kl.encode(&mut signed);
        ccnb::element_end(&mut signed);
        ccnb::element_end(&mut signed);
    } else if let Some(kb) = &params.key_bits {
        ccnb::element_begin(&mut signed, dtag::KEY_LOCATOR);
        ccnb::append_tagged_blob(&mut signed, dtag::KEY, kb);
        ccnb::element_end(&mut signed);
    }
    ccnb::element_end(&mut signed);
    ccnb::element_begin(&mut signed, dtag::CONTENT);
    ccnb::append_blob(&mut signed, content);
    ccnb::element_end(&mut signed);

    let bits = sign(&signed);
    let mut out = BytesMut::with_capacity(signed.len() + bits.len() + 16);
    ccnb::element_begin(&mut out, dtag::CONTENT_OBJECT);
    ccnb::element_begin(&mut out, dtag::SIGNATURE);
    ccnb::append_tagged_blob(&mut out, dtag::SIGNATURE_BITS, &bits);
    ccnb::element_end(&mut out);
    out.extend_from_slice(&signed);
    ccnb::element_end(&mut out);
    out
}

/* ---------------------------------------------------------------- *
 * Link messages
 * ---------------------------------------------------------------- */

/// Parse a SequenceNumber link message.
pub fn parse_sequence_number(msg: &[u8]) -> Result<u64, Error> {
    let mut d = Decoder::new(msg);
    d.enter(dtag::SEQUENCE_NUMBER)?;
    let b = d.read_blob()?;
    if b.len() > 8 {
        return Err(Error::packet("oversize sequence number"));
    }
    let mut v: u64 = 0;
    for &x in b {
        v = (v << 8) | x as u64;
    }
    d.close()?;
    Ok(v)
}

/// Encode a SequenceNumber link message.
pub fn encode_sequence_number(seq: u64) -> BytesMut {
    let mut b = BytesMut::new();
    ccnb::element_begin(&mut b, dtag::SEQUENCE_NUMBER);
    let be = seq.to_be_bytes();
    let mut i = 0;
    while i < be.len() - 1 && be[i] == 0 {
        i += 1;
    }
    ccnb::append_blob(&mut b, &be[i..]);
    ccnb::element_end(&mut b);
    b
}

/* ---------------------------------------------------------------- *
 * Control-plane payloads
 * ---------------------------------------------------------------- */

/// FaceInstance request/response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaceInstance {
    pub action: Option<String>,
    pub ccnd_id: Option<Vec<u8>>,
    pub faceid: Option<u32>,
    pub ipproto: Option<u32>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub mcast_interface: Option<String>,
    pub mcast_ttl: Option<u32>,
    pub lifetime_seconds: Option<u32>,
}

impl FaceInstance {
    pub fn encode(&self) -> BytesMut {
        let mut b = BytesMut::new();
        ccnb::element_begin(&mut b, dtag::FACE_INSTANCE);
        if let Some(a) = &self.action {
            ccnb::append_tagged_udata(&mut b, dtag::ACTION, a);
        }
        if let Some(id) = &self.ccnd_id {
            ccnb::append_tagged_blob(&mut b, dtag::PUBLISHER_PUBLIC_KEY_DIGEST, id);
        }
        if let Some(v) = self.faceid {
            ccnb::append_tagged_number(&mut b, dtag::FACE_ID, v as u64);
        }
        if let Some(v) = self.ipproto {
            ccnb::append_tagged_number(&mut b, dtag::IP_PROTO, v as u64);
        }
        if let Some(h) = &self.host {
            ccnb::append_tagged_udata(&mut b, dtag::HOST, h);
        }
        if let Some(p) = &self.port {
            ccnb::append_tagged_udata(&mut b, dtag::PORT, p);
        }
        if let Some(mi) = &self.mcast_interface {
            ccnb::append_tagged_udata(&mut b, dtag::MULTICAST_INTERFACE, mi);
        }
        if let Some(v) = self.mcast_ttl {
            ccnb::append_tagged_number(&mut b, dtag::MULTICAST_TTL, v as u64);
        }
        if let Some(v) = self.lifetime_seconds {
            ccnb::append_tagged_number(&mut b, dtag::FRESHNESS_SECONDS, v as u64);
        }
        ccnb::element_end(&mut b);
        b
    }

    pub fn parse(msg: &[u8]) -> Result<Self, Error> {
        let mut d = Decoder::new(msg);
        d.enter(dtag::FACE_INSTANCE)?;
        let mut fi = FaceInstance::default();
        if d.peek_dtag() == Some(dtag::ACTION) {
            fi.action = Some(udata_string(d.tagged_udata(dtag::ACTION)?)?);
        }
        if let Some(id) = d.opt_tagged_blob(dtag::PUBLISHER_PUBLIC_KEY_DIGEST)? {
            fi.ccnd_id = Some(id.to_vec());
        }
        fi.faceid = d.opt_tagged_number(dtag::FACE_ID)?.map(|v| v as u32);
        fi.ipproto = d.opt_tagged_number(dtag::IP_PROTO)?.map(|v| v as u32);
        if d.peek_dtag() == Some(dtag::HOST) {
            fi.host = Some(udata_string(d.tagged_udata(dtag::HOST)?)?);
        }
        if d.peek_dtag() == Some(dtag::PORT) {
            fi.port = Some(udata_string(d.tagged_udata(dtag::PORT)?)?);
        }
        if d.peek_dtag() == Some(dtag::MULTICAST_INTERFACE) {
            fi.mcast_interface = Some(udata_string(d.tagged_udata(dtag::MULTICAST_INTERFACE)?)?);
        }
        fi.mcast_ttl = d.opt_tagged_number(dtag::MULTICAST_TTL)?.map(|v| v as u32);
        fi.lifetime_seconds = d.opt_tagged_number(dtag::FRESHNESS_SECONDS)?.map(|v| v as u32);
        d.close()?;
        Ok(fi)
    }
}

/// ForwardingEntry request/response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardingEntry {
    pub action: Option<String>,
    pub name: Option<Name>,
    pub ccnd_id: Option<Vec<u8>>,
    pub faceid: Option<u32>,
    pub flags: Option<u32>,
    pub lifetime_seconds: Option<u32>,
}

impl ForwardingEntry {
    pub fn encode(&self) -> BytesMut {
        let mut b = BytesMut::new();
        ccnb::element_begin(&mut b, dtag::FORWARDING_ENTRY);
        if let Some(a) = &self.action {
            ccnb::append_tagged_udata(&mut b, dtag::ACTION, a);
        }
        if let Some(n) = &self.name {
            n.encode(&mut b);
        }
        if let Some(id) = &self.ccnd_id {
            ccnb::append_tagged_blob(&mut b, dtag::PUBLISHER_PUBLIC_KEY_DIGEST, id);
        }
        if let Some(v) = self.faceid {
            ccnb::append_tagged_number(&mut b, dtag::FACE_ID, v as u64);
        }
        if let Some(v) = self.flags {
            ccnb::append_tagged_number(&mut b, dtag::FORWARDING_FLAGS, v as u64);
        }
        if let Some(v) = self.lifetime_seconds {
            ccnb::append_tagged_number(&mut b, dtag::FRESHNESS_SECONDS, v as u64);
        }
        ccnb::element_end(&mut b);
        b
    }

    pub fn parse(msg: &[u8]) -> Result<Self, Error> {
        let mut d = Decoder::new(msg);
        d.enter(dtag::FORWARDING_ENTRY)?;
        let mut fe = ForwardingEntry::default();
        if d.peek_dtag() == Some(dtag::ACTION) {
            fe.action = Some(udata_string(d.tagged_udata(dtag::ACTION)?)?);
        }
        if d.peek_dtag() == Some(dtag::NAME) {
            fe.name = Some(Name::decode(&mut d)?);
        }
        if let Some(id) = d.opt_tagged_blob(dtag::PUBLISHER_PUBLIC_KEY_DIGEST)? {
            fe.ccnd_id = Some(id.to_vec());
        }
        fe.faceid = d.opt_tagged_number(dtag::FACE_ID)?.map(|v| v as u32);
        fe.flags = d.opt_tagged_number(dtag::FORWARDING_FLAGS)?.map(|v| v as u32);
        fe.lifetime_seconds = d.opt_tagged_number(dtag::FRESHNESS_SECONDS)?.map(|v| v as u32);
        d.close()?;
        Ok(fe)
    }
}

/// StrategySelection request/response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategySelection {
    pub action: Option<String>,
    pub name: Option<Name>,
    pub ccnd_id: Option<Vec<u8>>,
    pub class_id: Option<String>,
    pub parameters: Option<String>,
    pub lifetime_seconds: Option<u32>,
}

impl StrategySelection {
    pub fn encode(&self) -> BytesMut {
        let mut b = BytesMut::new();
        ccnb::element_begin(&mut b, dtag::STRATEGY_SELECTION);
        if let Some(a) = &self.action {
            ccnb::append_tagged_udata(&mut b, dtag::ACTION, a);
        }
        if let Some(n) = &self.name {
            n.encode(&mut b);
        }
        if let Some(id) = &self.ccnd_id {
            ccnb::append_tagged_blob(&mut b, dtag::PUBLISHER_PUBLIC_KEY_DIGEST, id);
        }
        if let Some(c) = &self.class_id {
            ccnb::append_tagged_udata(&mut b, dtag::TYPE, c);
        }
        if let Some(p) = &self.parameters {
            ccnb::append_tagged_udata(&mut b, dtag::LIFETIME, p);
        }
        if let Some(v) = self.lifetime_seconds {
            ccnb::append_tagged_number(&mut b, dtag::FRESHNESS_SECONDS, v as u64);
        }
        ccnb::element_end(&mut b);
        b
    }

    pub fn parse(msg: &[u8]) -> Result<Self, Error> {
        let mut d = Decoder::new(msg);
        d.enter(dtag::STRATEGY_SELECTION)?;
        let mut ss = StrategySelection::default();
        if d.peek_dtag() == Some(dtag::ACTION) {
            ss.action = Some(udata_string(d.tagged_udata(dtag::ACTION)?)?);
        }
        if d.peek_dtag() == Some(dtag::NAME) {
            ss.name = Some(Name::decode(&mut d)?);
        }
        if let Some(id) = d.opt_tagged_blob(dtag::PUBLISHER_PUBLIC_KEY_DIGEST)? {
            ss.ccnd_id = Some(id.to_vec());
        }
        if d.peek_dtag() == Some(dtag::TYPE) {
            ss.class_id = Some(udata_string(d.tagged_udata(dtag::TYPE)?)?);
        }
        if d.peek_dtag() == Some(dtag::LIFETIME) {
            ss.parameters = Some(udata_string(d.tagged_udata(dtag::LIFETIME)?)?);
        }
        ss.lifetime_seconds = d.opt_tagged_number(dtag::FRESHNESS_SECONDS)?.map(|v| v as u32);
        d.close()?;
        Ok(ss)
    }
}

/// Encode a StatusResponse body (used with ContentType NACK).
pub fn encode_status_response(code: u32, text: &str) -> BytesMut {
    let mut b = BytesMut::new();
    ccnb::element_begin(&mut b, dtag::STATUS_RESPONSE);
    ccnb::append_tagged_number(&mut b, dtag::STATUS_CODE, code as u64);
    if !text.is_empty() {
        ccnb::append_tagged_udata(&mut b, dtag::STATUS_TEXT, text);
    }
    ccnb::element_end(&mut b);
    b
}

fn udata_string(b: &[u8]) -> Result<String, Error> {
    String::from_utf8(b.to_vec()).map_err(|_| Error::packet("non-utf8 text element"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_signer(signed: &[u8]) -> Vec<u8> {
        content_digest(signed).to_vec()
    }

    fn sample_object(uri: &str, payload: &[u8], freshness: Option<u32>) -> Vec<u8> {
        let name = Name::from_uri(uri).unwrap();
        let mut params = ContentObjectParams::new(name, [7u8; 32], 0x1234);
        params.freshness_seconds = freshness;
        let msg = encode_content_object(&params, payload, digest_signer);
        let pco = parse_content_object(&msg).unwrap();
        let digest = content_digest(&msg);
        splice_digest_component(&msg, &pco, &digest)
    }

    #[test]
    fn interest_parse_fields() {
        let mut t = InterestTemplate::new(Name::from_uri("ccnx:/a/b").unwrap());
        t.scope = Some(2);
        t.lifetime_units = Some(8192);
        t.nonce = Some(vec![9, 9, 9, 9, 9, 9]);
        let msg = t.encode();
        let pi = parse_interest(&msg).unwrap();
        assert_eq!(pi.prefix_comps(), 2);
        assert_eq!(pi.scope, 2);
        assert_eq!(pi.lifetime, Some(8192));
        let nonce = pi.nonce.clone().unwrap();
        assert_eq!(&msg[nonce], &[9, 9, 9, 9, 9, 9]);
    }

    #[test]
    fn pit_key_ignores_lifetime_and_nonce() {
        let mut a = InterestTemplate::new(Name::from_uri("ccnx:/a/b").unwrap());
        a.lifetime_units = Some(4096);
        a.nonce = Some(vec![1, 2, 3, 4, 5, 6]);
        let mut b = a.clone();
        b.lifetime_units = Some(9999);
        b.nonce = Some(vec![6, 5, 4, 3, 2, 1]);
        let ma = a.encode();
        let mb = b.encode();
        let pa = parse_interest(&ma).unwrap();
        let pb = parse_interest(&mb).unwrap();
        assert_eq!(pa.pit_key(&ma), pb.pit_key(&mb));
        // and the key itself re-parses
        let key = pa.pit_key(&ma);
        let pk = parse_interest(&key).unwrap();
        assert_eq!(pk.prefix_comps(), 2);
        assert_eq!(pk.nonce, None);
    }

    #[test]
    fn content_object_round_trip() {
        let msg = sample_object("ccnx:/test/hello", b"world", Some(60));
        let pco = parse_content_object(&msg).unwrap();
        assert_eq!(pco.ncomps(), 3); // two uri comps + digest
        assert_eq!(&msg[pco.content_body.clone()], b"world");
        assert_eq!(pco.freshness_seconds, Some(60));
    }

    #[test]
    fn prefix_match_and_suffix_limits() {
        let msg = sample_object("ccnx:/test/hello", b"world", None);
        let pco = parse_content_object(&msg).unwrap();
        let t = InterestTemplate::new(Name::from_uri("ccnx:/test").unwrap());
        let imsg = t.encode();
        let pi = parse_interest(&imsg).unwrap();
        assert!(content_matches_interest(&msg, &pco, &imsg, &pi));

        let mut t2 = InterestTemplate::new(Name::from_uri("ccnx:/test").unwrap());
        t2.max_suffix = Some(1);
        let imsg2 = t2.encode();
        let pi2 = parse_interest(&imsg2).unwrap();
        // suffix is 2 (hello + digest), so the max of 1 rejects it
        assert!(!content_matches_interest(&msg, &pco, &imsg2, &pi2));

        let t3 = InterestTemplate::new(Name::from_uri("ccnx:/other").unwrap());
        let imsg3 = t3.encode();
        let pi3 = parse_interest(&imsg3).unwrap();
        assert!(!content_matches_interest(&msg, &pco, &imsg3, &pi3));
    }

    #[test]
    fn exclude_rejects_listed_and_ranged_components() {
        let msg = sample_object("ccnx:/test/hello", b"x", None);
        let pco = parse_content_object(&msg).unwrap();

        let mut t = InterestTemplate::new(Name::from_uri("ccnx:/test").unwrap());
        t.exclude = vec![ExcludeEntry::Component(b"hello".to_vec())];
        let imsg = t.encode();
        let pi = parse_interest(&imsg).unwrap();
        assert!(!content_matches_interest(&msg, &pco, &imsg, &pi));

        let mut t2 = InterestTemplate::new(Name::from_uri("ccnx:/test").unwrap());
        t2.exclude = vec![ExcludeEntry::Any, ExcludeEntry::Component(b"zzzz".to_vec())];
        let imsg2 = t2.encode();
        let pi2 = parse_interest(&imsg2).unwrap();
        // "hello" < "zzzz" with a leading Any, so it is excluded
        assert!(!content_matches_interest(&msg, &pco, &imsg2, &pi2));

        let mut t3 = InterestTemplate::new(Name::from_uri("ccnx:/test").unwrap());
        t3.exclude = vec![ExcludeEntry::Component(b"aaa".to_vec()), ExcludeEntry::Any];
        let imsg3 = t3.encode();
        let pi3 = parse_interest(&imsg3).unwrap();
        // trailing Any covers everything above "aaa"
        assert!(!content_matches_interest(&msg, &pco, &imsg3, &pi3));

        let mut t4 = InterestTemplate::new(Name::from_uri("ccnx:/test").unwrap());
        t4.exclude = vec![ExcludeEntry::Component(b"zzz".to_vec())];
        let imsg4 = t4.encode();
        let pi4 = parse_interest(&imsg4).unwrap();
        assert!(content_matches_interest(&msg, &pco, &imsg4, &pi4));
    }

    #[test]
    fn face_instance_round_trip() {
        let fi = FaceInstance {
            action: Some("newface".into()),
            ccnd_id: Some(vec![1; 32]),
            faceid: None,
            ipproto: Some(17),
            host: Some("10.0.0.1".into()),
            port: Some("9695".into()),
            mcast_interface: None,
            mcast_ttl: None,
            lifetime_seconds: Some(3600),
        };
        let wire = fi.encode();
        let back = FaceInstance::parse(&wire).unwrap();
        assert_eq!(fi, back);
    }

    #[test]
    fn forwarding_entry_round_trip() {
        let fe = ForwardingEntry {
            action: Some("prefixreg".into()),
            name: Some(Name::from_uri("ccnx:/x").unwrap()),
            ccnd_id: Some(vec![2; 32]),
            faceid: Some(7),
            flags: Some(3),
            lifetime_seconds: Some(2000),
        };
        let wire = fe.encode();
        let back = ForwardingEntry::parse(&wire).unwrap();
        assert_eq!(fe, back);
    }

    #[test]
    fn sequence_number_round_trip() {
        let wire = encode_sequence_number(0xABCDE);
        assert_eq!(parse_sequence_number(&wire).unwrap(), 0xABCDE);
        assert_eq!(classify(&wire), Some(MessageKind::SequenceNumber));
    }

    #[test]
    fn classify_interest_and_content() {
        let i = InterestTemplate::new(Name::from_uri("ccnx:/a").unwrap()).encode();
        assert_eq!(classify(&i), Some(MessageKind::Interest));
        let c = sample_object("ccnx:/a", b"", None);
        assert_eq!(classify(&c), Some(MessageKind::ContentObject));
    }
}

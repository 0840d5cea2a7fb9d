//! Faces and the face table.
//!
//! A face is one communication endpoint: a listener, a connected stream,
//! a datagram peer, a multicast group, or the internal pseudo-face.  The
//! faceid packs an 18-bit slot with a generation number, so a stale
//! faceid never resolves to a new occupant of the same slot.

use crate::sched::EventHandle;
use bytes::BytesMut;
use rust_ccnd_common::ccnb::SkeletonDecoder;
use rust_ccnd_common::meter::FaceMeters;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;

pub type FaceId = u32;
pub const NOFACEID: FaceId = u32::MAX;

pub const FACESLOTBITS: u32 = 18;
pub const MAXFACES: u32 = (1 << FACESLOTBITS) - 1;

/* face flags */
pub const FACE_LINK: u32 = 1 << 0; /* stream framed by CCNProtocolDataUnit */
pub const FACE_DGRAM: u32 = 1 << 1;
pub const FACE_GG: u32 = 1 << 2; /* considered friendly */
pub const FACE_LOCAL: u32 = 1 << 3; /* unix-domain socket */
pub const FACE_INET: u32 = 1 << 4;
pub const FACE_MCAST: u32 = 1 << 5;
pub const FACE_INET6: u32 = 1 << 6;
pub const FACE_DC: u32 = 1 << 7; /* direct control */
pub const FACE_NOSEND: u32 = 1 << 8;
pub const FACE_UNDECIDED: u32 = 1 << 9;
pub const FACE_PERMANENT: u32 = 1 << 10;
pub const FACE_CONNECTING: u32 = 1 << 11;
pub const FACE_LOOPBACK: u32 = 1 << 12;
pub const FACE_CLOSING: u32 = 1 << 13;
pub const FACE_PASSIVE: u32 = 1 << 14;
pub const FACE_NORECV: u32 = 1 << 15;
pub const FACE_REGOK: u32 = 1 << 16;
pub const FACE_SEQOK: u32 = 1 << 17;
pub const FACE_SEQPROBE: u32 = 1 << 18;
pub const FACE_LC: u32 = 1 << 19; /* link check sent recently */
pub const FACE_BC: u32 = 1 << 20; /* needs SO_BROADCAST */
pub const FACE_NBC: u32 = 1 << 21; /* SO_BROADCAST did not help */
pub const FACE_ADJ: u32 = 1 << 22; /* adjacency guid negotiated */

/* content queue delay classes */
pub const CQ_ASAP: u8 = 0;
pub const CQ_NORMAL: u8 = 1;
pub const CQ_SLOW: u8 = 2;
pub const CQ_N: usize = 3;

/// Sockets a face can own.  Datagram child faces and the internal face
/// own nothing; they borrow the parent's descriptor via `sendface`.
#[derive(Debug, Default)]
pub enum FaceIo {
    #[default]
    None,
    TcpListener(std::net::TcpListener),
    UnixListener(std::os::unix::net::UnixListener),
    TcpStream(std::net::TcpStream),
    UnixStream(std::os::unix::net::UnixStream),
    Udp(std::net::UdpSocket),
}

impl FaceIo {
    pub fn fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        match self {
            FaceIo::None => -1,
            FaceIo::TcpListener(s) => s.as_raw_fd(),
            FaceIo::UnixListener(s) => s.as_raw_fd(),
            FaceIo::TcpStream(s) => s.as_raw_fd(),
            FaceIo::UnixStream(s) => s.as_raw_fd(),
            FaceIo::Udp(s) => s.as_raw_fd(),
        }
    }
}

/// Outgoing content queue for one delay class.
#[derive(Debug)]
pub struct ContentQueue {
    pub burst_nsec: u32,
    pub min_usec: u32,
    pub rand_usec: u32,
    pub ready: usize,
    pub nrun: u32,
    pub send_queue: Vec<u64>,
    pub sender: Option<EventHandle>,
}

impl ContentQueue {
    pub fn new(min_usec: u32) -> Self {
        Self {
            burst_nsec: if min_usec <= 500 { 500 } else { 150_000 },
            min_usec,
            rand_usec: 2 * min_usec,
            ready: 0,
            nrun: 0,
            send_queue: Vec::new(),
            sender: None,
        }
    }

    pub fn contains(&self, accession: u64) -> bool {
        self.send_queue.contains(&accession)
    }
}

/// One of our active faces.
#[derive(Debug)]
pub struct Face {
    pub faceid: FaceId,
    pub flags: u32,
    pub io: FaceIo,
    pub recv_fd: RawFd,
    /// Faceid whose descriptor carries our sends (usually self).
    pub sendface: FaceId,
    pub addr: Option<SocketAddr>,
    pub inbuf: BytesMut,
    pub decoder: SkeletonDecoder,
    pub outbuf: Option<Vec<u8>>,
    pub outbuf_index: usize,
    pub pending_interests: i32,
    pub outstanding_interests: i32,
    pub recvcount: u32,
    pub surplus: u32,
    pub rrun: u32,
    pub rseq: u64,
    pub pktseq: u16,
    pub adjstate: u16,
    pub guid: Option<Vec<u8>>,
    pub guid_cob: Option<Vec<u8>>,
    pub meters: FaceMeters,
    pub faceattr_packed: u32,
    pub lfaceattrs: Vec<u32>,
    pub queues: [Option<ContentQueue>; CQ_N],
}

impl Face {
    pub fn new(io: FaceIo, flags: u32) -> Self {
        let recv_fd = io.fd();
        Self {
            faceid: NOFACEID,
            flags,
            io,
            recv_fd,
            sendface: NOFACEID,
            addr: None,
            inbuf: BytesMut::new(),
            decoder: SkeletonDecoder::new(),
            outbuf: None,
            outbuf_index: 0,
            pending_interests: 0,
            outstanding_interests: 0,
            recvcount: 0,
            surplus: 0,
            rrun: 0,
            rseq: 0,
            pktseq: 0,
            adjstate: 0,
            guid: None,
            guid_cob: None,
            meters: FaceMeters::new(),
            faceattr_packed: 0,
            lfaceattrs: Vec::new(),
            queues: [None, None, None],
        }
    }

    pub fn slot(&self) -> u32 {
        self.faceid & MAXFACES
    }

    /// Get a face attribute by registry index.
    pub fn attr_get(&self, index: usize) -> u32 {
        if index < 32 {
            (self.faceattr_packed >> index) & 1
        } else {
            self.lfaceattrs.get(index - 32).copied().unwrap_or(0)
        }
    }

    /// Set a face attribute by registry index.
    pub fn attr_set(&mut self, index: usize, value: u32) -> Result<(), ()> {
        if index < 32 {
            if value > 1 {
                return Err(());
            }
            if value != 0 {
                self.faceattr_packed |= 1 << index;
            } else {
                self.faceattr_packed &= !(1 << index);
            }
        } else {
            let i = index - 32;
            if self.lfaceattrs.len() <= i {
                self.lfaceattrs.resize(i + 1, 0);
            }
            self.lfaceattrs[i] = value;
        }
        Ok(())
    }

    /// True when this face may be offered content or interests.
    pub fn can_send(&self) -> bool {
        (self.flags & FACE_NOSEND) == 0
    }
}

/* ---------------------------------------------------------------- *
 * Face attribute registry
 * ---------------------------------------------------------------- */

/// Builtin single-bit attributes, refreshed on status changes.
pub const FAM_VALID: usize = 0;
pub const FAM_APP: usize = 1;
pub const FAM_BCAST: usize = 2;
pub const FAM_DC: usize = 3;

/// Maps attribute names to per-face storage indexes.  The first 32 are
/// single bits in the packed word; the rest are u32 cells.
#[derive(Debug)]
pub struct FaceAttrRegistry {
    by_name: HashMap<String, usize>,
    names: Vec<(String, usize)>,
    bits_used: usize,
    cells_used: usize,
}

impl FaceAttrRegistry {
    pub fn new() -> Self {
        let mut r = Self {
            by_name: HashMap::new(),
            names: Vec::new(),
            bits_used: 0,
            cells_used: 0,
        };
        assert_eq!(r.bool_index("valid"), Some(FAM_VALID));
        assert_eq!(r.bool_index("application"), Some(FAM_APP));
        assert_eq!(r.bool_index("broadcastcapable"), Some(FAM_BCAST));
        assert_eq!(r.bool_index("directcontrol"), Some(FAM_DC));
        r
    }

    /// Register (or look up) a single-bit attribute.
    pub fn bool_index(&mut self, name: &str) -> Option<usize> {
        if let Some(&i) = self.by_name.get(name) {
            return if i < 32 { Some(i) } else { None };
        }
        if self.bits_used >= 32 {
            return None;
        }
        let i = self.bits_used;
        self.bits_used += 1;
        self.by_name.insert(name.to_string(), i);
        self.names.push((name.to_string(), i));
        Some(i)
    }

    /// Register (or look up) an unsigned-cell attribute.
    pub fn cell_index(&mut self, name: &str) -> usize {
        if let Some(&i) = self.by_name.get(name) {
            return i;
        }
        let i = 32 + self.cells_used;
        self.cells_used += 1;
        self.by_name.insert(name.to_string(), i);
        self.names.push((name.to_string(), i));
        i
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = (&str, usize)> {
        self.names.iter().map(|(n, i)| (n.as_str(), *i))
    }
}

impl Default for FaceAttrRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/* ---------------------------------------------------------------- *
 * Face table
 * ---------------------------------------------------------------- */

/// The face table: slot array plus the secondary indexes.
#[derive(Debug)]
pub struct FaceTable {
    slots: Vec<Option<Face>>,
    /// Generation component of new faceids, always a multiple of
    /// MAXFACES + 1.
    gen: u32,
    rover: usize,
    pub by_fd: HashMap<RawFd, FaceId>,
    pub dgram_by_addr: HashMap<SocketAddr, FaceId>,
    pub by_guid: HashMap<Vec<u8>, FaceId>,
}

impl FaceTable {
    pub fn new() -> Self {
        // generation zero so the very first face gets faceid 0 (the
        // internal pseudo-face)
        Self {
            slots: Vec::new(),
            gen: 0,
            rover: 0,
            by_fd: HashMap::new(),
            dgram_by_addr: HashMap::new(),
            by_guid: HashMap::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Assign a faceid and place the face in the table.
    ///
    /// Returns None when the slot space is exhausted.
    pub fn enroll(&mut self, mut face: Face) -> Option<FaceId> {
        let n = self.slots.len();
        let mut slot = None;
        for i in self.rover..n {
            if self.slots[i].is_none() {
                slot = Some(i);
                break;
            }
        }
        if slot.is_none() {
            for i in 0..n {
                if self.slots[i].is_none() {
                    // wrapped: a full sweep completed, new generation
                    self.gen = self.gen.wrapping_add(MAXFACES + 1);
                    if self.gen == 0 {
                        self.gen = MAXFACES + 1;
                    }
                    slot = Some(i);
                    break;
                }
            }
        }
        let slot = match slot {
            Some(s) => s,
            None => {
                let grown = ((n + 1) * 3 / 2).min(MAXFACES as usize);
                if grown <= n {
                    return None;
                }
                self.slots.resize_with(grown, || None);
                n
            }
        };
        self.rover = slot + 1;
        face.faceid = slot as u32 | self.gen;
        let faceid = face.faceid;
        if face.recv_fd >= 0 {
            self.by_fd.insert(face.recv_fd, faceid);
        }
        self.slots[slot] = Some(face);
        Some(faceid)
    }

    pub fn get(&self, faceid: FaceId) -> Option<&Face> {
        if faceid == NOFACEID {
            return None;
        }
        let slot = (faceid & MAXFACES) as usize;
        match self.slots.get(slot) {
            Some(Some(f)) if f.faceid == faceid => Some(f),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, faceid: FaceId) -> Option<&mut Face> {
        if faceid == NOFACEID {
            return None;
        }
        let slot = (faceid & MAXFACES) as usize;
        match self.slots.get_mut(slot) {
            Some(Some(f)) if f.faceid == faceid => Some(f),
            _ => None,
        }
    }

    /// Remove the face from the table and all secondary indexes.
    ///
    /// An UNDECIDED stream face occupying the most recently allocated
    /// slot backs the rover up so its slot can be reissued immediately;
    /// such a face never carried CCN traffic.
    pub fn release(&mut self, faceid: FaceId) -> Option<Face> {
        let slot = (faceid & MAXFACES) as usize;
        match self.slots.get(slot) {
            Some(Some(f)) if f.faceid == faceid => {}
            _ => return None,
        }
        let face = self.slots[slot].take().expect("checked above");
        if face.recv_fd >= 0 {
            if let Some(&owner) = self.by_fd.get(&face.recv_fd) {
                if owner == faceid {
                    self.by_fd.remove(&face.recv_fd);
                }
            }
        }
        if let Some(addr) = &face.addr {
            if let Some(&owner) = self.dgram_by_addr.get(addr) {
                if owner == faceid {
                    self.dgram_by_addr.remove(addr);
                }
            }
        }
        if let Some(guid) = &face.guid {
            self.by_guid.remove(guid);
        }
        if (face.flags & FACE_UNDECIDED) != 0 && self.rover > 0 && slot == self.rover - 1 {
            self.rover -= 1;
        }
        Some(face)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Face> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Face> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    pub fn faceids(&self) -> Vec<FaceId> {
        self.iter().map(|f| f.faceid).collect()
    }

    pub fn by_fd(&self, fd: RawFd) -> Option<FaceId> {
        self.by_fd.get(&fd).copied()
    }
}

impl Default for FaceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Zero the fields of a peer address that must not take part in
/// datagram demultiplexing (IPv6 flow information).
pub fn scrub_sockaddr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => addr,
        SocketAddr::V6(v6) => SocketAddr::V6(std::net::SocketAddrV6::new(
            *v6.ip(),
            v6.port(),
            0,
            v6.scope_id(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_face() -> Face {
        Face::new(FaceIo::None, 0)
    }

    #[test]
    fn enroll_assigns_distinct_slots() {
        let mut t = FaceTable::new();
        let a = t.enroll(plain_face()).unwrap();
        let b = t.enroll(plain_face()).unwrap();
        assert_ne!(a, b);
        assert_eq!(t.get(a).unwrap().faceid, a);
        assert_eq!(t.get(b).unwrap().faceid, b);
        assert_eq!(t.count(), 2);
    }

    #[test]
    fn stale_faceid_does_not_resolve() {
        let mut t = FaceTable::new();
        let a = t.enroll(plain_face()).unwrap();
        t.release(a).unwrap();
        assert!(t.get(a).is_none());
    }

    #[test]
    fn undecided_tip_slot_recycles() {
        let mut t = FaceTable::new();
        let _a = t.enroll(plain_face()).unwrap();
        let b = t.enroll(Face::new(FaceIo::None, FACE_UNDECIDED)).unwrap();
        t.release(b).unwrap();
        let c = t.enroll(plain_face()).unwrap();
        // same slot, same generation: the slot was reissued directly
        assert_eq!(b & MAXFACES, c & MAXFACES);
        assert_eq!(b, c);
    }

    #[test]
    fn decided_faces_do_not_recycle_slots() {
        let mut t = FaceTable::new();
        let _a = t.enroll(plain_face()).unwrap();
        let b = t.enroll(plain_face()).unwrap();
        t.release(b).unwrap();
        let c = t.enroll(plain_face()).unwrap();
        // the slot is only reused after a wrap, with a new generation
        assert_ne!(b, c);
    }

    #[test]
    fn recycling_only_applies_to_the_tip() {
        let mut t = FaceTable::new();
        let a = t.enroll(Face::new(FaceIo::None, FACE_UNDECIDED)).unwrap();
        let b = t.enroll(Face::new(FaceIo::None, FACE_UNDECIDED)).unwrap();
        // releasing the older undecided face does not move the rover
        t.release(a).unwrap();
        // releasing the tip does
        t.release(b).unwrap();
        let c = t.enroll(plain_face()).unwrap();
        assert_eq!(c, b);
        // a's slot is not reissued without a wrap
        let d = t.enroll(plain_face()).unwrap();
        assert_ne!(d & MAXFACES, a & MAXFACES);
    }

    #[test]
    fn generation_changes_after_full_sweep() {
        let mut t = FaceTable::new();
        let a = t.enroll(plain_face()).unwrap();
        let _b = t.enroll(plain_face()).unwrap();
        let _c = t.enroll(plain_face()).unwrap();
        t.release(a).unwrap();
        // the rover is past slot 0, so reissuing it takes a wrap that
        // bumps the generation
        let d = t.enroll(plain_face()).unwrap();
        assert_eq!(d & MAXFACES, a & MAXFACES);
        assert_ne!(d, a);
    }

    #[test]
    fn attrs_pack_bits_and_cells() {
        let mut reg = FaceAttrRegistry::new();
        let slow = reg.bool_index("slow").unwrap();
        let big = reg.cell_index("rtt");
        let mut f = plain_face();
        f.attr_set(slow, 1).unwrap();
        f.attr_set(big, 12345).unwrap();
        assert_eq!(f.attr_get(slow), 1);
        assert_eq!(f.attr_get(big), 12345);
        assert!(f.attr_set(slow, 2).is_err());
        f.attr_set(slow, 0).unwrap();
        assert_eq!(f.attr_get(slow), 0);
    }

    #[test]
    fn scrub_zeroes_v6_flowinfo() {
        let a: SocketAddr = "[fe80::1]:9695".parse().unwrap();
        if let SocketAddr::V6(v6) = a {
            let with_flow =
                SocketAddr::V6(std::net::SocketAddrV6::new(*v6.ip(), v6.port(), 77, 0));
            assert_eq!(scrub_sockaddr(with_flow), a);
        }
    }
}

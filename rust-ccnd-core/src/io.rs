//! Socket plumbing and the main loop.
//!
//! Everything readiness-driven lives here: listeners, accept, datagram
//! demultiplexing, the send path with deferred output, and the poll loop
//! itself.  Socket options std does not expose go through libc.

use crate::config::DBG_FACES;
use crate::daemon::Daemon;
use crate::error::StartupError;
use crate::face::{
    scrub_sockaddr, Face, FaceId, FaceIo, FACE_CLOSING, FACE_CONNECTING, FACE_DGRAM, FACE_GG,
    FACE_INET, FACE_INET6, FACE_LOCAL, FACE_LOOPBACK, FACE_MCAST, FACE_NOSEND, FACE_NORECV,
    FACE_PASSIVE, FACE_PERMANENT, FACE_UNDECIDED, NOFACEID,
};
use crate::keystore::{default_directory, Keystore};
use crate::sched::Action;
use log::{debug, error, info, warn};
use polling::{Event, Events, PollMode, Poller};
use rust_ccnd_common::meter::FaceMeter;
use std::collections::HashSet;
use std::io;
use std::mem::MaybeUninit;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{BorrowedFd, FromRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

static STOP: AtomicBool = AtomicBool::new(false);
static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_fatal_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
    let fd = SIGNAL_PIPE_WR.load(Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Owns the unix-domain socket path; dropping it unlinks the socket.
#[derive(Debug)]
pub struct CleanupGuard {
    path: PathBuf,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Poller bookkeeping and odds and ends the daemon core does not need
/// to know about.
pub struct IoState {
    poller: Option<Poller>,
    level_mode: bool,
    registered: HashSet<RawFd>,
    writable_armed: HashSet<RawFd>,
    comm_file: Option<PathBuf>,
    unlink_guard: Option<CleanupGuard>,
    signal_pipe_rd: RawFd,
    /// Messages for the internal client queued while it was busy.
    pub(crate) face0_backlog: Vec<Vec<u8>>,
}

impl IoState {
    pub fn new() -> Self {
        Self {
            poller: None,
            level_mode: false,
            registered: HashSet::new(),
            writable_armed: HashSet::new(),
            comm_file: None,
            unlink_guard: None,
            signal_pipe_rd: -1,
            face0_backlog: Vec::new(),
        }
    }

    pub(crate) fn watch_fd(&mut self, fd: RawFd) {
        let Some(poller) = &self.poller else { return };
        if fd < 0 || self.registered.contains(&fd) {
            return;
        }
        let mode = if self.level_mode {
            PollMode::Level
        } else {
            PollMode::Oneshot
        };
        // fds are removed from the poller before their sockets close
        unsafe {
            if poller.add_with_mode(fd, Event::readable(fd as usize), mode).is_ok() {
                self.registered.insert(fd);
            }
        }
    }

    pub(crate) fn forget_fd(&mut self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        if self.registered.remove(&fd) {
            if let Some(poller) = &self.poller {
                let _ = poller.delete(unsafe { BorrowedFd::borrow_raw(fd) });
            }
        }
        self.writable_armed.remove(&fd);
    }

    fn rearm(&mut self, fd: RawFd, want_write: bool) {
        let Some(poller) = &self.poller else { return };
        if !self.registered.contains(&fd) {
            return;
        }
        let ev = if want_write {
            Event::all(fd as usize)
        } else {
            Event::readable(fd as usize)
        };
        let mode = if self.level_mode {
            PollMode::Level
        } else {
            PollMode::Oneshot
        };
        let _ = poller.modify_with_mode(unsafe { BorrowedFd::borrow_raw(fd) }, ev, mode);
        if want_write {
            self.writable_armed.insert(fd);
        } else {
            self.writable_armed.remove(&fd);
        }
    }

    /// Stop when the operator removed our unix-domain socket.
    pub(crate) fn check_comm_file(&mut self, running: &mut bool) {
        if let Some(p) = &self.comm_file {
            if !p.exists() {
                info!("stopping ({} gone)", p.display());
                self.comm_file = None;
                // the file is already gone; nothing left to unlink
                if let Some(g) = self.unlink_guard.take() {
                    std::mem::forget(g);
                }
                *running = false;
            }
        }
    }
}

impl Default for IoState {
    fn default() -> Self {
        Self::new()
    }
}

/// Set SO_LINGER zero and let the socket close on drop.
pub(crate) fn close_face_io(face: Face) {
    let fd = face.io.fd();
    if fd >= 0 {
        let linger = libc::linger {
            l_onoff: 0,
            l_linger: 0,
        };
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            );
        }
    }
    drop(face);
}

fn set_v6only(fd: RawFd) {
    let yes: libc::c_int = 1;
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            &yes as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res == -1 {
        warn!("could not set IPV6_V6ONLY on fd {}", fd);
    }
}

fn set_broadcast(fd: RawFd, on: bool) {
    let v: libc::c_int = on as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BROADCAST,
            &v as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        );
    }
    err
}

fn sockaddr_from_raw(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    unsafe {
        match storage.ss_family as libc::c_int {
            libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
                let sin = &*(storage as *const _ as *const libc::sockaddr_in);
                let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Some(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
                let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
                let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(SocketAddr::V6(std::net::SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    0,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

fn raw_from_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

impl Daemon {
    /// Full startup: keystore, internal client, signal handling,
    /// listeners, pollers.
    pub fn start(&mut self) -> Result<(), StartupError> {
        let dir = self
            .cfg
            .keystore_directory
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(default_directory);
        let port = self.cfg.port.clone();
        let keystore =
            Keystore::open(&dir, &port, &mut self.rng).map_err(StartupError::Keystore)?;
        self.start_internal(keystore);

        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        let mut pipefds = [0 as RawFd; 2];
        let res = unsafe { libc::pipe(pipefds.as_mut_ptr()) };
        if res == 0 {
            for fd in pipefds {
                unsafe {
                    let fl = libc::fcntl(fd, libc::F_GETFL);
                    libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK);
                }
            }
            SIGNAL_PIPE_WR.store(pipefds[1], Ordering::SeqCst);
            self.io.signal_pipe_rd = pipefds[0];
            unsafe {
                libc::signal(libc::SIGTERM, on_fatal_signal as libc::sighandler_t);
                libc::signal(libc::SIGINT, on_fatal_signal as libc::sighandler_t);
                libc::signal(libc::SIGHUP, on_fatal_signal as libc::sighandler_t);
            }
        }

        let poller = Poller::new()?;
        self.io.level_mode = poller.supports_level();
        self.io.poller = Some(poller);

        self.create_local_listener().map_err(StartupError::Bind)?;
        self.create_inet_listeners().map_err(StartupError::Bind)?;

        for fid in self.faces.faceids() {
            let fd = self.faces.get(fid).map(|f| f.recv_fd).unwrap_or(-1);
            self.io.watch_fd(fd);
        }
        let sig_rd = self.io.signal_pipe_rd;
        if sig_rd >= 0 {
            self.io.watch_fd(sig_rd);
        }
        self.schedule(1_000_000, Action::InternalClientDrain, 1);
        Ok(())
    }

    /// The unix-domain listener, guarded against a live instance.
    fn create_local_listener(&mut self) -> io::Result<()> {
        let path = self.cfg.local_sockname();
        let p = PathBuf::from(&path);
        if p.exists() {
            if std::os::unix::net::UnixStream::connect(&p).is_ok() {
                error!("{} is in use by another daemon", path);
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} busy", path),
                ));
            }
            let _ = std::fs::remove_file(&p);
        }
        let listener = UnixListener::bind(&p)?;
        listener.set_nonblocking(true)?;
        // clients of any uid may connect; real authorization is GG-based
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o666));
        let face = Face::new(FaceIo::UnixListener(listener), FACE_PASSIVE | FACE_LOCAL);
        self.faces
            .enroll(face)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "face table full"))?;
        self.io.comm_file = Some(p.clone());
        self.io.unlink_guard = Some(CleanupGuard { path: p });
        info!("listening on {}", path);
        Ok(())
    }

    /// TCP and UDP listeners per CCND_LISTEN_ON (default wildcards).
    fn create_inet_listeners(&mut self) -> io::Result<()> {
        let port: u16 = self
            .cfg
            .port
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad port"))?;
        let spec = self.cfg.listen_on.clone();
        let addrs: Vec<String> = match spec {
            None => vec!["0.0.0.0".into(), "::".into()],
            Some(s) => crate::config::parse_uri_list(&s)
                .into_iter()
                .flat_map(|a| {
                    if a == "*" {
                        vec!["0.0.0.0".to_string(), "::".to_string()]
                    } else {
                        vec![a]
                    }
                })
                .collect(),
        };
        let mut bound_any = false;
        for a in addrs {
            let ip: std::net::IpAddr = match a.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    warn!("cannot parse listen address {:?}", a);
                    continue;
                }
            };
            let sa = SocketAddr::from((ip, port));
            match self.bind_tcp_with_retry(sa) {
                Ok(l) => {
                    let fam = if sa.is_ipv6() { FACE_INET6 } else { FACE_INET };
                    if sa.is_ipv6() {
                        set_v6only(std::os::fd::AsRawFd::as_raw_fd(&l));
                    }
                    l.set_nonblocking(true)?;
                    let face = Face::new(FaceIo::TcpListener(l), FACE_PASSIVE | fam);
                    self.faces.enroll(face);
                    bound_any = true;
                }
                Err(e) => warn!("tcp bind {} failed: {}", sa, e),
            }
            match UdpSocket::bind(sa) {
                Ok(s) => {
                    let fam = if sa.is_ipv6() { FACE_INET6 } else { FACE_INET };
                    if sa.is_ipv6() {
                        set_v6only(std::os::fd::AsRawFd::as_raw_fd(&s));
                    }
                    s.set_nonblocking(true)?;
                    let face = Face::new(FaceIo::Udp(s), FACE_PASSIVE | FACE_DGRAM | fam);
                    if let Some(fid) = self.faces.enroll(face) {
                        if sa.is_ipv6() {
                            self.ipv6_faceid = fid;
                        } else {
                            self.ipv4_faceid = fid;
                        }
                        bound_any = true;
                    }
                }
                Err(e) => warn!("udp bind {} failed: {}", sa, e),
            }
        }
        if !bound_any {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no listeners could be bound",
            ));
        }
        Ok(())
    }

    /// A busy port may be a daemon on its way out; retry for a while.
    fn bind_tcp_with_retry(&mut self, sa: SocketAddr) -> io::Result<TcpListener> {
        for attempt in 0..120 {
            match TcpListener::bind(sa) {
                Ok(l) => return Ok(l),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < 119 => {
                    if attempt == 0 {
                        warn!("tcp bind {}: address in use, retrying", sa);
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!()
    }

    /// Run the main loop of the daemon.
    pub fn run(&mut self) {
        self.running = true;
        let mut events = Events::new();
        let mut prev_timeout_zero = false;
        while self.running {
            self.process_internal_client_buffer();
            let next_us = self.run_due();
            self.process_internal_client_buffer();
            if STOP.load(Ordering::SeqCst) {
                self.running = false;
                break;
            }
            self.prepare_write_interest();
            let timeout = match next_us {
                None => None,
                Some(us) => {
                    let mut ms = (us + 960) / 1000;
                    if ms == 0 && prev_timeout_zero {
                        ms = 1;
                    }
                    prev_timeout_zero = ms == 0;
                    Some(Duration::from_millis(ms))
                }
            };
            events.clear();
            let res = {
                let poller = self.io.poller.as_ref().expect("started");
                poller.wait(&mut events, timeout)
            };
            if let Err(e) = res {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("poll: {}", e);
                    std::thread::sleep(Duration::from_secs(1));
                }
                continue;
            }
            /* fresh time for expiry decisions */
            self.clock.update();
            if STOP.load(Ordering::SeqCst) {
                self.running = false;
                break;
            }
            let mut ready: Vec<(RawFd, bool, bool)> = events
                .iter()
                .map(|ev| (ev.key as RawFd, ev.readable, ev.writable))
                .collect();
            /* multicast receivers first, so shared packets are counted
             * against the multicast face */
            ready.sort_by_key(|&(fd, _, _)| {
                let mcast = self
                    .faces
                    .by_fd(fd)
                    .and_then(|id| self.faces.get(id))
                    .map(|f| (f.flags & FACE_MCAST) != 0)
                    .unwrap_or(false);
                !mcast
            });
            for (fd, readable, writable) in ready {
                if fd == self.io.signal_pipe_rd {
                    let mut buf = [0u8; 16];
                    unsafe {
                        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
                    }
                    if STOP.load(Ordering::SeqCst) {
                        self.running = false;
                    }
                    if !self.io.level_mode {
                        self.io.rearm(fd, false);
                    }
                    continue;
                }
                if writable {
                    self.do_deferred_write(fd);
                }
                if readable {
                    self.process_input(fd);
                }
                if !self.io.level_mode && self.faces.by_fd(fd).is_some() {
                    let want_write = self
                        .faces
                        .by_fd(fd)
                        .and_then(|id| self.faces.get(id))
                        .map(|f| f.outbuf.is_some() || (f.flags & FACE_CLOSING) != 0)
                        .unwrap_or(false);
                    self.io.rearm(fd, want_write);
                }
            }
        }
        info!("exiting");
    }

    /// Ask for writability on faces with deferred output.
    fn prepare_write_interest(&mut self) {
        let mut wants: Vec<(RawFd, bool)> = Vec::new();
        for face in self.faces.iter() {
            if face.recv_fd < 0 {
                continue;
            }
            let want = face.outbuf.is_some() || (face.flags & FACE_CLOSING) != 0;
            let armed = self.io.writable_armed.contains(&face.recv_fd);
            if want != armed {
                wants.push((face.recv_fd, want));
            }
        }
        for (fd, want) in wants {
            self.io.rearm(fd, want);
        }
    }

    /* ------------------------------------------------------------ *
     * Input
     * ------------------------------------------------------------ */

    /// Process input from a ready descriptor.
    pub(crate) fn process_input(&mut self, fd: RawFd) {
        let Some(faceid) = self.faces.by_fd(fd) else {
            return;
        };
        let flags = self.faces.get(faceid).map(|f| f.flags).unwrap_or(0);
        if (flags & (FACE_DGRAM | FACE_PASSIVE)) == FACE_PASSIVE {
            self.accept_connection(fd);
            self.io.check_comm_file(&mut self.running);
            return;
        }
        let err = socket_error(fd);
        if err != 0 {
            info!("error on face {}: errno {}", faceid, err);
            if err == libc::ETIMEDOUT && (flags & FACE_CONNECTING) != 0 {
                self.shutdown_client_fd(fd);
                return;
            }
        }
        let mut buf = [0u8; 8800];
        let mut storage: libc::sockaddr_storage = unsafe { MaybeUninit::zeroed().assume_init() };
        let mut addrlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let res = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addrlen,
            )
        };
        if res == -1 {
            let errno = io::Error::last_os_error();
            if errno.kind() != io::ErrorKind::WouldBlock {
                info!("recvfrom face {}: {}", faceid, errno);
            }
            return;
        }
        if res == 0 && (flags & FACE_DGRAM) == 0 {
            self.shutdown_client_fd(fd);
            return;
        }
        let res = res as usize;
        let source = if (flags & FACE_DGRAM) != 0 && (flags & FACE_MCAST) == 0 {
            match sockaddr_from_raw(&storage, addrlen)
                .and_then(|sa| self.get_dgram_source(faceid, sa, res == 1))
            {
                Some(s) => s,
                None => return,
            }
        } else {
            faceid
        };
        let sec = self.clock.sec;
        if let Some(f) = self.faces.get_mut(source) {
            f.meters.bump(FaceMeter::BytesIn, sec, res as u64);
            f.recvcount += 1;
            f.surplus = 0;
        }
        if res <= 1 && (flags & FACE_DGRAM) != 0 {
            if self.debugging(DBG_FACES) {
                debug!("{}-byte heartbeat on face {}", res, source);
            }
            return;
        }
        let pdu_ok = (flags & FACE_LOCAL) != 0;
        // the receiving face owns the stream buffer; the source face
        // gets the protocol attribution
        {
            let Some(face) = self.faces.get_mut(faceid) else { return };
            if face.inbuf.is_empty() {
                face.decoder.reset();
            }
            face.inbuf.extend_from_slice(&buf[..res]);
        }
        let undecided_http = {
            let face = self.faces.get(faceid).expect("still here");
            (face.flags & FACE_UNDECIDED) != 0
                && face.inbuf.len() >= 6
                && face.inbuf.starts_with(b"GET ")
        };
        if undecided_http {
            crate::stats::handle_http_connection(self, faceid);
            return;
        }
        loop {
            let msg = {
                let Some(face) = self.faces.get_mut(faceid) else { return };
                let start = face.decoder.index;
                if start >= face.inbuf.len() {
                    break;
                }
                let window = face.inbuf[start..].to_vec();
                let n = face.decoder.decode(&window);
                if face.decoder.state() != 0 || n == 0 {
                    break;
                }
                /* a message always starts at the head of the buffer;
                 * completed messages are carved off immediately */
                let end = face.decoder.index;
                let msg = face.inbuf[..end].to_vec();
                let keep = face.inbuf.split_off(end);
                face.inbuf = keep;
                face.decoder.reset();
                msg
            };
            self.process_input_message(source, &msg, pdu_ok);
            if self.faces.get(faceid).is_none() {
                return;
            }
        }
        /* partial or broken message left in the buffer */
        let state = self
            .faces
            .get(faceid)
            .map(|f| f.decoder.state())
            .unwrap_or(0);
        if state < 0 {
            if (flags & FACE_DGRAM) != 0 {
                info!("protocol error on face {}, discarding datagram", source);
                if let Some(face) = self.faces.get_mut(faceid) {
                    face.inbuf.clear();
                    face.decoder.reset();
                }
            } else {
                info!("protocol error on face {}", source);
                self.shutdown_client_fd(fd);
            }
        } else if (flags & FACE_DGRAM) != 0 {
            // datagrams do not continue across packets
            if let Some(face) = self.faces.get_mut(faceid) {
                if face.decoder.state() != 0 {
                    info!("truncated datagram on face {}, discarding", source);
                }
                face.inbuf.clear();
                face.decoder.reset();
            }
        }
    }

    /// Accept a stream connection; the face starts out undecided.
    fn accept_connection(&mut self, listener_fd: RawFd) {
        let Some(lid) = self.faces.by_fd(listener_fd) else { return };
        let lflags = self.faces.get(lid).map(|f| f.flags).unwrap_or(0);
        let mut storage: libc::sockaddr_storage = unsafe { MaybeUninit::zeroed().assume_init() };
        let mut addrlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                listener_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addrlen,
            )
        };
        if fd < 0 {
            return;
        }
        unsafe {
            let fl = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK);
        }
        let (io, mut flags, addr) = if (lflags & FACE_LOCAL) != 0 {
            let s = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
            (
                FaceIo::UnixStream(s),
                FACE_UNDECIDED | FACE_LOCAL | FACE_LOOPBACK,
                None,
            )
        } else {
            let s = unsafe { std::net::TcpStream::from_raw_fd(fd) };
            let addr = sockaddr_from_raw(&storage, addrlen);
            let mut flags = FACE_UNDECIDED;
            match addr {
                Some(SocketAddr::V4(a)) => {
                    flags |= FACE_INET;
                    if a.ip().is_loopback() {
                        flags |= FACE_LOOPBACK;
                    }
                }
                Some(SocketAddr::V6(a)) => {
                    flags |= FACE_INET6;
                    if a.ip().is_loopback() {
                        flags |= FACE_LOOPBACK;
                    }
                }
                None => {}
            }
            (FaceIo::TcpStream(s), flags, addr)
        };
        if (flags & FACE_LOOPBACK) == 0 && (lflags & FACE_LOCAL) != 0 {
            flags |= FACE_LOOPBACK;
        }
        let mut face = Face::new(io, flags);
        face.addr = addr;
        match self.faces.enroll(face) {
            Some(fid) => {
                let f = self.faces.get_mut(fid).expect("just enrolled");
                f.sendface = fid;
                self.io.watch_fd(fd);
                info!("accepted connection client fd {} id {}", fd, fid);
            }
            None => {
                warn!("accept: face table full, dropping fd {}", fd);
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }

    /// Get (or create) the child face for a datagram source address.
    pub(crate) fn get_dgram_source(
        &mut self,
        parent: FaceId,
        addr: SocketAddr,
        heartbeat: bool,
    ) -> Option<FaceId> {
        let key = scrub_sockaddr(addr);
        if let Some(&fid) = self.faces.dgram_by_addr.get(&key) {
            return Some(fid);
        }
        let parent_fd = self.faces.get(parent)?.recv_fd;
        let fam = match key {
            SocketAddr::V4(_) => FACE_INET,
            SocketAddr::V6(_) => FACE_INET6,
        };
        let mut flags = FACE_DGRAM | fam;
        let loopback = match key {
            SocketAddr::V4(a) => a.ip().is_loopback(),
            SocketAddr::V6(a) => a.ip().is_loopback(),
        };
        if loopback {
            flags |= FACE_LOOPBACK;
            if heartbeat {
                flags |= FACE_GG;
            }
        }
        let mut face = Face::new(FaceIo::None, flags);
        face.addr = Some(key);
        let fid = self.faces.enroll(face)?;
        {
            let f = self.faces.get_mut(fid).expect("just enrolled");
            f.recv_fd = parent_fd;
            f.sendface = parent;
        }
        self.faces.dgram_by_addr.insert(key, fid);
        info!("accepted datagram client id={} {}", fid, key);
        self.register_new_face(fid);
        Some(fid)
    }

    /* ------------------------------------------------------------ *
     * Output
     * ------------------------------------------------------------ */

    /// Which descriptor carries sends for this face.
    fn sending_fd(&mut self, faceid: FaceId) -> RawFd {
        let Some(face) = self.faces.get(faceid) else { return -1 };
        if face.sendface == faceid {
            return face.recv_fd;
        }
        if let Some(out) = self.faces.get(face.sendface) {
            return out.recv_fd;
        }
        let wildcard = match face.addr {
            Some(SocketAddr::V4(_)) => self.ipv4_faceid,
            Some(SocketAddr::V6(_)) => self.ipv6_faceid,
            None => NOFACEID,
        };
        if let Some(f) = self.faces.get_mut(faceid) {
            f.sendface = wildcard;
        }
        self.faces.get(wildcard).map(|f| f.recv_fd).unwrap_or(-1)
    }

    /// Send bytes on a face; buffers on EAGAIN, poisons on EPIPE.
    pub(crate) fn send(&mut self, faceid: FaceId, data: &[u8]) {
        let Some(face) = self.faces.get_mut(faceid) else { return };
        if !face.can_send() {
            return;
        }
        face.surplus += 1;
        if face.outbuf.is_some() {
            face.outbuf.as_mut().expect("checked").extend_from_slice(data);
            return;
        }
        let sec = self.clock.sec;
        if faceid == self.face0 {
            face.meters.bump(FaceMeter::BytesOut, sec, data.len() as u64);
            let data = data.to_vec();
            self.deliver_to_internal(&data);
            return;
        }
        let flags = face.flags;
        let addr = face.addr;
        let recv_fd = face.recv_fd;
        let res = if (flags & FACE_DGRAM) == 0 {
            unsafe {
                libc::send(
                    recv_fd,
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    0,
                )
            }
        } else {
            let fd = self.sending_fd(faceid);
            if fd < 0 {
                return;
            }
            let Some(addr) = addr else { return };
            let (storage, slen) = raw_from_sockaddr(&addr);
            let mut tried_bcast = false;
            if (flags & FACE_MCAST) == 0 && (flags & crate::face::FACE_BC) != 0 {
                set_broadcast(fd, true);
                tried_bcast = true;
            }
            let mut res = unsafe {
                libc::sendto(
                    fd,
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    0,
                    &storage as *const _ as *const libc::sockaddr,
                    slen,
                )
            };
            if res == -1
                && io::Error::last_os_error().raw_os_error() == Some(libc::EACCES)
                && (flags & (crate::face::FACE_BC | crate::face::FACE_NBC)) == 0
            {
                set_broadcast(fd, true);
                tried_bcast = true;
                res = unsafe {
                    libc::sendto(
                        fd,
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                        0,
                        &storage as *const _ as *const libc::sockaddr,
                        slen,
                    )
                };
                if let Some(f) = self.faces.get_mut(faceid) {
                    if res == -1 {
                        f.flags |= crate::face::FACE_NBC;
                    } else {
                        f.flags |= crate::face::FACE_BC;
                    }
                }
            }
            if tried_bcast {
                set_broadcast(fd, false);
            }
            res
        };
        if res > 0 {
            if let Some(f) = self.faces.get_mut(faceid) {
                f.meters.bump(FaceMeter::BytesOut, sec, res as u64);
            }
        }
        if res == data.len() as isize {
            return;
        }
        if res == -1 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => { /* defer below */ }
                Some(libc::EPIPE) => {
                    if let Some(f) = self.faces.get_mut(faceid) {
                        f.flags |= FACE_NOSEND;
                        f.outbuf = None;
                        f.outbuf_index = 0;
                    }
                    return;
                }
                _ => {
                    info!("send to face {} failed: {}", faceid, err);
                    return;
                }
            }
        }
        if (flags & FACE_DGRAM) != 0 {
            info!("sendto short on face {}", faceid);
            return;
        }
        let sent = if res > 0 { res as usize } else { 0 };
        if let Some(f) = self.faces.get_mut(faceid) {
            f.outbuf_index = 0;
            f.outbuf = Some(data[sent..].to_vec());
        }
    }

    /// Feed bytes to the internal client (face 0's "socket").
    fn deliver_to_internal(&mut self, data: &[u8]) {
        if self.internal.is_some() {
            let bytes = data.to_vec();
            self.with_internal(|d, ic| ic.dispatch(d, &bytes));
            self.schedule(0, Action::InternalClientDrain, 0);
        } else {
            /* the client is on the stack above us; queue for later */
            self.io.face0_backlog.push(data.to_vec());
            self.schedule(0, Action::InternalClientDrain, 0);
        }
    }

    /// Drain any backlog destined for the internal client.
    pub(crate) fn drain_face0_backlog(&mut self) {
        while let Some(msg) = {
            if self.io.face0_backlog.is_empty() {
                None
            } else {
                Some(self.io.face0_backlog.remove(0))
            }
        } {
            self.with_internal(|d, ic| ic.dispatch(d, &msg));
        }
    }

    /// Retry deferred output on a writable stream.
    pub(crate) fn do_deferred_write(&mut self, fd: RawFd) {
        let Some(faceid) = self.faces.by_fd(fd) else { return };
        let (pending, flags) = {
            let Some(face) = self.faces.get(faceid) else { return };
            let pending = face
                .outbuf
                .as_ref()
                .map(|b| b[face.outbuf_index..].to_vec());
            (pending, face.flags)
        };
        if let Some(chunk) = pending {
            if !chunk.is_empty() {
                let res = unsafe {
                    libc::send(fd, chunk.as_ptr() as *const libc::c_void, chunk.len(), 0)
                };
                if res == -1 {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EPIPE) => {
                            if let Some(f) = self.faces.get_mut(faceid) {
                                f.flags |= FACE_NOSEND;
                                f.outbuf = None;
                                f.outbuf_index = 0;
                            }
                        }
                        Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                        _ => {
                            info!("send: {}", err);
                            self.shutdown_client_fd(fd);
                        }
                    }
                    return;
                }
                let res = res as usize;
                if res == chunk.len() {
                    if let Some(f) = self.faces.get_mut(faceid) {
                        f.outbuf = None;
                        f.outbuf_index = 0;
                    }
                    if (flags & FACE_CLOSING) != 0 {
                        self.shutdown_client_fd(fd);
                    }
                } else if let Some(f) = self.faces.get_mut(faceid) {
                    f.outbuf_index += res;
                }
                return;
            }
            if let Some(f) = self.faces.get_mut(faceid) {
                f.outbuf = None;
                f.outbuf_index = 0;
            }
        }
        if (flags & FACE_CLOSING) != 0 {
            self.shutdown_client_fd(fd);
        } else if (flags & FACE_CONNECTING) != 0 {
            if let Some(f) = self.faces.get_mut(faceid) {
                f.flags &= !FACE_CONNECTING;
            }
            self.face_status_change(faceid);
        } else {
            debug!("do_deferred_write: something fishy on fd {}", fd);
        }
    }

    /// Tear down the face owning a stream descriptor.
    pub(crate) fn shutdown_client_fd(&mut self, fd: RawFd) {
        if let Some(faceid) = self.faces.by_fd(fd) {
            self.destroy_face(faceid);
        }
    }

    /* ------------------------------------------------------------ *
     * Face creation for the control plane
     * ------------------------------------------------------------ */

    /// Create (or find) a permanent datagram peer face.
    pub(crate) fn make_dgram_face(&mut self, addr: SocketAddr) -> Option<FaceId> {
        let parent = match addr {
            SocketAddr::V4(_) => self.ipv4_faceid,
            SocketAddr::V6(_) => self.ipv6_faceid,
        };
        if self.faces.get(parent).is_none() {
            return None;
        }
        let fid = self.get_dgram_source(parent, addr, false)?;
        if let Some(f) = self.faces.get_mut(fid) {
            f.flags |= FACE_PERMANENT;
        }
        Some(fid)
    }

    /// Create a multicast face bound to the group address.
    pub(crate) fn make_mcast_face(
        &mut self,
        group: SocketAddr,
        interface: Option<&str>,
        ttl: Option<u32>,
    ) -> Option<FaceId> {
        let sock = match group {
            SocketAddr::V4(g) => {
                let bind = SocketAddr::from(([0, 0, 0, 0], g.port()));
                let s = UdpSocket::bind(bind).ok()?;
                let ifaddr: std::net::Ipv4Addr = interface
                    .and_then(|i| i.parse().ok())
                    .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
                s.join_multicast_v4(g.ip(), &ifaddr).ok()?;
                if let Some(t) = ttl {
                    let _ = s.set_multicast_ttl_v4(t);
                }
                s
            }
            SocketAddr::V6(g) => {
                let bind = SocketAddr::from(([0u16; 8], g.port()));
                let s = UdpSocket::bind(bind).ok()?;
                s.join_multicast_v6(g.ip(), g.scope_id()).ok()?;
                s
            }
        };
        sock.set_nonblocking(true).ok()?;
        let fam = if group.is_ipv6() { FACE_INET6 } else { FACE_INET };
        let mut face = Face::new(
            FaceIo::Udp(sock),
            FACE_DGRAM | FACE_MCAST | FACE_PERMANENT | fam,
        );
        face.addr = Some(group);
        let fid = self.faces.enroll(face)?;
        if let Some(f) = self.faces.get_mut(fid) {
            f.sendface = fid;
        }
        let fd = self.faces.get(fid).map(|f| f.recv_fd).unwrap_or(-1);
        self.io.watch_fd(fd);
        self.register_new_face(fid);
        Some(fid)
    }

    /// Connect a TCP peer face (completes asynchronously).
    pub(crate) fn make_stream_face(&mut self, addr: SocketAddr) -> Option<FaceId> {
        let stream = std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(500)).ok()?;
        stream.set_nonblocking(true).ok()?;
        let fam = if addr.is_ipv6() { FACE_INET6 } else { FACE_INET };
        let mut face = Face::new(FaceIo::TcpStream(stream), fam | FACE_PERMANENT);
        face.addr = Some(addr);
        let fid = self.faces.enroll(face)?;
        if let Some(f) = self.faces.get_mut(fid) {
            f.sendface = fid;
        }
        let fd = self.faces.get(fid).map(|f| f.recv_fd).unwrap_or(-1);
        self.io.watch_fd(fd);
        self.register_new_face(fid);
        Some(fid)
    }

    /// Arrange for an HTTP response to be flushed and the face closed.
    pub(crate) fn finish_http_response(&mut self, faceid: FaceId, response: Vec<u8>) {
        let Some(face) = self.faces.get_mut(faceid) else { return };
        face.flags &= !FACE_UNDECIDED;
        face.flags |= FACE_NORECV;
        let fd = face.recv_fd;
        if fd >= 0 {
            let linger = libc::linger {
                l_onoff: 1,
                l_linger: 1,
            };
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &linger as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::linger>() as libc::socklen_t,
                );
            }
        }
        face.inbuf.clear();
        self.send(faceid, &response);
        let drained = self
            .faces
            .get(faceid)
            .map(|f| f.outbuf.is_none())
            .unwrap_or(false);
        if drained {
            self.destroy_face(faceid);
        } else if let Some(f) = self.faces.get_mut(faceid) {
            f.flags |= FACE_CLOSING;
        }
    }
}

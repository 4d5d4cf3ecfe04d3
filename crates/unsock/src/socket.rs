//! Per-fd shadow state and the IP→UNIX translation state machine.
//!
//! Every intercepted AF_INET/AF_INET6 socket gets a `Socket` in the
//! process-wide registry. The Socket decides when to swap the descriptor
//! for an AF_UNIX one (`make_unix`), fabricates the local binding and the
//! peer identity the target program expects to see, and keeps the two
//! datagram peer maps in sync.
//!
//! Lock order: the registry and path-registry mutexes are only ever held
//! to insert, remove or clone entries, never while a Socket mutex is
//! being acquired. Callers look an `Arc` up first, drop the registry
//! guard, then lock the Socket.

use crate::addr::{PeerCred, SockAddr};
use crate::blackhole::BlackHole;
use crate::error::{SysError, SysResult};
use crate::ports::PortPool;
use crate::realcalls as real;
use crate::rule::SocketType;
use crate::sockopts::SockOpts;
use libc::{c_int, c_ulong, c_void, sockaddr, sockaddr_storage, socklen_t};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Shared handle to a registered Socket.
pub type SocketRef = Arc<Mutex<Socket>>;

static REGISTRY: LazyLock<Mutex<HashMap<RawFd, SocketRef>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static SOCKPATHS: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn claim_sockpath(path: PathBuf) {
    lock(&SOCKPATHS).insert(path);
}

fn release_sockpath(path: &Path) {
    lock(&SOCKPATHS).remove(path);
}

/// Close an intercepted descriptor, falling back to the real close for
/// descriptors the registry does not know about.
pub fn close_fd(fd: RawFd) -> c_int {
    match Socket::take(fd) {
        Some(sock) => lock(&sock).close(),
        None => unsafe { real::close(fd) },
    }
}

/// Shadow state of one intercepted descriptor.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
    domain: c_int,
    typearg: c_int,
    protocol: c_int,
    kind: SocketType,

    is_unix: bool,
    bound: bool,
    activated: bool,
    is_blackhole: bool,

    /// Fabricated local address.
    binding: Option<SockAddr>,
    /// Fabricated remote address.
    connection: Option<SockAddr>,
    /// Path the underlying UNIX socket is bound or connected to. Owned
    /// (and unlinked on close) only when `bound` is set and the socket is
    /// neither a blackhole nor activated.
    sockpath: Option<PathBuf>,

    /// Path template from the rule that first translated this socket.
    template: Option<String>,

    sockopts: SockOpts,
    ports: PortPool,
    /// Fabricated peer address → remote UNIX path.
    peermap: HashMap<SockAddr, PathBuf>,
    /// Remote UNIX path → fabricated peer address.
    revpeermap: HashMap<PathBuf, SockAddr>,
    /// Keeps an implicit datagram binding's path alive.
    blackhole_ref: Option<BlackHole>,
}

impl Socket {
    fn new(fd: RawFd, domain: c_int, typearg: c_int, protocol: c_int) -> Socket {
        Socket {
            fd,
            domain,
            typearg,
            protocol,
            kind: SocketType::from_raw(typearg),
            is_unix: false,
            bound: false,
            activated: false,
            is_blackhole: false,
            binding: None,
            connection: None,
            sockpath: None,
            template: None,
            sockopts: SockOpts::default(),
            ports: PortPool::default(),
            peermap: HashMap::new(),
            revpeermap: HashMap::new(),
            blackhole_ref: None,
        }
    }

    /// Register a new Socket for `fd`. Overwrites a stale entry should the
    /// descriptor number have been recycled without an intercepted close.
    pub fn create(fd: RawFd, domain: c_int, typearg: c_int, protocol: c_int) -> SocketRef {
        let sock = Arc::new(Mutex::new(Socket::new(fd, domain, typearg, protocol)));
        let prev = lock(&REGISTRY).insert(fd, Arc::clone(&sock));
        if prev.is_some() {
            warn!(fd, "descriptor recycled without an intercepted close");
        }
        debug!(fd, domain, typearg, "tracking socket");
        sock
    }

    /// Look up the Socket registered for `fd`.
    #[must_use]
    pub fn find(fd: RawFd) -> Option<SocketRef> {
        lock(&REGISTRY).get(&fd).cloned()
    }

    /// Remove and return the Socket registered for `fd`, leaving the
    /// descriptor itself untouched. Used for close and for detaching
    /// sockets whose first binding operation matched no rule.
    pub fn take(fd: RawFd) -> Option<SocketRef> {
        lock(&REGISTRY).remove(&fd)
    }

    /// Whether some Socket in this process owns `path`.
    #[must_use]
    pub fn has_sockpath(path: &Path) -> bool {
        lock(&SOCKPATHS).contains(path)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn kind(&self) -> SocketType {
        self.kind
    }

    pub fn is_unix(&self) -> bool {
        self.is_unix
    }

    pub fn bound(&self) -> bool {
        self.bound
    }

    pub fn activated(&self) -> bool {
        self.activated
    }

    pub fn is_blackhole(&self) -> bool {
        self.is_blackhole
    }

    pub fn binding(&self) -> Option<&SockAddr> {
        self.binding.as_ref()
    }

    pub fn connection(&self) -> Option<&SockAddr> {
        self.connection.as_ref()
    }

    pub fn sockpath(&self) -> Option<&Path> {
        self.sockpath.as_deref()
    }

    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub fn set_template(&mut self, template: &str) {
        self.template = Some(template.to_string());
    }

    /// Mark this socket as a blackhole: its next bind lands on a throwaway
    /// path instead of the formatted one.
    pub fn set_blackhole(&mut self) {
        self.is_blackhole = true;
    }

    /// Forward a setsockopt and cache it for replay while the descriptor
    /// is still an IP socket. Failed calls are never cached.
    pub fn setsockopt(&mut self, level: c_int, optname: c_int, value: &[u8]) -> c_int {
        let ret = unsafe {
            real::setsockopt(
                self.fd,
                level,
                optname,
                value.as_ptr().cast::<c_void>(),
                value.len() as socklen_t,
            )
        };
        if ret != 0 {
            return ret;
        }
        if !self.is_unix {
            self.sockopts.cache_sockopt(level, optname, value);
        }
        ret
    }

    /// Forward an ioctl, caching replayable requests while the descriptor
    /// is still an IP socket.
    ///
    /// # Safety
    ///
    /// `arg` must be valid for the given request, or null.
    pub unsafe fn ioctl(&mut self, request: c_ulong, arg: *mut c_void) -> c_int {
        let ret = real::ioctl(self.fd, request, arg);
        if ret != 0 {
            return ret;
        }
        if !self.is_unix && !arg.is_null() && SockOpts::cacheable_ioctl(request) {
            self.sockopts.cache_ioctl(request, *arg.cast::<c_int>());
        }
        ret
    }

    /// An activated socket is already listening elsewhere; everything else
    /// forwards.
    pub fn listen(&self, backlog: c_int) -> c_int {
        if self.activated {
            return 0;
        }
        unsafe { real::listen(self.fd, backlog) }
    }

    /// Swap the descriptor for an AF_UNIX socket of the same `SOCK_*`
    /// type, replaying the cached options onto it. Idempotent. With a
    /// pre-made fd the socket adopts it instead of creating one.
    pub fn make_unix(&mut self, premade: Option<RawFd>) -> SysResult<()> {
        if self.is_unix {
            return Ok(());
        }
        let (newfd, adopted) = match premade {
            Some(fd) => (fd, true),
            None => {
                let fd = unsafe { real::socket(libc::AF_UNIX, self.typearg, 0) };
                if fd == -1 {
                    return Err(SysError::last_os());
                }
                (fd, false)
            }
        };
        if !self.sockopts.replay(self.fd, newfd) {
            let err = SysError::last_os();
            if !adopted {
                unsafe { real::close(newfd) };
            }
            return Err(err);
        }
        if unsafe { real::dup2(newfd, self.fd) } == -1 {
            let err = SysError::last_os();
            if !adopted {
                unsafe { real::close(newfd) };
            }
            return Err(err);
        }
        if !adopted {
            unsafe { real::close(newfd) };
        }
        debug!(fd = self.fd, adopted, "switched to unix socket");
        self.is_unix = true;
        Ok(())
    }

    /// Expand `%`-placeholders in a path template against an address:
    /// `%%` → `%`, `%a` → host, `%p` → port, `%t` → tcp/udp. Anything else
    /// after `%` stays literal.
    fn format_sockpath(&self, template: &str, addr: &SockAddr) -> String {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some('%') => {
                    out.push('%');
                    chars.next();
                }
                Some('a') => {
                    out.push_str(&addr.host_str().unwrap_or_else(|| "unknown".into()));
                    chars.next();
                }
                Some('p') => {
                    out.push_str(&addr.port_str().unwrap_or_else(|| "unknown".into()));
                    chars.next();
                }
                Some('t') => {
                    out.push_str(&self.kind.to_string());
                    chars.next();
                }
                _ => out.push('%'),
            }
        }
        out
    }

    /// Bind the real descriptor to `dest`.
    fn real_bind(&self, dest: &SockAddr) -> c_int {
        let (raw, len) = dest.to_raw();
        unsafe { real::bind(self.fd, (&raw as *const sockaddr_storage).cast(), len) }
    }

    fn real_connect(&self, dest: &SockAddr) -> c_int {
        let (raw, len) = dest.to_raw();
        unsafe { real::connect(self.fd, (&raw as *const sockaddr_storage).cast(), len) }
    }

    /// Bind to the path formatted from `template`, fabricating the local
    /// address the target program will see. Port 0 draws an ephemeral
    /// port. A path already owned by another Socket (or a socket already
    /// marked blackhole) binds to a throwaway path instead.
    pub fn bind(&mut self, addr: &SockAddr, template: &str) -> SysResult<c_int> {
        self.make_unix(None)?;

        let mut newaddr = addr.clone();
        let mut port = newaddr.port();
        if port == Some(0) {
            let ephemeral = self.ports.acquire()?;
            newaddr.set_port(ephemeral);
            port = Some(ephemeral);
        }

        let newpath = PathBuf::from(self.format_sockpath(template, &newaddr));

        let ret;
        if self.is_blackhole || Socket::has_sockpath(&newpath) {
            let bh = BlackHole::new();
            let dest = SockAddr::unix(bh.path()).ok_or(SysError::BadPath)?;
            ret = self.real_bind(&dest);
            if ret == 0 {
                debug!(fd = self.fd, path = %newpath.display(), "bind absorbed by blackhole");
                self.is_blackhole = true;
            }
            // bh drops here: the discard path vanishes right after the bind
        } else {
            let dest = SockAddr::unix(&newpath).ok_or(SysError::BadPath)?;
            ret = self.real_bind(&dest);
            if ret == 0 {
                debug!(fd = self.fd, path = %newpath.display(), "bound to unix path");
                claim_sockpath(newpath.clone());
                self.sockpath = Some(newpath);
            }
        }

        if ret == 0 {
            if let Some(p) = port {
                self.ports.reserve(p);
            }
            self.bound = true;
            self.binding = Some(newaddr);
        }
        Ok(ret)
    }

    /// Fabricate a local binding for an outgoing operation that had none:
    /// loopback stays loopback, anything else derives from our own
    /// credentials; the port comes from the pool.
    fn create_binding(&mut self, addr: &SockAddr) -> SysResult<()> {
        let mut local = self.family_template();
        if addr.is_loopback() {
            if !local.set_host_from(addr) {
                return Err(SysError::Os(libc::EINVAL));
            }
        } else if !local.set_host_creds(PeerCred::own()) {
            return Err(SysError::Os(libc::EINVAL));
        }
        let port = self.ports.acquire()?;
        local.set_port(port);
        self.binding = Some(local);
        Ok(())
    }

    fn family_template(&self) -> SockAddr {
        match self.domain {
            libc::AF_INET6 => SockAddr::V6 {
                host: Ipv6Addr::UNSPECIFIED,
                port: 0,
            },
            _ => SockAddr::V4 {
                host: Ipv4Addr::UNSPECIFIED,
                port: 0,
            },
        }
    }

    /// Connect to the path formatted from `template`. Datagram sockets
    /// reconnecting to a fabricated peer go through the peer map; datagram
    /// sockets without a binding take the rewrite path, which bootstraps
    /// an implicit blackhole binding first.
    pub fn connect(&mut self, addr: &SockAddr, template: &str) -> SysResult<c_int> {
        if self.kind == SocketType::Udp {
            if let Some(path) = self.peermap.get(addr).cloned() {
                let dest = SockAddr::unix(&path).ok_or(SysError::BadPath)?;
                let ret = self.real_connect(&dest);
                if ret == 0 {
                    self.connection = Some(addr.clone());
                    self.sockpath = Some(path);
                }
                return Ok(ret);
            }
            if self.binding.is_none() {
                let dest = self
                    .rewrite_dest(addr, template)
                    .ok_or(SysError::PortMissing)?;
                let ret = self.real_connect(&dest);
                if ret == 0 {
                    self.connection = Some(addr.clone());
                    self.sockpath = dest.sockpath().map(Path::to_path_buf);
                }
                return Ok(ret);
            }
        }

        let new_sockpath = self.format_sockpath(template, addr);
        let dest = SockAddr::unix(&new_sockpath).ok_or(SysError::BadPath)?;

        self.make_unix(None)?;

        let remote_port = addr
            .port()
            .filter(|p| *p != 0)
            .ok_or(SysError::PortMissing)?;

        let ret = self.real_connect(&dest);
        if ret != 0 {
            return Ok(ret);
        }

        if self.binding.is_none() {
            self.create_binding(addr)?;
            self.ports.reserve(remote_port);
        }

        debug!(fd = self.fd, path = %new_sockpath, "connected to unix path");
        self.connection = Some(addr.clone());
        self.sockpath = Some(PathBuf::from(new_sockpath));
        Ok(ret)
    }

    /// Register the shadow state for a freshly accepted connection and
    /// hand the target program a fabricated peer: the loopback host when
    /// we are bound to loopback, otherwise a host derived from the peer's
    /// `SO_PEERCRED` credentials, plus a fresh port either way.
    ///
    /// # Safety
    ///
    /// `out_addr`/`out_len` follow the accept(2) out-parameter contract,
    /// or may both be null.
    pub unsafe fn accept(
        &mut self,
        newfd: RawFd,
        out_addr: *mut sockaddr,
        out_len: *mut socklen_t,
    ) -> SysResult<c_int> {
        let binding = self.binding.clone().ok_or(SysError::NotBound)?;
        let local_port = binding.port().ok_or(SysError::NotBound)?;

        let mut peer = self.family_template();
        if binding.is_loopback() {
            if !peer.set_host_from(&binding) {
                return Err(SysError::Os(libc::EADDRNOTAVAIL));
            }
        } else {
            let cred = peer_credentials(newfd)?;
            if !peer.set_host_creds(cred) {
                return Err(SysError::Os(libc::EINVAL));
            }
        }

        let peer_port = self.ports.acquire()?;
        peer.set_port(peer_port);

        let mut child = Socket::new(newfd, self.domain, self.typearg, self.protocol);
        child.ports.reserve(local_port);
        child.binding = Some(binding);
        child.connection = Some(peer.clone());

        peer.apply_to_raw(out_addr, out_len);
        lock(&REGISTRY).insert(newfd, Arc::new(Mutex::new(child)));
        debug!(fd = self.fd, newfd, "accepted fabricated peer");
        Ok(newfd)
    }

    /// Report the fabricated local address.
    ///
    /// # Safety
    ///
    /// `addr`/`len` follow the getsockname(2) out-parameter contract.
    pub unsafe fn getsockname(&self, addr: *mut sockaddr, len: *mut socklen_t) -> SysResult {
        match &self.binding {
            Some(binding) => {
                binding.apply_to_raw(addr, len);
                Ok(0)
            }
            None => Err(SysError::NoAddress),
        }
    }

    /// Report the fabricated remote address.
    ///
    /// # Safety
    ///
    /// `addr`/`len` follow the getpeername(2) out-parameter contract.
    pub unsafe fn getpeername(&self, addr: *mut sockaddr, len: *mut socklen_t) -> SysResult {
        match &self.connection {
            Some(connection) => {
                connection.apply_to_raw(addr, len);
                Ok(0)
            }
            None => Err(SysError::NoAddress),
        }
    }

    /// Rewrite the source address reported by recvfrom/recvmsg: a known
    /// remote UNIX path maps to its stable fabricated peer, an unknown one
    /// gets a fresh peer recorded in both map directions. Returns false
    /// only when synthesizing a new peer failed.
    ///
    /// # Safety
    ///
    /// `out_addr`/`out_len` follow the recvfrom(2) source out-parameter
    /// contract, or may both be null.
    pub unsafe fn rewrite_src(
        &mut self,
        real_addr: &SockAddr,
        out_addr: *mut sockaddr,
        out_len: *mut socklen_t,
    ) -> bool {
        let Some(binding) = self.binding.clone() else {
            return true;
        };
        let Some(path) = real_addr.sockpath() else {
            return true;
        };
        let path = path.to_path_buf();

        if let Some(peer) = self.revpeermap.get(&path) {
            peer.apply_to_raw(out_addr, out_len);
            return true;
        }

        let mut peer = self.family_template();
        let Ok(port) = self.ports.acquire() else {
            return false;
        };
        peer.set_port(port);
        if binding.is_loopback() {
            if !peer.set_host_from(&binding) {
                return false;
            }
        } else if !peer.set_random_host() {
            return false;
        }

        self.peermap.insert(peer.clone(), path.clone());
        self.revpeermap.insert(path, peer.clone());
        peer.apply_to_raw(out_addr, out_len);
        true
    }

    /// Rewrite the destination of sendto/sendmsg on a datagram socket into
    /// a UNIX address: fabricated peers resolve through the peer map,
    /// anything else formats the template. Without a prior binding an
    /// implicit blackhole binding is created first, since the remote side can
    /// only tell peers apart by their `sun_path`. Returns `None` when the
    /// destination cannot be represented.
    pub fn rewrite_dest(&mut self, addr: &SockAddr, template: &str) -> Option<SockAddr> {
        if self.kind != SocketType::Udp {
            return None;
        }

        if let Some(path) = self.peermap.get(addr) {
            return SockAddr::unix(path);
        }

        let destpath = SockAddr::unix(self.format_sockpath(template, addr))?;

        self.make_unix(None).ok()?;

        if self.binding.is_none() {
            let bh = BlackHole::new();
            let dest = SockAddr::unix(bh.path())?;
            if self.real_bind(&dest) != 0 {
                return None;
            }
            self.create_binding(addr).ok()?;
            self.is_blackhole = true;
            debug!(fd = self.fd, "implicit blackhole binding for datagram socket");
            // Keep the path alive: the remote may reply or connect to it.
            self.blackhole_ref = Some(bh);
        }

        Some(destpath)
    }

    /// Close the descriptor and release an owned path. Activated sockets
    /// are owned elsewhere: their close is a successful no-op.
    pub fn close(&mut self) -> c_int {
        if self.activated {
            debug!(fd = self.fd, "close of activated socket ignored");
            return 0;
        }
        let ret = unsafe { real::close(self.fd) };
        if self.bound && !self.is_blackhole {
            if let Some(path) = self.sockpath.take() {
                let saved = real::last_errno();
                let _ = std::fs::remove_file(&path);
                real::set_errno(saved);
                release_sockpath(&path);
                debug!(fd = self.fd, path = %path.display(), "unlinked owned path");
            }
        }
        ret
    }

    /// Adopt an externally pre-bound UNIX descriptor as this socket's
    /// underlying object.
    pub fn activate(&mut self, addr: &SockAddr, fd: RawFd) -> SysResult<()> {
        self.make_unix(Some(fd))?;
        self.bound = true;
        self.binding = Some(addr.clone());
        self.activated = true;
        debug!(fd = self.fd, from = fd, "adopted pre-bound socket");
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // Best-effort cleanup for sockets destroyed without a close.
        if self.bound && !self.activated {
            if let Some(path) = self.sockpath.take() {
                let saved = real::last_errno();
                let _ = std::fs::remove_file(&path);
                real::set_errno(saved);
                release_sockpath(&path);
            }
        }
    }
}

/// `SO_PEERCRED` of a connected UNIX descriptor.
fn peer_credentials(fd: RawFd) -> SysResult<PeerCred> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as socklen_t;
    let ret = unsafe {
        real::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if ret == -1 {
        return Err(SysError::last_os());
    }
    Ok(PeerCred {
        uid: cred.uid,
        gid: cred.gid,
        pid: cred.pid as u32,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ports::{EPHEMERAL_HI, EPHEMERAL_LO};
    use std::mem;
    use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};
    use std::os::unix::io::IntoRawFd;
    use tempfile::TempDir;

    fn inet_fd(typearg: c_int) -> RawFd {
        let fd = unsafe { libc::socket(libc::AF_INET, typearg, 0) };
        assert!(fd >= 0);
        fd
    }

    fn fetch_sockname(sock: &SocketRef) -> SockAddr {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
        unsafe {
            sock.lock()
                .unwrap()
                .getsockname((&mut storage as *mut sockaddr_storage).cast(), &mut len)
        }
        .unwrap();
        unsafe { SockAddr::from_raw((&storage as *const sockaddr_storage).cast(), len) }.unwrap()
    }

    fn fetch_peername(sock: &SocketRef) -> SockAddr {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
        unsafe {
            sock.lock()
                .unwrap()
                .getpeername((&mut storage as *mut sockaddr_storage).cast(), &mut len)
        }
        .unwrap();
        unsafe { SockAddr::from_raw((&storage as *const sockaddr_storage).cast(), len) }.unwrap()
    }

    // --- placeholder expansion -------------------------------------------

    #[test]
    fn test_format_without_placeholders_is_identity() {
        let sock = Socket::new(-1, libc::AF_INET, libc::SOCK_STREAM, 0);
        let addr = SockAddr::parse("127.0.0.1:80").unwrap();
        assert_eq!(
            sock.format_sockpath("/run/plain.sock", &addr),
            "/run/plain.sock"
        );
    }

    #[test]
    fn test_format_expands_placeholders() {
        let sock = Socket::new(-1, libc::AF_INET, libc::SOCK_STREAM, 0);
        let addr = SockAddr::parse("10.1.2.3:8080").unwrap();
        assert_eq!(
            sock.format_sockpath("/run/%a-%p-%t-100%%.sock", &addr),
            "/run/10.1.2.3-8080-tcp-100%.sock"
        );
    }

    #[test]
    fn test_format_keeps_unknown_placeholders() {
        let sock = Socket::new(-1, libc::AF_INET, libc::SOCK_DGRAM, 0);
        let addr = SockAddr::parse("10.1.2.3:53").unwrap();
        assert_eq!(sock.format_sockpath("/run/%x-%t", &addr), "/run/%x-udp");
        assert_eq!(sock.format_sockpath("trailing%", &addr), "trailing%");
    }

    #[test]
    fn test_format_unix_addr_yields_unknown() {
        let sock = Socket::new(-1, libc::AF_INET, libc::SOCK_STREAM, 0);
        let addr = SockAddr::unix("/tmp/x").unwrap();
        assert_eq!(sock.format_sockpath("%a:%p", &addr), "unknown:unknown");
    }

    // --- option caching ---------------------------------------------------

    #[test]
    fn test_failed_setsockopt_is_not_cached() {
        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        let one: c_int = 1;
        let bytes =
            unsafe { std::slice::from_raw_parts((&one as *const c_int).cast::<u8>(), 4) };

        {
            let mut guard = sock.lock().unwrap();
            assert_eq!(guard.setsockopt(libc::SOL_SOCKET, -1, bytes), -1);
            assert!(guard.sockopts.is_empty());
            assert_eq!(guard.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, bytes), 0);
            assert_eq!(guard.sockopts.len(), 1);
        }
        assert_eq!(close_fd(fd), 0);
    }

    #[test]
    fn test_no_caching_after_unix_switch() {
        let dir = TempDir::new().unwrap();
        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        let template = format!("{}/opt-%p.sock", dir.path().display());
        let addr = SockAddr::parse("127.0.0.1:0").unwrap();

        let one: c_int = 1;
        let bytes =
            unsafe { std::slice::from_raw_parts((&one as *const c_int).cast::<u8>(), 4) };
        {
            let mut guard = sock.lock().unwrap();
            assert_eq!(guard.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, bytes), 0);
            assert_eq!(guard.bind(&addr, &template).unwrap(), 0);
            assert!(guard.is_unix());
            let cached = guard.sockopts.len();
            assert_eq!(guard.setsockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, bytes), 0);
            assert_eq!(guard.sockopts.len(), cached);
        }
        assert_eq!(close_fd(fd), 0);
    }

    // --- S1 / S7: bind with port 0, close unlinks -------------------------

    #[test]
    fn test_bind_port_zero_allocates_ephemeral() {
        let dir = TempDir::new().unwrap();
        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(Arc::ptr_eq(&sock, &Socket::find(fd).unwrap()));

        let template = format!("{}/svc-%p.sock", dir.path().display());
        let addr = SockAddr::parse("127.0.0.1:0").unwrap();
        assert_eq!(sock.lock().unwrap().bind(&addr, &template).unwrap(), 0);

        let name = fetch_sockname(&sock);
        let port = name.port().unwrap();
        assert_eq!(name.host_str().unwrap(), "127.0.0.1");
        assert!((EPHEMERAL_LO..=EPHEMERAL_HI).contains(&port));

        let path = dir.path().join(format!("svc-{}.sock", port));
        assert!(path.exists());
        assert!(Socket::has_sockpath(&path));

        assert_eq!(close_fd(fd), 0);
        assert!(!path.exists());
        assert!(!Socket::has_sockpath(&path));
        assert!(Socket::find(fd).is_none());
    }

    // --- S2: TCP client connect ------------------------------------------

    #[test]
    fn test_connect_fabricates_binding_and_connection() {
        let dir = TempDir::new().unwrap();
        let server_path = dir.path().join("svc-8080.sock");
        let _listener = UnixListener::bind(&server_path).unwrap();

        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        let template = format!("{}/svc-%p.sock", dir.path().display());
        let addr = SockAddr::parse("10.0.0.5:8080").unwrap();

        assert_eq!(sock.lock().unwrap().connect(&addr, &template).unwrap(), 0);

        assert_eq!(fetch_peername(&sock), addr);

        let name = fetch_sockname(&sock);
        let mut expected = SockAddr::for_family(libc::AF_INET).unwrap();
        expected.set_host_creds(PeerCred::own());
        assert_eq!(name.host_str(), expected.host_str());
        assert!((EPHEMERAL_LO..=EPHEMERAL_HI).contains(&name.port().unwrap()));

        assert_eq!(close_fd(fd), 0);
        // The client never owned the server's path.
        assert!(server_path.exists());
    }

    #[test]
    fn test_connect_requires_remote_port() {
        let dir = TempDir::new().unwrap();
        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        let template = format!("{}/never.sock", dir.path().display());
        let addr = SockAddr::parse("10.0.0.5").unwrap();

        let err = sock.lock().unwrap().connect(&addr, &template).unwrap_err();
        assert_eq!(err, SysError::PortMissing);
        assert_eq!(err.errno(), libc::EADDRNOTAVAIL);
        assert_eq!(close_fd(fd), 0);
    }

    #[test]
    fn test_connect_to_missing_path_propagates_errno() {
        let dir = TempDir::new().unwrap();
        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        let template = format!("{}/nobody-home.sock", dir.path().display());
        let addr = SockAddr::parse("10.0.0.5:8080").unwrap();

        let ret = sock.lock().unwrap().connect(&addr, &template).unwrap();
        assert_eq!(ret, -1);
        assert_eq!(real::last_errno(), libc::ENOENT);
        assert_eq!(close_fd(fd), 0);
    }

    // --- S3 / S4: accept --------------------------------------------------

    #[test]
    fn test_accept_on_loopback_synthesizes_loopback_peer() {
        let dir = TempDir::new().unwrap();
        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        let template = format!("{}/acc-%p.sock", dir.path().display());
        let addr = SockAddr::parse("127.0.0.1:0").unwrap();
        assert_eq!(sock.lock().unwrap().bind(&addr, &template).unwrap(), 0);
        assert_eq!(sock.lock().unwrap().listen(8), 0);

        let local = fetch_sockname(&sock);
        let local_port = local.port().unwrap();
        let path = dir.path().join(format!("acc-{}.sock", local_port));

        let client_path = path.clone();
        let client = std::thread::spawn(move || UnixStream::connect(client_path).unwrap());

        let newfd = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        assert!(newfd >= 0);

        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
        let ret = unsafe {
            sock.lock().unwrap().accept(
                newfd,
                (&mut storage as *mut sockaddr_storage).cast(),
                &mut len,
            )
        }
        .unwrap();
        assert_eq!(ret, newfd);

        let peer =
            unsafe { SockAddr::from_raw((&storage as *const sockaddr_storage).cast(), len) }
                .unwrap();
        assert_eq!(peer.host_str().unwrap(), "127.0.0.1");
        assert_ne!(peer.port().unwrap(), local_port);

        // The child carries the fabricated addresses from birth.
        let child = Socket::find(newfd).unwrap();
        assert_eq!(fetch_peername(&child), peer);
        assert_eq!(fetch_sockname(&child), local);

        let _stream = client.join().unwrap();
        assert_eq!(close_fd(newfd), 0);
        assert_eq!(close_fd(fd), 0);
    }

    #[test]
    fn test_accept_nonloopback_uses_peer_credentials() {
        let dir = TempDir::new().unwrap();
        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        let template = format!("{}/cred-%p.sock", dir.path().display());
        let addr = SockAddr::parse("0.0.0.0:0").unwrap();
        assert_eq!(sock.lock().unwrap().bind(&addr, &template).unwrap(), 0);
        assert_eq!(sock.lock().unwrap().listen(8), 0);

        let port = fetch_sockname(&sock).port().unwrap();
        let path = dir.path().join(format!("cred-{}.sock", port));

        let mut peers = Vec::new();
        for _ in 0..2 {
            let client_path = path.clone();
            let client = std::thread::spawn(move || UnixStream::connect(client_path).unwrap());
            let newfd = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            assert!(newfd >= 0);

            let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
            unsafe {
                sock.lock().unwrap().accept(
                    newfd,
                    (&mut storage as *mut sockaddr_storage).cast(),
                    &mut len,
                )
            }
            .unwrap();
            let peer =
                unsafe { SockAddr::from_raw((&storage as *const sockaddr_storage).cast(), len) }
                    .unwrap();
            let _stream = client.join().unwrap();
            assert_eq!(close_fd(newfd), 0);
            peers.push(peer);
        }

        // Same credentials (both connections come from this process), so
        // the host bytes agree; the ports do not.
        let mut expected = SockAddr::for_family(libc::AF_INET).unwrap();
        expected.set_host_creds(PeerCred::own());
        assert_eq!(peers[0].host_str(), expected.host_str());
        assert_eq!(peers[1].host_str(), expected.host_str());
        assert_ne!(peers[0].port(), peers[1].port());

        assert_eq!(close_fd(fd), 0);
    }

    #[test]
    fn test_accept_without_binding_is_einval() {
        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        let err = unsafe {
            sock.lock()
                .unwrap()
                .accept(99, std::ptr::null_mut(), std::ptr::null_mut())
        }
        .unwrap_err();
        assert_eq!(err, SysError::NotBound);
        assert_eq!(err.errno(), libc::EINVAL);
        assert_eq!(close_fd(fd), 0);
    }

    // --- S5: UDP implicit blackhole binding -------------------------------

    fn recv_fabricated(fd: RawFd, sock: &SocketRef) -> SockAddr {
        let mut buf = [0u8; 16];
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut slen = mem::size_of::<sockaddr_storage>() as socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                (&mut storage as *mut sockaddr_storage).cast(),
                &mut slen,
            )
        };
        assert_eq!(n, 4);
        let real_src =
            unsafe { SockAddr::from_raw((&storage as *const sockaddr_storage).cast(), slen) }
                .unwrap();

        let mut out: sockaddr_storage = unsafe { mem::zeroed() };
        let mut olen = mem::size_of::<sockaddr_storage>() as socklen_t;
        assert!(unsafe {
            sock.lock().unwrap().rewrite_src(
                &real_src,
                (&mut out as *mut sockaddr_storage).cast(),
                &mut olen,
            )
        });
        unsafe { SockAddr::from_raw((&out as *const sockaddr_storage).cast(), olen) }.unwrap()
    }

    #[test]
    fn test_udp_send_without_bind_creates_blackhole_binding() {
        let dir = TempDir::new().unwrap();
        let server_path = dir.path().join("udp-9000");
        let server = UnixDatagram::bind(&server_path).unwrap();

        let fd = inet_fd(libc::SOCK_DGRAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_DGRAM, 0);
        let template = format!("{}/udp-%p", dir.path().display());
        let dest_addr = SockAddr::parse("10.0.0.5:9000").unwrap();

        let dest = sock
            .lock()
            .unwrap()
            .rewrite_dest(&dest_addr, &template)
            .unwrap();
        assert_eq!(dest.sockpath().unwrap(), server_path);
        {
            let guard = sock.lock().unwrap();
            assert!(guard.is_blackhole());
            assert!(guard.binding().is_some());
            assert!(!guard.bound());
        }

        let (raw, rlen) = dest.to_raw();
        let sent = unsafe {
            libc::sendto(
                fd,
                b"ping".as_ptr().cast(),
                4,
                0,
                (&raw as *const sockaddr_storage).cast(),
                rlen,
            )
        };
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let (n, src) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        let blackhole_path = src.as_pathname().unwrap().to_path_buf();
        assert!(blackhole_path.exists());
        // Blackhole paths never enter the shared path registry.
        assert!(!Socket::has_sockpath(&blackhole_path));

        // Two replies from the same peer rewrite to one stable address.
        server.send_to(b"pong", &blackhole_path).unwrap();
        server.send_to(b"pong", &blackhole_path).unwrap();
        let peer_one = recv_fabricated(fd, &sock);
        let peer_two = recv_fabricated(fd, &sock);
        assert_eq!(peer_one, peer_two);
        assert!(!peer_one.is_loopback());
        assert!((EPHEMERAL_LO..=EPHEMERAL_HI).contains(&peer_one.port().unwrap()));

        // Sending to the fabricated peer routes back through the peer map.
        let back = sock
            .lock()
            .unwrap()
            .rewrite_dest(&peer_one, &template)
            .unwrap();
        assert_eq!(back.sockpath().unwrap(), server_path);

        assert_eq!(close_fd(fd), 0);
        // The last reference going away releases the blackhole path.
        drop(sock);
        assert!(!blackhole_path.exists());
    }

    #[test]
    fn test_udp_connect_without_bind_uses_rewrite_path() {
        let dir = TempDir::new().unwrap();
        let server_path = dir.path().join("udp-5353");
        let server = UnixDatagram::bind(&server_path).unwrap();

        let fd = inet_fd(libc::SOCK_DGRAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_DGRAM, 0);
        let template = format!("{}/udp-%p", dir.path().display());
        let addr = SockAddr::parse("127.0.0.1:5353").unwrap();

        assert_eq!(sock.lock().unwrap().connect(&addr, &template).unwrap(), 0);
        {
            let guard = sock.lock().unwrap();
            assert!(guard.is_blackhole());
            assert_eq!(guard.connection(), Some(&addr));
            assert_eq!(guard.sockpath().unwrap(), server_path);
            // Loopback destination keeps the implicit binding on loopback.
            assert!(guard.binding().unwrap().is_loopback());
        }

        let sent = unsafe { libc::send(fd, b"ping".as_ptr().cast(), 4, 0) };
        assert_eq!(sent, 4);
        let mut buf = [0u8; 16];
        let (n, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        assert_eq!(close_fd(fd), 0);
    }

    #[test]
    fn test_rewrite_dest_refuses_stream_sockets() {
        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        let addr = SockAddr::parse("10.0.0.5:9000").unwrap();
        assert!(sock
            .lock()
            .unwrap()
            .rewrite_dest(&addr, "/tmp/never-%p")
            .is_none());
        assert_eq!(close_fd(fd), 0);
    }

    // --- S6: duplicate bind path collapses to blackhole --------------------

    #[test]
    fn test_duplicate_bind_path_blackholes_second_socket() {
        let dir = TempDir::new().unwrap();
        let template = format!("{}/dup.sock", dir.path().display());
        let shared = dir.path().join("dup.sock");
        let addr = SockAddr::parse("127.0.0.1:7000").unwrap();

        let fd1 = inet_fd(libc::SOCK_STREAM);
        let first = Socket::create(fd1, libc::AF_INET, libc::SOCK_STREAM, 0);
        assert_eq!(first.lock().unwrap().bind(&addr, &template).unwrap(), 0);
        assert!(shared.exists());
        assert!(Socket::has_sockpath(&shared));

        let fd2 = inet_fd(libc::SOCK_STREAM);
        let second = Socket::create(fd2, libc::AF_INET, libc::SOCK_STREAM, 0);
        assert_eq!(second.lock().unwrap().bind(&addr, &template).unwrap(), 0);
        {
            let guard = second.lock().unwrap();
            assert!(guard.is_blackhole());
            assert!(guard.bound());
            assert!(guard.sockpath().is_none());
        }

        // Closing the blackhole side leaves the first binder's path alone.
        assert_eq!(close_fd(fd2), 0);
        assert!(shared.exists());
        assert!(Socket::has_sockpath(&shared));

        assert_eq!(close_fd(fd1), 0);
        assert!(!shared.exists());
        assert!(!Socket::has_sockpath(&shared));
    }

    // --- activation --------------------------------------------------------

    #[test]
    fn test_activated_socket_survives_close() {
        let dir = TempDir::new().unwrap();
        let pre_path = dir.path().join("activated.sock");
        let pre_fd = UnixListener::bind(&pre_path).unwrap().into_raw_fd();

        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        let addr = SockAddr::parse("0.0.0.0:80").unwrap();
        sock.lock().unwrap().activate(&addr, pre_fd).unwrap();
        {
            let guard = sock.lock().unwrap();
            assert!(guard.activated());
            assert!(guard.bound());
            assert!(guard.is_unix());
            // Listening already happened elsewhere.
            assert_eq!(guard.listen(128), 0);
        }
        assert_eq!(fetch_sockname(&sock), addr);

        assert_eq!(close_fd(fd), 0);
        // Neither the descriptor nor the path were touched.
        assert_ne!(unsafe { libc::fcntl(fd, libc::F_GETFD) }, -1);
        assert!(pre_path.exists());
        assert!(Socket::find(fd).is_none());

        unsafe {
            libc::close(fd);
            libc::close(pre_fd);
        }
    }

    // --- misc contract edges ----------------------------------------------

    #[test]
    fn test_getsockname_before_bind_is_efault() {
        let fd = inet_fd(libc::SOCK_STREAM);
        let sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        let err = unsafe {
            sock.lock()
                .unwrap()
                .getsockname(std::ptr::null_mut(), std::ptr::null_mut())
        }
        .unwrap_err();
        assert_eq!(err.errno(), libc::EFAULT);
        assert_eq!(close_fd(fd), 0);
    }

    #[test]
    fn test_take_detaches_without_closing() {
        let fd = inet_fd(libc::SOCK_STREAM);
        let _sock = Socket::create(fd, libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(Socket::take(fd).is_some());
        assert!(Socket::find(fd).is_none());
        // The descriptor is still alive and usable.
        assert_ne!(unsafe { libc::fcntl(fd, libc::F_GETFD) }, -1);
        assert_eq!(unsafe { libc::close(fd) }, 0);
    }
}

//! `LD_PRELOAD` surface of unsock.
//!
//! The dynamic linker resolves symbols in preloaded libraries first, so the
//! `#[no_mangle]` definitions below interpose libc's socket entry points.
//! Each one is a thin adaptor: look the descriptor up in the registry (miss
//! means pass straight through), translate the raw arguments into core
//! types, dispatch to the Socket method, and reproduce the syscall
//! contract (return value plus errno) for the target program.
//!
//! Rule matching happens at the first operation that binds a real address
//! (bind, outgoing connect, outgoing sendto), when the direction is known.
//! A socket whose first such operation matches no rule is detached from the
//! registry and behaves as a plain IP socket from then on; a translated
//! socket remembers its rule's path template for later datagram rewrites.
//!
//! Everything forwarded goes through the `realcalls` gateway: a plain
//! `libc::bind` from in here would resolve right back into these symbols.

use libc::{
    c_int, c_ulong, c_void, msghdr, size_t, sockaddr, sockaddr_storage, socklen_t, ssize_t,
    AF_INET, AF_INET6, AF_UNIX,
};
use std::sync::{MutexGuard, OnceLock};
use unsock::activation;
use unsock::config;
use unsock::error::SysError;
use unsock::realcalls as real;
use unsock::rule::{Rule, RuleDir, RuleQuery, RuleSet, SocketType};
use unsock::socket::{self, Socket, SocketRef};
use unsock::SockAddr;

static RULES: OnceLock<RuleSet> = OnceLock::new();

/// The process-wide rule set, decoded from the environment channel on
/// first use. A decode failure disables interception rather than breaking
/// the target program.
fn rules() -> &'static RuleSet {
    RULES.get_or_init(|| {
        init_logging();
        match config::rules_from_env() {
            Ok(rules) => {
                tracing::debug!(count = rules.len(), "rule list loaded");
                rules
            }
            Err(err) => {
                tracing::error!(%err, "failed to decode rules, interception disabled");
                RuleSet::empty()
            }
        }
    })
}

fn init_logging() {
    let level = match config::verbosity_from_env() {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::WARN,
        2 => tracing::Level::INFO,
        3 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}

fn lock(sock: &SocketRef) -> MutexGuard<'_, Socket> {
    sock.lock().unwrap_or_else(|e| e.into_inner())
}

/// Publish an intercept failure the way the syscall would.
fn fail(err: SysError) -> c_int {
    real::set_errno(err.errno());
    -1
}

/// Verdict of the first-binding-operation rule lookup.
enum Disposition<'a> {
    Translate(&'a Rule),
    Detach,
    Reject(c_int),
}

fn first_op_rule(sock: &Socket, direction: RuleDir, sa: &SockAddr) -> Disposition<'static> {
    let query = RuleQuery {
        direction,
        socket_type: sock.kind(),
        addr: sa,
        fd_name: None,
    };
    match rules().first_match(&query) {
        Some(rule) if rule.reject => {
            Disposition::Reject(rule.reject_errno.unwrap_or(libc::EACCES))
        }
        Some(rule) => Disposition::Translate(rule),
        None => Disposition::Detach,
    }
}

// ---------------------------------------------------------------------------
// socket / close
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = real::socket(domain, ty, protocol);
    if fd == -1 {
        return fd;
    }
    if (domain == AF_INET || domain == AF_INET6)
        && SocketType::from_raw(ty) != SocketType::Invalid
        && !rules().is_empty()
    {
        Socket::create(fd, domain, ty, protocol);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    socket::close_fd(fd)
}

// ---------------------------------------------------------------------------
// bind / connect / listen
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn bind(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    let Some(sock) = Socket::find(fd) else {
        return real::bind(fd, addr, len);
    };
    let sa = match SockAddr::from_raw(addr, len) {
        Some(sa) if sa.family() != AF_UNIX => sa,
        _ => return real::bind(fd, addr, len),
    };

    let mut guard = lock(&sock);
    match first_op_rule(&guard, RuleDir::Incoming, &sa) {
        Disposition::Reject(errno) => {
            real::set_errno(errno);
            -1
        }
        Disposition::Detach => {
            drop(guard);
            Socket::take(fd);
            real::bind(fd, addr, len)
        }
        Disposition::Translate(rule) => {
            if rule.socket_activation {
                if let Some(pre) = activation::adopt(rule) {
                    return match guard.activate(&sa, pre) {
                        Ok(()) => 0,
                        Err(err) => fail(err),
                    };
                }
            }
            if rule.blackhole {
                guard.set_blackhole();
            }
            match rule.socket_path.as_deref() {
                Some(template) => {
                    guard.set_template(template);
                    match guard.bind(&sa, template) {
                        Ok(ret) => ret,
                        Err(err) => fail(err),
                    }
                }
                None if rule.blackhole => match guard.bind(&sa, "") {
                    Ok(ret) => ret,
                    Err(err) => fail(err),
                },
                None => {
                    // Activation-only rule with nothing to adopt.
                    drop(guard);
                    Socket::take(fd);
                    real::bind(fd, addr, len)
                }
            }
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    let Some(sock) = Socket::find(fd) else {
        return real::connect(fd, addr, len);
    };
    let sa = match SockAddr::from_raw(addr, len) {
        Some(sa) if sa.family() != AF_UNIX => sa,
        _ => return real::connect(fd, addr, len),
    };

    let mut guard = lock(&sock);
    if let Some(template) = guard.template().map(str::to_owned) {
        return match guard.connect(&sa, &template) {
            Ok(ret) => ret,
            Err(err) => fail(err),
        };
    }
    match first_op_rule(&guard, RuleDir::Outgoing, &sa) {
        Disposition::Reject(errno) => {
            real::set_errno(errno);
            -1
        }
        Disposition::Detach => {
            drop(guard);
            Socket::take(fd);
            real::connect(fd, addr, len)
        }
        Disposition::Translate(rule) => match rule.socket_path.as_deref() {
            Some(template) => {
                guard.set_template(template);
                match guard.connect(&sa, template) {
                    Ok(ret) => ret,
                    Err(err) => fail(err),
                }
            }
            None => {
                // Blackhole and activation act on the incoming side.
                drop(guard);
                Socket::take(fd);
                real::connect(fd, addr, len)
            }
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn listen(fd: c_int, backlog: c_int) -> c_int {
    let Some(sock) = Socket::find(fd) else {
        return real::listen(fd, backlog);
    };
    let guard = lock(&sock);
    guard.listen(backlog)
}

// ---------------------------------------------------------------------------
// accept
// ---------------------------------------------------------------------------

unsafe fn accept_impl(
    fd: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
    flags: Option<c_int>,
) -> c_int {
    let forward = |addr, len| unsafe {
        match flags {
            Some(f) => real::accept4(fd, addr, len, f),
            None => real::accept(fd, addr, len),
        }
    };

    let Some(sock) = Socket::find(fd) else {
        return forward(addr, len);
    };
    if !lock(&sock).is_unix() {
        return forward(addr, len);
    }

    // Block without holding the Socket; the real peer address is useless
    // (an AF_UNIX path), the fabricated one is produced afterwards.
    let newfd = forward(std::ptr::null_mut(), std::ptr::null_mut());
    if newfd == -1 {
        return -1;
    }

    let mut guard = lock(&sock);
    match guard.accept(newfd, addr, len) {
        Ok(fd) => fd,
        Err(err) => {
            let errno = err.errno();
            real::close(newfd);
            real::set_errno(errno);
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    accept_impl(fd, addr, len, None)
}

#[no_mangle]
pub unsafe extern "C" fn accept4(
    fd: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
    flags: c_int,
) -> c_int {
    accept_impl(fd, addr, len, Some(flags))
}

// ---------------------------------------------------------------------------
// getsockname / getpeername
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn getsockname(
    fd: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
) -> c_int {
    let Some(sock) = Socket::find(fd) else {
        return real::getsockname(fd, addr, len);
    };
    let guard = lock(&sock);
    if guard.binding().is_some() {
        match guard.getsockname(addr, len) {
            Ok(ret) => ret,
            Err(err) => fail(err),
        }
    } else if !guard.is_unix() {
        // Never translated: the kernel still has the truth.
        drop(guard);
        real::getsockname(fd, addr, len)
    } else {
        fail(SysError::NoAddress)
    }
}

#[no_mangle]
pub unsafe extern "C" fn getpeername(
    fd: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
) -> c_int {
    let Some(sock) = Socket::find(fd) else {
        return real::getpeername(fd, addr, len);
    };
    let guard = lock(&sock);
    if guard.connection().is_some() {
        match guard.getpeername(addr, len) {
            Ok(ret) => ret,
            Err(err) => fail(err),
        }
    } else if !guard.is_unix() {
        drop(guard);
        real::getpeername(fd, addr, len)
    } else {
        fail(SysError::NoAddress)
    }
}

// ---------------------------------------------------------------------------
// setsockopt / ioctl
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    let Some(sock) = Socket::find(fd) else {
        return real::setsockopt(fd, level, optname, optval, optlen);
    };
    if optval.is_null() {
        return real::setsockopt(fd, level, optname, optval, optlen);
    }
    let value = std::slice::from_raw_parts(optval.cast::<u8>(), optlen as usize);
    let result = lock(&sock).setsockopt(level, optname, value);
    result
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    let Some(sock) = Socket::find(fd) else {
        return real::ioctl(fd, request, arg);
    };
    let result = lock(&sock).ioctl(request, arg);
    result
}

// ---------------------------------------------------------------------------
// sendto / sendmsg
// ---------------------------------------------------------------------------

enum SendDisposition {
    Template(String),
    PassThrough,
    Fail(c_int),
}

/// Resolve the path template for a datagram send, running the first-op
/// rule match when this socket has not been decided yet.
fn resolve_send_template(guard: &mut Socket, sa: &SockAddr) -> SendDisposition {
    if guard.kind() != SocketType::Udp {
        return SendDisposition::PassThrough;
    }
    if let Some(template) = guard.template() {
        return SendDisposition::Template(template.to_string());
    }
    match first_op_rule(guard, RuleDir::Outgoing, sa) {
        Disposition::Reject(errno) => SendDisposition::Fail(errno),
        Disposition::Detach => {
            Socket::take(guard.fd());
            SendDisposition::PassThrough
        }
        Disposition::Translate(rule) => match rule.socket_path.as_deref() {
            Some(template) => {
                guard.set_template(template);
                SendDisposition::Template(template.to_string())
            }
            None => {
                Socket::take(guard.fd());
                SendDisposition::PassThrough
            }
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    let Some(sock) = Socket::find(fd) else {
        return real::sendto(fd, buf, len, flags, dest, addrlen);
    };
    let sa = match SockAddr::from_raw(dest, addrlen) {
        Some(sa) if sa.family() != AF_UNIX => sa,
        _ => return real::sendto(fd, buf, len, flags, dest, addrlen),
    };

    let mut guard = lock(&sock);
    match resolve_send_template(&mut guard, &sa) {
        SendDisposition::Fail(errno) => {
            real::set_errno(errno);
            -1
        }
        SendDisposition::PassThrough => {
            drop(guard);
            real::sendto(fd, buf, len, flags, dest, addrlen)
        }
        SendDisposition::Template(template) => match guard.rewrite_dest(&sa, &template) {
            Some(udest) => {
                let (raw, rlen) = udest.to_raw();
                drop(guard);
                real::sendto(
                    fd,
                    buf,
                    len,
                    flags,
                    (&raw as *const sockaddr_storage).cast(),
                    rlen,
                )
            }
            None => {
                real::set_errno(libc::EADDRNOTAVAIL);
                -1
            }
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    let Some(sock) = Socket::find(fd) else {
        return real::sendmsg(fd, msg, flags);
    };
    if msg.is_null() {
        return real::sendmsg(fd, msg, flags);
    }
    let sa = match SockAddr::from_raw((*msg).msg_name.cast(), (*msg).msg_namelen) {
        Some(sa) if sa.family() != AF_UNIX => sa,
        _ => return real::sendmsg(fd, msg, flags),
    };

    let mut guard = lock(&sock);
    match resolve_send_template(&mut guard, &sa) {
        SendDisposition::Fail(errno) => {
            real::set_errno(errno);
            -1
        }
        SendDisposition::PassThrough => {
            drop(guard);
            real::sendmsg(fd, msg, flags)
        }
        SendDisposition::Template(template) => match guard.rewrite_dest(&sa, &template) {
            Some(udest) => {
                let (raw, rlen) = udest.to_raw();
                let mut rewritten = *msg;
                rewritten.msg_name = (&raw as *const sockaddr_storage).cast_mut().cast();
                rewritten.msg_namelen = rlen;
                drop(guard);
                real::sendmsg(fd, &rewritten, flags)
            }
            None => {
                real::set_errno(libc::EADDRNOTAVAIL);
                -1
            }
        },
    }
}

// ---------------------------------------------------------------------------
// recvfrom / recvmsg
// ---------------------------------------------------------------------------

/// Deliver the source address of a receive: substitute the fabricated peer
/// when the real source is a UNIX path on a translated socket, otherwise
/// copy the raw bytes through with kernel truncation semantics.
unsafe fn rewrite_source(
    sock: &SocketRef,
    storage: &sockaddr_storage,
    slen: socklen_t,
    out: *mut sockaddr,
    out_len: *mut socklen_t,
) {
    if out.is_null() || out_len.is_null() {
        return;
    }
    if let Some(real_src) =
        SockAddr::from_raw((storage as *const sockaddr_storage).cast(), slen)
    {
        if real_src.sockpath().is_some() {
            let mut guard = lock(sock);
            if guard.binding().is_some() && guard.rewrite_src(&real_src, out, out_len) {
                return;
            }
        }
    }
    let copy = (*out_len).min(slen) as usize;
    std::ptr::copy_nonoverlapping(
        (storage as *const sockaddr_storage).cast::<u8>(),
        out.cast::<u8>(),
        copy,
    );
    *out_len = slen;
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    let Some(sock) = Socket::find(fd) else {
        return real::recvfrom(fd, buf, len, flags, src, addrlen);
    };

    // Receive into scratch space first: the caller must never see the raw
    // sun_path of a translated peer.
    let mut storage: sockaddr_storage = std::mem::zeroed();
    let mut slen = std::mem::size_of::<sockaddr_storage>() as socklen_t;
    let ret = real::recvfrom(
        fd,
        buf,
        len,
        flags,
        (&mut storage as *mut sockaddr_storage).cast(),
        &mut slen,
    );
    if ret == -1 {
        return ret;
    }
    rewrite_source(&sock, &storage, slen, src, addrlen);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    let Some(sock) = Socket::find(fd) else {
        return real::recvmsg(fd, msg, flags);
    };
    let ret = real::recvmsg(fd, msg, flags);
    if ret == -1 || msg.is_null() {
        return ret;
    }
    let name = (*msg).msg_name;
    let namelen = (*msg).msg_namelen;
    if name.is_null() || namelen == 0 {
        return ret;
    }
    if let Some(real_src) = SockAddr::from_raw(name.cast(), namelen) {
        if real_src.sockpath().is_some() {
            let mut guard = lock(&sock);
            if guard.binding().is_some() {
                let mut cap = namelen;
                if guard.rewrite_src(&real_src, name.cast(), &mut cap) {
                    (*msg).msg_namelen = cap;
                }
            }
        }
    }
    ret
}

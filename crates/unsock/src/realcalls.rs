//! Gateway to the unintercepted libc socket primitives.
//!
//! When the shim is preloaded, a plain `libc::bind` call from our own code
//! would resolve through the PLT right back into the interposed symbol. All
//! forwarding therefore goes through `dlsym(RTLD_NEXT, ...)`, which yields
//! the next definition after the preload object (normally libc's). Resolved
//! addresses are cached in atomics so the lookup happens once per symbol.
//!
//! Contract: these functions bypass the intercept layer entirely and leave
//! errno exactly as the kernel set it. A symbol that cannot be resolved
//! surfaces as `ENOSYS`.

use libc::{
    c_char, c_int, c_ulong, c_void, msghdr, size_t, sockaddr, socklen_t, ssize_t, RTLD_NEXT,
};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Set the calling thread's errno.
pub fn set_errno(val: c_int) {
    unsafe {
        *libc::__errno_location() = val;
    }
}

/// Read the calling thread's errno.
#[must_use]
pub fn last_errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

macro_rules! real_fn {
    ($name:ident => fn($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        pub unsafe fn $name($($arg: $ty),*) -> $ret {
            static ADDR: AtomicUsize = AtomicUsize::new(0);
            let mut addr = ADDR.load(Ordering::Acquire);
            if addr == 0 {
                let sym = libc::dlsym(
                    RTLD_NEXT,
                    concat!(stringify!($name), "\0").as_ptr() as *const c_char,
                );
                addr = sym as usize;
                if addr != 0 {
                    ADDR.store(addr, Ordering::Release);
                }
            }
            if addr == 0 {
                set_errno(libc::ENOSYS);
                return -1 as $ret;
            }
            let f: unsafe extern "C" fn($($ty),*) -> $ret = std::mem::transmute(addr);
            f($($arg),*)
        }
    };
}

real_fn!(socket => fn(domain: c_int, ty: c_int, protocol: c_int) -> c_int);
real_fn!(bind => fn(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int);
real_fn!(connect => fn(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int);
real_fn!(listen => fn(fd: c_int, backlog: c_int) -> c_int);
real_fn!(accept => fn(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int);
real_fn!(accept4 => fn(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t, flags: c_int) -> c_int);
real_fn!(close => fn(fd: c_int) -> c_int);
real_fn!(dup2 => fn(oldfd: c_int, newfd: c_int) -> c_int);
real_fn!(setsockopt => fn(fd: c_int, level: c_int, optname: c_int, optval: *const c_void, optlen: socklen_t) -> c_int);
real_fn!(getsockopt => fn(fd: c_int, level: c_int, optname: c_int, optval: *mut c_void, optlen: *mut socklen_t) -> c_int);
real_fn!(ioctl => fn(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int);
real_fn!(getsockname => fn(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int);
real_fn!(getpeername => fn(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int);
real_fn!(recvfrom => fn(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> ssize_t);
real_fn!(recvmsg => fn(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t);
real_fn!(sendto => fn(fd: c_int, buf: *const c_void, len: size_t, flags: c_int, addr: *const sockaddr, addrlen: socklen_t) -> ssize_t);
real_fn!(sendmsg => fn(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t);

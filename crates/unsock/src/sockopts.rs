//! Replay cache for socket options and ioctls.
//!
//! The IP→UNIX switch creates a brand-new descriptor, so every option the
//! target program set on the original socket has to be applied again. Only
//! calls that succeeded are recorded (replaying a failed call would
//! introduce errors the target never saw), and recording stops once the
//! descriptor is UNIX; from then on options land on the live fd directly.

use crate::realcalls as real;
use libc::{c_int, c_ulong, c_void, socklen_t};
use std::os::unix::io::RawFd;
use tracing::{debug, trace};

/// Option levels that make no sense on a UNIX descriptor and are skipped
/// during replay. SOL_SOCKET entries always replay.
const SKIPPED_LEVELS: [c_int; 3] = [libc::IPPROTO_IP, libc::IPPROTO_IPV6, libc::IPPROTO_TCP];

#[derive(Debug, Clone)]
enum CachedCall {
    SockOpt {
        level: c_int,
        optname: c_int,
        value: Vec<u8>,
    },
    Ioctl {
        request: c_ulong,
        arg: c_int,
    },
}

/// Ordered record of successful setsockopt/ioctl calls.
#[derive(Debug, Clone, Default)]
pub struct SockOpts {
    calls: Vec<CachedCall>,
}

impl SockOpts {
    /// Record a successful `setsockopt`.
    pub fn cache_sockopt(&mut self, level: c_int, optname: c_int, value: &[u8]) {
        trace!(opt_level = level, optname, len = value.len(), "caching sockopt");
        self.calls.push(CachedCall::SockOpt {
            level,
            optname,
            value: value.to_vec(),
        });
    }

    /// Record a successful `ioctl` with an int argument.
    pub fn cache_ioctl(&mut self, request: c_ulong, arg: c_int) {
        trace!(request, arg, "caching ioctl");
        self.calls.push(CachedCall::Ioctl { request, arg });
    }

    /// Whether an ioctl request carries a plain int argument we can replay.
    #[must_use]
    pub fn cacheable_ioctl(request: c_ulong) -> bool {
        request == libc::FIONBIO as c_ulong || request == libc::FIOASYNC as c_ulong
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Re-apply every recorded call to `dst`, in insertion order, after
    /// copying the descriptor and file status flags from `src`. Returns
    /// true iff everything succeeded; on failure errno identifies the
    /// replay that went wrong.
    #[must_use]
    pub fn replay(&self, src: RawFd, dst: RawFd) -> bool {
        unsafe {
            let flags = libc::fcntl(src, libc::F_GETFL);
            if flags == -1 || libc::fcntl(dst, libc::F_SETFL, flags) == -1 {
                return false;
            }
            let fdflags = libc::fcntl(src, libc::F_GETFD);
            if fdflags == -1 || libc::fcntl(dst, libc::F_SETFD, fdflags) == -1 {
                return false;
            }
        }

        for call in &self.calls {
            match call {
                CachedCall::SockOpt {
                    level,
                    optname,
                    value,
                } => {
                    if SKIPPED_LEVELS.contains(level) {
                        debug!(opt_level = level, optname, "skipping IP-level option on replay");
                        continue;
                    }
                    let ret = unsafe {
                        real::setsockopt(
                            dst,
                            *level,
                            *optname,
                            value.as_ptr().cast::<c_void>(),
                            value.len() as socklen_t,
                        )
                    };
                    if ret != 0 {
                        return false;
                    }
                }
                CachedCall::Ioctl { request, arg } => {
                    let mut arg = *arg;
                    let ret = unsafe {
                        real::ioctl(dst, *request, (&mut arg as *mut c_int).cast::<c_void>())
                    };
                    if ret != 0 {
                        return false;
                    }
                }
            }
        }
        true
    }
}

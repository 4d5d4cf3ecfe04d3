//! Uniform representation of IPv4, IPv6 and UNIX socket endpoints.
//!
//! `SockAddr` is the currency of the intercept layer: raw `sockaddr`
//! buffers from the target program are decoded into it, fabricated
//! addresses are synthesized through it, and every real call receives its
//! raw encoding. Host synthesis is where the illusion lives: peers of a
//! UNIX socket are given stable fake IP addresses derived from their
//! `SO_PEERCRED` credentials, so two observers of the same peer agree on
//! its "IP".
//!
//! # Credential packing
//!
//! - IPv4 has 32 bits and necessarily loses high-order entropy. The layout is
//!   `0xF << 28 | (uid & 0x7F) << 21 | (gid & 0x3F) << 15 | (pid & 0x7FFF)`:
//!   the fixed top nibble puts every synthesized host into 240.0.0.0/4
//!   (reserved, never loopback), and 15 pid bits cover the default Linux
//!   `pid_max` of 32768 without collision.
//! - IPv6 packs the full tuple into the low 96 bits, zero-prefixed: uid,
//!   gid and pid as three big-endian 32-bit words.
//!
//! Identical credentials always produce identical bitstrings.

use libc::{
    c_int, sa_family_t, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, sockaddr_un,
    socklen_t, AF_INET, AF_INET6, AF_UNIX,
};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Maximum UNIX socket path length including the terminating NUL.
pub const SUN_PATH_MAX: usize = 108;

/// Peer credentials used to synthesize stable fake host addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl PeerCred {
    /// The calling process's own credentials.
    #[must_use]
    pub fn own() -> Self {
        unsafe {
            PeerCred {
                uid: libc::getuid(),
                gid: libc::getgid(),
                pid: libc::getpid() as u32,
            }
        }
    }
}

/// A socket endpoint: IPv4, IPv6 or UNIX.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SockAddr {
    V4 { host: Ipv4Addr, port: u16 },
    V6 { host: Ipv6Addr, port: u16 },
    Unix { path: PathBuf },
}

impl SockAddr {
    /// Parse an address from text, family inferred. Accepts a bare host
    /// (`127.0.0.1`, `::1`) or host:port (`127.0.0.1:80`, `[::1]:80`).
    #[must_use]
    pub fn parse(s: &str) -> Option<SockAddr> {
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Some(match sa {
                SocketAddr::V4(v4) => SockAddr::V4 {
                    host: *v4.ip(),
                    port: v4.port(),
                },
                SocketAddr::V6(v6) => SockAddr::V6 {
                    host: *v6.ip(),
                    port: v6.port(),
                },
            });
        }
        match s.parse::<IpAddr>().ok()? {
            IpAddr::V4(host) => Some(SockAddr::V4 { host, port: 0 }),
            IpAddr::V6(host) => Some(SockAddr::V6 { host, port: 0 }),
        }
    }

    /// A UNIX address for `path`. Fails when the path does not fit into
    /// `sun_path` with its terminating NUL.
    #[must_use]
    pub fn unix(path: impl AsRef<Path>) -> Option<SockAddr> {
        let path = path.as_ref();
        if path.as_os_str().as_bytes().len() >= SUN_PATH_MAX {
            return None;
        }
        Some(SockAddr::Unix {
            path: path.to_path_buf(),
        })
    }

    /// An all-zero address of the given address family.
    #[must_use]
    pub fn for_family(family: c_int) -> Option<SockAddr> {
        match family {
            AF_INET => Some(SockAddr::V4 {
                host: Ipv4Addr::UNSPECIFIED,
                port: 0,
            }),
            AF_INET6 => Some(SockAddr::V6 {
                host: Ipv6Addr::UNSPECIFIED,
                port: 0,
            }),
            _ => None,
        }
    }

    /// The OS address family constant.
    #[must_use]
    pub fn family(&self) -> c_int {
        match self {
            SockAddr::V4 { .. } => AF_INET,
            SockAddr::V6 { .. } => AF_INET6,
            SockAddr::Unix { .. } => AF_UNIX,
        }
    }

    /// Whether the host is in 127.0.0.0/8 or is ::1.
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        match self {
            SockAddr::V4 { host, .. } => host.octets()[0] == 127,
            SockAddr::V6 { host, .. } => *host == Ipv6Addr::LOCALHOST,
            SockAddr::Unix { .. } => false,
        }
    }

    /// Textual host form, absent for UNIX addresses.
    #[must_use]
    pub fn host_str(&self) -> Option<String> {
        match self {
            SockAddr::V4 { host, .. } => Some(host.to_string()),
            SockAddr::V6 { host, .. } => Some(host.to_string()),
            SockAddr::Unix { .. } => None,
        }
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self {
            SockAddr::V4 { port, .. } | SockAddr::V6 { port, .. } => Some(*port),
            SockAddr::Unix { .. } => None,
        }
    }

    #[must_use]
    pub fn port_str(&self) -> Option<String> {
        self.port().map(|p| p.to_string())
    }

    /// The filesystem path of a UNIX address.
    #[must_use]
    pub fn sockpath(&self) -> Option<&Path> {
        match self {
            SockAddr::Unix { path } => Some(path.as_path()),
            _ => None,
        }
    }

    /// Set the port; no-op returning false on UNIX addresses.
    pub fn set_port(&mut self, new_port: u16) -> bool {
        match self {
            SockAddr::V4 { port, .. } | SockAddr::V6 { port, .. } => {
                *port = new_port;
                true
            }
            SockAddr::Unix { .. } => false,
        }
    }

    /// Copy the host of a same-family address, leaving the port alone.
    /// Used to propagate a loopback host from a template address.
    pub fn set_host_from(&mut self, template: &SockAddr) -> bool {
        match (self, template) {
            (SockAddr::V4 { host, .. }, SockAddr::V4 { host: other, .. }) => {
                *host = *other;
                true
            }
            (SockAddr::V6 { host, .. }, SockAddr::V6 { host: other, .. }) => {
                *host = *other;
                true
            }
            _ => false,
        }
    }

    /// Derive the host deterministically from peer credentials.
    pub fn set_host_creds(&mut self, cred: PeerCred) -> bool {
        match self {
            SockAddr::V4 { host, .. } => {
                let bits = 0xF << 28
                    | (cred.uid & 0x7F) << 21
                    | (cred.gid & 0x3F) << 15
                    | (cred.pid & 0x7FFF);
                *host = Ipv4Addr::from(bits);
                true
            }
            SockAddr::V6 { host, .. } => {
                let bits = (u128::from(cred.uid) << 64)
                    | (u128::from(cred.gid) << 32)
                    | u128::from(cred.pid);
                *host = Ipv6Addr::from(bits);
                true
            }
            SockAddr::Unix { .. } => false,
        }
    }

    /// Pick a fresh non-loopback host at random.
    pub fn set_random_host(&mut self) -> bool {
        match self {
            SockAddr::V4 { host, .. } => {
                let bits = 0xF << 28 | (rand::random::<u32>() & 0x0FFF_FFFF);
                *host = Ipv4Addr::from(bits);
                true
            }
            SockAddr::V6 { host, .. } => {
                let bits = rand::random::<u128>() & ((1u128 << 96) - 1);
                *host = Ipv6Addr::from(bits);
                true
            }
            SockAddr::Unix { .. } => false,
        }
    }

    /// The number of meaningful bytes in the raw encoding.
    #[must_use]
    pub fn size(&self) -> socklen_t {
        match self {
            SockAddr::V4 { .. } => mem::size_of::<sockaddr_in>() as socklen_t,
            SockAddr::V6 { .. } => mem::size_of::<sockaddr_in6>() as socklen_t,
            SockAddr::Unix { path } => {
                // family field + path bytes + NUL
                (mem::size_of::<sa_family_t>() + path.as_os_str().as_bytes().len() + 1) as socklen_t
            }
        }
    }

    /// Encode into a raw `sockaddr_storage` suitable for real calls.
    #[must_use]
    pub fn to_raw(&self) -> (sockaddr_storage, socklen_t) {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        match self {
            SockAddr::V4 { host, port } => {
                let sin = unsafe { &mut *(&mut storage as *mut sockaddr_storage).cast::<sockaddr_in>() };
                sin.sin_family = AF_INET as sa_family_t;
                sin.sin_port = port.to_be();
                sin.sin_addr.s_addr = u32::from(*host).to_be();
            }
            SockAddr::V6 { host, port } => {
                let sin6 =
                    unsafe { &mut *(&mut storage as *mut sockaddr_storage).cast::<sockaddr_in6>() };
                sin6.sin6_family = AF_INET6 as sa_family_t;
                sin6.sin6_port = port.to_be();
                sin6.sin6_addr.s6_addr = host.octets();
            }
            SockAddr::Unix { path } => {
                let sun = unsafe { &mut *(&mut storage as *mut sockaddr_storage).cast::<sockaddr_un>() };
                sun.sun_family = AF_UNIX as sa_family_t;
                let bytes = path.as_os_str().as_bytes();
                for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                    *dst = *src as libc::c_char;
                }
            }
        }
        (storage, self.size())
    }

    /// Decode a raw sockaddr buffer handed in by the target program or the
    /// kernel. Returns `None` for foreign families, truncated buffers, and
    /// unnamed or abstract UNIX addresses (those carry no usable path).
    ///
    /// # Safety
    ///
    /// `addr` must point to at least `len` valid bytes, or be null.
    pub unsafe fn from_raw(addr: *const sockaddr, len: socklen_t) -> Option<SockAddr> {
        if addr.is_null() || (len as usize) < mem::size_of::<sa_family_t>() {
            return None;
        }
        match c_int::from((*addr).sa_family) {
            AF_INET => {
                if (len as usize) < mem::size_of::<sockaddr_in>() {
                    return None;
                }
                let sin = &*addr.cast::<sockaddr_in>();
                Some(SockAddr::V4 {
                    host: Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                    port: u16::from_be(sin.sin_port),
                })
            }
            AF_INET6 => {
                if (len as usize) < mem::size_of::<sockaddr_in6>() {
                    return None;
                }
                let sin6 = &*addr.cast::<sockaddr_in6>();
                Some(SockAddr::V6 {
                    host: Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    port: u16::from_be(sin6.sin6_port),
                })
            }
            AF_UNIX => {
                let offset = mem::size_of::<sa_family_t>();
                if (len as usize) <= offset {
                    return None; // unnamed
                }
                let sun = &*addr.cast::<sockaddr_un>();
                let avail = (len as usize - offset).min(sun.sun_path.len());
                let raw = &sun.sun_path[..avail];
                if raw.first() == Some(&0) {
                    return None; // abstract namespace
                }
                let end = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
                let bytes: Vec<u8> = raw[..end].iter().map(|&c| c as u8).collect();
                Some(SockAddr::Unix {
                    path: PathBuf::from(std::ffi::OsString::from_vec(bytes)),
                })
            }
            _ => None,
        }
    }

    /// Write this address into an out-parameter pair following the kernel
    /// convention: copy at most `*out_len` bytes, then store the full size
    /// in `*out_len`. Null pointers are tolerated and ignored.
    ///
    /// # Safety
    ///
    /// `out` must point to at least `*out_len` writable bytes and `out_len`
    /// to a writable `socklen_t`, or both may be null.
    pub unsafe fn apply_to_raw(&self, out: *mut sockaddr, out_len: *mut socklen_t) {
        if out.is_null() || out_len.is_null() {
            return;
        }
        let (storage, size) = self.to_raw();
        let copy = (*out_len).min(size) as usize;
        std::ptr::copy_nonoverlapping(
            (&storage as *const sockaddr_storage).cast::<u8>(),
            out.cast::<u8>(),
            copy,
        );
        *out_len = size;
    }
}

//! Interface to externally-supplied pre-bound listening sockets.
//!
//! The bookkeeping of systemd-style activation fds lives outside the core;
//! what the core needs is a single question: "is there a pre-bound UNIX fd
//! for this rule?". The collaborator registers an adopter at startup and
//! the intercept surface queries it when a matching rule asks for socket
//! activation. With no adopter installed the answer is always no.

use crate::rule::Rule;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

/// Resolver from a rule to a pre-bound UNIX fd.
pub type AdoptFn = fn(&Rule) -> Option<RawFd>;

static ADOPTER: Mutex<Option<AdoptFn>> = Mutex::new(None);

/// Install the process-wide adopter.
pub fn set_adopter(f: AdoptFn) {
    *ADOPTER.lock().unwrap_or_else(|e| e.into_inner()) = Some(f);
}

/// Ask the installed adopter for a pre-bound fd matching `rule`.
#[must_use]
pub fn adopt(rule: &Rule) -> Option<RawFd> {
    let adopter = *ADOPTER.lock().unwrap_or_else(|e| e.into_inner());
    adopter.and_then(|f| f(rule))
}

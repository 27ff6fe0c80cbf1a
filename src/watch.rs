//! File-descriptor interest tokens handed to host event loops.

use std::{
    fmt,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use enumflags2::{bitflags, BitFlags};

/// Conditions a watch can wait for or report.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WatchFlags {
    /// The fd is readable.
    Readable = 0x1,
    /// The fd is writable.
    Writable = 0x2,
    /// An error condition on the fd. Only valid as a reported condition.
    Error = 0x4,
    /// The peer hung up. Only valid as a reported condition.
    Hangup = 0x8,
}

/// A single fd-of-interest token.
///
/// The connection hands one watch per direction to the host loop through the
/// add/remove/toggled hooks. The host polls the fd for the watch's flags
/// while [`Watch::enabled`] holds and reports readiness back through
/// `Connection::handle_watch`. Watches are cheap clones sharing one state.
#[derive(Clone)]
pub struct Watch {
    inner: Arc<WatchInner>,
}

struct WatchInner {
    fd: RawFd,
    flags: BitFlags<WatchFlags>,
    enabled: AtomicBool,
}

impl Watch {
    pub(crate) fn new(fd: RawFd, flags: BitFlags<WatchFlags>, enabled: bool) -> Self {
        Self {
            inner: Arc::new(WatchInner {
                fd,
                flags,
                enabled: AtomicBool::new(enabled),
            }),
        }
    }

    /// The fd to poll.
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// The conditions of interest.
    pub fn flags(&self) -> BitFlags<WatchFlags> {
        self.inner.flags
    }

    /// Whether the host should currently poll this watch.
    ///
    /// Re-read this after every toggled notification.
    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Flip the enabled state; returns whether it changed.
    pub(crate) fn set_enabled(&self, enabled: bool) -> bool {
        self.inner.enabled.swap(enabled, Ordering::AcqRel) != enabled
    }

    /// Identity comparison: two clones of the same watch.
    pub fn same_as(&self, other: &Watch) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("fd", &self.inner.fd)
            .field("flags", &self.inner.flags)
            .field("enabled", &self.enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_reports_changes() {
        let watch = Watch::new(3, WatchFlags::Readable.into(), true);
        assert!(watch.enabled());
        assert!(watch.set_enabled(false));
        assert!(!watch.set_enabled(false));
        assert!(!watch.enabled());

        let clone = watch.clone();
        assert!(clone.same_as(&watch));
        clone.set_enabled(true);
        assert!(watch.enabled());
    }
}

//! A reference event loop.
//!
//! Drives one or more connections through nothing but the public watch,
//! timeout and dispatch-status contract, the way a glib or calloop adapter
//! would. Real programs with their own loop integrate the same three hooks;
//! this one exists for tests and simple blocking programs.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::trace;

use crate::{
    connection::{Connection, DispatchStatus},
    timeout::Timeout,
    watch::{Watch, WatchFlags},
    Result,
};

/// How long to back off when a dispatch reports memory exhaustion.
const OOM_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Registrations {
    watches: Vec<Watch>,
    timeouts: Vec<Timeout>,
}

/// A poll-based loop over a set of connections.
pub struct MainLoop {
    connections: Vec<Connection>,
    registrations: Arc<Mutex<Registrations>>,
}

impl MainLoop {
    pub fn new() -> Self {
        Self {
            connections: Vec::new(),
            registrations: Arc::new(Mutex::new(Registrations::default())),
        }
    }

    /// Attach `conn`, wiring its watch and timeout hooks into this loop.
    pub fn add_connection(&mut self, conn: &Connection) -> Result<()> {
        let regs = self.registrations.clone();
        let regs_remove = self.registrations.clone();
        conn.set_watch_functions(
            move |watch| {
                if let Ok(mut regs) = regs.lock() {
                    regs.watches.push(watch.clone());
                }
            },
            move |watch| {
                if let Ok(mut regs) = regs_remove.lock() {
                    regs.watches.retain(|w| !w.same_as(watch));
                }
            },
            // Enabled state is re-read from the watch on every iteration,
            // so toggles need no bookkeeping here.
            |_| {},
        )?;

        let regs = self.registrations.clone();
        let regs_remove = self.registrations.clone();
        conn.set_timeout_functions(
            move |timeout| {
                if let Ok(mut regs) = regs.lock() {
                    regs.timeouts.push(timeout.clone());
                }
            },
            move |timeout| {
                if let Ok(mut regs) = regs_remove.lock() {
                    regs.timeouts.retain(|t| !t.same_as(timeout));
                }
            },
        )?;

        self.connections.push(conn.clone());
        Ok(())
    }

    /// One poll-dispatch round. With `block`, sleeps until an fd is ready
    /// or the nearest timeout expires; otherwise returns immediately after
    /// handling whatever is ready now. Returns false when no connection is
    /// left alive.
    pub fn iterate(&mut self, block: bool) -> bool {
        self.connections.retain(|c| c.is_connected());
        if self.connections.is_empty() {
            return false;
        }

        let (watches, timeouts) = {
            let regs = match self.registrations.lock() {
                Ok(regs) => regs,
                Err(_) => return false,
            };
            (
                regs.watches
                    .iter()
                    .filter(|w| w.enabled())
                    .cloned()
                    .collect::<Vec<_>>(),
                regs.timeouts
                    .iter()
                    .filter(|t| t.enabled())
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        };

        let now = Instant::now();
        let nearest_deadline = timeouts.iter().filter_map(|t| t.deadline()).min();
        let poll_ms: i32 = if !block {
            0
        } else {
            match nearest_deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(now)
                    .as_millis()
                    .clamp(1, 1000) as i32,
                None => 1000,
            }
        };

        let mut pollfds: Vec<libc::pollfd> = watches
            .iter()
            .map(|w| libc::pollfd {
                fd: w.fd(),
                events: {
                    let mut events = 0;
                    if w.flags().contains(WatchFlags::Readable) {
                        events |= libc::POLLIN;
                    }
                    if w.flags().contains(WatchFlags::Writable) {
                        events |= libc::POLLOUT;
                    }
                    events
                },
                revents: 0,
            })
            .collect();

        if !pollfds.is_empty() {
            unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    poll_ms,
                );
            }
        } else if block {
            std::thread::sleep(Duration::from_millis(poll_ms.max(1) as u64));
        }

        // Expired timeouts first, so a timed-out call is not outraced by a
        // reply in the same iteration having slept past its deadline.
        let now = Instant::now();
        for timeout in &timeouts {
            if timeout.is_expired(now) {
                trace!("firing expired timeout");
                for conn in &self.connections {
                    conn.handle_timeout(timeout);
                }
            }
        }

        for (watch, pollfd) in watches.iter().zip(&pollfds) {
            let mut condition = enumflags2::BitFlags::<WatchFlags>::empty();
            if pollfd.revents & libc::POLLIN != 0 {
                condition |= WatchFlags::Readable;
            }
            if pollfd.revents & libc::POLLOUT != 0 {
                condition |= WatchFlags::Writable;
            }
            if pollfd.revents & libc::POLLERR != 0 {
                condition |= WatchFlags::Error;
            }
            if pollfd.revents & libc::POLLHUP != 0 {
                condition |= WatchFlags::Hangup;
            }
            if condition.is_empty() {
                continue;
            }

            for conn in &self.connections {
                let _ = conn.handle_watch(watch, condition);
            }
        }

        for conn in &self.connections {
            loop {
                match conn.dispatch() {
                    DispatchStatus::DataRemains => continue,
                    DispatchStatus::NeedMemory => {
                        std::thread::sleep(OOM_BACKOFF);
                        break;
                    }
                    DispatchStatus::Complete => break,
                }
            }
        }

        true
    }

    /// Iterate until `predicate` holds or every connection is gone.
    /// Returns whether the predicate was satisfied.
    pub fn run_until(&mut self, mut predicate: impl FnMut() -> bool) -> bool {
        loop {
            if predicate() {
                return true;
            }
            if !self.iterate(true) {
                return false;
            }
        }
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

//! Completion fences.
//!
//! A `Fence` is a set of sync points; it is signalled once every point is.
//! Points are either software timeline points (`FenceSignal`) or sync-file
//! descriptors handed over by a driver, which become readable when they
//! signal. Merging unions the point sets, so a merged fence completes no
//! earlier than any of its inputs.

use super::handle::OwnedHandle;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct TimelinePoint {
    signaled: Mutex<bool>,
    cond: Condvar,
}

enum SyncPoint {
    Timeline(Arc<TimelinePoint>),
    File(Arc<OwnedHandle>),
}

impl SyncPoint {
    fn same_as(&self, other: &SyncPoint) -> bool {
        match (self, other) {
            (SyncPoint::Timeline(a), SyncPoint::Timeline(b)) => Arc::ptr_eq(a, b),
            (SyncPoint::File(a), SyncPoint::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn duplicate(&self) -> SyncPoint {
        match self {
            SyncPoint::Timeline(p) => SyncPoint::Timeline(Arc::clone(p)),
            SyncPoint::File(f) => SyncPoint::File(Arc::clone(f)),
        }
    }

    /// `None` waits forever.
    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        match self {
            SyncPoint::Timeline(point) => {
                let mut signaled = point.signaled.lock();
                while !*signaled {
                    match deadline {
                        Some(deadline) => {
                            if point.cond.wait_until(&mut signaled, deadline).timed_out() {
                                return *signaled;
                            }
                        }
                        None => point.cond.wait(&mut signaled),
                    }
                }
                true
            }
            SyncPoint::File(fd) => poll_readable(fd.as_raw(), deadline),
        }
    }
}

fn poll_readable(fd: i32, deadline: Option<Instant>) -> bool {
    if fd < 0 {
        return true;
    }
    loop {
        let timeout_ms: i32 = match deadline {
            None => -1,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                left.as_millis().min(i32::MAX as u128) as i32
            }
        };
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret > 0 {
            return pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLNVAL) != 0;
        }
        if ret == 0 {
            return false;
        }
        if std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
            log::warn!("fence poll on fd {fd} failed: {}", std::io::Error::last_os_error());
            return false;
        }
    }
}

/// Opaque completion handle; cheap to clone.
#[derive(Default)]
pub struct Fence {
    points: Vec<SyncPoint>,
}

impl Clone for Fence {
    fn clone(&self) -> Self {
        Fence {
            points: self.points.iter().map(SyncPoint::duplicate).collect(),
        }
    }
}

impl Fence {
    /// A fence with nothing to wait for.
    pub fn invalid() -> Self {
        Fence { points: Vec::new() }
    }

    /// Wrap a sync-file descriptor. An invalid handle yields an invalid fence.
    pub fn from_handle(handle: OwnedHandle) -> Self {
        if !handle.is_valid() {
            return Fence::invalid();
        }
        Fence {
            points: vec![SyncPoint::File(Arc::new(handle))],
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.points.is_empty()
    }

    /// Combine two fences into one that signals once both have.
    pub fn merge(a: &Fence, b: &Fence) -> Fence {
        let mut merged = a.clone();
        for point in &b.points {
            if !merged.points.iter().any(|p| p.same_as(point)) {
                merged.points.push(point.duplicate());
            }
        }
        merged
    }

    /// Block until signalled or `timeout` elapses. `None` waits indefinitely.
    /// Returns true when every sync point signalled.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.points.iter().all(|p| p.wait_until(deadline))
    }

    pub fn is_signaled(&self) -> bool {
        self.wait(Some(Duration::ZERO))
    }

    /// Number of distinct sync points carried.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// First sync-file descriptor carried, if any. Used by the transport,
    /// which can only move file-backed points across processes.
    pub fn file_handle(&self) -> Option<&OwnedHandle> {
        self.points.iter().find_map(|p| match p {
            SyncPoint::File(fd) => Some(fd.as_ref()),
            SyncPoint::Timeline(_) => None,
        })
    }
}

/// Producer side of a software timeline point.
pub struct FenceSignal {
    point: Arc<TimelinePoint>,
}

impl Default for FenceSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceSignal {
    pub fn new() -> Self {
        Self {
            point: Arc::new(TimelinePoint {
                signaled: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// A fence that completes when `signal` is called.
    pub fn fence(&self) -> Fence {
        Fence {
            points: vec![SyncPoint::Timeline(Arc::clone(&self.point))],
        }
    }

    pub fn signal(&self) {
        let mut signaled = self.point.signaled.lock();
        *signaled = true;
        self.point.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.point.signaled.lock()
    }
}

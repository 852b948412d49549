// Exclusive audio hardware handles
//
// The microphone and the audio output are each owned by at most one holder
// at a time. Holders receive an owned guard; dropping the guard releases the
// handle on every exit path, including task cancellation.
//
// The registry also tracks whether capture and playback are live so that
// any overlap between the two is recorded and logged.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Microphone,
    Output,
}

#[derive(Debug, Default)]
pub struct AudioDevices {
    microphone: Arc<Mutex<()>>,
    output: Arc<Mutex<()>>,
    capture_active: AtomicBool,
    playback_active: AtomicBool,
    overlaps: AtomicUsize,
}

impl AudioDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire a device handle without waiting. Returns `None` if it is held.
    pub fn try_acquire(self: &Arc<Self>, kind: DeviceKind) -> Option<DeviceGuard> {
        let lock = match kind {
            DeviceKind::Microphone => &self.microphone,
            DeviceKind::Output => &self.output,
        };

        let handle = Arc::clone(lock).try_lock_owned().ok()?;
        self.mark(kind, true);
        debug!("{:?} handle acquired", kind);

        Some(DeviceGuard {
            devices: Arc::clone(self),
            kind,
            _handle: handle,
        })
    }

    pub fn capture_active(&self) -> bool {
        self.capture_active.load(Ordering::SeqCst)
    }

    pub fn playback_active(&self) -> bool {
        self.playback_active.load(Ordering::SeqCst)
    }

    /// Number of times capture and playback were observed live together
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn mark(&self, kind: DeviceKind, active: bool) {
        let (flag, other) = match kind {
            DeviceKind::Microphone => (&self.capture_active, &self.playback_active),
            DeviceKind::Output => (&self.playback_active, &self.capture_active),
        };

        flag.store(active, Ordering::SeqCst);

        if active && other.load(Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
            error!("Capture and playback active at the same time ({:?} acquired)", kind);
        }
    }
}

/// Owned device handle, released on drop
pub struct DeviceGuard {
    devices: Arc<AudioDevices>,
    kind: DeviceKind,
    _handle: OwnedMutexGuard<()>,
}

impl DeviceGuard {
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.devices.mark(self.kind, false);
        debug!("{:?} handle released", self.kind);
    }
}

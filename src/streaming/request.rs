//! Request plumbing shared by the loader threads
//!
//! A request pairs a [`DataLoader`] (where the bytes come from) with a
//! [`DataProcessor`] (what they become on the device). Both are owned by the
//! request while it moves through the queues and are dropped exactly once,
//! when the graphics thread finishes it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{Error, Result, ResultCode};

/// Outcome of trying to reserve a device object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStatus {
    Locked,
    /// Nothing available right now; the request is retried on a later drain
    TryAgain,
}

/// Source of a resource's bytes.
///
/// `load` runs on the I/O thread, `decompress` on a processing thread.
pub trait DataLoader: Send {
    /// Name used in log output
    fn name(&self) -> &str;

    /// Fetch the raw (possibly compressed) bytes
    fn load(&mut self) -> Result<()>;

    /// Uncompressed payload bytes. Only called after a successful `load`.
    fn decompress(&mut self) -> Result<&[u8]>;
}

/// Turns payload bytes into a device resource.
///
/// `process` runs on a processing thread, `copy_to_resource` on the I/O
/// thread, and the lock/unlock pair on the graphics thread.
pub trait DataProcessor: Send {
    /// Parse and validate the payload, keeping whatever the later stages need
    fn process(&mut self, data: &[u8]) -> Result<()>;

    /// Reserve a device object and writable staging memory for it
    fn lock_device_object(&mut self) -> Result<LockStatus>;

    /// Fill the staging memory reserved by `lock_device_object`
    fn copy_to_resource(&mut self) -> Result<()>;

    /// Upload the staged bytes and publish the object
    fn unlock_device_object(&mut self) -> Result<()>;

    /// Publish the error sentinel and give back anything reserved.
    /// May be called more than once.
    fn set_resource_error(&mut self);
}

/// State of a resource a caller is waiting on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState<T> {
    Pending,
    Ready(T),
    Error,
}

/// Caller-visible output of a processor.
///
/// Cloning shares the slot; the processor writes it from the graphics (or
/// I/O) thread and the caller polls it.
#[derive(Debug)]
pub struct ResourceSlot<T> {
    state: Arc<Mutex<ResourceState<T>>>,
}

impl<T> Clone for ResourceSlot<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Copy> ResourceSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ResourceState::Pending)),
        }
    }

    pub fn state(&self) -> ResourceState<T> {
        *self.state.lock()
    }

    pub fn ready(&self) -> Option<T> {
        match *self.state.lock() {
            ResourceState::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), ResourceState::Pending)
    }

    pub fn is_error(&self) -> bool {
        matches!(*self.state.lock(), ResourceState::Error)
    }

    pub fn set_ready(&self, value: T) {
        *self.state.lock() = ResourceState::Ready(value);
    }

    pub fn set_error(&self) {
        *self.state.lock() = ResourceState::Error;
    }

    /// Take the loaded value, leaving the slot pending
    pub fn take(&self) -> Option<T> {
        let mut state = self.state.lock();
        match *state {
            ResourceState::Ready(value) => {
                *state = ResourceState::Pending;
                Some(value)
            }
            _ => None,
        }
    }
}

impl<T: Copy> Default for ResourceSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Final result code of a request, written once by the graphics thread
#[derive(Clone, Debug, Default)]
pub struct ResultSlot {
    code: Arc<Mutex<Option<ResultCode>>>,
}

impl ResultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the request has finished
    pub fn get(&self) -> Option<ResultCode> {
        *self.code.lock()
    }

    pub fn is_done(&self) -> bool {
        self.code.lock().is_some()
    }

    pub(crate) fn set(&self, code: ResultCode) {
        *self.code.lock() = Some(code);
    }
}

/// Which I/O step a request is waiting for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IoStage {
    Read,
    Copy,
}

/// Which graphics step a request is waiting for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RenderStage {
    Lock,
    Unlock,
}

/// One in-flight resource request
pub(crate) struct ResourceRequest {
    pub loader: Box<dyn DataLoader>,
    pub processor: Box<dyn DataProcessor>,
    pub result: Option<ResultSlot>,
    pub io_stage: IoStage,
    pub render_stage: RenderStage,
    /// First failure; later stages skip their work once set
    pub error: Option<ResultCode>,
    pub lock_attempts: u32,
}

impl ResourceRequest {
    pub fn new(
        loader: Box<dyn DataLoader>,
        processor: Box<dyn DataProcessor>,
        result: Option<ResultSlot>,
    ) -> Self {
        Self {
            loader,
            processor,
            result,
            io_stage: IoStage::Read,
            render_stage: RenderStage::Lock,
            error: None,
            lock_attempts: 0,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Record a failure. The first error wins.
    pub fn fail(&mut self, stage: &str, err: Error) {
        log::warn!("{} failed for '{}': {}", stage, self.loader.name(), err);
        if self.error.is_none() {
            self.error = Some(err.code());
        }
    }
}

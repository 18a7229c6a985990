//! Three-stage asynchronous loader
//!
//! Requests move through three FIFO queues:
//!
//! ```text
//! submit -> [IO] load -> [Process] decompress+process -> [Render] lock
//!        -> [IO] copy_to_resource -> [Render] unlock + result
//! ```
//!
//! One I/O thread serves the I/O queue, a configurable number of threads
//! serve the process queue, and the render queue is drained by whoever calls
//! [`AsyncLoader::process_device_work_items`] (the graphics thread). A failed
//! request keeps flowing through the remaining stages with its work skipped,
//! so every request reaches the final stage and its loader and processor are
//! dropped exactly once, there.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::core::{Error, Result, ResultCode, StreamingConfig};
use crate::streaming::request::{
    DataLoader, DataProcessor, IoStage, LockStatus, RenderStage, ResourceRequest, ResultSlot,
};

/// Pause between drains while waiting for all items
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Loader counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub lock_retries: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    lock_retries: AtomicU64,
}

fn forward(tx: &Sender<ResourceRequest>, request: ResourceRequest) {
    if let Err(e) = tx.send(request) {
        log::debug!("Loader shutting down, dropping '{}'", e.0.loader.name());
    }
}

// Thread that takes requests out of its queue until the finish channel is signalled
struct WorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl WorkerThread {
    fn spawn<F>(name: String, request_rx: Receiver<ResourceRequest>, mut handle: F) -> Result<Self>
    where
        F: FnMut(ResourceRequest) + Send + 'static,
    {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded::<()>(1);
        let join_handle = std::thread::Builder::new().name(name).spawn(move || {
            loop {
                crossbeam_channel::select! {
                    recv(request_rx) -> msg => match msg {
                        Ok(request) => handle(request),
                        Err(_) => return,
                    },
                    recv(finish_rx) -> _msg => return,
                }
            }
        })?;

        Ok(Self { finish_tx, join_handle })
    }
}

fn io_stage(request: ResourceRequest, process_tx: &Sender<ResourceRequest>, render_tx: &Sender<ResourceRequest>) {
    let mut request = request;
    match request.io_stage {
        IoStage::Read => {
            if let Err(e) = request.loader.load() {
                request.fail("Load", e);
            }
            forward(process_tx, request);
        }
        IoStage::Copy => {
            if request.failed() {
                request.processor.set_resource_error();
            } else if let Err(e) = request.processor.copy_to_resource() {
                request.fail("Copy", e);
                request.processor.set_resource_error();
            }
            request.render_stage = RenderStage::Unlock;
            forward(render_tx, request);
        }
    }
}

fn process_stage(request: ResourceRequest, render_tx: &Sender<ResourceRequest>) {
    let mut request = request;
    if !request.failed() {
        let ResourceRequest { loader, processor, .. } = &mut request;
        let outcome = loader.decompress().and_then(|data| processor.process(data));
        if let Err(e) = outcome {
            request.fail("Process", e);
        }
    }
    request.render_stage = RenderStage::Lock;
    forward(render_tx, request);
}

/// Asynchronous loader with one I/O thread, N processing threads and a
/// render queue drained by the caller
pub struct AsyncLoader {
    io_tx: Sender<ResourceRequest>,
    render_tx: Sender<ResourceRequest>,
    render_rx: Receiver<ResourceRequest>,
    workers: Vec<WorkerThread>,
    outstanding: Arc<AtomicUsize>,
    counters: Counters,
    max_lock_retries: Option<u32>,
}

impl AsyncLoader {
    /// Start the loader threads
    pub fn new(config: &StreamingConfig) -> Result<Self> {
        config.validate()?;

        let (io_tx, io_rx) = crossbeam_channel::unbounded::<ResourceRequest>();
        let (process_tx, process_rx) = crossbeam_channel::unbounded::<ResourceRequest>();
        let (render_tx, render_rx) = crossbeam_channel::unbounded::<ResourceRequest>();

        let mut workers = Vec::with_capacity(config.processing_threads + 1);
        {
            let process_tx = process_tx.clone();
            let render_tx = render_tx.clone();
            workers.push(WorkerThread::spawn("IO Thread".into(), io_rx, move |request| {
                io_stage(request, &process_tx, &render_tx)
            })?);
        }
        for thread_index in 0..config.processing_threads {
            let render_tx = render_tx.clone();
            workers.push(WorkerThread::spawn(
                format!("Processing Thread {}", thread_index),
                process_rx.clone(),
                move |request| process_stage(request, &render_tx),
            )?);
        }

        log::info!(
            "Async loader started with {} processing thread(s), lock retries: {:?}",
            config.processing_threads,
            config.max_lock_retries
        );

        Ok(Self {
            io_tx,
            render_tx,
            render_rx,
            workers,
            outstanding: Arc::new(AtomicUsize::new(0)),
            counters: Counters::default(),
            max_lock_retries: config.max_lock_retries,
        })
    }

    /// Queue a request. Its result code (if a slot is given) is written once
    /// the request has gone through every stage.
    pub fn submit(
        &self,
        loader: Box<dyn DataLoader>,
        processor: Box<dyn DataProcessor>,
        result: Option<ResultSlot>,
    ) -> Result<()> {
        log::trace!("Submitting '{}'", loader.name());
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if self.io_tx.send(ResourceRequest::new(loader, processor, result)).is_err() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Service up to `max_items` requests from the render queue.
    ///
    /// Takes the batch first and then works on it, so requests that ask to
    /// be retried land behind everything already queued and are serviced by
    /// a later call. Must only be called from the graphics thread. Returns
    /// the number of requests serviced.
    pub fn process_device_work_items(&self, max_items: usize) -> usize {
        let mut batch = Vec::new();
        while batch.len() < max_items {
            match self.render_rx.try_recv() {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }

        let serviced = batch.len();
        for request in batch {
            self.service(request);
        }
        serviced
    }

    /// Drain until every submitted request has finished
    pub fn wait_for_all_items(&self) {
        loop {
            self.process_device_work_items(usize::MAX);
            if self.outstanding() == 0 {
                return;
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Requests submitted but not finished yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Requests currently waiting for the graphics thread
    pub fn render_queue_len(&self) -> usize {
        self.render_rx.len()
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            lock_retries: self.counters.lock_retries.load(Ordering::Relaxed),
        }
    }

    fn service(&self, mut request: ResourceRequest) {
        match request.render_stage {
            RenderStage::Lock => {
                if !request.failed() {
                    match request.processor.lock_device_object() {
                        Ok(LockStatus::Locked) => {}
                        Ok(LockStatus::TryAgain) => {
                            request.lock_attempts += 1;
                            self.counters.lock_retries.fetch_add(1, Ordering::Relaxed);
                            match self.max_lock_retries {
                                Some(max) if request.lock_attempts > max => {
                                    request.fail("Lock", Error::PoolExhausted(request.lock_attempts));
                                }
                                _ => {
                                    forward(&self.render_tx, request);
                                    return;
                                }
                            }
                        }
                        Err(e) => request.fail("Lock", e),
                    }
                }
                request.io_stage = IoStage::Copy;
                forward(&self.io_tx, request);
            }
            RenderStage::Unlock => self.finish(request),
        }
    }

    fn finish(&self, mut request: ResourceRequest) {
        if !request.failed() {
            if let Err(e) = request.processor.unlock_device_object() {
                request.fail("Unlock", e);
                request.processor.set_resource_error();
            }
        }

        let code = request.error.unwrap_or(ResultCode::Ok);
        if let Some(slot) = &request.result {
            slot.set(code);
        }
        if code.is_ok() {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }

        drop(request);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        for worker in &self.workers {
            let _ = worker.finish_tx.send(());
        }
        for worker in self.workers.drain(..) {
            if worker.join_handle.join().is_err() {
                log::error!("Loader thread panicked");
            }
        }
        let pending = self.outstanding();
        if pending > 0 {
            log::warn!("Async loader dropped with {} request(s) in flight", pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDevice;
    use crate::device::{GpuDevice, TextureDesc, TextureFormat, TextureHandle};
    use crate::streaming::cache::ResourceReuseCache;
    use crate::streaming::disk_io::PackedFileBuilder;
    use crate::streaming::loaders::{MemoryDataLoader, PackedDataLoader};
    use crate::streaming::packed::{PackedFile, PackedFileOptions};
    use crate::streaming::payload::{self, PayloadShape};
    use crate::streaming::processors::TextureProcessor;
    use crate::streaming::request::{ResourceSlot, ResourceState};
    use parking_lot::Mutex;

    fn config(threads: usize) -> StreamingConfig {
        StreamingConfig {
            processing_threads: threads,
            ..Default::default()
        }
    }

    fn texture_payload(desc: TextureDesc, fill: u8) -> Vec<u8> {
        let body = vec![fill; desc.footprint() as usize];
        payload::encode(PayloadShape::Texture(desc), &body, fill % 2 == 0)
    }

    // --- Scripted test doubles ---

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum FailAt {
        Nowhere,
        Load,
        Decompress,
        Process,
        Lock,
        Copy,
        Unlock,
    }

    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<(usize, &'static str)>>,
        loaders_dropped: AtomicUsize,
        processors_dropped: AtomicUsize,
        resource_errors: AtomicUsize,
    }

    struct ScriptedLoader {
        id: usize,
        name: String,
        fail: FailAt,
        data: Vec<u8>,
        journal: Arc<Journal>,
    }

    impl DataLoader for ScriptedLoader {
        fn name(&self) -> &str {
            &self.name
        }

        fn load(&mut self) -> Result<()> {
            self.journal.events.lock().push((self.id, "load"));
            if self.fail == FailAt::Load {
                return Err(Error::NotFound(self.name.clone()));
            }
            self.data = vec![self.id as u8];
            Ok(())
        }

        fn decompress(&mut self) -> Result<&[u8]> {
            if self.fail == FailAt::Decompress {
                return Err(Error::InvalidData("corrupt".into()));
            }
            Ok(self.data.as_slice())
        }
    }

    impl Drop for ScriptedLoader {
        fn drop(&mut self) {
            self.journal.loaders_dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedProcessor {
        id: usize,
        fail: FailAt,
        try_again: u32,
        journal: Arc<Journal>,
        output: ResourceSlot<u32>,
    }

    impl DataProcessor for ScriptedProcessor {
        fn process(&mut self, data: &[u8]) -> Result<()> {
            assert_eq!(data, &[self.id as u8]);
            self.journal.events.lock().push((self.id, "process"));
            if self.fail == FailAt::Process {
                return Err(Error::InvalidData("bad shape".into()));
            }
            Ok(())
        }

        fn lock_device_object(&mut self) -> Result<LockStatus> {
            if self.try_again > 0 {
                self.try_again -= 1;
                return Ok(LockStatus::TryAgain);
            }
            self.journal.events.lock().push((self.id, "lock"));
            if self.fail == FailAt::Lock {
                return Err(Error::DeviceOutOfMemory);
            }
            Ok(LockStatus::Locked)
        }

        fn copy_to_resource(&mut self) -> Result<()> {
            self.journal.events.lock().push((self.id, "copy"));
            if self.fail == FailAt::Copy {
                return Err(Error::Io(std::io::Error::other("short write")));
            }
            Ok(())
        }

        fn unlock_device_object(&mut self) -> Result<()> {
            self.journal.events.lock().push((self.id, "unlock"));
            if self.fail == FailAt::Unlock {
                return Err(Error::Device("lost".into()));
            }
            self.output.set_ready(self.id as u32);
            Ok(())
        }

        fn set_resource_error(&mut self) {
            self.journal.resource_errors.fetch_add(1, Ordering::SeqCst);
            self.output.set_error();
        }
    }

    impl Drop for ScriptedProcessor {
        fn drop(&mut self) {
            self.journal.processors_dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Scripted {
        output: ResourceSlot<u32>,
        result: ResultSlot,
    }

    fn submit_scripted(loader: &AsyncLoader, journal: &Arc<Journal>, id: usize, fail: FailAt, try_again: u32) -> Scripted {
        let output = ResourceSlot::new();
        let result = ResultSlot::new();
        loader
            .submit(
                Box::new(ScriptedLoader {
                    id,
                    name: format!("item{}", id),
                    fail,
                    data: Vec::new(),
                    journal: journal.clone(),
                }),
                Box::new(ScriptedProcessor {
                    id,
                    fail,
                    try_again,
                    journal: journal.clone(),
                    output: output.clone(),
                }),
                Some(result.clone()),
            )
            .unwrap();
        Scripted { output, result }
    }

    /// Drain until at least `count` requests sit in the render queue
    fn wait_for_render_queue(loader: &AsyncLoader, count: usize) {
        for _ in 0..1000 {
            if loader.render_queue_len() >= count {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("render queue never reached {} items", count);
    }

    #[test]
    fn test_success_stage_order() {
        let loader = AsyncLoader::new(&config(2)).unwrap();
        let journal = Arc::new(Journal::default());
        let item = submit_scripted(&loader, &journal, 1, FailAt::Nowhere, 0);

        loader.wait_for_all_items();

        let events: Vec<_> = journal.events.lock().iter().map(|(_, e)| *e).collect();
        assert_eq!(events, vec!["load", "process", "lock", "copy", "unlock"]);
        assert_eq!(item.result.get(), Some(ResultCode::Ok));
        assert_eq!(item.output.ready(), Some(1));
        assert_eq!(journal.loaders_dropped.load(Ordering::SeqCst), 1);
        assert_eq!(journal.processors_dropped.load(Ordering::SeqCst), 1);
        assert_eq!(loader.stats().completed, 1);
    }

    #[test]
    fn test_load_failure_skips_work() {
        let loader = AsyncLoader::new(&config(1)).unwrap();
        let journal = Arc::new(Journal::default());
        let item = submit_scripted(&loader, &journal, 4, FailAt::Load, 0);

        loader.wait_for_all_items();

        let events: Vec<_> = journal.events.lock().iter().map(|(_, e)| *e).collect();
        assert_eq!(events, vec!["load"]);
        assert_eq!(item.result.get(), Some(ResultCode::NotFound));
        assert_eq!(item.output.state(), ResourceState::Error);
        assert_eq!(journal.processors_dropped.load(Ordering::SeqCst), 1);
        assert_eq!(loader.stats().failed, 1);
    }

    #[test]
    fn test_fifo_with_single_processing_thread() {
        let loader = AsyncLoader::new(&config(1)).unwrap();
        let journal = Arc::new(Journal::default());
        for id in 0..20 {
            submit_scripted(&loader, &journal, id, FailAt::Nowhere, 0);
        }

        wait_for_render_queue(&loader, 20);
        loader.wait_for_all_items();

        let unlocks: Vec<usize> = journal
            .events
            .lock()
            .iter()
            .filter(|(_, e)| *e == "unlock")
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(unlocks, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_bounded_drain_keeps_order() {
        let loader = AsyncLoader::new(&config(1)).unwrap();
        let journal = Arc::new(Journal::default());
        for id in 0..5 {
            submit_scripted(&loader, &journal, id, FailAt::Nowhere, 0);
        }
        wait_for_render_queue(&loader, 5);

        assert_eq!(loader.process_device_work_items(3), 3);
        let locks: Vec<usize> = journal
            .events
            .lock()
            .iter()
            .filter(|(_, e)| *e == "lock")
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(locks, vec![0, 1, 2]);

        // Items 3 and 4 stay ahead of the copies coming back from I/O
        assert_eq!(loader.process_device_work_items(2), 2);
        let locks: Vec<usize> = journal
            .events
            .lock()
            .iter()
            .filter(|(_, e)| *e == "lock")
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(locks, vec![0, 1, 2, 3, 4]);

        loader.wait_for_all_items();
        assert_eq!(loader.stats().completed, 5);
    }

    #[test]
    fn test_try_again_retries_on_later_drain() {
        let loader = AsyncLoader::new(&config(1)).unwrap();
        let journal = Arc::new(Journal::default());
        let item = submit_scripted(&loader, &journal, 9, FailAt::Nowhere, 3);

        wait_for_render_queue(&loader, 1);
        // A retried request is requeued, not serviced twice in one drain
        assert_eq!(loader.process_device_work_items(usize::MAX), 1);
        assert_eq!(loader.render_queue_len(), 1);

        loader.wait_for_all_items();
        assert_eq!(item.result.get(), Some(ResultCode::Ok));
        assert_eq!(loader.stats().lock_retries, 3);
    }

    #[test]
    fn test_lock_retry_limit() {
        let loader = AsyncLoader::new(&StreamingConfig {
            processing_threads: 1,
            max_lock_retries: Some(2),
            ..Default::default()
        })
        .unwrap();
        let journal = Arc::new(Journal::default());
        let item = submit_scripted(&loader, &journal, 2, FailAt::Nowhere, u32::MAX);

        loader.wait_for_all_items();
        assert_eq!(item.result.get(), Some(ResultCode::PoolExhausted));
        assert_eq!(item.output.state(), ResourceState::Error);
        assert_eq!(loader.stats().lock_retries, 3);
    }

    #[test]
    fn test_every_request_dropped_exactly_once() {
        let loader = AsyncLoader::new(&config(3)).unwrap();
        let journal = Arc::new(Journal::default());
        let failures = [
            FailAt::Nowhere,
            FailAt::Load,
            FailAt::Decompress,
            FailAt::Process,
            FailAt::Lock,
            FailAt::Copy,
            FailAt::Unlock,
        ];

        // xorshift keeps the failure pattern reproducible
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut items = Vec::new();
        for id in 0..10_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let fail = failures[(state % failures.len() as u64) as usize];
            let try_again = ((state >> 8) % 3) as u32;
            items.push((fail, submit_scripted(&loader, &journal, id, fail, try_again)));
        }

        loader.wait_for_all_items();

        assert_eq!(journal.loaders_dropped.load(Ordering::SeqCst), 10_000);
        assert_eq!(journal.processors_dropped.load(Ordering::SeqCst), 10_000);
        let mut expected_failures = 0;
        for (fail, item) in &items {
            let code = item.result.get().unwrap();
            if *fail == FailAt::Nowhere {
                assert_eq!(code, ResultCode::Ok);
            } else {
                assert!(!code.is_ok());
                assert_eq!(item.output.state(), ResourceState::Error);
                expected_failures += 1;
            }
        }
        assert_eq!(loader.stats().failed, expected_failures);
        assert_eq!(loader.outstanding(), 0);
    }

    #[test]
    fn test_textures_reuse_pool_under_device_limit() {
        let desc = TextureDesc::new(16, 16, 5, TextureFormat::Rgba8Unorm);
        let bytes = desc.footprint();
        let device = Arc::new(HeadlessDevice::with_memory_limit(80 * bytes));
        let cache = Arc::new(ResourceReuseCache::new(device.clone() as Arc<dyn GpuDevice>, 80 * bytes));
        let loader = AsyncLoader::new(&config(2)).unwrap();

        let mut outputs: Vec<ResourceSlot<TextureHandle>> = Vec::new();
        let mut results = Vec::new();
        for i in 0..100u32 {
            let output = ResourceSlot::new();
            let result = ResultSlot::new();
            loader
                .submit(
                    Box::new(MemoryDataLoader::new(format!("tex{}", i), texture_payload(desc, i as u8))),
                    Box::new(TextureProcessor::new(cache.clone(), output.clone())),
                    Some(result.clone()),
                )
                .unwrap();
            outputs.push(output);
            results.push(result);
        }

        // Consume finished textures and hand them back so waiting requests can reuse them
        let mut consumed = vec![false; 100];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            loader.process_device_work_items(8);
            for (i, output) in outputs.iter().enumerate() {
                if consumed[i] {
                    continue;
                }
                if let Some(handle) = output.ready() {
                    let contents = device.texture_contents(handle).unwrap();
                    assert!(contents.iter().all(|&b| b == i as u8));
                    seen.insert(handle);
                    cache.unuse_texture(handle);
                    consumed[i] = true;
                }
            }
            if loader.outstanding() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(loader.outstanding(), 0);
        assert!(results.iter().all(|r| r.get() == Some(ResultCode::Ok)));
        assert!(consumed.iter().all(|&c| c));
        assert_eq!(device.textures_created(), 80);
        assert_eq!(seen.len(), 80);
        assert_eq!(cache.len(), 80);
        assert!(cache.stats().hits >= 20);
    }

    #[test]
    fn test_missing_packed_resource_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("textures.pack");
        let desc = TextureDesc::new(8, 8, 4, TextureFormat::Rgba8Unorm);

        let mut builder = PackedFileBuilder::new();
        let chunk = builder.add_chunk();
        builder
            .add_resource(chunk, "grass", texture_payload(desc, 42), glam::Vec3::ZERO)
            .unwrap();
        builder.write(&path).unwrap();
        let store = Arc::new(Mutex::new(PackedFile::open(&path, PackedFileOptions::default()).unwrap()));

        let device = Arc::new(HeadlessDevice::new());
        let cache = Arc::new(ResourceReuseCache::new(device.clone() as Arc<dyn GpuDevice>, 1 << 20));
        let loader = AsyncLoader::new(&config(2)).unwrap();

        let submit = |name: &str| {
            let output = ResourceSlot::new();
            let result = ResultSlot::new();
            loader
                .submit(
                    Box::new(PackedDataLoader::new(store.clone(), name)),
                    Box::new(TextureProcessor::new(cache.clone(), output.clone())),
                    Some(result.clone()),
                )
                .unwrap();
            (output, result)
        };
        let (missing_output, missing_result) = submit("no_such_texture");
        let (output, result) = submit("grass");
        loader.wait_for_all_items();

        assert_eq!(missing_output.state(), ResourceState::Error);
        assert_eq!(missing_result.get(), Some(ResultCode::NotFound));

        let handle = output.ready().unwrap();
        assert_eq!(result.get(), Some(ResultCode::Ok));
        assert_eq!(device.texture_contents(handle).unwrap(), vec![42u8; desc.footprint() as usize]);

        // Only the healthy request touched the device
        assert_eq!(device.textures_created(), 1);
        assert_eq!(loader.stats().failed, 1);
        assert_eq!(loader.stats().completed, 1);
    }

    #[test]
    fn test_submit_after_threads_stop() {
        let loader = AsyncLoader::new(&config(1)).unwrap();
        for worker in &loader.workers {
            worker.finish_tx.send(()).unwrap();
        }
        // Wait for the I/O thread to exit and release its receiver
        for _ in 0..1000 {
            if loader.workers.iter().all(|w| w.join_handle.is_finished()) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let journal = Arc::new(Journal::default());
        let err = loader
            .submit(
                Box::new(ScriptedLoader {
                    id: 0,
                    name: "late".into(),
                    fail: FailAt::Nowhere,
                    data: Vec::new(),
                    journal: journal.clone(),
                }),
                Box::new(ScriptedProcessor {
                    id: 0,
                    fail: FailAt::Nowhere,
                    try_again: 0,
                    journal: journal.clone(),
                    output: ResourceSlot::new(),
                }),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
        assert_eq!(journal.loaders_dropped.load(Ordering::SeqCst), 1);
        assert_eq!(loader.outstanding(), 0);
    }
}

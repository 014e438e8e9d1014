//! In-memory simulated accelerator.
//!
//! `HostDevice` implements [`Device`] on host memory. Enqueued work is held in
//! per-stream pending queues and only runs when the device is synchronized, so
//! "launched but not complete" is an observable state. Cross-stream waits are
//! honoured while draining: a stream stalls on a wait until the awaited stream's
//! timeline has advanced far enough.
//!
//! Everything submitted is also appended to a trace, and the device keeps
//! counters (launches submitted/completed, module loads, synchronizations) so
//! tests can assert on the exact device interaction of an execution.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use snafu::{OptionExt, ensure};
use tracing::{debug, trace};

use crate::device::{Device, ModuleHandle, ModuleImage};
use crate::error::{
    InvalidAddressSnafu, LaunchSnafu, ModuleLoadSnafu, Result, RuntimeSnafu, SizeMismatchSnafu, StreamsExhaustedSnafu,
    SymbolNotFoundSnafu, UnknownModuleSnafu, UnknownStreamSnafu,
};
use crate::key::{DeviceKey, DeviceVersion};
use crate::memory::DeviceMemory;
use crate::stream::{Event, LaunchDims, StreamHandle};
use crate::sync::{HostTimeline, TimelineSignal};

/// Host implementation of a kernel or program: reads and writes its arguments.
pub type HostKernel = Arc<dyn Fn(&mut KernelArgs<'_>) -> Result<()> + Send + Sync>;

const BASE_ADDRESS: u64 = 0x1000;
const ALIGNMENT: u64 = 256;
const DEFAULT_MAX_STREAMS: usize = 8;

/// Arguments of a running host kernel.
pub struct KernelArgs<'a> {
    memory: &'a mut HostMemory,
    args: &'a [DeviceMemory],
}

impl KernelArgs<'_> {
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn arg(&self, index: usize) -> DeviceMemory {
        self.args.get(index).copied().unwrap_or(DeviceMemory::NULL)
    }

    pub fn read(&self, index: usize) -> Result<Vec<u8>> {
        self.memory.read(self.arg(index))
    }

    pub fn write(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let dst = self.arg(index);
        self.memory.write(dst, data)
    }
}

/// One entry of the submission trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Launch { stream: StreamHandle, kernel: String },
    Program { stream: StreamHandle, buffers: usize },
    Copy { stream: StreamHandle, dst: DeviceMemory, src: DeviceMemory },
    Memset { stream: StreamHandle, dst: DeviceMemory },
    Upload { stream: StreamHandle, dst: DeviceMemory },
    Free { stream: StreamHandle, memory: DeviceMemory },
    Record { stream: StreamHandle, value: u64 },
    Wait { stream: StreamHandle, on: StreamHandle, value: u64 },
    Synchronize,
}

/// Observable device activity.
#[derive(Debug, Default)]
pub struct HostCounters {
    launches_submitted: AtomicU64,
    launches_completed: AtomicU64,
    synchronizations: AtomicU64,
    module_loads: AtomicU64,
    module_unloads: AtomicU64,
    symbol_lookups: AtomicU64,
    allocations: AtomicU64,
}

impl HostCounters {
    /// Kernel launches and program invocations enqueued.
    pub fn launches_submitted(&self) -> u64 {
        self.launches_submitted.load(Ordering::Acquire)
    }

    /// Kernel launches and program invocations whose effects are visible.
    pub fn launches_completed(&self) -> u64 {
        self.launches_completed.load(Ordering::Acquire)
    }

    pub fn synchronizations(&self) -> u64 {
        self.synchronizations.load(Ordering::Acquire)
    }

    pub fn module_loads(&self) -> u64 {
        self.module_loads.load(Ordering::Acquire)
    }

    pub fn module_unloads(&self) -> u64 {
        self.module_unloads.load(Ordering::Acquire)
    }

    pub fn symbol_lookups(&self) -> u64 {
        self.symbol_lookups.load(Ordering::Acquire)
    }

    /// Raw device allocations (including those made on behalf of allocators).
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Acquire)
    }

    /// Any interaction at all beyond identity queries.
    pub fn total_io(&self) -> u64 {
        self.launches_submitted() + self.synchronizations() + self.module_loads() + self.symbol_lookups()
            + self.allocations()
    }
}

/// Pending operation in a host stream.
enum PendingOp {
    Wait { timeline: Arc<HostTimeline>, value: u64 },
    Signal { timeline: Arc<HostTimeline>, value: u64 },
    Kernel { name: String, args: Vec<DeviceMemory>, body: Option<HostKernel> },
    Program { buffers: Vec<DeviceMemory>, body: Option<HostKernel> },
    Copy { dst: DeviceMemory, src: DeviceMemory },
    Memset { dst: DeviceMemory, value: u8 },
    Upload { dst: DeviceMemory, data: Vec<u8> },
    Free { memory: DeviceMemory },
}

struct HostStream {
    timeline: Arc<HostTimeline>,
    /// Last timeline value handed out by `record_event`.
    recorded: u64,
    pending: VecDeque<PendingOp>,
    borrowed: bool,
}

impl HostStream {
    fn new() -> Self {
        Self { timeline: Arc::new(HostTimeline::new()), recorded: 0, pending: VecDeque::new(), borrowed: false }
    }
}

#[derive(Default)]
struct HostMemory {
    /// Live blocks keyed by base address.
    blocks: BTreeMap<u64, Box<[u8]>>,
    next_addr: u64,
}

impl HostMemory {
    fn alloc(&mut self, size: usize) -> DeviceMemory {
        let addr = self.next_addr.max(BASE_ADDRESS);
        let span = (size as u64).max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        self.next_addr = addr + span;
        self.blocks.insert(addr, vec![0u8; size].into_boxed_slice());
        DeviceMemory::new(addr, size)
    }

    fn free(&mut self, memory: DeviceMemory) -> bool {
        self.blocks.remove(&memory.addr()).is_some()
    }

    /// Find the block containing `memory`; returns (base address, offset).
    fn locate(&self, memory: DeviceMemory) -> Result<(u64, usize)> {
        let invalid = || InvalidAddressSnafu { addr: memory.addr(), size: memory.size() }.build();
        let (&base, block) = self.blocks.range(..=memory.addr()).next_back().ok_or_else(invalid)?;
        let offset = (memory.addr() - base) as usize;
        ensure!(
            offset + memory.size() <= block.len(),
            InvalidAddressSnafu { addr: memory.addr(), size: memory.size() }
        );
        Ok((base, offset))
    }

    fn read(&self, memory: DeviceMemory) -> Result<Vec<u8>> {
        let (base, offset) = self.locate(memory)?;
        Ok(self.blocks[&base][offset..offset + memory.size()].to_vec())
    }

    fn write(&mut self, memory: DeviceMemory, data: &[u8]) -> Result<()> {
        ensure!(data.len() <= memory.size(), SizeMismatchSnafu { expected: memory.size(), actual: data.len() });
        let (base, offset) = self.locate(memory)?;
        let block = self.blocks.get_mut(&base).context(InvalidAddressSnafu { addr: base, size: 0usize })?;
        block[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

struct HostModule {
    symbols: HashMap<String, DeviceMemory>,
}

struct HostState {
    memory: HostMemory,
    streams: Vec<HostStream>,
    modules: HashMap<u64, HostModule>,
    next_module: u64,
    trace: Vec<TraceEvent>,
}

/// Simulated accelerator backed by host memory.
pub struct HostDevice {
    key: DeviceKey,
    version: DeviceVersion,
    max_streams: usize,
    state: Mutex<HostState>,
    kernels: RwLock<HashMap<String, HostKernel>>,
    program: RwLock<Option<HostKernel>>,
    /// Global symbols every loaded module exports, with their sizes.
    symbols: RwLock<BTreeMap<String, usize>>,
    failing_kernel: RwLock<Option<String>>,
    failing_module_loads: AtomicU32,
    counters: HostCounters,
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice").field("key", &self.key).field("version", &self.version).finish()
    }
}

impl HostDevice {
    pub fn new(ordinal: usize, version: DeviceVersion) -> Self {
        Self {
            key: DeviceKey::Host { ordinal },
            version,
            max_streams: DEFAULT_MAX_STREAMS,
            state: Mutex::new(HostState {
                memory: HostMemory::default(),
                streams: vec![HostStream::new()],
                modules: HashMap::new(),
                next_module: 1,
                trace: Vec::new(),
            }),
            kernels: RwLock::new(HashMap::new()),
            program: RwLock::new(None),
            symbols: RwLock::new(BTreeMap::new()),
            failing_kernel: RwLock::new(None),
            failing_module_loads: AtomicU32::new(0),
            counters: HostCounters::default(),
        }
    }

    /// Limit the number of streams (primary included).
    pub fn with_max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = max_streams.max(1);
        self
    }

    /// Give a kernel name a host implementation. Unregistered kernels run as no-ops.
    pub fn register_kernel<F>(&self, name: &str, body: F)
    where
        F: Fn(&mut KernelArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.kernels.write().insert(name.to_string(), Arc::new(body));
    }

    /// Host implementation used for every `run_program` call.
    pub fn register_program<F>(&self, body: F)
    where
        F: Fn(&mut KernelArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        *self.program.write() = Some(Arc::new(body));
    }

    /// Declare a global symbol of `size` bytes exported by every module loaded from now on.
    pub fn define_symbol(&self, name: &str, size: usize) {
        self.symbols.write().insert(name.to_string(), size);
    }

    /// Reject launches of `kernel` at submission time.
    pub fn fail_kernel(&self, kernel: &str) {
        *self.failing_kernel.write() = Some(kernel.to_string());
    }

    /// Fail the next `count` module loads.
    pub fn fail_module_loads(&self, count: u32) {
        self.failing_module_loads.store(count, Ordering::Release);
    }

    pub fn counters(&self) -> &HostCounters {
        &self.counters
    }

    /// Everything submitted so far, in submission order.
    pub fn trace(&self) -> Vec<TraceEvent> {
        self.state.lock().trace.clone()
    }

    pub fn clear_trace(&self) {
        self.state.lock().trace.clear();
    }

    /// Operations enqueued but not yet run.
    pub fn pending_ops(&self) -> usize {
        self.state.lock().streams.iter().map(|s| s.pending.len()).sum()
    }

    /// Number of modules currently loaded.
    pub fn loaded_modules(&self) -> usize {
        self.state.lock().modules.len()
    }

    /// Synchronous read of device memory (does not wait for pending work).
    pub fn read(&self, memory: DeviceMemory) -> Result<Vec<u8>> {
        self.state.lock().memory.read(memory)
    }

    /// Synchronous write of device memory (does not wait for pending work).
    pub fn write(&self, memory: DeviceMemory, data: &[u8]) -> Result<()> {
        self.state.lock().memory.write(memory, data)
    }

    /// Whether `memory` lies inside a live allocation.
    pub fn is_live(&self, memory: DeviceMemory) -> bool {
        self.state.lock().memory.locate(memory).is_ok()
    }

    fn enqueue(&self, stream: StreamHandle, op: PendingOp, event: TraceEvent) -> Result<()> {
        let mut state = self.state.lock();
        let key = self.key;
        let host_stream =
            state.streams.get_mut(stream.0 as usize).context(UnknownStreamSnafu { device: key, stream })?;
        host_stream.pending.push_back(op);
        state.trace.push(event);
        Ok(())
    }

    fn check_module(&self, module: ModuleHandle) -> Result<()> {
        ensure!(
            self.state.lock().modules.contains_key(&module.0),
            UnknownModuleSnafu { device: self.key, module: module.0 }
        );
        Ok(())
    }

    fn run_op(&self, memory: &mut HostMemory, op: PendingOp) -> Result<()> {
        match op {
            PendingOp::Wait { .. } => {}
            PendingOp::Signal { timeline, value } => timeline.advance(value),
            PendingOp::Kernel { name, args, body } => {
                trace!(device = %self.key, kernel = %name, "running kernel");
                if let Some(body) = body {
                    body(&mut KernelArgs { memory, args: &args })?;
                }
                self.counters.launches_completed.fetch_add(1, Ordering::AcqRel);
            }
            PendingOp::Program { buffers, body } => {
                if let Some(body) = body {
                    body(&mut KernelArgs { memory, args: &buffers })?;
                }
                self.counters.launches_completed.fetch_add(1, Ordering::AcqRel);
            }
            PendingOp::Copy { dst, src } => {
                let data = memory.read(src)?;
                memory.write(dst, &data)?;
            }
            PendingOp::Memset { dst, value } => memory.write(dst, &vec![value; dst.size()])?,
            PendingOp::Upload { dst, data } => memory.write(dst, &data)?,
            PendingOp::Free { memory: freed } => {
                memory.free(freed);
            }
        }
        Ok(())
    }
}

impl Device for HostDevice {
    fn key(&self) -> DeviceKey {
        self.key
    }

    fn version(&self) -> DeviceVersion {
        self.version
    }

    fn primary_stream(&self) -> StreamHandle {
        StreamHandle(0)
    }

    fn acquire_stream(&self) -> Result<StreamHandle> {
        let mut state = self.state.lock();
        if let Some(index) = state.streams.iter().skip(1).position(|s| !s.borrowed) {
            state.streams[index + 1].borrowed = true;
            return Ok(StreamHandle(index as u32 + 1));
        }

        ensure!(
            state.streams.len() < self.max_streams,
            StreamsExhaustedSnafu { device: self.key, capacity: self.max_streams }
        );
        let mut stream = HostStream::new();
        stream.borrowed = true;
        state.streams.push(stream);
        Ok(StreamHandle(state.streams.len() as u32 - 1))
    }

    fn release_stream(&self, stream: StreamHandle) {
        if stream.0 == 0 {
            return;
        }
        if let Some(s) = self.state.lock().streams.get_mut(stream.0 as usize) {
            s.borrowed = false;
        }
    }

    fn allocate(&self, size: usize) -> Result<DeviceMemory> {
        self.counters.allocations.fetch_add(1, Ordering::AcqRel);
        Ok(self.state.lock().memory.alloc(size))
    }

    fn deallocate(&self, memory: DeviceMemory) {
        if !self.state.lock().memory.free(memory) {
            debug!(device = %self.key, %memory, "deallocating unknown memory");
        }
    }

    fn deallocate_on(&self, stream: StreamHandle, memory: DeviceMemory) -> Result<()> {
        self.enqueue(stream, PendingOp::Free { memory }, TraceEvent::Free { stream, memory })
    }

    fn load_module(&self, image: &ModuleImage<'_>) -> Result<ModuleHandle> {
        self.counters.module_loads.fetch_add(1, Ordering::AcqRel);
        let failing = self.failing_module_loads.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if failing.is_ok() {
            return ModuleLoadSnafu { device: self.key, reason: format!("injected failure loading '{}'", image.name) }
                .fail();
        }

        let declared = self.symbols.read().clone();
        let mut state = self.state.lock();
        let symbols = declared.into_iter().map(|(name, size)| (name, state.memory.alloc(size))).collect();
        let handle = state.next_module;
        state.next_module += 1;
        state.modules.insert(handle, HostModule { symbols });
        debug!(device = %self.key, module = image.name, handle, "module loaded");
        Ok(ModuleHandle(handle))
    }

    fn unload_module(&self, module: ModuleHandle) {
        let mut state = self.state.lock();
        if let Some(loaded) = state.modules.remove(&module.0) {
            for memory in loaded.symbols.into_values() {
                state.memory.free(memory);
            }
            self.counters.module_unloads.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn symbol(&self, module: ModuleHandle, name: &str) -> Result<DeviceMemory> {
        self.counters.symbol_lookups.fetch_add(1, Ordering::AcqRel);
        let state = self.state.lock();
        let loaded = state.modules.get(&module.0).context(UnknownModuleSnafu { device: self.key, module: module.0 })?;
        loaded.symbols.get(name).copied().context(SymbolNotFoundSnafu { name, module: module.0 })
    }

    fn launch_kernel(
        &self,
        stream: StreamHandle,
        module: Option<ModuleHandle>,
        kernel: &str,
        dims: &LaunchDims,
        args: &[DeviceMemory],
    ) -> Result<()> {
        if self.failing_kernel.read().as_deref() == Some(kernel) {
            return LaunchSnafu { kernel, reason: "injected launch failure" }.fail();
        }
        ensure!(dims.thread_count() > 0, LaunchSnafu { kernel, reason: "empty launch dimensions" });
        if let Some(module) = module {
            self.check_module(module)?;
        }

        let body = self.kernels.read().get(kernel).cloned();
        let op = PendingOp::Kernel { name: kernel.to_string(), args: args.to_vec(), body };
        self.enqueue(stream, op, TraceEvent::Launch { stream, kernel: kernel.to_string() })?;
        self.counters.launches_submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn run_program(&self, stream: StreamHandle, program: &[u8], buffers: &[DeviceMemory]) -> Result<()> {
        ensure!(!program.is_empty(), LaunchSnafu { kernel: "<program>", reason: "empty program" });
        let body = self.program.read().clone();
        let op = PendingOp::Program { buffers: buffers.to_vec(), body };
        self.enqueue(stream, op, TraceEvent::Program { stream, buffers: buffers.len() })?;
        self.counters.launches_submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn copy(&self, stream: StreamHandle, dst: DeviceMemory, src: DeviceMemory) -> Result<()> {
        ensure!(dst.size() == src.size(), SizeMismatchSnafu { expected: dst.size(), actual: src.size() });
        self.enqueue(stream, PendingOp::Copy { dst, src }, TraceEvent::Copy { stream, dst, src })
    }

    fn memset(&self, stream: StreamHandle, dst: DeviceMemory, value: u8) -> Result<()> {
        self.enqueue(stream, PendingOp::Memset { dst, value }, TraceEvent::Memset { stream, dst })
    }

    fn copy_from_host(&self, stream: StreamHandle, dst: DeviceMemory, data: &[u8]) -> Result<()> {
        ensure!(data.len() <= dst.size(), SizeMismatchSnafu { expected: dst.size(), actual: data.len() });
        self.enqueue(stream, PendingOp::Upload { dst, data: data.to_vec() }, TraceEvent::Upload { stream, dst })
    }

    fn record_event(&self, stream: StreamHandle) -> Result<Event> {
        let mut state = self.state.lock();
        let key = self.key;
        let host_stream =
            state.streams.get_mut(stream.0 as usize).context(UnknownStreamSnafu { device: key, stream })?;
        host_stream.recorded += 1;
        let value = host_stream.recorded;
        let timeline = Arc::clone(&host_stream.timeline);
        host_stream.pending.push_back(PendingOp::Signal { timeline, value });
        state.trace.push(TraceEvent::Record { stream, value });
        Ok(Event { stream, value })
    }

    fn wait_event(&self, stream: StreamHandle, event: &Event) -> Result<()> {
        let mut state = self.state.lock();
        let key = self.key;
        let timeline = state
            .streams
            .get(event.stream.0 as usize)
            .map(|s| Arc::clone(&s.timeline))
            .context(UnknownStreamSnafu { device: key, stream: event.stream })?;
        let host_stream =
            state.streams.get_mut(stream.0 as usize).context(UnknownStreamSnafu { device: key, stream })?;
        host_stream.pending.push_back(PendingOp::Wait { timeline, value: event.value });
        state.trace.push(TraceEvent::Wait { stream, on: event.stream, value: event.value });
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.counters.synchronizations.fetch_add(1, Ordering::AcqRel);
        let mut state = self.state.lock();
        state.trace.push(TraceEvent::Synchronize);
        let HostState { memory, streams, .. } = &mut *state;

        loop {
            let mut progressed = false;
            for stream in streams.iter_mut() {
                while let Some(op) = stream.pending.front() {
                    if let PendingOp::Wait { timeline, value } = op
                        && !timeline.is_reached(*value)
                    {
                        break;
                    }
                    if let Some(op) = stream.pending.pop_front() {
                        self.run_op(memory, op)?;
                        progressed = true;
                    }
                }
            }

            let remaining: usize = streams.iter().map(|s| s.pending.len()).sum();
            if remaining == 0 {
                return Ok(());
            }
            ensure!(
                progressed,
                RuntimeSnafu { message: format!("{} stalled with {remaining} operations waiting on events", self.key) }
            );
        }
    }
}

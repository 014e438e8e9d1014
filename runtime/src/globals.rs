//! Per-device cache of loaded modules and resolved constants.
//!
//! The first call of an executable on a device loads its binary into that
//! device's context and resolves every constant to a device address. The result
//! is committed as one [`ModuleGlobals`] entry and reused by every later call on
//! the same device without further device I/O.
//!
//! # Thread Safety
//!
//! One mutex serializes load-or-lookup per executable, so concurrent first calls
//! on one device load the module exactly once. Committed entries are immutable
//! and handed out as `Arc`s.
//!
//! # Failure
//!
//! Resolution stages everything in an uncommitted entry. If any step fails the
//! staged entry is dropped, which unloads the module and frees constant memory,
//! and nothing is inserted, so the next call retries from scratch.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_device::{Device, DeviceKey, DeviceMemory, ModuleHandle, ModuleImage, StreamHandle};
use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::{debug, trace, warn};

use crate::descriptor::ExecutableDescriptor;
use crate::error::{ModuleLoadSnafu, Result, SymbolResolutionSnafu};
use crate::types::{ConstantInfo, ConstantStorage};

/// Module handle and constant addresses of one executable on one device.
#[derive(Debug)]
pub struct ModuleGlobals {
    device: Arc<dyn Device>,
    module: Option<ModuleHandle>,
    /// Allocation index -> resolved constant address.
    addresses: HashMap<usize, DeviceMemory>,
    /// Constant memory owned by this entry (`ConstantStorage::Allocated`).
    allocated: Vec<DeviceMemory>,
}

impl ModuleGlobals {
    fn empty(device: Arc<dyn Device>) -> Self {
        Self { device, module: None, addresses: HashMap::new(), allocated: Vec::new() }
    }

    /// Loaded module, if the executable had code or constants to load.
    pub fn module(&self) -> Option<ModuleHandle> {
        self.module
    }

    /// Resolved address of constant allocation `index`.
    pub fn address(&self, index: usize) -> Option<DeviceMemory> {
        self.addresses.get(&index).copied()
    }

    pub fn addresses(&self) -> &HashMap<usize, DeviceMemory> {
        &self.addresses
    }

    fn resolve_constant(&mut self, module: ModuleHandle, constant: &ConstantInfo) -> Result<DeviceMemory> {
        let symbol = constant.symbol_name.as_str();
        let memory = match constant.storage {
            ConstantStorage::Embedded => self.device.symbol(module, symbol).context(SymbolResolutionSnafu { symbol })?,
            ConstantStorage::Allocated => {
                let memory = self.device.allocate(constant.content.len()).context(SymbolResolutionSnafu { symbol })?;
                self.allocated.push(memory);
                memory
            }
        };

        if let Some(index) = constant.allocation_index {
            self.addresses.insert(index, memory);
        }
        trace!(symbol, %memory, storage = ?constant.storage, "constant resolved");
        Ok(memory)
    }

    /// Copy constant contents into their resolved memory and wait for the copies.
    fn upload(&self, uploads: &[(DeviceMemory, &ConstantInfo)], stream: StreamHandle) -> Result<()> {
        for (memory, constant) in uploads {
            let enqueued = self.device.copy_from_host(stream, *memory, &constant.content);
            if let Err(source) = enqueued {
                // Earlier copies target memory freed with this entry; let them land first.
                if let Err(e) = self.device.synchronize() {
                    warn!(device = %self.device.key(), error = %e, "synchronize before dropping constants failed");
                }
                return Err(source).context(SymbolResolutionSnafu { symbol: constant.symbol_name.as_str() });
            }
        }
        if let Some((_, last)) = uploads.last() {
            self.device.synchronize().context(SymbolResolutionSnafu { symbol: last.symbol_name.as_str() })?;
        }
        Ok(())
    }
}

impl Drop for ModuleGlobals {
    fn drop(&mut self) {
        for memory in self.allocated.drain(..) {
            self.device.deallocate(memory);
        }
        if let Some(module) = self.module.take() {
            debug!(device = %self.device.key(), %module, "unloading module");
            self.device.unload_module(module);
        }
    }
}

/// Map from device to committed [`ModuleGlobals`].
#[derive(Debug, Default)]
pub struct GlobalsCache {
    entries: Mutex<HashMap<DeviceKey, Arc<ModuleGlobals>>>,
}

impl GlobalsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the committed entry for `device`, loading it on first use.
    ///
    /// Constant uploads are enqueued on `stream` and completed before the entry
    /// is committed, so the addresses are valid on every stream of the device.
    pub fn resolve(
        &self,
        descriptor: &ExecutableDescriptor,
        device: &Arc<dyn Device>,
        stream: StreamHandle,
    ) -> Result<Arc<ModuleGlobals>> {
        let key = device.key();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&key) {
            trace!(device = %key, "module globals cache hit");
            return Ok(Arc::clone(entry));
        }

        let entry = Arc::new(Self::load(descriptor, device, stream)?);
        entries.insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    fn load(
        descriptor: &ExecutableDescriptor,
        device: &Arc<dyn Device>,
        stream: StreamHandle,
    ) -> Result<ModuleGlobals> {
        let key = device.key();
        let mut staged = ModuleGlobals::empty(Arc::clone(device));
        if !descriptor.needs_module() {
            debug!(device = %key, module = descriptor.module_name(), "nothing to load");
            return Ok(staged);
        }

        let image =
            ModuleImage { name: descriptor.module_name(), binary: descriptor.binary(), text: descriptor.text() };
        let module =
            device.load_module(&image).context(ModuleLoadSnafu { module: descriptor.module_name(), device: key })?;
        staged.module = Some(module);
        debug!(device = %key, module = descriptor.module_name(), %module, "module loaded");

        let mut uploads = Vec::new();
        for constant in descriptor.constants() {
            let memory = staged.resolve_constant(module, constant)?;
            if !constant.content.is_empty() {
                uploads.push((memory, constant));
            }
        }
        staged.upload(&uploads, stream)?;

        debug!(
            device = %key,
            constants = descriptor.constants().len(),
            uploads = uploads.len(),
            "module globals committed"
        );
        Ok(staged)
    }

    pub fn contains(&self, key: DeviceKey) -> bool {
        self.entries.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

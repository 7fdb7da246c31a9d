//! A target process attached to a live module.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::process::{Process, ProcessId, ThreadId};
use crate::transport::{self, Command, Transport};

pub struct LiveProcess {
    process: Arc<dyn Process>,
    transport: Arc<dyn Transport>,
    /// Thread serving transport commands; never parked in a code cave.
    command_thread: Option<ThreadId>,
    /// Where the original module is loaded in this process.
    module_base: u64,
    /// Function starts that already carry a jump into a patch.
    patched_functions: Mutex<HashSet<u64>>,
}

impl LiveProcess {
    pub fn new(
        process: Arc<dyn Process>,
        transport: Arc<dyn Transport>,
        command_thread: Option<ThreadId>,
        module_base: u64,
    ) -> Self {
        Self { process, transport, command_thread, module_base, patched_functions: Mutex::new(HashSet::new()) }
    }

    pub fn id(&self) -> ProcessId {
        self.process.id()
    }

    pub fn process(&self) -> &dyn Process {
        &*self.process
    }

    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    pub fn command_thread(&self) -> Option<ThreadId> {
        self.command_thread
    }

    pub fn module_base(&self) -> u64 {
        self.module_base
    }

    pub fn send(&self, command: Command) -> Result<()> {
        transport::send_acked(&*self.transport, command)
    }

    pub fn mark_patched(&self, address: u64) {
        self.patched_functions.lock().insert(address);
    }

    pub fn unmark_patched(&self, address: u64) {
        self.patched_functions.lock().remove(&address);
    }

    pub fn was_patched(&self, address: u64) -> bool {
        self.patched_functions.lock().contains(&address)
    }
}

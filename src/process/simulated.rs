//! An in-memory process.
//!
//! Memory is a set of mapped regions and threads are bare instruction pointers. Used for
//! dry runs and tests of the install machinery.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::{Process, ProcessId, ThreadContext, ThreadId, ALLOCATION_GRANULARITY};
use crate::utils::align_up;

const ALLOCATION_START: u64 = 0x7ff0_0000_0000;

struct SimulatedThread {
    context: ThreadContext,
    priority: i32,
}

struct State {
    regions: BTreeMap<u64, Vec<u8>>,
    threads: BTreeMap<ThreadId, SimulatedThread>,
    next_thread: ThreadId,
    next_allocation: u64,
    suspend_count: u32,
    flushes: usize,
}

pub struct SimulatedProcess {
    id: ProcessId,
    state: Mutex<State>,
}

impl SimulatedProcess {
    pub fn new(id: ProcessId) -> Self {
        Self {
            id,
            state: Mutex::new(State {
                regions: BTreeMap::new(),
                threads: BTreeMap::new(),
                next_thread: 1,
                next_allocation: ALLOCATION_START,
                suspend_count: 0,
                flushes: 0,
            }),
        }
    }

    /// Maps `bytes` at `base`, replacing whatever region started there.
    pub fn map(&self, base: u64, bytes: Vec<u8>) {
        self.state.lock().regions.insert(base, bytes);
    }

    pub fn unmap(&self, base: u64) -> bool {
        self.state.lock().regions.remove(&base).is_some()
    }

    pub fn is_mapped(&self, base: u64) -> bool {
        self.state.lock().regions.contains_key(&base)
    }

    pub fn spawn_thread(&self, ip: u64) -> ThreadId {
        let mut state = self.state.lock();
        let id = state.next_thread;
        state.next_thread += 1;
        state.threads.insert(id, SimulatedThread { context: ThreadContext { ip }, priority: 0 });
        id
    }

    pub fn suspend_count(&self) -> u32 {
        self.state.lock().suspend_count
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    /// Copy of every mapped region.
    pub fn snapshot(&self) -> BTreeMap<u64, Vec<u8>> {
        self.state.lock().regions.clone()
    }
}

fn region_mut(state: &mut State, address: u64, len: usize) -> Result<&mut [u8]> {
    if let Some((&base, bytes)) = state.regions.range_mut(..=address).next_back() {
        let start = (address - base) as usize;
        if start + len <= bytes.len() {
            return Ok(&mut bytes[start..start + len]);
        }
    }
    bail!("access violation at 0x{:x} ({} bytes)", address, len)
}

impl Process for SimulatedProcess {
    fn id(&self) -> ProcessId {
        self.id
    }

    fn suspend(&self) -> Result<()> {
        self.state.lock().suspend_count += 1;
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.suspend_count == 0 {
            bail!("process {} is not suspended", self.id);
        }
        state.suspend_count -= 1;
        Ok(())
    }

    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        buffer.copy_from_slice(region_mut(&mut state, address, buffer.len())?);
        Ok(())
    }

    fn write_memory(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        region_mut(&mut state, address, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    fn flush_instruction_cache(&self, _address: u64, _len: usize) -> Result<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }

    fn threads(&self) -> Result<Vec<ThreadId>> {
        Ok(self.state.lock().threads.keys().copied().collect())
    }

    fn thread_context(&self, thread: ThreadId) -> Result<ThreadContext> {
        match self.state.lock().threads.get(&thread) {
            Some(t) => Ok(t.context),
            None => bail!("no thread {} in process {}", thread, self.id),
        }
    }

    fn set_thread_context(&self, thread: ThreadId, context: ThreadContext) -> Result<()> {
        match self.state.lock().threads.get_mut(&thread) {
            Some(t) => {
                t.context = context;
                Ok(())
            }
            None => bail!("no thread {} in process {}", thread, self.id),
        }
    }

    fn thread_priority(&self, thread: ThreadId) -> Result<i32> {
        match self.state.lock().threads.get(&thread) {
            Some(t) => Ok(t.priority),
            None => bail!("no thread {} in process {}", thread, self.id),
        }
    }

    fn set_thread_priority(&self, thread: ThreadId, priority: i32) -> Result<()> {
        match self.state.lock().threads.get_mut(&thread) {
            Some(t) => {
                t.priority = priority;
                Ok(())
            }
            None => bail!("no thread {} in process {}", thread, self.id),
        }
    }

    fn allocate(&self, size: usize) -> Result<u64> {
        let mut state = self.state.lock();
        let base = state.next_allocation;
        state.next_allocation += align_up(size.max(1) as u64, ALLOCATION_GRANULARITY);
        state.regions.insert(base, vec![0; size]);
        Ok(base)
    }

    fn free(&self, address: u64) -> Result<()> {
        if self.state.lock().regions.remove(&address).is_none() {
            bail!("nothing allocated at 0x{:x}", address);
        }
        Ok(())
    }

    fn is_range_free(&self, address: u64, size: u64) -> Result<bool> {
        let state = self.state.lock();
        let end = address + size;
        let overlaps = state
            .regions
            .range(..end)
            .next_back()
            .map_or(false, |(&base, bytes)| base + bytes.len() as u64 > address);
        Ok(!overlaps)
    }
}

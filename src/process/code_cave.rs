//! Code cave.
//!
//! Parks every thread of a process except the one serving commands in a private page that
//! spins forever at the lowest priority. While the cave is entered the command thread can run
//! code in the target (loading a library, calling an entry point) without any other thread
//! observing half-written memory. Leaving the cave, also on early return, puts every thread
//! back where it was.

use anyhow::{Context, Result};
use tracing::{debug, error};

use super::{Process, Suspended, ThreadContext, ThreadId, LOWEST_PRIORITY};

/// `jmp $`
const SPIN: [u8; 2] = [0xeb, 0xfe];

struct ParkedThread {
    id: ThreadId,
    context: ThreadContext,
    priority: i32,
}

pub struct CodeCave<'a> {
    process: &'a dyn Process,
    page: u64,
    parked: Vec<ParkedThread>,
}

impl<'a> CodeCave<'a> {
    pub fn enter(process: &'a dyn Process, command_thread: Option<ThreadId>) -> Result<Self> {
        let page = process.allocate(SPIN.len())?;
        process.write_memory(page, &SPIN)?;
        process.flush_instruction_cache(page, SPIN.len())?;

        let mut cave = Self { process, page, parked: Vec::new() };
        {
            let _suspended = Suspended::new(process)?;
            for id in process.threads()? {
                if Some(id) == command_thread {
                    continue;
                }
                let context = process.thread_context(id)?;
                let priority = process.thread_priority(id)?;
                cave.parked.push(ParkedThread { id, context, priority });
                process.set_thread_context(id, ThreadContext { ip: page })?;
                process.set_thread_priority(id, LOWEST_PRIORITY)?;
            }
        }
        debug!("Parked {} threads of process {} at 0x{:x}", cave.parked.len(), process.id(), page);
        Ok(cave)
    }

    fn leave(&mut self) -> Result<()> {
        {
            let _suspended = Suspended::new(self.process)?;
            for thread in self.parked.drain(..) {
                self.process
                    .set_thread_context(thread.id, thread.context)
                    .with_context(|| format!("failed to restore thread {}", thread.id))?;
                self.process.set_thread_priority(thread.id, thread.priority)?;
            }
        }
        self.process.free(self.page)
    }
}

impl Drop for CodeCave<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.leave() {
            error!("Failed to leave code cave in process {}: {:#}", self.process.id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SimulatedProcess;

    #[test]
    fn parks_and_restores_threads() {
        let process = SimulatedProcess::new(3);
        let worker = process.spawn_thread(0x1_4000_1010);
        let command = process.spawn_thread(0x7ff8_0000_0000);
        process.set_thread_priority(worker, 2).unwrap();

        {
            let _cave = CodeCave::enter(&process, Some(command)).unwrap();
            let parked = process.thread_context(worker).unwrap().ip;
            let mut spin = [0u8; 2];
            process.read_memory(parked, &mut spin).unwrap();
            assert_eq!(spin, SPIN);
            assert_eq!(process.thread_priority(worker).unwrap(), LOWEST_PRIORITY);
            assert_eq!(process.thread_context(command).unwrap().ip, 0x7ff8_0000_0000);
            assert_eq!(process.suspend_count(), 0);
        }

        assert_eq!(process.thread_context(worker).unwrap().ip, 0x1_4000_1010);
        assert_eq!(process.thread_priority(worker).unwrap(), 2);
        assert_eq!(process.suspend_count(), 0);
    }
}

//! Slots, queue, dispatch, reap, enumeration.

use crate::config::Policy;
use crate::error::{Error, ErrorKind};
use crate::queue::PriorityQueue;
use crate::runner;
use crate::task::{Phase, TaggedTask, Timestamp};
use log::{error, warn};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

struct Slot {
    occupant: Option<(Pid, TaggedTask)>,
}

/// Owns the queue, the bounded slot array, and the output directory for a
/// single population of tasks. The task scheduler and the status scheduler
/// are two independent instances of this type, never one shared scheduler
/// with two populations.
pub struct Scheduler {
    queue: PriorityQueue,
    slots: Vec<Slot>,
    output_dir: PathBuf,
}

impl Scheduler {
    pub fn new(policy: Policy, n: usize, output_dir: impl Into<PathBuf>) -> Result<Scheduler, Error> {
        if n == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument, "slot count must be > 0"));
        }
        let slots = (0..n).map(|_| Slot { occupant: None }).collect();
        Ok(Scheduler {
            queue: PriorityQueue::new(policy),
            slots,
            output_dir: output_dir.into(),
        })
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Enqueues `task`. Ownership transfer (a move) is what the original
    /// implementation's heap-copy-on-insert achieved with `malloc`+`memcpy`;
    /// there is nothing left to clone once Rust can just move the value.
    pub fn add(&mut self, task: TaggedTask) {
        self.queue.insert(task);
    }

    pub fn can_schedule_now(&self) -> bool {
        self.slots.iter().any(|s| s.occupant.is_none())
    }

    fn free_slot_index(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.occupant.is_none())
    }

    /// While the queue is non-empty and a slot is free: removes the top
    /// task, stamps `DISPATCHED`, forks a runner child for it, and occupies
    /// the slot with the child's pid. Returns the number of tasks
    /// dispatched. A free slot is confirmed before a task is ever removed
    /// from the queue, so — unlike a pop-then-search implementation — there
    /// is never a removed task left without a destination slot.
    pub fn dispatch_possible(&mut self) -> usize {
        let mut dispatched = 0;
        while !self.queue.is_empty() {
            let Some(slot_index) = self.free_slot_index() else {
                break;
            };
            let mut task = match self.queue.remove_top() {
                Some(t) => t,
                None => break,
            };
            task.set_stamp(Phase::Dispatched, Timestamp::now());

            // SAFETY: the server is single-threaded, so forking here cannot
            // race with another thread's allocator or lock state.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    let code = runner::run_child(task, slot_index, &self.output_dir);
                    unsafe { libc::_exit(code) };
                }
                Ok(ForkResult::Parent { child }) => {
                    self.slots[slot_index].occupant = Some((child, task));
                    dispatched += 1;
                }
                Err(e) => {
                    error!("fork failed while dispatching task {}: {}", task.id, e);
                }
            }
        }
        dispatched
    }

    /// Reaps the child occupying `slot` via a blocking `waitpid`, stamps
    /// `ENDED` with `ended_ts` and `COMPLETED` with now, frees the slot, and
    /// returns the task plus whether the reaped child's own exit indicates
    /// an error (nonzero exit code or death by signal).
    pub fn mark_done(&mut self, slot: usize, ended_ts: Timestamp) -> Result<(TaggedTask, bool), Error> {
        if slot >= self.slots.len() {
            return Err(Error::new(ErrorKind::Range, format!("slot {} out of range", slot)));
        }
        let Some((pid, mut task)) = self.slots[slot].occupant.take() else {
            return Err(Error::new(ErrorKind::Range, format!("slot {} is already free", slot)));
        };

        let wait_result = waitpid(pid, None);
        let error = match wait_result {
            Ok(WaitStatus::Exited(_, code)) => code != 0,
            Ok(WaitStatus::Signaled(..)) => true,
            Ok(_) => false,
            Err(e) => {
                warn!("waitpid failed for pid {} (slot {}): {}", pid, slot, e);
                return Err(e.into());
            }
        };

        task.set_stamp(Phase::Ended, ended_ts);
        task.set_stamp(Phase::Completed, Timestamp::now());
        Ok((task, error))
    }

    pub fn enumerate_running<F>(&self, mut f: F)
    where
        F: FnMut(&TaggedTask) -> ControlFlow<()>,
    {
        for slot in &self.slots {
            if let Some((_, task)) = &slot.occupant {
                if let ControlFlow::Break(()) = f(task) {
                    break;
                }
            }
        }
    }

    pub fn enumerate_queued<F>(&self, mut f: F)
    where
        F: FnMut(&TaggedTask) -> ControlFlow<()>,
    {
        for task in self.queue.enumerate() {
            if let ControlFlow::Break(()) = f(task) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_slots() {
        assert!(Scheduler::new(Policy::Fcfs, 0, "/tmp").is_err());
    }

    #[test]
    fn mark_done_on_free_slot_is_range_error() {
        let mut sched = Scheduler::new(Policy::Fcfs, 2, "/tmp").unwrap();
        let err = sched.mark_done(0, Timestamp::now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Range);
    }

    #[test]
    fn mark_done_out_of_range_slot_is_range_error() {
        let mut sched = Scheduler::new(Policy::Fcfs, 2, "/tmp").unwrap();
        let err = sched.mark_done(5, Timestamp::now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Range);
    }

    #[test]
    fn can_schedule_now_reflects_free_slots() {
        let sched = Scheduler::new(Policy::Fcfs, 1, "/tmp").unwrap();
        assert!(sched.can_schedule_now());
    }
}

//! Deadline-ordered job queue driven by the pool actor.
//!
//! Nothing here runs on its own: the actor asks for the next deadline, sleeps
//! until it, then pops and runs every job that is due. Recurring work
//! re-enqueues itself from its handler while it still has something to do.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::Instant;

/// Identifies one auto-stop timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Work the pool actor performs when it comes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
  /// Fold engines that finished their handshake into the active slots.
  ResolveLoading,
  /// Make sure an idle engine is available or on its way.
  Refill,
  /// Retire crashed and obsolete engines.
  Comb,
  /// Advance termination of retired engines.
  TerminateOld,
  /// Track end reached on `slot`.
  AutoStop { slot: usize, timer: TimerId },
}

impl Job {
  fn is_timer(&self) -> bool {
    matches!(self, Job::AutoStop { .. })
  }
}

#[derive(Debug)]
struct Entry {
  due: Instant,
  seq: u64,
  job: Job,
}

impl PartialEq for Entry {
  fn eq(&self, other: &Self) -> bool {
    self.due == other.due && self.seq == other.seq
  }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

// Reversed so the max-heap yields the earliest deadline first.
impl Ord for Entry {
  fn cmp(&self, other: &Self) -> Ordering {
    other
      .due
      .cmp(&self.due)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

#[derive(Debug, Default)]
pub struct Scheduler {
  queue: BinaryHeap<Entry>,
  next_seq: u64,
}

impl Scheduler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `job` as soon as possible.
  pub fn schedule(&mut self, job: Job) {
    self.schedule_at(Instant::now(), job);
  }

  /// Run `job` after `delay`.
  pub fn schedule_after(&mut self, delay: Duration, job: Job) {
    self.schedule_at(Instant::now() + delay, job);
  }

  /// Maintenance jobs are idempotent, so a request is dropped when the same
  /// job is already queued to run no later than `due`.
  fn schedule_at(&mut self, due: Instant, job: Job) {
    if !job.is_timer() && self.queue.iter().any(|e| e.job == job && e.due <= due) {
      return;
    }
    let seq = self.next_seq;
    self.next_seq += 1;
    self.queue.push(Entry { due, seq, job });
  }

  /// Arm an auto-stop timer for `slot`.
  pub fn start_timer(&mut self, delay: Duration, slot: usize) -> TimerId {
    let timer = TimerId(self.next_seq);
    self.schedule_after(delay, Job::AutoStop { slot, timer });
    timer
  }

  /// Disarm a timer. Returns whether it was still pending.
  pub fn cancel(&mut self, timer: TimerId) -> bool {
    let before = self.queue.len();
    self
      .queue
      .retain(|e| !matches!(e.job, Job::AutoStop { timer: t, .. } if t == timer));
    self.queue.len() != before
  }

  pub fn next_due(&self) -> Option<Instant> {
    self.queue.peek().map(|e| e.due)
  }

  /// Remove and return the earliest job due at or before `now`.
  pub fn pop_due(&mut self, now: Instant) -> Option<Job> {
    if self.queue.peek()?.due <= now {
      self.queue.pop().map(|e| e.job)
    } else {
      None
    }
  }

  pub fn is_scheduled(&self, job: Job) -> bool {
    self.queue.iter().any(|e| e.job == job)
  }

  pub fn len(&self) -> usize {
    self.queue.len()
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  pub fn clear(&mut self) {
    self.queue.clear();
  }
}

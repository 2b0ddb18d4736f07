//! Cooperative task scheduler
//!
//! Single-threaded and non-preemptive. The host calls [`Scheduler::run`] from
//! its main loop with a monotonic millisecond clock; every task whose deadline
//! (`timebase + offset`) has passed runs once. A task's return value decides
//! its fate:
//!
//! - [`Reschedule::After`] re-arms the task relative to the current time
//!   (a zero duration means "next pass")
//! - [`Reschedule::Cancel`] removes it from the queue
//!
//! Tasks get `&mut C` while running, so they may schedule more work on the
//! context. The owner of the scheduler is expected to take it out of the
//! context for the duration of a pass and merge newly spawned tasks back with
//! [`Scheduler::absorb`].

use std::fmt;
use std::time::Duration;
use tracing::trace;

/// Outcome of a task run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reschedule {
    /// Run again after this delay
    After(Duration),
    /// Done, drop the task
    Cancel,
}

/// Delayed unit of work over a context `C`
pub trait Task<C> {
    /// Diagnostic name
    fn name(&self) -> &str;

    /// Task body, called once the deadline has passed
    fn run(&mut self, ctx: &mut C, now: u64) -> Reschedule;
}

/// Closure-backed task
pub struct FnTask<F> {
    name: &'static str,
    body: F,
}

impl<F> FnTask<F> {
    pub fn new<C>(name: &'static str, body: F) -> Self
    where
        F: FnMut(&mut C, u64) -> Reschedule,
    {
        Self { name, body }
    }
}

impl<C, F> Task<C> for FnTask<F>
where
    F: FnMut(&mut C, u64) -> Reschedule,
{
    fn name(&self) -> &str {
        self.name
    }

    fn run(&mut self, ctx: &mut C, now: u64) -> Reschedule {
        (self.body)(ctx, now)
    }
}

struct Entry<C> {
    task: Box<dyn Task<C>>,
    /// `None` once cancelled
    timebase: Option<u64>,
    offset: u64,
}

impl<C> Entry<C> {
    fn deadline(&self) -> Option<u64> {
        self.timebase.map(|t| t.saturating_add(self.offset))
    }

    fn should_run(&self, now: u64) -> bool {
        matches!(self.deadline(), Some(d) if d <= now)
    }
}

/// Run queue of tasks over a context `C`
pub struct Scheduler<C> {
    entries: Vec<Entry<C>>,
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Queue a task to run `offset` after `now`
    pub fn schedule<T>(&mut self, task: T, offset: Duration, now: u64)
    where
        T: Task<C> + 'static,
    {
        self.schedule_boxed(Box::new(task), offset, now);
    }

    pub fn schedule_boxed(&mut self, task: Box<dyn Task<C>>, offset: Duration, now: u64) {
        trace!("scheduling {} in {:?}", task.name(), offset);
        self.entries.push(Entry {
            task,
            timebase: Some(now),
            offset: duration_ms(offset),
        });
    }

    /// Run every due task once, then prune the cancelled ones.
    ///
    /// Returns the number of task bodies executed.
    pub fn run(&mut self, ctx: &mut C, now: u64) -> usize {
        let mut ran = 0;
        let mut dirty = false;

        for entry in self.entries.iter_mut() {
            if !entry.should_run(now) {
                continue;
            }
            trace!("running task {}", entry.task.name());
            ran += 1;
            match entry.task.run(ctx, now) {
                Reschedule::After(delay) => {
                    entry.timebase = Some(now);
                    entry.offset = duration_ms(delay);
                }
                Reschedule::Cancel => {
                    entry.timebase = None;
                    dirty = true;
                }
            }
        }

        if dirty {
            self.entries.retain(|e| e.timebase.is_some());
        }
        ran
    }

    /// Absolute time of the earliest pending task
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.iter().filter_map(Entry::deadline).min()
    }

    /// Names and deadlines of pending tasks, in queue order
    pub fn pending(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries
            .iter()
            .filter_map(|e| e.deadline().map(|d| (e.task.name(), d)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every task
    pub fn stop(&mut self) {
        self.entries.clear();
    }

    /// Move all tasks of `other` into this queue, keeping their deadlines
    pub fn absorb(&mut self, mut other: Scheduler<C>) {
        self.entries.append(&mut other.entries);
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.pending().map(|(name, deadline)| format!("{}@{}", name, deadline)))
            .finish()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Log {
        lines: Vec<String>,
    }

    struct Periodic {
        every: Duration,
        left: u32,
    }

    impl Task<Log> for Periodic {
        fn name(&self) -> &str {
            "periodic"
        }

        fn run(&mut self, ctx: &mut Log, now: u64) -> Reschedule {
            ctx.lines.push(format!("tick {}", now));
            self.left -= 1;
            if self.left == 0 {
                Reschedule::Cancel
            } else {
                Reschedule::After(self.every)
            }
        }
    }

    #[test]
    fn test_one_shot() {
        let mut sched = Scheduler::new();
        let mut log = Log::default();
        sched.schedule(
            FnTask::new("once", |log: &mut Log, now: u64| {
                log.lines.push(format!("once {}", now));
                Reschedule::Cancel
            }),
            Duration::from_millis(100),
            1000,
        );

        assert_eq!(sched.next_deadline(), Some(1100));
        assert_eq!(sched.run(&mut log, 1099), 0);
        assert_eq!(sched.run(&mut log, 1100), 1);
        assert!(sched.is_empty());
        assert_eq!(sched.next_deadline(), None);
        assert_eq!(log.lines, vec!["once 1100"]);
    }

    #[test]
    fn test_periodic_rebases_on_run_time() {
        let mut sched = Scheduler::new();
        let mut log = Log::default();
        sched.schedule(
            Periodic {
                every: Duration::from_secs(1),
                left: 3,
            },
            Duration::from_secs(1),
            0,
        );

        // run late: next deadline is relative to the actual run time
        sched.run(&mut log, 1500);
        assert_eq!(sched.next_deadline(), Some(2500));
        sched.run(&mut log, 2500);
        sched.run(&mut log, 3500);
        assert!(sched.is_empty());
        assert_eq!(log.lines, vec!["tick 1500", "tick 2500", "tick 3500"]);
    }

    #[test]
    fn test_zero_delay_runs_next_pass() {
        let mut sched = Scheduler::new();
        let mut log = Log::default();
        sched.schedule(
            Periodic {
                every: Duration::ZERO,
                left: 2,
            },
            Duration::ZERO,
            10,
        );
        // single pass per call, even with a zero reschedule
        assert_eq!(sched.run(&mut log, 10), 1);
        assert_eq!(sched.next_deadline(), Some(10));
        assert_eq!(sched.run(&mut log, 10), 1);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_earliest_deadline_and_stop() {
        let mut sched: Scheduler<Log> = Scheduler::new();
        for (name, ms) in [("a", 300u64), ("b", 100), ("c", 200)] {
            sched.schedule(
                FnTask::new(name, |_: &mut Log, _: u64| Reschedule::Cancel),
                Duration::from_millis(ms),
                0,
            );
        }
        assert_eq!(sched.len(), 3);
        assert_eq!(sched.next_deadline(), Some(100));
        let names: Vec<&str> = sched.pending().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        sched.stop();
        assert!(sched.is_empty());
        assert_eq!(sched.next_deadline(), None);
    }

    #[test]
    fn test_absorb_keeps_deadlines() {
        let mut main: Scheduler<Log> = Scheduler::new();
        let mut spawned: Scheduler<Log> = Scheduler::new();
        main.schedule(
            FnTask::new("main", |_: &mut Log, _: u64| Reschedule::Cancel),
            Duration::from_millis(500),
            0,
        );
        spawned.schedule(
            FnTask::new("spawned", |_: &mut Log, _: u64| Reschedule::Cancel),
            Duration::from_millis(50),
            20,
        );
        main.absorb(spawned);
        assert_eq!(main.len(), 2);
        assert_eq!(main.next_deadline(), Some(70));
    }
}

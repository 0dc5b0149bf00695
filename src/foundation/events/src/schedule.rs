use std::{
	io, mem,
	panic::{self, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
		Arc,
	},
	thread,
};

use crucible_util::debug::error::panic_payload_message;
use parking_lot::Mutex;
use thiserror::Error;

// === Scheduler === //

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum ScheduleError {
	#[error("the scheduler has been shut down")]
	ShutDown,

	#[error("failed to spawn a concurrent lane")]
	Spawn(#[source] io::Error),
}

/// The two primitives the event subsystem needs from whatever drives the game's ticks.
pub trait Scheduler: Send + Sync {
	/// Runs `task` on the synchronous tick lane once `delay` units of scheduler time have elapsed.
	/// A zero delay means "the next tick". Tasks submitted while a tick is running never run during
	/// that same tick.
	fn schedule_on_tick_lane(&self, task: Task, delay: f64) -> Result<(), ScheduleError>;

	/// Starts `task` on a fresh lane and returns immediately.
	fn run_concurrently(&self, task: Task) -> Result<(), ScheduleError>;
}

// === TickScheduler === //

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	pub lane_name_prefix: String,
	pub lane_stack_size: Option<usize>,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			lane_name_prefix: "event-lane".to_string(),
			lane_stack_size: None,
		}
	}
}

// Absorbs rounding when delays are multiples of a fractional tick delta.
const DUE_EPSILON: f64 = 1e-9;

struct PendingTask {
	remaining: f64,
	task: Task,
}

/// A [Scheduler] whose tick lane is whichever thread calls [run_tick](TickScheduler::run_tick) and
/// whose concurrent lanes are dedicated OS threads.
pub struct TickScheduler {
	config: SchedulerConfig,
	pending: Mutex<Vec<PendingTask>>,
	shut_down: AtomicBool,
	tick: AtomicU64,
	lane_counter: AtomicU64,
	lane_stats: Arc<LaneStats>,
}

#[derive(Default)]
struct LaneStats {
	active: AtomicUsize,
	failed: AtomicUsize,
}

impl Default for TickScheduler {
	fn default() -> Self {
		Self::new(SchedulerConfig::default())
	}
}

impl TickScheduler {
	pub fn new(config: SchedulerConfig) -> Self {
		Self {
			config,
			pending: Mutex::new(Vec::new()),
			shut_down: AtomicBool::new(false),
			tick: AtomicU64::new(0),
			lane_counter: AtomicU64::new(0),
			lane_stats: Arc::default(),
		}
	}

	pub fn config(&self) -> &SchedulerConfig {
		&self.config
	}

	/// The number of ticks completed so far.
	pub fn current_tick(&self) -> u64 {
		self.tick.load(Ordering::Acquire)
	}

	pub fn pending_tasks(&self) -> usize {
		self.pending.lock().len()
	}

	pub fn active_lanes(&self) -> usize {
		self.lane_stats.active.load(Ordering::Acquire)
	}

	/// The number of concurrent lanes that panicked. Handlers that return an error are logged and
	/// finalized by their lane without panicking, so they are not counted here.
	pub fn failed_lanes(&self) -> usize {
		self.lane_stats.failed.load(Ordering::Acquire)
	}

	pub fn is_shut_down(&self) -> bool {
		self.shut_down.load(Ordering::Acquire)
	}

	/// Advances scheduler time by `delta` and runs every tick-lane task that became due, in the
	/// order they were submitted. The calling thread acts as the tick lane for the duration of the
	/// call.
	pub fn run_tick(&self, delta: f64) -> usize {
		let due = {
			let mut pending = self.pending.lock();
			let mut due = Vec::new();

			for mut entry in mem::take(&mut *pending) {
				entry.remaining -= delta;
				if entry.remaining <= DUE_EPSILON {
					due.push(entry.task);
				} else {
					pending.push(entry);
				}
			}

			due
		};

		// The queue lock is released here so that tasks may schedule follow-ups (which land in the
		// next tick).
		let ran = due.len();
		for task in due {
			task();
		}

		let tick = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
		if ran > 0 {
			log::trace!("Tick {tick} ran {ran} task{}", if ran == 1 { "" } else { "s" });
		}

		ran
	}

	/// Rejects every later submission and drops all pending tick-lane tasks, returning how many
	/// were dropped.
	pub fn shutdown(&self) -> usize {
		self.shut_down.store(true, Ordering::Release);

		let dropped = mem::take(&mut *self.pending.lock());
		let count = dropped.len();
		drop(dropped);

		if count > 0 {
			log::warn!(
				"Dropped {count} pending tick task{} during scheduler shutdown",
				if count == 1 { "" } else { "s" },
			);
		}

		count
	}
}

impl Scheduler for TickScheduler {
	fn schedule_on_tick_lane(&self, task: Task, delay: f64) -> Result<(), ScheduleError> {
		let mut pending = self.pending.lock();

		// Checked under the queue lock so that `shutdown` cannot miss a task.
		if self.is_shut_down() {
			return Err(ScheduleError::ShutDown);
		}

		let remaining = if delay.is_nan() { 0. } else { delay.max(0.) };
		pending.push(PendingTask { remaining, task });

		Ok(())
	}

	fn run_concurrently(&self, task: Task) -> Result<(), ScheduleError> {
		if self.is_shut_down() {
			return Err(ScheduleError::ShutDown);
		}

		let index = self.lane_counter.fetch_add(1, Ordering::Relaxed);
		let mut builder =
			thread::Builder::new().name(format!("{}-{index}", self.config.lane_name_prefix));

		if let Some(stack_size) = self.config.lane_stack_size {
			builder = builder.stack_size(stack_size);
		}

		let stats = self.lane_stats.clone();
		stats.active.fetch_add(1, Ordering::AcqRel);

		let spawned = builder.spawn({
			let stats = stats.clone();
			move || {
				if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
					stats.failed.fetch_add(1, Ordering::AcqRel);
					log::error!(
						"Concurrent lane {:?} panicked: {}",
						thread::current().name().unwrap_or("<unnamed>"),
						panic_payload_message(&*payload),
					);
				}
				stats.active.fetch_sub(1, Ordering::AcqRel);
			}
		});

		match spawned {
			// Lanes may block indefinitely on their suspension points so they are never joined.
			Ok(_detached) => Ok(()),
			Err(err) => {
				stats.active.fetch_sub(1, Ordering::AcqRel);
				Err(ScheduleError::Spawn(err))
			}
		}
	}
}

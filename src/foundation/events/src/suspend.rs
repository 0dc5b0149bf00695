//! Suspension of event handlers across scheduler ticks.
//!
//! A suspension-aware handler runs on its own lane. Whenever it suspends, it hands the tick lane
//! back and asks the scheduler for a resume task. When that task runs, it sends the handler a
//! held-tick token over a one-shot channel and then blocks the tick lane until the token comes back.
//! The handler's continuation therefore runs while the tick it resumed in is held open, which
//! keeps it from racing the rest of the simulation. The token returns either when the handler
//! suspends again or when the handle is finalized.
//!
//! ```text
//!            suspend                 resume task runs          suspend / finalize
//! Created ──────────► AwaitingTick ─────────────────► Resumed ───────────────────► ...
//!    │                                                                              │
//!    └──────────────────────────── finalize ─────────────────────────────► Final ◄──┘
//! ```

use std::{
	fmt,
	future::Future,
	mem,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use crucible_util::sync::Signal;
use futures::{channel::oneshot, executor::block_on};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::schedule::{ScheduleError, Scheduler};

// === Errors === //

#[derive(Debug, Error)]
pub enum SuspendError {
	#[error("failed to schedule the resuming tick")]
	Schedule(#[from] ScheduleError),

	#[error("the resuming tick was dropped before it ran")]
	Abandoned,

	#[error("the suspension handle has already been finalized")]
	Finalized,
}

// === Phase === //

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum Phase {
	/// The handler has not suspended yet.
	Created,

	/// The handler is blocked until its resume task runs on the tick lane.
	AwaitingTick,

	/// The handler's continuation is running and holds the tick it resumed in.
	Resumed,

	/// Terminal. Every waiter on the handle's completion has been released.
	Final,
}

/// Ownership of a tick lane that is blocked on a resumed continuation.
struct HeldTick(oneshot::Sender<()>);

impl HeldTick {
	fn release(self) {
		// The tick lane only stops listening if it was torn down, in which case there is nothing
		// left to release.
		let _ = self.0.send(());
	}
}

enum PhaseState {
	Created,
	AwaitingTick,
	Resumed(HeldTick),
	Final,
}

impl PhaseState {
	fn phase(&self) -> Phase {
		match self {
			Self::Created => Phase::Created,
			Self::AwaitingTick => Phase::AwaitingTick,
			Self::Resumed(_) => Phase::Resumed,
			Self::Final => Phase::Final,
		}
	}
}

// === SuspensionHandle === //

/// Lets a suspension-aware handler pause for scheduler ticks.
///
/// ## Hazards
///
/// Nothing here times out. A handler whose resume task never runs (because the scheduler is never
/// ticked again) stays blocked, as does anything waiting on [wait_final](Self::wait_final). A
/// handler that turns [auto-completion](Self::set_auto_complete) off takes on the duty of calling
/// [finalize](Self::finalize); forgetting to do so starves every completion callback waiting on
/// this handle.
#[derive(Clone)]
pub struct SuspensionHandle(Arc<HandleInner>);

struct HandleInner {
	scheduler: Arc<dyn Scheduler>,
	state: Mutex<HandleState>,
	changed: Condvar,
	auto_complete: AtomicBool,
}

struct HandleState {
	phase: PhaseState,
	first_pass: bool,
	used: bool,
}

impl SuspensionHandle {
	pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
		Self(Arc::new(HandleInner {
			scheduler,
			state: Mutex::new(HandleState {
				phase: PhaseState::Created,
				first_pass: false,
				used: false,
			}),
			changed: Condvar::new(),
			auto_complete: AtomicBool::new(true),
		}))
	}

	pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
		&self.0.scheduler
	}

	pub fn phase(&self) -> Phase {
		self.0.state.lock().phase.phase()
	}

	/// Whether the handler has ever suspended through this handle.
	pub fn was_used(&self) -> bool {
		self.0.state.lock().used
	}

	pub fn is_first_pass_done(&self) -> bool {
		self.0.state.lock().first_pass
	}

	pub fn is_final(&self) -> bool {
		matches!(self.0.state.lock().phase, PhaseState::Final)
	}

	pub fn auto_complete(&self) -> bool {
		self.0.auto_complete.load(Ordering::Acquire)
	}

	/// Controls whether the handle is finalized automatically once the handler returns. Turning
	/// this off makes the handler responsible for calling [finalize](Self::finalize).
	pub fn set_auto_complete(&self, auto_complete: bool) {
		self.0.auto_complete.store(auto_complete, Ordering::Release);
	}

	// === Suspension === //

	/// Suspends the calling lane until `delay` units of scheduler time have passed. The
	/// continuation runs while holding the tick it resumed in.
	///
	/// The resume task is queued before the first pass is reported and before any held tick is
	/// handed back, so the delay counts from the tick the handler suspended in.
	pub fn suspend_for_delay(&self, delay: f64) -> Result<(), SuspendError> {
		self.mark_used()?;

		let (resume_tx, resume_rx) = oneshot::channel::<HeldTick>();

		let scheduled = self.0.scheduler.schedule_on_tick_lane(
			Box::new(move || {
				let (release_tx, release_rx) = oneshot::channel();

				if resume_tx.send(HeldTick(release_tx)).is_err() {
					log::debug!("Suspended handler went away before its tick arrived");
					return;
				}

				if block_on(release_rx).is_err() {
					log::warn!("Resumed handler dropped its tick without releasing it");
				}
			}),
			delay,
		);

		// Even if scheduling failed, the firer and the held tick must not stay blocked on us.
		self.hand_back_tick();
		scheduled?;

		let tick = block_on(resume_rx).map_err(|_| SuspendError::Abandoned)?;
		self.resume(tick);

		Ok(())
	}

	/// Suspends until `signal` is set and then for at least one more tick, even if the signal was
	/// already set.
	pub fn suspend_until(&self, signal: &Signal) -> Result<(), SuspendError> {
		self.mark_used()?;
		self.hand_back_tick();
		signal.wait();
		self.suspend_for_delay(0.)
	}

	/// Suspends until `future` completes and then for at least one more tick.
	pub fn suspend_on<F: Future>(&self, future: F) -> Result<F::Output, SuspendError> {
		self.mark_used()?;
		self.hand_back_tick();
		let output = block_on(future);
		self.suspend_for_delay(0.)?;
		Ok(output)
	}

	fn mark_used(&self) -> Result<(), SuspendError> {
		let mut state = self.0.state.lock();

		if matches!(state.phase, PhaseState::Final) {
			return Err(SuspendError::Finalized);
		}

		state.used = true;
		Ok(())
	}

	/// Reports the first pass and gives back the tick this handler resumed in, if any.
	fn hand_back_tick(&self) {
		let mut state = self.0.state.lock();
		state.first_pass = true;

		match mem::replace(&mut state.phase, PhaseState::AwaitingTick) {
			PhaseState::Resumed(tick) => tick.release(),
			// Finalized from elsewhere in the meantime; the resume task will see that.
			PhaseState::Final => state.phase = PhaseState::Final,
			PhaseState::Created | PhaseState::AwaitingTick => {}
		}

		self.0.changed.notify_all();
	}

	fn resume(&self, tick: HeldTick) {
		let mut state = self.0.state.lock();

		if matches!(state.phase, PhaseState::Final) {
			// Someone else finalized us while we were waiting.
			tick.release();
		} else {
			state.phase = PhaseState::Resumed(tick);
			self.0.changed.notify_all();
		}
	}

	// === Completion === //

	/// Records that the handler finished its synchronous portion without necessarily suspending.
	pub(crate) fn mark_first_pass(&self) {
		let mut state = self.0.state.lock();
		if !state.first_pass {
			state.first_pass = true;
			self.0.changed.notify_all();
		}
	}

	/// Drives the handle to its terminal state, releasing any tick it holds. Calling this more than
	/// once has no further effect.
	pub fn finalize(&self) {
		let mut state = self.0.state.lock();
		state.first_pass = true;

		if let PhaseState::Resumed(tick) = mem::replace(&mut state.phase, PhaseState::Final) {
			tick.release();
		}

		self.0.changed.notify_all();
	}

	pub fn wait_first_pass(&self) {
		let mut state = self.0.state.lock();
		while !state.first_pass {
			self.0.changed.wait(&mut state);
		}
	}

	pub fn wait_final(&self) {
		let mut state = self.0.state.lock();
		while !matches!(state.phase, PhaseState::Final) {
			self.0.changed.wait(&mut state);
		}
	}

	/// Returns `true` if the handle became final before the timeout elapsed.
	pub fn wait_final_timeout(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		let mut state = self.0.state.lock();

		while !matches!(state.phase, PhaseState::Final) {
			if self.0.changed.wait_until(&mut state, deadline).timed_out() {
				return matches!(state.phase, PhaseState::Final);
			}
		}

		true
	}
}

impl fmt::Debug for SuspensionHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = self.0.state.lock();

		f.debug_struct("SuspensionHandle")
			.field("phase", &state.phase.phase())
			.field("first_pass", &state.first_pass)
			.field("used", &state.used)
			.field("auto_complete", &self.auto_complete())
			.finish()
	}
}

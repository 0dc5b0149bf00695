use std::{
	fmt,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use derive_where::derive_where;

use crate::schedule::Scheduler;

// === FiringContext === //

/// What a single handler sees during a single firing.
///
/// Every handler of one firing shares the same payload instance so mutations made by a handler are
/// visible to the handlers that run after it. Once handlers resume from a suspension they may run
/// concurrently with one another, so payload mutation goes through the payload's own
/// synchronization.
#[derive_where(Clone)]
pub struct FiringContext<T> {
	priority: f64,
	payload: Arc<T>,
	scheduler: Arc<dyn Scheduler>,
}

impl<T> FiringContext<T> {
	pub fn new(priority: f64, payload: Arc<T>, scheduler: Arc<dyn Scheduler>) -> Self {
		Self {
			priority,
			payload,
			scheduler,
		}
	}

	/// The priority of the handler being invoked. This describes the handler's slot in the
	/// dispatch order and says nothing about when a resumed continuation runs.
	pub fn priority(&self) -> f64 {
		self.priority
	}

	pub fn payload(&self) -> &T {
		&self.payload
	}

	pub fn payload_arc(&self) -> &Arc<T> {
		&self.payload
	}

	pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
		&self.scheduler
	}
}

impl<T: fmt::Debug> fmt::Debug for FiringContext<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FiringContext")
			.field("priority", &self.priority)
			.field("payload", &self.payload)
			.finish_non_exhaustive()
	}
}

// === Cancellation === //

/// An advisory cancellation marker a payload may expose.
///
/// Channels never read this: every handler still runs. Later handlers are expected to check it
/// and suppress their own effects.
pub trait Cancellable {
	fn is_cancelled(&self) -> bool;

	fn set_cancelled(&self, cancelled: bool);

	fn cancel(&self) {
		self.set_cancelled(true);
	}
}

#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
	pub const fn new() -> Self {
		Self(AtomicBool::new(false))
	}
}

impl Cancellable for CancelFlag {
	fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::Acquire)
	}

	fn set_cancelled(&self, cancelled: bool) {
		self.0.store(cancelled, Ordering::Release);
	}
}

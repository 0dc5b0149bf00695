use std::{fmt, sync::Arc};

use crucible_util::debug::error::ErrorFormatExt;
use derive_where::derive_where;
use parking_lot::RwLock;
use thiserror::Error;

use crate::{
	context::FiringContext,
	handler::{Handler, HandlerRegistration, Origin, RegistrationRef},
	schedule::{ScheduleError, Scheduler},
	suspend::SuspensionHandle,
};

// === FireError === //

#[derive(Debug, Error)]
pub enum FireError {
	/// A plain handler failed. Handlers after it in the dispatch order were not invoked.
	#[error("event handler at priority {priority} (origin {origin}) failed")]
	Handler {
		priority: f64,
		origin: Origin,
		#[source]
		source: anyhow::Error,
	},

	#[error("failed to submit event work to the scheduler")]
	Schedule(#[from] ScheduleError),
}

// === EventChannel === //

/// An addressable event with a priority-ordered list of handlers.
///
/// Handlers with lower priorities fire first and handlers with equal priorities fire in the order
/// they were registered. Firing works on a snapshot of the handler list, so handlers may register
/// and unregister handlers on the channel they were fired from; the change applies to the next
/// firing.
#[derive_where(Default)]
pub struct EventChannel<T> {
	registrations: RwLock<Vec<Arc<HandlerRegistration<T>>>>,
}

impl<T> fmt::Debug for EventChannel<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventChannel")
			.field("registrations", &self.registrations())
			.finish()
	}
}

impl<T> EventChannel<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, handler: Handler<T>, origin: Origin, priority: f64) -> RegistrationRef {
		let registration = HandlerRegistration::new(handler, origin, priority);
		let described = registration.describe();

		let mut registrations = self.registrations.write();
		registrations.push(Arc::new(registration));

		// `sort_by` is stable so equal priorities keep their insertion order.
		registrations.sort_by(|a, b| a.priority().total_cmp(&b.priority()));
		drop(registrations);

		log::debug!(
			"Registered {:?} handler {:?} at priority {} for {}",
			described.kind(),
			described.id(),
			described.priority(),
			described.origin(),
		);

		described
	}

	pub fn add_plain(
		&self,
		handler: impl Fn(&FiringContext<T>) -> anyhow::Result<()> + Send + Sync + 'static,
		origin: Origin,
		priority: f64,
	) -> RegistrationRef {
		self.register(Handler::plain(handler), origin, priority)
	}

	pub fn add_suspending(
		&self,
		handler: impl Fn(&FiringContext<T>, &SuspensionHandle) -> anyhow::Result<()>
			+ Send
			+ Sync
			+ 'static,
		origin: Origin,
		priority: f64,
	) -> RegistrationRef {
		self.register(Handler::suspending(handler), origin, priority)
	}

	/// Removes every handler installed by `origin`, returning how many were removed.
	pub fn unregister_by_origin(&self, origin: &Origin) -> usize {
		let mut registrations = self.registrations.write();
		let before = registrations.len();
		registrations.retain(|registration| registration.origin() != origin);
		let removed = before - registrations.len();
		drop(registrations);

		if removed > 0 {
			log::debug!(
				"Removed {removed} handler{} installed by {origin}",
				if removed == 1 { "" } else { "s" },
			);
		}

		removed
	}

	/// Removes every handler, returning how many were removed.
	pub fn clear(&self) -> usize {
		let removed = std::mem::take(&mut *self.registrations.write()).len();
		log::debug!("Cleared {removed} handler{}", if removed == 1 { "" } else { "s" });
		removed
	}

	/// Whether firing would invoke anything. Callers use this to skip building a payload nobody
	/// would see.
	pub fn has_handlers(&self) -> bool {
		!self.registrations.read().is_empty()
	}

	pub fn handler_count(&self) -> usize {
		self.registrations.read().len()
	}

	/// Describes every registered handler in firing order.
	pub fn registrations(&self) -> Vec<RegistrationRef> {
		self.registrations
			.read()
			.iter()
			.map(|registration| registration.describe())
			.collect()
	}

	fn snapshot(&self) -> Vec<Arc<HandlerRegistration<T>>> {
		self.registrations.read().clone()
	}
}

impl<T: 'static + Send + Sync> EventChannel<T> {
	/// Invokes every handler in priority order and returns once each of them has run its
	/// synchronous portion. Suspended handlers keep going on their own lanes.
	///
	/// The first plain handler to fail stops the dispatch and its error is returned.
	pub fn fire(&self, scheduler: &Arc<dyn Scheduler>, payload: Arc<T>) -> Result<(), FireError> {
		for registration in self.snapshot() {
			// Dropping the handle leaves the handler running; nobody is waiting on it.
			let _ = self.invoke_one(&registration, scheduler, &payload)?;
		}

		Ok(())
	}

	/// Like [fire](Self::fire), but also runs `on_complete` on the scheduler's tick lane once
	/// every suspended handler has been finalized.
	///
	/// `on_complete` always runs on the tick lane, even if no handler suspended (in which case it
	/// runs on the next tick). If a plain handler fails, the error is returned and `on_complete`
	/// never runs.
	pub fn fire_awaiting_completion(
		&self,
		scheduler: &Arc<dyn Scheduler>,
		payload: Arc<T>,
		on_complete: impl FnOnce() + Send + 'static,
	) -> Result<(), FireError> {
		let mut pending = Vec::new();

		for registration in self.snapshot() {
			if let Some(handle) = self.invoke_one(&registration, scheduler, &payload)? {
				pending.push(handle);
			}
		}

		if pending.is_empty() {
			scheduler.schedule_on_tick_lane(Box::new(on_complete), 0.)?;
			return Ok(());
		}

		log::trace!(
			"Awaiting {} suspended handler{} before completing",
			pending.len(),
			if pending.len() == 1 { "" } else { "s" },
		);

		let tick_lane = scheduler.clone();
		scheduler.run_concurrently(Box::new(move || {
			// Waiting order doesn't matter since we only care about all of them being done.
			for handle in &pending {
				handle.wait_final();
			}

			match tick_lane.schedule_on_tick_lane(Box::new(on_complete), 0.) {
				Ok(()) => {}
				Err(ScheduleError::ShutDown) => {
					log::debug!("Dropped an event completion callback during scheduler shutdown");
				}
				Err(err) => err.log_at(log::Level::Error, "Event completion callback was lost"),
			}
		}))?;

		Ok(())
	}

	fn invoke_one(
		&self,
		registration: &HandlerRegistration<T>,
		scheduler: &Arc<dyn Scheduler>,
		payload: &Arc<T>,
	) -> Result<Option<SuspensionHandle>, FireError> {
		log::trace!(
			"Invoking {:?} handler {:?} (priority {}, origin {})",
			registration.kind(),
			registration.id(),
			registration.priority(),
			registration.origin(),
		);

		registration.invoke(FiringContext::new(
			registration.priority(),
			payload.clone(),
			scheduler.clone(),
		))
	}
}

#[cfg(test)]
mod tests {
	use std::{
		sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
		thread,
		time::{Duration, Instant},
	};

	use parking_lot::Mutex;

	use super::*;
	use crate::{
		context::{CancelFlag, Cancellable},
		handler::HandlerKind,
		schedule::TickScheduler,
	};

	fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
		let deadline = Instant::now() + Duration::from_secs(5);
		while !cond() {
			assert!(Instant::now() < deadline, "timed out waiting for {what}");
			thread::sleep(Duration::from_millis(1));
		}
	}

	fn scheduler() -> (Arc<TickScheduler>, Arc<dyn Scheduler>) {
		let tick = Arc::new(TickScheduler::default());
		let dyn_sched: Arc<dyn Scheduler> = tick.clone();
		(tick, dyn_sched)
	}

	#[derive(Default)]
	struct Counter {
		count: AtomicU32,
		order: Mutex<Vec<&'static str>>,
	}

	impl Counter {
		fn hit(&self, name: &'static str) {
			self.count.fetch_add(1, Ordering::SeqCst);
			self.order.lock().push(name);
		}
	}

	fn counting(name: &'static str) -> Handler<Counter> {
		Handler::plain(move |cx: &FiringContext<Counter>| {
			cx.payload().hit(name);
			Ok(())
		})
	}

	#[test]
	fn fires_in_priority_order_with_stable_ties() {
		let (_tick, sched) = scheduler();
		let channel = EventChannel::new();
		let origin = Origin::named("test");

		channel.register(counting("p5"), origin.clone(), 5.);
		channel.register(counting("p1-first"), origin.clone(), 1.);
		channel.register(counting("p1-second"), origin.clone(), 1.);
		channel.register(counting("p10"), origin.clone(), 10.);

		let payload = Arc::new(Counter::default());
		channel.fire(&sched, payload.clone()).unwrap();

		assert_eq!(*payload.order.lock(), ["p1-first", "p1-second", "p5", "p10"]);
		assert_eq!(payload.count.load(Ordering::SeqCst), 4);

		let priorities = channel
			.registrations()
			.iter()
			.map(|registration| registration.priority())
			.collect::<Vec<_>>();
		assert_eq!(priorities, [1., 1., 5., 10.]);
	}

	#[test]
	fn handlers_see_their_own_priority() {
		let (_tick, sched) = scheduler();
		let channel = EventChannel::<Mutex<Vec<f64>>>::new();

		for priority in [3., -1., 0.5] {
			channel.add_plain(
				|cx| {
					cx.payload().lock().push(cx.priority());
					Ok(())
				},
				Origin::unique(),
				priority,
			);
		}

		let payload = Arc::new(Mutex::new(Vec::new()));
		channel.fire(&sched, payload.clone()).unwrap();
		assert_eq!(*payload.lock(), [-1., 0.5, 3.]);
	}

	#[test]
	fn unregistering_removes_all_and_only_matching_origins() {
		let (_tick, sched) = scheduler();
		let channel = EventChannel::new();
		let physics = Origin::unique();
		let render = Origin::named("render");

		channel.register(counting("physics-a"), physics.clone(), 1.);
		channel.register(counting("render"), render.clone(), 2.);
		channel.register(counting("physics-b"), physics.clone(), 3.);

		assert_eq!(channel.unregister_by_origin(&physics), 2);
		assert_eq!(channel.unregister_by_origin(&physics), 0);
		assert_eq!(channel.unregister_by_origin(&Origin::named("nobody")), 0);
		assert_eq!(channel.handler_count(), 1);

		let payload = Arc::new(Counter::default());
		channel.fire(&sched, payload.clone()).unwrap();
		assert_eq!(*payload.order.lock(), ["render"]);

		assert_eq!(channel.unregister_by_origin(&Origin::named("render")), 1);
		assert!(!channel.has_handlers());
	}

	#[test]
	fn empty_channel_still_completes_on_the_tick_lane() {
		let (tick, sched) = scheduler();
		let channel = EventChannel::<()>::new();
		assert!(!channel.has_handlers());

		channel.fire(&sched, Arc::new(())).unwrap();

		let done = Arc::new(AtomicBool::new(false));
		channel
			.fire_awaiting_completion(&sched, Arc::new(()), {
				let done = done.clone();
				move || done.store(true, Ordering::SeqCst)
			})
			.unwrap();

		assert!(!done.load(Ordering::SeqCst));
		assert_eq!(tick.run_tick(1.), 1);
		assert!(done.load(Ordering::SeqCst));
	}

	#[test]
	fn plain_only_completion_hops_through_the_tick_lane() {
		let (tick, sched) = scheduler();
		let channel = EventChannel::new();
		channel.register(counting("a"), Origin::unique(), 0.);
		channel.register(counting("b"), Origin::unique(), 1.);

		let payload = Arc::new(Counter::default());
		let completed_on = Arc::new(Mutex::new(None));
		channel
			.fire_awaiting_completion(&sched, payload.clone(), {
				let completed_on = completed_on.clone();
				move || *completed_on.lock() = Some(thread::current().id())
			})
			.unwrap();

		assert_eq!(payload.count.load(Ordering::SeqCst), 2);
		assert!(completed_on.lock().is_none());

		tick.run_tick(1.);
		assert_eq!(*completed_on.lock(), Some(thread::current().id()));
	}

	#[test]
	fn completion_waits_for_suspended_handlers() {
		let (tick, sched) = scheduler();
		let channel = EventChannel::<AtomicU32>::new();

		channel.add_suspending(
			|cx, handle| {
				handle.suspend_for_delay(3.)?;
				cx.payload().fetch_add(1, Ordering::SeqCst);
				Ok(())
			},
			Origin::unique(),
			0.,
		);

		let completed_at = Arc::new(AtomicU64::new(u64::MAX));
		let payload = Arc::new(AtomicU32::new(0));
		channel
			.fire_awaiting_completion(&sched, payload.clone(), {
				let tick = tick.clone();
				let completed_at = completed_at.clone();
				move || completed_at.store(tick.current_tick(), Ordering::SeqCst)
			})
			.unwrap();

		for _ in 0..3 {
			tick.run_tick(1.);
			assert_eq!(completed_at.load(Ordering::SeqCst), u64::MAX);
		}

		wait_until("completion", || {
			tick.run_tick(1.);
			completed_at.load(Ordering::SeqCst) != u64::MAX
		});

		assert_eq!(payload.load(Ordering::SeqCst), 1);
		assert!(completed_at.load(Ordering::SeqCst) >= 3);
	}

	#[test]
	fn synchronous_portions_run_in_priority_order() {
		let (tick, sched) = scheduler();
		let channel = EventChannel::<Mutex<Vec<&'static str>>>::new();

		channel.add_plain(
			|cx| {
				cx.payload().lock().push("plain");
				Ok(())
			},
			Origin::unique(),
			2.,
		);
		channel.add_suspending(
			|cx, handle| {
				cx.payload().lock().push("suspending-start");
				handle.suspend_for_delay(1.)?;
				cx.payload().lock().push("suspending-resume");
				Ok(())
			},
			Origin::unique(),
			1.,
		);

		let payload = Arc::new(Mutex::new(Vec::new()));
		channel.fire(&sched, payload.clone()).unwrap();
		assert_eq!(*payload.lock(), ["suspending-start", "plain"]);

		tick.run_tick(1.);
		assert_eq!(*payload.lock(), ["suspending-start", "plain", "suspending-resume"]);
	}

	#[test]
	fn zero_delay_continuation_never_runs_inline() {
		let (tick, sched) = scheduler();
		let channel = EventChannel::<AtomicBool>::new();

		channel.add_suspending(
			|cx, handle| {
				handle.suspend_for_delay(0.)?;
				cx.payload().store(true, Ordering::SeqCst);
				Ok(())
			},
			Origin::unique(),
			0.,
		);

		let resumed = Arc::new(AtomicBool::new(false));
		channel.fire(&sched, resumed.clone()).unwrap();

		thread::sleep(Duration::from_millis(20));
		assert!(!resumed.load(Ordering::SeqCst));

		tick.run_tick(1.);
		assert!(resumed.load(Ordering::SeqCst));
	}

	#[test]
	fn suspended_handlers_resume_in_lock_step_with_ticks() {
		let (tick, sched) = scheduler();
		let channel = EventChannel::<Mutex<Vec<(&'static str, u64)>>>::new();

		channel.add_suspending(
			{
				let tick = tick.clone();
				move |cx, handle| {
					handle.suspend_for_delay(1.)?;
					cx.payload().lock().push(("delayed", tick.current_tick()));
					Ok(())
				}
			},
			Origin::named("delayed"),
			0.,
		);
		channel.add_suspending(
			{
				let tick = tick.clone();
				move |cx, handle| {
					for _ in 0..3 {
						handle.suspend_for_delay(0.)?;
						cx.payload().lock().push(("stepper", tick.current_tick()));
					}
					Ok(())
				}
			},
			Origin::named("stepper"),
			1.,
		);

		let payload = Arc::new(Mutex::new(Vec::new()));
		channel.fire(&sched, payload.clone()).unwrap();

		// Each continuation runs inside the tick it was due in, before that tick's counter bump.
		for _ in 0..3 {
			tick.run_tick(1.);
		}

		let mut seen = payload.lock().clone();
		seen.sort();
		assert_eq!(
			seen,
			[("delayed", 0), ("stepper", 0), ("stepper", 1), ("stepper", 2)]
		);
		assert_eq!(tick.pending_tasks(), 0);
	}

	#[test]
	fn plain_handler_errors_stop_dispatch() {
		let (_tick, sched) = scheduler();
		let channel = EventChannel::new();

		channel.register(counting("before"), Origin::unique(), 0.);
		channel.add_plain(
			|_| Err(anyhow::anyhow!("refused")),
			Origin::named("faulty"),
			1.,
		);
		channel.register(counting("after"), Origin::unique(), 2.);

		let payload = Arc::new(Counter::default());
		let err = channel.fire(&sched, payload.clone()).unwrap_err();

		assert!(matches!(err, FireError::Handler { priority, .. } if priority == 1.));
		assert_eq!(*payload.order.lock(), ["before"]);
	}

	#[test]
	fn cancellation_is_advisory() {
		#[derive(Default)]
		struct Spawn {
			cancelled: CancelFlag,
			spawned: AtomicBool,
			handlers_ran: AtomicU32,
		}

		let (_tick, sched) = scheduler();
		let channel = EventChannel::<Spawn>::new();

		channel.add_plain(
			|cx| {
				cx.payload().handlers_ran.fetch_add(1, Ordering::SeqCst);
				cx.payload().cancelled.cancel();
				Ok(())
			},
			Origin::named("guard"),
			0.,
		);
		channel.add_plain(
			|cx| {
				let payload = cx.payload();
				payload.handlers_ran.fetch_add(1, Ordering::SeqCst);
				if !payload.cancelled.is_cancelled() {
					payload.spawned.store(true, Ordering::SeqCst);
				}
				Ok(())
			},
			Origin::named("spawner"),
			1.,
		);

		let payload = Arc::new(Spawn::default());
		channel.fire(&sched, payload.clone()).unwrap();

		assert_eq!(payload.handlers_ran.load(Ordering::SeqCst), 2);
		assert!(!payload.spawned.load(Ordering::SeqCst));
	}

	#[test]
	fn handlers_may_register_during_a_firing() {
		let (_tick, sched) = scheduler();
		let channel = Arc::new(EventChannel::<Counter>::new());

		channel.add_plain(
			{
				let channel = Arc::downgrade(&channel);
				move |cx| {
					cx.payload().hit("installer");
					if let Some(channel) = channel.upgrade() {
						if channel.handler_count() == 1 {
							channel.register(counting("installed"), Origin::named("late"), -1.);
						}
					}
					Ok(())
				}
			},
			Origin::named("installer"),
			0.,
		);

		let first = Arc::new(Counter::default());
		channel.fire(&sched, first.clone()).unwrap();
		assert_eq!(*first.order.lock(), ["installer"]);

		let second = Arc::new(Counter::default());
		channel.fire(&sched, second.clone()).unwrap();
		assert_eq!(*second.order.lock(), ["installed", "installer"]);
	}

	#[test]
	fn double_finalize_completes_once() {
		let (tick, sched) = scheduler();
		let channel = EventChannel::<()>::new();

		channel.add_suspending(
			|_, handle| {
				handle.set_auto_complete(false);
				handle.suspend_for_delay(0.)?;
				handle.finalize();
				handle.finalize();
				Ok(())
			},
			Origin::unique(),
			0.,
		);

		let completions = Arc::new(AtomicU32::new(0));
		channel
			.fire_awaiting_completion(&sched, Arc::new(()), {
				let completions = completions.clone();
				move || {
					completions.fetch_add(1, Ordering::SeqCst);
				}
			})
			.unwrap();

		wait_until("completion", || {
			tick.run_tick(1.);
			completions.load(Ordering::SeqCst) > 0
		});

		for _ in 0..3 {
			tick.run_tick(1.);
		}
		assert_eq!(completions.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn clear_and_diagnostics() {
		let channel = EventChannel::<()>::new();
		let plain = channel.add_plain(|_| Ok(()), Origin::named("a"), f64::NAN);
		let suspending = channel.add_suspending(|_, _| Ok(()), Origin::named("b"), 4.);

		assert_eq!(plain.kind(), HandlerKind::Plain);
		assert_eq!(suspending.kind(), HandlerKind::Suspending);

		// NaN priorities sort after everything else.
		let ids = channel
			.registrations()
			.iter()
			.map(|registration| registration.id())
			.collect::<Vec<_>>();
		assert_eq!(ids, [suspending.id(), plain.id()]);

		assert_eq!(channel.clear(), 2);
		assert!(!channel.has_handlers());
	}
}

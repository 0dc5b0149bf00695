use std::{
	borrow::Cow,
	fmt,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	thread,
};

use crucible_util::debug::error::ErrorFormatExt;
use derive_where::derive_where;

use crate::{
	channel::FireError,
	context::FiringContext,
	suspend::{SuspendError, SuspensionHandle},
};

// === Origin === //

/// Identifies whoever installed a handler so that everything it installed can be removed at once.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum Origin {
	Unique(u64),
	Named(Cow<'static, str>),
}

impl Origin {
	pub fn unique() -> Self {
		static NEXT_ID: AtomicU64 = AtomicU64::new(0);

		Self::Unique(NEXT_ID.fetch_add(1, Ordering::Relaxed))
	}

	pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
		Self::Named(name.into())
	}
}

impl fmt::Display for Origin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Unique(id) => write!(f, "#{id}"),
			Self::Named(name) => f.write_str(name),
		}
	}
}

// === Handler === //

pub type PlainFn<T> = dyn Fn(&FiringContext<T>) -> anyhow::Result<()> + Send + Sync;

pub type SuspendingFn<T> =
	dyn Fn(&FiringContext<T>, &SuspensionHandle) -> anyhow::Result<()> + Send + Sync;

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum HandlerKind {
	Plain,
	Suspending,
}

#[derive_where(Clone)]
pub enum Handler<T> {
	/// Runs to completion on the firing caller's lane.
	Plain(Arc<PlainFn<T>>),

	/// Runs on its own lane and may suspend through the [SuspensionHandle] it is given.
	Suspending(Arc<SuspendingFn<T>>),
}

impl<T> Handler<T> {
	pub fn plain(f: impl Fn(&FiringContext<T>) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
		Self::Plain(Arc::new(f))
	}

	pub fn suspending(
		f: impl Fn(&FiringContext<T>, &SuspensionHandle) -> anyhow::Result<()> + Send + Sync + 'static,
	) -> Self {
		Self::Suspending(Arc::new(f))
	}

	pub fn kind(&self) -> HandlerKind {
		match self {
			Self::Plain(_) => HandlerKind::Plain,
			Self::Suspending(_) => HandlerKind::Suspending,
		}
	}
}

impl<T> fmt::Debug for Handler<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("Handler").field(&self.kind()).finish()
	}
}

// === RegistrationRef === //

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct RegistrationId(u64);

impl RegistrationId {
	fn next() -> Self {
		static NEXT_ID: AtomicU64 = AtomicU64::new(0);

		Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
	}
}

/// A diagnostic description of a registered handler.
#[derive(Debug, Clone)]
pub struct RegistrationRef {
	id: RegistrationId,
	priority: f64,
	origin: Origin,
	kind: HandlerKind,
}

impl RegistrationRef {
	pub fn id(&self) -> RegistrationId {
		self.id
	}

	pub fn priority(&self) -> f64 {
		self.priority
	}

	pub fn origin(&self) -> &Origin {
		&self.origin
	}

	pub fn kind(&self) -> HandlerKind {
		self.kind
	}
}

// === HandlerRegistration === //

#[derive(Debug)]
pub struct HandlerRegistration<T> {
	id: RegistrationId,
	priority: f64,
	origin: Origin,
	handler: Handler<T>,
}

impl<T> HandlerRegistration<T> {
	pub fn new(handler: Handler<T>, origin: Origin, priority: f64) -> Self {
		Self {
			id: RegistrationId::next(),
			priority,
			origin,
			handler,
		}
	}

	pub fn id(&self) -> RegistrationId {
		self.id
	}

	pub fn priority(&self) -> f64 {
		self.priority
	}

	pub fn origin(&self) -> &Origin {
		&self.origin
	}

	pub fn kind(&self) -> HandlerKind {
		self.handler.kind()
	}

	pub fn describe(&self) -> RegistrationRef {
		RegistrationRef {
			id: self.id,
			priority: self.priority,
			origin: self.origin.clone(),
			kind: self.kind(),
		}
	}
}

impl<T: 'static + Send + Sync> HandlerRegistration<T> {
	/// Runs the handler's synchronous portion.
	///
	/// Plain handlers run inline and never produce a handle. Suspension-aware handlers are started
	/// on a new lane and this call blocks only until they either return or first suspend. A handle
	/// is returned only if the handler actually suspended.
	pub fn invoke(&self, cx: FiringContext<T>) -> Result<Option<SuspensionHandle>, FireError> {
		match &self.handler {
			Handler::Plain(handler) => {
				handler(&cx).map_err(|source| FireError::Handler {
					priority: self.priority,
					origin: self.origin.clone(),
					source,
				})?;

				Ok(None)
			}
			Handler::Suspending(handler) => {
				let handle = SuspensionHandle::new(cx.scheduler().clone());
				let scheduler = cx.scheduler().clone();

				scheduler.run_concurrently(Box::new({
					let handler = handler.clone();
					let handle = handle.clone();
					let origin = self.origin.clone();
					move || run_suspending_lane(&*handler, &cx, &handle, &origin)
				}))?;

				handle.wait_first_pass();

				if handle.was_used() {
					Ok(Some(handle))
				} else {
					Ok(None)
				}
			}
		}
	}
}

/// Abandonment only happens when the scheduler is torn down under a suspended handler, which is an
/// ordinary part of shutting down.
fn lane_failure_level(err: &anyhow::Error) -> log::Level {
	match err.downcast_ref::<SuspendError>() {
		Some(SuspendError::Abandoned) => log::Level::Debug,
		_ => log::Level::Error,
	}
}

fn run_suspending_lane<T>(
	handler: &SuspendingFn<T>,
	cx: &FiringContext<T>,
	handle: &SuspensionHandle,
	origin: &Origin,
) {
	// If the handler panics, neither the firer (waiting on the first pass) nor any completion
	// aggregator (waiting on the final state) may be left blocked.
	struct FinalizeOnUnwind<'a>(&'a SuspensionHandle);

	impl Drop for FinalizeOnUnwind<'_> {
		fn drop(&mut self) {
			if thread::panicking() {
				self.0.finalize();
			}
		}
	}

	let _guard = FinalizeOnUnwind(handle);
	let result = handler(cx, handle);
	handle.mark_first_pass();

	match result {
		Ok(()) => {
			if handle.was_used() && handle.auto_complete() {
				handle.finalize();
			}
		}
		Err(err) => {
			err.log_at(
				lane_failure_level(&err),
				format_args!(
					"Suspension-aware handler (priority {}, origin {origin}) failed on its lane",
					cx.priority(),
				),
			);
			handle.finalize();
		}
	}
}

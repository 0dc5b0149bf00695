//! Priority-ordered event channels whose handlers may suspend across game ticks.
//!
//! An [EventChannel] dispatches a payload to its handlers in ascending priority order. Plain
//! handlers run to completion inside [EventChannel::fire]. Suspension-aware handlers run on their
//! own lanes and may park themselves with a [SuspensionHandle] until a later tick, at which point
//! they resume while holding the tick lane.
//!
//! Everything time-related goes through a [Scheduler]. [TickScheduler] is the stock implementation
//! whose tick lane is whichever thread calls [TickScheduler::run_tick].

pub mod channel;
pub mod context;
pub mod handler;
pub mod schedule;
pub mod suspend;

pub use self::{
	channel::{EventChannel, FireError},
	context::{CancelFlag, Cancellable, FiringContext},
	handler::{Handler, HandlerKind, Origin, RegistrationId, RegistrationRef},
	schedule::{ScheduleError, Scheduler, SchedulerConfig, Task, TickScheduler},
	suspend::{Phase, SuspendError, SuspensionHandle},
};

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

// === Signal === //

/// A manual-reset binary signal: once [set](Signal::set), every current and future waiter passes
/// until it is [reset](Signal::reset) again.
#[derive(Debug, Default)]
pub struct Signal {
	state: Mutex<bool>,
	changed: Condvar,
}

impl Signal {
	pub const fn new() -> Self {
		Self {
			state: parking_lot::const_mutex(false),
			changed: Condvar::new(),
		}
	}

	pub fn new_set() -> Self {
		let signal = Self::new();
		signal.set();
		signal
	}

	pub fn set(&self) {
		let mut state = self.state.lock();
		if !*state {
			*state = true;
			self.changed.notify_all();
		}
	}

	pub fn reset(&self) {
		*self.state.lock() = false;
	}

	pub fn is_set(&self) -> bool {
		*self.state.lock()
	}

	pub fn wait(&self) {
		let mut state = self.state.lock();
		while !*state {
			self.changed.wait(&mut state);
		}
	}

	/// Returns `true` if the signal was set before the timeout elapsed.
	pub fn wait_timeout(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		let mut state = self.state.lock();

		while !*state {
			if self.changed.wait_until(&mut state, deadline).timed_out() {
				return *state;
			}
		}

		true
	}
}

#[cfg(test)]
mod tests {
	use std::{sync::Arc, thread};

	use super::*;

	#[test]
	fn set_releases_waiters() {
		let signal = Arc::new(Signal::new());
		let waiters = (0..4)
			.map(|_| {
				let signal = signal.clone();
				thread::spawn(move || signal.wait())
			})
			.collect::<Vec<_>>();

		signal.set();

		for waiter in waiters {
			waiter.join().unwrap();
		}
	}

	#[test]
	fn reset_blocks_again() {
		let signal = Signal::new_set();
		assert!(signal.wait_timeout(Duration::from_millis(1)));

		signal.reset();
		assert!(!signal.is_set());
		assert!(!signal.wait_timeout(Duration::from_millis(20)));
	}

	#[test]
	fn set_is_idempotent() {
		let signal = Signal::new();
		signal.set();
		signal.set();
		assert!(signal.is_set());
		signal.wait();
	}
}

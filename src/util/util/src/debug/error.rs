//! Error reporting built off the Rust standard library [Error] trait.

use std::{any::Any, error::Error, fmt, path::Path};

use anyhow::Context;
use derive_where::derive_where;

// === Error formatting === //

pub trait ErrorFormatExt: Error {
	fn format_error(&self) -> FormattedError<Self> {
		FormattedError(self)
	}

	/// Logs the full cause chain at `level` underneath a `context` headline.
	fn log_at(&self, level: log::Level, context: impl fmt::Display) {
		log::log!(level, "{context}:\n{}", self.format_error());
	}
}

impl<T: ?Sized + Error> ErrorFormatExt for T {}

#[derive_where(Copy, Clone)]
pub struct FormattedError<'a, T: ?Sized>(pub &'a T);

impl<T: ?Sized + Error> fmt::Display for FormattedError<'_, T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let target = self.0;

		// Write context
		write!(f, "Error: {}", target)?;

		// Write cause chain
		let mut cause_iter = target.source();
		if cause_iter.is_some() {
			write!(f, "\n\nCaused by:")?;
		}

		while let Some(cause) = cause_iter {
			for line in cause.to_string().lines() {
				write!(f, "\n\t{}", line)?;
			}
			cause_iter = cause.source();
		}

		Ok(())
	}
}

// === Panic payloads === //

/// Extracts the message of a payload produced by [std::panic::catch_unwind] or a thread join.
pub fn panic_payload_message(payload: &(dyn Any + Send)) -> &str {
	if let Some(msg) = payload.downcast_ref::<&'static str>() {
		msg
	} else if let Some(msg) = payload.downcast_ref::<String>() {
		msg.as_str()
	} else {
		"<non-string panic payload>"
	}
}

// === MultiError === //

#[derive(Debug)]
pub struct MultiError {
	name: String,
	errors: Vec<anyhow::Error>,
}

impl Error for MultiError {}

impl fmt::Display for MultiError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"failed to complete {:?} because of {} fatal error{}",
			self.name,
			self.errors.len(),
			if self.errors.len() == 1 { "" } else { "s" }
		)?;

		for error in &self.errors {
			write!(f, "\n\t- {error:#}")?;
		}

		Ok(())
	}
}

impl MultiError {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			errors: Vec::new(),
		}
	}

	pub fn errors(&self) -> &[anyhow::Error] {
		&self.errors
	}

	#[track_caller]
	pub fn report(&mut self, error: anyhow::Error) {
		log::error!("Error occurred during {:?}:\n{error:?}", self.name);
		self.errors.push(error);
	}

	pub fn report_if(&mut self, failed: bool, message: impl FnOnce() -> String) {
		if failed {
			self.report(anyhow::Error::msg(message()));
		}
	}

	pub fn maybe_report<T>(&mut self, res: anyhow::Result<T>) -> Option<T> {
		match res {
			Ok(val) => Some(val),
			Err(err) => {
				self.report(err);
				None
			}
		}
	}

	pub fn finish(self) -> anyhow::Result<()> {
		if self.errors.is_empty() {
			Ok(())
		} else {
			Err(anyhow::Error::new(self))
		}
	}
}

// === FS Errors === //

/// Reads a UTF-8 file, returning `None` if it does not exist.
pub fn read_optional_file_anyhow(what: &str, path: impl AsRef<Path>) -> anyhow::Result<Option<String>> {
	let path = path.as_ref();

	match std::fs::read_to_string(path) {
		Ok(text) => Ok(Some(text)),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(err) => Err(err).with_context(|| {
			format!(
				"failed to read {what} (path: {:?})",
				match std::env::current_dir() {
					Ok(cwd) => cwd.join(path),
					Err(_) => path.to_path_buf(),
				},
			)
		}),
	}
}

//! Process-load estimation from scheduler-tick latency.
//!
//! A dedicated thread records a timestamp once per second. When the process
//! is starved, ticks get skipped; the fraction of missing recent samples is
//! the load estimate. Modeled as an explicit context object so tests can
//! construct isolated instances and feed ticks by hand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Number of one-second samples kept.
const HISTORY: usize = 10;

/// Load at or above this fraction counts as high.
const HIGH_LOAD_THRESHOLD: f64 = 0.5;

/// Process-wide load estimator.
///
/// `has_high_load()` is true when at least half of the expected ticks over
/// the last [`HISTORY`] seconds did not happen on time.
#[derive(Debug)]
pub struct LoadMonitor {
	samples: Mutex<VecDeque<Instant>>,
	stopped: Arc<AtomicBool>,
}

impl LoadMonitor {
	/// Create a monitor with its dedicated one-second tick thread.
	#[must_use]
	pub fn new() -> Arc<Self> {
		let monitor = Arc::new(Self {
			samples: Mutex::new(VecDeque::with_capacity(HISTORY)),
			stopped: Arc::new(AtomicBool::new(false)),
		});

		let weak = Arc::downgrade(&monitor);
		let stopped = monitor.stopped.clone();
		std::thread::Builder::new()
			.name("load-monitor".to_string())
			.spawn(move || {
				while !stopped.load(Ordering::Relaxed) {
					let Some(monitor) = weak.upgrade() else {
						break;
					};
					monitor.record_tick(Instant::now());
					drop(monitor);
					std::thread::sleep(Duration::from_secs(1));
				}
			})
			.ok();

		monitor
	}

	/// Create a monitor without a tick thread; ticks are fed by the caller.
	#[doc(hidden)]
	#[must_use]
	pub fn new_manual() -> Arc<Self> {
		Arc::new(Self {
			samples: Mutex::new(VecDeque::with_capacity(HISTORY)),
			stopped: Arc::new(AtomicBool::new(true)),
		})
	}

	/// Record one scheduler tick at `now`.
	pub fn record_tick(&self, now: Instant) {
		let mut samples = self.samples.lock().unwrap();
		if samples.len() == HISTORY {
			samples.pop_front();
		}
		samples.push_back(now);
	}

	/// Whether the process is currently under high load.
	#[must_use]
	pub fn has_high_load(&self) -> bool {
		self.load_at(Instant::now()) >= HIGH_LOAD_THRESHOLD
	}

	/// Load estimate in `[0, 1]` as observed at `now`.
	#[must_use]
	pub fn load_at(&self, now: Instant) -> f64 {
		let window = Duration::from_secs(HISTORY as u64 + 1);
		let samples = self.samples.lock().unwrap();
		let valid = samples
			.iter()
			.filter(|sample| now.duration_since(**sample) <= window)
			.count();
		1.0 - (valid as f64 / HISTORY as f64)
	}

	/// Stop the tick thread.
	pub fn shutdown(&self) {
		self.stopped.store(true, Ordering::Relaxed);
	}
}

impl Drop for LoadMonitor {
	fn drop(&mut self) {
		self.stopped.store(true, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn full_history_means_no_load() {
		let monitor = LoadMonitor::new_manual();
		let now = Instant::now();
		for i in 0..HISTORY {
			monitor.record_tick(now - Duration::from_secs(i as u64));
		}
		assert!(monitor.load_at(now) < f64::EPSILON);
		assert!(monitor.load_at(now) < HIGH_LOAD_THRESHOLD);
	}

	#[test]
	fn eight_missed_ticks_is_high_load() {
		let monitor = LoadMonitor::new_manual();
		let now = Instant::now();
		// Only two ticks landed inside the valid window.
		monitor.record_tick(now - Duration::from_secs(1));
		monitor.record_tick(now);
		assert!((monitor.load_at(now) - 0.8).abs() < f64::EPSILON);
		assert!(monitor.load_at(now) >= HIGH_LOAD_THRESHOLD);
	}

	#[test]
	fn stale_samples_do_not_count() {
		let monitor = LoadMonitor::new_manual();
		let now = Instant::now();
		for i in 0..HISTORY {
			// All samples are older than the H + 1 second window.
			if let Some(stale) = now.checked_sub(Duration::from_secs(20 + i as u64)) {
				monitor.record_tick(stale);
			}
		}
		assert!((monitor.load_at(now) - 1.0).abs() < f64::EPSILON);
	}

	#[test]
	fn history_is_bounded() {
		let monitor = LoadMonitor::new_manual();
		let now = Instant::now();
		for _ in 0..(HISTORY * 3) {
			monitor.record_tick(now);
		}
		assert_eq!(monitor.samples.lock().unwrap().len(), HISTORY);
	}
}

use crate::config::RetryConfig;
use std::time::Duration;

/// Delays between attempts of an operation that failed.
///
/// The n-th retry waits the n-th delay; once the list is exhausted the last delay repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
	delays: Vec<Duration>,
	max_retries: u32,
}

impl RetryPolicy {
	pub fn new(delays: Vec<Duration>, max_retries: Option<u32>) -> Self {
		let max_retries =
			max_retries.unwrap_or_else(|| u32::try_from(delays.len()).unwrap_or(u32::MAX));
		Self {
			delays,
			max_retries,
		}
	}

	pub const fn max_retries(&self) -> u32 {
		self.max_retries
	}

	/// Delay before the given retry (1-based).
	pub fn delay(&self, retry: u32) -> Duration {
		let index = usize::try_from(retry.saturating_sub(1)).unwrap_or(usize::MAX);
		self.delays
			.get(index)
			.or_else(|| self.delays.last())
			.copied()
			.unwrap_or_default()
	}

	pub const fn is_exhausted(&self, retries: u32) -> bool {
		retries > self.max_retries
	}

	/// Delays for the retries of a single operation, in order.
	pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
		(1..=self.max_retries).map(|retry| self.delay(retry))
	}
}

impl From<&RetryConfig> for RetryPolicy {
	fn from(config: &RetryConfig) -> Self {
		Self::new(config.delays(), config.max_retries)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn millis(values: &[u64]) -> Vec<Duration> {
		values.iter().copied().map(Duration::from_millis).collect()
	}

	#[test]
	fn nth_retry_waits_nth_delay() {
		let policy = RetryPolicy::new(millis(&[10, 20, 30]), None);
		assert_eq!(policy.delay(1), Duration::from_millis(10));
		assert_eq!(policy.delay(2), Duration::from_millis(20));
		assert_eq!(policy.delay(3), Duration::from_millis(30));
		assert_eq!(policy.max_retries(), 3);
		assert!(!policy.is_exhausted(3));
		assert!(policy.is_exhausted(4));
	}

	#[test]
	fn last_delay_repeats_beyond_list() {
		let policy = RetryPolicy::new(millis(&[10, 20]), Some(5));
		assert_eq!(policy.delay(4), Duration::from_millis(20));
		assert_eq!(policy.schedule().count(), 5);
		assert!(!policy.is_exhausted(5));
	}

	#[test]
	fn empty_policy_never_retries() {
		let policy = RetryPolicy::new(Vec::new(), None);
		assert_eq!(policy.delay(1), Duration::ZERO);
		assert!(policy.is_exhausted(1));
		assert_eq!(policy.schedule().count(), 0);
	}
}

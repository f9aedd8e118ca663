use crate::config::{EndpointConfig, SourceConfig};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChangeKind {
	Added,
	Updated,
	Deleted,
}

/// A change of the endpoint or source configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
	Endpoint {
		kind: ChangeKind,
		endpoint: EndpointConfig,
	},
	Source {
		kind: ChangeKind,
		source: SourceConfig,
	},
}

/// Broadcasts configuration changes to every subscribed component.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
	sender: broadcast::Sender<ConfigChange>,
}

impl ChangeNotifier {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Returns the number of subscribers that received the change.
	pub fn notify(&self, change: ConfigChange) -> usize {
		self.sender.send(change).unwrap_or(0)
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
		self.sender.subscribe()
	}
}

impl Default for ChangeNotifier {
	fn default() -> Self {
		Self::new(64)
	}
}

/// An immutable view of all endpoints and sources, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSnapshot {
	endpoints: BTreeMap<String, EndpointConfig>,
	sources: BTreeMap<String, SourceConfig>,
}

impl EndpointSnapshot {
	pub fn new(endpoints: Vec<EndpointConfig>, sources: Vec<SourceConfig>) -> Self {
		Self {
			endpoints: endpoints
				.into_iter()
				.map(|endpoint| (endpoint.name.clone(), endpoint))
				.collect(),
			sources: sources
				.into_iter()
				.map(|source| (source.name.clone(), source))
				.collect(),
		}
	}

	/// Looks up the endpoint serving the given called AE title.
	pub fn endpoint(&self, aet: &str) -> Option<&EndpointConfig> {
		let aet = aet.trim();
		self.endpoints.values().find(|endpoint| endpoint.aet == aet)
	}

	pub fn endpoints(&self) -> impl Iterator<Item = &EndpointConfig> {
		self.endpoints.values()
	}

	/// Checks whether a calling AE title connecting from `host` is a configured source.
	///
	/// A source without a host matches any peer address.
	pub fn is_source_trusted(&self, aet: &str, host: &str) -> bool {
		let (aet, host) = (aet.trim(), host.trim());
		if aet.is_empty() || host.is_empty() {
			return false;
		}

		self.sources.values().any(|source| {
			source.aet == aet
				&& source
					.host
					.as_deref()
					.is_none_or(|expected| expected.eq_ignore_ascii_case(host))
		})
	}

	/// Returns a copy of this snapshot with the change applied.
	#[must_use]
	pub fn apply(&self, change: &ConfigChange) -> Self {
		let mut next = self.clone();
		match change {
			ConfigChange::Endpoint { kind, endpoint } => {
				apply_change(&mut next.endpoints, *kind, &endpoint.name, endpoint);
			}
			ConfigChange::Source { kind, source } => {
				apply_change(&mut next.sources, *kind, &source.name, source);
			}
		}
		next
	}
}

fn apply_change<T: Clone>(entries: &mut BTreeMap<String, T>, kind: ChangeKind, name: &str, value: &T) {
	match kind {
		ChangeKind::Added | ChangeKind::Updated => {
			if entries.insert(name.to_owned(), value.clone()).is_some() && kind == ChangeKind::Added {
				warn!(name, "Added configuration entry already existed and was replaced");
			}
		}
		ChangeKind::Deleted => {
			if entries.remove(name).is_none() {
				warn!(name, "Deleted configuration entry was not known");
			}
		}
	}
}

/// Holds the current [`EndpointSnapshot`].
///
/// Readers get a consistent snapshot they can hold on to; writers replace it as a whole.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
	snapshot: RwLock<Arc<EndpointSnapshot>>,
}

impl EndpointRegistry {
	pub fn new(snapshot: EndpointSnapshot) -> Self {
		Self {
			snapshot: RwLock::new(Arc::new(snapshot)),
		}
	}

	pub fn snapshot(&self) -> Arc<EndpointSnapshot> {
		Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
	}

	pub fn apply(&self, change: &ConfigChange) {
		let mut current = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
		*current = Arc::new(current.apply(change));
		debug!(?change, "Applied configuration change");
	}
}

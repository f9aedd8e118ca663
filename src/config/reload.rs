use crate::config::{AppConfig, EndpointConfig, SourceConfig};
use crate::pipeline::{ChangeKind, ChangeNotifier, ConfigChange};
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Computes the change events that turn `previous` into `next`.
///
/// Entries are matched by name. Deletions come first so a renamed AE title is free again
/// before its new owner is added.
pub fn diff(previous: &AppConfig, next: &AppConfig) -> Vec<ConfigChange> {
	let mut changes = Vec::new();
	diff_entries(
		&previous.endpoints,
		&next.endpoints,
		|endpoint| &endpoint.name,
		|kind, endpoint: &EndpointConfig| ConfigChange::Endpoint {
			kind,
			endpoint: endpoint.clone(),
		},
		&mut changes,
	);
	diff_entries(
		&previous.sources,
		&next.sources,
		|source| &source.name,
		|kind, source: &SourceConfig| ConfigChange::Source {
			kind,
			source: source.clone(),
		},
		&mut changes,
	);
	changes.sort_by_key(|change| {
		let kind = match change {
			ConfigChange::Endpoint { kind, .. } | ConfigChange::Source { kind, .. } => *kind,
		};
		kind != ChangeKind::Deleted
	});
	changes
}

fn diff_entries<T: PartialEq>(
	previous: &[T],
	next: &[T],
	name: impl Fn(&T) -> &String,
	change: impl Fn(ChangeKind, &T) -> ConfigChange,
	changes: &mut Vec<ConfigChange>,
) {
	let before: HashMap<&String, &T> = previous.iter().map(|entry| (name(entry), entry)).collect();
	let after: HashMap<&String, &T> = next.iter().map(|entry| (name(entry), entry)).collect();

	for entry in previous {
		if !after.contains_key(name(entry)) {
			changes.push(change(ChangeKind::Deleted, entry));
		}
	}
	for entry in next {
		match before.get(name(entry)) {
			None => changes.push(change(ChangeKind::Added, entry)),
			Some(&old) if old != entry => changes.push(change(ChangeKind::Updated, entry)),
			Some(_) => {}
		}
	}
}

/// Re-reads the configuration on SIGHUP and publishes endpoint and source changes.
pub fn watch(
	initial: AppConfig,
	notifier: ChangeNotifier,
	cancel: CancellationToken,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		#[cfg(unix)]
		{
			use tokio::signal::unix::{signal, SignalKind};

			let mut hangup = match signal(SignalKind::hangup()) {
				Ok(hangup) => hangup,
				Err(err) => {
					error!("Failed to listen for SIGHUP, configuration reload is disabled: {err}");
					return;
				}
			};

			let mut current = initial;
			loop {
				tokio::select! {
					() = cancel.cancelled() => return,
					_ = hangup.recv() => {}
				}

				let next = match AppConfig::new() {
					Ok(next) => next,
					Err(err) => {
						error!("Failed to reload configuration: {err}");
						continue;
					}
				};
				let changes = diff(&current, &next);
				info!("Reloaded configuration with {} changes", changes.len());
				for change in changes {
					notifier.notify(change);
				}
				current = next;
			}
		}

		#[cfg(not(unix))]
		{
			let _ = (initial, notifier);
			cancel.cancelled().await;
		}
	})
}

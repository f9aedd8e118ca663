use crate::pipeline::services::{StoreError, WorkItemStore};
use crate::pipeline::{Payload, PayloadState};
use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Keeps payloads that are not delivered yet in a SQLite database.
///
/// Each row stores the full payload as JSON next to the columns needed for queries.
#[derive(Clone)]
pub struct SqliteWorkItemStore {
	connection: Arc<Mutex<Connection>>,
}

impl SqliteWorkItemStore {
	pub fn open(path: &Path) -> Result<Self, StoreError> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).map_err(|err| StoreError::Database(err.to_string()))?;
		}
		let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
			| OpenFlags::SQLITE_OPEN_CREATE
			| OpenFlags::SQLITE_OPEN_FULL_MUTEX;
		let mut connection = Connection::open_with_flags(path, flags).map_err(database_error)?;
		connection
			.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
			.map_err(database_error)?;
		connection.busy_timeout(BUSY_TIMEOUT).map_err(database_error)?;
		initialize_schema(&mut connection)?;

		info!(path = %path.display(), "Opened payload database");
		Ok(Self {
			connection: Arc::new(Mutex::new(connection)),
		})
	}

	/// Runs `operation` with exclusive access to the connection on a blocking thread.
	async fn with_connection<T, F>(&self, operation: F) -> Result<T, StoreError>
	where
		T: Send + 'static,
		F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
	{
		let connection = Arc::clone(&self.connection);
		tokio::task::spawn_blocking(move || {
			let mut guard = connection
				.lock()
				.map_err(|_| StoreError::Database(String::from("mutex poisoned")))?;
			operation(&mut guard)
		})
		.await
		.map_err(|err| StoreError::Database(err.to_string()))?
	}
}

#[async_trait]
impl WorkItemStore for SqliteWorkItemStore {
	#[instrument(skip_all, fields(payload_id = %payload.id, state = %payload.state))]
	async fn upsert(&self, payload: &Payload) -> Result<(), StoreError> {
		let record = serde_json::to_string(payload)?;
		let id = payload.id.to_string();
		let key = payload.key.clone();
		let state = payload.state.as_str();
		let retry_count = payload.retry_count;
		let updated_at = chrono::Utc::now().timestamp_millis();

		self.with_connection(move |connection| {
			connection
				.execute(
					"INSERT INTO payloads (id, key, state, retry_count, updated_at, record) \
					 VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT(id) DO UPDATE SET \
					 state = excluded.state, retry_count = excluded.retry_count, \
					 updated_at = excluded.updated_at, record = excluded.record",
					params![id, key, state, retry_count, updated_at, record],
				)
				.map_err(database_error)?;
			Ok(())
		})
		.await
	}

	#[instrument(skip(self))]
	async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
		self.with_connection(move |connection| {
			connection
				.execute("DELETE FROM payloads WHERE id = ?1", params![id.to_string()])
				.map_err(database_error)?;
			Ok(())
		})
		.await
	}

	async fn list_non_terminal(&self) -> Result<Vec<Payload>, StoreError> {
		self.with_connection(|connection| {
			let mut statement = connection
				.prepare(
					"SELECT record FROM payloads WHERE state NOT IN (?1, ?2) \
					 ORDER BY updated_at",
				)
				.map_err(database_error)?;
			let records = statement
				.query_map(
					params![
						PayloadState::Completed.as_str(),
						PayloadState::Abandoned.as_str()
					],
					|row| row.get::<_, String>(0),
				)
				.map_err(database_error)?
				.collect::<Result<Vec<_>, _>>()
				.map_err(database_error)?;

			records
				.iter()
				.map(|record| serde_json::from_str(record).map_err(StoreError::from))
				.collect()
		})
		.await
	}
}

fn database_error(err: rusqlite::Error) -> StoreError {
	StoreError::Database(err.to_string())
}

fn initialize_schema(connection: &mut Connection) -> Result<(), StoreError> {
	let tx = connection.transaction().map_err(database_error)?;
	tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
		.map_err(database_error)?;
	let version: Option<i64> = tx
		.query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| {
			row.get(0)
		})
		.optional()
		.map_err(database_error)?;
	match version {
		None => {
			tx.execute(
				"INSERT INTO store_meta (version) VALUES (?1)",
				params![SCHEMA_VERSION],
			)
			.map_err(database_error)?;
			tx.execute_batch(
				"CREATE TABLE IF NOT EXISTS payloads (
					id TEXT PRIMARY KEY,
					key TEXT NOT NULL,
					state TEXT NOT NULL,
					retry_count INTEGER NOT NULL,
					updated_at INTEGER NOT NULL,
					record TEXT NOT NULL
				);
				CREATE INDEX IF NOT EXISTS idx_payloads_state ON payloads (state);",
			)
			.map_err(database_error)?;
		}
		Some(SCHEMA_VERSION) => {}
		Some(value) => {
			return Err(StoreError::Database(format!(
				"unsupported schema version: {value}"
			)));
		}
	}
	tx.commit().map_err(database_error)
}

pub(crate) mod api;
pub(crate) mod backend;
pub(crate) mod config;
pub(crate) mod pipeline;
pub(crate) mod types;

use crate::api::AppState;
use crate::backend::broker::HttpBrokerPublisher;
use crate::backend::cleanup::FileCleanupQueue;
use crate::backend::dimse::StoreServiceClassProvider;
use crate::backend::filesystem::{DiskCapacity, FileSystemContentStore};
use crate::backend::s3::S3ObjectStore;
use crate::backend::sqlite::SqliteWorkItemStore;
use crate::config::{AppConfig, HttpServerConfig};
use crate::pipeline::services::WorkItemStore;
use crate::pipeline::{
	BucketAssembler, ChangeNotifier, DeliveryCollaborators, DeliveryOptions, DeliveryWorker,
	DispatchGuard, EndpointRegistry, EndpointSnapshot, RetryPolicy,
};
use anyhow::Context;
use axum::extract::Request;
use axum::response::Response;
use axum::Router;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace;
use tracing::{error, info, level_filters::LevelFilter, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLEANUP_GRACE_PERIOD: Duration = Duration::from_secs(30);

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	}

	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level);

	// The Sentry client has to exist before the Tokio runtime, so #[tokio::main] cannot be used.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			if let Err(error) = run(config).await {
				error!("Application stopped due to error: {error:#}");
			}
		});
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let shutdown = CancellationToken::new();

	tokio::fs::create_dir_all(&config.storage.temporary)
		.await
		.with_context(|| {
			format!(
				"Failed to create storage directory {}",
				config.storage.temporary.display()
			)
		})?;

	let store: Arc<dyn WorkItemStore> =
		Arc::new(SqliteWorkItemStore::open(&config.storage.database)?);
	let retry = RetryPolicy::from(&config.delivery.retries);
	let assembler =
		BucketAssembler::restore(Arc::clone(&store), retry.clone(), shutdown.clone()).await?;

	let registry = Arc::new(EndpointRegistry::new(EndpointSnapshot::new(
		config.endpoints.clone(),
		config.sources.clone(),
	)));
	let guard = DispatchGuard::new(
		Arc::clone(&registry),
		assembler.clone(),
		Arc::new(FileSystemContentStore::new(&config.storage.temporary)),
		Arc::new(DiskCapacity::new(
			&config.storage.temporary,
			config.storage.watermark,
			config.storage.reserved_space_gb,
		)),
	);
	let notifier = ChangeNotifier::default();
	let registry_updates = guard.subscribe(&notifier, shutdown.clone());
	let reload = crate::config::reload::watch(config.clone(), notifier, shutdown.clone());

	// Stops on its own once the worker is gone and the queue is drained.
	let cleanup_cancel = CancellationToken::new();
	let (cleanup, cleanup_task) =
		FileCleanupQueue::spawn(&config.storage.temporary, cleanup_cancel.clone());

	let worker = DeliveryWorker::new(
		assembler.clone(),
		DeliveryCollaborators {
			store,
			object_store: Arc::new(S3ObjectStore::new(&config.s3)),
			publisher: Arc::new(HttpBrokerPublisher::new(&config.messaging)?),
			cleanup: Arc::new(cleanup),
		},
		retry,
		DeliveryOptions::from(&config),
	);
	let worker_task = tokio::spawn({
		let cancel = shutdown.clone();
		async move { worker.run(cancel).await }
	});

	let mut listeners = Vec::new();
	for dimse_config in config.server.dimse.clone() {
		let storescp = StoreServiceClassProvider::new(guard.clone(), dimse_config);
		let cancel = shutdown.clone();
		listeners.push(tokio::spawn(async move {
			if let Err(err) = storescp.spawn(cancel.clone()).await {
				error!("Failed to run STORE-SCP: {err:#}");
				// Without all listeners the gateway is incomplete, so it shuts down.
				cancel.cancel();
			}
		}));
	}

	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			tokio::select! {
				() = shutdown_signal() => info!("Received shutdown signal"),
				() = shutdown.cancelled() => {}
			}
			shutdown.cancel();
		}
	});

	let app = api::routes()
		.layer(axum::middleware::from_fn(add_common_headers))
		.layer(
			tower_http::trace::TraceLayer::new_for_http()
				.make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
				.on_request(trace::DefaultOnRequest::new().level(Level::INFO))
				.on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
		)
		.layer(TimeoutLayer::new(Duration::from_secs(
			config.server.http.request_timeout,
		)))
		.with_state(AppState {
			registry,
			assembler: assembler.clone(),
		});

	let served = serve(app, &config.server.http, &shutdown).await;
	shutdown.cancel();

	info!("Shutting down");
	for listener in listeners {
		if let Err(err) = listener.await {
			warn!("STORE-SCP task failed: {err}");
		}
	}
	if let Err(err) = worker_task.await {
		error!("Delivery worker failed: {err}");
	}
	assembler.wait_for_shutdown().await;

	let mut cleanup_task = cleanup_task;
	if tokio::time::timeout(CLEANUP_GRACE_PERIOD, &mut cleanup_task)
		.await
		.is_err()
	{
		warn!("Cleanup did not finish in time, remaining files are kept");
		cleanup_cancel.cancel();
		let _ = cleanup_task.await;
	}
	let _ = tokio::join!(registry_updates, reload);
	info!("Shutdown complete");

	served
}

/// Serves the HTTP status API until `shutdown` is triggered.
async fn serve(
	app: Router,
	config: &HttpServerConfig,
	shutdown: &CancellationToken,
) -> anyhow::Result<()> {
	let HttpServerConfig {
		interface, port, ..
	} = config;
	let addr = SocketAddr::from((*interface, *port));
	let listener = TcpListener::bind(addr)
		.await
		.with_context(|| format!("Failed to bind HTTP server to {addr}"))?;

	info!("Started HTTP server on http://{addr}");
	let server = axum::serve(listener, app);
	if config.graceful_shutdown {
		server
			.with_graceful_shutdown(shutdown.clone().cancelled_owned())
			.await?;
	} else {
		tokio::select! {
			result = server.into_future() => result?,
			() = shutdown.cancelled() => {}
		}
	}
	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = signal::ctrl_c().await {
			error!("Failed to listen for ctrl-c: {err}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(err) => {
				error!("Failed to listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}

async fn add_common_headers(req: Request, next: axum::middleware::Next) -> Response {
	let mut response = next.run(req).await;
	let server_name = concat!("DICOM-GATEWAY/", env!("CARGO_PKG_VERSION"));
	response
		.headers_mut()
		.insert("Server", axum::http::HeaderValue::from_static(server_name));
	response
}

use crate::config::{S3Config, S3EndpointStyle};
use crate::pipeline::services::{ObjectStore, ObjectStoreError, PutObject};
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::stalled_stream_protection::StalledStreamProtectionConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::{AppName, Region};
use aws_sdk_s3::config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use std::time::Duration;
use tracing::{info, instrument, trace, warn};

const APP_NAME: &str = "DICOM-GATEWAY";

/// Uploads payload files to an S3 compatible object store.
pub struct S3ObjectStore {
	client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
	pub fn new(config: &S3Config) -> Self {
		info!("Using S3 endpoint {}", &config.endpoint);
		let mut builder = aws_sdk_s3::config::Builder::new()
			.endpoint_url(&config.endpoint)
			.region(config.region.clone().map(Region::new))
			.behavior_version(BehaviorVersion::latest())
			.force_path_style(matches!(config.endpoint_style, S3EndpointStyle::Path))
			// Failed uploads are retried by the delivery worker.
			.retry_config(RetryConfig::standard().with_max_attempts(1))
			.stalled_stream_protection(StalledStreamProtectionConfig::disabled())
			.timeout_config(
				TimeoutConfig::builder()
					.connect_timeout(Duration::from_secs(5))
					.read_timeout(Duration::from_secs(20))
					.operation_timeout(Duration::from_secs(120))
					.build(),
			);
		match AppName::new(APP_NAME) {
			Ok(app_name) => builder = builder.app_name(app_name),
			Err(err) => warn!("Invalid S3 app name: {err}"),
		}

		if let Some(credentials) = &config.credentials {
			if let Ok(resolved_secrets) = credentials.resolve() {
				builder = builder.credentials_provider(resolved_secrets);
			} else {
				warn!("Failed to resolve credentials. Check your environment variables.");
			}
		}

		Self {
			client: aws_sdk_s3::Client::from_conf(builder.build()),
		}
	}
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
	#[instrument(skip_all, fields(bucket = request.bucket, key = request.key))]
	async fn put_object(&self, request: PutObject) -> Result<(), ObjectStoreError> {
		// A local file that cannot be read will not appear by retrying.
		let body = ByteStream::from_path(&request.source).await.map_err(|err| {
			ObjectStoreError::Permanent(format!(
				"Unable to read {}: {err}",
				request.source.display()
			))
		})?;

		let mut put = self
			.client
			.put_object()
			.bucket(&request.bucket)
			.key(&request.key)
			.body(body)
			.content_type(request.content_type)
			.set_metadata(Some(request.metadata));
		if let Some(length) = request.length.and_then(|length| i64::try_from(length).ok()) {
			put = put.content_length(length);
		}

		put.send().await.map_err(|err| classify(&err))?;
		trace!("Uploaded object");
		Ok(())
	}
}

/// Decides whether a failed request is worth retrying.
fn classify<E: std::error::Error + 'static>(err: &SdkError<E>) -> ObjectStoreError {
	let message = DisplayErrorContext(err).to_string();
	match err {
		SdkError::ConstructionFailure(_) => ObjectStoreError::Permanent(message),
		SdkError::ServiceError(service) => match service.raw().status().as_u16() {
			408 | 429 | 500..=599 => ObjectStoreError::Transient(message),
			_ => ObjectStoreError::Permanent(message),
		},
		_ => ObjectStoreError::Transient(message),
	}
}

use crate::config::MessagingConfig;
use crate::pipeline::message::BrokerMessage;
use crate::pipeline::services::{BrokerPublisher, PublishError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Publishes messages through the broker's HTTP interface: `POST {endpoint}/topics/{topic}`.
pub struct HttpBrokerPublisher {
	client: Client,
	endpoint: Url,
}

impl HttpBrokerPublisher {
	pub fn new(config: &MessagingConfig) -> Result<Self, PublishError> {
		let timeout = Duration::from_millis(config.timeout);
		let client = Client::builder()
			.connect_timeout(timeout)
			.timeout(timeout)
			.build()
			.map_err(|err| PublishError::Unavailable(err.to_string()))?;
		Ok(Self {
			client,
			endpoint: config.endpoint.clone(),
		})
	}

	fn topic_url(&self, topic: &str) -> Result<Url, PublishError> {
		let mut url = self.endpoint.clone();
		url.path_segments_mut()
			.map_err(|()| PublishError::Unavailable(format!("Invalid broker endpoint {}", self.endpoint)))?
			.pop_if_empty()
			.extend(["topics", topic]);
		Ok(url)
	}
}

#[async_trait]
impl BrokerPublisher for HttpBrokerPublisher {
	#[instrument(skip_all, fields(topic = topic, message_id = %message.message_id))]
	async fn publish(&self, topic: &str, message: &BrokerMessage) -> Result<(), PublishError> {
		let response = self
			.client
			.post(self.topic_url(topic)?)
			.header("x-correlation-id", &message.correlation_id)
			.json(message)
			.send()
			.await
			.map_err(|err| PublishError::Unavailable(err.to_string()))?;

		let status = response.status();
		if status.is_success() {
			debug!(%status, "Message accepted by broker");
			return Ok(());
		}
		if status.is_server_error()
			|| matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS)
		{
			return Err(PublishError::Unavailable(format!("broker responded with {status}")));
		}

		let body = response.text().await.unwrap_or_default();
		Err(PublishError::Rejected {
			message_id: message.message_id,
			reason: format!("{status} {body}").trim().to_owned(),
		})
	}
}

//! AWS SQS broker implementation.

use super::{QueueAttributes, QueueBroker, QueueHandle, ReceivedMessage, SendRequest};
use crate::config::{BrokerConfig, StageConfig};
use crate::errors::BrokerError;
use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use tracing::debug;

/// Broker backed by an SQS-compatible queue service.
#[derive(Debug, Clone)]
pub struct SqsBroker {
    client: Client,
    /// Long-polling wait time in seconds (0-20).
    wait_time_seconds: i32,
}

impl SqsBroker {
    /// Creates a broker from an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            wait_time_seconds: 1,
        }
    }

    /// Creates a broker from connection settings, falling back to the
    /// default AWS credential chain.
    pub async fn from_config(config: &BrokerConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(aws_sdk_sqs::config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(aws_sdk_sqs::config::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "stagequeue",
            ));
        }

        let aws_config = loader.load().await;
        Self::new(Client::new(&aws_config))
    }

    /// Creates a broker for a stage, using its broker settings and
    /// long-poll wait.
    pub async fn for_stage(config: &StageConfig) -> Self {
        Self::from_config(&config.broker)
            .await
            .with_wait_time(config.receive_wait_secs)
    }

    /// Sets the long-polling wait time.
    #[must_use]
    pub fn with_wait_time(mut self, seconds: u32) -> Self {
        self.wait_time_seconds = i32::try_from(seconds.min(20)).unwrap_or(20);
        self
    }

    /// Returns the underlying client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn transport<E: std::error::Error>(operation: &str, err: E) -> BrokerError {
    BrokerError::transport(operation, DisplayErrorContext(err).to_string())
}

#[async_trait]
impl QueueBroker for SqsBroker {
    async fn get_queue(&self, name: &str) -> Result<QueueHandle, BrokerError> {
        match self.client.get_queue_url().queue_name(name).send().await {
            Ok(output) => Ok(QueueHandle::new(name, output.queue_url.unwrap_or_default())),
            Err(err) => {
                let missing = err
                    .as_service_error()
                    .is_some_and(aws_sdk_sqs::operation::get_queue_url::GetQueueUrlError::is_queue_does_not_exist);
                if missing {
                    Err(BrokerError::does_not_exist(name))
                } else {
                    Err(transport("get_queue_url", err))
                }
            }
        }
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<QueueHandle, BrokerError> {
        let mut request = self
            .client
            .create_queue()
            .queue_name(name)
            .attributes(
                QueueAttributeName::VisibilityTimeout,
                attributes.visibility_timeout.as_secs().to_string(),
            );
        if attributes.fifo {
            request = request.attributes(QueueAttributeName::FifoQueue, "true");
        }

        match request.send().await {
            Ok(output) => {
                debug!(queue = %name, "Created SQS queue");
                Ok(QueueHandle::new(name, output.queue_url.unwrap_or_default()))
            }
            Err(err) => {
                let exists = err
                    .as_service_error()
                    .is_some_and(aws_sdk_sqs::operation::create_queue::CreateQueueError::is_queue_name_exists);
                if exists {
                    Err(BrokerError::already_exists(name))
                } else {
                    Err(transport("create_queue", err))
                }
            }
        }
    }

    async fn receive(
        &self,
        queue: &QueueHandle,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let batch_size = i32::try_from(max.clamp(1, 10)).unwrap_or(10);

        let output = self
            .client
            .receive_message()
            .queue_url(&queue.url)
            .max_number_of_messages(batch_size)
            .wait_time_seconds(self.wait_time_seconds)
            .send()
            .await
            .map_err(|e| transport("receive_message", e))?;

        let messages = output.messages.unwrap_or_default();
        debug!(queue = %queue.name, count = messages.len(), "Received SQS messages");

        Ok(messages
            .into_iter()
            .map(|msg| ReceivedMessage {
                receipt_handle: msg.receipt_handle.unwrap_or_default(),
                body: msg.body.unwrap_or_default(),
            })
            .collect())
    }

    async fn delete(&self, queue: &QueueHandle, receipt_handle: &str) -> Result<(), BrokerError> {
        self.client
            .delete_message()
            .queue_url(&queue.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| transport("delete_message", e))?;
        Ok(())
    }

    async fn send(&self, queue: &QueueHandle, request: SendRequest) -> Result<(), BrokerError> {
        self.client
            .send_message()
            .queue_url(&queue.url)
            .message_body(request.body)
            .set_message_deduplication_id(request.deduplication_id)
            .set_message_group_id(request.group_id)
            .send()
            .await
            .map_err(|e| transport("send_message", e))?;
        Ok(())
    }
}

//! Amazon SQS backend
//!
//! Long-polls one message at a time. Acknowledging deletes the message;
//! anything else leaves it to reappear after the visibility timeout, with the
//! queue's redrive policy deciding when it goes to a dead-letter queue.

use super::{process_delivery, Disposition};
use crate::error::{Result, WorkerError};
use aws_config::BehaviorVersion;
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::Client;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxshift_common::config::SqsSettings;
use voxshift_common::GenerationId;

/// Consecutive failed polls treated as a lost connection
const MAX_POLL_FAILURES: u32 = 5;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct SqsQueue {
    settings: SqsSettings,
    client: Option<Client>,
    queue_url: Option<String>,
}

impl SqsQueue {
    pub fn new(settings: SqsSettings) -> Self {
        Self {
            settings,
            client: None,
            queue_url: None,
        }
    }

    pub(super) async fn initialize(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &self.settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &self.settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        let client = Client::new(&config);

        let output = client
            .get_queue_url()
            .queue_name(&self.settings.queue_name)
            .send()
            .await
            .map_err(|e| {
                WorkerError::Connection(format!(
                    "Cannot resolve SQS queue {}: {}",
                    self.settings.queue_name,
                    DisplayErrorContext(&e)
                ))
            })?;
        let queue_url = output
            .queue_url()
            .ok_or_else(|| WorkerError::Connection("SQS returned no queue URL".to_string()))?
            .to_string();

        info!(queue_url = %queue_url, "Connected to SQS");
        self.client = Some(client);
        self.queue_url = Some(queue_url);
        Ok(())
    }

    pub(super) fn close(&mut self) {
        self.client = None;
        self.queue_url = None;
    }

    fn connection(&self) -> Result<(&Client, &str)> {
        match (&self.client, &self.queue_url) {
            (Some(client), Some(url)) => Ok((client, url.as_str())),
            _ => Err(WorkerError::Connection("SQS queue not initialized".to_string())),
        }
    }

    pub(super) async fn send(&self, body: &[u8]) -> Result<()> {
        let (client, queue_url) = self.connection()?;
        let body = std::str::from_utf8(body)
            .map_err(|e| WorkerError::InvalidMessage(e.to_string()))?;

        client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| WorkerError::Queue(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    pub(super) async fn receive<F, Fut, E>(
        &self,
        mut handler: F,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        F: FnMut(GenerationId) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Display,
    {
        let (client, queue_url) = self.connection()?;
        let mut failures = 0u32;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                polled = client
                    .receive_message()
                    .queue_url(queue_url)
                    .max_number_of_messages(1)
                    .wait_time_seconds(self.settings.wait_time_seconds)
                    .send() => polled,
            };

            let output = match polled {
                Ok(output) => {
                    failures = 0;
                    output
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        attempt = failures,
                        error = %DisplayErrorContext(&e),
                        "SQS poll failed"
                    );
                    if failures >= MAX_POLL_FAILURES {
                        return Err(WorkerError::Connection(format!(
                            "SQS poll failed {} times in a row",
                            failures
                        )));
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(POLL_RETRY_DELAY) => {}
                    }
                    continue;
                }
            };

            for message in output.messages() {
                let body = message.body().unwrap_or_default();
                match process_delivery(body.as_bytes(), &mut handler, cancel).await {
                    None => return Ok(()),
                    Some(Disposition::Ack) => {
                        let Some(receipt) = message.receipt_handle() else {
                            warn!("SQS message has no receipt handle; cannot delete");
                            continue;
                        };
                        // A failed delete means redelivery, which the handler tolerates
                        if let Err(e) = client
                            .delete_message()
                            .queue_url(queue_url)
                            .receipt_handle(receipt)
                            .send()
                            .await
                        {
                            warn!(error = %DisplayErrorContext(&e), "Failed to delete SQS message");
                        }
                    }
                    Some(Disposition::Retain) => {
                        debug!("SQS message left for visibility timeout");
                    }
                }
            }
        }
    }
}

//! AMQP 0-9-1 backend (RabbitMQ)
//!
//! Durable queue, persistent messages, prefetch 1. Failed messages are
//! rejected without requeue so the broker's dead-letter policy decides what
//! happens next.

use super::{process_delivery, Disposition};
use crate::error::{Result, WorkerError};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::fmt::Display;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxshift_common::config::RabbitSettings;
use voxshift_common::GenerationId;

const CONSUMER_TAG: &str = "voxshift-worker";
const PERSISTENT: u8 = 2;

pub struct RabbitQueue {
    settings: RabbitSettings,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl RabbitQueue {
    pub fn new(settings: RabbitSettings) -> Self {
        Self {
            settings,
            connection: None,
            channel: None,
        }
    }

    pub(super) async fn initialize(&mut self) -> Result<()> {
        if self.channel.is_some() {
            return Ok(());
        }

        let connection = Connection::connect(&self.settings.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| {
                WorkerError::Connection(format!(
                    "Cannot reach broker at {}:{}: {}",
                    self.settings.host, self.settings.port, e
                ))
            })?;
        let channel = connection.create_channel().await?;

        channel
            .queue_declare(
                &self.settings.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        info!(
            host = %self.settings.host,
            queue = %self.settings.queue_name,
            "Connected to AMQP broker"
        );
        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    fn channel(&self) -> Result<&Channel> {
        self.channel
            .as_ref()
            .ok_or_else(|| WorkerError::Connection("AMQP queue not initialized".to_string()))
    }

    pub(super) async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close(200, "Bye").await {
                debug!("AMQP channel close: {}", e);
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close(200, "Bye").await {
                debug!("AMQP connection close: {}", e);
            }
        }
    }

    pub(super) async fn send(&self, body: &[u8]) -> Result<()> {
        self.channel()?
            .basic_publish(
                "",
                &self.settings.queue_name,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;
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
        let mut consumer = self
            .channel()?
            .basic_consume(
                &self.settings.queue_name,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = consumer.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(WorkerError::Connection(e.to_string())),
                None => {
                    return Err(WorkerError::Connection(
                        "AMQP consumer stream ended".to_string(),
                    ))
                }
            };

            match process_delivery(&delivery.data, &mut handler, cancel).await {
                // Unacked delivery goes back to the queue when the channel closes
                None => return Ok(()),
                Some(Disposition::Ack) => {
                    delivery.ack(BasicAckOptions::default()).await?;
                }
                Some(Disposition::Retain) => {
                    warn!(
                        delivery_tag = delivery.delivery_tag,
                        "Rejecting message without requeue"
                    );
                    delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..BasicNackOptions::default()
                        })
                        .await?;
                }
            }
        }
    }
}

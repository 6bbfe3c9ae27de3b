use std::sync::Arc;

use async_trait::async_trait;
use lapin::uri::AMQPUri;
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{error, info};

use super::transport::{
    ErrorCallback, Transport, TransportChannel, TransportConnection, TransportError,
};

/// Lapin-backed broker transport.
pub struct AmqpTransport;

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        uri: &str,
        heartbeat: u16,
    ) -> Result<Arc<dyn TransportConnection>, TransportError> {
        let mut uri: AMQPUri = uri.parse().map_err(TransportError)?;
        uri.query.heartbeat = Some(heartbeat);

        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to RabbitMQ");
                TransportError(e.to_string())
            })?;

        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let channel = self.connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ channel");
            TransportError(e.to_string())
        })?;

        info!(channel_id = channel.id(), "Channel created successfully");

        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn on_error(&self, mut callback: ErrorCallback) {
        self.connection.on_error(move |err| callback(err.to_string()));
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to close RabbitMQ connection gracefully");
                TransportError(e.to_string())
            })
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl TransportChannel for AmqpChannel {
    async fn assert_queue(&self, name: &str) -> Result<(), TransportError> {
        self.channel
            .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| TransportError(e.to_string()))
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await
            .map(|_confirm| ())
            .map_err(|e| TransportError(e.to_string()))
    }

    fn on_error(&self, mut callback: ErrorCallback) {
        self.channel.on_error(move |err| callback(err.to_string()));
    }

    async fn close(&self) -> Result<(), TransportError> {
        let channel_id = self.channel.id();
        self.channel.close(200, "Normal shutdown").await.map_err(|e| {
            error!(error = %e, channel_id, "Failed to close channel gracefully");
            TransportError(e.to_string())
        })
    }
}

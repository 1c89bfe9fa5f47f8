//! Streaming session protocol carried over a plain NATS connection

use super::proto::{
    Ack, CloseRequest, CloseResponse, ConnectRequest, ConnectResponse, MsgProto, PubAck, PubMsg,
    SubscriptionRequest, SubscriptionResponse, UnsubscribeRequest,
};
use crate::error::{BackendError, ConnectStep};
use crate::lifecycle::{Handle, TaskHandle};
use async_nats::{Client, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use prost::Message as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub(crate) fn discover_subject(cluster_id: &str) -> String {
    format!("_STAN.discover.{cluster_id}")
}

/// Answer server heartbeats on a private inbox until shut down
pub(crate) async fn spawn_heartbeat(client: &Client) -> Result<(String, TaskHandle), BackendError> {
    let inbox = client.new_inbox();
    let mut subscriber = client.subscribe(inbox.clone()).await.map_err(|e| {
        BackendError::connect(
            ConnectStep::Session,
            format!("unable to subscribe to heartbeat inbox: {e}"),
        )
    })?;

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let responder = client.clone();

    let task = tokio::spawn(async move {
        loop {
            let heartbeat = tokio::select! {
                _ = stop.cancelled() => break,
                next = subscriber.next() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Some(reply) = heartbeat.reply {
                trace!("Answering streaming heartbeat");
                if let Err(e) = responder.publish(reply, Bytes::new()).await {
                    warn!(error = %e, "Unable to answer streaming heartbeat");
                }
            }
        }
        if let Err(e) = subscriber.unsubscribe().await {
            debug!(error = %e, "Unable to drop heartbeat subscription");
        }
    });

    Ok((inbox, TaskHandle::new("stan-heartbeat", shutdown, task)))
}

/// Subjects and identity handed out by the streaming server on connect
#[derive(Debug, Clone)]
pub(crate) struct StanSession {
    client: Client,
    client_id: String,
    conn_id: Vec<u8>,
    pub_prefix: String,
    sub_requests: String,
    unsub_requests: String,
    sub_close_requests: String,
    close_requests: String,
}

impl StanSession {
    pub(crate) async fn connect(
        client: &Client,
        cluster_id: &str,
        client_id: &str,
        heartbeat_inbox: String,
    ) -> Result<Self, BackendError> {
        let conn_id = Uuid::new_v4().as_bytes().to_vec();
        let request = ConnectRequest {
            client_id: client_id.to_string(),
            heartbeat_inbox,
            conn_id: conn_id.clone(),
            ..Default::default()
        };

        let reply = client
            .request(discover_subject(cluster_id), request.encode_to_vec().into())
            .await
            .map_err(|e| {
                BackendError::connect(
                    ConnectStep::Session,
                    format!("unable to reach streaming cluster '{cluster_id}': {e}"),
                )
            })?;
        let response = ConnectResponse::decode(reply.payload).map_err(|e| {
            BackendError::connect(ConnectStep::Session, format!("invalid connect response: {e}"))
        })?;
        if !response.error.is_empty() {
            return Err(BackendError::connect(ConnectStep::Session, response.error));
        }

        debug!(cluster_id, client_id, "Streaming session established");
        Ok(Self {
            client: client.clone(),
            client_id: client_id.to_string(),
            conn_id,
            pub_prefix: response.pub_prefix,
            sub_requests: response.sub_requests,
            unsub_requests: response.unsub_requests,
            sub_close_requests: response.sub_close_requests,
            close_requests: response.close_requests,
        })
    }

    /// Publish and wait for the server to store the message
    pub(crate) async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BackendError> {
        let message = PubMsg {
            client_id: self.client_id.clone(),
            guid: Uuid::new_v4().to_string(),
            subject: channel.to_string(),
            data: payload.to_vec(),
            conn_id: self.conn_id.clone(),
            ..Default::default()
        };

        let reply = self
            .client
            .request(
                format!("{}.{}", self.pub_prefix, channel),
                message.encode_to_vec().into(),
            )
            .await
            .map_err(|e| BackendError::publish(channel, e))?;
        let ack = PubAck::decode(reply.payload)
            .map_err(|e| BackendError::publish(channel, format!("invalid publish ack: {e}")))?;

        if !ack.error.is_empty() {
            return Err(BackendError::publish(channel, ack.error));
        }
        Ok(())
    }

    pub(crate) async fn subscribe(
        &self,
        mut request: SubscriptionRequest,
    ) -> Result<StanSubscription, BackendError> {
        let channel = request.subject.clone();
        let inbox = self.client.new_inbox();
        let mut subscriber = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| BackendError::subscribe(channel.as_str(), e))?;

        request.client_id = self.client_id.clone();
        request.inbox = inbox;
        let durable_name = request.durable_name.clone();

        let response = match self.subscription_request(&request).await {
            Ok(response) => response,
            Err(e) => {
                if let Err(unsub) = subscriber.unsubscribe().await {
                    debug!(error = %unsub, "Unable to drop delivery subscription");
                }
                return Err(BackendError::subscribe(channel, e));
            }
        };

        Ok(StanSubscription {
            session: self.clone(),
            subscriber,
            channel,
            durable_name,
            ack_inbox: response.ack_inbox,
        })
    }

    async fn subscription_request(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionResponse, String> {
        let reply = self
            .client
            .request(self.sub_requests.clone(), request.encode_to_vec().into())
            .await
            .map_err(|e| e.to_string())?;
        let response = SubscriptionResponse::decode(reply.payload)
            .map_err(|e| format!("invalid subscription response: {e}"))?;
        if !response.error.is_empty() {
            return Err(response.error);
        }
        Ok(response)
    }

    /// End the session on the server
    pub(crate) async fn close(&self) -> Result<(), BackendError> {
        let request = CloseRequest {
            client_id: self.client_id.clone(),
        };
        let reply = self
            .client
            .request(self.close_requests.clone(), request.encode_to_vec().into())
            .await
            .map_err(|e| BackendError::session(format!("close request failed: {e}")))?;
        let response = CloseResponse::decode(reply.payload)
            .map_err(|e| BackendError::session(format!("invalid close response: {e}")))?;

        if !response.error.is_empty() {
            return Err(BackendError::session(response.error));
        }
        Ok(())
    }
}

/// Server-side subscription plus the NATS inbox it delivers to
pub(crate) struct StanSubscription {
    session: StanSession,
    subscriber: Subscriber,
    channel: String,
    durable_name: String,
    ack_inbox: String,
}

impl StanSubscription {
    pub(crate) async fn next(&mut self) -> Option<Result<MsgProto, prost::DecodeError>> {
        let message = self.subscriber.next().await?;
        Some(MsgProto::decode(message.payload))
    }

    pub(crate) async fn ack(&self, message: &MsgProto) -> Result<(), BackendError> {
        let ack = Ack {
            subject: message.subject.clone(),
            sequence: message.sequence,
        };
        self.session
            .client
            .publish(self.ack_inbox.clone(), ack.encode_to_vec().into())
            .await
            .map_err(|e| BackendError::publish(self.ack_inbox.as_str(), e))
    }

    /// Stop deliveries; a durable subscription keeps its position on the server
    pub(crate) async fn close(mut self) -> Result<(), BackendError> {
        let outcome = self.unsubscribe_request().await;

        if let Err(e) = self.subscriber.unsubscribe().await {
            debug!(error = %e, "Unable to drop delivery subscription");
        }
        outcome
    }

    async fn unsubscribe_request(&self) -> Result<(), BackendError> {
        let session = &self.session;
        let subject = if !self.durable_name.is_empty() && !session.sub_close_requests.is_empty() {
            session.sub_close_requests.clone()
        } else {
            session.unsub_requests.clone()
        };

        let request = UnsubscribeRequest {
            client_id: session.client_id.clone(),
            subject: self.channel.clone(),
            inbox: self.ack_inbox.clone(),
            durable_name: self.durable_name.clone(),
        };

        let reply = session
            .client
            .request(subject, request.encode_to_vec().into())
            .await
            .map_err(|e| BackendError::session(format!("unsubscribe failed: {e}")))?;
        let response = SubscriptionResponse::decode(reply.payload)
            .map_err(|e| BackendError::session(format!("invalid unsubscribe response: {e}")))?;

        if !response.error.is_empty() {
            return Err(BackendError::session(response.error));
        }
        Ok(())
    }
}

/// Sends the close request when the backend shuts down
pub(crate) struct SessionHandle {
    session: Option<StanSession>,
}

impl SessionHandle {
    pub(crate) fn new(session: StanSession) -> Self {
        Self {
            session: Some(session),
        }
    }
}

#[async_trait]
impl Handle for SessionHandle {
    fn label(&self) -> &'static str {
        "stan-session"
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_subject() {
        assert_eq!(discover_subject("test-cluster"), "_STAN.discover.test-cluster");
    }
}

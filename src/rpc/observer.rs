//! Bus observer backed by a remote `ObserverCallback` server.

use crate::callbacks::{SessionEvent, SessionObserver};
use crate::errors::DeliveryError;
use crate::rpc::service::ObserverCallbackClient;
use async_trait::async_trait;

pub struct RemoteObserver {
    client: ObserverCallbackClient,
}

impl RemoteObserver {
    pub fn new(client: ObserverCallbackClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionObserver for RemoteObserver {
    async fn on_session_event(&self, event: &SessionEvent) -> Result<(), DeliveryError> {
        match self
            .client
            .session_event(tarpc::context::current(), event.clone())
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(DeliveryError::Rejected(
                "Observer declined further events".to_string(),
            )),
            Err(e) => Err(DeliveryError::Disconnected(e.to_string())),
        }
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        match self.client.ping(tarpc::context::current()).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DeliveryError::Rejected("Observer is closing".to_string())),
            Err(e) => Err(DeliveryError::Disconnected(e.to_string())),
        }
    }
}

//! Observer subscription for receiving session events from the daemon.
//!
//! Flow:
//! 1. Authenticate on the installer port to prove the token is readable
//! 2. Connect to the observer port
//! 3. Run an `ObserverCallback` server on that connection
//! 4. The daemon asks for the target user, registers us, and pushes events

use crate::callbacks::SessionEvent;
use crate::rpc::client::InstallerClient;
use crate::rpc::service::ObserverCallback;
use crate::rpc::PortFileContent;
use crate::session::UserId;
use anyhow::{Context, Result};
use futures::StreamExt;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// The daemon registered this observer under the given id
    Registered(u64),
    Session(SessionEvent),
}

/// Forwards callbacks from the daemon to a channel.
#[derive(Clone)]
struct SubscriptionHandler {
    user_id: UserId,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl ObserverCallback for SubscriptionHandler {
    async fn target_user(self, _: tarpc::context::Context) -> UserId {
        self.user_id
    }

    async fn registered(self, _: tarpc::context::Context, observer_id: u64) {
        let _ = self.tx.send(SubscriptionEvent::Registered(observer_id));
    }

    async fn session_event(self, _: tarpc::context::Context, event: SessionEvent) -> bool {
        // A dropped receiver means nobody is listening any more.
        self.tx.send(SubscriptionEvent::Session(event)).is_ok()
    }

    async fn ping(self, _: tarpc::context::Context) -> bool {
        !self.tx.is_closed()
    }
}

/// Live subscription to one user's session events.
pub struct ObserverSubscription {
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
    _server_task: tokio::task::JoinHandle<()>,
}

impl ObserverSubscription {
    pub async fn connect(port_info: &PortFileContent, uid: u32, user_id: UserId) -> Result<Self> {
        use tarpc::serde_transport::tcp;

        InstallerClient::connect(port_info, uid).await?;

        let addr = format!("127.0.0.1:{}", port_info.subscriber_port);
        let transport = tcp::connect(&addr, Bincode::default)
            .await
            .with_context(|| format!("Failed to connect to observer port {}", addr))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = SubscriptionHandler { user_id, tx };

        let server_task = tokio::spawn(async move {
            let channel = server::BaseChannel::with_defaults(transport);
            channel
                .execute(handler.serve())
                .for_each(|response| async {
                    tokio::spawn(response);
                })
                .await;
            tracing::debug!("Observer callback server ended");
        });

        Ok(Self {
            rx,
            _server_task: server_task,
        })
    }

    /// Receive the next event. Returns None once the daemon hangs up.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.recv().await
    }
}

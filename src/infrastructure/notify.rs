use crate::domain::ports::{Notification, Notifier, OperatorAlert};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Logs notifications instead of delivering them. Transport belongs to another service.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        info!(
            user_id = %notification.user_id,
            reference = %notification.reference,
            amount = %notification.amount,
            status = ?notification.status,
            kind = ?notification.r#type,
            "notification"
        );
        Ok(())
    }

    async fn alert(&self, alert: OperatorAlert) -> Result<()> {
        warn!(reference = %alert.reference, "operator alert: {}", alert.message);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    User(Notification),
    Operator(OperatorAlert),
}

/// Forwards notifications onto a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, notice: Notice) -> Result<()> {
        self.sender
            .send(notice)
            .map_err(|_| LedgerError::Io(std::io::Error::other("notification channel closed")))
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.send(Notice::User(notification))
    }

    async fn alert(&self, alert: OperatorAlert) -> Result<()> {
        self.send(Notice::Operator(alert))
    }
}

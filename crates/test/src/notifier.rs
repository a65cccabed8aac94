//! A mempool txs-available signal for tests.

use async_trait::async_trait;
use tokio::sync::Notify;

use tenderbft_core_types::TxNotifier;

/// A [`TxNotifier`] backed by a [`Notify`]: silent until poked.
#[derive(Default)]
pub struct NotifyTxNotifier {
    notify: Notify,
}

impl NotifyTxNotifier {
    /// Create a notifier with no pending signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that transactions are available.
    pub fn notify(&self) {
        self.notify.notify_one();
    }
}

#[async_trait]
impl TxNotifier for NotifyTxNotifier {
    async fn txs_available(&self) {
        self.notify.notified().await;
    }
}

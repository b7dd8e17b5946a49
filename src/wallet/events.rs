//! FIFO queue of wallet events.
//!
//! Events travel over an unbounded mpsc channel: producers push from
//! whatever thread holds the state lock, the single logical consumer
//! receives under an async mutex. Pushing and signalling are one
//! operation, so a receiver never misses an event that was queued before
//! it started waiting. Cancellation of a blocked receiver is the caller's
//! business ([`crate::wallet::Wallet::get_event`] races the receive
//! against the wallet's stop token).

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::wallet::WalletEvent;

pub(crate) struct EventQueue {
    sender: mpsc::UnboundedSender<WalletEvent>,
    receiver: Mutex<mpsc::UnboundedReceiver<WalletEvent>>,
}

impl Default for EventQueue {
    fn default() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        EventQueue {
            sender,
            receiver: Mutex::new(receiver),
        }
    }
}

impl EventQueue {
    pub fn push(&self, event: WalletEvent) {
        // the receiver lives as long as the queue, so this cannot fail
        let _ = self.sender.send(event);
    }

    /// Receive the next event in push order, waiting if none is queued.
    ///
    /// Cancel-safe: dropping the returned future mid-wait loses no events.
    pub async fn recv(&self) -> WalletEvent {
        let mut receiver = self.receiver.lock().await;
        receiver
            .recv()
            .await
            .expect("event channel sender outlives the queue")
    }

    /// Drop every queued event. A consumer blocked in [`recv`] holds the
    /// receiver lock, but it only blocks on an empty queue, so skipping
    /// the drain in that case discards nothing.
    ///
    /// [`recv`]: EventQueue::recv
    pub fn clear(&self) {
        if let Ok(mut receiver) = self.receiver.try_lock() {
            while receiver.try_recv().is_ok() {}
        }
    }
}

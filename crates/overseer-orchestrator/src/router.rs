use overseer_core::Message;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// What happened to a message handed to [`MessageRouter::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Queued in the recipient's mailbox.
    Delivered,
    /// No mailbox for the recipient.
    UnknownRecipient,
    /// The recipient's queue is at capacity.
    MailboxFull,
    /// The receiving side was dropped.
    MailboxClosed,
    /// Neither endpoint is the master.
    IllegalRoute,
}

impl Delivery {
    /// Whether the message was queued.
    pub fn is_delivered(self) -> bool {
        self == Delivery::Delivered
    }
}

/// Delivery counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Messages queued.
    pub delivered: u64,
    /// Dropped for an unknown recipient.
    pub dropped_unknown: u64,
    /// Dropped on a full mailbox.
    pub dropped_full: u64,
    /// Dropped on a closed mailbox.
    pub dropped_closed: u64,
    /// Dropped for bypassing the master.
    pub dropped_illegal: u64,
}

/// Receiving end for one recipient. FIFO.
pub struct Mailbox {
    owner: String,
    rx: mpsc::Receiver<Message>,
}

impl Mailbox {
    /// Recipient this mailbox belongs to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Next message; `None` once the router closed the mailbox and it drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("owner", &self.owner).finish()
    }
}

#[derive(Default)]
struct RouterState {
    senders: HashMap<String, mpsc::Sender<Message>>,
    /// Receivers created on an agent's behalf, waiting for a transport to claim them.
    unclaimed: HashMap<String, mpsc::Receiver<Message>>,
    stats: RouterStats,
}

/// Star-topology message delivery over bounded per-recipient channels.
///
/// Every message must have the master as sender or recipient. `send` never
/// blocks: a full, closed or missing mailbox drops the message and logs it.
pub struct MessageRouter {
    master_id: String,
    capacity: usize,
    state: Mutex<RouterState>,
}

impl MessageRouter {
    /// A router for `master_id` whose mailboxes hold `capacity` messages.
    pub fn new(master_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            master_id: master_id.into(),
            capacity: capacity.max(1),
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Hub of the star.
    pub fn master_id(&self) -> &str {
        &self.master_id
    }

    /// Create a fresh mailbox for `owner`, replacing any previous one.
    pub fn open_mailbox(&self, owner: &str) -> Mailbox {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut state = self.state.lock();
        state.unclaimed.remove(owner);
        if state.senders.insert(owner.to_string(), tx).is_some() {
            debug!(recipient = %owner, "Mailbox replaced");
        }
        Mailbox {
            owner: owner.to_string(),
            rx,
        }
    }

    /// Make sure `owner` can receive. A newly created receiver is parked
    /// until [`claim_mailbox`](Self::claim_mailbox) picks it up.
    pub fn ensure_mailbox(&self, owner: &str) {
        let mut state = self.state.lock();
        if state.senders.contains_key(owner) {
            return;
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        state.senders.insert(owner.to_string(), tx);
        state.unclaimed.insert(owner.to_string(), rx);
    }

    /// Take the parked receiver for `owner`, if one is waiting.
    pub fn claim_mailbox(&self, owner: &str) -> Option<Mailbox> {
        let rx = self.state.lock().unclaimed.remove(owner)?;
        Some(Mailbox {
            owner: owner.to_string(),
            rx,
        })
    }

    /// Drop the sending side. Buffered messages stay readable.
    pub fn close_mailbox(&self, owner: &str) -> bool {
        let mut state = self.state.lock();
        state.unclaimed.remove(owner);
        state.senders.remove(owner).is_some()
    }

    /// Whether `owner` can currently receive.
    pub fn has_mailbox(&self, owner: &str) -> bool {
        self.state.lock().senders.contains_key(owner)
    }

    fn is_legal(&self, message: &Message) -> bool {
        let touches_master =
            message.sender_id == self.master_id || message.recipient_id == self.master_id;
        touches_master && message.sender_id != message.recipient_id
    }

    /// Route one message.
    pub fn send(&self, message: Message) -> Delivery {
        let recipient = message.recipient_id.clone();
        let mut state = self.state.lock();

        if !self.is_legal(&message) {
            state.stats.dropped_illegal += 1;
            warn!(
                message_id = %message.id,
                sender = %message.sender_id,
                recipient = %recipient,
                "Dropping message outside the master star"
            );
            return Delivery::IllegalRoute;
        }

        let Some(tx) = state.senders.get(&recipient) else {
            state.stats.dropped_unknown += 1;
            warn!(
                message_id = %message.id,
                message_type = %message.message_type,
                recipient = %recipient,
                "Dropping message for unknown recipient"
            );
            return Delivery::UnknownRecipient;
        };

        let message_id = message.id;
        let message_type = message.message_type;
        let result = tx.try_send(message);
        match result {
            Ok(()) => {
                state.stats.delivered += 1;
                Delivery::Delivered
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                state.stats.dropped_full += 1;
                warn!(
                    message_id = %message_id,
                    message_type = %message_type,
                    recipient = %recipient,
                    "Mailbox full, message dropped"
                );
                Delivery::MailboxFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                state.stats.dropped_closed += 1;
                state.senders.remove(&recipient);
                warn!(
                    message_id = %message_id,
                    message_type = %message_type,
                    recipient = %recipient,
                    "Mailbox closed, message dropped"
                );
                Delivery::MailboxClosed
            }
        }
    }

    /// Route a last word to a recipient that may have no mailbox, such as
    /// a worker whose registration was refused.
    ///
    /// With a mailbox this is [`send`](Self::send). Without one, a mailbox
    /// holding only `message` is parked for [`claim_mailbox`](Self::claim_mailbox);
    /// no sender is kept, so its reader sees the message and then the end.
    pub fn send_final(&self, message: Message) -> Delivery {
        let recipient = message.recipient_id.clone();
        let mut state = self.state.lock();
        if state.senders.contains_key(&recipient) || !self.is_legal(&message) {
            drop(state);
            return self.send(message);
        }

        let (tx, rx) = mpsc::channel(1);
        if tx.try_send(message).is_err() {
            state.stats.dropped_closed += 1;
            return Delivery::MailboxClosed;
        }
        state.unclaimed.insert(recipient.clone(), rx);
        state.stats.delivered += 1;
        debug!(recipient = %recipient, "Final message parked");
        Delivery::Delivered
    }

    /// Send a copy of `template` from the master to every other mailbox.
    /// Returns how many copies were delivered.
    pub fn broadcast_from_master(&self, template: &Message) -> usize {
        let recipients: Vec<String> = {
            let state = self.state.lock();
            let mut ids: Vec<String> = state
                .senders
                .keys()
                .filter(|id| **id != self.master_id)
                .cloned()
                .collect();
            ids.sort();
            ids
        };

        recipients
            .into_iter()
            .filter(|recipient| {
                let mut copy = template.clone();
                copy.id = Uuid::new_v4();
                copy.sender_id = self.master_id.clone();
                copy.recipient_id = recipient.clone();
                self.send(copy).is_delivered()
            })
            .count()
    }

    /// Counters so far.
    pub fn stats(&self) -> RouterStats {
        self.state.lock().stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use overseer_core::MessageType;

    #[test]
    fn test_delivers_fifo() {
        let router = MessageRouter::new("master", 8);
        let mut inbox = router.open_mailbox("w-1");
        let first = Message::heartbeat("master", "w-1");
        let second = Message::heartbeat("master", "w-1");
        let (a, b) = (first.id, second.id);

        assert_eq!(router.send(first), Delivery::Delivered);
        assert_eq!(router.send(second), Delivery::Delivered);
        assert_eq!(inbox.try_recv().unwrap().id, a);
        assert_eq!(inbox.try_recv().unwrap().id, b);
        assert!(inbox.try_recv().is_none());
    }

    #[test]
    fn test_full_mailbox_drops() {
        let router = MessageRouter::new("master", 1);
        let _inbox = router.open_mailbox("w-1");
        assert!(router.send(Message::heartbeat("master", "w-1")).is_delivered());
        assert_eq!(
            router.send(Message::heartbeat("master", "w-1")),
            Delivery::MailboxFull
        );
        assert_eq!(router.stats().dropped_full, 1);
    }

    #[test]
    fn test_unknown_and_illegal_routes() {
        let router = MessageRouter::new("master", 4);
        let _w2 = router.open_mailbox("w-2");
        assert_eq!(
            router.send(Message::heartbeat("master", "ghost")),
            Delivery::UnknownRecipient
        );
        assert_eq!(
            router.send(Message::heartbeat("w-1", "w-2")),
            Delivery::IllegalRoute
        );
        let stats = router.stats();
        assert_eq!(stats.dropped_unknown, 1);
        assert_eq!(stats.dropped_illegal, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[test]
    fn test_closed_receiver() {
        let router = MessageRouter::new("master", 4);
        drop(router.open_mailbox("w-1"));
        assert_eq!(
            router.send(Message::heartbeat("master", "w-1")),
            Delivery::MailboxClosed
        );
        assert!(!router.has_mailbox("w-1"));
    }

    #[test]
    fn test_ensure_then_claim() {
        let router = MessageRouter::new("master", 4);
        router.ensure_mailbox("w-1");
        router.ensure_mailbox("w-1");
        assert!(router.send(Message::heartbeat("master", "w-1")).is_delivered());

        let mut mailbox = router.claim_mailbox("w-1").unwrap();
        assert_eq!(mailbox.owner(), "w-1");
        assert_eq!(mailbox.try_recv().unwrap().message_type, MessageType::Heartbeat);
        assert!(router.claim_mailbox("w-1").is_none());
    }

    #[test]
    fn test_close_keeps_buffered_messages() {
        let router = MessageRouter::new("master", 4);
        let mut inbox = router.open_mailbox("w-1");
        router.send(Message::heartbeat("master", "w-1"));
        assert!(router.close_mailbox("w-1"));
        assert!(inbox.try_recv().is_some());
        assert_eq!(
            router.send(Message::heartbeat("master", "w-1")),
            Delivery::UnknownRecipient
        );
    }

    #[test]
    fn test_broadcast_skips_master() {
        let router = MessageRouter::new("master", 4);
        let mut master = router.open_mailbox("master");
        let mut a = router.open_mailbox("w-a");
        let mut b = router.open_mailbox("w-b");

        let template = Message::shutdown("master", "", None).unwrap();
        assert_eq!(router.broadcast_from_master(&template), 2);
        assert_eq!(a.try_recv().unwrap().recipient_id, "w-a");
        assert_eq!(b.try_recv().unwrap().recipient_id, "w-b");
        assert!(master.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_final_message_parks_for_unknown_recipient() {
        let router = MessageRouter::new("master", 4);
        let refusal = Message::error("master", "w-9", "registry is full", false).unwrap();
        assert_eq!(router.send_final(refusal), Delivery::Delivered);
        assert!(!router.has_mailbox("w-9"));

        let mut parked = router.claim_mailbox("w-9").unwrap();
        let msg = parked.recv().await.unwrap();
        assert_eq!(msg.message_type, MessageType::Error);
        assert!(parked.recv().await.is_none());
    }

    #[test]
    fn test_final_message_uses_open_mailbox() {
        let router = MessageRouter::new("master", 4);
        let mut inbox = router.open_mailbox("w-1");
        let msg = Message::error("master", "w-1", "already registered", false).unwrap();
        assert_eq!(router.send_final(msg), Delivery::Delivered);
        assert!(inbox.try_recv().is_some());
        assert!(router.claim_mailbox("w-1").is_none());

        let to_self = Message::error("master", "master", "nope", false).unwrap();
        assert_eq!(router.send_final(to_self), Delivery::IllegalRoute);
    }

    #[tokio::test]
    async fn test_async_recv() {
        let router = MessageRouter::new("master", 4);
        let mut inbox = router.open_mailbox("master");
        router.send(Message::heartbeat("w-1", "master"));
        let msg = inbox.recv().await.unwrap();
        assert_eq!(msg.sender_id, "w-1");
    }
}

//! Hand-off of transfer callbacks to the control thread.
//!
//! Transfers run elsewhere and only ever send events; the control thread
//! drains them and is the only one that touches the entity graph.

use std::sync::mpsc::{channel, Receiver, Sender};

use crate::common::FileId;

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        file_id: FileId,
        bytes: f64,
    },
    Complete {
        file_id: FileId,
        ok: bool,
        error_code: i32,
    },
}

pub type TransferSender = Sender<TransferEvent>;

pub struct TransferInbox {
    tx: Sender<TransferEvent>,
    rx: Receiver<TransferEvent>,
}

impl TransferInbox {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self { tx, rx }
    }

    /// A handle that can be moved to a transfer thread.
    pub fn sender(&self) -> TransferSender {
        self.tx.clone()
    }

    pub fn try_recv_all(&self) -> Vec<TransferEvent> {
        self.rx.try_iter().collect()
    }
}

impl Default for TransferInbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn events_cross_threads_in_order() {
        let inbox = TransferInbox::new();
        let tx = inbox.sender();
        thread::spawn(move || {
            tx.send(TransferEvent::Progress { file_id: 1, bytes: 10. }).unwrap();
            tx.send(TransferEvent::Complete {
                file_id: 1,
                ok: true,
                error_code: 0,
            })
            .unwrap();
        })
        .join()
        .unwrap();

        let events = inbox.try_recv_all();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], TransferEvent::Complete { ok: true, .. }));
        assert!(inbox.try_recv_all().is_empty());
    }
}

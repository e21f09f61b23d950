use std::sync::mpsc;
use std::sync::Mutex;

use crate::util::lock;

pub type Receiver<T> = mpsc::Receiver<T>;

pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::channel();
    (Sender(Mutex::new(Some(tx))), rx)
}

/// Sending half of the event channel.
///
/// Sends never block the dispatch thread. Once the receiver is gone the sender closes itself
/// and further events are dropped.
pub struct Sender<T>(Mutex<Option<mpsc::Sender<T>>>);

impl<T> Sender<T> {
    pub fn send(&self, event: T) {
        let mut tx = lock(&self.0);
        let closed = match tx.as_ref() {
            Some(sender) => sender.send(event).is_err(),
            None => false,
        };
        if closed {
            log::debug!("event receiver dropped, no more events will be delivered");
            *tx = None;
        }
    }
}

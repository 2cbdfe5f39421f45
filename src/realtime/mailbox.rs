use super::events::PushEvent;
use super::registry::{same_subscriber, Subscriber};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

type Letter = Arc<PushEvent>;

struct Mailbox {
    handler: Subscriber,
    tx: mpsc::UnboundedSender<Letter>,
}

/// One ordered queue per subscriber, each drained by its own task.
///
/// A subscriber sees events in the order they were posted, and a slow or
/// panicking subscriber only holds up its own queue.
#[derive(Default)]
pub struct Mailboxes {
    boxes: Mutex<Vec<Mailbox>>,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Mailbox>> {
        self.boxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `event` for each of `subscribers`, in the order given.
    ///
    /// Enqueueing never waits on a handler. Without a Tokio runtime there is
    /// nothing to drain the queues, so the event is dropped with a warning.
    pub fn post(&self, subscribers: &[Subscriber], event: PushEvent) {
        if subscribers.is_empty() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(
                "[WS] dropping {} event: no Tokio runtime to run handlers",
                event.kind()
            );
            return;
        };

        let letter: Letter = Arc::new(event);
        let mut boxes = self.lock();
        for handler in subscribers {
            let existing = boxes
                .iter()
                .position(|b| same_subscriber(&b.handler, handler) && !b.tx.is_closed());
            let idx = match existing {
                Some(idx) => idx,
                None => {
                    boxes.retain(|b| !same_subscriber(&b.handler, handler));
                    let (tx, rx) = mpsc::unbounded_channel();
                    runtime.spawn(deliver(Arc::clone(handler), rx));
                    boxes.push(Mailbox {
                        handler: Arc::clone(handler),
                        tx,
                    });
                    boxes.len() - 1
                }
            };
            let _ = boxes[idx].tx.send(Arc::clone(&letter));
        }
    }

    /// Close `handler`'s queue. Events already queued are still delivered.
    pub fn close(&self, handler: &Subscriber) {
        self.lock().retain(|b| !same_subscriber(&b.handler, handler));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

async fn deliver(handler: Subscriber, mut rx: mpsc::UnboundedReceiver<Letter>) {
    while let Some(event) = rx.recv().await {
        let run = std::panic::AssertUnwindSafe(|| handler(&*event));
        if let Err(panic_info) = std::panic::catch_unwind(run) {
            let msg = if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "unknown panic".to_string()
            };
            tracing::error!("[WS] {} handler panicked: {}", event.kind(), msg);
        }
    }
}

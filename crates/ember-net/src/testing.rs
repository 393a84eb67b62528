//! Handlers shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::session::{MessageHandler, Session};

/// Records every dispatched message and closed session.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    messages: Mutex<Vec<String>>,
    closed: AtomicUsize,
    disconnect_on: Option<String>,
    echo: bool,
    notify: Notify,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replies `echo:<message>` to every message.
    pub(crate) fn echoing() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Self::default()
        })
    }

    /// Disconnects the session when `trigger` arrives.
    pub(crate) fn disconnecting_on(trigger: &str) -> Arc<Self> {
        Arc::new(Self {
            disconnect_on: Some(trigger.to_string()),
            ..Self::default()
        })
    }

    pub(crate) fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` messages were recorded.
    pub(crate) async fn wait_for(&self, count: usize) -> Vec<String> {
        loop {
            let notified = self.notify.notified();
            let messages = self.messages();
            if messages.len() >= count {
                return messages;
            }
            notified.await;
        }
    }

    /// Wait until at least `count` sessions were closed.
    pub(crate) async fn wait_closed(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.closed() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl MessageHandler for Recorder {
    fn process_message(&self, session: &mut Session, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
        if self.echo {
            session.send_message(&format!("echo:{message}"));
        }
        if self.disconnect_on.as_deref() == Some(message) {
            session.disconnect();
        }
        self.notify.notify_waiters();
    }

    fn session_closed(&self, _session: &Session) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

use std::sync::{Mutex, RwLock};

use futures::channel::oneshot;

struct Listener<T> {
    sender: oneshot::Sender<(u32, Vec<T>)>,
    cursor: u32,
}

struct Messages<T> {
    /// Cursor of `messages[0]`. Advances when old messages are discarded.
    first_cursor: u32,
    messages: Vec<T>,
}

impl<T: Clone> Messages<T> {
    fn end_cursor(&self) -> u32 {
        self.first_cursor + self.messages.len() as u32
    }

    fn since(&self, cursor: u32) -> Vec<T> {
        let start = cursor.saturating_sub(self.first_cursor) as usize;
        self.messages.get(start..).map(<[T]>::to_vec).unwrap_or_default()
    }
}

fn fire_listener_if_ready<T: Clone>(
    messages: &Messages<T>,
    listener: Listener<T>,
) -> Result<(), Listener<T>> {
    let current_cursor = messages.end_cursor();

    if listener.cursor < current_cursor {
        let new_messages = messages.since(listener.cursor);
        let _ = listener.sender.send((current_cursor, new_messages));
        Ok(())
    } else {
        Err(listener)
    }
}

/// A message queue with persistent history that can be subscribed to.
///
/// Each message has a cursor: its position in the history of every message
/// ever pushed. Subscribers pass the cursor they have seen up to and get a
/// one-shot future that resolves with everything after it, immediately if
/// such messages exist, otherwise as soon as the next batch is pushed.
///
/// With a retention limit, only the newest `limit` messages are kept once
/// waiting listeners have been served. Cursors stay stable across trimming.
pub struct MessageQueue<T> {
    messages: RwLock<Messages<T>>,
    message_listeners: Mutex<Vec<Listener<T>>>,
    retention: Option<usize>,
}

impl<T: Clone> MessageQueue<T> {
    pub fn new() -> Self {
        MessageQueue {
            messages: RwLock::new(Messages {
                first_cursor: 0,
                messages: Vec::new(),
            }),
            message_listeners: Mutex::new(Vec::new()),
            retention: None,
        }
    }

    pub fn with_retention(limit: usize) -> Self {
        MessageQueue {
            retention: Some(limit),
            ..Self::new()
        }
    }

    pub fn push_messages(&self, new_messages: &[T]) {
        let mut message_listeners = self.message_listeners.lock().unwrap();
        let mut messages = self.messages.write().unwrap();
        messages.messages.extend_from_slice(new_messages);

        let mut remaining_listeners = Vec::new();

        for listener in message_listeners.drain(..) {
            if let Err(listener) = fire_listener_if_ready(&messages, listener) {
                remaining_listeners.push(listener);
            }
        }

        *message_listeners = remaining_listeners;

        if let Some(limit) = self.retention {
            let excess = messages.messages.len().saturating_sub(limit);
            if excess > 0 {
                messages.messages.drain(..excess);
                messages.first_cursor += excess as u32;
            }
        }
    }

    pub fn subscribe(&self, cursor: u32) -> oneshot::Receiver<(u32, Vec<T>)> {
        let (sender, receiver) = oneshot::channel();

        let listener = Listener { sender, cursor };

        // Same lock order as `push_messages`.
        let mut message_listeners = self.message_listeners.lock().unwrap();
        let messages = self.messages.read().unwrap();

        if let Err(listener) = fire_listener_if_ready(&messages, listener) {
            message_listeners.push(listener);
        }

        receiver
    }

    /// Everything after `cursor`, without waiting.
    pub fn messages_since(&self, cursor: u32) -> (u32, Vec<T>) {
        let messages = self.messages.read().unwrap();
        (messages.end_cursor(), messages.since(cursor))
    }

    pub fn cursor(&self) -> u32 {
        self.messages.read().unwrap().end_cursor()
    }

    /// Drops history before `cursor`. Subscribers asking for older cursors
    /// receive whatever is still retained.
    pub fn discard_before(&self, cursor: u32) {
        let mut messages = self.messages.write().unwrap();
        let count = (cursor.saturating_sub(messages.first_cursor) as usize)
            .min(messages.messages.len());

        messages.messages.drain(..count);
        messages.first_cursor += count as u32;
    }
}

impl<T: Clone> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

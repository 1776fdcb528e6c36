use parking_lot::Mutex;
use relayplay_core::ChatMessage;
use std::collections::VecDeque;
use tokio::sync::broadcast;

pub const DEFAULT_TRANSCRIPT_CAPACITY: usize = 200;

/// Bounded chat history of a room. New lines are also echoed to subscribers.
pub struct ChatTranscript {
    messages: Mutex<VecDeque<ChatMessage>>,
    capacity: usize,
    echo: broadcast::Sender<ChatMessage>,
}

impl ChatTranscript {
    pub fn new(capacity: usize) -> Self {
        let (echo, _) = broadcast::channel(capacity.max(1));
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            echo,
        }
    }

    /// Appends a line, evicting the oldest once full.
    pub fn push(&self, message: ChatMessage) -> Option<ChatMessage> {
        let evicted = {
            let mut messages = self.messages.lock();
            let evicted = if messages.len() == self.capacity {
                messages.pop_front()
            } else {
                None
            };
            messages.push_back(message.clone());
            evicted
        };
        let _ = self.echo.send(message);
        evicted
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.echo.subscribe()
    }
}

impl Default for ChatTranscript {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSCRIPT_CAPACITY)
    }
}

//! Client-side stream consumption and state reconstruction.
//!
//! [`ChatView`] folds the ordered event sequence of one turn into a
//! renderable message list, and [`StreamConsumer`] couples it with a
//! [`FrameDecoder`](crate::protocol::FrameDecoder) so that raw transport
//! bytes, chunked at arbitrary boundaries, reduce to exactly the same state
//! as a single contiguous read.
//!
//! Reduction rules per event:
//!
//! - `text` — append to the in-progress assistant message.
//! - `citations` — replace the in-progress message's citation list
//!   wholesale (the relay only ever sends the final consolidated set).
//! - `title` — update the conversation title; independent of message state.
//! - `error` — drop a still-empty in-progress message, finalize a non-empty
//!   one, then append a synthetic error message. Prior finalized messages
//!   are untouched.
//! - `done` — finalize the in-progress message.

use crate::models::{Citation, Role};
use crate::protocol::{FrameDecoder, StreamEvent};

/// One message as the client renders it.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    pub role: Role,
    pub content: String,
    pub citations: Vec<Citation>,
    pub finalized: bool,
    /// Synthetic error entry rather than model output.
    pub is_error: bool,
}

impl MessageView {
    fn in_progress() -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            citations: Vec::new(),
            finalized: false,
            is_error: false,
        }
    }
}

/// Incrementally reconstructed conversation state for one turn.
#[derive(Debug, Default)]
pub struct ChatView {
    pub messages: Vec<MessageView>,
    pub title: Option<String>,
}

impl ChatView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the view with an already-sent user message, the way a client
    /// renders its own input before the stream starts.
    pub fn push_user_message(&mut self, content: &str) {
        self.messages.push(MessageView {
            role: Role::User,
            content: content.to_string(),
            citations: Vec::new(),
            finalized: true,
            is_error: false,
        });
    }

    /// Fold one event into the view.
    pub fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Text { text } => {
                self.in_progress_mut().content.push_str(&text);
            }
            StreamEvent::Citations { citations } => {
                self.in_progress_mut().citations = citations;
            }
            StreamEvent::Title { title } => {
                self.title = Some(title);
            }
            StreamEvent::Error { message } => {
                let drop_empty = matches!(
                    self.messages.last(),
                    Some(m) if !m.finalized && m.content.is_empty()
                );
                if drop_empty {
                    self.messages.pop();
                } else if let Some(last) = self.messages.last_mut() {
                    if !last.finalized {
                        last.finalized = true;
                    }
                }
                self.messages.push(MessageView {
                    role: Role::Assistant,
                    content: message,
                    citations: Vec::new(),
                    finalized: true,
                    is_error: true,
                });
            }
            StreamEvent::Done => {
                if let Some(last) = self.messages.last_mut() {
                    if !last.finalized {
                        last.finalized = true;
                    }
                }
            }
        }
    }

    fn in_progress_mut(&mut self) -> &mut MessageView {
        let needs_new = !matches!(
            self.messages.last(),
            Some(m) if !m.finalized && !m.is_error
        );
        if needs_new {
            self.messages.push(MessageView::in_progress());
        }
        self.messages.last_mut().expect("just pushed")
    }
}

/// Decodes transport bytes and feeds the resulting events into a view.
#[derive(Debug, Default)]
pub struct StreamConsumer {
    decoder: FrameDecoder,
    view: ChatView,
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_view(view: ChatView) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            view,
        }
    }

    /// Feed one transport chunk; returns the events it completed.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let events = self.decoder.push(chunk);
        for event in &events {
            self.view.apply(event.clone());
        }
        events
    }

    pub fn view(&self) -> &ChatView {
        &self.view
    }

    pub fn into_view(self) -> ChatView {
        self.view
    }
}

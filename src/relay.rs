//! One chat turn, from upstream stream to ordered protocol events.
//!
//! The relay drives a turn as a sequential pipeline: submit the request
//! context, forward text deltas as they arrive, accumulate grounding
//! references across the whole stream, then finalize (consolidated
//! citations, best-effort persistence, optional title generation) and emit
//! exactly one terminal event.
//!
//! # Phases
//!
//! ```text
//! StreamingText ──▶ Finalizing ──▶ Terminated
//! ```
//!
//! Text deltas are only emitted in `StreamingText`; the consolidated
//! citation batch and the late title only in `Finalizing`. Grounding
//! metadata is unreliable mid-stream and typically complete only at the
//! end, so citations are never emitted early.
//!
//! # Failure Semantics
//!
//! Only an upstream failure is user-visible (terminal `error` event; text
//! already streamed stands, and nothing is retried here since a partial
//! answer may already be on screen). Persistence and title-generation failures are
//! logged and swallowed. A client that stops pulling simply makes sends
//! fail; the relay keeps consuming so the finished answer is still
//! persisted.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{Citation, Role};
use crate::protocol::StreamEvent;
use crate::resolver::CitationResolver;
use crate::store::ChatStore;
use crate::upstream::{ChatTurn, UpstreamClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    StreamingText,
    Finalizing,
    Terminated,
}

/// Orchestrates chat turns against one knowledge source.
pub struct ChatRelay {
    upstream: Arc<dyn UpstreamClient>,
    resolver: Arc<CitationResolver>,
    store: Arc<dyn ChatStore>,
    knowledge_source: String,
    title_max_chars: usize,
}

impl ChatRelay {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        resolver: Arc<CitationResolver>,
        store: Arc<dyn ChatStore>,
        knowledge_source: String,
        title_max_chars: usize,
    ) -> Self {
        Self {
            upstream,
            resolver,
            store,
            knowledge_source,
            title_max_chars,
        }
    }

    /// Run one turn and emit its events, in order, into `tx`.
    ///
    /// `history` is the conversation's prior messages in original order;
    /// an empty history marks the first exchange and triggers title
    /// generation. The receiver side may drop at any point; emission
    /// failures are ignored and the turn runs to completion.
    pub async fn run_turn(
        &self,
        conversation_id: &str,
        history: &[ChatTurn],
        question: &str,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let mut phase = TurnPhase::StreamingText;

        let mut turns: Vec<ChatTurn> = history.to_vec();
        turns.push(ChatTurn {
            role: Role::User,
            text: question.to_string(),
        });

        let mut stream = match self
            .upstream
            .stream_generate(&turns, &self.knowledge_source)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "upstream request failed before streaming");
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let mut answer = String::new();
        let mut citations: Vec<Citation> = Vec::new();
        let mut seen_titles: HashSet<String> = HashSet::new();
        let mut failure: Option<String> = None;

        while let Some(unit) = stream.next().await {
            let unit = match unit {
                Ok(unit) => unit,
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            };

            if let Some(message) = unit.error {
                failure = Some(message);
                break;
            }

            if let Some(delta) = unit.delta {
                if !delta.is_empty() {
                    answer.push_str(&delta);
                    // Forward immediately; latency beats frame count.
                    let _ = tx
                        .send(StreamEvent::Text { text: delta })
                        .await;
                }
            }

            for reference in unit.references.unwrap_or_default() {
                // Repeated references to an already-seen source collapse
                // into the existing citation; the first id stands.
                if !seen_titles.insert(reference.title.clone()) {
                    continue;
                }
                let id = (citations.len() + 1) as u32;
                let source_uri = match self.resolver.resolve(&reference.title).await {
                    Some(url) => Some(url),
                    None => reference.uri,
                };
                citations.push(Citation {
                    id,
                    source_title: reference.title,
                    source_uri,
                    text: reference.excerpt,
                });
            }
        }

        debug!(
            conversation_id,
            phase = ?phase,
            chars = answer.len(),
            citations = citations.len(),
            failed = failure.is_some(),
            "upstream stream ended"
        );
        phase = TurnPhase::Finalizing;

        if let Some(message) = failure {
            let _ = tx.send(StreamEvent::Error { message }).await;
            finish_turn(conversation_id, &mut phase);
            return;
        }

        if !citations.is_empty() {
            let _ = tx
                .send(StreamEvent::Citations {
                    citations: citations.clone(),
                })
                .await;
        }

        if !answer.is_empty() {
            if let Err(e) = self
                .store
                .append_message(conversation_id, Role::Assistant, &answer, &citations)
                .await
            {
                warn!(conversation_id, error = %e, "failed to persist assistant message");
            }
        }

        if history.is_empty() && !answer.is_empty() {
            match self.generate_title(question, &answer).await {
                Ok(title) => {
                    match self.store.set_title_if_unset(conversation_id, &title).await {
                        Ok(true) => {
                            let _ = tx.send(StreamEvent::Title { title }).await;
                        }
                        Ok(false) => {
                            debug!(conversation_id, "conversation already titled, skipping");
                        }
                        Err(e) => {
                            warn!(conversation_id, error = %e, "failed to persist title");
                            // The generated title is still worth showing.
                            let _ = tx.send(StreamEvent::Title { title }).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(conversation_id, error = %e, "title generation failed");
                }
            }
        }

        let _ = tx.send(StreamEvent::Done).await;
        finish_turn(conversation_id, &mut phase);
    }

    /// Ask the upstream for a short conversation title.
    ///
    /// Question and answer are truncated to a bounded prefix to bound cost;
    /// the result is trimmed of quoting the model tends to add.
    async fn generate_title(&self, question: &str, answer: &str) -> Result<String> {
        let prompt = format!(
            "Generate a concise title of at most six words for a conversation \
             that begins with this exchange. Reply with the title only.\n\n\
             Question: {}\n\nAnswer: {}",
            prefix_chars(question, self.title_max_chars),
            prefix_chars(answer, self.title_max_chars),
        );

        let raw = self.upstream.generate(&prompt).await?;
        let title = raw.trim().trim_matches('"').trim().to_string();
        if title.is_empty() {
            bail!("upstream returned an empty title");
        }
        Ok(title)
    }
}

fn finish_turn(conversation_id: &str, phase: &mut TurnPhase) {
    debug_assert_eq!(*phase, TurnPhase::Finalizing);
    *phase = TurnPhase::Terminated;
    debug!(conversation_id, phase = ?phase, "turn terminated");
}

/// First `max_chars` characters of `s`, on a char boundary.
fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

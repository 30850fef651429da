//! Relay between the upstream provider and the caller.
//!
//! One request moves through `idle -> context-assembled -> upstream-invoked
//! -> relaying -> committed`:
//!
//! ```text
//! caller ──turn──▶ Relay::start ──context──▶ Provider
//!    ▲                                          │ fragments
//!    └──── mpsc ◀── relay task ◀────────────────┘
//!                      │ on completion
//!                      ▼
//!             ConversationSession (append + flush)
//! ```
//!
//! The relay task owns the upstream stream. A caller that disconnects does
//! not cancel it: the upstream is drained and the full reply committed. An
//! upstream failure mid-stream commits nothing for the assistant turn;
//! fragments already sent are not retracted.

use crate::error::GatewayError;
use crate::message::Message;
use crate::provider::{DeliveryMode, FragmentStream, Provider};
use crate::session::ConversationSession;
use briggie_common::config::BatchContext;
use briggie_common::logging::generate_trace_id;
use briggie_common::request_span;
use futures_util::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Fragments buffered between the relay task and a slow caller.
pub const FRAGMENT_BUFFER: usize = 16;

type FragmentSender = mpsc::Sender<Result<String, GatewayError>>;

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Reply appended to the conversation and flushed
    Committed { fragments: usize, reply_len: usize },
    /// Reply appended in memory but the flush failed
    NotPersisted { fragments: usize, reply_len: usize },
    /// Upstream failed; no assistant turn recorded
    Aborted { fragments: usize },
}

/// Caller side of a running relay.
pub struct RelayStream {
    fragments: mpsc::Receiver<Result<String, GatewayError>>,
    task: JoinHandle<RelayOutcome>,
}

impl RelayStream {
    /// Next fragment, in upstream order. `None` once the relay has finished.
    pub async fn next_fragment(&mut self) -> Option<Result<String, GatewayError>> {
        self.fragments.recv().await
    }

    /// Split into the fragment receiver and the relay task handle.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<Result<String, GatewayError>>,
        JoinHandle<RelayOutcome>,
    ) {
        (self.fragments, self.task)
    }

    /// Fragments as a stream. The relay task keeps running detached.
    pub fn into_stream(self) -> impl Stream<Item = Result<String, GatewayError>> + Send {
        stream::unfold(self.fragments, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }
}

/// Assembles context, invokes the provider and commits replies.
pub struct Relay {
    session: Arc<ConversationSession>,
    provider: Arc<dyn Provider>,
    system_prompt: Option<String>,
    batch_context: BatchContext,
}

impl Relay {
    pub fn new(
        session: Arc<ConversationSession>,
        provider: Arc<dyn Provider>,
        system_prompt: Option<String>,
        batch_context: BatchContext,
    ) -> Self {
        Self {
            session,
            provider,
            system_prompt,
            batch_context,
        }
    }

    /// Conversation for `user_id`, empty if never seen.
    pub async fn history(&self, user_id: &str) -> Vec<Message> {
        self.session.ensure(user_id).await
    }

    /// Record a user turn without asking the provider.
    pub async fn submit_turn(&self, user_id: &str, content: String) -> Result<Message, GatewayError> {
        let message = Message::user(content);
        self.session.append(user_id, message.clone()).await;
        self.session.flush().await?;
        Ok(message)
    }

    /// Upstream context for a conversation whose last message is the new turn.
    ///
    /// The system directive comes first. A batch provider configured with
    /// [`BatchContext::LatestTurn`] sees only the new turn after it.
    pub fn assemble_context(&self, conversation: &[Message]) -> Vec<Message> {
        let skip = match (self.provider.mode(), self.batch_context) {
            (DeliveryMode::Batch, BatchContext::LatestTurn) => conversation.len().saturating_sub(1),
            _ => 0,
        };

        let mut context = Vec::with_capacity(conversation.len() - skip + 1);
        if let Some(prompt) = &self.system_prompt {
            context.push(Message::system(prompt.clone()));
        }
        context.extend_from_slice(&conversation[skip..]);
        context
    }

    /// Record the user turn, invoke the provider and start relaying its reply.
    ///
    /// A turn already recorded by [`Relay::submit_turn`] as the last message
    /// is not recorded twice. Fails without spawning anything if the provider
    /// cannot be reached or rejects the request; the user turn stays recorded.
    pub async fn start(&self, user_id: &str, content: String) -> Result<RelayStream, GatewayError> {
        let trace_id = generate_trace_id();
        let span = request_span!(
            "relay",
            trace_id,
            user_id = %user_id,
            provider = %self.provider.name(),
            model = %self.provider.model()
        );

        let (conversation, appended) = self.session.append_user_turn(user_id, content).await;
        if appended {
            self.session.flush().instrument(span.clone()).await?;
        } else {
            tracing::debug!(parent: &span, "User turn already recorded");
        }

        let context = self.assemble_context(&conversation);
        tracing::debug!(parent: &span, context_len = context.len(), "Context assembled");

        let upstream = match self
            .provider
            .chat_stream(context)
            .instrument(span.clone())
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!(parent: &span, error = %e, "Upstream invocation failed");
                return Err(e.into());
            }
        };

        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        let task = tokio::spawn(
            relay_fragments(upstream, tx, Arc::clone(&self.session), user_id.to_string())
                .instrument(span),
        );

        Ok(RelayStream {
            fragments: rx,
            task,
        })
    }
}

/// Forward fragments in order, then commit the accumulated reply.
async fn relay_fragments(
    mut upstream: FragmentStream,
    tx: FragmentSender,
    session: Arc<ConversationSession>,
    user_id: String,
) -> RelayOutcome {
    let mut reply = String::new();
    let mut fragments = 0usize;
    let mut caller_connected = true;

    while let Some(item) = upstream.next().await {
        match item {
            Ok(fragment) => {
                fragments += 1;
                reply.push_str(&fragment);
                if caller_connected && tx.send(Ok(fragment)).await.is_err() {
                    caller_connected = false;
                    tracing::info!(fragments, "Caller disconnected, draining upstream");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, fragments, "Upstream failed mid-stream, reply not committed");
                if caller_connected {
                    let _ = tx.send(Err(e.into())).await;
                }
                return RelayOutcome::Aborted { fragments };
            }
        }
    }

    let reply_len = reply.len();
    session.append(&user_id, Message::assistant(reply)).await;

    // The caller's stream ends when `tx` drops, after the flush
    match session.flush().await {
        Ok(()) => {
            tracing::info!(fragments, reply_len, "Reply committed");
            RelayOutcome::Committed {
                fragments,
                reply_len,
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to persist assistant turn");
            if caller_connected {
                let _ = tx.send(Err(e.into())).await;
            }
            RelayOutcome::NotPersisted {
                fragments,
                reply_len,
            }
        }
    }
}

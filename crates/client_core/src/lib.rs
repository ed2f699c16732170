use std::{collections::HashSet, sync::Arc};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ConversationSummary, MessagePayload, PushFrame, UserProfile},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod error;
pub mod gateway;
pub mod session;
pub mod transport;

pub use error::GatewayError;
pub use gateway::ApiGateway;
pub use session::{SessionStore, TokenPair};
pub use transport::{MissingPushConnector, PushConnector, PushSession, WebSocketPushConnector};

/// Where a list entry came from. An optimistic entry is a placeholder keyed
/// by a locally generated temp id that never leaves the process; it is
/// replaced in place once the server confirmation arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageProvenance {
    Optimistic { temp_id: Uuid },
    Confirmed { id: MessageId },
    Remote { id: MessageId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub provenance: MessageProvenance,
    pub content: String,
    pub sender_id: UserId,
    pub sent_at: DateTime<Utc>,
    pub own: bool,
}

impl ConversationMessage {
    pub fn server_id(&self) -> Option<MessageId> {
        match self.provenance {
            MessageProvenance::Confirmed { id } | MessageProvenance::Remote { id } => Some(id),
            MessageProvenance::Optimistic { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.provenance, MessageProvenance::Optimistic { .. })
    }

    fn from_history(payload: &MessagePayload) -> Self {
        Self {
            provenance: MessageProvenance::Confirmed { id: payload.id },
            content: payload.content.clone(),
            sender_id: payload.sender_id,
            sent_at: payload.created_at,
            own: payload.is_own,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationPhase {
    Idle,
    Loading,
    Ready,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The stored credential pair is gone; the user must re-authenticate.
    SessionInvalidated,
    HistoryLoaded {
        conversation_id: ConversationId,
        message_count: usize,
    },
    MessageAppended {
        conversation_id: ConversationId,
        message: ConversationMessage,
    },
    MessageConfirmed {
        conversation_id: ConversationId,
        message: ConversationMessage,
    },
    SendFailed {
        conversation_id: ConversationId,
        content: String,
    },
    Error(String),
}

/// Client core for the messaging view: owns the authenticated gateway, the
/// local identity cache, and the live state of at most one selected
/// conversation.
///
/// Per-conversation results (history fetch, send confirmation, push frames)
/// are tagged with the generation they were issued under and dropped when
/// the selection has since moved on, so a slow response can never leak into
/// the wrong conversation.
pub struct ChatClient {
    gateway: Arc<ApiGateway>,
    connector: Arc<dyn PushConnector>,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

struct ClientState {
    user_id: Option<UserId>,
    generation: u64,
    conversation: Option<ConversationState>,
}

struct ConversationState {
    generation: u64,
    summary: ConversationSummary,
    phase: ConversationPhase,
    messages: Vec<ConversationMessage>,
    seen: HashSet<MessageId>,
    draft: String,
    push: Option<Arc<dyn PushSession>>,
    relay_task: Option<JoinHandle<()>>,
}

impl ConversationState {
    fn loading(generation: u64, summary: ConversationSummary) -> Self {
        Self {
            generation,
            summary,
            phase: ConversationPhase::Loading,
            messages: Vec::new(),
            seen: HashSet::new(),
            draft: String::new(),
            push: None,
            relay_task: None,
        }
    }

    async fn shutdown(mut self) {
        if let Some(task) = self.relay_task.take() {
            task.abort();
        }
        if let Some(push) = self.push.take() {
            push.close().await;
        }
    }
}

impl ChatClient {
    pub fn new(gateway: Arc<ApiGateway>, connector: Arc<dyn PushConnector>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            gateway,
            connector,
            inner: Mutex::new(ClientState {
                user_id: None,
                generation: 0,
                conversation: None,
            }),
            events,
        })
    }

    pub fn gateway(&self) -> &Arc<ApiGateway> {
        &self.gateway
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile> {
        self.gateway.login(email, password).await?;
        let profile = self.gateway.current_user().await?;
        {
            let mut guard = self.inner.lock().await;
            guard.user_id = Some(profile.id);
        }
        info!(user_id = %profile.id, "session: logged in");
        Ok(profile)
    }

    pub async fn logout(&self) {
        self.close_conversation().await;
        self.gateway.session().clear().await;
        self.inner.lock().await.user_id = None;
        info!("session: logged out");
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.surface(self.gateway.list_conversations().await)
    }

    /// Create-or-fetch the conversation with `recipient`, then select it.
    pub async fn open_with(self: &Arc<Self>, recipient: UserId) -> Result<ConversationSummary> {
        let summary = self.surface(self.gateway.open_conversation(recipient).await)?;
        self.select_conversation(summary.clone()).await?;
        Ok(summary)
    }

    /// Enter a conversation: tear down whatever was selected before, load
    /// history and resolve the local identity concurrently, then open the
    /// push channel. The push channel is deliberately not opened until the
    /// local user id is known, so inbound frames can always be classified as
    /// own or foreign.
    pub async fn select_conversation(
        self: &Arc<Self>,
        summary: ConversationSummary,
    ) -> Result<()> {
        let conversation_id = summary.id;
        let (generation, previous) = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            let generation = guard.generation;
            let previous = guard
                .conversation
                .replace(ConversationState::loading(generation, summary));
            (generation, previous)
        };
        if let Some(previous) = previous {
            debug!(conversation_id = %previous.summary.id, "chat: closing previous conversation");
            previous.shutdown().await;
        }
        info!(conversation_id = %conversation_id, "chat: loading conversation");

        let (history, identity) = tokio::join!(
            self.gateway.conversation_messages(conversation_id),
            self.ensure_local_identity(),
        );
        let history = match history {
            Ok(history) => history,
            Err(err) => {
                self.abandon_loading(generation).await;
                return Err(self.surface_err(err));
            }
        };
        let local_user = match identity {
            Ok(local_user) => local_user,
            Err(err) => {
                self.abandon_loading(generation).await;
                return Err(self.surface_err(err));
            }
        };

        {
            let mut guard = self.inner.lock().await;
            let Some(state) = guard
                .conversation
                .as_mut()
                .filter(|state| state.generation == generation)
            else {
                debug!(conversation_id = %conversation_id, "chat: dropping stale history result");
                return Ok(());
            };
            state.messages = history.iter().map(ConversationMessage::from_history).collect();
            state.seen.extend(history.iter().map(|payload| payload.id));
            state.phase = ConversationPhase::Ready;
        }
        let _ = self.events.send(ClientEvent::HistoryLoaded {
            conversation_id,
            message_count: history.len(),
        });
        info!(
            conversation_id = %conversation_id,
            message_count = history.len(),
            "chat: conversation ready"
        );

        self.open_push_channel(conversation_id, generation, local_user)
            .await
    }

    /// Leave the selected conversation: close the push channel and discard
    /// all per-conversation state. Re-selecting reloads history from
    /// scratch.
    pub async fn close_conversation(&self) {
        let previous = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            guard.conversation.take()
        };
        if let Some(state) = previous {
            info!(conversation_id = %state.summary.id, "chat: conversation closed");
            state.shutdown().await;
        }
    }

    /// Submit a message to the selected conversation. The entry appears in
    /// the list immediately with a temp id; confirmation replaces it in
    /// place, failure rolls it back and restores the content to the draft
    /// buffer.
    pub async fn send_message(&self, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(());
        }

        let temp_id = Uuid::new_v4();
        let (conversation_id, generation, entry) = {
            let mut guard = self.inner.lock().await;
            let local_user = guard.user_id;
            let Some(state) = guard.conversation.as_mut() else {
                bail!("no conversation selected");
            };
            if state.phase != ConversationPhase::Ready {
                bail!("conversation is still loading");
            }
            let Some(local_user) = local_user else {
                bail!("local identity unresolved");
            };
            let entry = ConversationMessage {
                provenance: MessageProvenance::Optimistic { temp_id },
                content: content.to_string(),
                sender_id: local_user,
                sent_at: Utc::now(),
                own: true,
            };
            state.messages.push(entry.clone());
            state.draft.clear();
            (state.summary.id, state.generation, entry)
        };
        let _ = self.events.send(ClientEvent::MessageAppended {
            conversation_id,
            message: entry,
        });

        match self.gateway.post_message(conversation_id, content).await {
            Ok(confirmed) => {
                let replaced = {
                    let mut guard = self.inner.lock().await;
                    let Some(state) = guard
                        .conversation
                        .as_mut()
                        .filter(|state| state.generation == generation)
                    else {
                        return Ok(());
                    };
                    state.seen.insert(confirmed.id);
                    let Some(slot) = state.messages.iter_mut().find(|message| {
                        message.provenance == MessageProvenance::Optimistic { temp_id }
                    }) else {
                        return Ok(());
                    };
                    *slot = ConversationMessage {
                        provenance: MessageProvenance::Confirmed { id: confirmed.id },
                        content: confirmed.content.clone(),
                        sender_id: confirmed.sender_id,
                        sent_at: confirmed.created_at,
                        own: true,
                    };
                    slot.clone()
                };
                debug!(
                    conversation_id = %conversation_id,
                    message_id = %confirmed.id,
                    "chat: send confirmed"
                );
                let _ = self.events.send(ClientEvent::MessageConfirmed {
                    conversation_id,
                    message: replaced,
                });
                Ok(())
            }
            Err(err) => {
                {
                    let mut guard = self.inner.lock().await;
                    if let Some(state) = guard
                        .conversation
                        .as_mut()
                        .filter(|state| state.generation == generation)
                    {
                        state.messages.retain(|message| {
                            message.provenance != MessageProvenance::Optimistic { temp_id }
                        });
                        state.draft = content.to_string();
                    }
                }
                warn!(conversation_id = %conversation_id, "chat: send failed: {err}");
                let _ = self.events.send(ClientEvent::SendFailed {
                    conversation_id,
                    content: content.to_string(),
                });
                Err(self.surface_err(err))
            }
        }
    }

    /// Snapshot of the selected conversation's message list.
    pub async fn messages(&self) -> Vec<ConversationMessage> {
        self.inner
            .lock()
            .await
            .conversation
            .as_ref()
            .map(|state| state.messages.clone())
            .unwrap_or_default()
    }

    /// Unsent input text; send failures restore the submitted content here.
    pub async fn draft(&self) -> String {
        self.inner
            .lock()
            .await
            .conversation
            .as_ref()
            .map(|state| state.draft.clone())
            .unwrap_or_default()
    }

    pub async fn active_conversation(&self) -> Option<ConversationSummary> {
        self.inner
            .lock()
            .await
            .conversation
            .as_ref()
            .map(|state| state.summary.clone())
    }

    pub async fn conversation_phase(&self) -> ConversationPhase {
        let guard = self.inner.lock().await;
        match (&guard.conversation, guard.generation) {
            (Some(state), _) => state.phase,
            (None, 0) => ConversationPhase::Idle,
            (None, _) => ConversationPhase::Closed,
        }
    }

    async fn ensure_local_identity(&self) -> Result<UserId, GatewayError> {
        if let Some(user_id) = self.inner.lock().await.user_id {
            return Ok(user_id);
        }
        let profile = self.gateway.current_user().await?;
        let mut guard = self.inner.lock().await;
        guard.user_id = Some(profile.id);
        Ok(profile.id)
    }

    async fn open_push_channel(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        generation: u64,
        local_user: UserId,
    ) -> Result<()> {
        let push = match self.connector.connect(conversation_id).await {
            Ok(push) => push,
            Err(err) => {
                self.abandon_loading(generation).await;
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("push connect failed: {err}")));
                return Err(err);
            }
        };

        let mut frames = push.subscribe_frames();
        let client = Arc::clone(self);
        let relay_task = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => client.handle_push_frame(generation, local_user, &frame).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            conversation_id = %conversation_id,
                            skipped,
                            "push: frame relay lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let leftover = {
            let mut guard = self.inner.lock().await;
            match guard
                .conversation
                .as_mut()
                .filter(|state| state.generation == generation)
            {
                Some(state) => {
                    state.push = Some(push.clone());
                    state.relay_task = Some(relay_task);
                    None
                }
                None => Some(relay_task),
            }
        };
        if let Some(task) = leftover {
            debug!(conversation_id = %conversation_id, "push: discarding channel for stale selection");
            task.abort();
            push.close().await;
        }
        Ok(())
    }

    async fn handle_push_frame(&self, generation: u64, local_user: UserId, raw: &str) {
        let frame: PushFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("push: discarding malformed frame: {err}");
                return;
            }
        };
        let PushFrame::NewMessage { message } = frame;

        let (conversation_id, entry) = {
            let mut guard = self.inner.lock().await;
            let Some(state) = guard
                .conversation
                .as_mut()
                .filter(|state| state.generation == generation)
            else {
                return;
            };
            if message.sender_id == local_user {
                debug!(message_id = %message.id, "push: ignoring self-originated echo");
                return;
            }
            if !state.seen.insert(message.id) {
                debug!(message_id = %message.id, "push: ignoring duplicate delivery");
                return;
            }
            let entry = ConversationMessage {
                provenance: MessageProvenance::Remote { id: message.id },
                content: message.content.clone(),
                sender_id: message.sender_id,
                sent_at: message.created_at,
                own: false,
            };
            state.messages.push(entry.clone());
            (state.summary.id, entry)
        };
        let _ = self.events.send(ClientEvent::MessageAppended {
            conversation_id,
            message: entry,
        });
    }

    async fn abandon_loading(&self, generation: u64) {
        let state = {
            let mut guard = self.inner.lock().await;
            match &guard.conversation {
                Some(state) if state.generation == generation => guard.conversation.take(),
                _ => None,
            }
        };
        if let Some(state) = state {
            state.shutdown().await;
        }
    }

    fn surface<T>(&self, result: Result<T, GatewayError>) -> Result<T> {
        result.map_err(|err| self.surface_err(err))
    }

    fn surface_err(&self, err: GatewayError) -> anyhow::Error {
        if matches!(err, GatewayError::SessionInvalid) {
            let _ = self.events.send(ClientEvent::SessionInvalidated);
        }
        err.into()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

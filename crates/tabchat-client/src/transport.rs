use crate::config::{ModelConfig, ModelHandle};
use crate::retry::{retry_server_errors, RetryPolicy};
use crate::stream::{StreamDecoder, StreamEvent};
use crate::wire::{CompletionRequest, CompletionResponse, StreamRequest};
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::sync::Arc;
use tabchat_core::logging::redact_key;
use tabchat_core::{ChatError, ChatResult, Message};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the per-stream event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of the current streaming request.
///
/// `Idle → Sent → (StreamOpen | Failed | Aborted) → (Completed | Aborted | Failed)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// No stream started yet.
    Idle,
    /// Request sent, waiting for response headers.
    Sent,
    /// A 200 response arrived and frames are being read.
    StreamOpen,
    /// The stream ended normally.
    Completed,
    /// The stream was cancelled.
    Aborted,
    /// The request or stream failed.
    Failed,
}

#[derive(Debug)]
struct StreamSlot {
    id: u64,
    cancel: Option<CancellationToken>,
    phase: RequestPhase,
}

impl StreamSlot {
    fn set_phase(&mut self, id: u64, phase: RequestPhase) {
        // A superseded stream must not overwrite its successor's state.
        if self.id == id {
            self.phase = phase;
        }
    }
}

/// Client for an OpenAI-compatible chat-completions endpoint.
///
/// The model is read from a shared [`ModelHandle`] at the start of every
/// call, so switching models never affects a request already in flight.
/// At most one stream is live at a time: opening a new one cancels the
/// previous stream first.
pub struct CompletionClient {
    model: ModelHandle,
    http: reqwest::Client,
    retry: RetryPolicy,
    request_cancel: Mutex<Option<CancellationToken>>,
    stream: Arc<Mutex<StreamSlot>>,
}

impl CompletionClient {
    /// A client for whatever model `model` points at, with the default
    /// retry policy.
    pub fn new(model: ModelHandle) -> Self {
        Self {
            model,
            http: reqwest::Client::new(),
            retry: RetryPolicy::default(),
            request_cancel: Mutex::new(None),
            stream: Arc::new(Mutex::new(StreamSlot {
                id: 0,
                cancel: None,
                phase: RequestPhase::Idle,
            })),
        }
    }

    /// Uses a preconfigured HTTP client (proxies, timeouts, TLS).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Overrides the retry policy of [`CompletionClient::complete_with_retry`].
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// The shared current-model handle.
    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// Phase of the most recently started stream.
    pub fn request_phase(&self) -> RequestPhase {
        self.stream.lock().phase
    }

    /// Single non-streaming completion.
    pub async fn complete(&self, request: &CompletionRequest) -> ChatResult<CompletionResponse> {
        let cancel = self.begin_request();
        let config = self.model.snapshot();
        self.send_completion(&config, request, &cancel).await
    }

    /// Non-streaming completion retried on 5xx responses per the client's
    /// [`RetryPolicy`]. Every attempt goes to the model that was current
    /// when this call started.
    pub async fn complete_with_retry(
        &self,
        request: &CompletionRequest,
    ) -> ChatResult<CompletionResponse> {
        let cancel = self.begin_request();
        let config = self.model.snapshot();
        retry_server_errors(&self.retry, &cancel, |attempt| {
            debug!(attempt, model = %config.id, "Completion attempt");
            self.send_completion(&config, request, &cancel)
        })
        .await
    }

    /// Cancels the in-flight non-streaming request and the live stream.
    pub fn abort(&self) {
        if let Some(token) = self.request_cancel.lock().take() {
            info!("Aborting in-flight completion request");
            token.cancel();
        }
        self.abort_stream();
    }

    /// Cancels the live stream, if any.
    pub fn abort_stream(&self) {
        let slot = self.stream.lock();
        if let Some(token) = &slot.cancel {
            if !token.is_cancelled() {
                info!(stream_id = slot.id, "Aborting completion stream");
            }
            token.cancel();
        }
    }

    /// Opens a streaming completion for `messages`, preceded by
    /// `system_prompt`.
    ///
    /// `messages` should already be windowed (see
    /// [`crate::ContextWindow::context`]); no budget is enforced here. Any
    /// stream still open is cancelled first.
    pub async fn stream_chat(
        &self,
        messages: &[Message],
        system_prompt: &str,
    ) -> ChatResult<ChatStream> {
        let config = self.model.snapshot();
        let (id, cancel) = self.begin_stream();

        let body = StreamRequest::build(
            &config.id,
            system_prompt,
            messages,
            &config.settings,
            config.supports_attachments,
        );
        let url = config.completions_url();
        info!(
            stream_id = id,
            url = %url,
            model = %config.id,
            messages = messages.len(),
            "Opening completion stream"
        );

        let send = self
            .http
            .post(&url)
            .header(AUTHORIZATION, config.bearer())
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send();

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(self.end_stream(id, ChatError::Aborted)),
            resp = send => resp,
        };
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => return Err(self.end_stream(id, ChatError::Network(e.to_string()))),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.bytes().await.unwrap_or_default();
            let err = api_error(status, &body, "Failed to fetch stream response");
            return Err(self.end_stream(id, err));
        }
        if resp.content_length() == Some(0) {
            return Err(self.end_stream(id, ChatError::NoResponseBody));
        }

        self.stream.lock().set_phase(id, RequestPhase::StreamOpen);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(read_stream(
            resp.bytes_stream(),
            tx,
            cancel.clone(),
            Arc::clone(&self.stream),
            id,
        ));

        Ok(ChatStream {
            id,
            events: rx,
            handle,
            cancel,
        })
    }

    fn begin_request(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.request_cancel.lock() = Some(token.clone());
        token
    }

    fn begin_stream(&self) -> (u64, CancellationToken) {
        let mut slot = self.stream.lock();
        if let Some(previous) = slot.cancel.take() {
            if matches!(slot.phase, RequestPhase::Sent | RequestPhase::StreamOpen) {
                info!(stream_id = slot.id, "Cancelling previous stream");
            }
            previous.cancel();
        }
        slot.id += 1;
        slot.phase = RequestPhase::Sent;
        let token = CancellationToken::new();
        slot.cancel = Some(token.clone());
        (slot.id, token)
    }

    fn end_stream(&self, id: u64, err: ChatError) -> ChatError {
        let phase = if matches!(err, ChatError::Aborted) {
            RequestPhase::Aborted
        } else {
            RequestPhase::Failed
        };
        warn!(stream_id = id, error = %err, "Completion stream failed to open");
        self.stream.lock().set_phase(id, phase);
        err
    }

    async fn send_completion(
        &self,
        config: &ModelConfig,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> ChatResult<CompletionResponse> {
        let url = config.completions_url();
        debug!(
            url = %url,
            key = %redact_key(&config.api_key),
            "Sending completion request"
        );

        let send = self
            .http
            .post(&url)
            .header(AUTHORIZATION, config.bearer())
            .header(CONTENT_TYPE, "application/json")
            .json(request)
            .send();

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Aborted),
            resp = send => resp.map_err(|e| ChatError::Network(e.to_string()))?,
        };

        let status = resp.status();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Aborted),
            body = resp.bytes() => body.map_err(|e| ChatError::Network(e.to_string()))?,
        };

        if !status.is_success() {
            return Err(api_error(status, &body, "API request failed"));
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Maps an error response to [`ChatError::Api`], preferring the provider's
/// `error.message`.
fn api_error(status: StatusCode, body: &[u8], fallback: &str) -> ChatError {
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| fallback.to_string());
    ChatError::api(message, Some(status.as_u16()))
}

/// Sends one event unless the stream is cancelled while the channel is full.
///
/// A reader that cancels and stops draining must not keep the read task
/// parked on a full channel.
async fn emit(tx: &mpsc::Sender<StreamEvent>, cancel: &CancellationToken, event: StreamEvent) {
    tokio::select! {
        biased;
        _ = tx.send(event) => {}
        _ = cancel.cancelled() => debug!("Dropping stream event after cancellation"),
    }
}

async fn read_stream<S, B, E>(
    mut body: S,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    slot: Arc<Mutex<StreamSlot>>,
    id: u64,
) -> ChatResult<Message>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut decoder = StreamDecoder::new();

    let outcome = loop {
        if cancel.is_cancelled() {
            break Err(ChatError::Aborted);
        }
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(ChatError::Aborted),
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            break Ok(());
        };
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => break Err(ChatError::Network(format!("Stream read error: {e}"))),
        };
        match decoder.feed(bytes.as_ref()) {
            Ok(events) => {
                for event in events {
                    emit(&tx, &cancel, event).await;
                }
            }
            Err(e) => break Err(e),
        }
        if decoder.is_done() {
            break Ok(());
        }
    };

    match outcome.and_then(|()| decoder.finish()) {
        Ok((events, message)) => {
            for event in events {
                emit(&tx, &cancel, event).await;
            }
            slot.lock().set_phase(id, RequestPhase::Completed);
            info!(stream_id = id, chars = message.content().len(), "Completion stream finished");
            Ok(message)
        }
        Err(ChatError::Aborted) => {
            emit(&tx, &cancel, decoder.abort()).await;
            slot.lock().set_phase(id, RequestPhase::Aborted);
            info!(stream_id = id, "Completion stream aborted");
            Err(ChatError::Aborted)
        }
        Err(err) => {
            for event in decoder.fail(&err) {
                emit(&tx, &cancel, event).await;
            }
            slot.lock().set_phase(id, RequestPhase::Failed);
            error!(stream_id = id, error = %err, "Completion stream failed");
            Err(err)
        }
    }
}

/// A live streaming completion.
///
/// Events arrive on an internal channel in order; the spawned read task
/// resolves to the finished assistant [`Message`] or the error that ended
/// the stream.
pub struct ChatStream {
    id: u64,
    events: mpsc::Receiver<StreamEvent>,
    handle: JoinHandle<ChatResult<Message>>,
    cancel: CancellationToken,
}

impl ChatStream {
    /// Per-client sequence number of this stream.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Requests cancellation; the stream ends with an `Aborted` event.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Splits into an event stream and the task resolving to the result.
    pub fn into_parts(
        self,
    ) -> (
        ReceiverStream<StreamEvent>,
        JoinHandle<ChatResult<Message>>,
    ) {
        (ReceiverStream::new(self.events), self.handle)
    }

    /// Drains every event and returns them with the final result.
    pub async fn collect(mut self) -> (Vec<StreamEvent>, ChatResult<Message>) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        (events, join(self.handle).await)
    }

    /// Discards events and waits for the final result.
    pub async fn finish(self) -> ChatResult<Message> {
        drop(self.events);
        join(self.handle).await
    }
}

async fn join(handle: JoinHandle<ChatResult<Message>>) -> ChatResult<Message> {
    handle
        .await
        .map_err(|e| ChatError::Network(format!("Stream task failed: {e}")))?
}

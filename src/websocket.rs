//! # WebSocket Session Handler
//!
//! One actor per connected client. The actor is the session: it registers
//! itself with the session registry when the connection starts, pushes the
//! current model status to the new client, translates inbound JSON messages
//! into lifecycle operations, and unregisters on disconnect.
//!
//! ## Concurrency:
//! Loading and transcribing take seconds, so neither may run inside the
//! actor's message loop. Slow work is `tokio::spawn`-ed with a clone of the
//! lifecycle handle, and replies come back through the actor's own mailbox
//! (`addr.do_send`), which preserves per-session ordering: for an audio
//! request the `transcribing` acknowledgement always precedes its `result`
//! or `error`. While a load or transcription runs, the actor keeps
//! processing further messages.
//!
//! ## Failure visibility:
//! Failures are replied only to the session that caused them. Other sessions
//! learn about state changes exclusively through broadcast `status`
//! messages.

use crate::audio;
use crate::model::lifecycle::{ModelLifecycle, UnloadOutcome};
use crate::session::protocol::WebSocketMessage;
use crate::session::registry::{Outbound, SessionRegistry};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::Engine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often the server pings each client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any pong before the connection is considered dead.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket actor for one client session.
pub struct VoiceWebSocket {
    /// Unique id for this connection, used as the registry key
    session_id: String,

    /// The shared model lifecycle manager
    lifecycle: Arc<ModelLifecycle>,

    /// The shared session registry
    registry: Arc<SessionRegistry>,

    /// Last time the client showed signs of life
    last_heartbeat: Instant,
}

impl VoiceWebSocket {
    pub fn new(lifecycle: Arc<ModelLifecycle>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            lifecycle,
            registry,
            last_heartbeat: Instant::now(),
        }
    }

    /// Kick off a model load in the background. A failure comes back to this
    /// session only; everyone else just sees the status broadcasts.
    fn handle_load(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let addr = ctx.address();

        tokio::spawn(async move {
            if let Err(err) = lifecycle.request_load().await {
                addr.do_send(Outbound(WebSocketMessage::error(err.to_string())));
            }
        });
    }

    /// Request an unload. Asking to unload a model that is not resident gets
    /// an error reply; asking during a load is silently ignored.
    fn handle_unload(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let addr = ctx.address();

        tokio::spawn(async move {
            if lifecycle.request_unload().await == UnloadOutcome::NotLoaded {
                addr.do_send(Outbound(WebSocketMessage::error("Model not loaded")));
            }
        });
    }

    /// Run an audio payload through the model in the background.
    ///
    /// The reply sequence for the requesting session is `transcribing`
    /// followed by `result` or `error`, in that order, because every send
    /// goes through this actor's mailbox from one task.
    fn handle_audio(&self, payload: Vec<u8>, ctx: &mut ws::WebsocketContext<Self>) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let addr = ctx.address();

        tokio::spawn(async move {
            if !lifecycle.is_loaded().await {
                addr.do_send(Outbound(WebSocketMessage::error("Model not loaded")));
                return;
            }
            addr.do_send(Outbound(WebSocketMessage::Transcribing));

            let samples = match audio::decode_samples(&payload) {
                Ok(samples) => samples,
                Err(message) => {
                    addr.do_send(Outbound(WebSocketMessage::error(message)));
                    return;
                }
            };

            match lifecycle.transcribe(&samples).await {
                Ok(text) => addr.do_send(Outbound(WebSocketMessage::Result { text })),
                Err(err) => addr.do_send(Outbound(WebSocketMessage::error(err.to_string()))),
            }
        });
    }

    fn dispatch(&self, message: WebSocketMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            WebSocketMessage::LoadModel => self.handle_load(ctx),
            WebSocketMessage::UnloadModel => self.handle_unload(ctx),
            WebSocketMessage::Audio { data } => {
                match base64::engine::general_purpose::STANDARD.decode(data) {
                    Ok(bytes) => self.handle_audio(bytes, ctx),
                    Err(err) => self.send(
                        WebSocketMessage::error(format!("Invalid base64 audio: {}", err)),
                        ctx,
                    ),
                }
            }
            // Server-to-client message types arriving from a client
            other => {
                warn!(session_id = %self.session_id, message = ?other,
                    "Ignoring unexpected message type from client");
            }
        }
    }

    fn send(&self, message: WebSocketMessage, ctx: &mut ws::WebsocketContext<Self>) {
        if let Ok(json) = serde_json::to_string(&message) {
            ctx.text(json);
        }
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket session connected");

        // Liveness pings; a client that stops answering gets disconnected
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "Heartbeat timeout, closing session");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        self.registry
            .register(&self.session_id, ctx.address().recipient());

        // The new client immediately learns the current model state
        let lifecycle = Arc::clone(&self.lifecycle);
        let addr = ctx.address();
        tokio::spawn(async move {
            let snapshot = lifecycle.status_snapshot().await;
            addr.do_send(Outbound(snapshot.to_message()));
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.registry.unregister(&self.session_id);
        info!(session_id = %self.session_id, "WebSocket session disconnected");
    }
}

/// Deliver a queued protocol message to the client socket. Used both for
/// session-local replies and for registry broadcasts.
impl Handler<Outbound> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        self.send(msg.0, ctx);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<WebSocketMessage>(&text) {
                Ok(message) => self.dispatch(message, ctx),
                Err(err) => {
                    // Malformed input is the client's problem; the
                    // connection itself stays usable
                    self.send(
                        WebSocketMessage::error(format!("Invalid message: {}", err)),
                        ctx,
                    );
                }
            },
            Ok(ws::Message::Binary(data)) => {
                // Binary frames carry raw audio without the base64 detour
                self.handle_audio(data.to_vec(), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, reason = ?reason, "Client closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                // Transport failure; tear the session down, never touching
                // anyone else
                warn!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// HTTP endpoint upgrading to the WebSocket session.
///
/// Every session receives the same shared lifecycle manager and registry
/// from application state; nothing model-related is constructed per
/// connection.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "New WebSocket connection request");

    let session = VoiceWebSocket::new(
        Arc::clone(&app_state.lifecycle),
        Arc::clone(&app_state.registry),
    );
    ws::start(session, &req, stream)
}

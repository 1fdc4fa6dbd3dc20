//! Main Gateway implementation
//!
//! Serves the live observer channel on `/ws` and a small REST surface over
//! one shared [`Orchestrator`].

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use devorch_core::{
    ApprovalId, CommandId, Orchestrator, OrchestratorError, SavedCommand, ServiceId,
    ServiceRequest, Submission, SubmissionStatus,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::hub::{ObserverHub, ObserverId, OutgoingFrame};
use crate::protocol::{ClientFrame, ClientMessage, RecentRequests, Reply, ReplyFrame, RunCommand};
use crate::{GatewayError, Result};

/// Gateway state shared across handlers
#[derive(Debug)]
pub struct GatewayState {
    pub config: GatewayConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub hub: Arc<ObserverHub>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let hub = Arc::new(ObserverHub::new(Arc::clone(orchestrator.store())));
        Self {
            config,
            orchestrator,
            hub,
        }
    }
}

/// Body of `POST /api/saved`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveCommand {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl From<SaveCommand> for SavedCommand {
    fn from(body: SaveCommand) -> Self {
        let mut saved = SavedCommand::new(body.name, body.command).with_tags(body.tags);
        saved.working_directory = body.working_directory;
        saved.description = body.description;
        saved
    }
}

/// Main Gateway
#[derive(Debug)]
pub struct Gateway {
    state: Arc<GatewayState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            state: Arc::new(GatewayState::new(config, orchestrator)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Get gateway state
    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Build the Axum router
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/ws", get(Self::handle_ws_upgrade))
            .route("/health", get(Self::handle_health))
            .route("/status", get(Self::handle_status))
            .route("/api/state", get(Self::handle_state))
            .route("/api/commands", post(Self::handle_run_command))
            .route("/api/commands/:id", get(Self::handle_get_command))
            .route("/api/commands/:id/cancel", post(Self::handle_cancel_command))
            .route("/api/approvals/:id/approve", post(Self::handle_approve))
            .route("/api/approvals/:id/reject", post(Self::handle_reject))
            .route(
                "/api/services",
                get(Self::handle_list_services).post(Self::handle_start_service),
            )
            .route("/api/services/:id", delete(Self::handle_stop_service))
            .route(
                "/api/saved",
                get(Self::handle_list_saved).post(Self::handle_save_command),
            )
            .route("/api/saved/:id", delete(Self::handle_delete_saved))
            .route("/api/saved/:id/run", post(Self::handle_run_saved))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the hub pump and the eviction sweep
    pub fn spawn_background(&self) {
        let hub = &self.state.hub;
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(hub.spawn_pump());
        tasks.push(hub.spawn_sweeper(
            self.state.config.heartbeat_interval(),
            self.state.config.heartbeat_timeout(),
        ));
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_background();
        let router = self.build_router();
        let hub = self.state.hub.clone();

        if let Ok(addr) = listener.local_addr() {
            tracing::info!("devorch gateway listening on {}", addr);
        }

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                hub.close_all();
            })
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()));

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        result
    }

    /// Bind the configured address and serve
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.state.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    // HTTP handlers

    async fn handle_health() -> impl IntoResponse {
        Json(serde_json::json!({
            "status": "healthy",
            "version": crate::VERSION
        }))
    }

    async fn handle_status(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
        let snapshot = state.orchestrator.get_status();
        Json(serde_json::json!({
            "version": crate::VERSION,
            "state_version": snapshot.version,
            "observers": state.hub.observer_count(),
            "services": snapshot.services.len(),
            "pending_approvals": snapshot.pending_approvals.len(),
            "project": snapshot.current_project,
        }))
    }

    async fn handle_state(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
        Json(state.orchestrator.get_status())
    }

    async fn handle_run_command(
        State(state): State<Arc<GatewayState>>,
        Json(body): Json<RunCommand>,
    ) -> Result<Response> {
        let submission = state.orchestrator.run_command(body.into_request()).await?;
        Ok((submission_status(&submission), Json(submission)).into_response())
    }

    async fn handle_get_command(
        State(state): State<Arc<GatewayState>>,
        Path(id): Path<String>,
    ) -> Result<Response> {
        let id = CommandId::from(id);
        let record = state
            .orchestrator
            .command(&id)
            .ok_or(OrchestratorError::CommandNotFound(id))?;
        Ok(Json(record).into_response())
    }

    async fn handle_cancel_command(
        State(state): State<Arc<GatewayState>>,
        Path(id): Path<String>,
    ) -> Result<Response> {
        let id = CommandId::from(id);
        state.orchestrator.cancel_command(&id)?;
        Ok(Json(serde_json::json!({ "cancelled": id })).into_response())
    }

    async fn handle_approve(
        State(state): State<Arc<GatewayState>>,
        Path(id): Path<String>,
    ) -> Result<Response> {
        let command_id = state.orchestrator.approve_command(&ApprovalId::from(id))?;
        Ok(Json(serde_json::json!({ "command_id": command_id })).into_response())
    }

    async fn handle_reject(
        State(state): State<Arc<GatewayState>>,
        Path(id): Path<String>,
    ) -> Result<Response> {
        let command_id = state.orchestrator.reject_command(&ApprovalId::from(id))?;
        Ok(Json(serde_json::json!({ "command_id": command_id })).into_response())
    }

    async fn handle_list_services(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
        Json(state.orchestrator.list_services())
    }

    async fn handle_start_service(
        State(state): State<Arc<GatewayState>>,
        Json(body): Json<ServiceRequest>,
    ) -> Result<Response> {
        let service = state.orchestrator.start_service(body).await?;
        Ok((StatusCode::CREATED, Json(service)).into_response())
    }

    async fn handle_stop_service(
        State(state): State<Arc<GatewayState>>,
        Path(id): Path<String>,
    ) -> Result<Response> {
        let service = state.orchestrator.stop_service(&ServiceId::from(id)).await?;
        Ok(Json(service).into_response())
    }

    async fn handle_list_saved(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
        Json(state.orchestrator.get_status().saved_commands)
    }

    async fn handle_save_command(
        State(state): State<Arc<GatewayState>>,
        Json(body): Json<SaveCommand>,
    ) -> Result<Response> {
        let saved = state.orchestrator.save_command(body.into())?;
        Ok((StatusCode::CREATED, Json(saved)).into_response())
    }

    async fn handle_delete_saved(
        State(state): State<Arc<GatewayState>>,
        Path(id): Path<String>,
    ) -> Result<Response> {
        state.orchestrator.delete_saved_command(&id)?;
        Ok(StatusCode::NO_CONTENT.into_response())
    }

    async fn handle_run_saved(
        State(state): State<Arc<GatewayState>>,
        Path(id): Path<String>,
    ) -> Result<Response> {
        let submission = state.orchestrator.run_saved_command(&id)?;
        Ok((submission_status(&submission), Json(submission)).into_response())
    }

    // WebSocket

    async fn handle_ws_upgrade(
        ws: WebSocketUpgrade,
        State(state): State<Arc<GatewayState>>,
    ) -> Response {
        ws.on_upgrade(move |socket| Self::handle_ws_connection(socket, state))
    }

    async fn handle_ws_connection(socket: WebSocket, state: Arc<GatewayState>) {
        let (mut sink, mut stream) = socket.split();
        let (outgoing_tx, mut outgoing_rx) =
            mpsc::channel::<OutgoingFrame>(state.config.observer_buffer.max(1));

        let observer = match state.hub.register(outgoing_tx) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Failed to register observer: {}", e);
                return;
            }
        };
        tracing::info!("WebSocket connected: {}", observer);

        // Forwards queued frames and pings; ends when the hub drops the sender
        let heartbeat = state.config.heartbeat_interval();
        let writer = async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    frame = outgoing_rx.recv() => match frame {
                        Some(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        };

        let reader_state = state.clone();
        let reader_observer = observer.clone();
        let reader = async move {
            let mut recent = RecentRequests::new(reader_state.config.dedup_capacity);
            while let Some(msg) = stream.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::debug!("WebSocket read error on {}: {}", reader_observer, e);
                        break;
                    }
                };
                reader_state.hub.touch(&reader_observer);
                match msg {
                    Message::Text(text) => {
                        if let Err(e) = Self::handle_text_message(
                            &reader_state,
                            &reader_observer,
                            &mut recent,
                            &text,
                        )
                        .await
                        {
                            tracing::debug!("Error handling frame from {}: {}", reader_observer, e);
                        }
                    }
                    Message::Close(_) => {
                        tracing::info!("WebSocket closing: {}", reader_observer);
                        break;
                    }
                    _ => {}
                }
            }
        };

        tokio::select! {
            _ = writer => {}
            _ = reader => {}
        }

        state.hub.unregister(&observer);
        tracing::info!("WebSocket disconnected: {}", observer);
    }

    async fn handle_text_message(
        state: &Arc<GatewayState>,
        observer: &ObserverId,
        recent: &mut RecentRequests,
        text: &str,
    ) -> Result<()> {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                let reply = Reply::Error {
                    request_id: None,
                    code: "invalid_request".to_string(),
                    message: format!("unreadable frame: {}", e),
                };
                return Self::reply(state, observer, reply).await;
            }
        };
        let request_id = frame.request_id;

        if let Some(id) = request_id.as_deref() {
            if !recent.insert(id) {
                tracing::debug!("Duplicate request {} from {}", id, observer);
                let reply = Reply::Ack {
                    request_id,
                    result: serde_json::json!({ "duplicate": true }),
                };
                return Self::reply(state, observer, reply).await;
            }
        }

        let reply = match frame.message {
            ClientMessage::GetState => return state.hub.resync(observer),
            ClientMessage::Ping => Reply::Pong { request_id },
            message => match Self::dispatch(&state.orchestrator, message).await {
                Ok(result) => Reply::Ack { request_id, result },
                Err(e) => Reply::Error {
                    request_id,
                    code: e.code().to_string(),
                    message: e.to_string(),
                },
            },
        };
        Self::reply(state, observer, reply).await
    }

    async fn reply(state: &Arc<GatewayState>, observer: &ObserverId, reply: Reply) -> Result<()> {
        let frame = ReplyFrame::new(state.hub.store().version(), reply).to_json()?;
        state.hub.send_to(observer, frame).await
    }

    /// Run one state-changing client frame against the orchestrator
    async fn dispatch(
        orchestrator: &Orchestrator,
        message: ClientMessage,
    ) -> Result<serde_json::Value> {
        let result = match message {
            ClientMessage::Approve { approval_id } => {
                serde_json::json!({ "command_id": orchestrator.approve_command(&approval_id)? })
            }
            ClientMessage::Reject { approval_id } => {
                serde_json::json!({ "command_id": orchestrator.reject_command(&approval_id)? })
            }
            ClientMessage::RunCommand(run) => {
                serde_json::to_value(orchestrator.run_command(run.into_request()).await?)?
            }
            ClientMessage::CancelCommand { command_id } => {
                orchestrator.cancel_command(&command_id)?;
                serde_json::json!({ "cancelled": command_id })
            }
            ClientMessage::StartService(request) => {
                serde_json::to_value(orchestrator.start_service(request).await?)?
            }
            ClientMessage::StopService { service_id } => {
                serde_json::to_value(orchestrator.stop_service(&service_id).await?)?
            }
            ClientMessage::ClearLogs => {
                orchestrator.clear_logs();
                serde_json::json!({ "cleared": true })
            }
            ClientMessage::GetState | ClientMessage::Ping => {
                return Err(GatewayError::InvalidRequest(
                    "frame carries no action".to_string(),
                ))
            }
        };
        Ok(result)
    }
}

fn submission_status(submission: &Submission) -> StatusCode {
    match submission.status {
        SubmissionStatus::Executed => StatusCode::OK,
        SubmissionStatus::PendingApproval => StatusCode::ACCEPTED,
        SubmissionStatus::Rejected => StatusCode::FORBIDDEN,
    }
}

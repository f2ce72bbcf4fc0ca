//! Deliberation Coordinator (C6): the HTTP/SSE boundary of the core
//! (SPEC_FULL.md §4.6/§6). Validates caller identity and configuration,
//! creates the Conversation + root Node, promotes staged uploads, wires the
//! chosen engine's event channel into an SSE response, and maps store/engine
//! errors onto the status table in §7.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response, Sse};
use axum::response::sse::Event as SseEvent;
use axum::routing::{get, post, put};
use axum::Router;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::engines::dxo::Role;
use crate::engines::{dag, dxo, ensemble, EngineHandle};
use crate::events::DeliberationEvent;
use crate::gateway::{CatalogCache, HttpGateway, LlmGateway};
use crate::model::{ConversationId, FileType, Method, Node, NodeId, NodeType, NodeView};
use crate::store::{ArtifactStore, StoreError};

const DEV_USER: &str = "dev-user";

/// Errors surfaced at the HTTP boundary. Mirrors §10.2's `CoordinatorError`.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no gateway API key configured")]
    NoApiKey,

    #[error("No roles defined!")]
    NoRolesDefined,

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoordinatorError::NoApiKey | CoordinatorError::NoRolesDefined | CoordinatorError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            CoordinatorError::Store(StoreError::NotFound) | CoordinatorError::Store(StoreError::Forbidden) => {
                StatusCode::NOT_FOUND
            }
            CoordinatorError::Store(StoreError::AttachmentTooLarge(_))
            | CoordinatorError::Store(StoreError::UnsupportedType(_)) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// An uploaded-but-not-yet-attached file, keyed by opaque token (§6).
struct StagedUpload {
    filename: String,
    file_type: FileType,
    mime_type: String,
    file_data: Vec<u8>,
    user_id: String,
    staged_at: Instant,
}

/// Process-wide upload staging map. Entries are purged on consumption or TTL
/// expiry (§5, §9).
#[derive(Clone, Default)]
struct StagingMap {
    inner: Arc<Mutex<HashMap<String, StagedUpload>>>,
}

impl StagingMap {
    fn insert(&self, token: String, upload: StagedUpload) {
        self.inner.lock().unwrap().insert(token, upload);
    }

    /// Take the entry if present, not expired, and owned by `user_id`.
    fn take(&self, token: &str, user_id: &str, ttl: Duration) -> Option<StagedUpload> {
        let mut guard = self.inner.lock().unwrap();
        let upload = guard.get(token)?;
        if upload.staged_at.elapsed() > ttl || upload.user_id != user_id {
            return None;
        }
        guard.remove(token)
    }
}

/// Shared server state.
pub struct AppState {
    pub store: ArtifactStore,
    pub gateway: Arc<dyn LlmGateway>,
    pub catalog: CatalogCache,
    pub config: Config,
    staging: StagingMap,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, CoordinatorError> {
        let api_key = config.gateway_api_key.clone().ok_or(CoordinatorError::NoApiKey)?;
        Ok(AppState {
            store: ArtifactStore::new(),
            gateway: Arc::new(HttpGateway::new(config.gateway_base_url.clone(), api_key)),
            catalog: CatalogCache::new(),
            config,
            staging: StagingMap::default(),
        })
    }

    fn engine_handle(&self, user_id: String) -> EngineHandle {
        EngineHandle {
            store: self.store.clone(),
            gateway: self.gateway.clone(),
            catalog: self.catalog.clone(),
            user_id,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/council/run", post(council_run_handler))
        .route("/council/start", post(council_start_handler))
        .route("/superchat/chat", post(superchat_chat_handler))
        .route("/upload", post(upload_handler))
        .route("/attachments/{id}", get(attachment_download_handler))
        .route("/history", get(history_list_handler))
        .route("/history/{id}", get(history_detail_handler))
        .route("/conversations/{id}/cost", get(conversation_cost_handler))
        .route("/nodes/{id}/cost", put(update_node_cost_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn user_id_of(headers: &HeaderMap) -> String {
    headers
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEV_USER)
        .to_string()
}

#[derive(Deserialize)]
struct CouncilRunRequest {
    prompt: String,
    method: Method,
    #[serde(default)]
    council_members: Vec<String>,
    #[serde(default)]
    chairman_model: String,
    #[serde(default)]
    roles: Vec<Role>,
    max_iterations: Option<u32>,
    #[serde(default)]
    attachment_ids: Vec<String>,
}

/// Creates the Conversation + root Node, promotes staged attachments, and
/// returns the engine handle plus root node ready to run.
fn start_conversation(
    state: &AppState,
    user_id: &str,
    method: Method,
    prompt: &str,
    attachment_ids: &[String],
) -> Result<(ConversationId, Node), CoordinatorError> {
    let title = crate::model::Conversation::derive_title(prompt);
    let conversation = state.store.create_conversation(user_id.to_string(), title, method);

    let uploads = take_staged(state, user_id, attachment_ids);
    let filenames: Vec<String> = uploads.iter().map(|u| u.filename.clone()).collect();

    let root = state.store.create_node(
        conversation.id,
        None,
        NodeType::Root,
        prompt.to_string(),
        Some("user".to_string()),
        None,
        filenames_manifest_from_names(&filenames),
        0.0,
        None,
    )?;

    attach_staged(state, root.id, uploads);

    Ok((conversation.id, root))
}

/// Takes every staging-map entry named in `attachment_ids` that is owned by
/// `user_id` and not expired, silently dropping mismatches (§4.6).
fn take_staged(state: &AppState, user_id: &str, attachment_ids: &[String]) -> Vec<StagedUpload> {
    let ttl = Duration::from_secs(state.config.staging_ttl_secs);
    attachment_ids
        .iter()
        .filter_map(|token| state.staging.take(token, user_id, ttl))
        .collect()
}

fn attach_staged(state: &AppState, node_id: NodeId, uploads: Vec<StagedUpload>) {
    for upload in uploads {
        let _ = state
            .store
            .attach(node_id, upload.filename, upload.mime_type, upload.file_type, upload.file_data);
    }
}

/// Populates `state.catalog` for `user_id` on first use (§4.2: fetch once
/// per user, not once per call). A failed fetch is logged and left for the
/// next call to retry rather than failing the run — `unsupported_attachments`
/// degrades to no warnings against an empty catalog.
async fn ensure_catalog(state: &AppState, user_id: &str) {
    if state.catalog.is_cached(user_id) {
        return;
    }
    match state.gateway.fetch_catalog().await {
        Ok(catalog) => state.catalog.set_catalog(user_id, catalog),
        Err(e) => warn!(user_id, error = %e, "failed to fetch model catalog"),
    }
}

fn filenames_manifest_from_names(names: &[String]) -> Option<String> {
    if names.is_empty() {
        None
    } else {
        Some(names.join(","))
    }
}

async fn council_run_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CouncilRunRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, CoordinatorError> {
    let user_id = user_id_of(&headers);
    if req.method == Method::Dxo && req.roles.is_empty() {
        return Err(CoordinatorError::NoRolesDefined);
    }

    ensure_catalog(&state, &user_id).await;
    let (conversation_id, root) = start_conversation(&state, &user_id, req.method, &req.prompt, &req.attachment_ids)?;
    let handle = state.engine_handle(user_id);
    let max_iterations = req.max_iterations.unwrap_or(state.config.default_max_iterations);

    let span = tracing::info_span!("deliberation", conversation_id, method = %req.method);
    let _enter = span.enter();
    info!("starting council run");

    let (tx, rx) = mpsc::channel(256);
    let _ = tx.send(DeliberationEvent::Start { conversation_id }).await;
    let root_attachments = state.store.attachments_of(root.id);
    let _ = tx
        .send(DeliberationEvent::Node {
            node: NodeView::new(&root, &root_attachments),
        })
        .await;

    match req.method {
        Method::Dag => {
            tokio::spawn(dag::run(handle, conversation_id, root, req.council_members, req.chairman_model, tx));
        }
        Method::Ensemble => {
            tokio::spawn(ensemble::run(
                handle,
                conversation_id,
                root,
                req.council_members,
                req.chairman_model,
                None,
                tx,
            ));
        }
        Method::Dxo => {
            tokio::spawn(dxo::run(handle, conversation_id, root, req.roles, max_iterations, tx));
        }
        Method::Superchat => {
            return Err(CoordinatorError::Validation(
                "use /superchat/chat for superchat turns".to_string(),
            ));
        }
    }

    Ok(sse_from_receiver(rx))
}

#[derive(Deserialize)]
struct CouncilStartRequest {
    prompt: String,
    method: Method,
    #[serde(default)]
    attachment_ids: Vec<String>,
}

#[derive(Serialize)]
struct CouncilStartResponse {
    conversation_id: ConversationId,
    root: NodeView,
}

/// Lightweight convenience entry point (§9/§10.5): creates the Conversation
/// + root Node without running any engine.
async fn council_start_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CouncilStartRequest>,
) -> Result<Json<CouncilStartResponse>, CoordinatorError> {
    let user_id = user_id_of(&headers);
    let (conversation_id, root) = start_conversation(&state, &user_id, req.method, &req.prompt, &req.attachment_ids)?;
    let attachments = state.store.attachments_of(root.id);
    Ok(Json(CouncilStartResponse {
        conversation_id,
        root: NodeView::new(&root, &attachments),
    }))
}

#[derive(Deserialize)]
struct SuperchatChatRequest {
    prompt: String,
    conversation_id: Option<ConversationId>,
    #[serde(default)]
    council_members: Vec<String>,
    #[serde(default)]
    chairman_model: String,
    #[serde(default)]
    attachment_ids: Vec<String>,
}

/// Continues an existing conversation by anchoring the new turn's root to
/// the prior `synthesis` node and prepending its content into the ensemble
/// prompt (§6).
async fn superchat_chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SuperchatChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, CoordinatorError> {
    let user_id = user_id_of(&headers);
    ensure_catalog(&state, &user_id).await;

    let (conversation_id, root, prompt_override) = match req.conversation_id {
        None => {
            let (cid, root) = start_conversation(&state, &user_id, Method::Superchat, &req.prompt, &req.attachment_ids)?;
            (cid, root, None)
        }
        Some(cid) => {
            state.store.get_conversation(cid, &user_id)?;
            let prior_synthesis = state
                .store
                .list_nodes(cid)
                .into_iter()
                .rev()
                .find(|n| n.node_type == NodeType::Synthesis)
                .ok_or_else(|| CoordinatorError::Validation("conversation has no prior synthesis".to_string()))?;

            let uploads = take_staged(&state, &user_id, &req.attachment_ids);
            let filenames: Vec<String> = uploads.iter().map(|u| u.filename.clone()).collect();
            let root = state.store.create_node(
                cid,
                Some(prior_synthesis.id),
                NodeType::Root,
                req.prompt.clone(),
                Some("user".to_string()),
                None,
                filenames_manifest_from_names(&filenames),
                0.0,
                None,
            )?;
            attach_staged(&state, root.id, uploads);

            let prompt_override = format!(
                "Context from previous turn:\n{}\n\nNew Request: {}",
                prior_synthesis.content, req.prompt
            );
            (cid, root, Some(prompt_override))
        }
    };

    let handle = state.engine_handle(user_id);
    let (tx, rx) = mpsc::channel(256);
    let _ = tx.send(DeliberationEvent::Start { conversation_id }).await;
    let root_attachments = state.store.attachments_of(root.id);
    let _ = tx
        .send(DeliberationEvent::Node {
            node: NodeView::new(&root, &root_attachments),
        })
        .await;

    tokio::spawn(ensemble::run(
        handle,
        conversation_id,
        root,
        req.council_members,
        req.chairman_model,
        prompt_override,
        tx,
    ));

    Ok(sse_from_receiver(rx))
}

fn sse_from_receiver(mut rx: mpsc::Receiver<DeliberationEvent>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let is_terminal = matches!(event, DeliberationEvent::Done | DeliberationEvent::Error { .. });
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(SseEvent::default().data(data));
            if is_terminal {
                break;
            }
        }
    };
    Sse::new(stream)
}

#[derive(Serialize)]
struct UploadResponse {
    id: String,
    filename: String,
    size: u64,
    #[serde(rename = "type")]
    file_type: FileType,
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Vec<UploadResponse>>, CoordinatorError> {
    let user_id = user_id_of(&headers);
    let mut out = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| CoordinatorError::Validation(e.to_string()))? {
        let filename = field.file_name().unwrap_or("upload").to_string();
        let mime_type = field.content_type().unwrap_or("application/octet-stream").to_string();
        let data: Bytes = field.bytes().await.map_err(|e| CoordinatorError::Validation(e.to_string()))?;

        let file_type = FileType::from_mime(&mime_type)
            .ok_or_else(|| CoordinatorError::Validation(format!("Unsupported file type: {mime_type}")))?;
        if data.len() as u64 > file_type.max_size() {
            return Err(CoordinatorError::Validation(format!("File too large: {filename}")));
        }

        let token = uuid::Uuid::new_v4().to_string();
        let size = data.len() as u64;
        state.staging.insert(
            token.clone(),
            StagedUpload {
                filename: filename.clone(),
                file_type,
                mime_type,
                file_data: data.to_vec(),
                user_id: user_id.clone(),
                staged_at: Instant::now(),
            },
        );
        out.push(UploadResponse {
            id: token,
            filename,
            size,
            file_type,
        });
    }

    Ok(Json(out))
}

async fn attachment_download_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, CoordinatorError> {
    let user_id = user_id_of(&headers);
    let attachment = state.store.get_attachment_owned(id, &user_id)?;
    let mut response = attachment.file_data.clone().into_response();
    response
        .headers_mut()
        .insert(axum::http::header::CONTENT_TYPE, attachment.mime_type.parse().unwrap());
    Ok(response)
}

#[derive(Serialize)]
struct ConversationSummary {
    id: ConversationId,
    title: String,
    method: Method,
    created_at: chrono::DateTime<chrono::Utc>,
}

async fn history_list_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<Vec<ConversationSummary>> {
    let user_id = user_id_of(&headers);
    let summaries = state
        .store
        .list_conversations(&user_id)
        .into_iter()
        .map(|c| ConversationSummary {
            id: c.id,
            title: c.title,
            method: c.method,
            created_at: c.created_at,
        })
        .collect();
    Json(summaries)
}

#[derive(Serialize)]
struct ConversationDetail {
    id: ConversationId,
    title: String,
    method: Method,
    created_at: chrono::DateTime<chrono::Utc>,
    nodes: Vec<NodeView>,
}

async fn history_detail_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ConversationId>,
) -> Result<Json<ConversationDetail>, CoordinatorError> {
    let user_id = user_id_of(&headers);
    let conversation = state.store.get_conversation(id, &user_id)?;
    let nodes = state
        .store
        .list_nodes(id)
        .into_iter()
        .map(|n| {
            let attachments = state.store.attachments_of(n.id);
            NodeView::new(&n, &attachments)
        })
        .collect();
    Ok(Json(ConversationDetail {
        id: conversation.id,
        title: conversation.title,
        method: conversation.method,
        created_at: conversation.created_at,
        nodes,
    }))
}

#[derive(Serialize)]
struct CostResponse {
    conversation_id: ConversationId,
    total_cost: f64,
}

async fn conversation_cost_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ConversationId>,
) -> Result<Json<CostResponse>, CoordinatorError> {
    let user_id = user_id_of(&headers);
    state.store.get_conversation(id, &user_id)?;
    Ok(Json(CostResponse {
        conversation_id: id,
        total_cost: state.store.total_cost(id),
    }))
}

#[derive(Deserialize)]
struct UpdateCostRequest {
    cost: f64,
}

async fn update_node_cost_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<NodeId>,
    Json(req): Json<UpdateCostRequest>,
) -> Result<Json<NodeView>, CoordinatorError> {
    let user_id = user_id_of(&headers);
    let node = state.store.update_node_cost(id, &user_id, req.cost)?;
    let attachments = state.store.attachments_of(node.id);
    Ok(Json(NodeView::new(&node, &attachments)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Capabilities, GatewayResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCatalogGateway {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LlmGateway for CountingCatalogGateway {
        async fn complete(
            &self,
            model: &str,
            _prompt: &str,
            _attachments: &[crate::model::Attachment],
        ) -> GatewayResult<(String, crate::gateway::CostInfo)> {
            Ok((format!("out from {model}"), crate::gateway::CostInfo::default()))
        }

        async fn fetch_catalog(&self) -> GatewayResult<HashMap<String, Capabilities>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut catalog = HashMap::new();
            catalog.insert("m1".to_string(), Capabilities { image: true, ..Default::default() });
            Ok(catalog)
        }
    }

    fn state_with_counting_gateway() -> Arc<AppState> {
        Arc::new(AppState {
            store: ArtifactStore::new(),
            gateway: Arc::new(CountingCatalogGateway { calls: AtomicUsize::new(0) }),
            catalog: CatalogCache::new(),
            config: Config::default(),
            staging: StagingMap::default(),
        })
    }

    #[tokio::test]
    async fn ensure_catalog_fetches_once_per_user() {
        let state = state_with_counting_gateway();
        ensure_catalog(&state, "alice").await;
        ensure_catalog(&state, "alice").await;
        assert!(state.catalog.is_cached("alice"));
        assert!(!state.catalog.is_cached("bob"));
    }

    #[test]
    fn user_id_defaults_when_header_absent() {
        let headers = HeaderMap::new();
        assert_eq!(user_id_of(&headers), DEV_USER);
    }

    #[test]
    fn user_id_reads_header_when_present() {
        let mut headers = HeaderMap::new();
        headers.insert("X-User-Id", "alice".parse().unwrap());
        assert_eq!(user_id_of(&headers), "alice");
    }

    #[test]
    fn staging_take_rejects_wrong_owner() {
        let staging = StagingMap::default();
        staging.insert(
            "tok".to_string(),
            StagedUpload {
                filename: "f.png".to_string(),
                file_type: FileType::Image,
                mime_type: "image/png".to_string(),
                file_data: vec![1, 2, 3],
                user_id: "owner".to_string(),
                staged_at: Instant::now(),
            },
        );
        assert!(staging.take("tok", "someone-else", Duration::from_secs(3600)).is_none());
    }

    #[test]
    fn staging_take_rejects_expired_entry() {
        let staging = StagingMap::default();
        staging.insert(
            "tok".to_string(),
            StagedUpload {
                filename: "f.png".to_string(),
                file_type: FileType::Image,
                mime_type: "image/png".to_string(),
                file_data: vec![1],
                user_id: "owner".to_string(),
                staged_at: Instant::now() - Duration::from_secs(10),
            },
        );
        assert!(staging.take("tok", "owner", Duration::from_secs(1)).is_none());
    }
}

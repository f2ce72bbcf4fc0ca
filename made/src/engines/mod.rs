//! Deliberation Engines (C4): Ensemble, DAG, and DxO strategies that
//! sequence LLM calls, fan out parallel sub-tasks, and emit artifacts.
//!
//! This module holds the shared plumbing the three engines in
//! [`ensemble`], [`dag`], and [`dxo`] all need: a handle bundling the
//! store/gateway/catalog, a clean internal `CallOutcome` sum type standing
//! in for the distilled source's magic-string error prefix (SPEC_FULL.md
//! §9 design note), and the pseudonymous-labeling helpers used by the
//! Ensemble/DAG synthesis and critique phases.

pub mod dag;
pub mod dxo;
pub mod ensemble;

use std::sync::Arc;

use crate::context::{ancestor_attachments, filenames_manifest};
use crate::events::DeliberationEvent;
use crate::gateway::{CatalogCache, GatewayError, LlmGateway};
use crate::model::{Attachment, ConversationId, Node, NodeId, NodeType};
use crate::store::ArtifactStore;
use tokio::sync::mpsc::Sender;

/// Shared handle passed into every engine invocation.
#[derive(Clone)]
pub struct EngineHandle {
    pub store: ArtifactStore,
    pub gateway: Arc<dyn LlmGateway>,
    pub catalog: CatalogCache,
    pub user_id: String,
}

/// Internal, clean stand-in for the source's magic-string error prefix: a
/// result-sum type rather than sniffing `content.starts_with("Error...")`.
enum CallOutcome {
    Ok { content: String, cost: f64 },
    Err { message: String },
}

async fn run_call(handle: &EngineHandle, model: &str, prompt: &str, attachments: &[Attachment]) -> CallOutcome {
    match handle.gateway.complete(model, prompt, attachments).await {
        Ok((content, cost)) => CallOutcome::Ok {
            content,
            cost: cost.actual_cost,
        },
        Err(GatewayError::Transport(e)) => CallOutcome::Err { message: e.to_string() },
        Err(e) => CallOutcome::Err { message: e.to_string() },
    }
}

/// Dispatches one LLM call and persists its result as a child node.
///
/// Used by the fan-out (`join_all`) phases only: on failure the node's
/// `content` begins with `"Error conducting research: "` per §4.4's
/// shared fan-out contract, rather than failing the whole deliberation —
/// a sibling call may still succeed. Single-call phases use
/// [`try_call_and_create_node`] instead, which surfaces failure as a
/// terminal event.
#[allow(clippy::too_many_arguments)]
async fn call_and_create_node(
    handle: &EngineHandle,
    conversation_id: ConversationId,
    parent_id: NodeId,
    node_type: NodeType,
    model_name: String,
    prompt: String,
    originating_node_id: NodeId,
    max_depth: usize,
) -> Node {
    call_and_create_node_as(
        handle,
        conversation_id,
        parent_id,
        node_type,
        model_name.clone(),
        model_name,
        prompt,
        originating_node_id,
        max_depth,
    )
    .await
}

/// Like [`call_and_create_node`], but the model id actually invoked
/// (`api_model`) may differ from the display name persisted on the node
/// (`display_name`) — used by DxO, which stores reviewer nodes under
/// `"{role.name} ({role.model})"` (SPEC_FULL.md §4.4's display-name note).
#[allow(clippy::too_many_arguments)]
async fn call_and_create_node_as(
    handle: &EngineHandle,
    conversation_id: ConversationId,
    parent_id: NodeId,
    node_type: NodeType,
    api_model: String,
    display_name: String,
    prompt: String,
    originating_node_id: NodeId,
    max_depth: usize,
) -> Node {
    let attachments = ancestor_attachments(&handle.store, originating_node_id, max_depth);
    let manifest = filenames_manifest(&attachments);
    let outcome = run_call(handle, &api_model, &prompt, &attachments).await;

    let (content, cost, warnings) = match outcome {
        CallOutcome::Ok { content, cost } => {
            let warnings = handle.catalog.unsupported_attachments(&handle.user_id, &api_model, &attachments);
            let warnings = if warnings.is_empty() { None } else { Some(warnings) };
            (content, cost, warnings)
        }
        CallOutcome::Err { message } => (format!("Error conducting research: {message}"), 0.0, None),
    };

    handle
        .store
        .create_node(
            conversation_id,
            Some(parent_id),
            node_type,
            content,
            Some(display_name),
            Some(prompt.trim().to_string()),
            manifest,
            cost,
            warnings,
        )
        .expect("parent_id was just validated by the caller")
}

/// Like [`call_and_create_node`], but for single-call phases (coordinator,
/// solo synthesis, proposer, critic-gate): a gateway failure must *not* be
/// reified in-band as node content, since there's no peer call to fall back
/// on. Instead it's surfaced as a terminal [`DeliberationEvent::Error`] and
/// the caller returns immediately — the partial DAG stays persisted.
#[allow(clippy::too_many_arguments)]
async fn try_call_and_create_node(
    handle: &EngineHandle,
    tx: &Sender<DeliberationEvent>,
    conversation_id: ConversationId,
    parent_id: NodeId,
    node_type: NodeType,
    model_name: String,
    prompt: String,
    originating_node_id: NodeId,
    max_depth: usize,
) -> Option<Node> {
    try_call_and_create_node_as(
        handle,
        tx,
        conversation_id,
        parent_id,
        node_type,
        model_name.clone(),
        model_name,
        prompt,
        originating_node_id,
        max_depth,
    )
    .await
}

/// Like [`call_and_create_node_as`], but fails the deliberation instead of
/// reifying the error in-band — see [`try_call_and_create_node`].
#[allow(clippy::too_many_arguments)]
async fn try_call_and_create_node_as(
    handle: &EngineHandle,
    tx: &Sender<DeliberationEvent>,
    conversation_id: ConversationId,
    parent_id: NodeId,
    node_type: NodeType,
    api_model: String,
    display_name: String,
    prompt: String,
    originating_node_id: NodeId,
    max_depth: usize,
) -> Option<Node> {
    let attachments = ancestor_attachments(&handle.store, originating_node_id, max_depth);
    let manifest = filenames_manifest(&attachments);
    let outcome = run_call(handle, &api_model, &prompt, &attachments).await;

    let (content, cost) = match outcome {
        CallOutcome::Ok { content, cost } => (content, cost),
        CallOutcome::Err { message } => {
            let _ = tx.send(DeliberationEvent::Error { message }).await;
            return None;
        }
    };
    let warnings = handle.catalog.unsupported_attachments(&handle.user_id, &api_model, &attachments);
    let warnings = if warnings.is_empty() { None } else { Some(warnings) };

    let node = handle
        .store
        .create_node(
            conversation_id,
            Some(parent_id),
            node_type,
            content,
            Some(display_name),
            Some(prompt.trim().to_string()),
            manifest,
            cost,
            warnings,
        )
        .expect("parent_id was just validated by the caller");
    Some(node)
}

fn node_event(node: &Node, store: &ArtifactStore) -> DeliberationEvent {
    let attachments = store.attachments_of(node.id);
    DeliberationEvent::Node {
        node: crate::model::NodeView::new(node, &attachments),
    }
}

/// Anonymize a set of contributor contents as "Agent 1"..."Agent N" by
/// positional index, per §4.4.1/§4.4.2 (deliberately *not* labeled by model
/// id, to avoid biasing the synthesizer).
fn anonymize(contents: &[String], header: &str) -> String {
    contents
        .iter()
        .enumerate()
        .map(|(i, c)| format!("--- {} {} ---\n{}\n", header, i + 1, c))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymize_labels_by_position_not_model() {
        let contents = vec!["alpha".to_string(), "beta".to_string()];
        let bundle = anonymize(&contents, "Agent");
        assert!(bundle.contains("--- Agent 1 ---"));
        assert!(bundle.contains("--- Agent 2 ---"));
        assert!(!bundle.to_lowercase().contains("gpt"));
    }
}

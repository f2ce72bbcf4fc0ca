//! Ensemble Engine (§4.4.1): single-round parallel fan-out research,
//! followed by one anonymized synthesis call.

use futures::future::join_all;
use tokio::sync::mpsc::Sender;

use super::{anonymize, call_and_create_node, node_event, try_call_and_create_node, EngineHandle};
use crate::events::DeliberationEvent;
use crate::model::{ConversationId, Node, NodeType};

const MAX_DEPTH: usize = 3;

/// Run the Ensemble engine against `root`, emitting events on `tx` in
/// happens-before order: all research events before the synthesis status
/// event, per §5's phase-ordering guarantee.
///
/// `prompt_override`, when set, is used in place of `root.content` as the
/// user request text (SuperChat turns prepend prior-turn context — §4.6).
pub async fn run(
    handle: EngineHandle,
    conversation_id: ConversationId,
    root: Node,
    council_members: Vec<String>,
    chairman_model: String,
    prompt_override: Option<String>,
    tx: Sender<DeliberationEvent>,
) {
    let user_prompt = prompt_override.unwrap_or_else(|| root.content.clone());

    let _ = tx
        .send(DeliberationEvent::Status {
            message: "All models are researching in parallel...".to_string(),
        })
        .await;

    let research_futures = council_members.into_iter().map(|model| {
        let handle = handle.clone();
        let prompt = format!(
            "You are a Model in an ensemble. The user has asked: '{user_prompt}'. Please answer..."
        );
        let root_id = root.id;
        async move {
            call_and_create_node(
                &handle,
                conversation_id,
                root_id,
                NodeType::Research,
                model,
                prompt,
                root_id,
                MAX_DEPTH,
            )
            .await
        }
    });

    let research_nodes: Vec<Node> = join_all(research_futures).await;
    for node in &research_nodes {
        let _ = tx.send(node_event(node, &handle.store)).await;
    }

    let _ = tx
        .send(DeliberationEvent::Status {
            message: "Synthesizing anonymized responses...".to_string(),
        })
        .await;

    let contents: Vec<String> = research_nodes.iter().map(|n| n.content.clone()).collect();
    let anonymized = anonymize(&contents, "Agent");
    let synthesis_prompt = format!(
        "The user asked: '{user_prompt}'.\n\nHere are the responses from the ensemble, anonymized:\n{anonymized}\nSynthesize a final answer, citing contributors only by their pseudonym (e.g. \"Agent 1\")."
    );

    let Some(synthesis_node) = try_call_and_create_node(
        &handle,
        &tx,
        conversation_id,
        root.id,
        NodeType::Synthesis,
        chairman_model,
        synthesis_prompt,
        root.id,
        MAX_DEPTH,
    )
    .await
    else {
        return;
    };
    let _ = tx.send(node_event(&synthesis_node, &handle.store)).await;

    let _ = tx.send(DeliberationEvent::Done).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CatalogCache, GatewayResult, LlmGateway};
    use crate::model::{Attachment, Method};
    use crate::store::ArtifactStore;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct StubGateway;

    #[async_trait]
    impl LlmGateway for StubGateway {
        async fn complete(
            &self,
            model: &str,
            _prompt: &str,
            _attachments: &[Attachment],
        ) -> GatewayResult<(String, crate::gateway::CostInfo)> {
            Ok((
                format!("answer from {model}"),
                crate::gateway::CostInfo {
                    actual_cost: 0.01,
                    input_tokens: 10,
                    output_tokens: 5,
                },
            ))
        }
    }

    struct SynthesisFailingGateway;

    #[async_trait]
    impl LlmGateway for SynthesisFailingGateway {
        async fn complete(
            &self,
            model: &str,
            _prompt: &str,
            _attachments: &[Attachment],
        ) -> GatewayResult<(String, crate::gateway::CostInfo)> {
            if model == "chairman-model" {
                Err(crate::gateway::GatewayError::Decode("boom".to_string()))
            } else {
                Ok((format!("answer from {model}"), crate::gateway::CostInfo::default()))
            }
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<DeliberationEvent>) -> Vec<DeliberationEvent> {
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn single_model_produces_one_research_and_one_synthesis() {
        let store = ArtifactStore::new();
        let conv = store.create_conversation("u1".into(), "q".into(), Method::Ensemble);
        let root = store
            .create_node(conv.id, None, NodeType::Root, "Capital of France?".into(), Some("user".into()), None, None, 0.0, None)
            .unwrap();

        let handle = EngineHandle {
            store: store.clone(),
            gateway: Arc::new(StubGateway),
            catalog: CatalogCache::new(),
            user_id: "u1".to_string(),
        };

        let (tx, mut rx) = mpsc::channel(32);
        run(handle, conv.id, root.clone(), vec!["m1".to_string()], "m1".to_string(), None, tx).await;

        let events = collect(&mut rx).await;
        let node_events: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DeliberationEvent::Node { node } => Some(node),
                _ => None,
            })
            .collect();
        assert_eq!(node_events.len(), 2);
        assert_eq!(node_events[0].node_type, NodeType::Research);
        assert_eq!(node_events[1].node_type, NodeType::Synthesis);
        assert!(matches!(events.last(), Some(DeliberationEvent::Done)));
    }

    #[tokio::test]
    async fn all_research_nodes_are_children_of_root() {
        let store = ArtifactStore::new();
        let conv = store.create_conversation("u1".into(), "q".into(), Method::Ensemble);
        let root = store
            .create_node(conv.id, None, NodeType::Root, "q".into(), Some("user".into()), None, None, 0.0, None)
            .unwrap();
        let handle = EngineHandle {
            store: store.clone(),
            gateway: Arc::new(StubGateway),
            catalog: CatalogCache::new(),
            user_id: "u1".to_string(),
        };
        let (tx, mut rx) = mpsc::channel(32);
        run(
            handle,
            conv.id,
            root.clone(),
            vec!["m1".to_string(), "m2".to_string()],
            "m1".to_string(),
            None,
            tx,
        )
        .await;
        let _ = collect(&mut rx).await;

        let nodes = store.list_nodes(conv.id);
        for n in nodes.iter().filter(|n| n.node_type == NodeType::Research) {
            assert_eq!(n.parent_id, Some(root.id));
        }
    }

    #[tokio::test]
    async fn synthesis_failure_ends_the_run_with_a_terminal_error_not_an_error_node() {
        let store = ArtifactStore::new();
        let conv = store.create_conversation("u1".into(), "q".into(), Method::Ensemble);
        let root = store
            .create_node(conv.id, None, NodeType::Root, "q".into(), Some("user".into()), None, None, 0.0, None)
            .unwrap();
        let handle = EngineHandle {
            store: store.clone(),
            gateway: Arc::new(SynthesisFailingGateway),
            catalog: CatalogCache::new(),
            user_id: "u1".to_string(),
        };
        let (tx, mut rx) = mpsc::channel(32);
        run(handle, conv.id, root, vec!["m1".to_string()], "chairman-model".to_string(), None, tx).await;
        let events = collect(&mut rx).await;

        assert!(matches!(events.last(), Some(DeliberationEvent::Error { message }) if message == "boom"));
        assert!(store.list_nodes(conv.id).iter().all(|n| n.node_type != NodeType::Synthesis));
    }
}

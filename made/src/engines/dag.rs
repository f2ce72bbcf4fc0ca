//! DAG Engine (§4.4.2): coordinator → parallel researchers → parallel
//! critics → synthesis, four serial phases with fan-out in the middle two.

use futures::future::join_all;
use tokio::sync::mpsc::Sender;

use super::{anonymize, call_and_create_node, node_event, try_call_and_create_node, EngineHandle};
use crate::events::DeliberationEvent;
use crate::model::{ConversationId, Node, NodeType};

const MAX_DEPTH: usize = 3;

pub async fn run(
    handle: EngineHandle,
    conversation_id: ConversationId,
    root: Node,
    council_members: Vec<String>,
    chairman_model: String,
    tx: Sender<DeliberationEvent>,
) {
    let _ = tx
        .send(DeliberationEvent::Status {
            message: "Coordinator is creating a plan...".to_string(),
        })
        .await;

    let plan_prompt = format!(
        "You are the Coordinator. The user has asked: '{}'. Produce a research plan.",
        root.content
    );
    let Some(plan) = try_call_and_create_node(
        &handle,
        &tx,
        conversation_id,
        root.id,
        NodeType::Plan,
        chairman_model.clone(),
        plan_prompt,
        root.id,
        MAX_DEPTH,
    )
    .await
    else {
        return;
    };
    let _ = tx.send(node_event(&plan, &handle.store)).await;

    let _ = tx
        .send(DeliberationEvent::Status {
            message: "Council members are researching...".to_string(),
        })
        .await;

    let plan_content = plan.content.clone();
    let research_futures = council_members.iter().cloned().map(|model| {
        let handle = handle.clone();
        let prompt = format!("Plan:\n{plan_content}\n\nConduct research per your assigned role.");
        let plan_id = plan.id;
        async move {
            call_and_create_node(
                &handle,
                conversation_id,
                plan_id,
                NodeType::Research,
                model,
                prompt,
                plan_id,
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
            message: "Critics are reviewing findings...".to_string(),
        })
        .await;

    let research_contents: Vec<String> = research_nodes.iter().map(|n| n.content.clone()).collect();
    let findings_bundle = anonymize(&research_contents, "Findings from Agent");
    let critique_futures = council_members.into_iter().map(|model| {
        let handle = handle.clone();
        let prompt = format!("Findings:\n{findings_bundle}\nCritique these findings against the plan.");
        let plan_id = plan.id;
        async move {
            call_and_create_node(
                &handle,
                conversation_id,
                plan_id,
                NodeType::Critique,
                model,
                prompt,
                plan_id,
                MAX_DEPTH,
            )
            .await
        }
    });
    let critique_nodes: Vec<Node> = join_all(critique_futures).await;
    for node in &critique_nodes {
        let _ = tx.send(node_event(node, &handle.store)).await;
    }

    let _ = tx
        .send(DeliberationEvent::Status {
            message: "Chairman is synthesizing the final answer...".to_string(),
        })
        .await;

    let critique_contents: Vec<String> = critique_nodes.iter().map(|n| n.content.clone()).collect();
    let research_bundle = anonymize(&research_contents, "Agent");
    let critique_bundle = anonymize(&critique_contents, "Critic");
    let synthesis_prompt = format!(
        "Plan:\n{plan_content}\n\nResearch:\n{research_bundle}\nCritiques:\n{critique_bundle}\nSynthesize the final answer, attributing contributors only by pseudonym."
    );
    let Some(synthesis) = try_call_and_create_node(
        &handle,
        &tx,
        conversation_id,
        plan.id,
        NodeType::Synthesis,
        chairman_model,
        synthesis_prompt,
        plan.id,
        MAX_DEPTH,
    )
    .await
    else {
        return;
    };
    let _ = tx.send(node_event(&synthesis, &handle.store)).await;

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
            Ok((format!("out from {model}"), crate::gateway::CostInfo::default()))
        }
    }

    struct FailingGateway;

    #[async_trait]
    impl LlmGateway for FailingGateway {
        async fn complete(
            &self,
            _model: &str,
            _prompt: &str,
            _attachments: &[Attachment],
        ) -> GatewayResult<(String, crate::gateway::CostInfo)> {
            Err(crate::gateway::GatewayError::Decode("boom".to_string()))
        }
    }

    fn handle(store: &ArtifactStore) -> EngineHandle {
        EngineHandle {
            store: store.clone(),
            gateway: Arc::new(StubGateway),
            catalog: CatalogCache::new(),
            user_id: "u1".to_string(),
        }
    }

    #[tokio::test]
    async fn empty_council_still_produces_plan_and_synthesis() {
        let store = ArtifactStore::new();
        let conv = store.create_conversation("u1".into(), "q".into(), Method::Dag);
        let root = store
            .create_node(conv.id, None, NodeType::Root, "is the earth flat?".into(), Some("user".into()), None, None, 0.0, None)
            .unwrap();
        let (tx, mut rx) = mpsc::channel(32);
        run(handle(&store), conv.id, root, vec![], "chairman".to_string(), tx).await;
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        let node_types: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DeliberationEvent::Node { node } => Some(node.node_type),
                _ => None,
            })
            .collect();
        assert_eq!(node_types, vec![NodeType::Plan, NodeType::Synthesis]);
    }

    #[tokio::test]
    async fn research_parents_are_the_plan_node() {
        let store = ArtifactStore::new();
        let conv = store.create_conversation("u1".into(), "q".into(), Method::Dag);
        let root = store
            .create_node(conv.id, None, NodeType::Root, "q".into(), Some("user".into()), None, None, 0.0, None)
            .unwrap();
        let (tx, mut rx) = mpsc::channel(32);
        run(handle(&store), conv.id, root, vec!["m1".to_string()], "chairman".to_string(), tx).await;
        while rx.recv().await.is_some() {}

        let nodes = store.list_nodes(conv.id);
        let plan = nodes.iter().find(|n| n.node_type == NodeType::Plan).unwrap();
        for n in nodes.iter().filter(|n| n.node_type == NodeType::Research || n.node_type == NodeType::Critique) {
            assert_eq!(n.parent_id, Some(plan.id));
        }
        let synthesis = nodes.iter().find(|n| n.node_type == NodeType::Synthesis).unwrap();
        assert_eq!(synthesis.parent_id, Some(plan.id));
    }

    #[tokio::test]
    async fn plan_failure_ends_the_run_with_a_terminal_error_and_no_nodes() {
        let store = ArtifactStore::new();
        let conv = store.create_conversation("u1".into(), "q".into(), Method::Dag);
        let root = store
            .create_node(conv.id, None, NodeType::Root, "q".into(), Some("user".into()), None, None, 0.0, None)
            .unwrap();
        let h = EngineHandle {
            store: store.clone(),
            gateway: Arc::new(FailingGateway),
            catalog: CatalogCache::new(),
            user_id: "u1".to_string(),
        };
        let (tx, mut rx) = mpsc::channel(32);
        run(h, conv.id, root, vec!["m1".to_string()], "chairman".to_string(), tx).await;
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }

        assert!(matches!(events.last(), Some(DeliberationEvent::Error { message }) if message == "boom"));
        assert!(!events.iter().any(|e| matches!(e, DeliberationEvent::Node { .. })));
        assert!(store.list_nodes(conv.id).iter().all(|n| n.node_type != NodeType::Plan));
    }
}

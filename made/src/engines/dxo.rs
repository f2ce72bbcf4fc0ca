//! DxO Engine (§4.4.3): debate–refine–gate. An iterative adversarial loop
//! between a Proposer, a pool of Experts, and an optional Critic
//! gatekeeper whose parsed confidence score drives convergence.

use futures::future::join_all;
use score_regex::score_regex;
use tokio::sync::mpsc::Sender;

use super::{call_and_create_node_as, node_event, try_call_and_create_node_as, EngineHandle};
use crate::events::DeliberationEvent;
use crate::model::{ConversationId, Node, NodeType};

const MAX_DEPTH: usize = 3;
const CONVERGENCE_THRESHOLD: u32 = 85;

/// A debate participant, supplied by the caller.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Role {
    pub name: String,
    pub model: String,
    pub instructions: Option<String>,
}

impl Role {
    fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.model)
    }

    fn is_qa(&self) -> bool {
        self.name.contains("QA") || self.name.contains("Quality")
    }
}

/// Proposer = first role whose name contains any of Lead/Architect/Researcher,
/// else role[0].
fn identify_proposer(roles: &[Role]) -> Role {
    roles
        .iter()
        .find(|r| r.name.contains("Lead") || r.name.contains("Architect") || r.name.contains("Researcher"))
        .cloned()
        .unwrap_or_else(|| roles[0].clone())
}

/// Critic (gatekeeper) = first role whose name contains "Critical Reviewer".
fn identify_critic(roles: &[Role]) -> Option<Role> {
    roles.iter().find(|r| r.name.contains("Critical Reviewer")).cloned()
}

fn identify_experts(roles: &[Role], proposer: &Role, critic: &Option<Role>) -> Vec<Role> {
    roles
        .iter()
        .filter(|r| r.name != proposer.name && critic.as_ref().map(|c| c.name != r.name).unwrap_or(true))
        .cloned()
        .collect()
}

/// Parse `(?:Confidence )?Score:\s*(\d+)`, case-insensitive, defaulting to 0.
fn parse_confidence_score(text: &str) -> u32 {
    score_regex()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

mod score_regex {
    use regex::Regex;
    use std::sync::OnceLock;

    pub fn score_regex() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?i)(?:Confidence )?Score:\s*(\d+)").unwrap())
    }
}

pub async fn run(
    handle: EngineHandle,
    conversation_id: ConversationId,
    root: Node,
    roles: Vec<Role>,
    max_iterations: u32,
    tx: Sender<DeliberationEvent>,
) {
    if roles.is_empty() {
        let _ = tx
            .send(DeliberationEvent::Error {
                message: "No roles defined!".to_string(),
            })
            .await;
        return;
    }

    let proposer = identify_proposer(&roles);
    let critic = identify_critic(&roles);
    let experts = identify_experts(&roles, &proposer, &critic);

    let _ = tx
        .send(DeliberationEvent::Status {
            message: format!("Phase A: {} is drafting the proposal...", proposer.name),
        })
        .await;

    let proposal_prompt = format!(
        "You are the {}.\nInstructions: {}\n\nUser Request: \"{}\"\n\nPlease provide a solid initial design/response. Focus on structure, patterns, and scalability.",
        proposer.name,
        proposer.instructions.clone().unwrap_or_default(),
        root.content
    );
    let Some(mut draft_node) = try_call_and_create_node_as(
        &handle,
        &tx,
        conversation_id,
        root.id,
        NodeType::Proposal,
        proposer.model.clone(),
        proposer.display_name(),
        proposal_prompt,
        root.id,
        MAX_DEPTH,
    )
    .await
    else {
        return;
    };
    let _ = tx.send(node_event(&draft_node, &handle.store)).await;

    let mut iteration = 0u32;
    let mut confidence_score = 0u32;

    while iteration < max_iterations && confidence_score < CONVERGENCE_THRESHOLD {
        iteration += 1;

        let _ = tx
            .send(DeliberationEvent::Status {
                message: format!("Phase B: Council Review (Loop {iteration})..."),
            })
            .await;

        let draft_content = draft_node.content.clone();
        let draft_id = draft_node.id;
        let review_futures = experts.iter().cloned().map(|role| {
            let handle = handle.clone();
            let draft_content = draft_content.clone();
            async move {
                let node_type = if role.is_qa() { NodeType::TestCases } else { NodeType::Critique };
                let prompt = format!(
                    "You are the {}.\nInstructions: {}\n\nReview the following draft:\n{}\n\nProvide your analysis, pointed critiques, or suggestions based on your expertise.",
                    role.name,
                    role.instructions.clone().unwrap_or_default(),
                    draft_content
                );
                let node = call_and_create_node_as(
                    &handle,
                    conversation_id,
                    draft_id,
                    node_type,
                    role.model.clone(),
                    role.display_name(),
                    prompt,
                    draft_id,
                    MAX_DEPTH,
                )
                .await;
                (role, node)
            }
        });
        let review_results: Vec<(Role, Node)> = join_all(review_futures).await;
        let mut feedback_sections = Vec::new();
        for (role, node) in &review_results {
            feedback_sections.push(format!("--- Feedback from {} ---\n{}\n", role.name, node.content));
            let _ = tx.send(node_event(node, &handle.store)).await;
        }

        let _ = tx
            .send(DeliberationEvent::Status {
                message: format!("Phase C: {} is refining the design...", proposer.name),
            })
            .await;

        let all_feedback = feedback_sections.join("\n");
        let refine_prompt = format!(
            "You are the {}.\nIteration: {iteration}\n\nFeedback from the Council:\n{all_feedback}\n\nFix the issues identified. Provide a new version (Draft_v{}).",
            proposer.name,
            iteration + 1
        );
        let Some(refined_node) = try_call_and_create_node_as(
            &handle,
            &tx,
            conversation_id,
            draft_id,
            NodeType::Refinement,
            proposer.model.clone(),
            proposer.display_name(),
            refine_prompt,
            draft_id,
            MAX_DEPTH,
        )
        .await
        else {
            return;
        };
        draft_node = refined_node;
        let _ = tx.send(node_event(&draft_node, &handle.store)).await;

        if let Some(critic) = &critic {
            let _ = tx
                .send(DeliberationEvent::Status {
                    message: "Phase D: Critical Review (Gatekeeper)...".to_string(),
                })
                .await;
            let draft_content = draft_node.content.clone();
            let prompt = format!(
                "You are the {}.\nInstructions: {}\n\nReview the following Refined Draft:\n{}\n\nOutput a Critique Report. IMPORTANT: you must include a \"Confidence Score\" (0-100) indicating your confidence in the design's safety and completeness. Format your response so that \"Score: X\" can be parsed.",
                critic.name,
                critic.instructions.clone().unwrap_or_default(),
                draft_content
            );
            let Some(critic_node) = try_call_and_create_node_as(
                &handle,
                &tx,
                conversation_id,
                draft_node.id,
                NodeType::Critique,
                critic.model.clone(),
                critic.display_name(),
                prompt,
                draft_node.id,
                MAX_DEPTH,
            )
            .await
            else {
                return;
            };
            confidence_score = parse_confidence_score(&critic_node.content);
            let _ = tx.send(node_event(&critic_node, &handle.store)).await;
        } else {
            confidence_score = 50 + 15 * iteration;
        }
    }

    let _ = tx
        .send(DeliberationEvent::Status {
            message: "Finalizing result...".to_string(),
        })
        .await;

    let status = if confidence_score >= CONVERGENCE_THRESHOLD {
        "APPROVED"
    } else {
        "Review Limit Reached"
    };
    let verdict_content = format!(
        "Final Output\nStatus: {status} (Confidence: {confidence_score}%)\nIterations: {iteration} Loops\n\nEXECUTIVE SUMMARY:\n(See final draft)"
    );
    // The verdict is a system summary, not an LLM call, so it is persisted
    // directly rather than routed through `call_and_create_node`.
    let verdict = handle
        .store
        .create_node(
            conversation_id,
            Some(draft_node.id),
            NodeType::Verdict,
            verdict_content,
            Some("System".to_string()),
            None,
            None,
            0.0,
            None,
        )
        .expect("draft_node.id was just created in this conversation");
    let _ = tx.send(node_event(&verdict, &handle.store)).await;
    let _ = tx.send(DeliberationEvent::Done).await;
}

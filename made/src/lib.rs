//! Multi-agent deliberation engine: council-style DAG, ensemble, and DxO
//! orchestration over external LLM endpoints.
//!
//! A conversation is a tree of artifact nodes (plans, research, critiques,
//! proposals, refinements, syntheses, verdicts) produced by fanning a
//! prompt out across one or more models and folding the results back
//! together. Three deliberation engines implement that fan-out/fan-in
//! shape differently: [`engines::ensemble`] (single round, anonymized
//! synthesis), [`engines::dag`] (coordinator/researchers/critics/chairman),
//! and [`engines::dxo`] (iterative proposer/expert/gatekeeper debate).

pub mod config;
pub mod context;
pub mod engines;
pub mod events;
pub mod gateway;
pub mod http;
pub mod model;
pub mod store;

pub use config::Config;
pub use engines::EngineHandle;
pub use events::DeliberationEvent;
pub use gateway::{HttpGateway, LlmGateway};
pub use model::{Attachment, Conversation, FileType, Method, Node, NodeType, NodeView};
pub use store::ArtifactStore;

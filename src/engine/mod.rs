//! Engine components: the pipeline from campaign launch to dispatched message.
//!
//! Each component is a small struct holding only what it needs; all persistence
//! goes through the `Database` trait so every component is testable against the
//! in-memory backend.

pub mod dispatch;
pub mod generator;
pub mod scheduler;
pub mod segments;
pub mod stop_rules;

pub use dispatch::DispatchService;
pub use generator::{GenerationSummary, MessageGenerator};
pub use scheduler::CampaignScheduler;
pub use segments::{CompiledSegment, SegmentResolver};
pub use stop_rules::{LeadHistory, StopDecision, StopReason, StopRuleEvaluator};

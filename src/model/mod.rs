//! Domain model: plain data structs, no persistence behavior.

pub mod audit;
pub mod campaign;
pub mod lead;
pub mod message;
pub mod segment;
pub mod template;

pub use audit::{AuditAction, AuditEntry, AuditSubject};
pub use campaign::{Campaign, CampaignStatus, CampaignStep, CampaignType, StopRuleSettings};
pub use lead::{Channel, Lead, LeadStatus};
pub use message::{MessageStatus, OutboundMessage};
pub use segment::{GroupOp, PredicateOp, Segment, SegmentNode};
pub use template::{RenderedContent, Template};

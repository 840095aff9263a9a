//! Stop-rule evaluation: decides per lead whether a message may go out.
//!
//! The evaluator is pure: it reads a prefetched [`LeadHistory`] snapshot and
//! never touches the store itself. The generator builds one snapshot per batch
//! with three batched lookups, so evaluation stays O(1) per lead.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Channel, Lead, StopRuleSettings};

/// Why a lead was excluded from a generation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Active unsubscribe on the campaign channel.
    OptOut,
    /// Lead is in a terminal deal status.
    WonLost,
    /// Lead replied on the channel since the campaign began.
    Replied,
    /// Outbound count passed threshold plus re-engagement allowance.
    FatigueSunset,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptOut => "opt_out",
            Self::WonLost => "won_lost",
            Self::Replied => "replied",
            Self::FatigueSunset => "fatigue_sunset",
        }
    }
}

/// Outcome of evaluating the stop rules for one lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    Send,
    Stop(StopReason),
}

impl StopDecision {
    pub fn is_send(&self) -> bool {
        matches!(self, Self::Send)
    }
}

/// Per-batch history snapshot, keyed by lead id.
///
/// Built from batched store lookups before evaluating a page of leads, so the
/// evaluator never issues per-lead queries.
#[derive(Debug, Default, Clone)]
pub struct LeadHistory {
    /// Leads with an active unsubscribe on the campaign channel.
    pub unsubscribed: HashSet<Uuid>,
    /// Leads with an inbound message on the channel since campaign launch.
    pub replied: HashSet<Uuid>,
    /// Prior outbound sends on the channel, per lead. Absent means zero.
    pub outbound_counts: HashMap<Uuid, u32>,
}

impl LeadHistory {
    fn outbound_count(&self, lead_id: Uuid) -> u32 {
        self.outbound_counts.get(&lead_id).copied().unwrap_or(0)
    }
}

/// Evaluates the enabled stop rules in a fixed order:
/// opt-out, won/lost, replied, fatigue.
pub struct StopRuleEvaluator;

impl StopRuleEvaluator {
    /// `history` must already be scoped to `channel`; the channel is part of
    /// the signature so callers cannot pair a snapshot with the wrong wave.
    pub fn evaluate(
        settings: &StopRuleSettings,
        lead: &Lead,
        _channel: Channel,
        history: &LeadHistory,
    ) -> StopDecision {
        if settings.opt_out && history.unsubscribed.contains(&lead.id) {
            return StopDecision::Stop(StopReason::OptOut);
        }

        if settings.won_lost && lead.status.is_terminal() {
            return StopDecision::Stop(StopReason::WonLost);
        }

        if settings.replied && history.replied.contains(&lead.id) {
            return StopDecision::Stop(StopReason::Replied);
        }

        if settings.fatigue {
            let n = history.outbound_count(lead.id);
            // Past the threshold the lead gets `reengagement_allowance` more
            // sends, then the sunset stop is terminal.
            if n >= settings.fatigue_threshold + settings.reengagement_allowance {
                return StopDecision::Stop(StopReason::FatigueSunset);
            }
        }

        StopDecision::Send
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LeadStatus;

    fn lead() -> Lead {
        Lead::new(Uuid::new_v4()).with_email("a@example.com")
    }

    fn all_rules() -> StopRuleSettings {
        StopRuleSettings {
            opt_out: true,
            won_lost: true,
            replied: true,
            fatigue: true,
            fatigue_threshold: 3,
            reengagement_allowance: 1,
            fatigue_window_days: None,
        }
    }

    #[test]
    fn clean_lead_sends() {
        let decision =
            StopRuleEvaluator::evaluate(&all_rules(), &lead(), Channel::Email, &LeadHistory::default());
        assert_eq!(decision, StopDecision::Send);
    }

    #[test]
    fn opt_out_stops() {
        let lead = lead();
        let history = LeadHistory {
            unsubscribed: HashSet::from([lead.id]),
            ..Default::default()
        };
        let decision = StopRuleEvaluator::evaluate(&all_rules(), &lead, Channel::Email, &history);
        assert_eq!(decision, StopDecision::Stop(StopReason::OptOut));
    }

    #[test]
    fn opt_out_disabled_is_ignored() {
        let lead = lead();
        let history = LeadHistory {
            unsubscribed: HashSet::from([lead.id]),
            ..Default::default()
        };
        let settings = StopRuleSettings {
            opt_out: false,
            ..all_rules()
        };
        let decision = StopRuleEvaluator::evaluate(&settings, &lead, Channel::Email, &history);
        assert_eq!(decision, StopDecision::Send);
    }

    #[test]
    fn won_and_lost_stop() {
        for status in [LeadStatus::Won, LeadStatus::Lost] {
            let lead = lead().with_status(status);
            let decision = StopRuleEvaluator::evaluate(
                &all_rules(),
                &lead,
                Channel::Email,
                &LeadHistory::default(),
            );
            assert_eq!(decision, StopDecision::Stop(StopReason::WonLost));
        }
    }

    #[test]
    fn replied_stops() {
        let lead = lead();
        let history = LeadHistory {
            replied: HashSet::from([lead.id]),
            ..Default::default()
        };
        let decision = StopRuleEvaluator::evaluate(&all_rules(), &lead, Channel::Email, &history);
        assert_eq!(decision, StopDecision::Stop(StopReason::Replied));
    }

    #[test]
    fn fatigue_allows_reengagement_window() {
        // threshold 3, allowance 1: counts 0..=3 send, 4 stops.
        let lead = lead();
        for (count, expected) in [
            (0, StopDecision::Send),
            (2, StopDecision::Send),
            (3, StopDecision::Send),
            (4, StopDecision::Stop(StopReason::FatigueSunset)),
            (9, StopDecision::Stop(StopReason::FatigueSunset)),
        ] {
            let history = LeadHistory {
                outbound_counts: HashMap::from([(lead.id, count)]),
                ..Default::default()
            };
            let decision =
                StopRuleEvaluator::evaluate(&all_rules(), &lead, Channel::Email, &history);
            assert_eq!(decision, expected, "count {count}");
        }
    }

    #[test]
    fn fatigue_zero_allowance_stops_at_threshold() {
        let lead = lead();
        let settings = StopRuleSettings {
            reengagement_allowance: 0,
            ..all_rules()
        };
        let history = LeadHistory {
            outbound_counts: HashMap::from([(lead.id, 3)]),
            ..Default::default()
        };
        let decision = StopRuleEvaluator::evaluate(&settings, &lead, Channel::Email, &history);
        assert_eq!(decision, StopDecision::Stop(StopReason::FatigueSunset));
    }

    #[test]
    fn rule_order_opt_out_first() {
        // A lead matching every rule reports the first one.
        let lead = lead().with_status(LeadStatus::Won);
        let history = LeadHistory {
            unsubscribed: HashSet::from([lead.id]),
            replied: HashSet::from([lead.id]),
            outbound_counts: HashMap::from([(lead.id, 10)]),
        };
        let decision = StopRuleEvaluator::evaluate(&all_rules(), &lead, Channel::Email, &history);
        assert_eq!(decision, StopDecision::Stop(StopReason::OptOut));
    }
}

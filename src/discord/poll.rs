use serenity::all::{MessageReaction, ReactionType};

pub const APPROVE_EMOJI: &str = "✅";
pub const REJECT_EMOJI: &str = "❌";

/// Reaction count for one poll option. `seeded` is whether the bot's own reaction is still present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptionCount {
    pub raw: u64,
    pub seeded: bool,
}

impl OptionCount {
    pub fn seeded(raw: u64) -> Self {
        OptionCount { raw, seeded: raw > 0 }
    }

    /// Votes cast by members, excluding the bot's seed.
    pub fn net(&self) -> u64 {
        self.raw.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoteTally {
    pub approve: OptionCount,
    pub reject: OptionCount,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollOutcome {
    Approved { approval: f64, approve: u64, reject: u64 },
    Rejected { approval: f64, approve: u64, reject: u64 },
    NoVotes,
    /// A seed reaction was removed, so the raw counts can no longer be trusted.
    Manipulated,
}

impl VoteTally {
    pub fn new(approve_raw: u64, reject_raw: u64) -> Self {
        VoteTally { approve: OptionCount::seeded(approve_raw), reject: OptionCount::seeded(reject_raw) }
    }

    pub fn from_reactions(reactions: &[MessageReaction]) -> Self {
        let mut tally = VoteTally::default();
        for reaction in reactions {
            let ReactionType::Unicode(emoji) = &reaction.reaction_type else {
                continue;
            };
            let count = OptionCount { raw: reaction.count, seeded: reaction.me };
            match emoji.as_str() {
                APPROVE_EMOJI => tally.approve = count,
                REJECT_EMOJI => tally.reject = count,
                _ => {}
            }
        }
        tally
    }

    pub fn evaluate(&self, threshold: f64) -> PollOutcome {
        if !self.approve.seeded || !self.reject.seeded {
            return PollOutcome::Manipulated;
        }

        let approve = self.approve.net();
        let reject = self.reject.net();
        let total = approve + reject;
        if total == 0 {
            return PollOutcome::NoVotes;
        }

        let approval = approve as f64 / total as f64;
        if approval >= threshold {
            PollOutcome::Approved { approval, approve, reject }
        } else {
            PollOutcome::Rejected { approval, approve, reject }
        }
    }
}

pub fn format_percentage(ratio: f64) -> String {
    format!("{:.0}%", ratio * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_reactions_are_not_counted() {
        let outcome = VoteTally::new(3, 1).evaluate(0.6);
        assert_eq!(outcome, PollOutcome::Approved { approval: 1.0, approve: 2, reject: 0 });
    }

    #[test]
    fn threshold_is_inclusive() {
        // 3 approve, 2 reject after removing seeds
        assert!(matches!(VoteTally::new(4, 3).evaluate(0.6), PollOutcome::Approved { .. }));
        assert!(matches!(VoteTally::new(3, 3).evaluate(0.6), PollOutcome::Rejected { approve: 2, reject: 2, .. }));
    }

    #[test]
    fn only_seeds_means_no_votes() {
        assert_eq!(VoteTally::new(1, 1).evaluate(0.6), PollOutcome::NoVotes);
    }

    #[test]
    fn missing_seed_is_manipulation() {
        assert_eq!(VoteTally::new(0, 4).evaluate(0.6), PollOutcome::Manipulated);
        assert_eq!(VoteTally::new(5, 0).evaluate(0.6), PollOutcome::Manipulated);

        let unseeded = VoteTally { approve: OptionCount { raw: 3, seeded: false }, reject: OptionCount::seeded(1) };
        assert_eq!(unseeded.evaluate(0.6), PollOutcome::Manipulated);
    }

    #[test]
    fn percentages_are_rounded() {
        assert_eq!(format_percentage(2.0 / 3.0), "67%");
        assert_eq!(format_percentage(1.0), "100%");
    }
}

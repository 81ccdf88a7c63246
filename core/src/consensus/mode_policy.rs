//! Execution mode policy.
//!
//! The sender requests a mode; the drawn committee decides what is
//! actually possible. The one interesting rule: a NORMAL run with a
//! committee of one has nobody to commit or reveal, so it degrades to
//! LEADER_SELF_VALIDATOR — the leader executes and then judges its own
//! output under the equivalence principle.

use crate::transaction::types::ExecutionMode;

/// Resolves the mode a round actually runs under, given the committee
/// that was drawn for it.
pub fn effective_mode(requested: ExecutionMode, committee_size: usize) -> ExecutionMode {
    match requested {
        ExecutionMode::Normal if committee_size <= 1 => ExecutionMode::LeaderSelfValidator,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_with_committee_of_one_degrades() {
        assert_eq!(
            effective_mode(ExecutionMode::Normal, 1),
            ExecutionMode::LeaderSelfValidator
        );
    }

    #[test]
    fn normal_with_real_committee_stays_normal() {
        assert_eq!(effective_mode(ExecutionMode::Normal, 2), ExecutionMode::Normal);
        assert_eq!(effective_mode(ExecutionMode::Normal, 5), ExecutionMode::Normal);
    }

    #[test]
    fn explicit_modes_are_untouched() {
        assert_eq!(
            effective_mode(ExecutionMode::LeaderOnly, 1),
            ExecutionMode::LeaderOnly
        );
        assert_eq!(
            effective_mode(ExecutionMode::LeaderSelfValidator, 5),
            ExecutionMode::LeaderSelfValidator
        );
    }
}

//! Property-based tests for vote aggregation
//!
//! - Order independence: any permutation of the vote set yields the same tally
//! - Idempotence: re-aggregating with duplicated votes changes nothing
//! - One voter, one count: no option ever counts more voters than exist

use super::tally::aggregate_votes;
use crate::transport::traits::{MessageKey, PollCreation, PollVoteRecord};
use crate::transport::vote_crypto::option_hash;
use proptest::prelude::*;

const OPTIONS: [&str; 4] = ["A", "B", "C", "D"];

fn poll() -> PollCreation {
    PollCreation {
        name: "Q".to_string(),
        options: OPTIONS.iter().map(|s| s.to_string()).collect(),
        selectable_count: 0,
    }
}

fn arb_vote() -> impl Strategy<Value = PollVoteRecord> {
    (
        0u8..6,
        0u32..50,
        0u64..1_000,
        prop::collection::vec(0usize..5, 0..4),
    )
        .prop_map(|(voter, id, ts, picks)| PollVoteRecord {
            vote_key: MessageKey::new("group@g", format!("V{}", id)),
            voter: format!("voter{}@net", voter),
            selected_options: picks
                .into_iter()
                // index 4 is a hash no option matches
                .map(|i| option_hash(OPTIONS.get(i).copied().unwrap_or("unknown")))
                .collect(),
            sender_timestamp_ms: ts,
        })
}

proptest! {
    /// Property: aggregation is independent of vote arrival order
    #[test]
    fn tally_is_order_independent(
        votes in prop::collection::vec(arb_vote(), 0..30),
        seed in any::<u64>(),
    ) {
        let mut shuffled = votes.clone();
        // deterministic Fisher-Yates driven by the seed
        let mut state = seed;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            shuffled.swap(i, j);
        }

        prop_assert_eq!(aggregate_votes(&poll(), &votes), aggregate_votes(&poll(), &shuffled));
    }

    /// Property: replaying every vote a second time leaves the tally unchanged
    #[test]
    fn tally_is_idempotent(votes in prop::collection::vec(arb_vote(), 0..30)) {
        let mut doubled = votes.clone();
        doubled.extend(votes.iter().cloned());

        prop_assert_eq!(aggregate_votes(&poll(), &votes), aggregate_votes(&poll(), &doubled));
    }

    /// Property: each option counts at most the number of distinct voters
    #[test]
    fn tally_counts_each_voter_once(votes in prop::collection::vec(arb_vote(), 0..30)) {
        let voters: std::collections::BTreeSet<_> = votes.iter().map(|v| v.voter.clone()).collect();
        let tally = aggregate_votes(&poll(), &votes);

        for option in &tally.0 {
            prop_assert!(option.count as usize <= voters.len());
            prop_assert_eq!(option.count as usize, option.voters.len());
            let mut sorted = option.voters.clone();
            sorted.sort();
            prop_assert_eq!(&sorted, &option.voters);
        }
    }
}

//! Vote aggregation

use crate::transport::traits::{PollCreation, PollVoteRecord};
use crate::transport::vote_crypto::option_hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Result for one option
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionTally {
    pub name: String,
    pub count: u32,
    /// Sorted voter identities
    pub voters: Vec<String>,
}

/// Poll results in creation order (an ordered entry list, never a map)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tally(pub Vec<OptionTally>);

impl Tally {
    /// Vote count for an option label
    pub fn count(&self, name: &str) -> Option<u32> {
        self.0.iter().find(|o| o.name == name).map(|o| o.count)
    }

    pub fn total_voters(&self) -> usize {
        self.0
            .iter()
            .flat_map(|o| o.voters.iter())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Aggregate the complete vote set for a poll.
///
/// Each voter counts once: their vote with the greatest
/// (sender timestamp, vote key id) wins. Hashes that match no option are
/// ignored. The result does not depend on the order of `votes`.
pub fn aggregate_votes(creation: &PollCreation, votes: &[PollVoteRecord]) -> Tally {
    let mut latest: BTreeMap<&str, &PollVoteRecord> = BTreeMap::new();
    for vote in votes {
        let rank = |v: &PollVoteRecord| {
            (v.sender_timestamp_ms, v.vote_key.id.clone(), v.selected_options.clone())
        };
        let newer = match latest.get(vote.voter.as_str()) {
            Some(current) => rank(*current) < rank(vote),
            None => true,
        };
        if newer {
            latest.insert(vote.voter.as_str(), vote);
        }
    }

    let options = creation
        .options
        .iter()
        .map(|name| {
            let hash = option_hash(name);
            let voters: Vec<String> = latest
                .iter()
                .filter(|(_, vote)| vote.selected_options.contains(&hash))
                .map(|(voter, _)| voter.to_string())
                .collect();
            OptionTally {
                name: name.clone(),
                count: voters.len() as u32,
                voters,
            }
        })
        .collect();

    Tally(options)
}

/// Label substituted for a selected hash that matches no option
pub const UNKNOWN_OPTION: &str = "Unknown";

/// Option labels for a set of selected hashes, in selection order.
///
/// A hash that matches no option still yields one entry, [`UNKNOWN_OPTION`].
pub fn selected_labels(creation: &PollCreation, selected: &[[u8; 32]]) -> Vec<String> {
    let labels: Vec<([u8; 32], &String)> = creation
        .options
        .iter()
        .map(|name| (option_hash(name), name))
        .collect();
    selected
        .iter()
        .map(|hash| {
            labels
                .iter()
                .find(|(option, _)| option == hash)
                .map_or_else(|| UNKNOWN_OPTION.to_string(), |(_, name)| (*name).clone())
        })
        .collect()
}

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::SelectionError;
use crate::models::{OutputRef, UnspentOutput};

/// Only the largest outputs are considered by branch-and-bound.
pub const BNB_MAX_CANDIDATES: usize = 20;
/// Upper bound on visited search nodes before falling back to largest-first.
pub const BNB_MAX_ITERATIONS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    LargestFirst,
    SmallestFirst,
    AdaOnlyPriority,
    BranchAndBound,
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "largest_first" | "largest" => Ok(SelectionStrategy::LargestFirst),
            "smallest_first" | "smallest" => Ok(SelectionStrategy::SmallestFirst),
            "ada_only_priority" | "ada_only" => Ok(SelectionStrategy::AdaOnlyPriority),
            "branch_and_bound" | "bnb" => Ok(SelectionStrategy::BranchAndBound),
            other => Err(format!("unknown selection strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub selected: Vec<UnspentOutput>,
    pub total: u64,
    pub change: u64,
    pub strategy: SelectionStrategy,
    /// Branch-and-bound ran out of candidates or budget and used largest-first.
    pub fell_back: bool,
}

/// Picks outputs covering `target` lovelace.
///
/// Inputs are deduplicated by `(tx_hash, output_index)` and anything in
/// `excluded` is dropped before ordering. The slice is never mutated.
pub fn select(
    utxos: &[UnspentOutput],
    target: u64,
    excluded: &HashSet<OutputRef>,
    strategy: SelectionStrategy,
) -> Result<Selection, SelectionError> {
    let candidates = spendable_candidates(utxos, excluded);
    let available = candidates
        .iter()
        .fold(0u64, |acc, utxo| acc.saturating_add(utxo.amount));

    if available < target {
        return Err(SelectionError::Insufficient {
            needed: target,
            available,
        });
    }

    let (selected, fell_back) = match strategy {
        SelectionStrategy::LargestFirst => (accumulate(largest_first(candidates), target), false),
        SelectionStrategy::SmallestFirst => {
            let mut ordered = candidates;
            ordered.sort_by(|a, b| a.amount.cmp(&b.amount).then_with(|| a.output_ref().cmp(&b.output_ref())));
            (accumulate(ordered, target), false)
        }
        SelectionStrategy::AdaOnlyPriority => {
            let (with_assets, ada_only): (Vec<_>, Vec<_>) =
                candidates.into_iter().partition(|u| u.has_native_assets());
            let mut ordered = largest_first(ada_only);
            ordered.extend(largest_first(with_assets));
            (accumulate(ordered, target), false)
        }
        SelectionStrategy::BranchAndBound => match branch_and_bound(&candidates, target) {
            Some(selected) => (Some(selected), false),
            None => {
                tracing::debug!(
                    "Branch-and-bound found no combination for {} lovelace, using largest-first",
                    target
                );
                (accumulate(largest_first(candidates), target), true)
            }
        },
    };

    let selected = selected.ok_or(SelectionError::Insufficient {
        needed: target,
        available,
    })?;
    let total = selected
        .iter()
        .fold(0u64, |acc, utxo| acc.saturating_add(utxo.amount));

    tracing::debug!(
        "Selected {} outputs totaling {} for target {} ({:?})",
        selected.len(),
        total,
        target,
        strategy
    );

    Ok(Selection {
        change: total - target,
        selected,
        total,
        strategy,
        fell_back,
    })
}

fn spendable_candidates(utxos: &[UnspentOutput], excluded: &HashSet<OutputRef>) -> Vec<UnspentOutput> {
    let mut seen = HashSet::new();
    utxos
        .iter()
        .filter(|utxo| {
            let output_ref = utxo.output_ref();
            !excluded.contains(&output_ref) && seen.insert(output_ref)
        })
        .cloned()
        .collect()
}

fn largest_first(mut utxos: Vec<UnspentOutput>) -> Vec<UnspentOutput> {
    utxos.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.output_ref().cmp(&b.output_ref())));
    utxos
}

fn accumulate(ordered: Vec<UnspentOutput>, target: u64) -> Option<Vec<UnspentOutput>> {
    let mut selected = Vec::new();
    let mut total = 0u64;

    for utxo in ordered {
        if total >= target {
            break;
        }
        total = total.saturating_add(utxo.amount);
        selected.push(utxo);
    }

    (total >= target).then_some(selected)
}

struct BnbSearch<'a> {
    amounts: &'a [u64],
    suffix: Vec<u64>,
    target: u64,
    iterations: usize,
    current: Vec<usize>,
    best: Option<(u64, Vec<usize>)>,
}

impl BnbSearch<'_> {
    fn explore(&mut self, index: usize, sum: u64) {
        if self.iterations >= BNB_MAX_ITERATIONS {
            return;
        }
        self.iterations += 1;

        if sum >= self.target {
            let waste = sum - self.target;
            let better = match &self.best {
                None => true,
                Some((best_waste, best)) => {
                    waste < *best_waste || (waste == *best_waste && self.current.len() < best.len())
                }
            };
            if better {
                self.best = Some((waste, self.current.clone()));
            }
            return;
        }

        if index >= self.amounts.len() || sum.saturating_add(self.suffix[index]) < self.target {
            return;
        }
        if matches!(&self.best, Some((0, _))) {
            return;
        }

        self.current.push(index);
        self.explore(index + 1, sum.saturating_add(self.amounts[index]));
        self.current.pop();

        self.explore(index + 1, sum);
    }
}

fn branch_and_bound(candidates: &[UnspentOutput], target: u64) -> Option<Vec<UnspentOutput>> {
    if target == 0 {
        return Some(Vec::new());
    }

    let ordered: Vec<UnspentOutput> = largest_first(candidates.to_vec())
        .into_iter()
        .take(BNB_MAX_CANDIDATES)
        .collect();
    let amounts: Vec<u64> = ordered.iter().map(|u| u.amount).collect();

    let mut suffix = vec![0u64; amounts.len() + 1];
    for i in (0..amounts.len()).rev() {
        suffix[i] = suffix[i + 1].saturating_add(amounts[i]);
    }

    let mut search = BnbSearch {
        amounts: &amounts,
        suffix,
        target,
        iterations: 0,
        current: Vec::new(),
        best: None,
    };
    search.explore(0, 0);

    search
        .best
        .map(|(_, indices)| indices.into_iter().map(|i| ordered[i].clone()).collect())
}

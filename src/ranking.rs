use crate::calc::{CardStatus, ReportCard};
use crate::scoring::round_2dp;
use serde::Serialize;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub class_size: usize,
    pub class_average: f64,
    pub top_average: f64,
    pub bottom_average: f64,
}

/// Class statistics over one snapshot. Cards without an average yet count
/// toward the class size but stay out of the averages.
pub fn class_stats(cards: &[ReportCard]) -> ClassStats {
    let graded: Vec<f64> = cards
        .iter()
        .map(|c| c.overall_average)
        .filter(|avg| *avg > 0.0)
        .collect();

    if graded.is_empty() {
        return ClassStats {
            class_size: cards.len(),
            class_average: 0.0,
            top_average: 0.0,
            bottom_average: 0.0,
        };
    }

    let sum: f64 = graded.iter().sum();
    let top = graded.iter().copied().fold(f64::MIN, f64::max);
    let bottom = graded.iter().copied().fold(f64::MAX, f64::min);
    ClassStats {
        class_size: cards.len(),
        class_average: round_2dp(sum / graded.len() as f64),
        top_average: top,
        bottom_average: bottom,
    }
}

/// Competition ranks ("1224") for averages already sorted descending.
///
/// Tied averages share a rank; the next lower average jumps to its 1-based
/// position in the list.
pub fn competition_ranks(sorted_averages: &[f64]) -> Vec<usize> {
    let mut ranks = Vec::with_capacity(sorted_averages.len());
    let mut rank = 1_usize;
    let mut previous: Option<f64> = None;
    for (i, current) in sorted_averages.iter().copied().enumerate() {
        if let Some(prev) = previous {
            if current < prev {
                rank = i + 1;
            }
        }
        ranks.push(rank);
        previous = Some(current);
    }
    ranks
}

/// Rank every card of one class/period and stamp the class statistics on
/// each of them. The result is ordered by rank; ties keep their input order.
pub fn rank_class(mut cards: Vec<ReportCard>) -> Vec<ReportCard> {
    if cards.is_empty() {
        return cards;
    }

    let stats = class_stats(&cards);
    cards.sort_by(|a, b| {
        b.overall_average
            .partial_cmp(&a.overall_average)
            .unwrap_or(Ordering::Equal)
    });

    let averages: Vec<f64> = cards.iter().map(|c| c.overall_average).collect();
    for (card, rank) in cards.iter_mut().zip(competition_ranks(&averages)) {
        card.rank = rank;
        card.class_size = stats.class_size;
        card.class_average = stats.class_average;
        card.top_average = stats.top_average;
        card.bottom_average = stats.bottom_average;
        card.status = CardStatus::Ranked;
    }
    cards
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Consensus detection over a set of agent responses.
//!
//! The NLP is deliberately shallow: sentence split, lower-case
//! normalization, frequency counting.  A stronger similarity function can
//! replace this module behind the same [`consensus_check`] contract.

use std::collections::HashMap;

/// Minimum sentence length to count as a key point.
const MIN_POINT_CHARS: usize = 20;
/// Key points taken from each response.
const POINTS_PER_RESPONSE: usize = 3;
/// Fraction of responses a point must appear in to be consensus.
const SUPERMAJORITY: f64 = 0.6;
/// Phrases whose presence counts a response as agreeing.
const AGREEMENT_PHRASES: &[&str] = &["agree", "consensus", "aligned", "same", "correct"];

#[derive(Debug, Clone)]
pub struct ConsensusOutcome {
    pub reached: bool,
    /// Normalized points shared by a supermajority of responses.
    pub points: Vec<String>,
    /// `consensus points / all distinct points`, 0 when there are none.
    pub confidence: f64,
    /// Points seen in only a minority of responses.
    pub divergent_points: Vec<String>,
    /// Fraction of responses containing an agreement phrase.
    pub agreement_level: f64,
}

impl ConsensusOutcome {
    /// Early consensus: at least 70% of responses textually agree.
    pub fn agreed_by_phrase(&self) -> bool {
        self.agreement_level >= 0.7
    }
}

/// Extract the top key points of one response: the first
/// [`POINTS_PER_RESPONSE`] sentences of at least [`MIN_POINT_CHARS`] chars.
fn key_points(response: &str) -> Vec<String> {
    response
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| s.len() >= MIN_POINT_CHARS)
        .take(POINTS_PER_RESPONSE)
        .map(normalize)
        .collect()
}

fn normalize(sentence: &str) -> String {
    sentence.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Count normalized key points across responses and split them into
/// consensus (supermajority) and divergent sets.
pub fn consensus_check(responses: &[String]) -> ConsensusOutcome {
    if responses.is_empty() {
        return ConsensusOutcome {
            reached: false,
            points: Vec::new(),
            confidence: 0.0,
            divergent_points: Vec::new(),
            agreement_level: 0.0,
        };
    }

    // A point counts once per response that contains it.
    let mut freq: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for response in responses {
        let mut seen = std::collections::HashSet::new();
        for point in key_points(response) {
            if seen.insert(point.clone()) {
                if !freq.contains_key(&point) {
                    order.push(point.clone());
                }
                *freq.entry(point).or_insert(0) += 1;
            }
        }
    }

    let required = ((SUPERMAJORITY * responses.len() as f64).ceil() as usize).max(1);
    let mut points = Vec::new();
    let mut divergent = Vec::new();
    for p in &order {
        if freq[p] >= required {
            points.push(p.clone());
        } else {
            divergent.push(p.clone());
        }
    }

    let agreeing = responses
        .iter()
        .filter(|r| {
            let lower = r.to_lowercase();
            AGREEMENT_PHRASES.iter().any(|p| lower.contains(p))
        })
        .count();
    let agreement_level = agreeing as f64 / responses.len() as f64;

    let confidence = if order.is_empty() {
        0.0
    } else {
        points.len() as f64 / order.len() as f64
    };

    ConsensusOutcome {
        reached: !points.is_empty(),
        points,
        confidence,
        divergent_points: divergent,
        agreement_level,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

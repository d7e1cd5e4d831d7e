//! Failure-aware weighted selection of credentials.
//!
//! Each sample class (one per vendor) keeps an ordered weight list in the
//! persistent store. A draw picks a candidate proportionally to its weight,
//! then the traffic mode nudges the stored weights for the next draw. Backend
//! failures leave a one-shot demote marker in the ephemeral store that cuts
//! the offender's weight on the next draw of that class.
//!
//! Weight updates are read-modify-write without a lock spanning the store
//! round trips. Concurrent draws for the same class can overwrite each other's
//! adjustment; the weights only steer traffic, so the last write winning is
//! acceptable.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::GatewayError;
use crate::store::{self, SharedStore};

pub const INITIAL_WEIGHT: f64 = 100.0;
pub const DEMOTE_FACTOR: f64 = 0.2;
pub const DEMOTE_TTL_MS: u64 = 3600 * 1000;

const FAVOR: f64 = 1.1;
const DISFAVOR: f64 = 0.9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TrafficMode {
    /// Spread traffic away from the most recently used candidate.
    #[default]
    Balance,
    /// Keep sending traffic to the most recently used candidate.
    Encourage,
    /// Leave weights alone.
    None,
}

impl TrafficMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TrafficMode::Balance => "balance",
            TrafficMode::Encourage => "encourage",
            TrafficMode::None => "none",
        }
    }

    fn factors(self) -> (f64, f64) {
        match self {
            TrafficMode::Balance => (DISFAVOR, FAVOR),
            TrafficMode::Encourage => (FAVOR, DISFAVOR),
            TrafficMode::None => (1.0, 1.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub reward: String,
    pub weight: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SampleOutcome {
    pub selected: String,
    /// Weights the draw was made against, after demotion.
    pub drawn_from: Vec<WeightEntry>,
}

impl SampleOutcome {
    /// Probability the draw had of picking `reward`.
    pub fn share_of(&self, reward: &str) -> f64 {
        let total: f64 = self.drawn_from.iter().map(|entry| entry.weight).sum();
        let weight: f64 = self
            .drawn_from
            .iter()
            .filter(|entry| entry.reward == reward)
            .map(|entry| entry.weight)
            .sum();
        if total > 0.0 { weight / total } else { 0.0 }
    }
}

pub fn weight_key(sample_class: &str) -> String {
    format!("sample:{sample_class}:weight")
}

pub fn demote_key(sample_class: &str, reward: &str) -> String {
    format!("sample:{sample_class}:{reward}:demote")
}

pub struct WeightedSampler {
    weights: SharedStore,
    markers: SharedStore,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for WeightedSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightedSampler").finish_non_exhaustive()
    }
}

impl WeightedSampler {
    /// `weights` should survive restarts; `markers` may be a pure cache.
    pub fn new(weights: SharedStore, markers: SharedStore) -> Self {
        Self::with_rng(weights, markers, StdRng::from_entropy())
    }

    pub fn with_rng(weights: SharedStore, markers: SharedStore, rng: StdRng) -> Self {
        Self {
            weights,
            markers,
            rng: Mutex::new(rng),
        }
    }

    pub async fn sample(
        &self,
        mode: TrafficMode,
        sample_class: &str,
        candidates: &[String],
    ) -> Result<String, GatewayError> {
        Ok(self
            .sample_outcome(mode, sample_class, candidates)
            .await?
            .selected)
    }

    pub async fn sample_outcome(
        &self,
        mode: TrafficMode,
        sample_class: &str,
        candidates: &[String],
    ) -> Result<SampleOutcome, GatewayError> {
        if candidates.is_empty() {
            return Err(GatewayError::configuration(format!(
                "no candidates to sample for {sample_class}"
            )));
        }

        let key = weight_key(sample_class);
        let stored: Option<Vec<WeightEntry>> =
            store::get_json(self.weights.as_ref(), &key).await?;
        let mut entries = match stored {
            Some(entries) if matches_candidates(&entries, candidates) => entries,
            Some(_) => {
                tracing::debug!(sample_class, "candidate set changed; resetting weights");
                initial_weights(candidates)
            }
            None => initial_weights(candidates),
        };

        for entry in &mut entries {
            if self
                .markers
                .delete(&demote_key(sample_class, &entry.reward))
                .await?
            {
                entry.weight *= DEMOTE_FACTOR;
                tracing::debug!(
                    sample_class,
                    reward = %entry.reward,
                    weight = entry.weight,
                    "demotion applied"
                );
            }
        }

        let drawn_from = entries.clone();
        let index = self.draw(&entries);
        let selected = entries[index].reward.clone();

        let (chosen, others) = mode.factors();
        for (position, entry) in entries.iter_mut().enumerate() {
            entry.weight *= if position == index { chosen } else { others };
        }

        store::set_json(self.weights.as_ref(), &key, &entries, None).await?;
        Ok(SampleOutcome {
            selected,
            drawn_from,
        })
    }

    /// Marks `reward` to be penalized on the next draw of `sample_class`.
    pub async fn demote(&self, sample_class: &str, reward: &str) -> Result<(), GatewayError> {
        self.markers
            .set(
                &demote_key(sample_class, reward),
                "true".to_string(),
                Some(DEMOTE_TTL_MS),
            )
            .await?;
        Ok(())
    }

    pub async fn weights(&self, sample_class: &str) -> Result<Option<Vec<WeightEntry>>, GatewayError> {
        Ok(store::get_json(self.weights.as_ref(), &weight_key(sample_class)).await?)
    }

    fn draw(&self, entries: &[WeightEntry]) -> usize {
        let total: f64 = entries.iter().map(|entry| entry.weight).sum();
        if !(total.is_finite() && total > 0.0) {
            return 0;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let target = rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        for (index, entry) in entries.iter().enumerate() {
            cumulative += entry.weight;
            if cumulative > target {
                return index;
            }
        }
        entries.len() - 1
    }
}

fn initial_weights(candidates: &[String]) -> Vec<WeightEntry> {
    candidates
        .iter()
        .map(|reward| WeightEntry {
            reward: reward.clone(),
            weight: INITIAL_WEIGHT,
        })
        .collect()
}

/// A stored list is reused only for the same candidate set with usable weights.
fn matches_candidates(entries: &[WeightEntry], candidates: &[String]) -> bool {
    if entries.len() != candidates.len() {
        return false;
    }
    if entries
        .iter()
        .any(|entry| !entry.weight.is_finite() || entry.weight <= 0.0)
    {
        return false;
    }
    let stored: HashSet<&str> = entries.iter().map(|entry| entry.reward.as_str()).collect();
    stored.len() == entries.len()
        && candidates
            .iter()
            .all(|candidate| stored.contains(candidate.as_str()))
}

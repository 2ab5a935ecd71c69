//! Collection policies.
//!
//! A policy is a plain enum with a pure decision function over the
//! [`Accounting`] record and the configured thresholds. The engine performs
//! incremental work before complete work when both are requested.

use crate::accounting::Accounting;
use crate::config::HeapConfig;
use crate::error::ConfigError;

/// How the collector chooses between incremental and complete collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CollectionPolicy {
    /// Always incremental.
    OnlyIncrementally,
    /// Always complete.
    OnlyCompletely,
    /// Never collect unless forced.
    NeverCollect,
    /// Incremental, plus complete when incremental time dominates or the old
    /// generation leaves no room for another promotion.
    #[default]
    ByTime,
    /// As `ByTime`, but no complete collection while the old generation is
    /// smaller than `complete_collection_min_old_bytes`.
    BySpaceAndTime,
}

/// Thresholds the policies compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyInputs {
    /// Maximum heap size
    pub max_heap_size: usize,
    /// Maximum young generation size
    pub max_young_size: usize,
    /// Share (1..=100) of total collection time allowed for incremental work
    pub percent_time_in_incremental: u32,
    /// Old generation bytes below which `BySpaceAndTime` vetoes complete work
    pub complete_collection_min_old_bytes: usize,
    /// Forced request: complete work regardless of the policy
    pub force_complete: bool,
}

impl PolicyInputs {
    /// Inputs taken from a heap configuration.
    pub fn from_config(config: &HeapConfig, force_complete: bool) -> Self {
        Self {
            max_heap_size: config.max_heap_size,
            max_young_size: config.young_size,
            percent_time_in_incremental: config.percent_time_in_incremental,
            complete_collection_min_old_bytes: config.complete_collection_min_old_bytes,
            force_complete,
        }
    }
}

/// What a cycle should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Decision {
    /// Run an incremental scavenge.
    pub incremental: bool,
    /// Run a complete scavenge (after the incremental one, if both).
    pub complete: bool,
}

impl Decision {
    /// Whether the cycle does anything.
    pub fn collects(&self) -> bool {
        self.incremental || self.complete
    }
}

impl CollectionPolicy {
    /// Look a policy up by name.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "OnlyIncrementally" => Ok(Self::OnlyIncrementally),
            "OnlyCompletely" => Ok(Self::OnlyCompletely),
            "NeverCollect" => Ok(Self::NeverCollect),
            "ByTime" => Ok(Self::ByTime),
            "BySpaceAndTime" => Ok(Self::BySpaceAndTime),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }

    /// Name accepted by [`CollectionPolicy::from_name`].
    pub fn name(self) -> &'static str {
        match self {
            Self::OnlyIncrementally => "OnlyIncrementally",
            Self::OnlyCompletely => "OnlyCompletely",
            Self::NeverCollect => "NeverCollect",
            Self::ByTime => "ByTime",
            Self::BySpaceAndTime => "BySpaceAndTime",
        }
    }

    /// Whether allocation may trigger a collection when eden is full.
    pub fn collects_on_allocation(self) -> bool {
        !matches!(self, Self::NeverCollect)
    }

    /// Decide what the next cycle does.
    pub fn decide(self, accounting: &Accounting, inputs: &PolicyInputs) -> Decision {
        let mut decision = match self {
            Self::OnlyIncrementally => Decision {
                incremental: true,
                complete: false,
            },
            Self::OnlyCompletely => Decision {
                incremental: false,
                complete: true,
            },
            Self::NeverCollect => Decision::default(),
            Self::ByTime => Decision {
                incremental: true,
                complete: time_exceeded(accounting, inputs) || space_exhausted(accounting, inputs),
            },
            Self::BySpaceAndTime => Decision {
                incremental: true,
                complete: (time_exceeded(accounting, inputs)
                    || space_exhausted(accounting, inputs))
                    && accounting.old_chunk_bytes_after > inputs.complete_collection_min_old_bytes,
            },
        };
        if inputs.force_complete {
            decision.complete = true;
        }
        decision
    }
}

/// Incremental collections took more than their share of collection time.
fn time_exceeded(accounting: &Accounting, inputs: &PolicyInputs) -> bool {
    let total = accounting.collection_nanos() as u128;
    let incremental = accounting.incremental_nanos as u128;
    incremental * 100 > total * inputs.percent_time_in_incremental as u128
}

/// A full young generation could not be promoted without exceeding the heap.
fn space_exhausted(accounting: &Accounting, inputs: &PolicyInputs) -> bool {
    inputs
        .max_young_size
        .saturating_add(accounting.old_chunk_bytes_after)
        > inputs.max_heap_size
}

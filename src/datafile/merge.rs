//! Merge selection and cadence

use std::sync::Arc;
use std::time::Instant;

use crate::config::MergeConfig;

use super::DataFileReader;

/// Which closed files take part in a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeFilter {
    /// Files below `small_merge_cutoff`
    Small,
    /// Files below `medium_merge_cutoff`
    Medium,
    /// Every file
    Full,
}

impl MergeFilter {
    /// Whether a file of `size` bytes takes part
    pub fn accepts(self, size: u64, config: &MergeConfig) -> bool {
        match self {
            MergeFilter::Small => size < config.small_merge_cutoff,
            MergeFilter::Medium => size < config.medium_merge_cutoff,
            MergeFilter::Full => true,
        }
    }

    /// Files from `files` this filter accepts, order kept
    pub fn select(
        self,
        files: &[Arc<DataFileReader>],
        config: &MergeConfig,
    ) -> Vec<Arc<DataFileReader>> {
        files
            .iter()
            .filter(|f| self.accepts(f.size(), config))
            .cloned()
            .collect()
    }
}

impl std::fmt::Display for MergeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeFilter::Small => write!(f, "small"),
            MergeFilter::Medium => write!(f, "medium"),
            MergeFilter::Full => write!(f, "full"),
        }
    }
}

/// Picks the filter for each scheduled merge
///
/// Full merges win over medium ones, medium over small. Both intervals
/// start counting when the policy is created.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    config: MergeConfig,
    last_full_merge: Instant,
    last_medium_merge: Instant,
}

impl MergePolicy {
    pub fn new(config: MergeConfig, now: Instant) -> Self {
        Self {
            config,
            last_full_merge: now,
            last_medium_merge: now,
        }
    }

    /// Filter for a merge starting at `now`
    ///
    /// A full merge also counts as a medium one.
    pub fn next_filter(&mut self, now: Instant) -> MergeFilter {
        if now.saturating_duration_since(self.last_full_merge) >= self.config.full_merge_interval {
            self.last_full_merge = now;
            self.last_medium_merge = now;
            MergeFilter::Full
        } else if now.saturating_duration_since(self.last_medium_merge)
            >= self.config.medium_merge_interval
        {
            self.last_medium_merge = now;
            MergeFilter::Medium
        } else {
            MergeFilter::Small
        }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }
}

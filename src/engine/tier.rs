//! Throughput to model-tier mapping and resource caps

use super::catalog::{self, MAX_TIER};
use super::types::ComputeMode;
use crate::hardware::HardwareProfile;
use serde::Serialize;
use tracing::debug;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Lower bound (inclusive) of tokens per second for a tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierBand {
    pub min_tokens_per_second: f64,
    pub tier: u8,
}

/// Default thresholds, highest band first
pub const DEFAULT_TIER_BANDS: &[TierBand] = &[
    TierBand { min_tokens_per_second: 420.0, tier: 5 },
    TierBand { min_tokens_per_second: 185.0, tier: 4 },
    TierBand { min_tokens_per_second: 100.0, tier: 3 },
    TierBand { min_tokens_per_second: 50.0, tier: 2 },
    TierBand { min_tokens_per_second: 20.0, tier: 1 },
    TierBand { min_tokens_per_second: 0.0, tier: 0 },
];

/// Outcome of mapping a throughput to the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierRecommendation {
    pub tier: u8,
    pub model_id: String,
}

/// One row of the table shown while the user picks a model
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierRow {
    pub tier: u8,
    pub model_id: String,
    pub title: String,
    pub memory_hint: String,
    pub min_tokens_per_second: f64,
}

#[derive(Debug, Clone)]
pub struct TierSelector {
    bands: Vec<TierBand>,
}

impl Default for TierSelector {
    fn default() -> Self {
        Self::new(DEFAULT_TIER_BANDS.to_vec())
    }
}

impl TierSelector {
    /// Bands are sorted highest threshold first regardless of input order
    pub fn new(mut bands: Vec<TierBand>) -> Self {
        bands.sort_by(|a, b| b.min_tokens_per_second.total_cmp(&a.min_tokens_per_second));
        Self { bands }
    }

    /// Tier for a throughput. Bands are closed at their lower bound.
    pub fn tier_for(&self, tokens_per_second: f64) -> u8 {
        self.bands
            .iter()
            .find(|band| tokens_per_second >= band.min_tokens_per_second)
            .map(|band| band.tier.min(MAX_TIER))
            .unwrap_or(0)
    }

    pub fn recommend(&self, tokens_per_second: f64) -> TierRecommendation {
        let tier = self.tier_for(tokens_per_second);
        TierRecommendation {
            tier,
            model_id: catalog::for_tier(tier).id.to_string(),
        }
    }

    /// Like [`recommend`](Self::recommend) but never above what memory allows
    pub fn recommend_capped(
        &self,
        tokens_per_second: f64,
        caps: &ResourceCaps,
        mode: ComputeMode,
    ) -> TierRecommendation {
        let raw = self.tier_for(tokens_per_second);
        let tier = caps.cap(raw, mode);
        if tier != raw {
            debug!(raw, capped = tier, mode = %mode, "Benchmark tier capped by memory");
        }
        TierRecommendation {
            tier,
            model_id: catalog::for_tier(tier).id.to_string(),
        }
    }

    pub fn tier_table(&self) -> Vec<TierRow> {
        catalog::CATALOG
            .iter()
            .map(|model| TierRow {
                tier: model.tier,
                model_id: model.id.to_string(),
                title: model.title.to_string(),
                memory_hint: model.memory_hint.to_string(),
                min_tokens_per_second: self
                    .bands
                    .iter()
                    .find(|band| band.tier == model.tier)
                    .map(|band| band.min_tokens_per_second)
                    .unwrap_or(0.0),
            })
            .collect()
    }
}

/// Upper bounds on the tier a host can actually hold in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCaps {
    pub ram_tier: u8,
    pub vram_tier: Option<u8>,
    pub cpu_tier: u8,
}

impl ResourceCaps {
    /// Caps that never lower a tier
    pub fn unlimited() -> Self {
        Self {
            ram_tier: MAX_TIER,
            vram_tier: None,
            cpu_tier: MAX_TIER,
        }
    }

    pub fn from_profile(profile: &HardwareProfile) -> Self {
        Self {
            ram_tier: ram_tier(profile.total_memory_bytes),
            vram_tier: profile.vram_bytes.map(vram_tier),
            cpu_tier: cpu_tier(profile.cpu_cores),
        }
    }

    /// Caps a measured tier: RAM always applies, VRAM only when the GPU is used
    pub fn cap(&self, tier: u8, mode: ComputeMode) -> u8 {
        let mut capped = tier.min(self.ram_tier);
        if mode.uses_gpu() {
            if let Some(vram) = self.vram_tier {
                capped = capped.min(vram);
            }
        }
        capped
    }

    /// Static tier estimate for when no benchmark has been run
    pub fn estimate_tier(&self, mode: ComputeMode) -> u8 {
        match mode {
            ComputeMode::Gpu => self.ram_tier.min(self.vram_tier.unwrap_or(self.cpu_tier)),
            ComputeMode::Cpu | ComputeMode::Hybrid => self.ram_tier.min(self.cpu_tier),
        }
    }
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / GIB
}

pub fn ram_tier(total_memory_bytes: u64) -> u8 {
    match gib(total_memory_bytes) {
        g if g < 8.0 => 0,
        g if g < 12.0 => 1,
        g if g < 20.0 => 2,
        g if g < 32.0 => 3,
        g if g < 48.0 => 4,
        _ => 5,
    }
}

pub fn vram_tier(vram_bytes: u64) -> u8 {
    match gib(vram_bytes) {
        g if g < 4.0 => 0,
        g if g < 6.0 => 1,
        g if g < 10.0 => 2,
        g if g < 12.0 => 3,
        g if g < 24.0 => 4,
        _ => 5,
    }
}

pub fn cpu_tier(cores: usize) -> u8 {
    match cores {
        c if c >= 24 => 3,
        c if c >= 20 => 2,
        c if c >= 8 => 1,
        _ => 0,
    }
}

/// Limits a hybrid layer count on small GPUs; unknown VRAM is not limited
pub fn clamp_gpu_layers(requested: u32, vram_bytes: Option<u64>) -> u32 {
    let Some(vram) = vram_bytes else {
        return requested;
    };
    let limit = match gib(vram) {
        g if g < 4.0 => 0,
        g if g < 6.0 => 8,
        g if g < 8.0 => 16,
        _ => return requested,
    };
    requested.min(limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    const GB: u64 = 1024 * 1024 * 1024;

    #[parameterized(
        top_band = { 420.0, 5 },
        just_below_top = { 419.9, 4 },
        fourteen_b = { 185.0, 4 },
        eight_b = { 184.99, 3 },
        eight_b_floor = { 100.0, 3 },
        four_b = { 50.0, 2 },
        four_b_upper = { 99.0, 2 },
        small = { 20.0, 1 },
        tiny = { 19.9, 0 },
        zero = { 0.0, 0 },
        huge = { 10_000.0, 5 },
    )]
    fn test_tier_thresholds(tps: f64, expected: u8) {
        assert_eq!(TierSelector::default().tier_for(tps), expected);
    }

    #[test]
    fn test_recommend_maps_to_catalog() {
        let rec = TierSelector::default().recommend(150.0);
        assert_eq!(rec.tier, 3);
        assert_eq!(rec.model_id, "qwen3_8b_q4_k_m");
    }

    #[test]
    fn test_custom_bands_are_sorted() {
        let selector = TierSelector::new(vec![
            TierBand { min_tokens_per_second: 0.0, tier: 0 },
            TierBand { min_tokens_per_second: 10.0, tier: 2 },
        ]);
        assert_eq!(selector.tier_for(11.0), 2);
        assert_eq!(selector.tier_for(9.0), 0);
    }

    #[test]
    fn test_tier_table_covers_catalog() {
        let table = TierSelector::default().tier_table();
        assert_eq!(table.len(), 6);
        assert_eq!(table[5].min_tokens_per_second, 420.0);
        assert_eq!(table[0].min_tokens_per_second, 0.0);
    }

    #[parameterized(
        four = { 4, 0 },
        eight = { 8, 1 },
        sixteen = { 16, 2 },
        twenty_four = { 24, 3 },
        thirty_two = { 32, 4 },
        sixty_four = { 64, 5 },
    )]
    fn test_ram_tier(gb: u64, expected: u8) {
        assert_eq!(ram_tier(gb * GB), expected);
    }

    #[parameterized(
        two = { 2, 0 },
        four = { 4, 1 },
        eight = { 8, 2 },
        ten = { 10, 3 },
        sixteen = { 16, 4 },
        twenty_four = { 24, 5 },
    )]
    fn test_vram_tier(gb: u64, expected: u8) {
        assert_eq!(vram_tier(gb * GB), expected);
    }

    #[test]
    fn test_cpu_tier() {
        assert_eq!(cpu_tier(4), 0);
        assert_eq!(cpu_tier(8), 1);
        assert_eq!(cpu_tier(20), 2);
        assert_eq!(cpu_tier(32), 3);
    }

    #[test]
    fn test_caps_apply_vram_only_for_gpu_modes() {
        let caps = ResourceCaps {
            ram_tier: 5,
            vram_tier: Some(1),
            cpu_tier: 3,
        };
        assert_eq!(caps.cap(5, ComputeMode::Cpu), 5);
        assert_eq!(caps.cap(5, ComputeMode::Gpu), 1);
        assert_eq!(caps.cap(5, ComputeMode::Hybrid), 1);
    }

    #[test]
    fn test_recommend_capped_by_ram() {
        let caps = ResourceCaps {
            ram_tier: 2,
            vram_tier: None,
            cpu_tier: 3,
        };
        let rec = TierSelector::default().recommend_capped(500.0, &caps, ComputeMode::Gpu);
        assert_eq!(rec.tier, 2);
        assert_eq!(rec.model_id, "qwen3_4b_q4_k_m");
    }

    #[test]
    fn test_estimate_tier() {
        let caps = ResourceCaps {
            ram_tier: 4,
            vram_tier: Some(2),
            cpu_tier: 1,
        };
        assert_eq!(caps.estimate_tier(ComputeMode::Cpu), 1);
        assert_eq!(caps.estimate_tier(ComputeMode::Gpu), 2);
        assert_eq!(caps.estimate_tier(ComputeMode::Hybrid), 1);
    }

    #[test]
    fn test_clamp_gpu_layers() {
        assert_eq!(clamp_gpu_layers(20, Some(3 * GB)), 0);
        assert_eq!(clamp_gpu_layers(20, Some(5 * GB)), 8);
        assert_eq!(clamp_gpu_layers(20, Some(7 * GB)), 16);
        assert_eq!(clamp_gpu_layers(20, Some(12 * GB)), 20);
        assert_eq!(clamp_gpu_layers(4, Some(7 * GB)), 4);
        assert_eq!(clamp_gpu_layers(20, None), 20);
    }
}

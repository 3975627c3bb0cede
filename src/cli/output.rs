//! Output formatting for the CLI in JSON, YAML and human-readable text

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::engine::{
    BenchmarkEntry, ComputeCandidate, RuntimeRecord, TierRecommendation, TierRow,
};
use crate::hardware::HardwareProfile;
use crate::provision::InstalledModel;
use crate::settings::DesiredConfig;
use crate::setup::{SetupSession, SkippedCandidate};

const RULE: &str = "\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}";
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Output format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON format (machine-readable)
    Json,
    /// YAML format
    Yaml,
    /// Human-readable formatted text
    Human,
}

/// Saved configuration plus whether its files are on disk
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub desired: Option<DesiredConfig>,
    pub model_installed: bool,
    pub runtime_installed: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecommendationView<'a> {
    recommendation: &'a TierRecommendation,
    tiers: &'a [TierRow],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BenchmarkView<'a> {
    entries: &'a [BenchmarkEntry],
    skipped: &'a [SkippedCandidate],
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn structured<T: Serialize>(&self, value: &T, what: &str) -> Result<Option<String>> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(value)
                .with_context(|| format!("Failed to serialize {} to JSON", what))
                .map(Some),
            OutputFormat::Yaml => serde_yaml::to_string(value)
                .with_context(|| format!("Failed to serialize {} to YAML", what))
                .map(Some),
            OutputFormat::Human => Ok(None),
        }
    }

    pub fn format_profile(&self, profile: &HardwareProfile) -> Result<String> {
        if let Some(out) = self.structured(profile, "hardware profile")? {
            return Ok(out);
        }
        let mut output = String::new();
        output.push_str("Hardware\n");
        output.push_str(RULE);
        output.push_str("\n\n");
        output.push_str(&format!(
            "CPU:     {} ({} cores)\n",
            or_unknown(&profile.cpu_brand),
            profile.cpu_cores
        ));
        output.push_str(&format!("Memory:  {:.1} GB\n", profile.total_memory_gb()));
        output.push_str(&format!(
            "GPU:     {}\n",
            profile.gpu_name.as_deref().unwrap_or("(none detected)")
        ));
        match profile.vram_gb() {
            Some(vram) => output.push_str(&format!("VRAM:    {:.1} GB\n", vram)),
            None => output.push_str("VRAM:    (unknown)\n"),
        }
        output.push_str("\nAccelerators:\n");
        output.push_str(&format!("\u{251C}\u{2500} CUDA:    {}\n", yes_no(profile.has_cuda)));
        output.push_str(&format!("\u{251C}\u{2500} Vulkan:  {}\n", yes_no(profile.has_vulkan)));
        output.push_str(&format!("\u{251C}\u{2500} Metal:   {}\n", yes_no(profile.has_metal)));
        output.push_str(&format!(
            "\u{2514}\u{2500} Apple Silicon: {}\n",
            yes_no(profile.is_apple_silicon)
        ));
        Ok(output)
    }

    pub fn format_candidates(&self, candidates: &[ComputeCandidate]) -> Result<String> {
        if let Some(out) = self.structured(&candidates, "candidates")? {
            return Ok(out);
        }
        let mut output = String::from("Compute candidates (in benchmark order)\n");
        for (i, candidate) in candidates.iter().enumerate() {
            output.push_str(&format!(
                "  {}. {:<12} {}\n",
                i + 1,
                candidate.label,
                candidate.config
            ));
        }
        Ok(output)
    }

    pub fn format_recommendation(
        &self,
        recommendation: &TierRecommendation,
        tiers: &[TierRow],
    ) -> Result<String> {
        let view = RecommendationView {
            recommendation,
            tiers,
        };
        if let Some(out) = self.structured(&view, "recommendation")? {
            return Ok(out);
        }
        let mut output = tier_table(tiers, Some(recommendation.tier));
        output.push_str(&format!(
            "\nRecommended: {} (tier {})\n",
            recommendation.model_id, recommendation.tier
        ));
        Ok(output)
    }

    pub fn format_benchmarks(
        &self,
        entries: &[BenchmarkEntry],
        skipped: &[SkippedCandidate],
    ) -> Result<String> {
        let view = BenchmarkView { entries, skipped };
        if let Some(out) = self.structured(&view, "benchmark results")? {
            return Ok(out);
        }
        Ok(benchmark_table(entries, skipped))
    }

    pub fn format_session(&self, session: &SetupSession, tiers: &[TierRow]) -> Result<String> {
        if let Some(out) = self.structured(session, "setup session")? {
            return Ok(out);
        }
        let mut output = format!("Setup {}\n{}\n\n", session.phase, RULE);
        output.push_str(&benchmark_table(&session.entries, &session.skipped));

        if let Some(engine) = &session.chosen_engine {
            output.push_str(&format!(
                "\nEngine:       {} ({})\n",
                engine.candidate.label, engine.candidate.config
            ));
            if engine.candidate.config.compute_mode == crate::engine::ComputeMode::Hybrid {
                output.push_str(&format!("GPU layers:   {}\n", session.gpu_layers));
            }
        }
        if let Some(recommended) = &session.recommended_model_id {
            output.push_str(&format!("Recommended:  {}\n", recommended));
        }
        if let Some(selected) = &session.selected_model_id {
            if session.recommended_model_id.as_ref() != Some(selected) {
                output.push_str(&format!("Selected:     {}\n", selected));
            }
        }
        if session.phase == crate::setup::SetupPhase::Selecting {
            let selected_tier = session
                .selected_model_id
                .as_deref()
                .and_then(crate::engine::catalog::find)
                .map(|m| m.tier);
            output.push('\n');
            output.push_str(&tier_table(tiers, selected_tier));
        }
        if let Some(failure) = &session.failure {
            output.push_str(&format!(
                "\n\u{2717} Failed during {}: {}\n",
                failure.phase, failure.message
            ));
        }
        Ok(output)
    }

    pub fn format_status(&self, status: &StatusReport) -> Result<String> {
        if let Some(out) = self.structured(status, "status")? {
            return Ok(out);
        }
        let Some(desired) = &status.desired else {
            return Ok("No engine configured. Run `reader-llm setup` first.\n".to_string());
        };
        let mut output = String::from("Saved configuration\n");
        output.push_str(&format!("\u{251C}\u{2500} Model:      {}\n", desired.model_id));
        output.push_str(&format!("\u{251C}\u{2500} Compute:    {}\n", desired.compute));
        output.push_str(&format!("\u{251C}\u{2500} GPU layers: {}\n", desired.gpu_layers));
        output.push_str(&format!("\u{251C}\u{2500} Auto-start: {}\n", yes_no(desired.auto_start)));
        output.push_str(&format!(
            "\u{2514}\u{2500} Updated:    {}\n",
            desired.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        output.push_str(&format!(
            "\nModel installed:   {}\nRuntime installed: {}\n",
            yes_no(status.model_installed),
            yes_no(status.runtime_installed)
        ));
        Ok(output)
    }

    pub fn format_models(&self, models: &[InstalledModel]) -> Result<String> {
        if let Some(out) = self.structured(&models, "models")? {
            return Ok(out);
        }
        if models.is_empty() {
            return Ok("No models installed\n".to_string());
        }
        let mut output = String::new();
        for model in models {
            output.push_str(&format!(
                "{:<32} {:>8.2} GB\n",
                model.model_id,
                model.file_size_bytes as f64 / GIB
            ));
        }
        Ok(output)
    }

    pub fn format_runtime(&self, record: &RuntimeRecord) -> Result<String> {
        if let Some(out) = self.structured(record, "runtime status")? {
            return Ok(out);
        }
        let state = if record.installed {
            "installed"
        } else {
            "not installed"
        };
        Ok(format!(
            "Runtime {}: {}\n  {}\n",
            record.config.runtime_variant(),
            state,
            record.dir.display()
        ))
    }

    pub fn format_config(&self, config: &EngineConfig) -> Result<String> {
        let map = config.to_display_map();
        if let Some(out) = self.structured(&map, "config")? {
            return Ok(out);
        }
        let mut output = String::from("Configuration\n");
        for (key, value) in &map {
            output.push_str(&format!("  {:<26} {}\n", key, value));
        }
        Ok(output)
    }
}

fn tier_table(tiers: &[TierRow], highlight: Option<u8>) -> String {
    let mut output = String::from("Tier  Model                      Memory   Min tok/s\n");
    for row in tiers {
        let marker = if Some(row.tier) == highlight { "\u{25B6}" } else { " " };
        output.push_str(&format!(
            "{}{:>3}  {:<26} {:<8} {:>6.0}\n",
            marker, row.tier, row.title, row.memory_hint, row.min_tokens_per_second
        ));
    }
    output
}

fn benchmark_table(entries: &[BenchmarkEntry], skipped: &[SkippedCandidate]) -> String {
    let mut output = String::new();
    if entries.is_empty() {
        output.push_str("No successful benchmarks\n");
    } else {
        output.push_str("Benchmarks:\n");
        for (i, entry) in entries.iter().enumerate() {
            let connector = if i + 1 == entries.len() && skipped.is_empty() {
                "\u{2514}"
            } else {
                "\u{251C}"
            };
            output.push_str(&format!(
                "{}\u{2500} {:<12} {:>8.1} tok/s  tier {}\n",
                connector, entry.candidate.label, entry.tokens_per_second, entry.recommended_tier
            ));
        }
    }
    for (i, skip) in skipped.iter().enumerate() {
        let connector = if i + 1 == skipped.len() {
            "\u{2514}"
        } else {
            "\u{251C}"
        };
        output.push_str(&format!(
            "{}\u{2500} {:<12} skipped during {}: {}\n",
            connector, skip.candidate.label, skip.phase, skip.reason
        ));
    }
    output
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn or_unknown(value: &str) -> &str {
    if value.is_empty() {
        "unknown"
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ComputeConfig, GpuBackend, TierSelector};

    fn entries() -> Vec<BenchmarkEntry> {
        vec![BenchmarkEntry {
            candidate: ComputeCandidate::new("Vulkan", ComputeConfig::hybrid(GpuBackend::Vulkan)),
            tokens_per_second: 123.4,
            recommended_tier: 3,
            recommended_model_id: "qwen3_8b_q4_k_m".into(),
        }]
    }

    #[test]
    fn test_candidates_human() {
        let formatter = OutputFormatter::new(OutputFormat::Human);
        let out = formatter
            .format_candidates(&[
                ComputeCandidate::new("Vulkan", ComputeConfig::hybrid(GpuBackend::Vulkan)),
                ComputeCandidate::new("CPU", ComputeConfig::cpu()),
            ])
            .unwrap();
        assert!(out.contains("1. Vulkan"));
        assert!(out.contains("hybrid/vulkan"));
        assert!(out.contains("2. CPU"));
    }

    #[test]
    fn test_benchmarks_json_uses_camel_case() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let out = formatter.format_benchmarks(&entries(), &[]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["entries"][0]["tokensPerSecond"], 123.4);
        assert_eq!(value["entries"][0]["candidate"]["gpuBackend"], "vulkan");
    }

    #[test]
    fn test_benchmarks_human() {
        let formatter = OutputFormatter::new(OutputFormat::Human);
        let out = formatter.format_benchmarks(&entries(), &[]).unwrap();
        assert!(out.contains("123.4 tok/s"));
        assert!(out.contains("tier 3"));
    }

    #[test]
    fn test_recommendation_marks_tier() {
        let selector = TierSelector::default();
        let formatter = OutputFormatter::new(OutputFormat::Human);
        let out = formatter
            .format_recommendation(&selector.recommend(120.0), &selector.tier_table())
            .unwrap();
        assert!(out.contains("\u{25B6}  3"));
        assert!(out.contains("Recommended: qwen3_8b_q4_k_m (tier 3)"));
    }

    #[test]
    fn test_status_without_config() {
        let formatter = OutputFormatter::new(OutputFormat::Human);
        let out = formatter
            .format_status(&StatusReport {
                desired: None,
                model_installed: false,
                runtime_installed: false,
            })
            .unwrap();
        assert!(out.contains("reader-llm setup"));
    }

    #[test]
    fn test_models_yaml() {
        let formatter = OutputFormatter::new(OutputFormat::Yaml);
        let out = formatter
            .format_models(&[InstalledModel {
                model_id: "custom".into(),
                file_size_bytes: 42,
            }])
            .unwrap();
        assert!(out.contains("modelId: custom"));
        assert!(out.contains("fileSizeBytes: 42"));
    }
}

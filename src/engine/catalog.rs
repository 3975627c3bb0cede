//! Builtin model catalog
//!
//! One descriptor per tier, sorted by tier. Every entry is a Q4_K_M GGUF
//! quantization published on two mirrors.

use serde::Serialize;

/// Model used to measure throughput across compute candidates
pub const REFERENCE_MODEL_ID: &str = "qwen3_0_6b_q4_k_m";

/// Highest tier in the catalog
pub const MAX_TIER: u8 = 5;

const MAX_MODEL_ID_LEN: usize = 80;

/// A downloadable model with its tier and sources
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: &'static str,
    pub title: &'static str,
    pub tier: u8,
    /// Approximate RAM/VRAM footprint, for display
    pub memory_hint: &'static str,
    pub file_name: &'static str,
    /// Mirrors in preference order
    pub mirrors: [&'static str; 2],
}

macro_rules! qwen3 {
    ($id:literal, $title:literal, $tier:literal, $hint:literal, $size:literal) => {
        ModelDescriptor {
            id: $id,
            title: $title,
            tier: $tier,
            memory_hint: $hint,
            file_name: concat!("Qwen3-", $size, "-Q4_K_M.gguf"),
            mirrors: [
                concat!(
                    "https://www.modelscope.cn/models/unsloth/Qwen3-",
                    $size,
                    "-GGUF/resolve/master/Qwen3-",
                    $size,
                    "-Q4_K_M.gguf"
                ),
                concat!(
                    "https://huggingface.co/unsloth/Qwen3-",
                    $size,
                    "-GGUF/resolve/main/Qwen3-",
                    $size,
                    "-Q4_K_M.gguf"
                ),
            ],
        }
    };
}

/// The full catalog, tier-sorted with exactly one entry per tier
pub const CATALOG: &[ModelDescriptor] = &[
    qwen3!("qwen3_0_6b_q4_k_m", "Qwen3 0.6B", 0, "~1 GB", "0.6B"),
    qwen3!("qwen3_1_7b_q4_k_m", "Qwen3 1.7B", 1, "~2 GB", "1.7B"),
    qwen3!("qwen3_4b_q4_k_m", "Qwen3 4B", 2, "~3.5 GB", "4B"),
    qwen3!("qwen3_8b_q4_k_m", "Qwen3 8B", 3, "~6 GB", "8B"),
    qwen3!("qwen3_14b_q4_k_m", "Qwen3 14B", 4, "~10 GB", "14B"),
    qwen3!("qwen3_32b_q4_k_m", "Qwen3 32B", 5, "~21 GB", "32B"),
];

pub fn find(model_id: &str) -> Option<&'static ModelDescriptor> {
    CATALOG.iter().find(|m| m.id == model_id)
}

pub fn for_tier(tier: u8) -> &'static ModelDescriptor {
    let idx = usize::from(tier.min(MAX_TIER));
    &CATALOG[idx]
}

pub fn reference_model() -> &'static ModelDescriptor {
    for_tier(0)
}

/// Reduces an arbitrary model id to a filesystem-safe stem.
///
/// Characters outside `[A-Za-z0-9_.-]` become `_`, leading and trailing
/// separators are trimmed and the result is truncated to 80 characters. An
/// empty result falls back to the reference model id.
pub fn sanitize_model_id(raw: &str) -> String {
    let replaced: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = replaced.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    let truncated: String = trimmed.chars().take(MAX_MODEL_ID_LEN).collect();

    if truncated.is_empty() {
        REFERENCE_MODEL_ID.to_string()
    } else {
        truncated
    }
}

/// On-disk file name for a model id
pub fn file_name_for(model_id: &str) -> String {
    match find(model_id) {
        Some(model) => model.file_name.to_string(),
        None => format!("{}.gguf", sanitize_model_id(model_id)),
    }
}

/// Maps an on-disk file name back to its model id
pub fn model_id_for_file(file_name: &str) -> Option<String> {
    if let Some(model) = CATALOG.iter().find(|m| m.file_name == file_name) {
        return Some(model.id.to_string());
    }
    let stem = file_name.strip_suffix(".gguf")?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_string())
}

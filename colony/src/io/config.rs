//! Run configuration (TOML).
//!
//! The file is edited by humans and must remain stable and automatable;
//! missing fields and a missing file both resolve to the documented defaults.
//! CLI overrides are applied by the caller after loading.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classify::FallbackQuality;
use crate::core::decay::DecayKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub pheromones: PheromoneConfig,
    pub thresholds: ThresholdConfig,
    pub r#loop: LoopConfig,
    pub budgets: BudgetConfig,
    pub llm: LlmConfig,
    pub discover: DiscoverConfig,
    pub transformer: TransformerConfig,
    pub tester: TesterConfig,
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PheromoneConfig {
    /// Decay law for task intensity.
    pub decay_type: DecayKind,
    /// Decay constant ρ.
    pub decay_rate: f64,
    /// Decay constant k_γ for the inhibition field.
    pub inhibition_decay_rate: f64,
    /// Max γ below which Transform may resume a file.
    pub inhibition_threshold: f64,
    /// `[floor, ceiling]` for intensity normalization.
    pub task_intensity_clamp: [f64; 2],
}

impl Default for PheromoneConfig {
    fn default() -> Self {
        Self {
            decay_type: DecayKind::Exponential,
            decay_rate: 0.05,
            inhibition_decay_rate: 0.08,
            inhibition_threshold: 0.1,
            task_intensity_clamp: [0.1, 1.0],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Activation floor for Transform's effective priority.
    pub transformer_intensity_min: f64,
    pub validator_confidence_high: f64,
    pub validator_confidence_low: f64,
    /// Retry ceiling; the next failure past it lands in terminal `skipped`.
    pub max_retry_count: u32,
    /// Ticks an unchanged `in_progress` may survive before zombie release.
    pub scope_lock_ttl: u64,
    pub aging_boost_cap: f64,
    pub aging_boost_per_tick: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            transformer_intensity_min: 0.2,
            validator_confidence_high: 0.8,
            validator_confidence_low: 0.5,
            max_retry_count: 3,
            scope_lock_ttl: 3,
            aging_boost_cap: 0.08,
            aging_boost_per_tick: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub max_ticks: u64,
    pub idle_cycles_to_stop: u32,
    /// Bound on any intra-role inner loop (Discover's batch size).
    pub sequential_stage_action_cap: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_ticks: 50,
            idle_cycles_to_stop: 2,
            sequential_stage_action_cap: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_tokens_total: u64,
    /// 0.0 disables the monetary ceiling.
    pub max_budget_usd: f64,
    pub request_timeout_seconds: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens_total: 100_000,
            max_budget_usd: 0.0,
            request_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub endpoint: String,
    pub temperature: f64,
    /// Completion allowance used for pre-call budget estimates. The client
    /// never sends a max-output-tokens parameter.
    pub estimated_completion_tokens: u64,
    pub retry_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing: Option<PricingConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "qwen/qwen3-235b-a22b-2507".to_string(),
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            temperature: 0.2,
            estimated_completion_tokens: 4096,
            retry_attempts: 3,
            pricing: None,
        }
    }
}

/// Per-token prices used to estimate cost when the provider reports none.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricingConfig {
    pub prompt_per_token: f64,
    pub completion_per_token: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoverConfig {
    /// Extension of files under migration, including the dot.
    pub file_extension: String,
    pub exclude_dirs: Vec<String>,
    /// w_pattern in the raw score `w_pattern * patterns + w_dep * deps`.
    pub pattern_weight: f64,
    /// w_dep in the raw score.
    pub dependency_weight: f64,
    /// Vocabulary for the textual detector.
    pub legacy_tokens: Vec<String>,
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            file_extension: ".py".to_string(),
            exclude_dirs: vec![
                ".git".to_string(),
                ".colony".to_string(),
                "__pycache__".to_string(),
                ".venv".to_string(),
            ],
            pattern_weight: 0.6,
            dependency_weight: 0.4,
            legacy_tokens: vec![
                "print >>".to_string(),
                "xrange".to_string(),
                "iteritems".to_string(),
                "iterkeys".to_string(),
                "itervalues".to_string(),
                "has_key".to_string(),
                "raw_input".to_string(),
                "unicode(".to_string(),
                "urllib2".to_string(),
                "__metaclass__".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransformerConfig {
    /// Structural-check gate on LLM output before it reaches disk.
    pub syntax_gate: bool,
    /// Bounded repair calls when the gate rejects the candidate.
    pub repair_attempts_max: u32,
    /// Stigmergic few-shot: validated high-confidence examples per prompt.
    pub max_few_shot_examples: usize,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            syntax_gate: true,
            repair_attempts_max: 2,
            max_few_shot_examples: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TesterConfig {
    /// Per-file suite command; `{test_file}` is substituted.
    pub test_command: Vec<String>,
    /// Whole-repo regression probe command.
    pub probe_command: Vec<String>,
    /// Structural check command; `{file}` is substituted.
    pub compile_command: Vec<String>,
    /// Candidate test locations; `{stem}`, `{ext}`, `{dir}` are substituted.
    pub test_locations: Vec<String>,
    pub inconclusive_markers: Vec<String>,
    pub optional_dependency_hints: Vec<String>,
    pub command_timeout_seconds: u64,
    pub fallback_quality: FallbackQualityConfig,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            test_command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "pytest".to_string(),
                "-q".to_string(),
                "{test_file}".to_string(),
            ],
            probe_command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "pytest".to_string(),
                "-q".to_string(),
            ],
            compile_command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "py_compile".to_string(),
                "{file}".to_string(),
            ],
            test_locations: vec![
                "tests/test_{stem}{ext}".to_string(),
                "{dir}/test_{stem}{ext}".to_string(),
            ],
            inconclusive_markers: vec![
                "usage:".to_string(),
                "no tests ran".to_string(),
                "systemexit".to_string(),
            ],
            optional_dependency_hints: vec![
                "pip install".to_string(),
                "optional dependency".to_string(),
                "requires that".to_string(),
            ],
            command_timeout_seconds: 120,
            fallback_quality: FallbackQualityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FallbackQualityConfig {
    pub compile_import_fail: f64,
    pub related_regression: f64,
    pub pass_or_inconclusive: f64,
}

impl Default for FallbackQualityConfig {
    fn default() -> Self {
        Self {
            compile_import_fail: 0.4,
            related_regression: 0.6,
            pass_or_inconclusive: 0.8,
        }
    }
}

impl FallbackQualityConfig {
    pub fn to_fallback(&self) -> FallbackQuality {
        FallbackQuality {
            compile_import_fail: self.compile_import_fail,
            related_regression: self.related_regression,
            pass_or_inconclusive: self.pass_or_inconclusive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitConfig {
    /// Work branches are named `<branch_prefix>/<run-id>`.
    pub branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "colony".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pheromones: PheromoneConfig::default(),
            thresholds: ThresholdConfig::default(),
            r#loop: LoopConfig::default(),
            budgets: BudgetConfig::default(),
            llm: LlmConfig::default(),
            discover: DiscoverConfig::default(),
            transformer: TransformerConfig::default(),
            tester: TesterConfig::default(),
            git: GitConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let p = &self.pheromones;
        if p.decay_rate < 0.0 || p.inhibition_decay_rate < 0.0 {
            return Err(anyhow!("decay rates must be non-negative"));
        }
        let [floor, ceiling] = p.task_intensity_clamp;
        if !(0.0..=1.0).contains(&floor) || !(0.0..=1.0).contains(&ceiling) || floor > ceiling {
            return Err(anyhow!(
                "task_intensity_clamp must be an ordered pair within [0.0, 1.0]"
            ));
        }
        let t = &self.thresholds;
        if t.validator_confidence_low > t.validator_confidence_high {
            return Err(anyhow!(
                "validator_confidence_low must not exceed validator_confidence_high"
            ));
        }
        if self.r#loop.max_ticks == 0 {
            return Err(anyhow!("loop.max_ticks must be > 0"));
        }
        if self.r#loop.idle_cycles_to_stop == 0 {
            return Err(anyhow!("loop.idle_cycles_to_stop must be > 0"));
        }
        if self.budgets.request_timeout_seconds == 0 {
            return Err(anyhow!("budgets.request_timeout_seconds must be > 0"));
        }
        let q = &self.tester.fallback_quality;
        if !(q.compile_import_fail < q.related_regression
            && q.related_regression < q.pass_or_inconclusive
            && q.pass_or_inconclusive <= 1.0)
        {
            return Err(anyhow!(
                "tester.fallback_quality must satisfy compile_import_fail < related_regression < pass_or_inconclusive <= 1.0"
            ));
        }
        if self.discover.file_extension.is_empty() {
            return Err(anyhow!("discover.file_extension must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file; a missing file resolves to defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.r#loop.max_ticks = 7;
        cfg.budgets.max_tokens_total = 300;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[loop]\nmax_ticks = 9\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.r#loop.max_ticks, 9);
        assert_eq!(cfg.thresholds.max_retry_count, 3);
    }

    #[test]
    fn misordered_fallback_quality_is_rejected() {
        let mut cfg = Config::default();
        cfg.tester.fallback_quality.compile_import_fail = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn misordered_confidence_cutoffs_are_rejected() {
        let mut cfg = Config::default();
        cfg.thresholds.validator_confidence_low = 0.9;
        assert!(cfg.validate().is_err());
    }
}

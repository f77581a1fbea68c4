//! Configuration structures, layered TOML loading, and environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Output container format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mkv,
    Mp4,
}

impl Default for Container {
    fn default() -> Self {
        Container::Mkv
    }
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mkv => "mkv",
            Container::Mp4 => "mp4",
        }
    }
}

/// Hardware backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HwBackend {
    Auto,
    Nvenc,
    Amf,
    Qsv,
    Vaapi,
    Cpu,
}

impl Default for HwBackend {
    fn default() -> Self {
        HwBackend::Auto
    }
}

/// Output naming and container policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_suffix")]
    pub suffix: String,
    #[serde(default)]
    pub container: Container,
}

fn default_suffix() -> String {
    ".cast".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            suffix: default_suffix(),
            container: Container::default(),
        }
    }
}

/// Library scan filters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScanConfig {
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub ignore_paths: Vec<String>,
    #[serde(default)]
    pub include_paths: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Codec decision policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionConfig {
    #[serde(default = "default_true")]
    pub skip_when_ok: bool,
    #[serde(default)]
    pub force_h264: bool,
    #[serde(default)]
    pub allow_hevc: bool,
    #[serde(default)]
    pub force_aac: bool,
    #[serde(default)]
    pub keep_surround: bool,
    #[serde(default = "default_true")]
    pub add_silence_if_no_audio: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            skip_when_ok: true,
            force_h264: false,
            allow_hevc: false,
            force_aac: false,
            keep_surround: false,
            add_silence_if_no_audio: true,
        }
    }
}

/// Audio and subtitle track selection policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AudioSubtitleConfig {
    #[serde(default)]
    pub audio_lang: Vec<String>,
    #[serde(default)]
    pub audio_track: Option<usize>,
    #[serde(default)]
    pub subtitle_lang: Vec<String>,
    #[serde(default)]
    pub subtitle_track: Option<usize>,
    #[serde(default)]
    pub prefer_forced_subs: bool,
    #[serde(default)]
    pub no_subtitles: bool,
}

/// Encode quality knobs, one per backend plus the shared CRF/preset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityConfig {
    #[serde(default = "default_abr")]
    pub abr: String,
    #[serde(default = "default_crf")]
    pub crf: u32,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_vaapi_qp")]
    pub vaapi_qp: u32,
    #[serde(default = "default_qsv_quality")]
    pub qsv_quality: u32,
    #[serde(default = "default_nvenc_cq")]
    pub nvenc_cq: u32,
    #[serde(default = "default_amf_quality")]
    pub amf_quality: u32,
}

fn default_abr() -> String {
    "192k".to_string()
}
fn default_crf() -> u32 {
    20
}
fn default_preset() -> String {
    "medium".to_string()
}
fn default_vaapi_qp() -> u32 {
    22
}
fn default_qsv_quality() -> u32 {
    22
}
fn default_nvenc_cq() -> u32 {
    22
}
fn default_amf_quality() -> u32 {
    22
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            abr: default_abr(),
            crf: default_crf(),
            preset: default_preset(),
            vaapi_qp: default_vaapi_qp(),
            qsv_quality: default_qsv_quality(),
            nvenc_cq: default_nvenc_cq(),
            amf_quality: default_amf_quality(),
        }
    }
}

/// Backend selection policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub hw: HwBackend,
    #[serde(default = "default_vaapi_device")]
    pub vaapi_device: String,
}

fn default_vaapi_device() -> String {
    "/dev/dri/renderD128".to_string()
}

/// Integrity-check policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrityConfig {
    #[serde(default = "default_true")]
    pub integrity_check: bool,
    #[serde(default = "default_stable_wait")]
    pub stable_wait: u64,
    #[serde(default)]
    pub deep_check: bool,
}

fn default_stable_wait() -> u64 {
    5
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            integrity_check: true,
            stable_wait: default_stable_wait(),
            deep_check: false,
        }
    }
}

/// Worker-pool sizing and reporting cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default = "default_true")]
    pub pipeline: bool,
    #[serde(default)]
    pub encode_workers: usize,
    #[serde(default)]
    pub integrity_workers: usize,
    #[serde(default = "default_stats_period")]
    pub stats_period: u64,
    #[serde(default = "default_ui_refresh_ms")]
    pub ui_refresh_ms: u64,
}

fn default_stats_period() -> u64 {
    1
}
fn default_ui_refresh_ms() -> u64 {
    500
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline: true,
            encode_workers: 0,
            integrity_workers: 0,
            stats_period: default_stats_period(),
            ui_refresh_ms: default_ui_refresh_ms(),
        }
    }
}

/// Retry, disk-guard and output-quota safety rails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SafetyConfig {
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_sec")]
    pub retry_delay_sec: u64,
    #[serde(default)]
    pub retry_fallback_cpu: bool,
    #[serde(default)]
    pub disk_min_free_mb: u64,
    #[serde(default)]
    pub disk_min_free_tmp_mb: u64,
    #[serde(default)]
    pub max_output_mb: u64,
    #[serde(default)]
    pub max_output_ratio: f64,
    #[serde(default)]
    pub preserve_metadata: bool,
    #[serde(default)]
    pub preserve_chapters: bool,
    #[serde(default)]
    pub preserve_attachments: bool,
}

fn default_retry_delay_sec() -> u64 {
    2
}

/// Top-level configuration. Immutable once loaded; shared across workers via `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub audio_subtitle: AudioSubtitleConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub dryrun: bool,
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    /// Load configuration from a single TOML file. Missing sections/fields use defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Load the layered configuration: an optional system file underlies an optional
    /// user file, field by field, and CLI overrides are applied separately by the caller.
    /// Either path may be absent on disk; absence is not an error.
    pub fn load_layered<P: AsRef<Path>>(
        system_path: Option<P>,
        user_path: Option<P>,
    ) -> Result<Self, ConfigError> {
        let system = read_optional(system_path)?;
        let user = read_optional(user_path)?;
        let merged = match (system, user) {
            (Some(sys), Some(usr)) => merge_toml_values(sys, usr),
            (Some(sys), None) => sys,
            (None, Some(usr)) => usr,
            (None, None) => toml::Value::Table(Default::default()),
        };
        let config: Config = merged.try_into()?;
        Ok(config)
    }

    /// Apply `MKV2CAST_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("MKV2CAST_HW") {
            if let Some(hw) = parse_hw_backend(&val) {
                self.backend.hw = hw;
            }
        }
        if let Ok(val) = env::var("MKV2CAST_ENCODE_WORKERS") {
            if let Ok(n) = val.parse::<usize>() {
                self.pipeline.encode_workers = n;
            }
        }
        if let Ok(val) = env::var("MKV2CAST_INTEGRITY_WORKERS") {
            if let Ok(n) = val.parse::<usize>() {
                self.pipeline.integrity_workers = n;
            }
        }
        if let Ok(val) = env::var("MKV2CAST_CRF") {
            if let Ok(n) = val.parse::<u32>() {
                self.quality.crf = n;
            }
        }
        if let Ok(val) = env::var("MKV2CAST_SUFFIX") {
            self.output.suffix = val;
        }
        if let Ok(val) = env::var("MKV2CAST_DEBUG") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.debug = true,
                "false" | "0" | "no" => self.debug = false,
                _ => {}
            }
        }
    }

    /// Load configuration from file and apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

fn parse_hw_backend(val: &str) -> Option<HwBackend> {
    match val.to_lowercase().as_str() {
        "auto" => Some(HwBackend::Auto),
        "nvenc" => Some(HwBackend::Nvenc),
        "amf" => Some(HwBackend::Amf),
        "qsv" => Some(HwBackend::Qsv),
        "vaapi" => Some(HwBackend::Vaapi),
        "cpu" => Some(HwBackend::Cpu),
        _ => None,
    }
}

fn read_optional<P: AsRef<Path>>(path: Option<P>) -> Result<Option<toml::Value>, ConfigError> {
    let Some(path) = path else {
        return Ok(None);
    };
    match fs::read_to_string(path) {
        Ok(content) => {
            let value: toml::Value = toml::from_str(&content)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Io(e)),
    }
}

/// Deep-merge two parsed TOML tables: `override_val` wins wherever it defines a key,
/// `base` fills in everything else. Mirrors `_deep_merge_dicts` from the config this
/// system's behavior was distilled from, generalized from dynamic maps to `toml::Value`.
fn merge_toml_values(base: toml::Value, override_val: toml::Value) -> toml::Value {
    match (base, override_val) {
        (toml::Value::Table(mut base_table), toml::Value::Table(override_table)) => {
            for (key, override_entry) in override_table {
                let merged = match base_table.remove(&key) {
                    Some(base_entry) => merge_toml_values(base_entry, override_entry),
                    None => override_entry,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, override_val) => override_val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("empty TOML should parse");
        assert_eq!(config.output.suffix, ".cast");
        assert_eq!(config.output.container, Container::Mkv);
        assert!(config.scan.recursive);
        assert!(config.decision.skip_when_ok);
        assert_eq!(config.quality.crf, 20);
        assert_eq!(config.backend.hw, HwBackend::Auto);
        assert!(config.integrity.integrity_check);
        assert_eq!(config.safety.retry_attempts, 0);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[quality]
crf = 18
"#;
        let config = Config::parse_toml(toml_str).expect("partial TOML should parse");
        assert_eq!(config.quality.crf, 18);
        assert_eq!(config.quality.preset, "medium");
        assert!(config.decision.skip_when_ok);
    }

    #[test]
    fn test_layered_merge_prefers_user_over_system() {
        let sys: toml::Value = toml::from_str(
            r#"
[quality]
crf = 20
preset = "slow"
"#,
        )
        .unwrap();
        let usr: toml::Value = toml::from_str(
            r#"
[quality]
crf = 16
"#,
        )
        .unwrap();
        let merged = merge_toml_values(sys, usr);
        let config: Config = merged.try_into().unwrap();
        assert_eq!(config.quality.crf, 16);
        assert_eq!(config.quality.preset, "slow");
    }

    #[test]
    fn test_layered_merge_missing_both_yields_defaults() {
        let config = Config::load_layered::<&Path>(None, None).expect("no files is not an error");
        assert_eq!(config, Config::default());
    }

    // **Feature: configuration loading, Property 1: env overrides win over file values**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_env_override_crf_wins(file_crf in 1u32..51, override_crf in 1u32..51) {
            let toml_str = format!("[quality]\ncrf = {}\n", file_crf);
            let mut config = Config::parse_toml(&toml_str).expect("valid TOML");

            std::env::set_var("MKV2CAST_CRF", override_crf.to_string());
            config.apply_env_overrides();
            std::env::remove_var("MKV2CAST_CRF");

            prop_assert_eq!(config.quality.crf, override_crf);
        }

        #[test]
        fn prop_container_round_trips(is_mp4 in proptest::bool::ANY) {
            let toml_str = format!(
                "[output]\ncontainer = \"{}\"\n",
                if is_mp4 { "mp4" } else { "mkv" }
            );
            let config = Config::parse_toml(&toml_str).expect("valid TOML");
            let expected = if is_mp4 { Container::Mp4 } else { Container::Mkv };
            prop_assert_eq!(config.output.container, expected);
        }
    }
}

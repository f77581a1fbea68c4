//! Worker-count auto-tuning (§4.8).
//!
//! When `encode_workers` or `integrity_workers` is left at zero, derives both
//! from host facts: total RAM and logical CPU count, plus GPU class for
//! hardware backends. The floor is always 1/1 and the ceiling is always
//! bounded by CPU count.

use mkv2cast_config::{Config, HwBackend};
use sysinfo::System;

/// Resolved worker counts for a run, after auto-tuning if requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPlan {
    pub encode_workers: usize,
    pub integrity_workers: usize,
}

/// Host facts consulted by auto-tuning, gathered once per run.
#[derive(Debug, Clone, Copy)]
pub struct HostFacts {
    pub cpu_count: usize,
    pub ram_gib: usize,
    pub vram_gib: Option<usize>,
}

impl HostFacts {
    pub fn gather() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let ram_gib = (sys.total_memory() / (1024 * 1024 * 1024)).max(1) as usize;
        let cpu_count = num_cpus::get();
        Self { cpu_count, ram_gib, vram_gib: detect_vram_gib() }
    }
}

/// Best-effort VRAM detection via `nvidia-smi`; absent on non-Nvidia hosts.
fn detect_vram_gib() -> Option<usize> {
    let out = crate::process::run_with_timeout(
        "nvidia-smi",
        &["--query-gpu=memory.total", "--format=csv,noheader,nounits"],
        std::time::Duration::from_secs(2),
    )
    .ok()?;
    if !out.success {
        return None;
    }
    let mib: u64 = out.stdout.lines().next()?.trim().parse().ok()?;
    Some((mib / 1024) as usize)
}

/// Derives encode/integrity worker counts for `backend` from `cfg` and
/// `facts`, honoring any non-zero explicit configuration.
pub fn derive_plan(cfg: &Config, backend: HwBackend, facts: HostFacts) -> ConcurrencyPlan {
    let is_gpu = !matches!(backend, HwBackend::Cpu);

    let encode_workers = if cfg.pipeline.encode_workers > 0 {
        cfg.pipeline.encode_workers
    } else if is_gpu {
        derive_gpu_encode_workers(facts)
    } else {
        derive_cpu_encode_workers(facts)
    }
    .max(1)
    .min(facts.cpu_count.max(1));

    let integrity_workers = if cfg.pipeline.integrity_workers > 0 {
        cfg.pipeline.integrity_workers
    } else if is_gpu {
        encode_workers + 1
    } else {
        derive_cpu_integrity_workers(facts, encode_workers)
    }
    .max(1)
    .min(facts.cpu_count.max(1));

    ConcurrencyPlan { encode_workers, integrity_workers }
}

/// GPU backends: VRAM-tiered encode worker count.
fn derive_gpu_encode_workers(facts: HostFacts) -> usize {
    match facts.vram_gib {
        Some(vram) if vram >= 8 => 3,
        Some(vram) if vram >= 4 => 2,
        _ => 1,
    }
}

/// CPU-only backend: `max(1, min(cpu_count / 2, ram_gib / 4))`.
fn derive_cpu_encode_workers(facts: HostFacts) -> usize {
    (facts.cpu_count / 2).min(facts.ram_gib / 4).max(1)
}

/// Non-GPU integrity worker ceiling: `min(4, cpu_count / 2, encode_workers * 2)`.
fn derive_cpu_integrity_workers(facts: HostFacts, encode_workers: usize) -> usize {
    4.min(facts.cpu_count / 2).min(encode_workers * 2).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn facts(cpu_count: usize, ram_gib: usize, vram_gib: Option<usize>) -> HostFacts {
        HostFacts { cpu_count, ram_gib, vram_gib }
    }

    #[test]
    fn test_explicit_config_overrides_autotuning() {
        let mut cfg = Config::default();
        cfg.pipeline.encode_workers = 5;
        cfg.pipeline.integrity_workers = 7;
        let plan = derive_plan(&cfg, HwBackend::Cpu, facts(32, 64, None));
        assert_eq!(plan.encode_workers, 5);
        assert_eq!(plan.integrity_workers, 7);
    }

    #[test]
    fn test_gpu_backend_high_vram_uses_three_workers() {
        let cfg = Config::default();
        let plan = derive_plan(&cfg, HwBackend::Nvenc, facts(16, 32, Some(12)));
        assert_eq!(plan.encode_workers, 3);
        assert_eq!(plan.integrity_workers, 4);
    }

    #[test]
    fn test_gpu_backend_mid_vram_uses_two_workers() {
        let cfg = Config::default();
        let plan = derive_plan(&cfg, HwBackend::Vaapi, facts(8, 16, Some(4)));
        assert_eq!(plan.encode_workers, 2);
    }

    #[test]
    fn test_gpu_backend_no_vram_info_floors_to_one() {
        let cfg = Config::default();
        let plan = derive_plan(&cfg, HwBackend::Qsv, facts(4, 8, None));
        assert_eq!(plan.encode_workers, 1);
        assert_eq!(plan.integrity_workers, 2);
    }

    #[test]
    fn test_cpu_backend_low_ram_floors_to_one() {
        let cfg = Config::default();
        let plan = derive_plan(&cfg, HwBackend::Cpu, facts(32, 2, None));
        assert_eq!(plan.encode_workers, 1);
    }

    #[test]
    fn test_cpu_backend_integrity_capped_at_four() {
        let cfg = Config::default();
        let plan = derive_plan(&cfg, HwBackend::Cpu, facts(64, 128, None));
        assert_eq!(plan.integrity_workers, 4);
    }

    // **Feature: worker auto-tuning, Property: floor is always at least 1/1**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_floor_always_one(
            cpu_count in 1usize..128,
            ram_gib in 1usize..256,
            vram_gib in proptest::option::of(0usize..32),
            is_gpu in any::<bool>(),
        ) {
            let cfg = Config::default();
            let backend = if is_gpu { HwBackend::Nvenc } else { HwBackend::Cpu };
            let plan = derive_plan(&cfg, backend, facts(cpu_count, ram_gib, vram_gib));
            prop_assert!(plan.encode_workers >= 1);
            prop_assert!(plan.integrity_workers >= 1);
            prop_assert!(plan.encode_workers <= cpu_count.max(1));
            prop_assert!(plan.integrity_workers <= cpu_count.max(1));
        }
    }
}

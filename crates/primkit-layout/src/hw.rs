//! Target hardware description.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    Cpu,
    IntelGpu,
    NvidiaGpu,
    AmdGpu,
}

impl DeviceFamily {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceFamily::Cpu => "cpu",
            DeviceFamily::IntelGpu => "intel_gpu",
            DeviceFamily::NvidiaGpu => "nvidia_gpu",
            DeviceFamily::AmdGpu => "amd_gpu",
        }
    }

    pub fn is_gpu(&self) -> bool {
        !matches!(self, DeviceFamily::Cpu)
    }
}

impl FromStr for DeviceFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(DeviceFamily::Cpu),
            "intel_gpu" => Ok(DeviceFamily::IntelGpu),
            "nvidia_gpu" => Ok(DeviceFamily::NvidiaGpu),
            "amd_gpu" => Ok(DeviceFamily::AmdGpu),
            _ => Err(format!("unknown device family '{s}'")),
        }
    }
}

/// Optional device capability queried through `Engine::mayiuse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceExt {
    Fp64,
    Fp16,
    Bf16,
    Int8Dot,
    Subgroups,
    Systolic,
    Avx2,
    Avx512,
    Amx,
    Neon,
    Sve,
}

impl DeviceExt {
    pub const ALL: [DeviceExt; 11] = [
        DeviceExt::Fp64,
        DeviceExt::Fp16,
        DeviceExt::Bf16,
        DeviceExt::Int8Dot,
        DeviceExt::Subgroups,
        DeviceExt::Systolic,
        DeviceExt::Avx2,
        DeviceExt::Avx512,
        DeviceExt::Amx,
        DeviceExt::Neon,
        DeviceExt::Sve,
    ];

    pub fn bit(&self) -> u64 {
        1 << (*self as u64)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceExt::Fp64 => "fp64",
            DeviceExt::Fp16 => "fp16",
            DeviceExt::Bf16 => "bf16",
            DeviceExt::Int8Dot => "int8_dot",
            DeviceExt::Subgroups => "subgroups",
            DeviceExt::Systolic => "systolic",
            DeviceExt::Avx2 => "avx2",
            DeviceExt::Avx512 => "avx512",
            DeviceExt::Amx => "amx",
            DeviceExt::Neon => "neon",
            DeviceExt::Sve => "sve",
        }
    }
}

/// Device ISA revision plus feature bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HwDescriptor {
    pub family: DeviceFamily,
    /// ISA or architecture revision, e.g. `xe_hpc`, `sm_80`, `avx512_core`.
    pub isa: String,
    pub features: u64,
    /// Execution units (GPU) or cores (CPU).
    pub eu_count: u32,
    /// Native SIMD width in 32-bit lanes.
    pub simd: u32,
}

impl HwDescriptor {
    pub fn new(family: DeviceFamily, isa: impl Into<String>, eu_count: u32, simd: u32) -> Self {
        Self {
            family,
            isa: isa.into(),
            features: 0,
            eu_count,
            simd,
        }
    }

    pub fn with_ext(mut self, ext: DeviceExt) -> Self {
        self.features |= ext.bit();
        self
    }

    pub fn has(&self, ext: DeviceExt) -> bool {
        self.features & ext.bit() != 0
    }

    /// Deterministic identifier of ISA revision + feature bits.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}-{}-{:x}-{}x{}",
            self.family.name(),
            sanitize(&self.isa),
            self.features,
            self.eu_count,
            self.simd
        )
    }

    /// Parses the text produced by [`HwDescriptor::fingerprint`].
    pub fn from_fingerprint(s: &str) -> Result<Self, String> {
        let mut parts = s.splitn(2, '-');
        let family: DeviceFamily = parts.next().unwrap_or_default().parse()?;
        let rest = parts
            .next()
            .ok_or_else(|| format!("truncated fingerprint '{s}'"))?;
        let mut tail = rest.rsplitn(3, '-');
        let shape = tail.next().unwrap_or_default();
        let features = tail.next().unwrap_or_default();
        let isa = tail
            .next()
            .ok_or_else(|| format!("truncated fingerprint '{s}'"))?;
        let features = u64::from_str_radix(features, 16)
            .map_err(|e| format!("bad feature bits in '{s}': {e}"))?;
        let (eu, simd) = shape
            .split_once('x')
            .ok_or_else(|| format!("bad eu/simd in '{s}'"))?;
        Ok(Self {
            family,
            isa: isa.to_string(),
            features,
            eu_count: eu.parse().map_err(|_| format!("bad eu count in '{s}'"))?,
            simd: simd.parse().map_err(|_| format!("bad simd in '{s}'"))?,
        })
    }

    /// Probe the host CPU.
    pub fn host() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let mut hw = HwDescriptor::new(DeviceFamily::Cpu, host_isa(), cores, 8)
            .with_ext(DeviceExt::Fp64)
            .with_ext(DeviceExt::Fp16);
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("avx2") {
                hw = hw.with_ext(DeviceExt::Avx2);
            }
            if std::arch::is_x86_feature_detected!("avx512f")
                && std::arch::is_x86_feature_detected!("avx512bw")
            {
                hw = hw.with_ext(DeviceExt::Avx512);
                hw.simd = 16;
            }
        }
        #[cfg(target_arch = "aarch64")]
        {
            hw = hw.with_ext(DeviceExt::Neon);
            hw.simd = 4;
            if std::arch::is_aarch64_feature_detected!("sve") {
                hw = hw.with_ext(DeviceExt::Sve);
            }
            if std::arch::is_aarch64_feature_detected!("dotprod") {
                hw = hw.with_ext(DeviceExt::Int8Dot);
            }
        }
        hw
    }

    /// Built-in descriptors selectable by id (`--hw <id>`).
    pub fn preset(id: &str) -> Option<Self> {
        let hw = match id {
            "xe_hpc" => HwDescriptor::new(DeviceFamily::IntelGpu, "xe_hpc", 448, 16)
                .with_ext(DeviceExt::Fp64)
                .with_ext(DeviceExt::Fp16)
                .with_ext(DeviceExt::Bf16)
                .with_ext(DeviceExt::Int8Dot)
                .with_ext(DeviceExt::Subgroups)
                .with_ext(DeviceExt::Systolic),
            "xe_lp" => HwDescriptor::new(DeviceFamily::IntelGpu, "xe_lp", 96, 8)
                .with_ext(DeviceExt::Fp16)
                .with_ext(DeviceExt::Int8Dot)
                .with_ext(DeviceExt::Subgroups),
            "sm_80" => HwDescriptor::new(DeviceFamily::NvidiaGpu, "sm_80", 108, 32)
                .with_ext(DeviceExt::Fp64)
                .with_ext(DeviceExt::Fp16)
                .with_ext(DeviceExt::Bf16)
                .with_ext(DeviceExt::Int8Dot)
                .with_ext(DeviceExt::Subgroups),
            "gfx90a" => HwDescriptor::new(DeviceFamily::AmdGpu, "gfx90a", 104, 64)
                .with_ext(DeviceExt::Fp64)
                .with_ext(DeviceExt::Fp16)
                .with_ext(DeviceExt::Bf16)
                .with_ext(DeviceExt::Subgroups),
            "avx512_core" => HwDescriptor::new(DeviceFamily::Cpu, "avx512_core", 32, 16)
                .with_ext(DeviceExt::Fp64)
                .with_ext(DeviceExt::Fp16)
                .with_ext(DeviceExt::Avx2)
                .with_ext(DeviceExt::Avx512)
                .with_ext(DeviceExt::Int8Dot),
            _ => return None,
        };
        Some(hw)
    }
}

fn host_isa() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "x86_64"
    } else if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else {
        "generic"
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|ch| match ch {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '.' => ch,
            _ => '_',
        })
        .collect()
}

impl fmt::Display for HwDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

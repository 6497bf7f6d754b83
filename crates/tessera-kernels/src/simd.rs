//! CPU feature probing for kernel selection.
//!
//! Probed once per process; [`SimdCapability::gemm_path`] is what the GEMM
//! dispatcher actually branches on.

use std::fmt;
use std::sync::OnceLock;

/// Widest vector instruction set the CPU offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimdTier {
    Scalar,
    Neon,
    Avx2,
    Avx512,
}

impl fmt::Display for SimdTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SimdTier::Scalar => "scalar",
            SimdTier::Neon => "NEON",
            SimdTier::Avx2 => "AVX2",
            SimdTier::Avx512 => "AVX-512",
        };
        f.write_str(s)
    }
}

/// Inner loop used by `sgemm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmPath {
    Avx2Fma,
    Scalar,
}

/// Feature flags of the running CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimdCapability {
    pub avx2: bool,
    pub avx512f: bool,
    pub fma: bool,
    pub neon: bool,
}

static PROBED: OnceLock<SimdCapability> = OnceLock::new();

impl SimdCapability {
    /// Cached capabilities of this CPU.
    pub fn detect() -> &'static SimdCapability {
        PROBED.get_or_init(probe)
    }

    pub fn tier(&self) -> SimdTier {
        match (self.avx512f, self.avx2, self.neon) {
            (true, _, _) => SimdTier::Avx512,
            (false, true, _) => SimdTier::Avx2,
            (false, false, true) => SimdTier::Neon,
            _ => SimdTier::Scalar,
        }
    }

    pub fn gemm_path(&self) -> GemmPath {
        if self.avx2 && self.fma {
            GemmPath::Avx2Fma
        } else {
            GemmPath::Scalar
        }
    }
}

impl fmt::Display for SimdCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (avx2={}, avx512f={}, fma={}, neon={})",
            self.tier(),
            self.avx2,
            self.avx512f,
            self.fma,
            self.neon
        )
    }
}

#[cfg(target_arch = "x86_64")]
fn probe() -> SimdCapability {
    SimdCapability {
        avx2: is_x86_feature_detected!("avx2"),
        avx512f: is_x86_feature_detected!("avx512f"),
        fma: is_x86_feature_detected!("fma"),
        neon: false,
    }
}

// NEON is part of the AArch64 baseline.
#[cfg(target_arch = "aarch64")]
fn probe() -> SimdCapability {
    SimdCapability {
        neon: true,
        ..SimdCapability::default()
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn probe() -> SimdCapability {
    SimdCapability::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_is_cached() {
        assert!(std::ptr::eq(SimdCapability::detect(), SimdCapability::detect()));
    }

    #[test]
    fn test_tier_and_path() {
        let none = SimdCapability::default();
        assert_eq!(none.tier(), SimdTier::Scalar);
        assert_eq!(none.gemm_path(), GemmPath::Scalar);

        let avx2_only = SimdCapability { avx2: true, ..none };
        assert_eq!(avx2_only.tier(), SimdTier::Avx2);
        assert_eq!(avx2_only.gemm_path(), GemmPath::Scalar);

        let full = SimdCapability { avx2: true, avx512f: true, fma: true, neon: false };
        assert_eq!(full.tier(), SimdTier::Avx512);
        assert_eq!(full.gemm_path(), GemmPath::Avx2Fma);
        assert!(full.to_string().starts_with("AVX-512"));
    }
}

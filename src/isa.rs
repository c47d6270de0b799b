//! Vector-width tiering and CPU capability queries.
//!
//! The tier is fixed once per emitter instance and selects the register
//! family (xmm/ymm/zmm) the emitter works in. `CpuFeatures` is the external
//! capability collaborator: emitters consult it when picking between masked
//! AVX-512 paths and the insert/extract emulation used on narrower tiers.

use crate::error::EmitError;

/// SIMD register width tier. Determines the maximum element count per
/// emission and which masking strategy is available (k-registers only at
/// `Z512`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VecTier {
    /// 128-bit xmm registers.
    X128,
    /// 256-bit ymm registers.
    Y256,
    /// 512-bit zmm registers.
    Z512,
}

impl VecTier {
    /// Register width in bytes.
    #[inline]
    pub fn vec_bytes(&self) -> usize {
        match self {
            VecTier::X128 => 16,
            VecTier::Y256 => 32,
            VecTier::Z512 => 64,
        }
    }

    /// Number of 32-bit lanes.
    #[inline]
    pub fn lanes(&self) -> usize {
        self.vec_bytes() / 4
    }
}

/// Instruction-extension availability on the host CPU.
///
/// Detected once by the caller and passed by value to each emitter
/// constructor, so tests can force any combination regardless of the
/// machine the tests run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    /// The encoding floor: every emitted sequence is VEX or EVEX.
    pub avx: bool,
    pub avx2: bool,
    /// AVX-512 F/CD/VL/BW/DQ (the skylake-server baseline).
    pub avx512_core: bool,
    /// Native f32 -> bf16 rounding (VCVTNEPS2BF16).
    pub avx512_bf16: bool,
}

impl CpuFeatures {
    /// Query the hosting CPU.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            let avx512_core = std::is_x86_feature_detected!("avx512f")
                && std::is_x86_feature_detected!("avx512vl")
                && std::is_x86_feature_detected!("avx512bw")
                && std::is_x86_feature_detected!("avx512dq");
            return CpuFeatures {
                avx: std::is_x86_feature_detected!("avx"),
                avx2: std::is_x86_feature_detected!("avx2"),
                avx512_core,
                avx512_bf16: avx512_core && std::is_x86_feature_detected!("avx512bf16"),
            };
        }
        #[cfg(not(target_arch = "x86_64"))]
        CpuFeatures::none()
    }

    /// All extensions off. No tier is usable; every emitter constructor
    /// fails on such a host.
    pub fn none() -> Self {
        CpuFeatures {
            avx: false,
            avx2: false,
            avx512_core: false,
            avx512_bf16: false,
        }
    }

    /// AVX only: 128-bit emission.
    pub fn avx_only() -> Self {
        CpuFeatures {
            avx: true,
            avx2: false,
            avx512_core: false,
            avx512_bf16: false,
        }
    }

    /// AVX2 without AVX-512.
    pub fn avx2_only() -> Self {
        CpuFeatures {
            avx: true,
            avx2: true,
            avx512_core: false,
            avx512_bf16: false,
        }
    }

    /// Full AVX-512 core set, optionally with native bf16 rounding.
    pub fn avx512(bf16: bool) -> Self {
        CpuFeatures {
            avx: true,
            avx2: true,
            avx512_core: true,
            avx512_bf16: bf16,
        }
    }

    /// Widest tier this CPU supports.
    pub fn tier(&self) -> VecTier {
        if self.avx512_core {
            VecTier::Z512
        } else if self.avx2 {
            VecTier::Y256
        } else {
            VecTier::X128
        }
    }

    /// Reject tiers the host cannot execute.
    pub fn check_tier(&self, tier: VecTier) -> Result<(), EmitError> {
        match tier {
            VecTier::Z512 if !self.avx512_core => {
                Err(EmitError::UnsupportedIsa("512-bit tier requires avx512_core"))
            }
            VecTier::Y256 if !self.avx2 => {
                Err(EmitError::UnsupportedIsa("256-bit tier requires avx2"))
            }
            VecTier::X128 if !self.avx => {
                Err(EmitError::UnsupportedIsa("128-bit tier requires avx"))
            }
            _ => Ok(()),
        }
    }
}

/// Number of scratch GPRs a load/store needs for k-mask materialization.
///
/// On AVX-512 a partial transfer (any byte count that is not a full
/// xmm/ymm/zmm) builds its mask in a GPR first; a tail fill does too.
pub(crate) fn mask_gpr_count(caps: &CpuFeatures, byte_size: usize, is_fill: bool) -> usize {
    if caps.avx512_core && (!matches!(byte_size, 16 | 32 | 64) || is_fill) {
        1
    } else {
        0
    }
}

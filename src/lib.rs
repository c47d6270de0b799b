//! JIT emitters for vectorized memory transfers between numeric precisions.
//!
//! The crate generates x86-64 machine code (VEX/EVEX encodings, AVX as the
//! baseline) that moves N elements between memory and SIMD registers while
//! converting between storage formats: f32, i32, bf16, i16/u16, i8/u8.
//! Sub-dword elements travel through sign/zero extension on the way in and
//! saturating or truncating narrowing on the way out, so a single kernel
//! covers both the bulk body and the tail of a tensor row.
//!
//! [`LoadEmitter`] and [`StoreEmitter`] produce the memory-facing halves;
//! [`ConvertEmitter`] converts whole registers in place. [`TransferKernel`]
//! and [`ConvertKernel`] wire them into callable functions, compiled into
//! executable pages on unix hosts.
//!
//! Emitters are single-threaded value objects: build one per kernel, on the
//! thread doing the compilation. The compiled artifacts are `Send + Sync`
//! and may be called concurrently.

mod bf16;
mod convert;
mod error;
mod isa;
mod kernel;
mod load;
mod precision;
mod regs;
mod store;
mod table;

pub use convert::ConvertEmitter;
pub use error::EmitError;
pub use isa::{CpuFeatures, VecTier};
#[cfg(all(unix, target_arch = "x86_64"))]
pub use kernel::CompiledKernel;
pub use kernel::{ConvertKernel, TransferFn, TransferKernel};
pub use load::{FillValue, LoadEmitter, LoadKey};
pub use precision::Precision;
pub use regs::ScratchRegs;
pub use store::{RoundMode, StoreEmitter, StoreKey};

use iced_x86::code_asm::CodeAssembler;

/// Common surface of the code-generating emitters.
///
/// `aux_gprs_count` / `aux_vecs_count` declare how many scratch registers
/// an emission call will clobber; callers allocate at least that many into
/// the [`ScratchRegs`] they pass. `emit_data` appends the emitter's
/// constant table after the instruction stream and must run exactly once,
/// after all emission calls.
pub trait Emitter {
    fn aux_gprs_count(&self) -> usize;
    fn aux_vecs_count(&self) -> usize;
    fn emit_data(&mut self, asm: &mut CodeAssembler) -> Result<(), EmitError>;
}

pub(crate) const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a over `bytes`, continuing from `state`. Stable across processes,
/// unlike the std hasher, so cache keys can be persisted.
pub(crate) fn fnv1a(state: u64, bytes: &[u8]) -> u64 {
    const PRIME: u64 = 0x100_0000_01b3;
    let mut h = state;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

//! Register index mapping and per-call scratch allocation.
//!
//! Emitters receive plain register indices from the kernel builder and map
//! them onto `iced-x86` register values here. The builder owns register
//! allocation; emitters only borrow a `ScratchRegs` for the duration of one
//! emission call.

use iced_x86::code_asm::*;

use crate::error::EmitError;

/// Map a vector register index to its xmm view.
pub(crate) fn xmm(idx: u8) -> Result<AsmRegisterXmm, EmitError> {
    const REGS: [AsmRegisterXmm; 32] = [
        xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
        xmm14, xmm15, xmm16, xmm17, xmm18, xmm19, xmm20, xmm21, xmm22, xmm23, xmm24, xmm25, xmm26,
        xmm27, xmm28, xmm29, xmm30, xmm31,
    ];
    REGS.get(idx as usize)
        .copied()
        .ok_or(EmitError::BadRegister(idx))
}

/// Map a vector register index to its ymm view.
pub(crate) fn ymm(idx: u8) -> Result<AsmRegisterYmm, EmitError> {
    const REGS: [AsmRegisterYmm; 32] = [
        ymm0, ymm1, ymm2, ymm3, ymm4, ymm5, ymm6, ymm7, ymm8, ymm9, ymm10, ymm11, ymm12, ymm13,
        ymm14, ymm15, ymm16, ymm17, ymm18, ymm19, ymm20, ymm21, ymm22, ymm23, ymm24, ymm25, ymm26,
        ymm27, ymm28, ymm29, ymm30, ymm31,
    ];
    REGS.get(idx as usize)
        .copied()
        .ok_or(EmitError::BadRegister(idx))
}

/// Map a vector register index to its zmm view.
pub(crate) fn zmm(idx: u8) -> Result<AsmRegisterZmm, EmitError> {
    const REGS: [AsmRegisterZmm; 32] = [
        zmm0, zmm1, zmm2, zmm3, zmm4, zmm5, zmm6, zmm7, zmm8, zmm9, zmm10, zmm11, zmm12, zmm13,
        zmm14, zmm15, zmm16, zmm17, zmm18, zmm19, zmm20, zmm21, zmm22, zmm23, zmm24, zmm25, zmm26,
        zmm27, zmm28, zmm29, zmm30, zmm31,
    ];
    REGS.get(idx as usize)
        .copied()
        .ok_or(EmitError::BadRegister(idx))
}

/// Map a GPR index (standard x86 encoding order) to its 64-bit register.
pub(crate) fn gpr64(idx: u8) -> Result<AsmRegister64, EmitError> {
    const REGS: [AsmRegister64; 16] = [
        rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
    ];
    REGS.get(idx as usize)
        .copied()
        .ok_or(EmitError::BadRegister(idx))
}

/// Map a GPR index to its 32-bit register.
pub(crate) fn gpr32(idx: u8) -> Result<AsmRegister32, EmitError> {
    const REGS: [AsmRegister32; 16] = [
        eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
    ];
    REGS.get(idx as usize)
        .copied()
        .ok_or(EmitError::BadRegister(idx))
}

/// Scratch registers lent to one emission call.
///
/// The kernel builder allocates these; the emitter never owns them past the
/// call. Conventions:
/// - `gprs[0]` is clobbered when a mask has to be materialized for a
///   k-register load/store;
/// - the last GPR holds the constant-table base when the emitter uses one;
/// - `vecs` are clobbered freely (conversion intermediates, zero clamps,
///   bf16 rounding scratch).
#[derive(Debug, Clone, Copy, Default)]
pub struct ScratchRegs<'a> {
    pub gprs: &'a [u8],
    pub vecs: &'a [u8],
}

impl<'a> ScratchRegs<'a> {
    pub fn new(gprs: &'a [u8], vecs: &'a [u8]) -> Self {
        ScratchRegs { gprs, vecs }
    }

    /// Validate that the caller passed what `emitter` declared it needs.
    pub(crate) fn check(
        &self,
        emitter: &'static str,
        need_gprs: usize,
        need_vecs: usize,
    ) -> Result<(), EmitError> {
        if self.gprs.len() < need_gprs {
            return Err(EmitError::ScratchShortage {
                emitter,
                kind: "gpr",
                need: need_gprs,
                got: self.gprs.len(),
            });
        }
        if self.vecs.len() < need_vecs {
            return Err(EmitError::ScratchShortage {
                emitter,
                kind: "vec",
                need: need_vecs,
                got: self.vecs.len(),
            });
        }
        Ok(())
    }

    /// GPR used for mask materialization.
    pub(crate) fn mask_gpr(&self) -> u8 {
        self.gprs[0]
    }

    /// GPR holding the constant-table base (by convention the last one).
    pub(crate) fn table_gpr(&self) -> u8 {
        self.gprs[self.gprs.len() - 1]
    }
}

//! Software f32 -> bf16 conversion with round-to-nearest-even.
//!
//! Used when the CPU lacks VCVTNEPS2BF16. The rounding bias is computed per
//! lane as `((x >> 16) & 1) + 0x7fff`, added to the raw bits, then the top
//! halves are packed into the low part of the output register.

use iced_x86::code_asm::*;

use crate::error::EmitError;
use crate::isa::VecTier;
use crate::regs;
use crate::table::ConstTable;

pub(crate) struct Bf16Emu {
    tier: VecTier,
}

impl Bf16Emu {
    pub(crate) fn new(tier: VecTier) -> Self {
        Bf16Emu { tier }
    }

    /// Constants the emulation reads from the owner's table.
    pub(crate) fn register_table_entries(table: &mut ConstTable) {
        table.push("bf16_one", 0x0000_0001, true);
        table.push("bf16_even", 0x0000_7fff, true);
    }

    /// Convert the f32 lanes of `in_vec` into bf16 words in the low half of
    /// `out_vec`. `aux_vec` is clobbered; it must differ from both. The
    /// table base must already be loaded into `base_gpr`.
    pub(crate) fn emit(
        &self,
        asm: &mut CodeAssembler,
        table: &ConstTable,
        base_gpr: u8,
        in_vec: u8,
        out_vec: u8,
        aux_vec: u8,
    ) -> Result<(), EmitError> {
        let base = regs::gpr64(base_gpr)?;
        let one = table.offset("bf16_one")?;
        let even = table.offset("bf16_even")?;

        match self.tier {
            VecTier::Z512 => {
                let input = regs::zmm(in_vec)?;
                let aux = regs::zmm(aux_vec)?;
                asm.vpsrld(aux, input, 16)?;
                asm.vpandd(aux, aux, zmmword_ptr(base + one))?;
                asm.vpaddd(aux, aux, zmmword_ptr(base + even))?;
                asm.vpaddd(aux, aux, input)?;
                asm.vpsrld(aux, aux, 16)?;
                asm.vpmovdw(regs::ymm(out_vec)?, aux)?;
            }
            VecTier::Y256 => {
                let input = regs::ymm(in_vec)?;
                let aux = regs::ymm(aux_vec)?;
                let out = regs::ymm(out_vec)?;
                asm.vpsrld(aux, input, 16)?;
                asm.vpand(aux, aux, ymmword_ptr(base + one))?;
                asm.vpaddd(aux, aux, ymmword_ptr(base + even))?;
                asm.vpaddd(aux, aux, input)?;
                asm.vpsrld(aux, aux, 16)?;
                // Words land in dword lanes; pack and fix the qword order.
                asm.vpackusdw(out, aux, aux)?;
                asm.vpermq(out, out, 0x08)?;
            }
            VecTier::X128 => {
                let input = regs::xmm(in_vec)?;
                let aux = regs::xmm(aux_vec)?;
                let out = regs::xmm(out_vec)?;
                asm.vpsrld(aux, input, 16)?;
                asm.vpand(aux, aux, xmmword_ptr(base + one))?;
                asm.vpaddd(aux, aux, xmmword_ptr(base + even))?;
                asm.vpaddd(aux, aux, input)?;
                asm.vpsrld(aux, aux, 16)?;
                asm.vpackusdw(out, aux, aux)?;
            }
        }
        Ok(())
    }
}

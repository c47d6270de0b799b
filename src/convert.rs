//! Register-to-register precision conversion.
//!
//! Converts a full vector of elements between {f32, i32, bf16, i8, u8}
//! without touching memory: widen to 32-bit lanes, convert across the
//! float/int domain boundary if needed, then narrow to the output format.
//! Two flavors differ in overflow handling: the saturating emitter clamps
//! to the output range (129 -> 127 as i8) while the truncating emitter
//! keeps the low bits (129 -> -127 as i8) and converts f32 -> i32 by
//! rounding toward zero.

use iced_x86::code_asm::*;

use crate::bf16::Bf16Emu;
use crate::error::EmitError;
use crate::isa::{CpuFeatures, VecTier};
use crate::precision::Precision;
use crate::regs::{self, ScratchRegs};
use crate::store::RoundMode;
use crate::table::ConstTable;
use crate::Emitter;

fn supported(prc: Precision) -> bool {
    matches!(
        prc,
        Precision::F32 | Precision::I32 | Precision::Bf16 | Precision::I8 | Precision::U8
    )
}

pub struct ConvertEmitter {
    tier: VecTier,
    caps: CpuFeatures,
    input: Precision,
    output: Precision,
    mode: RoundMode,
    table: ConstTable,
    bf16_emu: Option<Bf16Emu>,
}

impl ConvertEmitter {
    pub fn new(
        tier: VecTier,
        caps: CpuFeatures,
        input: Precision,
        output: Precision,
        mode: RoundMode,
    ) -> Result<Self, EmitError> {
        caps.check_tier(tier)?;
        if !supported(input) || !supported(output) {
            return Err(EmitError::UnsupportedPrecision {
                emitter: "convert",
                src: input,
                dst: output,
            });
        }

        let mut table = ConstTable::new(tier.vec_bytes());
        if mode == RoundMode::Truncate
            && matches!(output, Precision::I8 | Precision::U8)
            && input != output
            && !Self::i8_u8_pair(input, output)
            && !caps.avx512_core
        {
            table.push("mask_truncation_byte", 0x0000_00ff, true);
        }
        let bf16_emu = if output == Precision::Bf16
            && input != Precision::Bf16
            && !caps.avx512_bf16
        {
            Bf16Emu::register_table_entries(&mut table);
            Some(Bf16Emu::new(tier))
        } else {
            None
        };
        log::trace!("convert emitter: {input} -> {output}, tier={tier:?}, {mode:?}");
        Ok(ConvertEmitter {
            tier,
            caps,
            input,
            output,
            mode,
            table,
            bf16_emu,
        })
    }

    /// Same bits, different sign interpretation. Truncation makes this a
    /// plain register move.
    fn i8_u8_pair(a: Precision, b: Precision) -> bool {
        matches!(
            (a, b),
            (Precision::I8, Precision::U8) | (Precision::U8, Precision::I8)
        )
    }

    fn mov_vec(&self, asm: &mut CodeAssembler, dst: u8, src: u8) -> Result<(), EmitError> {
        match self.tier {
            VecTier::X128 => asm.vmovdqu(regs::xmm(dst)?, regs::xmm(src)?)?,
            VecTier::Y256 => asm.vmovdqu(regs::ymm(dst)?, regs::ymm(src)?)?,
            VecTier::Z512 => asm.vmovdqu64(regs::zmm(dst)?, regs::zmm(src)?)?,
        }
        Ok(())
    }

    /// Convert the lanes of `in_vec` into `out_vec`. `in_vec` is preserved
    /// unless it aliases `out_vec`.
    pub fn emit(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        in_vec: u8,
        out_vec: u8,
    ) -> Result<(), EmitError> {
        regs.check("convert", self.aux_gprs_count(), self.aux_vecs_count())?;
        if !self.table.is_empty() {
            self.table.load_base(asm, regs.table_gpr())?;
        }

        if self.input == self.output
            || (self.mode == RoundMode::Truncate && Self::i8_u8_pair(self.input, self.output))
        {
            if in_vec != out_vec {
                self.mov_vec(asm, out_vec, in_vec)?;
            }
            return Ok(());
        }

        // Widen sub-dword inputs into 32-bit lanes of the output register.
        let mut data = in_vec;
        match self.input {
            Precision::F32 | Precision::I32 => {}
            Precision::I8 => {
                self.extend_bytes(asm, out_vec, in_vec, true)?;
                data = out_vec;
            }
            Precision::U8 => {
                self.extend_bytes(asm, out_vec, in_vec, false)?;
                data = out_vec;
            }
            Precision::Bf16 => {
                match self.tier {
                    VecTier::Z512 => {
                        let out = regs::zmm(out_vec)?;
                        asm.vpmovzxwd(out, regs::ymm(in_vec)?)?;
                        asm.vpslld(out, out, 16)?;
                    }
                    VecTier::Y256 => {
                        let out = regs::ymm(out_vec)?;
                        asm.vpmovzxwd(out, regs::xmm(in_vec)?)?;
                        asm.vpslld(out, out, 16)?;
                    }
                    VecTier::X128 => {
                        let out = regs::xmm(out_vec)?;
                        asm.vpmovzxwd(out, regs::xmm(in_vec)?)?;
                        asm.vpslld(out, out, 16)?;
                    }
                }
                data = out_vec;
            }
            _ => {
                return Err(EmitError::UnsupportedPrecision {
                    emitter: "convert",
                    src: self.input,
                    dst: self.output,
                })
            }
        }

        // Cross the float/int domain boundary on the widened lanes.
        let widened_float = self.input.is_float();
        let target_float = self.output.is_float();
        if widened_float && !target_float {
            match (self.tier, self.mode) {
                (VecTier::X128, RoundMode::Saturate) => {
                    asm.vcvtps2dq(regs::xmm(out_vec)?, regs::xmm(data)?)?
                }
                (VecTier::X128, RoundMode::Truncate) => {
                    asm.vcvttps2dq(regs::xmm(out_vec)?, regs::xmm(data)?)?
                }
                (VecTier::Y256, RoundMode::Saturate) => {
                    asm.vcvtps2dq(regs::ymm(out_vec)?, regs::ymm(data)?)?
                }
                (VecTier::Y256, RoundMode::Truncate) => {
                    asm.vcvttps2dq(regs::ymm(out_vec)?, regs::ymm(data)?)?
                }
                (VecTier::Z512, RoundMode::Saturate) => {
                    asm.vcvtps2dq(regs::zmm(out_vec)?, regs::zmm(data)?)?
                }
                (VecTier::Z512, RoundMode::Truncate) => {
                    asm.vcvttps2dq(regs::zmm(out_vec)?, regs::zmm(data)?)?
                }
            }
            data = out_vec;
        } else if !widened_float && target_float {
            match self.tier {
                VecTier::X128 => asm.vcvtdq2ps(regs::xmm(out_vec)?, regs::xmm(data)?)?,
                VecTier::Y256 => asm.vcvtdq2ps(regs::ymm(out_vec)?, regs::ymm(data)?)?,
                VecTier::Z512 => asm.vcvtdq2ps(regs::zmm(out_vec)?, regs::zmm(data)?)?,
            }
            data = out_vec;
        }

        // Narrow to the output format.
        match self.output {
            Precision::F32 | Precision::I32 => {
                // Already in place unless the whole conversion was a widen-only
                // path starting and ending in different registers.
                if data != out_vec {
                    self.mov_vec(asm, out_vec, data)?;
                }
            }
            Precision::I8 => self.dword_to_int8(asm, regs, data, out_vec, true)?,
            Precision::U8 => self.dword_to_int8(asm, regs, data, out_vec, false)?,
            Precision::Bf16 => self.float_to_bfloat(asm, regs, data, out_vec)?,
            _ => {
                return Err(EmitError::UnsupportedPrecision {
                    emitter: "convert",
                    src: self.input,
                    dst: self.output,
                })
            }
        }
        Ok(())
    }

    fn extend_bytes(
        &self,
        asm: &mut CodeAssembler,
        dst: u8,
        src: u8,
        is_signed: bool,
    ) -> Result<(), EmitError> {
        let src_xmm = regs::xmm(src)?;
        match self.tier {
            VecTier::Z512 => {
                let d = regs::zmm(dst)?;
                if is_signed {
                    asm.vpmovsxbd(d, src_xmm)?;
                } else {
                    asm.vpmovzxbd(d, src_xmm)?;
                }
            }
            VecTier::Y256 => {
                let d = regs::ymm(dst)?;
                if is_signed {
                    asm.vpmovsxbd(d, src_xmm)?;
                } else {
                    asm.vpmovzxbd(d, src_xmm)?;
                }
            }
            VecTier::X128 => {
                let d = regs::xmm(dst)?;
                if is_signed {
                    asm.vpmovsxbd(d, src_xmm)?;
                } else {
                    asm.vpmovzxbd(d, src_xmm)?;
                }
            }
        }
        Ok(())
    }

    /// Narrow i32 lanes to bytes in the low part of `out`.
    fn dword_to_int8(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        data: u8,
        out: u8,
        is_signed: bool,
    ) -> Result<(), EmitError> {
        if self.mode == RoundMode::Truncate {
            if self.caps.avx512_core {
                match self.tier {
                    VecTier::Z512 => asm.vpmovdb(regs::xmm(out)?, regs::zmm(data)?)?,
                    VecTier::Y256 => asm.vpmovdb(regs::xmm(out)?, regs::ymm(data)?)?,
                    VecTier::X128 => asm.vpmovdb(regs::xmm(out)?, regs::xmm(data)?)?,
                }
            } else {
                if data != out {
                    self.mov_vec(asm, out, data)?;
                }
                let base = regs::gpr64(regs.table_gpr())?;
                let off = self.table.offset("mask_truncation_byte")?;
                match self.tier {
                    VecTier::Y256 => {
                        let o = regs::ymm(out)?;
                        asm.vpand(o, o, ymmword_ptr(base + off))?;
                        asm.vpackssdw(o, o, o)?;
                        asm.vpermq(o, o, 0x08)?;
                        asm.vpackuswb(o, o, o)?;
                    }
                    _ => {
                        let o = regs::xmm(out)?;
                        asm.vpand(o, o, xmmword_ptr(base + off))?;
                        asm.vpackssdw(o, o, o)?;
                        asm.vpackuswb(o, o, o)?;
                    }
                }
            }
            return Ok(());
        }

        // Saturating.
        if self.caps.avx512_core {
            if is_signed {
                match self.tier {
                    VecTier::Z512 => asm.vpmovsdb(regs::xmm(out)?, regs::zmm(data)?)?,
                    VecTier::Y256 => asm.vpmovsdb(regs::xmm(out)?, regs::ymm(data)?)?,
                    VecTier::X128 => asm.vpmovsdb(regs::xmm(out)?, regs::xmm(data)?)?,
                }
            } else {
                let zero = regs
                    .vecs
                    .iter()
                    .copied()
                    .find(|v| *v != data && *v != out)
                    .ok_or(EmitError::ScratchShortage {
                        emitter: "convert",
                        kind: "vec",
                        need: 1,
                        got: regs.vecs.len(),
                    })?;
                match self.tier {
                    VecTier::Z512 => {
                        let z = regs::zmm(zero)?;
                        let o = regs::zmm(out)?;
                        asm.vpxord(z, z, z)?;
                        asm.vpmaxsd(o, regs::zmm(data)?, z)?;
                        asm.vpmovusdb(regs::xmm(out)?, o)?;
                    }
                    VecTier::Y256 => {
                        let z = regs::ymm(zero)?;
                        let o = regs::ymm(out)?;
                        asm.vpxor(z, z, z)?;
                        asm.vpmaxsd(o, regs::ymm(data)?, z)?;
                        asm.vpmovusdb(regs::xmm(out)?, o)?;
                    }
                    VecTier::X128 => {
                        let z = regs::xmm(zero)?;
                        let o = regs::xmm(out)?;
                        asm.vpxor(z, z, z)?;
                        asm.vpmaxsd(o, regs::xmm(data)?, z)?;
                        asm.vpmovusdb(o, o)?;
                    }
                }
            }
        } else {
            if data != out {
                self.mov_vec(asm, out, data)?;
            }
            match self.tier {
                VecTier::Y256 => {
                    let o = regs::ymm(out)?;
                    if is_signed {
                        asm.vpackssdw(o, o, o)?;
                    } else {
                        asm.vpackusdw(o, o, o)?;
                    }
                    asm.vpermq(o, o, 0x08)?;
                    if is_signed {
                        asm.vpacksswb(o, o, o)?;
                    } else {
                        asm.vpackuswb(o, o, o)?;
                    }
                }
                _ => {
                    let o = regs::xmm(out)?;
                    if is_signed {
                        asm.vpackssdw(o, o, o)?;
                        asm.vpacksswb(o, o, o)?;
                    } else {
                        asm.vpackusdw(o, o, o)?;
                        asm.vpackuswb(o, o, o)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Round f32 lanes to bf16 words in the low part of `out`.
    fn float_to_bfloat(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        data: u8,
        out: u8,
    ) -> Result<(), EmitError> {
        if self.caps.avx512_bf16 {
            match self.tier {
                VecTier::Z512 => asm.vcvtneps2bf16(regs::ymm(out)?, regs::zmm(data)?)?,
                VecTier::Y256 => asm.vcvtneps2bf16(regs::xmm(out)?, regs::ymm(data)?)?,
                VecTier::X128 => asm.vcvtneps2bf16(regs::xmm(out)?, regs::xmm(data)?)?,
            }
            return Ok(());
        }
        let emu = self
            .bf16_emu
            .as_ref()
            .ok_or(EmitError::UnsupportedIsa("bf16 emulation not prepared"))?;
        let aux = regs
            .vecs
            .iter()
            .copied()
            .find(|v| *v != data && *v != out)
            .ok_or(EmitError::ScratchShortage {
                emitter: "convert",
                kind: "vec",
                need: 1,
                got: regs.vecs.len(),
            })?;
        emu.emit(asm, &self.table, regs.table_gpr(), data, out, aux)
    }
}

impl Emitter for ConvertEmitter {
    fn aux_gprs_count(&self) -> usize {
        if self.table.is_empty() {
            0
        } else {
            1
        }
    }

    fn aux_vecs_count(&self) -> usize {
        let mut count = 0;
        if self.caps.avx512_core
            && self.mode == RoundMode::Saturate
            && self.output == Precision::U8
            && self.input != self.output
        {
            count += 1;
        }
        if self.bf16_emu.is_some() {
            count += 1;
        }
        count
    }

    fn emit_data(&mut self, asm: &mut CodeAssembler) -> Result<(), EmitError> {
        self.table.emit_data(asm)
    }
}

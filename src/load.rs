//! Vectorized load emitter.
//!
//! Reads N elements of a source precision from memory into a vector
//! register, widening sub-dword elements to 32-bit lanes (sign- or
//! zero-extended by source signedness, bf16 by zero-extend + 16-bit shift)
//! and applying a final i32<->f32 convert when the destination
//! representation differs. Lanes beyond N can optionally be filled with a
//! named constant.
//!
//! Instruction selection is by exact byte count: full-width moves for
//! 16/32/64 bytes, a dynamically built k-mask on AVX-512 for everything
//! else, and a byte/word/dword insert sequence on narrower tiers.

use iced_x86::code_asm::*;

use crate::error::EmitError;
use crate::isa::{mask_gpr_count, CpuFeatures, VecTier};
use crate::precision::Precision;
use crate::regs::{self, ScratchRegs};
use crate::table::ConstTable;
use crate::Emitter;

/// Constant blended into the lanes past the requested element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillValue {
    Zero,
    IntOne,
    FloatOne,
    Int32Min,
    FloatMin,
    Int32Max,
    FloatMax,
}

impl FillValue {
    pub(crate) fn key(&self) -> &'static str {
        match self {
            FillValue::Zero => "zero",
            FillValue::IntOne => "int_one",
            FillValue::FloatOne => "float_one",
            FillValue::Int32Min => "int32_min",
            FillValue::FloatMin => "float_min",
            FillValue::Int32Max => "int32_max",
            FillValue::FloatMax => "float_max",
        }
    }

    pub(crate) fn bits(&self) -> u32 {
        match self {
            FillValue::Zero => 0x0000_0000,
            FillValue::IntOne => 0x0000_0001,
            FillValue::FloatOne => 0x3f80_0000,
            FillValue::Int32Min => 0xcf00_0000,
            FillValue::FloatMin => 0xff7f_ffff,
            FillValue::Int32Max => 0x4eff_ffff,
            FillValue::FloatMax => 0x7f7f_ffff,
        }
    }
}

/// Cache key for deduplicating load emitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadKey {
    pub src: Precision,
    pub dst: Precision,
    pub num: usize,
    pub fill: Option<FillValue>,
}

impl LoadKey {
    /// Process-stable 64-bit hash over exactly the key fields.
    pub fn stable_hash(&self) -> u64 {
        let mut h = crate::fnv1a(crate::FNV_OFFSET, b"jit_load_emitter");
        h = crate::fnv1a(h, &[self.src as u8, self.dst as u8]);
        h = crate::fnv1a(h, &(self.num as u64).to_le_bytes());
        h = crate::fnv1a(
            h,
            &[
                self.fill.is_some() as u8,
                self.fill.map(|f| f as u8).unwrap_or(0),
            ],
        );
        h
    }
}

pub struct LoadEmitter {
    tier: VecTier,
    caps: CpuFeatures,
    src_prc: Precision,
    dst_prc: Precision,
    load_num: usize,
    /// Bytes read from memory: `load_num * src_prc.size()`.
    load_size: usize,
    fill: Option<FillValue>,
    table: ConstTable,
}

impl LoadEmitter {
    pub fn new(
        tier: VecTier,
        caps: CpuFeatures,
        src_prc: Precision,
        dst_prc: Precision,
        load_num: usize,
        fill: Option<FillValue>,
    ) -> Result<Self, EmitError> {
        caps.check_tier(tier)?;
        let matched = dst_prc == src_prc
            || dst_prc == Precision::F32
            || dst_prc == Precision::I32;
        if !matched {
            return Err(EmitError::UnsupportedPrecision {
                emitter: "load",
                src: src_prc,
                dst: dst_prc,
            });
        }
        if load_num > tier.vec_bytes() / dst_prc.size() {
            return Err(EmitError::UnexpectedNum {
                emitter: "load",
                num: load_num,
                ctx: "elements to load",
            });
        }
        let mut table = ConstTable::new(tier.vec_bytes());
        if let Some(f) = fill {
            table.push(f.key(), f.bits(), true);
        }
        log::trace!("load emitter: {src_prc} -> {dst_prc}, n={load_num}, tier={tier:?}");
        Ok(LoadEmitter {
            tier,
            caps,
            src_prc,
            dst_prc,
            load_num,
            load_size: load_num * src_prc.size(),
            fill,
            table,
        })
    }

    pub fn key(&self) -> LoadKey {
        LoadKey {
            src: self.src_prc,
            dst: self.dst_prc,
            num: self.load_num,
            fill: self.fill,
        }
    }

    /// Emit the load of `load_num` elements from `[gpr(src_gpr) + offset]`
    /// into vector register `out_vec`.
    pub fn emit(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        src_gpr: u8,
        offset: i32,
        out_vec: u8,
    ) -> Result<(), EmitError> {
        regs.check("load", self.aux_gprs_count(), self.aux_vecs_count())?;
        if self.fill.is_some() {
            self.table.load_base(asm, regs.table_gpr())?;
        }

        let reg = regs::gpr64(src_gpr)?;
        if self.src_prc == self.dst_prc {
            self.load_bytes(asm, regs, self.tier, out_vec, reg, offset, self.load_size)?;
        } else {
            match self.src_prc {
                Precision::F32 | Precision::I32 => {
                    self.load_bytes(asm, regs, self.tier, out_vec, reg, offset, self.load_size)?;
                }
                Precision::I8 => {
                    self.load_bytes_to_dword_extension(
                        asm, regs, self.tier, out_vec, reg, offset, true, self.load_size,
                    )?;
                }
                Precision::U8 => {
                    self.load_bytes_to_dword_extension(
                        asm, regs, self.tier, out_vec, reg, offset, false, self.load_size,
                    )?;
                }
                Precision::I16 => {
                    self.load_words_to_dword_extension(
                        asm, regs, self.tier, out_vec, reg, offset, false, true, self.load_size,
                    )?;
                }
                Precision::U16 => {
                    self.load_words_to_dword_extension(
                        asm, regs, self.tier, out_vec, reg, offset, false, false, self.load_size,
                    )?;
                }
                Precision::Bf16 => {
                    self.load_words_to_dword_extension(
                        asm, regs, self.tier, out_vec, reg, offset, true, false, self.load_size,
                    )?;
                }
            }
        }

        // Post convert between the i32 and f32 lane representations. The
        // bf16 path is already bit-compatible with f32 after the shift.
        if self.src_prc != self.dst_prc {
            match self.dst_prc {
                Precision::F32 => {
                    if self.src_prc != Precision::F32 && self.src_prc != Precision::Bf16 {
                        self.cvt_dq2ps(asm, out_vec)?;
                    }
                }
                Precision::I32 => {
                    if self.src_prc == Precision::F32 || self.src_prc == Precision::Bf16 {
                        self.cvt_ps2dq(asm, out_vec)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn cvt_dq2ps(&self, asm: &mut CodeAssembler, vec: u8) -> Result<(), EmitError> {
        match self.tier {
            VecTier::X128 => asm.vcvtdq2ps(regs::xmm(vec)?, regs::xmm(vec)?)?,
            VecTier::Y256 => asm.vcvtdq2ps(regs::ymm(vec)?, regs::ymm(vec)?)?,
            VecTier::Z512 => asm.vcvtdq2ps(regs::zmm(vec)?, regs::zmm(vec)?)?,
        }
        Ok(())
    }

    fn cvt_ps2dq(&self, asm: &mut CodeAssembler, vec: u8) -> Result<(), EmitError> {
        match self.tier {
            VecTier::X128 => asm.vcvtps2dq(regs::xmm(vec)?, regs::xmm(vec)?)?,
            VecTier::Y256 => asm.vcvtps2dq(regs::ymm(vec)?, regs::ymm(vec)?)?,
            VecTier::Z512 => asm.vcvtps2dq(regs::zmm(vec)?, regs::zmm(vec)?)?,
        }
        Ok(())
    }

    /// Load `load_size` contiguous bytes into the `width`-sized view of
    /// `vec`. Equivalent to inserting the bytes one at a time starting at
    /// lane 0, but with the minimal instruction sequence for each count.
    #[allow(clippy::too_many_arguments)]
    fn load_bytes(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        width: VecTier,
        vec: u8,
        reg: AsmRegister64,
        offset: i32,
        load_size: usize,
    ) -> Result<(), EmitError> {
        if load_size > 64
            || (width == VecTier::Y256 && load_size > 32)
            || (width == VecTier::X128 && load_size > 16)
        {
            return Err(EmitError::UnexpectedNum {
                emitter: "load",
                num: load_size,
                ctx: "bytes in load_bytes",
            });
        }

        let xmm = regs::xmm(vec)?;
        let ymm = regs::ymm(vec)?;
        let zmm = regs::zmm(vec)?;

        match load_size {
            64 => asm.vmovdqu64(zmm, zmmword_ptr(reg + offset))?,
            32 => asm.vmovdqu(ymm, ymmword_ptr(reg + offset))?,
            16 => asm.vmovdqu(xmm, xmmword_ptr(reg + offset))?,
            _ => {
                if self.caps.avx512_core {
                    let mask: u64 = (1u64 << load_size) - 1;
                    let tmp = regs::gpr64(regs.mask_gpr())?;
                    asm.mov(tmp, mask)?;
                    asm.kmovq(k1, tmp)?;
                    asm.vmovdqu8(zmm.k1().z(), zmmword_ptr(reg + offset))?;
                } else {
                    self.load_byte_base(asm, vec, reg, offset, load_size)?;
                }
            }
        }

        if self.fill.is_some() {
            self.fill_with_default(asm, regs, width, vec, load_size / 4)?;
        }
        Ok(())
    }

    /// Insert-sequence fallback used below AVX-512: build the low xmm block
    /// with byte/word/dword inserts, then recombine the 16- and 32-byte
    /// blocks with lane inserts.
    fn load_byte_base(
        &self,
        asm: &mut CodeAssembler,
        vec: u8,
        reg: AsmRegister64,
        offset: i32,
        load_size: usize,
    ) -> Result<(), EmitError> {
        let xmm = regs::xmm(vec)?;
        let ymm = regs::ymm(vec)?;
        let zmm = regs::zmm(vec)?;

        let mut start_bytes: i32 = 0;
        let mut bytes_to_load = load_size;

        let has_ymm_block = bytes_to_load > 32;
        if has_ymm_block {
            // The tail lands in the upper 256 bits of zmm.
            start_bytes += 32;
            bytes_to_load -= 32;
        }

        let has_xmm_block = bytes_to_load > 16;
        if has_xmm_block {
            // The tail lands in the upper 128 bits of ymm.
            start_bytes += 16;
            bytes_to_load -= 16;
        }

        let sb = offset + start_bytes;
        if (8..16).contains(&bytes_to_load) {
            // Better CPI than pinsrq.
            asm.vmovq(xmm, qword_ptr(reg + sb))?;
        } else if bytes_to_load == 16 {
            asm.vmovdqu(xmm, xmmword_ptr(reg + sb))?;
        }

        match bytes_to_load {
            0 | 8 | 16 => {}
            1 => asm.vpinsrb(xmm, xmm, byte_ptr(reg + sb), 0)?,
            2 => asm.vpinsrw(xmm, xmm, word_ptr(reg + sb), 0)?,
            3 => {
                asm.vpinsrw(xmm, xmm, word_ptr(reg + sb), 0)?;
                asm.vpinsrb(xmm, xmm, byte_ptr(reg + sb + 2), 2)?;
            }
            4 => asm.vmovss(xmm, dword_ptr(reg + sb))?,
            5 => {
                asm.vmovss(xmm, dword_ptr(reg + sb))?;
                asm.vpinsrb(xmm, xmm, byte_ptr(reg + sb + 4), 4)?;
            }
            6 => {
                asm.vmovss(xmm, dword_ptr(reg + sb))?;
                asm.vpinsrw(xmm, xmm, word_ptr(reg + sb + 4), 2)?;
            }
            7 => {
                asm.vmovss(xmm, dword_ptr(reg + sb))?;
                asm.vpinsrw(xmm, xmm, word_ptr(reg + sb + 4), 2)?;
                asm.vpinsrb(xmm, xmm, byte_ptr(reg + sb + 6), 6)?;
            }
            9 => asm.vpinsrb(xmm, xmm, byte_ptr(reg + sb + 8), 8)?,
            10 => asm.vpinsrw(xmm, xmm, word_ptr(reg + sb + 8), 4)?,
            11 => {
                asm.vpinsrw(xmm, xmm, word_ptr(reg + sb + 8), 4)?;
                asm.vpinsrb(xmm, xmm, byte_ptr(reg + sb + 10), 10)?;
            }
            12 => asm.vpinsrd(xmm, xmm, dword_ptr(reg + sb + 8), 2)?,
            13 => {
                asm.vpinsrd(xmm, xmm, dword_ptr(reg + sb + 8), 2)?;
                asm.vpinsrb(xmm, xmm, byte_ptr(reg + sb + 12), 12)?;
            }
            14 => {
                asm.vpinsrd(xmm, xmm, dword_ptr(reg + sb + 8), 2)?;
                asm.vpinsrw(xmm, xmm, word_ptr(reg + sb + 12), 6)?;
            }
            15 => {
                asm.vpinsrd(xmm, xmm, dword_ptr(reg + sb + 8), 2)?;
                asm.vpinsrw(xmm, xmm, word_ptr(reg + sb + 12), 6)?;
                asm.vpinsrb(xmm, xmm, byte_ptr(reg + sb + 14), 14)?;
            }
            _ => {
                return Err(EmitError::UnexpectedNum {
                    emitter: "load",
                    num: bytes_to_load,
                    ctx: "bytes in load_byte_base",
                })
            }
        }

        if has_xmm_block {
            asm.vinsertf128(ymm, ymm, xmm, 1)?;
            if has_ymm_block {
                asm.vinsertf128(ymm, ymm, xmmword_ptr(reg + offset + 32), 0)?;
            } else {
                asm.vinsertf128(ymm, ymm, xmmword_ptr(reg + offset), 0)?;
            }
        }

        if has_ymm_block {
            asm.vinsertf64x4(zmm, zmm, ymm, 1)?;
            asm.vinsertf64x4(zmm, zmm, ymmword_ptr(reg + offset), 0)?;
        }
        Ok(())
    }

    /// Load up to 16 bytes and sign/zero extend each into a 32-bit lane.
    #[allow(clippy::too_many_arguments)]
    fn load_bytes_to_dword_extension(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        width: VecTier,
        vec: u8,
        reg: AsmRegister64,
        offset: i32,
        is_signed: bool,
        load_size: usize,
    ) -> Result<(), EmitError> {
        if load_size > 16
            || (width == VecTier::Y256 && load_size > 8)
            || (width == VecTier::X128 && load_size > 4)
        {
            return Err(EmitError::UnexpectedNum {
                emitter: "load",
                num: load_size,
                ctx: "bytes in load_bytes_to_dword_extension",
            });
        }

        // Exact full-register counts extend straight from memory.
        match load_size {
            16 => {
                let zmm = regs::zmm(vec)?;
                if is_signed {
                    asm.vpmovsxbd(zmm, xmmword_ptr(reg + offset))?;
                } else {
                    asm.vpmovzxbd(zmm, xmmword_ptr(reg + offset))?;
                }
            }
            8 => {
                let ymm = regs::ymm(vec)?;
                if is_signed {
                    asm.vpmovsxbd(ymm, qword_ptr(reg + offset))?;
                } else {
                    asm.vpmovzxbd(ymm, qword_ptr(reg + offset))?;
                }
            }
            4 => {
                let xmm = regs::xmm(vec)?;
                if is_signed {
                    asm.vpmovsxbd(xmm, dword_ptr(reg + offset))?;
                } else {
                    asm.vpmovzxbd(xmm, dword_ptr(reg + offset))?;
                }
            }
            _ => {
                if width == VecTier::Z512 {
                    let mask: u32 = (1u32 << load_size) - 1;
                    let tmp = regs::gpr32(regs.mask_gpr())?;
                    asm.mov(tmp, mask)?;
                    asm.kmovw(k1, tmp)?;
                    let zmm = regs::zmm(vec)?;
                    if is_signed {
                        asm.vpmovsxbd(zmm.k1().z(), xmmword_ptr(reg + offset))?;
                    } else {
                        asm.vpmovzxbd(zmm.k1().z(), xmmword_ptr(reg + offset))?;
                    }
                } else {
                    self.load_bytes(asm, regs, VecTier::X128, vec, reg, offset, load_size)?;
                    let xmm = regs::xmm(vec)?;
                    match width {
                        VecTier::X128 => {
                            if is_signed {
                                asm.vpmovsxbd(xmm, xmm)?;
                            } else {
                                asm.vpmovzxbd(xmm, xmm)?;
                            }
                        }
                        _ => {
                            let ymm = regs::ymm(vec)?;
                            if is_signed {
                                asm.vpmovsxbd(ymm, xmm)?;
                            } else {
                                asm.vpmovzxbd(ymm, xmm)?;
                            }
                        }
                    }
                }
            }
        }

        if self.fill.is_some() {
            self.fill_with_default(asm, regs, width, vec, load_size)?;
        }
        Ok(())
    }

    /// Load up to 32 bytes of words and extend each into a 32-bit lane.
    /// bf16 words are zero-extended then shifted left 16, reinterpreting
    /// each as the upper half of an f32.
    #[allow(clippy::too_many_arguments)]
    fn load_words_to_dword_extension(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        width: VecTier,
        vec: u8,
        reg: AsmRegister64,
        offset: i32,
        is_bf16: bool,
        is_signed: bool,
        load_size: usize,
    ) -> Result<(), EmitError> {
        if load_size > 32
            || (width == VecTier::Y256 && load_size > 16)
            || (width == VecTier::X128 && load_size > 8)
        {
            return Err(EmitError::UnexpectedNum {
                emitter: "load",
                num: load_size,
                ctx: "bytes in load_words_to_dword_extension",
            });
        }

        match load_size {
            32 => {
                let zmm = regs::zmm(vec)?;
                if is_bf16 {
                    asm.vpmovzxwd(zmm, ymmword_ptr(reg + offset))?;
                    asm.vpslld(zmm, zmm, 16)?;
                } else if is_signed {
                    asm.vpmovsxwd(zmm, ymmword_ptr(reg + offset))?;
                } else {
                    asm.vpmovzxwd(zmm, ymmword_ptr(reg + offset))?;
                }
            }
            16 => {
                let ymm = regs::ymm(vec)?;
                if is_bf16 {
                    asm.vpmovzxwd(ymm, xmmword_ptr(reg + offset))?;
                    asm.vpslld(ymm, ymm, 16)?;
                } else if is_signed {
                    asm.vpmovsxwd(ymm, xmmword_ptr(reg + offset))?;
                } else {
                    asm.vpmovzxwd(ymm, xmmword_ptr(reg + offset))?;
                }
            }
            8 => {
                let xmm = regs::xmm(vec)?;
                if is_bf16 {
                    asm.vpmovzxwd(xmm, qword_ptr(reg + offset))?;
                    asm.vpslld(xmm, xmm, 16)?;
                } else if is_signed {
                    asm.vpmovsxwd(xmm, qword_ptr(reg + offset))?;
                } else {
                    asm.vpmovzxwd(xmm, qword_ptr(reg + offset))?;
                }
            }
            _ => {
                if width == VecTier::Z512 {
                    let mask: u32 = (1u32 << (load_size / 2)) - 1;
                    let tmp = regs::gpr32(regs.mask_gpr())?;
                    asm.mov(tmp, mask)?;
                    asm.kmovw(k1, tmp)?;
                    let zmm = regs::zmm(vec)?;
                    if is_bf16 {
                        asm.vpmovzxwd(zmm.k1().z(), ymmword_ptr(reg + offset))?;
                        asm.vpslld(zmm, zmm, 16)?;
                    } else if is_signed {
                        asm.vpmovsxwd(zmm.k1().z(), ymmword_ptr(reg + offset))?;
                    } else {
                        asm.vpmovzxwd(zmm.k1().z(), ymmword_ptr(reg + offset))?;
                    }
                } else {
                    self.load_bytes(asm, regs, VecTier::X128, vec, reg, offset, load_size)?;
                    let xmm = regs::xmm(vec)?;
                    match width {
                        VecTier::X128 => {
                            if is_bf16 {
                                asm.vpmovzxwd(xmm, xmm)?;
                                asm.vpslld(xmm, xmm, 16)?;
                            } else if is_signed {
                                asm.vpmovsxwd(xmm, xmm)?;
                            } else {
                                asm.vpmovzxwd(xmm, xmm)?;
                            }
                        }
                        _ => {
                            let ymm = regs::ymm(vec)?;
                            if is_bf16 {
                                asm.vpmovzxwd(ymm, xmm)?;
                                asm.vpslld(ymm, ymm, 16)?;
                            } else if is_signed {
                                asm.vpmovsxwd(ymm, xmm)?;
                            } else {
                                asm.vpmovzxwd(ymm, xmm)?;
                            }
                        }
                    }
                }
            }
        }

        if self.fill.is_some() {
            self.fill_with_default(asm, regs, width, vec, load_size / 2)?;
        }
        Ok(())
    }

    /// Blend the fill constant into the dword lanes at and above
    /// `loaded_dwords`.
    fn fill_with_default(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        width: VecTier,
        vec: u8,
        loaded_dwords: usize,
    ) -> Result<(), EmitError> {
        let fill = match self.fill {
            Some(f) => f,
            None => return Ok(()),
        };
        let base = regs::gpr64(regs.table_gpr())?;
        let off = self.table.offset(fill.key())?;
        match width {
            VecTier::X128 => {
                let imm = (!((1u32 << loaded_dwords) - 1)) as u8;
                let xmm = regs::xmm(vec)?;
                asm.vblendps(xmm, xmm, xmmword_ptr(base + off), imm as u32)?;
            }
            VecTier::Y256 => {
                let imm = (!((1u32 << loaded_dwords) - 1)) as u8;
                let ymm = regs::ymm(vec)?;
                asm.vblendps(ymm, ymm, ymmword_ptr(base + off), imm as u32)?;
            }
            VecTier::Z512 => {
                let tail: u64 = !((1u64 << loaded_dwords) - 1);
                let tmp = regs::gpr64(regs.mask_gpr())?;
                asm.mov(tmp, tail)?;
                asm.kmovq(k1, tmp)?;
                let zmm = regs::zmm(vec)?;
                asm.vblendmps(zmm.k1(), zmm, zmmword_ptr(base + off))?;
            }
        }
        Ok(())
    }
}

impl Emitter for LoadEmitter {
    fn aux_gprs_count(&self) -> usize {
        let mut count = mask_gpr_count(
            &self.caps,
            self.load_num * self.dst_prc.size(),
            self.fill.is_some(),
        );
        // Table base for the fill constant.
        if self.fill.is_some() {
            count += 1;
        }
        count
    }

    fn aux_vecs_count(&self) -> usize {
        0
    }

    fn emit_data(&mut self, asm: &mut CodeAssembler) -> Result<(), EmitError> {
        self.table.emit_data(asm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_dst() {
        let err = LoadEmitter::new(
            VecTier::Y256,
            CpuFeatures::avx2_only(),
            Precision::U8,
            Precision::I16,
            4,
            None,
        );
        assert!(matches!(
            err,
            Err(EmitError::UnsupportedPrecision { emitter: "load", .. })
        ));
    }

    #[test]
    fn rejects_oversized_count() {
        // 8 lanes of f32 is the ymm capacity; 9 must fail.
        let err = LoadEmitter::new(
            VecTier::Y256,
            CpuFeatures::avx2_only(),
            Precision::F32,
            Precision::F32,
            9,
            None,
        );
        assert!(matches!(err, Err(EmitError::UnexpectedNum { .. })));
        assert!(LoadEmitter::new(
            VecTier::Y256,
            CpuFeatures::avx2_only(),
            Precision::F32,
            Precision::F32,
            8,
            None,
        )
        .is_ok());
    }

    #[test]
    fn rejects_tier_above_caps() {
        let err = LoadEmitter::new(
            VecTier::Z512,
            CpuFeatures::avx2_only(),
            Precision::F32,
            Precision::F32,
            4,
            None,
        );
        assert!(matches!(err, Err(EmitError::UnsupportedIsa(_))));
    }

    #[test]
    fn aux_gpr_accounting() {
        // Full-width avx512 load, no fill: no mask, no table.
        let e = LoadEmitter::new(
            VecTier::Z512,
            CpuFeatures::avx512(false),
            Precision::F32,
            Precision::F32,
            16,
            None,
        )
        .unwrap();
        assert_eq!(e.aux_gprs_count(), 0);

        // Partial avx512 load: one mask GPR.
        let e = LoadEmitter::new(
            VecTier::Z512,
            CpuFeatures::avx512(false),
            Precision::F32,
            Precision::F32,
            11,
            None,
        )
        .unwrap();
        assert_eq!(e.aux_gprs_count(), 1);

        // Fill adds the table base on top of the mask GPR.
        let e = LoadEmitter::new(
            VecTier::Z512,
            CpuFeatures::avx512(false),
            Precision::F32,
            Precision::F32,
            16,
            Some(FillValue::Zero),
        )
        .unwrap();
        assert_eq!(e.aux_gprs_count(), 2);

        // Below avx512 no mask GPR is ever needed; fill still takes the base.
        let e = LoadEmitter::new(
            VecTier::Y256,
            CpuFeatures::avx2_only(),
            Precision::F32,
            Precision::F32,
            3,
            Some(FillValue::Zero),
        )
        .unwrap();
        assert_eq!(e.aux_gprs_count(), 1);
    }

    #[test]
    fn key_hash_is_field_sensitive() {
        // Plain names like `k1` collide with the opmask register constants
        // pulled in by the code_asm glob import.
        let key_a = LoadKey {
            src: Precision::U8,
            dst: Precision::F32,
            num: 5,
            fill: None,
        };
        let key_b = LoadKey { num: 6, ..key_a };
        let key_c = LoadKey {
            fill: Some(FillValue::Zero),
            ..key_a
        };
        assert_ne!(key_a.stable_hash(), key_b.stable_hash());
        assert_ne!(key_a.stable_hash(), key_c.stable_hash());
        assert_eq!(key_a.stable_hash(), key_a.stable_hash());
    }
}

//! Vectorized store emitter.
//!
//! Writes N elements from 32-bit register lanes out to memory in the
//! destination precision. A float<->int representation change happens first
//! (into a scratch vector so the caller's data survives), then the lanes are
//! narrowed and stored. Narrowing honors the configured overflow policy:
//! saturating (clamp to the destination range) or truncating (keep the low
//! bits, so 300 stored as u8 becomes 44).
//!
//! Like the load side, byte counts of 16/32/64 get full-width moves,
//! AVX-512 gets k-masked stores and vpmov down-converts for everything
//! else, and narrower tiers fall back to pack + extract sequences.

use iced_x86::code_asm::*;

use crate::bf16::Bf16Emu;
use crate::error::EmitError;
use crate::isa::{mask_gpr_count, CpuFeatures, VecTier};
use crate::precision::Precision;
use crate::regs::{self, ScratchRegs};
use crate::table::ConstTable;
use crate::Emitter;

/// Overflow policy for narrowing conversions. Also selects the f32 -> i32
/// rounding instruction (round-to-nearest vs truncate toward zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundMode {
    Saturate,
    Truncate,
}

/// Cache key for deduplicating store emitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub src: Precision,
    pub dst: Precision,
    pub num: usize,
    pub mode: RoundMode,
}

impl StoreKey {
    /// Process-stable 64-bit hash over exactly the key fields.
    pub fn stable_hash(&self) -> u64 {
        let mut h = crate::fnv1a(crate::FNV_OFFSET, b"jit_store_emitter");
        h = crate::fnv1a(h, &[self.src as u8, self.dst as u8, self.mode as u8]);
        h = crate::fnv1a(h, &(self.num as u64).to_le_bytes());
        h
    }
}

pub struct StoreEmitter {
    tier: VecTier,
    caps: CpuFeatures,
    src_prc: Precision,
    dst_prc: Precision,
    store_num: usize,
    /// Bytes written to memory: `store_num * dst_prc.size()`.
    store_size: usize,
    mode: RoundMode,
    table: ConstTable,
    bf16_emu: Option<Bf16Emu>,
}

impl StoreEmitter {
    pub fn new(
        tier: VecTier,
        caps: CpuFeatures,
        src_prc: Precision,
        dst_prc: Precision,
        store_num: usize,
        mode: RoundMode,
    ) -> Result<Self, EmitError> {
        caps.check_tier(tier)?;
        let matched = src_prc == dst_prc
            || src_prc == Precision::F32
            || src_prc == Precision::I32;
        if !matched {
            return Err(EmitError::UnsupportedPrecision {
                emitter: "store",
                src: src_prc,
                dst: dst_prc,
            });
        }
        if store_num > tier.vec_bytes() / src_prc.size() {
            return Err(EmitError::UnexpectedNum {
                emitter: "store",
                num: store_num,
                ctx: "elements to store",
            });
        }

        let mut table = ConstTable::new(tier.vec_bytes());
        if mode == RoundMode::Truncate && src_prc != dst_prc && !caps.avx512_core {
            // Only the pack fallback reads these; vpmovdb/dw truncate on
            // their own.
            match dst_prc.size() {
                1 => table.push("mask_truncation_byte", 0x0000_00ff, true),
                2 => table.push("mask_truncation_word", 0x0000_ffff, true),
                _ => {}
            }
        }
        let bf16_emu = if dst_prc == Precision::Bf16
            && src_prc != Precision::Bf16
            && !caps.avx512_bf16
        {
            Bf16Emu::register_table_entries(&mut table);
            Some(Bf16Emu::new(tier))
        } else {
            None
        };
        log::trace!("store emitter: {src_prc} -> {dst_prc}, n={store_num}, tier={tier:?}, {mode:?}");
        Ok(StoreEmitter {
            tier,
            caps,
            src_prc,
            dst_prc,
            store_num,
            store_size: store_num * dst_prc.size(),
            mode,
            table,
            bf16_emu,
        })
    }

    pub fn key(&self) -> StoreKey {
        StoreKey {
            src: self.src_prc,
            dst: self.dst_prc,
            num: self.store_num,
            mode: self.mode,
        }
    }

    fn needs_cross_convert(&self) -> bool {
        (self.src_prc == Precision::F32 && !self.dst_prc.is_float())
            || (self.src_prc == Precision::I32 && self.dst_prc.is_float())
    }

    /// Emit the store of `store_num` elements from vector register `in_vec`
    /// to `[gpr(dst_gpr) + offset]`.
    pub fn emit(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        in_vec: u8,
        dst_gpr: u8,
        offset: i32,
    ) -> Result<(), EmitError> {
        regs.check("store", self.aux_gprs_count(), self.aux_vecs_count())?;
        if !self.table.is_empty() {
            self.table.load_base(asm, regs.table_gpr())?;
        }

        let reg = regs::gpr64(dst_gpr)?;
        let mut data = in_vec;
        if self.src_prc != self.dst_prc && self.needs_cross_convert() {
            let aux = regs.vecs[regs.vecs.len() - 1];
            if self.src_prc == Precision::F32 {
                match (self.tier, self.mode) {
                    (VecTier::X128, RoundMode::Saturate) => {
                        asm.vcvtps2dq(regs::xmm(aux)?, regs::xmm(data)?)?
                    }
                    (VecTier::X128, RoundMode::Truncate) => {
                        asm.vcvttps2dq(regs::xmm(aux)?, regs::xmm(data)?)?
                    }
                    (VecTier::Y256, RoundMode::Saturate) => {
                        asm.vcvtps2dq(regs::ymm(aux)?, regs::ymm(data)?)?
                    }
                    (VecTier::Y256, RoundMode::Truncate) => {
                        asm.vcvttps2dq(regs::ymm(aux)?, regs::ymm(data)?)?
                    }
                    (VecTier::Z512, RoundMode::Saturate) => {
                        asm.vcvtps2dq(regs::zmm(aux)?, regs::zmm(data)?)?
                    }
                    (VecTier::Z512, RoundMode::Truncate) => {
                        asm.vcvttps2dq(regs::zmm(aux)?, regs::zmm(data)?)?
                    }
                }
            } else {
                match self.tier {
                    VecTier::X128 => asm.vcvtdq2ps(regs::xmm(aux)?, regs::xmm(data)?)?,
                    VecTier::Y256 => asm.vcvtdq2ps(regs::ymm(aux)?, regs::ymm(data)?)?,
                    VecTier::Z512 => asm.vcvtdq2ps(regs::zmm(aux)?, regs::zmm(data)?)?,
                }
            }
            data = aux;
        }

        if self.src_prc == self.dst_prc {
            self.store_bytes(asm, regs, self.tier, data, reg, offset, self.store_size)?;
        } else {
            match self.dst_prc {
                Precision::F32 | Precision::I32 => {
                    self.store_bytes(asm, regs, self.tier, data, reg, offset, self.store_size)?;
                }
                Precision::I8 => {
                    self.store_dword_to_byte_extension(
                        asm, regs, data, reg, offset, true, self.store_num,
                    )?;
                }
                Precision::U8 => {
                    self.store_dword_to_byte_extension(
                        asm, regs, data, reg, offset, false, self.store_num,
                    )?;
                }
                Precision::I16 => {
                    self.store_dword_to_word_extension(
                        asm, regs, data, reg, offset, false, true, self.store_num,
                    )?;
                }
                Precision::U16 => {
                    self.store_dword_to_word_extension(
                        asm, regs, data, reg, offset, false, false, self.store_num,
                    )?;
                }
                Precision::Bf16 => {
                    self.store_dword_to_word_extension(
                        asm, regs, data, reg, offset, true, false, self.store_num,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Store `store_size` contiguous bytes from the `width`-sized view of
    /// `vec`. The register contents above `store_size` bytes may be
    /// clobbered by the extract fallback.
    #[allow(clippy::too_many_arguments)]
    fn store_bytes(
        &self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        width: VecTier,
        vec: u8,
        reg: AsmRegister64,
        offset: i32,
        store_size: usize,
    ) -> Result<(), EmitError> {
        if store_size > 64
            || (width == VecTier::Y256 && store_size > 32)
            || (width == VecTier::X128 && store_size > 16)
        {
            return Err(EmitError::UnexpectedNum {
                emitter: "store",
                num: store_size,
                ctx: "bytes in store_bytes",
            });
        }

        match store_size {
            64 => asm.vmovdqu64(zmmword_ptr(reg + offset), regs::zmm(vec)?)?,
            32 => asm.vmovdqu(ymmword_ptr(reg + offset), regs::ymm(vec)?)?,
            16 => asm.vmovdqu(xmmword_ptr(reg + offset), regs::xmm(vec)?)?,
            _ => {
                if self.caps.avx512_core {
                    let mask: u64 = (1u64 << store_size) - 1;
                    let tmp = regs::gpr64(regs.mask_gpr())?;
                    asm.mov(tmp, mask)?;
                    asm.kmovq(k1, tmp)?;
                    asm.vmovdqu8(zmmword_ptr(reg + offset).k1(), regs::zmm(vec)?)?;
                } else {
                    self.store_byte_base(asm, vec, reg, offset, store_size)?;
                }
            }
        }
        Ok(())
    }

    /// Extract-sequence fallback used below AVX-512. Stores whole 32- and
    /// 16-byte blocks first, then the tail with byte/word/dword extracts.
    fn store_byte_base(
        &self,
        asm: &mut CodeAssembler,
        vec: u8,
        reg: AsmRegister64,
        offset: i32,
        store_size: usize,
    ) -> Result<(), EmitError> {
        let xmm = regs::xmm(vec)?;
        let ymm = regs::ymm(vec)?;
        let zmm = regs::zmm(vec)?;

        let mut start_bytes: i32 = 0;
        let mut bytes_to_store = store_size;

        if store_size > 32 {
            asm.vmovdqu(ymmword_ptr(reg + offset), ymm)?;
            start_bytes += 32;
            bytes_to_store -= 32;
            // Shift the upper 256 bits down for the tail.
            asm.vextractf64x4(ymm, zmm, 1)?;
        }

        if bytes_to_store > 16 {
            asm.vmovdqu(xmmword_ptr(reg + offset + start_bytes), xmm)?;
            start_bytes += 16;
            bytes_to_store -= 16;
            asm.vextractf128(xmm, ymm, 1)?;
        }

        let sb = offset + start_bytes;
        match bytes_to_store {
            0 => {}
            1 => asm.vpextrb(byte_ptr(reg + sb), xmm, 0)?,
            2 => asm.vpextrw(word_ptr(reg + sb), xmm, 0)?,
            3 => {
                asm.vpextrw(word_ptr(reg + sb), xmm, 0)?;
                asm.vpextrb(byte_ptr(reg + sb + 2), xmm, 2)?;
            }
            4 => asm.vmovss(dword_ptr(reg + sb), xmm)?,
            5 => {
                asm.vmovss(dword_ptr(reg + sb), xmm)?;
                asm.vpextrb(byte_ptr(reg + sb + 4), xmm, 4)?;
            }
            6 => {
                asm.vmovss(dword_ptr(reg + sb), xmm)?;
                asm.vpextrw(word_ptr(reg + sb + 4), xmm, 2)?;
            }
            7 => {
                asm.vmovss(dword_ptr(reg + sb), xmm)?;
                asm.vpextrw(word_ptr(reg + sb + 4), xmm, 2)?;
                asm.vpextrb(byte_ptr(reg + sb + 6), xmm, 6)?;
            }
            8 => asm.vmovq(qword_ptr(reg + sb), xmm)?,
            9 => {
                asm.vmovq(qword_ptr(reg + sb), xmm)?;
                asm.vpextrb(byte_ptr(reg + sb + 8), xmm, 8)?;
            }
            10 => {
                asm.vmovq(qword_ptr(reg + sb), xmm)?;
                asm.vpextrw(word_ptr(reg + sb + 8), xmm, 4)?;
            }
            11 => {
                asm.vmovq(qword_ptr(reg + sb), xmm)?;
                asm.vpextrw(word_ptr(reg + sb + 8), xmm, 4)?;
                asm.vpextrb(byte_ptr(reg + sb + 10), xmm, 10)?;
            }
            12 => {
                asm.vmovq(qword_ptr(reg + sb), xmm)?;
                asm.vpextrd(dword_ptr(reg + sb + 8), xmm, 2)?;
            }
            13 => {
                asm.vmovq(qword_ptr(reg + sb), xmm)?;
                asm.vpextrd(dword_ptr(reg + sb + 8), xmm, 2)?;
                asm.vpextrb(byte_ptr(reg + sb + 12), xmm, 12)?;
            }
            14 => {
                asm.vmovq(qword_ptr(reg + sb), xmm)?;
                asm.vpextrd(dword_ptr(reg + sb + 8), xmm, 2)?;
                asm.vpextrw(word_ptr(reg + sb + 12), xmm, 6)?;
            }
            15 => {
                asm.vmovq(qword_ptr(reg + sb), xmm)?;
                asm.vpextrd(dword_ptr(reg + sb + 8), xmm, 2)?;
                asm.vpextrw(word_ptr(reg + sb + 12), xmm, 6)?;
                asm.vpextrb(byte_ptr(reg + sb + 14), xmm, 14)?;
            }
            16 => asm.vmovdqu(xmmword_ptr(reg + sb), xmm)?,
            _ => {
                return Err(EmitError::UnexpectedNum {
                    emitter: "store",
                    num: bytes_to_store,
                    ctx: "bytes in store_byte_base",
                })
            }
        }
        Ok(())
    }

    /// Zero out a scratch vector for the unsigned clamp.
    fn emit_zero(&self, asm: &mut CodeAssembler, zero: u8) -> Result<(), EmitError> {
        match self.tier {
            VecTier::X128 => {
                let z = regs::xmm(zero)?;
                asm.vpxor(z, z, z)?;
            }
            VecTier::Y256 => {
                let z = regs::ymm(zero)?;
                asm.vpxor(z, z, z)?;
            }
            VecTier::Z512 => {
                let z = regs::zmm(zero)?;
                asm.vpxord(z, z, z)?;
            }
        }
        Ok(())
    }

    /// Narrow dword lanes to bytes and store `store_num` of them.
    ///
    /// Unsigned saturation on AVX-512 clamps negatives to zero first
    /// (vpmovusdb treats lanes as unsigned). The pack fallback applies the
    /// truncation mask before packing so wraparound semantics survive the
    /// signed saturating packs.
    #[allow(clippy::too_many_arguments)]
    fn store_dword_to_byte_extension(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        vec: u8,
        reg: AsmRegister64,
        offset: i32,
        is_signed: bool,
        store_num: usize,
    ) -> Result<(), EmitError> {
        if store_num > 16
            || (self.tier == VecTier::Y256 && store_num > 8)
            || (self.tier == VecTier::X128 && store_num > 4)
        {
            return Err(EmitError::UnexpectedNum {
                emitter: "store",
                num: store_num,
                ctx: "elements in store_dword_to_byte_extension",
            });
        }
        let saturate = self.mode == RoundMode::Saturate;

        match store_num {
            16 => {
                let zmm = regs::zmm(vec)?;
                if !saturate {
                    asm.vpmovdb(xmmword_ptr(reg + offset), zmm)?;
                } else if is_signed {
                    asm.vpmovsdb(xmmword_ptr(reg + offset), zmm)?;
                } else {
                    let zero = regs.vecs[0];
                    self.emit_zero(asm, zero)?;
                    asm.vpmaxsd(zmm, zmm, regs::zmm(zero)?)?;
                    asm.vpmovusdb(xmmword_ptr(reg + offset), zmm)?;
                }
            }
            8 if self.caps.avx512_core => {
                let ymm = regs::ymm(vec)?;
                if !saturate {
                    asm.vpmovdb(qword_ptr(reg + offset), ymm)?;
                } else if is_signed {
                    asm.vpmovsdb(qword_ptr(reg + offset), ymm)?;
                } else {
                    let zero = regs.vecs[0];
                    self.emit_zero(asm, zero)?;
                    asm.vpmaxsd(ymm, ymm, regs::ymm(zero)?)?;
                    asm.vpmovusdb(qword_ptr(reg + offset), ymm)?;
                }
            }
            4 if self.caps.avx512_core => {
                let xmm = regs::xmm(vec)?;
                if !saturate {
                    asm.vpmovdb(dword_ptr(reg + offset), xmm)?;
                } else if is_signed {
                    asm.vpmovsdb(dword_ptr(reg + offset), xmm)?;
                } else {
                    let zero = regs.vecs[0];
                    self.emit_zero(asm, zero)?;
                    asm.vpmaxsd(xmm, xmm, regs::xmm(zero)?)?;
                    asm.vpmovusdb(dword_ptr(reg + offset), xmm)?;
                }
            }
            _ if self.tier == VecTier::Z512 => {
                let zmm = regs::zmm(vec)?;
                let mask: u32 = (1u32 << store_num) - 1;
                let tmp = regs::gpr32(regs.mask_gpr())?;
                asm.mov(tmp, mask)?;
                asm.kmovw(k1, tmp)?;
                if !saturate {
                    asm.vpmovdb(xmmword_ptr(reg + offset).k1(), zmm)?;
                } else if is_signed {
                    asm.vpmovsdb(xmmword_ptr(reg + offset).k1(), zmm)?;
                } else {
                    let zero = regs.vecs[0];
                    self.emit_zero(asm, zero)?;
                    asm.vpmaxsd(zmm, zmm, regs::zmm(zero)?)?;
                    asm.vpmovusdb(xmmword_ptr(reg + offset).k1(), zmm)?;
                }
            }
            _ => self.store_dword_to_byte_base(asm, regs, vec, reg, offset, is_signed, store_num)?,
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn store_dword_to_byte_base(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        vec: u8,
        reg: AsmRegister64,
        offset: i32,
        is_signed: bool,
        store_num: usize,
    ) -> Result<(), EmitError> {
        let base = regs::gpr64(regs.table_gpr())?;
        match self.tier {
            VecTier::Y256 => {
                let ymm = regs::ymm(vec)?;
                if self.mode == RoundMode::Saturate {
                    if is_signed {
                        asm.vpackssdw(ymm, ymm, ymm)?;
                    } else {
                        asm.vpackusdw(ymm, ymm, ymm)?;
                    }
                } else {
                    let off = self.table.offset("mask_truncation_byte")?;
                    asm.vpand(ymm, ymm, ymmword_ptr(base + off))?;
                    asm.vpackssdw(ymm, ymm, ymm)?;
                }
                // Packing works per 128-bit lane; pull the qwords together.
                asm.vpermq(ymm, ymm, 0x08)?;
                if self.mode == RoundMode::Saturate && is_signed {
                    asm.vpacksswb(ymm, ymm, ymm)?;
                } else {
                    asm.vpackuswb(ymm, ymm, ymm)?;
                }
            }
            _ => {
                let xmm = regs::xmm(vec)?;
                if self.mode == RoundMode::Saturate {
                    if is_signed {
                        asm.vpackssdw(xmm, xmm, xmm)?;
                    } else {
                        asm.vpackusdw(xmm, xmm, xmm)?;
                    }
                } else {
                    let off = self.table.offset("mask_truncation_byte")?;
                    asm.vpand(xmm, xmm, xmmword_ptr(base + off))?;
                    asm.vpackssdw(xmm, xmm, xmm)?;
                }
                if self.mode == RoundMode::Saturate && is_signed {
                    asm.vpacksswb(xmm, xmm, xmm)?;
                } else {
                    asm.vpackuswb(xmm, xmm, xmm)?;
                }
            }
        }
        self.store_bytes(asm, regs, self.tier, vec, reg, offset, store_num)
    }

    /// Narrow dword lanes to words (or bf16) and store `store_num` of them.
    #[allow(clippy::too_many_arguments)]
    fn store_dword_to_word_extension(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        vec: u8,
        reg: AsmRegister64,
        offset: i32,
        is_bf16: bool,
        is_signed: bool,
        store_num: usize,
    ) -> Result<(), EmitError> {
        if store_num > 16
            || (self.tier == VecTier::Y256 && store_num > 8)
            || (self.tier == VecTier::X128 && store_num > 4)
        {
            return Err(EmitError::UnexpectedNum {
                emitter: "store",
                num: store_num,
                ctx: "elements in store_dword_to_word_extension",
            });
        }

        if is_bf16 {
            return self.store_bf16(asm, regs, vec, reg, offset, store_num);
        }
        let saturate = self.mode == RoundMode::Saturate;

        match store_num {
            16 => {
                let zmm = regs::zmm(vec)?;
                if !saturate {
                    asm.vpmovdw(ymmword_ptr(reg + offset), zmm)?;
                } else if is_signed {
                    asm.vpmovsdw(ymmword_ptr(reg + offset), zmm)?;
                } else {
                    let zero = regs.vecs[0];
                    self.emit_zero(asm, zero)?;
                    asm.vpmaxsd(zmm, zmm, regs::zmm(zero)?)?;
                    asm.vpmovusdw(ymmword_ptr(reg + offset), zmm)?;
                }
            }
            8 if self.caps.avx512_core => {
                let ymm = regs::ymm(vec)?;
                if !saturate {
                    asm.vpmovdw(xmmword_ptr(reg + offset), ymm)?;
                } else if is_signed {
                    asm.vpmovsdw(xmmword_ptr(reg + offset), ymm)?;
                } else {
                    let zero = regs.vecs[0];
                    self.emit_zero(asm, zero)?;
                    asm.vpmaxsd(ymm, ymm, regs::ymm(zero)?)?;
                    asm.vpmovusdw(xmmword_ptr(reg + offset), ymm)?;
                }
            }
            4 if self.caps.avx512_core => {
                let xmm = regs::xmm(vec)?;
                if !saturate {
                    asm.vpmovdw(qword_ptr(reg + offset), xmm)?;
                } else if is_signed {
                    asm.vpmovsdw(qword_ptr(reg + offset), xmm)?;
                } else {
                    let zero = regs.vecs[0];
                    self.emit_zero(asm, zero)?;
                    asm.vpmaxsd(xmm, xmm, regs::xmm(zero)?)?;
                    asm.vpmovusdw(qword_ptr(reg + offset), xmm)?;
                }
            }
            _ if self.tier == VecTier::Z512 => {
                let zmm = regs::zmm(vec)?;
                let mask: u32 = (1u32 << store_num) - 1;
                let tmp = regs::gpr32(regs.mask_gpr())?;
                asm.mov(tmp, mask)?;
                asm.kmovw(k1, tmp)?;
                if !saturate {
                    asm.vpmovdw(ymmword_ptr(reg + offset).k1(), zmm)?;
                } else if is_signed {
                    asm.vpmovsdw(ymmword_ptr(reg + offset).k1(), zmm)?;
                } else {
                    let zero = regs.vecs[0];
                    self.emit_zero(asm, zero)?;
                    asm.vpmaxsd(zmm, zmm, regs::zmm(zero)?)?;
                    asm.vpmovusdw(ymmword_ptr(reg + offset).k1(), zmm)?;
                }
            }
            _ => self.store_dword_to_word_base(asm, regs, vec, reg, offset, is_signed, store_num)?,
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn store_dword_to_word_base(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        vec: u8,
        reg: AsmRegister64,
        offset: i32,
        is_signed: bool,
        store_num: usize,
    ) -> Result<(), EmitError> {
        let base = regs::gpr64(regs.table_gpr())?;
        match self.tier {
            VecTier::Y256 => {
                let ymm = regs::ymm(vec)?;
                if self.mode == RoundMode::Saturate {
                    if is_signed {
                        asm.vpackssdw(ymm, ymm, ymm)?;
                    } else {
                        asm.vpackusdw(ymm, ymm, ymm)?;
                    }
                } else {
                    let off = self.table.offset("mask_truncation_word")?;
                    asm.vpand(ymm, ymm, ymmword_ptr(base + off))?;
                    asm.vpackusdw(ymm, ymm, ymm)?;
                }
                asm.vpermq(ymm, ymm, 0x08)?;
            }
            _ => {
                let xmm = regs::xmm(vec)?;
                if self.mode == RoundMode::Saturate {
                    if is_signed {
                        asm.vpackssdw(xmm, xmm, xmm)?;
                    } else {
                        asm.vpackusdw(xmm, xmm, xmm)?;
                    }
                } else {
                    let off = self.table.offset("mask_truncation_word")?;
                    asm.vpand(xmm, xmm, xmmword_ptr(base + off))?;
                    asm.vpackusdw(xmm, xmm, xmm)?;
                }
            }
        }
        self.store_bytes(asm, regs, self.tier, vec, reg, offset, store_num * 2)
    }

    /// Round f32 lanes to bf16 words and store them.
    fn store_bf16(
        &mut self,
        asm: &mut CodeAssembler,
        regs: ScratchRegs<'_>,
        vec: u8,
        reg: AsmRegister64,
        offset: i32,
        store_num: usize,
    ) -> Result<(), EmitError> {
        // When the input came straight from the caller keep it intact and
        // pack into a scratch; a conversion intermediate can be reused.
        let out = if self.src_prc == Precision::F32 {
            regs.vecs[0]
        } else {
            vec
        };

        if self.caps.avx512_bf16 {
            match self.tier {
                VecTier::Z512 => asm.vcvtneps2bf16(regs::ymm(out)?, regs::zmm(vec)?)?,
                VecTier::Y256 => asm.vcvtneps2bf16(regs::xmm(out)?, regs::ymm(vec)?)?,
                VecTier::X128 => asm.vcvtneps2bf16(regs::xmm(out)?, regs::xmm(vec)?)?,
            }
        } else {
            let emu = self
                .bf16_emu
                .as_ref()
                .ok_or(EmitError::UnsupportedIsa("bf16 emulation not prepared"))?;
            let aux = regs
                .vecs
                .iter()
                .copied()
                .find(|v| *v != vec && *v != out)
                .ok_or(EmitError::ScratchShortage {
                    emitter: "store",
                    kind: "vec",
                    need: 2,
                    got: regs.vecs.len(),
                })?;
            emu.emit(asm, &self.table, regs.table_gpr(), vec, out, aux)?;
        }

        if store_num == 16 {
            asm.vmovdqu16(ymmword_ptr(reg + offset), regs::ymm(out)?)?;
        } else {
            let width = match self.tier {
                VecTier::Z512 => VecTier::Y256,
                _ => VecTier::X128,
            };
            self.store_bytes(asm, regs, width, out, reg, offset, store_num * 2)?;
        }
        Ok(())
    }
}

impl Emitter for StoreEmitter {
    fn aux_gprs_count(&self) -> usize {
        let mut count = mask_gpr_count(&self.caps, self.store_num * self.src_prc.size(), false);
        // Table base for truncation masks or bf16 rounding constants.
        if !self.table.is_empty() {
            count += 1;
        }
        count
    }

    fn aux_vecs_count(&self) -> usize {
        let mut count = 0;
        if self.needs_cross_convert() {
            count += 1;
        }
        if self.dst_prc == Precision::Bf16 && self.src_prc == Precision::F32 {
            count += 1;
        }
        if self.bf16_emu.is_some() {
            count += 1;
        }
        if self.caps.avx512_core
            && self.mode == RoundMode::Saturate
            && matches!(self.dst_prc, Precision::U8 | Precision::U16)
        {
            count += 1;
        }
        count
    }

    fn emit_data(&mut self, asm: &mut CodeAssembler) -> Result<(), EmitError> {
        self.table.emit_data(asm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_src() {
        let err = StoreEmitter::new(
            VecTier::Y256,
            CpuFeatures::avx2_only(),
            Precision::I16,
            Precision::U8,
            4,
            RoundMode::Saturate,
        );
        assert!(matches!(
            err,
            Err(EmitError::UnsupportedPrecision { emitter: "store", .. })
        ));
    }

    #[test]
    fn rejects_oversized_count() {
        let err = StoreEmitter::new(
            VecTier::Z512,
            CpuFeatures::avx512(false),
            Precision::F32,
            Precision::U8,
            17,
            RoundMode::Saturate,
        );
        assert!(matches!(err, Err(EmitError::UnexpectedNum { .. })));
    }

    #[test]
    fn aux_vec_accounting() {
        // f32 -> u8 saturating on avx512: conversion scratch + zero clamp.
        let e = StoreEmitter::new(
            VecTier::Z512,
            CpuFeatures::avx512(false),
            Precision::F32,
            Precision::U8,
            16,
            RoundMode::Saturate,
        )
        .unwrap();
        assert_eq!(e.aux_vecs_count(), 2);

        // Truncation never clamps.
        let e = StoreEmitter::new(
            VecTier::Z512,
            CpuFeatures::avx512(false),
            Precision::F32,
            Precision::U8,
            16,
            RoundMode::Truncate,
        )
        .unwrap();
        assert_eq!(e.aux_vecs_count(), 1);

        // f32 -> bf16 without native support: packed output + emu scratch.
        let e = StoreEmitter::new(
            VecTier::Z512,
            CpuFeatures::avx512(false),
            Precision::F32,
            Precision::Bf16,
            16,
            RoundMode::Saturate,
        )
        .unwrap();
        assert_eq!(e.aux_vecs_count(), 2);

        // Native bf16 still packs into a scratch to keep the input intact.
        let e = StoreEmitter::new(
            VecTier::Z512,
            CpuFeatures::avx512(true),
            Precision::F32,
            Precision::Bf16,
            16,
            RoundMode::Saturate,
        )
        .unwrap();
        assert_eq!(e.aux_vecs_count(), 1);

        // Pure pass-through needs nothing.
        let e = StoreEmitter::new(
            VecTier::Y256,
            CpuFeatures::avx2_only(),
            Precision::U8,
            Precision::U8,
            20,
            RoundMode::Saturate,
        )
        .unwrap();
        assert_eq!(e.aux_vecs_count(), 0);
    }

    #[test]
    fn aux_gpr_accounting() {
        // Partial store on avx512: one mask GPR, no table.
        let e = StoreEmitter::new(
            VecTier::Z512,
            CpuFeatures::avx512(false),
            Precision::F32,
            Precision::F32,
            11,
            RoundMode::Saturate,
        )
        .unwrap();
        assert_eq!(e.aux_gprs_count(), 1);

        // Truncating narrow below avx512 reads the mask table.
        let e = StoreEmitter::new(
            VecTier::Y256,
            CpuFeatures::avx2_only(),
            Precision::I32,
            Precision::U8,
            8,
            RoundMode::Truncate,
        )
        .unwrap();
        assert_eq!(e.aux_gprs_count(), 1);

        // Same narrow on avx512 uses vpmovdb, no table.
        let e = StoreEmitter::new(
            VecTier::Z512,
            CpuFeatures::avx512(false),
            Precision::I32,
            Precision::U8,
            16,
            RoundMode::Truncate,
        )
        .unwrap();
        assert_eq!(e.aux_gprs_count(), 0);
    }

    #[test]
    fn key_hash_is_field_sensitive() {
        // Plain names like `k1` collide with the opmask register constants
        // pulled in by the code_asm glob import.
        let key_a = StoreKey {
            src: Precision::F32,
            dst: Precision::I8,
            num: 7,
            mode: RoundMode::Saturate,
        };
        let key_b = StoreKey {
            mode: RoundMode::Truncate,
            ..key_a
        };
        assert_ne!(key_a.stable_hash(), key_b.stable_hash());
        assert_eq!(key_a.stable_hash(), key_a.stable_hash());
    }
}

//! Kernel assembly and execution.
//!
//! Wires the emitters into complete callable functions with the System V
//! calling convention: `fn(src: *const u8, dst: *mut u8)` with the source
//! pointer in rdi and the destination in rsi. Emitters only use
//! caller-saved registers so no prologue is needed.
//!
//! Code is assembled twice: once at a placeholder address to learn its
//! length, then again at the final executable address so RIP-relative
//! constant-table references resolve correctly.

use iced_x86::code_asm::CodeAssembler;

use crate::convert::ConvertEmitter;
use crate::error::EmitError;
use crate::isa::CpuFeatures;
use crate::load::{FillValue, LoadEmitter};
use crate::precision::Precision;
use crate::regs::ScratchRegs;
use crate::store::{RoundMode, StoreEmitter};
use crate::Emitter;

/// Entry point of a compiled kernel.
pub type TransferFn = unsafe extern "C" fn(src: *const u8, dst: *mut u8);

const SRC_GPR: u8 = 7; // rdi
const DST_GPR: u8 = 6; // rsi

// rax for masks, rcx (last) for the table base, rdx spare.
const SCRATCH_GPRS: [u8; 3] = [0, 2, 1];

/// Memory-to-memory transfer of `count` elements with precision conversion.
///
/// The element count is fixed at build time; the kernel reads
/// `count * src_prc.size()` bytes and writes `count * dst_prc.size()`.
pub struct TransferKernel {
    caps: CpuFeatures,
    src_prc: Precision,
    dst_prc: Precision,
    count: usize,
    mode: RoundMode,
    fill: Option<FillValue>,
}

impl TransferKernel {
    pub fn new(
        caps: CpuFeatures,
        src_prc: Precision,
        dst_prc: Precision,
        count: usize,
        mode: RoundMode,
    ) -> Self {
        TransferKernel {
            caps,
            src_prc,
            dst_prc,
            count,
            mode,
            fill: None,
        }
    }

    /// Fill register lanes past `count` with a constant after loading.
    pub fn with_fill(mut self, fill: FillValue) -> Self {
        self.fill = Some(fill);
        self
    }

    fn emit_into(&self, asm: &mut CodeAssembler) -> Result<(), EmitError> {
        let tier = self.caps.tier();
        // Same-precision transfers move bytes untouched; converting ones
        // route through the 32-bit lane representation matching the wider
        // numeric domain.
        let lane_prc = if self.src_prc == self.dst_prc {
            self.src_prc
        } else if self.src_prc.is_float() || self.dst_prc.is_float() {
            Precision::F32
        } else {
            Precision::I32
        };

        let mut load =
            LoadEmitter::new(tier, self.caps, self.src_prc, lane_prc, self.count, self.fill)?;
        let mut store =
            StoreEmitter::new(tier, self.caps, lane_prc, self.dst_prc, self.count, self.mode)?;

        let scratch_vecs: [u8; 2] = [1, 2];
        let regs = ScratchRegs::new(&SCRATCH_GPRS, &scratch_vecs);

        load.emit(asm, regs, SRC_GPR, 0, 0)?;
        store.emit(asm, regs, 0, DST_GPR, 0)?;
        asm.ret()?;
        load.emit_data(asm)?;
        store.emit_data(asm)?;
        Ok(())
    }

    /// Assemble at a fixed base address and return the raw bytes. Used for
    /// inspection; the code is only position-correct at `ip`.
    pub fn build_code(&self, ip: u64) -> Result<Vec<u8>, EmitError> {
        let mut asm = CodeAssembler::new(64)?;
        self.emit_into(&mut asm)?;
        Ok(asm.assemble(ip)?)
    }

    /// Assemble into executable memory.
    #[cfg(all(unix, target_arch = "x86_64"))]
    pub fn compile(&self) -> Result<CompiledKernel, EmitError> {
        let mut asm = CodeAssembler::new(64)?;
        self.emit_into(&mut asm)?;
        let kernel = CompiledKernel::from_assembler(&mut asm)?;
        log::debug!(
            "compiled transfer kernel {} -> {} (n={}, {} bytes)",
            self.src_prc,
            self.dst_prc,
            self.count,
            kernel.code_size()
        );
        Ok(kernel)
    }
}

/// Memory-to-memory element conversion through the register-to-register
/// convert emitter: pure load, full-vector convert, pure store.
pub struct ConvertKernel {
    caps: CpuFeatures,
    input: Precision,
    output: Precision,
    count: usize,
    mode: RoundMode,
}

impl ConvertKernel {
    pub fn new(
        caps: CpuFeatures,
        input: Precision,
        output: Precision,
        count: usize,
        mode: RoundMode,
    ) -> Self {
        ConvertKernel {
            caps,
            input,
            output,
            count,
            mode,
        }
    }

    fn emit_into(&self, asm: &mut CodeAssembler) -> Result<(), EmitError> {
        let tier = self.caps.tier();
        if self.count > tier.lanes() {
            return Err(EmitError::UnexpectedNum {
                emitter: "convert",
                num: self.count,
                ctx: "elements to convert",
            });
        }

        let mut load = LoadEmitter::new(tier, self.caps, self.input, self.input, self.count, None)?;
        let mut conv = ConvertEmitter::new(tier, self.caps, self.input, self.output, self.mode)?;
        let mut store =
            StoreEmitter::new(tier, self.caps, self.output, self.output, self.count, self.mode)?;

        let scratch_vecs: [u8; 2] = [1, 2];
        let regs = ScratchRegs::new(&SCRATCH_GPRS, &scratch_vecs);

        load.emit(asm, regs, SRC_GPR, 0, 0)?;
        conv.emit(asm, regs, 0, 3)?;
        store.emit(asm, regs, 3, DST_GPR, 0)?;
        asm.ret()?;
        load.emit_data(asm)?;
        conv.emit_data(asm)?;
        store.emit_data(asm)?;
        Ok(())
    }

    /// Assemble at a fixed base address and return the raw bytes.
    pub fn build_code(&self, ip: u64) -> Result<Vec<u8>, EmitError> {
        let mut asm = CodeAssembler::new(64)?;
        self.emit_into(&mut asm)?;
        Ok(asm.assemble(ip)?)
    }

    /// Assemble into executable memory.
    #[cfg(all(unix, target_arch = "x86_64"))]
    pub fn compile(&self) -> Result<CompiledKernel, EmitError> {
        let mut asm = CodeAssembler::new(64)?;
        self.emit_into(&mut asm)?;
        let kernel = CompiledKernel::from_assembler(&mut asm)?;
        log::debug!(
            "compiled convert kernel {} -> {} (n={}, {} bytes)",
            self.input,
            self.output,
            self.count,
            kernel.code_size()
        );
        Ok(kernel)
    }
}

/// A finalized kernel in executable (read+execute) memory.
#[cfg(all(unix, target_arch = "x86_64"))]
pub struct CompiledKernel {
    buf: ExecBuf,
    code_len: usize,
}

#[cfg(all(unix, target_arch = "x86_64"))]
impl CompiledKernel {
    fn from_assembler(asm: &mut CodeAssembler) -> Result<Self, EmitError> {
        // First pass at a placeholder address just measures the length.
        let probe = asm.assemble(0)?;
        let buf = ExecBuf::alloc(probe.len())?;
        let code = asm.assemble(buf.addr() as u64)?;
        if code.len() > buf.capacity() {
            return Err(EmitError::Exec(
                "relocated code exceeded measured length".into(),
            ));
        }
        let code_len = code.len();
        buf.finalize(&code)?;
        Ok(CompiledKernel { buf, code_len })
    }

    /// The callable entry point.
    ///
    /// # Safety
    /// The caller must pass buffers valid for the element count and
    /// precisions the kernel was built with, and must only invoke it on a
    /// CPU providing the features the kernel was built for.
    pub unsafe fn entry(&self) -> TransferFn {
        std::mem::transmute::<*const u8, TransferFn>(self.buf.addr())
    }

    pub fn code_size(&self) -> usize {
        self.code_len
    }
}

#[cfg(all(unix, target_arch = "x86_64"))]
struct ExecBuf {
    ptr: *mut libc::c_void,
    len: usize,
}

#[cfg(all(unix, target_arch = "x86_64"))]
impl ExecBuf {
    fn alloc(len: usize) -> Result<Self, EmitError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let size = len.max(1).div_ceil(page) * page;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(EmitError::Exec(format!(
                "mmap of {size} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(ExecBuf { ptr, len: size })
    }

    fn addr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    fn capacity(&self) -> usize {
        self.len
    }

    /// Copy the code in and flip the mapping to read+execute.
    fn finalize(&self, code: &[u8]) -> Result<(), EmitError> {
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr as *mut u8, code.len());
            if libc::mprotect(self.ptr, self.len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                return Err(EmitError::Exec(format!(
                    "mprotect failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(all(unix, target_arch = "x86_64"))]
impl Drop for ExecBuf {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

// The mapping is immutable once finalized and kernels hold no thread state.
#[cfg(all(unix, target_arch = "x86_64"))]
unsafe impl Send for CompiledKernel {}
#[cfg(all(unix, target_arch = "x86_64"))]
unsafe impl Sync for CompiledKernel {}

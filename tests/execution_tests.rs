//! End-to-end execution tests.
//!
//! Each test runtime-detects the required CPU features and skips gracefully
//! on hardware without them. When supported, kernels are compiled into
//! executable memory, run on real buffers, and checked against scalar
//! references.

#![cfg(all(unix, target_arch = "x86_64"))]

use half::bf16;
use iced_x86::code_asm::CodeAssembler;
use lanejit::{
    ConvertKernel, CpuFeatures, Emitter, FillValue, LoadEmitter, Precision, RoundMode,
    ScratchRegs, StoreEmitter, TransferKernel,
};

// ═══════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════

macro_rules! skip_without_avx2 {
    () => {
        if !std::is_x86_feature_detected!("avx2") {
            eprintln!("AVX2 not supported on this CPU, skipping");
            return;
        }
    };
}

macro_rules! skip_without_avx512 {
    () => {
        if !CpuFeatures::detect().avx512_core {
            eprintln!("AVX-512 not supported on this CPU, skipping");
            return;
        }
    };
}

fn as_bytes<T>(v: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(v.as_ptr() as *const u8, std::mem::size_of_val(v)) }
}

fn as_bytes_mut<T>(v: &mut [T]) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(v.as_mut_ptr() as *mut u8, std::mem::size_of_val(v)) }
}

fn run_transfer(
    src_prc: Precision,
    dst_prc: Precision,
    count: usize,
    mode: RoundMode,
    src: &[u8],
    dst: &mut [u8],
) {
    let _ = env_logger::builder().is_test(true).try_init();
    assert!(src.len() >= count * src_prc.size());
    assert!(dst.len() >= count * dst_prc.size());
    let kernel = TransferKernel::new(CpuFeatures::detect(), src_prc, dst_prc, count, mode)
        .compile()
        .unwrap();
    unsafe { (kernel.entry())(src.as_ptr(), dst.as_mut_ptr()) };
}

// ═══════════════════════════════════════════════════════════════════════
// Pass-through and widening
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn f32_copy_round_trip() {
    skip_without_avx2!();
    let src: [f32; 8] = [1.0, -2.5, 3.25, 0.0, -0.0, 1e30, -1e-30, 42.0];
    let mut dst = [0.0f32; 8];
    run_transfer(
        Precision::F32,
        Precision::F32,
        8,
        RoundMode::Saturate,
        as_bytes(&src),
        as_bytes_mut(&mut dst),
    );
    assert_eq!(src.map(f32::to_bits), dst.map(f32::to_bits));
}

#[test]
fn odd_count_copy_leaves_tail_untouched() {
    skip_without_avx2!();
    let src: [f32; 8] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
    let mut dst = [9.0f32; 8];
    run_transfer(
        Precision::F32,
        Precision::F32,
        5,
        RoundMode::Saturate,
        as_bytes(&src),
        as_bytes_mut(&mut dst),
    );
    assert_eq!(dst[..5], src[..5]);
    assert_eq!(dst[5..], [9.0, 9.0, 9.0]);
}

#[test]
fn f32_copy_round_trips_at_every_count() {
    skip_without_avx2!();
    let lanes = CpuFeatures::detect().tier().lanes();
    let src: Vec<f32> = (0..lanes).map(|i| i as f32 * 1.5 - 3.0).collect();
    for count in 1..=lanes {
        let mut dst = vec![f32::NAN; lanes];
        run_transfer(
            Precision::F32,
            Precision::F32,
            count,
            RoundMode::Saturate,
            as_bytes(&src),
            as_bytes_mut(&mut dst),
        );
        assert_eq!(dst[..count], src[..count], "count {count}");
        assert!(dst[count..].iter().all(|x| x.is_nan()), "count {count} tail");
    }
}

#[test]
fn u8_copy_round_trips_at_every_count() {
    skip_without_avx2!();
    let bytes = CpuFeatures::detect().tier().vec_bytes();
    let src: Vec<u8> = (0..bytes).map(|i| (i as u8).wrapping_mul(37).wrapping_add(1)).collect();
    for count in 1..=bytes {
        let mut dst = vec![0xccu8; bytes];
        run_transfer(
            Precision::U8,
            Precision::U8,
            count,
            RoundMode::Saturate,
            &src,
            &mut dst,
        );
        assert_eq!(dst[..count], src[..count], "count {count}");
        assert!(dst[count..].iter().all(|&b| b == 0xcc), "count {count} tail");
    }
}

#[test]
fn u8_to_f32_widens_unsigned() {
    skip_without_avx2!();
    let src: [u8; 8] = [0, 1, 127, 128, 200, 255, 7, 33];
    let mut dst = [0.0f32; 8];
    run_transfer(
        Precision::U8,
        Precision::F32,
        8,
        RoundMode::Saturate,
        &src,
        as_bytes_mut(&mut dst),
    );
    for (i, &b) in src.iter().enumerate() {
        assert_eq!(dst[i], b as f32);
    }
}

#[test]
fn i8_to_i32_widens_signed() {
    skip_without_avx2!();
    let src: [i8; 8] = [-128, -1, 0, 1, 127, -42, 100, -100];
    let mut dst = [0i32; 8];
    run_transfer(
        Precision::I8,
        Precision::I32,
        8,
        RoundMode::Saturate,
        as_bytes(&src),
        as_bytes_mut(&mut dst),
    );
    for (i, &b) in src.iter().enumerate() {
        assert_eq!(dst[i], b as i32);
    }
}

#[test]
fn bf16_to_f32_is_exact() {
    skip_without_avx2!();
    let values = [1.0f32, -2.5, 0.15625, 1024.0, -0.0, 3.0e38, 1.0e-38, 7.0];
    let src: Vec<u16> = values.iter().map(|&v| bf16::from_f32(v).to_bits()).collect();
    let mut dst = [0.0f32; 8];
    run_transfer(
        Precision::Bf16,
        Precision::F32,
        8,
        RoundMode::Saturate,
        as_bytes(&src),
        as_bytes_mut(&mut dst),
    );
    for i in 0..8 {
        assert_eq!(dst[i], bf16::from_bits(src[i]).to_f32(), "lane {i}");
    }
}

#[test]
fn odd_u16_count_on_avx512() {
    skip_without_avx512!();
    let src: [u16; 7] = [0, 1, 500, 32768, 65535, 42, 9];
    let mut dst = [0i32; 7];
    run_transfer(
        Precision::U16,
        Precision::I32,
        7,
        RoundMode::Saturate,
        as_bytes(&src),
        as_bytes_mut(&mut dst),
    );
    for (i, &w) in src.iter().enumerate() {
        assert_eq!(dst[i], w as i32);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Narrowing stores
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn f32_to_u8_saturates() {
    skip_without_avx2!();
    let src: [f32; 8] = [-5.0, 0.0, 1.6, 127.0, 128.0, 300.0, 255.0, 2.4];
    let mut dst = [0xaau8; 8];
    run_transfer(
        Precision::F32,
        Precision::U8,
        8,
        RoundMode::Saturate,
        as_bytes(&src),
        &mut dst,
    );
    // cvtps2dq rounds to nearest even: 1.6 -> 2, 2.4 -> 2.
    assert_eq!(dst, [0, 0, 2, 127, 128, 255, 255, 2]);
}

#[test]
fn f32_to_i8_saturates() {
    skip_without_avx2!();
    let src: [f32; 8] = [-200.0, -128.0, -1.0, 0.0, 1.0, 127.0, 129.0, 1000.0];
    let mut dst = [0i8; 8];
    run_transfer(
        Precision::F32,
        Precision::I8,
        8,
        RoundMode::Saturate,
        as_bytes(&src),
        as_bytes_mut(&mut dst),
    );
    assert_eq!(dst, [-128, -128, -1, 0, 1, 127, 127, 127]);
}

#[test]
fn f32_to_i8_truncates_to_low_bits() {
    skip_without_avx2!();
    // Truncation converts toward zero, then keeps the low byte: 129 wraps
    // to -127 and -1.5 becomes -1.
    let src: [f32; 8] = [129.0, -1.5, 42.9, 256.0, 300.0, -129.0, 0.0, 64.0];
    let mut dst = [0i8; 8];
    run_transfer(
        Precision::F32,
        Precision::I8,
        8,
        RoundMode::Truncate,
        as_bytes(&src),
        as_bytes_mut(&mut dst),
    );
    let expected: Vec<i8> = src.iter().map(|&x| (x as i32 as u32 & 0xff) as u8 as i8).collect();
    assert_eq!(dst.to_vec(), expected);
}

#[test]
fn i32_to_i16_truncates() {
    skip_without_avx2!();
    let src: [i32; 8] = [70000, -70000, 32767, -32768, 65536, 1, -1, 123456];
    let mut dst = [0i16; 8];
    run_transfer(
        Precision::I32,
        Precision::I16,
        8,
        RoundMode::Truncate,
        as_bytes(&src),
        as_bytes_mut(&mut dst),
    );
    let expected: Vec<i16> = src.iter().map(|&x| (x as u32 & 0xffff) as u16 as i16).collect();
    assert_eq!(dst.to_vec(), expected);
}

#[test]
fn i32_to_u16_saturates() {
    skip_without_avx2!();
    let src: [i32; 8] = [70000, -3, 500, 65535, 65536, 0, 1, -70000];
    let mut dst = [0u16; 8];
    run_transfer(
        Precision::I32,
        Precision::U16,
        8,
        RoundMode::Saturate,
        as_bytes(&src),
        as_bytes_mut(&mut dst),
    );
    assert_eq!(dst, [65535, 0, 500, 65535, 65535, 0, 1, 0]);
}

#[test]
fn i32_to_u8_saturates_on_avx512_partial() {
    skip_without_avx512!();
    let src: [i32; 6] = [-1, 0, 255, 256, 1000, 77];
    let mut dst = [0u8; 6];
    run_transfer(
        Precision::I32,
        Precision::U8,
        6,
        RoundMode::Saturate,
        as_bytes(&src),
        &mut dst,
    );
    assert_eq!(dst, [0, 0, 255, 255, 255, 77]);
}

// ═══════════════════════════════════════════════════════════════════════
// bf16 rounding
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn f32_to_bf16_rounds_to_nearest_even() {
    skip_without_avx2!();
    let src: [f32; 8] = [
        1.0,
        -2.7182817,
        3.1415927,
        65504.0,
        1.0e-3,
        f32::from_bits(0x3f80_8000), // exact tie
        f32::from_bits(0x3f81_8000), // exact tie, odd mantissa
        -0.0,
    ];
    let mut dst = [0u16; 8];
    run_transfer(
        Precision::F32,
        Precision::Bf16,
        8,
        RoundMode::Saturate,
        as_bytes(&src),
        as_bytes_mut(&mut dst),
    );
    for i in 0..8 {
        assert_eq!(
            dst[i],
            bf16::from_f32(src[i]).to_bits(),
            "lane {i} ({})",
            src[i]
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Register-to-register conversion
// ═══════════════════════════════════════════════════════════════════════

fn run_convert(
    input: Precision,
    output: Precision,
    count: usize,
    mode: RoundMode,
    src: &[u8],
    dst: &mut [u8],
) {
    let kernel = ConvertKernel::new(CpuFeatures::detect(), input, output, count, mode)
        .compile()
        .unwrap();
    unsafe { (kernel.entry())(src.as_ptr(), dst.as_mut_ptr()) };
}

#[test]
fn convert_i8_to_u8_saturating() {
    skip_without_avx2!();
    let src: [i8; 8] = [-5, -128, 0, 1, 100, 127, -1, 64];
    let mut dst = [0u8; 8];
    run_convert(
        Precision::I8,
        Precision::U8,
        8,
        RoundMode::Saturate,
        as_bytes(&src),
        &mut dst,
    );
    assert_eq!(dst, [0, 0, 0, 1, 100, 127, 0, 64]);
}

#[test]
fn convert_u8_to_i8_truncating_keeps_bits() {
    skip_without_avx2!();
    let src: [u8; 8] = [0, 1, 127, 128, 200, 255, 66, 99];
    let mut dst = [0i8; 8];
    run_convert(
        Precision::U8,
        Precision::I8,
        8,
        RoundMode::Truncate,
        &src,
        as_bytes_mut(&mut dst),
    );
    let expected: Vec<i8> = src.iter().map(|&b| b as i8).collect();
    assert_eq!(dst.to_vec(), expected);
}

#[test]
fn convert_f32_to_i32_rounding_modes() {
    skip_without_avx2!();
    let src: [f32; 8] = [1.5, 2.5, -1.5, -2.5, 1.9, -1.9, 0.1, -0.1];
    let mut sat = [0i32; 8];
    let mut trunc = [0i32; 8];
    run_convert(
        Precision::F32,
        Precision::I32,
        8,
        RoundMode::Saturate,
        as_bytes(&src),
        as_bytes_mut(&mut sat),
    );
    run_convert(
        Precision::F32,
        Precision::I32,
        8,
        RoundMode::Truncate,
        as_bytes(&src),
        as_bytes_mut(&mut trunc),
    );
    // Nearest-even vs toward-zero.
    assert_eq!(sat, [2, 2, -2, -2, 2, -2, 0, 0]);
    assert_eq!(trunc, [1, 2, -1, -2, 1, -1, 0, 0]);
}

#[test]
fn convert_u8_to_bf16() {
    skip_without_avx2!();
    let src: [u8; 8] = [0, 1, 2, 100, 128, 255, 33, 7];
    let mut dst = [0u16; 8];
    run_convert(
        Precision::U8,
        Precision::Bf16,
        8,
        RoundMode::Saturate,
        &src,
        as_bytes_mut(&mut dst),
    );
    for (i, &b) in src.iter().enumerate() {
        assert_eq!(dst[i], bf16::from_f32(b as f32).to_bits(), "lane {i}");
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Emitter-level composition
// ═══════════════════════════════════════════════════════════════════════

struct JitPage {
    ptr: *mut libc::c_void,
    len: usize,
}

impl JitPage {
    /// Two-pass assembly into an executable page, as the kernel builders
    /// do it, but from a caller-assembled instruction stream.
    fn from_assembler(asm: &mut CodeAssembler) -> Self {
        let probe = asm.assemble(0).unwrap();
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = probe.len().div_ceil(page_size) * page_size;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        let code = asm.assemble(ptr as u64).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
            assert_eq!(
                libc::mprotect(ptr, len, libc::PROT_READ | libc::PROT_EXEC),
                0
            );
        }
        JitPage { ptr, len }
    }

    unsafe fn entry(&self) -> lanejit::TransferFn {
        std::mem::transmute::<*mut libc::c_void, lanejit::TransferFn>(self.ptr)
    }
}

impl Drop for JitPage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

#[test]
fn short_load_with_fill_pads_the_register() {
    skip_without_avx2!();
    let caps = CpuFeatures::detect();
    let tier = caps.tier();
    let lanes = tier.lanes();

    // Load 3 f32, fill the rest of the register with 1.0, store all lanes.
    let mut load =
        LoadEmitter::new(tier, caps, Precision::F32, Precision::F32, 3, Some(FillValue::FloatOne))
            .unwrap();
    let mut store =
        StoreEmitter::new(tier, caps, Precision::F32, Precision::F32, lanes, RoundMode::Saturate)
            .unwrap();

    let mut asm = CodeAssembler::new(64).unwrap();
    let gprs = [0u8, 2, 1]; // rax, rdx, rcx
    let vecs = [1u8, 2];
    let regs = ScratchRegs::new(&gprs, &vecs);
    load.emit(&mut asm, regs, 7, 0, 0).unwrap();
    store.emit(&mut asm, regs, 0, 6, 0).unwrap();
    asm.ret().unwrap();
    load.emit_data(&mut asm).unwrap();
    store.emit_data(&mut asm).unwrap();

    let page = JitPage::from_assembler(&mut asm);
    let src: [f32; 3] = [10.0, 20.0, 30.0];
    let mut dst = vec![0.0f32; lanes];
    unsafe { (page.entry())(src.as_ptr() as *const u8, dst.as_mut_ptr() as *mut u8) };

    assert_eq!(&dst[..3], &src);
    for lane in &dst[3..] {
        assert_eq!(*lane, 1.0);
    }
}

#[test]
fn emitters_declare_enough_scratch() {
    skip_without_avx2!();
    let caps = CpuFeatures::detect();
    let tier = caps.tier();
    let mut store = StoreEmitter::new(
        tier,
        caps,
        Precision::F32,
        Precision::U8,
        3,
        RoundMode::Saturate,
    )
    .unwrap();
    let mut asm = CodeAssembler::new(64).unwrap();
    // One fewer vec than declared must be rejected before any emission.
    let short: [u8; 0] = [];
    let err = store.emit(&mut asm, ScratchRegs::new(&[0, 2, 1], &short), 0, 6, 0);
    assert!(err.is_err());
}

// ═══════════════════════════════════════════════════════════════════════
// Concurrency
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn compiled_kernel_is_shareable_across_threads() {
    skip_without_avx2!();
    let kernel = TransferKernel::new(
        CpuFeatures::detect(),
        Precision::U8,
        Precision::F32,
        8,
        RoundMode::Saturate,
    )
    .compile()
    .unwrap();

    std::thread::scope(|s| {
        for t in 0..4 {
            let kernel = &kernel;
            s.spawn(move || {
                let src: [u8; 8] = [t, 1, 2, 3, 4, 5, 6, 7];
                let mut dst = [0.0f32; 8];
                for _ in 0..1000 {
                    unsafe { (kernel.entry())(src.as_ptr(), dst.as_mut_ptr() as *mut u8) };
                }
                assert_eq!(dst[0], t as f32);
            });
        }
    });
}

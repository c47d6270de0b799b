//! Constant table for emitted kernels.
//!
//! Named 32-bit bit patterns (fill defaults, truncation masks, rounding
//! constants) that the generated code reads from a data region placed after
//! the instruction stream. Entries are registered at emitter construction,
//! only the ones the chosen precision/policy combination needs, and the data
//! block is emitted exactly once per emitter instance.

use iced_x86::code_asm::{CodeAssembler, CodeLabel};

use crate::error::EmitError;

struct Entry {
    key: &'static str,
    value: u32,
    /// Broadcast entries replicate the pattern across the full vector width.
    broadcast: bool,
}

pub(crate) struct ConstTable {
    entries: Vec<Entry>,
    /// Byte width of a broadcast entry (the emitter's register tier width).
    vec_bytes: usize,
    label: Option<CodeLabel>,
    emitted: bool,
}

impl ConstTable {
    pub(crate) fn new(vec_bytes: usize) -> Self {
        ConstTable {
            entries: Vec::new(),
            vec_bytes,
            label: None,
            emitted: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a named bit pattern. Re-registering a key is a no-op so
    /// multiple code paths can declare the same constant.
    pub(crate) fn push(&mut self, key: &'static str, value: u32, broadcast: bool) {
        if self.entries.iter().any(|e| e.key == key) {
            return;
        }
        self.entries.push(Entry {
            key,
            value,
            broadcast,
        });
    }

    /// Byte offset of `key` from the table base.
    pub(crate) fn offset(&self, key: &'static str) -> Result<i32, EmitError> {
        let mut off = 0usize;
        for e in &self.entries {
            if e.key == key {
                return Ok(off as i32);
            }
            off += if e.broadcast { self.vec_bytes } else { 4 };
        }
        Err(EmitError::MissingTableEntry(key))
    }

    /// Label marking the table start, created on first use so the same
    /// label serves every emission of this instance.
    fn label(&mut self, asm: &mut CodeAssembler) -> CodeLabel {
        *self.label.get_or_insert_with(|| asm.create_label())
    }

    /// Load the table base address into `base_gpr` (RIP-relative).
    pub(crate) fn load_base(
        &mut self,
        asm: &mut CodeAssembler,
        base_gpr: u8,
    ) -> Result<(), EmitError> {
        use iced_x86::code_asm::qword_ptr;
        let label = self.label(asm);
        asm.lea(crate::regs::gpr64(base_gpr)?, qword_ptr(label))?;
        Ok(())
    }

    /// Append the table data after the code. Must be called once per
    /// instance by the kernel builder, after all emission calls.
    pub(crate) fn emit_data(&mut self, asm: &mut CodeAssembler) -> Result<(), EmitError> {
        if self.emitted || self.entries.is_empty() {
            self.emitted = true;
            return Ok(());
        }
        let mut label = self.label(asm);
        asm.set_label(&mut label)?;
        self.label = Some(label);
        for e in &self.entries {
            let reps = if e.broadcast { self.vec_bytes / 4 } else { 1 };
            let words = vec![e.value; reps];
            asm.dd(&words)?;
        }
        self.emitted = true;
        Ok(())
    }
}

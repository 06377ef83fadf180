//! Builder for emitting bytecode during compilation.
//!
//! `CodeBuilder` encodes opcodes and operands into raw bytes, manages
//! forward jumps that are patched once their target is known, records the
//! source line of every emitted byte, and tracks the operand-stack depth so
//! the finished [`Code`] carries its maximum stack requirement.

use super::{
    code::{Code, Const},
    op::Opcode,
};

/// Builder for one function body's bytecode.
#[derive(Debug, Default)]
pub(crate) struct CodeBuilder {
    bytecode: Vec<u8>,
    constants: Vec<Const>,
    /// Source line for each emitted byte, parallel to `bytecode`.
    lines: Vec<u32>,
    /// Line recorded for bytes emitted next; set before each statement or
    /// expression is compiled.
    current_line: u32,
    current_stack_depth: u16,
    max_stack_depth: u16,
}

impl CodeBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sets the source line recorded for subsequently emitted instructions.
    pub(crate) fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Emits a no-operand instruction.
    pub(crate) fn emit(&mut self, op: Opcode) {
        self.push_byte(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u8 operand.
    pub(crate) fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.push_byte(op as u8);
        self.push_byte(operand);
        match op {
            // Call pops the callee and the arguments, pushes the result.
            Opcode::Call => self.adjust_stack(-i16::from(operand)),
            _ => {
                if let Some(effect) = op.stack_effect() {
                    self.adjust_stack(effect);
                }
            }
        }
    }

    /// Emits an instruction with an i8 operand.
    pub(crate) fn emit_i8(&mut self, op: Opcode, operand: i8) {
        self.push_byte(op as u8);
        self.push_byte(operand.cast_unsigned());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u16 operand (little-endian).
    pub(crate) fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.push_byte(op as u8);
        let bytes = operand.to_le_bytes();
        self.push_byte(bytes[0]);
        self.push_byte(bytes[1]);
        match op {
            // Build* pop their elements and push one collection.
            Opcode::BuildArray => self.adjust_stack(1 - operand.cast_signed()),
            Opcode::BuildDict => self.adjust_stack(1 - 2 * operand.cast_signed()),
            _ => {
                if let Some(effect) = op.stack_effect() {
                    self.adjust_stack(effect);
                }
            }
        }
    }

    /// Emits `LoadLocal`/`StoreLocal`, widening to the u16 form when needed.
    pub(crate) fn emit_load_local(&mut self, slot: u16) {
        if let Ok(narrow) = u8::try_from(slot) {
            self.emit_u8(Opcode::LoadLocal, narrow);
        } else {
            self.emit_u16(Opcode::LoadLocalW, slot);
        }
    }

    pub(crate) fn emit_store_local(&mut self, slot: u16) {
        if let Ok(narrow) = u8::try_from(slot) {
            self.emit_u8(Opcode::StoreLocal, narrow);
        } else {
            self.emit_u16(Opcode::StoreLocalW, slot);
        }
    }

    /// Emits a `Closure` instruction with its upvalue descriptor pairs.
    pub(crate) fn emit_closure(&mut self, func_const: u16, upvalues: &[(bool, u8)]) {
        self.push_byte(Opcode::Closure as u8);
        let bytes = func_const.to_le_bytes();
        self.push_byte(bytes[0]);
        self.push_byte(bytes[1]);
        for &(is_local, index) in upvalues {
            self.push_byte(u8::from(is_local));
            self.push_byte(index);
        }
        self.adjust_stack(1);
    }

    /// Emits a forward jump, returning a label to patch later.
    ///
    /// The i16 offset operand is a placeholder until `patch_jump`.
    #[must_use]
    pub(crate) fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        let label = JumpLabel(self.bytecode.len());
        self.push_byte(op as u8);
        self.push_byte(0);
        self.push_byte(0);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
        label
    }

    /// Patches a forward jump to land at the current offset.
    ///
    /// The offset is relative to the byte after the operand (where execution
    /// continues if the jump is not taken). Returns `false` when the
    /// distance exceeds i16 range so the compiler can report `jump_too_far`
    /// instead of truncating silently.
    #[must_use]
    pub(crate) fn patch_jump(&mut self, label: JumpLabel) -> bool {
        let target = self.bytecode.len();
        let raw_offset = target as i64 - label.0 as i64 - 3;
        let Ok(offset) = i16::try_from(raw_offset) else {
            return false;
        };
        let bytes = offset.to_le_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
        true
    }

    /// Emits a backward jump to a known target offset.
    #[must_use]
    pub(crate) fn emit_loop(&mut self, target: usize) -> bool {
        let current = self.bytecode.len();
        let raw_offset = target as i64 - (current as i64 + 3);
        let Ok(offset) = i16::try_from(raw_offset) else {
            return false;
        };
        self.push_byte(Opcode::Loop as u8);
        let bytes = offset.to_le_bytes();
        self.push_byte(bytes[0]);
        self.push_byte(bytes[1]);
        true
    }

    /// Current bytecode offset, used to record loop starts.
    #[must_use]
    pub(crate) fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Adds a constant to the pool, returning its index.
    ///
    /// Returns `None` once the pool exceeds the u16 operand range; the
    /// compiler reports `too_many_constants`.
    #[must_use]
    pub(crate) fn add_const(&mut self, value: Const) -> Option<u16> {
        let index = u16::try_from(self.constants.len()).ok()?;
        self.constants.push(value);
        Some(index)
    }

    /// Manually adjusts tracked stack depth.
    ///
    /// Used where the effect is not derivable from a single opcode, such as
    /// the converging arms of pattern-match compilation.
    pub(crate) fn adjust_stack_depth(&mut self, delta: i16) {
        self.adjust_stack(delta);
    }

    /// Builds the final [`Code`] object.
    pub(crate) fn build(self) -> Code {
        Code::new(self.bytecode, self.constants, self.lines, self.max_stack_depth)
    }

    fn push_byte(&mut self, byte: u8) {
        self.bytecode.push(byte);
        self.lines.push(self.current_line);
    }

    fn adjust_stack(&mut self, delta: i16) {
        let new_depth = i32::from(self.current_stack_depth) + i32::from(delta);
        debug_assert!(new_depth >= 0, "stack depth went negative: {new_depth}");
        self.current_stack_depth = u16::try_from(new_depth.max(0)).unwrap_or(u16::MAX);
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);
    }
}

/// Label for a forward jump awaiting a patch.
///
/// Stores the bytecode offset of the jump instruction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpLabel(usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_basic() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::LoadNil);
        builder.emit(Opcode::Pop);
        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::LoadNil as u8, Opcode::Pop as u8]);
    }

    #[test]
    fn emit_u16_operand_is_little_endian() {
        let mut builder = CodeBuilder::new();
        builder.emit_u16(Opcode::LoadConst, 0x1234);
        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::LoadConst as u8, 0x34, 0x12]);
    }

    #[test]
    fn forward_jump_patches_relative_offset() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump(Opcode::Jump);
        builder.emit(Opcode::LoadNil);
        builder.emit(Opcode::LoadNil);
        assert!(builder.patch_jump(jump));
        builder.emit(Opcode::Halt);
        let code = builder.build();
        // Jump at offset 0, target at offset 5: offset = 5 - 0 - 3 = 2.
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::Jump as u8,
                2,
                0,
                Opcode::LoadNil as u8,
                Opcode::LoadNil as u8,
                Opcode::Halt as u8,
            ]
        );
    }

    #[test]
    fn backward_loop_encodes_negative_offset() {
        let mut builder = CodeBuilder::new();
        let start = builder.current_offset();
        builder.emit(Opcode::LoadNil);
        builder.emit(Opcode::Pop);
        assert!(builder.emit_loop(start));
        let code = builder.build();
        let expected = (-5i16).to_le_bytes();
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::LoadNil as u8,
                Opcode::Pop as u8,
                Opcode::Loop as u8,
                expected[0],
                expected[1],
            ]
        );
    }

    #[test]
    fn local_slot_widening() {
        let mut builder = CodeBuilder::new();
        builder.emit_load_local(3);
        builder.emit_load_local(300);
        let code = builder.build();
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::LoadLocal as u8,
                3,
                Opcode::LoadLocalW as u8,
                44,
                1, // 300 little-endian
            ]
        );
    }

    #[test]
    fn lines_parallel_bytecode() {
        let mut builder = CodeBuilder::new();
        builder.set_line(3);
        builder.emit_u16(Opcode::LoadConst, 0);
        builder.set_line(4);
        builder.emit(Opcode::Pop);
        let code = builder.build();
        assert_eq!(code.bytecode().len(), 4);
        assert_eq!(code.line_at(0), 3);
        assert_eq!(code.line_at(2), 3);
        assert_eq!(code.line_at(3), 4);
    }

    #[test]
    fn max_stack_tracks_pushes() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::LoadNil);
        builder.emit(Opcode::LoadNil);
        builder.emit(Opcode::Add);
        builder.emit(Opcode::Pop);
        let code = builder.build();
        assert_eq!(code.max_stack(), 2);
    }

    #[test]
    fn call_effect_uses_arg_count() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::LoadNil); // callee
        builder.emit(Opcode::LoadNil); // arg 1
        builder.emit(Opcode::LoadNil); // arg 2
        builder.emit_u8(Opcode::Call, 2);
        let code = builder.build();
        assert_eq!(code.max_stack(), 3);
    }
}

use crate::table::Table;
use crate::value::Value;

// ── Opcodes ──────────────────────────────────────────────────────────
//
// One byte each, followed by a fixed-width operand. The `_LONG` forms take
// a little-endian u24, the `_SHORT` forms a little-endian u16, jumps a
// little-endian u16 offset.

pub const OP_CONSTANT: u8 = 0;
pub const OP_CONSTANT_LONG: u8 = 1;
pub const OP_NIL: u8 = 2;
pub const OP_TRUE: u8 = 3;
pub const OP_FALSE: u8 = 4;
pub const OP_POP: u8 = 5;
pub const OP_DUP: u8 = 6;
pub const OP_GET_LOCAL: u8 = 7;
pub const OP_GET_LOCAL_SHORT: u8 = 8;
pub const OP_SET_LOCAL: u8 = 9;
pub const OP_SET_LOCAL_SHORT: u8 = 10;
pub const OP_GET_GLOBAL: u8 = 11;
pub const OP_GET_GLOBAL_LONG: u8 = 12;
pub const OP_DEFINE_GLOBAL: u8 = 13;
pub const OP_DEFINE_GLOBAL_LONG: u8 = 14;
pub const OP_SET_GLOBAL: u8 = 15;
pub const OP_SET_GLOBAL_LONG: u8 = 16;
pub const OP_EQUAL: u8 = 17;
pub const OP_GREATER: u8 = 18;
pub const OP_LESS: u8 = 19;
pub const OP_ADD: u8 = 20;
pub const OP_SUBTRACT: u8 = 21;
pub const OP_MULTIPLY: u8 = 22;
pub const OP_DIVIDE: u8 = 23;
pub const OP_MODULO: u8 = 24;
pub const OP_NOT: u8 = 25;
pub const OP_NEGATE: u8 = 26;
pub const OP_PRINT: u8 = 27;
pub const OP_JUMP: u8 = 28;
pub const OP_JUMP_IF_FALSE: u8 = 29;
pub const OP_JUMP_IF_TRUE: u8 = 30;
pub const OP_JUMP_BACK: u8 = 31;
pub const OP_CALL: u8 = 32;
pub const OP_RETURN: u8 = 33;

/// Encoded size of the instruction starting with `op`, operand included.
pub fn instruction_width(op: u8) -> usize {
    match op {
        OP_CONSTANT | OP_GET_LOCAL | OP_SET_LOCAL | OP_GET_GLOBAL | OP_DEFINE_GLOBAL
        | OP_SET_GLOBAL | OP_CALL => 2,
        OP_GET_LOCAL_SHORT | OP_SET_LOCAL_SHORT | OP_JUMP | OP_JUMP_IF_FALSE
        | OP_JUMP_IF_TRUE | OP_JUMP_BACK => 3,
        OP_CONSTANT_LONG | OP_GET_GLOBAL_LONG | OP_DEFINE_GLOBAL_LONG | OP_SET_GLOBAL_LONG => 4,
        _ => 1,
    }
}

// ── Chunk ────────────────────────────────────────────────────────────

/// Append-only bytecode with its constant pool and a per-byte source-line
/// map (`lines.len() == code.len()` always).
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub lines: Vec<u32>,
    constant_map: Table<Value, u32>,
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk {
            code: Vec::new(),
            constants: Vec::new(),
            lines: Vec::new(),
            constant_map: Table::new(),
        }
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Index of `value` in the pool, adding it only if not already present.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        if let Some(&index) = self.constant_map.get(&value) {
            return index;
        }
        let index = self.constants.len() as u32;
        self.constants.push(value);
        self.constant_map.insert(value, index);
        index
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from(self.code[offset]) | u16::from(self.code[offset + 1]) << 8
    }

    pub fn read_u24(&self, offset: usize) -> u32 {
        u32::from(self.code[offset])
            | u32::from(self.code[offset + 1]) << 8
            | u32::from(self.code[offset + 2]) << 16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_keeps_lines_parallel() {
        let mut chunk = Chunk::new();
        chunk.write(OP_NIL, 1);
        chunk.write(OP_POP, 2);
        assert_eq!(chunk.code.len(), chunk.lines.len());
        assert_eq!(chunk.lines, vec![1, 2]);
    }

    #[test]
    fn constants_are_deduplicated() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Number(1.5));
        let b = chunk.add_constant(Value::Number(2.5));
        let again = chunk.add_constant(Value::Number(1.5));
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(chunk.constants.len(), 2);
        assert_eq!(chunk.constants[a as usize], Value::Number(1.5));
    }

    #[test]
    fn repeated_adds_do_not_grow_pool() {
        let mut chunk = Chunk::new();
        for _ in 0..10 {
            assert_eq!(chunk.add_constant(Value::Number(7.0)), 0);
        }
        assert_eq!(chunk.constants.len(), 1);
    }

    #[test]
    fn operand_decoding_is_little_endian() {
        let mut chunk = Chunk::new();
        chunk.write(OP_JUMP, 1);
        chunk.write(0x34, 1);
        chunk.write(0x12, 1);
        assert_eq!(chunk.read_u16(1), 0x1234);

        chunk.write(0x56, 1);
        assert_eq!(chunk.read_u24(1), 0x561234);
    }

    #[test]
    fn widths_cover_every_opcode() {
        assert_eq!(instruction_width(OP_CONSTANT), 2);
        assert_eq!(instruction_width(OP_CONSTANT_LONG), 4);
        assert_eq!(instruction_width(OP_GET_LOCAL_SHORT), 3);
        assert_eq!(instruction_width(OP_JUMP_BACK), 3);
        assert_eq!(instruction_width(OP_CALL), 2);
        assert_eq!(instruction_width(OP_RETURN), 1);
    }
}

use crate::chunk::*;

// ── Disassembler ─────────────────────────────────────────────────────
//
// Debug aid behind SKIFF_DEBUG: chunk dumps after compilation and
// per-instruction traces during interpretation. Writes to stderr so traced
// runs keep their stdout identical to untraced ones.

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    eprintln!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    eprint!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        eprint!("   | ");
    } else {
        eprint!("{:4} ", chunk.lines[offset]);
    }

    let op = chunk.code[offset];
    match op {
        OP_CONSTANT => constant_instruction("OP_CONSTANT", chunk, offset),
        OP_CONSTANT_LONG => long_constant_instruction("OP_CONSTANT_LONG", chunk, offset),
        OP_NIL => simple_instruction("OP_NIL", offset),
        OP_TRUE => simple_instruction("OP_TRUE", offset),
        OP_FALSE => simple_instruction("OP_FALSE", offset),
        OP_POP => simple_instruction("OP_POP", offset),
        OP_DUP => simple_instruction("OP_DUP", offset),
        OP_GET_LOCAL => byte_instruction("OP_GET_LOCAL", chunk, offset),
        OP_GET_LOCAL_SHORT => short_instruction("OP_GET_LOCAL_SHORT", chunk, offset),
        OP_SET_LOCAL => byte_instruction("OP_SET_LOCAL", chunk, offset),
        OP_SET_LOCAL_SHORT => short_instruction("OP_SET_LOCAL_SHORT", chunk, offset),
        OP_GET_GLOBAL => byte_instruction("OP_GET_GLOBAL", chunk, offset),
        OP_GET_GLOBAL_LONG => long_instruction("OP_GET_GLOBAL_LONG", chunk, offset),
        OP_DEFINE_GLOBAL => byte_instruction("OP_DEFINE_GLOBAL", chunk, offset),
        OP_DEFINE_GLOBAL_LONG => long_instruction("OP_DEFINE_GLOBAL_LONG", chunk, offset),
        OP_SET_GLOBAL => byte_instruction("OP_SET_GLOBAL", chunk, offset),
        OP_SET_GLOBAL_LONG => long_instruction("OP_SET_GLOBAL_LONG", chunk, offset),
        OP_EQUAL => simple_instruction("OP_EQUAL", offset),
        OP_GREATER => simple_instruction("OP_GREATER", offset),
        OP_LESS => simple_instruction("OP_LESS", offset),
        OP_ADD => simple_instruction("OP_ADD", offset),
        OP_SUBTRACT => simple_instruction("OP_SUBTRACT", offset),
        OP_MULTIPLY => simple_instruction("OP_MULTIPLY", offset),
        OP_DIVIDE => simple_instruction("OP_DIVIDE", offset),
        OP_MODULO => simple_instruction("OP_MODULO", offset),
        OP_NOT => simple_instruction("OP_NOT", offset),
        OP_NEGATE => simple_instruction("OP_NEGATE", offset),
        OP_PRINT => simple_instruction("OP_PRINT", offset),
        OP_JUMP => jump_instruction("OP_JUMP", 1, chunk, offset),
        OP_JUMP_IF_FALSE => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset),
        OP_JUMP_IF_TRUE => jump_instruction("OP_JUMP_IF_TRUE", 1, chunk, offset),
        OP_JUMP_BACK => jump_instruction("OP_JUMP_BACK", -1, chunk, offset),
        OP_CALL => byte_instruction("OP_CALL", chunk, offset),
        OP_RETURN => simple_instruction("OP_RETURN", offset),
        _ => {
            eprintln!("Unknown opcode {}", op);
            offset + 1
        }
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    eprintln!("{}", name);
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    eprintln!("{:<16}{:4}", name, chunk.code[offset + 1]);
    offset + 2
}

fn short_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    eprintln!("{:<16}{:4}", name, chunk.read_u16(offset + 1));
    offset + 3
}

fn long_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    eprintln!("{:<16}{:4}", name, chunk.read_u24(offset + 1));
    offset + 4
}

fn jump_instruction(name: &str, sign: i64, chunk: &Chunk, offset: usize) -> usize {
    let jump = i64::from(chunk.read_u16(offset + 1));
    let target = offset as i64 + 3 + sign * jump;
    eprintln!("{:<16}{:4} -> {}", name, offset, target);
    offset + 3
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    eprintln!("{:<16}{:4} '{}'", name, constant, chunk.constants[constant]);
    offset + 2
}

fn long_constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.read_u24(offset + 1) as usize;
    eprintln!("{:<16}{:4} '{}'", name, constant, chunk.constants[constant]);
    offset + 4
}

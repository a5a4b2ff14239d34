use inkwell::basic_block::BasicBlock;
use inkwell::builder::{Builder, BuilderError};
use inkwell::context::Context;
use inkwell::module::{Linkage, Module};
use inkwell::types::{FunctionType, StructType};
use inkwell::values::{FunctionValue, IntValue, PointerValue};
use inkwell::{AddressSpace, FloatPredicate, IntPredicate};

use crate::chunk::*;
use crate::object::{ObjFunction, ObjHeader, ObjKind, ObjNative};
use crate::value::{Value, TAG_BOOL, TAG_NIL, TAG_NUMBER, TAG_OBJ, TAG_UNDEFINED};

// ── Bytecode → LLVM IR ───────────────────────────────────────────────
//
// Each function is translated whole: one basic block per instruction
// offset, a local copy of the constant pool, and a `pc` slot kept in sync
// with bytecode offsets so runtime error reports carry the right source
// line. Values on the generated stack use the exact `repr(C, u8)` layout
// of `Value`: tag byte at offset 0, payload at offset 8.
//
// Every compiled function shares one signature:
//   i32 fn(ptr vm, ptr globals, ptr stack_window, ptr stack_top)
// returning 0 for OK and 2 for a runtime error. Calls hand the callee a
// window starting at its own stack slot, so callee-local slot k is
// window[k] and slot 0 is the callee itself.

const STATUS_RUNTIME_ERROR: u64 = 2;

pub(super) struct RuntimeFns<'ctx> {
    pub call_error: FunctionValue<'ctx>,
    pub number_error: FunctionValue<'ctx>,
    pub variable_error: FunctionValue<'ctx>,
    pub arity_error: FunctionValue<'ctx>,
    pub concatenate: FunctionValue<'ctx>,
    pub print: FunctionValue<'ctx>,
    pub call_native: FunctionValue<'ctx>,
}

pub(super) struct Codegen<'ctx, 'm> {
    ctx: &'ctx Context,
    module: &'m Module<'ctx>,
    value_ty: StructType<'ctx>,
    entry_fn_ty: FunctionType<'ctx>,
    pub rt: RuntimeFns<'ctx>,
    falsey: FunctionValue<'ctx>,
    equal: FunctionValue<'ctx>,
}

impl<'ctx, 'm> Codegen<'ctx, 'm> {
    pub fn new(ctx: &'ctx Context, module: &'m Module<'ctx>) -> Result<Codegen<'ctx, 'm>, BuilderError> {
        let i8_ty = ctx.i8_type();
        let i32_ty = ctx.i32_type();
        let f64_ty = ctx.f64_type();
        let void_ty = ctx.void_type();
        let bool_ty = ctx.bool_type();
        let ptr = ctx.ptr_type(AddressSpace::default());

        let value_ty = ctx.struct_type(&[i8_ty.into(), f64_ty.into()], false);
        let entry_fn_ty = i32_ty.fn_type(&[ptr.into(), ptr.into(), ptr.into(), ptr.into()], false);

        let rt = RuntimeFns {
            call_error: module.add_function(
                "skiff_call_error",
                void_ty.fn_type(&[ptr.into(), i32_ty.into()], false),
                None,
            ),
            number_error: module.add_function(
                "skiff_number_error",
                void_ty.fn_type(&[ptr.into(), i32_ty.into()], false),
                None,
            ),
            variable_error: module.add_function(
                "skiff_variable_error",
                void_ty.fn_type(&[ptr.into(), i32_ty.into(), i32_ty.into()], false),
                None,
            ),
            arity_error: module.add_function(
                "skiff_arity_error",
                void_ty.fn_type(
                    &[ptr.into(), i32_ty.into(), i32_ty.into(), i32_ty.into()],
                    false,
                ),
                None,
            ),
            concatenate: module.add_function(
                "skiff_concatenate",
                i32_ty.fn_type(
                    &[ptr.into(), ptr.into(), ptr.into(), ptr.into(), i32_ty.into()],
                    false,
                ),
                None,
            ),
            print: module.add_function(
                "skiff_print",
                void_ty.fn_type(&[ptr.into()], false),
                None,
            ),
            call_native: module.add_function(
                "skiff_call_native",
                void_ty.fn_type(
                    &[ptr.into(), i32_ty.into(), ptr.into(), ptr.into()],
                    false,
                ),
                None,
            ),
        };

        let falsey = module.add_function(
            "_is_falsey",
            bool_ty.fn_type(&[ptr.into()], false),
            Some(Linkage::Internal),
        );
        let equal = module.add_function(
            "_equal",
            bool_ty.fn_type(&[ptr.into(), ptr.into()], false),
            Some(Linkage::Internal),
        );

        let codegen = Codegen {
            ctx,
            module,
            value_ty,
            entry_fn_ty,
            rt,
            falsey,
            equal,
        };
        codegen.generate_falsey()?;
        codegen.generate_equal()?;
        Ok(codegen)
    }

    /// Falsey is exactly nil and false; everything else is truthy.
    fn generate_falsey(&self) -> Result<(), BuilderError> {
        let b = self.ctx.create_builder();
        let f = self.falsey;

        let entry = self.ctx.append_basic_block(f, "entry");
        let truthy = self.ctx.append_basic_block(f, "truthy");
        let falsey = self.ctx.append_basic_block(f, "falsey");
        let not_nil = self.ctx.append_basic_block(f, "not_nil");
        let is_bool = self.ctx.append_basic_block(f, "is_bool");

        b.position_at_end(entry);
        let value_ptr = f.get_nth_param(0).unwrap().into_pointer_value();
        let tag = self.load_tag(&b, value_ptr)?;

        let nil = b.build_int_compare(
            IntPredicate::EQ,
            tag,
            self.ctx.i8_type().const_int(TAG_NIL as u64, false),
            "is_nil",
        )?;
        b.build_conditional_branch(nil, falsey, not_nil)?;

        b.position_at_end(not_nil);
        let boolean = b.build_int_compare(
            IntPredicate::EQ,
            tag,
            self.ctx.i8_type().const_int(TAG_BOOL as u64, false),
            "is_bool",
        )?;
        b.build_conditional_branch(boolean, is_bool, truthy)?;

        b.position_at_end(is_bool);
        let payload = self.payload_ptr(&b, value_ptr)?;
        let byte = b
            .build_load(self.ctx.i8_type(), payload, "bool_byte")?
            .into_int_value();
        let set = b.build_int_compare(
            IntPredicate::NE,
            byte,
            self.ctx.i8_type().const_zero(),
            "is_set",
        )?;
        b.build_conditional_branch(set, truthy, falsey)?;

        b.position_at_end(falsey);
        b.build_return(Some(&self.ctx.bool_type().const_int(1, false)))?;

        b.position_at_end(truthy);
        b.build_return(Some(&self.ctx.bool_type().const_zero()))?;
        Ok(())
    }

    /// Value equality: same variant, same payload. Numbers compare IEEE so
    /// both backends agree on -0.0 and NaN; objects compare by identity.
    fn generate_equal(&self) -> Result<(), BuilderError> {
        let b = self.ctx.create_builder();
        let f = self.equal;
        let i8_ty = self.ctx.i8_type();

        let entry = self.ctx.append_basic_block(f, "entry");
        let same_tag = self.ctx.append_basic_block(f, "same_tag");
        let bool_bb = self.ctx.append_basic_block(f, "bool");
        let number_bb = self.ctx.append_basic_block(f, "number");
        let obj_bb = self.ctx.append_basic_block(f, "obj");
        let true_bb = self.ctx.append_basic_block(f, "always_equal");
        let false_bb = self.ctx.append_basic_block(f, "not_equal");

        b.position_at_end(entry);
        let a_ptr = f.get_nth_param(0).unwrap().into_pointer_value();
        let b_ptr = f.get_nth_param(1).unwrap().into_pointer_value();
        let a_tag = self.load_tag(&b, a_ptr)?;
        let b_tag = self.load_tag(&b, b_ptr)?;
        let ne = b.build_int_compare(IntPredicate::NE, a_tag, b_tag, "tag_ne")?;
        b.build_conditional_branch(ne, false_bb, same_tag)?;

        b.position_at_end(same_tag);
        b.build_switch(
            a_tag,
            true_bb,
            &[
                (i8_ty.const_int(TAG_BOOL as u64, false), bool_bb),
                (i8_ty.const_int(TAG_NUMBER as u64, false), number_bb),
                (i8_ty.const_int(TAG_OBJ as u64, false), obj_bb),
            ],
        )?;

        b.position_at_end(bool_bb);
        let a_byte = b
            .build_load(i8_ty, self.payload_ptr(&b, a_ptr)?, "a_bool")?
            .into_int_value();
        let b_byte = b
            .build_load(i8_ty, self.payload_ptr(&b, b_ptr)?, "b_bool")?
            .into_int_value();
        let eq = b.build_int_compare(IntPredicate::EQ, a_byte, b_byte, "bool_eq")?;
        b.build_return(Some(&eq))?;

        b.position_at_end(number_bb);
        let f64_ty = self.ctx.f64_type();
        let a_num = b
            .build_load(f64_ty, self.payload_ptr(&b, a_ptr)?, "a_num")?
            .into_float_value();
        let b_num = b
            .build_load(f64_ty, self.payload_ptr(&b, b_ptr)?, "b_num")?
            .into_float_value();
        let eq = b.build_float_compare(FloatPredicate::OEQ, a_num, b_num, "num_eq")?;
        b.build_return(Some(&eq))?;

        b.position_at_end(obj_bb);
        let i64_ty = self.ctx.i64_type();
        let a_obj = b
            .build_load(i64_ty, self.payload_ptr(&b, a_ptr)?, "a_obj")?
            .into_int_value();
        let b_obj = b
            .build_load(i64_ty, self.payload_ptr(&b, b_ptr)?, "b_obj")?
            .into_int_value();
        let eq = b.build_int_compare(IntPredicate::EQ, a_obj, b_obj, "obj_eq")?;
        b.build_return(Some(&eq))?;

        // Nil and the undefined sentinel carry no payload.
        b.position_at_end(true_bb);
        b.build_return(Some(&self.ctx.bool_type().const_int(1, false)))?;

        b.position_at_end(false_bb);
        b.build_return(Some(&self.ctx.bool_type().const_zero()))?;
        Ok(())
    }

    /// The trampoline: allocates the real stack, reserves slot 0, and calls
    /// the root function with top = 1.
    pub fn generate_main(
        &self,
        name: &str,
        root: FunctionValue<'ctx>,
    ) -> Result<FunctionValue<'ctx>, BuilderError> {
        let i32_ty = self.ctx.i32_type();
        let ptr = self.ctx.ptr_type(AddressSpace::default());
        let fn_ty = i32_ty.fn_type(&[ptr.into(), ptr.into()], false);
        let f = self.module.add_function(name, fn_ty, None);

        let b = self.ctx.create_builder();
        let entry = self.ctx.append_basic_block(f, "main_entry");
        b.position_at_end(entry);

        let stack = b.build_array_alloca(
            self.value_ty,
            i32_ty.const_int(crate::vm::STACK_MAX as u64, false),
            "stack",
        )?;
        let stack_top = b.build_alloca(i32_ty, "stack_top")?;
        b.build_store(stack_top, i32_ty.const_int(1, false))?;

        let vm = f.get_nth_param(0).unwrap();
        let globals = f.get_nth_param(1).unwrap();
        let status = b
            .build_call(
                root,
                &[vm.into(), globals.into(), stack.into(), stack_top.into()],
                "status",
            )?
            .try_as_basic_value()
            .left()
            .unwrap();
        b.build_return(Some(&status))?;
        Ok(f)
    }

    fn load_tag(
        &self,
        b: &Builder<'ctx>,
        value_ptr: PointerValue<'ctx>,
    ) -> Result<IntValue<'ctx>, BuilderError> {
        let tag_ptr = b.build_struct_gep(self.value_ty, value_ptr, 0, "tag_ptr")?;
        Ok(b.build_load(self.ctx.i8_type(), tag_ptr, "tag")?.into_int_value())
    }

    fn payload_ptr(
        &self,
        b: &Builder<'ctx>,
        value_ptr: PointerValue<'ctx>,
    ) -> Result<PointerValue<'ctx>, BuilderError> {
        b.build_struct_gep(self.value_ty, value_ptr, 1, "payload_ptr")
    }

    /// Translate one chunk into a module function with the entry signature.
    pub fn generate_function(
        &self,
        chunk: &Chunk,
        name: &str,
    ) -> Result<FunctionValue<'ctx>, BuilderError> {
        let func = self.module.add_function(name, self.entry_fn_ty, None);
        let b = self.ctx.create_builder();

        let entry = self.ctx.append_basic_block(func, "entry");
        b.position_at_end(entry);

        let i8_ty = self.ctx.i8_type();
        let i32_ty = self.ctx.i32_type();
        let i64_ty = self.ctx.i64_type();
        let f64_ty = self.ctx.f64_type();

        // Local copy of the constant pool. Numbers become constant structs;
        // object constants are int-to-pointer immediates of host addresses.
        let pool_len = chunk.constants.len().max(1);
        let constants = b.build_array_alloca(
            self.value_ty,
            i32_ty.const_int(pool_len as u64, false),
            "constants",
        )?;
        for (i, constant) in chunk.constants.iter().enumerate() {
            let slot = unsafe {
                b.build_in_bounds_gep(
                    self.value_ty,
                    constants,
                    &[i32_ty.const_int(i as u64, false)],
                    "const_slot",
                )?
            };
            match *constant {
                Value::Number(n) => {
                    let init = self.value_ty.const_named_struct(&[
                        i8_ty.const_int(TAG_NUMBER as u64, false).into(),
                        f64_ty.const_float(n).into(),
                    ]);
                    b.build_store(slot, init)?;
                }
                Value::Obj(p) => {
                    let tag_ptr = b.build_struct_gep(self.value_ty, slot, 0, "tag_ptr")?;
                    b.build_store(tag_ptr, i8_ty.const_int(TAG_OBJ as u64, false))?;
                    let payload = self.payload_ptr(&b, slot)?;
                    b.build_store(payload, i64_ty.const_int(p as u64, false))?;
                }
                _ => unreachable!("only numbers and objects appear in constant pools"),
            }
        }

        let pc = b.build_alloca(i32_ty, "pc")?;
        b.build_store(pc, i32_ty.const_zero())?;

        let temp1 = b.build_alloca(self.value_ty, "temp1")?;
        let temp2 = b.build_alloca(self.value_ty, "temp2")?;
        let temp3 = b.build_alloca(self.value_ty, "temp3")?;

        // One basic block per instruction offset.
        let mut blocks: Vec<Option<BasicBlock<'ctx>>> = vec![None; chunk.len()];
        let mut offset = 0;
        while offset < chunk.len() {
            blocks[offset] = Some(
                self.ctx
                    .append_basic_block(func, &format!("{}_bb", offset)),
            );
            offset += instruction_width(chunk.code[offset]);
        }
        let return_bb = self.ctx.append_basic_block(func, "return");

        let mut emitter = FnEmitter {
            g: self,
            b,
            chunk,
            func,
            vm: func.get_nth_param(0).unwrap().into_pointer_value(),
            globals: func.get_nth_param(1).unwrap().into_pointer_value(),
            stack: func.get_nth_param(2).unwrap().into_pointer_value(),
            stack_top: func.get_nth_param(3).unwrap().into_pointer_value(),
            pc,
            constants,
            temp1,
            temp2,
            temp3,
            blocks,
            return_bb,
        };

        emitter.b.position_at_end(entry);
        // Re-position after the allocas: branch into offset 0.
        emitter
            .b
            .build_unconditional_branch(emitter.blocks[0].unwrap())?;

        emitter.translate()?;

        emitter.b.position_at_end(return_bb);
        emitter
            .b
            .build_return(Some(&i32_ty.const_zero()))?;

        Ok(func)
    }
}

struct FnEmitter<'ctx, 'g, 'm> {
    g: &'g Codegen<'ctx, 'm>,
    b: Builder<'ctx>,
    chunk: &'g Chunk,
    func: FunctionValue<'ctx>,
    vm: PointerValue<'ctx>,
    globals: PointerValue<'ctx>,
    stack: PointerValue<'ctx>,
    stack_top: PointerValue<'ctx>,
    pc: PointerValue<'ctx>,
    constants: PointerValue<'ctx>,
    temp1: PointerValue<'ctx>,
    temp2: PointerValue<'ctx>,
    temp3: PointerValue<'ctx>,
    blocks: Vec<Option<BasicBlock<'ctx>>>,
    return_bb: BasicBlock<'ctx>,
}

impl<'ctx, 'g, 'm> FnEmitter<'ctx, 'g, 'm> {
    fn translate(&mut self) -> Result<(), BuilderError> {
        let mut offset = 0;
        while offset < self.chunk.len() {
            self.b.position_at_end(self.blocks[offset].unwrap());
            let op = self.chunk.code[offset];
            match op {
                OP_CONSTANT => {
                    let index = self.chunk.code[offset + 1] as u64;
                    self.op_constant(offset, index, 2)?;
                }
                OP_CONSTANT_LONG => {
                    let index = self.chunk.read_u24(offset + 1) as u64;
                    self.op_constant(offset, index, 4)?;
                }
                OP_NIL => {
                    let init = self.g.value_ty.const_named_struct(&[
                        self.i8(TAG_NIL as u64).into(),
                        self.g.ctx.f64_type().const_float(0.0).into(),
                    ]);
                    let top = self.load_top()?;
                    let slot = self.stack_at(self.stack, top)?;
                    self.b.build_store(slot, init)?;
                    self.bump_top(top, 1)?;
                    self.step(offset, 1)?;
                }
                OP_TRUE => self.op_bool_literal(offset, 1)?,
                OP_FALSE => self.op_bool_literal(offset, 0)?,
                OP_POP => {
                    let top = self.load_top()?;
                    let new_top = self.b.build_int_sub(top, self.i32v(1), "dec_top")?;
                    self.b.build_store(self.stack_top, new_top)?;
                    self.step(offset, 1)?;
                }
                OP_DUP => {
                    let top = self.load_top()?;
                    let below = self.b.build_int_sub(top, self.i32v(1), "below")?;
                    let src = self.stack_at(self.stack, below)?;
                    let value = self.b.build_load(self.g.value_ty, src, "dup")?;
                    let dst = self.stack_at(self.stack, top)?;
                    self.b.build_store(dst, value)?;
                    self.bump_top(top, 1)?;
                    self.step(offset, 1)?;
                }
                OP_GET_LOCAL => {
                    let slot = self.chunk.code[offset + 1] as u64;
                    self.op_get_local(offset, slot, 2)?;
                }
                OP_GET_LOCAL_SHORT => {
                    let slot = self.chunk.read_u16(offset + 1) as u64;
                    self.op_get_local(offset, slot, 3)?;
                }
                OP_SET_LOCAL => {
                    let slot = self.chunk.code[offset + 1] as u64;
                    self.op_set_local(offset, slot, 2)?;
                }
                OP_SET_LOCAL_SHORT => {
                    let slot = self.chunk.read_u16(offset + 1) as u64;
                    self.op_set_local(offset, slot, 3)?;
                }
                OP_GET_GLOBAL => {
                    let index = self.chunk.code[offset + 1] as u64;
                    self.op_get_global(offset, index, 2)?;
                }
                OP_GET_GLOBAL_LONG => {
                    let index = self.chunk.read_u24(offset + 1) as u64;
                    self.op_get_global(offset, index, 4)?;
                }
                OP_DEFINE_GLOBAL => {
                    let index = self.chunk.code[offset + 1] as u64;
                    self.op_define_global(offset, index, 2)?;
                }
                OP_DEFINE_GLOBAL_LONG => {
                    let index = self.chunk.read_u24(offset + 1) as u64;
                    self.op_define_global(offset, index, 4)?;
                }
                OP_SET_GLOBAL => {
                    let index = self.chunk.code[offset + 1] as u64;
                    self.op_set_global(offset, index, 2)?;
                }
                OP_SET_GLOBAL_LONG => {
                    let index = self.chunk.read_u24(offset + 1) as u64;
                    self.op_set_global(offset, index, 4)?;
                }
                OP_EQUAL => self.op_equal(offset)?,
                OP_GREATER => self.op_comparison(offset, FloatPredicate::OGT)?,
                OP_LESS => self.op_comparison(offset, FloatPredicate::OLT)?,
                OP_ADD => self.op_add(offset)?,
                OP_SUBTRACT => self.op_arithmetic(offset, Arith::Sub)?,
                OP_MULTIPLY => self.op_arithmetic(offset, Arith::Mul)?,
                OP_DIVIDE => self.op_arithmetic(offset, Arith::Div)?,
                OP_MODULO => self.op_arithmetic(offset, Arith::Rem)?,
                OP_NOT => self.op_not(offset)?,
                OP_NEGATE => self.op_negate(offset)?,
                OP_PRINT => self.op_print(offset)?,
                OP_JUMP => {
                    let jump = self.chunk.read_u16(offset + 1) as usize;
                    self.advance_pc((3 + jump) as i64)?;
                    self.branch_to(offset + 3 + jump)?;
                }
                OP_JUMP_IF_FALSE => self.op_conditional_jump(offset, false)?,
                OP_JUMP_IF_TRUE => self.op_conditional_jump(offset, true)?,
                OP_JUMP_BACK => {
                    let jump = self.chunk.read_u16(offset + 1) as usize;
                    self.advance_pc(3 - jump as i64)?;
                    self.branch_to(offset + 3 - jump)?;
                }
                OP_CALL => {
                    let arg_count = self.chunk.code[offset + 1] as u64;
                    self.op_call(offset, arg_count)?;
                }
                OP_RETURN => {
                    self.b.build_unconditional_branch(self.return_bb)?;
                }
                _ => unreachable!("unknown opcode {} in chunk", op),
            }
            offset += instruction_width(op);
        }
        Ok(())
    }

    // ── Small helpers ────────────────────────────────────────────

    fn i8(&self, v: u64) -> IntValue<'ctx> {
        self.g.ctx.i8_type().const_int(v, false)
    }

    fn i32v(&self, v: u64) -> IntValue<'ctx> {
        self.g.ctx.i32_type().const_int(v, false)
    }

    fn load_top(&self) -> Result<IntValue<'ctx>, BuilderError> {
        Ok(self
            .b
            .build_load(self.g.ctx.i32_type(), self.stack_top, "top")?
            .into_int_value())
    }

    fn bump_top(&self, top: IntValue<'ctx>, by: u64) -> Result<(), BuilderError> {
        let new_top = self.b.build_int_add(top, self.i32v(by), "inc_top")?;
        self.b.build_store(self.stack_top, new_top)?;
        Ok(())
    }

    fn stack_at(
        &self,
        base: PointerValue<'ctx>,
        index: IntValue<'ctx>,
    ) -> Result<PointerValue<'ctx>, BuilderError> {
        unsafe {
            self.b
                .build_in_bounds_gep(self.g.value_ty, base, &[index], "slot")
        }
    }

    fn tag_at(&self, value_ptr: PointerValue<'ctx>) -> Result<IntValue<'ctx>, BuilderError> {
        self.g.load_tag(&self.b, value_ptr)
    }

    fn payload_at(&self, value_ptr: PointerValue<'ctx>) -> Result<PointerValue<'ctx>, BuilderError> {
        self.g.payload_ptr(&self.b, value_ptr)
    }

    fn advance_pc(&self, by: i64) -> Result<(), BuilderError> {
        let pc = self
            .b
            .build_load(self.g.ctx.i32_type(), self.pc, "pc")?
            .into_int_value();
        let delta = self.g.ctx.i32_type().const_int(by as u64, true);
        let next = self.b.build_int_add(pc, delta, "next_pc")?;
        self.b.build_store(self.pc, next)?;
        Ok(())
    }

    fn load_pc(&self) -> Result<IntValue<'ctx>, BuilderError> {
        Ok(self
            .b
            .build_load(self.g.ctx.i32_type(), self.pc, "pc")?
            .into_int_value())
    }

    fn branch_to(&self, offset: usize) -> Result<(), BuilderError> {
        self.b
            .build_unconditional_branch(self.blocks[offset].unwrap())?;
        Ok(())
    }

    /// pc += width; br block[offset + width]
    fn step(&self, offset: usize, width: usize) -> Result<(), BuilderError> {
        self.advance_pc(width as i64)?;
        self.branch_to(offset + width)
    }

    /// Report through `error_fn(vm, extra..., pc)` and return RUNTIME_ERROR.
    fn emit_error_return(
        &self,
        error_fn: FunctionValue<'ctx>,
        extra: &[IntValue<'ctx>],
    ) -> Result<(), BuilderError> {
        let pc = self.load_pc()?;
        let mut args: Vec<inkwell::values::BasicMetadataValueEnum> = vec![self.vm.into()];
        for value in extra {
            args.push((*value).into());
        }
        args.push(pc.into());
        self.b.build_call(error_fn, &args, "")?;
        self.b
            .build_return(Some(&self.i32v(STATUS_RUNTIME_ERROR)))?;
        Ok(())
    }

    fn append_block(&self, name: &str) -> BasicBlock<'ctx> {
        self.g.ctx.append_basic_block(self.func, name)
    }

    // ── Opcode lowering ──────────────────────────────────────────

    fn op_constant(&self, offset: usize, index: u64, width: usize) -> Result<(), BuilderError> {
        let slot = self.stack_at(self.constants, self.i32v(index))?;
        let value = self.b.build_load(self.g.value_ty, slot, "constant")?;
        let top = self.load_top()?;
        let dst = self.stack_at(self.stack, top)?;
        self.b.build_store(dst, value)?;
        self.bump_top(top, 1)?;
        self.step(offset, width)
    }

    fn op_bool_literal(&self, offset: usize, byte: u64) -> Result<(), BuilderError> {
        let top = self.load_top()?;
        let slot = self.stack_at(self.stack, top)?;
        let tag_ptr = self
            .b
            .build_struct_gep(self.g.value_ty, slot, 0, "tag_ptr")?;
        self.b.build_store(tag_ptr, self.i8(TAG_BOOL as u64))?;
        let payload = self.payload_at(slot)?;
        self.b.build_store(payload, self.i8(byte))?;
        self.bump_top(top, 1)?;
        self.step(offset, 1)
    }

    fn op_get_local(&self, offset: usize, slot: u64, width: usize) -> Result<(), BuilderError> {
        let src = self.stack_at(self.stack, self.i32v(slot))?;
        let value = self.b.build_load(self.g.value_ty, src, "local")?;
        let top = self.load_top()?;
        let dst = self.stack_at(self.stack, top)?;
        self.b.build_store(dst, value)?;
        self.bump_top(top, 1)?;
        self.step(offset, width)
    }

    fn op_set_local(&self, offset: usize, slot: u64, width: usize) -> Result<(), BuilderError> {
        let top = self.load_top()?;
        let below = self.b.build_int_sub(top, self.i32v(1), "below")?;
        let src = self.stack_at(self.stack, below)?;
        let value = self.b.build_load(self.g.value_ty, src, "top_value")?;
        let dst = self.stack_at(self.stack, self.i32v(slot))?;
        self.b.build_store(dst, value)?;
        self.step(offset, width)
    }

    fn op_get_global(&self, offset: usize, index: u64, width: usize) -> Result<(), BuilderError> {
        let addr = self.stack_at(self.globals, self.i32v(index))?;
        let value = self.b.build_load(self.g.value_ty, addr, "global")?;
        let tag = self.tag_at(addr)?;
        let undefined = self.b.build_int_compare(
            IntPredicate::EQ,
            tag,
            self.i8(TAG_UNDEFINED as u64),
            "is_undefined",
        )?;

        let error_bb = self.append_block("undefined");
        let ok_bb = self.append_block("defined");
        self.b.build_conditional_branch(undefined, error_bb, ok_bb)?;

        self.b.position_at_end(error_bb);
        self.emit_error_return(self.g.rt.variable_error, &[self.i32v(index)])?;

        self.b.position_at_end(ok_bb);
        let top = self.load_top()?;
        let dst = self.stack_at(self.stack, top)?;
        self.b.build_store(dst, value)?;
        self.bump_top(top, 1)?;
        self.step(offset, width)
    }

    fn op_define_global(&self, offset: usize, index: u64, width: usize) -> Result<(), BuilderError> {
        let top = self.load_top()?;
        let below = self.b.build_int_sub(top, self.i32v(1), "below")?;
        let src = self.stack_at(self.stack, below)?;
        let value = self.b.build_load(self.g.value_ty, src, "defined_value")?;
        let dst = self.stack_at(self.globals, self.i32v(index))?;
        self.b.build_store(dst, value)?;
        self.b.build_store(self.stack_top, below)?;
        self.step(offset, width)
    }

    fn op_set_global(&self, offset: usize, index: u64, width: usize) -> Result<(), BuilderError> {
        let addr = self.stack_at(self.globals, self.i32v(index))?;
        let tag = self.tag_at(addr)?;
        let undefined = self.b.build_int_compare(
            IntPredicate::EQ,
            tag,
            self.i8(TAG_UNDEFINED as u64),
            "is_undefined",
        )?;

        let error_bb = self.append_block("undefined");
        let ok_bb = self.append_block("defined");
        self.b.build_conditional_branch(undefined, error_bb, ok_bb)?;

        self.b.position_at_end(error_bb);
        self.emit_error_return(self.g.rt.variable_error, &[self.i32v(index)])?;

        self.b.position_at_end(ok_bb);
        // Assignment is an expression: the value stays on the stack.
        let top = self.load_top()?;
        let below = self.b.build_int_sub(top, self.i32v(1), "below")?;
        let src = self.stack_at(self.stack, below)?;
        let value = self.b.build_load(self.g.value_ty, src, "assigned_value")?;
        self.b.build_store(addr, value)?;
        self.step(offset, width)
    }

    fn op_equal(&self, offset: usize) -> Result<(), BuilderError> {
        let top = self.load_top()?;
        let b_index = self.b.build_int_sub(top, self.i32v(1), "b_index")?;
        let a_index = self.b.build_int_sub(top, self.i32v(2), "a_index")?;
        let b_addr = self.stack_at(self.stack, b_index)?;
        let a_addr = self.stack_at(self.stack, a_index)?;

        let eq = self
            .b
            .build_call(self.g.equal, &[a_addr.into(), b_addr.into()], "eq")?
            .try_as_basic_value()
            .left()
            .unwrap()
            .into_int_value();

        let tag_ptr = self
            .b
            .build_struct_gep(self.g.value_ty, a_addr, 0, "tag_ptr")?;
        self.b.build_store(tag_ptr, self.i8(TAG_BOOL as u64))?;
        let byte = self
            .b
            .build_int_z_extend(eq, self.g.ctx.i8_type(), "bool_byte")?;
        self.b.build_store(self.payload_at(a_addr)?, byte)?;

        self.b.build_store(self.stack_top, b_index)?;
        self.step(offset, 1)
    }

    /// Split off an error path unless both operand tags are NUMBER; leaves
    /// the builder on the ok path and returns the two operand addresses.
    fn require_numbers(
        &self,
        a_addr: PointerValue<'ctx>,
        b_addr: PointerValue<'ctx>,
    ) -> Result<(), BuilderError> {
        let a_tag = self.tag_at(a_addr)?;
        let b_tag = self.tag_at(b_addr)?;
        let a_bad = self.b.build_int_compare(
            IntPredicate::NE,
            a_tag,
            self.i8(TAG_NUMBER as u64),
            "a_not_number",
        )?;
        let b_bad = self.b.build_int_compare(
            IntPredicate::NE,
            b_tag,
            self.i8(TAG_NUMBER as u64),
            "b_not_number",
        )?;
        let bad = self.b.build_or(a_bad, b_bad, "not_numbers")?;

        let error_bb = self.append_block("number_error");
        let ok_bb = self.append_block("numbers");
        self.b.build_conditional_branch(bad, error_bb, ok_bb)?;

        self.b.position_at_end(error_bb);
        self.emit_error_return(self.g.rt.number_error, &[])?;

        self.b.position_at_end(ok_bb);
        Ok(())
    }

    fn op_comparison(&self, offset: usize, predicate: FloatPredicate) -> Result<(), BuilderError> {
        let top = self.load_top()?;
        let b_index = self.b.build_int_sub(top, self.i32v(1), "b_index")?;
        let a_index = self.b.build_int_sub(top, self.i32v(2), "a_index")?;
        let b_addr = self.stack_at(self.stack, b_index)?;
        let a_addr = self.stack_at(self.stack, a_index)?;

        self.require_numbers(a_addr, b_addr)?;

        let f64_ty = self.g.ctx.f64_type();
        let a = self
            .b
            .build_load(f64_ty, self.payload_at(a_addr)?, "a")?
            .into_float_value();
        let b_val = self
            .b
            .build_load(f64_ty, self.payload_at(b_addr)?, "b")?
            .into_float_value();
        let cmp = self.b.build_float_compare(predicate, a, b_val, "cmp")?;

        let tag_ptr = self
            .b
            .build_struct_gep(self.g.value_ty, a_addr, 0, "tag_ptr")?;
        self.b.build_store(tag_ptr, self.i8(TAG_BOOL as u64))?;
        let byte = self
            .b
            .build_int_z_extend(cmp, self.g.ctx.i8_type(), "bool_byte")?;
        self.b.build_store(self.payload_at(a_addr)?, byte)?;

        self.b.build_store(self.stack_top, b_index)?;
        self.step(offset, 1)
    }

    fn op_add(&self, offset: usize) -> Result<(), BuilderError> {
        let top = self.load_top()?;
        let b_index = self.b.build_int_sub(top, self.i32v(1), "b_index")?;
        let a_index = self.b.build_int_sub(top, self.i32v(2), "a_index")?;
        let b_addr = self.stack_at(self.stack, b_index)?;
        let a_addr = self.stack_at(self.stack, a_index)?;

        let a_tag = self.tag_at(a_addr)?;
        let b_tag = self.tag_at(b_addr)?;
        let a_bad = self.b.build_int_compare(
            IntPredicate::NE,
            a_tag,
            self.i8(TAG_NUMBER as u64),
            "a_not_number",
        )?;
        let b_bad = self.b.build_int_compare(
            IntPredicate::NE,
            b_tag,
            self.i8(TAG_NUMBER as u64),
            "b_not_number",
        )?;
        let polymorphic = self.b.build_or(a_bad, b_bad, "polymorphic")?;

        let concat_bb = self.append_block("concatenate");
        let error_bb = self.append_block("concat_error");
        let numbers_bb = self.append_block("numbers");
        let end_bb = self.append_block("add_end");

        self.b
            .build_conditional_branch(polymorphic, concat_bb, numbers_bb)?;

        // Runtime call handles string concatenation and coercion.
        self.b.position_at_end(concat_bb);
        let a_value = self.b.build_load(self.g.value_ty, a_addr, "a_value")?;
        self.b.build_store(self.temp1, a_value)?;
        let b_value = self.b.build_load(self.g.value_ty, b_addr, "b_value")?;
        self.b.build_store(self.temp2, b_value)?;
        let pc = self.load_pc()?;
        let status = self
            .b
            .build_call(
                self.g.rt.concatenate,
                &[
                    self.vm.into(),
                    self.temp3.into(),
                    self.temp1.into(),
                    self.temp2.into(),
                    pc.into(),
                ],
                "status",
            )?
            .try_as_basic_value()
            .left()
            .unwrap()
            .into_int_value();
        let result = self.b.build_load(self.g.value_ty, self.temp3, "result")?;
        self.b.build_store(a_addr, result)?;
        let ok = self.b.build_int_compare(
            IntPredicate::EQ,
            status,
            self.i32v(0),
            "concat_ok",
        )?;
        self.b.build_conditional_branch(ok, end_bb, error_bb)?;

        self.b.position_at_end(error_bb);
        self.b
            .build_return(Some(&self.i32v(STATUS_RUNTIME_ERROR)))?;

        self.b.position_at_end(numbers_bb);
        let f64_ty = self.g.ctx.f64_type();
        let a = self
            .b
            .build_load(f64_ty, self.payload_at(a_addr)?, "a")?
            .into_float_value();
        let b_val = self
            .b
            .build_load(f64_ty, self.payload_at(b_addr)?, "b")?
            .into_float_value();
        let sum = self.b.build_float_add(a, b_val, "sum")?;
        self.b.build_store(self.payload_at(a_addr)?, sum)?;
        self.b.build_unconditional_branch(end_bb)?;

        self.b.position_at_end(end_bb);
        self.b.build_store(self.stack_top, b_index)?;
        self.step(offset, 1)
    }

    fn op_arithmetic(&self, offset: usize, op: Arith) -> Result<(), BuilderError> {
        let top = self.load_top()?;
        let b_index = self.b.build_int_sub(top, self.i32v(1), "b_index")?;
        let a_index = self.b.build_int_sub(top, self.i32v(2), "a_index")?;
        let b_addr = self.stack_at(self.stack, b_index)?;
        let a_addr = self.stack_at(self.stack, a_index)?;

        self.require_numbers(a_addr, b_addr)?;

        let f64_ty = self.g.ctx.f64_type();
        let a = self
            .b
            .build_load(f64_ty, self.payload_at(a_addr)?, "a")?
            .into_float_value();
        let b_val = self
            .b
            .build_load(f64_ty, self.payload_at(b_addr)?, "b")?
            .into_float_value();
        let result = match op {
            Arith::Sub => self.b.build_float_sub(a, b_val, "difference")?,
            Arith::Mul => self.b.build_float_mul(a, b_val, "product")?,
            Arith::Div => self.b.build_float_div(a, b_val, "quotient")?,
            Arith::Rem => self.b.build_float_rem(a, b_val, "remainder")?,
        };
        self.b.build_store(self.payload_at(a_addr)?, result)?;

        self.b.build_store(self.stack_top, b_index)?;
        self.step(offset, 1)
    }

    fn op_not(&self, offset: usize) -> Result<(), BuilderError> {
        let top = self.load_top()?;
        let index = self.b.build_int_sub(top, self.i32v(1), "index")?;
        let addr = self.stack_at(self.stack, index)?;

        let falsey = self
            .b
            .build_call(self.g.falsey, &[addr.into()], "falsey")?
            .try_as_basic_value()
            .left()
            .unwrap()
            .into_int_value();

        let tag_ptr = self
            .b
            .build_struct_gep(self.g.value_ty, addr, 0, "tag_ptr")?;
        self.b.build_store(tag_ptr, self.i8(TAG_BOOL as u64))?;
        let byte = self
            .b
            .build_int_z_extend(falsey, self.g.ctx.i8_type(), "bool_byte")?;
        self.b.build_store(self.payload_at(addr)?, byte)?;

        self.step(offset, 1)
    }

    fn op_negate(&self, offset: usize) -> Result<(), BuilderError> {
        let top = self.load_top()?;
        let index = self.b.build_int_sub(top, self.i32v(1), "index")?;
        let addr = self.stack_at(self.stack, index)?;

        let tag = self.tag_at(addr)?;
        let bad = self.b.build_int_compare(
            IntPredicate::NE,
            tag,
            self.i8(TAG_NUMBER as u64),
            "not_number",
        )?;

        let error_bb = self.append_block("negate_error");
        let ok_bb = self.append_block("negate");
        self.b.build_conditional_branch(bad, error_bb, ok_bb)?;

        self.b.position_at_end(error_bb);
        self.emit_error_return(self.g.rt.number_error, &[])?;

        self.b.position_at_end(ok_bb);
        let f64_ty = self.g.ctx.f64_type();
        let value = self
            .b
            .build_load(f64_ty, self.payload_at(addr)?, "value")?
            .into_float_value();
        let negated = self.b.build_float_neg(value, "negated")?;
        self.b.build_store(self.payload_at(addr)?, negated)?;

        self.step(offset, 1)
    }

    fn op_print(&self, offset: usize) -> Result<(), BuilderError> {
        let top = self.load_top()?;
        let index = self.b.build_int_sub(top, self.i32v(1), "index")?;
        let addr = self.stack_at(self.stack, index)?;
        let value = self.b.build_load(self.g.value_ty, addr, "printed")?;
        self.b.build_store(self.temp1, value)?;
        self.b
            .build_call(self.g.rt.print, &[self.temp1.into()], "")?;
        self.b.build_store(self.stack_top, index)?;
        self.step(offset, 1)
    }

    /// Conditional forward jump: peeks without popping; `on_true` selects
    /// JUMP_IF_TRUE behavior.
    fn op_conditional_jump(&self, offset: usize, on_true: bool) -> Result<(), BuilderError> {
        let jump = self.chunk.read_u16(offset + 1) as usize;

        let top = self.load_top()?;
        let index = self.b.build_int_sub(top, self.i32v(1), "index")?;
        let addr = self.stack_at(self.stack, index)?;
        let falsey = self
            .b
            .build_call(self.g.falsey, &[addr.into()], "falsey")?
            .try_as_basic_value()
            .left()
            .unwrap()
            .into_int_value();

        let taken = if on_true {
            self.b.build_not(falsey, "truthy")?
        } else {
            falsey
        };

        // pc advances by the full span when taken, by the encoding width
        // otherwise; both successors get exact blocks.
        let pc = self.load_pc()?;
        let taken_pc = self
            .b
            .build_int_add(pc, self.i32v((3 + jump) as u64), "taken_pc")?;
        let fall_pc = self.b.build_int_add(pc, self.i32v(3), "fall_pc")?;
        let next_pc = self
            .b
            .build_select(taken, taken_pc, fall_pc, "next_pc")?
            .into_int_value();
        self.b.build_store(self.pc, next_pc)?;

        self.b.build_conditional_branch(
            taken,
            self.blocks[offset + 3 + jump].unwrap(),
            self.blocks[offset + 3].unwrap(),
        )?;
        Ok(())
    }

    fn op_call(&self, offset: usize, arg_count: u64) -> Result<(), BuilderError> {
        let argc = self.i32v(arg_count);

        let top = self.load_top()?;
        let window = self.b.build_int_sub(
            top,
            self.i32v(arg_count + 1),
            "window",
        )?;
        let callee_addr = self.stack_at(self.stack, window)?;

        let callee_tag = self.tag_at(callee_addr)?;
        let is_obj = self.b.build_int_compare(
            IntPredicate::EQ,
            callee_tag,
            self.i8(TAG_OBJ as u64),
            "is_obj",
        )?;

        let obj_bb = self.append_block("callee_obj");
        let not_obj_bb = self.append_block("callee_not_obj");
        let end_bb = self.append_block("call_end");
        self.b.build_conditional_branch(is_obj, obj_bb, not_obj_bb)?;

        self.b.position_at_end(not_obj_bb);
        self.emit_error_return(self.g.rt.call_error, &[])?;

        self.b.position_at_end(obj_bb);
        let ptr_ty = self.g.ctx.ptr_type(AddressSpace::default());
        let obj_ptr = self
            .b
            .build_load(ptr_ty, self.payload_at(callee_addr)?, "obj_ptr")?
            .into_pointer_value();

        let kind = self
            .b
            .build_load(
                self.g.ctx.i8_type(),
                self.byte_offset(obj_ptr, std::mem::offset_of!(ObjHeader, kind))?,
                "kind",
            )?
            .into_int_value();
        let is_function = self.b.build_int_compare(
            IntPredicate::EQ,
            kind,
            self.i8(ObjKind::Function as u64),
            "is_function",
        )?;
        let is_native = self.b.build_int_compare(
            IntPredicate::EQ,
            kind,
            self.i8(ObjKind::Native as u64),
            "is_native",
        )?;

        let function_bb = self.append_block("call_function");
        let not_function_bb = self.append_block("not_function");
        let native_bb = self.append_block("call_native");
        let not_callable_bb = self.append_block("not_callable");
        self.b
            .build_conditional_branch(is_function, function_bb, not_function_bb)?;

        // User function: check arity, then tail into its compiled entry with
        // a stack window starting at the callee slot.
        self.b.position_at_end(function_bb);
        let callee_top = self.b.build_int_add(argc, self.i32v(1), "callee_top")?;
        self.b.build_store(self.stack_top, callee_top)?;

        let arity = self
            .b
            .build_load(
                self.g.ctx.i32_type(),
                self.byte_offset(obj_ptr, std::mem::offset_of!(ObjFunction, arity))?,
                "arity",
            )?
            .into_int_value();
        let arity_bad =
            self.b
                .build_int_compare(IntPredicate::NE, argc, arity, "arity_mismatch")?;

        let arity_error_bb = self.append_block("arity_error");
        let arity_ok_bb = self.append_block("arity_ok");
        self.b
            .build_conditional_branch(arity_bad, arity_error_bb, arity_ok_bb)?;

        self.b.position_at_end(arity_error_bb);
        self.emit_error_return(self.g.rt.arity_error, &[arity, argc])?;

        self.b.position_at_end(arity_ok_bb);
        let entry_ptr = self
            .b
            .build_load(
                ptr_ty,
                self.byte_offset(obj_ptr, std::mem::offset_of!(ObjFunction, entry))?,
                "entry",
            )?
            .into_pointer_value();
        let status = self
            .b
            .build_indirect_call(
                self.g.entry_fn_ty,
                entry_ptr,
                &[
                    self.vm.into(),
                    self.globals.into(),
                    callee_addr.into(),
                    self.stack_top.into(),
                ],
                "status",
            )?
            .try_as_basic_value()
            .left()
            .unwrap()
            .into_int_value();

        let failed = self.b.build_int_compare(
            IntPredicate::NE,
            status,
            self.i32v(0),
            "call_failed",
        )?;
        let failed_bb = self.append_block("callee_failed");
        let returned_bb = self.append_block("callee_returned");
        self.b.build_conditional_branch(failed, failed_bb, returned_bb)?;

        self.b.position_at_end(failed_bb);
        self.b
            .build_return(Some(&self.i32v(STATUS_RUNTIME_ERROR)))?;

        // Result sits on top of the callee window; move it to the caller's
        // new top (the old callee slot).
        self.b.position_at_end(returned_bb);
        let callee_final_top = self.load_top()?;
        let result_index = self
            .b
            .build_int_sub(callee_final_top, self.i32v(1), "result_index")?;
        let result_addr = unsafe {
            self.b.build_in_bounds_gep(
                self.g.value_ty,
                callee_addr,
                &[result_index],
                "result_addr",
            )?
        };
        let result = self.b.build_load(self.g.value_ty, result_addr, "result")?;
        self.b.build_store(self.stack_top, window)?;
        let dst = self.stack_at(self.stack, window)?;
        self.b.build_store(dst, result)?;
        self.bump_top(window, 1)?;
        self.b.build_unconditional_branch(end_bb)?;

        self.b.position_at_end(not_function_bb);
        self.b
            .build_conditional_branch(is_native, native_bb, not_callable_bb)?;

        // Native: hand the runtime the real argument window.
        self.b.position_at_end(native_bb);
        let native_fn = self
            .b
            .build_load(
                ptr_ty,
                self.byte_offset(obj_ptr, std::mem::offset_of!(ObjNative, function))?,
                "native_fn",
            )?
            .into_pointer_value();
        let args_index = self.b.build_int_add(window, self.i32v(1), "args_index")?;
        let args_addr = self.stack_at(self.stack, args_index)?;
        self.b.build_call(
            self.g.rt.call_native,
            &[
                native_fn.into(),
                argc.into(),
                args_addr.into(),
                self.temp3.into(),
            ],
            "",
        )?;
        self.b.build_store(self.stack_top, window)?;
        let dst = self.stack_at(self.stack, window)?;
        let native_result = self
            .b
            .build_load(self.g.value_ty, self.temp3, "native_result")?;
        self.b.build_store(dst, native_result)?;
        self.bump_top(window, 1)?;
        self.b.build_unconditional_branch(end_bb)?;

        self.b.position_at_end(not_callable_bb);
        self.emit_error_return(self.g.rt.call_error, &[])?;

        self.b.position_at_end(end_bb);
        self.step(offset, 2)
    }

    /// GEP `base + bytes` as an i8 pointer.
    fn byte_offset(
        &self,
        base: PointerValue<'ctx>,
        bytes: usize,
    ) -> Result<PointerValue<'ctx>, BuilderError> {
        unsafe {
            self.b.build_in_bounds_gep(
                self.g.ctx.i8_type(),
                base,
                &[self.i32v(bytes as u64)],
                "field_ptr",
            )
        }
    }
}

#[derive(Clone, Copy)]
enum Arith {
    Sub,
    Mul,
    Div,
    Rem,
}

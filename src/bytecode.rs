// File: src/bytecode.rs
//
// The bytecode representation (spec §3.4): a flat, append-only-at-compile
// / read-only-at-execution instruction vector plus a constant pool.
// Structurally grounded on `ruff::bytecode::BytecodeChunk` (instructions +
// constants + name + patch_jump), collapsed to the opcode set spec §4.2
// actually needs — `ruff`'s closure/generator/async/exception-channel
// opcodes are out of scope for this core (see DESIGN.md). Opcode names
// and operand meanings are cross-checked against
// `original_source/src/bytecode.h`.

use crate::value::Value;

/// The closed set of opcodes the compiler may emit (spec §4.2), plus the
/// `TRY_PUSH`/`THROW` exception scaffolding the compiler never emits but
/// the VM must still implement consistently (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum OpCode {
    // Core / stack / frame
    Nop,
    Line,
    LoadConst,
    LoadLocal,
    StoreLocal,
    LoadGlobal,
    StoreGlobal,
    Pop,
    Dup,
    Swap,
    Jump,
    JumpIfFalse,
    Call,
    Return,
    Print,
    Halt,
    Exit,

    // Arithmetic / logic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
    And,
    Or,
    Not,

    // Arrays and maps
    MakeArray,
    MakeMap,
    IndexGet,
    IndexSet,
    Len,
    Push,
    Apop,
    Set,
    Insert,
    Remove,
    Slice,
    Keys,
    Values,
    HasKey,
    Contains,
    IndexOf,
    Clear,
    Enumerate,
    Zip,

    // Strings
    Split,
    Join,
    Substr,
    Find,

    // Conversions and typing
    ToNumber,
    ToString,
    Typeof,
    Cast,

    // Bit ops
    Uclamp,
    Sclamp,
    Band,
    Bor,
    Bxor,
    Bnot,
    Shl,
    Shr,
    Rol,
    Ror,

    // Math / RNG
    Min,
    Max,
    Clamp,
    Abs,
    Pow,
    RandomSeed,
    RandomInt,

    // OS / file subset that stays in-core (no external library dependency)
    ReadFile,
    WriteFile,
    Env,

    // Exception scaffolding (spec §7): never emitted by the compiler, but
    // implemented consistently.
    TryPush,
    Throw,
}

impl OpCode {
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Nop => "NOP",
            OpCode::Line => "LINE",
            OpCode::LoadConst => "LOAD_CONST",
            OpCode::LoadLocal => "LOAD_LOCAL",
            OpCode::StoreLocal => "STORE_LOCAL",
            OpCode::LoadGlobal => "LOAD_GLOBAL",
            OpCode::StoreGlobal => "STORE_GLOBAL",
            OpCode::Pop => "POP",
            OpCode::Dup => "DUP",
            OpCode::Swap => "SWAP",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
            OpCode::Print => "PRINT",
            OpCode::Halt => "HALT",
            OpCode::Exit => "EXIT",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Lt => "LT",
            OpCode::Lte => "LTE",
            OpCode::Gt => "GT",
            OpCode::Gte => "GTE",
            OpCode::Eq => "EQ",
            OpCode::Neq => "NEQ",
            OpCode::And => "AND",
            OpCode::Or => "OR",
            OpCode::Not => "NOT",
            OpCode::MakeArray => "MAKE_ARRAY",
            OpCode::MakeMap => "MAKE_MAP",
            OpCode::IndexGet => "INDEX_GET",
            OpCode::IndexSet => "INDEX_SET",
            OpCode::Len => "LEN",
            OpCode::Push => "PUSH",
            OpCode::Apop => "APOP",
            OpCode::Set => "SET",
            OpCode::Insert => "INSERT",
            OpCode::Remove => "REMOVE",
            OpCode::Slice => "SLICE",
            OpCode::Keys => "KEYS",
            OpCode::Values => "VALUES",
            OpCode::HasKey => "HAS_KEY",
            OpCode::Contains => "CONTAINS",
            OpCode::IndexOf => "INDEX_OF",
            OpCode::Clear => "CLEAR",
            OpCode::Enumerate => "ENUMERATE",
            OpCode::Zip => "ZIP",
            OpCode::Split => "SPLIT",
            OpCode::Join => "JOIN",
            OpCode::Substr => "SUBSTR",
            OpCode::Find => "FIND",
            OpCode::ToNumber => "TO_NUMBER",
            OpCode::ToString => "TO_STRING",
            OpCode::Typeof => "TYPEOF",
            OpCode::Cast => "CAST",
            OpCode::Uclamp => "UCLAMP",
            OpCode::Sclamp => "SCLAMP",
            OpCode::Band => "BAND",
            OpCode::Bor => "BOR",
            OpCode::Bxor => "BXOR",
            OpCode::Bnot => "BNOT",
            OpCode::Shl => "SHL",
            OpCode::Shr => "SHR",
            OpCode::Rol => "ROL",
            OpCode::Ror => "ROR",
            OpCode::Min => "MIN",
            OpCode::Max => "MAX",
            OpCode::Clamp => "CLAMP",
            OpCode::Abs => "ABS",
            OpCode::Pow => "POW",
            OpCode::RandomSeed => "RANDOM_SEED",
            OpCode::RandomInt => "RANDOM_INT",
            OpCode::ReadFile => "READ_FILE",
            OpCode::WriteFile => "WRITE_FILE",
            OpCode::Env => "ENV",
            OpCode::TryPush => "TRY_PUSH",
            OpCode::Throw => "THROW",
        }
    }
}

/// One `(opcode, operand)` pair. The operand's meaning is opcode-specific:
/// a jump target, a constant/local/global index, an argument count, a
/// clamp width, and so on.
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub op: OpCode,
    pub operand: i32,
}

/// A function/class-factory body, or the outer program, as emitted by the
/// compiler: an append-only instruction vector plus a constant pool.
/// Read-only once execution starts.
pub struct Bytecode {
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub name: Option<String>,
    pub source_file: Option<String>,
    pub param_count: usize,
}

impl Bytecode {
    pub fn new(name: Option<String>, source_file: Option<String>) -> Self {
        Self {
            instructions: Vec::new(),
            constants: Vec::new(),
            name,
            source_file,
            param_count: 0,
        }
    }

    /// Appends an instruction and returns its index (used for back-patching).
    pub fn emit(&mut self, op: OpCode, operand: i32) -> usize {
        self.instructions.push(Instruction { op, operand });
        self.instructions.len() - 1
    }

    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Overwrites a previously-emitted placeholder operand once its real
    /// target is known (jumps, short-circuit patch lists, loop end labels).
    pub fn patch_operand(&mut self, index: usize, operand: i32) {
        self.instructions[index].operand = operand;
    }

    /// The address the *next* emitted instruction will occupy.
    pub fn next_index(&self) -> usize {
        self.instructions.len()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Disassembles the block for the `dump` CLI subcommand and debugging.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let label = self.name.as_deref().unwrap_or("<main>");
        out.push_str(&format!("; function {}\n", label));
        for (i, inst) in self.instructions.iter().enumerate() {
            out.push_str(&format!("{:5}  {:<14} {}\n", i, inst.op.name(), inst.operand));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_and_patch_roundtrip() {
        let mut bc = Bytecode::new(Some("main".to_string()), None);
        let jump_idx = bc.emit(OpCode::JumpIfFalse, -1);
        bc.emit(OpCode::Nop, 0);
        let target = bc.next_index() as i32;
        bc.patch_operand(jump_idx, target);
        assert_eq!(bc.instructions[jump_idx].operand, target);
    }

    #[test]
    fn constants_are_indexed_in_order() {
        let mut bc = Bytecode::new(None, None);
        let i0 = bc.add_constant(Value::Int(1));
        let i1 = bc.add_constant(Value::Str("x".to_string()));
        assert_eq!(i0, 0);
        assert_eq!(i1, 1);
        assert_eq!(bc.constants.len(), 2);
    }
}

//! Lowering of the AST into a flat instruction sequence.
//!
//! Layout of the generated code:
//!
//! ```text
//! fn bodies        each ends with PUSH_NIL; RETURN
//! ENTRY:
//!   SET_TRAIT ...  every personality block, in source order
//!   top-level statements
//!   HALT
//! ```
//!
//! Identifiers resolve at compile time: locals to frame slots, globals to
//! global slots and function names to `FunctionRef` constants.

use std::collections::HashMap;

use tracing::debug;

use crate::ast::{
    BinaryOp, Expr, ExprKind, FunctionDecl, Literal, Position, Program, Stmt, StmtKind, UnaryOp,
};
use crate::bytecode::{CompiledProgram, Constant, FunctionSymbol, Instruction};
use crate::error::{CompileError, CompileErrorKind};

type CResult<T> = Result<T, CompileError>;

/// Compile a parsed program. Nothing is produced if any error occurs.
pub fn compile(program: &Program) -> CResult<CompiledProgram> {
    let compiled = Compiler::default().compile_program(program)?;
    debug!(
        instructions = compiled.instructions.len(),
        constants = compiled.constants.len(),
        functions = compiled.functions.len(),
        entry_point = compiled.entry_point,
        "compiled program"
    );
    Ok(compiled)
}

/// Key of the constant pool deduplication map. Floats compare by bit pattern.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
enum ConstKey {
    Integer(i64),
    Float(u64),
    String(String),
    FunctionRef(u32),
}

impl From<&Constant> for ConstKey {
    fn from(constant: &Constant) -> Self {
        match constant {
            Constant::Integer(n) => ConstKey::Integer(*n),
            Constant::Float(x) => ConstKey::Float(x.to_bits()),
            Constant::String(s) => ConstKey::String(s.clone()),
            Constant::FunctionRef(index) => ConstKey::FunctionRef(*index),
        }
    }
}

/// A numeric literal known at compile time
#[derive(Debug, Clone, Copy, PartialEq)]
enum Folded {
    Int(i64),
    Float(f64),
}

impl Folded {
    fn as_f64(self) -> f64 {
        match self {
            Folded::Int(n) => n as f64,
            Folded::Float(x) => x,
        }
    }
}

/// Slots of the function being compiled. One flat scope per function.
#[derive(Debug)]
struct Locals {
    function: String,
    slots: HashMap<String, u16>,
    count: u16,
}

impl Locals {
    fn declare(&mut self, name: &str, pos: Position) -> CResult<u16> {
        if let Some(&slot) = self.slots.get(name) {
            return Ok(slot);
        }
        if self.count == u16::MAX {
            return Err(error(CompileErrorKind::TooManyLocals(self.function.clone()), pos));
        }
        let slot = self.count;
        self.slots.insert(name.to_string(), slot);
        self.count += 1;
        Ok(slot)
    }
}

/// Where an identifier lives
enum Resolved {
    Local(u16),
    Global(u32),
    Function(u32),
}

#[derive(Debug, Default)]
struct Compiler {
    instructions: Vec<Instruction>,
    constants: Vec<Constant>,
    constant_index: HashMap<ConstKey, u32>,
    functions: Vec<FunctionSymbol>,
    function_index: HashMap<String, u32>,
    globals: HashMap<String, u32>,
    locals: Option<Locals>,
}

fn error(kind: CompileErrorKind, pos: Position) -> CompileError {
    CompileError {
        kind,
        line: pos.line,
        column: pos.column,
    }
}

impl Compiler {
    fn compile_program(mut self, program: &Program) -> CResult<CompiledProgram> {
        self.declare_functions(program)?;
        for item in &program.items {
            self.declare_globals(item);
        }

        for item in &program.items {
            if let StmtKind::FunctionDecl(decl) = &item.kind {
                self.compile_function(decl)?;
            }
        }

        let entry_point = self.instructions.len() as u32;

        // Traits are set before any top-level logic runs
        for item in &program.items {
            if let StmtKind::PersonalityBlock(traits) = &item.kind {
                for decl in traits {
                    let name = self.add_string(&decl.name, decl.pos)?;
                    self.emit(Instruction::SetTrait {
                        name,
                        value: decl.value,
                    });
                }
            }
        }

        for item in &program.items {
            match item.kind {
                StmtKind::FunctionDecl(_) | StmtKind::PersonalityBlock(_) => {}
                _ => self.compile_stmt(item)?,
            }
        }
        self.emit(Instruction::Halt);

        Ok(CompiledProgram {
            instructions: self.instructions,
            constants: self.constants,
            functions: self.functions,
            entry_point,
        })
    }

    /// Register every function up front so calls may precede declarations
    fn declare_functions(&mut self, program: &Program) -> CResult<()> {
        for item in &program.items {
            if let StmtKind::FunctionDecl(decl) = &item.kind {
                if self.function_index.contains_key(&decl.name) {
                    return Err(error(
                        CompileErrorKind::DuplicateFunction(decl.name.clone()),
                        item.pos,
                    ));
                }
                if u16::try_from(decl.name.len()).is_err() {
                    let kind = CompileErrorKind::TooLong {
                        what: "function name",
                        length: decl.name.len(),
                        limit: u16::MAX as usize,
                    };
                    return Err(error(kind, item.pos));
                }
                let arity = u16::try_from(decl.params.len()).map_err(|_| {
                    error(CompileErrorKind::TooManyLocals(decl.name.clone()), item.pos)
                })?;

                let index = self.functions.len() as u32;
                self.function_index.insert(decl.name.clone(), index);
                self.functions.push(FunctionSymbol {
                    name: decl.name.clone(),
                    entry: 0,
                    arity,
                    locals: arity,
                });
            }
        }
        Ok(())
    }

    /// Every `let` outside a function body is a global, numbered in source order
    fn declare_globals(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let { name, .. } => {
                if !self.globals.contains_key(name) {
                    let slot = self.globals.len() as u32;
                    self.globals.insert(name.clone(), slot);
                }
            }
            StmtKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                for stmt in then_branch.iter().chain(else_branch.iter().flatten()) {
                    self.declare_globals(stmt);
                }
            }
            StmtKind::While { body, .. } | StmtKind::Block(body) => {
                for stmt in body {
                    self.declare_globals(stmt);
                }
            }
            _ => {}
        }
    }

    fn compile_function(&mut self, decl: &FunctionDecl) -> CResult<()> {
        let index = self.function_index[&decl.name] as usize;
        self.functions[index].entry = self.instructions.len() as u32;

        // Every parameter owns a slot, even a repeated name; the last one wins lookups
        let mut locals = Locals {
            function: decl.name.clone(),
            slots: HashMap::new(),
            count: self.functions[index].arity,
        };
        for (slot, param) in decl.params.iter().enumerate() {
            locals.slots.insert(param.clone(), slot as u16);
        }
        self.locals = Some(locals);

        for stmt in &decl.body {
            self.compile_stmt(stmt)?;
        }
        self.emit(Instruction::PushNil);
        self.emit(Instruction::Return);

        if let Some(locals) = self.locals.take() {
            self.functions[index].locals = locals.count;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> CResult<()> {
        match &stmt.kind {
            StmtKind::Let { name, value } => {
                self.compile_expr(value)?;
                match self.locals.as_mut() {
                    Some(locals) => {
                        let slot = locals.declare(name, stmt.pos)?;
                        self.emit(Instruction::StoreLocal(slot));
                    }
                    None => {
                        let slot = self.globals[name];
                        self.emit(Instruction::StoreGlobal(slot));
                    }
                }
            }
            // `voice.say` leaves nothing on the stack
            StmtKind::Expr(Expr {
                kind: ExprKind::VoiceSay(text),
                ..
            }) => {
                self.compile_expr(text)?;
                self.emit(Instruction::VoiceSay);
            }
            StmtKind::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Instruction::Pop);
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(condition)?;
                let skip_then = self.emit(Instruction::JumpIfFalse(0));
                self.compile_block(then_branch)?;

                match else_branch {
                    Some(else_branch) => {
                        let skip_else = self.emit(Instruction::Jump(0));
                        self.patch_jump(skip_then);
                        self.compile_block(else_branch)?;
                        self.patch_jump(skip_else);
                    }
                    None => self.patch_jump(skip_then),
                }
            }
            StmtKind::While { condition, body } => {
                let loop_start = self.instructions.len() as u32;
                self.compile_expr(condition)?;
                let exit = self.emit(Instruction::JumpIfFalse(0));
                self.compile_block(body)?;
                self.emit(Instruction::Jump(loop_start));
                self.patch_jump(exit);
            }
            StmtKind::Block(body) => self.compile_block(body)?,
            StmtKind::Print(value) => {
                self.compile_expr(value)?;
                self.emit(Instruction::Print);
            }
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => {
                        self.emit(Instruction::PushNil);
                    }
                }
                self.emit(Instruction::Return);
            }
            // Hoisted by `compile_program`; the parser keeps them at the top level
            StmtKind::FunctionDecl(_) | StmtKind::PersonalityBlock(_) => {}
        }
        Ok(())
    }

    fn compile_block(&mut self, body: &[Stmt]) -> CResult<()> {
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> CResult<()> {
        if let Some(folded) = fold(expr) {
            let constant = match folded {
                Folded::Int(n) => Constant::Integer(n),
                Folded::Float(x) => Constant::Float(x),
            };
            let index = self.add_constant(constant);
            self.emit(Instruction::PushConst(index));
            return Ok(());
        }

        match &expr.kind {
            ExprKind::Literal(literal) => self.compile_literal(literal, expr.pos)?,
            ExprKind::Identifier(name) => {
                let instruction = match self.resolve(name) {
                    Some(Resolved::Local(slot)) => Instruction::LoadLocal(slot),
                    Some(Resolved::Global(slot)) => Instruction::LoadGlobal(slot),
                    Some(Resolved::Function(index)) => {
                        Instruction::PushConst(self.add_constant(Constant::FunctionRef(index)))
                    }
                    None => {
                        return Err(error(
                            CompileErrorKind::UndefinedVariable(name.clone()),
                            expr.pos,
                        ))
                    }
                };
                self.emit(instruction);
            }
            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                self.emit(match op {
                    UnaryOp::Neg => Instruction::Neg,
                    UnaryOp::Not => Instruction::Not,
                });
            }
            ExprKind::BinaryOp {
                op: BinaryOp::And,
                left,
                right,
            } => {
                self.compile_expr(left)?;
                self.emit(Instruction::Dup);
                let short_circuit = self.emit(Instruction::JumpIfFalse(0));
                self.emit(Instruction::Pop);
                self.compile_expr(right)?;
                self.patch_jump(short_circuit);
            }
            ExprKind::BinaryOp {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                self.compile_expr(left)?;
                self.emit(Instruction::Dup);
                let evaluate_right = self.emit(Instruction::JumpIfFalse(0));
                let short_circuit = self.emit(Instruction::Jump(0));
                self.patch_jump(evaluate_right);
                self.emit(Instruction::Pop);
                self.compile_expr(right)?;
                self.patch_jump(short_circuit);
            }
            ExprKind::BinaryOp { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(match op {
                    BinaryOp::Add => Instruction::Add,
                    BinaryOp::Sub => Instruction::Sub,
                    BinaryOp::Mul => Instruction::Mul,
                    BinaryOp::Div => Instruction::Div,
                    BinaryOp::Mod => Instruction::Mod,
                    BinaryOp::Eq => Instruction::Eq,
                    BinaryOp::NotEq => Instruction::Ne,
                    BinaryOp::Less => Instruction::Lt,
                    BinaryOp::LessEq => Instruction::Le,
                    BinaryOp::Greater => Instruction::Gt,
                    BinaryOp::GreaterEq => Instruction::Ge,
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                });
            }
            ExprKind::Assign { target, value } => {
                let name = match &target.kind {
                    ExprKind::Identifier(name) => name,
                    _ => return Err(error(CompileErrorKind::InvalidAssignmentTarget, target.pos)),
                };
                let store = match self.resolve(name) {
                    Some(Resolved::Local(slot)) => Instruction::StoreLocal(slot),
                    Some(Resolved::Global(slot)) => Instruction::StoreGlobal(slot),
                    Some(Resolved::Function(_)) => {
                        return Err(error(CompileErrorKind::InvalidAssignmentTarget, target.pos))
                    }
                    None => {
                        return Err(error(
                            CompileErrorKind::UndefinedVariable(name.clone()),
                            target.pos,
                        ))
                    }
                };

                self.compile_expr(value)?;
                // The assignment's own value stays on the stack
                self.emit(Instruction::Dup);
                self.emit(store);
            }
            ExprKind::Call { callee, args } => {
                if let ExprKind::Identifier(name) = &callee.kind {
                    if let Some(Resolved::Function(index)) = self.resolve(name) {
                        let expected = self.functions[index as usize].arity as usize;
                        if expected != args.len() {
                            return Err(error(
                                CompileErrorKind::ArityMismatch {
                                    name: name.clone(),
                                    expected,
                                    found: args.len(),
                                },
                                expr.pos,
                            ));
                        }
                    }
                }

                let argc = u16::try_from(args.len()).map_err(|_| {
                    error(
                        CompileErrorKind::ArityMismatch {
                            name: "<call>".to_string(),
                            expected: u16::MAX as usize,
                            found: args.len(),
                        },
                        expr.pos,
                    )
                })?;

                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Instruction::Call(argc));
            }
            ExprKind::KnowledgeQuery(query) => {
                self.compile_expr(query)?;
                self.emit(Instruction::KnowledgeQuery);
            }
            ExprKind::VoiceSay(text) => {
                // In value position `voice.say(..)` evaluates to nil
                self.compile_expr(text)?;
                self.emit(Instruction::VoiceSay);
                self.emit(Instruction::PushNil);
            }
            ExprKind::VoiceListen => {
                self.emit(Instruction::VoiceListen);
            }
            ExprKind::TraitQuery(name) => {
                let name = self.add_string(name, expr.pos)?;
                self.emit(Instruction::GetTrait(name));
            }
        }
        Ok(())
    }

    fn compile_literal(&mut self, literal: &Literal, pos: Position) -> CResult<()> {
        let instruction = match literal {
            Literal::Integer(n) => Instruction::PushConst(self.add_constant(Constant::Integer(*n))),
            Literal::Float(x) => Instruction::PushConst(self.add_constant(Constant::Float(*x))),
            Literal::Str(s) => Instruction::PushConst(self.add_string(s, pos)?),
            Literal::Bool(true) => Instruction::PushTrue,
            Literal::Bool(false) => Instruction::PushFalse,
            Literal::Nil => Instruction::PushNil,
        };
        self.emit(instruction);
        Ok(())
    }

    fn resolve(&self, name: &str) -> Option<Resolved> {
        if let Some(slot) = self.locals.as_ref().and_then(|locals| locals.slots.get(name)) {
            return Some(Resolved::Local(*slot));
        }
        if let Some(slot) = self.globals.get(name) {
            return Some(Resolved::Global(*slot));
        }
        self.function_index.get(name).map(|index| Resolved::Function(*index))
    }

    /// Emit an instruction and return its index
    fn emit(&mut self, instruction: Instruction) -> usize {
        self.instructions.push(instruction);
        self.instructions.len() - 1
    }

    /// Point the jump at `index` to the next instruction to be emitted
    fn patch_jump(&mut self, index: usize) {
        let target = self.instructions.len() as u32;
        match &mut self.instructions[index] {
            Instruction::Jump(t) | Instruction::JumpIfFalse(t) => *t = target,
            other => debug_assert!(false, "patching a non-jump instruction {:?}", other),
        }
    }

    /// Pool index of a string constant. Its length must fit the artifact's u32 prefix.
    fn add_string(&mut self, value: &str, pos: Position) -> CResult<u32> {
        if u32::try_from(value.len()).is_err() {
            let kind = CompileErrorKind::TooLong {
                what: "string",
                length: value.len(),
                limit: u32::MAX as usize,
            };
            return Err(error(kind, pos));
        }
        Ok(self.add_constant(Constant::String(value.to_string())))
    }

    /// Pool index of `constant`, adding it on first use
    fn add_constant(&mut self, constant: Constant) -> u32 {
        let key = ConstKey::from(&constant);
        if let Some(&index) = self.constant_index.get(&key) {
            return index;
        }
        let index = self.constants.len() as u32;
        self.constants.push(constant);
        self.constant_index.insert(key, index);
        index
    }
}

/// Evaluate arithmetic over numeric literals. Anything that would fault or
/// overflow at runtime is left unfolded so the VM reports it.
fn fold(expr: &Expr) -> Option<Folded> {
    match &expr.kind {
        ExprKind::Literal(Literal::Integer(n)) => Some(Folded::Int(*n)),
        ExprKind::Literal(Literal::Float(x)) => Some(Folded::Float(*x)),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match fold(operand)? {
            Folded::Int(n) => n.checked_neg().map(Folded::Int),
            Folded::Float(x) => Some(Folded::Float(-x)),
        },
        ExprKind::BinaryOp { op, left, right } if op.is_arithmetic() => {
            let (left, right) = (fold(left)?, fold(right)?);
            match (left, right) {
                (Folded::Int(a), Folded::Int(b)) => {
                    let value = match op {
                        BinaryOp::Add => a.checked_add(b),
                        BinaryOp::Sub => a.checked_sub(b),
                        BinaryOp::Mul => a.checked_mul(b),
                        BinaryOp::Div => a.checked_div(b),
                        BinaryOp::Mod => a.checked_rem(b),
                        _ => None,
                    };
                    value.map(Folded::Int)
                }
                (a, b) => {
                    let (a, b) = (a.as_f64(), b.as_f64());
                    if matches!(op, BinaryOp::Div | BinaryOp::Mod) && b == 0.0 {
                        return None;
                    }
                    let value = match op {
                        BinaryOp::Add => a + b,
                        BinaryOp::Sub => a - b,
                        BinaryOp::Mul => a * b,
                        BinaryOp::Div => a / b,
                        BinaryOp::Mod => a % b,
                        _ => return None,
                    };
                    Some(Folded::Float(value))
                }
            }
        }
        _ => None,
    }
}

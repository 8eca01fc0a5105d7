//! AST → IR + symbol-table lowering (remaining external-collaborator
//! surface, given a concrete implementation here). Grounded on the shape of
//! `tac.rs` (`BaseExpr`/`RecExpr` walked into a flat
//! instruction list with label patch-up) generalized to this language's
//! typed AST and to the ip-index addressing `ir::Instruction::Goto`/`If`
//! actually require.
//!
//! Two structural decisions worth recording here (and in DESIGN.md):
//!
//! - `if`/`while` conditions compile uniformly as "if true, jump to the
//!   positive branch; otherwise fall into the negative branch", since
//!   `Instruction::If` only ever jumps on a true compare. Both branches are
//!   therefore laid out as `If(cond) -> then_start; <negative>; goto end;
//!   then_start: <positive>; end:` — this shape also serves `while` by
//!   reusing "loop body" as the positive branch and a backward `Goto` to
//!   close the loop.
//! - every lowered function has exactly one physical `Return`, as its last
//!   instruction. `return` inside a nested block assigns the function's
//!   return temp (if any) and jumps to that trailing `Return` instead of
//!   emitting its own, keeping the epilogue (stack teardown, `retn`) in one
//!   place per function.

use std::collections::HashMap;

use crate::ast::{self, BinOp, Condition, Directive, Expr, Program, ReturnTypeDecl, Stmt, UnaryOp};
use crate::directive::StackDirective;
use crate::error::{CompileError, CompileResult, Location};
use crate::ir::{AssignOp, CompareOp, Instruction, Operand};
use crate::shared::SHARED_FUNCTION_NAMES;
use crate::symbol::{ReturnType, ScalarType, Symbol, SymbolKind, SymbolTable};

pub struct LoweredProgram {
    pub instructions: Vec<Instruction>,
    pub symbols: SymbolTable,
    pub stack_size: u16,
}

pub fn lower(program: &Program) -> CompileResult<LoweredProgram> {
    let mut lowerer = Lowerer::new();
    lowerer.register_shared_functions();
    lowerer.register_globals(&program.globals)?;
    lowerer.register_function_signatures(&program.functions)?;

    let main_name = lowerer.entry_point_name.clone().ok_or_else(|| CompileError::Declaration {
        location: Location::default(),
        message: "program has no 'Main' entry point function".to_string(),
    })?;

    for function in &program.functions {
        let prelude = if function.name == main_name {
            lowerer.global_init_statements(&program.globals)?
        } else {
            Vec::new()
        };
        lowerer.lower_function(function, prelude)?;
    }

    let stack_size = resolve_stack_size(&program.directives);

    Ok(LoweredProgram {
        instructions: lowerer.instructions,
        symbols: lowerer.symbols,
        stack_size,
    })
}

fn resolve_stack_size(directives: &[Directive]) -> u16 {
    let converted: Vec<StackDirective> = directives
        .iter()
        .map(|d| match d {
            Directive::Stack(n) => StackDirective::Set(*n),
            Directive::StackAtLeast(n) => StackDirective::AtLeast(*n),
        })
        .collect();
    crate::directive::resolve_stack_size(&converted)
}

/// Return type of a shared helper, for call expressions that use its result
/// (only `ReadUint32`/`GetCommandLine`/`StringsEqual` return anything).
fn shared_return_type(name: &str) -> Option<ScalarType> {
    match name {
        "ReadUint32" => Some(ScalarType::Uint32),
        "GetCommandLine" => Some(ScalarType::String),
        "StringsEqual" => Some(ScalarType::Bool),
        _ => None,
    }
}

fn wider(a: ScalarType, b: ScalarType) -> ScalarType {
    if a.size() >= b.size() {
        a
    } else {
        b
    }
}

struct FunctionContext {
    name: String,
    return_type: ReturnTypeDecl,
    retval_name: Option<String>,
    exit_gotos: Vec<usize>,
}

struct Lowerer {
    instructions: Vec<Instruction>,
    symbols: SymbolTable,
    temp_counter: u32,
    entry_point_name: Option<String>,
}

impl Lowerer {
    fn new() -> Self {
        Lowerer {
            instructions: Vec::new(),
            symbols: SymbolTable::new(),
            temp_counter: 0,
            entry_point_name: None,
        }
    }

    fn register_shared_functions(&mut self) {
        for name in SHARED_FUNCTION_NAMES {
            self.symbols.insert(Symbol::new(name, SymbolKind::SharedFunction));
        }
    }

    fn register_globals(&mut self, globals: &[ast::Global]) -> CompileResult<()> {
        for global in globals {
            let mut symbol = Symbol::new(global.name.clone(), SymbolKind::ScalarVar);
            symbol.scalar_type = Some(global.ty);
            self.symbols.insert(symbol);
        }
        Ok(())
    }

    fn register_function_signatures(&mut self, functions: &[ast::Function]) -> CompileResult<()> {
        for function in functions {
            let is_entry = function.name == "Main";
            if is_entry {
                if self.entry_point_name.is_some() {
                    return Err(CompileError::Declaration {
                        location: Location::default(),
                        message: "more than one 'Main' function declared".to_string(),
                    });
                }
                self.entry_point_name = Some(function.name.clone());
            }
            let kind = if is_entry {
                SymbolKind::EntryPoint
            } else {
                SymbolKind::Function
            };
            let mut symbol = Symbol::new(function.name.clone(), kind);
            symbol.return_type = Some(match function.return_type {
                ReturnTypeDecl::Void => ReturnType::Void,
                ReturnTypeDecl::Scalar(ty) => ReturnType::Scalar(ty),
            });
            self.symbols.insert(symbol);

            for (idx, param) in function.params.iter().enumerate() {
                let mut psym = Symbol::new(param.name.clone(), SymbolKind::ScalarVar);
                psym.scalar_type = Some(param.ty);
                psym.parent = Some(function.name.clone());
                psym.parameter_index = (idx + 1) as u32;
                self.symbols.insert(psym);
            }
        }
        Ok(())
    }

    /// Assignments that initialize non-zero global values, run once at the
    /// very start of `Main` (statics themselves are zero-filled by the
    /// packager; there is no load-time data-initializer mechanism, see
    /// DESIGN.md).
    fn global_init_statements(&self, globals: &[ast::Global]) -> CompileResult<Vec<Stmt>> {
        Ok(globals
            .iter()
            .map(|g| Stmt::Assign {
                name: g.name.clone(),
                value: g.value.clone(),
            })
            .collect())
    }

    fn new_temp(&mut self, fn_name: &str, ty: ScalarType) -> String {
        let name = format!("$t{}", self.temp_counter);
        self.temp_counter += 1;
        let mut symbol = Symbol::new(name.clone(), SymbolKind::ScalarVar);
        symbol.scalar_type = Some(ty);
        symbol.parent = Some(fn_name.to_string());
        symbol.is_temp = true;
        self.symbols.insert(symbol);
        name
    }

    fn lower_function(&mut self, function: &ast::Function, prelude: Vec<Stmt>) -> CompileResult<()> {
        let start_ip = self.instructions.len();
        self.symbols
            .resolve_function(&function.name)
            .ok_or_else(|| CompileError::internal(0, format!("missing signature for '{}'", function.name)))?
            .ip
            .set(start_ip as i64);

        let retval_name = match function.return_type {
            ReturnTypeDecl::Void => None,
            ReturnTypeDecl::Scalar(ty) => Some(self.new_temp(&function.name, ty)),
        };

        let mut ctx = FunctionContext {
            name: function.name.clone(),
            return_type: function.return_type,
            retval_name,
            exit_gotos: Vec::new(),
        };

        for stmt in &prelude {
            self.lower_stmt(&mut ctx, stmt)?;
        }
        for stmt in &function.body {
            self.lower_stmt(&mut ctx, stmt)?;
        }

        let end_ip = self.instructions.len();
        for goto_idx in &ctx.exit_gotos {
            patch_goto_target(&mut self.instructions, *goto_idx, end_ip);
        }

        let value = ctx
            .retval_name
            .map(|name| Operand::variable(name, scalar_of(&ctx.return_type)));
        self.instructions.push(Instruction::Return { value });
        Ok(())
    }

    fn lower_stmt(&mut self, ctx: &mut FunctionContext, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Let { name, ty, value } => {
                let operand = self.lower_expr(ctx, value)?;
                let mut symbol = Symbol::new(name.clone(), SymbolKind::ScalarVar);
                symbol.scalar_type = Some(*ty);
                symbol.parent = Some(ctx.name.clone());
                self.symbols.insert(symbol);
                self.instructions.push(Instruction::Assign {
                    op: AssignOp::None,
                    dst: name.clone(),
                    a: operand,
                    b: None,
                });
                Ok(())
            }
            Stmt::Assign { name, value } => {
                self.lookup_variable(ctx, name)?;
                let operand = self.lower_expr(ctx, value)?;
                self.instructions.push(Instruction::Assign {
                    op: AssignOp::None,
                    dst: name.clone(),
                    a: operand,
                    b: None,
                });
                Ok(())
            }
            Stmt::If {
                cond,
                then_block,
                else_block,
            } => self.lower_if(ctx, cond, then_block, else_block),
            Stmt::While { cond, body } => self.lower_while(ctx, cond, body),
            Stmt::Return(value) => {
                if let Some(retval_name) = ctx.retval_name.clone() {
                    let value_expr = value.as_ref().ok_or_else(|| CompileError::Statement {
                        location: Location::default(),
                        message: format!("'{}' must return a value", ctx.name),
                    })?;
                    let operand = self.lower_expr(ctx, value_expr)?;
                    self.instructions.push(Instruction::Assign {
                        op: AssignOp::None,
                        dst: retval_name,
                        a: operand,
                        b: None,
                    });
                } else if value.is_some() {
                    log::warn!("'{}': return with a value from a void function", ctx.name);
                }
                let goto_idx = self.instructions.len();
                self.instructions.push(Instruction::Goto { target_ip: 0 });
                ctx.exit_gotos.push(goto_idx);
                Ok(())
            }
            Stmt::Expr(expr) => {
                self.lower_expr(ctx, expr)?;
                Ok(())
            }
        }
    }

    /// `If(cond) -> then_start; <else>; goto end; then_start: <then>; end:`
    fn lower_if(
        &mut self,
        ctx: &mut FunctionContext,
        cond: &Condition,
        then_block: &[Stmt],
        else_block: &[Stmt],
    ) -> CompileResult<()> {
        let (compare, a, b) = self.lower_condition(ctx, cond)?;
        let if_idx = self.instructions.len();
        self.instructions.push(Instruction::If {
            compare,
            a,
            b,
            target_ip: 0,
        });

        for stmt in else_block {
            self.lower_stmt(ctx, stmt)?;
        }
        let skip_idx = self.instructions.len();
        self.instructions.push(Instruction::Goto { target_ip: 0 });

        let then_start = self.instructions.len();
        patch_if_target(&mut self.instructions, if_idx, then_start);
        for stmt in then_block {
            self.lower_stmt(ctx, stmt)?;
        }
        let end = self.instructions.len();
        patch_goto_target(&mut self.instructions, skip_idx, end);
        Ok(())
    }

    /// `start: If(cond) -> body_start; goto end; body_start: <body>; goto
    /// start; end:`
    fn lower_while(&mut self, ctx: &mut FunctionContext, cond: &Condition, body: &[Stmt]) -> CompileResult<()> {
        let start = self.instructions.len();
        let (compare, a, b) = self.lower_condition(ctx, cond)?;
        let if_idx = self.instructions.len();
        self.instructions.push(Instruction::If {
            compare,
            a,
            b,
            target_ip: 0,
        });
        let out_idx = self.instructions.len();
        self.instructions.push(Instruction::Goto { target_ip: 0 });

        let body_start = self.instructions.len();
        patch_if_target(&mut self.instructions, if_idx, body_start);
        for stmt in body {
            self.lower_stmt(ctx, stmt)?;
        }
        self.instructions.push(Instruction::Goto { target_ip: start });

        let end = self.instructions.len();
        patch_goto_target(&mut self.instructions, out_idx, end);
        Ok(())
    }

    fn lower_condition(&mut self, ctx: &mut FunctionContext, cond: &Condition) -> CompileResult<(CompareOp, Operand, Operand)> {
        match cond {
            Condition::Truthy(expr) => {
                let operand = self.lower_expr(ctx, expr)?;
                let zero = Operand::constant("0", operand.scalar_type);
                Ok((CompareOp::Ne, operand, zero))
            }
            Condition::Compare(op, lhs, rhs) => {
                let a = self.lower_expr(ctx, lhs)?;
                let b = self.lower_expr(ctx, rhs)?;
                Ok((*op, a, b))
            }
        }
    }

    fn lower_expr(&mut self, ctx: &mut FunctionContext, expr: &Expr) -> CompileResult<Operand> {
        match expr {
            Expr::Number(n) => Ok(Operand::constant(n.to_string(), literal_type(*n))),
            Expr::Str(s) => Ok(Operand::constant(s.clone(), ScalarType::String)),
            Expr::Bool(b) => Ok(Operand::constant(if *b { "1" } else { "0" }, ScalarType::Bool)),
            Expr::Var(name) => {
                let ty = self.lookup_variable(ctx, name)?;
                Ok(Operand::variable(name.clone(), ty))
            }
            Expr::Unary(UnaryOp::Neg, inner) => {
                let operand = self.lower_expr(ctx, inner)?;
                let ty = operand.scalar_type;
                let dst = self.new_temp(&ctx.name, ty);
                self.instructions.push(Instruction::Assign {
                    op: AssignOp::Negate,
                    dst: dst.clone(),
                    a: operand,
                    b: None,
                });
                Ok(Operand::variable(dst, ty))
            }
            Expr::Binary(op, lhs, rhs) => {
                let a = self.lower_expr(ctx, lhs)?;
                let b = self.lower_expr(ctx, rhs)?;
                let ty = wider(a.scalar_type, b.scalar_type);
                let dst = self.new_temp(&ctx.name, ty);
                self.instructions.push(Instruction::Assign {
                    op: assign_op_of(*op),
                    dst: dst.clone(),
                    a,
                    b: Some(b),
                });
                Ok(Operand::variable(dst, ty))
            }
            Expr::Call(name, args) => self.lower_call(ctx, name, args),
        }
    }

    fn lower_call(&mut self, ctx: &mut FunctionContext, name: &str, args: &[Expr]) -> CompileResult<Operand> {
        let is_shared = self.symbols.resolve_shared_function(name).is_some();
        let return_ty = if is_shared {
            shared_return_type(name)
        } else {
            self.symbols.resolve_function(name).and_then(|s| match s.return_type {
                Some(ReturnType::Scalar(ty)) => Some(ty),
                _ => None,
            })
        };
        if !is_shared && self.symbols.resolve_function(name).is_none() {
            return Err(CompileError::Declaration {
                location: Location::default(),
                message: format!("call to undeclared function '{name}'"),
            });
        }

        for arg in args {
            let operand = self.lower_expr(ctx, arg)?;
            let arg_name = match operand.kind {
                crate::ir::OperandKind::Variable => operand.value,
                crate::ir::OperandKind::Constant => {
                    let ty = operand.scalar_type;
                    let tmp = self.new_temp(&ctx.name, ty);
                    self.instructions.push(Instruction::Assign {
                        op: AssignOp::None,
                        dst: tmp.clone(),
                        a: operand,
                        b: None,
                    });
                    tmp
                }
            };
            self.instructions.push(Instruction::Push { symbol: arg_name });
        }

        let return_dst = return_ty.map(|ty| self.new_temp(&ctx.name, ty));
        self.instructions.push(Instruction::Call {
            target: name.to_string(),
            return_dst: return_dst.clone(),
        });

        match (return_dst, return_ty) {
            (Some(dst), Some(ty)) => Ok(Operand::variable(dst, ty)),
            _ => Ok(Operand::constant("0", ScalarType::Uint8)),
        }
    }

    fn lookup_variable(&self, ctx: &FunctionContext, name: &str) -> CompileResult<ScalarType> {
        self.symbols
            .lookup_variable(Some(&ctx.name), name)
            .and_then(|s| s.scalar_type)
            .ok_or_else(|| CompileError::Declaration {
                location: Location::default(),
                message: format!("undeclared variable '{name}' in '{}'", ctx.name),
            })
    }
}

fn scalar_of(rt: &ReturnTypeDecl) -> ScalarType {
    match rt {
        ReturnTypeDecl::Scalar(ty) => *ty,
        ReturnTypeDecl::Void => ScalarType::Uint16,
    }
}

fn literal_type(n: u64) -> ScalarType {
    if n <= 0xFF {
        ScalarType::Uint8
    } else if n <= 0xFFFF {
        ScalarType::Uint16
    } else {
        ScalarType::Uint32
    }
}

fn assign_op_of(op: BinOp) -> AssignOp {
    match op {
        BinOp::Add => AssignOp::Add,
        BinOp::Sub => AssignOp::Sub,
        BinOp::Mul => AssignOp::Mul,
        BinOp::Div => AssignOp::Div,
        BinOp::Rem => AssignOp::Rem,
        BinOp::Shl => AssignOp::Shl,
        BinOp::Shr => AssignOp::Shr,
    }
}

fn patch_if_target(instructions: &mut [Instruction], idx: usize, target: usize) {
    if let Instruction::If { target_ip, .. } = &mut instructions[idx] {
        *target_ip = target;
    }
}

fn patch_goto_target(instructions: &mut [Instruction], idx: usize, target: usize) {
    if let Instruction::Goto { target_ip } = &mut instructions[idx] {
        *target_ip = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::tokenizer::tokenize;

    fn lower_source(src: &str) -> LoweredProgram {
        let lines = tokenize(src).unwrap();
        let program = parse(&lines).unwrap();
        lower(&program).unwrap()
    }

    #[test]
    fn lowers_trivial_entry_point() {
        let out = lower_source("fun Main():\n    return\n");
        assert!(out.symbols.entry_point().is_some());
        assert!(matches!(out.instructions.last(), Some(Instruction::Return { value: None })));
    }

    #[test]
    fn if_else_produces_a_single_trailing_return() {
        let src = "fun Main():\n    uint8 x = 1\n    if x == 1:\n        x = 2\n    else:\n        x = 3\n    return\n";
        let out = lower_source(src);
        let returns = out
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Return { .. }))
            .count();
        assert_eq!(returns, 1);
    }

    #[test]
    fn early_return_jumps_to_trailing_return() {
        let src = "fun Main():\n    uint8 x = 1\n    if x == 1:\n        return\n    x = 2\n    return\n";
        let out = lower_source(src);
        let returns = out
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Return { .. }))
            .count();
        assert_eq!(returns, 1);
    }

    #[test]
    fn missing_main_is_a_declaration_error() {
        let lines = tokenize("fun Helper():\n    return\n").unwrap();
        let program = parse(&lines).unwrap();
        let err = lower(&program).unwrap_err();
        assert!(matches!(err, CompileError::Declaration { .. }));
    }
}

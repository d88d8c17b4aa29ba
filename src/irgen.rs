//! Lowering from the typed AST to SSA IR.
//!
//! Expressions lower bottom-up; operators map through static opcode tables.
//! An opcode the tables do not know still becomes a generic node — that path
//! signals a front-end bug and the emitter rejects it, so it never reaches
//! the VM.  Type errors accumulate as diagnostics and generation produces no
//! IR program if any were reported.

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ast::{CalleeKind, Expr, HandlerDecl, Stmt, Unit, VariableDecl};
use crate::bytecode::Opcode;
use crate::ir::{BlockId, IrHandler, IrInstr, IrMatchCase, IrProgram, ValueId};
use crate::matching::MatchOp;
use crate::natives::NativeKind;
use crate::value::{FlowType, Literal};

/// Diagnostics collected while lowering a unit.
#[derive(Debug, Error)]
#[error("IR generation failed with {} diagnostic(s); first: {}", .diagnostics.len(), .diagnostics.first().map(String::as_str).unwrap_or("<none>"))]
pub struct GenerateError {
    pub diagnostics: Vec<String>,
}

/// Lower a typed unit into an IR program.
pub fn generate(unit: &Unit) -> Result<IrProgram, GenerateError> {
    let mut generator = IrGenerator {
        diagnostics: Vec::new(),
    };
    let mut program = IrProgram::new();
    for decl in &unit.handlers {
        program.handlers.push(generator.lower_handler(unit, decl));
    }
    if generator.diagnostics.is_empty() {
        Ok(program)
    } else {
        Err(GenerateError {
            diagnostics: generator.diagnostics,
        })
    }
}

struct IrGenerator {
    diagnostics: Vec<String>,
}

/// Per-handler lowering state: the handler under construction, the insert
/// point, and the variable scope mapping names to alloca slots.
struct HandlerCtx {
    handler: IrHandler,
    current: BlockId,
    scope: IndexMap<String, (ValueId, FlowType)>,
}

impl HandlerCtx {
    fn push(&mut self, instruction: IrInstr) {
        self.handler.block_mut(self.current).push(instruction);
    }

    fn push_to(&mut self, block: BlockId, instruction: IrInstr) {
        self.handler.block_mut(block).push(instruction);
    }

    fn value(&mut self, ty: FlowType) -> ValueId {
        self.handler.new_value(ty)
    }

    fn ty(&self, value: ValueId) -> FlowType {
        self.handler.value_type(value)
    }
}

impl IrGenerator {
    fn report(&mut self, handler: &str, message: String) {
        self.diagnostics.push(format!("{handler}: {message}"));
    }

    fn lower_handler(&mut self, unit: &Unit, decl: &HandlerDecl) -> IrHandler {
        debug!(handler = %decl.name, "lowering handler");
        let mut handler = IrHandler::new(&decl.name);
        let entry = handler.create_block("entry");
        handler.entry = entry;
        let mut ctx = HandlerCtx {
            handler,
            current: entry,
            scope: IndexMap::new(),
        };

        // Handlers share no state; unit-level variables are materialized at
        // every entry, then shadowed by handler-scope ones.
        for var in unit.variables.iter().chain(&decl.variables) {
            self.lower_variable(&mut ctx, &decl.name, var);
        }

        self.lower_stmt(&mut ctx, &decl.name, &decl.body);

        // Default verdict.
        if !ctx.handler.blocks[ctx.current.0 as usize].is_terminated() {
            let verdict = ctx.value(FlowType::Boolean);
            ctx.push(IrInstr::Const {
                result: verdict,
                literal: Literal::Boolean(false),
            });
            ctx.push(IrInstr::Ret { value: verdict });
        }
        ctx.handler
    }

    fn lower_variable(&mut self, ctx: &mut HandlerCtx, handler: &str, decl: &VariableDecl) {
        let Some(initializer) = self.lower_expr(ctx, handler, &decl.initializer) else {
            return;
        };
        let ty = ctx.ty(initializer);
        let slot = ctx.value(ty);
        ctx.push(IrInstr::Alloca { result: slot, ty });
        ctx.push(IrInstr::Store {
            slot,
            value: initializer,
        });
        ctx.scope.insert(decl.name.clone(), (slot, ty));
    }

    fn lower_stmt(&mut self, ctx: &mut HandlerCtx, handler: &str, stmt: &Stmt) {
        match stmt {
            Stmt::Compound(stmts) => {
                for stmt in stmts {
                    self.lower_stmt(ctx, handler, stmt);
                }
            }
            Stmt::Expr(expr) => {
                // A builtin-handler call in statement position is the one
                // expression form that produces no value.
                if let Expr::Call {
                    callee,
                    kind: CalleeKind::Handler,
                    args,
                    ..
                } = expr
                {
                    let args = self.lower_args(ctx, handler, args);
                    ctx.push(IrInstr::InvokeHandler {
                        native: callee.clone(),
                        args,
                    });
                } else {
                    self.lower_expr(ctx, handler, expr);
                }
            }
            Stmt::Cond {
                condition,
                then_stmt,
                else_stmt,
            } => {
                let Some(condition) = self.lower_expr(ctx, handler, condition) else {
                    return;
                };
                let then_block = ctx.handler.create_block("if.then");
                let else_block = ctx.handler.create_block("if.else");
                let cont_block = ctx.handler.create_block("if.cont");
                ctx.push(IrInstr::CondBr {
                    condition,
                    then_block,
                    else_block,
                });

                ctx.current = then_block;
                self.lower_stmt(ctx, handler, then_stmt);
                ctx.push(IrInstr::Br { target: cont_block });

                ctx.current = else_block;
                if let Some(else_stmt) = else_stmt {
                    self.lower_stmt(ctx, handler, else_stmt);
                }
                ctx.push(IrInstr::Br { target: cont_block });

                ctx.current = cont_block;
            }
            Stmt::Match {
                condition,
                op,
                cases,
                else_stmt,
            } => self.lower_match(ctx, handler, condition, *op, cases, else_stmt.as_deref()),
            Stmt::Assign { variable, expr } => {
                let Some((slot, ty)) = ctx.scope.get(variable).copied() else {
                    self.report(handler, format!("assignment to unknown variable '{variable}'"));
                    return;
                };
                let Some(value) = self.lower_expr(ctx, handler, expr) else {
                    return;
                };
                let value_ty = ctx.ty(value);
                if value_ty != ty {
                    self.report(
                        handler,
                        format!(
                            "type mismatch assigning {value_ty} to variable '{variable}' of type {ty}"
                        ),
                    );
                    return;
                }
                ctx.push(IrInstr::Store { slot, value });
            }
        }
    }

    fn lower_match(
        &mut self,
        ctx: &mut HandlerCtx,
        handler: &str,
        condition: &Expr,
        op: MatchOp,
        cases: &[(Literal, Stmt)],
        else_stmt: Option<&Stmt>,
    ) {
        let Some(condition) = self.lower_expr(ctx, handler, condition) else {
            return;
        };
        let head = ctx.current;
        let cont_block = ctx.handler.create_block("match.cont");

        let mut ir_cases = Vec::with_capacity(cases.len());
        for (literal, stmt) in cases {
            let label_ok = match op {
                MatchOp::Regex => literal.ty() == FlowType::Regex,
                _ => literal.ty() == FlowType::String,
            };
            if !label_ok {
                self.report(
                    handler,
                    format!("invalid literal type {} in match case", literal.ty()),
                );
                continue;
            }
            let block = ctx.handler.create_block("match.case");
            ctx.current = block;
            self.lower_stmt(ctx, handler, stmt);
            ctx.push(IrInstr::Br { target: cont_block });
            ir_cases.push(IrMatchCase {
                literal: literal.clone(),
                block,
            });
        }

        let else_block = match else_stmt {
            Some(stmt) => {
                let block = ctx.handler.create_block("match.else");
                ctx.current = block;
                self.lower_stmt(ctx, handler, stmt);
                ctx.push(IrInstr::Br { target: cont_block });
                block
            }
            None => cont_block,
        };

        ctx.push_to(
            head,
            IrInstr::Match {
                op,
                condition,
                cases: ir_cases,
                else_block,
            },
        );
        ctx.current = cont_block;
    }

    fn lower_args(&mut self, ctx: &mut HandlerCtx, handler: &str, args: &[Expr]) -> Vec<ValueId> {
        args.iter()
            .filter_map(|arg| self.lower_expr(ctx, handler, arg))
            .collect()
    }

    fn lower_expr(&mut self, ctx: &mut HandlerCtx, handler: &str, expr: &Expr) -> Option<ValueId> {
        match expr {
            Expr::Literal(literal) => {
                let result = ctx.value(literal.ty());
                ctx.push(IrInstr::Const {
                    result,
                    literal: literal.clone(),
                });
                Some(result)
            }
            Expr::Variable(name) => {
                let Some((slot, ty)) = ctx.scope.get(name).copied() else {
                    self.report(handler, format!("unknown variable '{name}'"));
                    return None;
                };
                let result = ctx.value(ty);
                ctx.push(IrInstr::Load { result, ty, slot });
                Some(result)
            }
            Expr::Unary { op, ty, operand } => {
                let operand = self.lower_expr(ctx, handler, operand)?;
                let result_ty = unary_result_type(*op).unwrap_or_else(|| {
                    warn!(opcode = ?op, "unsupported unary operator reaches generic lowering");
                    *ty
                });
                let result = ctx.value(result_ty);
                ctx.push(IrInstr::Vm {
                    opcode: *op,
                    ty: result_ty,
                    result: Some(result),
                    operands: vec![operand],
                });
                Some(result)
            }
            Expr::Binary { op, ty, lhs, rhs } => {
                let lhs = self.lower_expr(ctx, handler, lhs)?;
                let rhs = self.lower_expr(ctx, handler, rhs)?;
                let result_ty = binary_result_type(*op).unwrap_or_else(|| {
                    warn!(opcode = ?op, "unsupported binary operator reaches generic lowering");
                    *ty
                });
                let result = ctx.value(result_ty);
                ctx.push(IrInstr::Vm {
                    opcode: *op,
                    ty: result_ty,
                    result: Some(result),
                    operands: vec![lhs, rhs],
                });
                Some(result)
            }
            Expr::Call {
                callee,
                kind,
                ty,
                args,
            } => match kind {
                CalleeKind::Function => {
                    let args = self.lower_args(ctx, handler, args);
                    let result = ctx.value(*ty);
                    ctx.push(IrInstr::Call {
                        result,
                        ty: *ty,
                        kind: NativeKind::Function,
                        native: callee.clone(),
                        args,
                    });
                    Some(result)
                }
                CalleeKind::Variable => {
                    if !args.is_empty() {
                        self.report(
                            handler,
                            format!("builtin variable '{callee}' takes no arguments"),
                        );
                        return None;
                    }
                    let result = ctx.value(*ty);
                    ctx.push(IrInstr::Call {
                        result,
                        ty: *ty,
                        kind: NativeKind::Variable,
                        native: callee.clone(),
                        args: Vec::new(),
                    });
                    Some(result)
                }
                CalleeKind::Handler => {
                    self.report(
                        handler,
                        format!("builtin handler '{callee}' cannot produce a value"),
                    );
                    None
                }
                CalleeKind::Source => {
                    self.report(
                        handler,
                        format!("calling source handler '{callee}' is not supported"),
                    );
                    None
                }
            },
            Expr::Array { ty, elements } => {
                let element_ty = match ty {
                    FlowType::StringArray => FlowType::String,
                    FlowType::NumberArray => FlowType::Number,
                    other => {
                        self.report(handler, format!("invalid array type {other}"));
                        return None;
                    }
                };
                let mut lowered = Vec::with_capacity(elements.len());
                for element in elements {
                    let value = self.lower_expr(ctx, handler, element)?;
                    let value_ty = ctx.ty(value);
                    if value_ty != element_ty {
                        self.report(
                            handler,
                            format!("array element of type {value_ty} in {ty} literal"),
                        );
                        return None;
                    }
                    lowered.push(value);
                }
                let result = ctx.value(*ty);
                ctx.push(IrInstr::NewArray {
                    result,
                    ty: *ty,
                    elements: lowered,
                });
                Some(result)
            }
        }
    }
}

/// Static table from unary operator opcodes to their result type.
fn unary_result_type(op: Opcode) -> Option<FlowType> {
    Some(match op {
        Opcode::Nneg => FlowType::Number,
        Opcode::Ncmpz => FlowType::Boolean,
        Opcode::Bnot => FlowType::Boolean,
        Opcode::Slen => FlowType::Number,
        Opcode::Sisempty => FlowType::Boolean,
        Opcode::S2i => FlowType::Number,
        Opcode::I2s
        | Opcode::P2s
        | Opcode::C2s
        | Opcode::R2s
        | Opcode::Surlenc
        | Opcode::Surldec => FlowType::String,
        Opcode::Sreggroup => FlowType::String,
        _ => return None,
    })
}

/// Static table from binary operator opcodes to their result type.
fn binary_result_type(op: Opcode) -> Option<FlowType> {
    Some(match op {
        Opcode::Nadd
        | Opcode::Nsub
        | Opcode::Nmul
        | Opcode::Ndiv
        | Opcode::Nrem
        | Opcode::Nshl
        | Opcode::Nshr
        | Opcode::Npow
        | Opcode::Nand
        | Opcode::Nor
        | Opcode::Nxor => FlowType::Number,
        Opcode::Ncmpeq
        | Opcode::Ncmpne
        | Opcode::Ncmple
        | Opcode::Ncmpge
        | Opcode::Ncmplt
        | Opcode::Ncmpgt
        | Opcode::Band
        | Opcode::Bor
        | Opcode::Bxor => FlowType::Boolean,
        Opcode::Sadd => FlowType::String,
        Opcode::Scmpeq
        | Opcode::Scmpne
        | Opcode::Scmple
        | Opcode::Scmpge
        | Opcode::Scmplt
        | Opcode::Scmpgt
        | Opcode::Scmpbeg
        | Opcode::Scmpend
        | Opcode::Scontains => FlowType::Boolean,
        Opcode::Sregmatch => FlowType::Boolean,
        Opcode::Pcmpeq | Opcode::Pcmpne | Opcode::Pincidr => FlowType::Boolean,
        _ => return None,
    })
}

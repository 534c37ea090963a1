//! The textual form of the IR.

use core::fmt;

use itertools::Itertools;

use crate::index::Index;
use crate::ir::{Block, Constant, Function, InstructionKind, Module, Value};

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Register(id) => write!(f, "%{}", id.index()),
            Value::Parameter(block, index) => write!(f, "b{}#{index}", block.index()),
            Value::Constant(constant) => write!(f, "{constant}"),
            Value::Poison(_) => f.write_str("poison"),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Unit => f.write_str("unit"),
            Constant::Bool(value) => write!(f, "{value}"),
            Constant::Int(value) => write!(f, "{value}"),
            Constant::String(value) => write!(f, "{value:?}"),
            Constant::FunctionRef(name) => write!(f, "@{name}"),
            Constant::BuiltinPrint => f.write_str("print"),
            Constant::BuiltinType => f.write_str("type"),
        }
    }
}

fn format_arguments(labels: &[Option<String>], arguments: &[Value]) -> String {
    arguments
        .iter()
        .enumerate()
        .map(|(i, argument)| match labels.get(i).and_then(|l| l.as_ref()) {
            Some(label) => format!("{label}: {argument}"),
            None => argument.to_string(),
        })
        .join(", ")
}

impl Function {
    fn format_instruction(&self, id: crate::ir::InstructionId) -> String {
        let instruction = self.instruction(id);
        let result = format!("%{} = ", id.index());

        match &instruction.kind {
            InstructionKind::Alloc => format!("{result}alloc"),
            InstructionKind::Access { source, capability } => {
                format!("{result}access [{capability}] {source}")
            }
            InstructionKind::EndAccess { start } => format!("end_access {start}"),
            InstructionKind::Store { value, target } => format!("store {value}, {target}"),
            InstructionKind::Member { whole, member } => format!("{result}member {whole}, {member}"),
            InstructionKind::Invoke {
                callee,
                labels,
                arguments,
            } => format!(
                "{result}invoke {callee}({})",
                format_arguments(labels, arguments)
            ),
            InstructionKind::Project {
                callee,
                labels,
                arguments,
            } => format!(
                "{result}project {callee}({})",
                format_arguments(labels, arguments)
            ),
            InstructionKind::Branch { target, arguments } => {
                if arguments.is_empty() {
                    format!("branch b{}", target.index())
                } else {
                    format!(
                        "branch b{}({})",
                        target.index(),
                        arguments.iter().map(|a| a.to_string()).join(", ")
                    )
                }
            }
            InstructionKind::CondBranch {
                condition,
                success,
                failure,
            } => format!(
                "cond_branch {condition}, b{}, b{}",
                success.index(),
                failure.index()
            ),
            InstructionKind::Return { value } => format!("return {value}"),
            InstructionKind::Yield { value } => format!("yield {value}"),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels = self
            .labels
            .iter()
            .map(|label| match label {
                Some(label) => format!("{label}:"),
                None => "_:".to_owned(),
            })
            .join("");
        writeln!(f, "fun {}({labels}) =", self.name)?;

        for (id, block) in self.blocks.enumerate() {
            let Block {
                parameter_count, ..
            } = block;
            if *parameter_count > 0 {
                writeln!(f, "  b{}({parameter_count}) =", id.index())?;
            } else {
                writeln!(f, "  b{} =", id.index())?;
            }

            for instruction in self.instructions_in(id) {
                writeln!(f, "    {}", self.format_instruction(instruction))?;
            }
        }

        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, function) in self.functions.values().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{function}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Capability, InsertionPoint, Instruction, Value};
    use crate::source::{SourceId, SourceSpan};
    use pretty_assertions::assert_eq;

    fn span() -> SourceSpan {
        SourceSpan::new(SourceId::new(0), 0, 0)
    }

    #[test]
    fn function_rendering() {
        let mut f = Function::new(
            "f",
            vec![Some("x".to_owned()), None],
            false,
            span(),
        );
        let b0 = f.append_block(2);

        let access = f.insert(
            Instruction {
                kind: InstructionKind::Access {
                    source: Value::Parameter(b0, 0),
                    capability: Capability::Let,
                },
                site: span(),
            },
            InsertionPoint::End(b0),
        );
        f.insert(
            Instruction {
                kind: InstructionKind::Return {
                    value: Value::Register(access),
                },
                site: span(),
            },
            InsertionPoint::End(b0),
        );

        assert_eq!(
            f.to_string(),
            "fun f(x:_:) =\n  b0(2) =\n    %0 = access [let] b0#0\n    return %0\n"
        );
    }

    #[test]
    fn constant_rendering() {
        assert_eq!(Value::Constant(Constant::Unit).to_string(), "unit");
        assert_eq!(Value::Constant(Constant::Int(-3)).to_string(), "-3");
        assert_eq!(
            Value::Constant(Constant::String("hi".to_owned())).to_string(),
            "\"hi\""
        );
        assert_eq!(
            Value::Constant(Constant::FunctionRef("g".to_owned())).to_string(),
            "@g"
        );
        assert_eq!(Value::Poison(span()).to_string(), "poison");
    }
}

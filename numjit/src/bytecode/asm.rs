//! Reader for the `.nbc` bytecode assembly format.
//!
//! ```text
//! # comment
//! fn tot(p: num, q: num, r: num) regs=6 {
//!     muln r3, r0, r1
//!     muln r4, r3, r2
//!     addn r5, r3, r4
//!     ret r5
//! }
//! ```
//!
//! The format is what `Function`'s `Display` impl prints, so dumped functions
//! read back unchanged.

use std::rc::Rc;

use thiserror::Error;

use super::{Function, Instruction, Literal, Opcode, Operand, OperandKind, Param, ParamType, Program};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AsmError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: unknown opcode `{mnemonic}`")]
    UnknownOpcode { line: usize, mnemonic: String },
    #[error("line {line}: function `{name}` is never closed")]
    Unclosed { line: usize, name: String },
    #[error("line {line}: duplicate function `{name}`")]
    Duplicate { line: usize, name: String },
}

impl AsmError {
    pub fn line(&self) -> usize {
        match self {
            AsmError::Syntax { line, .. }
            | AsmError::UnknownOpcode { line, .. }
            | AsmError::Unclosed { line, .. }
            | AsmError::Duplicate { line, .. } => *line,
        }
    }
}

fn syntax(line: usize, message: impl Into<String>) -> AsmError {
    AsmError::Syntax {
        line,
        message: message.into(),
    }
}

/// Header of the function currently being read.
struct OpenFunction {
    line: usize,
    name: String,
    params: Vec<Param>,
    regs: u8,
    code: Vec<Instruction>,
}

/// Parse a whole `.nbc` source into a program.
pub fn parse_program(source: &str) -> Result<Program, AsmError> {
    let mut functions: Vec<Function> = Vec::new();
    let mut open: Option<OpenFunction> = None;

    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        let text = strip_comment(raw).trim();
        if text.is_empty() {
            continue;
        }

        match open.take() {
            None => {
                let header = parse_header(line, text)?;
                if functions.iter().any(|f| f.name() == header.name) {
                    return Err(AsmError::Duplicate {
                        line,
                        name: header.name,
                    });
                }
                open = Some(header);
            }
            Some(f) if text == "}" => {
                functions.push(Function::new(f.name, f.params, f.regs, f.code));
            }
            Some(mut f) => {
                f.code.push(parse_instruction(line, text)?);
                open = Some(f);
            }
        }
    }

    if let Some(f) = open {
        return Err(AsmError::Unclosed {
            line: f.line,
            name: f.name,
        });
    }
    Ok(Program::new(functions))
}

/// Parse a single instruction line, e.g. `addk r1, r0, 2.5`.
pub fn parse_instruction(line: usize, text: &str) -> Result<Instruction, AsmError> {
    let (mnemonic, rest) = match text.split_once(char::is_whitespace) {
        Some((m, r)) => (m, r.trim()),
        None => (text, ""),
    };
    let op: Opcode = mnemonic.parse().map_err(|_| AsmError::UnknownOpcode {
        line,
        mnemonic: mnemonic.to_string(),
    })?;

    let fields = split_operands(line, rest)?;
    let shape = op.shape();
    let expected = shape.iter().filter(|k| **k != OperandKind::None).count();
    if fields.len() != expected {
        return Err(syntax(
            line,
            format!("`{op}` takes {expected} operand(s), found {}", fields.len()),
        ));
    }

    let mut slots = [Operand::None, Operand::None, Operand::None];
    let mut fields = fields.into_iter();
    for (slot, kind) in slots.iter_mut().zip(shape) {
        if kind == OperandKind::None {
            continue;
        }
        // Counted above, so a field exists for every non-empty slot.
        let Some(field) = fields.next() else { break };
        *slot = parse_operand(line, kind, field)?;
    }
    let [a, b, c] = slots;
    Ok(Instruction::new(op, a, b, c))
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

fn parse_header(line: usize, text: &str) -> Result<OpenFunction, AsmError> {
    let rest = text
        .strip_prefix("fn ")
        .ok_or_else(|| syntax(line, format!("expected `fn`, found `{text}`")))?;
    let rest = rest
        .strip_suffix('{')
        .ok_or_else(|| syntax(line, "function header must end with `{`"))?
        .trim();

    let open_paren = rest
        .find('(')
        .ok_or_else(|| syntax(line, "missing `(` in function header"))?;
    let close_paren = rest
        .rfind(')')
        .ok_or_else(|| syntax(line, "missing `)` in function header"))?;
    if close_paren < open_paren {
        return Err(syntax(line, "malformed parameter list"));
    }

    let name = rest[..open_paren].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(syntax(line, format!("invalid function name `{name}`")));
    }

    let mut params = Vec::new();
    let list = rest[open_paren + 1..close_paren].trim();
    if !list.is_empty() {
        for part in list.split(',') {
            let (pname, ty) = part
                .split_once(':')
                .ok_or_else(|| syntax(line, format!("parameter `{}` needs a type", part.trim())))?;
            let pname = pname.trim();
            let ty = ty.trim();
            if pname.is_empty() || ty.is_empty() {
                return Err(syntax(line, format!("malformed parameter `{}`", part.trim())));
            }
            let ty: ParamType = match ty.parse() {
                Ok(t) => t,
                Err(never) => match never {},
            };
            params.push(Param::new(pname, ty));
        }
    }

    let mut regs = params.len().min(u8::MAX as usize) as u8;
    let tail = rest[close_paren + 1..].trim();
    if !tail.is_empty() {
        let value = tail
            .strip_prefix("regs=")
            .ok_or_else(|| syntax(line, format!("unexpected `{tail}` after parameters")))?;
        regs = value
            .trim()
            .parse()
            .map_err(|_| syntax(line, format!("invalid register count `{value}`")))?;
    }

    Ok(OpenFunction {
        line,
        name: name.to_string(),
        params,
        regs,
        code: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Operands
// ---------------------------------------------------------------------------

fn parse_operand(line: usize, kind: OperandKind, field: String) -> Result<Operand, AsmError> {
    match kind {
        OperandKind::Reg => field
            .strip_prefix('r')
            .and_then(|n| n.parse::<u8>().ok())
            .map(Operand::Reg)
            .ok_or_else(|| syntax(line, format!("expected a register like `r3`, found `{field}`"))),
        OperandKind::Imm => parse_literal(line, &field).map(Operand::Imm),
        OperandKind::Offset => field
            .parse::<i16>()
            .map(Operand::Offset)
            .map_err(|_| syntax(line, format!("expected a jump offset, found `{field}`"))),
        OperandKind::Index => field
            .strip_prefix('#')
            .and_then(|n| n.parse::<u16>().ok())
            .map(Operand::Index)
            .ok_or_else(|| syntax(line, format!("expected an index like `#2`, found `{field}`"))),
        OperandKind::None => Ok(Operand::None),
    }
}

fn parse_literal(line: usize, field: &str) -> Result<Literal, AsmError> {
    match field {
        "true" => return Ok(Literal::Bool(true)),
        "false" => return Ok(Literal::Bool(false)),
        "nil" => return Ok(Literal::Nil),
        _ => {}
    }
    if let Some(body) = field.strip_prefix('"') {
        let body = body
            .strip_suffix('"')
            .ok_or_else(|| syntax(line, "unterminated text literal"))?;
        return unescape(line, body).map(|s| Literal::Text(Rc::from(s)));
    }
    field
        .parse::<f64>()
        .map(Literal::Num)
        .map_err(|_| syntax(line, format!("expected a literal, found `{field}`")))
}

fn unescape(line: usize, body: &str) -> Result<String, AsmError> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => return Err(syntax(line, format!("unknown escape `\\{other}`"))),
            None => return Err(syntax(line, "dangling `\\` in text literal")),
        }
    }
    Ok(out)
}

/// Split on commas outside text literals.
fn split_operands(line: usize, rest: &str) -> Result<Vec<String>, AsmError> {
    let mut fields = Vec::new();
    if rest.is_empty() {
        return Ok(fields);
    }
    let mut current = String::new();
    let mut in_text = false;
    let mut escaped = false;
    for c in rest.chars() {
        if in_text {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_text = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_text = true;
                current.push(c);
            }
            ',' => {
                fields.push(std::mem::take(&mut current).trim().to_string());
            }
            _ => current.push(c),
        }
    }
    if in_text {
        return Err(syntax(line, "unterminated text literal"));
    }
    fields.push(current.trim().to_string());
    if fields.iter().any(String::is_empty) {
        return Err(syntax(line, "empty operand"));
    }
    Ok(fields)
}

/// Drop a trailing `#` comment, ignoring `#` inside text literals and the
/// `#N` index operand form. An index is a whole operand: `#`, digits, then
/// the end of the line, whitespace or a comma.
fn strip_comment(raw: &str) -> &str {
    let mut in_text = false;
    let mut prev = ' ';
    for (i, c) in raw.char_indices() {
        match c {
            '"' if prev != '\\' => in_text = !in_text,
            '#' if !in_text => {
                let starts_operand = prev.is_whitespace() || prev == ',';
                if !(starts_operand && is_index_operand(&raw[i + 1..])) {
                    return &raw[..i];
                }
            }
            _ => {}
        }
        prev = c;
    }
    raw
}

fn is_index_operand(after_hash: &str) -> bool {
    let rest = after_hash.trim_start_matches(|d: char| d.is_ascii_digit());
    rest.len() < after_hash.len() && (rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace() || c == ','))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOT: &str = r#"
# p*q + p*q*r
fn tot(p: num, q: num, r: num) regs=6 {
    muln r3, r0, r1
    muln r4, r3, r2
    addn r5, r3, r4
    ret r5
}
"#;

    #[test]
    fn reads_a_function() {
        let program = parse_program(TOT).unwrap();
        let f = program.get("tot").unwrap();
        assert_eq!(f.arity(), 3);
        assert_eq!(f.register_count(), 6);
        assert_eq!(f.code().len(), 4);
        assert_eq!(f.code()[0], Instruction::regs3(Opcode::MulN, 3, 0, 1));
        assert_eq!(f.code()[3], Instruction::ret(5));
    }

    #[test]
    fn display_output_reads_back() {
        let program = parse_program(TOT).unwrap();
        let printed = program.functions()[0].to_string();
        let again = parse_program(&printed).unwrap();
        assert_eq!(program, again);
    }

    #[test]
    fn regs_defaults_to_param_count() {
        let program = parse_program("fn id(x: num) {\n ret r0\n}\n").unwrap();
        assert_eq!(program.functions()[0].register_count(), 1);
    }

    #[test]
    fn literals_and_non_numeric_shapes() {
        let src = r#"
fn mixed(s: text, xs: list, p: Point) regs=4 {
    loadk r3, "a, b # c"
    loadk r3, true
    loadk r3, nil
    loadk r3, -2.5e3
    recfld r3, r2, #1
    jmpf r3, -2
    call r3, #0, #2
    ret r3
}
"#;
        let program = parse_program(src).unwrap();
        let f = &program.functions()[0];
        assert_eq!(f.params()[2].ty, ParamType::Named("Point".into()));
        assert_eq!(f.code()[0].b, Operand::Imm(Literal::Text(Rc::from("a, b # c"))));
        assert_eq!(f.code()[1].b, Operand::Imm(Literal::Bool(true)));
        assert_eq!(f.code()[2].b, Operand::Imm(Literal::Nil));
        assert_eq!(f.code()[3].b, Operand::Imm(Literal::Num(-2500.0)));
        assert_eq!(f.code()[4].c, Operand::Index(1));
        assert_eq!(f.code()[5].b, Operand::Offset(-2));
        assert!(f.code().iter().all(|i| i.check().is_ok()));
    }

    #[test]
    fn comments_may_start_with_a_digit() {
        let src = "fn f(x: num) regs=2 {\n    addk r1, r0, 1 # 2nd value\n    ret r1 #2nd result\n}\n";
        let program = parse_program(src).unwrap();
        assert_eq!(program.functions()[0].code().len(), 2);

        let src = "fn g(p: Point) regs=2 {\n    recfld r1, r0, #1 # field 1\n    ret r1\n}\n";
        let program = parse_program(src).unwrap();
        assert_eq!(program.functions()[0].code()[0].c, Operand::Index(1));
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = parse_program("fn f(x: num) {\n  frob r0\n}\n").unwrap_err();
        assert_eq!(err, AsmError::UnknownOpcode { line: 2, mnemonic: "frob".into() });

        let err = parse_program("fn f(x: num) {\n  addn r0, r1\n}\n").unwrap_err();
        assert_eq!(err.line(), 2);
        assert!(err.to_string().contains("takes 3 operand(s)"));

        let err = parse_program("\nfn f(x: num) {\n  ret r0\n").unwrap_err();
        assert_eq!(err, AsmError::Unclosed { line: 2, name: "f".into() });
    }

    #[test]
    fn rejects_duplicates_and_bad_registers() {
        let src = "fn f() {\n ret r0\n}\nfn f() {\n ret r0\n}\n";
        assert!(matches!(parse_program(src), Err(AsmError::Duplicate { line: 4, .. })));

        let err = parse_program("fn f() {\n ret x0\n}\n").unwrap_err();
        assert!(err.to_string().contains("expected a register"));

        let err = parse_program("fn f() {\n ret r300\n}\n").unwrap_err();
        assert!(err.to_string().contains("expected a register"));
    }
}

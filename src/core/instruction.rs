use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use crate::core::error::{Result, TuneError};
use crate::core::hash::StableHasher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionKind {
    Arithmetic,
    Memory,
    Control,
    Sync,
    Special,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateSpace {
    Global,
    Shared,
    Local,
    Const,
    Param,
    Generic,
}

/// `[base+offset]` address operand of a memory instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryOperand {
    pub base: String,
    pub offset: i64,
}

/// One parsed statement of a PTX-like kernel body.
///
/// Labels and body-scope directives (`{`, `}`, scoped `.reg`) are kept in the stream as
/// zero-latency `Control` pseudo-instructions so the dependency graph pins them in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: String,
    pub kind: InstructionKind,
    pub operands: Vec<String>,
    pub guard: Option<String>,
    pub latency: u32,
    pub throughput: u32,
}

const LABEL_OPCODE: &str = "label";
const DIRECTIVE_OPCODE: &str = "directive";

const SPECIAL_REGISTERS: &[&str] = &[
    "tid", "ntid", "ctaid", "nctaid", "laneid", "warpid", "nwarpid", "smid",
    "nsmid", "gridid", "clock", "clock64", "lanemask_eq", "lanemask_lt",
];

impl Instruction {
    pub fn new(opcode: &str, operands: Vec<String>) -> Self {
        let (kind, latency, throughput) = classify_opcode(opcode);
        Self {
            opcode: opcode.to_string(),
            kind,
            operands,
            guard: None,
            latency,
            throughput,
        }
    }

    pub fn label(name: &str) -> Self {
        Self {
            opcode: LABEL_OPCODE.to_string(),
            kind: InstructionKind::Control,
            operands: vec![name.to_string()],
            guard: None,
            latency: 0,
            throughput: 32,
        }
    }

    /// A directive line inside the body, rendered verbatim.
    pub fn directive(line: &str) -> Self {
        Self {
            opcode: DIRECTIVE_OPCODE.to_string(),
            kind: InstructionKind::Control,
            operands: vec![line.to_string()],
            guard: None,
            latency: 0,
            throughput: 32,
        }
    }

    pub fn with_guard(mut self, guard: Option<String>) -> Self {
        self.guard = guard;
        self
    }

    /// Cycles one warp holds the issue port: 32 lanes over the per-cycle throughput.
    pub fn issue_cycles(&self) -> u32 {
        (32 / self.throughput.max(1)).max(1)
    }

    /// First dotted component of the opcode (`ld` for `ld.global.f32`).
    pub fn base_op(&self) -> &str {
        self.opcode.split('.').next().unwrap_or("")
    }

    pub fn is_label(&self) -> bool {
        self.opcode == LABEL_OPCODE
    }

    pub fn is_directive(&self) -> bool {
        self.opcode == DIRECTIVE_OPCODE
    }

    /// Labels and directives: placeholders that issue nothing.
    pub fn is_pseudo(&self) -> bool {
        self.is_label() || self.is_directive()
    }

    pub fn label_name(&self) -> Option<&str> {
        if self.is_label() { self.operands.first().map(|s| s.as_str()) } else { None }
    }

    pub fn is_branch(&self) -> bool {
        self.base_op() == "bra"
    }

    pub fn is_load(&self) -> bool {
        matches!(self.base_op(), "ld" | "ldu" | "atom")
    }

    pub fn is_store(&self) -> bool {
        matches!(self.base_op(), "st" | "red" | "atom")
    }

    pub fn touches_memory(&self) -> bool {
        self.is_load() || self.is_store()
    }

    pub fn state_space(&self) -> Option<StateSpace> {
        if !self.touches_memory() && self.base_op() != "prefetch" {
            return None;
        }
        let space = self.opcode.split('.').skip(1).find_map(|part| match part {
            "global" => Some(StateSpace::Global),
            "shared" => Some(StateSpace::Shared),
            "local" => Some(StateSpace::Local),
            "const" => Some(StateSpace::Const),
            "param" => Some(StateSpace::Param),
            _ => None,
        });
        Some(space.unwrap_or(StateSpace::Generic))
    }

    /// Width in bytes of one accessed element, including vector multiplicity.
    pub fn element_bytes(&self) -> u32 {
        let mut width = 4;
        let mut lanes = 1;
        for part in self.opcode.split('.').skip(1) {
            match part {
                "v2" => lanes = 2,
                "v4" => lanes = 4,
                "u8" | "s8" | "b8" => width = 1,
                "f16" | "b16" | "u16" | "s16" | "bf16" => width = 2,
                "f32" | "b32" | "u32" | "s32" => width = 4,
                "f64" | "b64" | "u64" | "s64" => width = 8,
                _ => {}
            }
        }
        width * lanes
    }

    /// Registers written by this instruction.
    pub fn defs(&self) -> Vec<&str> {
        if self.is_pseudo() || self.operands.is_empty() {
            return Vec::new();
        }
        match self.kind {
            InstructionKind::Control | InstructionKind::Sync => return Vec::new(),
            _ => {}
        }
        if matches!(self.base_op(), "st" | "red" | "prefetch") {
            return Vec::new();
        }
        registers_in(&self.operands[0])
    }

    /// Registers read by this instruction, including the guard predicate and any
    /// address base registers.
    pub fn uses(&self) -> Vec<&str> {
        if self.is_pseudo() {
            return Vec::new();
        }
        let skip_first = !self.defs().is_empty();
        let mut regs = Vec::new();
        if let Some(guard) = &self.guard {
            regs.extend(registers_in(guard));
        }
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 && skip_first {
                continue;
            }
            regs.extend(registers_in(op));
        }
        regs
    }

    pub fn memory_operand(&self) -> Option<MemoryOperand> {
        let op = self.operands.iter().find(|o| o.trim_start().starts_with('['))?;
        parse_address(op)
    }

    pub fn render(&self) -> String {
        if let Some(name) = self.label_name() {
            return format!("{}:", name);
        }
        if self.is_directive() {
            return self.operands.first().cloned().unwrap_or_default();
        }
        let mut line = String::new();
        if let Some(guard) = &self.guard {
            line.push_str(guard);
            line.push(' ');
        }
        line.push_str(&self.opcode);
        if !self.operands.is_empty() {
            line.push(' ');
            line.push_str(&self.operands.join(", "));
        }
        line.push(';');
        line
    }

    /// Same instruction with every whole-token register occurrence renamed.
    pub fn rename_registers(&self, rename: &dyn Fn(&str) -> Option<String>) -> Self {
        let mut out = self.clone();
        out.operands = self.operands.iter().map(|op| rewrite_registers(op, rename)).collect();
        out.guard = self.guard.as_ref().map(|g| rewrite_registers(g, rename));
        out
    }
}

/// Latency, issue class and per-SM throughput of an opcode.
fn classify_opcode(opcode: &str) -> (InstructionKind, u32, u32) {
    let base = opcode.split('.').next().unwrap_or("");
    let space = |name: &str| opcode.split('.').any(|p| p == name);
    match base {
        "ld" | "ldu" | "st" => {
            let latency = if space("shared") {
                24
            } else if space("const") {
                8
            } else if space("param") {
                4
            } else {
                200
            };
            (InstructionKind::Memory, latency, 32)
        }
        "atom" | "red" => (InstructionKind::Memory, 300, 16),
        "prefetch" | "prefetchu" => (InstructionKind::Memory, 1, 32),
        "bar" | "barrier" | "membar" | "fence" => (InstructionKind::Sync, 16, 16),
        "bra" | "ret" | "exit" | "call" | "brx" => (InstructionKind::Control, 1, 32),
        "rcp" | "sqrt" | "rsqrt" | "sin" | "cos" | "lg2" | "ex2" | "div" | "tanh" => {
            (InstructionKind::Special, 20, 16)
        }
        "mov" => (InstructionKind::Arithmetic, 2, 64),
        "mul" | "mad" if space("wide") => (InstructionKind::Arithmetic, 5, 32),
        _ => (InstructionKind::Arithmetic, 4, 64),
    }
}

fn is_special_register(name: &str) -> bool {
    SPECIAL_REGISTERS.contains(&name)
}

/// Extracts `%name` register tokens; special registers such as `%tid.x` are skipped.
pub fn registers_in(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut regs = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let start = i;
            i += 1;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let name = &text[start + 1..i];
            if !name.is_empty() && !is_special_register(name) {
                regs.push(&text[start..i]);
            }
        } else {
            i += 1;
        }
    }
    regs
}

fn rewrite_registers(text: &str, rename: &dyn Fn(&str) -> Option<String>) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let start = i;
            i += 1;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let token = &text[start..i];
            match rename(token) {
                Some(new_name) => out.push_str(&new_name),
                None => out.push_str(token),
            }
        } else {
            let ch_len = text[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            out.push_str(&text[i..i + ch_len]);
            i += ch_len;
        }
    }
    out
}

fn parse_address(operand: &str) -> Option<MemoryOperand> {
    let inner = operand.trim().strip_prefix('[')?.strip_suffix(']')?.trim();
    let split = inner.char_indices().skip(1).find(|(_, c)| *c == '+' || *c == '-');
    let (base, offset) = match split {
        Some((idx, sign)) => {
            let magnitude: i64 = inner[idx + 1..].trim().parse().ok()?;
            let offset = if sign == '-' { -magnitude } else { magnitude };
            (inner[..idx].trim(), offset)
        }
        None => match inner.parse::<i64>() {
            Ok(abs) => ("", abs),
            Err(_) => (inner, 0),
        },
    };
    Some(MemoryOperand { base: base.to_string(), offset })
}

/// Splits operands on top-level commas, leaving `[a+b]` and `{a, b}` intact.
fn split_operands(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in text.chars() {
        match ch {
            '[' | '{' | '(' => { depth += 1; current.push(ch); }
            ']' | '}' | ')' => { depth -= 1; current.push(ch); }
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn parse_statement(stmt: &str, line: usize) -> Result<Instruction> {
    let mut rest = stmt.trim();
    let mut guard = None;
    if rest.starts_with('@') {
        let end = rest.find(char::is_whitespace).ok_or_else(|| TuneError::Parse {
            line,
            message: "guard without instruction".to_string(),
        })?;
        guard = Some(rest[..end].to_string());
        rest = rest[end..].trim_start();
    }
    let (opcode, operand_text) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim()),
        None => (rest, ""),
    };
    if opcode.is_empty() || !opcode.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_') {
        return Err(TuneError::Parse { line, message: format!("invalid opcode '{}'", opcode) });
    }
    let depth: i32 = operand_text.chars().map(|c| match c {
        '[' | '{' => 1,
        ']' | '}' => -1,
        _ => 0,
    }).sum();
    if depth != 0 {
        return Err(TuneError::Parse { line, message: "unbalanced brackets".to_string() });
    }
    Ok(Instruction::new(opcode, split_operands(operand_text)).with_guard(guard))
}

fn is_directive(line: &str) -> bool {
    line.starts_with('.') || line.starts_with('{') || line.starts_with('}')
        || line.starts_with('(') || line.starts_with(')')
}

/// Registers advanced by a constant each pass through `body`: exactly one definition,
/// of the form `add r, r, imm` or `sub r, r, imm`. Maps to (defining index, step).
pub fn induction_registers(body: &[Instruction]) -> HashMap<&str, (usize, i64)> {
    let mut def_count: HashMap<&str, usize> = HashMap::new();
    for inst in body {
        for d in inst.defs() {
            *def_count.entry(d).or_default() += 1;
        }
    }
    let mut induction = HashMap::new();
    for (pos, inst) in body.iter().enumerate() {
        let base = inst.base_op();
        if (base == "add" || base == "sub") && inst.operands.len() == 3
            && inst.operands[0] == inst.operands[1]
            && def_count.get(inst.operands[0].as_str()) == Some(&1)
        {
            if let Some(imm) = parse_immediate(&inst.operands[2]) {
                let step = if base == "sub" { -imm } else { imm };
                induction.insert(inst.operands[0].as_str(), (pos, step));
            }
        }
    }
    induction
}

/// Integer literal operand, decimal or `0x` hex.
pub fn parse_immediate(operand: &str) -> Option<i64> {
    let text = operand.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}

/// Loop region `label: ... @p bra label;` with no other control flow inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopRegion {
    pub label: String,
    /// Index of the label pseudo-instruction.
    pub start: usize,
    /// Index of the backward branch.
    pub end: usize,
}

/// A parsed PTX-like kernel: directives around a flat instruction body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    pub name: String,
    pub header: Vec<String>,
    pub body: Vec<Instruction>,
    pub footer: Vec<String>,
}

impl Kernel {
    pub fn parse(source: &str) -> Result<Self> {
        let mut header = Vec::new();
        let mut body = Vec::new();
        // Directives seen after the first instruction. They stay in place when more
        // instructions follow and close the kernel otherwise.
        let mut pending: Vec<String> = Vec::new();

        for (idx, raw) in source.lines().enumerate() {
            let line_no = idx + 1;
            let line = match raw.find("//") {
                Some(pos) => &raw[..pos],
                None => raw,
            }.trim();
            if line.is_empty() {
                continue;
            }
            if is_directive(line) {
                if body.is_empty() {
                    header.push(line.to_string());
                } else {
                    pending.push(line.to_string());
                }
                continue;
            }
            body.extend(pending.drain(..).map(|l| Instruction::directive(&l)));

            let mut rest = line;
            if let Some(colon) = rest.find(':') {
                let candidate = &rest[..colon];
                if !candidate.is_empty()
                    && !candidate.starts_with('@')
                    && candidate.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
                {
                    body.push(Instruction::label(candidate));
                    rest = rest[colon + 1..].trim();
                    if rest.is_empty() {
                        continue;
                    }
                }
            }

            for stmt in rest.split_inclusive(';') {
                let stmt = stmt.trim();
                if stmt.is_empty() {
                    continue;
                }
                let Some(stmt) = stmt.strip_suffix(';') else {
                    return Err(TuneError::Parse {
                        line: line_no,
                        message: format!("missing ';' after '{}'", stmt),
                    });
                };
                body.push(parse_statement(stmt, line_no)?);
            }
        }

        let name = header.iter()
            .find_map(|l| {
                let pos = l.find(".entry")?;
                let after = l[pos + ".entry".len()..].trim();
                let end = after.find(|c: char| c == '(' || c.is_whitespace()).unwrap_or(after.len());
                Some(after[..end].to_string())
            })
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "kernel".to_string());

        Ok(Self { name, header, body, footer: pending })
    }

    pub fn to_source(&self) -> String {
        let mut out = String::new();
        for line in &self.header {
            out.push_str(line);
            out.push('\n');
        }
        for inst in &self.body {
            if !inst.is_label() {
                out.push_str("    ");
            }
            out.push_str(&inst.render());
            out.push('\n');
        }
        for line in &self.footer {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn with_body(&self, body: Vec<Instruction>) -> Self {
        Self {
            name: self.name.clone(),
            header: self.header.clone(),
            body,
            footer: self.footer.clone(),
        }
    }

    /// Stable structural hash of the rendered source, used in cache keys.
    pub fn signature(&self) -> u64 {
        StableHasher::new()
            .write_str(&self.name)
            .write_str(&self.to_source())
            .finish()
    }

    /// Appends a `.reg` declaration for a register introduced by a rewrite.
    pub fn declare_register(&mut self, name: &str) {
        let ty = if name.starts_with("%rd") {
            ".b64"
        } else if name.starts_with("%p") {
            ".pred"
        } else if name.starts_with("%fd") {
            ".f64"
        } else {
            ".b32"
        };
        let decl = format!(".reg {} {};", ty, name);
        if !self.header.contains(&decl) {
            self.header.push(decl);
        }
    }

    pub fn find_loop(&self) -> Option<LoopRegion> {
        for (start, inst) in self.body.iter().enumerate() {
            let Some(label) = inst.label_name() else { continue };
            for end in start + 1..self.body.len() {
                let cand = &self.body[end];
                if cand.is_branch() && cand.operands.first().map(|s| s.as_str()) == Some(label) {
                    return Some(LoopRegion { label: label.to_string(), start, end });
                }
                if cand.kind == InstructionKind::Control {
                    break;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAXPY: &str = r#"
.visible .entry saxpy(
    .param .u64 x
)
{
    .reg .f32 %f<4>;
    mov.u32 %r1, %tid.x;
    mul.wide.u32 %rd2, %r1, 4;
    add.s64 %rd3, %rd1, %rd2;
    ld.global.f32 %f1, [%rd3];   // x[i]
    fma.rn.f32 %f3, %f1, %f2, %f1;
    st.global.f32 [%rd3+0], %f3;
LOOP:
    @%p1 bra LOOP;
    ret;
}
"#;

    #[test]
    fn test_parse_kernel_layout() {
        let kernel = Kernel::parse(SAXPY).unwrap();
        assert_eq!(kernel.name, "saxpy");
        assert_eq!(kernel.body.len(), 9);
        assert_eq!(kernel.footer, vec!["}".to_string()]);
        assert!(kernel.body[6].is_label());
        assert_eq!(kernel.body[7].guard.as_deref(), Some("@%p1"));
    }

    #[test]
    fn test_defs_and_uses() {
        let kernel = Kernel::parse(SAXPY).unwrap();
        let ld = &kernel.body[3];
        assert_eq!(ld.kind, InstructionKind::Memory);
        assert_eq!(ld.defs(), vec!["%f1"]);
        assert_eq!(ld.uses(), vec!["%rd3"]);
        // %tid.x is a special register, never a data dependency
        assert!(kernel.body[0].uses().is_empty());
        let st = &kernel.body[5];
        assert!(st.defs().is_empty());
        assert_eq!(st.uses(), vec!["%rd3", "%f3"]);
        assert_eq!(st.memory_operand(), Some(MemoryOperand { base: "%rd3".into(), offset: 0 }));
    }

    #[test]
    fn test_round_trip_source() {
        let kernel = Kernel::parse(SAXPY).unwrap();
        let again = Kernel::parse(&kernel.to_source()).unwrap();
        assert_eq!(kernel, again);
    }

    #[test]
    fn test_body_scopes_stay_in_place() {
        let source = r#"
.visible .entry scoped()
{
    .reg .b32 %r<2>;
    mov.u32 %r1, 1;
    {
        .reg .b32 %t<2>;
        add.u32 %t1, %r1, 1;
    }
    {
        .reg .b32 %t<2>;
        add.u32 %t1, %r1, 2;
    }
    ret;
}
"#;
        let kernel = Kernel::parse(source).unwrap();
        assert_eq!(kernel.header.last().map(String::as_str), Some(".reg .b32 %r<2>;"));
        assert_eq!(kernel.footer, vec!["}".to_string()]);
        let rendered: Vec<String> = kernel.body.iter().map(Instruction::render).collect();
        assert_eq!(rendered, vec![
            "mov.u32 %r1, 1;", "{", ".reg .b32 %t<2>;", "add.u32 %t1, %r1, 1;", "}",
            "{", ".reg .b32 %t<2>;", "add.u32 %t1, %r1, 2;", "}", "ret;",
        ]);
        assert!(kernel.body[2].is_directive());
        assert!(kernel.body[2].defs().is_empty() && kernel.body[2].uses().is_empty());
        assert_eq!(Kernel::parse(&kernel.to_source()).unwrap(), kernel);
    }

    #[test]
    fn test_missing_semicolon_is_error() {
        let err = Kernel::parse("add.f32 %f1, %f2, %f3").unwrap_err();
        assert!(matches!(err, TuneError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_find_loop() {
        let src = "mov.u32 %r1, 0;\nBODY:\nadd.u32 %r1, %r1, 1;\nsetp.lt.u32 %p1, %r1, 8;\n@%p1 bra BODY;\nret;";
        let kernel = Kernel::parse(src).unwrap();
        let region = kernel.find_loop().unwrap();
        assert_eq!(region.label, "BODY");
        assert_eq!((region.start, region.end), (1, 4));
    }

    #[test]
    fn test_induction_registers() {
        let kernel = Kernel::parse("ld.global.f32 %f1, [%rd1];\nadd.s64 %rd1, %rd1, 16;\nsub.s32 %r1, %r1, 0x2;\nadd.s32 %r2, %r2, %r3;").unwrap();
        let induction = induction_registers(&kernel.body);
        assert_eq!(induction.get("%rd1"), Some(&(1, 16)));
        assert_eq!(induction.get("%r1"), Some(&(2, -2)));
        assert!(!induction.contains_key("%r2"));
    }

    #[test]
    fn test_element_bytes() {
        assert_eq!(Instruction::new("ld.global.v4.f32", vec![]).element_bytes(), 16);
        assert_eq!(Instruction::new("ld.shared.f64", vec![]).element_bytes(), 8);
        assert_eq!(Instruction::new("st.global.b16", vec![]).element_bytes(), 2);
    }
}

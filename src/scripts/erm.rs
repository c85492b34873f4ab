use std::fmt::Write as _;
use std::rc::Rc;

use crate::error::ScriptError;
use crate::pool::ScriptPool;
use crate::scripts::{Context, Script, ScriptHost, ScriptLanguage};

/// ERM backend. ERM is never executed directly: it compiles to Rhai source, which the Rhai host
/// then compiles and runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErmHost;

impl ErmHost {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptHost for ErmHost {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Erm
    }

    fn stages_into(&self) -> Option<ScriptLanguage> {
        Some(ScriptLanguage::Rhai)
    }

    fn compile(&self, name: &str, source: &str) -> Result<String, ScriptError> {
        let commands = scan(name, source)?;
        let program = Program::build(name, &commands)?;
        Ok(program.emit(name))
    }

    fn create_context_for(&self, _script: &Script, _pool: &ScriptPool) -> Result<Rc<dyn Context>, ScriptError> {
        Err(ScriptError::NotExecutable(ScriptLanguage::Erm))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Trigger,
    PostTrigger,
    Instruction,
    Receiver,
}

#[derive(Debug)]
struct Command {
    kind: CommandKind,
    line: usize,
    body: String,
}

fn error_at(name: &str, line: usize, message: impl std::fmt::Display) -> ScriptError {
    ScriptError::compile(name, format!("line {line}: {message}"))
}

fn scan(name: &str, source: &str) -> Result<Vec<Command>, ScriptError> {
    let mut commands = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;

    while let Some(ch) = chars.next() {
        if ch == '\n' {
            line += 1;
            continue;
        }
        if ch != '!' {
            continue;
        }
        let kind = match chars.peek() {
            Some('?') => CommandKind::Trigger,
            Some('$') => CommandKind::PostTrigger,
            Some('#') => CommandKind::Instruction,
            Some('!') => CommandKind::Receiver,
            _ => continue,
        };
        chars.next();

        let start = line;
        let mut body = String::new();
        let mut in_string = false;
        let mut terminated = false;
        for ch in chars.by_ref() {
            match ch {
                '\n' => {
                    line += 1;
                    body.push(ch);
                }
                '^' => {
                    in_string = !in_string;
                    body.push(ch);
                }
                ';' if !in_string => {
                    terminated = true;
                    break;
                }
                _ => body.push(ch),
            }
        }
        if !terminated {
            return Err(error_at(name, start, "command is missing its terminating ';'"));
        }
        commands.push(Command { kind, line: start, body: body.trim().to_string() });
    }
    Ok(commands)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Init,
    BeforeDamage,
    AfterDamage,
}

impl Trigger {
    fn parse(kind: CommandKind, body: &str) -> Option<Self> {
        match (kind, body) {
            (CommandKind::Trigger, "PI") => Some(Trigger::Init),
            (CommandKind::Trigger, "MF1") => Some(Trigger::BeforeDamage),
            (CommandKind::PostTrigger, "MF1") => Some(Trigger::AfterDamage),
            _ => None,
        }
    }

    fn in_damage_event(self) -> bool {
        matches!(self, Trigger::BeforeDamage | Trigger::AfterDamage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Var {
    Global(u32),
    Quick(char),
    Local(i32),
}

impl Var {
    fn parse(token: &str) -> Option<Self> {
        let mut chars = token.chars();
        let head = chars.next()?;
        let rest = chars.as_str();
        match head {
            'v' => rest.parse::<u32>().ok().filter(|index| *index > 0).map(Var::Global),
            'y' => rest.parse::<i32>().ok().filter(|index| *index != 0).map(Var::Local),
            'f'..='t' if rest.is_empty() => Some(Var::Quick(head)),
            _ => None,
        }
    }

    fn place(&self) -> String {
        match self {
            Var::Global(index) => format!("this.v{index}"),
            Var::Quick(name) => format!("this.{name}"),
            Var::Local(index) => format!("y[\"{index}\"]"),
        }
    }

    fn read(&self) -> String {
        format!("({} ?? 0)", self.place())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    Int(i64),
    Var(Var),
}

impl Operand {
    fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if let Ok(value) = token.parse::<i64>() {
            return Some(Operand::Int(value));
        }
        Var::parse(token).map(Operand::Var)
    }

    fn expr(&self) -> String {
        match self {
            Operand::Int(value) => value.to_string(),
            Operand::Var(var) => var.read(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Statement {
    Assign { target: Var, op: char, value: Operand },
    ReadBaseDamage(Var),
    ReadDamage(Var),
    SetDamage(Operand),
    Message(String),
}

impl Statement {
    fn parse(name: &str, command: &Command, trigger: Option<Trigger>) -> Result<Self, ScriptError> {
        let body = command.body.as_str();
        let fail = |message: String| error_at(name, command.line, message);

        if let Some(rest) = body.strip_prefix("VR") {
            let (var, action) = rest.split_once(':').ok_or_else(|| fail(format!("malformed VR receiver '{body}'")))?;
            let target = Var::parse(var.trim()).ok_or_else(|| fail(format!("unknown variable '{var}'")))?;
            let mut action = action.trim().chars();
            let op = action.next().filter(|op| matches!(op, 'S' | '+' | '-' | '*' | ':' | '%'));
            let op = op.ok_or_else(|| fail(format!("unknown VR operation in '{body}'")))?;
            let value = action.as_str();
            let value = Operand::parse(value).ok_or_else(|| fail(format!("invalid VR operand '{value}'")))?;
            return Ok(Statement::Assign { target, op, value });
        }

        if let Some(rest) = body.strip_prefix("MF:") {
            let Some(trigger) = trigger.filter(|trigger| trigger.in_damage_event()) else {
                return Err(fail("MF receivers are only valid inside MF triggers".to_string()));
            };
            if let Some(var) = rest.strip_prefix("D?") {
                let var = Var::parse(var.trim()).ok_or_else(|| fail(format!("unknown variable '{var}'")))?;
                return Ok(Statement::ReadBaseDamage(var));
            }
            if let Some(var) = rest.strip_prefix("F?") {
                let var = Var::parse(var.trim()).ok_or_else(|| fail(format!("unknown variable '{var}'")))?;
                return Ok(Statement::ReadDamage(var));
            }
            if let Some(value) = rest.strip_prefix('F') {
                if trigger == Trigger::AfterDamage {
                    return Err(fail("damage cannot be changed after it was applied".to_string()));
                }
                let value = Operand::parse(value).ok_or_else(|| fail(format!("invalid MF operand '{value}'")))?;
                return Ok(Statement::SetDamage(value));
            }
            return Err(fail(format!("unsupported MF receiver '{body}'")));
        }

        if let Some(rest) = body.strip_prefix("IF:M") {
            let text = rest
                .strip_prefix('^')
                .and_then(|text| text.strip_suffix('^'))
                .ok_or_else(|| fail(format!("IF:M expects a ^quoted^ message, got '{rest}'")))?;
            return Ok(Statement::Message(text.to_string()));
        }

        Err(fail(format!("unsupported receiver '{body}'")))
    }

    fn emit(&self, out: &mut String) {
        let _ = match self {
            Statement::Assign { target, op, value } => {
                let current = target.read();
                let value = value.expr();
                let expr = match op {
                    'S' => value,
                    '+' => format!("{current} + {value}"),
                    '-' => format!("{current} - {value}"),
                    '*' => format!("{current} * {value}"),
                    ':' => format!("{current} / {value}"),
                    _ => format!("{current} % {value}"),
                };
                writeln!(out, "        {} = {expr};", target.place())
            }
            Statement::ReadBaseDamage(var) => writeln!(out, "        {} = base_damage;", var.place()),
            Statement::ReadDamage(var) => writeln!(out, "        {} = event.damage_amount;", var.place()),
            Statement::SetDamage(value) => writeln!(out, "        event.damage_amount = {};", value.expr()),
            Statement::Message(text) => writeln!(out, "        log({});", rhai_string(text)),
        };
    }
}

fn rhai_string(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}

#[derive(Debug, Default)]
struct Program {
    instructions: Vec<Statement>,
    blocks: Vec<(Trigger, Vec<Statement>)>,
}

impl Program {
    fn build(name: &str, commands: &[Command]) -> Result<Self, ScriptError> {
        let mut program = Program::default();
        for command in commands {
            match command.kind {
                CommandKind::Trigger | CommandKind::PostTrigger => {
                    let trigger = Trigger::parse(command.kind, &command.body)
                        .ok_or_else(|| error_at(name, command.line, format!("unsupported trigger '{}'", command.body)))?;
                    program.blocks.push((trigger, Vec::new()));
                }
                CommandKind::Instruction => {
                    let statement = Statement::parse(name, command, None)?;
                    program.instructions.push(statement);
                }
                CommandKind::Receiver => {
                    let Some((trigger, statements)) = program.blocks.last_mut() else {
                        return Err(error_at(name, command.line, "receiver outside of a trigger"));
                    };
                    statements.push(Statement::parse(name, command, Some(*trigger))?);
                }
            }
        }
        Ok(program)
    }

    fn blocks_for(&self, trigger: Trigger) -> impl Iterator<Item = &[Statement]> {
        self.blocks.iter().filter(move |(kind, _)| *kind == trigger).map(|(_, statements)| statements.as_slice())
    }

    fn emit(&self, name: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "// compiled from {name}");
        out.push_str("fn init() {\n");
        emit_block(&mut out, &self.instructions);
        for block in self.blocks_for(Trigger::Init) {
            emit_block(&mut out, block);
        }
        out.push_str("}\n");

        for (trigger, function) in [
            (Trigger::BeforeDamage, "before_apply_damage"),
            (Trigger::AfterDamage, "after_apply_damage"),
        ] {
            if self.blocks_for(trigger).next().is_none() {
                continue;
            }
            let _ = writeln!(out, "\nfn {function}(event) {{");
            out.push_str("    let base_damage = event.damage_amount;\n");
            for block in self.blocks_for(trigger) {
                emit_block(&mut out, block);
            }
            out.push_str("    event\n}\n");
        }
        out
    }
}

fn emit_block(out: &mut String, statements: &[Statement]) {
    if statements.is_empty() {
        return;
    }
    out.push_str("    {\n        let y = #{};\n");
    for statement in statements {
        statement.emit(out);
    }
    out.push_str("    }\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> Result<String, ScriptError> {
        ErmHost::new().compile("test.erm", source)
    }

    fn compile_error(source: &str) -> String {
        match compile(source) {
            Err(ScriptError::Compile { message, .. }) => message,
            other => panic!("expected a compile error, got {other:?}"),
        }
    }

    #[test]
    fn damage_trigger_becomes_before_handler() {
        let code = compile("ZVSE\n!?MF1;\n!!MF:D?y-1;\n!!VRy-1:+10;\n!!MF:Fy-1;\n").expect("compiles");
        assert!(code.contains("fn before_apply_damage(event) {"));
        assert!(code.contains("y[\"-1\"] = base_damage;"));
        assert!(code.contains("y[\"-1\"] = (y[\"-1\"] ?? 0) + 10;"));
        assert!(code.contains("event.damage_amount = (y[\"-1\"] ?? 0);"));
        assert!(!code.contains("after_apply_damage"));
    }

    #[test]
    fn instructions_and_init_triggers_share_init() {
        let code = compile("!#VRv2:S7;\n!?PI;\n!!VRf:Sv2;\n!!IF:M^ready; go^;\n").expect("compiles");
        let init = code.split("fn init() {").nth(1).expect("init emitted");
        assert!(init.find("this.v2 = 7;").expect("instruction") < init.find("this.f = (this.v2 ?? 0);").expect("pi"));
        assert!(code.contains("log(\"ready; go\");"));
    }

    #[test]
    fn errors_carry_the_line_number() {
        assert!(compile_error("\n\n!?XX1;").contains("line 3"));
        assert!(compile_error("!?PI;\n!!VRv1:S1").contains("missing its terminating ';'"));
        assert!(compile_error("!!VRv1:S1;").contains("outside of a trigger"));
        assert!(compile_error("!?PI;\n!!UN:P3;").contains("line 2: unsupported receiver"));
    }

    #[test]
    fn damage_receivers_are_scoped_to_damage_triggers() {
        assert!(compile_error("!?PI;\n!!MF:F1;").contains("only valid inside MF triggers"));
        assert!(compile_error("!$MF1;\n!!MF:F1;").contains("after it was applied"));
        let code = compile("!$MF1;\n!!MF:F?v3;").expect("post trigger may read damage");
        assert!(code.contains("fn after_apply_damage(event) {"));
    }

    #[test]
    fn variables_are_validated() {
        assert_eq!(Var::parse("v12"), Some(Var::Global(12)));
        assert_eq!(Var::parse("y-3"), Some(Var::Local(-3)));
        assert_eq!(Var::parse("t"), Some(Var::Quick('t')));
        assert_eq!(Var::parse("v0"), None);
        assert_eq!(Var::parse("z"), None);
        assert!(compile_error("!?PI;\n!!VRw1:S1;").contains("unknown variable"));
    }
}

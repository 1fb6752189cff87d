//! C8 — Effect applier.
//!
//! The tokenizer/parser is hand-rolled over a char slice exactly the way
//! the teacher's `apply-patch/src/parser.rs` scans a patch line by line
//! with `strip_prefix` and explicit indices rather than a parser-combinator
//! crate. The handler dispatch mirrors `core/src/safety.rs`'s pattern of
//! one atomic, independently-failable check per item in a list.

use std::collections::HashMap;

use crate::error::CoreError;
use crate::resolve::ResolvedRef;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
    /// Bare identifier, including dotted refs like `actor.p`.
    Ident(String),
    List(Vec<Value>),
    Object(Vec<(String, Value)>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Ident(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn format(&self) -> String {
        match self {
            Value::Str(s) => format!("\"{}\"", escape(s)),
            Value::Num(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::Bool(b) => b.to_string(),
            Value::Ident(s) => s.clone(),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::format).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Object(entries) => {
                let inner: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.format()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// One parsed `SUBJECT.VERB(key=value, …)` line. `verb` carries the full
/// dotted form (`SYSTEM.APPLY_DAMAGE`) — handler dispatch matches on it
/// whole, falling back to the bare trailing segment where the registry
/// only lists one.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub verb: String,
    pub args: Vec<(String, Value)>,
}

impl Command {
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn format(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|(k, v)| format!("{k}={}", v.format()))
            .collect();
        format!("{}({})", self.verb, args.join(", "))
    }
}

/// spec.md §4.8 round-trip law: `parse_machine_text ∘ format` is the
/// identity modulo whitespace.
pub fn format(commands: &[Command]) -> String {
    commands
        .iter()
        .map(Command::format)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses one command-per-line text into a list of [`Command`]s, skipping
/// blank lines. Identifiers allow `[A-Za-z0-9_!:-]` and `.`; strings are
/// double-quoted with `\"`/`\\`; lists in `[...]`, objects in `{k=v, ...}`.
pub fn parse_machine_text(text: &str) -> Result<Vec<Command>, CoreError> {
    let mut commands = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        commands.push(parse_line(line, idx + 1)?);
    }
    Ok(commands)
}

fn parse_err(line_no: usize, message: impl Into<String>) -> CoreError {
    CoreError::ParseError {
        line: line_no,
        message: message.into(),
    }
}

fn parse_line(line: &str, line_no: usize) -> Result<Command, CoreError> {
    let chars: Vec<char> = line.chars().collect();
    let mut pos = 0;
    let verb = parse_identifier(&chars, &mut pos)
        .ok_or_else(|| parse_err(line_no, "expected a VERB identifier"))?;
    skip_ws(&chars, &mut pos);
    if chars.get(pos) != Some(&'(') {
        return Err(parse_err(line_no, "expected '(' after verb"));
    }
    pos += 1;
    let args = parse_args(&chars, &mut pos, line_no)?;
    skip_ws(&chars, &mut pos);
    if chars.get(pos) != Some(&')') {
        return Err(parse_err(line_no, "expected closing ')'"));
    }
    pos += 1;
    skip_ws(&chars, &mut pos);
    if pos != chars.len() {
        return Err(parse_err(line_no, "unexpected trailing characters"));
    }
    Ok(Command { verb, args })
}

fn skip_ws(chars: &[char], pos: &mut usize) {
    while chars.get(*pos).is_some_and(|c| c.is_whitespace()) {
        *pos += 1;
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '!' | ':' | '-' | '.')
}

fn parse_identifier(chars: &[char], pos: &mut usize) -> Option<String> {
    let start = *pos;
    while chars.get(*pos).is_some_and(|c| is_ident_char(*c)) {
        *pos += 1;
    }
    if *pos == start {
        None
    } else {
        Some(chars[start..*pos].iter().collect())
    }
}

fn parse_args(
    chars: &[char],
    pos: &mut usize,
    line_no: usize,
) -> Result<Vec<(String, Value)>, CoreError> {
    let mut args = Vec::new();
    skip_ws(chars, pos);
    if chars.get(*pos) == Some(&')') {
        return Ok(args);
    }
    loop {
        skip_ws(chars, pos);
        let key = parse_identifier(chars, pos)
            .ok_or_else(|| parse_err(line_no, "expected argument name"))?;
        skip_ws(chars, pos);
        if chars.get(*pos) != Some(&'=') {
            return Err(parse_err(line_no, format!("expected '=' after '{key}'")));
        }
        *pos += 1;
        skip_ws(chars, pos);
        let value = parse_value(chars, pos, line_no)?;
        args.push((key, value));
        skip_ws(chars, pos);
        match chars.get(*pos) {
            Some(',') => {
                *pos += 1;
            }
            Some(')') => break,
            _ => return Err(parse_err(line_no, "expected ',' or ')'")),
        }
    }
    Ok(args)
}

fn parse_value(chars: &[char], pos: &mut usize, line_no: usize) -> Result<Value, CoreError> {
    skip_ws(chars, pos);
    match chars.get(*pos) {
        Some('"') => parse_string(chars, pos, line_no),
        Some('[') => parse_list(chars, pos, line_no),
        Some('{') => parse_object(chars, pos, line_no),
        Some(c) if c.is_ascii_digit() || *c == '-' => parse_number(chars, pos, line_no),
        Some(c) if is_ident_char(*c) => parse_bare(chars, pos),
        _ => Err(parse_err(line_no, "unexpected character in value position")),
    }
}

fn parse_string(chars: &[char], pos: &mut usize, line_no: usize) -> Result<Value, CoreError> {
    *pos += 1; // opening quote
    let mut out = String::new();
    loop {
        match chars.get(*pos) {
            Some('"') => {
                *pos += 1;
                return Ok(Value::Str(out));
            }
            Some('\\') => {
                *pos += 1;
                match chars.get(*pos) {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    _ => return Err(parse_err(line_no, "invalid escape sequence")),
                }
                *pos += 1;
            }
            Some(c) => {
                out.push(*c);
                *pos += 1;
            }
            None => return Err(parse_err(line_no, "unterminated string literal")),
        }
    }
}

fn parse_number(chars: &[char], pos: &mut usize, line_no: usize) -> Result<Value, CoreError> {
    let start = *pos;
    if chars.get(*pos) == Some(&'-') {
        *pos += 1;
    }
    while chars
        .get(*pos)
        .is_some_and(|c| c.is_ascii_digit() || *c == '.')
    {
        *pos += 1;
    }
    let text: String = chars[start..*pos].iter().collect();
    text.parse::<f64>()
        .map(Value::Num)
        .map_err(|_| parse_err(line_no, format!("invalid number literal '{text}'")))
}

fn parse_bare(chars: &[char], pos: &mut usize) -> Result<Value, CoreError> {
    let ident = parse_identifier(chars, pos).expect("caller checked is_ident_char");
    Ok(match ident.as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Ident(ident),
    })
}

fn parse_list(chars: &[char], pos: &mut usize, line_no: usize) -> Result<Value, CoreError> {
    *pos += 1; // '['
    let mut items = Vec::new();
    skip_ws(chars, pos);
    if chars.get(*pos) == Some(&']') {
        *pos += 1;
        return Ok(Value::List(items));
    }
    loop {
        items.push(parse_value(chars, pos, line_no)?);
        skip_ws(chars, pos);
        match chars.get(*pos) {
            Some(',') => {
                *pos += 1;
            }
            Some(']') => {
                *pos += 1;
                break;
            }
            _ => return Err(parse_err(line_no, "expected ',' or ']' in list")),
        }
    }
    Ok(Value::List(items))
}

fn parse_object(chars: &[char], pos: &mut usize, line_no: usize) -> Result<Value, CoreError> {
    *pos += 1; // '{'
    let mut entries = Vec::new();
    skip_ws(chars, pos);
    if chars.get(*pos) == Some(&'}') {
        *pos += 1;
        return Ok(Value::Object(entries));
    }
    loop {
        skip_ws(chars, pos);
        let key = parse_identifier(chars, pos)
            .ok_or_else(|| parse_err(line_no, "expected object key"))?;
        skip_ws(chars, pos);
        if chars.get(*pos) != Some(&'=') {
            return Err(parse_err(line_no, "expected '=' in object entry"));
        }
        *pos += 1;
        let value = parse_value(chars, pos, line_no)?;
        entries.push((key, value));
        skip_ws(chars, pos);
        match chars.get(*pos) {
            Some(',') => {
                *pos += 1;
            }
            Some('}') => {
                *pos += 1;
                break;
            }
            _ => return Err(parse_err(line_no, "expected ',' or '}' in object")),
        }
    }
    Ok(Value::Object(entries))
}

/// Verbs that must carry a `tool=` argument or produce `E_MISSING_TOOL`
/// (spec.md §4.8). Weapon-mediated damage is the only handler in this
/// build that cares; other verbs accept an absent tool.
const TOOL_REQUIRED_VERBS: &[&str] = &["SYSTEM.APPLY_DAMAGE"];

fn requires_tool(verb: &str) -> bool {
    TOOL_REQUIRED_VERBS.contains(&verb)
}

/// One mutation performed against entity storage, independently failable
/// (spec.md §4.8 step 3: "a failure produces a warning, not a diff; the
/// rest of the command list still runs").
pub trait EffectExecutor {
    fn apply_damage(&mut self, target: &str, source: &str, tool: Option<&str>, potency: f64) -> Result<String, String>;
    fn apply_heal(&mut self, target: &str, amount: f64) -> Result<String, String>;
    fn apply_tag(&mut self, target: &str, tag: &str, stacks: u32) -> Result<String, String>;
    fn remove_tag(&mut self, target: &str, tag: &str) -> Result<String, String>;
    fn adjust_inventory(&mut self, owner: &str, item_ref: &str, delta: i32) -> Result<String, String>;
    fn adjust_resource(&mut self, target: &str, resource: &str, delta: f64) -> Result<String, String>;
    fn adjust_stat(&mut self, target: &str, stat: &str, delta: f64) -> Result<String, String>;
    fn set_awareness(&mut self, observer: &str, target: &str, aware: bool) -> Result<String, String>;
    fn advance_time(&mut self, minutes: u32) -> Result<String, String>;
    fn set_occupancy(&mut self, actor: &str, location: &str) -> Result<String, String>;
}

#[derive(Debug, Clone, Default)]
pub struct ApplyEffectsResult {
    pub effects_applied: u32,
    pub diffs: Vec<String>,
    pub warnings: Vec<String>,
}

/// Dispatches every parsed command to its handler (spec.md §4.8 step 2),
/// resolving ref-valued args strictly via C7 first. A command whose refs
/// fail to resolve, whose tool is missing, or whose handler errors
/// contributes a warning rather than aborting the batch.
pub fn apply_effects(
    commands: &[Command],
    resolved: &HashMap<String, ResolvedRef>,
    executor: &mut impl EffectExecutor,
) -> ApplyEffectsResult {
    let mut result = ApplyEffectsResult::default();

    for cmd in commands {
        if requires_tool(&cmd.verb) && cmd.arg("tool").is_none() {
            result
                .warnings
                .push(format!("E_MISSING_TOOL: {}", cmd.verb));
            continue;
        }

        let outcome = dispatch(cmd, resolved, executor);
        match outcome {
            Ok(diff) => {
                result.effects_applied += 1;
                result.diffs.push(diff);
            }
            Err(warning) => result.warnings.push(warning),
        }
    }

    result
}

fn ref_str<'a>(
    cmd: &'a Command,
    key: &str,
    resolved: &'a HashMap<String, ResolvedRef>,
) -> Result<&'a str, String> {
    let raw = cmd
        .arg(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{}: missing argument '{key}'", cmd.verb))?;
    resolved
        .get(raw)
        .map(|_| raw)
        .ok_or_else(|| format!("{}: unresolved ref '{raw}'", cmd.verb))
}

fn dispatch(
    cmd: &Command,
    resolved: &HashMap<String, ResolvedRef>,
    executor: &mut impl EffectExecutor,
) -> Result<String, String> {
    match cmd.verb.as_str() {
        "SYSTEM.APPLY_DAMAGE" => {
            let target = ref_str(cmd, "target", resolved)?;
            let source = ref_str(cmd, "source", resolved)?;
            let tool = cmd.arg("tool").and_then(Value::as_str);
            let potency = cmd
                .arg("potency")
                .and_then(Value::as_num)
                .ok_or_else(|| format!("{}: missing numeric 'potency'", cmd.verb))?;
            executor.apply_damage(target, source, tool, potency)
        }
        "SYSTEM.APPLY_HEAL" => {
            let target = ref_str(cmd, "target", resolved)?;
            let amount = cmd
                .arg("amount")
                .and_then(Value::as_num)
                .ok_or_else(|| format!("{}: missing numeric 'amount'", cmd.verb))?;
            executor.apply_heal(target, amount)
        }
        "SYSTEM.APPLY_TAG" => {
            let target = ref_str(cmd, "target", resolved)?;
            let tag = cmd
                .arg("tag")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{}: missing 'tag'", cmd.verb))?;
            let stacks = cmd.arg("stacks").and_then(Value::as_num).unwrap_or(1.0) as u32;
            executor.apply_tag(target, tag, stacks)
        }
        "SYSTEM.REMOVE_TAG" => {
            let target = ref_str(cmd, "target", resolved)?;
            let tag = cmd
                .arg("tag")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{}: missing 'tag'", cmd.verb))?;
            executor.remove_tag(target, tag)
        }
        "SYSTEM.ADJUST_INVENTORY" => {
            let owner = ref_str(cmd, "owner", resolved)?;
            let item_ref = cmd
                .arg("item")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{}: missing 'item'", cmd.verb))?;
            let delta = cmd.arg("delta").and_then(Value::as_num).unwrap_or(1.0) as i32;
            executor.adjust_inventory(owner, item_ref, delta)
        }
        "SYSTEM.ADJUST_RESOURCE" => {
            let target = ref_str(cmd, "target", resolved)?;
            let resource = cmd
                .arg("resource")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{}: missing 'resource'", cmd.verb))?;
            let delta = cmd
                .arg("delta")
                .and_then(Value::as_num)
                .ok_or_else(|| format!("{}: missing numeric 'delta'", cmd.verb))?;
            executor.adjust_resource(target, resource, delta)
        }
        "SYSTEM.ADJUST_STAT" => {
            let target = ref_str(cmd, "target", resolved)?;
            let stat = cmd
                .arg("stat")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{}: missing 'stat'", cmd.verb))?;
            let delta = cmd
                .arg("delta")
                .and_then(Value::as_num)
                .ok_or_else(|| format!("{}: missing numeric 'delta'", cmd.verb))?;
            executor.adjust_stat(target, stat, delta)
        }
        "SYSTEM.SET_AWARENESS" => {
            let observer = ref_str(cmd, "observer", resolved)?;
            let target = ref_str(cmd, "target", resolved)?;
            let aware = cmd.arg("aware").and_then(Value::as_bool).unwrap_or(true);
            executor.set_awareness(observer, target, aware)
        }
        "SYSTEM.ADVANCE_TIME" => {
            let minutes = cmd
                .arg("minutes")
                .and_then(Value::as_num)
                .ok_or_else(|| format!("{}: missing numeric 'minutes'", cmd.verb))? as u32;
            executor.advance_time(minutes)
        }
        "SYSTEM.SET_OCCUPANCY" => {
            let actor = ref_str(cmd, "actor", resolved)?;
            let location = cmd
                .arg("location")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{}: missing 'location'", cmd.verb))?;
            executor.set_occupancy(actor, location)
        }
        other => Err(format!("E_UNKNOWN_VERB: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::RefKind;

    fn resolved_with(refs: &[&str]) -> HashMap<String, ResolvedRef> {
        refs.iter()
            .map(|r| {
                (
                    r.to_string(),
                    ResolvedRef {
                        id: r.to_string(),
                        kind: RefKind::Actor,
                        path: Some(format!("{r}.jsonc")),
                        representative: false,
                        owner: None,
                    },
                )
            })
            .collect()
    }

    #[derive(Default)]
    struct RecordingExecutor {
        damage_calls: Vec<(String, String, f64)>,
    }

    impl EffectExecutor for RecordingExecutor {
        fn apply_damage(&mut self, target: &str, source: &str, _tool: Option<&str>, potency: f64) -> Result<String, String> {
            self.damage_calls.push((target.to_string(), source.to_string(), potency));
            Ok(format!("damage {target} by {potency}"))
        }
        fn apply_heal(&mut self, target: &str, amount: f64) -> Result<String, String> {
            Ok(format!("heal {target} by {amount}"))
        }
        fn apply_tag(&mut self, target: &str, tag: &str, stacks: u32) -> Result<String, String> {
            Ok(format!("tag {target} {tag}x{stacks}"))
        }
        fn remove_tag(&mut self, target: &str, tag: &str) -> Result<String, String> {
            Ok(format!("untag {target} {tag}"))
        }
        fn adjust_inventory(&mut self, owner: &str, item_ref: &str, delta: i32) -> Result<String, String> {
            Ok(format!("inventory {owner} {item_ref} {delta}"))
        }
        fn adjust_resource(&mut self, target: &str, resource: &str, delta: f64) -> Result<String, String> {
            Ok(format!("resource {target} {resource} {delta}"))
        }
        fn adjust_stat(&mut self, target: &str, stat: &str, delta: f64) -> Result<String, String> {
            Ok(format!("stat {target} {stat} {delta}"))
        }
        fn set_awareness(&mut self, observer: &str, target: &str, aware: bool) -> Result<String, String> {
            Ok(format!("awareness {observer} {target} {aware}"))
        }
        fn advance_time(&mut self, minutes: u32) -> Result<String, String> {
            Ok(format!("advance {minutes}"))
        }
        fn set_occupancy(&mut self, actor: &str, location: &str) -> Result<String, String> {
            Ok(format!("occupancy {actor} {location}"))
        }
    }

    #[test]
    fn parses_simple_command() {
        let cmds = parse_machine_text(
            "SYSTEM.APPLY_DAMAGE(target=npc.bandit, source=actor.p, tool=item.longbow_1, potency=14)",
        )
        .unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].verb, "SYSTEM.APPLY_DAMAGE");
        assert_eq!(cmds[0].arg("potency"), Some(&Value::Num(14.0)));
    }

    #[test]
    fn parses_string_escapes_and_list_and_object() {
        let cmds = parse_machine_text(
            r#"SYSTEM.APPLY_TAG(target=npc.bandit, tag="quoted \"name\"", stacks=2, extra=[1, 2, "x"], meta={a=1, b=true})"#,
        )
        .unwrap();
        let cmd = &cmds[0];
        assert_eq!(cmd.arg("tag"), Some(&Value::Str("quoted \"name\"".to_string())));
        assert_eq!(
            cmd.arg("extra"),
            Some(&Value::List(vec![Value::Num(1.0), Value::Num(2.0), Value::Str("x".to_string())]))
        );
    }

    #[test]
    fn skips_blank_lines_and_parses_multiple_commands() {
        let cmds = parse_machine_text(
            "SYSTEM.APPLY_HEAL(target=actor.p, amount=5)\n\nSYSTEM.ADVANCE_TIME(minutes=10)\n",
        )
        .unwrap();
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn malformed_line_is_a_parse_error() {
        let err = parse_machine_text("SYSTEM.APPLY_HEAL(target=actor.p amount=5)").unwrap_err();
        assert!(matches!(err, CoreError::ParseError { .. }));
    }

    #[test]
    fn format_round_trips_through_parse() {
        let original = "SYSTEM.APPLY_HEAL(amount=5, target=actor.p)";
        let cmds = parse_machine_text(original).unwrap();
        let formatted = format(&cmds);
        let reparsed = parse_machine_text(&formatted).unwrap();
        assert_eq!(cmds, reparsed);
    }

    #[test]
    fn tool_required_verb_without_tool_warns_without_executing() {
        let resolved = resolved_with(&["npc.bandit", "actor.p"]);
        let cmds = parse_machine_text(
            "SYSTEM.APPLY_DAMAGE(target=npc.bandit, source=actor.p, potency=10)",
        )
        .unwrap();
        let mut exec = RecordingExecutor::default();
        let result = apply_effects(&cmds, &resolved, &mut exec);
        assert_eq!(result.effects_applied, 0);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("E_MISSING_TOOL"));
        assert!(exec.damage_calls.is_empty());
    }

    #[test]
    fn applies_damage_with_tool_present() {
        let resolved = resolved_with(&["npc.bandit", "actor.p"]);
        let cmds = parse_machine_text(
            "SYSTEM.APPLY_DAMAGE(target=npc.bandit, source=actor.p, tool=item.longbow_1, potency=10)",
        )
        .unwrap();
        let mut exec = RecordingExecutor::default();
        let result = apply_effects(&cmds, &resolved, &mut exec);
        assert_eq!(result.effects_applied, 1);
        assert_eq!(exec.damage_calls.len(), 1);
    }

    #[test]
    fn unresolved_ref_produces_warning_and_continues_batch() {
        let resolved = resolved_with(&["actor.p"]); // npc.bandit missing
        let cmds = parse_machine_text(
            "SYSTEM.APPLY_DAMAGE(target=npc.bandit, source=actor.p, tool=item.longbow_1, potency=10)\nSYSTEM.ADVANCE_TIME(minutes=5)",
        )
        .unwrap();
        let mut exec = RecordingExecutor::default();
        let result = apply_effects(&cmds, &resolved, &mut exec);
        assert_eq!(result.effects_applied, 1);
        assert_eq!(result.warnings.len(), 1);
    }
}

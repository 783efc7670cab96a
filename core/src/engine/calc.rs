use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quern_protocol::RunOptions;

use super::Engine;
use super::EngineControl;
use super::EngineError;
use super::OutputSink;

const SLEEP_SLICE: Duration = Duration::from_millis(10);

const RC_FAIL: i64 = 1;
const RC_NOT_FOUND: i64 = 111;
const RC_SYNTAX: i64 = 198;
const RC_UNRECOGNIZED: i64 = 199;

/// Built-in engine: a small line-oriented interpreter with persistent named
/// scalars. It exists so the runtime can be exercised end-to-end without a
/// production engine embedding; the command set is just large enough to
/// drive state, long-running output, and break-in behavior.
///
/// Commands: `scalar <name> = <expr>`, `display <expr>|"<text>"`,
/// `sleep <ms>`, `count <n> [<pause_ms>]`, `fail <message>`. Lines starting
/// with `//` are comments.
pub struct CalcEngine {
    scalars: HashMap<String, f64>,
    control: Arc<CalcControl>,
}

#[derive(Debug, Default)]
struct CalcControl {
    interrupted: AtomicBool,
    busy: AtomicBool,
}

impl EngineControl for CalcControl {
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

struct BusyGuard(Arc<CalcControl>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

struct CwdGuard(Option<PathBuf>);

impl CwdGuard {
    fn enter(cwd: Option<&PathBuf>) -> Result<Self, EngineError> {
        let Some(cwd) = cwd else {
            return Ok(Self(None));
        };
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(cwd)?;
        Ok(Self(Some(previous)))
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.0.take() {
            let _ = std::env::set_current_dir(previous);
        }
    }
}

impl CalcEngine {
    pub fn new() -> Self {
        Self {
            scalars: HashMap::new(),
            control: Arc::new(CalcControl::default()),
        }
    }

    fn check_interrupt(&self) -> Result<(), EngineError> {
        if self.control.interrupted.load(Ordering::SeqCst) {
            Err(EngineError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn interruptible_sleep(&self, total: Duration) -> Result<(), EngineError> {
        let mut remaining = total;
        while !remaining.is_zero() {
            self.check_interrupt()?;
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
        self.check_interrupt()
    }

    fn run_statement(&mut self, line: &str, sink: &mut dyn OutputSink) -> Result<(), EngineError> {
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };

        match head {
            "scalar" => self.run_scalar(rest),
            "display" => self.run_display(rest, sink),
            "sleep" => {
                let ms: u64 = rest
                    .parse()
                    .map_err(|_| EngineError::command(format!("sleep: invalid duration {rest:?}"), RC_SYNTAX))?;
                self.interruptible_sleep(Duration::from_millis(ms))
            }
            "count" => self.run_count(rest, sink),
            "fail" => {
                let message = if rest.is_empty() { "fail" } else { rest };
                Err(EngineError::command(message, RC_FAIL))
            }
            other => Err(EngineError::command(
                format!("unrecognized command: {other}"),
                RC_UNRECOGNIZED,
            )),
        }
    }

    fn run_scalar(&mut self, rest: &str) -> Result<(), EngineError> {
        let (name, expr) = rest
            .split_once('=')
            .ok_or_else(|| EngineError::command("scalar: expected <name> = <expr>", RC_SYNTAX))?;
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(EngineError::command(
                format!("scalar: invalid name {name:?}"),
                RC_SYNTAX,
            ));
        }
        let value = self.eval(expr.trim())?;
        self.scalars.insert(name.to_string(), value);
        Ok(())
    }

    fn run_display(&mut self, rest: &str, sink: &mut dyn OutputSink) -> Result<(), EngineError> {
        if let Some(stripped) = rest.strip_prefix('"') {
            let text = stripped
                .strip_suffix('"')
                .ok_or_else(|| EngineError::command("display: unterminated string", RC_SYNTAX))?;
            sink.write(text);
            sink.write("\n");
            return Ok(());
        }
        let value = self.eval(rest)?;
        sink.write(&format_number(value));
        sink.write("\n");
        Ok(())
    }

    fn run_count(&mut self, rest: &str, sink: &mut dyn OutputSink) -> Result<(), EngineError> {
        let mut parts = rest.split_whitespace();
        let n: u64 = parts
            .next()
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| EngineError::command("count: expected <n> [<pause_ms>]", RC_SYNTAX))?;
        let pause_ms: u64 = match parts.next() {
            Some(raw) => raw
                .parse()
                .map_err(|_| EngineError::command(format!("count: invalid pause {raw:?}"), RC_SYNTAX))?,
            None => 0,
        };
        let progress_step = (n / 10).max(1);

        for i in 1..=n {
            self.check_interrupt()?;
            sink.write(&format!("{i}\n"));
            if i % progress_step == 0 || i == n {
                sink.progress(i as f64, Some(n as f64), None);
            }
            if pause_ms > 0 {
                self.interruptible_sleep(Duration::from_millis(pause_ms))?;
            }
        }
        Ok(())
    }

    fn eval(&self, expr: &str) -> Result<f64, EngineError> {
        let tokens = lex(expr)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            scalars: &self.scalars,
        };
        let value = parser.expr()?;
        if parser.pos != tokens.len() {
            return Err(EngineError::command(
                format!("invalid expression: {expr}"),
                RC_SYNTAX,
            ));
        }
        Ok(value)
    }
}

impl Default for CalcEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for CalcEngine {
    fn execute(
        &mut self,
        code: &str,
        options: &RunOptions,
        sink: &mut dyn OutputSink,
    ) -> Result<i64, EngineError> {
        // A break that arrived while idle must not poison this command.
        self.control.interrupted.store(false, Ordering::SeqCst);
        self.control.busy.store(true, Ordering::SeqCst);
        let _busy = BusyGuard(Arc::clone(&self.control));
        let _cwd = CwdGuard::enter(options.cwd.as_ref())?;

        for line in code.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            self.check_interrupt()?;
            if options.echo {
                sink.write(&format!(". {line}\n"));
            }
            self.run_statement(line, sink)?;
        }
        Ok(0)
    }

    fn control(&self) -> Arc<dyn EngineControl> {
        self.control.clone()
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

fn lex(expr: &str) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();
    while let Some(&(ix, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = ix;
                while let Some(&(jx, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = jx + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let raw = &expr[ix..end];
                let value: f64 = raw.parse().map_err(|_| {
                    EngineError::command(format!("invalid number: {raw}"), RC_SYNTAX)
                })?;
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = ix;
                while let Some(&(jx, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        end = jx + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(expr[ix..end].to_string()));
            }
            other => {
                return Err(EngineError::command(
                    format!("unexpected character {other:?} in expression"),
                    RC_SYNTAX,
                ));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    scalars: &'a HashMap<String, f64>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<f64, EngineError> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, EngineError> {
        let mut value = self.factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    value /= self.factor()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn factor(&mut self) -> Result<f64, EngineError> {
        match self.next() {
            Some(Token::Num(value)) => Ok(value),
            Some(Token::Ident(name)) => self
                .scalars
                .get(name.as_str())
                .copied()
                .ok_or_else(|| EngineError::command(format!("{name} not found"), RC_NOT_FOUND)),
            Some(Token::Minus) => Ok(-self.factor()?),
            Some(Token::Open) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    _ => Err(EngineError::command("expected )", RC_SYNTAX)),
                }
            }
            _ => Err(EngineError::command("invalid expression", RC_SYNTAX)),
        }
    }
}

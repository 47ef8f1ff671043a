//! Output-name template evaluation.
//!
//! Product file names are synthesised from small templates such as
//! `$(lib)$(name)$(ext 2)`, where each `$(...)` invokes a macro registered
//! in a [`MacroContext`]. Macro arguments are templates themselves and are
//! expanded inner-first; `$(0)`, `$(1)`, ... refer to the arguments of the
//! enclosing invocation.

use indexmap::IndexMap;
use thiserror::Error;

/// Errors raised while parsing or evaluating a template.
#[derive(Debug, Error)]
pub enum MacroError {
    /// The template text is syntactically malformed.
    #[error("malformed template at offset {offset}: {reason}")]
    Parse {
        /// Byte offset of the problem.
        offset: usize,
        /// Human readable cause.
        reason: &'static str,
    },
    /// Evaluation referenced a macro the context does not define.
    #[error("unknown macro '$({0})'")]
    UnknownMacro(String),
}

/// A macro definition: either a template body or a native function.
pub enum MacroDef {
    /// A template body, evaluated with the invocation's arguments.
    Body(Template),
    /// A native function receiving the already-expanded arguments.
    Func(Box<dyn Fn(&[String]) -> String + Send + Sync>),
}

impl std::fmt::Debug for MacroDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Body(t) => f.debug_tuple("Body").field(t).finish(),
            Self::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// Maps macro names to their definitions.
#[derive(Debug, Default)]
pub struct MacroContext {
    defs: IndexMap<String, MacroDef>,
}

impl MacroContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define `name` as a template body.
    ///
    /// # Errors
    ///
    /// Returns a parse error when `body` is malformed.
    pub fn define(&mut self, name: &str, body: &str) -> Result<(), MacroError> {
        let template = Template::parse(body)?;
        self.defs.insert(name.to_owned(), MacroDef::Body(template));
        Ok(())
    }

    /// Define `name` as a native function.
    pub fn define_fn<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&[String]) -> String + Send + Sync + 'static,
    {
        self.defs.insert(name.to_owned(), MacroDef::Func(Box::new(func)));
    }

    /// Whether `name` is defined.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<&MacroDef> {
        self.defs.get(name)
    }
}

#[derive(Debug, Clone)]
enum Part {
    Text(String),
    Positional(usize),
    Call { name: String, args: Vec<Template> },
}

/// A parsed template, ready for repeated evaluation.
#[derive(Debug, Clone, Default)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    /// Parse `text` into a template.
    ///
    /// # Errors
    ///
    /// Returns [`MacroError::Parse`] for unterminated or empty macro
    /// invocations.
    pub fn parse(text: &str) -> Result<Self, MacroError> {
        let chars: Vec<char> = text.chars().collect();
        let (parts, end) = parse_parts(&chars, 0, false)?;
        debug_assert_eq!(end, chars.len());
        Ok(Self { parts })
    }

    /// Evaluate against `ctx` with the positional arguments `args`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown macros or out-of-range positional
    /// references.
    pub fn eval(&self, ctx: &MacroContext, args: &[String]) -> Result<String, MacroError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                // Absent positional arguments expand to nothing, so a body
                // like `lib$(0)` works both with and without arguments.
                Part::Positional(index) => {
                    if let Some(value) = args.get(*index) {
                        out.push_str(value);
                    }
                }
                Part::Call { name, args: call_args } => {
                    // Arguments expand inner-first, in the enclosing scope.
                    let expanded: Vec<String> = call_args
                        .iter()
                        .map(|a| a.eval(ctx, args))
                        .collect::<Result<_, _>>()?;
                    match ctx.get(name) {
                        Some(MacroDef::Body(body)) => out.push_str(&body.eval(ctx, &expanded)?),
                        Some(MacroDef::Func(func)) => out.push_str(&func(&expanded)),
                        None => return Err(MacroError::UnknownMacro(name.clone())),
                    }
                }
            }
        }
        Ok(out)
    }

    /// Whether the template contains no macro invocations.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Text(_)))
    }
}

/// Parse until end of input, or until an argument delimiter (`,` or `)`)
/// when `in_args` is set. Returns the parts and the index of the stopping
/// character.
fn parse_parts(
    chars: &[char],
    mut i: usize,
    in_args: bool,
) -> Result<(Vec<Part>, usize), MacroError> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut depth = 0usize;
    while i < chars.len() {
        let ch = chars.get(i).copied().unwrap_or('\0');
        if in_args && depth == 0 && (ch == ',' || ch == ')') {
            break;
        }
        if ch == '$' && chars.get(i + 1) == Some(&'(') {
            if !text.is_empty() {
                parts.push(Part::Text(std::mem::take(&mut text)));
            }
            let (call, next) = parse_call(chars, i)?;
            parts.push(call);
            i = next;
            continue;
        }
        if in_args {
            if ch == '(' {
                depth += 1;
            } else if ch == ')' {
                depth = depth.saturating_sub(1);
            }
        }
        text.push(ch);
        i += 1;
    }
    if !text.is_empty() {
        parts.push(Part::Text(text));
    }
    Ok((parts, i))
}

/// Parse a `$(name arg, ...)` invocation starting at the `$`.
fn parse_call(chars: &[char], start: usize) -> Result<(Part, usize), MacroError> {
    let mut i = start + 2;
    let mut name = String::new();
    while let Some(&ch) = chars.get(i) {
        if ch == ')' || ch.is_whitespace() {
            break;
        }
        name.push(ch);
        i += 1;
    }
    if name.is_empty() {
        return Err(MacroError::Parse {
            offset: start,
            reason: "empty macro name",
        });
    }
    let mut args = Vec::new();
    // Skip whitespace between the name and the first argument.
    while matches!(chars.get(i), Some(c) if c.is_whitespace()) {
        i += 1;
    }
    while chars.get(i) != Some(&')') {
        if i >= chars.len() {
            return Err(MacroError::Parse {
                offset: start,
                reason: "unterminated macro invocation",
            });
        }
        let (parts, stop) = parse_parts(chars, i, true)?;
        args.push(Template { parts: trim_parts(parts) });
        i = stop;
        if chars.get(i) == Some(&',') {
            i += 1;
            while matches!(chars.get(i), Some(c) if c.is_whitespace()) {
                i += 1;
            }
        }
    }
    i += 1; // consume ')'
    if args.is_empty()
        && let Ok(index) = name.parse::<usize>()
    {
        return Ok((Part::Positional(index), i));
    }
    Ok((Part::Call { name, args }, i))
}

/// Strip trailing whitespace from the final text part of an argument.
fn trim_parts(mut parts: Vec<Part>) -> Vec<Part> {
    let len = parts.len();
    if let Some(Part::Text(text)) = parts.last_mut() {
        let trimmed = text.trim_end().to_owned();
        if trimmed.is_empty() && len == 1 {
            return Vec::new();
        }
        *text = trimmed;
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ctx() -> MacroContext {
        let mut ctx = MacroContext::new();
        ctx.define("name", "foo").expect("literal body");
        ctx.define("lib", "lib").expect("literal body");
        ctx.define_fn("ext", |args| match args.first().map(String::as_str) {
            Some(version) if !version.is_empty() => format!(".so.{version}"),
            _ => ".so".to_owned(),
        });
        ctx
    }

    #[test]
    fn plain_text_is_returned_unchanged() {
        let template = Template::parse("no macros here").expect("parse");
        assert!(template.is_literal());
        let result = template.eval(&MacroContext::new(), &[]).expect("eval");
        assert_eq!(result, "no macros here");
    }

    #[rstest]
    #[case("$(lib)$(name)$(ext)", "libfoo.so")]
    #[case("$(lib)$(name)$(ext 2)", "libfoo.so.2")]
    #[case("$(name)-bin", "foo-bin")]
    fn outname_patterns_expand(#[case] template: &str, #[case] expected: &str) {
        let template = Template::parse(template).expect("parse");
        assert_eq!(template.eval(&ctx(), &[]).expect("eval"), expected);
    }

    #[test]
    fn nested_macros_expand_inner_first() {
        let mut context = ctx();
        context.define_fn("upper", |args| {
            args.first().map(|s| s.to_uppercase()).unwrap_or_default()
        });
        let template = Template::parse("$(upper $(name))").expect("parse");
        assert_eq!(template.eval(&context, &[]).expect("eval"), "FOO");
    }

    #[test]
    fn positional_args_reach_macro_bodies() {
        let mut context = MacroContext::new();
        context.define("greet", "hello $(0)!").expect("body");
        let template = Template::parse("$(greet world)").expect("parse");
        assert_eq!(template.eval(&context, &[]).expect("eval"), "hello world!");
    }

    #[test]
    fn multiple_arguments_split_on_commas() {
        let mut context = MacroContext::new();
        context.define_fn("join", |args| args.join("+"));
        let template = Template::parse("$(join a, b, c)").expect("parse");
        assert_eq!(template.eval(&context, &[]).expect("eval"), "a+b+c");
    }

    #[test]
    fn unknown_macro_is_an_error() {
        let template = Template::parse("$(nope)").expect("parse");
        let err = template.eval(&MacroContext::new(), &[]).expect_err("undefined");
        assert!(matches!(err, MacroError::UnknownMacro(name) if name == "nope"));
    }

    #[test]
    fn unterminated_invocation_is_a_parse_error() {
        let err = Template::parse("$(open").expect_err("unterminated");
        assert!(matches!(err, MacroError::Parse { .. }));
    }
}

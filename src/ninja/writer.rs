//! Minimal Ninja syntax writer with line wrapping.

/// Serialises Ninja manifest constructs into a string buffer.
///
/// Long lines are wrapped with `$` continuations at the configured width.
#[derive(Debug)]
pub struct NinjaWriter {
    out: String,
    width: usize,
}

impl NinjaWriter {
    /// A writer wrapping at `width` columns.
    #[must_use]
    pub fn new(width: usize) -> Self {
        Self {
            out: String::new(),
            width,
        }
    }

    /// Write a `# comment` line.
    pub fn comment(&mut self, text: &str) {
        self.out.push_str("# ");
        self.out.push_str(text);
        self.out.push('\n');
    }

    /// Write an empty line.
    pub fn newline(&mut self) {
        self.out.push('\n');
    }

    /// Write a `key = value` binding.
    pub fn variable(&mut self, key: &str, value: &str) {
        self.line(&format!("{key} = {value}"), 0);
    }

    /// Write a rule with its command and optional description and pool.
    pub fn rule(&mut self, name: &str, command: &str, description: Option<&str>, pool: Option<&str>) {
        self.line(&format!("rule {name}"), 0);
        self.line(&format!("command = {command}"), 1);
        if let Some(description) = description {
            self.line(&format!("description = {description}"), 1);
        }
        if let Some(pool) = pool {
            self.line(&format!("pool = {pool}"), 1);
        }
    }

    /// Write a build statement with optional order-only deps and variable
    /// bindings.
    pub fn build(
        &mut self,
        outputs: &[String],
        rule: &str,
        inputs: &[String],
        order_only: &[String],
        variables: &[(String, String)],
    ) {
        let mut line = format!("build {}: {rule}", escape_paths(outputs).join(" "));
        if !inputs.is_empty() {
            line.push(' ');
            line.push_str(&escape_paths(inputs).join(" "));
        }
        if !order_only.is_empty() {
            line.push_str(" || ");
            line.push_str(&escape_paths(order_only).join(" "));
        }
        self.line(&line, 0);
        for (key, value) in variables {
            self.line(&format!("{key} = {value}"), 1);
        }
    }

    /// Write a default statement.
    pub fn default(&mut self, targets: &[String]) {
        self.line(&format!("default {}", escape_paths(targets).join(" ")), 0);
    }

    /// Consume the writer, returning the manifest text.
    #[must_use]
    pub fn into_string(self) -> String {
        self.out
    }

    /// Write one logical line, wrapping on spaces with `$` continuations.
    fn line(&mut self, text: &str, indent: usize) {
        let prefix = "    ".repeat(indent);
        let mut remaining = format!("{prefix}{text}");
        // Continuation lines indent two extra levels, as ninja_syntax does.
        let cont_prefix = "    ".repeat(indent + 2);
        while remaining.len() > self.width {
            // Find a space to break on, scanning backwards from the width;
            // never break inside the leading indentation.
            let lead = remaining.len() - remaining.trim_start().len();
            let window = remaining.get(..self.width).unwrap_or(&remaining);
            let Some(space) = window.rfind(' ').filter(|&i| i > lead) else {
                break;
            };
            let (head, tail) = remaining.split_at(space);
            self.out.push_str(head);
            self.out.push_str(" $\n");
            remaining = format!("{cont_prefix}{}", tail.trim_start());
        }
        self.out.push_str(&remaining);
        self.out.push('\n');
    }
}

/// Escape spaces and `$` in path-position tokens.
fn escape_paths(paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.replace('$', "$$").replace(' ', "$ ").replace(':', "$:"))
        .collect()
}

use crate::errors::TemplateError;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::LazyLock;

/// Variables available to `${name}` placeholders during a run.
pub type Vars = BTreeMap<String, String>;

/// Placeholders whose values must never be echoed to the terminal or report.
pub const SECRET_PREFIX: &str = "secret.";

/// Placeholders filled from harvested infrastructure outputs.
pub const OUTPUT_PREFIX: &str = "output.";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("placeholder pattern is a valid static regex")
});

/// Specification for one external command.
///
/// Arguments are discrete elements handed to the OS as-is; nothing here is ever
/// passed through a shell, so values containing spaces or quotes need no escaping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Indices into `args` that carry secret material.
    pub sensitive: BTreeSet<usize>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Human-readable command line with sensitive arguments masked.
    pub fn display(&self) -> String {
        let mut parts = vec![quote_for_display(&self.program)];
        for (i, arg) in self.args.iter().enumerate() {
            if self.sensitive.contains(&i) {
                parts.push("****".to_string());
            } else {
                parts.push(quote_for_display(arg));
            }
        }
        parts.join(" ")
    }
}

fn quote_for_display(s: &str) -> String {
    if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        format!("'{}'", s.replace('\'', "'\\''"))
    } else {
        s.to_string()
    }
}

/// A command whose program, arguments, and environment values may contain
/// `${name}` placeholders, resolved per argument at execution time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandTemplate {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// All placeholder names referenced anywhere in the template.
    pub fn placeholders(&self) -> BTreeSet<String> {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .chain(self.env.iter().map(|(_, v)| v))
            .flat_map(|s| placeholder_names(s))
            .collect()
    }

    pub fn references_outputs(&self) -> bool {
        self.placeholders()
            .iter()
            .any(|name| {
                name.strip_prefix(SECRET_PREFIX)
                    .unwrap_or(name)
                    .starts_with(OUTPUT_PREFIX)
            })
    }

    /// Resolve every placeholder and produce a runnable spec.
    pub fn render(&self, vars: &Vars) -> Result<CommandSpec, TemplateError> {
        let (program, _) = render_str(&self.program, vars)?;
        let mut spec = CommandSpec::new(program);
        for (i, arg) in self.args.iter().enumerate() {
            let (value, sensitive) = render_str(arg, vars)?;
            if sensitive {
                spec.sensitive.insert(i);
            }
            spec.args.push(value);
        }
        for (key, value) in &self.env {
            let (value, _) = render_str(value, vars)?;
            spec.env.insert(key.clone(), value);
        }
        spec.cwd = self.cwd.clone();
        Ok(spec)
    }
}

fn placeholder_names(s: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(s)
        .map(|c| c[1].to_string())
        .collect()
}

/// Substitute placeholders in a single string.
///
/// Returns the rendered value and whether any substituted variable was secret.
pub fn render_str(template: &str, vars: &Vars) -> Result<(String, bool), TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    let mut sensitive = false;
    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).expect("capture group 0 always exists");
        let name = &caps[1];
        let value = vars.get(name).ok_or_else(|| TemplateError::Unresolved {
            name: name.to_string(),
            template: template.to_string(),
        })?;
        if name.starts_with(SECRET_PREFIX) {
            sensitive = true;
        }
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok((out, sensitive))
}

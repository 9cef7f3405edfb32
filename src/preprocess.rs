// src/preprocess.rs
//! Minimal shader preprocessor.
//!
//! Understands `#include "name"` (each name expanded at most once per source)
//! and `#define NAME VALUE` (whole-identifier substitution on every later
//! line). Prelude lines are processed before the source itself.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

const MAX_INCLUDE_DEPTH: usize = 16;

/// Where `#include` directives are looked up.
pub trait IncludeSource {
    fn include(&self, name: &str) -> Result<String>;
}

impl<F> IncludeSource for F
where
    F: Fn(&str) -> Result<String>,
{
    fn include(&self, name: &str) -> Result<String> {
        self(name)
    }
}

/// Expand `source` with `prelude` defines prepended.
pub fn preprocess(source: &str, prelude: &[String], includes: &dyn IncludeSource) -> Result<String> {
    let mut state = State {
        includes,
        defines: HashMap::new(),
        included: HashSet::new(),
        stack: Vec::new(),
        out: String::with_capacity(source.len() + 256),
    };

    for line in prelude {
        state.line(line, 0)?;
    }
    state.text(source, 0)?;
    Ok(state.out)
}

struct State<'a> {
    includes: &'a dyn IncludeSource,
    defines: HashMap<String, String>,
    included: HashSet<String>,
    stack: Vec<String>,
    out: String,
}

impl State<'_> {
    fn text(&mut self, text: &str, depth: usize) -> Result<()> {
        for line in text.lines() {
            self.line(line, depth)?;
        }
        Ok(())
    }

    fn line(&mut self, line: &str, depth: usize) -> Result<()> {
        let trimmed = line.trim_start();

        if let Some(rest) = trimmed.strip_prefix("#include") {
            let name = parse_include(rest).ok_or_else(|| Error::Preprocess(format!("malformed include: {line}")))?;
            return self.include(name, depth);
        }

        if let Some(rest) = trimmed.strip_prefix("#define") {
            let mut parts = rest.trim().splitn(2, char::is_whitespace);
            let name = parts
                .next()
                .filter(|n| is_identifier(n))
                .ok_or_else(|| Error::Preprocess(format!("malformed define: {line}")))?;
            let value = parts.next().map(str::trim).unwrap_or("");
            let value = substitute(value, &self.defines);
            self.defines.insert(name.to_string(), value);
            return Ok(());
        }

        self.out.push_str(&substitute(line, &self.defines));
        self.out.push('\n');
        Ok(())
    }

    fn include(&mut self, name: &str, depth: usize) -> Result<()> {
        if self.stack.iter().any(|n| n == name) {
            return Err(Error::Preprocess(format!(
                "recursive include of `{name}` (via {})",
                self.stack.join(" -> ")
            )));
        }
        if depth >= MAX_INCLUDE_DEPTH {
            return Err(Error::Preprocess(format!("includes nested deeper than {MAX_INCLUDE_DEPTH}")));
        }
        if !self.included.insert(name.to_string()) {
            return Ok(());
        }

        let content = self.includes.include(name)?;
        self.stack.push(name.to_string());
        let result = self.text(&content, depth + 1);
        self.stack.pop();
        result
    }
}

fn parse_include(rest: &str) -> Option<&str> {
    let rest = rest.trim();
    let inner = rest.strip_prefix('"')?.strip_suffix('"')?;
    (!inner.is_empty()).then_some(inner)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replace whole identifiers outside `//` comments.
fn substitute(line: &str, defines: &HashMap<String, String>) -> String {
    if defines.is_empty() {
        return line.to_string();
    }

    let (code, comment) = match line.find("//") {
        Some(at) => line.split_at(at),
        None => (line, ""),
    };

    let mut out = String::with_capacity(line.len());
    let mut ident = String::new();
    for c in code.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            ident.push(c);
            continue;
        }
        flush_ident(&mut ident, &mut out, defines);
        out.push(c);
    }
    flush_ident(&mut ident, &mut out, defines);
    out.push_str(comment);
    out
}

fn flush_ident(ident: &mut String, out: &mut String, defines: &HashMap<String, String>) {
    if ident.is_empty() {
        return;
    }
    match defines.get(ident.as_str()) {
        Some(value) if is_identifier(ident) => out.push_str(value),
        _ => out.push_str(ident),
    }
    ident.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_includes(name: &str) -> Result<String> {
        Err(Error::Preprocess(format!("unexpected include {name}")))
    }

    #[test]
    fn prelude_defines_replace_whole_identifiers() {
        let prelude = vec!["#define UBO_VIEW_BINDING 3".to_string()];
        let src = "@group(0) @binding(UBO_VIEW_BINDING) var<uniform> view: View;\nlet x = UBO_VIEW_BINDING_EXTRA;";

        let out = preprocess(src, &prelude, &no_includes).unwrap();
        assert!(out.contains("@binding(3) var<uniform> view"));
        assert!(out.contains("UBO_VIEW_BINDING_EXTRA"));
        assert!(!out.contains("#define"));
    }

    #[test]
    fn comments_are_left_alone() {
        let prelude = vec!["#define N 4".to_string()];
        let out = preprocess("let a = N; // N lights", &prelude, &no_includes).unwrap();
        assert_eq!(out.trim_end(), "let a = 4; // N lights");
    }

    #[test]
    fn includes_expand_once_and_see_defines() {
        let includes = |name: &str| -> Result<String> {
            match name {
                "lights.wgsl" => Ok("array<Light, LIGHT_CAPACITY>".to_string()),
                other => Err(Error::Preprocess(other.to_string())),
            }
        };
        let prelude = vec!["#define LIGHT_CAPACITY 64".to_string()];
        let src = "#include \"lights.wgsl\"\n#include \"lights.wgsl\"\nfn main() {}";

        let out = preprocess(src, &prelude, &includes).unwrap();
        assert_eq!(out.matches("array<Light, 64>").count(), 1);
        assert!(out.contains("fn main"));
    }

    #[test]
    fn recursive_include_is_reported() {
        let includes = |name: &str| -> Result<String> {
            Ok(match name {
                "a" => "#include \"b\"".to_string(),
                _ => "#include \"a\"".to_string(),
            })
        };
        let err = preprocess("#include \"a\"", &[], &includes).unwrap_err();
        assert!(err.to_string().contains("recursive include"));
    }

    #[test]
    fn malformed_directives_fail() {
        assert!(preprocess("#include lights.wgsl", &[], &no_includes).is_err());
        assert!(preprocess("#define 3D 1", &[], &no_includes).is_err());
    }
}

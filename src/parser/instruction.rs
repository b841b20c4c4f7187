//! The `Instruction` type and its flag/operand parsing.

use std::collections::BTreeMap;
use std::fmt;

/// One parsed Dockerfile line.
///
/// Carries the verb, the raw flag map (`--from=`, `--chown=`, ...), the
/// remaining operand text, and the original verbatim source line (used for
/// diagnostics and forwarding unknown flags to the builder untouched).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub verb: Verb,
    pub flags: BTreeMap<String, String>,
    pub operands: String,
    pub text: String,
    pub line: usize,
    /// The build context in effect when this instruction was parsed — the
    /// stage's default context, or whatever `PUSHCONTEXT` last rebound it
    /// to. Only meaningful for COPY/ADD (`Verb::consumes_context`).
    pub context: String,
}

/// The recognised instruction verbs, plus the two tplbuild-specific
/// extensions (`END`, `PUSHCONTEXT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verb {
    From,
    Copy,
    Add,
    Run,
    Cmd,
    Entrypoint,
    Env,
    Arg,
    Label,
    Workdir,
    User,
    Expose,
    Volume,
    Shell,
    Onbuild,
    Healthcheck,
    Stopsignal,
    Maintainer,
    End,
    Pushcontext,
}

impl Verb {
    /// Parses a verb from its case-insensitive textual form.
    pub fn parse(s: &str) -> Option<Verb> {
        Some(match s.to_ascii_uppercase().as_str() {
            "FROM" => Verb::From,
            "COPY" => Verb::Copy,
            "ADD" => Verb::Add,
            "RUN" => Verb::Run,
            "CMD" => Verb::Cmd,
            "ENTRYPOINT" => Verb::Entrypoint,
            "ENV" => Verb::Env,
            "ARG" => Verb::Arg,
            "LABEL" => Verb::Label,
            "WORKDIR" => Verb::Workdir,
            "USER" => Verb::User,
            "EXPOSE" => Verb::Expose,
            "VOLUME" => Verb::Volume,
            "SHELL" => Verb::Shell,
            "ONBUILD" => Verb::Onbuild,
            "HEALTHCHECK" => Verb::Healthcheck,
            "STOPSIGNAL" => Verb::Stopsignal,
            "MAINTAINER" => Verb::Maintainer,
            "END" => Verb::End,
            "PUSHCONTEXT" => Verb::Pushcontext,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::From => "FROM",
            Verb::Copy => "COPY",
            Verb::Add => "ADD",
            Verb::Run => "RUN",
            Verb::Cmd => "CMD",
            Verb::Entrypoint => "ENTRYPOINT",
            Verb::Env => "ENV",
            Verb::Arg => "ARG",
            Verb::Label => "LABEL",
            Verb::Workdir => "WORKDIR",
            Verb::User => "USER",
            Verb::Expose => "EXPOSE",
            Verb::Volume => "VOLUME",
            Verb::Shell => "SHELL",
            Verb::Onbuild => "ONBUILD",
            Verb::Healthcheck => "HEALTHCHECK",
            Verb::Stopsignal => "STOPSIGNAL",
            Verb::Maintainer => "MAINTAINER",
            Verb::End => "END",
            Verb::Pushcontext => "PUSHCONTEXT",
        }
    }

    /// Whether this instruction consumes files from a build context
    /// (affects whether a `BuildStep` node is wired to a `ContextImage`).
    pub fn consumes_context(&self) -> bool {
        matches!(self, Verb::Copy | Verb::Add)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Instruction {
    pub fn flag(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(|s| s.as_str())
    }

    /// Canonicalised text used as hash input: verb
    /// uppercased, flags sorted by key (the flag map is already a
    /// `BTreeMap` so iteration is sorted), operands joined with single
    /// spaces, surrounding whitespace stripped.
    pub fn canonical(&self) -> String {
        let mut parts = vec![self.verb.as_str().to_string()];
        for (k, v) in &self.flags {
            if v.is_empty() {
                parts.push(format!("--{}", k));
            } else {
                parts.push(format!("--{}={}", k, v));
            }
        }
        let operands = self.operands.split_whitespace().collect::<Vec<_>>().join(" ");
        if !operands.is_empty() {
            parts.push(operands);
        }
        parts.join(" ").trim().to_string()
    }

    /// Parse the `--from=` flag value of a COPY/ADD instruction, if present.
    pub fn from_flag(&self) -> Option<&str> {
        self.flag("from")
    }
}

/// Parses the operand portion of an instruction line (after the verb) into
/// a flag map and the remaining operand text. Flags are `--key=value` or
/// `--key` tokens that precede the first non-flag operand.
pub fn parse_flags_and_operands(rest: &str) -> Result<(BTreeMap<String, String>, String), String> {
    let mut flags = BTreeMap::new();

    // Walk whitespace-delimited tokens from the front, consuming `--key[=value]`
    // flags; the first token that isn't a flag marks where the operand text
    // begins (sliced from the original string so internal whitespace in
    // operands, e.g. quoted RUN commands, is preserved).
    let mut remainder_start = rest.len();
    let mut cursor = 0usize;
    loop {
        let tail = &rest[cursor..];
        let trimmed = tail.trim_start();
        let skipped = tail.len() - trimmed.len();
        if trimmed.is_empty() {
            remainder_start = rest.len();
            break;
        }
        let tok_start = cursor + skipped;
        let tok_end = trimmed
            .find(char::is_whitespace)
            .map(|i| tok_start + i)
            .unwrap_or(rest.len());
        let tok = &rest[tok_start..tok_end];

        if let Some(body) = tok.strip_prefix("--") {
            if body.is_empty() {
                return Err("malformed flag '--'".to_string());
            }
            match body.split_once('=') {
                Some((k, v)) => {
                    if k.is_empty() {
                        return Err(format!("malformed flag '{}'", tok));
                    }
                    flags.insert(k.to_string(), v.to_string());
                }
                None => {
                    flags.insert(body.to_string(), String::new());
                }
            }
            cursor = tok_end;
        } else {
            remainder_start = tok_start;
            break;
        }
    }

    let operands = rest[remainder_start..].trim().to_string();
    Ok((flags, operands))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_verbs_case_insensitively() {
        assert_eq!(Verb::parse("from"), Some(Verb::From));
        assert_eq!(Verb::parse("FROM"), Some(Verb::From));
        assert_eq!(Verb::parse("Copy"), Some(Verb::Copy));
        assert_eq!(Verb::parse("bogus"), None);
    }

    #[test]
    fn flag_parsing_splits_key_value() {
        let (flags, operands) = parse_flags_and_operands("--from=builder --chown=1000:1000 src dst").unwrap();
        assert_eq!(flags.get("from").map(String::as_str), Some("builder"));
        assert_eq!(flags.get("chown").map(String::as_str), Some("1000:1000"));
        assert_eq!(operands, "src dst");
    }

    #[test]
    fn flag_without_value_is_empty_string() {
        let (flags, operands) = parse_flags_and_operands("--no-cache echo hi").unwrap();
        assert_eq!(flags.get("no-cache").map(String::as_str), Some(""));
        assert_eq!(operands, "echo hi");
    }

    #[test]
    fn no_flags_keeps_full_operand_text() {
        let (flags, operands) = parse_flags_and_operands("ubuntu:22.04 AS builder").unwrap();
        assert!(flags.is_empty());
        assert_eq!(operands, "ubuntu:22.04 AS builder");
    }

    #[test]
    fn canonical_sorts_flags_and_trims_operands() {
        let mut flags = BTreeMap::new();
        flags.insert("from".to_string(), "builder".to_string());
        flags.insert("chown".to_string(), "1000".to_string());
        let instr = Instruction {
            verb: Verb::Copy,
            flags,
            operands: "  src   dst  ".to_string(),
            text: "COPY --chown=1000 --from=builder   src   dst".to_string(),
            line: 1,
            context: "default".to_string(),
        };
        assert_eq!(instr.canonical(), "COPY --chown=1000 --from=builder src dst");
    }
}

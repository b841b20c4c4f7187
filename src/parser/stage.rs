//! `Stage` grouping and the base/anon classification rules.

use super::instruction::Instruction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Explicit or default (stage-index-as-string) stage name.
    pub name: String,
    /// The raw `FROM` operand (before `AS name` is stripped).
    pub base: String,
    /// The instructions following `FROM`, in source order (excludes the
    /// `FROM` line itself, which is captured in `base`/`name`).
    pub instructions: Vec<Instruction>,
    /// The context this stage's COPY/ADD instructions draw from; starts as
    /// `"default"` and can be rebound by `PUSHCONTEXT`.
    pub context_name: String,
    /// True when `name` matches a configured base-stage prefix (or the
    /// explicit `stages.<name>.base: true` override is set later by the
    /// graph builder).
    pub is_base: bool,
    /// True when `name` matches a configured anon-stage prefix.
    pub is_anon: bool,
}

/// Classifies a stage name against the configured base/anon prefixes.
/// Defaults: `base-`/`base_` and `anon-`/`anon_`.
pub fn classify(name: &str, base_prefixes: &[String], anon_prefixes: &[String]) -> (bool, bool) {
    let is_base = base_prefixes.iter().any(|p| name.starts_with(p.as_str()));
    let is_anon = anon_prefixes.iter().any(|p| name.starts_with(p.as_str()));
    (is_base, is_anon)
}

pub fn default_base_prefixes() -> Vec<String> {
    vec!["base-".to_string(), "base_".to_string()]
}

pub fn default_anon_prefixes() -> Vec<String> {
    vec!["anon-".to_string(), "anon_".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_base_and_anon_prefixes() {
        let base = default_base_prefixes();
        let anon = default_anon_prefixes();
        assert_eq!(classify("base-my-app", &base, &anon), (true, false));
        assert_eq!(classify("anon-fib-0", &base, &anon), (false, true));
        assert_eq!(classify("runtime", &base, &anon), (false, false));
        assert_eq!(classify("base_other", &base, &anon), (true, false));
    }
}

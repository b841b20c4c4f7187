//! Dockerfile parser.
//!
//! Turns rendered template text into an ordered `Vec<Instruction>` grouped
//! into `Stage`s. Implemented as a small hand-written lexer/parser rather
//! than a third-party Dockerfile grammar, since the `END`/`PUSHCONTEXT`
//! extensions and the flag-map model don't match any off-the-shelf crate's
//! grammar.

pub mod instruction;
pub mod lexer;
pub mod stage;

use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::error::{ParseError, ParseErrorKind};
use instruction::{parse_flags_and_operands, Instruction, Verb};
use lexer::{tokenize, LogicalLine};
use stage::Stage;

/// Parses rendered Dockerfile text into a list of stages, in source order.
///
/// `strict` controls whether an unrecognised verb is a hard error (the
/// default) or is silently skipped — tplbuild always runs in strict mode,
/// but the flag is kept explicit so callers (and tests) can see the policy
/// at the call site.
pub fn parse(rendered: &str, strict: bool) -> Result<Vec<Stage>, ParseError> {
    let (lines, _directives) = tokenize(rendered).map_err(|(line, col)| {
        mk_error(rendered, line, col, ParseErrorKind::UnterminatedContinuation)
    })?;

    let mut stages: Vec<Stage> = Vec::new();
    let mut explicit_names: HashSet<String> = HashSet::new();
    let mut stage_open = false;
    let mut stage_ended = false;

    for LogicalLine { text, line } in lines {
        let (verb_str, rest) = split_verb(&text);
        let verb = match Verb::parse(verb_str) {
            Some(v) => v,
            None => {
                if strict {
                    return Err(mk_error(
                        rendered,
                        line,
                        1,
                        ParseErrorKind::UnknownVerb(verb_str.to_string()),
                    ));
                } else {
                    continue;
                }
            }
        };

        let (flags, operands) = parse_flags_and_operands(rest).map_err(|reason| {
            mk_error(rendered, line, 1, ParseErrorKind::MalformedFlag(reason))
        })?;

        if verb == Verb::From {
            let (base, explicit_name) = split_from_as(&operands);
            let name = explicit_name.unwrap_or_else(|| stages.len().to_string());
            if let Some(existing) = &name_is_explicit(&operands) {
                if !explicit_names.insert(existing.clone()) {
                    return Err(mk_error(
                        rendered,
                        line,
                        1,
                        ParseErrorKind::DuplicateStageName(existing.clone()),
                    ));
                }
            }
            stages.push(Stage {
                name,
                base,
                instructions: Vec::new(),
                context_name: "default".to_string(),
                is_base: false,
                is_anon: false,
            });
            stage_open = true;
            stage_ended = false;
            continue;
        }

        if verb == Verb::End {
            if !stage_open {
                return Err(mk_error(rendered, line, 1, ParseErrorKind::InstructionBeforeFrom));
            }
            stage_open = false;
            stage_ended = true;
            continue;
        }

        if !stage_open {
            if stage_ended {
                return Err(mk_error(rendered, line, 1, ParseErrorKind::InstructionAfterEnd));
            }
            return Err(mk_error(rendered, line, 1, ParseErrorKind::InstructionBeforeFrom));
        }

        let current = stages.last_mut().expect("stage_open implies a stage exists");

        if verb == Verb::Pushcontext {
            current.context_name = operands.trim().to_string();
            continue;
        }

        current.instructions.push(Instruction {
            verb,
            flags,
            operands,
            text,
            line,
            context: current.context_name.clone(),
        });
    }

    Ok(stages)
}

/// Applies the base/anon classification rules, including the authoritative
/// override from `stages.<name>.base` in the project config: an explicit
/// YAML flag wins over prefix matching.
pub fn classify_stages(
    stages: &mut [Stage],
    base_prefixes: &[String],
    anon_prefixes: &[String],
    base_overrides: &BTreeMap<String, bool>,
) {
    for s in stages.iter_mut() {
        let (prefix_base, is_anon) = stage::classify(&s.name, base_prefixes, anon_prefixes);
        let is_base = base_overrides.get(&s.name).copied().unwrap_or(prefix_base);
        s.is_base = is_base;
        s.is_anon = is_anon;
    }
}

fn split_verb(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(idx) => (&text[..idx], text[idx..].trim_start()),
        None => (text, ""),
    }
}

/// Splits a `FROM` instruction's operand text into `(base_ref, explicit_name)`.
/// `base_ref` never includes the trailing `AS name` clause.
fn split_from_as(operands: &str) -> (String, Option<String>) {
    let upper = operands.to_ascii_uppercase();
    match upper.find(" AS ") {
        Some(pos) => {
            let base = &operands[..pos];
            let after_as = &operands[pos + " AS ".len()..];
            (base.trim().to_string(), Some(after_as.trim().to_string()))
        }
        None => (operands.trim().to_string(), None),
    }
}

fn name_is_explicit(operands: &str) -> Option<String> {
    split_from_as(operands).1
}

fn mk_error(src: &str, line: usize, col: usize, kind: ParseErrorKind) -> ParseError {
    let offset = line_col_to_offset(src, line, col);
    ParseError {
        line,
        col,
        kind,
        src: src.to_string(),
        span: (offset, 1).into(),
    }
}

fn line_col_to_offset(src: &str, line: usize, col: usize) -> usize {
    let mut offset = 0usize;
    for (i, l) in src.lines().enumerate() {
        if i + 1 == line {
            return offset + col.saturating_sub(1).min(l.len());
        }
        offset += l.len() + 1;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_multi_stage_dockerfile() {
        let text = "\
FROM golang:1.22 AS builder
RUN go build -o app .
FROM scratch
COPY --from=builder /app/app /app
CMD [\"/app\"]
";
        let stages = parse(text, true).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].name, "builder");
        assert_eq!(stages[0].base, "golang:1.22");
        assert_eq!(stages[0].instructions.len(), 1);
        assert_eq!(stages[1].name, "1");
        assert_eq!(stages[1].instructions.len(), 2);
        assert_eq!(stages[1].instructions[0].from_flag(), Some("builder"));
    }

    #[test]
    fn duplicate_explicit_stage_name_is_an_error() {
        let text = "FROM a AS x\nFROM b AS x\n";
        let err = parse(text, true).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::DuplicateStageName(ref n) if n == "x"));
    }

    #[test]
    fn instruction_before_from_is_an_error() {
        let text = "RUN echo hi\n";
        let err = parse(text, true).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::InstructionBeforeFrom));
    }

    #[test]
    fn end_closes_stage_and_further_instructions_error() {
        let text = "FROM a AS x\nRUN echo hi\nEND\nRUN echo bad\n";
        let err = parse(text, true).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::InstructionAfterEnd));
    }

    #[test]
    fn end_allows_a_subsequent_from_to_start_fresh() {
        let text = "FROM a AS x\nRUN one\nEND\nFROM b AS y\nRUN two\n";
        let stages = parse(text, true).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[1].name, "y");
    }

    #[test]
    fn pushcontext_rebinds_context_for_subsequent_instructions_only() {
        let text = "FROM a AS x\nCOPY one /one\nPUSHCONTEXT other\nCOPY two /two\n";
        let stages = parse(text, true).unwrap();
        assert_eq!(stages[0].context_name, "other");
        assert_eq!(stages[0].instructions.len(), 2);
    }

    #[test]
    fn unknown_verb_in_strict_mode_errors() {
        let text = "FROM a AS x\nBOGUS foo\n";
        let err = parse(text, true).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnknownVerb(ref v) if v == "BOGUS"));
    }

    #[test]
    fn classify_stages_respects_explicit_override() {
        let text = "FROM a AS special\nRUN echo hi\n";
        let mut stages = parse(text, true).unwrap();
        let mut overrides = BTreeMap::new();
        overrides.insert("special".to_string(), true);
        classify_stages(
            &mut stages,
            &stage::default_base_prefixes(),
            &stage::default_anon_prefixes(),
            &overrides,
        );
        assert!(stages[0].is_base);
    }

    #[test]
    fn round_trip_canonical_form_reparses_identically() {
        let text = "FROM a AS x\nCOPY --chown=1000:1000 --from=builder /src /dst\n";
        let stages = parse(text, true).unwrap();
        let canon = stages[0].instructions[0].canonical();
        let reparsed_text = format!("FROM a AS x\n{}\n", canon);
        let reparsed = parse(&reparsed_text, true).unwrap();
        assert_eq!(
            reparsed[0].instructions[0].canonical(),
            stages[0].instructions[0].canonical()
        );
    }
}

//! Template rendering: the entrypoint Dockerfile template (plus includes)
//! is rendered through `tera`, the Jinja2-like engine the retrieval pack's
//! templating crates already depend on. Registers the two filters the
//! rendering contract requires: `shell_escape` and `ignore_escape`.

use std::collections::BTreeMap;

use serde::Serialize;
use tera::{Result as TeraResult, Tera, Value};

use crate::config::model::{Profile, UserConfig};
use crate::error::ConfigError;

/// Builds a `Tera` instance that can resolve `{% include %}` from every
/// configured `template_paths` entry.
pub fn build_engine(template_paths: &[String]) -> Result<Tera, ConfigError> {
    let mut tera = Tera::default();

    for dir in template_paths {
        let glob = format!("{}/**/*", dir.trim_end_matches('/'));
        match Tera::new(&glob) {
            Ok(loaded) => tera.extend(&loaded).map_err(|e| ConfigError::Render(e.to_string()))?,
            Err(e) if glob_matched_nothing(&e) => {}
            Err(e) => return Err(ConfigError::Render(e.to_string())),
        }
    }

    tera.register_filter("shell_escape", shell_escape_filter);
    tera.register_filter("ignore_escape", ignore_escape_filter);
    Ok(tera)
}

/// `Tera::new` errors when a glob matches zero files, which is expected
/// for a `template_paths` entry that holds only includes reachable from
/// another entry. Only that specific case is swallowed.
fn glob_matched_nothing(e: &tera::Error) -> bool {
    e.to_string().contains("glob") && e.to_string().contains("no files")
}

#[derive(Debug, Serialize)]
struct RenderContext<'a> {
    profile: &'a str,
    vars: &'a BTreeMap<String, serde_yaml::Value>,
    user_config: &'a UserConfigView,
}

/// A serializable projection of `UserConfig` for the template context —
/// narrower than the full parsed struct, matching the rendering contract
/// in spec.md §6 (`user_config` is a read-only view, not the raw document).
#[derive(Debug, Serialize)]
pub struct UserConfigView {
    pub client_type: String,
    pub parallelism: Option<usize>,
}

impl UserConfigView {
    pub fn from_config(cfg: &UserConfig) -> Self {
        UserConfigView {
            client_type: cfg.client.r#type.clone(),
            parallelism: cfg.parallelism,
        }
    }
}

/// Renders `entrypoint` (a template name already loaded into `tera`) with
/// the profile name, its free-form variable map, and a `user_config` view.
pub fn render_entrypoint(
    tera: &Tera,
    entrypoint: &str,
    profile_name: &str,
    profile: &Profile,
    user_config: &UserConfigView,
) -> Result<String, ConfigError> {
    let ctx = RenderContext {
        profile: profile_name,
        vars: &profile.vars,
        user_config,
    };
    let tera_ctx = tera::Context::from_serialize(&ctx).map_err(|e| ConfigError::Render(e.to_string()))?;
    tera.render(entrypoint, &tera_ctx).map_err(|e| ConfigError::Render(e.to_string()))
}

/// Escapes a string for safe inclusion inside a POSIX shell double-quoted
/// argument (used by templates building `RUN` lines from user variables).
fn shell_escape_filter(value: &Value, _args: &BTreeMap<String, Value>) -> TeraResult<Value> {
    let s = value.as_str().ok_or_else(|| tera::Error::msg("shell_escape expects a string"))?;
    Ok(Value::String(shell_escape(s)))
}

pub fn shell_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Escapes a string for safe inclusion as a literal entry in a
/// `.dockerignore`-style pattern list (used by templates that synthesize
/// ignore patterns from user variables, e.g. a generated build-artifact
/// name): backslash-escapes the glob metacharacters `* ? [ ] !` so the
/// value is matched literally.
fn ignore_escape_filter(value: &Value, _args: &BTreeMap<String, Value>) -> TeraResult<Value> {
    let s = value.as_str().ok_or_else(|| tera::Error::msg("ignore_escape expects a string"))?;
    Ok(Value::String(ignore_escape(s)))
}

pub fn ignore_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '!' | '#') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escape_wraps_and_escapes_single_quotes() {
        assert_eq!(shell_escape("hello"), "'hello'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn ignore_escape_escapes_glob_metacharacters() {
        assert_eq!(ignore_escape("a*b"), "a\\*b");
        assert_eq!(ignore_escape("plain"), "plain");
    }

    #[test]
    fn render_entrypoint_substitutes_profile_and_vars() {
        let mut tera = Tera::default();
        tera.register_filter("shell_escape", shell_escape_filter);
        tera.register_filter("ignore_escape", ignore_escape_filter);
        tera.add_raw_template("entry", "FROM {{ vars.base_image }}:{{ profile }}\n").unwrap();

        let mut vars = BTreeMap::new();
        vars.insert("base_image".to_string(), serde_yaml::Value::String("golang".to_string()));
        let profile = Profile { vars };
        let view = UserConfigView {
            client_type: "docker".to_string(),
            parallelism: None,
        };
        let rendered = render_entrypoint(&tera, "entry", "release", &profile, &view).unwrap();
        assert_eq!(rendered, "FROM golang:release\n");
    }
}

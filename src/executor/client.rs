//! The builder-client abstraction: an opaque boundary between the executor
//! and whatever tool actually builds images (`docker`, `buildx`, `podman`,
//! or a user-supplied script).
//!
//! Each operation is a small command template — an `argv` list and an
//! environment-override map — rendered from a handful of recognised
//! variables (`image`, `source_image`, `target_image`, `platform`,
//! `dependencies`, `args`, `environment`). This keeps every builder-specific
//! detail out of the executor itself.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BuildError;

#[async_trait]
pub trait BuilderClient: Send + Sync {
    /// Builds `input_dockerfile` against `context_tar`, producing `tag` for
    /// `platform`. `extra_deps` are tags this build's COPY `--from=`
    /// instructions reference and must already exist locally.
    async fn build(
        &self,
        input_dockerfile: &str,
        context_tar: Option<&[u8]>,
        tag: &str,
        platform: &str,
        extra_deps: &[String],
        cancel: &CancellationToken,
    ) -> Result<String, BuildError>;

    async fn tag(&self, src: &str, dst: &str) -> Result<(), BuildError>;
    async fn push(&self, image: &str) -> Result<(), BuildError>;
    async fn pull(&self, image: &str) -> Result<(), BuildError>;
    async fn untag(&self, image: &str) -> Result<(), BuildError>;
    fn platform(&self) -> &str;
}

/// One templated command: an argv list with `{var}` placeholders and an
/// environment-override map, as configured in the user config's
/// `client.commands` table.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl CommandTemplate {
    fn render(&self, vars: &BTreeMap<String, String>) -> (Vec<String>, BTreeMap<String, String>) {
        let argv = self.argv.iter().map(|a| substitute(a, vars)).collect();
        let env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, vars)))
            .collect();
        (argv, env)
    }
}

fn substitute(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(close) = template[i..].find('}') {
                let key = &template[i + 1..i + close];
                if let Some(value) = vars.get(key) {
                    out.push_str(value);
                    i += close + 1;
                    continue;
                }
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[derive(Debug, Clone)]
pub struct CommandTemplates {
    pub build: CommandTemplate,
    pub tag: CommandTemplate,
    pub push: CommandTemplate,
    pub pull: CommandTemplate,
    pub untag: CommandTemplate,
    pub platform: CommandTemplate,
}

/// A `BuilderClient` that shells out to an external builder per the
/// configured command templates, one subprocess per operation.
pub struct SubprocessBuilderClient {
    templates: CommandTemplates,
    platform: String,
}

impl SubprocessBuilderClient {
    pub fn new(templates: CommandTemplates, platform: String) -> Self {
        SubprocessBuilderClient { templates, platform }
    }

    async fn run(
        &self,
        template: &CommandTemplate,
        vars: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        self.run_capturing(template, vars, cancel).await.map(|_| ())
    }

    async fn run_capturing(
        &self,
        template: &CommandTemplate,
        vars: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String, BuildError> {
        let (argv, env) = template.render(&vars);
        let Some((program, args)) = argv.split_first() else {
            return Ok(String::new());
        };

        debug!(program = %program, args = ?args, "invoking builder-client command");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(&env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let tag_for_errors = vars.get("tag").or_else(|| vars.get("target_image")).cloned().unwrap_or_default();

        let mut child = cmd.spawn().map_err(|e| BuildError {
            tag: tag_for_errors.clone(),
            exit_code: None,
            stderr_tail: e.to_string(),
            tail_lines: 0,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut stdout_lines = Vec::new();
        let mut stderr_tail: Vec<String> = Vec::new();
        const TAIL_LINES: usize = 50;

        let stdout_task = tokio::spawn(async move {
            let mut out = Vec::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    out.push(line);
                }
            }
            out
        });
        let stderr_task = tokio::spawn(async move {
            let mut out: Vec<String> = Vec::new();
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if out.len() == TAIL_LINES {
                        out.remove(0);
                    }
                    out.push(line);
                }
            }
            out
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| BuildError {
                tag: tag_for_errors.clone(),
                exit_code: None,
                stderr_tail: e.to_string(),
                tail_lines: 0,
            })?,
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(BuildError {
                    tag: tag_for_errors,
                    exit_code: None,
                    stderr_tail: "cancelled".to_string(),
                    tail_lines: 0,
                });
            }
        };

        if let Ok(lines) = stdout_task.await {
            stdout_lines = lines;
        }
        if let Ok(lines) = stderr_task.await {
            stderr_tail = lines;
        }

        if !status.success() {
            return Err(BuildError {
                tag: tag_for_errors,
                exit_code: status.code(),
                stderr_tail: stderr_tail.join("\n"),
                tail_lines: TAIL_LINES,
            });
        }

        Ok(stdout_lines.join("\n"))
    }
}

async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        use std::time::Duration;

        if let Some(pid) = child.id() {
            let pgid = Pid::from_raw(pid as i32);
            match killpg(pgid, Signal::SIGTERM) {
                Ok(()) => {
                    if tokio::time::timeout(Duration::from_secs(5), child.wait()).await.is_err() {
                        warn!(pid, "builder subprocess did not exit after SIGTERM, sending SIGKILL");
                        let _ = child.kill().await;
                    }
                }
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        } else {
            let _ = child.kill().await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }
}

#[async_trait]
impl BuilderClient for SubprocessBuilderClient {
    async fn build(
        &self,
        input_dockerfile: &str,
        context_tar: Option<&[u8]>,
        tag: &str,
        platform: &str,
        extra_deps: &[String],
        cancel: &CancellationToken,
    ) -> Result<String, BuildError> {
        let mut vars = BTreeMap::new();
        vars.insert("target_image".to_string(), tag.to_string());
        vars.insert("tag".to_string(), tag.to_string());
        vars.insert("platform".to_string(), platform.to_string());
        vars.insert("dependencies".to_string(), extra_deps.join(","));
        vars.insert("dockerfile".to_string(), input_dockerfile.to_string());
        if context_tar.is_some() {
            vars.insert("context".to_string(), "-".to_string());
        }
        self.run_capturing(&self.templates.build, vars, cancel).await?;
        Ok(tag.to_string())
    }

    async fn tag(&self, src: &str, dst: &str) -> Result<(), BuildError> {
        let mut vars = BTreeMap::new();
        vars.insert("source_image".to_string(), src.to_string());
        vars.insert("target_image".to_string(), dst.to_string());
        self.run(&self.templates.tag, vars, &CancellationToken::new()).await
    }

    async fn push(&self, image: &str) -> Result<(), BuildError> {
        let mut vars = BTreeMap::new();
        vars.insert("image".to_string(), image.to_string());
        self.run(&self.templates.push, vars, &CancellationToken::new()).await
    }

    async fn pull(&self, image: &str) -> Result<(), BuildError> {
        let mut vars = BTreeMap::new();
        vars.insert("image".to_string(), image.to_string());
        self.run(&self.templates.pull, vars, &CancellationToken::new()).await
    }

    async fn untag(&self, image: &str) -> Result<(), BuildError> {
        let mut vars = BTreeMap::new();
        vars.insert("image".to_string(), image.to_string());
        self.run(&self.templates.untag, vars, &CancellationToken::new()).await
    }

    fn platform(&self) -> &str {
        &self.platform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_replaces_known_placeholders() {
        let mut vars = BTreeMap::new();
        vars.insert("image".to_string(), "myapp:latest".to_string());
        assert_eq!(substitute("pull {image}", &vars), "pull myapp:latest");
    }

    #[test]
    fn substitute_leaves_unknown_placeholders_untouched() {
        let vars = BTreeMap::new();
        assert_eq!(substitute("echo {nope}", &vars), "echo {nope}");
    }
}

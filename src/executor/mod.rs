//! Executes a [`Plan`] against a [`BuilderClient`] with bounded parallelism.
//!
//! Readiness is tracked per entry by counting the tags it still needs;
//! an entry dispatches as soon as every tag it consumes has been produced.
//! On the first failure the executor stops dispatching new entries but lets
//! in-flight ones finish (drain-on-failure), then cleans up intermediate
//! tags and returns the first error.

pub mod client;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{BuildError, TplbuildError};
use crate::planner::{ChainBase, Plan, PlanEntry};

pub use client::{BuilderClient, CommandTemplate, CommandTemplates, SubprocessBuilderClient};

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum number of builder invocations running at once.
    pub max_parallel: usize,
    pub platform: String,
    /// Keep intermediate `tplbuild-<uuid>` tags around after a run instead
    /// of untagging them; useful when debugging a failed build.
    pub keep_intermediate_tags: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions {
            max_parallel: 4,
            platform: "linux/amd64".to_string(),
            keep_intermediate_tags: false,
        }
    }
}

/// Runs every entry in `plan`, respecting tag dependencies, up to
/// `options.max_parallel` builder invocations concurrently.
pub async fn execute(
    plan: &Plan,
    client: Arc<dyn BuilderClient>,
    options: ExecutorOptions,
    cancel: CancellationToken,
) -> Result<(), TplbuildError> {
    let indexed: Vec<(usize, PlanEntry)> = plan.entries.iter().cloned().enumerate().collect();

    // Map each tag an entry *produces* to the entries that must run first
    // and wait for the tag each entry *requires*.
    let mut produced_by: HashMap<String, usize> = HashMap::new();
    for (idx, entry) in &indexed {
        if let Some(tag) = output_tag(entry) {
            produced_by.insert(tag, *idx);
        }
    }

    let mut required_tags: Vec<HashSet<String>> = vec![HashSet::new(); indexed.len()];
    for (idx, entry) in &indexed {
        required_tags[*idx] = input_tags(entry);
    }

    // blockers[i] = set of entry indices that must finish before i can run.
    let mut blockers: Vec<HashSet<usize>> = vec![HashSet::new(); indexed.len()];
    let mut dependents: Vec<HashSet<usize>> = vec![HashSet::new(); indexed.len()];
    for (idx, tags) in required_tags.iter().enumerate() {
        for tag in tags {
            if let Some(&producer) = produced_by.get(tag) {
                if producer != idx {
                    blockers[idx].insert(producer);
                    dependents[producer].insert(idx);
                }
            }
        }
    }

    let remaining: Vec<Mutex<usize>> = blockers.iter().map(|b| Mutex::new(b.len())).collect();
    let semaphore = Arc::new(Semaphore::new(options.max_parallel.max(1)));
    let failed = Arc::new(Mutex::new(None::<TplbuildError>));
    let options = Arc::new(options);

    let mut ready: Vec<usize> = (0..indexed.len()).filter(|&i| blockers[i].is_empty()).collect();
    let mut dispatched: HashSet<usize> = HashSet::new();
    let mut joinset: JoinSet<(usize, Result<(), TplbuildError>)> = JoinSet::new();
    let dependents = Arc::new(dependents);

    loop {
        if failed.lock().await.is_none() && !cancel.is_cancelled() {
            while let Some(idx) = ready.pop() {
                if dispatched.contains(&idx) {
                    continue;
                }
                dispatched.insert(idx);
                let entry = indexed[idx].1.clone();
                let client = Arc::clone(&client);
                let options = Arc::clone(&options);
                let cancel = cancel.clone();
                let semaphore = Arc::clone(&semaphore);
                joinset.spawn(async move {
                    let permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                    let result = run_entry(&entry, client.as_ref(), &options, &cancel).await;
                    drop(permit);
                    (idx, result)
                });
            }
        }

        let Some(joined) = joinset.join_next().await else {
            break;
        };
        let (idx, result) = joined.expect("executor task panicked");

        if let Err(e) = result {
            error!(entry = idx, error = %e, "builder invocation failed");
            let mut f = failed.lock().await;
            if f.is_none() {
                *f = Some(e);
            }
            continue;
        }

        for &dep in dependents[idx].iter() {
            let mut count = remaining[dep].lock().await;
            *count -= 1;
            if *count == 0 && failed.lock().await.is_none() {
                ready.push(dep);
            }
        }
    }

    if let Some(err) = failed.lock().await.take() {
        if !options.keep_intermediate_tags {
            cleanup_intermediate_tags(&plan.intermediate_tags, client.as_ref()).await;
        }
        return Err(err);
    }

    if !options.keep_intermediate_tags {
        cleanup_intermediate_tags(&plan.intermediate_tags, client.as_ref()).await;
    }

    if cancel.is_cancelled() {
        return Err(TplbuildError::Cancelled);
    }

    Ok(())
}

async fn run_entry(
    entry: &PlanEntry,
    client: &dyn BuilderClient,
    options: &ExecutorOptions,
    cancel: &CancellationToken,
) -> Result<(), TplbuildError> {
    match entry {
        PlanEntry::AlreadyCached { .. } => Ok(()),
        PlanEntry::Chain {
            base,
            lines,
            output_tag,
            input_tags,
            ..
        } => {
            let dockerfile = chain_dockerfile(base, lines);
            client
                .build(&dockerfile, None, output_tag, &options.platform, input_tags, cancel)
                .await
                .map_err(TplbuildError::Build)?;
            Ok(())
        }
        PlanEntry::Tag { source_tag, tags, .. } => {
            for tag in tags {
                client.tag(source_tag, tag).await.map_err(TplbuildError::Build)?;
            }
            Ok(())
        }
    }
}

/// Synthesizes the Dockerfile text a chain entry hands to the builder
/// client: one `FROM` plus the chain's already-canonicalised step lines.
fn chain_dockerfile(base: &ChainBase, lines: &[String]) -> String {
    let from = match base {
        ChainBase::Source { repo, tag } => format!("FROM {}:{}", repo, tag),
        ChainBase::Tag(tag) => format!("FROM {}", tag),
    };
    let mut text = from;
    for line in lines {
        text.push('\n');
        text.push_str(line);
    }
    text
}

fn output_tag(entry: &PlanEntry) -> Option<String> {
    match entry {
        PlanEntry::Chain { output_tag, .. } => Some(output_tag.clone()),
        PlanEntry::AlreadyCached { digest, .. } => Some(digest.clone()),
        PlanEntry::Tag { .. } => None,
    }
}

fn input_tags(entry: &PlanEntry) -> HashSet<String> {
    match entry {
        PlanEntry::Chain { base, input_tags, .. } => {
            let mut set: HashSet<String> = input_tags.iter().cloned().collect();
            if let ChainBase::Tag(tag) = base {
                set.insert(tag.clone());
            }
            set
        }
        PlanEntry::Tag { source_tag, .. } => {
            let mut set = HashSet::new();
            set.insert(source_tag.clone());
            set
        }
        PlanEntry::AlreadyCached { .. } => HashSet::new(),
    }
}

async fn cleanup_intermediate_tags(tags: &[String], client: &dyn BuilderClient) {
    for tag in tags {
        if let Err(e) = client.untag(tag).await {
            warn!(tag, error = %e, "failed to clean up intermediate tag");
        }
    }
    if !tags.is_empty() {
        info!(count = tags.len(), "cleaned up intermediate tags");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingClient {
        built: Mutex<Vec<String>>,
        tagged: Mutex<Vec<(String, String)>>,
        untagged: Mutex<Vec<String>>,
        fail_tag: Option<String>,
        calls: AtomicUsize,
    }

    impl RecordingClient {
        fn new(fail_tag: Option<&str>) -> Self {
            RecordingClient {
                built: Mutex::new(Vec::new()),
                tagged: Mutex::new(Vec::new()),
                untagged: Mutex::new(Vec::new()),
                fail_tag: fail_tag.map(|s| s.to_string()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BuilderClient for RecordingClient {
        async fn build(
            &self,
            _input_dockerfile: &str,
            _context_tar: Option<&[u8]>,
            tag: &str,
            _platform: &str,
            _extra_deps: &[String],
            _cancel: &CancellationToken,
        ) -> Result<String, BuildError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_tag.as_deref() == Some(tag) {
                return Err(BuildError {
                    tag: tag.to_string(),
                    exit_code: Some(1),
                    stderr_tail: "boom".to_string(),
                    tail_lines: 1,
                });
            }
            self.built.lock().await.push(tag.to_string());
            Ok(tag.to_string())
        }

        async fn tag(&self, src: &str, dst: &str) -> Result<(), BuildError> {
            self.tagged.lock().await.push((src.to_string(), dst.to_string()));
            Ok(())
        }
        async fn push(&self, _image: &str) -> Result<(), BuildError> {
            Ok(())
        }
        async fn pull(&self, _image: &str) -> Result<(), BuildError> {
            Ok(())
        }
        async fn untag(&self, image: &str) -> Result<(), BuildError> {
            self.untagged.lock().await.push(image.to_string());
            Ok(())
        }
        fn platform(&self) -> &str {
            "linux/amd64"
        }
    }

    fn sample_plan() -> Plan {
        use crate::graph::node::NodeId;
        let n = |i: u32| NodeId::new(i as usize);
        Plan {
            entries: vec![
                PlanEntry::Chain {
                    base: ChainBase::Source {
                        repo: "golang".to_string(),
                        tag: "1.22".to_string(),
                    },
                    steps: vec![n(0)],
                    lines: vec!["RUN build".to_string()],
                    output_tag: "tplbuild-aaa".to_string(),
                    input_tags: vec![],
                    terminal: n(0),
                },
                PlanEntry::Tag {
                    node: n(1),
                    source_tag: "tplbuild-aaa".to_string(),
                    tags: vec!["myapp:latest".to_string()],
                },
            ],
            intermediate_tags: vec!["tplbuild-aaa".to_string()],
        }
    }

    #[tokio::test]
    async fn runs_chain_then_dependent_tag_and_cleans_up() {
        let client = Arc::new(RecordingClient::new(None));
        let plan = sample_plan();
        let result = execute(
            &plan,
            client.clone(),
            ExecutorOptions::default(),
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(*client.built.lock().await, vec!["tplbuild-aaa".to_string()]);
        assert_eq!(
            *client.tagged.lock().await,
            vec![("tplbuild-aaa".to_string(), "myapp:latest".to_string())]
        );
        assert_eq!(*client.untagged.lock().await, vec!["tplbuild-aaa".to_string()]);
    }

    #[tokio::test]
    async fn keep_intermediate_tags_skips_cleanup() {
        let client = Arc::new(RecordingClient::new(None));
        let plan = sample_plan();
        let mut opts = ExecutorOptions::default();
        opts.keep_intermediate_tags = true;
        execute(&plan, client.clone(), opts, CancellationToken::new()).await.unwrap();
        assert!(client.untagged.lock().await.is_empty());
    }

    #[tokio::test]
    async fn a_failing_chain_prevents_its_dependent_tag_from_running() {
        let client = Arc::new(RecordingClient::new(Some("tplbuild-aaa")));
        let plan = sample_plan();
        let result = execute(
            &plan,
            client.clone(),
            ExecutorOptions::default(),
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
        assert!(client.tagged.lock().await.is_empty());
    }
}

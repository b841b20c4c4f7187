use std::path::PathBuf;

use clap::Parser;
use tplbuild::cli::{Cli, Commands, GlobalOpts, PlanOpts};
use tplbuild::config;
use tplbuild::error::{ConfigError, TplbuildError};
use tplbuild::graph::ImageNode;
use tplbuild::pipeline::{BuildKind, Project, RunOptions};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let result = run(cli).await;

    if let Err(e) = result {
        eprintln!("error [{}]: {}", e.kind_name(), e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), TplbuildError> {
    match cli.command {
        Commands::Build { plan } => run_plan(&cli.global, plan, BuildKind::Build, false, false, None).await,
        Commands::Publish { plan } => run_plan(&cli.global, plan, BuildKind::Publish, false, false, None).await,
        Commands::BaseBuild {
            plan,
            check,
            update_salt,
            update_sources,
        } => run_plan(&cli.global, plan, BuildKind::Base, check, update_sources, update_salt).await,
        Commands::BaseLookup { plan } => run_plan(&cli.global, plan, BuildKind::Base, true, false, None).await,
        Commands::SourceUpdate { profile } => run_source_command(&cli.global, profile, true).await,
        Commands::SourceLookup { profile } => run_source_command(&cli.global, profile, false).await,
    }
}

async fn run_plan(
    global: &GlobalOpts,
    plan: PlanOpts,
    kind: BuildKind,
    check_only: bool,
    update_sources: bool,
    update_salt: Option<String>,
) -> Result<(), TplbuildError> {
    let project = load_project(global).await?;

    if let Some(salt) = update_salt {
        project.rotate_salt(salt)?;
    }

    let platforms = if plan.platform.is_empty() {
        project.config.platforms.clone()
    } else {
        plan.platform
    };

    let opts = RunOptions {
        profile: plan.profile,
        platforms,
        stage_filter: plan.stages,
        kind,
        check_only,
        update_sources,
        keep_intermediate_tags: plan.debug,
    };

    let reports = project.run(&opts).await?;

    let mut out_of_date = false;
    for (platform, report) in &reports {
        for tag in &report.cached {
            println!("{platform}: cached {tag}");
        }
        for tag in &report.built {
            println!("{platform}: {} {tag}", if check_only { "would build" } else { "built" });
        }
        out_of_date |= report.out_of_date;
    }

    if check_only && out_of_date {
        // base-build --check / base-lookup surface a non-zero exit when
        // anything is out of date, without it being a build failure per se.
        return Err(TplbuildError::Build(tplbuild::error::BuildError {
            tag: "check".to_string(),
            exit_code: Some(1),
            stderr_tail: "one or more base images are out of date".to_string(),
            tail_lines: 0,
        }));
    }

    Ok(())
}

async fn run_source_command(global: &GlobalOpts, profile: String, force_update: bool) -> Result<(), TplbuildError> {
    let project = load_project(global).await?;
    let stages = project.render_stages(&profile)?;

    for platform in &project.config.platforms {
        let mut graph = project.build_graph(&stages, platform, &profile)?;
        project.resolve_sources(&mut graph, force_update).await?;
        for node in graph.dag.node_weights() {
            if let ImageNode::SourceImage { repo, tag, digest, .. } = node {
                println!("{platform}: {repo}:{tag} -> {}", digest.as_deref().unwrap_or("(unresolved)"));
            }
        }
    }
    Ok(())
}

async fn load_project(global: &GlobalOpts) -> Result<Project, TplbuildError> {
    let config_path = match &global.config_file {
        Some(path) => path.clone(),
        None => {
            let cwd = std::env::current_dir().expect("current directory must be accessible");
            config::find_project_config(&cwd).ok_or_else(|| {
                TplbuildError::Config(ConfigError::Read {
                    path: "tplbuild.yml".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no tplbuild.yml found in this or any parent directory"),
                })
            })?
        }
    };
    let user_config_path: PathBuf = global.user_config.clone().unwrap_or_else(config::default_user_config_path);

    Project::load(&config_path, &user_config_path)
}

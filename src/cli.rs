//! Command-line surface: `build`, `publish`, `base-build`, `base-lookup`,
//! `source-update`, `source-lookup`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tplbuild", version, about = "Templated, reproducible container-image builds")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Path to the project config (defaults to the nearest tplbuild.yml)
    #[arg(short = 'f', long = "file", global = true)]
    pub config_file: Option<PathBuf>,

    /// Path to the user config (defaults to ~/.tplbuildconfig.yml)
    #[arg(long = "user-config", global = true)]
    pub user_config: Option<PathBuf>,
}

/// Flags shared by every command that renders and plans a graph.
#[derive(Debug, Args)]
pub struct PlanOpts {
    /// Profile to render the entrypoint template with
    #[arg(long, default_value = "default")]
    pub profile: String,

    /// Platform(s) to build for, e.g. linux/amd64 (repeatable; defaults to
    /// the project config's `platforms` list)
    #[arg(long)]
    pub platform: Vec<String>,

    /// Only operate on these stages (defaults to every eligible stage)
    pub stages: Vec<String>,

    /// Keep intermediate `tplbuild-*` tags on every exit path instead of
    /// cleaning them up (useful for inspecting a failed build)
    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build stage images locally, without publishing
    Build {
        #[command(flatten)]
        plan: PlanOpts,
    },

    /// Build and push stage images under their configured publish tags
    Publish {
        #[command(flatten)]
        plan: PlanOpts,
    },

    /// Build (and push) base images, keyed by content hash
    BaseBuild {
        #[command(flatten)]
        plan: PlanOpts,

        /// Report what would build without building anything
        #[arg(long)]
        check: bool,

        /// Rotate the project salt to this value before planning,
        /// invalidating every base image's content hash
        #[arg(long)]
        update_salt: Option<String>,

        /// Re-resolve every source image's digest instead of using the lock
        #[arg(long)]
        update_sources: bool,
    },

    /// Report which base images are cached vs. out of date, without building
    BaseLookup {
        #[command(flatten)]
        plan: PlanOpts,
    },

    /// Re-resolve and lock every referenced source image's registry digest
    SourceUpdate {
        #[arg(long, default_value = "default")]
        profile: String,
    },

    /// Print the locked digest for every referenced source image
    SourceLookup {
        #[arg(long, default_value = "default")]
        profile: String,
    },
}

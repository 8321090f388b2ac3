// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    io,
    path::{Path, PathBuf},
};

use clap::{Args, Parser};
use fs_err as fs;
use tempfile::TempDir;
use thiserror::Error;

use makebb::{builder, emit, env, modules, program, resolve, rewrite, Env, Layout};

#[derive(Debug, Parser)]
#[command(
    name = "makebb",
    about = "Compile many Go commands into one multicall binary"
)]
pub struct Command {
    #[command(flatten)]
    pub global: Global,
    #[arg(
        required = true,
        value_name = "PATTERN",
        allow_hyphen_values = true,
        help = "Commands to embed: paths, globs or Go import paths; prefix with '-' to exclude"
    )]
    pub patterns: Vec<String>,
}

#[derive(Debug, Args)]
pub struct Global {
    #[arg(
        short = 'o',
        long = "output",
        default_value = "./bb",
        help = "Where to write the final binary"
    )]
    pub output: PathBuf,
    #[arg(
        long = "scratch-dir",
        help = "Emit generated sources here instead of a fresh temp directory"
    )]
    pub scratch_dir: Option<PathBuf>,
    #[arg(
        short = 'g',
        long = "generate-only",
        default_value = "false",
        help = "Emit the generated sources and stop before the compile"
    )]
    pub generate_only: bool,
    #[arg(
        long,
        default_value = "false",
        help = "Keep the generated sources after a successful build"
    )]
    pub keep: bool,
    #[arg(
        long = "go-arg",
        value_name = "ARG",
        help = "Forwarded verbatim to `go build` (repeatable)"
    )]
    pub go_args: Vec<String>,
    #[arg(
        long,
        default_value = "false",
        help = "Fail on duplicate command names instead of preferring the local copy"
    )]
    pub strict: bool,
    #[arg(
        short,
        long = "verbose",
        default_value = "false",
        help = "Print what makebb is doing"
    )]
    pub verbose: bool,
}

pub fn process() -> Result<(), Error> {
    let Command { global, patterns } = Command::parse();

    let default_level = if global.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let env = Env::new()?;

    let dirs = resolve::resolve(&env, &patterns)?;
    let programs = program::load(&env, &dirs)?;
    let programs =
        program::check_collisions(programs, global.strict, |dir| env.go.in_module_cache(dir))?;

    if programs.is_empty() {
        return Err(Error::Empty);
    }

    let module_mode = programs.iter().all(|p| p.module.is_some());
    let reconciled =
        modules::reconcile(&programs, |dir| env.go.in_module_cache(dir), &env.go.version)?;

    let registry = modules::registry_import();
    let mut items = vec![];
    for program in &programs {
        let mut resolver = program::DepResolver::new(program.deps.clone());
        let rewritten = rewrite::rewrite(program, &mut resolver, &registry)?;
        items.push((program, rewritten));
    }

    let scratch = Scratch::new(global.scratch_dir)?;
    let layout = Layout::new(scratch.path());

    emit::emit(&layout, &items, &reconciled)?;

    if let Err(error) = emit::format_tree(&env, &layout) {
        log::warn!("formatting the generated tree failed: {error}");
    }

    if global.generate_only {
        let path = scratch.preserve();
        println!("Generated sources in {}", path.display());
        return Ok(());
    }

    let options = builder::Options {
        output: &global.output,
        go_args: &global.go_args,
        module_mode,
    };

    match builder::build(&env, &layout, &options) {
        Ok(()) => {
            if global.keep {
                let path = scratch.preserve();
                println!("Generated sources kept in {}", path.display());
            } else {
                scratch.cleanup()?;
            }
            Ok(())
        }
        Err(error) => {
            let path = scratch.preserve();
            eprintln!("Generated sources preserved in {} for inspection", path.display());
            Err(error.into())
        }
    }
}

/// The scratch tree: a temp directory by default, the user's directory
/// with `--scratch-dir`. Released on every path except explicit
/// preservation.
enum Scratch {
    Temp(TempDir),
    Fixed(PathBuf),
}

impl Scratch {
    fn new(dir: Option<PathBuf>) -> Result<Self, io::Error> {
        match dir {
            Some(dir) => {
                fs::create_dir_all(&dir)?;
                Ok(Self::Fixed(fs::canonicalize(dir)?))
            }
            None => Ok(Self::Temp(TempDir::with_prefix("makebb-")?)),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Temp(temp) => temp.path(),
            Self::Fixed(path) => path,
        }
    }

    fn preserve(self) -> PathBuf {
        match self {
            Self::Temp(temp) => temp.into_path(),
            Self::Fixed(path) => path,
        }
    }

    fn cleanup(self) -> io::Result<()> {
        match self {
            Self::Temp(_) => Ok(()),
            Self::Fixed(path) => fs::remove_dir_all(path),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("environment")]
    Env(#[from] env::Error),
    #[error("resolve patterns")]
    Resolve(#[from] resolve::Error),
    #[error("load commands")]
    Load(#[from] program::Error),
    #[error("reconcile modules")]
    Modules(#[from] modules::Error),
    #[error("rewrite")]
    Rewrite(#[from] rewrite::Error),
    #[error("emit generated tree")]
    Emit(#[from] emit::Error),
    #[error("build")]
    Build(#[from] builder::Error),
    #[error("every matched command was skipped")]
    Empty,
    #[error("io")]
    Io(#[from] io::Error),
}

// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Driver for the Go toolchain's package metadata interface
//!
//! Wraps `go env -json` and `go list -json` as synchronous subprocess
//! calls. Queries are expected to arrive pre-batched; this crate never
//! splits or regroups them.

use std::{
    collections::HashMap,
    env, io,
    path::{Path, PathBuf},
    process::Command,
};

use serde::Deserialize;

use thiserror::Error;

/// The host Go build environment, as reported by `go env` with the calling
/// process's environment applied (GOOS/GOARCH overrides included)
#[derive(Debug, Clone)]
pub struct GoEnv {
    /// Path to the `go` binary itself
    pub go: PathBuf,
    pub goroot: PathBuf,
    pub gopath: PathBuf,
    pub gomodcache: PathBuf,
    pub goos: String,
    pub goarch: String,
    pub version: String,
}

impl GoEnv {
    /// Detect the environment by invoking `go env -json`. The binary is
    /// taken from `$GO` when set, otherwise resolved from `$PATH`.
    pub fn detect() -> Result<Self, Error> {
        let go = PathBuf::from(env::var("GO").unwrap_or_else(|_| "go".into()));

        let output = Command::new(&go)
            .args(["env", "-json"])
            .output()
            .map_err(|e| Error::Spawn {
                binary: go.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(Error::Tool {
                command: format!("{} env -json", go.display()),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let vars: HashMap<String, String> = serde_json::from_slice(&output.stdout)?;
        let get = |key: &str| vars.get(key).cloned().unwrap_or_default();

        Ok(Self {
            go,
            goroot: get("GOROOT").into(),
            gopath: first_path_element(&get("GOPATH")),
            gomodcache: get("GOMODCACHE").into(),
            goos: get("GOOS"),
            goarch: get("GOARCH"),
            version: get("GOVERSION"),
        })
    }

    /// `gofmt` that ships with the detected toolchain
    pub fn gofmt(&self) -> PathBuf {
        self.goroot.join("bin").join("gofmt")
    }

    /// A `go` invocation inheriting the process environment
    pub fn command(&self) -> Command {
        Command::new(&self.go)
    }

    /// True when `dir` lives under the module cache, i.e. the sources were
    /// fetched rather than locally rooted
    pub fn in_module_cache(&self, dir: &Path) -> bool {
        !self.gomodcache.as_os_str().is_empty() && dir.starts_with(&self.gomodcache)
    }
}

fn first_path_element(gopath: &str) -> PathBuf {
    gopath.split(':').next().unwrap_or_default().into()
}

/// Module resolution mode for one query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleMode {
    Enabled,
    Disabled,
}

impl ModuleMode {
    fn env_value(self) -> &'static str {
        match self {
            ModuleMode::Enabled => "on",
            ModuleMode::Disabled => "off",
        }
    }
}

/// One batched `go list` query
#[derive(Debug)]
pub struct Query<'a> {
    /// Working directory; module-mode queries must run inside the module
    pub dir: &'a Path,
    pub patterns: &'a [String],
    pub module_mode: ModuleMode,
    /// Include the transitive dependency closure (`-deps`)
    pub deps: bool,
}

/// Run one `go list -e -json` query and decode the concatenated JSON
/// package objects it prints
pub fn list(env: &GoEnv, query: &Query<'_>) -> Result<Vec<Package>, Error> {
    let mut command = env.command();
    command
        .current_dir(query.dir)
        .env("GO111MODULE", query.module_mode.env_value())
        .args(["list", "-e", "-json"]);

    if query.deps {
        command.arg("-deps");
    }

    command.arg("--").args(query.patterns);

    log::debug!(
        "go list ({}): {} pattern(s) in {:?}",
        query.module_mode.env_value(),
        query.patterns.len(),
        query.dir
    );

    let output = command.output().map_err(|e| Error::Spawn {
        binary: env.go.clone(),
        source: e,
    })?;

    if !output.status.success() {
        return Err(Error::Tool {
            command: format!("go list {}", query.patterns.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    decode_packages(&output.stdout)
}

/// Decode a stream of concatenated JSON objects as printed by
/// `go list -json`
pub fn decode_packages(stdout: &[u8]) -> Result<Vec<Package>, Error> {
    serde_json::Deserializer::from_slice(stdout)
        .into_iter()
        .collect::<Result<Vec<Package>, _>>()
        .map_err(Error::Decode)
}

/// One package record from `go list -json`. Field names mirror the tool's
/// own output; only the fields the pipeline consumes are modelled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Package {
    pub dir: PathBuf,
    pub import_path: String,
    pub name: String,
    pub go_files: Vec<String>,
    pub cgo_files: Vec<String>,
    pub ignored_go_files: Vec<String>,
    pub s_files: Vec<String>,
    pub embed_files: Vec<String>,
    pub imports: Vec<String>,
    pub deps: Vec<String>,
    pub standard: bool,
    pub dep_only: bool,
    pub incomplete: bool,
    pub module: Option<Module>,
    pub error: Option<PackageError>,
}

impl Package {
    /// Source files the compiler would build, in reported order
    pub fn compiled_files(&self) -> impl Iterator<Item = &String> {
        self.go_files.iter().chain(&self.cgo_files)
    }

    pub fn is_command(&self) -> bool {
        self.name == "main"
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Module {
    pub path: String,
    pub version: Option<String>,
    pub main: bool,
    pub dir: Option<PathBuf>,
    pub go_mod: Option<PathBuf>,
    pub replace: Option<Box<Module>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PackageError {
    pub err: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to run {binary:?}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` failed:\n{stderr}")]
    Tool { command: String, stderr: String },
    #[error("decode go list output")]
    Decode(#[from] serde_json::Error),
}

#[cfg(test)]
mod test {
    use super::decode_packages;

    #[test]
    fn concatenated_objects() {
        let stream = br#"{
	"Dir": "/src/mod5/cmd/hello",
	"ImportPath": "example.com/mod5/cmd/hello",
	"Name": "main",
	"GoFiles": ["main.go", "extra.go"],
	"Module": {
		"Path": "example.com/mod5",
		"Main": true,
		"Dir": "/src/mod5",
		"GoMod": "/src/mod5/go.mod"
	}
}
{
	"Dir": "/src/lib",
	"ImportPath": "example.com/lib",
	"Name": "lib",
	"DepOnly": true
}
"#;

        let packages = decode_packages(stream).unwrap();
        assert_eq!(packages.len(), 2);
        assert!(packages[0].is_command());
        assert_eq!(
            packages[0].compiled_files().collect::<Vec<_>>(),
            ["main.go", "extra.go"]
        );
        let module = packages[0].module.as_ref().unwrap();
        assert!(module.main);
        assert_eq!(module.path, "example.com/mod5");
        assert!(!packages[1].is_command());
        assert!(packages[1].dep_only);
    }

    #[test]
    fn replaced_module() {
        let stream = br#"{
	"Dir": "/cache/example.com/dep@v1.2.3",
	"ImportPath": "example.com/dep",
	"Name": "dep",
	"Module": {
		"Path": "example.com/dep",
		"Version": "v1.2.3",
		"Replace": {
			"Path": "../dep",
			"Dir": "/src/dep"
		}
	}
}"#;

        let packages = decode_packages(stream).unwrap();
        let module = packages[0].module.as_ref().unwrap();
        let replace = module.replace.as_ref().unwrap();
        assert_eq!(replace.path, "../dep");
        assert_eq!(replace.dir.as_deref().unwrap().to_str().unwrap(), "/src/dep");
    }

    #[test]
    fn error_field() {
        let stream = br#"{
	"ImportPath": "example.com/broken",
	"Incomplete": true,
	"Error": {"Err": "build constraints exclude all Go files"}
}"#;

        let packages = decode_packages(stream).unwrap();
        assert!(packages[0].incomplete);
        assert!(packages[0]
            .error
            .as_ref()
            .unwrap()
            .err
            .contains("build constraints"));
    }
}

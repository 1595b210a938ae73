//! Test discovery and command construction.
//!
//! The [`Runner`] turns configuration into a list of [`TestSpec`]s and turns
//! a test spec plus a stage's binding flags into a [`Command`].
//!
//! # Runner Kinds
//!
//! | Kind | Discovery | Test target |
//! |------|-----------|-------------|
//! | `script` | `tests.files`, or files under `tests.root` matching `tests.pattern` | the file |
//! | `gtest` | `<gtest_binary> --gtest_list_tests` | `<gtest_binary> --gtest_filter=Suite.Case` |
//!
//! # Command Layout
//!
//! With a driver (default `legate`):
//!
//! ```text
//! legate <stage args> <multi-node args> <target> <extra args> <custom args>
//! ```
//!
//! Without a driver the target itself is the program and the remaining
//! arguments follow it in the same order.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{Config, Debugger, FeatureKind, KindSelector, Launcher, RunnerKind};
use crate::launcher::Command;
use crate::stage::StageError;

/// One test to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestSpec {
    /// Test file, or the gtest binary for gtest cases.
    pub path: PathBuf,

    /// Name shown in reports.
    pub display: String,

    /// Fully qualified gtest case (`Suite.Case`) for the gtest runner.
    pub gtest_name: Option<String>,

    /// Custom dispatch override. `Some` removes the test from sharding.
    pub custom: Option<CustomTest>,
}

impl TestSpec {
    /// Creates a plain sharded test spec for a file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            display: path.display().to_string(),
            path,
            gtest_name: None,
            custom: None,
        }
    }

    /// Marks this spec for custom dispatch.
    pub fn with_custom(mut self, custom: CustomTest) -> Self {
        self.custom = Some(custom);
        self
    }

    /// Returns true if a stage of `kind` should run this test.
    ///
    /// Sharded tests run under every stage.
    pub fn runs_under(&self, kind: FeatureKind) -> bool {
        self.custom.as_ref().is_none_or(|c| c.runs_under(kind))
    }
}

/// Per-test override for custom dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomTest {
    /// Stages this test runs under. `None` means all of them.
    pub kind: Option<KindSelector>,

    /// Extra arguments appended to the test command.
    pub args: Vec<String>,
}

impl CustomTest {
    /// Returns true if a stage of `kind` should run this test.
    pub fn runs_under(&self, kind: FeatureKind) -> bool {
        self.kind.as_ref().is_none_or(|k| k.matches(kind))
    }
}

/// Discovers tests and builds their commands.
#[derive(Debug, Clone)]
pub struct Runner {
    kind: RunnerKind,
    driver: Option<String>,
    gtest_binary: Option<PathBuf>,
    extra_args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl Runner {
    /// Creates a runner from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Launch`] if the configuration cannot produce
    /// runnable commands (missing gtest binary, malformed extra arguments).
    pub fn from_config(config: &Config) -> Result<Self, StageError> {
        let tests = &config.tests;

        let gtest_binary = match tests.runner {
            RunnerKind::Gtest => Some(tests.gtest_binary.clone().ok_or_else(|| {
                StageError::Launch("the gtest runner needs tests.gtest_binary".to_string())
            })?),
            RunnerKind::Script => None,
        };

        let extra_args = shell_words::split(&tests.extra_args)
            .map_err(|e| StageError::Launch(format!("invalid tests.extra_args: {}", e)))?;

        Ok(Self {
            kind: tests.runner,
            driver: Some(tests.driver.clone()).filter(|d| !d.is_empty()),
            gtest_binary,
            extra_args,
            working_dir: tests.working_dir.clone(),
        })
    }

    /// Discovers the tests to run, with custom overrides attached.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Launch`] if discovery cannot run: no tests
    /// configured, a missing test root, or a failing gtest binary.
    pub async fn test_specs(&self, config: &Config) -> Result<Vec<TestSpec>, StageError> {
        let mut specs = match self.kind {
            RunnerKind::Script => discover_files(config).await?,
            RunnerKind::Gtest => self.discover_gtest().await?,
        };

        if let Some(filter) = &config.tests.filter {
            let filter = Regex::new(filter)
                .map_err(|e| StageError::InvalidConfiguration(format!("tests.filter: {}", e)))?;
            specs.retain(|s| filter.is_match(&s.display));
        }

        for entry in &config.tests.custom {
            let args = match &entry.args {
                Some(args) => shell_words::split(args).map_err(|e| {
                    StageError::InvalidConfiguration(format!(
                        "args for custom test '{}': {}",
                        entry.file, e
                    ))
                })?,
                None => Vec::new(),
            };
            let custom = CustomTest {
                kind: entry.kind.clone(),
                args,
            };

            let target = Path::new(&entry.file);
            let mut matched = false;
            for spec in specs
                .iter_mut()
                .filter(|s| s.path == target || s.display == entry.file)
            {
                spec.custom = Some(custom.clone());
                matched = true;
            }
            if !matched {
                warn!("Custom test '{}' does not match any discovered test", entry.file);
            }
        }

        debug!("Discovered {} tests", specs.len());
        Ok(specs)
    }

    /// Builds the command that runs `spec` with the given stage and custom
    /// arguments.
    pub fn cmd(
        &self,
        spec: &TestSpec,
        config: &Config,
        stage_args: &[String],
        custom_args: &[String],
    ) -> Command {
        let target = self.target(spec);

        let mut cmd = match &self.driver {
            Some(driver) => Command::new(driver.clone())
                .args(stage_args.iter().cloned())
                .args(multi_node_args(config))
                .args(target),
            None => {
                let mut target = target.into_iter();
                let program = target.next().unwrap_or_default();
                Command::new(program)
                    .args(target)
                    .args(stage_args.iter().cloned())
                    .args(multi_node_args(config))
            }
        };

        cmd = cmd
            .args(self.extra_args.iter().cloned())
            .args(custom_args.iter().cloned());
        if let Some(dir) = &self.working_dir {
            cmd = cmd.working_dir(dir.clone());
        }
        cmd
    }

    /// Builds the interactive debugger command for `spec`.
    ///
    /// The debugger wraps the driver when there is one, otherwise the test
    /// target directly.
    pub fn cmd_debug(
        &self,
        spec: &TestSpec,
        config: &Config,
        debugger: Debugger,
        stage_args: &[String],
    ) -> Command {
        let inner = self.cmd(spec, config, stage_args, &[]);
        let mut cmd = Command::new(debugger.program())
            .arg("--args")
            .arg(inner.program)
            .args(inner.args);
        cmd.working_dir = inner.working_dir;
        cmd
    }

    fn target(&self, spec: &TestSpec) -> Vec<String> {
        let mut target = vec![spec.path.display().to_string()];
        if let Some(name) = &spec.gtest_name {
            target.push(format!("--gtest_filter={}", name));
        }
        target
    }

    async fn discover_gtest(&self) -> Result<Vec<TestSpec>, StageError> {
        let binary = self
            .gtest_binary
            .as_ref()
            .ok_or_else(|| StageError::Launch("no gtest binary configured".to_string()))?;

        let output = tokio::process::Command::new(binary)
            .arg("--gtest_list_tests")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                StageError::Launch(format!("failed to run {}: {}", binary.display(), e))
            })?;
        if !output.status.success() {
            return Err(StageError::Launch(format!(
                "{} --gtest_list_tests exited with {}",
                binary.display(),
                output.status
            )));
        }

        Ok(parse_gtest_list(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .map(|name| TestSpec {
                path: binary.clone(),
                display: name.clone(),
                gtest_name: Some(name),
                custom: None,
            })
            .collect())
    }
}

/// Launcher flags shared by every stage. Ranks per node is a binding flag
/// and comes from the stage's shard arguments instead.
pub fn multi_node_args(config: &Config) -> Vec<String> {
    let multi = &config.multi_node;
    let mut args = Vec::new();

    if multi.launcher != Launcher::None {
        args.push("--launcher".to_string());
        args.push(multi.launcher.to_string());
    }
    if multi.nodes > 1 {
        args.push("--nodes".to_string());
        args.push(multi.nodes.to_string());
    }
    for extra in &multi.launcher_extra {
        args.push(format!("--launcher-extra={}", extra));
    }

    args
}

/// Parses `--gtest_list_tests` output into `Suite.Case` names.
///
/// Suite lines end with `.` and start in column 0; case lines are indented.
/// Trailing `# TypeParam = ...` / `# GetParam() = ...` comments are dropped,
/// as are disabled suites and cases.
pub fn parse_gtest_list(output: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut suite: Option<&str> = None;

    for line in output.lines() {
        let code = line.split('#').next().unwrap_or_default().trim_end();
        if code.trim().is_empty() {
            continue;
        }

        if !code.starts_with(char::is_whitespace) {
            suite = code.strip_suffix('.');
            continue;
        }

        let Some(suite) = suite else {
            continue;
        };
        let case = code.trim();
        if is_disabled(suite) || case.starts_with("DISABLED_") {
            continue;
        }
        names.push(format!("{}.{}", suite, case));
    }

    names
}

fn is_disabled(suite: &str) -> bool {
    suite
        .split('/')
        .any(|part| part.starts_with("DISABLED_"))
}

async fn discover_files(config: &Config) -> Result<Vec<TestSpec>, StageError> {
    let tests = &config.tests;

    if !tests.files.is_empty() {
        return Ok(tests.files.iter().map(TestSpec::file).collect());
    }

    let Some(root) = &tests.root else {
        return Err(StageError::Launch(
            "no tests configured: set tests.files or tests.root".to_string(),
        ));
    };
    if !tokio::fs::metadata(root).await.is_ok_and(|m| m.is_dir()) {
        return Err(StageError::Launch(format!(
            "test root {} is not a directory",
            root.display()
        )));
    }

    let pattern = Regex::new(&tests.pattern)
        .map_err(|e| StageError::InvalidConfiguration(format!("tests.pattern: {}", e)))?;

    let mut files = Vec::new();
    walk(root, &pattern, &mut files)
        .await
        .map_err(|e| StageError::Launch(format!("failed to scan {}: {}", root.display(), e)))?;
    files.sort();

    Ok(files
        .into_iter()
        .map(|path| {
            let display = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .display()
                .to_string();
            TestSpec {
                path,
                display,
                gtest_name: None,
                custom: None,
            }
        })
        .collect())
}

/// Recursively collects files whose name matches `pattern`.
async fn walk(dir: &Path, pattern: &Regex, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            Box::pin(walk(&path, pattern, out)).await?;
        } else if pattern.is_match(&entry.file_name().to_string_lossy()) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CustomTestConfig, load_config_str};

    #[test]
    fn test_parse_gtest_list() {
        let output = "\
Running main() from gtest_main.cc
Copy.
  Basic
  DISABLED_Slow
Typed/0.  # TypeParam = int
  Fill
Param/Scatter.
  Case/0  # GetParam() = 4
DISABLED_Broken.
  Anything
";
        assert_eq!(
            parse_gtest_list(output),
            vec!["Copy.Basic", "Typed/0.Fill", "Param/Scatter.Case/0"]
        );
    }

    #[test]
    fn test_cmd_with_driver() {
        let config = load_config_str(
            r#"
            [multi_node]
            launcher = "mpirun"
            nodes = 2
            launcher_extra = ["-x FOO"]

            [tests]
            extra_args = "-v --quiet"
            "#,
        )
        .unwrap();
        let runner = Runner::from_config(&config).unwrap();
        let spec = TestSpec::file("tests/test_a.py");

        let cmd = runner.cmd(
            &spec,
            &config,
            &["--cpus".to_string(), "2".to_string()],
            &["--custom".to_string()],
        );
        assert_eq!(cmd.program, "legate");
        assert_eq!(
            cmd.args,
            vec![
                "--cpus",
                "2",
                "--launcher",
                "mpirun",
                "--nodes",
                "2",
                "--launcher-extra=-x FOO",
                "tests/test_a.py",
                "-v",
                "--quiet",
                "--custom",
            ]
        );
    }

    #[test]
    fn test_cmd_without_driver_runs_target() {
        let config = load_config_str(
            r#"
            [tests]
            driver = ""
            "#,
        )
        .unwrap();
        let runner = Runner::from_config(&config).unwrap();
        let cmd = runner.cmd(
            &TestSpec::file("./check.sh"),
            &config,
            &["--cpus".to_string(), "1".to_string()],
            &[],
        );
        assert_eq!(cmd.program, "./check.sh");
        assert_eq!(cmd.args, vec!["--cpus", "1"]);
    }

    #[test]
    fn test_cmd_gtest_target() {
        let config = load_config_str(
            r#"
            [tests]
            runner = "gtest"
            gtest_binary = "build/tests_with_runtime"
            "#,
        )
        .unwrap();
        let runner = Runner::from_config(&config).unwrap();
        let spec = TestSpec {
            path: PathBuf::from("build/tests_with_runtime"),
            display: "Copy.Basic".to_string(),
            gtest_name: Some("Copy.Basic".to_string()),
            custom: None,
        };

        let cmd = runner.cmd(&spec, &config, &[], &[]);
        assert_eq!(
            cmd.args,
            vec!["build/tests_with_runtime", "--gtest_filter=Copy.Basic"]
        );
    }

    #[test]
    fn test_cmd_debug_wraps_driver() {
        let config = Config::default();
        let runner = Runner::from_config(&config).unwrap();
        let cmd = runner.cmd_debug(&TestSpec::file("t.py"), &config, Debugger::Gdb, &[]);
        assert_eq!(cmd.program, "gdb");
        assert_eq!(cmd.args, vec!["--args", "legate", "t.py"]);
    }

    #[tokio::test]
    async fn test_discover_root_with_pattern_and_custom() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        for name in ["b_test.py", "a_test.py", "sub/c_test.py", "notes.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }

        let mut config = Config::default();
        config.tests.root = Some(dir.path().to_path_buf());
        config.tests.custom.push(CustomTestConfig {
            file: "sub/c_test.py".to_string(),
            kind: Some(KindSelector::One(FeatureKind::Cuda)),
            args: Some("--gpus 2".to_string()),
        });

        let runner = Runner::from_config(&config).unwrap();
        let specs = runner.test_specs(&config).await.unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.display.as_str()).collect();
        assert_eq!(names, vec!["a_test.py", "b_test.py", "sub/c_test.py"]);

        let custom = specs[2].custom.as_ref().unwrap();
        assert_eq!(custom.args, vec!["--gpus", "2"]);
        assert!(specs[2].runs_under(FeatureKind::Cuda));
        assert!(!specs[2].runs_under(FeatureKind::Cpus));
        assert!(specs[0].runs_under(FeatureKind::Cpus));
    }

    #[tokio::test]
    async fn test_filter_drops_non_matching() {
        let mut config = Config::default();
        config.tests.files = vec!["tests/io_test.py".into(), "tests/copy_test.py".into()];
        config.tests.filter = Some("copy".to_string());

        let runner = Runner::from_config(&config).unwrap();
        let specs = runner.test_specs(&config).await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].display, "tests/copy_test.py");
    }

    #[tokio::test]
    async fn test_missing_root_is_launch_error() {
        let mut config = Config::default();
        config.tests.root = Some(PathBuf::from("/nonexistent/shardrun-tests"));

        let runner = Runner::from_config(&config).unwrap();
        assert!(matches!(
            runner.test_specs(&config).await,
            Err(StageError::Launch(_))
        ));
    }

    #[tokio::test]
    async fn test_nothing_configured_is_launch_error() {
        let config = Config::default();
        let runner = Runner::from_config(&config).unwrap();
        assert!(matches!(
            runner.test_specs(&config).await,
            Err(StageError::Launch(_))
        ));
    }
}

//! Unit tests for local build and packaging steps.

use super::*;
use crate::test_support::ScriptedRunner;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Project {
    _tmp: TempDir,
    dir: Utf8PathBuf,
}

#[fixture]
fn project() -> Project {
    let tmp = TempDir::new().expect("temp dir");
    let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
    Project { _tmp: tmp, dir }
}

fn toolchain(runner: &ScriptedRunner) -> LocalToolchain<ScriptedRunner> {
    LocalToolchain::new(runner.clone(), &Settings::default())
}

/// Writes the archive a real `zip -r ../<name> .` would produce.
fn emulate_zip(runner: &ScriptedRunner) {
    runner.on_run(|invocation| {
        if invocation.program != "zip" {
            return;
        }
        if let Some(target) = invocation.args.get(2) {
            let path = invocation.dir.join(target.to_string_lossy().as_ref());
            std::fs::write(path, b"PK").expect("write archive");
        }
    });
}

#[rstest]
#[tokio::test]
async fn server_build_runs_maven_goals_in_project(project: Project) {
    let runner = ScriptedRunner::new();
    runner.push_success();

    toolchain(&runner)
        .build_server_project(&project.dir)
        .await
        .expect("build should succeed");

    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 1);
    let invocation = invocations.first().expect("one invocation");
    assert_eq!(invocation.command_string(), "mvn clean package");
    assert_eq!(invocation.dir, project.dir);
}

#[rstest]
#[tokio::test]
async fn failed_bundle_build_carries_stderr(project: Project) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(1), "", "[ERROR] compilation failure\n");

    let err = toolchain(&runner)
        .build_bundle(&project.dir, "build:dev")
        .await
        .expect_err("non-zero exit should fail");

    assert_eq!(
        err,
        LocalError::Build {
            program: String::from("npm run build:dev"),
            status: String::from("1"),
            output: String::from("[ERROR] compilation failure"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn failed_server_build_keeps_maven_stdout(project: Project) {
    let runner = ScriptedRunner::new();
    runner.push_output(
        Some(1),
        "[INFO] Building orders 1.0\n\n[ERROR] /src/Main.java:[3,8] cannot find symbol\n\
         [INFO] BUILD FAILURE\n",
        "",
    );

    let err = toolchain(&runner)
        .build_server_project(&project.dir)
        .await
        .expect_err("non-zero exit should fail");

    let LocalError::Build { ref output, .. } = err else {
        panic!("expected a build error, got {err:?}");
    };
    assert_eq!(
        output,
        "[INFO] Building orders 1.0\n[ERROR] /src/Main.java:[3,8] cannot find symbol\n\
         [INFO] BUILD FAILURE"
    );
    assert!(err.to_string().contains("cannot find symbol"), "{err}");
}

#[test]
fn build_output_is_cut_to_the_last_lines() {
    let stdout: String = (1..=30).map(|i| format!("line {i}\n")).collect();
    let output = CommandOutput {
        code: Some(1),
        stdout,
        stderr: String::from("npm ERR! missing script\n"),
    };

    let tail = output_tail(&output, 3);

    assert_eq!(tail, "line 29\nline 30\nnpm ERR! missing script");
}

#[rstest]
#[tokio::test]
async fn spawn_failure_is_reported(project: Project) {
    let runner = ScriptedRunner::new();

    let err = toolchain(&runner)
        .build_server_project(&project.dir)
        .await
        .expect_err("no scripted response means spawn failure");

    assert!(matches!(err, LocalError::Spawn(_)), "got {err:?}");
}

#[rstest]
#[tokio::test]
async fn package_zips_output_directory_contents(project: Project) {
    std::fs::create_dir(project.dir.join("dist")).expect("create dist");
    std::fs::write(project.dir.join("dist.zip"), b"stale").expect("stale archive");
    let runner = ScriptedRunner::succeeding();
    emulate_zip(&runner);

    let archive = toolchain(&runner)
        .package_directory(&project.dir, "dist")
        .await
        .expect("packaging should succeed");

    assert_eq!(archive, project.dir.join("dist.zip"));
    assert_eq!(std::fs::read(&archive).expect("read archive"), b"PK");
    let invocations = runner.invocations();
    let invocation = invocations.first().expect("zip invocation");
    assert_eq!(invocation.command_string(), "zip -q -r ../dist.zip .");
    assert_eq!(invocation.dir, project.dir.join("dist"));
}

#[rstest]
#[tokio::test]
async fn package_requires_output_directory(project: Project) {
    let runner = ScriptedRunner::succeeding();

    let err = toolchain(&runner)
        .package_directory(&project.dir, "dist")
        .await
        .expect_err("missing directory should fail");

    assert_eq!(err, LocalError::MissingOutputDir(project.dir.join("dist")));
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn package_fails_when_zip_writes_nothing(project: Project) {
    std::fs::create_dir(project.dir.join("dist")).expect("create dist");
    std::fs::write(project.dir.join("dist.zip"), b"stale").expect("stale archive");
    let runner = ScriptedRunner::succeeding();

    let err = toolchain(&runner)
        .package_directory(&project.dir, "dist")
        .await
        .expect_err("stale archive must not be reused");

    assert!(matches!(err, LocalError::Package { .. }), "got {err:?}");
}

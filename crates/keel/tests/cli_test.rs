#![allow(deprecated)] // TODO: cargo_bin → cargo_bin_cmd! へ移行

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn keel() -> Command {
    let mut cmd = Command::cargo_bin("keel").unwrap();
    // 利用者の設定やコンテンツトラストの影響を受けないようにする
    cmd.env("KEEL_CONFIG", std::env::temp_dir().join("keel-test-config"))
        .env_remove("DOCKER_CONTENT_TRUST");
    cmd
}

/// CLIヘルプが正しく表示されることを確認
#[test]
fn test_cli_help() {
    keel()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("service"))
        .stdout(predicate::str::contains("version"));
}

/// バージョン表示が正しく動作することを確認
#[test]
fn test_cli_version() {
    keel()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("keel "));
}

/// buildコマンドのヘルプに主要なオプションが表示されることを確認
#[test]
fn test_build_help() {
    keel()
        .arg("build")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--tag"))
        .stdout(predicate::str::contains("--file"))
        .stdout(predicate::str::contains("--build-arg"))
        .stdout(predicate::str::contains("--iidfile"))
        .stdout(predicate::str::contains("--disable-content-trust"));
}

/// service ls のヘルプが正しく表示されることを確認
#[test]
fn test_service_ls_help() {
    keel()
        .arg("service")
        .arg("ls")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--format"))
        .stdout(predicate::str::contains("--quiet"));
}

/// 不正なコマンドでエラーになることを確認
#[test]
fn test_invalid_command() {
    keel().arg("invalid-command").assert().failure();
}

/// コンテキスト未指定はエラーになることを確認
#[test]
fn test_build_requires_context() {
    keel()
        .arg("build")
        .assert()
        .failure()
        .stderr(predicate::str::contains("PATH | URL | -"));
}

/// コンテキストと Dockerfile の両方に stdin は使えない
#[test]
fn test_build_stdin_conflict() {
    keel()
        .args(["build", "-f", "-", "-"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains(
            "can't use stdin for both build context and dockerfile",
        ));
}

/// 不正なタグはデーモンに接続する前にエラーになる
#[test]
fn test_build_invalid_tag() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();

    keel()
        .args(["build", "-t", "Not/Valid"])
        .arg(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid reference format"));
}

/// 不正なメモリ指定はエラーになる
#[test]
fn test_build_invalid_memory() {
    keel()
        .args(["build", "-m", "lots", "."])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid size"));
}

/// Dockerfile が無いコンテキストはエラーになる
#[test]
fn test_build_missing_dockerfile() {
    let dir = tempfile::tempdir().unwrap();

    keel()
        .arg("build")
        .arg(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Dockerfileが見つかりません"));
}

/// 存在しないコンテキストはエラーになる
#[test]
fn test_build_missing_context() {
    let dir = tempfile::tempdir().unwrap();

    keel()
        .arg("build")
        .arg(dir.path().join("does-not-exist"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("ビルドコンテキストを準備できません"));
}

/// service inspect のヘルプに --pretty が表示されることを確認
#[test]
fn test_service_inspect_help() {
    keel()
        .args(["service", "inspect", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--pretty"))
        .stdout(predicate::str::contains("--format"));
}

/// --pretty と --format は同時に指定できない（デーモンに接続する前に失敗する）
#[test]
fn test_service_inspect_pretty_conflicts_with_format() {
    keel()
        .args(["service", "inspect", "--pretty", "--format", "{{.ID}}", "web"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains(
            "--format is incompatible with human friendly format",
        ));
}

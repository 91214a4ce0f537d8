use assert_cmd::Command;
use predicates::prelude::*;

fn tessera() -> Command {
    let mut cmd = Command::cargo_bin("tessera").unwrap();
    cmd.env_remove("TESSERA_LOG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_subcommands() {
    tessera()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("relay"))
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn missing_config_file_fails_with_context() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("tessera.toml");

    tessera()
        .args(["serve", "--backend", "127.0.0.1:1", "--config"])
        .arg(&missing)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn unknown_config_keys_are_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let config = temp.path().join("tessera.toml");
    std::fs::write(&config, "[relay]\nlisten_on = \"127.0.0.1:0\"\n").unwrap();

    tessera()
        .args(["relay", "--backend", "127.0.0.1:1", "--config"])
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("listen_on"));
}

#[test]
fn relay_requires_a_listen_address() {
    tessera()
        .args(["relay", "--backend", "127.0.0.1:1"])
        .env("TESSERA_LOG", "error")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no listen address"));
}

#[test]
fn serve_reports_unreachable_backend() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    tessera()
        .args(["serve", "--backend", &addr])
        .env("TESSERA_LOG", "error")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("connect to backend"));
}

#[test]
fn failures_echo_recent_logs_when_stderr_logging_is_off() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let temp = tempfile::tempdir().unwrap();
    let config = temp.path().join("tessera.toml");
    std::fs::write(&config, "[logging]\nstderr = false\nlevel = \"info\"\n").unwrap();

    tessera()
        .args(["serve", "--backend", &addr, "--config"])
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("log lines:"))
        .stderr(predicate::str::contains("connecting to backend"));
}

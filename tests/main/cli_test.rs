//! CLI contract tests for the `courier` binary.

use std::io::Write;

use assert_cmd::Command;

fn courier() -> Command {
    let cmd = Command::cargo_bin("courier");
    assert!(cmd.is_ok());
    let mut cmd = match cmd {
        Ok(cmd) => cmd,
        Err(err) => panic!("binary should build: {err}"),
    };
    for var in [
        "FORWARDER_TYPE",
        "WECOM_WEBHOOK_URL",
        "FEISHU_WEBHOOK_URL",
        "TELEGRAM_BOT_TOKEN",
        "COURIER_CONFIG",
        "CUSTOM_API_URL",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let file = tempfile::Builder::new().suffix(".toml").tempfile();
    let mut file = match file {
        Ok(file) => file,
        Err(err) => panic!("temp file should be created: {err}"),
    };
    assert!(file.write_all(contents.as_bytes()).is_ok());
    file
}

fn run_check(file: &tempfile::NamedTempFile) -> std::process::Output {
    let output = courier()
        .current_dir(std::env::temp_dir())
        .args(["check", "--config"])
        .arg(file.path())
        .output();
    match output {
        Ok(output) => output,
        Err(err) => panic!("check should run: {err}"),
    }
}

#[test]
fn help_lists_subcommands() {
    let output = courier().arg("--help").output();
    let output = match output {
        Ok(output) => output,
        Err(err) => panic!("help should run: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("start"));
    assert!(stdout.contains("check"));
}

#[test]
fn check_accepts_valid_config() {
    let file = config_file(
        r#"
[forwarder]
type = "feishu"

[feishu]
webhook_url = "https://open.feishu.cn/open-apis/bot/v2/hook/abc"

[telegram]
bot_token = "123:abc"
"#,
    );
    let output = run_check(&file);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("forwarder: feishu"));
    assert!(stdout.contains("configuration OK"));
}

#[test]
fn check_fails_on_unknown_forwarder() {
    let file = config_file("[forwarder]\ntype = \"pigeon\"\n");
    let output = run_check(&file);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("pigeon"));
}

#[test]
fn check_fails_without_bot_token() {
    let file = config_file(
        r#"
[wecom]
webhook_url = "https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key=k"
"#,
    );
    let output = run_check(&file);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("bot token"));
}

//! Integration tests for core CLI contract behavior.

use {
    base64::{Engine as _, engine::general_purpose::STANDARD},
    flate2::{Compression, write::ZlibEncoder},
    predicates::prelude::*,
    std::{fs, io::Write as _, path::Path},
    tempfile::tempdir,
};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("px4upload")
}

/// Write a `.px4` document carrying `payload` and return its path.
fn write_px4(dir: &Path, name: &str, payload: &[u8]) -> std::path::PathBuf {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .expect("compress payload");
    let compressed = encoder
        .finish()
        .expect("finish zlib stream");

    let doc = format!(
        concat!(
            "{{\n",
            "    \"board_id\": 9,\n",
            "    \"board_revision\": 0,\n",
            "    \"description\": \"Firmware for the PX4FMUv2 board\",\n",
            "    \"summary\": \"PX4FMUv2\",\n",
            "    \"version\": \"0.1\",\n",
            "    \"image_size\": {},\n",
            "    \"image_maxsize\": 2080768,\n",
            "    \"git_identity\": \"v1.14.0\",\n",
            "    \"image\": \"{}\"\n",
            "}}\n"
        ),
        payload.len(),
        STANDARD.encode(compressed)
    );

    let path = dir.join(name);
    fs::write(&path, doc).expect("write firmware document");
    path
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .code(0)
        .stdout(predicate::str::contains("px4upload"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .code(0)
        .stdout(predicate::str::contains("px4upload"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn help_lists_all_commands() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("upload"))
        .stdout(predicate::str::contains("info"))
        .stdout(predicate::str::contains("list-ports"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_flag() {
    let mut cmd = cli_cmd();
    cmd.arg("--invalid-flag-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_missing_firmware_argument() {
    let mut cmd = cli_cmd();
    cmd.arg("upload")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("FIRMWARE"));
}

#[test]
fn exit_code_two_for_zero_open_attempts() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_px4(dir.path(), "fw.px4", &[0xAB; 10]);

    let mut cmd = cli_cmd();
    cmd.arg("upload")
        .arg(&firmware)
        .args(["--open-attempts", "0"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--open-attempts"));
}

#[test]
fn exit_code_one_for_missing_firmware_file() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir
        .path()
        .join("missing.px4");

    let mut cmd = cli_cmd();
    cmd.arg("upload")
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Failed to load firmware"));
}

// ============================================================================
// info
// ============================================================================

#[test]
fn info_json_describes_image() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_px4(dir.path(), "fw.px4", &[0xAB; 10]);

    let mut cmd = cli_cmd();
    let output = cmd
        .arg("info")
        .arg(&firmware)
        .arg("--json")
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let info: serde_json::Value = serde_json::from_str(&stdout).expect("stdout should be JSON");
    assert_eq!(info["board_id"], 9);
    assert_eq!(info["image_size"], 10);
    assert_eq!(info["padded_size"], 12);
    assert_eq!(info["summary"], "PX4FMUv2");
    assert_eq!(info["git_identity"], "v1.14.0");
    assert_eq!(info["image_maxsize"], 2080768);

    let crc = info["crc32"]
        .as_str()
        .expect("crc32 should be a string");
    assert!(crc.starts_with("0x"));
    assert_eq!(crc.len(), 10);
}

#[test]
fn info_writes_to_stderr_only() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_px4(dir.path(), "fw.px4", &[0x01; 64]);

    let mut cmd = cli_cmd();
    cmd.arg("info")
        .arg(&firmware)
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Board ID"))
        .stderr(predicate::str::contains("CRC32"));
}

#[test]
fn info_json_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir
        .path()
        .join("not_exists.px4");

    let mut cmd = cli_cmd();
    cmd.arg("info")
        .arg("--json")
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn info_rejects_document_without_image() {
    let dir = tempdir().expect("tempdir should be created");
    let path = dir
        .path()
        .join("broken.px4");
    fs::write(&path, r#"{"board_id": 9, "image_size": 4, "description": "x"}"#)
        .expect("write document");

    let mut cmd = cli_cmd();
    cmd.arg("info")
        .arg(&path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("image"));
}

#[test]
fn invalid_config_file_only_warns() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_px4(dir.path(), "fw.px4", &[0x02; 16]);
    fs::write(dir.path().join("px4upload.toml"), "invalid toml [[[").expect("write invalid config");

    let output = cli_cmd()
        .current_dir(dir.path())
        .arg("info")
        .arg(&firmware)
        .output()
        .expect("command should execute");
    assert!(
        output.status.success(),
        "command should succeed despite config warning"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

// ============================================================================
// list-ports
// ============================================================================

#[test]
fn list_ports_json_returns_valid_json() {
    // Containers may have no serial ports at all; an empty array is fine
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("stdout should be JSON");
        assert!(parsed.is_array(), "should be JSON array");
    }
}

#[test]
fn colors_disabled_when_not_tty() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_px4(dir.path(), "fw.px4", &[0x03; 8]);

    let output = cli_cmd()
        .arg("info")
        .arg(&firmware)
        .output()
        .expect("command should execute");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("\x1b["), "no ANSI escapes when piped");
}

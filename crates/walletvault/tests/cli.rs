use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use eyre::{Context as _, ContextCompat as _};
use predicates::prelude::*;
use serde_json::{json, Value};

fn walletvault(cfg_dir: &Path, data_dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("walletvault"));
    cmd.env("WALLETVAULT_CONFIG_DIR", cfg_dir)
        .env("WALLETVAULT_DATA_DIR", data_dir)
        .env("WALLETVAULT_KDF_MEMORY_KIB", "64")
        .env("WALLETVAULT_KDF_ITERATIONS", "1");
    cmd
}

/// Feed call envelopes to `walletvault stdio` and collect responses by call ID.
fn stdio_session(
    cfg_dir: &Path,
    data_dir: &Path,
    calls: &[Value],
) -> eyre::Result<(Output, HashMap<u64, Value>)> {
    let mut child = walletvault(cfg_dir, data_dir)
        .arg("stdio")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn walletvault stdio")?;
    {
        let mut stdin = child.stdin.take().context("child stdin")?;
        for call in calls {
            writeln!(stdin, "{call}").context("write call")?;
        }
    }
    let out = child.wait_with_output().context("wait for walletvault stdio")?;

    let mut by_id = HashMap::new();
    for line in String::from_utf8_lossy(&out.stdout).lines() {
        let v: Value = serde_json::from_str(line).context("parse result envelope")?;
        let id = v
            .get("callID")
            .and_then(Value::as_u64)
            .context("callID in response")?;
        by_id.insert(id, v);
    }
    Ok((out, by_id))
}

fn call(id: u64, message_type: &str, args: Value) -> Value {
    json!({ "messageType": message_type, "callID": id, "args": args })
}

#[test]
fn paths_prints_json() -> eyre::Result<()> {
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = walletvault(cfg_dir.path(), data_dir.path())
        .arg("paths")
        .output()
        .context("run walletvault paths")?;
    assert!(
        out.status.success(),
        "paths exited non-zero: status={:?}, stderr={}",
        out.status.code(),
        String::from_utf8_lossy(&out.stderr)
    );

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        predicate::str::contains("walletvault.sock").eval(stdout.as_ref()),
        "socket path missing: {stdout}"
    );

    let v: Value = serde_json::from_slice(&out.stdout).context("parse paths json")?;
    let keys_file = v
        .get("keys_file")
        .and_then(Value::as_str)
        .context("keys_file")?;
    assert!(Path::new(keys_file).starts_with(data_dir.path()));
    assert!(v.get("socket").and_then(Value::as_str).is_some());
    // First run writes a default config.
    assert!(cfg_dir.path().join("config.toml").exists());
    Ok(())
}

#[test]
fn stdio_round_trips_persist_across_runs() -> eyre::Result<()> {
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;
    let (cfg, data) = (cfg_dir.path(), data_dir.path());

    // Calls within one session run concurrently, so each session only mixes calls that
    // do not depend on one another.
    let (out, resp) = stdio_session(
        cfg,
        data,
        &[
            call(1, "SetUpAppPassword", json!(["hunter2", "", "AlwaysPassword"])),
            call(2, "GetPublicKeyData", json!(["nope"])),
        ],
    )?;
    assert!(
        out.status.success(),
        "stdio exited non-zero: stderr={}",
        String::from_utf8_lossy(&out.stderr)
    );
    let setup = resp.get(&1).context("response 1")?;
    assert_eq!(
        setup.pointer("/result/authPolicy"),
        Some(&json!("AlwaysPassword"))
    );
    let missing = resp.get(&2).context("response 2")?;
    assert_eq!(missing.pointer("/error/name"), Some(&json!("NotFoundError")));
    assert_eq!(missing.pointer("/error/keyID"), Some(&json!("nope")));

    let (_, resp) = stdio_session(
        cfg,
        data,
        &[
            call(1, "HasSetAppPassword", json!([])),
            call(
                2,
                "CreateKey",
                json!(["k1", "hunter2", "deadbeef", { "name": "Main", "txAuth": "AlwaysPassword" }]),
            ),
        ],
    )?;
    assert_eq!(resp.get(&1).and_then(|r| r.get("result")), Some(&json!(true)));
    let created = resp.get(&2).context("response 2")?;
    assert_eq!(created.pointer("/result/password"), Some(&json!(true)));
    assert_eq!(created.pointer("/result/name"), Some(&json!("Main")));

    let (_, resp) = stdio_session(
        cfg,
        data,
        &[
            call(7, "GetKeyIDs", json!([])),
            call(8, "GetPrivateKey", json!(["k1", "hunter2"])),
            call(9, "GetPrivateKey", json!(["k1", "wrong"])),
        ],
    )?;
    assert_eq!(resp.get(&7).and_then(|r| r.get("result")), Some(&json!(["k1"])));
    assert_eq!(
        resp.get(&8).and_then(|r| r.get("result")),
        Some(&json!("deadbeef"))
    );
    let denied = resp.get(&9).context("response 9")?;
    assert_eq!(denied.pointer("/error/name"), Some(&json!("UnauthorizedError")));
    assert_eq!(denied.pointer("/error/message"), Some(&json!("Wrong password.")));

    let keys = std::fs::read_to_string(data.join("keys.json"))?;
    assert!(!keys.contains("deadbeef"));
    let audit = std::fs::read_to_string(data.join("audit.jsonl"))?;
    assert!(audit.contains("CreateKey"));
    assert!(!audit.contains("hunter2"));
    Ok(())
}

#[test]
fn unknown_message_type_ends_the_session() -> eyre::Result<()> {
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;
    let (out, _) = stdio_session(
        cfg_dir.path(),
        data_dir.path(),
        &[call(1, "DeleteEverything", json!([]))],
    )?;
    assert!(!out.status.success(), "unknown message type must fail");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        predicate::str::contains("DeleteEverything").eval(stderr.as_ref()),
        "stderr should name the message type: {stderr}"
    );
    Ok(())
}

#[test]
fn call_without_daemon_fails() -> eyre::Result<()> {
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;
    let out = walletvault(cfg_dir.path(), data_dir.path())
        .args(["call", "GetKeyIDs"])
        .output()
        .context("run walletvault call")?;
    assert!(!out.status.success(), "call must fail without a daemon");
    Ok(())
}

//! End-to-end smoke test for the pleb-node binary.
//!
//! Run with:
//!   cargo test -p pleb-node --test smoke

use std::process::{Command, Stdio};

fn pleb_node(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_pleb-node"))
        .args(args)
        .stdin(Stdio::null())
        .env("RUST_LOG", "warn")
        .output()
        .expect("spawning pleb-node")
}

#[test]
fn short_seed_exits_cleanly_before_starting() {
    for mode in ["pubsub", "console", "chat", "bootstrap"] {
        let out = pleb_node(&[mode, "--private-key", "not-32-bytes"]);
        assert!(out.status.success(), "{mode}: exit status {:?}", out.status);

        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(
            stdout.contains("--private-key argument too short"),
            "{mode}: unexpected stdout {stdout:?}"
        );
        // Nothing was started, so no listen address was announced.
        assert!(!stdout.contains("/ip4/"), "{mode}: network started: {stdout:?}");
    }
}

#[test]
fn unknown_subcommand_is_rejected() {
    let out = pleb_node(&["gossip"]);
    assert!(!out.status.success());
}

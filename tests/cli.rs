//! Binary-level tests for configuration handling and startup.

use std::net::TcpListener;
use std::process::Command;
use std::time::Duration;

use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_config(dir: &TempDir, body: &str) -> String {
    let path = dir.path().join("tandem.toml");
    std::fs::write(&path, body).unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn missing_config_file_fails() {
    Command::cargo_bin("tandem")
        .unwrap()
        .args(["--config", "/does/not/exist.toml"])
        .assert()
        .failure();
}

#[test]
fn invalid_log_level_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        "[log]\nlevel = \"verbose\"\n[storage]\nuri = \"memory://x\"\n",
    );
    Command::cargo_bin("tandem")
        .unwrap()
        .args(["--config", &config])
        .assert()
        .failure();
}

#[test]
fn missing_storage_uri_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[http]\nport = 7000\n");
    Command::cargo_bin("tandem")
        .unwrap()
        .args(["--config", &config])
        .assert()
        .failure();
}

#[test]
fn invalid_storage_scheme_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[storage]\nuri = \"redis://nope\"\n");
    Command::cargo_bin("tandem")
        .unwrap()
        .args(["--config", &config])
        .assert()
        .failure();
}

#[test]
fn version_flag_prints_and_exits() {
    Command::cargo_bin("tandem")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[tokio::test]
async fn serve_from_config_file() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = write_config(
        &dir,
        &format!(
            "[http]\nhost = \"127.0.0.1\"\nport = {port}\n\n[log]\nlevel = \"error\"\n\n[storage]\nuri = \"memory://tandem\"\n"
        ),
    );

    let mut child = Command::cargo_bin("tandem")
        .unwrap()
        .args(["--config", &config])
        .spawn()
        .unwrap();

    // allow the relay to start
    sleep(Duration::from_millis(500)).await;

    // HTTP health check
    let url = format!("http://127.0.0.1:{port}/healthz");
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // WebSocket EOSE round trip
    let ws_url = format!("ws://127.0.0.1:{port}/");
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
    let req = serde_json::json!(["REQ", "s", {"limit": 0}]);
    ws.send(Message::Text(req.to_string())).await.unwrap();
    let mut got_eose = false;
    while let Some(msg) = ws.next().await {
        match msg.unwrap() {
            Message::Text(t) if t.contains("EOSE") => {
                got_eose = true;
                break;
            }
            _ => {}
        }
    }
    assert!(got_eose);

    child.kill().unwrap();
    let _ = child.wait();
}

#[tokio::test]
async fn sqlite_storage_persists_across_restart() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let db_path = dir.path().join("relay.db");
    let config = write_config(
        &dir,
        &format!(
            "[http]\nhost = \"127.0.0.1\"\nport = {port}\n\n[log]\nlevel = \"error\"\n\n[storage]\nuri = \"sqlite://{}\"\n",
            db_path.display()
        ),
    );

    let mut child = Command::cargo_bin("tandem")
        .unwrap()
        .args(["--config", &config])
        .spawn()
        .unwrap();
    sleep(Duration::from_millis(500)).await;

    // publish one event
    let ws_url = format!("ws://127.0.0.1:{port}/");
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let ev = test_event();
    ws.send(Message::Text(serde_json::json!(["EVENT", ev]).to_string()))
        .await
        .unwrap();
    let mut accepted = false;
    while let Some(msg) = ws.next().await {
        if let Message::Text(t) = msg.unwrap() {
            if t.contains("OK") {
                accepted = t.contains("true");
                break;
            }
        }
    }
    assert!(accepted);
    drop(ws);
    child.kill().unwrap();
    let _ = child.wait();

    // restart on the same database and query it back
    let mut child = Command::cargo_bin("tandem")
        .unwrap()
        .args(["--config", &config])
        .spawn()
        .unwrap();
    sleep(Duration::from_millis(500)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    ws.send(Message::Text(
        serde_json::json!(["REQ", "s", {"kinds": [1]}]).to_string(),
    ))
    .await
    .unwrap();
    let mut got_event = false;
    while let Some(msg) = ws.next().await {
        match msg.unwrap() {
            Message::Text(t) if t.contains("EVENT") => got_event = true,
            Message::Text(t) if t.contains("EOSE") => break,
            _ => {}
        }
    }
    assert!(got_event);

    child.kill().unwrap();
    let _ = child.wait();
}

/// A signed kind-1 event for the persistence test.
fn test_event() -> serde_json::Value {
    use secp256k1::{Keypair, Message as SecpMessage, Secp256k1};
    use sha2::{Digest, Sha256};

    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &[7u8; 32]).unwrap();
    let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
    let created_at = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        - 60;
    let tags: Vec<Vec<String>> = vec![];
    let arr = serde_json::json!([0, pubkey, created_at, 1, tags, "persisted"]);
    let hash = Sha256::digest(serde_json::to_vec(&arr).unwrap());
    let id = hex::encode(hash);
    let msg = SecpMessage::from_digest_slice(&hash).unwrap();
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
    serde_json::json!({
        "id": id,
        "pubkey": pubkey,
        "created_at": created_at,
        "kind": 1,
        "tags": tags,
        "content": "persisted",
        "sig": hex::encode(sig.as_ref()),
    })
}

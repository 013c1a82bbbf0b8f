// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests for the literal scenarios in spec §8 (S1-S5),
//! spawning the real `termbroker` binary against the `fake` container
//! runtime profile so no Docker daemon is required.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use termbroker_specs::BrokerProcess;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn create_session(
    broker: &BrokerProcess,
    user_id: &str,
    image: &str,
) -> anyhow::Result<serde_json::Value> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/sessions", broker.base_url()))
        .json(&serde_json::json!({"user_id": user_id, "container_image": image}))
        .send()
        .await?;
    anyhow::ensure!(resp.status() == reqwest::StatusCode::CREATED, "create failed: {}", resp.status());
    Ok(resp.json().await?)
}

/// Drain binary/text frames from `ws` until the concatenation of their
/// payloads contains `marker`, or `TIMEOUT` elapses.
async fn expect_output_containing(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    marker: &str,
) -> anyhow::Result<()> {
    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("never saw {marker:?} in output; got {seen:?}");
        }
        let Some(msg) = tokio::time::timeout(Duration::from_secs(1), ws.next()).await.ok().flatten() else {
            continue;
        };
        match msg? {
            Message::Binary(bytes) => seen.push_str(&String::from_utf8_lossy(&bytes)),
            Message::Text(text) => seen.push_str(&text),
            Message::Close(_) => anyhow::bail!("stream closed before {marker:?} appeared; got {seen:?}"),
            _ => {}
        }
        if seen.contains(marker) {
            return Ok(());
        }
    }
}

// -- S1: happy path -----------------------------------------------------------

#[tokio::test]
async fn s1_happy_path_create_attach_echo_close() -> anyhow::Result<()> {
    let broker = BrokerProcess::build().idle_ttl_secs(2).sweep_interval_secs(1).spawn()?;
    broker.wait_healthy(TIMEOUT).await?;

    let created = create_session(&broker, "alice", "alpine:latest").await?;
    assert_eq!(created["status"], "Ready");
    let session_id = created["session_id"].as_str().expect("session_id").to_owned();

    let (mut ws, _) = tokio_tungstenite::connect_async(broker.pty_url(&session_id)).await?;
    ws.send(Message::Text("echo hi\n".into())).await?;
    expect_output_containing(&mut ws, "hi\r\n").await?;
    ws.close(None).await?;
    drop(ws);

    broker.wait_status(&session_id, "Terminated", Duration::from_secs(8)).await?;
    Ok(())
}

// -- S2: resize -----------------------------------------------------------------

#[tokio::test]
async fn s2_resize_is_reflected_by_stty_size() -> anyhow::Result<()> {
    let broker = BrokerProcess::build().idle_ttl_secs(300).spawn()?;
    broker.wait_healthy(TIMEOUT).await?;

    let created = create_session(&broker, "alice", "alpine:latest").await?;
    let session_id = created["session_id"].as_str().expect("session_id").to_owned();

    let (mut ws, _) = tokio_tungstenite::connect_async(broker.pty_url(&session_id)).await?;
    ws.send(Message::Text(r#"{"resize":[132,40]}"#.into())).await?;
    ws.send(Message::Text("stty size\n".into())).await?;
    expect_output_containing(&mut ws, "40 132").await?;
    Ok(())
}

// -- S3: disallowed image --------------------------------------------------------

#[tokio::test]
async fn s3_disallowed_image_is_rejected_and_writes_no_session() -> anyhow::Result<()> {
    let broker = BrokerProcess::start()?;
    broker.wait_healthy(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/sessions", broker.base_url()))
        .json(&serde_json::json!({"user_id": "alice", "container_image": "privileged:latest"}))
        .send()
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let list: serde_json::Value = client
        .get(format!("{}/api/sessions", broker.base_url()))
        .query(&[("user_id", "alice")])
        .send()
        .await?
        .json()
        .await?;
    assert!(list["sessions"].as_array().expect("array").is_empty());
    Ok(())
}

// -- S4: idle eviction ------------------------------------------------------------

#[tokio::test]
async fn s4_idle_detached_session_is_evicted_within_grace() -> anyhow::Result<()> {
    let broker = BrokerProcess::build().idle_ttl_secs(1).sweep_interval_secs(1).spawn()?;
    broker.wait_healthy(TIMEOUT).await?;

    let created = create_session(&broker, "alice", "alpine:latest").await?;
    let session_id = created["session_id"].as_str().expect("session_id").to_owned();

    let (ws, _) = tokio_tungstenite::connect_async(broker.pty_url(&session_id)).await?;
    drop(ws); // close immediately, releasing Attached -> Detached

    broker.wait_status(&session_id, "Terminated", Duration::from_secs(10)).await?;

    let client = reqwest::Client::new();
    let resp = client.get(format!("{}/api/sessions/{session_id}", broker.base_url())).send().await?;
    assert!(resp.status() == reqwest::StatusCode::NOT_FOUND || {
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        body["status"] == "Terminated"
    });
    Ok(())
}

// -- S5: reattach preserves the running container --------------------------------

#[tokio::test]
async fn s5_reattach_preserves_background_process() -> anyhow::Result<()> {
    let broker = BrokerProcess::build().idle_ttl_secs(300).spawn()?;
    broker.wait_healthy(TIMEOUT).await?;

    let created = create_session(&broker, "alice", "alpine:latest").await?;
    let session_id = created["session_id"].as_str().expect("session_id").to_owned();

    let (mut ws, _) = tokio_tungstenite::connect_async(broker.pty_url(&session_id)).await?;
    ws.send(Message::Text("sleep 30 & echo $!\n".into())).await?;

    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    let pid = loop {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("never saw a pid in output; got {seen:?}");
        }
        if let Some(Ok(Message::Binary(bytes))) = ws.next().await {
            seen.push_str(&String::from_utf8_lossy(&bytes));
        }
        if let Some(line) = seen.lines().find(|l| l.trim().parse::<u32>().is_ok()) {
            break line.trim().to_owned();
        }
    };

    ws.close(None).await?;
    drop(ws);

    // Give the bridge a moment to release Attached -> Detached before reattaching.
    broker.wait_status(&session_id, "Detached", Duration::from_secs(5)).await?;

    let (mut ws2, _) = tokio_tungstenite::connect_async(broker.pty_url(&session_id)).await?;
    ws2.send(Message::Text(format!("kill -0 {pid}; echo $?\n").into())).await?;
    expect_output_containing(&mut ws2, "0\r\n").await?;
    Ok(())
}

//! Batched Transport Integration Tests
//!
//! Exercises the batched HTTP sink against a local test endpoint:
//! size-threshold flushes, time-threshold flushes, and fan-out from the
//! logger.

use seclog_rs::config::{SecLogConfig, SinkSettings};
use seclog_rs::transport::{BatchedHttpSink, LogSink};
use seclog_rs::SecurityLogger;
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// 受信したバッチ（リクエストボディのJSON配列）を記録するテストサーバー
async fn spawn_test_server() -> (SocketAddr, Arc<Mutex<Vec<Vec<JsonValue>>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let batches: Arc<Mutex<Vec<Vec<JsonValue>>>> = Arc::new(Mutex::new(Vec::new()));

    let captured = Arc::clone(&batches);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let captured = Arc::clone(&captured);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 4096];

                // ヘッダー終端まで読む
                let header_end = loop {
                    match socket.read(&mut tmp).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&tmp[..n]),
                    }
                    if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                        break pos + 4;
                    }
                };

                let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = headers
                    .lines()
                    .find_map(|line| {
                        let lower = line.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);

                // ボディを読み切る
                while buf.len() < header_end + content_length {
                    match socket.read(&mut tmp).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&tmp[..n]),
                    }
                }

                let body_end = (header_end + content_length).min(buf.len());
                if let Ok(batch) = serde_json::from_slice::<Vec<JsonValue>>(&buf[header_end..body_end])
                {
                    captured.lock().await.push(batch);
                }

                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, batches)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn sink_settings(addr: SocketAddr, batch_size: usize, batch_timeout_secs: u64) -> SinkSettings {
    SinkSettings {
        name: "test-sink".to_string(),
        endpoint: Some(format!("http://{}/ingest", addr)),
        batch_size,
        batch_timeout_secs,
        request_timeout_secs: 5,
        buffer_cap: 1000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_150_records_flush_as_100_then_50() {
    let (addr, batches) = spawn_test_server().await;
    let sink = BatchedHttpSink::from_settings(&sink_settings(addr, 100, 60)).unwrap();

    for i in 0..150 {
        sink.submit(json!({"seq": i})).await;
    }

    // サイズしきい値による最初のフラッシュ完了を待つ
    for _ in 0..100 {
        if !batches.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // 残り50件は明示フラッシュで送る
    sink.flush().await.unwrap();

    let batches = batches.lock().await;
    let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![100, 50]);

    // 投入順が保持されている
    assert_eq!(batches[0][0]["seq"], 0);
    assert_eq!(batches[0][99]["seq"], 99);
    assert_eq!(batches[1][0]["seq"], 100);
    assert_eq!(batches[1][49]["seq"], 149);
}

#[tokio::test]
async fn test_time_threshold_flushes_partial_batch() {
    let (addr, batches) = spawn_test_server().await;
    let sink = BatchedHttpSink::from_settings(&sink_settings(addr, 100, 1)).unwrap();

    for i in 0..3 {
        sink.submit(json!({"seq": i})).await;
    }

    // 時間しきい値(1秒)の経過で監視タスクがフラッシュする
    for _ in 0..150 {
        if !batches.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let batches = batches.lock().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 3);
    assert_eq!(sink.buffered_len().await, 0);
}

#[tokio::test]
async fn test_logger_fans_out_to_configured_sink() {
    let (addr, batches) = spawn_test_server().await;

    let mut config = SecLogConfig::default();
    config.channels.console_enabled = false;
    config.sinks = vec![sink_settings(addr, 100, 60)];
    let logger = SecurityLogger::new(config).await.unwrap();

    for _ in 0..3 {
        logger
            .log_authentication_failure(
                "u1",
                "203.0.113.70".parse().unwrap(),
                "curl/7",
                "bad password",
                None,
                None,
            )
            .await;
    }

    logger.flush_sinks().await.unwrap();

    let batches = batches.lock().await;
    let total: usize = batches.iter().map(|b| b.len()).sum();
    assert_eq!(total, 3);

    // レコードは必須フィールドを持つ構造化オブジェクト
    let record = &batches[0][0];
    assert_eq!(record["category"], "security");
    assert_eq!(record["service"], "seclog");
    assert!(record["risk_score"].is_number());
    assert!(record["timestamp"].is_string());
}

#[tokio::test]
async fn test_audit_records_reach_sink_with_audit_category() {
    let (addr, batches) = spawn_test_server().await;

    let mut config = SecLogConfig::default();
    config.channels.console_enabled = false;
    config.sinks = vec![sink_settings(addr, 100, 60)];
    let logger = SecurityLogger::new(config).await.unwrap();

    let audit = seclog_rs::AuditEvent::new(
        "config_change",
        "admin",
        "retention-policy",
        "update",
        seclog_rs::Outcome::Success,
    );
    logger.log_audit_event(audit, None).await;

    logger.flush_sinks().await.unwrap();

    let batches = batches.lock().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0]["category"], "audit");
    assert_eq!(batches[0][0]["level"], "info");
}

#[tokio::test]
async fn test_unconfigured_sink_section_is_skipped() {
    // エンドポイント未設定のシンクはエラーなく無効化される
    let mut config = SecLogConfig::default();
    config.channels.console_enabled = false;
    config.sinks = vec![SinkSettings::default()];
    let logger = SecurityLogger::new(config).await.unwrap();

    logger
        .log_authentication_failure(
            "u1",
            "203.0.113.71".parse().unwrap(),
            "curl/7",
            "bad password",
            None,
            None,
        )
        .await;

    // フラッシュ対象のシンクが無くても成功する
    logger.flush_sinks().await.unwrap();
    assert_eq!(logger.get_statistics().await.sink_records_dropped, 0);
}

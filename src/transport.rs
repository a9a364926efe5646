//! Batched Sink Transport
//!
//! 外部ログ送信先向けの汎用バッファリングトランスポート。
//!
//! レコードを1件ずつ受け取りメモリ上に蓄積し、バッチサイズ到達または
//! 最初のレコードからの経過時間のいずれか早い方でフラッシュする。
//! 送信失敗時はバッチをバッファ先頭へ戻して次回フラッシュで再送する。
//! バッファには上限があり、到達時は古いレコードから黙って破棄する
//! （警告は破棄エピソードごとに1回のみ）。
//!
//! 呼び出し側から見た投入は同期的（バッファ追加のみ）で、ネットワーク
//! 送信は常に別タスクで行われ呼び出し経路をブロックしない。

use crate::config::SinkSettings;
use crate::error::SecurityError;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// ログシンクの抽象
///
/// 投入は失敗しない（内部障害はシンクが自己記録する）。明示的な
/// フラッシュのみ結果を返す。
#[async_trait]
pub trait LogSink: Send + Sync + fmt::Debug {
    /// シンク名
    fn name(&self) -> &str;

    /// レコードを投入（バッファ追加のみ、ブロックしない）
    async fn submit(&self, record: JsonValue);

    /// バッファ内の全レコードを送信
    async fn flush(&self) -> Result<(), SecurityError>;

    /// 破棄されたレコードの累計
    fn dropped_total(&self) -> u64;
}

/// バッファ状態
struct SinkState {
    buffer: VecDeque<JsonValue>,
    /// 最初にバッファされたレコードの時刻（時間しきい値の起点）
    first_buffered_at: Option<Instant>,
    /// 現在の破棄エピソードで警告済みか
    overflow_warned: bool,
}

struct SinkInner {
    name: String,
    endpoint: String,
    auth_token: Option<String>,
    headers: std::collections::HashMap<String, String>,
    batch_size: usize,
    batch_timeout: Duration,
    request_timeout: Duration,
    buffer_cap: usize,
    client: reqwest::Client,
    state: Mutex<SinkState>,
    /// フラッシュの直列化（バッチ順序を保証する）
    flush_lock: Mutex<()>,
    dropped_total: AtomicU64,
    flushes_completed: AtomicU64,
}

/// HTTPバッチシンク
///
/// クローンは同一バッファを共有する。
#[derive(Clone)]
pub struct BatchedHttpSink {
    inner: Arc<SinkInner>,
}

impl BatchedHttpSink {
    /// 設定からシンクを作成
    ///
    /// エンドポイント未設定の場合は `None`（シンク無効、エラーではない）。
    /// Tokioランタイム上で呼び出すこと（時間フラッシュ用のタスクを起動する）。
    pub fn from_settings(settings: &SinkSettings) -> Option<Self> {
        let endpoint = settings.endpoint.clone()?;

        let inner = Arc::new(SinkInner {
            name: settings.name.clone(),
            endpoint,
            auth_token: settings.auth_token.clone(),
            headers: settings.headers.clone(),
            batch_size: settings.batch_size.max(1),
            batch_timeout: Duration::from_secs(settings.batch_timeout_secs),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            buffer_cap: settings.buffer_cap.max(1),
            client: reqwest::Client::new(),
            state: Mutex::new(SinkState {
                buffer: VecDeque::new(),
                first_buffered_at: None,
                overflow_warned: false,
            }),
            flush_lock: Mutex::new(()),
            dropped_total: AtomicU64::new(0),
            flushes_completed: AtomicU64::new(0),
        });

        Self::spawn_ticker(&inner);

        Some(Self { inner })
    }

    /// 時間しきい値の監視タスクを起動
    fn spawn_ticker(inner: &Arc<SinkInner>) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break; // シンクが破棄されたら終了
                };
                if inner.time_flush_due().await {
                    let _ = inner.flush_once().await;
                }
            }
        });
    }

    /// 現在バッファされているレコード数
    pub async fn buffered_len(&self) -> usize {
        self.inner.state.lock().await.buffer.len()
    }

    /// 完了したフラッシュの累計
    pub fn flushes_completed(&self) -> u64 {
        self.inner.flushes_completed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LogSink for BatchedHttpSink {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn submit(&self, record: JsonValue) {
        let trigger_flush = {
            let mut state = self.inner.state.lock().await;

            // バッファ上限: 古いレコードから破棄（警告はエピソードごとに1回）
            while state.buffer.len() >= self.inner.buffer_cap {
                state.buffer.pop_front();
                self.inner.dropped_total.fetch_add(1, Ordering::Relaxed);
                if !state.overflow_warned {
                    warn!(
                        "Sink '{}' buffer overflow: dropping oldest records (cap {})",
                        self.inner.name, self.inner.buffer_cap
                    );
                    state.overflow_warned = true;
                }
            }

            state.buffer.push_back(record);
            if state.first_buffered_at.is_none() {
                state.first_buffered_at = Some(Instant::now());
            }

            // 境界ちょうどでのみ発火させる。再送で既にサイズ超過している
            // バッファは時間しきい値の監視タスクが拾う
            state.buffer.len() == self.inner.batch_size
        };

        if trigger_flush {
            // 送信は別タスクで実行し、呼び出し経路をブロックしない
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let _ = inner.flush_once().await;
            });
        }
    }

    async fn flush(&self) -> Result<(), SecurityError> {
        loop {
            if self.inner.state.lock().await.buffer.is_empty() {
                return Ok(());
            }
            self.inner.flush_once().await?;
        }
    }

    fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }
}

impl SinkInner {
    /// 時間しきい値を超過したバッファがあるか
    async fn time_flush_due(&self) -> bool {
        let state = self.state.lock().await;
        match state.first_buffered_at {
            Some(at) => !state.buffer.is_empty() && at.elapsed() >= self.batch_timeout,
            None => false,
        }
    }

    /// 1バッチ分をフラッシュ
    ///
    /// 失敗時はバッチをバッファ先頭へ戻す（投入順を保ったまま）。
    async fn flush_once(&self) -> Result<(), SecurityError> {
        let _serial = self.flush_lock.lock().await;

        let batch: Vec<JsonValue> = {
            let mut state = self.state.lock().await;
            let take = state.buffer.len().min(self.batch_size);
            if take == 0 {
                return Ok(());
            }
            let batch: Vec<JsonValue> = state.buffer.drain(..take).collect();
            state.first_buffered_at = if state.buffer.is_empty() {
                None
            } else {
                Some(Instant::now())
            };
            batch
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.request_timeout)
            .json(&batch);
        if let Some(ref token) = self.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let result = match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(SecurityError::SinkDelivery(format!(
                "sink '{}' rejected batch: HTTP {}",
                self.name,
                response.status()
            ))),
            Err(e) => Err(SecurityError::SinkDelivery(format!(
                "sink '{}' delivery failed: {}",
                self.name, e
            ))),
        };

        match result {
            Ok(()) => {
                self.flushes_completed.fetch_add(1, Ordering::Relaxed);
                debug!("Sink '{}' flushed {} records", self.name, batch.len());
                let mut state = self.state.lock().await;
                state.overflow_warned = false;
                Ok(())
            }
            Err(e) => {
                error!("{}", e);
                // バッチを先頭へ戻して次回フラッシュで再送
                let mut state = self.state.lock().await;
                for record in batch.into_iter().rev() {
                    state.buffer.push_front(record);
                }
                while state.buffer.len() > self.buffer_cap {
                    state.buffer.pop_front();
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    if !state.overflow_warned {
                        warn!(
                            "Sink '{}' buffer overflow after failed flush (cap {})",
                            self.name, self.buffer_cap
                        );
                        state.overflow_warned = true;
                    }
                }
                if state.first_buffered_at.is_none() && !state.buffer.is_empty() {
                    state.first_buffered_at = Some(Instant::now());
                }
                Err(e)
            }
        }
    }
}

impl fmt::Debug for BatchedHttpSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchedHttpSink")
            .field("name", &self.inner.name)
            .field("endpoint", &self.inner.endpoint)
            .field("batch_size", &self.inner.batch_size)
            .field("buffer_cap", &self.inner.buffer_cap)
            .finish()
    }
}

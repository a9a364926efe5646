//! Alert Dispatch
//!
//! 重大イベントの外部通知。ログ書き込み経路とは独立に動作する。
//!
//! 配送はat-most-once（再送キューなし）。Webhook呼び出しの失敗は
//! エラーレベルでログに残すのみで、呼び出し元へは決して伝播しない。

use crate::config::AlertingSettings;
use crate::event::{SecurityEvent, SecurityEventType, Severity};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// アラート履歴の最大保持数
const MAX_HISTORY_SIZE: usize = 1000;

/// 重要度に関わらず常に通知するイベント種別
const ALWAYS_ALERT_TYPES: &[SecurityEventType] = &[
    SecurityEventType::SqlInjectionAttempt,
    SecurityEventType::XssAttempt,
    SecurityEventType::CsrfAttempt,
    SecurityEventType::PrivilegeEscalation,
];

/// 送信済みアラートの記録
#[derive(Debug, Clone, Serialize)]
pub struct DispatchedAlert {
    /// 元イベントのID
    pub event_id: Uuid,
    /// イベント種別
    pub event_type: SecurityEventType,
    /// 重要度
    pub severity: Severity,
    /// リスクスコア
    pub risk_score: Option<u8>,
    /// 送信元IP
    pub ip: Option<IpAddr>,
    /// 送信時刻
    pub dispatched_at: DateTime<Utc>,
    /// Webhook配送に成功したか（Webhook未設定時はfalse）
    pub delivered: bool,
}

/// アラートディスパッチャー
pub struct AlertDispatcher {
    config: AlertingSettings,
    /// 本番相当の環境か（highレベルの通知ゲート）
    production: bool,
    service: String,
    environment: String,
    client: reqwest::Client,
    history: Arc<RwLock<VecDeque<DispatchedAlert>>>,
    dispatched_total: AtomicU64,
}

impl AlertDispatcher {
    /// 新しいディスパッチャーを作成
    pub fn new(
        config: AlertingSettings,
        service: impl Into<String>,
        environment: impl Into<String>,
        production: bool,
    ) -> Self {
        Self {
            config,
            production,
            service: service.into(),
            environment: environment.into(),
            client: reqwest::Client::new(),
            history: Arc::new(RwLock::new(VecDeque::new())),
            dispatched_total: AtomicU64::new(0),
        }
    }

    /// このイベントを通知すべきか判定
    ///
    /// - critical は常に通知
    /// - high は本番相当の環境でのみ通知
    /// - 注入試行等の許可リスト種別は重要度に関わらず通知
    pub fn should_alert(&self, event: &SecurityEvent) -> bool {
        if !self.config.enabled {
            return false;
        }
        if ALWAYS_ALERT_TYPES.contains(&event.event_type) {
            return true;
        }
        match event.severity {
            Severity::Critical => true,
            Severity::High => self.production,
            _ => false,
        }
    }

    /// アラートを送信（ベストエフォート、失敗は伝播しない）
    pub async fn dispatch(&self, event: &SecurityEvent) {
        if !self.config.enabled {
            return;
        }

        self.dispatched_total.fetch_add(1, Ordering::Relaxed);
        self.log_alert(event);

        let delivered = if self.config.realtime {
            self.post_webhook(event).await
        } else {
            false
        };

        let record = DispatchedAlert {
            event_id: event.id,
            event_type: event.event_type,
            severity: event.severity,
            risk_score: event.risk_score,
            ip: event.ip,
            dispatched_at: Utc::now(),
            delivered,
        };

        let mut history = self.history.write().await;
        history.push_back(record);
        while history.len() > MAX_HISTORY_SIZE {
            history.pop_front();
        }
    }

    /// 送信済みアラート数を取得
    pub fn dispatched_total(&self) -> u64 {
        self.dispatched_total.load(Ordering::Relaxed)
    }

    /// アラート履歴を取得（新しい順）
    pub async fn history(&self, limit: Option<usize>) -> Vec<DispatchedAlert> {
        let history = self.history.read().await;
        match limit {
            Some(limit) => history.iter().rev().take(limit).cloned().collect(),
            None => history.iter().rev().cloned().collect(),
        }
    }

    /// 履歴と統計をクリア
    pub async fn reset(&self) {
        self.history.write().await.clear();
        self.dispatched_total.store(0, Ordering::Relaxed);
    }

    /// コンソール（tracing）へのアラート出力
    fn log_alert(&self, event: &SecurityEvent) {
        match event.severity {
            Severity::Critical => error!(
                "🚨 SECURITY ALERT [critical]: {} - {} (risk: {})",
                event.event_type,
                event.message,
                event.risk_score.unwrap_or(0)
            ),
            Severity::High => error!(
                "⚠️  SECURITY ALERT [high]: {} - {} (risk: {})",
                event.event_type,
                event.message,
                event.risk_score.unwrap_or(0)
            ),
            _ => warn!(
                "SECURITY ALERT [{}]: {} - {}",
                event.severity, event.event_type, event.message
            ),
        }
    }

    /// Webhookへ単発のHTTP POSTを実行
    ///
    /// タイムアウト超過は失敗として扱う。失敗してもリトライしない。
    async fn post_webhook(&self, event: &SecurityEvent) -> bool {
        let Some(ref url) = self.config.webhook_url else {
            // Webhook未設定はエラーではなく単にスキップ
            return false;
        };

        let payload = serde_json::json!({
            "alert": "security_event",
            "service": self.service,
            "environment": self.environment,
            "event_id": event.id,
            "event_type": event.event_type,
            "severity": event.severity,
            "message": event.message,
            "risk_score": event.risk_score,
            "risk_factors": event.risk_factors,
            "source_ip": event.ip.map(|ip| ip.to_string()),
            "user_id": event.user_id,
            "correlation_id": event.correlation_id,
            "timestamp": event.timestamp,
        });

        let result = self
            .client
            .post(url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!("Sent alert webhook for event {}", event.id);
                true
            }
            Ok(response) => {
                error!(
                    "Alert webhook rejected for event {}: HTTP {}",
                    event.id,
                    response.status()
                );
                false
            }
            Err(e) => {
                error!("Alert webhook failed for event {}: {}", event.id, e);
                false
            }
        }
    }
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("enabled", &self.config.enabled)
            .field("production", &self.production)
            .field("webhook_configured", &self.config.webhook_url.is_some())
            .finish()
    }
}

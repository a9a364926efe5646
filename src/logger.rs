//! Security Logger
//!
//! セキュリティイベント取り込みパイプラインのファサード。
//!
//! 各ロギングメソッドは型付きパラメータから整形済みイベントを構築し、
//! タイムスタンプと相関IDを刻印した上で、カウンター更新 → リスク
//! スコアリング → パターン分析 → スクラブ → チャネル/シンク書き込み
//! → アラート判定の順にパイプラインへ流す。
//!
//! このファサードは呼び出し元へ決して例外を伝播しない。内部障害は
//! すべてここで回収され、tracing経由で自己記録される。

use crate::alert::{AlertDispatcher, DispatchedAlert};
use crate::config::SecLogConfig;
use crate::correlation::RequestContext;
use crate::error::{Error, Result};
use crate::event::{
    AuditEvent, DataAccessEvent, DataOperation, Outcome, SecurityEvent, SecurityEventType,
    Severity,
};
use crate::logging::{apply_retention_policy, FileChannels};
use crate::masking::{default_sensitive_keys, DataScrubber, MaskingConfig};
use crate::pattern::AttackPatternAnalyzer;
use crate::risk::{RiskScorer, RiskScorerConfig, RiskStatistics};
use crate::transport::{BatchedHttpSink, LogSink};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// インメモリで保持する直近イベントの上限
const MAX_RECENT_EVENTS: usize = 10_000;

/// イベント検索のフィルター条件
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// 開始時刻
    pub start_time: Option<DateTime<Utc>>,
    /// 終了時刻
    pub end_time: Option<DateTime<Utc>>,
    /// 最低重要度
    pub min_severity: Option<Severity>,
    /// イベント種別
    pub event_types: Option<Vec<SecurityEventType>>,
    /// ユーザーID
    pub user_id: Option<String>,
    /// 送信元IP
    pub ip: Option<IpAddr>,
    /// メッセージの検索キーワード
    pub keyword: Option<String>,
}

/// 統計スナップショット
#[derive(Debug, Clone, Serialize, Default)]
pub struct SecurityStatistics {
    /// 処理したセキュリティイベント総数
    pub total_events: u64,
    /// 重要度別イベント数
    pub events_by_severity: HashMap<Severity, u64>,
    /// 種別別イベント数
    pub events_by_type: HashMap<SecurityEventType, u64>,
    /// 監査イベント総数
    pub audit_events: u64,
    /// 最後のイベントのタイムスタンプ
    pub last_event_time: Option<DateTime<Utc>>,
    /// カウンター・キャッシュ状態
    pub risk: RiskStatistics,
    /// 送信したアラート数
    pub alerts_dispatched: u64,
    /// シンクバッファ超過で破棄されたレコード数
    pub sink_records_dropped: u64,
}

/// 集計カウンター
#[derive(Debug, Default)]
struct LoggerTotals {
    total_events: u64,
    events_by_severity: HashMap<Severity, u64>,
    events_by_type: HashMap<SecurityEventType, u64>,
    audit_events: u64,
    last_event_time: Option<DateTime<Utc>>,
}

/// セキュリティロガー
///
/// カウンター・キャッシュ・バッファ等の可変状態はこのインスタンスが
/// 排他的に所有する。テスト用に独立したインスタンスを複数生成でき、
/// インスタンス間で状態は共有されない。
#[derive(Debug)]
pub struct SecurityLogger {
    config: SecLogConfig,
    scrubber: DataScrubber,
    scorer: RiskScorer,
    analyzer: AttackPatternAnalyzer,
    dispatcher: Arc<AlertDispatcher>,
    channels: FileChannels,
    sinks: Vec<Arc<dyn LogSink>>,
    recent: Arc<RwLock<VecDeque<SecurityEvent>>>,
    recent_audit: Arc<RwLock<VecDeque<AuditEvent>>>,
    totals: Arc<RwLock<LoggerTotals>>,
}

impl SecurityLogger {
    /// 設定からロガーを作成
    ///
    /// Tokioランタイム上で呼び出すこと（シンクの時間フラッシュ用
    /// タスクを起動する）。
    pub async fn new(config: SecLogConfig) -> Result<Self> {
        let mut sensitive_keys = default_sensitive_keys();
        sensitive_keys.extend(config.masking.extra_sensitive_keys.iter().cloned());
        let scrubber = DataScrubber::new(MaskingConfig {
            enabled: config.masking.enabled,
            sensitive_keys,
        });

        let scorer_config = RiskScorerConfig::from_settings(&config.risk);
        let analyzer = AttackPatternAnalyzer::new(
            config.risk.pattern_threshold,
            Duration::seconds(config.risk.counter_ttl_secs as i64),
        );

        let dispatcher = Arc::new(AlertDispatcher::new(
            config.alerting.clone(),
            config.service.clone(),
            config.environment.clone(),
            config.is_production(),
        ));

        let channels =
            FileChannels::new(&config.channels).map_err(|e| Error::Config(e.to_string()))?;

        // 起動時に保持ポリシーを適用（失敗しても起動は継続）
        if config.channels.file_enabled {
            if let Err(e) = apply_retention_policy(&config.channels) {
                warn!("Retention policy application failed: {}", e);
            }
        } else if config.compliance_mode {
            warn!("Compliance mode is enabled but file channels are off; audit records are not durably stored");
        }

        let sinks: Vec<Arc<dyn LogSink>> = config
            .sinks
            .iter()
            .filter_map(BatchedHttpSink::from_settings)
            .map(|sink| Arc::new(sink) as Arc<dyn LogSink>)
            .collect();

        if !sinks.is_empty() {
            info!("Security logger initialized with {} external sink(s)", sinks.len());
        }

        Ok(Self {
            scorer: RiskScorer::new(scorer_config),
            scrubber,
            analyzer,
            dispatcher,
            channels,
            sinks,
            recent: Arc::new(RwLock::new(VecDeque::new())),
            recent_audit: Arc::new(RwLock::new(VecDeque::new())),
            totals: Arc::new(RwLock::new(LoggerTotals::default())),
            config,
        })
    }

    /// デフォルト設定でロガーを作成
    pub async fn with_defaults() -> Result<Self> {
        Self::new(SecLogConfig::default()).await
    }

    /// 設定を取得
    pub fn config(&self) -> &SecLogConfig {
        &self.config
    }

    /// 汎用のセキュリティイベント記録
    ///
    /// 呼び出し側が指定した重要度はスコアラー導出値で上書きされる。
    pub async fn log_security_event(&self, event: SecurityEvent, ctx: Option<&RequestContext>) {
        self.process(event, ctx, false, None).await;
    }

    /// 認証成功を記録
    pub async fn log_authentication_success(
        &self,
        user_id: &str,
        ip: IpAddr,
        user_agent: &str,
        method: Option<&str>,
        metadata: Option<JsonValue>,
        ctx: Option<&RequestContext>,
    ) {
        let event = SecurityEvent::new(
            SecurityEventType::AuthenticationSuccess,
            Severity::Low,
            format!("User authentication successful: {}", user_id),
        )
        .with_user(user_id)
        .with_request_info(ip, user_agent)
        .with_outcome(Outcome::Success)
        .with_details(json!({
            "method": method,
            "metadata": metadata.unwrap_or(JsonValue::Null),
        }));

        self.process(event, ctx, false, None).await;
    }

    /// 認証失敗を記録
    pub async fn log_authentication_failure(
        &self,
        user_id: &str,
        ip: IpAddr,
        user_agent: &str,
        reason: &str,
        metadata: Option<JsonValue>,
        ctx: Option<&RequestContext>,
    ) {
        let event = SecurityEvent::new(
            SecurityEventType::AuthenticationFailure,
            Severity::Medium,
            format!("User authentication failed: {}", user_id),
        )
        .with_user(user_id)
        .with_request_info(ip, user_agent)
        .with_outcome(Outcome::Failure)
        .with_details(json!({
            "reason": reason,
            "metadata": metadata.unwrap_or(JsonValue::Null),
        }));

        self.process(event, ctx, false, None).await;
    }

    /// 認可失敗を記録
    pub async fn log_authorization_failure(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
        ip: IpAddr,
        metadata: Option<JsonValue>,
        ctx: Option<&RequestContext>,
    ) {
        let mut event = SecurityEvent::new(
            SecurityEventType::AuthorizationFailure,
            Severity::Medium,
            format!("Authorization denied: {} on {}", user_id, resource),
        )
        .with_user(user_id)
        .with_action(resource, action)
        .with_outcome(Outcome::Failure)
        .with_details(json!({
            "metadata": metadata.unwrap_or(JsonValue::Null),
        }));
        event.ip = Some(ip);

        self.process(event, ctx, false, None).await;
    }

    /// 疑わしい活動を記録
    pub async fn log_suspicious_activity(
        &self,
        description: &str,
        ip: IpAddr,
        user_agent: &str,
        severity: Option<Severity>,
        metadata: Option<JsonValue>,
        ctx: Option<&RequestContext>,
    ) {
        let event = SecurityEvent::new(
            SecurityEventType::SuspiciousActivity,
            severity.unwrap_or(Severity::Medium),
            format!("Suspicious activity: {}", description),
        )
        .with_request_info(ip, user_agent)
        .with_details(json!({
            "metadata": metadata.unwrap_or(JsonValue::Null),
        }));

        self.process(event, ctx, false, None).await;
    }

    /// SQLインジェクション試行を記録
    ///
    /// ペイロードは保存前に設定上限（既定500文字）へ切り詰める。
    pub async fn log_sql_injection_attempt(
        &self,
        ip: IpAddr,
        user_agent: &str,
        payload: &str,
        endpoint: &str,
        metadata: Option<JsonValue>,
        ctx: Option<&RequestContext>,
    ) {
        let event = SecurityEvent::new(
            SecurityEventType::SqlInjectionAttempt,
            Severity::Critical,
            format!("SQL injection attempt detected at {}", endpoint),
        )
        .with_request_info(ip, user_agent)
        .with_outcome(Outcome::Blocked)
        .with_details(json!({
            "payload": self.truncate_payload(payload),
            "endpoint": endpoint,
            "metadata": metadata.unwrap_or(JsonValue::Null),
        }));

        self.process(event, ctx, false, None).await;
    }

    /// XSS試行を記録
    ///
    /// ペイロードは保存前に設定上限（既定500文字）へ切り詰める。
    pub async fn log_xss_attempt(
        &self,
        ip: IpAddr,
        user_agent: &str,
        payload: &str,
        endpoint: &str,
        metadata: Option<JsonValue>,
        ctx: Option<&RequestContext>,
    ) {
        let event = SecurityEvent::new(
            SecurityEventType::XssAttempt,
            Severity::High,
            format!("XSS attempt detected at {}", endpoint),
        )
        .with_request_info(ip, user_agent)
        .with_outcome(Outcome::Blocked)
        .with_details(json!({
            "payload": self.truncate_payload(payload),
            "endpoint": endpoint,
            "metadata": metadata.unwrap_or(JsonValue::Null),
        }));

        self.process(event, ctx, false, None).await;
    }

    /// レート制限超過を記録
    pub async fn log_rate_limit_exceeded(
        &self,
        ip: IpAddr,
        user_agent: &str,
        endpoint: &str,
        request_count: u64,
        time_window_secs: u64,
        metadata: Option<JsonValue>,
        ctx: Option<&RequestContext>,
    ) {
        let event = SecurityEvent::new(
            SecurityEventType::RateLimitExceeded,
            Severity::Medium,
            format!(
                "Rate limit exceeded at {}: {} requests in {}s",
                endpoint, request_count, time_window_secs
            ),
        )
        .with_request_info(ip, user_agent)
        .with_outcome(Outcome::Blocked)
        .with_details(json!({
            "endpoint": endpoint,
            "request_count": request_count,
            "time_window_secs": time_window_secs,
            "metadata": metadata.unwrap_or(JsonValue::Null),
        }));

        self.process(event, ctx, false, None).await;
    }

    /// 機密データアクセスを記録
    ///
    /// リスクスコアリング用のセキュリティイベントと、コンプライアンス
    /// 用の監査イベントの両方を必ず生成する。監査記録は計算された
    /// 重要度に関わらず行われる。
    pub async fn log_data_access(&self, access: DataAccessEvent, ctx: Option<&RequestContext>) {
        // 大量レコードの破壊的操作は取り込み時点で重要度の下限を引き上げる
        let destructive = matches!(access.operation, DataOperation::Delete | DataOperation::Export);
        let severity_floor = if destructive && access.record_count > 100 {
            Some(Severity::High)
        } else if destructive {
            Some(Severity::Medium)
        } else {
            None
        };

        let mut event = SecurityEvent::new(
            SecurityEventType::DataAccess,
            severity_floor.unwrap_or(Severity::Low),
            format!(
                "Data access: {} {} ({} records)",
                access.operation, access.data_type, access.record_count
            ),
        )
        .with_user(&access.user_id)
        .with_action(&access.data_type, access.operation.to_string())
        .with_details(json!({
            "data_type": access.data_type,
            "operation": access.operation,
            "record_count": access.record_count,
            "metadata": access.metadata.clone(),
        }));
        event.ip = access.ip;

        self.process(event, ctx, false, severity_floor).await;

        let audit = AuditEvent::new(
            "data_access",
            &access.user_id,
            &access.data_type,
            access.operation.to_string(),
            Outcome::Success,
        )
        .with_metadata(json!({
            "record_count": access.record_count,
            "metadata": access.metadata,
        }));

        self.log_audit_event(audit, ctx).await;
    }

    /// 監査イベントを記録
    ///
    /// 監査チャネルは重要度でフィルターしない（常にinfoで記録）。
    pub async fn log_audit_event(&self, mut event: AuditEvent, ctx: Option<&RequestContext>) {
        if !self.config.enabled {
            return;
        }

        if event.correlation_id.is_none() {
            if let Some(ctx) = ctx {
                event.correlation_id = Some(ctx.correlation_id.clone());
            }
        }

        if self.config.masking.enabled && !event.metadata.is_null() {
            event.metadata = self.scrubber.scrub(&event.metadata);
        }

        self.write_audit(&event).await;

        {
            let mut totals = self.totals.write().await;
            totals.audit_events += 1;
        }

        let mut recent = self.recent_audit.write().await;
        recent.push_back(event);
        while recent.len() > MAX_RECENT_EVENTS {
            recent.pop_front();
        }
    }

    /// 統計スナップショットを取得
    pub async fn get_statistics(&self) -> SecurityStatistics {
        let totals = self.totals.read().await;
        SecurityStatistics {
            total_events: totals.total_events,
            events_by_severity: totals.events_by_severity.clone(),
            events_by_type: totals.events_by_type.clone(),
            audit_events: totals.audit_events,
            last_event_time: totals.last_event_time,
            risk: self.scorer.statistics().await,
            alerts_dispatched: self.dispatcher.dispatched_total(),
            sink_records_dropped: self.sinks.iter().map(|s| s.dropped_total()).sum(),
        }
    }

    /// インメモリ状態（カウンター・キャッシュ・履歴・集計）をクリア
    pub async fn reset(&self) {
        self.scorer.reset().await;
        self.analyzer.reset().await;
        self.dispatcher.reset().await;
        self.recent.write().await.clear();
        self.recent_audit.write().await.clear();
        *self.totals.write().await = LoggerTotals::default();
    }

    /// 直近のセキュリティイベントを取得（新しい順）
    pub async fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        let recent = self.recent.read().await;
        recent.iter().rev().take(limit).cloned().collect()
    }

    /// 直近の監査イベントを取得（新しい順）
    pub async fn recent_audit_events(&self, limit: usize) -> Vec<AuditEvent> {
        let recent = self.recent_audit.read().await;
        recent.iter().rev().take(limit).cloned().collect()
    }

    /// フィルター条件でイベントを検索
    pub async fn search(&self, filter: EventFilter) -> Vec<SecurityEvent> {
        let recent = self.recent.read().await;
        recent
            .iter()
            .filter(|event| matches_filter(event, &filter))
            .cloned()
            .collect()
    }

    /// アラート履歴を取得（新しい順）
    pub async fn alert_history(&self, limit: Option<usize>) -> Vec<DispatchedAlert> {
        self.dispatcher.history(limit).await
    }

    /// 全シンクのバッファを送信（シャットダウン時用）
    pub async fn flush_sinks(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.flush().await.map_err(Error::Security)?;
        }
        Ok(())
    }

    /// 取り込みパイプライン本体
    ///
    /// `from_analyzer` が真の合成イベントはパターン分析を再実行しない
    /// （無限再帰の抑止）。`severity_floor` は導出重要度の下限
    /// （データアクセス規則・合成イベントで使用）。
    fn process<'a>(
        &'a self,
        mut event: SecurityEvent,
        ctx: Option<&'a RequestContext>,
        from_analyzer: bool,
        severity_floor: Option<Severity>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if !self.config.enabled {
                return;
            }

            // 相関IDを刻印（イベント側の値が優先）
            if event.correlation_id.is_none() {
                if let Some(ctx) = ctx {
                    event.correlation_id = Some(ctx.correlation_id.clone());
                    if event.session_id.is_none() {
                        event.session_id = ctx.session_id.clone();
                    }
                }
            }

            // カウンター更新を含むリスク評価。導出重要度が呼び出し側の
            // 指定を上書きする
            let assessment = self.scorer.score(&event).await;
            event.risk_score = Some(assessment.score);
            event.risk_factors = assessment.factors;
            event.severity = match severity_floor {
                Some(floor) => assessment.severity.max(floor),
                None => assessment.severity,
            };

            // パターン分析。合成イベントはパイプラインを通常どおり
            // 通過するが、分析自体は再実行されない
            if !from_analyzer {
                if let Some(ip) = event.ip {
                    let ip_count = self.scorer.ip_count(&ip).await;
                    if let Some(synthetic) = self.analyzer.check(&event, ip_count).await {
                        self.process(synthetic, ctx, true, Some(Severity::Critical))
                            .await;
                    }
                }
            }

            // 永続化前にメタデータをスクラブ
            if self.config.masking.enabled && !event.details.is_null() {
                event.details = self.scrubber.scrub(&event.details);
            }

            self.write_security(&event).await;

            // アラートはログ書き込みとは独立の経路で、呼び出し元を
            // ブロックせずに送信する
            if self.dispatcher.should_alert(&event) {
                let dispatcher = Arc::clone(&self.dispatcher);
                let alert_event = event.clone();
                tokio::spawn(async move {
                    dispatcher.dispatch(&alert_event).await;
                });
            }

            self.record_security(event).await;
        })
    }

    /// セキュリティチャネルへ書き込み
    async fn write_security(&self, event: &SecurityEvent) {
        let level = match event.severity {
            Severity::Critical | Severity::High => "error",
            _ => "warn",
        };

        let record = match self.format_record(event, "security", level) {
            Ok(record) => record,
            Err(e) => {
                error!("Failed to serialize security event {}: {}", event.id, e);
                return;
            }
        };

        if self.config.channels.console_enabled {
            match event.severity {
                Severity::Critical | Severity::High => error!(
                    "[security] {} {} (risk: {})",
                    event.event_type,
                    event.message,
                    event.risk_score.unwrap_or(0)
                ),
                Severity::Medium => warn!(
                    "[security] {} {} (risk: {})",
                    event.event_type,
                    event.message,
                    event.risk_score.unwrap_or(0)
                ),
                Severity::Low => info!("[security] {} {}", event.event_type, event.message),
            }
        }

        let line = record.to_string();
        if let Some(ref channel) = self.channels.security {
            channel.write_line(&line);
        }
        if level == "error" {
            if let Some(ref channel) = self.channels.security_error {
                channel.write_line(&line);
            }
        }

        for sink in &self.sinks {
            sink.submit(record.clone()).await;
        }
    }

    /// 監査チャネルへ書き込み
    async fn write_audit(&self, event: &AuditEvent) {
        let record = match serde_json::to_value(event) {
            Ok(JsonValue::Object(mut map)) => {
                map.insert("level".to_string(), json!("info"));
                map.insert("category".to_string(), json!("audit"));
                map.insert("service".to_string(), json!(self.config.service));
                map.insert("environment".to_string(), json!(self.config.environment));
                JsonValue::Object(map)
            }
            _ => {
                error!("Failed to serialize audit event {}", event.id);
                return;
            }
        };

        if self.config.channels.console_enabled {
            info!(
                "[audit] {} {} {} - {}",
                event.actor, event.action, event.resource, event.outcome
            );
        }

        if let Some(ref channel) = self.channels.audit {
            channel.write_line(&record.to_string());
        }

        for sink in &self.sinks {
            sink.submit(record.clone()).await;
        }
    }

    /// 構造化ログレコード（1行1 JSONオブジェクト）を生成
    fn format_record(&self, event: &SecurityEvent, category: &str, level: &str) -> Result<JsonValue> {
        match serde_json::to_value(event)? {
            JsonValue::Object(mut map) => {
                map.insert("level".to_string(), json!(level));
                map.insert("category".to_string(), json!(category));
                map.insert("service".to_string(), json!(self.config.service));
                map.insert("environment".to_string(), json!(self.config.environment));
                Ok(JsonValue::Object(map))
            }
            _ => Err(Error::Internal(
                "security event did not serialize to an object".to_string(),
            )),
        }
    }

    /// イベントを履歴と集計へ反映
    async fn record_security(&self, event: SecurityEvent) {
        {
            let mut totals = self.totals.write().await;
            totals.total_events += 1;
            *totals.events_by_severity.entry(event.severity).or_insert(0) += 1;
            *totals.events_by_type.entry(event.event_type).or_insert(0) += 1;
            totals.last_event_time = Some(event.timestamp);
        }

        let mut recent = self.recent.write().await;
        recent.push_back(event);
        while recent.len() > MAX_RECENT_EVENTS {
            recent.pop_front();
        }
    }

    /// ペイロードを設定上限へ切り詰める（文字境界で安全に）
    fn truncate_payload(&self, payload: &str) -> String {
        let max = self.config.masking.max_payload_length;
        if payload.chars().count() <= max {
            payload.to_string()
        } else {
            payload.chars().take(max).collect()
        }
    }
}

/// フィルター条件にマッチするかチェック
fn matches_filter(event: &SecurityEvent, filter: &EventFilter) -> bool {
    if let Some(start) = filter.start_time {
        if event.timestamp < start {
            return false;
        }
    }
    if let Some(end) = filter.end_time {
        if event.timestamp > end {
            return false;
        }
    }
    if let Some(min) = filter.min_severity {
        if event.severity < min {
            return false;
        }
    }
    if let Some(ref types) = filter.event_types {
        if !types.contains(&event.event_type) {
            return false;
        }
    }
    if let Some(ref user_id) = filter.user_id {
        if event.user_id.as_ref() != Some(user_id) {
            return false;
        }
    }
    if let Some(ip) = filter.ip {
        if event.ip != Some(ip) {
            return false;
        }
    }
    if let Some(ref keyword) = filter.keyword {
        let keyword = keyword.to_lowercase();
        if !event.message.to_lowercase().contains(&keyword) {
            return false;
        }
    }
    true
}

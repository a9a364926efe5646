//! Security / Audit Event Types
//!
//! セキュリティイベントと監査イベントの型定義

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// セキュリティイベントの種別
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    /// 認証成功
    AuthenticationSuccess,
    /// 認証失敗
    AuthenticationFailure,
    /// 認可失敗
    AuthorizationFailure,
    /// 疑わしい活動
    SuspiciousActivity,
    /// SQLインジェクション試行
    SqlInjectionAttempt,
    /// XSS試行
    XssAttempt,
    /// CSRF試行
    CsrfAttempt,
    /// 権限昇格試行
    PrivilegeEscalation,
    /// レート制限超過
    RateLimitExceeded,
    /// データアクセス
    DataAccess,
    /// 設定変更
    ConfigChange,
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityEventType::AuthenticationSuccess => "authentication_success",
            SecurityEventType::AuthenticationFailure => "authentication_failure",
            SecurityEventType::AuthorizationFailure => "authorization_failure",
            SecurityEventType::SuspiciousActivity => "suspicious_activity",
            SecurityEventType::SqlInjectionAttempt => "sql_injection_attempt",
            SecurityEventType::XssAttempt => "xss_attempt",
            SecurityEventType::CsrfAttempt => "csrf_attempt",
            SecurityEventType::PrivilegeEscalation => "privilege_escalation",
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::DataAccess => "data_access",
            SecurityEventType::ConfigChange => "config_change",
        };
        write!(f, "{}", s)
    }
}

/// 重要度レベル
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// 低
    #[default]
    Low,
    /// 中
    Medium,
    /// 高
    High,
    /// 緊急
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// イベント結果
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// 成功
    Success,
    /// 失敗
    Failure,
    /// ブロック済み
    Blocked,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
            Outcome::Blocked => write!(f, "blocked"),
        }
    }
}

/// セキュリティイベント
///
/// リスクスコアはスコアラー通過後に必ず設定される。呼び出し側が
/// 指定した重要度はスコアラー導出値で上書きされる。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// 一意の識別子
    pub id: Uuid,
    /// イベント種別
    pub event_type: SecurityEventType,
    /// 重要度（導出値で上書きされる）
    pub severity: Severity,
    /// イベントの説明（秘匿情報を含まないこと）
    pub message: String,
    /// ユーザーID
    pub user_id: Option<String>,
    /// 送信元IP
    pub ip: Option<IpAddr>,
    /// ユーザーエージェント
    pub user_agent: Option<String>,
    /// セッションID
    pub session_id: Option<String>,
    /// 対象リソース
    pub resource: Option<String>,
    /// 実行されたアクション
    pub action: Option<String>,
    /// 結果
    pub outcome: Outcome,
    /// イベント固有のメタデータ（永続化前にスクラバーを通過する）
    pub details: JsonValue,
    /// タイムスタンプ（UTC、取り込み時点）
    pub timestamp: DateTime<Utc>,
    /// 相関ID（取り込み時にコンテキストから伝搬）
    pub correlation_id: Option<String>,
    /// リスクスコア（0〜100、スコアラーが付与）
    pub risk_score: Option<u8>,
    /// スコアに寄与した要因タグ
    pub risk_factors: Vec<String>,
}

impl SecurityEvent {
    /// 新しいセキュリティイベントを作成
    pub fn new(event_type: SecurityEventType, severity: Severity, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            severity,
            message,
            user_id: None,
            ip: None,
            user_agent: None,
            session_id: None,
            resource: None,
            action: None,
            outcome: Outcome::Success,
            details: JsonValue::Null,
            timestamp: Utc::now(),
            correlation_id: None,
            risk_score: None,
            risk_factors: Vec::new(),
        }
    }

    /// ユーザー情報を設定
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// リクエスト情報を設定
    pub fn with_request_info(mut self, ip: IpAddr, user_agent: impl Into<String>) -> Self {
        self.ip = Some(ip);
        self.user_agent = Some(user_agent.into());
        self
    }

    /// リソースとアクションを設定
    pub fn with_action(mut self, resource: impl Into<String>, action: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self.action = Some(action.into());
        self
    }

    /// 結果を設定
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// メタデータを設定
    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }
}

/// 監査イベント
///
/// コンプライアンス記録。追記専用であり、書き込み後の変更・削除は
/// 行わない（長期保持はストレージ側ポリシーで担保する）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// 一意の識別子
    pub id: Uuid,
    /// イベント種別（自由形式、例: "data_access", "config_change"）
    pub event_type: String,
    /// 操作主体（ユーザーID等）
    pub actor: String,
    /// 対象リソース
    pub resource: String,
    /// 実行されたアクション
    pub action: String,
    /// 結果
    pub outcome: Outcome,
    /// タイムスタンプ（UTC）
    pub timestamp: DateTime<Utc>,
    /// 相関ID
    pub correlation_id: Option<String>,
    /// 追加のメタデータ
    pub metadata: JsonValue,
}

impl AuditEvent {
    /// 新しい監査イベントを作成
    pub fn new(
        event_type: impl Into<String>,
        actor: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            actor: actor.into(),
            resource: resource.into(),
            action: action.into(),
            outcome,
            timestamp: Utc::now(),
            correlation_id: None,
            metadata: JsonValue::Null,
        }
    }

    /// メタデータを設定
    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// データ操作の種別
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataOperation {
    /// 読み取り
    Read,
    /// 書き込み
    Write,
    /// 削除
    Delete,
    /// エクスポート
    Export,
}

impl fmt::Display for DataOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataOperation::Read => write!(f, "read"),
            DataOperation::Write => write!(f, "write"),
            DataOperation::Delete => write!(f, "delete"),
            DataOperation::Export => write!(f, "export"),
        }
    }
}

/// 機密データアクセスイベント
///
/// 一回の呼び出しからセキュリティイベント（リスクスコアリング用）と
/// 監査イベント（コンプライアンス用）の両方が生成される。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataAccessEvent {
    /// 操作したユーザーID
    pub user_id: String,
    /// データ種別（例: "profile", "payment"）
    pub data_type: String,
    /// 操作種別
    pub operation: DataOperation,
    /// 対象レコード数
    pub record_count: u64,
    /// 送信元IP
    pub ip: Option<IpAddr>,
    /// 追加のメタデータ
    pub metadata: JsonValue,
}

impl DataAccessEvent {
    /// 新しいデータアクセスイベントを作成
    pub fn new(
        user_id: impl Into<String>,
        data_type: impl Into<String>,
        operation: DataOperation,
        record_count: u64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            data_type: data_type.into(),
            operation,
            record_count,
            ip: None,
            metadata: JsonValue::Null,
        }
    }

    /// 送信元IPを設定
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// メタデータを設定
    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

//! Configuration
//!
//! パイプライン全体の設定。デフォルト値 → TOMLファイル → 環境変数
//! （SECLOG_ プレフィックス）の順で上書きされる。
//!
//! 外部シンクは接続設定（エンドポイント）の存在によって個別に有効化
//! される。必須設定が無いシンクはエラーにせず単に無効として扱う。

use serde::{Deserialize, Serialize};

/// セキュリティロギングパイプラインの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecLogConfig {
    /// パイプライン全体の有効フラグ
    pub enabled: bool,
    /// サービス名（全ログ行に刻印される）
    pub service: String,
    /// 実行環境（"production" でアラートポリシーが厳格化）
    pub environment: String,
    /// コンソール診断ログのレベル (trace, debug, info, warn, error)
    pub level: String,
    /// コンプライアンスモード（監査チャネルを必須化）
    pub compliance_mode: bool,
    /// マスキング設定
    pub masking: MaskingSettings,
    /// リスクスコアリング設定
    pub risk: RiskSettings,
    /// ログチャネル設定
    pub channels: ChannelSettings,
    /// アラート設定
    pub alerting: AlertingSettings,
    /// 外部シンク設定
    pub sinks: Vec<SinkSettings>,
}

impl Default for SecLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service: "seclog".to_string(),
            environment: "development".to_string(),
            level: "warn".to_string(),
            compliance_mode: false,
            masking: MaskingSettings::default(),
            risk: RiskSettings::default(),
            channels: ChannelSettings::default(),
            alerting: AlertingSettings::default(),
            sinks: Vec::new(),
        }
    }
}

/// マスキング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingSettings {
    /// 機密データマスキング有効フラグ
    pub enabled: bool,
    /// 機密フィールド名の追加（既定リストに加算される）
    pub extra_sensitive_keys: Vec<String>,
    /// 攻撃ペイロードの保存上限（文字数）
    pub max_payload_length: usize,
}

impl Default for MaskingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_sensitive_keys: Vec::new(),
            max_payload_length: 500,
        }
    }
}

/// リスクスコアリング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    /// 同一IPの繰り返し加点が始まるしきい値
    pub repeat_threshold: u64,
    /// 繰り返し1回あたりの加点
    pub repeat_step: u32,
    /// 繰り返し加点の上限
    pub repeat_cap: u32,
    /// カウンターの失効ウィンドウ（秒）
    pub counter_ttl_secs: u64,
    /// スコアキャッシュのTTL（秒）
    pub cache_ttl_secs: u64,
    /// 攻撃パターン判定のしきい値（同一IPイベント数）
    pub pattern_threshold: u64,
    /// 信頼済み（内部）ネットワークのCIDR一覧
    pub trusted_networks: Vec<String>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            repeat_threshold: 5,
            repeat_step: 5,
            repeat_cap: 30,
            counter_ttl_secs: 3600, // 1時間
            cache_ttl_secs: 300,    // 5分
            pattern_threshold: 10,
            trusted_networks: vec![
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
                "127.0.0.0/8".to_string(),
            ],
        }
    }
}

/// ログチャネル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// ログディレクトリ
    pub log_dir: String,
    /// コンソール出力有効
    pub console_enabled: bool,
    /// ファイル出力有効
    pub file_enabled: bool,
    /// ローテーション (daily, hourly, never)
    pub rotation: String,
    /// セキュリティログの保持日数
    pub security_retention_days: u32,
    /// 監査ログの保持日数（規制要件により年単位）
    pub audit_retention_days: u32,
    /// 保存時暗号化フラグ（ストレージ層へ伝える。このクレート自身は
    /// 暗号化を行わない）
    pub encrypt_logs: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            console_enabled: true,
            file_enabled: false,
            rotation: "daily".to_string(),
            security_retention_days: 90,
            audit_retention_days: 2555, // 約7年
            encrypt_logs: false,
        }
    }
}

/// アラート設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingSettings {
    /// アラート有効フラグ
    pub enabled: bool,
    /// 通知先WebhookURL（未設定時はアラート送信をスキップ）
    pub webhook_url: Option<String>,
    /// Webhook呼び出しのタイムアウト（秒）
    pub timeout_secs: u64,
    /// リアルタイム通知（falseの場合はログ記録のみ）
    pub realtime: bool,
}

impl Default for AlertingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            timeout_secs: 5,
            realtime: true,
        }
    }
}

/// 外部シンク設定
///
/// エンドポイントが設定されているシンクのみ有効となる。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    /// シンク名（ログ・統計での識別用）
    pub name: String,
    /// 送信先エンドポイントURL
    pub endpoint: Option<String>,
    /// 認証トークン（Authorization: Bearer ヘッダーに設定）
    pub auth_token: Option<String>,
    /// 追加のHTTPヘッダー
    pub headers: std::collections::HashMap<String, String>,
    /// バッチサイズ
    pub batch_size: usize,
    /// バッチ送信の時間しきい値（秒）
    pub batch_timeout_secs: u64,
    /// HTTPリクエストのタイムアウト（秒）
    pub request_timeout_secs: u64,
    /// バッファ上限（超過時は古いレコードから破棄）
    pub buffer_cap: usize,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            endpoint: None,
            auth_token: None,
            headers: std::collections::HashMap::new(),
            batch_size: 100,
            batch_timeout_secs: 5,
            request_timeout_secs: 10,
            buffer_cap: 1000,
        }
    }
}

impl SinkSettings {
    /// このシンクが有効か（エンドポイントの存在で判定）
    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }
}

impl SecLogConfig {
    /// 設定ファイルから読み込み、環境変数で上書き
    pub fn load() -> Result<Self, crate::error::Error> {
        let mut settings = config::Config::builder();

        // デフォルト値を設定
        let default_config = SecLogConfig::default();
        settings = settings.add_source(
            config::Config::try_from(&default_config)
                .map_err(|e| crate::error::Error::Config(e.to_string()))?,
        );

        // 設定ファイルを読み込み（複数の場所を試行）
        let config_paths = ["seclog.toml", "config/seclog.toml"];
        for path in &config_paths {
            if std::path::Path::new(path).exists() {
                settings = settings.add_source(config::File::with_name(path));
                break;
            }
        }

        // 環境変数で上書き (SECLOG_で始まる変数)
        settings = settings.add_source(
            config::Environment::with_prefix("SECLOG")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: SecLogConfig = settings
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;

        // 個別の環境変数にも対応（後方互換性）
        if let Ok(url) = std::env::var("SECURITY_WEBHOOK_URL") {
            config.alerting.webhook_url = Some(url);
        }
        if let Ok(env) = std::env::var("SECLOG_ENVIRONMENT") {
            config.environment = env;
        }

        Ok(config)
    }

    /// 本番相当の環境か
    pub fn is_production(&self) -> bool {
        self.environment == "production" || self.environment == "staging"
    }

    /// サンプル設定ファイルを生成
    pub fn generate_sample_config() -> Result<String, crate::error::Error> {
        let mut sample = SecLogConfig::default();
        sample.environment = "production".to_string();
        sample.channels.file_enabled = true;
        sample.alerting.webhook_url = Some("https://hooks.example.com/security".to_string());
        sample.sinks = vec![SinkSettings {
            name: "siem".to_string(),
            endpoint: Some("https://siem.example.com/ingest".to_string()),
            auth_token: Some("your_api_token".to_string()),
            ..Default::default()
        }];

        let toml_content =
            toml::to_string_pretty(&sample).map_err(|e| crate::error::Error::Config(e.to_string()))?;

        let sample_content = format!(
            r#"# seclog-rs Configuration File
#
# このファイルは seclog.toml として保存してください
# 環境変数での上書きも可能です (例: SECLOG_ENVIRONMENT=production)
#
# [alerting]
# webhook_url = 未設定の場合、アラートのWebhook通知は行われません
#
# [[sinks]]
# endpoint = 未設定のシンクはエラーにならず単に無効になります

{}"#,
            toml_content
        );

        std::fs::write("seclog.toml.example", &sample_content)?;
        Ok(sample_content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SecLogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.level, "warn");
        assert_eq!(config.risk.repeat_threshold, 5);
        assert_eq!(config.risk.cache_ttl_secs, 300);
        assert_eq!(config.masking.max_payload_length, 500);
        assert!(!config.is_production());
    }

    #[test]
    fn test_sink_enabled_by_endpoint_presence() {
        let mut sink = SinkSettings::default();
        assert!(!sink.is_enabled());

        sink.endpoint = Some("https://siem.example.com/ingest".to_string());
        assert!(sink.is_enabled());
    }

    #[test]
    fn test_production_detection() {
        let mut config = SecLogConfig::default();
        config.environment = "production".to_string();
        assert!(config.is_production());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = SecLogConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: SecLogConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.risk.pattern_threshold, config.risk.pattern_threshold);
        assert_eq!(parsed.channels.audit_retention_days, 2555);
    }
}

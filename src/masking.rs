//! Sensitive Data Scrubber
//!
//! 構造化ペイロードがプロセス外へ出る前に機密フィールドを
//! 赤塗り・マスキングする。純粋関数であり副作用を持たない。
//!
//! 保証: 設定済みの機密キーに対応する値は、ネストの深さに関わらず
//! 赤塗りされずに出力へ現れることはない。

use serde_json::{Map, Value as JsonValue};

/// 完全赤塗り時の置換マーカー
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// 再帰の深さ上限。これを超えた部分は安全な文字列へ畳み込む
const MAX_DEPTH: usize = 32;

/// スクラバー設定
#[derive(Debug, Clone)]
pub struct MaskingConfig {
    /// マスキング有効フラグ
    pub enabled: bool,
    /// 機密フィールド名（部分一致、小文字比較）
    pub sensitive_keys: Vec<String>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensitive_keys: default_sensitive_keys(),
        }
    }
}

/// 既定の機密キー一覧
pub fn default_sensitive_keys() -> Vec<String> {
    [
        "password",
        "passwd",
        "secret",
        "token",
        "api_key",
        "apikey",
        "authorization",
        "auth_header",
        "credit_card",
        "card_number",
        "cvv",
        "ssn",
        "private_key",
        "access_key",
        "refresh_token",
        "session_token",
        "cookie",
        "email",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// 機密データスクラバー
#[derive(Debug, Clone)]
pub struct DataScrubber {
    config: MaskingConfig,
}

impl DataScrubber {
    /// 設定付きでスクラバーを作成
    pub fn new(config: MaskingConfig) -> Self {
        Self { config }
    }

    /// デフォルト設定でスクラバーを作成
    pub fn with_defaults() -> Self {
        Self::new(MaskingConfig::default())
    }

    /// ペイロードをスクラブ
    ///
    /// 冪等: `scrub(scrub(x)) == scrub(x)`。マスキング無効時は入力を
    /// そのまま返す。
    pub fn scrub(&self, payload: &JsonValue) -> JsonValue {
        if !self.config.enabled {
            return payload.clone();
        }
        self.scrub_value(payload, false, 0)
    }

    /// 値を再帰的にスクラブ
    fn scrub_value(&self, value: &JsonValue, under_sensitive_key: bool, depth: usize) -> JsonValue {
        if depth > MAX_DEPTH {
            // 深すぎる構造は安全な文字列へ畳み込む
            return JsonValue::String("[unserializable]".to_string());
        }

        match value {
            JsonValue::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, v) in map {
                    let sensitive = under_sensitive_key || self.is_sensitive_key(key);
                    if sensitive && !matches!(v, JsonValue::Object(_) | JsonValue::Array(_)) {
                        out.insert(key.clone(), self.mask_leaf(key, v));
                    } else {
                        out.insert(key.clone(), self.scrub_value(v, sensitive, depth + 1));
                    }
                }
                JsonValue::Object(out)
            }
            JsonValue::Array(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|v| self.scrub_value(v, under_sensitive_key, depth + 1))
                    .collect(),
            ),
            leaf => {
                if under_sensitive_key {
                    self.mask_leaf("", leaf)
                } else {
                    leaf.clone()
                }
            }
        }
    }

    /// キーが機密かどうかを判定（部分一致、小文字比較）
    fn is_sensitive_key(&self, key: &str) -> bool {
        let lower = key.to_lowercase();
        self.config
            .sensitive_keys
            .iter()
            .any(|k| lower.contains(k.as_str()))
    }

    /// 葉の値をマスク
    fn mask_leaf(&self, key: &str, value: &JsonValue) -> JsonValue {
        let s = match value {
            JsonValue::String(s) => s.clone(),
            JsonValue::Null => return JsonValue::Null,
            other => other.to_string(),
        };

        // 既にマスク済みの値はそのまま（冪等性のため）
        if s == REDACTION_MARKER || s.starts_with("****") {
            return JsonValue::String(s);
        }

        let lower_key = key.to_lowercase();
        if lower_key.contains("card") || lower_key.contains("credit") {
            return JsonValue::String(mask_card_number(&s));
        }
        if lower_key.contains("email") {
            return JsonValue::String(mask_email(&s));
        }

        JsonValue::String(REDACTION_MARKER.to_string())
    }
}

/// カード番号をマスク（下4桁のみ保持）
///
/// 数字が12桁未満の値はカード番号とみなさず完全赤塗りする。
fn mask_card_number(value: &str) -> String {
    let digits: Vec<char> = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 12 {
        return REDACTION_MARKER.to_string();
    }
    let last4: String = digits[digits.len() - 4..].iter().collect();
    format!("****{}", last4)
}

/// メールアドレスのローカル部を部分マスク
fn mask_email(value: &str) -> String {
    match value.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let first = local.chars().next().unwrap();
            // 既にマスク済みの形（"a***"）を再マスクしても同じ結果になる
            format!("{}***@{}", first, domain)
        }
        _ => REDACTION_MARKER.to_string(),
    }
}

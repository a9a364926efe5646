//! Correlation Context
//!
//! リクエスト単位の相関ID生成と明示的な伝搬。
//!
//! 相関IDの伝搬は呼び出し側の責務とする。各ロギングメソッドは
//! `Option<&RequestContext>` を受け取り、存在すれば相関IDをイベントに
//! 刻印する。ミドルウェア等がリクエスト受付時に [`RequestContext::new`]
//! でコンテキストを生成し、処理フローに引き回す想定。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 相関IDを生成
///
/// プロセスを跨いでも衝突しないようUUID v4を使用する。
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// リクエストスコープのコンテキスト
///
/// 一つの論理リクエスト/操作に属するログ行を結合するための識別子を保持する。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// 相関ID
    pub correlation_id: String,
    /// セッションID（存在する場合）
    pub session_id: Option<String>,
}

impl RequestContext {
    /// 新しい相関IDでコンテキストを作成
    pub fn new() -> Self {
        Self {
            correlation_id: generate_correlation_id(),
            session_id: None,
        }
    }

    /// 既存の相関ID（上流から受信したもの等）からコンテキストを作成
    pub fn from_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            session_id: None,
        }
    }

    /// セッションIDを設定
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

//! Attack Pattern Analysis
//!
//! 単一アクターからの持続的な攻撃兆候を検知し、合成イベントへ
//! エスカレーションする。
//!
//! 同一IPのカウントがしきい値を超えた時点で `suspicious_activity` の
//! 合成イベントを一度だけ生成する。合成イベントはパイプラインを
//! 通常イベントと同様に通過する（リスクスコアリング含む）が、
//! 再帰的なパターン分析は呼び出し側（logger.rs）が抑止する。

use crate::event::{SecurityEvent, SecurityEventType, Severity};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 攻撃パターン分析器
#[derive(Debug)]
pub struct AttackPatternAnalyzer {
    /// 合成イベントを生成するしきい値（同一IPのイベント数）
    threshold: u64,
    /// 検知ウィンドウ（カウンター失効ウィンドウと同一にする）
    window: Duration,
    /// エスカレーション済みIP（ウィンドウ内の再発火を抑止）
    flagged: Arc<RwLock<HashMap<IpAddr, DateTime<Utc>>>>,
}

impl AttackPatternAnalyzer {
    /// 新しい分析器を作成
    pub fn new(threshold: u64, window: Duration) -> Self {
        Self {
            threshold,
            window,
            flagged: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// イベントを分析し、必要なら合成イベントを返す
    ///
    /// `ip_count` は当該イベント計上後のIPカウント。しきい値超過かつ
    /// ウィンドウ内で未エスカレーションの場合のみ合成イベントを返す。
    pub async fn check(&self, event: &SecurityEvent, ip_count: u64) -> Option<SecurityEvent> {
        let ip = event.ip?;

        if ip_count <= self.threshold {
            return None;
        }

        let now = Utc::now();
        let mut flagged = self.flagged.write().await;

        // ウィンドウを過ぎたフラグは機会的に削除
        let window = self.window;
        flagged.retain(|_, at| now - *at <= window);

        if flagged.contains_key(&ip) {
            return None;
        }
        flagged.insert(ip, now);

        tracing::warn!(
            "Attack pattern detected: {} events from {} within detection window",
            ip_count,
            ip
        );

        let synthetic = SecurityEvent::new(
            SecurityEventType::SuspiciousActivity,
            Severity::Critical,
            format!(
                "Sustained suspicious activity from {}: {} security events within the detection window",
                ip, ip_count
            ),
        )
        .with_request_info(ip, "pattern-analyzer")
        .with_details(json!({
            "pattern": "repeated_events",
            "source_ip": ip.to_string(),
            "observed_count": ip_count,
            "threshold": self.threshold,
        }));

        Some(synthetic)
    }

    /// エスカレーション状態をクリア
    pub async fn reset(&self) {
        self.flagged.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Outcome;

    fn event(ip: &str) -> SecurityEvent {
        SecurityEvent::new(
            SecurityEventType::AuthenticationFailure,
            Severity::Low,
            "failed login".to_string(),
        )
        .with_request_info(ip.parse().unwrap(), "curl/7")
        .with_outcome(Outcome::Failure)
    }

    #[tokio::test]
    async fn test_no_escalation_below_threshold() {
        let analyzer = AttackPatternAnalyzer::new(10, Duration::hours(1));
        let e = event("203.0.113.50");

        for count in 1..=10 {
            assert!(analyzer.check(&e, count).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_escalates_once_over_threshold() {
        let analyzer = AttackPatternAnalyzer::new(10, Duration::hours(1));
        let e = event("203.0.113.51");

        let synthetic = analyzer.check(&e, 11).await;
        assert!(synthetic.is_some());

        let synthetic = synthetic.unwrap();
        assert_eq!(synthetic.event_type, SecurityEventType::SuspiciousActivity);
        assert_eq!(synthetic.severity, Severity::Critical);
        assert!(synthetic.message.contains("203.0.113.51"));
        assert!(synthetic.message.contains("11"));

        // 同一ウィンドウ内の再発火は抑止される
        assert!(analyzer.check(&e, 12).await.is_none());
        assert!(analyzer.check(&e, 20).await.is_none());
    }

    #[tokio::test]
    async fn test_independent_ips_escalate_independently() {
        let analyzer = AttackPatternAnalyzer::new(10, Duration::hours(1));

        assert!(analyzer.check(&event("203.0.113.52"), 11).await.is_some());
        assert!(analyzer.check(&event("203.0.113.53"), 11).await.is_some());
    }

    #[tokio::test]
    async fn test_event_without_ip_ignored() {
        let analyzer = AttackPatternAnalyzer::new(10, Duration::hours(1));
        let e = SecurityEvent::new(
            SecurityEventType::AuthenticationFailure,
            Severity::Low,
            "no source".to_string(),
        );

        assert!(analyzer.check(&e, 100).await.is_none());
    }

    #[tokio::test]
    async fn test_reset_allows_refire() {
        let analyzer = AttackPatternAnalyzer::new(10, Duration::hours(1));
        let e = event("203.0.113.54");

        assert!(analyzer.check(&e, 11).await.is_some());
        analyzer.reset().await;
        assert!(analyzer.check(&e, 11).await.is_some());
    }
}

//! Security Pipeline Integration Tests
//!
//! End-to-end scenarios for the intake pipeline: risk scoring, repeat
//! detection, attack pattern escalation, alerting policy and statistics.

use seclog_rs::{
    DataAccessEvent, DataOperation, SecLogConfig, SecurityEvent, SecurityEventType,
    SecurityLogger, Severity,
};
use std::net::IpAddr;
use std::time::Duration;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

async fn quiet_logger() -> SecurityLogger {
    let mut config = SecLogConfig::default();
    config.channels.console_enabled = false;
    SecurityLogger::new(config).await.unwrap()
}

#[tokio::test]
async fn test_repeated_auth_failures_escalate_severity() {
    let logger = quiet_logger().await;

    for _ in 0..6 {
        logger
            .log_authentication_failure("u1", ip("10.0.0.5"), "curl/7", "bad password", None, None)
            .await;
    }

    // 6回目は繰り返ししきい値(5)を超えており repeated_ip が効く
    let events = logger.recent_events(1).await;
    let sixth = &events[0];
    assert!(sixth.risk_factors.contains(&"repeated_ip".to_string()));
    assert!(sixth.severity >= Severity::Medium);

    let stats = logger.get_statistics().await;
    assert_eq!(stats.risk.counters.get("ip-10.0.0.5"), Some(&6));
    assert_eq!(stats.risk.counters.get("user-u1"), Some(&6));
    assert_eq!(stats.total_events, 6);
}

#[tokio::test]
async fn test_risk_score_always_bounded() {
    let logger = quiet_logger().await;

    // 加点要素を限界まで積んだイベントを繰り返し投入する
    for i in 0..30 {
        let event = SecurityEvent::new(
            SecurityEventType::SqlInjectionAttempt,
            Severity::Low,
            format!("attempt {}", i),
        )
        .with_request_info(ip("203.0.113.99"), "sqlmap/1.7")
        .with_action("users", "admin_delete_export")
        .with_outcome(seclog_rs::Outcome::Failure);

        logger.log_security_event(event, None).await;
    }

    for event in logger.recent_events(100).await {
        let score = event.risk_score.expect("score must be present after intake");
        assert!(score <= 100);
    }
}

#[tokio::test]
async fn test_attack_pattern_emits_single_synthetic_event() {
    let logger = quiet_logger().await;

    // しきい値(10)を超える11イベントを同一IPから投入
    for _ in 0..11 {
        logger
            .log_authentication_failure(
                "u2",
                ip("198.51.100.7"),
                "curl/7",
                "bad password",
                None,
                None,
            )
            .await;
    }

    let suspicious: Vec<SecurityEvent> = logger
        .recent_events(100)
        .await
        .into_iter()
        .filter(|e| e.event_type == SecurityEventType::SuspiciousActivity)
        .collect();

    // 合成イベントはちょうど1件、criticalで、発生元IPを示す
    assert_eq!(suspicious.len(), 1);
    assert_eq!(suspicious[0].severity, Severity::Critical);
    assert!(suspicious[0].message.contains("198.51.100.7"));

    // 合成イベント自体もカウントされるが、再帰的な合成は起きない
    let stats = logger.get_statistics().await;
    assert_eq!(stats.risk.counters.get("type-suspicious_activity"), Some(&1));
    assert_eq!(stats.risk.counters.get("ip-198.51.100.7"), Some(&12));
    assert_eq!(stats.total_events, 12);
}

#[tokio::test]
async fn test_injection_attempts_always_alert() {
    // 開発環境（high非通知）でも注入系イベントは必ずアラートになる
    let logger = quiet_logger().await;
    assert!(!logger.config().is_production());

    logger
        .log_sql_injection_attempt(
            ip("203.0.113.40"),
            "sqlmap/1.7",
            "' OR 1=1 --",
            "/api/login",
            None,
            None,
        )
        .await;

    // アラート送信は非同期なので完了を待つ
    let mut history = Vec::new();
    for _ in 0..50 {
        history = logger.alert_history(None).await;
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event_type, SecurityEventType::SqlInjectionAttempt);
}

#[tokio::test]
async fn test_high_severity_not_alerted_outside_production() {
    let logger = quiet_logger().await;

    // XSSは常時通知リストに入っているため、比較対象として
    // 非リストのhigh相当イベント（suspicious activity）を使う
    logger
        .log_suspicious_activity(
            "unusual crawl pattern",
            ip("203.0.113.41"),
            "bot/1.0",
            Some(Severity::High),
            None,
            None,
        )
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(logger.alert_history(None).await.is_empty());

    let stats = logger.get_statistics().await;
    assert_eq!(stats.alerts_dispatched, 0);
}

#[tokio::test]
async fn test_data_access_delete_rule_and_audit_record() {
    let logger = quiet_logger().await;

    let access = DataAccessEvent::new("u1", "profile", DataOperation::Delete, 150)
        .with_ip(ip("203.0.113.42"));
    logger.log_data_access(access, None).await;

    // セキュリティイベント: 100件超のdeleteはhigh
    let events = logger.recent_events(1).await;
    assert_eq!(events[0].event_type, SecurityEventType::DataAccess);
    assert!(events[0].severity >= Severity::High);

    // 監査イベントは重要度に関わらず必ず生成される
    let audit = logger.recent_audit_events(1).await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].event_type, "data_access");
    assert_eq!(audit[0].actor, "u1");
}

#[tokio::test]
async fn test_read_access_stays_low_but_still_audited() {
    let logger = quiet_logger().await;

    let access = DataAccessEvent::new("u3", "profile", DataOperation::Read, 1);
    logger.log_data_access(access, None).await;

    let events = logger.recent_events(1).await;
    assert_eq!(events[0].severity, Severity::Low);
    assert_eq!(logger.recent_audit_events(1).await.len(), 1);
}

#[tokio::test]
async fn test_reset_returns_empty_statistics() {
    let logger = quiet_logger().await;

    for _ in 0..5 {
        logger
            .log_authentication_failure("u1", ip("203.0.113.43"), "curl/7", "bad password", None, None)
            .await;
    }

    logger.reset().await;

    let stats = logger.get_statistics().await;
    assert!(stats.risk.counters.is_empty());
    assert_eq!(stats.risk.cache_size, 0);
    assert_eq!(stats.total_events, 0);
    assert_eq!(stats.audit_events, 0);
    assert!(stats.last_event_time.is_none());
}

#[tokio::test]
async fn test_identical_events_share_cached_assessment() {
    let logger = quiet_logger().await;

    for _ in 0..3 {
        logger
            .log_authentication_failure("u1", ip("203.0.113.44"), "curl/7", "bad password", None, None)
            .await;
    }

    let events = logger.recent_events(3).await;
    let scores: Vec<u8> = events.iter().map(|e| e.risk_score.unwrap()).collect();
    assert!(scores.windows(2).all(|w| w[0] == w[1]));

    // 計算は1回、残りはキャッシュヒット
    let stats = logger.get_statistics().await;
    assert_eq!(stats.risk.computations, 1);
    assert_eq!(stats.risk.cache_hits, 2);
}

#[tokio::test]
async fn test_statistics_track_severity_and_type_breakdown() {
    let logger = quiet_logger().await;

    logger
        .log_authentication_success("u1", ip("203.0.113.45"), "curl/7", None, None, None)
        .await;
    logger
        .log_sql_injection_attempt(ip("203.0.113.46"), "curl/7", "1; DROP TABLE users", "/api", None, None)
        .await;

    let stats = logger.get_statistics().await;
    assert_eq!(stats.total_events, 2);
    assert_eq!(
        stats.events_by_type.get(&SecurityEventType::SqlInjectionAttempt),
        Some(&1)
    );
    assert_eq!(stats.events_by_severity.get(&Severity::Critical), Some(&1));
    assert!(stats.last_event_time.is_some());
}

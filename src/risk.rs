//! Risk Scoring
//!
//! イベントカウンターとリスクスコアラー。
//!
//! 各イベントに対し決定的な加点方式で 0〜100 のリスクスコアを計算し、
//! しきい値から重要度を導出する。同一アクターからの連続イベントに
//! 備えて `(種別, IP, ユーザー)` 単位の短期キャッシュを持つ。
//!
//! 契約: カウンター更新はスコア計算（キャッシュヒット含む）より先に、
//! すべてのイベントに対して無条件に行う。繰り返し検知の精度が
//! キャッシュの有無に左右されないようにするため。

use crate::config::RiskSettings;
use crate::event::{Outcome, SecurityEvent, SecurityEventType, Severity};
use chrono::{DateTime, Duration, Utc};
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// スコアラー設定
#[derive(Debug, Clone)]
pub struct RiskScorerConfig {
    /// 同一IPの繰り返し加点が始まるしきい値
    pub repeat_threshold: u64,
    /// 繰り返し1回あたりの加点
    pub repeat_step: u32,
    /// 繰り返し加点の上限
    pub repeat_cap: u32,
    /// カウンターの失効ウィンドウ
    pub counter_ttl: Duration,
    /// スコアキャッシュのTTL
    pub cache_ttl: Duration,
    /// 攻撃パターン判定のしきい値（pattern.rs が参照）
    pub pattern_threshold: u64,
    /// 信頼済みネットワーク
    pub trusted_networks: Vec<IpNet>,
    /// 特権操作のパターン
    pub privileged_pattern: Regex,
}

impl Default for RiskScorerConfig {
    fn default() -> Self {
        Self::from_settings(&RiskSettings::default())
    }
}

impl RiskScorerConfig {
    /// 設定値からスコアラー設定を構築
    ///
    /// 不正なCIDR表記は警告を出してスキップする。
    pub fn from_settings(settings: &RiskSettings) -> Self {
        let trusted_networks = settings
            .trusted_networks
            .iter()
            .filter_map(|s| match s.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(e) => {
                    tracing::warn!("Invalid trusted network CIDR '{}': {}", s, e);
                    None
                }
            })
            .collect();

        Self {
            repeat_threshold: settings.repeat_threshold,
            repeat_step: settings.repeat_step,
            repeat_cap: settings.repeat_cap,
            counter_ttl: Duration::seconds(settings.counter_ttl_secs as i64),
            cache_ttl: Duration::seconds(settings.cache_ttl_secs as i64),
            pattern_threshold: settings.pattern_threshold,
            trusted_networks,
            privileged_pattern: Regex::new(r"(?i)(admin|delete|drop|export|grant|sudo|root)")
                .expect("privileged operation pattern is valid"),
        }
    }
}

/// リスク評価結果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskAssessment {
    /// リスクスコア（0〜100）
    pub score: u8,
    /// スコアに寄与した要因タグ
    pub factors: Vec<String>,
    /// スコアから導出された重要度
    pub severity: Severity,
}

/// イベントカウンター
///
/// 最終観測が失効ウィンドウを超えたエントリは、次のカウンター更新時に
/// 機会的に削除される（バックグラウンドタイマーは使わない）。
#[derive(Debug, Clone, Serialize)]
pub struct EventCounter {
    /// 観測回数
    pub count: u64,
    /// 最終観測時刻
    pub last_seen: DateTime<Utc>,
}

/// スコアキャッシュのキー
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    event_type: SecurityEventType,
    ip: Option<IpAddr>,
    user_id: Option<String>,
}

/// スコアキャッシュのエントリ
#[derive(Debug, Clone)]
struct CacheEntry {
    assessment: RiskAssessment,
    computed_at: DateTime<Utc>,
}

/// カウンター・キャッシュ状態のスナップショット
#[derive(Debug, Clone, Serialize, Default)]
pub struct RiskStatistics {
    /// カウンター（キー → 回数）
    pub counters: HashMap<String, u64>,
    /// キャッシュ内のエントリ数
    pub cache_size: usize,
    /// フル計算の実行回数
    pub computations: u64,
    /// キャッシュヒット回数
    pub cache_hits: u64,
}

/// リスクスコアラー
///
/// カウンターとキャッシュはこのインスタンスが排他的に所有する。
/// インスタンス間で状態は共有されない。
#[derive(Debug)]
pub struct RiskScorer {
    config: RiskScorerConfig,
    counters: Arc<RwLock<HashMap<String, EventCounter>>>,
    cache: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
    computations: AtomicU64,
    cache_hits: AtomicU64,
}

impl RiskScorer {
    /// 新しいスコアラーを作成
    pub fn new(config: RiskScorerConfig) -> Self {
        Self {
            config,
            counters: Arc::new(RwLock::new(HashMap::new())),
            cache: Arc::new(RwLock::new(HashMap::new())),
            computations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// デフォルト設定でスコアラーを作成
    pub fn with_defaults() -> Self {
        Self::new(RiskScorerConfig::default())
    }

    /// 設定を取得
    pub fn config(&self) -> &RiskScorerConfig {
        &self.config
    }

    /// イベントを評価
    ///
    /// カウンター更新 → キャッシュ照会 → （ミス時）フル計算の順。
    pub async fn score(&self, event: &SecurityEvent) -> RiskAssessment {
        let ip_count = self.update_counters(event).await;

        let key = CacheKey {
            event_type: event.event_type,
            ip: event.ip,
            user_id: event.user_id.clone(),
        };

        let now = Utc::now();
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                // TTL超過のエントリは決して返さず、再計算で上書きする
                if now - entry.computed_at < self.config.cache_ttl {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return entry.assessment.clone();
                }
            }
        }

        self.computations.fetch_add(1, Ordering::Relaxed);
        let assessment = self.compute(event, ip_count);

        let mut cache = self.cache.write().await;
        cache.insert(
            key,
            CacheEntry {
                assessment: assessment.clone(),
                computed_at: now,
            },
        );

        assessment
    }

    /// 指定IPの現在のカウント値を取得
    pub async fn ip_count(&self, ip: &IpAddr) -> u64 {
        let counters = self.counters.read().await;
        counters.get(&ip_key(ip)).map(|c| c.count).unwrap_or(0)
    }

    /// 統計スナップショットを取得
    pub async fn statistics(&self) -> RiskStatistics {
        let counters = self.counters.read().await;
        let cache = self.cache.read().await;
        RiskStatistics {
            counters: counters.iter().map(|(k, v)| (k.clone(), v.count)).collect(),
            cache_size: cache.len(),
            computations: self.computations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// カウンターとキャッシュをすべてクリア
    pub async fn reset(&self) {
        self.counters.write().await.clear();
        self.cache.write().await.clear();
        self.computations.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
    }

    /// カウンターを更新し、イベントIPの更新後カウントを返す
    ///
    /// 失効エントリの削除はこの更新パスで機会的に行う。IPカウントが
    /// 繰り返ししきい値・パターンしきい値を跨いだ場合、そのIPの
    /// キャッシュを無効化する（スコアの「粘着」がしきい値跨ぎを
    /// 覆い隠さないようにするため）。
    async fn update_counters(&self, event: &SecurityEvent) -> u64 {
        let now = Utc::now();
        let mut ip_count = 0;
        let mut crossed_boundary = false;

        {
            let mut counters = self.counters.write().await;

            // 機会的な失効エントリの削除
            let ttl = self.config.counter_ttl;
            counters.retain(|_, c| now - c.last_seen <= ttl);

            if let Some(ip) = event.ip {
                let counter = bump(&mut counters, ip_key(&ip), now);
                ip_count = counter.count;
                crossed_boundary = ip_count == self.config.repeat_threshold + 1
                    || ip_count == self.config.pattern_threshold + 1;
            }
            if let Some(ref user_id) = event.user_id {
                bump(&mut counters, format!("user-{}", user_id), now);
            }
            bump(&mut counters, format!("type-{}", event.event_type), now);
        }

        if crossed_boundary {
            let ip = event.ip;
            let mut cache = self.cache.write().await;
            cache.retain(|key, _| key.ip != ip);
        }

        ip_count
    }

    /// 加点方式でスコアを計算
    fn compute(&self, event: &SecurityEvent, ip_count: u64) -> RiskAssessment {
        let mut score: i32 = base_points(event.event_type);
        let mut factors = Vec::new();

        // 同一IPからの繰り返し
        if ip_count > self.config.repeat_threshold {
            let repeats = (ip_count - self.config.repeat_threshold) as u32;
            let bonus = (repeats * self.config.repeat_step).min(self.config.repeat_cap);
            score += bonus as i32;
            factors.push("repeated_ip".to_string());
        }

        // 失敗した操作
        if event.outcome == Outcome::Failure {
            score += 10;
            factors.push("failure_outcome".to_string());
        }

        // 特権操作
        if let Some(ref action) = event.action {
            if self.config.privileged_pattern.is_match(action) {
                score += 15;
                factors.push("privileged_operation".to_string());
            }
        }

        // 信頼済みネットワークからの接続は減点
        if let Some(ip) = event.ip {
            if self.config.trusted_networks.iter().any(|net| net.contains(&ip)) {
                score -= 5;
                factors.push("internal_ip".to_string());
            }
        }

        let score = score.clamp(0, 100) as u8;

        RiskAssessment {
            score,
            factors,
            severity: severity_for(score),
        }
    }
}

/// IPカウンターのキーを生成
fn ip_key(ip: &IpAddr) -> String {
    format!("ip-{}", ip)
}

/// カウンターをインクリメント（存在しなければ作成）
fn bump<'a>(
    counters: &'a mut HashMap<String, EventCounter>,
    key: String,
    now: DateTime<Utc>,
) -> &'a EventCounter {
    let counter = counters.entry(key).or_insert(EventCounter {
        count: 0,
        last_seen: now,
    });
    counter.count += 1;
    counter.last_seen = now;
    counter
}

/// イベント種別ごとの基礎点
fn base_points(event_type: SecurityEventType) -> i32 {
    match event_type {
        SecurityEventType::SqlInjectionAttempt => 80,
        SecurityEventType::XssAttempt => 80,
        SecurityEventType::PrivilegeEscalation => 75,
        SecurityEventType::CsrfAttempt => 70,
        SecurityEventType::SuspiciousActivity => 50,
        SecurityEventType::RateLimitExceeded => 30,
        SecurityEventType::AuthenticationFailure => 20,
        SecurityEventType::AuthorizationFailure => 15,
        _ => 10,
    }
}

/// スコアから重要度を導出
fn severity_for(score: u8) -> Severity {
    match score {
        80..=100 => Severity::Critical,
        50..=79 => Severity::High,
        20..=49 => Severity::Medium,
        _ => Severity::Low,
    }
}

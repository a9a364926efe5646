//! Log Channels
//!
//! セキュリティ・監査チャネルのファイル出力とローテーション、
//! 保持ポリシーの適用。
//!
//! 3系統のローテーションファイルを管理する:
//! - `security.log`        全セキュリティイベント
//! - `security-error.log`  error相当（critical/high）のみ、重点レビュー用
//! - `audit.log`           監査レコード。追記専用で長期保持
//!
//! 監査チャネルは運用ログと保持ポリシーを共有しない。削除は規制要件の
//! 保持年数を超えたファイルに限られる。

use anyhow::Result;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::EnvFilter;

use crate::config::ChannelSettings;

/// ファイルローテーション設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    /// 日次ローテーション
    Daily,
    /// 時間毎ローテーション
    Hourly,
    /// ローテーションなし
    Never,
}

impl LogRotation {
    /// 設定文字列から解析（不明な値は日次にフォールバック）
    pub fn parse(s: &str) -> Self {
        match s {
            "hourly" => LogRotation::Hourly,
            "never" => LogRotation::Never,
            _ => LogRotation::Daily,
        }
    }
}

/// 1チャネル分の非ブロッキングファイルライター
pub struct ChannelWriter {
    writer: NonBlocking,
    // ドロップ時にバッファをフラッシュするためガードを保持する
    _guard: WorkerGuard,
}

impl ChannelWriter {
    /// ローテーション付きライターを作成
    fn new(dir: &Path, file_name: &str, rotation: LogRotation) -> Result<Self> {
        let appender = match rotation {
            LogRotation::Daily => rolling::daily(dir, file_name),
            LogRotation::Hourly => rolling::hourly(dir, file_name),
            LogRotation::Never => rolling::never(dir, file_name),
        };
        let (writer, guard) = non_blocking(appender);
        Ok(Self {
            writer,
            _guard: guard,
        })
    }

    /// 1行書き込み（失敗は自己記録のみ、伝播しない）
    pub fn write_line(&self, line: &str) {
        let mut writer = self.writer.clone();
        if let Err(e) = writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
        {
            tracing::error!("Channel file write failed: {}", e);
        }
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter").finish()
    }
}

/// セキュリティ・監査チャネルのファイル出力一式
#[derive(Debug, Default)]
pub struct FileChannels {
    /// 全セキュリティイベント
    pub security: Option<ChannelWriter>,
    /// critical/high のみ
    pub security_error: Option<ChannelWriter>,
    /// 監査レコード（追記専用）
    pub audit: Option<ChannelWriter>,
}

impl FileChannels {
    /// 設定からチャネルを構築
    ///
    /// ファイル出力が無効の場合はすべて `None`（コンソールのみ）。
    pub fn new(settings: &ChannelSettings) -> Result<Self> {
        if !settings.file_enabled {
            return Ok(Self::default());
        }

        let dir = PathBuf::from(&settings.log_dir);
        ensure_log_dir(&dir)?;
        let rotation = LogRotation::parse(&settings.rotation);

        Ok(Self {
            security: Some(ChannelWriter::new(&dir, "security.log", rotation)?),
            security_error: Some(ChannelWriter::new(&dir, "security-error.log", rotation)?),
            audit: Some(ChannelWriter::new(&dir, "audit.log", rotation)?),
        })
    }
}

/// ログディレクトリを確保
pub fn ensure_log_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// コンソール診断ログを初期化（バイナリ・テスト用の補助）
///
/// グローバルサブスクライバーが設定済みの場合は何もしない。
pub fn init_console_logging(level: &str) {
    let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}

/// 保持ポリシーを適用
///
/// セキュリティ系ファイルは設定日数で削除する。監査ファイルは
/// 規制要件の保持年数（既定約7年）を超えたもののみ削除対象となる。
pub fn apply_retention_policy(settings: &ChannelSettings) -> Result<RetentionReport> {
    let dir = PathBuf::from(&settings.log_dir);
    if !dir.exists() {
        return Ok(RetentionReport::default());
    }

    let security_removed =
        cleanup_old_logs_by_age(&dir, "security", settings.security_retention_days)?;
    let audit_removed = cleanup_old_logs_by_age(&dir, "audit", settings.audit_retention_days)?;

    if security_removed > 0 || audit_removed > 0 {
        tracing::info!(
            "Retention cleanup removed {} security / {} audit log files",
            security_removed,
            audit_removed
        );
    }

    Ok(RetentionReport {
        security_removed,
        audit_removed,
    })
}

/// 保持ポリシー適用の結果
#[derive(Debug, Default, Clone, Copy)]
pub struct RetentionReport {
    /// 削除されたセキュリティログファイル数
    pub security_removed: usize,
    /// 削除された監査ログファイル数
    pub audit_removed: usize,
}

/// 日数ベースで古いログファイルを削除
fn cleanup_old_logs_by_age(log_dir: &Path, prefix: &str, max_days: u32) -> Result<usize> {
    use std::time::{Duration, SystemTime};

    let cutoff_time = SystemTime::now() - Duration::from_secs(max_days as u64 * 24 * 60 * 60);
    let mut removed_count = 0;

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        if !is_channel_log_file(&path, prefix) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                if modified < cutoff_time {
                    if let Err(e) = fs::remove_file(&path) {
                        tracing::warn!("Log file removal failed: {} - {}", path.display(), e);
                    } else {
                        removed_count += 1;
                        tracing::debug!("Removed expired log file: {}", path.display());
                    }
                }
            }
        }
    }

    Ok(removed_count)
}

/// 指定プレフィックスのチャネルログファイルか判定
fn is_channel_log_file(path: &Path, prefix: &str) -> bool {
    if !path.is_file() {
        return false;
    }
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.starts_with(prefix) && name.contains(".log"),
        None => false,
    }
}

/// ログディレクトリの統計情報
#[derive(Debug, Default)]
pub struct LogStats {
    /// ファイル数
    pub file_count: usize,
    /// 合計サイズ（バイト）
    pub total_size: u64,
    /// 最終更新時刻
    pub last_modified: Option<std::time::SystemTime>,
}

impl LogStats {
    /// サイズを人間可読な形式に整形
    pub fn format_size(&self) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
        let mut size = self.total_size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// ログディレクトリの統計を取得
pub fn get_log_stats(log_dir: &Path) -> Result<LogStats> {
    let mut stats = LogStats::default();

    if !log_dir.exists() {
        return Ok(stats);
    }

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        if !is_channel_log_file(&path, "security") && !is_channel_log_file(&path, "audit") {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            stats.file_count += 1;
            stats.total_size += metadata.len();

            if let Ok(modified) = metadata.modified() {
                let newer = stats
                    .last_modified
                    .map(|t| modified > t)
                    .unwrap_or(true);
                if newer {
                    stats.last_modified = Some(modified);
                }
            }
        }
    }

    Ok(stats)
}

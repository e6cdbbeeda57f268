//! CLI arguments and upload service configuration defaults.

use clap::{Parser, ValueEnum};
use std::time::Duration;

pub const STAGING_DIR_NAME: &str = ".upload_staging";
pub const DEFAULT_USER_HEADER: &str = "x-auth-user";
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_UPLOAD_MAX_ACTIVE: u64 = 8;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
/// Record lifetime when reaping is disabled; records then live until cancel or completion.
pub const UNREAPED_RECORD_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;
pub const DEFAULT_STARTUP_SWEEP_DELAY_SECS: u64 = 30;
pub const MAX_NAME_SUFFIX: u32 = 10_000;
pub const LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const MAX_PLACEMENT_ATTEMPTS: u32 = 8;

/// Which key/value backend holds upload session records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// One JSON document per record under the state directory.
    File,
    /// Process-local map; sessions are lost on restart.
    Memory,
}

/// CLI arguments and environment configuration for the upload server.
#[derive(Parser, Debug)]
#[command(name = "axo-upload", version, about = "AxoDrive resumable upload server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_STORAGE_DIR",
        default_value = ".axo/storage",
        help = "Root directory of per-user storage trees"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "AXO_STATE_DIR",
        default_value = ".axo/sessions",
        help = "Directory for persisted upload session records"
    )]
    pub state_dir: String,
    #[arg(
        long,
        env = "AXO_SESSION_STORE",
        value_enum,
        default_value_t = StoreBackend::File,
        help = "Upload session store backend"
    )]
    pub session_store: StoreBackend,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_USER_HEADER",
        default_value = DEFAULT_USER_HEADER,
        help = "Header carrying the user id set by the authenticating proxy"
    )]
    pub user_header: String,
    #[arg(
        long,
        env = "AXO_LOG_FILTER",
        default_value = "info",
        help = "Default log filter when RUST_LOG is unset"
    )]
    pub log_filter: String,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload file size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_CHUNK_SIZE",
        default_value_t = DEFAULT_CHUNK_SIZE,
        help = "Chunk size used when the client does not pick one"
    )]
    pub upload_chunk_size: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_CHUNK_SIZE",
        default_value_t = MAX_CHUNK_SIZE,
        help = "Largest chunk size a client may request"
    )]
    pub upload_max_chunk_size: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_CHUNKS",
        default_value_t = DEFAULT_UPLOAD_MAX_CHUNKS,
        help = "Max chunks per upload (0 to disable)"
    )]
    pub upload_max_chunks: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_ACTIVE",
        default_value_t = DEFAULT_UPLOAD_MAX_ACTIVE,
        help = "Max active uploads per user (0 to disable)"
    )]
    pub upload_max_active: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Inactivity window before an upload session is reaped"
    )]
    pub upload_session_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_SWEEP_INTERVAL_SECS,
        help = "Interval between abandoned upload sweeps"
    )]
    pub upload_sweep_interval_secs: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_STARTUP_SWEEP_DELAY_SECS",
        default_value_t = DEFAULT_STARTUP_SWEEP_DELAY_SECS,
        help = "Delay before the first sweep after startup"
    )]
    pub upload_startup_sweep_delay_secs: u64,
}

/// 上传子系统的运行时配置。
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_file_size: u64,
    pub default_chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_chunks: u64,
    pub max_active_per_user: u64,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub startup_sweep_delay: Duration,
}

impl UploadConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            max_file_size: args.upload_max_size,
            default_chunk_size: args.upload_chunk_size.clamp(1, args.upload_max_chunk_size.max(1)),
            max_chunk_size: args.upload_max_chunk_size.max(1),
            max_chunks: args.upload_max_chunks,
            max_active_per_user: args.upload_max_active,
            session_ttl: Duration::from_secs(args.upload_session_ttl_secs),
            sweep_interval: Duration::from_secs(args.upload_sweep_interval_secs.max(1)),
            startup_sweep_delay: Duration::from_secs(args.upload_startup_sweep_delay_secs),
        }
    }

    /// 存储记录的过期时间：比不活跃窗口多一个清理周期，保证清理任务先于存储过期看到它。
    /// 不活跃窗口为 0 时不做回收，记录也不能被存储悄悄丢弃。
    pub fn record_ttl(&self) -> Duration {
        if self.session_ttl.is_zero() {
            return Duration::from_secs(UNREAPED_RECORD_TTL_SECS);
        }
        self.session_ttl + self.sweep_interval
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_UPLOAD_MAX_SIZE,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            max_chunks: DEFAULT_UPLOAD_MAX_CHUNKS,
            max_active_per_user: DEFAULT_UPLOAD_MAX_ACTIVE,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            startup_sweep_delay: Duration::from_secs(DEFAULT_STARTUP_SWEEP_DELAY_SECS),
        }
    }
}

use crate::server::{
    pool::policy::WorkerCountPolicy,
    transport::smtp::{SmtpSettings, TlsMode},
};
use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::time::Duration;
use mailly_core::validation::Rules;

/// Command-line spelling of [`TlsMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SmtpTls {
    #[value(name = "starttls")]
    Starttls,
    #[value(name = "wrapper")]
    Wrapper,
    #[value(name = "none")]
    Plain,
}

impl From<SmtpTls> for TlsMode {
    fn from(value: SmtpTls) -> Self {
        match value {
            SmtpTls::Starttls => TlsMode::StartTls,
            SmtpTls::Wrapper => TlsMode::Wrapper,
            SmtpTls::Plain => TlsMode::Plain,
        }
    }
}

/// Runtime configuration for the `mailly-server` binary.
///
/// These settings control worker-pool sizing, per-item timeouts, request
/// limits and the SMTP session every worker opens. All values are parsed from
/// CLI arguments or environment variables (a `.env` file is loaded first),
/// with defaults suitable for a small deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "mailly-server",
    version,
    about = "An HTTP service that delivers mail batches and streams per-item results"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Maximum number of messages accepted in a single batch request.
    ///
    /// Batches above this size are rejected with `400` before any connection
    /// is opened.
    ///
    /// Environment variable: `MAX_BATCH_SIZE`
    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = 10_000)]
    pub max_batch_size: usize,

    /// Upper bound on concurrent SMTP sessions opened for one batch.
    ///
    /// Environment variable: `MAX_WORKERS`
    #[arg(long, env = "MAX_WORKERS", default_value_t = 25)]
    pub max_workers: usize,

    /// Fixed number of workers per batch. When unset, the worker count is
    /// derived from the batch size and the number of logical CPUs.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long = "workers", env = "NUM_WORKERS")]
    pub num_workers: Option<usize>,

    /// Minimum number of messages a worker should handle before another
    /// session is worth opening (large batches only).
    ///
    /// Environment variable: `MIN_ITEMS_PER_WORKER`
    #[arg(long, env = "MIN_ITEMS_PER_WORKER", default_value_t = 8)]
    pub min_items_per_worker: usize,

    /// Workers allowed per logical CPU. Delivery is I/O-bound, so this is
    /// above one.
    ///
    /// Environment variable: `IO_MULTIPLIER`
    #[arg(long, env = "IO_MULTIPLIER", default_value_t = 2)]
    pub io_multiplier: usize,

    /// Batch size from which the pool always widens to `MAX_WORKERS`.
    ///
    /// Environment variable: `LARGE_BATCH_THRESHOLD`
    #[arg(long, env = "LARGE_BATCH_THRESHOLD", default_value_t = 1_000)]
    pub large_batch_threshold: usize,

    /// Seconds a single delivery may take before it is reported as failed.
    ///
    /// Environment variable: `SEND_TIMEOUT_SECS`
    #[arg(long, env = "SEND_TIMEOUT_SECS", default_value_t = 30)]
    pub send_timeout_secs: u64,

    /// Seconds allowed for the polite `QUIT` when a worker releases its
    /// session.
    ///
    /// Environment variable: `CLOSE_TIMEOUT_SECS`
    #[arg(long, env = "CLOSE_TIMEOUT_SECS", default_value_t = 2)]
    pub close_timeout_secs: u64,

    /// Seconds to wait for in-flight batches during graceful shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// SMTP server hostname.
    ///
    /// Environment variable: `SMTP_HOST`
    #[arg(long, env = "SMTP_HOST")]
    pub smtp_host: String,

    /// SMTP server port.
    ///
    /// Environment variable: `SMTP_PORT`
    #[arg(long, env = "SMTP_PORT", default_value_t = 587)]
    pub smtp_port: u16,

    /// Transport security: `starttls`, `wrapper` (implicit TLS) or `none`.
    ///
    /// Environment variable: `SMTP_TLS`
    #[arg(long, env = "SMTP_TLS", value_enum, default_value_t = SmtpTls::Starttls)]
    pub smtp_tls: SmtpTls,

    /// Name announced in `EHLO`.
    ///
    /// Environment variable: `SMTP_HELLO_NAME`
    #[arg(long, env = "SMTP_HELLO_NAME", default_value_t = String::from("localhost"))]
    pub smtp_hello_name: String,

    /// Account used both to authenticate and as the envelope sender.
    ///
    /// Environment variable: `SENDER_EMAIL`
    #[arg(long, env = "SENDER_EMAIL")]
    pub sender_email: String,

    /// Password (or app password) for `SENDER_EMAIL`.
    ///
    /// Environment variable: `SENDER_EMAIL_PASSWORD`
    #[arg(long, env = "SENDER_EMAIL_PASSWORD", hide_env_values = true)]
    pub sender_password: String,

    /// Display name used when a batch item leaves `product_name` blank.
    ///
    /// Environment variable: `DEFAULT_SENDER_NAME`
    #[arg(long, env = "DEFAULT_SENDER_NAME", default_value_t = String::from(mailly_core::types::DEFAULT_SENDER_NAME))]
    pub default_sender_name: String,
}

/// Settings that shape a single batch run: pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub policy: WorkerCountPolicy,
    pub fixed_workers: Option<usize>,
    pub send_timeout: Duration,
    pub close_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            policy: WorkerCountPolicy::default(),
            fixed_workers: None,
            send_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub max_batch_size: usize,
    pub shutdown_timeout: Duration,
    pub dispatch: DispatchConfig,
    pub rules: Rules,
    pub smtp: SmtpSettings,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_batch_size == 0 {
            bail!("MAX_BATCH_SIZE must be greater than 0");
        }
        if args.max_workers == 0 {
            bail!("MAX_WORKERS must be greater than 0");
        }
        if let Some(workers) = args.num_workers {
            if workers == 0 || workers > args.max_workers {
                bail!(
                    "NUM_WORKERS ({}) must be between 1 and MAX_WORKERS ({})",
                    workers,
                    args.max_workers
                );
            }
        }
        if args.min_items_per_worker == 0 {
            bail!("MIN_ITEMS_PER_WORKER must be greater than 0");
        }
        if args.io_multiplier == 0 {
            bail!("IO_MULTIPLIER must be greater than 0");
        }
        if args.send_timeout_secs == 0 {
            bail!("SEND_TIMEOUT_SECS must be greater than 0");
        }
        if args.smtp_host.trim().is_empty() {
            bail!("SMTP_HOST is required");
        }
        if args.sender_email.trim().is_empty() || args.sender_password.is_empty() {
            bail!("SENDER_EMAIL and SENDER_EMAIL_PASSWORD are required");
        }

        let mut sender = args.sender_email.clone();
        if mailly_core::validation::email("SENDER_EMAIL", &mut sender, &Rules::default()).is_err() {
            bail!("SENDER_EMAIL ({}) is not a valid email address", args.sender_email);
        }

        let policy = WorkerCountPolicy {
            max_workers: args.max_workers,
            min_items_per_worker: args.min_items_per_worker,
            io_multiplier: args.io_multiplier,
            large_batch_threshold: args.large_batch_threshold,
        };

        Ok(Self {
            server_addr: args.server_addr,
            max_batch_size: args.max_batch_size,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            dispatch: DispatchConfig {
                policy,
                fixed_workers: args.num_workers,
                send_timeout: Duration::from_secs(args.send_timeout_secs),
                close_timeout: Duration::from_secs(args.close_timeout_secs),
            },
            rules: Rules {
                default_sender_name: args.default_sender_name,
                ..Rules::default()
            },
            smtp: SmtpSettings {
                host: args.smtp_host,
                port: args.smtp_port,
                tls: args.smtp_tls.into(),
                hello_name: args.smtp_hello_name,
                sender: args.sender_email,
                password: args.sender_password,
                connect_timeout: Duration::from_secs(args.send_timeout_secs),
            },
        })
    }
}

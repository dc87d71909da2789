//! Runtime configuration.
//!
//! Every option is available both as a command-line flag and as an
//! environment variable, with the environment names matching the deployment
//! contract (`PORT`, `CHANNELS_CONF`, `ENABLE_PREEMPTION`, ...).

use std::path::PathBuf;

use clap::Parser;

use crate::tuner::command::{Codec, Engine};

/// tunercast - HTTP gateway for broadcast TV tuners
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Port for the HTTP server
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Path to the channels-config file
    #[arg(short = 'c', long, env = "CHANNELS_CONF", default_value = "channels.conf")]
    pub channels_conf: PathBuf,

    /// Number of tuner adapters available to the gateway
    #[arg(short = 't', long, env = "TUNER_COUNT", default_value_t = 1)]
    pub tuner_count: usize,

    /// Allow a live request to preempt another live session
    #[arg(long, env = "ENABLE_PREEMPTION", default_value = "false", action = clap::ArgAction::Set)]
    pub enable_preemption: bool,

    /// Run the EPG scan orchestrator
    #[arg(long, env = "ENABLE_EPG", default_value = "true", action = clap::ArgAction::Set)]
    pub enable_epg: bool,

    /// Default transcode engine (none|soft|qsv|nvenc|vaapi)
    #[arg(long, env = "TRANSCODE_MODE", default_value = "none")]
    pub transcode_mode: String,

    /// Default transcode codec (copy|h264|h265|av1)
    #[arg(long, env = "TRANSCODE_CODEC", default_value = "copy")]
    pub transcode_codec: String,

    /// Path to the EPG database file
    #[arg(long, env = "EPG_DB", default_value = "epg.db")]
    pub epg_db: PathBuf,

    /// Demodulator executable
    #[arg(long, env = "DEMOD_BIN", default_value = "azap")]
    pub demod_bin: String,

    /// Transcoder executable
    #[arg(long, env = "TRANSCODE_BIN", default_value = "ffmpeg")]
    pub transcode_bin: String,

    /// Directory where log files are stored
    #[arg(long, env = "LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, env = "LOG_RETENTION_DAYS", default_value_t = 7)]
    pub log_retention_days: u64,

    /// Enable debug-level logging
    #[arg(short, long, env = "VERBOSE_LOGGING", default_value = "false", action = clap::ArgAction::Set)]
    pub verbose_logging: bool,
}

/// Resolved gateway configuration shared across components.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub channels_conf: PathBuf,
    pub tuner_count: usize,
    pub enable_preemption: bool,
    pub enable_epg: bool,
    pub transcode_mode: Engine,
    pub transcode_codec: Codec,
    pub epg_db: PathBuf,
    pub demod_bin: String,
    pub transcode_bin: String,
}

impl GatewayConfig {
    /// Resolve typed configuration from parsed arguments.
    pub fn from_args(args: &Args) -> Result<Self, String> {
        let transcode_mode = Engine::parse(&args.transcode_mode)
            .ok_or_else(|| format!("unknown TRANSCODE_MODE: {}", args.transcode_mode))?;
        let transcode_codec = Codec::parse(&args.transcode_codec)
            .ok_or_else(|| format!("unknown TRANSCODE_CODEC: {}", args.transcode_codec))?;

        if args.tuner_count == 0 {
            return Err("TUNER_COUNT must be at least 1".into());
        }

        Ok(Self {
            port: args.port,
            channels_conf: args.channels_conf.clone(),
            tuner_count: args.tuner_count,
            enable_preemption: args.enable_preemption,
            enable_epg: args.enable_epg,
            transcode_mode,
            transcode_codec,
            epg_db: args.epg_db.clone(),
            demod_bin: args.demod_bin.clone(),
            transcode_bin: args.transcode_bin.clone(),
        })
    }
}

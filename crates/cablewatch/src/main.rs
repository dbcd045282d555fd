//! # cablewatch
//!
//! Subscribes to one channel on an ActionCable-style gateway and writes
//! filtered, coalesced conversation events to stdout as JSON lines.

#![deny(unsafe_code)]

mod cursor_file;

use std::path::PathBuf;

use anyhow::{Context, Result};
use cablewatch_core::logging::{init_json_subscriber, init_subscriber};
use cablewatch_core::{ChannelIdentity, LastSeenCursor};
use cablewatch_settings::loader::parse_event_list;
use cablewatch_settings::{CablewatchSettings, load_settings_from_path, settings_path};
use cablewatch_stream::{StreamClient, StreamConfig};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Stream conversation events as JSON lines.
#[derive(Parser, Debug)]
#[command(name = "cablewatch", version, about = "Stream conversation events as JSON lines")]
struct Cli {
    /// Settings file (defaults to `~/.cablewatch/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Gateway WebSocket URL.
    #[arg(long)]
    url: Option<String>,

    /// Pub/sub token of the subscribing user.
    #[arg(long, env = "CABLEWATCH_PUBSUB_TOKEN", hide_env_values = true)]
    pubsub_token: String,

    /// Account id.
    #[arg(long, env = "CABLEWATCH_ACCOUNT_ID")]
    account_id: u64,

    /// User id.
    #[arg(long, env = "CABLEWATCH_USER_ID")]
    user_id: u64,

    /// Channel class.
    #[arg(long)]
    channel: Option<String>,

    /// Only stream this conversation (0 streams all).
    #[arg(long, default_value_t = 0)]
    conversation_id: u64,

    /// Only stream messages from the contact.
    #[arg(long)]
    incoming_only: bool,

    /// Comma-separated event allowlist.
    #[arg(long)]
    events: Option<String>,

    /// Coalescing window for new messages, in milliseconds (1-600000).
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Attach original payloads to every record.
    #[arg(long)]
    raw: bool,

    /// Write pending batches before exiting on Ctrl-C.
    #[arg(long)]
    flush_on_shutdown: bool,

    /// File holding the last seen message id.
    #[arg(long)]
    cursor_file: Option<PathBuf>,

    /// Log filter (overridden by `RUST_LOG`).
    #[arg(long)]
    log_level: Option<String>,

    /// Log as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Flags override loaded settings; boolean flags only ever switch on.
    fn apply(&self, settings: &mut CablewatchSettings) {
        if let Some(ref url) = self.url {
            settings.cable_url.clone_from(url);
        }
        if let Some(ref channel) = self.channel {
            settings.channel_name.clone_from(channel);
        }
        if let Some(ref events) = self.events {
            settings.allowed_events = parse_event_list(events);
        }
        if let Some(ms) = self.debounce_ms {
            settings.debounce_window_ms = ms;
        }
        if let Some(ref level) = self.log_level {
            settings.log_level.clone_from(level);
        }
        settings.incoming_only |= self.incoming_only;
        settings.include_raw |= self.raw;
        settings.flush_on_shutdown |= self.flush_on_shutdown;
        settings.log_json |= self.log_json;
    }

    fn identity(&self, settings: &CablewatchSettings) -> ChannelIdentity {
        ChannelIdentity::new(self.pubsub_token.clone(), self.account_id, self.user_id)
            .with_channel(settings.channel_name.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings: {}", path.display()))?;
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    if settings.log_json {
        init_json_subscriber(&settings.log_level);
    } else {
        init_subscriber(&settings.log_level);
    }

    let start = match args.cursor_file {
        Some(ref file) => cursor_file::read(file)?,
        None => 0,
    };
    let cursor = LastSeenCursor::new(start);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let _signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    let client = StreamClient::new(
        StreamConfig::from_settings(&settings, args.conversation_id),
        args.identity(&settings),
    );
    let result = client.run(tokio::io::stdout(), &cursor, cancel).await;

    if let Some(ref file) = args.cursor_file {
        if cursor.get() > start {
            cursor_file::write(file, cursor.get())?;
        }
    }

    result.map_err(|err| {
        let code = err.code();
        anyhow::Error::new(err).context(format!("Stream ended with {code}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cablewatch_settings::DebouncePolicy;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["cablewatch", "--pubsub-token", "tok", "--account-id", "1", "--user-id", "2"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_leave_settings_untouched() {
        let mut settings = CablewatchSettings::default();
        parse(&[]).apply(&mut settings);
        assert_eq!(settings, CablewatchSettings::default());
    }

    #[test]
    fn flags_override_settings() {
        let mut settings = CablewatchSettings {
            debounce_policy: DebouncePolicy::Sliding,
            ..Default::default()
        };
        parse(&[
            "--url",
            "wss://chat.example.com/cable",
            "--channel",
            "InboxChannel",
            "--events",
            "message.created, conversation.opened",
            "--debounce-ms",
            "750",
            "--raw",
            "--incoming-only",
            "--flush-on-shutdown",
            "--log-level",
            "debug",
            "--log-json",
        ])
        .apply(&mut settings);

        assert_eq!(settings.cable_url, "wss://chat.example.com/cable");
        assert_eq!(settings.channel_name, "InboxChannel");
        assert_eq!(settings.allowed_events, vec!["message.created", "conversation.opened"]);
        assert_eq!(settings.debounce_window_ms, 750);
        assert_eq!(settings.debounce_policy, DebouncePolicy::Sliding);
        assert!(settings.include_raw);
        assert!(settings.incoming_only);
        assert!(settings.flush_on_shutdown);
        assert!(settings.log_json);
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn debounce_flag_is_range_checked() {
        let mut settings = CablewatchSettings::default();
        parse(&["--debounce-ms", "600001"]).apply(&mut settings);
        let err = settings.validate().unwrap_err();
        assert_eq!(err.key(), Some("debounceWindowMs"));

        let mut settings = CablewatchSettings::default();
        parse(&["--debounce-ms", "0"]).apply(&mut settings);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn absent_flag_keeps_enabled_setting() {
        let mut settings = CablewatchSettings {
            include_raw: true,
            ..Default::default()
        };
        parse(&[]).apply(&mut settings);
        assert!(settings.include_raw);
    }

    #[test]
    fn identity_uses_configured_channel() {
        let cli = parse(&["--channel", "InboxChannel"]);
        let mut settings = CablewatchSettings::default();
        cli.apply(&mut settings);
        let identity = cli.identity(&settings);
        assert_eq!(identity.channel_name, "InboxChannel");
        assert_eq!(identity.account_id, 1);
        assert_eq!(identity.user_id, 2);
    }

    #[test]
    fn credentials_are_required() {
        assert!(Cli::try_parse_from(["cablewatch"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

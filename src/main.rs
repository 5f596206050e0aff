//! Robeen - spoken answers for new parents
//!
//! `robeen speak <text>` prefetches synthesized speech while you read the
//! text, then plays it gaplessly when you press Enter.
//! `robeen talk` opens a live voice conversation until Ctrl-C.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use robeen::config::RobeenConfig;
use robeen::events::{SessionEvent, Speaker};
use robeen::gemini_client::GeminiLiveConnector;
use robeen::media_in::PulseMicrophone;
use robeen::media_out::PulseOutputDevice;
use robeen::prefetch::{PrefetchPlayer, PrefetchStatus};
use robeen::session::LiveSession;
use robeen::tts::GeminiSpeech;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "usage: robeen speak <text> | robeen talk"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_default();
    let config = RobeenConfig::from_env().context("Failed to load configuration")?;

    match command.as_str() {
        "speak" => {
            let text = args.collect::<Vec<_>>().join(" ");
            if text.trim().is_empty() {
                bail!(usage());
            }
            speak(&config, text).await
        }
        "talk" => talk(&config).await,
        _ => bail!(usage()),
    }
}

async fn speak(config: &RobeenConfig, text: String) -> Result<()> {
    info!("Prefetching speech for {} characters", text.len());
    let speech = GeminiSpeech::new(config.speech_config());
    let player = PrefetchPlayer::prefetch(PulseOutputDevice::new(), speech, text.clone());

    println!("{text}\n");
    println!("Press Enter to listen.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    lines.next_line().await.context("Failed to read stdin")?;

    if let Err(e) = player.play().await {
        match player.status() {
            PrefetchStatus::Failed(reason) => error!("Speech unavailable: {}", reason),
            _ => error!("Playback failed: {}", e),
        }
        return Ok(());
    }

    let mut status = player.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Stopping playback");
            player.stop().await;
        }
        _ = status.wait_for(|s| matches!(s, PrefetchStatus::Finished | PrefetchStatus::Stopped)) => {}
    }
    player.join().await;
    Ok(())
}

async fn talk(config: &RobeenConfig) -> Result<()> {
    let mut session = LiveSession::new(
        PulseMicrophone::new(),
        PulseOutputDevice::new(),
        GeminiLiveConnector::from_api_key(&config.api_key),
        config.live_config(),
    );

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged(state) => info!("Session {:?}", state),
                SessionEvent::Transcript { speaker: Speaker::User, text } => println!("you: {text}"),
                SessionEvent::Transcript { speaker: Speaker::Model, text } => println!("robeen: {text}"),
                SessionEvent::TurnComplete => {}
                SessionEvent::Notice(notice) => eprintln!("{notice}"),
            }
        }
    });

    if session.start().await.is_err() {
        // The notice has already been printed.
        return Ok(());
    }
    println!("Listening. Press Ctrl-C to stop.");

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    session.run(cancel).await;
    Ok(())
}

//! Turnstile Engine - quiz demo entry point.
//!
//! Runs one timed quiz session with simulated teams and prints every
//! published message as a JSON line on stdout. Logs go to stderr.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use turnstile_domain::CommandRequest;
use turnstile_engine::{EngineSettings, SessionHandle, SessionManager};

mod demo;

use demo::{DemoSettings, QuizCommand, QuizMessage, QuizRule, HOST};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = EngineSettings::from_env();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let demo = DemoSettings::from_env();
    tracing::info!(
        max_active_sessions = settings.max_active_sessions,
        teams = demo.teams,
        rounds = demo.rounds,
        round_ms = demo.round_ms,
        "Starting Turnstile quiz demo"
    );

    let manager = SessionManager::new(&settings);
    let session = manager.create_session_with(Arc::new(QuizRule::new(&demo)), || {
        tracing::info!("Quiz session finished");
    })?;

    let printer = tokio::spawn(print_messages(session.clone()));
    let teams: Vec<_> = demo
        .team_names()
        .into_iter()
        .enumerate()
        .map(|(index, team)| tokio::spawn(play(session.clone(), index, team)))
        .collect();

    let host = session.accept(CommandRequest::command(HOST.to_string(), QuizCommand::StartRound));
    tokio::select! {
        result = host => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            manager.close_all().await;
        }
    }

    for team in teams {
        if let Err(e) = team.await {
            tracing::error!(error = %e, "Team task failed");
        }
    }
    printer.await??;

    tracing::info!(remaining_sessions = manager.len(), "Demo finished");
    Ok(())
}

async fn print_messages(session: SessionHandle<QuizRule>) -> anyhow::Result<()> {
    let mut messages = pin!(session.messages());
    while let Some(message) = messages.next().await {
        println!("{}", serde_json::to_string(&message)?);
    }
    Ok(())
}

/// Simulated team: answers every question, sometimes wrongly, after a short
/// think.
async fn play(session: SessionHandle<QuizRule>, index: usize, team: String) {
    let mut messages = pin!(session.messages());
    while let Some(message) = messages.next().await {
        let QuizMessage::RoundStarted { round, .. } = message else {
            continue;
        };

        tokio::time::sleep(Duration::from_millis(20 * (index as u64 + 1))).await;
        let (_, expected) = demo::question(round);
        let answer = if (round as usize + index) % 3 == 0 {
            expected + 1
        } else {
            expected
        };

        let command = QuizCommand::Answer {
            team: team.clone(),
            round,
            answer,
        };
        if let Err(e) = session
            .accept(CommandRequest::command(team.clone(), command))
            .await
        {
            tracing::warn!(team = %team, round, error = %e, "Answer not accepted");
        }
    }
}

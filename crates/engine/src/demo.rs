//! Timed quiz rounds, used by the `turnstile-engine` binary.
//!
//! Teams answer concurrently, each under its own lock. Starting and ending a
//! round takes the shared round lock plus every team lock, so a round never
//! ends while an answer is being recorded. Round endings and the final close
//! are deferred commands.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use turnstile_domain::{Outgoing, ResourceId, RuleError};
use turnstile_engine::settings::parse_var;
use turnstile_engine::{Rule, RuleOutput};

pub const HOST: &str = "host";

const TEAMS_VAR: &str = "TURNSTILE_DEMO_TEAMS";
const ROUNDS_VAR: &str = "TURNSTILE_DEMO_ROUNDS";
const ROUND_MS_VAR: &str = "TURNSTILE_DEMO_ROUND_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoSettings {
    pub teams: usize,
    pub rounds: u32,
    pub round_ms: u64,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            teams: 3,
            rounds: 3,
            round_ms: 300,
        }
    }
}

impl DemoSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            teams: parse_var(&lookup, TEAMS_VAR, defaults.teams).max(1),
            rounds: parse_var(&lookup, ROUNDS_VAR, defaults.rounds).max(1),
            round_ms: parse_var(&lookup, ROUND_MS_VAR, defaults.round_ms).max(1),
        }
    }

    pub fn team_names(&self) -> Vec<String> {
        (1..=self.teams).map(|n| format!("team-{n}")).collect()
    }

    pub fn round_duration(&self) -> Duration {
        Duration::from_millis(self.round_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuizCommand {
    StartRound,
    Answer { team: String, round: u32, answer: u32 },
    EndRound { round: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuizMessage {
    RoundStarted {
        round: u32,
        question: String,
    },
    AnswerRecorded {
        team: String,
        round: u32,
        correct: bool,
    },
    RoundEnded {
        round: u32,
        scores: BTreeMap<String, u32>,
    },
    GameOver {
        winner: Option<String>,
        scores: BTreeMap<String, u32>,
    },
}

/// Question text and expected answer for `round`.
pub fn question(round: u32) -> (String, u32) {
    let (a, b) = (3 * round + 1, 2 * round + 5);
    (format!("{a} + {b}"), a + b)
}

#[derive(Debug, Default)]
struct QuizState {
    round: u32,
    in_round: bool,
    scores: BTreeMap<String, u32>,
    answered: BTreeSet<String>,
}

pub struct QuizRule {
    teams: Vec<String>,
    rounds: u32,
    round_duration: Duration,
    intermission: Duration,
    state: Mutex<QuizState>,
}

impl QuizRule {
    pub fn new(settings: &DemoSettings) -> Self {
        let teams = settings.team_names();
        let scores = teams.iter().map(|team| (team.clone(), 0)).collect();
        Self {
            teams,
            rounds: settings.rounds,
            round_duration: settings.round_duration(),
            intermission: settings.round_duration() / 4,
            state: Mutex::new(QuizState {
                scores,
                ..QuizState::default()
            }),
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, QuizState>, RuleError> {
        self.state
            .lock()
            .map_err(|_| RuleError::validation("quiz state poisoned"))
    }

    fn start_round(&self) -> Result<RuleOutput<QuizRule>, RuleError> {
        let mut state = self.state()?;
        if state.in_round {
            return Err(RuleError::incorrect_stage("in_round", ["between_rounds"]));
        }
        if state.round >= self.rounds {
            return Err(RuleError::incorrect_stage("game_over", ["between_rounds"]));
        }

        state.round += 1;
        state.in_round = true;
        state.answered.clear();
        let round = state.round;
        let (question, _) = question(round);

        Ok(vec![
            Outgoing::message(QuizMessage::RoundStarted { round, question }),
            Outgoing::deferred(
                HOST.to_string(),
                QuizCommand::EndRound { round },
                self.round_duration,
            ),
        ])
    }

    fn answer(
        &self,
        player: &str,
        team: String,
        round: u32,
        answer: u32,
    ) -> Result<RuleOutput<QuizRule>, RuleError> {
        if player != team {
            return Err(RuleError::validation(format!(
                "{player} cannot answer for {team}"
            )));
        }

        let mut state = self.state()?;
        if !state.scores.contains_key(&team) {
            return Err(RuleError::not_found("team", &team));
        }
        if !state.in_round || state.round != round {
            return Err(RuleError::incorrect_stage(
                format!(
                    "round {} ({})",
                    state.round,
                    if state.in_round { "open" } else { "closed" }
                ),
                [format!("round {round} (open)")],
            ));
        }
        if !state.answered.insert(team.clone()) {
            return Err(RuleError::validation(format!(
                "{team} already answered round {round}"
            )));
        }

        let correct = answer == question(round).1;
        if correct {
            *state.scores.entry(team.clone()).or_default() += 1;
        }

        Ok(vec![Outgoing::message(QuizMessage::AnswerRecorded {
            team,
            round,
            correct,
        })])
    }

    fn end_round(&self, round: u32) -> Result<RuleOutput<QuizRule>, RuleError> {
        let mut state = self.state()?;
        if !state.in_round || state.round != round {
            return Err(RuleError::incorrect_stage("between_rounds", ["in_round"]));
        }
        state.in_round = false;

        let scores = state.scores.clone();
        let mut output = vec![Outgoing::message(QuizMessage::RoundEnded {
            round,
            scores: scores.clone(),
        })];

        if round < self.rounds {
            output.push(Outgoing::deferred(
                HOST.to_string(),
                QuizCommand::StartRound,
                self.intermission,
            ));
        } else {
            output.push(Outgoing::message(QuizMessage::GameOver {
                winner: winner(&scores),
                scores,
            }));
            output.push(Outgoing::close_after(self.intermission));
        }
        Ok(output)
    }

    fn round_resources(&self) -> BTreeSet<ResourceId> {
        self.teams
            .iter()
            .map(|team| team_resource(team))
            .chain([ResourceId::from("round")])
            .collect()
    }
}

fn team_resource(team: &str) -> ResourceId {
    ResourceId::new(format!("team:{team}"))
}

/// Team with the strictly highest score, if there is one.
fn winner(scores: &BTreeMap<String, u32>) -> Option<String> {
    let best = scores.values().copied().max()?;
    let mut leaders = scores.iter().filter(|(_, score)| **score == best);
    match (leaders.next(), leaders.next()) {
        (Some((team, _)), None) => Some(team.clone()),
        _ => None,
    }
}

#[async_trait]
impl Rule for QuizRule {
    type Player = String;
    type Command = QuizCommand;
    type Message = QuizMessage;
    type Error = RuleError;

    fn locks_for(&self, command: &QuizCommand) -> BTreeSet<ResourceId> {
        match command {
            QuizCommand::Answer { team, .. } => BTreeSet::from([team_resource(team)]),
            QuizCommand::StartRound | QuizCommand::EndRound { .. } => self.round_resources(),
        }
    }

    async fn process(
        &self,
        player: String,
        command: QuizCommand,
    ) -> Result<RuleOutput<QuizRule>, RuleError> {
        match command {
            QuizCommand::StartRound => self.start_round(),
            QuizCommand::Answer {
                team,
                round,
                answer,
            } => self.answer(&player, team, round, answer),
            QuizCommand::EndRound { round } => self.end_round(round),
        }
    }
}

//! Project lifecycle: `init -> generated -> running -> completed`.
//!
//! Every state entry is persisted to the store before the outcome is
//! returned to the caller, so a crash between commands leaves the on-disk
//! status at the last fully entered state.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SweepError;
use crate::store::ProjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Init,
    Generated,
    Running,
    Completed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Init => "init",
            State::Generated => "generated",
            State::Running => "running",
            State::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<State> {
        match raw {
            "init" => Some(State::Init),
            "generated" => Some(State::Generated),
            "running" => Some(State::Running),
            "completed" => Some(State::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Generate,
    Start,
    Run,
    Cancel,
    Purge,
    Scan,
    Complete,
    Stay,
}

impl Transition {
    /// Name shown to users, `None` for internal transitions.
    pub fn user_name(&self) -> Option<&'static str> {
        match self {
            Transition::Generate => Some("generate"),
            Transition::Start | Transition::Run => Some("run"),
            Transition::Cancel => Some("cancel"),
            Transition::Purge => Some("purge"),
            Transition::Scan | Transition::Complete | Transition::Stay => None,
        }
    }
}

pub fn transitions_from(state: State) -> &'static [Transition] {
    match state {
        State::Init => &[Transition::Generate, Transition::Run, Transition::Stay],
        State::Generated => &[Transition::Start, Transition::Purge, Transition::Stay],
        State::Running => &[
            Transition::Cancel,
            Transition::Purge,
            Transition::Scan,
            Transition::Complete,
            Transition::Stay,
        ],
        State::Completed => &[Transition::Purge, Transition::Scan, Transition::Stay],
    }
}

/// User-facing actions available from `state`.
pub fn allowed_actions(state: State) -> Vec<&'static str> {
    let mut actions: Vec<&'static str> = Vec::new();
    for name in transitions_from(state).iter().filter_map(|t| t.user_name()) {
        if !actions.contains(&name) {
            actions.push(name);
        }
    }
    actions
}

/// User commands routed through the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    Generate,
    Run,
    Cancel,
    Purge,
    Status,
}

impl UserCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserCommand::Generate => "generate",
            UserCommand::Run => "run",
            UserCommand::Cancel => "cancel",
            UserCommand::Purge => "purge",
            UserCommand::Status => "status",
        }
    }
}

/// Side effects behind each transition.
pub trait ProjectActions {
    fn store_mut(&mut self) -> &mut ProjectStore;
    fn generate(&mut self) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn cancel(&mut self) -> Result<()>;
    fn purge(&mut self) -> Result<()>;
    /// Records newly appeared output files. Returns whether every submitted
    /// job now has its output.
    fn scan(&mut self) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub command: &'static str,
    pub ok: bool,
    pub state: State,
    pub stayed: bool,
    pub message: String,
    pub allowed_actions: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    state: State,
}

impl Lifecycle {
    /// Reads the persisted status, defaulting to `init`.
    pub fn open(store: &ProjectStore) -> Lifecycle {
        let state = match store.status() {
            None => State::Init,
            Some(raw) => State::parse(&raw).unwrap_or_else(|| {
                warn!(status = raw.as_str(), "unknown persisted status; starting from init");
                State::Init
            }),
        };
        Lifecycle { state }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Runs `command`. Failed actions and illegal requests come back as an
    /// `Outcome` with `ok == false`; only store failures are errors.
    pub fn execute(
        &mut self,
        command: UserCommand,
        actions: &mut dyn ProjectActions,
    ) -> Result<Outcome> {
        self.scan(actions)?;
        match (command, self.state) {
            (UserCommand::Status, _) => Ok(self.outcome(command, true, false, String::new())),

            (UserCommand::Generate, State::Init) => self.generate(command, actions),
            (UserCommand::Generate, State::Generated) => Ok(self.stay(command)),

            (UserCommand::Run, State::Init) => {
                let outcome = self.generate(command, actions)?;
                if !outcome.ok {
                    return Ok(outcome);
                }
                self.start(command, actions)
            }
            (UserCommand::Run, State::Generated) => self.start(command, actions),
            (UserCommand::Run, State::Running) => Ok(self.stay(command)),

            (UserCommand::Cancel, State::Running) => self.cancel(command, actions),

            (UserCommand::Purge, State::Running) => {
                let outcome = self.cancel(command, actions)?;
                if !outcome.ok {
                    return Ok(outcome);
                }
                self.purge(command, actions)
            }
            (UserCommand::Purge, State::Generated | State::Completed) => {
                self.purge(command, actions)
            }

            _ => {
                let err = SweepError::TransitionNotAllowed {
                    command: command.as_str().to_string(),
                    state: self.state.to_string(),
                };
                warn!("{}", err);
                Ok(self.outcome(command, false, false, err.to_string()))
            }
        }
    }

    fn scan(&mut self, actions: &mut dyn ProjectActions) -> Result<()> {
        if !matches!(self.state, State::Running | State::Completed) {
            return Ok(());
        }
        let all_done = match actions.scan() {
            Ok(done) => done,
            Err(err) => {
                warn!("scanning for output files failed: {:#}", err);
                false
            }
        };
        if all_done && self.state == State::Running {
            self.enter(State::Completed, actions)?;
            info!("all submitted jobs have produced output");
        }
        Ok(())
    }

    fn generate(
        &mut self,
        command: UserCommand,
        actions: &mut dyn ProjectActions,
    ) -> Result<Outcome> {
        match actions.generate() {
            Ok(()) => {
                self.enter(State::Generated, actions)?;
                Ok(self.outcome(command, true, false, "batch files generated".to_string()))
            }
            Err(err) => Ok(self.failed(command, "generate", err)),
        }
    }

    fn start(
        &mut self,
        command: UserCommand,
        actions: &mut dyn ProjectActions,
    ) -> Result<Outcome> {
        match actions.start() {
            Ok(()) => {
                self.enter(State::Running, actions)?;
                self.scan(actions)?;
                Ok(self.outcome(command, true, false, "batch files submitted".to_string()))
            }
            Err(err) => Ok(self.failed(command, "run", err)),
        }
    }

    fn cancel(
        &mut self,
        command: UserCommand,
        actions: &mut dyn ProjectActions,
    ) -> Result<Outcome> {
        match actions.cancel() {
            Ok(()) => {
                self.enter(State::Generated, actions)?;
                Ok(self.outcome(command, true, false, "submitted jobs cancelled".to_string()))
            }
            Err(err) => Ok(self.failed(command, "cancel", err)),
        }
    }

    fn purge(
        &mut self,
        command: UserCommand,
        actions: &mut dyn ProjectActions,
    ) -> Result<Outcome> {
        match actions.purge() {
            Ok(()) => {
                self.enter(State::Init, actions)?;
                Ok(self.outcome(command, true, false, "generated files removed".to_string()))
            }
            Err(err) => Ok(self.failed(command, "purge", err)),
        }
    }

    fn stay(&self, command: UserCommand) -> Outcome {
        info!(state = %self.state, "nothing to do for '{}'", command.as_str());
        self.outcome(command, true, true, format!("already {}", self.state))
    }

    fn failed(&self, command: UserCommand, action: &str, err: anyhow::Error) -> Outcome {
        warn!(state = %self.state, "{} failed: {:#}", action, err);
        self.outcome(command, false, false, format!("{} failed: {:#}", action, err))
    }

    fn enter(&mut self, state: State, actions: &mut dyn ProjectActions) -> Result<()> {
        actions.store_mut().set_status(state.as_str())?;
        self.state = state;
        info!(state = %state, "entered state");
        Ok(())
    }

    fn outcome(&self, command: UserCommand, ok: bool, stayed: bool, message: String) -> Outcome {
        Outcome {
            command: command.as_str(),
            ok,
            state: self.state,
            stayed,
            message,
            allowed_actions: allowed_actions(self.state),
        }
    }
}

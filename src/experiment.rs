use crate::{
    error::{ServerError, ServerResult},
    game::{GameManager, GameTerminationHandler},
    lobby::{LobbyId, LobbyManager, LobbyObserver},
    session::SessionQueue,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ExperimentRun {
    run_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// How a run's session loop came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Exhausted,
    Cancelled,
}

/// Plays a lobby's queued sessions back to back in a background task.
pub struct ExperimentOrchestrator {
    runs: DashMap<LobbyId, ExperimentRun>,
    lobbies: Arc<LobbyManager>,
    sessions: Arc<SessionQueue>,
    games: Arc<GameManager>,
    poll_interval: Duration,
}

impl ExperimentOrchestrator {
    pub fn new(
        lobbies: Arc<LobbyManager>,
        sessions: Arc<SessionQueue>,
        games: Arc<GameManager>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            runs: DashMap::new(),
            lobbies,
            sessions,
            games,
            poll_interval,
        }
    }

    pub fn is_running(&self, lobby_id: &str) -> bool {
        self.runs.contains_key(lobby_id)
    }

    /// Returns the id of the new run.
    pub fn start(self: &Arc<Self>, lobby_id: &str) -> ServerResult<String> {
        if !self.lobbies.exists(lobby_id) {
            return Err(ServerError::lobby_not_found(lobby_id));
        }
        if self.sessions.len(lobby_id) == 0 {
            return Err(ServerError::InvalidArgument(format!(
                "lobby {} has no queued sessions",
                lobby_id
            )));
        }

        if self.is_running(lobby_id) {
            return Err(already_running(lobby_id));
        }
        // Set before the task exists so its exit always clears it
        self.lobbies.set_experiment_running(lobby_id, true)?;

        let run_id = Uuid::new_v4().to_string();
        match self.runs.entry(lobby_id.to_string()) {
            Entry::Occupied(_) => return Err(already_running(lobby_id)),
            Entry::Vacant(entry) => {
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(Arc::clone(self).run(
                    lobby_id.to_string(),
                    run_id.clone(),
                    cancel.clone(),
                ));
                entry.insert(ExperimentRun {
                    run_id: run_id.clone(),
                    cancel,
                    handle,
                });
            }
        }

        info!("Experiment {} started in lobby {}", run_id, lobby_id);
        Ok(run_id)
    }

    /// Cancels the run, waits for it to exit, then puts the lobby back in a
    /// pre-run state with the first remaining session configured.
    pub async fn stop(&self, lobby_id: &str) -> ServerResult<()> {
        if !self.lobbies.exists(lobby_id) {
            return Err(ServerError::lobby_not_found(lobby_id));
        }
        let (_, run) = self
            .runs
            .remove(lobby_id)
            .ok_or_else(|| ServerError::NotFound(format!("experiment in lobby {}", lobby_id)))?;

        run.cancel.cancel();
        if let Err(e) = run.handle.await {
            warn!("Experiment task of lobby {} failed: {}", lobby_id, e);
        }

        match self.games.end(
            lobby_id,
            Some(&run.run_id),
            Some("experiment stopped".to_string()),
        ) {
            Err(e) if e.is_not_found() => debug!("No game to end in lobby {}", lobby_id),
            other => other?,
        }
        if let Err(e) = self.lobbies.set_experiment_running(lobby_id, false) {
            debug!("Lobby {} gone while stopping experiment: {}", lobby_id, e);
        }
        if let Some(first) = self.sessions.first(lobby_id) {
            self.lobbies.configure(lobby_id, first)?;
        }

        info!("Experiment {} in lobby {} stopped", run.run_id, lobby_id);
        Ok(())
    }

    async fn run(self: Arc<Self>, lobby_id: LobbyId, run_id: String, cancel: CancellationToken) {
        match self.run_sessions(&lobby_id, &run_id, &cancel).await {
            Ok(RunEnd::Exhausted) => info!("Experiment {} in lobby {} finished", run_id, lobby_id),
            Ok(RunEnd::Cancelled) => debug!("Experiment {} in lobby {} cancelled", run_id, lobby_id),
            Err(e) => warn!("Experiment {} in lobby {} aborted: {}", run_id, lobby_id, e),
        }

        // A stop() may already have taken the entry
        if self
            .runs
            .remove_if(&lobby_id, |_, run| run.run_id == run_id)
            .is_some()
        {
            if let Err(e) = self.lobbies.set_experiment_running(&lobby_id, false) {
                debug!("Lobby {} gone after its experiment: {}", lobby_id, e);
            }
        }
    }

    async fn run_sessions(
        &self,
        lobby_id: &str,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> ServerResult<RunEnd> {
        while !cancel.is_cancelled() {
            let Some(session) = self.sessions.first(lobby_id) else {
                return Ok(RunEnd::Exhausted);
            };
            self.lobbies.configure(lobby_id, session.clone())?;

            while !self.lobbies.is_ready(lobby_id) {
                if !self.lobbies.exists(lobby_id) {
                    return Err(ServerError::lobby_not_found(lobby_id));
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(RunEnd::Cancelled),
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }

            // The queue may have been edited while players were getting ready
            if self.sessions.first(lobby_id).as_ref() != Some(&session) {
                debug!("Queue of lobby {} changed, reconfiguring", lobby_id);
                continue;
            }

            self.games.start_session(lobby_id, session.clone())?;
            tokio::select! {
                _ = cancel.cancelled() => return Ok(RunEnd::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(session.duration)) => {}
            }

            match self.games.end(lobby_id, Some(run_id), None) {
                Err(e) if e.is_not_found() => {
                    debug!("Game in lobby {} ended before its session did", lobby_id)
                }
                other => other?,
            }
            match self.sessions.remove(lobby_id, session.session_id) {
                Err(e) if e.is_not_found() => {
                    debug!("Session {} left the queue while it played", session.session_id)
                }
                other => other?,
            }
        }
        Ok(RunEnd::Cancelled)
    }

    /// Cancels without waiting; the run removes itself on exit.
    fn cancel(&self, lobby_id: &str) {
        if let Some(run) = self.runs.get(lobby_id) {
            run.cancel.cancel();
        }
    }
}

fn already_running(lobby_id: &str) -> ServerError {
    ServerError::InvalidArgument(format!(
        "an experiment is already running in lobby {}",
        lobby_id
    ))
}

impl GameTerminationHandler for ExperimentOrchestrator {
    fn on_game_aborted(&self, lobby_id: &str) {
        if self.is_running(lobby_id) {
            info!("Game in lobby {} aborted, cancelling its experiment", lobby_id);
            self.cancel(lobby_id);
        }
    }
}

impl LobbyObserver for ExperimentOrchestrator {
    fn on_lobby_removed(&self, lobby_id: &str) {
        self.cancel(lobby_id);
    }
}

//! The tournament scheduler task.
//!
//! A tournament owns a [`System`](crate::tournament_strategy::System)
//! strategy and a [`TournamentState`]; all strategy methods are called
//! from this single task, so strategies need no internal locking. Game
//! runners report back through the same event channel the orchestrator
//! uses to announce ready and dead clients.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::board::{Board, Side};
use crate::bot;
use crate::configuration::Configuration;
use crate::db::{Db, GameRow};
use crate::game::{self, Game, GameContext, Outcome, Referee};
use crate::session::Session;
use crate::tournament_strategy::System;

#[derive(Clone)]
pub enum TournamentEvent {
    /// A client is available to play.
    Ready(Arc<Session>),
    /// A client died or was disqualified.
    Dead(Arc<Session>),
    /// A game has finished.
    Finished(FinishedGame),
}

#[derive(Clone)]
pub struct FinishedGame {
    pub south: Arc<Session>,
    pub north: Arc<Session>,
    pub row: Arc<GameRow>,
    /// Result for South.
    pub outcome: Outcome,
    /// Set when the game ended because this side's session died.
    pub resigned: Option<Side>,
}

impl FinishedGame {
    /// The session eliminated by this result, if the result names one.
    pub fn loser(&self) -> Option<&Arc<Session>> {
        match self.outcome {
            Outcome::Win => Some(&self.north),
            Outcome::Loss | Outcome::Resign => Some(&self.south),
            Outcome::Draw => None,
        }
    }
}

/// A game a strategy decided to hold. `north` is `None` when the
/// opponent is the built-in random agent.
pub struct Pairing {
    pub south: Arc<Session>,
    pub north: Option<Arc<Session>>,
}

/// The participant and in-flight bookkeeping shared with the strategy.
#[derive(Default)]
pub struct TournamentState {
    pub participants: Vec<Arc<Session>>,
    active: HashSet<u64>,
    pending: Vec<Pairing>,
}

impl TournamentState {
    pub fn new(participants: Vec<Arc<Session>>) -> TournamentState {
        TournamentState {
            participants,
            ..TournamentState::default()
        }
    }

    pub fn is_active(&self, session: &Session) -> bool {
        self.active.contains(&session.id)
    }

    pub fn no_games_in_flight(&self) -> bool {
        self.active.is_empty()
    }

    /// Queue a game for the scheduler to launch.
    pub fn start_game(&mut self, south: Arc<Session>, north: Option<Arc<Session>>) {
        self.active.insert(south.id);
        if let Some(north) = &north {
            self.active.insert(north.id);
        }
        self.pending.push(Pairing { south, north });
    }

    pub fn settle(&mut self, game: &FinishedGame) {
        self.active.remove(&game.south.id);
        self.active.remove(&game.north.id);
    }

    pub fn take_pending(&mut self) -> Vec<Pairing> {
        std::mem::take(&mut self.pending)
    }
}

pub struct Tournament {
    state: TournamentState,
    system: Box<dyn System + Send>,
    events: mpsc::Receiver<TournamentEvent>,
    referee: mpsc::Sender<TournamentEvent>,
    /// Number of participants to wait for before play begins.
    expected: usize,
    started: bool,
    id: i64,
    db: Arc<Db>,
    conf: Arc<Configuration>,
    slots: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    /// Cancelled once the tournament is decided.
    complete: CancellationToken,
}

impl Tournament {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        system: Box<dyn System + Send>,
        expected: usize,
        db: Arc<Db>,
        conf: Arc<Configuration>,
        slots: Option<Arc<Semaphore>>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
        complete: CancellationToken,
    ) -> (Tournament, mpsc::Sender<TournamentEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let tournament = Tournament {
            state: TournamentState::default(),
            system,
            events: rx,
            referee: tx.clone(),
            expected,
            started: false,
            id: 0,
            db,
            conf,
            slots,
            tracker,
            shutdown,
            complete,
        };
        (tournament, tx)
    }

    pub async fn run(mut self) {
        let name = self.system.name();
        self.id = match self.db.register_tournament(name.clone()).await {
            Ok(id) => id,
            Err(err) => {
                warn!(%err, "could not register tournament");
                0
            }
        };
        info!(name = %name, expected = self.expected, "tournament waiting for participants");

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match event {
                TournamentEvent::Ready(session) => self.on_ready(session),
                TournamentEvent::Dead(session) => {
                    if self.state.participants.iter().any(|p| p.id == session.id) {
                        self.system.forget(&mut self.state, &session);
                    }
                }
                TournamentEvent::Finished(game) => self.on_finished(game).await,
            }

            if !self.launch().await {
                return;
            }
            if self.started && self.system.over(&self.state) {
                self.close();
                return;
            }
        }
    }

    fn on_ready(&mut self, session: Arc<Session>) {
        if self.state.participants.iter().any(|p| p.id == session.id) {
            if self.started {
                self.system.ready(&mut self.state, session);
            }
            return;
        }
        if self.started {
            info!(session = session.id, "tournament already running, turning client away");
            session.kill();
            return;
        }

        info!(
            session = session.id,
            registered = self.state.participants.len() + 1,
            "participant registered"
        );
        self.state.participants.push(session);
        if self.state.participants.len() == self.expected {
            self.started = true;
            info!("tournament starts");
            for participant in self.state.participants.clone() {
                self.system.ready(&mut self.state, participant);
            }
        }
    }

    async fn on_finished(&mut self, game: FinishedGame) {
        self.state.settle(&game);

        let (south_points, north_points) = match game.outcome {
            Outcome::Win => (1.0, 0.0),
            Outcome::Loss | Outcome::Resign => (0.0, 1.0),
            Outcome::Draw => (0.5, 0.5),
        };
        for (session, points) in [(&game.south, south_points), (&game.north, north_points)] {
            if session.is_bot() {
                continue;
            }
            session.user.add_score(points);
            self.db
                .record_score(session.user.clone(), game.row.clone(), self.id, points)
                .await;
        }

        if let Some(side) = game.resigned {
            let dead = match side {
                Side::South => &game.south,
                Side::North => &game.north,
            };
            self.system.forget(&mut self.state, dead);
        }
        self.system.record(&mut self.state, &game);

        for session in [&game.south, &game.north] {
            if session.is_bot() {
                session.kill();
            } else if session.alive() && self.started {
                self.system.ready(&mut self.state, session.clone());
            }
        }
    }

    /// Spawn runners for every game the strategy queued. Returns false
    /// when shutdown interrupted a slot wait.
    async fn launch(&mut self) -> bool {
        for pairing in self.state.take_pending() {
            let permit = match &self.slots {
                Some(slots) => {
                    let slots = slots.clone();
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return false,
                        permit = slots.acquire_owned() => {
                            Some(permit.expect("slot semaphore closed"))
                        }
                    }
                }
                None => None,
            };

            let north = match pairing.north {
                Some(north) => north,
                None => bot::spawn(self.shutdown.child_token()),
            };
            debug!(south = pairing.south.id, north = north.id, "tournament game");
            let game = Game::new(
                Board::new(self.conf.board_size, self.conf.board_init),
                pairing.south,
                north,
            );
            let ctx = GameContext {
                db: self.db.clone(),
                conf: self.conf.clone(),
                referee: Referee::Tournament(self.referee.clone()),
                permit,
            };
            self.tracker.spawn(async move {
                game::run(game, ctx).await;
            });
        }
        true
    }

    fn close(&mut self) {
        self.system.deinit(&mut self.state);
        let mut standings = self.state.participants.clone();
        standings.sort_by(|a, b| {
            b.user
                .score()
                .partial_cmp(&a.user.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (place, session) in standings.iter().enumerate() {
            info!(
                place = place + 1,
                name = %session.user.name().unwrap_or_else(|| "unnamed".into()),
                score = session.user.score(),
                "final standing"
            );
        }
        self.complete.cancel();
    }
}

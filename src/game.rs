//! The per-game turn state machine.
//!
//! One runner task owns one game, its board and the turn order. It is a
//! cooperative loop over three event sources: move replies from the
//! sessions, death notices from their transports, and the per-move
//! deadline timer. Whichever becomes ready first is handled; everything
//! else the runner does is non-blocking.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::board::{Board, Side};
use crate::configuration::Configuration;
use crate::db::{Db, GameRow, MoveRecord};
use crate::session::{GameHandle, Session};
use crate::tournament::{FinishedGame, TournamentEvent};

/// The result of a game, seen from South's perspective.
///
/// The discriminants are the persisted encoding; 0 is reserved for a
/// game still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Win = 1,
    Draw = 2,
    Loss = 3,
    Resign = 4,
}

impl Outcome {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// One committed (or proposed) move.
#[derive(Debug, Clone)]
pub struct Move {
    pub side: Side,
    pub pit: usize,
    pub comment: Option<String>,
    /// Voluntary end of turn instead of a move.
    pub yields: bool,
    /// Id of the `state` request this answers; 0 addresses the current one.
    pub reference: u64,
    pub when: DateTime<Utc>,
}

impl Move {
    fn substitute(side: Side, pit: usize) -> Move {
        Move {
            side,
            pit,
            comment: None,
            yields: false,
            reference: 0,
            when: Utc::now(),
        }
    }
}

/// Where a finished game reports back to.
#[derive(Clone)]
pub enum Referee {
    /// Freeplay: participants are re-admitted to the queue.
    Matchmaker(mpsc::Sender<Arc<Session>>),
    Tournament(mpsc::Sender<TournamentEvent>),
}

pub struct GameContext {
    pub db: Arc<Db>,
    pub conf: Arc<Configuration>,
    pub referee: Referee,
    /// One unit of the concurrency budget, if games are capped.
    pub permit: Option<OwnedSemaphorePermit>,
}

pub struct Game {
    pub board: Board,
    pub south: Arc<Session>,
    pub north: Arc<Session>,
    pub row: Arc<GameRow>,
    side: Side,
    /// Id of the one outstanding `state` request.
    last: u64,
    /// Only games between two token-carrying agents are persisted.
    logged: bool,
    pub moves: Vec<Move>,
    pub outcome: Option<Outcome>,
}

impl Game {
    pub fn new(board: Board, south: Arc<Session>, north: Arc<Session>) -> Game {
        assert!(
            !Arc::ptr_eq(&south, &north),
            "a session cannot play against itself"
        );
        let row = Arc::new(GameRow::new(&board, south.user.clone(), north.user.clone()));
        Game {
            board,
            south,
            north,
            row,
            side: Side::South,
            last: 0,
            logged: false,
            moves: Vec::new(),
            outcome: None,
        }
    }

    pub fn player(&self, side: Side) -> &Arc<Session> {
        match side {
            Side::South => &self.south,
            Side::North => &self.north,
        }
    }

    /// The board as the given player sees it: every player plays "south".
    fn perspective(&self, side: Side) -> Board {
        match side {
            Side::South => self.board.clone(),
            Side::North => self.board.mirror(),
        }
    }
}

fn answers_current(reference: u64, last: u64) -> bool {
    reference == last || reference == 0
}

/// Play one game to completion. Returns the finished game, mainly for
/// the benefit of tests; callers running under a task tracker drop it.
pub async fn run(mut game: Game, ctx: GameContext) -> Game {
    let (move_tx, mut moves) = mpsc::channel(32);
    let (death_tx, mut deaths) = mpsc::channel(2);
    game.south.enter_game(GameHandle {
        side: Side::South,
        moves: move_tx.clone(),
        deaths: death_tx.clone(),
    });
    game.north.enter_game(GameHandle {
        side: Side::North,
        moves: move_tx,
        deaths: death_tx,
    });

    game.logged = game.south.user.token().is_some() && game.north.user.token().is_some();
    if game.logged {
        ctx.db
            .save_game(game.row.clone(), game.board.to_string(), 0)
            .await;
    }

    debug!(south = game.south.id, north = game.north.id, "game starts");

    game.side = Side::South;
    game.last = game.south.send("state", game.perspective(Side::South));
    let timeout = ctx.conf.timeout;
    let mut deadline = Instant::now() + timeout;
    let mut choice: Option<Move> = None;

    loop {
        let mut advance = false;
        tokio::select! {
            Some(m) = moves.recv() => {
                if m.yields {
                    if m.side == game.side && answers_current(m.reference, game.last) {
                        advance = true;
                    }
                } else if m.side != game.side || !answers_current(m.reference, game.last) {
                    trace!(side = %m.side, reference = m.reference, "ignoring stale move");
                } else if game.player(m.side).simple() && game.player(m.side).stop_imbalance() {
                    // The client moved without answering an earlier stop;
                    // it is slow or confused, not in error.
                    trace!(side = %m.side, "discarding move under yield imbalance");
                } else if !game.board.legal(game.side, m.pit) {
                    game.player(m.side)
                        .error(game.last, &format!("Illegal move {}", m.pit + 1));
                } else {
                    // Keep the move until the deadline; the client may
                    // still improve on it.
                    choice = Some(m);
                }
            }
            Some(dead) = deaths.recv() => {
                return resign(game, ctx, dead).await;
            }
            _ = tokio::time::sleep_until(deadline) => {
                advance = true;
            }
        }

        if !advance {
            continue;
        }

        let current = game.player(game.side).clone();
        // Whether the substitution rule applies is decided before this
        // turn's stop is added to the tally.
        let imbalanced = current.simple() && current.stop_imbalance();
        current.respond(game.last, "stop");
        current.nstop.fetch_add(1, Ordering::AcqRel);

        let m = match choice.take() {
            Some(m) if !imbalanced => m,
            _ => Move::substitute(game.side, game.board.random(game.side)),
        };
        let again = game.board.sow(m.side, m.pit);
        if game.logged {
            ctx.db
                .save_move(MoveRecord {
                    row: game.row.clone(),
                    user: current.user.clone(),
                    side: m.side,
                    pit: m.pit,
                    comment: m.comment.clone(),
                    stamp: m.when,
                    state: game.board.to_string(),
                })
                .await;
        }
        game.moves.push(m);

        if game.board.over() {
            break;
        }
        if !again {
            game.side = !game.side;
        }
        game.last = game
            .player(game.side)
            .send("state", game.perspective(game.side));
        deadline = Instant::now() + timeout;
    }

    finish(game, ctx).await
}

async fn finish(mut game: Game, ctx: GameContext) -> Game {
    let outcome = match game.board.outcome() {
        Some(Side::South) => Outcome::Win,
        Some(Side::North) => Outcome::Loss,
        None => Outcome::Draw,
    };
    game.outcome = Some(outcome);
    info!(
        south = game.south.id,
        north = game.north.id,
        ?outcome,
        moves = game.moves.len(),
        "game over"
    );

    if game.logged {
        ctx.db
            .save_game(game.row.clone(), game.board.to_string(), outcome.as_i64())
            .await;
    }

    game.south.leave_game();
    game.north.leave_game();
    drop(ctx.permit);

    match &ctx.referee {
        Referee::Matchmaker(queue) => {
            for player in [&game.south, &game.north] {
                if player.alive() {
                    let _ = queue.send(player.clone()).await;
                }
            }
        }
        Referee::Tournament(events) => {
            let _ = events
                .send(TournamentEvent::Finished(FinishedGame {
                    south: game.south.clone(),
                    north: game.north.clone(),
                    row: game.row.clone(),
                    outcome,
                    resigned: None,
                }))
                .await;
        }
    }

    game
}

/// One participant died. Give the queue a moment to drop its traces,
/// then either re-admit or kill the survivor.
async fn resign(mut game: Game, ctx: GameContext, dead: Side) -> Game {
    let survivor = game.player(!dead).clone();
    warn!(session = game.player(dead).id, side = %dead, "participant died");

    tokio::time::sleep(Duration::from_secs(1)).await;

    let outcome = match dead {
        Side::South => Outcome::Resign,
        Side::North => Outcome::Win,
    };
    game.outcome = Some(outcome);
    if game.logged {
        ctx.db
            .save_game(game.row.clone(), game.board.to_string(), outcome.as_i64())
            .await;
    }

    game.south.leave_game();
    game.north.leave_game();
    drop(ctx.permit);

    match &ctx.referee {
        Referee::Matchmaker(queue) => {
            if ctx.conf.endless {
                if game.side == !dead {
                    survivor.respond(game.last, "stop");
                }
                if survivor.alive() {
                    let _ = queue.send(survivor).await;
                }
            } else {
                survivor.kill();
            }
        }
        Referee::Tournament(events) => {
            let _ = events
                .send(TournamentEvent::Finished(FinishedGame {
                    south: game.south.clone(),
                    north: game.north.clone(),
                    row: game.row.clone(),
                    outcome,
                    resigned: Some(dead),
                }))
                .await;
        }
    }

    game
}

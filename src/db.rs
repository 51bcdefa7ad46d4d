//! The database coordinator.
//!
//! All persistence goes through here. SQLite is opened twice: a write
//! pool pinned to a single connection, and a read pool for queries.
//! Mutations are submitted as actions on a bounded channel and applied
//! by one writer task in submission order; reads run concurrently on
//! the read pool. The SQL text lives in `sql/` and is embedded at build
//! time: `create-*` and `run-*` files are executed at startup, the rest
//! are indexed by their filename stem (`select-*` on the read side,
//! everything else on the write side).
//!
//! A failed action is logged and abandoned; an in-memory game never
//! stops because a save failed. Failures while opening the database or
//! loading statements are fatal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{ensure, Context};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool, Transaction};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::board::{Board, Side};
use crate::configuration::Configuration;
use crate::session::User;

/// Embedded statement sources, in dependency order.
const SQL_SOURCES: &[(&str, &str)] = &[
    ("create-agent", include_str!("../sql/create-agent.sql")),
    ("create-game", include_str!("../sql/create-game.sql")),
    ("create-move", include_str!("../sql/create-move.sql")),
    ("create-tournament", include_str!("../sql/create-tournament.sql")),
    ("create-score", include_str!("../sql/create-score.sql")),
    ("run-agent-token-index", include_str!("../sql/run-agent-token-index.sql")),
    ("insert-agent", include_str!("../sql/insert-agent.sql")),
    ("insert-game", include_str!("../sql/insert-game.sql")),
    ("update-game", include_str!("../sql/update-game.sql")),
    ("insert-move", include_str!("../sql/insert-move.sql")),
    ("insert-tournament", include_str!("../sql/insert-tournament.sql")),
    ("insert-score", include_str!("../sql/insert-score.sql")),
    ("delete-agent", include_str!("../sql/delete-agent.sql")),
    ("delete-moves", include_str!("../sql/delete-moves.sql")),
    ("select-agent-token", include_str!("../sql/select-agent-token.sql")),
    ("select-agent-id", include_str!("../sql/select-agent-id.sql")),
    ("select-game", include_str!("../sql/select-game.sql")),
    ("select-moves", include_str!("../sql/select-moves.sql")),
    ("select-games", include_str!("../sql/select-games.sql")),
    ("select-agents", include_str!("../sql/select-agents.sql")),
];

/// The persistent identity of one game, shared between its runner and
/// the writer task. `id` is assigned by the first successful insert.
#[derive(Debug)]
pub struct GameRow {
    pub id: AtomicI64,
    pub size: usize,
    pub init: u32,
    pub south: Arc<User>,
    pub north: Arc<User>,
}

impl GameRow {
    pub fn new(board: &Board, south: Arc<User>, north: Arc<User>) -> GameRow {
        GameRow {
            id: AtomicI64::new(0),
            size: board.size(),
            init: board.init(),
            south,
            north,
        }
    }
}

/// A committed move on its way to the `move` table.
pub struct MoveRecord {
    pub row: Arc<GameRow>,
    pub user: Arc<User>,
    pub side: Side,
    pub pit: usize,
    pub comment: Option<String>,
    pub stamp: DateTime<Utc>,
    /// Board after the move, kept on the game row.
    pub state: String,
}

enum Action {
    SaveGame {
        row: Arc<GameRow>,
        state: String,
        outcome: i64,
    },
    SaveMove(MoveRecord),
    Forget {
        token: String,
    },
    RegisterTournament {
        name: String,
        reply: oneshot::Sender<i64>,
    },
    RecordScore {
        user: Arc<User>,
        row: Arc<GameRow>,
        tournament: i64,
        score: f64,
    },
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: i64,
    pub name: Option<String>,
    pub descr: Option<String>,
    pub author: Option<String>,
    pub games: i64,
}

#[derive(Debug, Clone)]
pub struct GameSummary {
    pub id: i64,
    pub size: usize,
    pub init: u32,
    pub south: AgentRecord,
    pub north: AgentRecord,
    pub state: String,
    pub outcome: i64,
}

#[derive(Debug, Clone)]
pub struct ReplayedMove {
    pub side: Side,
    pub pit: usize,
    pub comment: Option<String>,
    pub stamp: DateTime<Utc>,
    /// Reconstructed position after this move.
    pub state: String,
}

/// What [`Db::query_game`] streams: the game, then its moves in order.
#[derive(Debug, Clone)]
pub enum ReplayStep {
    Game(GameSummary),
    Move(ReplayedMove),
}

pub struct Db {
    actions: mpsc::Sender<Action>,
    read: SqlitePool,
    write: SqlitePool,
    queries: Arc<HashMap<&'static str, &'static str>>,
    commands: Arc<HashMap<&'static str, &'static str>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    quit: CancellationToken,
}

fn side_to_i64(side: Side) -> i64 {
    match side {
        Side::South => 0,
        Side::North => 1,
    }
}

impl Db {
    pub async fn open(conf: &Configuration) -> anyhow::Result<Db> {
        let options = SqliteConnectOptions::new()
            .filename(&conf.database)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", "memory")
            .pragma("mmap_size", "268435456")
            .foreign_keys(true);

        let write = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .with_context(|| format!("open database {:?} for writing", conf.database))?;
        let read = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("open database {:?} for reading", conf.database))?;

        let mut queries = HashMap::new();
        let mut commands = HashMap::new();
        for &(name, source) in SQL_SOURCES {
            if name.starts_with("create-") || name.starts_with("run-") {
                sqlx::query(source)
                    .execute(&write)
                    .await
                    .with_context(|| format!("run startup statement {name}"))?;
            } else if name.starts_with("select-") {
                queries.insert(name, source);
            } else {
                commands.insert(name, source);
            }
        }
        ensure!(
            !queries.is_empty() && !commands.is_empty(),
            "no SQL statements embedded"
        );

        let queries = Arc::new(queries);
        let commands = Arc::new(commands);
        let quit = CancellationToken::new();
        let (actions, inbox) = mpsc::channel(64);
        let writer = tokio::spawn(writer(
            inbox,
            write.clone(),
            read.clone(),
            queries.clone(),
            commands.clone(),
            quit.clone(),
        ));

        info!(database = ?conf.database, "database ready");
        Ok(Db {
            actions,
            read,
            write,
            queries,
            commands,
            writer: Mutex::new(Some(writer)),
            quit,
        })
    }

    fn query(&self, name: &str) -> &'static str {
        self.queries
            .get(name)
            .copied()
            .unwrap_or_else(|| panic!("no such query: {name}"))
    }

    /// Background duties: nightly maintenance and `VACUUM` on SIGUSR1.
    pub fn start_maintenance(&self, tracker: &TaskTracker, cancel: &CancellationToken) {
        let write = self.write.clone();
        let commands = self.commands.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let period = Duration::from_secs(24 * 60 * 60);
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            let mut vacuum =
                signal(SignalKind::user_defined1()).expect("cannot install SIGUSR1 handler");
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        let prune = sqlx::query(commands["delete-moves"]).execute(&write).await;
                        match prune {
                            Ok(done) => debug!(rows = done.rows_affected(), "pruned stale moves"),
                            Err(err) => warn!(%err, "could not prune stale moves"),
                        }
                        sqlx::query("PRAGMA optimize;").execute(&write).await
                    }
                    _ = vacuum.recv() => {
                        info!("running VACUUM");
                        sqlx::query("VACUUM;").execute(&write).await
                    }
                };
                if let Err(err) = result {
                    warn!(%err, "database maintenance failed");
                }
            }
        });
    }

    /// Drain submitted actions, then optimise and close the connections.
    pub async fn shutdown(&self) {
        self.quit.cancel();
        let writer = self.writer.lock().expect("writer lock").take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        if let Err(err) = sqlx::query("PRAGMA optimize;").execute(&self.write).await {
            warn!(%err, "final optimize failed");
        }
        self.write.close().await;
        self.read.close().await;
        info!("database closed");
    }

    async fn submit(&self, action: Action) {
        if self.actions.send(action).await.is_err() {
            warn!("database coordinator is gone, dropping action");
        }
    }

    /// Persist a game (and its users on the first save).
    pub async fn save_game(&self, row: Arc<GameRow>, state: String, outcome: i64) {
        self.submit(Action::SaveGame {
            row,
            state,
            outcome,
        })
        .await;
    }

    pub async fn save_move(&self, record: MoveRecord) {
        self.submit(Action::SaveMove(record)).await;
    }

    /// Delete the agent addressed by this token.
    pub async fn forget(&self, token: String) {
        self.submit(Action::Forget { token }).await;
    }

    pub async fn register_tournament(&self, name: String) -> anyhow::Result<i64> {
        let (reply, answer) = oneshot::channel();
        self.actions
            .send(Action::RegisterTournament { name, reply })
            .await
            .map_err(|_| anyhow::anyhow!("database coordinator is gone"))?;
        answer.await.context("tournament registration failed")
    }

    pub async fn record_score(&self, user: Arc<User>, row: Arc<GameRow>, tournament: i64, score: f64) {
        self.submit(Action::RecordScore {
            user,
            row,
            tournament,
            score,
        })
        .await;
    }

    pub async fn query_user_token(&self, token: &str) -> Option<AgentRecord> {
        let row = sqlx::query(self.query("select-agent-token"))
            .bind(token)
            .fetch_optional(&self.read)
            .await
            .map_err(|err| warn!(%err, "token lookup failed"))
            .ok()??;
        Some(AgentRecord {
            id: row.try_get(0).ok()?,
            name: row.try_get(1).ok()?,
            descr: row.try_get(2).ok()?,
            author: None,
            games: 0,
        })
    }

    async fn lookup_user(&self, id: i64) -> anyhow::Result<AgentRecord> {
        let row = sqlx::query(self.query("select-agent-id"))
            .bind(id)
            .fetch_one(&self.read)
            .await?;
        Ok(AgentRecord {
            id,
            name: row.try_get(0)?,
            descr: row.try_get(1)?,
            author: row.try_get(2)?,
            games: row.try_get(3)?,
        })
    }

    /// Stream a stored game and its moves, replaying each move to
    /// reconstruct the intermediate positions. The stream ends (the
    /// channel closes) on completion, on error, or at the first move
    /// that does not replay.
    pub async fn query_game(&self, game: i64, out: mpsc::Sender<ReplayStep>) {
        if let Err(err) = self.replay(game, &out).await {
            warn!(%err, game, "game query failed");
        }
    }

    async fn replay(&self, game: i64, out: &mpsc::Sender<ReplayStep>) -> anyhow::Result<()> {
        let Some(row) = sqlx::query(self.query("select-game"))
            .bind(game)
            .fetch_optional(&self.read)
            .await?
        else {
            return Ok(());
        };
        let summary = self.summarize(&row).await?;
        let mut board = Board::new(summary.size, summary.init);
        let final_state = summary.state.clone();
        if out.send(ReplayStep::Game(summary)).await.is_err() {
            return Ok(());
        }

        let moves = sqlx::query(self.query("select-moves"))
            .bind(game)
            .fetch_all(&self.read)
            .await?;
        for row in moves {
            let side = match row.try_get::<i64, _>(1)? {
                0 => Side::South,
                _ => Side::North,
            };
            let pit = row.try_get::<i64, _>(2)? as usize;
            if !board.legal(side, pit) {
                warn!(game, %side, pit, "stored move does not replay, ending stream");
                return Ok(());
            }
            board.sow(side, pit);
            let step = ReplayStep::Move(ReplayedMove {
                side,
                pit,
                comment: row.try_get(3)?,
                stamp: row.try_get(4)?,
                state: board.to_string(),
            });
            if out.send(step).await.is_err() {
                return Ok(());
            }
        }
        if board.to_string() != final_state {
            warn!(game, "replayed moves do not reach the stored final state");
        }
        Ok(())
    }

    async fn summarize(&self, row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<GameSummary> {
        let north = self.lookup_user(row.try_get(3)?).await?;
        let south = self.lookup_user(row.try_get(4)?).await?;
        Ok(GameSummary {
            id: row.try_get(0)?,
            size: row.try_get::<i64, _>(1)? as usize,
            init: row.try_get::<i64, _>(2)? as u32,
            south,
            north,
            state: row.try_get(5)?,
            outcome: row.try_get(6)?,
        })
    }

    /// Stream a page of recent games.
    pub async fn query_games(&self, page: i64, out: mpsc::Sender<GameSummary>) {
        let rows = match sqlx::query(self.query("select-games"))
            .bind(page)
            .fetch_all(&self.read)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%err, "games query failed");
                return;
            }
        };
        for row in rows {
            match self.summarize(&row).await {
                Ok(summary) => {
                    if out.send(summary).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(%err, "games query failed");
                    return;
                }
            }
        }
    }

    /// Stream a page of named agents, most games first.
    pub async fn query_users(&self, page: i64, out: mpsc::Sender<AgentRecord>) {
        let rows = match sqlx::query(self.query("select-agents"))
            .bind(page)
            .fetch_all(&self.read)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%err, "agents query failed");
                return;
            }
        };
        for row in rows {
            let record = AgentRecord {
                id: row.try_get(0).unwrap_or_default(),
                name: row.try_get(1).unwrap_or_default(),
                descr: None,
                author: row.try_get(2).unwrap_or_default(),
                games: row.try_get(3).unwrap_or_default(),
            };
            if out.send(record).await.is_err() {
                return;
            }
        }
    }
}

async fn writer(
    mut inbox: mpsc::Receiver<Action>,
    write: SqlitePool,
    read: SqlitePool,
    queries: Arc<HashMap<&'static str, &'static str>>,
    commands: Arc<HashMap<&'static str, &'static str>>,
    quit: CancellationToken,
) {
    loop {
        let action = tokio::select! {
            _ = quit.cancelled() => break,
            action = inbox.recv() => match action {
                Some(action) => action,
                None => return,
            },
        };
        if let Err(err) = apply(action, &write, &read, &queries, &commands).await {
            warn!(%err, "database action failed");
        }
    }
    // Drain what was submitted before shutdown.
    while let Ok(action) = inbox.try_recv() {
        if let Err(err) = apply(action, &write, &read, &queries, &commands).await {
            warn!(%err, "database action failed");
        }
    }
}

async fn apply(
    action: Action,
    write: &SqlitePool,
    read: &SqlitePool,
    queries: &HashMap<&'static str, &'static str>,
    commands: &HashMap<&'static str, &'static str>,
) -> anyhow::Result<()> {
    match action {
        Action::SaveGame {
            row,
            state,
            outcome,
        } => {
            let mut tx = write.begin().await?;
            save_user(&mut tx, read, queries, commands, &row.south).await?;
            save_user(&mut tx, read, queries, commands, &row.north).await?;
            save_game(&mut tx, commands, &row, &state, outcome).await?;
            tx.commit().await?;
        }
        Action::SaveMove(record) => {
            let mut tx = write.begin().await?;
            save_user(&mut tx, read, queries, commands, &record.row.south).await?;
            save_user(&mut tx, read, queries, commands, &record.row.north).await?;
            save_game(&mut tx, commands, &record.row, &record.state, 0).await?;
            sqlx::query(commands["insert-move"])
                .bind(record.row.id.load(Ordering::Acquire))
                .bind(record.user.id.load(Ordering::Acquire))
                .bind(side_to_i64(record.side))
                .bind(record.pit as i64)
                .bind(&record.comment)
                .bind(record.stamp)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Action::Forget { token } => {
            sqlx::query(commands["delete-agent"])
                .bind(&token)
                .execute(write)
                .await?;
        }
        Action::RegisterTournament { name, reply } => {
            let done = sqlx::query(commands["insert-tournament"])
                .bind(&name)
                .execute(write)
                .await?;
            let _ = reply.send(done.last_insert_rowid());
        }
        Action::RecordScore {
            user,
            row,
            tournament,
            score,
        } => {
            let (agent, game) = (
                user.id.load(Ordering::Acquire),
                row.id.load(Ordering::Acquire),
            );
            if agent == 0 || game == 0 {
                debug!("score for an unsaved agent or game, skipping");
                return Ok(());
            }
            sqlx::query(commands["insert-score"])
                .bind(agent)
                .bind(game)
                .bind(tournament)
                .bind(score)
                .execute(write)
                .await?;
        }
    }
    Ok(())
}

/// Ensure the user has a row. Identity drift (same token, different
/// name or description) appends a fresh row; the token lookup prefers
/// the newest.
async fn save_user(
    tx: &mut Transaction<'_, sqlx::Sqlite>,
    read: &SqlitePool,
    queries: &HashMap<&'static str, &'static str>,
    commands: &HashMap<&'static str, &'static str>,
    user: &Arc<User>,
) -> anyhow::Result<()> {
    if user.id.load(Ordering::Acquire) != 0 {
        return Ok(());
    }

    if let Some(token) = user.token() {
        let known = sqlx::query(queries["select-agent-token"])
            .bind(&token)
            .fetch_optional(read)
            .await?;
        if let Some(row) = known {
            let id: i64 = row.try_get(0)?;
            let name: Option<String> = row.try_get(1)?;
            let descr: Option<String> = row.try_get(2)?;
            if name == user.name() && descr == user.descr() {
                user.id.store(id, Ordering::Release);
                return Ok(());
            }
            debug!(id, "agent identity drifted, inserting a fresh row");
        }
    }

    let done = sqlx::query(commands["insert-agent"])
        .bind(user.token())
        .bind(user.name())
        .bind(user.descr())
        .bind(user.author())
        .execute(&mut **tx)
        .await?;
    user.id.store(done.last_insert_rowid(), Ordering::Release);
    Ok(())
}

async fn save_game(
    tx: &mut Transaction<'_, sqlx::Sqlite>,
    commands: &HashMap<&'static str, &'static str>,
    row: &Arc<GameRow>,
    state: &str,
    outcome: i64,
) -> anyhow::Result<()> {
    if row.id.load(Ordering::Acquire) == 0 {
        let done = sqlx::query(commands["insert-game"])
            .bind(row.size as i64)
            .bind(row.init as i64)
            .bind(row.north.id.load(Ordering::Acquire))
            .bind(row.south.id.load(Ordering::Acquire))
            .bind(state)
            .execute(&mut **tx)
            .await?;
        row.id.store(done.last_insert_rowid(), Ordering::Release);
    } else {
        sqlx::query(commands["update-game"])
            .bind(state)
            .bind(outcome)
            .bind(row.id.load(Ordering::Acquire))
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn scratch_database() -> std::path::PathBuf {
    use std::sync::atomic::AtomicU32;
    static SCRATCH: AtomicU32 = AtomicU32::new(0);
    std::env::temp_dir().join(format!(
        "kgpd-test-{}-{}.db",
        std::process::id(),
        SCRATCH.fetch_add(1, Ordering::Relaxed)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open() -> Db {
        let conf = Configuration::default().with_database(scratch_database());
        Db::open(&conf).await.expect("open database")
    }

    fn user(token: &str, name: &str) -> Arc<User> {
        let user = User::with_token(token);
        *user.name.write().expect("name lock") = Some(name.to_string());
        user
    }

    /// The action queue is serial, so a registration doubles as a
    /// write barrier in tests.
    async fn flush(db: &Db) {
        db.register_tournament("flush".to_string())
            .await
            .expect("flush barrier");
    }

    #[tokio::test]
    async fn a_game_round_trips_through_the_database() {
        let db = open().await;
        let south = user("token-south", "alice");
        let north = user("token-north", "bob");
        let mut board = Board::new(3, 3);
        let row = Arc::new(GameRow::new(&board, south.clone(), north.clone()));

        db.save_game(row.clone(), board.to_string(), 0).await;

        let script = [(Side::South, 0), (Side::South, 1), (Side::North, 2)];
        for (side, pit) in script {
            board.sow(side, pit);
            db.save_move(MoveRecord {
                row: row.clone(),
                user: if side == Side::South {
                    south.clone()
                } else {
                    north.clone()
                },
                side,
                pit,
                comment: Some(format!("{side} {pit}")),
                stamp: Utc::now(),
                state: board.to_string(),
            })
            .await;
        }
        db.save_game(row.clone(), board.to_string(), 3).await;
        flush(&db).await;

        let id = row.id.load(Ordering::Acquire);
        assert!(id != 0, "game id assigned");
        assert!(south.id.load(Ordering::Acquire) != 0);

        let (tx, mut rx) = mpsc::channel(16);
        db.query_game(id, tx).await;

        let Some(ReplayStep::Game(summary)) = rx.recv().await else {
            panic!("expected the game first");
        };
        assert_eq!(summary.id, id);
        assert_eq!(summary.state, board.to_string());
        assert_eq!(summary.outcome, 3);
        assert_eq!(summary.south.name.as_deref(), Some("alice"));
        assert_eq!(summary.south.games, 1);

        let mut last = None;
        let mut count = 0;
        while let Some(step) = rx.recv().await {
            let ReplayStep::Move(m) = step else {
                panic!("game must come first");
            };
            count += 1;
            last = Some(m.state);
        }
        assert_eq!(count, script.len());
        // The stored moves replay to the final saved position.
        assert_eq!(last.as_deref(), Some(board.to_string().as_str()));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn identical_agents_keep_their_id_and_drifted_ones_do_not() {
        let db = open().await;
        let board = Board::new(3, 3);

        let first = user("shared-token", "alice");
        let partner = user("partner-token", "bob");
        let row = Arc::new(GameRow::new(&board, first.clone(), partner.clone()));
        db.save_game(row, board.to_string(), 0).await;
        flush(&db).await;
        let original = first.id.load(Ordering::Acquire);
        assert!(original != 0);

        // Same token and metadata: the identity is reused.
        let same = user("shared-token", "alice");
        let partner2 = user("partner-token", "bob");
        let row = Arc::new(GameRow::new(&board, same.clone(), partner2.clone()));
        db.save_game(row, board.to_string(), 0).await;
        flush(&db).await;
        assert_eq!(same.id.load(Ordering::Acquire), original);
        assert_eq!(partner2.id.load(Ordering::Acquire), partner.id.load(Ordering::Acquire));

        // Same token, new name: agents are append-only under drift.
        let drifted = user("shared-token", "alice v2");
        let partner3 = user("partner-token", "bob");
        let row = Arc::new(GameRow::new(&board, drifted.clone(), partner3.clone()));
        db.save_game(row, board.to_string(), 0).await;
        flush(&db).await;
        let fresh = drifted.id.load(Ordering::Acquire);
        assert!(fresh != 0 && fresh != original);

        // The token now resolves to the newest identity.
        let found = db.query_user_token("shared-token").await.expect("found");
        assert_eq!(found.id, fresh);
        assert_eq!(found.name.as_deref(), Some("alice v2"));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn forget_deletes_the_agent_row() {
        let db = open().await;
        let board = Board::new(3, 3);
        let doomed = user("doomed-token", "carol");
        let partner = user("partner-token-2", "dave");
        let row = Arc::new(GameRow::new(&board, doomed, partner));
        db.save_game(row, board.to_string(), 0).await;
        flush(&db).await;
        assert!(db.query_user_token("doomed-token").await.is_some());

        db.forget("doomed-token".to_string()).await;
        flush(&db).await;
        assert!(db.query_user_token("doomed-token").await.is_none());
        db.shutdown().await;
    }

    #[tokio::test]
    async fn tournament_scores_are_recorded() {
        let db = open().await;
        let board = Board::new(3, 3);
        let south = user("score-south", "eve");
        let north = user("score-north", "frank");
        let row = Arc::new(GameRow::new(&board, south.clone(), north));
        db.save_game(row.clone(), board.to_string(), 0).await;
        let tournament = db
            .register_tournament("round-robin-3".to_string())
            .await
            .expect("register");
        assert!(tournament > 0);

        db.record_score(south.clone(), row, tournament, 1.0).await;
        flush(&db).await;

        let row = sqlx::query("SELECT score FROM score WHERE agent_id = ? AND tournament_id = ?")
            .bind(south.id.load(Ordering::Acquire))
            .bind(tournament)
            .fetch_one(&db.read)
            .await
            .expect("score row");
        let score: f64 = row.try_get(0).expect("score column");
        assert_eq!(score, 1.0);
        db.shutdown().await;
    }
}

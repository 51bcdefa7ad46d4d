//! A live client connection and its request/response state.
//!
//! A [`Session`] is shared behind an [`Arc`]: the matchmaker keeps it in
//! its queue, a game runner holds it while a game is in progress, and the
//! database coordinator receives its [`User`] for persistence. The only
//! state mutated across tasks are the atomic counters and the one-shot
//! kill token; everything else flows through channels.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::board::Side;
use crate::game::Move;
use crate::proto::{self, Command};

/// A persistent agent identity, possibly played by many sessions over
/// time. Created on first connect and looked up by token on save.
///
/// `id` is the database row id, 0 while unsaved; the database coordinator
/// assigns it on the first successful insert.
#[derive(Debug, Default)]
pub struct User {
    pub id: AtomicI64,
    pub token: RwLock<Option<String>>,
    pub name: RwLock<Option<String>>,
    pub descr: RwLock<Option<String>>,
    pub author: RwLock<Option<String>>,
    pub score: Mutex<f64>,
}

impl User {
    pub fn anonymous() -> Arc<User> {
        Arc::new(User::default())
    }

    pub fn with_token(token: &str) -> Arc<User> {
        let user = User::default();
        *user.token.write().expect("token lock") = Some(token.to_string());
        Arc::new(user)
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().expect("token lock").clone()
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().expect("name lock").clone()
    }

    pub fn descr(&self) -> Option<String> {
        self.descr.read().expect("descr lock").clone()
    }

    pub fn author(&self) -> Option<String> {
        self.author.read().expect("author lock").clone()
    }

    pub fn score(&self) -> f64 {
        *self.score.lock().expect("score lock")
    }

    pub fn add_score(&self, points: f64) {
        *self.score.lock().expect("score lock") += points;
    }
}

/// The channels a game runner exposes to its two participants.
#[derive(Clone)]
pub struct GameHandle {
    pub side: Side,
    pub moves: mpsc::Sender<Move>,
    pub deaths: mpsc::Sender<Side>,
}

/// Session happenings the orchestrator routes: a client became ready to
/// play (it sent `mode`), or its connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Ready,
    Closed,
}

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

pub struct Session {
    pub id: u64,
    pub user: Arc<User>,
    /// Outgoing wire lines, drained by the transport task.
    out: mpsc::UnboundedSender<String>,
    next_request: AtomicU64,
    pub nstop: AtomicU64,
    pub nyield: AtomicU64,
    simple: AtomicBool,
    ready: AtomicBool,
    bot: bool,
    killed: CancellationToken,
    game: Mutex<Option<GameHandle>>,
}

impl Session {
    pub fn new(
        user: Arc<User>,
        killed: CancellationToken,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<String>) {
        Session::build(user, killed, false)
    }

    /// A session for a built-in agent; never re-admitted by tournaments.
    pub fn internal(
        user: Arc<User>,
        killed: CancellationToken,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<String>) {
        Session::build(user, killed, true)
    }

    fn build(
        user: Arc<User>,
        killed: CancellationToken,
        bot: bool,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<String>) {
        let (out, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            id: SESSION_IDS.fetch_add(1, Ordering::Relaxed),
            user,
            out,
            next_request: AtomicU64::new(0),
            nstop: AtomicU64::new(0),
            nyield: AtomicU64::new(0),
            simple: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            bot,
            killed,
            game: Mutex::new(None),
        });
        (session, rx)
    }

    pub fn is_bot(&self) -> bool {
        self.bot
    }

    pub fn simple(&self) -> bool {
        self.simple.load(Ordering::Acquire)
    }

    /// True while the client owes a `yield` for an earlier `stop`.
    pub fn stop_imbalance(&self) -> bool {
        self.nstop.load(Ordering::Acquire) != self.nyield.load(Ordering::Acquire)
    }

    /// Issue a server request with a fresh id and return it.
    pub fn send(&self, tag: &str, payload: impl std::fmt::Display) -> u64 {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.out.send(format!("{id} {tag} {payload}"));
        id
    }

    /// Notify the client, referencing one of our earlier requests.
    pub fn respond(&self, reference: u64, tag: &str) {
        let _ = self.out.send(format!("@{reference} {tag}"));
    }

    pub fn error(&self, reference: u64, text: &str) {
        let _ = self.out.send(format!("@{reference} error {text}"));
    }

    pub fn greet(&self) {
        let _ = self.out.send("kgp 1 0 0".to_string());
    }

    /// Close the session. Idempotent; the transport task observes the
    /// token, tears the connection down and reports the death to any
    /// owning game.
    pub fn kill(&self) {
        self.killed.cancel();
    }

    pub fn alive(&self) -> bool {
        !self.killed.is_cancelled()
    }

    pub fn killed(&self) -> &CancellationToken {
        &self.killed
    }

    /// Bind this session to a game for the duration of a match.
    ///
    /// # Panics
    ///
    /// A session can be part of at most one game; a second bind is a
    /// scheduling bug.
    pub fn enter_game(&self, handle: GameHandle) {
        let mut game = self.game.lock().expect("game lock");
        assert!(
            game.is_none(),
            "session {} is already part of a game",
            self.id
        );
        *game = Some(handle);
    }

    pub fn leave_game(&self) {
        *self.game.lock().expect("game lock") = None;
    }

    pub fn current_game(&self) -> Option<GameHandle> {
        self.game.lock().expect("game lock").clone()
    }

    /// Interpret one line from the client. Returns an event the
    /// orchestrator must act upon, if any.
    pub async fn handle_line(&self, raw: &str) -> Option<Event> {
        let line = match proto::parse(raw) {
            Ok(line) => line,
            Err(failure) => {
                if failure.error == proto::ProtocolError::Empty {
                    return None;
                }
                trace!(session = self.id, %failure, "protocol violation");
                self.error(failure.id.unwrap_or(0), &failure.to_string());
                return None;
            }
        };

        match line.command {
            Command::Move { pit, comment } => {
                if let Some(handle) = self.current_game() {
                    let _ = handle
                        .moves
                        .send(Move {
                            side: handle.side,
                            pit,
                            comment,
                            yields: false,
                            reference: line.reference.unwrap_or(0),
                            when: chrono::Utc::now(),
                        })
                        .await;
                }
                None
            }
            Command::Yield => {
                // A yield first answers the oldest outstanding stop; the
                // runner decides whether it also ends the current turn.
                let owed = self.nyield.load(Ordering::Acquire) < self.nstop.load(Ordering::Acquire);
                if owed {
                    self.nyield.fetch_add(1, Ordering::AcqRel);
                }
                if let Some(handle) = self.current_game() {
                    let _ = handle
                        .moves
                        .send(Move {
                            side: handle.side,
                            pit: 0,
                            comment: None,
                            yields: true,
                            reference: line.reference.unwrap_or(0),
                            when: chrono::Utc::now(),
                        })
                        .await;
                }
                None
            }
            Command::Set { key, value } => {
                match key.as_str() {
                    "name" => *self.user.name.write().expect("name lock") = Some(value),
                    "descr" => *self.user.descr.write().expect("descr lock") = Some(value),
                    "author" => *self.user.author.write().expect("author lock") = Some(value),
                    "token" => *self.user.token.write().expect("token lock") = Some(value),
                    other => debug!(session = self.id, key = other, "ignoring unknown option"),
                }
                None
            }
            Command::Mode { name } => {
                if name == "simple" {
                    self.simple.store(true, Ordering::Release);
                }
                // The mode command doubles as the ready signal; only the
                // first one enqueues the client.
                (!self.ready.swap(true, Ordering::AcqRel)).then_some(Event::Ready)
            }
            Command::Goodbye => {
                self.kill();
                Some(Event::Closed)
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.user.name())
            .finish()
    }
}

/// Run a TCP connection: forward outgoing lines, feed incoming lines to
/// the session, and on any exit path report the death to the owning game
/// and the orchestrator.
pub async fn drive(
    session: Arc<Session>,
    stream: TcpStream,
    mut out: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<(Arc<Session>, Event)>,
) {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            _ = session.killed.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(event) = session.handle_line(&line).await {
                        if event == Event::Closed {
                            break;
                        }
                        let _ = events.send((session.clone(), event)).await;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(session = session.id, ?peer, %err, "read failed");
                    break;
                }
            },
            Some(line) = out.recv() => {
                if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }

    session.kill();
    if let Some(handle) = session.current_game() {
        if handle.deaths.send(handle.side).await.is_err() {
            warn!(session = session.id, "game is gone, death not delivered");
        }
    }
    let _ = events.send((session, Event::Closed)).await;
}

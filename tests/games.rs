//! End-to-end tests: a real server on an ephemeral port, with scripted
//! agents speaking KGP over TCP.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use kgpd::configuration::Configuration;
use kgpd::db::{Db, ReplayStep};
use kgpd::server::Server;

fn scratch_database() -> PathBuf {
    static SCRATCH: AtomicU32 = AtomicU32::new(0);
    std::env::temp_dir().join(format!(
        "kgpd-e2e-{}-{}.db",
        std::process::id(),
        SCRATCH.fetch_add(1, Ordering::Relaxed)
    ))
}

struct Agent {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Agent {
    async fn connect(addr: std::net::SocketAddr, token: &str, name: &str) -> Agent {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        let mut agent = Agent {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        let greeting = agent.recv().await.expect("greeting");
        assert!(greeting.starts_with("kgp "), "unexpected greeting {greeting:?}");
        agent.send(&format!("set name {name}")).await;
        agent.send(&format!("set token {token}")).await;
        agent.send("mode freeplay").await;
        agent
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("send line");
    }

    async fn recv(&mut self) -> Option<String> {
        timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("line within ten seconds")
            .expect("socket healthy")
    }

    /// Answer every state request with "pit 1, then yield" until the
    /// connection goes away.
    async fn autoplay(mut self) {
        while let Some(line) = self.lines.next_line().await.ok().flatten() {
            if let Some(id) = state_id(&line) {
                self.send(&format!("@{id} move 1")).await;
                self.send(&format!("@{id} yield")).await;
            }
        }
    }
}

fn state_id(line: &str) -> Option<u64> {
    let (head, rest) = line.split_once(' ')?;
    if !rest.starts_with("state ") {
        return None;
    }
    head.parse().ok()
}

fn base_conf() -> Configuration {
    Configuration::default()
        .with_database(scratch_database())
        .with_listen("127.0.0.1:0")
        .with_board(1, 1)
        .with_timeout(Duration::from_secs(10))
}

#[tokio::test]
async fn a_freeplay_game_is_played_and_persisted() {
    let conf = base_conf();
    let database = conf.database.clone();
    let server = Server::bind(conf).await.expect("bind");
    let addr = server.local_addr().expect("local addr");
    let server = tokio::spawn(server.run());

    // On a one-pit board every game is a single move: the stone lands in
    // the store, the sweep balances things out, and the game is a draw.
    let alice = Agent::connect(addr, "token-alice", "alice").await;
    let bob = Agent::connect(addr, "token-bob", "bob").await;
    let players = [tokio::spawn(alice.autoplay()), tokio::spawn(bob.autoplay())];

    // The writer task applies saves asynchronously; poll until the first
    // game shows up finished.
    let check = Db::open(&Configuration::default().with_database(database))
        .await
        .expect("open database for checking");
    let mut summary = None;
    for _ in 0..100 {
        let (tx, mut rx) = mpsc::channel(16);
        check.query_game(1, tx).await;
        if let Some(ReplayStep::Game(game)) = rx.recv().await {
            if game.outcome != 0 {
                let mut moves = Vec::new();
                while let Some(ReplayStep::Move(m)) = rx.recv().await {
                    moves.push(m);
                }
                summary = Some((game, moves));
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let (game, moves) = summary.expect("the first game was persisted");
    assert_eq!(game.size, 1);
    assert_eq!(game.state, "1 1 1 0 0");
    assert_eq!(game.outcome, 2, "a one-pit game is a draw");
    let names = [game.south.name.as_deref(), game.north.name.as_deref()];
    assert!(names.contains(&Some("alice")) && names.contains(&Some("bob")));
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].pit, 0);
    assert_eq!(moves[0].state, game.state);

    for player in players {
        player.abort();
    }
    server.abort();
}

#[tokio::test]
async fn a_random_baseline_tournament_runs_to_completion() {
    let conf = base_conf().with_tournament("random", 2);
    let server = Server::bind(conf).await.expect("bind");
    let addr = server.local_addr().expect("local addr");
    let server = tokio::spawn(server.run());

    // Both participants draw against the bot on the one-pit board, so
    // neither beats it and the tournament empties out and completes.
    let carol = Agent::connect(addr, "token-carol", "carol").await;
    let dave = Agent::connect(addr, "token-dave", "dave").await;
    let players = [tokio::spawn(carol.autoplay()), tokio::spawn(dave.autoplay())];

    // Once the tournament is decided the server shuts itself down.
    let finished = timeout(Duration::from_secs(20), server)
        .await
        .expect("tournament completes")
        .expect("server task");
    assert!(finished.is_ok(), "server exited cleanly: {finished:?}");

    for player in players {
        player.abort();
    }
}

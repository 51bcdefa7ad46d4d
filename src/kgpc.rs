//! Adapter for agents delivered as subprocesses.
//!
//! For every state request the configured command is started anew and
//! handed the position on stdin:
//!
//! ```text
//! <size>
//! <southStore> <northStore>
//! <south pits separated by spaces>
//! <north pits separated by spaces>
//! ```
//!
//! Every 0-indexed pit number the process prints on stdout is submitted
//! as an improved move, until the process exits or the server ends the
//! turn. The environment variables `TOKEN`, `NAME` and `AUTHOR` supply
//! the agent's identity.

use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::board::{Board, Side};
use crate::session::{Session, User};

pub fn spawn(command: String, killed: CancellationToken) -> Arc<Session> {
    let user = User::anonymous();
    for (var, field) in [
        ("TOKEN", &user.token),
        ("NAME", &user.name),
        ("AUTHOR", &user.author),
    ] {
        if let Ok(value) = std::env::var(var) {
            *field.write().expect("user lock") = Some(value);
        }
    }

    let (session, mut out) = Session::internal(user, killed);
    let driver = session.clone();
    tokio::spawn(async move {
        let mut pending: Option<(u64, Board)> = None;
        loop {
            let (id, board) = match pending.take() {
                Some(state) => state,
                None => {
                    // Idle: wait for the next state request.
                    tokio::select! {
                        _ = driver.killed().cancelled() => return,
                        line = out.recv() => match line {
                            Some(line) => match parse_state(&line) {
                                Some(state) => state,
                                None => continue,
                            },
                            None => return,
                        },
                    }
                }
            };

            let (mut child, mut moves) = match launch(&command, &board).await {
                Ok(launched) => launched,
                Err(err) => {
                    warn!(%err, "could not run agent subprocess");
                    driver.handle_line(&format!("@{id} yield")).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = driver.killed().cancelled() => {
                        dismiss(&mut child).await;
                        return;
                    }
                    line = out.recv() => match line {
                        Some(line) => {
                            if let Some(state) = parse_state(&line) {
                                dismiss(&mut child).await;
                                pending = Some(state);
                                break;
                            }
                            if is_stop(&line) {
                                dismiss(&mut child).await;
                                break;
                            }
                        }
                        None => {
                            dismiss(&mut child).await;
                            return;
                        }
                    },
                    choice = moves.next_line() => match choice {
                        Ok(Some(word)) => match word.trim().parse::<usize>() {
                            Ok(pit) => {
                                driver.handle_line(&format!("@{id} move {}", pit + 1)).await;
                            }
                            Err(_) => debug!(word = %word, "agent printed something that is not a pit"),
                        },
                        _ => {
                            // The process is done deciding.
                            let _ = child.wait().await;
                            driver.handle_line(&format!("@{id} yield")).await;
                            break;
                        }
                    },
                }
            }
        }
    });

    session
}

async fn launch(command: &str, board: &Board) -> anyhow::Result<(Child, Lines<BufReader<ChildStdout>>)> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to start agent subprocess")?;

    let mut stdin = child.stdin.take().context("subprocess has no stdin")?;
    let stdout = child.stdout.take().context("subprocess has no stdout")?;

    let pits = |side| {
        board
            .pits(side)
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    };
    let position = format!(
        "{}\n{} {}\n{}\n{}\n",
        board.size(),
        board.store(Side::South),
        board.store(Side::North),
        pits(Side::South),
        pits(Side::North),
    );
    stdin
        .write_all(position.as_bytes())
        .await
        .context("could not hand the position to the subprocess")?;
    // Closing stdin tells the agent the position is complete.
    drop(stdin);

    Ok((child, BufReader::new(stdout).lines()))
}

async fn dismiss(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn parse_state(line: &str) -> Option<(u64, Board)> {
    let (head, rest) = line.split_once(' ')?;
    let id = head.parse().ok()?;
    let payload = rest.strip_prefix("state ")?;
    let board = Board::from_str(payload).ok()?;
    Some((id, board))
}

fn is_stop(line: &str) -> bool {
    let mut words = line.split_whitespace();
    words.next().is_some_and(|w| w.starts_with('@')) && words.next() == Some("stop")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::Move;
    use crate::session::GameHandle;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn a_subprocess_agent_submits_its_printed_pits() {
        let agent = spawn(
            "cat >/dev/null; echo 0; echo 1".to_string(),
            CancellationToken::new(),
        );
        let (moves, mut rx) = mpsc::channel::<Move>(8);
        let (deaths, _deaths_rx) = mpsc::channel(1);
        agent.enter_game(GameHandle {
            side: Side::South,
            moves,
            deaths,
        });

        let board = Board::new(3, 3);
        let id = agent.send("state", &board);

        let first = rx.recv().await.expect("first move");
        assert_eq!((first.pit, first.reference), (0, id));
        let improved = rx.recv().await.expect("improved move");
        assert_eq!(improved.pit, 1);
        let done = rx.recv().await.expect("yield once the process exits");
        assert!(done.yields);

        agent.kill();
    }

    #[tokio::test]
    async fn environment_variables_name_the_agent() {
        std::env::set_var("TOKEN", "kgpc-test-token");
        std::env::set_var("NAME", "kgpc-test");
        let agent = spawn("cat >/dev/null".to_string(), CancellationToken::new());
        assert_eq!(agent.user.token().as_deref(), Some("kgpc-test-token"));
        assert_eq!(agent.user.name().as_deref(), Some("kgpc-test"));
        std::env::remove_var("TOKEN");
        std::env::remove_var("NAME");
        agent.kill();
    }
}

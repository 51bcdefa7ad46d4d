//! The built-in random agent.
//!
//! Random-baseline tournaments pit every participant against an opponent
//! that answers each state request with a uniformly random legal move
//! and yields immediately. The bot runs as an ordinary session whose
//! transport is an in-process task, so game runners need no special
//! cases for it.

use std::str::FromStr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::board::{Board, Side};
use crate::session::{Session, User};

pub fn spawn(killed: CancellationToken) -> Arc<Session> {
    let user = User::anonymous();
    *user.name.write().expect("name lock") = Some("random".to_string());

    let (session, mut out) = Session::internal(user, killed);
    let driver = session.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = driver.killed().cancelled() => break,
                line = out.recv() => match line {
                    Some(line) => {
                        if let Some((id, board)) = parse_state(&line) {
                            // The payload is from our perspective: we are south.
                            let pit = board.random(Side::South);
                            driver.handle_line(&format!("@{id} move {}", pit + 1)).await;
                            driver.handle_line(&format!("@{id} yield")).await;
                        } else {
                            trace!(line = %line, "bot ignores");
                        }
                    }
                    None => break,
                },
            }
        }
    });
    session
}

fn parse_state(line: &str) -> Option<(u64, Board)> {
    let (head, rest) = line.split_once(' ')?;
    let id = head.parse().ok()?;
    let payload = rest.strip_prefix("state ")?;
    let board = Board::from_str(payload).ok()?;
    Some((id, board))
}

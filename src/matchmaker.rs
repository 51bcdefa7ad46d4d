//! Pairs ready freeplay clients into games.
//!
//! The queue is strictly first come, first served: the two sessions at
//! the head are paired, a concurrency slot is acquired when games are
//! capped, and a game runner is spawned. Sessions whose liveness check
//! fails are dropped on the way; everyone else keeps their place.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::board::Board;
use crate::configuration::Configuration;
use crate::db::Db;
use crate::game::{self, Game, GameContext, Referee};
use crate::session::Session;

pub struct Matchmaker {
    queue: VecDeque<Arc<Session>>,
    enqueue: mpsc::Receiver<Arc<Session>>,
    /// Handed to runners so finished players are re-admitted.
    readmit: mpsc::Sender<Arc<Session>>,
    db: Arc<Db>,
    conf: Arc<Configuration>,
    slots: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Matchmaker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        enqueue: mpsc::Receiver<Arc<Session>>,
        readmit: mpsc::Sender<Arc<Session>>,
        db: Arc<Db>,
        conf: Arc<Configuration>,
        slots: Option<Arc<Semaphore>>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Matchmaker {
        Matchmaker {
            queue: VecDeque::new(),
            enqueue,
            readmit,
            db,
            conf,
            slots,
            tracker,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("matchmaker ready");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                next = self.enqueue.recv() => match next {
                    Some(session) => {
                        debug!(session = session.id, "enqueued");
                        self.queue.push_back(session);
                        if !self.pair().await {
                            return;
                        }
                    }
                    None => return,
                },
            }
        }
    }

    /// Start games while at least two live sessions are queued. Returns
    /// false when shutdown interrupted a slot wait.
    async fn pair(&mut self) -> bool {
        loop {
            self.discard_dead();
            if self.queue.len() < 2 {
                return true;
            }

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

            // The wait for a slot can outlive a client; check liveness
            // again before committing the pair.
            self.discard_dead();
            if self.queue.len() < 2 {
                return true;
            }
            let south = self.queue.pop_front().expect("queue underflow");
            let north = self.queue.pop_front().expect("queue underflow");

            let game = Game::new(
                Board::new(self.conf.board_size, self.conf.board_init),
                south,
                north,
            );
            let ctx = GameContext {
                db: self.db.clone(),
                conf: self.conf.clone(),
                referee: Referee::Matchmaker(self.readmit.clone()),
                permit,
            };
            self.tracker.spawn(async move {
                game::run(game, ctx).await;
            });
        }
    }

    fn discard_dead(&mut self) {
        self.queue.retain(|session| {
            let keep = session.alive();
            if !keep {
                debug!(session = session.id, "dropping dead session from queue");
            }
            keep
        });
    }
}

//! Process-wide wiring and lifecycle.
//!
//! The orchestrator builds the components in dependency order (database
//! first, then the matchmaker, then any configured tournament), accepts
//! connections, and routes session events to whichever referee the
//! server is running. On shutdown it stops accepting, kills the live
//! sessions, waits for in-flight game runners to persist their final
//! state, and closes the database last.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::configuration::Configuration;
use crate::db::Db;
use crate::game::Referee;
use crate::kgpc;
use crate::matchmaker::Matchmaker;
use crate::session::{self, Event, Session, User};
use crate::tournament::{Tournament, TournamentEvent};
use crate::tournament_strategy;

pub struct Server {
    conf: Arc<Configuration>,
    listener: TcpListener,
}

pub async fn run(conf: Configuration) -> anyhow::Result<()> {
    Server::bind(conf).await?.run().await
}

impl Server {
    /// Bind the listening socket. Everything else starts in [`Server::run`].
    pub async fn bind(conf: Configuration) -> anyhow::Result<Server> {
        let listener = TcpListener::bind(&conf.listen)
            .await
            .with_context(|| format!("cannot listen on {}", conf.listen))?;
        Ok(Server {
            conf: Arc::new(conf),
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Server { conf, listener } = self;
        let db = Arc::new(Db::open(&conf).await?);

        let cancel = CancellationToken::new();
        let complete = CancellationToken::new();
        let tracker = TaskTracker::new();
        db.start_maintenance(&tracker, &cancel);

        let slots = (conf.slots > 0).then(|| Arc::new(Semaphore::new(conf.slots)));

        let (enqueue, queue) = mpsc::channel(256);
        let matchmaker = Matchmaker::new(
            queue,
            enqueue.clone(),
            db.clone(),
            conf.clone(),
            slots.clone(),
            tracker.clone(),
            cancel.clone(),
        );
        tracker.spawn(matchmaker.run());

        let referee = match &conf.tournament {
            Some(name) => {
                let system = tournament_strategy::by_name(name, &conf)?;
                anyhow::ensure!(
                    conf.participants >= 2,
                    "a tournament needs at least two participants"
                );
                let (tournament, events) = Tournament::new(
                    system,
                    conf.participants,
                    db.clone(),
                    conf.clone(),
                    slots.clone(),
                    tracker.clone(),
                    cancel.clone(),
                    complete.clone(),
                );
                tracker.spawn(tournament.run());
                Referee::Tournament(events)
            }
            None => Referee::Matchmaker(enqueue.clone()),
        };

        // Local subprocess agents take part like any other client.
        for command in &conf.agents {
            let agent = kgpc::spawn(command.clone(), cancel.child_token());
            admit(&referee, agent).await;
        }

        info!(listen = %listener.local_addr()?, "accepting connections");

        let (events_tx, mut events) = mpsc::channel::<(Arc<Session>, Event)>(64);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    break;
                }
                _ = complete.cancelled() => {
                    info!("tournament finished");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let (session, out) = Session::new(User::anonymous(), cancel.child_token());
                        info!(session = session.id, %peer, "connected");
                        session.greet();
                        tracker.spawn(session::drive(session, stream, out, events_tx.clone()));
                    }
                    Err(err) => warn!(%err, "accept failed"),
                },
                Some((session, event)) = events.recv() => match event {
                    Event::Ready => admit(&referee, session).await,
                    Event::Closed => {
                        info!(session = session.id, "disconnected");
                        if let Referee::Tournament(tx) = &referee {
                            let _ = tx.send(TournamentEvent::Dead(session)).await;
                        }
                    }
                },
            }
        }

        info!("shutting down");
        cancel.cancel();
        tracker.close();
        // Keep draining session events so no transport task blocks on the
        // event channel while we wait for the runners to finish.
        let wait = tracker.wait();
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                _ = events.recv() => {}
            }
        }
        db.shutdown().await;
        Ok(())
    }
}

async fn admit(referee: &Referee, session: Arc<Session>) {
    match referee {
        Referee::Matchmaker(queue) => {
            if queue.send(session).await.is_err() {
                warn!("matchmaker is gone");
            }
        }
        Referee::Tournament(events) => {
            if events.send(TournamentEvent::Ready(session)).await.is_err() {
                warn!("tournament is gone");
            }
        }
    }
}

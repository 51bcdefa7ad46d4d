//! Tournament systems: who plays whom, and when it is over.
//!
//! All methods are called from the tournament task, one event at a time;
//! strategy state needs no synchronisation.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::configuration::Configuration;
use crate::game::Outcome;
use crate::session::Session;
use crate::tournament::{FinishedGame, TournamentState};

/// A tournament system decides which games to hold and records their
/// results.
pub trait System: Send {
    fn name(&self) -> String;
    /// A client is available for its next game.
    fn ready(&mut self, t: &mut TournamentState, client: Arc<Session>);
    /// A client died or was disqualified.
    fn forget(&mut self, t: &mut TournamentState, client: &Session);
    /// A game has finished.
    fn record(&mut self, t: &mut TournamentState, game: &FinishedGame);
    /// Is the tournament decided?
    fn over(&self, t: &TournamentState) -> bool;
    /// Called exactly once, after [`System::over`] first holds.
    fn deinit(&mut self, t: &mut TournamentState);
}

pub fn by_name(name: &str, conf: &Configuration) -> anyhow::Result<Box<dyn System + Send>> {
    Ok(match name {
        "round-robin" => Box::new(RoundRobin::new(conf.board_size, conf.pick)),
        "random" => Box::new(RandomBaseline::new(conf.board_size)),
        "single-elimination" => Box::new(SingleElimination::new(conf.board_size)),
        other => anyhow::bail!("unknown tournament system {other:?}"),
    })
}

fn pair_key(a: u64, b: u64) -> (u64, u64) {
    (a.min(b), a.max(b))
}

/// Everyone plays everyone once; the best `pick` agents pass on,
/// extending through ties.
pub struct RoundRobin {
    size: usize,
    /// 0 keeps the whole field.
    pick: usize,
    /// Pairings still owed a game; generated on the first ready call.
    pairings: Option<HashSet<(u64, u64)>>,
    ready: Vec<Arc<Session>>,
}

impl RoundRobin {
    pub fn new(size: usize, pick: usize) -> RoundRobin {
        RoundRobin {
            size,
            pick,
            pairings: None,
            ready: Vec::new(),
        }
    }
}

impl System for RoundRobin {
    fn name(&self) -> String {
        format!("round-robin-{}", self.size)
    }

    fn ready(&mut self, t: &mut TournamentState, client: Arc<Session>) {
        let pairings = self.pairings.get_or_insert_with(|| {
            let mut set = HashSet::new();
            for (i, a) in t.participants.iter().enumerate() {
                for b in &t.participants[i + 1..] {
                    set.insert(pair_key(a.id, b.id));
                }
            }
            set
        });

        // Look for a waiting partner this client still owes a game.
        let partner = self
            .ready
            .iter()
            .position(|p| pairings.contains(&pair_key(client.id, p.id)));
        match partner {
            Some(i) => {
                let partner = self.ready.swap_remove(i);
                pairings.remove(&pair_key(client.id, partner.id));
                debug!(left = pairings.len(), "round-robin pairings remaining");
                t.start_game(client, Some(partner));
            }
            None => self.ready.push(client),
        }
    }

    fn forget(&mut self, _t: &mut TournamentState, client: &Session) {
        if let Some(pairings) = &mut self.pairings {
            pairings.retain(|&(a, b)| a != client.id && b != client.id);
        }
        self.ready.retain(|p| p.id != client.id);
    }

    // Scoring is handled by the scheduler.
    fn record(&mut self, _t: &mut TournamentState, _game: &FinishedGame) {}

    fn over(&self, t: &TournamentState) -> bool {
        self.pairings.as_ref().is_some_and(|p| p.is_empty()) && t.no_games_in_flight()
    }

    fn deinit(&mut self, t: &mut TournamentState) {
        t.participants.sort_by(|a, b| {
            b.user
                .score()
                .partial_cmp(&a.user.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let len = t.participants.len();
        let mut n = match self.pick {
            0 => len,
            pick => pick.min(len),
        };
        // Agents tied with the last passing score pass as well.
        while n + 1 < len && t.participants[n - 1].user.score() == t.participants[n].user.score() {
            n += 1;
        }
        for (i, p) in t.participants.iter().enumerate() {
            let verdict = if i < n { "passed" } else { "eliminated" };
            info!(
                place = i + 1,
                score = p.user.score(),
                session = p.id,
                verdict,
                "round-robin result"
            );
        }
        t.participants.truncate(n);
    }
}

/// Every participant plays once against the built-in random agent;
/// losing to it means elimination.
pub struct RandomBaseline {
    size: usize,
    done: HashSet<u64>,
}

impl RandomBaseline {
    pub fn new(size: usize) -> RandomBaseline {
        RandomBaseline {
            size,
            done: HashSet::new(),
        }
    }
}

impl System for RandomBaseline {
    fn name(&self) -> String {
        format!("random-{}", self.size)
    }

    fn ready(&mut self, t: &mut TournamentState, client: Arc<Session>) {
        if self.done.contains(&client.id) || t.is_active(&client) {
            return;
        }
        t.start_game(client, None);
    }

    fn forget(&mut self, t: &mut TournamentState, client: &Session) {
        info!(session = client.id, "disqualified");
        t.participants.retain(|p| p.id != client.id);
    }

    fn record(&mut self, t: &mut TournamentState, game: &FinishedGame) {
        let client = &game.south;
        if game.outcome == Outcome::Win {
            debug!(session = client.id, "beat the random agent");
        } else {
            debug!(session = client.id, "failed to beat the random agent");
            t.participants.retain(|p| p.id != client.id);
        }
        self.done.insert(client.id);
    }

    fn over(&self, t: &TournamentState) -> bool {
        t.participants.iter().all(|p| self.done.contains(&p.id))
    }

    fn deinit(&mut self, _t: &mut TournamentState) {}
}

/// Lose once and you are out; the tournament ends with one survivor.
pub struct SingleElimination {
    size: usize,
    elim: HashSet<u64>,
}

impl SingleElimination {
    pub fn new(size: usize) -> SingleElimination {
        SingleElimination {
            size,
            elim: HashSet::new(),
        }
    }

    /// Pair up every idle, non-eliminated participant.
    fn start(&self, t: &mut TournamentState) {
        let mut pairs = Vec::new();
        let mut taken = HashSet::new();
        let free = |s: &Session, taken: &HashSet<u64>, t: &TournamentState| {
            !self.elim.contains(&s.id) && !t.is_active(s) && !taken.contains(&s.id)
        };
        for i in 0..t.participants.len() {
            let a = t.participants[i].clone();
            if !free(&a, &taken, t) {
                continue;
            }
            if let Some(b) = t.participants[i + 1..]
                .iter()
                .find(|b| free(b, &taken, t))
                .cloned()
            {
                taken.insert(a.id);
                taken.insert(b.id);
                pairs.push((a, b));
            }
        }
        for (south, north) in pairs {
            t.start_game(south, Some(north));
        }
    }
}

impl System for SingleElimination {
    fn name(&self) -> String {
        format!("single-elimination-{}", self.size)
    }

    fn ready(&mut self, t: &mut TournamentState, _client: Arc<Session>) {
        self.start(t);
    }

    fn forget(&mut self, _t: &mut TournamentState, client: &Session) {
        self.elim.insert(client.id);
    }

    fn record(&mut self, t: &mut TournamentState, game: &FinishedGame) {
        if let Some(loser) = game.loser() {
            self.elim.insert(loser.id);
        }
        if self.over(t) {
            return;
        }
        self.start(t);
    }

    fn over(&self, t: &TournamentState) -> bool {
        t.participants.len() == self.elim.len() + 1
    }

    fn deinit(&mut self, t: &mut TournamentState) {
        t.participants.retain(|p| !self.elim.contains(&p.id));
        assert!(
            !t.participants.is_empty(),
            "all participants have been eliminated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::Board;
    use crate::db::GameRow;
    use crate::session::User;
    use crate::tournament::Pairing;
    use tokio_util::sync::CancellationToken;

    fn session() -> Arc<Session> {
        let (session, _out) = Session::new(User::anonymous(), CancellationToken::new());
        session
    }

    fn bot() -> Arc<Session> {
        let (session, _out) = Session::internal(User::anonymous(), CancellationToken::new());
        session
    }

    fn finished(pairing: &Pairing, outcome: Outcome) -> FinishedGame {
        let north = pairing.north.clone().unwrap_or_else(bot);
        let row = Arc::new(GameRow::new(
            &Board::new(3, 3),
            pairing.south.user.clone(),
            north.user.clone(),
        ));
        FinishedGame {
            south: pairing.south.clone(),
            north,
            row,
            outcome,
            resigned: None,
        }
    }

    #[test]
    fn round_robin_plays_every_pairing_once() {
        let players: Vec<_> = (0..4).map(|_| session()).collect();
        let mut state = TournamentState::new(players.clone());
        let mut system = RoundRobin::new(3, 0);

        for p in &players {
            system.ready(&mut state, p.clone());
        }

        let mut queue = state.take_pending();
        let mut played = 0;
        while let Some(pairing) = queue.pop() {
            played += 1;
            let game = finished(&pairing, Outcome::Win);
            state.settle(&game);
            system.record(&mut state, &game);
            if played < 6 {
                assert!(!system.over(&state), "over after only {played} games");
            }
            for p in [game.south.clone(), game.north.clone()] {
                system.ready(&mut state, p);
            }
            queue.extend(state.take_pending());
        }

        assert_eq!(played, 6);
        assert!(system.over(&state));
    }

    #[test]
    fn round_robin_deinit_keeps_the_best_and_their_ties() {
        let players: Vec<_> = (0..4).map(|_| session()).collect();
        players[0].user.add_score(3.0);
        players[1].user.add_score(2.0);
        players[2].user.add_score(2.0);
        let mut state = TournamentState::new(players);
        let mut system = RoundRobin::new(3, 2);

        system.deinit(&mut state);
        // Second place is tied, so three agents pass.
        assert_eq!(state.participants.len(), 3);
        assert_eq!(state.participants[0].user.score(), 3.0);
    }

    #[test]
    fn random_baseline_drops_everyone_who_loses() {
        let players: Vec<_> = (0..3).map(|_| session()).collect();
        let mut state = TournamentState::new(players.clone());
        let mut system = RandomBaseline::new(3);

        for p in &players {
            system.ready(&mut state, p.clone());
        }
        let queue = state.take_pending();
        assert_eq!(queue.len(), 3);
        assert!(queue.iter().all(|p| p.north.is_none()));

        for (i, pairing) in queue.iter().enumerate() {
            let outcome = if i == 2 { Outcome::Win } else { Outcome::Loss };
            let game = finished(pairing, outcome);
            state.settle(&game);
            system.record(&mut state, &game);
        }

        assert!(system.over(&state));
        system.deinit(&mut state);
        assert_eq!(state.participants.len(), 1);
        assert_eq!(state.participants[0].id, players[2].id);
    }

    #[test]
    fn single_elimination_leaves_one_survivor() {
        let players: Vec<_> = (0..3).map(|_| session()).collect();
        let mut state = TournamentState::new(players.clone());
        let mut system = SingleElimination::new(3);

        for p in &players {
            system.ready(&mut state, p.clone());
        }
        let first = state.take_pending();
        assert_eq!(first.len(), 1, "the odd participant sits out");

        let mut played = 0;
        let mut queue = first;
        while let Some(pairing) = queue.pop() {
            played += 1;
            // South always wins, north is eliminated.
            let game = finished(&pairing, Outcome::Win);
            state.settle(&game);
            system.record(&mut state, &game);
            queue.extend(state.take_pending());
        }

        assert!(played <= 2);
        assert!(system.over(&state));
        system.deinit(&mut state);
        assert_eq!(state.participants.len(), 1);
        assert_eq!(state.participants[0].id, players[0].id);
    }

    #[test]
    fn a_resignation_counts_as_a_loss() {
        let players: Vec<_> = (0..2).map(|_| session()).collect();
        let mut state = TournamentState::new(players.clone());
        let mut system = SingleElimination::new(3);

        system.ready(&mut state, players[0].clone());
        let pairing = state.take_pending().pop().expect("one game");
        let mut game = finished(&pairing, Outcome::Resign);
        game.resigned = Some(crate::board::Side::South);
        state.settle(&game);
        system.record(&mut state, &game);

        assert!(system.over(&state));
        system.deinit(&mut state);
        assert_eq!(state.participants[0].id, players[1].id);
    }
}

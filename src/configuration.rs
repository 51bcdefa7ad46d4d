//! Server configuration.
//!
//! A [`Configuration`] can be built programmatically (tests do this) or
//! from the command line in `main`. The defaults run a freeplay server
//! on the standard KGP port with an unbounded number of concurrent
//! games.

use std::path::PathBuf;
use std::time::Duration;

/// Everything the orchestrator needs to know.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Path of the SQLite database.
    pub database: PathBuf,
    /// Address the server listens on.
    pub listen: String,
    /// Thinking time per move.
    pub timeout: Duration,
    /// Maximum number of concurrent games; 0 means unbounded.
    pub slots: usize,
    /// Re-admit the survivor when its opponent dies, instead of killing
    /// both sessions.
    pub endless: bool,
    /// Pits per side for new games.
    pub board_size: usize,
    /// Initial stones per pit.
    pub board_init: u32,
    /// Tournament system to run instead of freeplay, if any.
    pub tournament: Option<String>,
    /// Number of participants a tournament waits for.
    pub participants: usize,
    /// How many agents a round-robin passes on; 0 keeps everyone.
    pub pick: usize,
    /// Commands to run as local subprocess agents.
    pub agents: Vec<String>,
    pub debug: bool,
}

impl Configuration {
    pub fn new() -> Configuration {
        Configuration {
            database: PathBuf::from("kgpd.db"),
            listen: "0.0.0.0:2671".to_string(),
            timeout: Duration::from_secs(5),
            slots: 0,
            endless: false,
            board_size: 8,
            board_init: 8,
            tournament: None,
            participants: 0,
            pick: 0,
            agents: Vec::new(),
            debug: false,
        }
    }

    pub fn with_database(mut self, path: PathBuf) -> Configuration {
        self.database = path;
        self
    }

    pub fn with_listen(mut self, listen: impl Into<String>) -> Configuration {
        self.listen = listen.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Configuration {
        self.timeout = timeout;
        self
    }

    pub fn with_slots(mut self, slots: usize) -> Configuration {
        self.slots = slots;
        self
    }

    pub fn with_endless(mut self, endless: bool) -> Configuration {
        self.endless = endless;
        self
    }

    pub fn with_board(mut self, size: usize, init: u32) -> Configuration {
        self.board_size = size;
        self.board_init = init;
        self
    }

    pub fn with_tournament(mut self, system: impl Into<String>, participants: usize) -> Configuration {
        self.tournament = Some(system.into());
        self.participants = participants;
        self
    }
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration::new()
    }
}

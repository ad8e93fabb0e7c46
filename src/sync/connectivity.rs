//! Connectivity signal feeding the sync controller.
//!
//! The host platform (browser `online`/`offline` events, a network check, or the
//! agent's HTTP route) reports edges through [`ConnectivityMonitor`]; the
//! background connectivity task reacts to each transition.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectivity::Online => f.write_str("online"),
            Connectivity::Offline => f.write_str("offline"),
        }
    }
}

impl FromStr for Connectivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Connectivity::Online),
            "offline" => Ok(Connectivity::Offline),
            other => Err(format!("unknown connectivity state: {}", other)),
        }
    }
}

/// Source of connectivity transitions
pub struct ConnectivityMonitor {
    tx: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    /// Report a state; returns whether it was a transition
    pub fn report(&self, state: Connectivity) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            info!("Connectivity changed: {}", state);
        }
        changed
    }

    pub fn set_online(&self) -> bool {
        self.report(Connectivity::Online)
    }

    pub fn set_offline(&self) -> bool {
        self.report(Connectivity::Offline)
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

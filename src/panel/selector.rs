//! Least-loaded primary panel selection.

use std::cmp::Ordering;

use log::{debug, warn};

use super::Panel;

/// Point-in-time client count of a panel. A panel whose probe failed is
/// `Unavailable` and compares greater than any count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Load {
    Clients(usize),
    Unavailable,
}

impl Ord for Load {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Load::Clients(a), Load::Clients(b)) => a.cmp(b),
            (Load::Clients(_), Load::Unavailable) => Ordering::Less,
            (Load::Unavailable, Load::Clients(_)) => Ordering::Greater,
            (Load::Unavailable, Load::Unavailable) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Load {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sum of clients across every inbound of the panel. Never fails.
pub async fn probe_load(panel: &Panel) -> Load {
    match panel.api.list_inbounds().await {
        Ok(inbounds) => {
            let total = inbounds.iter().map(|i| i.settings.clients.len()).sum();
            debug!("Panel {} load: {} clients", panel.name, total);
            Load::Clients(total)
        }
        Err(e) => {
            warn!("Failed to read load of panel {}: {}", panel.name, e);
            Load::Unavailable
        }
    }
}

/// The panel with the lowest load; the first one probed wins a tie.
/// `None` when every probe failed.
pub async fn select_least_loaded(panels: &[Panel]) -> Option<&Panel> {
    let mut best: Option<&Panel> = None;
    let mut min_load = Load::Unavailable;
    for panel in panels {
        let load = probe_load(panel).await;
        if load < min_load {
            min_load = load;
            best = Some(panel);
        }
    }
    best
}

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// A single game server process, scheduled as a Pod, that may be allocated to
/// a game session.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "mps.playfab.com",
    version = "v1alpha1",
    kind = "GameServer",
    status = "GameServerStatus",
    shortname = "gs",
    schema = "disabled",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    #[serde(rename = "buildID")]
    pub build_id: String,

    #[serde(rename = "titleID", default)]
    pub title_id: String,

    /// Container port numbers that are exposed on the node.
    #[serde(default)]
    pub ports_to_expose: Vec<i32>,

    #[serde(default)]
    pub build_metadata: Vec<BuildMetadataItem>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BuildMetadataItem {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    pub state: Option<GameServerState>,

    pub health: Option<GameServerHealth>,

    #[serde(rename = "publicIP")]
    pub public_ip: Option<String>,

    /// Comma-separated `name:port` pairs, as reported to allocation clients.
    pub ports: Option<String>,

    #[serde(rename = "sessionID")]
    pub session_id: Option<String>,

    pub session_cookie: Option<String>,

    pub initial_players: Option<Vec<String>>,

    pub node_name: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum GameServerState {
    Initializing,
    StandingBy,
    Active,
    GameCompleted,
    Crashed,
    Unhealthy,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum GameServerHealth {
    Healthy,
    Unhealthy,
}

/// A named port, as handed to allocation clients.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortDetails {
    pub name: String,
    pub number: i32,
}

// === impl GameServerState ===

impl GameServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::StandingBy => "StandingBy",
            Self::Active => "Active",
            Self::GameCompleted => "GameCompleted",
            Self::Crashed => "Crashed",
            Self::Unhealthy => "Unhealthy",
        }
    }
}

impl fmt::Display for GameServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl GameServer ===

impl GameServer {
    pub fn state(&self) -> Option<GameServerState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn health(&self) -> Option<GameServerHealth> {
        self.status.as_ref().and_then(|s| s.health)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.session_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn labels_map(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.metadata.labels.as_ref().unwrap_or(&EMPTY)
    }

    /// Parses the `name:port` pairs in the status' port list.
    ///
    /// Malformed entries are skipped.
    pub fn port_details(&self) -> Vec<PortDetails> {
        let ports = match self.status.as_ref().and_then(|s| s.ports.as_deref()) {
            Some(ports) => ports,
            None => return vec![],
        };
        ports
            .split(',')
            .filter_map(|pair| {
                let (name, number) = pair.trim().split_once(':')?;
                let number = number.parse().ok()?;
                Some(PortDetails {
                    name: name.to_string(),
                    number,
                })
            })
            .collect()
    }
}

use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Describes a fleet of game servers sharing one build.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "mps.playfab.com",
    version = "v1alpha1",
    kind = "GameServerBuild",
    status = "GameServerBuildStatus",
    shortname = "gsb",
    schema = "disabled",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerBuildSpec {
    #[serde(rename = "buildID")]
    pub build_id: String,

    #[serde(rename = "titleID", default)]
    pub title_id: String,

    /// The number of game servers to keep in the `StandingBy` state.
    #[serde(default)]
    pub standing_by: i32,

    /// The maximum number of game servers for the build.
    #[serde(default)]
    pub max: i32,

    #[serde(default)]
    pub ports_to_expose: Vec<i32>,

    pub crashes_to_mark_unhealthy: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameServerBuildStatus {
    pub current_pending: Option<i32>,
    pub current_initializing: Option<i32>,
    pub current_standing_by: Option<i32>,
    pub current_active: Option<i32>,
    pub crashes_count: Option<i32>,
    pub health: Option<String>,
}

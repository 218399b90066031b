#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod gameserver;
pub mod gameserverbuild;

pub use self::{
    gameserver::{
        GameServer, GameServerHealth, GameServerSpec, GameServerState, GameServerStatus, PortDetails,
    },
    gameserverbuild::{GameServerBuild, GameServerBuildSpec, GameServerBuildStatus},
};
pub use k8s_openapi::api::core::v1::Secret;
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    Client, Error, Resource,
};

/// Game servers are labeled with the ID of the build they belong to.
pub const LABEL_BUILD_ID: &str = "BuildID";

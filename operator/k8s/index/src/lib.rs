//! Game server object cache
//!
//! The cache mirrors the `GameServer` and `GameServerBuild` resources in the cluster. It is fed by
//! `kubert::index` watch tasks and read by the allocation API server.
//!
//! Each resource kind is held in a [`Store`], which may carry any number of named field indexes.
//! A field index maps a derived key (e.g. a game server's state) to the set of objects that
//! produce that key, so that lookups by secondary attributes don't have to scan every object:
//!
//! ```text
//! [ GameServer ] -> status.state      -> { StandingBy => {gs-0, gs-3}, Active => {gs-1} }
//!                -> status.sessionID  -> { 6b0c... => {gs-1} }
//! [ GameServerBuild ] -> spec.buildID -> { 85ff... => {build-a} }
//! ```
//!
//! Indexes must be registered (see [`fields::register`]) before the cache receives any objects.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod fields;
pub mod metrics;
mod resource_id;
mod store;

#[cfg(test)]
mod tests;

pub use self::{
    resource_id::ResourceId,
    store::{IndexError, Store},
};
use gameserver_operator_k8s_api::{GameServer, GameServerBuild, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedCache = Arc<RwLock<Cache>>;

/// Holds all cached game server resources.
#[derive(Debug)]
pub struct Cache {
    game_servers: Store<GameServer>,
    builds: Store<GameServerBuild>,
}

// === impl Cache ===

impl Cache {
    pub fn shared() -> SharedCache {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn game_servers(&self) -> &Store<GameServer> {
        &self.game_servers
    }

    pub fn game_servers_mut(&mut self) -> &mut Store<GameServer> {
        &mut self.game_servers
    }

    pub fn builds(&self) -> &Store<GameServerBuild> {
        &self.builds
    }

    pub fn builds_mut(&mut self) -> &mut Store<GameServerBuild> {
        &mut self.builds
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            game_servers: Store::new(),
            builds: Store::new(),
        }
    }
}

impl kubert::index::IndexNamespacedResource<GameServer> for Cache {
    fn apply(&mut self, resource: GameServer) {
        let namespace = resource
            .namespace()
            .expect("GameServer must have a namespace");
        let name = resource.name_unchecked();
        tracing::trace!(%namespace, %name, "Applying GameServer");
        self.game_servers
            .apply(ResourceId::new(namespace, name), resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::trace!(%namespace, %name, "Deleting GameServer");
        self.game_servers.delete(&ResourceId::new(namespace, name));
    }

    // kubert's default `reset` applies each relisted GameServer and then deletes the removed
    // ones, which reindexes them one at a time.
}

impl kubert::index::IndexNamespacedResource<GameServerBuild> for Cache {
    fn apply(&mut self, resource: GameServerBuild) {
        let namespace = resource
            .namespace()
            .expect("GameServerBuild must have a namespace");
        let name = resource.name_unchecked();
        tracing::trace!(%namespace, %name, "Applying GameServerBuild");
        self.builds.apply(ResourceId::new(namespace, name), resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::trace!(%namespace, %name, "Deleting GameServerBuild");
        self.builds.delete(&ResourceId::new(namespace, name));
    }
}

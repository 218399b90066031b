//! Field indexes used by the allocation API.
//!
//! Index names mirror the resource field paths they are derived from, so that collaborators can
//! query the cache by exact match on e.g. `status.state` without knowing how the key is computed.

use crate::{Cache, IndexError};
use gameserver_operator_k8s_api::{GameServer, GameServerBuild};

/// Indexes game servers by their lifecycle state.
pub const GAME_SERVER_STATE: &str = "status.state";

/// Indexes game servers by the ID of the session they are allocated to.
pub const GAME_SERVER_SESSION_ID: &str = "status.sessionID";

/// Indexes game server builds by their build ID.
pub const GAME_SERVER_BUILD_ID: &str = "spec.buildID";

/// Registers all field indexes on the cache.
///
/// Either every index is registered or, if any registration would fail, none are and the first
/// error is returned. This must be called before the cache receives any objects.
pub fn register(cache: &mut Cache) -> Result<(), IndexError> {
    cache.game_servers().check_index(GAME_SERVER_STATE)?;
    cache.game_servers().check_index(GAME_SERVER_SESSION_ID)?;
    cache.builds().check_index(GAME_SERVER_BUILD_ID)?;

    let game_servers = cache.game_servers_mut();
    game_servers.index_field(GAME_SERVER_STATE, state)?;
    game_servers.index_field(GAME_SERVER_SESSION_ID, session_id)?;
    cache.builds_mut().index_field(GAME_SERVER_BUILD_ID, build_id)?;

    tracing::info!("Registered cache field indexes");
    Ok(())
}

/// An unset state is indexed under the empty string.
fn state(gs: &GameServer) -> Vec<String> {
    vec![gs
        .state()
        .map(|s| s.as_str().to_string())
        .unwrap_or_default()]
}

/// An unset session ID is indexed under the empty string.
fn session_id(gs: &GameServer) -> Vec<String> {
    vec![gs.session_id().unwrap_or_default().to_string()]
}

fn build_id(gsb: &GameServerBuild) -> Vec<String> {
    vec![gsb.spec.build_id.clone()]
}

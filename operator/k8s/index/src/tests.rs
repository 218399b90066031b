use super::*;
use crate::fields::{GAME_SERVER_BUILD_ID, GAME_SERVER_SESSION_ID, GAME_SERVER_STATE};
use gameserver_operator_k8s_api::{
    GameServerBuildSpec, GameServerSpec, GameServerState, GameServerStatus, ObjectMeta,
};
use kube::runtime::watcher;
use kubert::index::IndexNamespacedResource;
use pretty_assertions::assert_eq;

const BUILD_ID: &str = "85ffe8da-c82f-4035-86c5-9d2b5f42d6f5";

fn registered() -> Cache {
    let mut cache = Cache::default();
    fields::register(&mut cache).expect("indexes must register");
    cache
}

fn mk_game_server(
    ns: &str,
    name: &str,
    state: Option<GameServerState>,
    session_id: Option<&str>,
) -> GameServer {
    GameServer {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(maplit::btreemap! {
                gameserver_operator_k8s_api::LABEL_BUILD_ID.to_string() => BUILD_ID.to_string(),
            }),
            ..Default::default()
        },
        spec: GameServerSpec {
            build_id: BUILD_ID.to_string(),
            ..Default::default()
        },
        status: Some(GameServerStatus {
            state,
            session_id: session_id.map(Into::into),
            ..Default::default()
        }),
    }
}

fn mk_build(ns: &str, name: &str, build_id: &str) -> GameServerBuild {
    GameServerBuild {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: GameServerBuildSpec {
            build_id: build_id.to_string(),
            standing_by: 2,
            max: 4,
            ..Default::default()
        },
        status: None,
    }
}

fn names<K: ResourceExt>(objs: Vec<Arc<K>>) -> Vec<String> {
    objs.iter().map(|o| o.name_unchecked()).collect()
}

#[test]
fn lookups_by_state() {
    let mut cache = registered();
    cache.apply(mk_game_server(
        "ns-0",
        "gs-0",
        Some(GameServerState::StandingBy),
        None,
    ));
    cache.apply(mk_game_server(
        "ns-0",
        "gs-1",
        Some(GameServerState::Active),
        Some("session-1"),
    ));
    cache.apply(mk_game_server(
        "ns-1",
        "gs-2",
        Some(GameServerState::StandingBy),
        None,
    ));

    let standing_by = cache
        .game_servers()
        .list_by(GAME_SERVER_STATE, "StandingBy")
        .unwrap();
    assert_eq!(names(standing_by), vec!["gs-0", "gs-2"]);

    let standing_by = cache
        .game_servers()
        .list_by_in("ns-1", GAME_SERVER_STATE, "StandingBy")
        .unwrap();
    assert_eq!(names(standing_by), vec!["gs-2"]);

    let active = cache
        .game_servers()
        .list_by(GAME_SERVER_STATE, "Active")
        .unwrap();
    assert_eq!(names(active), vec!["gs-1"]);

    assert!(cache
        .game_servers()
        .list_by(GAME_SERVER_STATE, "Crashed")
        .unwrap()
        .is_empty());
}

/// Updates move an object between keys rather than leaving stale entries behind.
#[test]
fn reindexes_on_update() {
    let mut cache = registered();
    cache.apply(mk_game_server(
        "ns-0",
        "gs-0",
        Some(GameServerState::StandingBy),
        None,
    ));
    cache.apply(mk_game_server(
        "ns-0",
        "gs-0",
        Some(GameServerState::Active),
        Some("session-0"),
    ));

    let store = cache.game_servers();
    assert!(store
        .list_by(GAME_SERVER_STATE, "StandingBy")
        .unwrap()
        .is_empty());
    assert_eq!(
        names(store.list_by(GAME_SERVER_STATE, "Active").unwrap()),
        vec!["gs-0"]
    );
    assert_eq!(
        names(store.list_by(GAME_SERVER_SESSION_ID, "session-0").unwrap()),
        vec!["gs-0"]
    );
    assert!(store.list_by(GAME_SERVER_SESSION_ID, "").unwrap().is_empty());
    assert_eq!(store.len(), 1);
}

#[test]
fn deletes_remove_index_entries() {
    let mut cache = registered();
    cache.apply(mk_game_server(
        "ns-0",
        "gs-0",
        Some(GameServerState::Active),
        Some("session-0"),
    ));
    cache.apply(mk_build("ns-0", "build-0", BUILD_ID));

    <Cache as IndexNamespacedResource<GameServer>>::delete(
        &mut cache,
        "ns-0".to_string(),
        "gs-0".to_string(),
    );
    <Cache as IndexNamespacedResource<GameServerBuild>>::delete(
        &mut cache,
        "ns-0".to_string(),
        "build-0".to_string(),
    );

    assert!(cache.game_servers().is_empty());
    assert!(cache
        .game_servers()
        .list_by(GAME_SERVER_SESSION_ID, "session-0")
        .unwrap()
        .is_empty());
    assert!(cache
        .builds()
        .list_by(GAME_SERVER_BUILD_ID, BUILD_ID)
        .unwrap()
        .is_empty());
    assert_eq!(cache.game_servers().index_sizes().map(|(_, n)| n).sum::<usize>(), 0);
}

#[test]
fn unset_fields_index_empty_key() {
    let mut cache = registered();
    cache.apply(mk_game_server("ns-0", "gs-0", None, None));

    let store = cache.game_servers();
    assert_eq!(
        names(store.list_by(GAME_SERVER_STATE, "").unwrap()),
        vec!["gs-0"]
    );
    assert_eq!(
        names(store.list_by(GAME_SERVER_SESSION_ID, "").unwrap()),
        vec!["gs-0"]
    );
}

#[test]
fn lookups_by_build_id() {
    let mut cache = registered();
    cache.apply(mk_build("ns-0", "build-0", BUILD_ID));
    cache.apply(mk_build(
        "ns-0",
        "build-1",
        "b2bd8fa8-1c1c-4b52-9d29-6f2b6c0fd0a6",
    ));

    let builds = cache
        .builds()
        .list_by(GAME_SERVER_BUILD_ID, BUILD_ID)
        .unwrap();
    assert_eq!(names(builds), vec!["build-0"]);
    assert!(cache.builds().get("ns-0", "build-1").is_some());
}

#[test]
fn rejects_duplicate_registration() {
    let mut cache = registered();
    assert_eq!(
        fields::register(&mut cache),
        Err(IndexError::Duplicate {
            kind: "GameServer".to_string(),
            name: GAME_SERVER_STATE,
        })
    );
}

#[test]
fn rejects_registration_after_start() {
    let mut cache = Cache::default();
    cache.apply(mk_build("ns-0", "build-0", BUILD_ID));

    assert_eq!(
        fields::register(&mut cache),
        Err(IndexError::AlreadyStarted {
            kind: "GameServerBuild".to_string(),
            name: GAME_SERVER_BUILD_ID,
        })
    );

    // No partial index set is left behind.
    assert_eq!(cache.game_servers().index_sizes().count(), 0);
}

#[test]
fn unknown_index() {
    let cache = registered();
    assert_eq!(
        cache.builds().list_by("spec.titleID", "x").unwrap_err(),
        IndexError::NotFound {
            kind: "GameServerBuild".to_string(),
            name: "spec.titleID".to_string(),
        }
    );
}

/// Objects arriving through a watch after registration are indexed.
#[tokio::test]
async fn indexes_watch_events() {
    let cache = Arc::new(parking_lot::RwLock::new(registered()));

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let task = tokio::spawn(kubert::index::namespaced(
        cache.clone(),
        tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
    ));

    tx.send(watcher::Event::Apply(mk_game_server(
        "ns-0",
        "gs-0",
        Some(GameServerState::StandingBy),
        None,
    )))
    .unwrap();
    tx.send(watcher::Event::Apply(mk_game_server(
        "ns-0",
        "gs-1",
        Some(GameServerState::StandingBy),
        None,
    )))
    .unwrap();
    tx.send(watcher::Event::Delete(mk_game_server(
        "ns-0",
        "gs-0",
        Some(GameServerState::StandingBy),
        None,
    )))
    .unwrap();
    drop(tx);
    tokio::time::timeout(std::time::Duration::from_secs(1), task)
        .await
        .expect("index task must complete")
        .expect("index task must not panic");

    let standing_by = cache
        .read()
        .game_servers()
        .list_by(GAME_SERVER_STATE, "StandingBy")
        .unwrap();
    assert_eq!(names(standing_by), vec!["gs-1"]);
}

/// A relist replaces stale entries and drops objects that were removed while disconnected.
#[test]
fn resets_reindex_game_servers() {
    let mut cache = registered();
    cache.apply(mk_game_server(
        "ns-0",
        "gs-0",
        Some(GameServerState::StandingBy),
        None,
    ));
    cache.apply(mk_game_server(
        "ns-0",
        "gs-1",
        Some(GameServerState::StandingBy),
        None,
    ));

    let removed: kubert::index::NamespacedRemoved = std::iter::once((
        "ns-0".to_string(),
        std::iter::once("gs-0".to_string()).collect(),
    ))
    .collect();
    cache.reset(
        vec![mk_game_server(
            "ns-0",
            "gs-1",
            Some(GameServerState::Active),
            Some("session-1"),
        )],
        removed,
    );

    let store = cache.game_servers();
    assert_eq!(store.len(), 1);
    assert!(store
        .list_by(GAME_SERVER_STATE, "StandingBy")
        .unwrap()
        .is_empty());
    assert_eq!(
        names(store.list_by(GAME_SERVER_STATE, "Active").unwrap()),
        vec!["gs-1"]
    );
    assert_eq!(
        names(store.list_by(GAME_SERVER_SESSION_ID, "session-1").unwrap()),
        vec!["gs-1"]
    );
}

#[test]
fn exports_index_metrics() {
    let cache = Arc::new(parking_lot::RwLock::new(registered()));
    cache.write().apply(mk_game_server(
        "ns-0",
        "gs-0",
        Some(GameServerState::StandingBy),
        None,
    ));
    cache.write().apply(mk_build("ns-0", "build-0", BUILD_ID));

    let mut registry = prometheus_client::registry::Registry::default();
    metrics::register(&mut registry, cache);
    let mut text = String::new();
    prometheus_client::encoding::text::encode(&mut text, &registry).unwrap();

    assert!(
        text.contains("game_server_index_size{namespace=\"ns-0\"} 1"),
        "{text}"
    );
    assert!(
        text.contains("game_server_build_index_size{namespace=\"ns-0\"} 1"),
        "{text}"
    );
    assert!(
        text.contains("field_index_keys{kind=\"GameServer\",index=\"status.state\"} 1"),
        "{text}"
    );
}

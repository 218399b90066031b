use crate::{
    http::{ApiServer, ApiServerConfig, KubeActivator, ListenAddr},
    index::{self, Cache},
    k8s::{GameServer, GameServerBuild},
    tls, Manager,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "gameserver-operator",
    about = "Allocates game servers to game sessions"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "gameserver=info,warn",
        env = "GAMESERVER_OPERATOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The address of the allocation API server, as `host:port` or `:port`.
    #[clap(long, default_value = ":5000", env = "API_LISTEN")]
    api_listen: ListenAddr,

    /// The time given to in-flight API requests to complete on shutdown.
    #[clap(long, default_value = "10")]
    api_shutdown_grace_period_secs: u64,

    /// A `kubernetes.io/tls` Secret holding the API server's certificate. The API is served in
    /// plaintext when unset.
    #[clap(long)]
    tls_secret_name: Option<String>,

    /// Defaults to the controller namespace.
    #[clap(long)]
    tls_secret_namespace: Option<String>,

    #[clap(long, default_value = "thundernetes-system", env = "POD_NAMESPACE")]
    controller_namespace: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            api_listen,
            api_shutdown_grace_period_secs,
            tls_secret_name,
            tls_secret_namespace,
            controller_namespace,
        } = self;

        // The cache's indexes must be in place before any watch delivers objects.
        let cache = Cache::shared();
        index::fields::register(&mut cache.write()).context("failed to register field indexes")?;

        let mut prom = <Registry>::default();
        index::metrics::register(prom.sub_registry_with_prefix("cache"), cache.clone());
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn resource watches.

        let game_servers = runtime.watch_all::<GameServer>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(cache.clone(), game_servers)
                .instrument(info_span!("gameservers")),
        );

        let builds = runtime.watch_all::<GameServerBuild>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(cache.clone(), builds)
                .instrument(info_span!("gameserverbuilds")),
        );

        let tls = match tls_secret_name {
            Some(name) => {
                let ns = tls_secret_namespace.unwrap_or_else(|| controller_namespace.clone());
                let material = tls::load(runtime.client(), &ns, &name).await?;
                info!(%ns, %name, "Loaded API server certificate");
                Some(material)
            }
            None => None,
        };

        // The process is not ready until the API server is listening.
        let mut manager = Manager::default();
        manager.add(
            ApiServer::new(
                cache,
                KubeActivator::new(runtime.client()),
                ApiServerConfig {
                    addr: api_listen,
                    tls,
                    shutdown_grace_period: Some(Duration::from_secs(
                        api_shutdown_grace_period_secs,
                    )),
                },
            )
            .with_readiness(runtime.initialized_handle()),
        );

        let mut runnables = tokio::spawn(manager.run(runtime.shutdown_handle()));

        // Block the main thread on the shutdown signal. Once it fires, wait for the runnables to
        // complete before exiting. A runnable that fails beforehand (e.g. because the API server
        // cannot bind) terminates the process.
        let shutdown = runtime.run();
        tokio::pin!(shutdown);
        tokio::select! {
            res = &mut shutdown => if res.is_err() {
                bail!("Aborted");
            },
            res = &mut runnables => {
                res.context("runnables panicked")??;
                bail!("runnables completed before shutdown");
            }
        }
        runnables.await.context("runnables panicked")?
    }
}

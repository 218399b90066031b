use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

use crate::SharedCache;

#[derive(Debug)]
struct Instrumented(SharedCache);

pub fn register(reg: &mut Registry, cache: SharedCache) {
    reg.register_collector(Box::new(Instrumented(cache)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut game_servers_encoder = encoder.encode_descriptor(
            "game_server_index_size",
            "The number of game servers in the cache",
            None,
            MetricType::Gauge,
        )?;
        for (ns, size) in this.game_servers().namespace_sizes() {
            let labels = [("namespace", ns)];
            let game_servers = ConstGauge::new(size as u32);
            let game_servers_encoder = game_servers_encoder.encode_family(&labels)?;
            game_servers.encode(game_servers_encoder)?;
        }

        let mut builds_encoder = encoder.encode_descriptor(
            "game_server_build_index_size",
            "The number of game server builds in the cache",
            None,
            MetricType::Gauge,
        )?;
        for (ns, size) in this.builds().namespace_sizes() {
            let labels = [("namespace", ns)];
            let builds = ConstGauge::new(size as u32);
            let builds_encoder = builds_encoder.encode_family(&labels)?;
            builds.encode(builds_encoder)?;
        }

        let mut keys_encoder = encoder.encode_descriptor(
            "field_index_keys",
            "The number of distinct keys in each field index",
            None,
            MetricType::Gauge,
        )?;
        let game_servers = this.game_servers();
        let builds = this.builds();
        let sizes = game_servers
            .index_sizes()
            .map(|(index, size)| (game_servers.kind(), index, size))
            .chain(
                builds
                    .index_sizes()
                    .map(|(index, size)| (builds.kind(), index, size)),
            );
        for (kind, index, size) in sizes {
            let labels = [("kind", kind), ("index", index)];
            let keys = ConstGauge::new(size as u32);
            let keys_encoder = keys_encoder.encode_family(&labels)?;
            keys.encode(keys_encoder)?;
        }

        Ok(())
    }
}

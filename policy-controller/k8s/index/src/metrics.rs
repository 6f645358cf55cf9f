use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut policies_encoder = encoder.encode_descriptor(
            "network_policy_index_size",
            "The number of network policies in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in this.namespaces() {
            let labels = [("namespace", ns.as_str())];
            let policies = ConstGauge::new(index.policies.len() as u32);
            let policies_encoder = policies_encoder.encode_family(&labels)?;
            policies.encode(policies_encoder)?;
        }

        let mut pods_encoder = encoder.encode_descriptor(
            "pod_index_size",
            "The number of pods in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in this.namespaces() {
            let labels = [("namespace", ns.as_str())];
            let pods = ConstGauge::new(index.pods.len() as u32);
            let pods_encoder = pods_encoder.encode_family(&labels)?;
            pods.encode(pods_encoder)?;
        }

        let mut skipped_encoder = encoder.encode_descriptor(
            "skipped_rules",
            "The number of policy rules skipped because they could not be parsed",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in this.namespaces() {
            let labels = [("namespace", ns.as_str())];
            let skipped = index
                .policies
                .values()
                .map(|state| state.policy.skipped)
                .sum::<usize>();
            let skipped = ConstGauge::new(skipped as u32);
            let skipped_encoder = skipped_encoder.encode_family(&labels)?;
            skipped.encode(skipped_encoder)?;
        }

        Ok(())
    }
}

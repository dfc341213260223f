//! Metric registry built once at startup from the configuration tree.
//!
//! Every Target→Block→Metric triple maps to a gauge handle keyed by
//! `(target ip, metric name)`. The reserved recipe metric maps to a pair
//! of derived handles instead. Handles live for the process lifetime and
//! are written once per target per cycle.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::TargetConfig;
use crate::recipe::{RECIPE_METRIC, RecipeParts};

/// Registry build failures. These surface before the first poll and are
/// fatal to startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate metric '{name}' for target {ip}")]
    DuplicateMetric { ip: String, name: String },
}

/// Publish failures. The orchestrator only feeds keys it registered, so
/// these indicate a wiring bug rather than bad controller data.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no handle for metric '{name}' on target {ip}")]
    UnknownHandle { ip: String, name: String },
    #[error("metric '{name}' is not a {expected} handle")]
    WrongKind {
        name: String,
        expected: &'static str,
    },
}

/// Label set shared by every exported gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TargetLabels {
    pub target: String,
}

type TargetGauge = Family<TargetLabels, Gauge<f64, AtomicU64>>;

/// Key of a metric handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandleKey {
    ip: String,
    name: String,
}

enum MetricHandle {
    Plain(TargetGauge),
    Recipe {
        alphabet: TargetGauge,
        number: TargetGauge,
    },
}

/// The fixed set of gauge handles plus the underlying Prometheus registry.
pub struct MetricRegistry {
    registry: Registry,
    handles: HashMap<HandleKey, MetricHandle>,
}

impl MetricRegistry {
    /// Walk the configuration tree and register one handle per metric,
    /// two for the reserved recipe metric.
    ///
    /// A `(ip, name)` pair appearing twice is rejected. The same metric
    /// name on two different targets is fine and shares a single gauge
    /// family, one series per `target` label.
    pub fn build(targets: &[TargetConfig]) -> Result<Self, RegistryError> {
        let mut registry = Registry::default();
        let mut handles = HashMap::new();
        let mut families: HashMap<String, TargetGauge> = HashMap::new();

        for target in targets {
            for block in &target.db {
                for metric in &block.metrics {
                    let key = HandleKey {
                        ip: target.ip.clone(),
                        name: metric.name.clone(),
                    };
                    if handles.contains_key(&key) {
                        return Err(RegistryError::DuplicateMetric {
                            ip: key.ip,
                            name: key.name,
                        });
                    }

                    let handle = if metric.name == RECIPE_METRIC {
                        let alphabet = register_family(
                            &mut registry,
                            &mut families,
                            &format!("{}_alphabet", metric.name),
                            &format!("Alphabet part of {}", metric.name),
                        );
                        let number = register_family(
                            &mut registry,
                            &mut families,
                            &format!("{}_number", metric.name),
                            &format!("Numeric part of {}", metric.name),
                        );
                        MetricHandle::Recipe { alphabet, number }
                    } else {
                        MetricHandle::Plain(register_family(
                            &mut registry,
                            &mut families,
                            &metric.name,
                            &metric.help,
                        ))
                    };

                    debug!(
                        "Registered gauge '{}' for target {}",
                        metric.name, target.ip
                    );
                    handles.insert(key, handle);
                }
            }
        }

        Ok(Self { registry, handles })
    }

    /// Whether `(ip, name)` resolves to the derived recipe pair.
    pub fn is_recipe(&self, ip: &str, name: &str) -> bool {
        matches!(
            self.handles.get(&HandleKey {
                ip: ip.to_string(),
                name: name.to_string(),
            }),
            Some(MetricHandle::Recipe { .. })
        )
    }

    /// Set a plain gauge observation.
    pub fn set_value(
        &self,
        ip: &str,
        name: &str,
        label: &str,
        value: f64,
    ) -> Result<(), PublishError> {
        let key = HandleKey {
            ip: ip.to_string(),
            name: name.to_string(),
        };
        match self.handles.get(&key) {
            Some(MetricHandle::Plain(family)) => {
                family
                    .get_or_create(&TargetLabels {
                        target: label.to_string(),
                    })
                    .set(value);
                Ok(())
            }
            Some(MetricHandle::Recipe { .. }) => Err(PublishError::WrongKind {
                name: key.name,
                expected: "plain",
            }),
            None => Err(PublishError::UnknownHandle {
                ip: key.ip,
                name: key.name,
            }),
        }
    }

    /// Set both derived recipe observations.
    pub fn set_recipe(
        &self,
        ip: &str,
        name: &str,
        label: &str,
        parts: RecipeParts,
    ) -> Result<(), PublishError> {
        let key = HandleKey {
            ip: ip.to_string(),
            name: name.to_string(),
        };
        match self.handles.get(&key) {
            Some(MetricHandle::Recipe { alphabet, number }) => {
                let labels = TargetLabels {
                    target: label.to_string(),
                };
                alphabet.get_or_create(&labels).set(f64::from(parts.rank));
                number.get_or_create(&labels).set(parts.number as f64);
                Ok(())
            }
            Some(MetricHandle::Plain(_)) => Err(PublishError::WrongKind {
                name: key.name,
                expected: "recipe",
            }),
            None => Err(PublishError::UnknownHandle {
                ip: key.ip,
                name: key.name,
            }),
        }
    }

    /// Number of registered handles (the recipe pair counts as one).
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Err(e) = encode(&mut out, &self.registry) {
            warn!("Failed to encode metrics: {}", e);
        }
        out
    }
}

/// Register a gauge family, or hand back the existing one when another
/// target already claimed the name. First registration wins the help text.
fn register_family(
    registry: &mut Registry,
    families: &mut HashMap<String, TargetGauge>,
    name: &str,
    help: &str,
) -> TargetGauge {
    families
        .entry(name.to_string())
        .or_insert_with(|| {
            let family = TargetGauge::default();
            registry.register(name, help, family.clone());
            family
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExporterConfig;

    fn targets(json: &str) -> Vec<TargetConfig> {
        ExporterConfig::parse(json).unwrap().targets
    }

    const BASIC: &str = r#"{
        targets: [
            {
                ip: "192.168.0.10",
                label: "line1",
                db: [
                    {
                        number: 100,
                        metrics: [
                            { name: "Temperature", type: "float", offset: 0, help: "Oven temperature" },
                            { name: "Recepi", type: "string", offset: 10 }
                        ]
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_build_registers_plain_and_recipe() {
        let registry = MetricRegistry::build(&targets(BASIC)).unwrap();
        assert_eq!(registry.handle_count(), 2);
        assert!(!registry.is_recipe("192.168.0.10", "Temperature"));
        assert!(registry.is_recipe("192.168.0.10", "Recepi"));
    }

    #[test]
    fn test_set_and_render() {
        let registry = MetricRegistry::build(&targets(BASIC)).unwrap();

        registry
            .set_value("192.168.0.10", "Temperature", "line1", 42.5)
            .unwrap();
        registry
            .set_recipe(
                "192.168.0.10",
                "Recepi",
                "line1",
                RecipeParts { rank: 1, number: 7 },
            )
            .unwrap();

        let out = registry.render();
        assert!(out.contains("# HELP Temperature Oven temperature"));
        assert!(out.contains("# TYPE Temperature gauge"));
        assert!(out.contains("Temperature{target=\"line1\"} 42.5"));
        assert!(out.contains("Recepi_alphabet{target=\"line1\"} 1"));
        assert!(out.contains("Recepi_number{target=\"line1\"} 7"));
    }

    #[test]
    fn test_duplicate_metric_rejected() {
        let json = r#"{
            targets: [
                {
                    ip: "10.0.0.1",
                    label: "plc",
                    db: [
                        { number: 1, metrics: [ { name: "Pressure", type: "float", offset: 0 } ] },
                        { number: 2, metrics: [ { name: "Pressure", type: "float", offset: 4 } ] }
                    ]
                }
            ]
        }"#;

        let err = MetricRegistry::build(&targets(json)).unwrap_err();
        assert!(
            err.to_string()
                .contains("duplicate metric 'Pressure' for target 10.0.0.1")
        );
    }

    #[test]
    fn test_same_name_on_two_targets_shares_family() {
        let json = r#"{
            targets: [
                {
                    ip: "10.0.0.1",
                    label: "line1",
                    db: [ { number: 1, metrics: [ { name: "Speed", type: "int", offset: 0, help: "Belt speed" } ] } ]
                },
                {
                    ip: "10.0.0.2",
                    label: "line2",
                    db: [ { number: 1, metrics: [ { name: "Speed", type: "int", offset: 0, help: "Belt speed" } ] } ]
                }
            ]
        }"#;

        let registry = MetricRegistry::build(&targets(json)).unwrap();
        registry.set_value("10.0.0.1", "Speed", "line1", 10.0).unwrap();
        registry.set_value("10.0.0.2", "Speed", "line2", 20.0).unwrap();

        let out = registry.render();
        assert!(out.contains("Speed{target=\"line1\"} 10"));
        assert!(out.contains("Speed{target=\"line2\"} 20"));
        // One family, one TYPE line
        assert_eq!(out.matches("# TYPE Speed gauge").count(), 1);
    }

    #[test]
    fn test_build_is_idempotent() {
        let cfg = targets(BASIC);
        let a = MetricRegistry::build(&cfg).unwrap();
        let b = MetricRegistry::build(&cfg).unwrap();

        a.set_value("192.168.0.10", "Temperature", "line1", 1.0)
            .unwrap();
        b.set_value("192.168.0.10", "Temperature", "line1", 1.0)
            .unwrap();
        a.set_recipe(
            "192.168.0.10",
            "Recepi",
            "line1",
            RecipeParts { rank: 2, number: 3 },
        )
        .unwrap();
        b.set_recipe(
            "192.168.0.10",
            "Recepi",
            "line1",
            RecipeParts { rank: 2, number: 3 },
        )
        .unwrap();

        assert_eq!(a.render(), b.render());
    }

    #[test]
    fn test_publish_unknown_handle() {
        let registry = MetricRegistry::build(&targets(BASIC)).unwrap();
        let err = registry
            .set_value("192.168.0.10", "Nope", "line1", 0.0)
            .unwrap_err();
        assert!(matches!(err, PublishError::UnknownHandle { .. }));
    }

    #[test]
    fn test_publish_wrong_kind() {
        let registry = MetricRegistry::build(&targets(BASIC)).unwrap();
        let err = registry
            .set_value("192.168.0.10", "Recepi", "line1", 0.0)
            .unwrap_err();
        assert!(matches!(err, PublishError::WrongKind { .. }));
    }
}

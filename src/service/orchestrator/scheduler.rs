//! Dependency-layer scheduling.
//!
//! Registered analyzers are placed into layers: an analyzer is ready once
//! every registered prerequisite sits in an earlier layer. Ready analyzers
//! form the next layer, highest priority first. When nothing is ready but
//! analyzers remain (a cycle), the highest-priority remaining analyzer is
//! promoted into a layer of its own and a warning is recorded. Every pass
//! places at least one analyzer, so N analyzers need at most N layers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::domain::AnalyzerType;

/// Static prerequisite map, read-only during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<AnalyzerType, BTreeSet<AnalyzerType>>,
}

impl DependencyGraph {
    /// A graph with no dependencies.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default wiring: every local category blends a Lighthouse score
    /// except structure; mobile also reads performance output and
    /// accessibility reads structure.
    pub fn standard() -> Self {
        use AnalyzerType::*;
        Self::new()
            .with_dependency(Performance, Lighthouse)
            .with_dependency(Security, Lighthouse)
            .with_dependency(Seo, Lighthouse)
            .with_dependency(Accessibility, Lighthouse)
            .with_dependency(Accessibility, Structure)
            .with_dependency(Mobile, Lighthouse)
            .with_dependency(Mobile, Performance)
            .with_dependency(Content, Lighthouse)
    }

    /// Declare that `analyzer` needs `prerequisite` to have run first.
    pub fn with_dependency(mut self, analyzer: AnalyzerType, prerequisite: AnalyzerType) -> Self {
        self.edges.entry(analyzer).or_default().insert(prerequisite);
        self
    }

    pub fn prerequisites(&self, analyzer: AnalyzerType) -> impl Iterator<Item = AnalyzerType> + '_ {
        self.edges.get(&analyzer).into_iter().flatten().copied()
    }
}

/// Non-fatal scheduling problems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleWarning {
    /// `promoted` was scheduled before its registered prerequisites in
    /// `unmet`, so it sees no output from them.
    DependencyCycleBroken {
        promoted: AnalyzerType,
        unmet: Vec<AnalyzerType>,
    },
}

impl fmt::Display for ScheduleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleWarning::DependencyCycleBroken { promoted, unmet } => {
                let unmet: Vec<&str> = unmet.iter().map(|t| t.as_str()).collect();
                write!(
                    f,
                    "dependency cycle broken: {} runs before unmet prerequisites [{}]",
                    promoted,
                    unmet.join(", ")
                )
            }
        }
    }
}

/// Ordered layers plus any warnings raised while building them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    pub layers: Vec<Vec<AnalyzerType>>,
    pub warnings: Vec<ScheduleWarning>,
}

impl Schedule {
    pub fn analyzer_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    pub fn layer_of(&self, analyzer: AnalyzerType) -> Option<usize> {
        self.layers.iter().position(|layer| layer.contains(&analyzer))
    }
}

/// Highest priority first; ties keep the enum order so output is stable.
fn by_priority(a: &(AnalyzerType, i32), b: &(AnalyzerType, i32)) -> std::cmp::Ordering {
    b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

/// Build execution layers for the registered `(type, priority)` pairs.
///
/// Prerequisites that are not registered are ignored.
pub fn build_layers(registered: &[(AnalyzerType, i32)], graph: &DependencyGraph) -> Schedule {
    let mut pending: BTreeMap<AnalyzerType, i32> = registered.iter().copied().collect();
    let is_registered = |t: AnalyzerType| registered.iter().any(|(r, _)| *r == t);

    let mut placed: BTreeSet<AnalyzerType> = BTreeSet::new();
    let mut schedule = Schedule::default();

    while !pending.is_empty() {
        let mut ready: Vec<(AnalyzerType, i32)> = pending
            .iter()
            .filter(|(kind, _)| {
                graph
                    .prerequisites(**kind)
                    .filter(|p| is_registered(*p))
                    .all(|p| placed.contains(&p))
            })
            .map(|(kind, priority)| (*kind, *priority))
            .collect();

        if ready.is_empty() {
            let mut remaining: Vec<(AnalyzerType, i32)> =
                pending.iter().map(|(k, p)| (*k, *p)).collect();
            remaining.sort_by(by_priority);
            let (promoted, priority) = remaining[0];

            let unmet: Vec<AnalyzerType> = graph
                .prerequisites(promoted)
                .filter(|p| is_registered(*p) && !placed.contains(p))
                .collect();
            let warning = ScheduleWarning::DependencyCycleBroken { promoted, unmet };
            tracing::warn!("[SCHEDULER] {}", warning);
            schedule.warnings.push(warning);

            ready = vec![(promoted, priority)];
        }

        ready.sort_by(by_priority);
        let layer: Vec<AnalyzerType> = ready.iter().map(|(kind, _)| *kind).collect();
        for kind in &layer {
            pending.remove(kind);
            placed.insert(*kind);
        }
        tracing::debug!("[SCHEDULER] Layer {}: {:?}", schedule.layers.len(), layer);
        schedule.layers.push(layer);
    }

    schedule
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use AnalyzerType::*;

    fn defaults(types: &[AnalyzerType]) -> Vec<(AnalyzerType, i32)> {
        types.iter().map(|t| (*t, t.default_priority())).collect()
    }

    #[test]
    fn lighthouse_first_then_dependents_by_priority() {
        let graph = DependencyGraph::new()
            .with_dependency(Seo, Lighthouse)
            .with_dependency(Content, Lighthouse);
        let schedule = build_layers(&defaults(&[Content, Seo, Lighthouse]), &graph);

        assert_eq!(schedule.layers, vec![vec![Lighthouse], vec![Seo, Content]]);
        assert!(schedule.warnings.is_empty());
    }

    #[test]
    fn standard_graph_with_every_analyzer() {
        let schedule = build_layers(&defaults(&AnalyzerType::ALL), &DependencyGraph::standard());

        assert_eq!(
            schedule.layers,
            vec![
                vec![Lighthouse, Structure],
                vec![Performance, Security, Seo, Accessibility, Content],
                vec![Mobile],
            ]
        );
    }

    #[test]
    fn unregistered_prerequisites_are_ignored() {
        let schedule = build_layers(&defaults(&[Seo, Mobile]), &DependencyGraph::standard());
        assert_eq!(schedule.layers, vec![vec![Seo, Mobile]]);
        assert!(schedule.warnings.is_empty());
    }

    #[test]
    fn cycle_is_broken_by_priority() {
        let graph = DependencyGraph::new()
            .with_dependency(Seo, Content)
            .with_dependency(Content, Seo);
        let schedule = build_layers(&defaults(&[Seo, Content, Security]), &graph);

        assert_eq!(schedule.layers, vec![vec![Security], vec![Seo], vec![Content]]);
        assert_eq!(
            schedule.warnings,
            vec![ScheduleWarning::DependencyCycleBroken {
                promoted: Seo,
                unmet: vec![Content],
            }]
        );
    }

    #[test]
    fn equal_priorities_fall_back_to_type_order() {
        let registered = vec![(Mobile, 5), (Seo, 5), (Content, 5)];
        let schedule = build_layers(&registered, &DependencyGraph::new());
        assert_eq!(schedule.layers, vec![vec![Seo, Mobile, Content]]);
    }

    #[test]
    fn empty_registry_has_no_layers() {
        let schedule = build_layers(&[], &DependencyGraph::standard());
        assert!(schedule.layers.is_empty());
    }

    fn arb_type() -> impl Strategy<Value = AnalyzerType> {
        (0..AnalyzerType::ALL.len()).prop_map(|i| AnalyzerType::ALL[i])
    }

    fn arb_registry() -> impl Strategy<Value = Vec<(AnalyzerType, i32)>> {
        proptest::collection::btree_map(arb_type(), -50i32..150, 0..=8)
            .prop_map(|m| m.into_iter().collect())
    }

    fn arb_graph() -> impl Strategy<Value = DependencyGraph> {
        proptest::collection::vec((arb_type(), arb_type()), 0..20).prop_map(|edges| {
            edges
                .into_iter()
                .fold(DependencyGraph::new(), |g, (a, p)| g.with_dependency(a, p))
        })
    }

    proptest! {
        #[test]
        fn layers_partition_the_registered_set(registered in arb_registry(), graph in arb_graph()) {
            let schedule = build_layers(&registered, &graph);

            let mut seen: Vec<AnalyzerType> = schedule.layers.iter().flatten().copied().collect();
            seen.sort();
            let mut expected: Vec<AnalyzerType> = registered.iter().map(|(t, _)| *t).collect();
            expected.sort();

            prop_assert_eq!(seen, expected);
            prop_assert!(schedule.layers.len() <= registered.len());
            prop_assert!(schedule.layers.iter().all(|l| !l.is_empty()));
        }

        #[test]
        fn prerequisites_run_in_earlier_layers_unless_flagged(
            registered in arb_registry(),
            graph in arb_graph(),
        ) {
            let schedule = build_layers(&registered, &graph);
            let flagged: Vec<AnalyzerType> = schedule
                .warnings
                .iter()
                .map(|ScheduleWarning::DependencyCycleBroken { promoted, .. }| *promoted)
                .collect();

            for (kind, _) in &registered {
                if flagged.contains(kind) {
                    continue;
                }
                let own = schedule.layer_of(*kind).unwrap();
                for prereq in graph.prerequisites(*kind) {
                    if let Some(layer) = schedule.layer_of(prereq) {
                        prop_assert!(layer < own, "{:?} (layer {}) needs {:?} (layer {})", kind, own, prereq, layer);
                    }
                }
            }
        }

        #[test]
        fn acyclic_graphs_never_warn(registered in arb_registry()) {
            let schedule = build_layers(&registered, &DependencyGraph::standard());
            prop_assert!(schedule.warnings.is_empty());
        }

        #[test]
        fn layers_are_sorted_by_priority(registered in arb_registry(), graph in arb_graph()) {
            let schedule = build_layers(&registered, &graph);
            let priority = |t: &AnalyzerType| registered.iter().find(|(r, _)| r == t).map(|(_, p)| *p).unwrap();
            for layer in &schedule.layers {
                for pair in layer.windows(2) {
                    prop_assert!(priority(&pair[0]) >= priority(&pair[1]));
                }
            }
        }
    }
}

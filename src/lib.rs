//! # IdGraph
//!
//! An identity graph resolution engine: deterministic entity clustering over
//! shared identifiers, with incremental runs, fuzzy cluster merging,
//! confidence scoring and survivorship-based golden profiles.
//!
//! The pipeline is stage-ordered and produces the same final assignment
//! regardless of evaluation order inside a stage, so parallel execution and
//! reruns are safe to compare byte for byte.

pub mod confidence;
pub mod config;
pub mod dsu;
pub mod edges;
pub mod errors;
pub mod exclusion;
pub mod fuzzy;
pub mod golden;
pub mod incremental;
pub mod model;
pub mod report;
pub mod resolver;
pub mod rules;
pub mod runner;
pub mod store;

// Re-export main types for convenience
pub use config::{ConfigOverrides, EngineConfig, ResolverStrategy};
pub use errors::{EngineError, Result};
pub use model::{
    Attribute, ClusterRecord, DryRunReport, Edge, Entity, GoldenProfile, Identifier, Membership,
    RunMode, RunState, RunStatus, RunSummary, SkippedGroup, Warning, WarningKind,
};
pub use report::{ReportHeader, ReportLine, ResolutionReport};
pub use rules::{
    ExactRule, ExclusionRule, FuzzyRule, RuleSet, ScoreFn, SurvivorshipRule, SurvivorshipStrategy,
};
pub use runner::{RunInput, RunParams, Runner};
pub use store::{MemoryStore, PreviewState, RunRecord, RunRecordStatus, StateStore};

/// Main API for identity resolution
pub struct IdGraph {
    store: Box<dyn StateStore>,
    rules: RuleSet,
    config: EngineConfig,
}

impl IdGraph {
    /// Create an engine over the in-memory store with default tunables.
    pub fn new(rules: RuleSet) -> Self {
        Self::with_store(rules, EngineConfig::default(), MemoryStore::new())
    }

    /// Create an engine over the in-memory store with explicit tunables.
    pub fn with_config(rules: RuleSet, config: EngineConfig) -> Self {
        Self::with_store(rules, config, MemoryStore::new())
    }

    /// Create an engine with a custom store backend.
    pub fn with_store<S>(rules: RuleSet, config: EngineConfig, store: S) -> Self
    where
        S: StateStore + 'static,
    {
        Self {
            store: Box::new(store),
            rules,
            config,
        }
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute one run.
    pub fn run(&self, input: RunInput<'_>, params: &RunParams) -> Result<RunSummary> {
        Runner::new(self.store.as_ref(), &self.rules, &self.config).execute(input, params)
    }

    /// FULL rebuild over the given rows.
    pub fn run_full(
        &self,
        entities: &[Entity],
        identifiers: &[Identifier],
        attributes: &[Attribute],
    ) -> Result<RunSummary> {
        self.run(
            RunInput::new(entities, identifiers, attributes),
            &RunParams::full(),
        )
    }

    /// INCR run over a delta extract.
    pub fn run_incremental(
        &self,
        entities: &[Entity],
        identifiers: &[Identifier],
        attributes: &[Attribute],
    ) -> Result<RunSummary> {
        self.run(
            RunInput::new(entities, identifiers, attributes),
            &RunParams::incremental(),
        )
    }

    /// Preview a run on the preview surface without touching durable state.
    pub fn dry_run(&self, input: RunInput<'_>, mode: RunMode) -> Result<RunSummary> {
        let params = match mode {
            RunMode::Full => RunParams::full(),
            RunMode::Incr => RunParams::incremental(),
        }
        .with_dry_run();
        self.run(input, &params)
    }

    /// Current cluster membership rows, sorted by entity key.
    pub fn memberships(&self) -> Result<Vec<Membership>> {
        self.store.memberships()
    }

    /// Scored cluster records, sorted by resolved id.
    pub fn cluster_records(&self) -> Result<Vec<ClusterRecord>> {
        self.store.cluster_records()
    }

    /// Golden profiles, sorted by resolved id.
    pub fn golden_profiles(&self) -> Result<Vec<GoldenProfile>> {
        self.store.golden_profiles()
    }

    /// Run history, oldest first.
    pub fn run_history(&self) -> Result<Vec<RunRecord>> {
        self.store.run_history()
    }

    /// Results parked by a dry run.
    pub fn preview(&self, run_id: &str) -> Result<Option<PreviewState>> {
        self.store.preview(run_id)
    }

    /// Snapshot the committed reporting surface for JSONL export.
    pub fn report(&self) -> Result<ResolutionReport> {
        ResolutionReport::from_store(self.store.as_ref())
    }
}

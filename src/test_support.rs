use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use idgraph::model::{Attribute, Entity, Identifier};
use idgraph::rules::{ExactRule, RuleSet, SurvivorshipRule, SurvivorshipStrategy};

#[allow(dead_code)]
pub const SOURCES: [&str; 5] = ["crm", "erp", "web", "mobile", "api"];

const SHARED_POOL: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct GeneratedDataset {
    pub entities: Vec<Entity>,
    pub identifiers: Vec<Identifier>,
    pub attributes: Vec<Attribute>,
}

#[allow(dead_code)]
impl GeneratedDataset {
    /// Appends another batch, keeping the field order stable.
    pub fn extend(&mut self, other: GeneratedDataset) {
        self.entities.extend(other.entities);
        self.identifiers.extend(other.identifiers);
        self.attributes.extend(other.attributes);
    }
}

/// Rules used by most integration tests: exact email + phone matching with
/// recency/frequency survivorship over the generated attributes.
#[allow(dead_code)]
pub fn default_rules() -> RuleSet {
    let mut rules = RuleSet::new();
    rules.add_exact_rule(ExactRule::new("email_exact", "email"));
    rules.add_exact_rule(ExactRule::new("phone_exact", "phone"));
    rules.add_survivorship(SurvivorshipRule::new(
        "full_name",
        SurvivorshipStrategy::Recency,
    ));
    rules.add_survivorship(SurvivorshipRule::new(
        "city",
        SurvivorshipStrategy::Frequency,
    ));
    rules
}

#[allow(dead_code)]
pub fn generate_dataset(count: u32, overlap_probability: f64, seed: u64) -> GeneratedDataset {
    generate_batch(1, count, overlap_probability, seed)
}

/// Generates `count` entities starting at `start_index`, with identifier
/// values drawn from a small shared pool with probability
/// `overlap_probability` (unique values otherwise). Shared values knit
/// entities into multi-member clusters; unique values leave singletons.
#[allow(dead_code)]
pub fn generate_batch(
    start_index: u32,
    count: u32,
    overlap_probability: f64,
    seed: u64,
) -> GeneratedDataset {
    let mut rng = StdRng::seed_from_u64(seed ^ start_index as u64);
    let mut entities = Vec::with_capacity(count as usize);
    let mut identifiers = Vec::new();
    let mut attributes = Vec::new();

    let cities = ["athens", "berlin", "cairo", "denver", "essen"];

    for i in start_index..start_index + count {
        let source = SOURCES[rng.random_range(0..SOURCES.len())];
        let key = format!("{}_{:06}", source, i);
        let watermark = 1_000 + i as i64;

        entities.push(Entity::new(&key, source, watermark));

        let email = if rng.random_bool(overlap_probability) {
            format!("shared_{:02}@example.com", rng.random_range(0..SHARED_POOL))
        } else {
            format!("person_{:06}@example.com", i)
        };
        identifiers.push(Identifier::new(&key, "email", email, "email_exact"));

        if rng.random_bool(0.5) {
            let phone = if rng.random_bool(overlap_probability) {
                format!("555-{:04}", rng.random_range(0..SHARED_POOL))
            } else {
                format!("777-{:07}", i)
            };
            identifiers.push(Identifier::new(&key, "phone", phone, "phone_exact"));
        }

        attributes.push(Attribute::new(
            &key,
            "full_name",
            format!("Person {:06}", i),
            watermark,
            source,
        ));
        attributes.push(Attribute::new(
            &key,
            "city",
            cities[rng.random_range(0..cities.len())],
            watermark,
            source,
        ));
    }

    GeneratedDataset {
        entities,
        identifiers,
        attributes,
    }
}

//! Per-species online genetic optimizer (`spec.md` §4.11).
//!
//! Each species keeps its own fixed-size population of gene vectors, a
//! pending-evaluation table keyed by an opaque `eval_id`, and a running
//! fitness record. `sample` hands out genes via tournament selection plus
//! Gaussian perturbation; `complete` records an outcome and, once enough
//! outcomes have accumulated, advances the generation (elitism + crossover +
//! mutation). [`GeneticSystem`] is the tick-driven glue: it samples on
//! `EnemyCreated`, accumulates per-entity metrics every tick, and reports
//! `complete` the moment an entity's species store stops reporting it alive.

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use vf_ecs::EntityId;

use crate::components::{Genotype, Kinetic, Navigation, Protection, Shield, SpeciesKind};
use crate::events::{EventKind, SimEvent};
use crate::fixed;
use crate::scheduler::{MetaSystemCommand, SimContext, System};

/// Genes per individual. A small, fixed count keeps `sample`/`mutate`
/// allocation-free in practice and is enough to tune the handful of
/// per-species navigation/physics dials this crate exposes.
const GENE_COUNT: usize = 4;
const POPULATION_SIZE: usize = 16;
const ELITE_COUNT: usize = 2;
const TOURNAMENT_SIZE: usize = 3;
const DEFAULT_SIGMA: f64 = 0.15;
const GENE_BOUNDS: (f64, f64) = (-1.0, 1.0);

/// One individual: a gene vector plus its most recent fitness (`f64::MIN`
/// until first evaluated, so it never wins a tournament by default).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Individual {
    genes: [f64; GENE_COUNT],
    fitness: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpeciesGaState {
    population: Vec<Individual>,
    pending: HashMap<u64, [f64; GENE_COUNT]>,
    next_eval_id: u64,
    generation: u64,
    completed_this_generation: u64,
    total_outcomes: u64,
    sigma: f64,
}

impl SpeciesGaState {
    fn new(rng: &mut Pcg64) -> Self {
        let population = (0..POPULATION_SIZE)
            .map(|_| Individual {
                genes: std::array::from_fn(|_| rng.gen_range(GENE_BOUNDS.0..=GENE_BOUNDS.1)),
                fitness: f64::MIN,
            })
            .collect();
        Self {
            population,
            pending: HashMap::new(),
            next_eval_id: 0,
            generation: 0,
            completed_this_generation: 0,
            total_outcomes: 0,
            sigma: DEFAULT_SIGMA,
        }
    }

    fn tournament_pick(&self, rng: &mut Pcg64) -> [f64; GENE_COUNT] {
        let mut best: Option<&Individual> = None;
        for _ in 0..TOURNAMENT_SIZE {
            let candidate = &self.population[rng.gen_range(0..self.population.len())];
            if best.map(|b| candidate.fitness > b.fitness).unwrap_or(true) {
                best = Some(candidate);
            }
        }
        best.expect("tournament size > 0").genes
    }

    fn mutate(genes: [f64; GENE_COUNT], sigma: f64, rng: &mut Pcg64) -> [f64; GENE_COUNT] {
        let normal = Normal::new(0.0, sigma).expect("sigma > 0");
        std::array::from_fn(|i| (genes[i] + normal.sample(rng)).clamp(GENE_BOUNDS.0, GENE_BOUNDS.1))
    }

    fn sample(&mut self, rng: &mut Pcg64) -> ([f64; GENE_COUNT], u64) {
        let eval_id = self.next_eval_id;
        self.next_eval_id += 1;

        // Below population size, draw directly from the current population in
        // order, so the very first generation gets evaluated without any
        // selection bias (`spec.md` §4.11 "sample directly... if fewer
        // evaluations than population size").
        let genes = if (eval_id as usize) < self.population.len() {
            self.population[eval_id as usize].genes
        } else {
            let parent = self.tournament_pick(rng);
            Self::mutate(parent, self.sigma, rng)
        };

        self.pending.insert(eval_id, genes);
        (genes, eval_id)
    }

    fn complete(&mut self, eval_id: u64, fitness: f64, rng: &mut Pcg64) {
        let Some(genes) = self.pending.remove(&eval_id) else {
            return;
        };
        self.total_outcomes += 1;

        if (eval_id as usize) < self.population.len() {
            self.population[eval_id as usize].fitness = fitness;
        } else {
            // a mutated, already-evaluated challenger: replace the weakest
            // member of the population if it beats it.
            if let Some(weakest) = self
                .population
                .iter_mut()
                .min_by(|a, b| a.fitness.partial_cmp(&b.fitness).unwrap())
            {
                if fitness > weakest.fitness {
                    weakest.genes = genes;
                    weakest.fitness = fitness;
                }
            }
        }

        self.completed_this_generation += 1;
        if self.completed_this_generation >= POPULATION_SIZE as u64 {
            self.advance_generation(rng);
        }
    }

    fn advance_generation(&mut self, rng: &mut Pcg64) {
        let mut ranked = self.population.clone();
        ranked.sort_by(|a, b| b.fitness.partial_cmp(&a.fitness).unwrap());

        let mut next = Vec::with_capacity(POPULATION_SIZE);
        next.extend(ranked.iter().take(ELITE_COUNT).cloned());
        while next.len() < POPULATION_SIZE {
            let a = self.tournament_pick(rng);
            let b = self.tournament_pick(rng);
            let crossed: [f64; GENE_COUNT] = std::array::from_fn(|i| if rng.gen_bool(0.5) { a[i] } else { b[i] });
            next.push(Individual {
                genes: Self::mutate(crossed, self.sigma, rng),
                fitness: f64::MIN,
            });
        }

        self.population = next;
        self.generation += 1;
        self.completed_this_generation = 0;
    }

    fn stats(&self) -> GaStats {
        let best = self.population.iter().map(|i| i.fitness).fold(f64::MIN, f64::max);
        let sum: f64 = self.population.iter().map(|i| i.fitness).sum();
        GaStats {
            generation: self.generation,
            best,
            average: sum / self.population.len() as f64,
            pending: self.pending.len(),
            total_outcomes: self.total_outcomes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaStats {
    pub generation: u64,
    pub best: f64,
    pub average: f64,
    pub pending: usize,
    pub total_outcomes: u64,
}

/// On-disk persisted form of every species' GA state (`spec.md` §6
/// "Persisted state"). Versioned so a future gene-count or species-set
/// change can still load an old blob's compatible parts rather than failing
/// outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedGa {
    version: u32,
    species: Vec<(SpeciesKind, SpeciesGaState)>,
}

const PERSISTED_GA_VERSION: u32 = 1;

/// Owns every species' population and the RNG that drives selection and
/// mutation.
pub struct GeneticOptimizer {
    species: HashMap<SpeciesKind, SpeciesGaState>,
    rng: Pcg64,
}

const ALL_SPECIES: [SpeciesKind; 6] = [
    SpeciesKind::Drain,
    SpeciesKind::Snake,
    SpeciesKind::Pylon,
    SpeciesKind::Quasar,
    SpeciesKind::Swarm,
    SpeciesKind::Storm,
];

impl GeneticOptimizer {
    pub fn new(seed: u64) -> Self {
        let mut rng = Pcg64::seed_from_u64(seed);
        let species = ALL_SPECIES
            .iter()
            .map(|&kind| (kind, SpeciesGaState::new(&mut rng)))
            .collect();
        Self { species, rng }
    }

    pub fn sample(&mut self, species: SpeciesKind) -> ([f64; GENE_COUNT], u64) {
        let state = self.species.entry(species).or_insert_with(|| SpeciesGaState::new(&mut Pcg64::seed_from_u64(0)));
        state.sample(&mut self.rng)
    }

    pub fn complete(&mut self, species: SpeciesKind, eval_id: u64, fitness: f64) {
        if let Some(state) = self.species.get_mut(&species) {
            state.complete(eval_id, fitness, &mut self.rng);
        }
    }

    pub fn stats(&self, species: SpeciesKind) -> Option<GaStats> {
        self.species.get(&species).map(|s| s.stats())
    }

    /// Serialize every species' state to a bincode blob for `SimWorld::save_ga`.
    pub fn export_blob(&self) -> Result<Vec<u8>, bincode::Error> {
        let persisted = PersistedGa {
            version: PERSISTED_GA_VERSION,
            species: self.species.iter().map(|(k, v)| (*k, v.clone())).collect(),
        };
        bincode::serialize(&persisted)
    }

    /// Deserialize a previously exported blob. A corrupt or version-mismatched
    /// blob is not fatal: callers should fall back to a fresh optimizer and
    /// log a warning rather than abort the whole simulation boot (`spec.md`
    /// §4.11 [SUPPLEMENT] persistence detail).
    pub fn import_blob(&mut self, blob: &[u8]) -> Result<(), bincode::Error> {
        let persisted: PersistedGa = bincode::deserialize(blob)?;
        if persisted.version != PERSISTED_GA_VERSION {
            tracing::warn!(
                found = persisted.version,
                expected = PERSISTED_GA_VERSION,
                "genetic optimizer blob version mismatch, ignoring"
            );
            return Ok(());
        }
        self.species = persisted.species.into_iter().collect();
        Ok(())
    }
}

/// Per-entity running metrics, kept outside the ECS since they are pure GA
/// bookkeeping, not simulation state the renderer needs (`spec.md` §4.11
/// "integrate metrics" mirrors `Genotype`, which stays the ECS-visible
/// summary). `last_metrics` shadows the entity's `Genotype` component so the
/// fitness aggregator still has something to read the tick the entity's
/// store stops reporting it alive and its components are already gone.
struct TrackedEntity {
    last_position: (fixed::Fixed, fixed::Fixed),
    last_cell: (i32, i32),
    last_metrics: Genotype,
}

/// Drives sampling on `EnemyCreated`, per-tick metric accumulation, and
/// fitness reporting on death.
pub struct GeneticSystem {
    optimizer: GeneticOptimizer,
    tracked: HashMap<EntityId, TrackedEntity>,
    cursor_cell: (i32, i32),
}

/// Per-species fitness weights: (ticks_alive, -avg_dist_sq, time_in_shield,
/// death_at_cursor). The last term rewards a species whose design goal is to
/// reach the cursor (a drain dying on cursor contact is a "good" death, not a
/// wasted one) rather than penalizing every death identically (`spec.md`
/// §4.11 "weighted sum of (ticks-alive, average distance², time-in-shield,
/// death-at-cursor)").
const FITNESS_WEIGHTS: (f64, f64, f64, f64) = (1.0, -0.001, 0.5, 25.0);

impl GeneticSystem {
    pub fn new(seed: u64) -> Self {
        Self {
            optimizer: GeneticOptimizer::new(seed),
            tracked: HashMap::new(),
            cursor_cell: (0, 0),
        }
    }

    pub fn stats(&self, species: SpeciesKind) -> Option<GaStats> {
        self.optimizer.stats(species)
    }

    pub fn export_blob(&self) -> Result<Vec<u8>, bincode::Error> {
        self.optimizer.export_blob()
    }

    pub fn import_blob(&mut self, blob: &[u8]) -> Result<(), bincode::Error> {
        self.optimizer.import_blob(blob)
    }

    fn fitness_of(genotype: &Genotype, died_at_cursor: bool) -> f64 {
        let avg_dist_sq = if genotype.sample_count > 0 {
            genotype.cum_dist_sq as f64 / genotype.sample_count as f64
        } else {
            0.0
        };
        FITNESS_WEIGHTS.0 * genotype.ticks_alive as f64
            + FITNESS_WEIGHTS.1 * avg_dist_sq
            + FITNESS_WEIGHTS.2 * genotype.time_in_shield as f64
            + if died_at_cursor { FITNESS_WEIGHTS.3 } else { 0.0 }
    }
}

impl System for GeneticSystem {
    fn name(&self) -> &'static str {
        "genetic"
    }

    fn priority(&self) -> i32 {
        400
    }

    fn run(&mut self, ctx: &mut SimContext, _dt_ms: i64) -> Vec<MetaSystemCommand> {
        for event in ctx.events.events() {
            if let SimEvent::CursorMoved { x, y } = event {
                self.cursor_cell = (*x, *y);
            }
        }

        for event in ctx.events.events_of_kind(EventKind::EnemyCreated) {
            if let SimEvent::EnemyCreated { entity, species } = event {
                let (genes, eval_id) = self.optimizer.sample(*species);
                let genotype = Genotype::new(*species, eval_id);
                ctx.world.set(*entity, genotype);
                if let Some(nav) = ctx.world.get_mut::<Navigation>(*entity) {
                    nav.turn_threshold = fixed::from_int(1) + fixed::mul(fixed::from_int(1), gene_to_fixed(genes[0]));
                    nav.brake_intensity = (fixed::SCALE / 2) + gene_to_fixed(genes[1]) / 2;
                    nav.exploration_bias = gene_to_fixed(genes[2]);
                    nav.budget_multiplier = fixed::SCALE + gene_to_fixed(genes[3]);
                }
                let cell = ctx.world.get::<Kinetic>(*entity).map(|k| k.grid_position()).unwrap_or((0, 0));
                self.tracked.insert(
                    *entity,
                    TrackedEntity {
                        last_position: ctx.world.get::<Kinetic>(*entity).map(|k| (k.x, k.y)).unwrap_or((0, 0)),
                        last_cell: cell,
                        last_metrics: genotype,
                    },
                );
            }
        }

        let mut gone = Vec::new();
        for (&entity, tracked) in self.tracked.iter_mut() {
            if !ctx.world.is_alive(entity) || !ctx.world.has::<Genotype>(entity) {
                gone.push(entity);
                continue;
            }
            let current = ctx.world.get::<Kinetic>(entity).map(|k| (k.x, k.y));
            let in_shield = ctx.world.has::<Shield>(entity)
                || ctx.world.get::<Protection>(entity).map(|p| p.has(Protection::FROM_SPECIES)).unwrap_or(false);
            if let Some(genotype) = ctx.world.get_mut::<Genotype>(entity) {
                genotype.ticks_alive += 1;
                if let Some((cx, cy)) = current {
                    genotype.cum_dist_sq += fixed::dist_sq_raw(tracked.last_position.0, tracked.last_position.1, cx, cy) as i64;
                    genotype.sample_count += 1;
                    tracked.last_position = (cx, cy);
                    tracked.last_cell = (fixed::to_int(cx), fixed::to_int(cy));
                }
                if in_shield {
                    genotype.time_in_shield += 1;
                }
                tracked.last_metrics = *genotype;
            }
        }

        // The entity's species store no longer reports it alive: aggregate
        // its shadowed final metrics into a fitness value and report it back
        // to the optimizer so the generation it belongs to can advance
        // (`spec.md` §4.11 "report complete(species, eval_id, fitness)").
        for entity in gone {
            if let Some(tracked) = self.tracked.remove(&entity) {
                let died_at_cursor = tracked.last_cell == self.cursor_cell;
                let fitness = Self::fitness_of(&tracked.last_metrics, died_at_cursor);
                self.optimizer.complete(tracked.last_metrics.species, tracked.last_metrics.eval_id, fitness);
            }
        }

        Vec::new()
    }
}

/// Map a gene in `[-1, 1]` to a small Q32.32 offset, scaled down so a whole
/// population's spread stays within a sane tuning range.
fn gene_to_fixed(gene: f64) -> fixed::Fixed {
    (gene * (fixed::SCALE as f64) * 0.25) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_below_population_size_is_in_order() {
        let mut opt = GeneticOptimizer::new(42);
        let (_, id0) = opt.sample(SpeciesKind::Drain);
        let (_, id1) = opt.sample(SpeciesKind::Drain);
        assert_eq!(id0, 0);
        assert_eq!(id1, 1);
    }

    #[test]
    fn completing_every_population_slot_advances_the_generation() {
        let mut opt = GeneticOptimizer::new(7);
        for _ in 0..POPULATION_SIZE {
            let (_, id) = opt.sample(SpeciesKind::Pylon);
            opt.complete(SpeciesKind::Pylon, id, 1.0);
        }
        let stats = opt.stats(SpeciesKind::Pylon).unwrap();
        assert_eq!(stats.generation, 1);
    }

    #[test]
    fn export_then_import_round_trips_generation_state() {
        let mut opt = GeneticOptimizer::new(9);
        for _ in 0..POPULATION_SIZE {
            let (_, id) = opt.sample(SpeciesKind::Storm);
            opt.complete(SpeciesKind::Storm, id, 3.5);
        }
        let blob = opt.export_blob().unwrap();

        let mut restored = GeneticOptimizer::new(0);
        restored.import_blob(&blob).unwrap();
        assert_eq!(
            restored.stats(SpeciesKind::Storm).unwrap().generation,
            opt.stats(SpeciesKind::Storm).unwrap().generation
        );
    }

    #[test]
    fn corrupt_blob_is_rejected_without_panicking() {
        let mut opt = GeneticOptimizer::new(1);
        assert!(opt.import_blob(b"not a valid bincode blob").is_err());
    }

    #[test]
    fn entity_death_reports_a_fitness_outcome_back_to_the_optimizer() {
        use crate::config::SimConfig;
        use crate::events::EventBus;
        use crate::spatial::SpatialIndex;
        use crate::world::World;

        let mut world = World::new(SimConfig::default());
        let mut events = EventBus::new();
        let mut spatial = SpatialIndex::new(20, 20);

        let entity = world.create();
        spatial.set_position(&mut world, entity, 5, 5);
        world.set(entity, Kinetic::at_cell(5, 5));
        world.set(entity, Navigation::default());

        let mut system = GeneticSystem::new(3);
        events.publish(SimEvent::EnemyCreated { entity, species: SpeciesKind::Drain });
        events.advance_tick();

        {
            let mut ctx = SimContext {
                world: &mut world,
                events: &mut events,
                spatial: &mut spatial,
            };
            system.run(&mut ctx, 50);
        }
        assert!(world.has::<Genotype>(entity));
        assert_eq!(system.tracked.len(), 1);

        // Run a few more ticks to accumulate ticks_alive before the entity dies.
        for _ in 0..3 {
            let mut ctx = SimContext {
                world: &mut world,
                events: &mut events,
                spatial: &mut spatial,
            };
            system.run(&mut ctx, 50);
        }
        assert!(world.get::<Genotype>(entity).unwrap().ticks_alive >= 3);

        world.destroy(entity);
        spatial.forget(entity);
        let stats_before = system.stats(SpeciesKind::Drain).unwrap();

        {
            let mut ctx = SimContext {
                world: &mut world,
                events: &mut events,
                spatial: &mut spatial,
            };
            system.run(&mut ctx, 50);
        }

        assert!(system.tracked.is_empty());
        let stats_after = system.stats(SpeciesKind::Drain).unwrap();
        assert_eq!(stats_after.total_outcomes, stats_before.total_outcomes + 1);
    }
}

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use forage_proto::{CellState, StateTile, TileId};
use forage_sim::{
    artifacts::{ForcingTile, ManagementTile, SiteTile},
    step::step_tile,
    CenturyModel, ManagementPolicy,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};

fn tile_inputs(size: u32) -> (StateTile, ForcingTile, SiteTile, ManagementTile) {
    let mut rng = SmallRng::seed_from_u64(11);
    let len = (size * size) as usize;
    let mut state = StateTile::inactive(TileId::new(0, 0), size, size);
    for (active, cell) in state.mask.iter_mut().zip(state.cells.iter_mut()) {
        *active = true;
        *cell = CellState {
            aboveground_live: rng.gen_range(40.0..120.0),
            standing_dead: 30.0,
            root_biomass: 110.0,
            litter: 25.0,
            soil_organic: 1200.0,
            mineral_n: 3.5,
            soil_water: [2.0, 4.0],
        };
    }
    let forcing = ForcingTile {
        precipitation: (0..len).map(|_| rng.gen_range(0.0..8.0)).collect(),
        min_temperature: vec![12.0; len],
        max_temperature: vec![28.0; len],
    };
    let site = SiteTile {
        clay: vec![0.25; len],
        sand: vec![0.4; len],
    };
    let management = ManagementTile {
        policy_index: vec![0; len],
        policies: vec![ManagementPolicy::Continuous {
            animal_units_per_ha: 0.8,
        }],
    };
    (state, forcing, site, management)
}

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_tile");
    let model = CenturyModel::default();

    for size in [32u32, 64, 128, 256] {
        group.bench_with_input(BenchmarkId::new("tile", size), &size, |b, &size| {
            b.iter_batched(
                || tile_inputs(size),
                |(state, forcing, site, management)| {
                    step_tile(&model, &state, &forcing, &site, &management, None, 7).expect("step")
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(step_benches, bench_step);
criterion_main!(step_benches);

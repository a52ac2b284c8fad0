//! Monthly result rasters.
//!
//! Tiled outputs are streamed: each tile's diagnostics become one block of
//! every layer as soon as the tile is collected, so memory stays at one tile
//! per layer. ASCII grids are written row-major in one piece and are
//! assembled in a [`DiagnosticMosaic`] first.

use std::{collections::BTreeSet, fs, path::PathBuf};

use forage_proto::{Georeference, TileId};

use crate::{
    artifacts::DiagnosticTile,
    error::ForageError,
    metrics::DiagnosticMosaic,
    raster::{self, RasterFormat, RasterLayer},
    raster_tiled::TiledRasterWriter,
    simulation::{CalendarMonth, SimulationRun},
    tiling::{TileLayout, Window},
};

/// Nodata marker of result rasters.
pub const OUTPUT_NODATA: f64 = -9999.0;

/// Names of the monthly result layers, in output order.
pub const OUTPUT_LAYERS: [&str; 4] = ["standing_biomass", "offtake", "production", "diet_sufficiency"];

pub fn results_suffix(suffix: &str) -> String {
    if suffix.is_empty() || suffix.starts_with('_') {
        suffix.to_string()
    } else {
        format!("_{suffix}")
    }
}

fn to_output(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .map(|value| if value.is_finite() { *value } else { OUTPUT_NODATA })
        .collect()
}

enum Sink {
    Tiled {
        writers: Vec<TiledRasterWriter>,
        written: BTreeSet<TileId>,
    },
    Ascii {
        mosaic: DiagnosticMosaic,
        georef: Georeference,
        block: u32,
    },
}

/// The result rasters of one month while they are being written. Dropping it
/// without [`MonthOutputs::finish`] leaves no files behind.
pub struct MonthOutputs {
    layout: TileLayout,
    paths: Vec<PathBuf>,
    sink: Sink,
}

impl MonthOutputs {
    pub fn create(run: &SimulationRun, month: CalendarMonth) -> Result<Self, ForageError> {
        let config = run.config();
        let dir = config.output_dir();
        fs::create_dir_all(&dir).map_err(|source| ForageError::io(&dir, source))?;
        let suffix = results_suffix(&config.results_suffix);
        let format = config.output_format.raster_format();
        let paths: Vec<PathBuf> = OUTPUT_LAYERS
            .iter()
            .map(|name| {
                dir.join(format!(
                    "{name}_{}_{:02}{suffix}.{}",
                    month.year,
                    month.month,
                    format.extension()
                ))
            })
            .collect();
        let layout = run.layout().clone();
        let georef = run.georef().clone();
        let sink = match format {
            RasterFormat::Tiled => Sink::Tiled {
                writers: OUTPUT_LAYERS
                    .iter()
                    .zip(&paths)
                    .map(|(name, path)| {
                        TiledRasterWriter::create(
                            path,
                            *name,
                            georef.clone(),
                            Some(OUTPUT_NODATA),
                            layout.tile_size(),
                        )
                    })
                    .collect::<Result<_, _>>()?,
                written: BTreeSet::new(),
            },
            RasterFormat::Ascii => Sink::Ascii {
                mosaic: DiagnosticMosaic::new(layout.width(), layout.height()),
                georef,
                block: layout.tile_size(),
            },
        };
        Ok(Self { layout, paths, sink })
    }

    /// Adds one completed tile.
    pub fn add(&mut self, window: &Window, tile: &DiagnosticTile) -> Result<(), ForageError> {
        match &mut self.sink {
            Sink::Tiled { writers, written } => {
                for (writer, (_, values)) in writers.iter_mut().zip(tile.layers()) {
                    writer.write_block(tile.tile.col, tile.tile.row, &to_output(values))?;
                }
                written.insert(tile.tile);
            }
            Sink::Ascii { mosaic, .. } => mosaic.blit(window, tile),
        }
        Ok(())
    }

    /// Fills tiles that never completed with nodata and moves every layer
    /// into place.
    pub fn finish(self) -> Result<Vec<PathBuf>, ForageError> {
        let Self { layout, paths, sink } = self;
        match sink {
            Sink::Tiled { mut writers, written } => {
                for tile in layout.tiles().filter(|tile| !written.contains(tile)) {
                    let blank = vec![OUTPUT_NODATA; layout.window(tile).len()];
                    for writer in &mut writers {
                        writer.write_block(tile.col, tile.row, &blank)?;
                    }
                }
                for writer in writers {
                    writer.finish()?;
                }
            }
            Sink::Ascii {
                mut mosaic,
                georef,
                block,
            } => {
                for (name, path) in OUTPUT_LAYERS.iter().zip(&paths) {
                    let values = to_output(&mosaic.take_layer(name));
                    let layer = RasterLayer::new(*name, georef.clone(), Some(OUTPUT_NODATA), values);
                    raster::write(path, &layer, block)?;
                }
            }
        }
        Ok(paths)
    }
}

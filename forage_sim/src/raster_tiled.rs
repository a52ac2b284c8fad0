//! Native tiled raster container.
//!
//! Layout: `b"FRST"`, a little-endian `u64` header offset, the block
//! payloads (little-endian `f64`, row-major within each block) and finally
//! the bincode-encoded [`RasterHeader`]. Each block carries a checksum in the
//! header so a damaged file is reported as a format error instead of feeding
//! garbage into the simulation.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use forage_proto::{content_digest, BlockIndex, Georeference, RasterHeader};
use tempfile::NamedTempFile;

use crate::{
    raster::{RasterError, RasterLayer},
    tiling::{TileLayout, Window},
};

const MAGIC: &[u8; 4] = b"FRST";
const VERSION: u16 = 1;
const PREAMBLE_LEN: u64 = 12;

/// Reads blocks of a tiled container on demand.
#[derive(Debug)]
pub struct TiledReader {
    path: PathBuf,
    header: RasterHeader,
}

impl TiledReader {
    pub fn open(path: &Path) -> Result<Self, RasterError> {
        let file = File::open(path).map_err(|err| RasterError::io(path, err))?;
        let total_len = file
            .metadata()
            .map_err(|err| RasterError::io(path, err))?
            .len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| RasterError::format(path, "file too short for a raster preamble"))?;
        if &magic != MAGIC {
            return Err(RasterError::format(path, "missing FRST magic"));
        }
        let mut offset_bytes = [0u8; 8];
        reader
            .read_exact(&mut offset_bytes)
            .map_err(|_| RasterError::format(path, "file too short for a raster preamble"))?;
        let header_offset = u64::from_le_bytes(offset_bytes);
        if header_offset < PREAMBLE_LEN || header_offset >= total_len {
            return Err(RasterError::format(
                path,
                format!("header offset {header_offset} outside file of {total_len} bytes"),
            ));
        }

        reader
            .seek(SeekFrom::Start(header_offset))
            .map_err(|err| RasterError::io(path, err))?;
        let mut encoded = Vec::with_capacity((total_len - header_offset) as usize);
        reader
            .read_to_end(&mut encoded)
            .map_err(|err| RasterError::io(path, err))?;
        let header: RasterHeader = bincode::deserialize(&encoded)
            .map_err(|err| RasterError::format(path, format!("unreadable header: {err}")))?;

        if header.version != VERSION {
            return Err(RasterError::format(
                path,
                format!("unsupported container version {}", header.version),
            ));
        }
        if header.block_width == 0 || header.block_height == 0 {
            return Err(RasterError::format(path, "zero block size"));
        }
        let expected_blocks = header.blocks_across() as usize * header.blocks_down() as usize;
        if header.blocks.len() != expected_blocks {
            return Err(RasterError::format(
                path,
                format!(
                    "expected {expected_blocks} blocks, header lists {}",
                    header.blocks.len()
                ),
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            header,
        })
    }

    pub fn header(&self) -> &RasterHeader {
        &self.header
    }

    fn layout(&self) -> TileLayout {
        debug_assert_eq!(self.header.block_width, self.header.block_height);
        TileLayout::new(
            self.header.georef.width,
            self.header.georef.height,
            self.header.block_width,
        )
    }

    fn block_window(&self, bx: u32, by: u32) -> Window {
        let x = bx * self.header.block_width;
        let y = by * self.header.block_height;
        Window::new(
            x,
            y,
            self.header.block_width.min(self.header.georef.width - x),
            self.header.block_height.min(self.header.georef.height - y),
        )
    }

    fn read_block(&self, file: &mut File, bx: u32, by: u32) -> Result<Vec<f64>, RasterError> {
        let index = self.header.blocks[by as usize * self.header.blocks_across() as usize + bx as usize];
        let mut payload = vec![0u8; index.len as usize];
        file.seek(SeekFrom::Start(index.offset))
            .map_err(|err| RasterError::io(&self.path, err))?;
        file.read_exact(&mut payload)
            .map_err(|_| RasterError::format(&self.path, format!("block ({bx}, {by}) truncated")))?;
        if content_digest(&payload) != index.checksum {
            return Err(RasterError::format(
                &self.path,
                format!("block ({bx}, {by}) checksum mismatch"),
            ));
        }
        let expected = self.block_window(bx, by).len() * 8;
        if payload.len() != expected {
            return Err(RasterError::format(
                &self.path,
                format!("block ({bx}, {by}) holds {} bytes, expected {expected}", payload.len()),
            ));
        }
        Ok(payload
            .chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                f64::from_le_bytes(bytes)
            })
            .collect())
    }

    /// Reads a window, touching only the blocks that overlap it.
    pub fn read_window(&self, window: &Window) -> Result<Vec<f64>, RasterError> {
        let georef = &self.header.georef;
        if window.right() > georef.width || window.bottom() > georef.height {
            return Err(RasterError::WindowOutOfBounds {
                path: self.path.clone(),
                window: *window,
            });
        }
        let mut file = File::open(&self.path).map_err(|err| RasterError::io(&self.path, err))?;
        let mut out = vec![0.0; window.len()];
        if window.is_empty() {
            return Ok(out);
        }
        let bw = self.header.block_width;
        let bh = self.header.block_height;
        for by in window.y / bh..=(window.bottom() - 1) / bh {
            for bx in window.x / bw..=(window.right() - 1) / bw {
                let block_window = self.block_window(bx, by);
                let Some(overlap) = block_window.intersection(window) else {
                    continue;
                };
                let block = self.read_block(&mut file, bx, by)?;
                for y in overlap.y..overlap.bottom() {
                    let src_row = (y - block_window.y) as usize * block_window.width as usize;
                    let dst_row = (y - window.y) as usize * window.width as usize;
                    for x in overlap.x..overlap.right() {
                        out[dst_row + (x - window.x) as usize] =
                            block[src_row + (x - block_window.x) as usize];
                    }
                }
            }
        }
        Ok(out)
    }

    /// Block layout as a tile layout; only meaningful for square blocks.
    pub fn block_layout(&self) -> TileLayout {
        self.layout()
    }
}

/// Streams blocks into a temporary file that replaces the destination only
/// when [`TiledRasterWriter::finish`] succeeds.
pub struct TiledRasterWriter {
    path: PathBuf,
    id: String,
    georef: Georeference,
    nodata: Option<f64>,
    layout: TileLayout,
    blocks: Vec<Option<BlockIndex>>,
    cursor: u64,
    file: BufWriter<NamedTempFile>,
}

impl TiledRasterWriter {
    pub fn create(
        path: impl AsRef<Path>,
        id: impl Into<String>,
        georef: Georeference,
        nodata: Option<f64>,
        block_size: u32,
    ) -> Result<Self, RasterError> {
        let path = path.as_ref().to_path_buf();
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp = NamedTempFile::new_in(parent).map_err(|err| RasterError::io(&path, err))?;
        let mut file = BufWriter::new(temp);
        file.write_all(MAGIC)
            .and_then(|_| file.write_all(&0u64.to_le_bytes()))
            .map_err(|err| RasterError::io(&path, err))?;
        let layout = TileLayout::new(georef.width, georef.height, block_size);
        Ok(Self {
            path,
            id: id.into(),
            georef,
            nodata,
            blocks: vec![None; layout.tile_count()],
            layout,
            cursor: PREAMBLE_LEN,
            file,
        })
    }

    pub fn layout(&self) -> &TileLayout {
        &self.layout
    }

    /// Writes the block at tile position (`col`, `row`). Blocks may arrive in
    /// any order but each exactly once.
    pub fn write_block(&mut self, col: u32, row: u32, values: &[f64]) -> Result<(), RasterError> {
        let tile = forage_proto::TileId::new(col, row);
        if !self.layout.contains(tile) {
            return Err(RasterError::format(
                &self.path,
                format!("block {tile} outside the raster"),
            ));
        }
        let window = self.layout.window(tile);
        if values.len() != window.len() {
            return Err(RasterError::format(
                &self.path,
                format!("block {tile} expects {} values, got {}", window.len(), values.len()),
            ));
        }
        let slot = row as usize * self.layout.cols() as usize + col as usize;
        if self.blocks[slot].is_some() {
            return Err(RasterError::format(&self.path, format!("block {tile} written twice")));
        }
        let mut payload = Vec::with_capacity(values.len() * 8);
        for value in values {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        self.file
            .write_all(&payload)
            .map_err(|err| RasterError::io(&self.path, err))?;
        self.blocks[slot] = Some(BlockIndex {
            offset: self.cursor,
            len: payload.len() as u32,
            checksum: content_digest(&payload),
        });
        self.cursor += payload.len() as u64;
        Ok(())
    }

    pub fn finish(self) -> Result<PathBuf, RasterError> {
        let Self {
            path,
            id,
            georef,
            nodata,
            layout,
            blocks,
            cursor,
            file,
        } = self;
        let blocks = blocks
            .into_iter()
            .enumerate()
            .map(|(slot, block)| {
                block.ok_or_else(|| {
                    RasterError::format(
                        &path,
                        format!(
                            "block c{}r{} never written",
                            slot as u32 % layout.cols(),
                            slot as u32 / layout.cols()
                        ),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let header = RasterHeader {
            version: VERSION,
            id,
            georef,
            nodata,
            block_width: layout.tile_size(),
            block_height: layout.tile_size(),
            blocks,
        };
        let encoded = bincode::serialize(&header)
            .map_err(|err| RasterError::format(&path, format!("header encoding failed: {err}")))?;
        let mut temp = file
            .into_inner()
            .map_err(|err| RasterError::io(&path, err.into_error()))?;
        temp.write_all(&encoded)
            .and_then(|_| temp.seek(SeekFrom::Start(4)).map(|_| ()))
            .and_then(|_| temp.write_all(&cursor.to_le_bytes()))
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|err| RasterError::io(&path, err))?;
        temp.persist(&path)
            .map_err(|err| RasterError::io(&path, err.error))?;
        Ok(path)
    }
}

/// Writes a whole in-memory layer as a tiled container.
pub fn write_layer(path: &Path, layer: &RasterLayer, block_size: u32) -> Result<(), RasterError> {
    let mut writer = TiledRasterWriter::create(
        path,
        layer.id.clone(),
        layer.georef.clone(),
        layer.nodata,
        block_size,
    )?;
    let layout = *writer.layout();
    for tile in layout.tiles() {
        let window = layout.window(tile);
        let values = layer
            .window_values(&window)
            .ok_or_else(|| RasterError::format(path, "layer smaller than its georeference"))?;
        writer.write_block(tile.col, tile.row, &values)?;
    }
    writer.finish()?;
    Ok(())
}

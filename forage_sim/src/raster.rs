//! Georeferenced raster access.
//!
//! Two on-disk formats are understood: the native tiled container (`.frs`,
//! see [`crate::raster_tiled`]) and ESRI ASCII grids (`.asc`, see
//! [`crate::raster_ascii`]). Every layer taking part in a run is opened
//! through [`open_aligned`] against the run's reference grid so that
//! per-tile computation can assume identical georeferencing.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use forage_proto::{Fingerprint, FingerprintBuilder, Georeference};
use thiserror::Error;

use crate::{
    raster_ascii,
    raster_tiled::{self, TiledReader},
    tiling::Window,
};

/// Transform components must agree within this tolerance.
const TRANSFORM_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("failed to access raster {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed raster {path:?}: {reason}")]
    Format { path: PathBuf, reason: String },
    #[error("raster {path:?} does not match the reference grid: {reason}")]
    GeoreferenceMismatch { path: PathBuf, reason: String },
    #[error("unsupported raster format for {path:?}; expected .frs or .asc")]
    UnsupportedFormat { path: PathBuf },
    #[error("window {window:?} lies outside raster {path:?}")]
    WindowOutOfBounds { path: PathBuf, window: Window },
}

impl RasterError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        RasterError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn format(path: &Path, reason: impl Into<String>) -> Self {
        RasterError::Format {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Tiled,
    Ascii,
}

impl RasterFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "frs" => Some(RasterFormat::Tiled),
            "asc" => Some(RasterFormat::Ascii),
            _ => None,
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            RasterFormat::Tiled => "frs",
            RasterFormat::Ascii => "asc",
        }
    }
}

fn projection(georef: &Georeference) -> Option<&str> {
    georef.projection.as_deref().map(str::trim)
}

/// Checks that `candidate` shares the reference grid exactly.
pub fn check_alignment(reference: &Georeference, candidate: &Georeference) -> Result<(), String> {
    if reference.width != candidate.width || reference.height != candidate.height {
        return Err(format!(
            "size {}x{} differs from reference {}x{}",
            candidate.width, candidate.height, reference.width, reference.height
        ));
    }
    let a = &reference.transform;
    let b = &candidate.transform;
    let pairs = [
        ("origin_x", a.origin_x, b.origin_x),
        ("origin_y", a.origin_y, b.origin_y),
        ("pixel_width", a.pixel_width, b.pixel_width),
        ("pixel_height", a.pixel_height, b.pixel_height),
    ];
    for (name, expected, actual) in pairs {
        if (expected - actual).abs() > TRANSFORM_TOLERANCE * expected.abs().max(1.0) {
            return Err(format!("{name} {actual} differs from reference {expected}"));
        }
    }
    if projection(reference) != projection(candidate) {
        return Err(format!(
            "projection {:?} differs from reference {:?}",
            projection(candidate),
            projection(reference)
        ));
    }
    Ok(())
}

/// An in-memory raster band.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterLayer {
    pub id: String,
    pub georef: Georeference,
    pub nodata: Option<f64>,
    values: Arc<Vec<f64>>,
}

impl RasterLayer {
    /// # Panics
    /// When `values` does not hold exactly `width * height` entries.
    pub fn new(
        id: impl Into<String>,
        georef: Georeference,
        nodata: Option<f64>,
        values: Vec<f64>,
    ) -> Self {
        assert_eq!(
            values.len(),
            (georef.width as usize) * (georef.height as usize),
            "raster values must cover the grid"
        );
        Self {
            id: id.into(),
            georef,
            nodata,
            values: Arc::new(values),
        }
    }

    pub fn filled(id: impl Into<String>, georef: Georeference, nodata: Option<f64>, value: f64) -> Self {
        let len = (georef.width as usize) * (georef.height as usize);
        Self::new(id, georef, nodata, vec![value; len])
    }

    pub fn width(&self) -> u32 {
        self.georef.width
    }

    pub fn height(&self) -> u32 {
        self.georef.height
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[inline]
    pub fn value(&self, x: u32, y: u32) -> f64 {
        debug_assert!(x < self.width() && y < self.height());
        self.values[y as usize * self.width() as usize + x as usize]
    }

    /// Value at a pixel, `None` when it is nodata.
    pub fn sample(&self, x: u32, y: u32) -> Option<f64> {
        let value = self.value(x, y);
        (!is_nodata(value, self.nodata)).then_some(value)
    }

    pub fn set(&mut self, x: u32, y: u32, value: f64) {
        let idx = y as usize * self.width() as usize + x as usize;
        Arc::make_mut(&mut self.values)[idx] = value;
    }

    pub fn window_values(&self, window: &Window) -> Option<Vec<f64>> {
        if window.right() > self.width() || window.bottom() > self.height() {
            return None;
        }
        let mut out = Vec::with_capacity(window.len());
        for y in window.y..window.bottom() {
            let start = y as usize * self.width() as usize + window.x as usize;
            out.extend_from_slice(&self.values[start..start + window.width as usize]);
        }
        Some(out)
    }
}

/// `true` when `value` should be treated as missing.
pub fn is_nodata(value: f64, nodata: Option<f64>) -> bool {
    if value.is_nan() {
        return true;
    }
    match nodata {
        Some(marker) => (value - marker).abs() <= f64::EPSILON * marker.abs().max(1.0),
        None => false,
    }
}

enum Backing {
    Tiled(TiledReader),
    Memory(RasterLayer),
}

/// An opened raster. Tiled files are read lazily block by block; ASCII
/// grids are held in memory.
pub struct RasterSource {
    path: PathBuf,
    format: RasterFormat,
    backing: Backing,
}

impl std::fmt::Debug for RasterSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterSource")
            .field("path", &self.path)
            .field("format", &self.format)
            .finish()
    }
}

impl RasterSource {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> RasterFormat {
        self.format
    }

    pub fn georef(&self) -> &Georeference {
        match &self.backing {
            Backing::Tiled(reader) => &reader.header().georef,
            Backing::Memory(layer) => &layer.georef,
        }
    }

    pub fn nodata(&self) -> Option<f64> {
        match &self.backing {
            Backing::Tiled(reader) => reader.header().nodata,
            Backing::Memory(layer) => layer.nodata,
        }
    }

    pub fn id(&self) -> &str {
        match &self.backing {
            Backing::Tiled(reader) => &reader.header().id,
            Backing::Memory(layer) => &layer.id,
        }
    }

    /// Reads one window in row-major order.
    pub fn read_window(&self, window: &Window) -> Result<Vec<f64>, RasterError> {
        match &self.backing {
            Backing::Tiled(reader) => reader.read_window(window),
            Backing::Memory(layer) => {
                layer
                    .window_values(window)
                    .ok_or_else(|| RasterError::WindowOutOfBounds {
                        path: self.path.clone(),
                        window: *window,
                    })
            }
        }
    }

    pub fn read_layer(&self) -> Result<RasterLayer, RasterError> {
        match &self.backing {
            Backing::Memory(layer) => Ok(layer.clone()),
            Backing::Tiled(reader) => {
                let georef = reader.header().georef.clone();
                let values =
                    reader.read_window(&Window::new(0, 0, georef.width, georef.height))?;
                Ok(RasterLayer::new(
                    reader.header().id.clone(),
                    georef,
                    reader.header().nodata,
                    values,
                ))
            }
        }
    }

    /// Reads a window and fingerprints its content, grid position and nodata
    /// marker.
    pub fn read_window_fingerprinted(
        &self,
        window: &Window,
    ) -> Result<(Vec<f64>, Fingerprint), RasterError> {
        let values = self.read_window(window)?;
        let mut builder = FingerprintBuilder::new("raster_window");
        builder
            .u64("x", window.x as u64)
            .u64("y", window.y as u64)
            .u64("width", window.width as u64)
            .u64("height", window.height as u64)
            .f64s("nodata", self.nodata().as_slice())
            .f64s("values", &values);
        Ok((values, builder.finish()))
    }
}

/// Opens a raster, failing with [`RasterError::Format`] when unreadable.
pub fn open(path: impl AsRef<Path>) -> Result<RasterSource, RasterError> {
    let path = path.as_ref();
    let format = RasterFormat::from_path(path).ok_or_else(|| RasterError::UnsupportedFormat {
        path: path.to_path_buf(),
    })?;
    let backing = match format {
        RasterFormat::Tiled => Backing::Tiled(TiledReader::open(path)?),
        RasterFormat::Ascii => Backing::Memory(raster_ascii::read(path)?),
    };
    tracing::debug!(
        target: "forage::raster",
        path = %path.display(),
        ?format,
        "raster.opened"
    );
    Ok(RasterSource {
        path: path.to_path_buf(),
        format,
        backing,
    })
}

/// Opens a raster and rejects it unless it matches `reference`.
pub fn open_aligned(
    path: impl AsRef<Path>,
    reference: &Georeference,
) -> Result<RasterSource, RasterError> {
    let source = open(path)?;
    check_alignment(reference, source.georef()).map_err(|reason| {
        RasterError::GeoreferenceMismatch {
            path: source.path.clone(),
            reason,
        }
    })?;
    Ok(source)
}

/// Writes a layer atomically in the format implied by the extension.
pub fn write(path: impl AsRef<Path>, layer: &RasterLayer, block_size: u32) -> Result<(), RasterError> {
    let path = path.as_ref();
    match RasterFormat::from_path(path) {
        Some(RasterFormat::Tiled) => raster_tiled::write_layer(path, layer, block_size),
        Some(RasterFormat::Ascii) => raster_ascii::write(path, layer),
        None => Err(RasterError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use forage_proto::{GeoTransform, Georeference};

    pub fn georef(width: u32, height: u32) -> Georeference {
        Georeference {
            width,
            height,
            transform: GeoTransform {
                origin_x: 500_000.0,
                origin_y: 4_200_000.0,
                pixel_width: 30.0,
                pixel_height: -30.0,
            },
            projection: Some("EPSG:32614".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::georef;
    use super::*;

    #[test]
    fn alignment_rejects_shifted_origin() {
        let reference = georef(4, 4);
        let mut shifted = reference.clone();
        shifted.transform.origin_x += 30.0;
        let err = check_alignment(&reference, &shifted).expect_err("shift must be rejected");
        assert!(err.contains("origin_x"), "{err}");
    }

    #[test]
    fn alignment_rejects_projection_change() {
        let reference = georef(4, 4);
        let mut other = reference.clone();
        other.projection = Some("EPSG:4326".to_string());
        assert!(check_alignment(&reference, &other).is_err());
        other.projection = Some(" EPSG:32614 \n".to_string());
        assert!(check_alignment(&reference, &other).is_ok());

        let mut bare = reference.clone();
        bare.projection = None;
        assert!(check_alignment(&bare, &bare.clone()).is_ok());
        assert!(check_alignment(&reference, &bare).is_err());
    }

    #[test]
    fn nodata_detection() {
        assert!(is_nodata(-9999.0, Some(-9999.0)));
        assert!(is_nodata(f64::NAN, None));
        assert!(!is_nodata(0.0, Some(-9999.0)));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = open("inputs/clay.tif").expect_err("tif is not supported");
        assert!(matches!(err, RasterError::UnsupportedFormat { .. }));
    }

    #[test]
    fn mismatched_layer_is_rejected_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clay.asc");
        write(&path, &RasterLayer::filled("clay", georef(3, 3), None, 0.2), 2).expect("write");
        let err = open_aligned(&path, &georef(4, 4)).expect_err("size mismatch");
        assert!(matches!(err, RasterError::GeoreferenceMismatch { .. }));
    }

    #[test]
    fn window_fingerprint_tracks_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("precip.asc");
        let mut layer = RasterLayer::filled("precip", georef(4, 4), Some(-9999.0), 3.0);
        write(&path, &layer, 2).expect("write");
        let window = Window::new(0, 0, 2, 2);
        let (_, first) = open(&path)
            .and_then(|source| source.read_window_fingerprinted(&window))
            .expect("read");

        layer.set(3, 3, 4.0);
        write(&path, &layer, 2).expect("rewrite");
        let source = open(&path).expect("reopen");
        let (_, untouched) = source.read_window_fingerprinted(&window).expect("read");
        let (_, changed) = source
            .read_window_fingerprinted(&Window::new(2, 2, 2, 2))
            .expect("read");
        assert_eq!(first, untouched);
        assert_ne!(untouched, changed);
    }
}

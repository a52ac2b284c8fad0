//! ESRI ASCII grids with an optional `.prj` sidecar carrying the projection.

use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use forage_proto::{GeoTransform, Georeference};
use tempfile::NamedTempFile;

use crate::raster::{RasterError, RasterLayer};

fn sidecar(path: &Path) -> PathBuf {
    path.with_extension("prj")
}

#[derive(Default)]
struct Header {
    ncols: Option<u32>,
    nrows: Option<u32>,
    xll: Option<(f64, bool)>,
    yll: Option<(f64, bool)>,
    cellsize: Option<f64>,
    nodata: Option<f64>,
}

pub fn read(path: &Path) -> Result<RasterLayer, RasterError> {
    let text = fs::read_to_string(path).map_err(|err| RasterError::io(path, err))?;
    let mut header = Header::default();
    let mut tokens = text.split_whitespace().peekable();

    while let Some(key) = tokens.peek().copied() {
        if key.parse::<f64>().is_ok() {
            break;
        }
        tokens.next();
        let raw = tokens
            .next()
            .ok_or_else(|| RasterError::format(path, format!("header key {key} has no value")))?;
        let number = |raw: &str| {
            raw.parse::<f64>()
                .map_err(|_| RasterError::format(path, format!("{key} value {raw:?} is not a number")))
        };
        match key.to_ascii_lowercase().as_str() {
            "ncols" => header.ncols = Some(parse_dim(path, key, raw)?),
            "nrows" => header.nrows = Some(parse_dim(path, key, raw)?),
            "xllcorner" => header.xll = Some((number(raw)?, false)),
            "xllcenter" => header.xll = Some((number(raw)?, true)),
            "yllcorner" => header.yll = Some((number(raw)?, false)),
            "yllcenter" => header.yll = Some((number(raw)?, true)),
            "cellsize" => header.cellsize = Some(number(raw)?),
            "nodata_value" => header.nodata = Some(number(raw)?),
            other => {
                return Err(RasterError::format(path, format!("unknown header key {other}")));
            }
        }
    }

    let missing = |name: &str| RasterError::format(path, format!("header is missing {name}"));
    let width = header.ncols.ok_or_else(|| missing("ncols"))?;
    let height = header.nrows.ok_or_else(|| missing("nrows"))?;
    let cellsize = header.cellsize.ok_or_else(|| missing("cellsize"))?;
    let (xll, x_centered) = header.xll.ok_or_else(|| missing("xllcorner"))?;
    let (yll, y_centered) = header.yll.ok_or_else(|| missing("yllcorner"))?;
    if !(cellsize.is_finite() && cellsize > 0.0) {
        return Err(RasterError::format(path, format!("cellsize {cellsize} must be positive")));
    }
    let origin_x = if x_centered { xll - cellsize / 2.0 } else { xll };
    let lower = if y_centered { yll - cellsize / 2.0 } else { yll };

    let values = tokens
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| RasterError::format(path, format!("cell value {token:?} is not a number")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let expected = width as usize * height as usize;
    if values.len() != expected {
        return Err(RasterError::format(
            path,
            format!("expected {expected} cell values, found {}", values.len()),
        ));
    }

    let projection = match fs::read_to_string(sidecar(path)) {
        Ok(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(RasterError::io(&sidecar(path), err)),
    };

    let georef = Georeference {
        width,
        height,
        transform: GeoTransform {
            origin_x,
            origin_y: lower + cellsize * height as f64,
            pixel_width: cellsize,
            pixel_height: -cellsize,
        },
        projection,
    };
    let id = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .to_string();
    Ok(RasterLayer::new(id, georef, header.nodata, values))
}

fn parse_dim(path: &Path, key: &str, raw: &str) -> Result<u32, RasterError> {
    match raw.parse::<u32>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(RasterError::format(
            path,
            format!("{key} value {raw:?} is not a positive integer"),
        )),
    }
}

/// Writes the grid and, when the layer has a projection, its `.prj` sidecar.
/// Both are renamed into place, sidecar first.
pub fn write(path: &Path, layer: &RasterLayer) -> Result<(), RasterError> {
    let transform = &layer.georef.transform;
    if (transform.pixel_width + transform.pixel_height).abs() > 1e-9 * transform.pixel_width.abs()
    {
        return Err(RasterError::format(
            path,
            "ASCII grids require square, north-up pixels",
        ));
    }
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp = NamedTempFile::new_in(parent).map_err(|err| RasterError::io(path, err))?;
    let mut out = BufWriter::new(temp);
    let lower = transform.origin_y + transform.pixel_height * layer.height() as f64;

    let write_all = |out: &mut BufWriter<NamedTempFile>| -> std::io::Result<()> {
        writeln!(out, "ncols {}", layer.width())?;
        writeln!(out, "nrows {}", layer.height())?;
        writeln!(out, "xllcorner {}", transform.origin_x)?;
        writeln!(out, "yllcorner {lower}")?;
        writeln!(out, "cellsize {}", transform.pixel_width)?;
        if let Some(nodata) = layer.nodata {
            writeln!(out, "NODATA_value {nodata}")?;
        }
        for row in layer.values().chunks(layer.width() as usize) {
            let line = row
                .iter()
                .map(|value| value.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(out, "{line}")?;
        }
        out.flush()
    };
    write_all(&mut out).map_err(|err| RasterError::io(path, err))?;
    let temp = out
        .into_inner()
        .map_err(|err| RasterError::io(path, err.into_error()))?;

    let prj = sidecar(path);
    match &layer.georef.projection {
        Some(projection) => {
            let mut prj_temp = NamedTempFile::new_in(parent).map_err(|err| RasterError::io(&prj, err))?;
            prj_temp
                .write_all(projection.as_bytes())
                .and_then(|_| prj_temp.flush())
                .map_err(|err| RasterError::io(&prj, err))?;
            prj_temp
                .persist(&prj)
                .map_err(|err| RasterError::io(&prj, err.error))?;
        }
        None if prj.exists() => fs::remove_file(&prj).map_err(|err| RasterError::io(&prj, err))?,
        None => {}
    }
    temp.persist(path)
        .map_err(|err| RasterError::io(path, err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::test_support::georef;

    #[test]
    fn reads_center_registered_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sand.asc");
        fs::write(
            &path,
            "ncols 2\nnrows 2\nxllcenter 15\nyllcenter 15\ncellsize 30\nNODATA_value -9999\n0.1 0.2\n-9999 0.4\n",
        )
        .expect("write");
        let layer = read(&path).expect("read");
        assert_eq!(layer.id, "sand");
        assert_eq!(layer.georef.transform.origin_x, 0.0);
        assert_eq!(layer.georef.transform.origin_y, 60.0);
        assert_eq!(layer.georef.projection, None);
        assert_eq!(layer.sample(0, 1), None);
        assert_eq!(layer.sample(1, 1), Some(0.4));
    }

    #[test]
    fn written_grid_reads_back_with_projection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clay.asc");
        let mut layer = RasterLayer::filled("clay", georef(3, 2), Some(-1.0), 0.25);
        layer.set(2, 1, 0.125);
        write(&path, &layer).expect("write");
        assert_eq!(read(&path).expect("read"), layer);
    }

    #[test]
    fn rewriting_replaces_or_drops_the_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clay.asc");
        let mut layer = RasterLayer::filled("clay", georef(2, 2), None, 0.25);
        write(&path, &layer).expect("write");
        layer.georef.projection = Some("EPSG:4326".to_string());
        write(&path, &layer).expect("rewrite");
        assert_eq!(fs::read_to_string(sidecar(&path)).expect("prj"), "EPSG:4326");

        let mut names: Vec<_> = fs::read_dir(dir.path())
            .expect("list")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["clay.asc", "clay.prj"]);

        layer.georef.projection = None;
        write(&path, &layer).expect("rewrite");
        assert!(!sidecar(&path).exists());
        assert_eq!(read(&path).expect("read").georef.projection, None);
    }

    #[test]
    fn short_value_list_is_a_format_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.asc");
        fs::write(
            &path,
            "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n",
        )
        .expect("write");
        assert!(matches!(read(&path), Err(RasterError::Format { .. })));
    }
}

//! Persisted calibration artefacts.
//!
//! Every artefact is a plain text file of whitespace-separated decimal
//! numbers, one value per line, so they can be inspected and loaded
//! into any analysis tool. A `-meta` sidecar pins the geometry the
//! influence data was measured with; artefacts that do not match the
//! live geometry are ignored on load. Writes go through a temp file
//! and rename so a failed calibration never leaves a torn artefact.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, warn};

use ao_recon::SvdTriple;
use ao_shwfs::{Coord, Dims, ShGeometry};

use crate::{Error, Result};

/// Canonical artefact file locations for one sensor.
#[derive(Debug, Clone)]
pub struct ArtefactPaths {
    prefix: PathBuf,
}

impl ArtefactPaths {
    /// `prefix` is the per-sensor file prefix, e.g. `data/mmsh`.
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .prefix
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        name.push_str(suffix);
        match self.prefix.parent() {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn dark(&self) -> PathBuf {
        self.with_suffix("_dark")
    }
    pub fn flat(&self) -> PathBuf {
        self.with_suffix("_flat")
    }
    pub fn sky(&self) -> PathBuf {
        self.with_suffix("_sky")
    }
    pub fn pinhole(&self) -> PathBuf {
        self.with_suffix("_pinhole")
    }
    pub fn influence(&self) -> PathBuf {
        self.with_suffix("_influence")
    }
    pub fn influence_meta(&self) -> PathBuf {
        self.with_suffix("_influence-meta")
    }
    pub fn wfs_modes(&self) -> PathBuf {
        self.with_suffix("_influence-wfsmodes")
    }
    pub fn dm_modes(&self) -> PathBuf {
        self.with_suffix("_influence-dmmodes")
    }
    pub fn singular(&self) -> PathBuf {
        self.with_suffix("_influence-singular")
    }
    pub fn subc(&self) -> PathBuf {
        self.with_suffix("_subc")
    }
    pub fn gridc(&self) -> PathBuf {
        self.with_suffix("_gridc")
    }
}

/// The live geometry artefacts must match to be considered valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreGeometry {
    pub width: u32,
    pub height: u32,
    pub nact: usize,
    pub nsubap: usize,
}

// ---------------------------
// text format helpers

fn write_values<I>(path: &Path, values: I, precision: usize) -> Result<()>
where
    I: Iterator<Item = f64>,
{
    let mut text = String::new();
    for v in values {
        writeln!(text, "{:.*}", precision, v).expect("formatting into String cannot fail");
    }
    let tmp = path.with_extension("tmp");
    (|| -> std::io::Result<()> {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(text.as_bytes())?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
    })()
    .map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::io(path, e)
    })
}

fn read_values(path: &Path, expect: usize) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut out = Vec::with_capacity(expect);
    for tok in text.split_whitespace() {
        let v: f64 = tok.parse().map_err(|_| Error::Parse {
            path: path.display().to_string(),
            reason: format!("bad float '{}'", tok),
        })?;
        out.push(v);
    }
    if out.len() != expect {
        return Err(Error::Parse {
            path: path.display().to_string(),
            reason: format!("expected {} values, found {}", expect, out.len()),
        });
    }
    Ok(out)
}

fn write_matrix_f32(path: &Path, m: &DMatrix<f32>, precision: usize) -> Result<()> {
    write_values(
        path,
        m.row_iter()
            .flat_map(|r| r.iter().map(|v| *v as f64).collect::<Vec<_>>()),
        precision,
    )
}

fn read_matrix_f32(path: &Path, rows: usize, cols: usize) -> Result<DMatrix<f32>> {
    let v = read_values(path, rows * cols)?;
    Ok(DMatrix::from_fn(rows, cols, |r, c| v[r * cols + c] as f32))
}

fn write_matrix_f64(path: &Path, m: &DMatrix<f64>, precision: usize) -> Result<()> {
    write_values(
        path,
        m.row_iter()
            .flat_map(|r| r.iter().copied().collect::<Vec<_>>()),
        precision,
    )
}

fn read_matrix_f64(path: &Path, rows: usize, cols: usize) -> Result<DMatrix<f64>> {
    let v = read_values(path, rows * cols)?;
    Ok(DMatrix::from_fn(rows, cols, |r, c| v[r * cols + c]))
}

fn write_coords(path: &Path, coords: &[Coord]) -> Result<()> {
    write_values(
        path,
        coords.iter().flat_map(|c| [c.x as f64, c.y as f64]),
        0,
    )
}

fn read_coords(path: &Path, n: usize) -> Result<Vec<Coord>> {
    let v = read_values(path, 2 * n)?;
    Ok((0..n)
        .map(|i| Coord::new(v[2 * i] as i32, v[2 * i + 1] as i32))
        .collect())
}

// ---------------------------
// store

/// In-memory view of the persisted calibration artefacts.
pub struct CalibrationStore {
    paths: ArtefactPaths,
    pub dark: Option<DMatrix<f32>>,
    pub flat: Option<DMatrix<f32>>,
    pub sky: Option<DMatrix<f32>>,
    /// Pinhole reference displacements, length 2*nsubap.
    pub refc: Option<DVector<f32>>,
    /// Measured influence matrix, 2*nsubap x Nact.
    pub influence: Option<DMatrix<f64>>,
    pub svd: Option<SvdTriple>,
    /// Persisted subaperture geometry.
    pub geometry: Option<ShGeometry>,
}

impl CalibrationStore {
    pub fn new(paths: ArtefactPaths) -> Self {
        Self {
            paths,
            dark: None,
            flat: None,
            sky: None,
            refc: None,
            influence: None,
            svd: None,
            geometry: None,
        }
    }

    pub fn paths(&self) -> &ArtefactPaths {
        &self.paths
    }

    /// True once reconstruction can run: SVD and pinhole reference
    /// both present.
    pub fn reconstruction_ready(&self) -> bool {
        self.svd.is_some() && self.refc.is_some()
    }

    /// Load whatever artefacts exist on disk. Missing files are fine;
    /// influence data with a mismatched meta sidecar is ignored with a
    /// warning.
    ///
    /// `sensor`/`shsize`/`track` describe the live sensor so the
    /// persisted geometry can be rebuilt; `geom.nsubap == 0` skips the
    /// geometry-dependent artefacts when no selection exists yet.
    pub fn load(&mut self, geom: StoreGeometry, shsize: Dims, track: Dims) -> Result<()> {
        let h = geom.height as usize;
        let w = geom.width as usize;

        for (path, slot, what) in [
            (self.paths.dark(), &mut self.dark, "dark"),
            (self.paths.flat(), &mut self.flat, "flat"),
            (self.paths.sky(), &mut self.sky, "sky"),
        ] {
            if path.exists() {
                *slot = Some(read_matrix_f32(&path, h, w)?);
                info!("loaded {} field from {}", what, path.display());
            } else {
                debug!("no {} field at {}", what, path.display());
            }
        }

        if self.paths.subc().exists() && self.paths.gridc().exists() {
            // the coordinate files carry their own length
            let text =
                std::fs::read_to_string(self.paths.subc()).map_err(|e| Error::io(&self.paths.subc(), e))?;
            let n = text.split_whitespace().count() / 2;
            let subc = read_coords(&self.paths.subc(), n)?;
            let gridc = read_coords(&self.paths.gridc(), n)?;
            info!("loaded {} persisted subapertures", n);
            self.geometry = Some(ShGeometry {
                sensor: Dims::new(geom.width, geom.height),
                shsize,
                track,
                subc,
                gridc,
            });
        }

        let nsubap = self
            .geometry
            .as_ref()
            .map(|g| g.nsubap())
            .unwrap_or(geom.nsubap);
        if nsubap == 0 {
            return Ok(());
        }

        if self.paths.pinhole().exists() {
            let v = read_values(&self.paths.pinhole(), 2 * nsubap)?;
            self.refc = Some(DVector::from_iterator(
                2 * nsubap,
                v.into_iter().map(|x| x as f32),
            ));
            info!("loaded pinhole reference from {}", self.paths.pinhole().display());
        }

        if self.paths.influence_meta().exists() {
            match self.load_influence(geom.nact, nsubap) {
                Ok(()) => info!("loaded influence matrix and SVD"),
                Err(e) => warn!("stored influence data unusable: {}", e),
            }
        }
        Ok(())
    }

    fn load_influence(&mut self, nact: usize, nsubap: usize) -> Result<()> {
        let meta = read_values(&self.paths.influence_meta(), 3)?;
        let stored_nact = meta[0] as usize;
        let stored_nsubap = meta[1] as usize;
        if stored_nact != nact || stored_nsubap != nsubap {
            return Err(Error::GeometryMismatch {
                stored_nact,
                stored_nsubap,
                nact,
                nsubap,
            });
        }

        self.influence = Some(read_matrix_f64(&self.paths.influence(), 2 * nsubap, nact)?);
        let u = read_matrix_f64(&self.paths.wfs_modes(), 2 * nsubap, nact)?;
        let v_t = read_matrix_f64(&self.paths.dm_modes(), nact, nact)?;
        let singular = DVector::from_vec(read_values(&self.paths.singular(), nact)?);
        self.svd = Some(SvdTriple { u, singular, v_t });
        Ok(())
    }

    pub fn save_dark(&mut self, dark: DMatrix<f32>) -> Result<()> {
        write_matrix_f32(&self.paths.dark(), &dark, 10)?;
        info!("dark field stored to {}", self.paths.dark().display());
        self.dark = Some(dark);
        Ok(())
    }

    pub fn save_flat(&mut self, flat: DMatrix<f32>) -> Result<()> {
        write_matrix_f32(&self.paths.flat(), &flat, 10)?;
        info!("flat field stored to {}", self.paths.flat().display());
        self.flat = Some(flat);
        Ok(())
    }

    pub fn save_sky(&mut self, sky: DMatrix<f32>) -> Result<()> {
        write_matrix_f32(&self.paths.sky(), &sky, 10)?;
        info!("sky field stored to {}", self.paths.sky().display());
        self.sky = Some(sky);
        Ok(())
    }

    pub fn save_pinhole(&mut self, refc: DVector<f32>) -> Result<()> {
        write_values(
            &self.paths.pinhole(),
            refc.iter().map(|v| *v as f64),
            10,
        )?;
        info!("pinhole reference stored to {}", self.paths.pinhole().display());
        self.refc = Some(refc);
        Ok(())
    }

    pub fn save_geometry(&mut self, geom: ShGeometry) -> Result<()> {
        write_coords(&self.paths.subc(), &geom.subc)?;
        write_coords(&self.paths.gridc(), &geom.gridc)?;
        info!("subaperture geometry stored ({} windows)", geom.nsubap());
        self.geometry = Some(geom);
        Ok(())
    }

    /// Persist a freshly measured influence matrix with its
    /// decomposition and the meta sidecar. All six files are written
    /// or the error leaves the previous artefacts in place.
    pub fn save_influence(
        &mut self,
        influence: DMatrix<f64>,
        svd: SvdTriple,
        nsubap: usize,
    ) -> Result<()> {
        let nact = svd.nact();
        write_matrix_f64(&self.paths.influence(), &influence, 10)?;
        write_matrix_f64(&self.paths.wfs_modes(), &svd.u, 15)?;
        write_matrix_f64(&self.paths.dm_modes(), &svd.v_t, 15)?;
        write_values(&self.paths.singular(), svd.singular.iter().copied(), 15)?;
        write_values(
            &self.paths.influence_meta(),
            [nact as f64, nsubap as f64, 2.0 * nsubap as f64].into_iter(),
            0,
        )?;
        info!(
            "influence matrix ({}x{}) and SVD stored under prefix {}",
            2 * nsubap,
            nact,
            self.paths.prefix().display()
        );
        self.influence = Some(influence);
        self.svd = Some(svd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};

    fn store_in(dir: &tempfile::TempDir) -> CalibrationStore {
        CalibrationStore::new(ArtefactPaths::new(dir.path().join("sh")))
    }

    fn geom() -> StoreGeometry {
        StoreGeometry {
            width: 32,
            height: 32,
            nact: 2,
            nsubap: 4,
        }
    }

    #[test]
    fn artefact_paths_follow_prefix() {
        let p = ArtefactPaths::new("/data/mmsh");
        assert_eq!(p.dark(), PathBuf::from("/data/mmsh_dark"));
        assert_eq!(p.influence_meta(), PathBuf::from("/data/mmsh_influence-meta"));
        assert_eq!(p.wfs_modes(), PathBuf::from("/data/mmsh_influence-wfsmodes"));
    }

    #[test]
    fn dark_round_trip_exact() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let dark = DMatrix::from_fn(32, 32, |_, _| rng.random_range(0.0f32..50.0));

        let mut s = store_in(&dir);
        s.save_dark(dark.clone()).unwrap();

        let mut s2 = store_in(&dir);
        s2.load(geom(), Dims::new(8, 8), Dims::new(4, 4)).unwrap();
        let loaded = s2.dark.unwrap();
        for (a, b) in dark.iter().zip(loaded.iter()) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn missing_artefacts_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store_in(&dir);
        s.load(geom(), Dims::new(8, 8), Dims::new(4, 4)).unwrap();
        assert!(s.dark.is_none());
        assert!(!s.reconstruction_ready());
    }

    #[test]
    fn svd_round_trip_reconstructs() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(8);
        let m = DMatrix::from_fn(8, 2, |_, _| rng.random_range(-1.0..1.0));
        let svd = SvdTriple::decompose(&m).unwrap();

        let mut s = store_in(&dir);
        s.save_influence(m.clone(), svd, 4).unwrap();

        let mut s2 = store_in(&dir);
        s2.load(geom(), Dims::new(8, 8), Dims::new(4, 4)).unwrap();
        let svd2 = s2.svd.unwrap();

        // a random vector must map the same through stored and live
        let x = DVector::from_fn(2, |_, _| rng.random_range(-1.0..1.0));
        let direct = &m * &x;
        let via_stored = svd2.reconstruct() * &x;
        for (a, b) in direct.iter().zip(via_stored.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn meta_mismatch_ignores_influence() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(9);
        let m = DMatrix::from_fn(8, 2, |_, _| rng.random_range(-1.0..1.0));
        let svd = SvdTriple::decompose(&m).unwrap();
        let mut s = store_in(&dir);
        s.save_influence(m, svd, 4).unwrap();

        // a system with a different actuator count must not pick it up
        let mut other = store_in(&dir);
        let mut g = geom();
        g.nact = 3;
        other.load(g, Dims::new(8, 8), Dims::new(4, 4)).unwrap();
        assert!(other.svd.is_none());
        assert!(other.influence.is_none());
    }

    #[test]
    fn sky_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sky = DMatrix::from_element(32, 32, 7.25);
        let mut s = store_in(&dir);
        s.save_sky(sky.clone()).unwrap();

        let mut s2 = store_in(&dir);
        s2.load(geom(), Dims::new(8, 8), Dims::new(4, 4)).unwrap();
        assert_eq!(s2.sky.unwrap(), sky);
    }

    #[test]
    fn pinhole_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let refc = DVector::from_vec(vec![0.25f32, -0.5, 1.0, 0.0, 0.125, 2.5, -1.0, 0.75]);
        let mut s = store_in(&dir);
        s.save_pinhole(refc.clone()).unwrap();

        let mut s2 = store_in(&dir);
        s2.load(geom(), Dims::new(8, 8), Dims::new(4, 4)).unwrap();
        let loaded = s2.refc.unwrap();
        assert_relative_eq!(refc, loaded, epsilon = 1e-9);
    }

    #[test]
    fn geometry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let g = ShGeometry {
            sensor: Dims::new(32, 32),
            shsize: Dims::new(8, 8),
            track: Dims::new(4, 4),
            subc: vec![Coord::new(2, 2), Coord::new(10, 3)],
            gridc: vec![Coord::new(0, 0), Coord::new(8, 0)],
        };
        let mut s = store_in(&dir);
        s.save_geometry(g.clone()).unwrap();

        let mut s2 = store_in(&dir);
        s2.load(geom(), Dims::new(8, 8), Dims::new(4, 4)).unwrap();
        assert_eq!(s2.geometry.unwrap(), g);
    }

    #[test]
    fn no_tmp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store_in(&dir);
        s.save_dark(DMatrix::from_element(32, 32, 1.0)).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }
}

//! Reading and writing stacks and volumes.
//!
//! A volume `<name>` is stored as `<name>.npy` (3D array, `(nz, ny, nx)`,
//! f32 or f64) next to a `<name>.json` geometry sidecar:
//!
//! ```json
//! {"origin": [0, 0, 0], "direction": [1, 0, 0, 0, 1, 0, 0, 0, 1], "spacing": [1, 1, 3]}
//! ```
//!
//! `direction` is row-major. Masks are optional `<name><suffix>.npy` arrays
//! (bool, or any numeric type thresholded at 0.5).

use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;
use ndarray_npy::{read_npy, write_npy, ReadNpyError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ReconError, Result};
use crate::geometry::Geometry;
use crate::stack::Stack;
use crate::stack_manager::StackManager;
use crate::volume::Volume;

/// Geometry part of a sidecar file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometrySidecar {
    pub origin: [f64; 3],
    /// Row-major direction matrix.
    pub direction: [f64; 9],
    pub spacing: [f64; 3],
}

impl GeometrySidecar {
    pub fn from_geometry(geometry: &Geometry) -> Self {
        let d = geometry.direction();
        let mut direction = [0.0; 9];
        for r in 0..3 {
            for c in 0..3 {
                direction[3 * r + c] = d[(r, c)];
            }
        }
        Self {
            origin: [geometry.origin().x, geometry.origin().y, geometry.origin().z],
            direction,
            spacing: [geometry.spacing().x, geometry.spacing().y, geometry.spacing().z],
        }
    }

    pub fn to_geometry(&self, shape: (usize, usize, usize)) -> Result<Geometry> {
        Geometry::new(
            shape,
            Vector3::from(self.origin),
            Matrix3::from_row_slice(&self.direction),
            Vector3::from(self.spacing),
        )
    }
}

fn npy_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.npy"))
}

fn json_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.json"))
}

/// Read a 3D npy array stored as f64 or f32.
pub fn read_array3(path: &Path) -> Result<Array3<f64>> {
    match read_npy::<_, Array3<f64>>(path) {
        Ok(data) => Ok(data),
        Err(ReadNpyError::WrongDescriptor(_)) => {
            let data: Array3<f32> = read_npy(path)?;
            Ok(data.mapv(f64::from))
        }
        Err(err) => Err(err.into()),
    }
}

/// Read a 3D mask stored as bool or as numbers (thresholded at 0.5).
pub fn read_mask(path: &Path) -> Result<Array3<bool>> {
    match read_npy::<_, Array3<bool>>(path) {
        Ok(mask) => Ok(mask),
        Err(ReadNpyError::WrongDescriptor(_)) => {
            let values: Array3<u8> = match read_npy(path) {
                Ok(values) => values,
                Err(ReadNpyError::WrongDescriptor(_)) => {
                    return Ok(read_array3(path)?.mapv(|v| v > 0.5));
                }
                Err(err) => return Err(err.into()),
            };
            Ok(values.mapv(|v| v > 0))
        }
        Err(err) => Err(err.into()),
    }
}

fn read_sidecar<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Read the stack `<dir>/<name>.npy` with its sidecar and optional mask.
pub fn read_stack(dir: &Path, name: &str, suffix_mask: &str) -> Result<Stack> {
    let data = read_array3(&npy_path(dir, name))?;
    let sidecar: GeometrySidecar = read_sidecar(&json_path(dir, name))?;
    let geometry = sidecar.to_geometry(data.dim())?;
    let mask_path = npy_path(dir, &format!("{name}{suffix_mask}"));
    let mask = if !suffix_mask.is_empty() && mask_path.exists() {
        Some(read_mask(&mask_path)?)
    } else {
        None
    };
    debug!(stack = name, shape = ?data.dim(), masked = mask.is_some(), "read stack");
    Stack::from_volume(name, data, mask, geometry)
}

/// Load every stack of `dir`, in alphabetical order. Files whose stem ends
/// with `suffix_mask` are masks, not stacks.
pub fn load_directory(dir: &Path, suffix_mask: &str) -> Result<StackManager> {
    if !dir.is_dir() {
        return Err(ReconError::EmptyInput(format!(
            "input directory {} does not exist",
            dir.display()
        )));
    }
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "npy"))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|stem| suffix_mask.is_empty() || !stem.ends_with(suffix_mask))
        .collect();
    names.sort();

    if names.is_empty() {
        return Err(ReconError::EmptyInput(format!(
            "no stacks found in {}",
            dir.display()
        )));
    }

    let stacks = names
        .iter()
        .map(|name| read_stack(dir, name, suffix_mask))
        .collect::<Result<Vec<_>>>()?;
    info!(stacks = stacks.len(), dir = %dir.display(), "loaded stacks");
    StackManager::from_stacks(stacks)
}

/// Write `stack` as `<dir>/<name>.npy`, its sidecar and its mask. The mask
/// suffix must be non-empty, or the mask would replace the data file.
pub fn write_stack(dir: &Path, stack: &Stack, suffix_mask: &str) -> Result<()> {
    if suffix_mask.is_empty() {
        return Err(ReconError::config(format!(
            "an empty mask suffix would overwrite the data of stack '{}'",
            stack.name()
        )));
    }
    fs::create_dir_all(dir)?;
    let volume = stack.volume();
    write_npy(npy_path(dir, stack.name()), volume.data())?;
    write_npy(
        npy_path(dir, &format!("{}{suffix_mask}", stack.name())),
        volume.mask(),
    )?;
    let sidecar = GeometrySidecar::from_geometry(volume.geometry());
    fs::write(json_path(dir, stack.name()), serde_json::to_string_pretty(&sidecar)?)?;
    Ok(())
}

/// Write a volume as `<dir>/<stem>.npy` and `<dir>/<stem>.json`. `details`
/// are stored in the sidecar next to the geometry.
pub fn write_volume(
    dir: &Path,
    stem: &str,
    volume: &Volume,
    details: Option<serde_json::Value>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = npy_path(dir, stem);
    write_npy(&path, volume.data())?;

    let mut sidecar = serde_json::to_value(GeometrySidecar::from_geometry(volume.geometry()))?;
    if let (Some(details), Some(object)) = (details, sidecar.as_object_mut()) {
        object.insert("reconstruction".to_string(), details);
    }
    fs::write(json_path(dir, stem), serde_json::to_string_pretty(&sidecar)?)?;
    Ok(path)
}

/// Read a volume written by [`write_volume`]. The mask covers the whole grid.
pub fn read_volume(dir: &Path, stem: &str) -> Result<Volume> {
    let data = read_array3(&npy_path(dir, stem))?;
    let sidecar: GeometrySidecar = read_sidecar(&json_path(dir, stem))?;
    let geometry = sidecar.to_geometry(data.dim())?;
    Volume::from_data(stem, data, geometry)
}

/// Write `<dir>/comparison/` holding the reconstruction and every stack
/// linearly resampled onto its grid, plus a small viewer script.
pub fn write_comparison(dir: &Path, srr: &Volume, stem: &str, stacks: &[Stack]) -> Result<PathBuf> {
    let comparison = dir.join("comparison");
    fs::create_dir_all(&comparison)?;

    let mut stems = vec![stem.to_string()];
    write_volume(&comparison, stem, srr, None)?;
    for stack in stacks {
        let resampled = stack.resampled_onto(srr.geometry());
        let name = format!("{}_resampled", stack.name());
        write_volume(&comparison, &name, &resampled, None)?;
        stems.push(name);
    }

    let script = comparison_script(&stems);
    let script_path = comparison.join("show_comparison.py");
    fs::write(&script_path, script)?;
    info!(dir = %comparison.display(), volumes = stems.len(), "wrote comparison");
    Ok(script_path)
}

fn comparison_script(stems: &[String]) -> String {
    let list = stems
        .iter()
        .map(|s| format!("    \"{s}\","))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"#!/usr/bin/env python3
# Shows the central slices of the SRR and of the resampled input stacks.
import os
import numpy as np
import matplotlib.pyplot as plt

HERE = os.path.dirname(os.path.abspath(__file__))
NAMES = [
{list}
]

volumes = [np.load(os.path.join(HERE, name + ".npy")) for name in NAMES]
fig, axes = plt.subplots(len(volumes), 3, figsize=(9, 3 * len(volumes)), squeeze=False)
for row, (name, vol) in enumerate(zip(NAMES, volumes)):
    nz, ny, nx = vol.shape
    views = [vol[nz // 2], vol[:, ny // 2, :], vol[:, :, nx // 2]]
    for col, view in enumerate(views):
        axes[row][col].imshow(view, cmap="gray", origin="lower")
        axes[row][col].set_axis_off()
    axes[row][0].set_title(name, loc="left")
plt.tight_layout()
plt.show()
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Rotation3;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("srr_io_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn oblique_stack(name: &str) -> Stack {
        let direction = Rotation3::from_euler_angles(0.1, -0.4, 0.7).into_inner();
        let geometry = Geometry::new(
            (3, 4, 5),
            Vector3::new(-2.0, 1.5, 7.0),
            direction,
            Vector3::new(0.8, 0.8, 3.5),
        )
        .unwrap();
        let data = Array3::from_shape_fn((3, 4, 5), |(k, j, i)| (k * 20 + j * 5 + i) as f64 * 0.5);
        let mut mask = Array3::from_elem((3, 4, 5), true);
        mask[[1, 2, 3]] = false;
        Stack::from_volume(name, data, Some(mask), geometry).unwrap()
    }

    #[test]
    fn sidecar_round_trips_geometry() {
        let stack = oblique_stack("s");
        let sidecar = GeometrySidecar::from_geometry(stack.geometry());
        let geometry = sidecar.to_geometry((3, 4, 5)).unwrap();
        assert!((geometry.direction() - stack.geometry().direction()).amax() < 1e-15);
        assert_eq!(geometry.origin(), stack.geometry().origin());
    }

    #[test]
    fn stack_round_trip_through_directory() {
        let dir = temp_dir("stacks");
        write_stack(&dir, &oblique_stack("b_stack"), "_mask").unwrap();
        write_stack(&dir, &oblique_stack("a_stack"), "_mask").unwrap();

        let manager = load_directory(&dir, "_mask").unwrap();
        let names: Vec<&str> = manager.iter().map(Stack::name).collect();
        assert_eq!(names, vec!["a_stack", "b_stack"]);

        let original = oblique_stack("a_stack");
        let loaded = manager.require("a_stack").unwrap();
        assert_eq!(loaded.volume().data(), original.volume().data());
        assert_eq!(loaded.volume().mask(), original.volume().mask());
        assert!((loaded.geometry().direction() - original.geometry().direction()).amax() < 1e-15);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn empty_mask_suffix_leaves_data_untouched() {
        let dir = temp_dir("no_suffix");
        let stack = oblique_stack("s");
        assert!(matches!(
            write_stack(&dir, &stack, ""),
            Err(ReconError::InvalidConfig(_))
        ));
        assert!(!dir.join("s.npy").exists());

        write_stack(&dir, &stack, "_mask").unwrap();
        let loaded = read_stack(&dir, "s", "").unwrap();
        assert_eq!(loaded.volume().data(), stack.volume().data());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reads_single_precision_arrays_and_numeric_masks() {
        let dir = temp_dir("f32");
        let data = Array3::<f32>::from_elem((2, 3, 3), 1.5);
        write_npy(dir.join("s.npy"), &data).unwrap();
        write_npy(dir.join("s_mask.npy"), &Array3::<f32>::from_elem((2, 3, 3), 1.0)).unwrap();
        let sidecar = GeometrySidecar {
            origin: [0.0; 3],
            direction: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            spacing: [1.0, 1.0, 2.0],
        };
        fs::write(dir.join("s.json"), serde_json::to_string(&sidecar).unwrap()).unwrap();

        let stack = read_stack(&dir, "s", "_mask").unwrap();
        assert!(stack.volume().data().iter().all(|&v| v == 1.5));
        assert_eq!(stack.masked_voxel_count(), 18);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_or_empty_directories_are_errors() {
        assert!(matches!(
            load_directory(Path::new("/nonexistent/srr/input"), "_mask"),
            Err(ReconError::EmptyInput(_))
        ));
        let dir = temp_dir("empty");
        assert!(matches!(
            load_directory(&dir, "_mask"),
            Err(ReconError::EmptyInput(_))
        ));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn volume_sidecar_carries_details() {
        let dir = temp_dir("volume");
        let stack = oblique_stack("s");
        let details = serde_json::json!({"alpha": 0.02});
        write_volume(&dir, "srr", stack.volume(), Some(details)).unwrap();

        let text = fs::read_to_string(dir.join("srr.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["reconstruction"]["alpha"], 0.02);

        let volume = read_volume(&dir, "srr").unwrap();
        assert_eq!(volume.data(), stack.volume().data());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn comparison_bundle_lists_every_volume() {
        let dir = temp_dir("comparison");
        let stack = oblique_stack("s");
        let srr = stack.isotropically_resampled().unwrap();
        let script = write_comparison(&dir, &srr, "SRR_test", &[stack]).unwrap();
        assert!(dir.join("comparison/SRR_test.npy").exists());
        assert!(dir.join("comparison/s_resampled.json").exists());
        let text = fs::read_to_string(script).unwrap();
        assert!(text.contains("\"s_resampled\","));
        fs::remove_dir_all(&dir).ok();
    }
}

use nalgebra::Vector3;
use ndarray::{Array3, ArrayView3, Axis, Zip};

use crate::error::{ReconError, Result};
use crate::geometry::Geometry;
use crate::interpolation::Interpolator;
use crate::slice::Slice;
use crate::volume::Volume;

/// An ordered sequence of slices together with the 3D image and mask they
/// were cut from.
///
/// Slice `k` of the stack is the `k`-th plane along the volume's slice axis,
/// so slice order is acquisition order. Derived stacks (groups, renamed
/// copies) never share state with their source.
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    volume: Volume,
    slices: Vec<Slice>,
}

impl Stack {
    /// Build a stack from a 3D image. Without a mask the whole field of view
    /// is considered valid.
    pub fn from_volume(
        name: impl Into<String>,
        data: Array3<f64>,
        mask: Option<Array3<bool>>,
        geometry: Geometry,
    ) -> Result<Self> {
        let name = name.into();
        let mask = mask.unwrap_or_else(|| Array3::from_elem(data.dim(), true));
        let volume = Volume::new(name.clone(), data, mask, geometry)?;
        let slices = Self::cut_slices(&name, &volume)?;
        Ok(Self {
            name,
            volume,
            slices,
        })
    }

    fn cut_slices(name: &str, volume: &Volume) -> Result<Vec<Slice>> {
        let geometry = volume.geometry();
        let (nz, ny, nx) = geometry.shape();
        (0..nz)
            .map(|k| {
                let origin = geometry.index_to_world(&Vector3::new(0.0, 0.0, k as f64));
                let placement = Geometry::new(
                    (1, ny, nx),
                    origin,
                    *geometry.direction(),
                    *geometry.spacing(),
                )?;
                Slice::new(
                    name,
                    k,
                    volume.data().index_axis(Axis(0), k).to_owned(),
                    Some(volume.mask().index_axis(Axis(0), k).to_owned()),
                    placement,
                )
            })
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Independent copy under a new name.
    pub fn with_name(&self, name: impl Into<String>) -> Result<Stack> {
        let name = name.into();
        let mut volume = self.volume.clone();
        volume.set_name(name.clone());
        let mut slices = Self::cut_slices(&name, &volume)?;
        for (slice, source) in slices.iter_mut().zip(&self.slices) {
            slice.set_transform(*source.transform())?;
        }
        Ok(Stack {
            name,
            volume,
            slices,
        })
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn geometry(&self) -> &Geometry {
        self.volume.geometry()
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    /// Mutable access to the slices; the slice count is fixed.
    pub fn slices_mut(&mut self) -> &mut [Slice] {
        &mut self.slices
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn masked_voxel_count(&self) -> usize {
        self.volume.masked_voxel_count()
    }

    /// Isotropic grid over the stack's field of view whose voxel size is the
    /// in-plane spacing, with the stack linearly resampled onto it.
    pub fn isotropically_resampled(&self) -> Result<Volume> {
        let geometry = self.geometry().isotropic(self.geometry().spacing().x)?;
        Ok(self.volume.resampled_onto(&geometry))
    }

    /// Linear resampling of the stack's 3D image onto `target`.
    pub fn resampled_onto(&self, target: &Geometry) -> Volume {
        self.volume.resampled_onto(target)
    }

    /// Resample the slices at their current (effective) placements onto
    /// `target`. A target voxel takes the bilinear in-plane sample of every
    /// slice whose slab contains it; overlapping slabs are averaged. Voxels
    /// covered by no masked-in slice pixel are zero and outside the mask.
    pub fn resampled_from_slices(&self, target: &Geometry) -> Volume {
        let planes: Vec<(ArrayView3<f64>, &Slice)> = self
            .slices
            .iter()
            .filter(|slice| slice.has_masked_pixels())
            .map(|slice| (slice.data().view().insert_axis(Axis(0)), slice))
            .collect();

        let mut data = Array3::<f64>::zeros(target.shape());
        let mut mask = Array3::from_elem(target.shape(), false);
        Zip::indexed(&mut data)
            .and(&mut mask)
            .par_for_each(|(k, j, i), value, inside| {
                let point = target.index_to_world(&Vector3::new(i as f64, j as f64, k as f64));
                let mut sum = 0.0;
                let mut count = 0usize;
                for (plane, slice) in &planes {
                    let mut idx = slice.geometry().world_to_index(&point);
                    if !slice.geometry().contains_index(&idx) {
                        continue;
                    }
                    let (row, col) = (idx.y.round() as usize, idx.x.round() as usize);
                    if !slice.mask()[[row, col]] {
                        continue;
                    }
                    let (ny, nx) = slice.data().dim();
                    idx.x = idx.x.clamp(0.0, (nx - 1) as f64);
                    idx.y = idx.y.clamp(0.0, (ny - 1) as f64);
                    idx.z = 0.0;
                    sum += Interpolator::sample(plane, &idx);
                    count += 1;
                }
                if count > 0 {
                    *value = sum / count as f64;
                    *inside = true;
                }
            });

        Volume::from_parts(self.name.clone(), target.clone(), data, mask)
    }

    /// Indices `start, start + step, …` of one interleaved acquisition pass.
    pub fn group_indices(&self, start: usize, step: usize) -> Vec<usize> {
        if step == 0 {
            return Vec::new();
        }
        (start..self.slices.len()).step_by(step).collect()
    }

    /// Sub-stack of the slices `start, start + step, …`, re-anchored on the
    /// current placement of its first slice with the slice spacing scaled by
    /// `step`.
    pub fn group(&self, start: usize, step: usize) -> Result<Stack> {
        if step == 0 {
            return Err(ReconError::config("interleave step must be positive"));
        }
        let members: Vec<&Slice> = self
            .group_indices(start, step)
            .into_iter()
            .map(|index| &self.slices[index])
            .collect();
        let anchor = members.first().ok_or_else(|| {
            ReconError::config(format!(
                "group start {start} is beyond the {} slices of stack '{}'",
                self.slices.len(),
                self.name
            ))
        })?;

        let (ny, nx) = anchor.data().dim();
        let mut data = Array3::<f64>::zeros((members.len(), ny, nx));
        let mut mask = Array3::from_elem((members.len(), ny, nx), false);
        for (m, slice) in members.iter().enumerate() {
            data.index_axis_mut(Axis(0), m).assign(slice.data());
            mask.index_axis_mut(Axis(0), m).assign(slice.mask());
        }

        let placement = anchor.geometry();
        let spacing = placement.spacing();
        let geometry = Geometry::new(
            (members.len(), ny, nx),
            *placement.origin(),
            *placement.direction(),
            Vector3::new(spacing.x, spacing.y, spacing.z * step as f64),
        )?;
        Stack::from_volume(
            format!("{}_{}_{}", self.name, start, step),
            data,
            Some(mask),
            geometry,
        )
    }
}

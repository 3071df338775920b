use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use srr_core::io::{load_directory, write_comparison, write_volume};
use srr_core::{
    AlignmentConfig, HierarchicalSliceAlignment, Minimizer, ReconstructionConfig, Regularization,
    TikhonovSolver, VolumeEstimate,
};

/// Volumetric super-resolution reconstruction from stacks of 2D slices.
///
/// Expected input directory layout, per stack `<name>`:
///   - `<name>.npy`: 3D array (nz, ny, nx), f32 or f64
///   - `<name>.json`: geometry sidecar {origin, direction (row-major), spacing}
///   - `<name><suffix-mask>.npy`: optional mask
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory holding the input stacks
    #[arg(long)]
    dir_input: PathBuf,

    /// Directory the reconstruction is written to
    #[arg(long, default_value = "./")]
    dir_output: PathBuf,

    /// Prefix of the output file name
    #[arg(long, default_value = "SRR_")]
    prefix_output: String,

    /// Suffix identifying mask files
    #[arg(long, default_value = "_mask")]
    suffix_mask: String,

    /// Stack defining the reconstruction grid and initial value
    #[arg(long, default_value_t = 0)]
    target_stack_index: usize,

    /// Tikhonov regularization (TK0 or TK1)
    #[arg(long, default_value = "TK1")]
    regularization: Regularization,

    /// Regularization weight
    #[arg(long, default_value_t = 0.02)]
    alpha: f64,

    /// Maximum number of minimizer iterations
    #[arg(long, default_value_t = 10)]
    iter_max: usize,

    /// Least-squares minimizer (lsmr or cgls)
    #[arg(long, default_value = "lsmr")]
    minimizer: Minimizer,

    /// Register interleaved slice groups before reconstructing
    #[arg(long)]
    hierarchical_alignment: bool,

    /// Interleave of the slice groups for the alignment
    #[arg(long, default_value_t = 3)]
    alignment_step: usize,

    /// Volume estimate used as alignment target (sda or average)
    #[arg(long, default_value = "sda")]
    volume_estimate: VolumeEstimate,

    /// Reconstruct the full field of view of the target stack instead of the
    /// bounding box of its mask
    #[arg(long)]
    no_crop_to_mask: bool,

    /// Write the inputs resampled onto the reconstruction grid for comparison
    #[arg(long)]
    provide_comparison: bool,

    /// Debug-level logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
    info!(settings = ?args, "parsed command line");

    let total = Instant::now();

    // --- Validate settings before touching any data ---
    let config = ReconstructionConfig {
        regularization: args.regularization,
        minimizer: args.minimizer,
        iter_max: args.iter_max,
        alpha: args.alpha,
        ..Default::default()
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid reconstruction settings: {}", e))?;
    let alignment_config = AlignmentConfig {
        step: args.alignment_step,
        volume_estimate: args.volume_estimate,
        ..Default::default()
    };
    if args.hierarchical_alignment {
        alignment_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid alignment settings: {}", e))?;
    }

    // --- Load stacks ---
    let loading = Instant::now();
    let mut stacks = load_directory(&args.dir_input, &args.suffix_mask)
        .map_err(|e| anyhow::anyhow!("Failed to read stacks from {:?}: {}", args.dir_input, e))?;
    let target = stacks.get_index(args.target_stack_index).ok_or_else(|| {
        anyhow::anyhow!(
            "Target stack index {} is out of range for {} stacks",
            args.target_stack_index,
            stacks.len()
        )
    })?;
    let target_name = target.name().to_string();
    let mut volume = target
        .isotropically_resampled()
        .map_err(|e| anyhow::anyhow!("Failed to resample target stack '{}': {}", target_name, e))?;
    volume.set_name("SRR");
    let masked = volume.masked_voxel_count();
    if !args.no_crop_to_mask && masked > 0 && masked < volume.geometry().len() {
        let full = volume.dim();
        volume = volume
            .cropped_to_mask()
            .map_err(|e| anyhow::anyhow!("Failed to crop to the target mask: {}", e))?;
        info!(full = ?full, cropped = ?volume.dim(), "reconstruction grid cropped to target mask");
    }
    let time_loading = loading.elapsed();

    // --- Optional slice alignment ---
    let aligning = Instant::now();
    if args.hierarchical_alignment {
        let alignment = HierarchicalSliceAlignment::from_config(&alignment_config)?;
        alignment
            .run(&mut stacks, volume.geometry())
            .map_err(|e| anyhow::anyhow!("Hierarchical slice alignment failed: {}", e))?;
    }
    let time_alignment = aligning.elapsed();

    // --- Reconstruct ---
    let reconstructing = Instant::now();
    let stack_names: Vec<String> = stacks.iter().map(|s| s.name().to_string()).collect();
    let mut solver = TikhonovSolver::new(stacks.into_stacks(), config.clone())?;
    let statistics = solver
        .run_reconstruction(&mut volume)
        .map_err(|e| anyhow::anyhow!("Reconstruction failed: {}", e))?;
    let time_srr = reconstructing.elapsed();

    // --- Write output ---
    let stem = solver.setting_specific_filename(&args.prefix_output);
    let details = serde_json::json!({
        "config": config,
        "statistics": statistics,
        "stacks": stack_names,
        "target_stack": target_name,
        "hierarchical_alignment": args.hierarchical_alignment,
    });
    let path = write_volume(&args.dir_output, &stem, &volume, Some(details))
        .map_err(|e| anyhow::anyhow!("Failed to write output to {:?}: {}", args.dir_output, e))?;
    info!(path = %path.display(), "reconstruction written");

    if args.provide_comparison {
        let script = write_comparison(&args.dir_output, &volume, &stem, solver.stacks())
            .map_err(|e| anyhow::anyhow!("Failed to write comparison: {}", e))?;
        info!(script = %script.display(), "comparison written");
    }

    info!(
        loading_ms = time_loading.as_millis() as u64,
        alignment_ms = time_alignment.as_millis() as u64,
        srr_ms = time_srr.as_millis() as u64,
        total_ms = total.elapsed().as_millis() as u64,
        "summary"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_settings() {
        let args = Args::try_parse_from(["srr_cli", "--dir-input", "data"]).unwrap();
        assert_eq!(args.dir_output, PathBuf::from("./"));
        assert_eq!(args.prefix_output, "SRR_");
        assert_eq!(args.regularization, Regularization::Tk1);
        assert_eq!(args.alpha, 0.02);
        assert_eq!(args.iter_max, 10);
        assert_eq!(args.minimizer, Minimizer::Lsmr);
        assert!(!args.no_crop_to_mask);
        assert!(!args.verbose);
    }

    #[test]
    fn parsed_settings_are_printable() {
        let args = Args::try_parse_from([
            "srr_cli",
            "--dir-input",
            "data",
            "--regularization",
            "tk0",
            "--alpha",
            "0.1",
            "--no-crop-to-mask",
            "--verbose",
        ])
        .unwrap();
        let printed = format!("{args:?}");
        assert!(printed.contains("regularization: Tk0"));
        assert!(printed.contains("alpha: 0.1"));
        assert!(printed.contains("no_crop_to_mask: true"));
    }

    #[test]
    fn rejects_unknown_minimizer() {
        assert!(Args::try_parse_from(["srr_cli", "--dir-input", "d", "--minimizer", "gmres"]).is_err());
    }
}
